use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::rooted_path::RootedPath;
use crate::sbom::Component;

/// Relax or tighten input expectations, mainly around missing checksums.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Strict,
    Permissive,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strict => f.write_str("strict"),
            Self::Permissive => f.write_str("permissive"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Ecosystem {
    Yarn,
    Maven,
    Huggingface,
    Dvc,
    Bundler,
}

impl Ecosystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yarn => "yarn",
            Self::Maven => "maven",
            Self::Huggingface => "huggingface",
            Self::Dvc => "dvc",
            Self::Bundler => "bundler",
        }
    }
}

fn default_package_path() -> PathBuf {
    PathBuf::from(".")
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct YarnPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MavenPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
    /// Lockfile path relative to the package dir, overriding the default name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HuggingfacePackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lockfile: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DvcPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundlerPackageInput {
    #[serde(default = "default_package_path")]
    pub path: PathBuf,
    /// Allow fetching platform-specific (binary) gems.
    #[serde(default)]
    pub allow_binary: bool,
    /// `:all:` or a comma-separated package list for the binary filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_packages: Option<String>,
    /// `:all:` or a comma-separated platform list for the binary filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_platforms: Option<String>,
}

/// One package directory to process, tagged by ecosystem.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PackageInput {
    Yarn(YarnPackageInput),
    Maven(MavenPackageInput),
    Huggingface(HuggingfacePackageInput),
    Dvc(DvcPackageInput),
    Bundler(BundlerPackageInput),
}

impl PackageInput {
    pub fn ecosystem(&self) -> Ecosystem {
        match self {
            Self::Yarn(_) => Ecosystem::Yarn,
            Self::Maven(_) => Ecosystem::Maven,
            Self::Huggingface(_) => Ecosystem::Huggingface,
            Self::Dvc(_) => Ecosystem::Dvc,
            Self::Bundler(_) => Ecosystem::Bundler,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::Yarn(input) => &input.path,
            Self::Maven(input) => &input.path,
            Self::Huggingface(input) => &input.path,
            Self::Dvc(input) => &input.path,
            Self::Bundler(input) => &input.path,
        }
    }
}

/// A single prefetch invocation: where to read, where to write, and which
/// packages to process. Constructed once and never mutated.
#[derive(Clone, Debug)]
pub struct Request {
    pub source_dir: RootedPath,
    pub output_dir: RootedPath,
    pub mode: Mode,
    pub packages: Vec<PackageInput>,
}

impl Request {
    pub fn new(
        source_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        mode: Mode,
        packages: Vec<PackageInput>,
    ) -> Result<Self> {
        let source_dir = RootedPath::new(source_dir)?;
        let output_dir = RootedPath::new(output_dir)?;
        // Surface bad package paths before any resolver runs.
        for package in &packages {
            source_dir.join_within_root(package.path())?;
        }
        Ok(Self {
            source_dir,
            output_dir,
            mode,
            packages,
        })
    }

    pub fn package_dir(&self, package_path: &Path) -> Result<RootedPath> {
        self.source_dir.join_within_root(package_path)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvVarKind {
    #[default]
    Literal,
    /// The value references `${output_dir}` and is resolved against the
    /// concrete output directory at envfile-generation time.
    Path,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub kind: EnvVarKind,
}

impl EnvVar {
    pub fn literal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: EnvVarKind::Literal,
        }
    }

    pub fn path(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            kind: EnvVarKind::Path,
        }
    }
}

/// A source-tree file the caller must rewrite after prefetching. `template`
/// is the exact content to write, with the literal `${output_dir}` token
/// substituted at injection time. The core never mutates the source tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectFile {
    pub abspath: PathBuf,
    pub template: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    pub environment_variables: Vec<EnvVar>,
    pub project_files: Vec<ProjectFile>,
}

/// Everything a resolver (or the whole request) produced.
#[derive(Clone, Debug, Default)]
pub struct RequestOutput {
    pub components: Vec<Component>,
    pub build_config: BuildConfig,
}

impl RequestOutput {
    pub fn new(
        components: Vec<Component>,
        environment_variables: Vec<EnvVar>,
        project_files: Vec<ProjectFile>,
    ) -> Self {
        Self {
            components,
            build_config: BuildConfig {
                environment_variables,
                project_files,
            },
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_package_inputs() {
        let raw = r#"[
            {"type": "yarn", "path": "web"},
            {"type": "maven", "path": ".", "lockfile": "custom-lockfile.json"},
            {"type": "bundler", "allow_binary": true, "binary_platforms": "x86_64-linux"}
        ]"#;
        let packages: Vec<PackageInput> = serde_json::from_str(raw).expect("parse inputs");
        assert_eq!(packages.len(), 3);
        assert_eq!(packages[0].ecosystem(), Ecosystem::Yarn);
        assert_eq!(packages[0].path(), Path::new("web"));
        assert!(matches!(
            &packages[1],
            PackageInput::Maven(input) if input.lockfile.as_deref() == Some(Path::new("custom-lockfile.json"))
        ));
        assert!(matches!(
            &packages[2],
            PackageInput::Bundler(input) if input.allow_binary && input.path == Path::new(".")
        ));
    }

    #[test]
    fn rejects_unknown_package_type() {
        let raw = r#"{"type": "cargo", "path": "."}"#;
        assert!(serde_json::from_str::<PackageInput>(raw).is_err());
    }

    #[test]
    fn rejects_unknown_package_fields() {
        let raw = r#"{"type": "yarn", "path": ".", "bogus": 1}"#;
        assert!(serde_json::from_str::<PackageInput>(raw).is_err());
    }

    #[test]
    fn request_rejects_package_path_escaping_source() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = Request::new(
            temp.path(),
            temp.path().join("output"),
            Mode::Strict,
            vec![PackageInput::Yarn(YarnPackageInput {
                path: PathBuf::from("../elsewhere"),
            })],
        )
        .expect_err("escape must fail");
        assert_eq!(err.kind(), crate::error::ErrorKind::PathOutsideRoot);
    }

    #[test]
    fn mode_defaults_to_strict_and_parses_lowercase() {
        assert_eq!(Mode::default(), Mode::Strict);
        let mode: Mode = serde_json::from_str("\"permissive\"").expect("parse mode");
        assert_eq!(mode, Mode::Permissive);
    }

    #[test]
    fn build_config_round_trips_through_json() {
        let config = BuildConfig {
            environment_variables: vec![
                EnvVar::literal("HF_HUB_OFFLINE", "1"),
                EnvVar::path("GOMODCACHE", "${output_dir}/deps/gomod"),
            ],
            project_files: vec![ProjectFile {
                abspath: PathBuf::from("/src/package.json"),
                template: "{}\n".to_string(),
            }],
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: BuildConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, config);
    }
}

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};
use crate::rooted_path::RootedPath;

pub const DEFAULT_LOCKFILE: &str = "yarn.lock";
const YARNRC_FILE: &str = ".yarnrc.yml";
const PACKAGE_JSON_FILE: &str = "package.json";

/// The yarnrc options the prefetcher consults. The file is never written;
/// install-time configuration travels as `YARN_*` environment variables.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct YarnRc {
    pub yarn_path: Option<String>,
    pub node_linker: Option<String>,
    pub cache_folder: Option<String>,
    pub lockfile_filename: Option<String>,
    pub pnp_data_path: Option<String>,
    pub pnp_unplugged_folder: Option<String>,
    pub install_state_path: Option<String>,
    pub patch_folder: Option<String>,
    pub virtual_folder: Option<String>,
}

impl YarnRc {
    fn from_file(path: &RootedPath) -> Result<Self> {
        let raw = std::fs::read_to_string(path.path()).map_err(|source| {
            Error::invalid_input(format!("failed to read {path}: {source}"))
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yml::from_str(&raw).map_err(|source| {
            Error::package_rejected(format!(
                "can't parse the {} file: {source}",
                path.subpath_from_root().display()
            ))
            .with_solution(
                "The yarnrc file must contain valid YAML. \
                 Refer to the parser error and fix the contents of the file.",
            )
        })
    }

    /// All configured paths that must stay inside the source directory.
    pub fn confined_paths(&self) -> Vec<(&'static str, &str)> {
        [
            ("pnpDataPath", &self.pnp_data_path),
            ("pnpUnpluggedFolder", &self.pnp_unplugged_folder),
            ("installStatePath", &self.install_state_path),
            ("patchFolder", &self.patch_folder),
            ("virtualFolder", &self.virtual_folder),
            ("cacheFolder", &self.cache_folder),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.as_deref().map(|value| (name, value)))
        .collect()
    }
}

/// The parts of package.json the prefetcher reads. The full document is kept
/// so the resolutions rewrite can be emitted as a faithful template.
#[derive(Debug)]
pub struct PackageJson {
    pub data: serde_json::Value,
}

impl PackageJson {
    fn from_file(path: &RootedPath) -> Result<Self> {
        let raw = std::fs::read_to_string(path.path()).map_err(|_| {
            Error::package_rejected(
                "the package.json file must be present for the yarn package manager",
            )
            .with_solution(
                "Please double-check that you have specified the correct path \
                 to the package directory containing this file.",
            )
        })?;
        let data = serde_json::from_str(&raw).map_err(|source| {
            Error::package_rejected(format!(
                "can't parse the {} file: {source}",
                path.subpath_from_root().display()
            ))
            .with_solution(
                "The package.json file must contain valid JSON. \
                 Refer to the parser error and fix the contents of the file.",
            )
        })?;
        Ok(Self { data })
    }

    pub fn package_manager(&self) -> Option<&str> {
        self.data.get("packageManager").and_then(|value| value.as_str())
    }

    /// Clone the document with `resolutions` entries added or replaced.
    pub fn with_resolutions(
        &self,
        resolutions: impl IntoIterator<Item = (String, String)>,
    ) -> serde_json::Value {
        let mut data = self.data.clone();
        if !data.is_object() {
            data = serde_json::json!({});
        }
        let map = data
            .as_object_mut()
            .and_then(|object| {
                if !object.contains_key("resolutions") {
                    object.insert(
                        "resolutions".to_string(),
                        serde_json::Value::Object(Default::default()),
                    );
                }
                object.get_mut("resolutions")
            })
            .and_then(|value| value.as_object_mut());
        if let Some(map) = map {
            for (name, value) in resolutions {
                map.insert(name, serde_json::Value::String(value));
            }
        }
        data
    }
}

/// A directory containing yarn sources.
#[derive(Debug)]
pub struct Project {
    pub source_dir: RootedPath,
    pub yarn_rc: YarnRc,
    pub package_json: PackageJson,
}

impl Project {
    pub fn from_source_dir(source_dir: RootedPath) -> Result<Self> {
        let yarn_rc_path = source_dir.join_within_root(YARNRC_FILE)?;
        let yarn_rc = if yarn_rc_path.path().exists() {
            YarnRc::from_file(&yarn_rc_path)?
        } else {
            YarnRc::default()
        };
        let package_json = PackageJson::from_file(&source_dir.join_within_root(PACKAGE_JSON_FILE)?)?;
        Ok(Self {
            source_dir,
            yarn_rc,
            package_json,
        })
    }

    pub fn lockfile_name(&self) -> &str {
        self.yarn_rc
            .lockfile_filename
            .as_deref()
            .unwrap_or(DEFAULT_LOCKFILE)
    }

    /// Whether the project uses the zero-installs workflow: a populated PnP
    /// cache folder, or an expanded node_modules tree for the other linkers.
    pub fn is_zero_installs(&self) -> Result<bool> {
        match self.yarn_rc.node_linker.as_deref() {
            None | Some("pnp") => {
                let cache_folder = self
                    .yarn_rc
                    .cache_folder
                    .as_deref()
                    .unwrap_or("./.yarn/cache");
                let cache = self.source_dir.join_within_root(cache_folder)?;
                if !cache.path().is_dir() {
                    return Ok(false);
                }
                let entries = std::fs::read_dir(cache.path()).map_err(|source| {
                    Error::invalid_input(format!("failed to list {cache}: {source}"))
                })?;
                for entry in entries.flatten() {
                    if entry.path().extension().is_some_and(|ext| ext == "zip") {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Some("pnpm") | Some("node-modules") => Ok(self
                .source_dir
                .join_within_root("node_modules")?
                .path()
                .exists()),
            Some(other) => {
                warn!(node_linker = other, "unrecognized nodeLinker value");
                Ok(false)
            }
        }
    }
}

/// Parse the yarn version out of a `yarnPath` value like `.yarn/releases/yarn-4.1.0.cjs`.
pub fn semver_from_yarn_path(yarn_path: Option<&str>) -> Option<semver::Version> {
    let yarn_path = yarn_path?;
    let file_name = std::path::Path::new(yarn_path).file_name()?.to_str()?;
    let version = file_name.strip_prefix("yarn-")?.strip_suffix(".cjs")?;
    match semver::Version::parse(version) {
        Ok(version) => Some(version),
        Err(_) => {
            warn!(
                yarn_path,
                "yarnPath does not contain a valid semver, falling back to packageManager"
            );
            None
        }
    }
}

/// Parse the yarn version out of a `packageManager` value like `yarn@4.1.0`.
pub fn semver_from_package_manager(package_manager: Option<&str>) -> Result<Option<semver::Version>> {
    let Some(package_manager) = package_manager else {
        return Ok(None);
    };
    let (name, version) = package_manager.split_once('@').ok_or_else(|| {
        Error::new(
            ErrorKind::UnexpectedFormat,
            "could not parse packageManager spec in package.json (expected name@semver)",
        )
    })?;
    if name != "yarn" {
        return Err(Error::new(
            ErrorKind::UnexpectedFormat,
            "packageManager in package.json must be yarn",
        ));
    }
    // Corepack allows a +sha224 hash suffix after the version.
    let version = version.split_once('+').map_or(version, |(v, _)| v);
    semver::Version::parse(version)
        .map(Some)
        .map_err(|_| {
            Error::new(
                ErrorKind::UnexpectedFormat,
                format!("{version} is not a valid semver for packageManager in package.json"),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project_with(yarnrc: Option<&str>, package_json: &str) -> (tempfile::TempDir, Project) {
        let temp = tempfile::tempdir().expect("tempdir");
        if let Some(yarnrc) = yarnrc {
            std::fs::write(temp.path().join(YARNRC_FILE), yarnrc).expect("write yarnrc");
        }
        std::fs::write(temp.path().join(PACKAGE_JSON_FILE), package_json)
            .expect("write package.json");
        let source_dir = RootedPath::new(temp.path()).expect("rooted");
        let project = Project::from_source_dir(source_dir).expect("project");
        (temp, project)
    }

    #[test]
    fn missing_package_json_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source_dir = RootedPath::new(temp.path()).expect("rooted");
        let err = Project::from_source_dir(source_dir).expect_err("no package.json");
        assert_eq!(err.kind(), ErrorKind::PackageRejected);
        assert!(err.reason().contains("package.json"));
    }

    #[test]
    fn reads_yarnrc_options() {
        let (_temp, project) = project_with(
            Some("yarnPath: .yarn/releases/yarn-4.1.0.cjs\nnodeLinker: node-modules\n"),
            "{}",
        );
        assert_eq!(
            project.yarn_rc.yarn_path.as_deref(),
            Some(".yarn/releases/yarn-4.1.0.cjs")
        );
        assert_eq!(project.yarn_rc.node_linker.as_deref(), Some("node-modules"));
        assert_eq!(project.lockfile_name(), "yarn.lock");
    }

    #[test]
    fn custom_lockfile_name_is_honored() {
        let (_temp, project) = project_with(Some("lockfileFilename: custom.lock\n"), "{}");
        assert_eq!(project.lockfile_name(), "custom.lock");
    }

    #[test]
    fn zero_installs_detected_from_pnp_cache_zips() {
        let (temp, project) = project_with(None, "{}");
        assert!(!project.is_zero_installs().expect("check"));

        let cache = temp.path().join(".yarn/cache");
        std::fs::create_dir_all(&cache).expect("mkdir cache");
        assert!(!project.is_zero_installs().expect("check"));

        std::fs::write(cache.join("lodash-npm-4.17.21.zip"), b"zip").expect("write zip");
        assert!(project.is_zero_installs().expect("check"));
    }

    #[test]
    fn zero_installs_detected_from_node_modules() {
        let (temp, project) = project_with(Some("nodeLinker: node-modules\n"), "{}");
        assert!(!project.is_zero_installs().expect("check"));

        std::fs::create_dir_all(temp.path().join("node_modules")).expect("mkdir");
        assert!(project.is_zero_installs().expect("check"));
    }

    #[test]
    fn with_resolutions_preserves_existing_content() {
        let (_temp, project) = project_with(
            None,
            r#"{"name": "app", "resolutions": {"left-pad": "1.0.0"}}"#,
        );
        let updated = project.package_json.with_resolutions([(
            "c2-wo-deps".to_string(),
            "file:${output_dir}/deps/yarn/host/ns/c2/c2.tgz".to_string(),
        )]);
        assert_eq!(updated["name"], "app");
        assert_eq!(updated["resolutions"]["left-pad"], "1.0.0");
        assert_eq!(
            updated["resolutions"]["c2-wo-deps"],
            "file:${output_dir}/deps/yarn/host/ns/c2/c2.tgz"
        );
    }

    #[test]
    fn parses_yarn_path_version() {
        assert_eq!(
            semver_from_yarn_path(Some(".yarn/releases/yarn-3.6.1.cjs")),
            Some(semver::Version::new(3, 6, 1))
        );
        assert_eq!(semver_from_yarn_path(Some("releases/yarn.cjs")), None);
        assert_eq!(semver_from_yarn_path(None), None);
    }

    #[test]
    fn parses_package_manager_version() {
        assert_eq!(
            semver_from_package_manager(Some("yarn@4.1.0")).expect("parse"),
            Some(semver::Version::new(4, 1, 0))
        );
        assert_eq!(
            semver_from_package_manager(Some("yarn@4.1.0+sha224.abcdef")).expect("parse"),
            Some(semver::Version::new(4, 1, 0))
        );
        assert_eq!(semver_from_package_manager(None).expect("parse"), None);
    }

    #[test]
    fn rejects_non_yarn_package_manager() {
        let err = semver_from_package_manager(Some("pnpm@8.0.0")).expect_err("not yarn");
        assert_eq!(err.kind(), ErrorKind::UnexpectedFormat);

        let err = semver_from_package_manager(Some("yarn")).expect_err("no version");
        assert_eq!(err.kind(), ErrorKind::UnexpectedFormat);
    }
}

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::checksum::{self, ChecksumInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::{self, CommandSpec};
use crate::purl::PackageUrl;
use crate::request::{EnvVar, MavenPackageInput, Request, RequestOutput};
use crate::rooted_path::RootedPath;
use crate::sbom::{Component, Property};

const DEFAULT_LOCKFILE: &str = "lockfile.json";
const DEPS_SUBDIR: &str = "deps/maven";
const DEPENDENCY_PLUGIN: &str = "org.apache.maven.plugins:maven-dependency-plugin:3.9.0:get";

#[derive(Debug, Deserialize)]
struct MavenLockfile {
    #[serde(default)]
    dependencies: Vec<MavenDependency>,
    #[serde(default, rename = "mavenPlugins")]
    maven_plugins: Vec<MavenDependency>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MavenDependency {
    group_id: String,
    artifact_id: String,
    version: String,
    #[serde(default)]
    classifier: Option<String>,
    #[serde(default, rename = "type")]
    artifact_type: Option<String>,
    #[serde(default)]
    checksum: Option<String>,
    #[serde(default)]
    checksum_algorithm: Option<String>,
    #[serde(default)]
    resolved: Option<String>,
    #[serde(default)]
    children: Vec<MavenDependency>,
    // Plugin entries nest their own dependency trees under this key.
    #[serde(default)]
    dependencies: Vec<MavenDependency>,
}

impl MavenDependency {
    fn name(&self) -> String {
        format!("{}:{}", self.group_id, self.artifact_id)
    }

    fn artifact_type(&self) -> &str {
        self.artifact_type.as_deref().unwrap_or("jar")
    }

    /// Some lockfiles append annotations after the hash; only the first
    /// whitespace-separated token is the digest.
    fn checksum_info(&self) -> Result<Option<ChecksumInfo>> {
        let (Some(raw), Some(algorithm)) = (&self.checksum, &self.checksum_algorithm) else {
            return Ok(None);
        };
        let Some(digest) = raw.split_whitespace().next() else {
            return Ok(None);
        };
        Ok(Some(ChecksumInfo::from_parts(algorithm, digest)?))
    }

    fn purl(&self) -> String {
        let mut purl = PackageUrl::new("maven", &self.artifact_id)
            .with_namespace(&self.group_id)
            .with_version(&self.version);
        if let Some(classifier) = &self.classifier {
            purl = purl.with_qualifier("classifier", classifier);
        }
        if self.artifact_type() != "jar" {
            purl = purl.with_qualifier("type", self.artifact_type());
        }
        purl.to_string()
    }

    /// The artifact file name inside the local repository layout. Prefer the
    /// name from the resolved url when it matches the coordinates.
    fn artifact_file_name(&self) -> String {
        let canonical_prefix = format!("{}-{}", self.artifact_id, self.version);
        if let Some(resolved) = &self.resolved
            && let Some(from_url) = resolved.rsplit('/').next()
            && from_url.starts_with(&canonical_prefix)
        {
            return from_url.to_string();
        }
        let extension = self
            .resolved
            .as_deref()
            .and_then(|resolved| Path::new(resolved).extension())
            .and_then(|ext| ext.to_str())
            .unwrap_or("jar");
        match &self.classifier {
            Some(classifier) => format!("{canonical_prefix}-{classifier}.{extension}"),
            None => format!("{canonical_prefix}.{extension}"),
        }
    }

    fn repo_layout_dir(&self) -> std::path::PathBuf {
        let mut dir = std::path::PathBuf::new();
        for part in self.group_id.split('.') {
            dir.push(part);
        }
        dir.push(&self.artifact_id);
        dir.push(&self.version);
        dir
    }
}

pub fn fetch(
    request: &Request,
    packages: &[&MavenPackageInput],
    config: &Config,
) -> Result<RequestOutput> {
    let deps_dir = request.output_dir.join_within_root(DEPS_SUBDIR)?;
    std::fs::create_dir_all(deps_dir.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create {}: {source}",
            deps_dir.path().display()
        ))
    })?;

    let mut components = Vec::new();
    for package in packages {
        let package_dir = request.package_dir(&package.path)?;
        components.extend(resolve_package(package, &package_dir, &deps_dir, config)?);
    }

    Ok(RequestOutput::new(
        components,
        vec![EnvVar::path(
            "MAVEN_OPTS",
            format!("-Dmaven.repo.local=${{output_dir}}/{DEPS_SUBDIR}"),
        )],
        Vec::new(),
    ))
}

fn resolve_package(
    package: &MavenPackageInput,
    package_dir: &RootedPath,
    deps_dir: &RootedPath,
    config: &Config,
) -> Result<Vec<Component>> {
    let lockfile_name = package
        .lockfile
        .clone()
        .unwrap_or_else(|| DEFAULT_LOCKFILE.into());
    let lockfile_path = package_dir.join_within_root(&lockfile_name)?;
    if !lockfile_path.path().exists() {
        return Err(Error::lockfile_not_found(&lockfile_path));
    }

    let lockfile = parse_lockfile(lockfile_path.path())?;
    let dependencies = flatten_dependencies(&lockfile);
    info!(
        lockfile = %lockfile_path,
        dependency_count = dependencies.len(),
        "resolved maven lockfile"
    );

    let mut components = Vec::new();
    for dependency in &dependencies {
        if dependency.resolved.is_some() {
            download_artifact(dependency, package_dir, deps_dir, config)?;
            verify_and_write_checksum(dependency, deps_dir)?;
        }

        let mut component =
            Component::library(dependency.name(), &dependency.version, dependency.purl());
        if dependency.checksum_info()?.is_none() {
            component = component
                .with_property(Property::missing_hash(lockfile_path.subpath_from_root().display().to_string()));
        }
        components.push(component);
    }

    Ok(components)
}

fn parse_lockfile(path: &Path) -> Result<MavenLockfile> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        Error::invalid_input(format!("failed to read {}: {source}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|source| Error::invalid_lockfile(path.display(), source))
}

/// Flatten the dependency and plugin trees into one list, recursing through
/// `children` and plugin `dependencies`, deduplicated by resolved url.
fn flatten_dependencies(lockfile: &MavenLockfile) -> Vec<MavenDependency> {
    fn walk(dependency: &MavenDependency, seen: &mut BTreeMap<String, ()>, out: &mut Vec<MavenDependency>) {
        let key = dependency
            .resolved
            .clone()
            .unwrap_or_else(|| format!("{}:{}", dependency.name(), dependency.version));
        if seen.insert(key, ()).is_none() {
            out.push(dependency.clone());
        }
        for child in dependency.children.iter().chain(&dependency.dependencies) {
            walk(child, seen, out);
        }
    }

    let mut seen = BTreeMap::new();
    let mut out = Vec::new();
    for dependency in lockfile.dependencies.iter().chain(&lockfile.maven_plugins) {
        walk(dependency, &mut seen, &mut out);
    }
    out
}

/// Download one artifact into the local repository layout with
/// `mvn dependency:get`.
fn download_artifact(
    dependency: &MavenDependency,
    package_dir: &RootedPath,
    deps_dir: &RootedPath,
    config: &Config,
) -> Result<()> {
    info!(
        artifact = %dependency.name(),
        version = %dependency.version,
        "downloading maven artifact"
    );

    let repo_local = format!("-Dmaven.repo.local={}", deps_dir.path().display());
    let group = format!("-DgroupId={}", dependency.group_id);
    let artifact = format!("-DartifactId={}", dependency.artifact_id);
    let version = format!("-Dversion={}", dependency.version);

    let mut args: Vec<&str> = vec![
        DEPENDENCY_PLUGIN,
        &group,
        &artifact,
        &version,
        &repo_local,
        "-Dtransitive=false",
    ];
    let classifier = dependency
        .classifier
        .as_ref()
        .map(|classifier| format!("-Dclassifier={classifier}"));
    if let Some(classifier) = &classifier {
        args.push(classifier);
    }
    let packaging = (dependency.artifact_type() != "jar")
        .then(|| format!("-Dpackaging={}", dependency.artifact_type()));
    if let Some(packaging) = &packaging {
        args.push(packaging);
    }

    exec::run_cmd(CommandSpec {
        program: "mvn",
        args: &args,
        cwd: package_dir.path(),
        inherit_env: &["HOME", "JAVA_HOME", "MAVEN_HOME"],
        extra_env: &[],
        timeout: Duration::from_secs(config.subprocess_timeout),
    })?;
    Ok(())
}

/// Verify the downloaded artifact against the lockfile checksum and write
/// the sidecar checksum file next to it.
fn verify_and_write_checksum(dependency: &MavenDependency, deps_dir: &RootedPath) -> Result<()> {
    let Some(info) = dependency.checksum_info()? else {
        return Ok(());
    };

    let artifact_dir = deps_dir.join_within_root(dependency.repo_layout_dir())?;
    let artifact_path = artifact_dir.join_within_root(dependency.artifact_file_name())?;

    if artifact_path.path().exists() {
        checksum::must_match_any(artifact_path.path(), std::slice::from_ref(&info))?;
    } else {
        warn!(
            artifact = %artifact_path,
            "maven artifact not found at the expected repository path, skipping verification"
        );
    }

    let sidecar_name = format!("{}.{}", dependency.artifact_file_name(), info.algorithm);
    let sidecar = artifact_dir.join_within_root(&sidecar_name)?;
    if let Some(parent) = sidecar.path().parent() {
        std::fs::create_dir_all(parent).map_err(|source| {
            Error::invalid_input(format!("failed to create {}: {source}", parent.display()))
        })?;
    }
    std::fs::write(sidecar.path(), &info.hexdigest).map_err(|source| {
        Error::invalid_input(format!("failed to write {}: {source}", sidecar.path().display()))
    })?;
    Ok(())
}

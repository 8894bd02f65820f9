use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::exec::{self, CommandSpec};
use crate::purl::PackageUrl;
use crate::request::{DvcPackageInput, EnvVar, Mode, Request, RequestOutput};
use crate::rooted_path::RootedPath;
use crate::sbom::{Component, ExternalReference, Property};

const DEFAULT_LOCKFILE: &str = "dvc.lock";
const CACHE_SUBDIR: &str = "deps/dvc/cache";

const EXTERNAL_SCHEMES: [&str; 5] = ["http://", "https://", "s3://", "gs://", "azure://"];

#[derive(Debug, Deserialize)]
struct DvcLockfile {
    schema: String,
    #[serde(default)]
    stages: BTreeMap<String, DvcStage>,
}

#[derive(Debug, Deserialize)]
struct DvcStage {
    #[serde(default)]
    deps: Vec<DvcDep>,
}

#[derive(Clone, Debug, Deserialize)]
struct DvcDep {
    path: String,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

impl DvcDep {
    fn is_external_url(&self) -> bool {
        EXTERNAL_SCHEMES
            .iter()
            .any(|scheme| self.path.starts_with(scheme))
    }

    fn checksum_algorithm(&self) -> Option<&str> {
        if self.hash.is_some() {
            return self.hash.as_deref();
        }
        self.md5.as_ref().map(|_| "md5")
    }

    fn checksum_value(&self) -> Option<&str> {
        self.md5.as_deref()
    }
}

pub fn fetch(
    request: &Request,
    packages: &[&DvcPackageInput],
    config: &Config,
) -> Result<RequestOutput> {
    let cache_dir = request.output_dir.join_within_root(CACHE_SUBDIR)?;
    std::fs::create_dir_all(cache_dir.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create {}: {source}",
            cache_dir.path().display()
        ))
    })?;

    let mut components = Vec::new();
    for package in packages {
        let package_dir = request.package_dir(&package.path)?;
        components.extend(resolve_package(request, &package_dir, &cache_dir, config)?);
    }

    Ok(RequestOutput::new(
        components,
        vec![EnvVar::path(
            "DVC_CACHE_DIR",
            format!("${{output_dir}}/{CACHE_SUBDIR}"),
        )],
        Vec::new(),
    ))
}

fn resolve_package(
    request: &Request,
    package_dir: &RootedPath,
    cache_dir: &RootedPath,
    config: &Config,
) -> Result<Vec<Component>> {
    let lockfile_path = package_dir.join_within_root(DEFAULT_LOCKFILE)?;
    if !lockfile_path.path().exists() {
        return Err(Error::lockfile_not_found(&lockfile_path));
    }

    info!(lockfile = %lockfile_path, "reading dvc lockfile");
    let lockfile = parse_lockfile(lockfile_path.path())?;
    let external_deps = external_deps(&lockfile);

    if external_deps.is_empty() {
        info!("no external dependencies found in dvc.lock");
    }

    let lockfile_label = lockfile_path.subpath_from_root().display().to_string();
    validate_checksums(&external_deps, request.mode, &lockfile_label)?;

    run_dvc_fetch(package_dir, cache_dir, config)?;

    Ok(build_components(
        &external_deps,
        request.mode,
        &lockfile_label,
    ))
}

fn parse_lockfile(path: &Path) -> Result<DvcLockfile> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        Error::invalid_input(format!("failed to read {}: {source}", path.display()))
    })?;

    let lockfile: DvcLockfile = serde_yml::from_str(&raw)
        .map_err(|source| Error::invalid_lockfile(path.display(), source))?;

    if !lockfile.schema.starts_with("2.") {
        return Err(Error::invalid_lockfile(
            path.display(),
            format!(
                "unsupported schema version '{}', only 2.x is supported",
                lockfile.schema
            ),
        ));
    }
    Ok(lockfile)
}

fn external_deps(lockfile: &DvcLockfile) -> Vec<(String, DvcDep)> {
    let mut deps = Vec::new();
    for (stage_name, stage) in &lockfile.stages {
        for dep in &stage.deps {
            if dep.is_external_url() {
                deps.push((stage_name.clone(), dep.clone()));
            }
        }
    }
    deps
}

/// External dependencies must carry checksums: fatal in strict mode,
/// downgraded to a warning (plus a component property) in permissive mode.
fn validate_checksums(
    external_deps: &[(String, DvcDep)],
    mode: Mode,
    lockfile_label: &str,
) -> Result<()> {
    let missing: Vec<&(String, DvcDep)> = external_deps
        .iter()
        .filter(|(_, dep)| dep.checksum_value().is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut listing = String::new();
    for (stage_name, dep) in &missing {
        listing.push_str(&format!("\n  - stage '{stage_name}': {}", dep.path));
    }

    match mode {
        Mode::Strict => Err(Error::new(
            ErrorKind::MissingChecksum,
            format!("external dependencies in {lockfile_label} are missing checksums:{listing}"),
        )
        .with_solution(
            "Run DVC commands to populate checksums, or use --mode permissive \
             to allow missing checksums.",
        )),
        Mode::Permissive => {
            warn!(
                lockfile = lockfile_label,
                "external dependencies are missing checksums (permissive mode):{listing}"
            );
            Ok(())
        }
    }
}

fn run_dvc_fetch(package_dir: &RootedPath, cache_dir: &RootedPath, config: &Config) -> Result<()> {
    info!(cache_dir = %cache_dir, "running dvc fetch");
    exec::run_cmd(CommandSpec {
        program: "dvc",
        args: &["fetch"],
        cwd: package_dir.path(),
        inherit_env: &["HOME"],
        extra_env: &[("DVC_CACHE_DIR", cache_dir.path().display().to_string())],
        timeout: Duration::from_secs(config.subprocess_timeout),
    })?;
    info!("dvc fetch completed");
    Ok(())
}

/// One component per HuggingFace repository (grouping all of its files), one
/// generic component per remaining external url.
fn build_components(
    external_deps: &[(String, DvcDep)],
    mode: Mode,
    lockfile_label: &str,
) -> Vec<Component> {
    let mut hf_repos: Vec<(String, String)> = Vec::new();
    let mut generic: Vec<&DvcDep> = Vec::new();

    for (_, dep) in external_deps {
        match parse_huggingface_url(&dep.path) {
            Some((repo, revision, _)) => {
                if !hf_repos.iter().any(|(seen, _)| *seen == repo) {
                    hf_repos.push((repo, revision));
                }
            }
            None => generic.push(dep),
        }
    }

    let mut components = Vec::new();
    for (repo, revision) in hf_repos {
        let (namespace, name) = match repo.split_once('/') {
            Some((namespace, name)) => (Some(namespace.to_string()), name.to_string()),
            None => (None, repo.clone()),
        };
        let mut purl = PackageUrl::new("huggingface", &name).with_version(&revision);
        if let Some(namespace) = &namespace {
            purl = purl.with_namespace(namespace);
        }
        components.push(
            Component::library(&repo, &revision, purl.to_string()).with_external_reference(
                ExternalReference::distribution(format!("https://huggingface.co/{repo}")),
            ),
        );
    }

    for dep in generic {
        let filename = dep
            .path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("unknown")
            .to_string();

        let mut purl = PackageUrl::new("generic", &filename)
            .with_qualifier("download_url", &dep.path);
        if let (Some(algorithm), Some(value)) = (dep.checksum_algorithm(), dep.checksum_value()) {
            purl = purl.with_qualifier("checksum", format!("{algorithm}:{value}"));
        }

        let version = dep
            .checksum_value()
            .map(|value| value.chars().take(8).collect::<String>())
            .unwrap_or_else(|| "unknown".to_string());

        let mut component = Component::library(&filename, &version, purl.to_string())
            .with_external_reference(ExternalReference::distribution(&dep.path));
        if dep.checksum_value().is_none() && mode == Mode::Permissive {
            component = component.with_property(Property::missing_hash(lockfile_label));
        }
        components.push(component);
    }

    components
}

/// Recognize `https://huggingface.co/<repo>/resolve/<40-hex>/<path>` urls.
fn parse_huggingface_url(url: &str) -> Option<(String, String, String)> {
    let rest = url.strip_prefix("https://huggingface.co/")?;
    let (repo, rest) = rest.split_once("/resolve/")?;
    let (revision, file_path) = rest.split_once('/')?;
    let is_commit = revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit());
    if repo.is_empty() || file_path.is_empty() || !is_commit {
        return None;
    }
    if repo.split('/').count() > 2 {
        return None;
    }
    Some((repo.to_string(), revision.to_string(), file_path.to_string()))
}

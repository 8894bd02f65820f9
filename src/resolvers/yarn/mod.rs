mod project;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use semver::Version;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec::{self, CommandSpec};
use crate::purl::PackageUrl;
use crate::request::{EnvVar, ProjectFile, Request, RequestOutput, YarnPackageInput};
use crate::rooted_path::RootedPath;
use crate::sbom::Component;
use crate::scm;

use project::{Project, semver_from_package_manager, semver_from_yarn_path};

const DEPS_SUBDIR: &str = "deps/yarn";

/// A git dependency extracted from yarn.lock.
#[derive(Clone, Debug, PartialEq, Eq)]
struct GitDep {
    name: String,
    clone_url: String,
    reference: String,
}

impl GitDep {
    fn vcs_url(&self) -> String {
        format!("git+{}@{}", self.clone_url, self.reference)
    }
}

/// One resolved entry from yarn.lock.
#[derive(Clone, Debug)]
struct LockfileEntry {
    name: String,
    version: String,
    reference: String,
}

pub fn fetch(
    request: &Request,
    packages: &[&YarnPackageInput],
    config: &Config,
) -> Result<RequestOutput> {
    if !config.allow_yarnberry_processing {
        return Err(Error::package_rejected(
            "yarn berry processing is disabled by configuration",
        )
        .with_solution("Set allow_yarnberry_processing to true to process yarn packages."));
    }

    let mut components = Vec::new();
    let mut project_files = Vec::new();
    for package in packages {
        let source_dir = request.package_dir(&package.path)?;
        let project = Project::from_source_dir(source_dir)?;
        let (pkg_components, pkg_project_files) =
            resolve_project(&project, &request.output_dir, config)?;
        components.extend(pkg_components);
        project_files.extend(pkg_project_files);
    }

    Ok(RequestOutput::new(
        components,
        environment_variables(),
        project_files,
    ))
}

fn resolve_project(
    project: &Project,
    output_dir: &RootedPath,
    config: &Config,
) -> Result<(Vec<Component>, Vec<ProjectFile>)> {
    info!(
        source = %project.source_dir.subpath_from_root().display(),
        "fetching yarn dependencies"
    );

    let version = reconcile_yarn_version(project)?;
    verify_confined_paths(project)?;
    reject_zero_installs(project)?;

    let lockfile_path = project.source_dir.join_within_root(project.lockfile_name())?;
    if !lockfile_path.path().exists() {
        return Err(Error::lockfile_not_found(&lockfile_path));
    }
    let entries = parse_lockfile(lockfile_path.path())?;
    let git_deps = extract_git_deps(&entries)?;

    let mut project_files = Vec::new();
    let mut git_purls: BTreeMap<String, String> = BTreeMap::new();
    if !git_deps.is_empty() {
        let tarballs = clone_git_deps(&git_deps, output_dir)?;
        project_files.push(resolutions_project_file(project, &tarballs)?);
        for dep in &git_deps {
            git_purls.insert(dep.name.clone(), dep.vcs_url());
        }
    }

    verify_corepack_yarn_version(project, &version, config)?;
    run_yarn_install(project, output_dir, &version, config)?;

    let components = build_components(&entries, &git_purls);
    Ok((components, project_files))
}

/// Resolve the yarn version from yarnPath and packageManager, requiring the
/// two to agree, and rejecting anything outside [3.0.0, 5.0.0).
fn reconcile_yarn_version(project: &Project) -> Result<Version> {
    let yarn_path_version = semver_from_yarn_path(project.yarn_rc.yarn_path.as_deref());
    let package_manager_version =
        semver_from_package_manager(project.package_json.package_manager())?;

    let version = yarn_path_version
        .clone()
        .or_else(|| package_manager_version.clone())
        .ok_or_else(|| {
            Error::package_rejected(
                "unable to determine the yarn version to use to process the request",
            )
            .with_solution(
                "Ensure that either yarnPath is defined in .yarnrc.yml or that packageManager \
                 is defined in package.json.",
            )
        })?;

    if version < Version::new(3, 0, 0) || version >= Version::new(5, 0, 0) {
        return Err(Error::package_rejected(format!(
            "unsupported yarn version '{version}' detected"
        ))
        .with_solution("Pick a yarn version in the supported range (3.0.0 <= version < 5.0.0)."));
    }

    if let (Some(from_path), Some(from_manager)) = (&yarn_path_version, &package_manager_version)
        && from_path != from_manager
    {
        return Err(Error::package_rejected(format!(
            "mismatch between the yarn versions specified by yarnPath (yarn@{from_path}) \
             and packageManager (yarn@{from_manager})"
        ))
        .with_solution(
            "Ensure that the versions of yarn specified by yarnPath in .yarnrc.yml and \
             packageManager in package.json agree.",
        ));
    }

    Ok(version)
}

/// Yarnrc options that point at paths must stay inside the source directory.
fn verify_confined_paths(project: &Project) -> Result<()> {
    for (option, value) in project.yarn_rc.confined_paths() {
        if project.source_dir.join_within_root(value).is_err() {
            return Err(Error::package_rejected(format!(
                "yarnrc option '{option}={value}' points outside of the source directory"
            ))
            .with_solution(
                "Make sure that all yarnrc options specifying a path point to a relative \
                 location inside the repository.",
            ));
        }
    }
    Ok(())
}

fn reject_zero_installs(project: &Project) -> Result<()> {
    if project.is_zero_installs()? {
        return Err(Error::package_rejected(
            "yarn zero install detected, PnP zero installs are unsupported",
        )
        .with_solution(
            "Please convert your project to a regular install-based one.\n\
             Depending on the node linker setting, make sure to remove the \
             '.yarn/cache' or 'node_modules' directories respectively.",
        ));
    }
    Ok(())
}

fn parse_lockfile(path: &std::path::Path) -> Result<Vec<LockfileEntry>> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        Error::invalid_input(format!("failed to read {}: {source}", path.display()))
    })?;
    let document: BTreeMap<String, serde_yml::Value> = serde_yml::from_str(&raw)
        .map_err(|source| Error::invalid_lockfile(path.display(), source))?;

    let mut entries = Vec::new();
    for (key, value) in document {
        if key == "__metadata" || !value.is_mapping() {
            continue;
        }
        let resolution = value
            .get("resolution")
            .and_then(|value| value.as_str())
            .map(ToOwned::to_owned);
        let version = value.get("version").map(|value| match value {
            serde_yml::Value::String(version) => version.clone(),
            other => serde_yml::to_string(other)
                .map(|rendered| rendered.trim().to_string())
                .unwrap_or_default(),
        });
        let (Some(resolution), Some(version)) = (resolution, version) else {
            debug!(entry = %key, "skipping lockfile entry without resolution/version");
            continue;
        };

        let Some((name, reference)) = split_locator(&resolution) else {
            return Err(Error::invalid_lockfile(
                path.display(),
                format!("could not parse resolution locator '{resolution}'"),
            ));
        };
        entries.push(LockfileEntry {
            name: name.to_string(),
            version,
            reference: reference.to_string(),
        });
    }
    Ok(entries)
}

/// Split a Berry locator `name@reference`, handling `@scope/name` names.
fn split_locator(locator: &str) -> Option<(&str, &str)> {
    let at = if let Some(rest) = locator.strip_prefix('@') {
        rest.find('@').map(|index| index + 1)?
    } else {
        locator.find('@')?
    };
    let (name, reference) = locator.split_at(at);
    let reference = &reference[1..];
    if name.is_empty() || reference.is_empty() {
        return None;
    }
    Some((name, reference))
}

/// Collect git dependencies: locators whose reference carries a
/// `commit=<sha>` selector. Patched and workspace-bound variants are
/// skipped. A name resolving to two different sources is fatal.
fn extract_git_deps(entries: &[LockfileEntry]) -> Result<Vec<GitDep>> {
    let mut deps: Vec<GitDep> = Vec::new();
    let mut seen: BTreeMap<String, (String, String)> = BTreeMap::new();

    for entry in entries {
        if entry.reference.starts_with("patch:") {
            continue;
        }
        let Some((url_part, fragment)) = entry.reference.split_once('#') else {
            continue;
        };
        let selectors: BTreeMap<&str, &str> = fragment
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let Some(commit) = selectors.get("commit") else {
            continue;
        };
        if selectors.contains_key("workspace") {
            continue;
        }

        let clone_url = url_part.strip_prefix("git+").unwrap_or(url_part).to_string();
        let key = (clone_url.clone(), commit.to_string());
        if let Some(existing) = seen.get(&entry.name) {
            if *existing != key {
                return Err(Error::package_rejected(format!(
                    "multiple git dependencies share the name '{}' but resolve to different \
                     sources; this cannot be expressed in a single yarn resolution",
                    entry.name
                ))
                .with_solution(
                    "Ensure all git dependencies with the same package name point to the same \
                     repository and commit.",
                ));
            }
            continue;
        }
        seen.insert(entry.name.clone(), key);
        deps.push(GitDep {
            name: entry.name.clone(),
            clone_url,
            reference: commit.to_string(),
        });
    }
    Ok(deps)
}

/// Clone each unique git source and pack it as a tarball under
/// `deps/yarn/<host>/<namespace>/<repo>/<repo>-external-gitcommit-<ref>.tgz`.
/// Returns the tarball path relative to the output dir, per dependency name.
fn clone_git_deps(
    git_deps: &[GitDep],
    output_dir: &RootedPath,
) -> Result<BTreeMap<String, PathBuf>> {
    let deps_dir = output_dir.join_within_root(DEPS_SUBDIR)?;
    let mut cloned: BTreeMap<(String, String), PathBuf> = BTreeMap::new();
    let mut tarballs = BTreeMap::new();

    for dep in git_deps {
        let source_key = (dep.clone_url.clone(), dep.reference.clone());
        let relative = match cloned.get(&source_key) {
            Some(relative) => relative.clone(),
            None => {
                let parts = git_url_parts(&dep.clone_url)?;
                let tarball_name =
                    format!("{}-external-gitcommit-{}.tgz", parts.repo, dep.reference);
                let tarball_dir = deps_dir
                    .join_within_root(&parts.host)?
                    .join_within_root(&parts.namespace)?
                    .join_within_root(&parts.repo)?;
                std::fs::create_dir_all(tarball_dir.path()).map_err(|source| {
                    Error::invalid_input(format!(
                        "failed to create {}: {source}",
                        tarball_dir.path().display()
                    ))
                })?;
                let tarball = tarball_dir.join_within_root(&tarball_name)?;

                info!(url = %dep.clone_url, reference = %dep.reference, "packing git dependency");
                scm::clone_as_tarball(&dep.clone_url, &dep.reference, tarball.path())?;

                let relative = tarball
                    .path()
                    .strip_prefix(output_dir.path())
                    .unwrap_or(tarball.path())
                    .to_path_buf();
                cloned.insert(source_key, relative.clone());
                relative
            }
        };
        tarballs.insert(dep.name.clone(), relative);
    }
    Ok(tarballs)
}

struct GitUrlParts {
    host: String,
    namespace: String,
    repo: String,
}

/// Extract host, namespace and repo from a protocol or scp-style clone url.
fn git_url_parts(clone_url: &str) -> Result<GitUrlParts> {
    let (host, path) = if clone_url.contains("://") {
        let parsed = url::Url::parse(clone_url).map_err(|_| bad_clone_url(clone_url))?;
        let host = parsed.host_str().ok_or_else(|| bad_clone_url(clone_url))?.to_string();
        (host, parsed.path().trim_matches('/').to_string())
    } else {
        let rest = clone_url
            .split_once('@')
            .map_or(clone_url, |(_, rest)| rest);
        let (host, path) = rest.split_once(':').ok_or_else(|| bad_clone_url(clone_url))?;
        (host.to_string(), path.trim_matches('/').to_string())
    };

    let path = path.strip_suffix(".git").unwrap_or(&path);
    let (namespace, repo) = path.rsplit_once('/').unwrap_or(("", path));
    if host.is_empty() || repo.is_empty() {
        return Err(bad_clone_url(clone_url));
    }
    Ok(GitUrlParts {
        host,
        namespace: namespace.to_string(),
        repo: repo.to_string(),
    })
}

fn bad_clone_url(clone_url: &str) -> Error {
    Error::package_rejected(format!("cannot parse git url: {clone_url}"))
        .with_solution("Ensure the git dependency in yarn.lock has a valid URL.")
}

/// Emit the package.json rewrite that points each git dependency at its
/// local tarball via `file:${output_dir}/…` resolutions.
fn resolutions_project_file(
    project: &Project,
    tarballs: &BTreeMap<String, PathBuf>,
) -> Result<ProjectFile> {
    let resolutions = tarballs.iter().map(|(name, relative)| {
        (
            name.clone(),
            format!("file:${{output_dir}}/{}", relative.display()),
        )
    });
    let template_data = project.package_json.with_resolutions(resolutions);
    let template = serde_json::to_string_pretty(&template_data)
        .map_err(|source| Error::invalid_input(format!("failed to render package.json: {source}")))?
        + "\n";

    let package_json_path = project.source_dir.join_within_root("package.json")?;
    Ok(ProjectFile {
        abspath: package_json_path.path().to_path_buf(),
        template,
    })
}

/// Check that corepack resolves the same yarn version the project pins.
fn verify_corepack_yarn_version(
    project: &Project,
    expected: &Version,
    config: &Config,
) -> Result<String> {
    let output = exec::run_cmd(CommandSpec {
        program: "yarn",
        args: &["--version"],
        cwd: project.source_dir.path(),
        inherit_env: &["HOME", "COREPACK_HOME"],
        extra_env: &[],
        timeout: Duration::from_secs(config.subprocess_timeout),
    })?;
    let installed = output.trim().to_string();
    if installed != expected.to_string() {
        return Err(Error::package_manager(format!(
            "expected corepack to install yarn@{expected} but found yarn@{installed}"
        )));
    }
    info!(yarn_version = %installed, "processing the request with yarn");
    Ok(installed)
}

/// Run `yarn install --mode skip-build` with all install configuration
/// passed as environment variables, so nothing in the source tree is
/// modified. Immutable installs stay on: the lockfile is authoritative.
fn run_yarn_install(
    project: &Project,
    output_dir: &RootedPath,
    version: &Version,
    config: &Config,
) -> Result<()> {
    let global_folder = output_dir.join_within_root(DEPS_SUBDIR)?;
    let mut extra_env: Vec<(&str, String)> = vec![
        ("YARN_GLOBAL_FOLDER", global_folder.path().display().to_string()),
        ("YARN_ENABLE_GLOBAL_CACHE", "true".to_string()),
        ("YARN_ENABLE_SCRIPTS", "false".to_string()),
        ("YARN_ENABLE_IMMUTABLE_INSTALLS", "true".to_string()),
        ("YARN_CHECKSUM_BEHAVIOR", "throw".to_string()),
        ("YARN_ENABLE_TELEMETRY", "false".to_string()),
        ("YARN_ENABLE_MIRROR", "false".to_string()),
        ("YARN_ENABLE_STRICT_SSL", "true".to_string()),
        ("YARN_PNP_MODE", "strict".to_string()),
        ("YARN_UNSAFE_HTTP_WHITELIST", String::new()),
    ];
    // Constraints run automatically on install in v4, so switch them off.
    if version.major >= 4 {
        extra_env.push(("YARN_ENABLE_CONSTRAINTS_CHECKS", "false".to_string()));
    }
    // With packageManager pinned, corepack picks the version; yarnPath-only
    // projects keep using their checked-in launcher.
    if project.package_json.package_manager().is_some() {
        extra_env.push(("YARN_IGNORE_PATH", "true".to_string()));
    }

    exec::run_cmd(CommandSpec {
        program: "yarn",
        args: &["install", "--mode", "skip-build"],
        cwd: project.source_dir.path(),
        inherit_env: &["HOME", "COREPACK_HOME"],
        extra_env: &extra_env,
        timeout: Duration::from_secs(config.subprocess_timeout),
    })?;
    Ok(())
}

/// One component per lockfile entry, skipping the workspace projects
/// themselves. Git-backed entries carry the `vcs_url` qualifier.
fn build_components(
    entries: &[LockfileEntry],
    git_purls: &BTreeMap<String, String>,
) -> Vec<Component> {
    let mut components = Vec::new();
    for entry in entries {
        if entry.reference.starts_with("workspace:") {
            continue;
        }
        let (namespace, bare_name) = match entry.name.rsplit_once('/') {
            Some((namespace, bare_name)) if entry.name.starts_with('@') => {
                (Some(namespace), bare_name)
            }
            _ => (None, entry.name.as_str()),
        };
        let mut purl = PackageUrl::new("npm", bare_name).with_version(&entry.version);
        if let Some(namespace) = namespace {
            purl = purl.with_namespace(namespace);
        }
        if let Some(vcs_url) = git_purls.get(&entry.name) {
            purl = purl.with_qualifier("vcs_url", vcs_url);
        }
        components.push(Component::library(
            &entry.name,
            &entry.version,
            purl.to_string(),
        ));
    }
    components
}

fn environment_variables() -> Vec<EnvVar> {
    vec![
        EnvVar::literal("YARN_ENABLE_GLOBAL_CACHE", "false"),
        EnvVar::literal("YARN_ENABLE_IMMUTABLE_CACHE", "false"),
        EnvVar::literal("YARN_ENABLE_MIRROR", "true"),
        EnvVar::path("YARN_GLOBAL_FOLDER", "${output_dir}/deps/yarn"),
    ]
}

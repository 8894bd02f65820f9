use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::checksum::{self, Algorithm, ChecksumInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetch::{self, DownloadSpec};
use crate::purl::PackageUrl;
use crate::request::{EnvVar, HuggingfacePackageInput, Request, RequestOutput};
use crate::rooted_path::RootedPath;
use crate::sbom::{Component, ExternalReference};

const DEFAULT_LOCKFILE_NAME: &str = "huggingface.lock.yaml";
const DEPS_SUBDIR: &str = "deps/huggingface/hub";
const DEFAULT_ENDPOINT: &str = "https://huggingface.co";
const LOCKFILE_VERSION: &str = "1.0";

// Pickled or executable payloads are worth flagging, though never blocked.
const UNSAFE_SUFFIXES: [&str; 5] = [".bin", ".pt", ".pkl", ".pickle", ".h5"];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HuggingFaceLockfile {
    metadata: LockfileMetadata,
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LockfileMetadata {
    version: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum RepoType {
    Model,
    Dataset,
}

impl RepoType {
    fn cache_prefix(self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
        }
    }

    fn api_segment(self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
        }
    }
}

fn default_repo_type() -> RepoType {
    RepoType::Model
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelEntry {
    repository: String,
    revision: String,
    #[serde(default = "default_repo_type", rename = "type")]
    repo_type: RepoType,
    #[serde(default)]
    include_patterns: Option<Vec<String>>,
}

impl ModelEntry {
    fn namespace(&self) -> Option<&str> {
        self.repository.split_once('/').map(|(namespace, _)| namespace)
    }

    fn name(&self) -> &str {
        self.repository
            .rsplit_once('/')
            .map_or(&self.repository, |(_, name)| name)
    }

    fn cache_dir_name(&self) -> String {
        let prefix = self.repo_type.cache_prefix();
        match self.namespace() {
            Some(namespace) => format!("{prefix}--{namespace}--{}", self.name()),
            None => format!("{prefix}--{}", self.name()),
        }
    }

    fn to_component(&self, endpoint: &str) -> Component {
        let mut purl = PackageUrl::new("huggingface", self.name())
            .with_version(self.revision.to_ascii_lowercase());
        if let Some(namespace) = self.namespace() {
            purl = purl.with_namespace(namespace);
        }
        let download_url = match self.repo_type {
            RepoType::Model => format!("{endpoint}/{}", self.repository),
            RepoType::Dataset => format!("{endpoint}/datasets/{}", self.repository),
        };
        Component::library(&self.repository, &self.revision, purl.to_string())
            .with_external_reference(ExternalReference::distribution(download_url))
    }
}

/// One file in the Hub's tree listing for a revision.
#[derive(Debug, Deserialize)]
struct TreeEntry {
    #[serde(rename = "type")]
    entry_type: String,
    path: String,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Deserialize)]
struct LfsInfo {
    oid: String,
}

pub fn fetch(
    request: &Request,
    packages: &[&HuggingfacePackageInput],
    config: &Config,
) -> Result<RequestOutput> {
    let endpoint = endpoint();
    let cache_root = request.output_dir.join_within_root(DEPS_SUBDIR)?;
    std::fs::create_dir_all(cache_root.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create {}: {source}",
            cache_root.path().display()
        ))
    })?;

    let mut components = Vec::new();
    for package in packages {
        let package_dir = request.package_dir(&package.path)?;
        let lockfile_path = match &package.lockfile {
            Some(lockfile) => package_dir.join_within_root(lockfile)?,
            None => package_dir.join_within_root(DEFAULT_LOCKFILE_NAME)?,
        };
        if !lockfile_path.path().exists() {
            return Err(Error::lockfile_not_found(&lockfile_path));
        }

        info!(lockfile = %lockfile_path, "reading hugging face lockfile");
        let lockfile = parse_lockfile(lockfile_path.path())?;

        for entry in &lockfile.models {
            info!(
                repository = %entry.repository,
                revision = %entry.revision,
                "fetching hugging face repository"
            );
            fetch_repository(entry, &cache_root, &endpoint, config)?;
            components.push(entry.to_component(&endpoint));
        }
    }

    Ok(RequestOutput::new(
        components,
        environment_variables(),
        Vec::new(),
    ))
}

fn endpoint() -> String {
    std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string())
}

fn parse_lockfile(path: &Path) -> Result<HuggingFaceLockfile> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        Error::invalid_input(format!("failed to read {}: {source}", path.display()))
    })?;
    let lockfile: HuggingFaceLockfile = serde_yml::from_str(&raw)
        .map_err(|source| Error::invalid_lockfile(path.display(), source))?;

    if lockfile.metadata.version != LOCKFILE_VERSION {
        return Err(Error::invalid_lockfile(
            path.display(),
            format!(
                "metadata.version: unsupported version '{}', expected '{LOCKFILE_VERSION}'",
                lockfile.metadata.version
            ),
        ));
    }
    for entry in &lockfile.models {
        validate_entry(entry, path)?;
    }
    Ok(lockfile)
}

fn validate_entry(entry: &ModelEntry, path: &Path) -> Result<()> {
    let revision_ok =
        entry.revision.len() == 40 && entry.revision.chars().all(|c| c.is_ascii_hexdigit());
    if !revision_ok {
        return Err(Error::invalid_lockfile(
            path.display(),
            format!(
                "models.revision: '{}' must be a 40-character git commit hash",
                entry.revision
            ),
        ));
    }

    let repository = &entry.repository;
    if repository.is_empty() || repository.trim() != repository {
        return Err(Error::invalid_lockfile(
            path.display(),
            "models.repository: must not be empty or contain surrounding whitespace",
        ));
    }
    if repository.split('/').count() > 2 || repository.split('/').any(str::is_empty) {
        return Err(Error::invalid_lockfile(
            path.display(),
            format!(
                "models.repository: '{repository}' must be 'name' or 'namespace/name'"
            ),
        ));
    }
    Ok(())
}

/// Download one repository snapshot into the Hub-native cache layout:
/// `blobs/<sha256>` holds content, `snapshots/<rev>/<path>` symlinks into
/// blobs, and `refs/main` records the revision.
fn fetch_repository(
    entry: &ModelEntry,
    cache_root: &RootedPath,
    endpoint: &str,
    config: &Config,
) -> Result<()> {
    let files = list_files(entry, endpoint, config)?;
    let selected: Vec<&String> = files
        .iter()
        .filter(|file| file.entry_type == "file")
        .filter(|file| should_include(&file.path, entry.include_patterns.as_deref()))
        .map(|file| &file.path)
        .collect();

    if selected.is_empty() {
        warn!(
            repository = %entry.repository,
            patterns = ?entry.include_patterns,
            "no files matched the include patterns"
        );
    }

    for path in &selected {
        if is_unsafe_file(path) {
            warn!(
                repository = %entry.repository,
                file = %path,
                "fetching a file type that can carry executable code"
            );
        }
    }

    let repo_dir = cache_root.join_within_root(entry.cache_dir_name())?;
    let incoming_dir = repo_dir.join_within_root(".incoming")?;
    std::fs::create_dir_all(incoming_dir.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create {}: {source}",
            incoming_dir.path().display()
        ))
    })?;

    // Stage all files through the fetcher, then move each into blobs/ under
    // its content hash and link the snapshot path at the right depth.
    let mut downloads = Vec::new();
    let mut staged: Vec<(RootedPath, &TreeEntry)> = Vec::new();
    for (index, file) in files
        .iter()
        .filter(|file| file.entry_type == "file")
        .filter(|file| should_include(&file.path, entry.include_patterns.as_deref()))
        .enumerate()
    {
        let destination = incoming_dir.join_within_root(format!("file-{index}"))?;
        let url = resolve_url(entry, endpoint, &file.path);
        let mut spec = DownloadSpec::new(url, destination.clone());
        if let Some(lfs) = &file.lfs {
            spec = spec.with_checksums(vec![ChecksumInfo::new(Algorithm::Sha256, &lfs.oid)?]);
        }
        downloads.push(spec);
        staged.push((destination, file));
    }

    debug!(
        repository = %entry.repository,
        file_count = staged.len(),
        "downloading hugging face files"
    );
    fetch::download_files(downloads, config)?;

    for (staged_path, file) in &staged {
        add_to_cache(&repo_dir, &entry.revision, &file.path, staged_path.path())?;
    }

    std::fs::remove_dir_all(incoming_dir.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to clean up {}: {source}",
            incoming_dir.path().display()
        ))
    })?;

    write_ref(&repo_dir, "main", &entry.revision)?;
    Ok(())
}

fn list_files(entry: &ModelEntry, endpoint: &str, config: &Config) -> Result<Vec<TreeEntry>> {
    let url = format!(
        "{endpoint}/api/{}/{}/tree/{}?recursive=true",
        entry.repo_type.api_segment(),
        entry.repository,
        entry.revision
    );
    let body = fetch::get_text(&url, config)?;
    serde_json::from_str(&body).map_err(|source| {
        Error::fetch(format!(
            "unexpected file listing for '{}' at {}: {source}",
            entry.repository, url
        ))
    })
}

fn resolve_url(entry: &ModelEntry, endpoint: &str, file_path: &str) -> String {
    match entry.repo_type {
        RepoType::Model => format!(
            "{endpoint}/{}/resolve/{}/{file_path}",
            entry.repository, entry.revision
        ),
        RepoType::Dataset => format!(
            "{endpoint}/datasets/{}/resolve/{}/{file_path}",
            entry.repository, entry.revision
        ),
    }
}

fn should_include(file_path: &str, patterns: Option<&[String]>) -> bool {
    let Some(patterns) = patterns else {
        return true;
    };
    patterns.iter().any(|pattern| {
        if glob_matches(pattern, file_path) {
            return true;
        }
        // "**/*.json" should also match "config.json" at the root.
        pattern
            .strip_prefix("**/")
            .is_some_and(|simple| glob_matches(simple, file_path))
    })
}

fn glob_matches(pattern: &str, file_path: &str) -> bool {
    glob::Pattern::new(pattern)
        .map(|pattern| pattern.matches(file_path))
        .unwrap_or(false)
}

fn is_unsafe_file(file_path: &str) -> bool {
    if UNSAFE_SUFFIXES
        .iter()
        .any(|suffix| file_path.ends_with(suffix))
    {
        return true;
    }
    let basename = file_path.rsplit('/').next().unwrap_or(file_path);
    basename.starts_with("modeling_") && basename.ends_with(".py")
}

/// Move a staged download into `blobs/` under its sha256 and create the
/// snapshot symlink. The link target depth depends on how deeply the file is
/// nested inside the snapshot.
fn add_to_cache(
    repo_dir: &RootedPath,
    revision: &str,
    file_path: &str,
    staged: &Path,
) -> Result<()> {
    let blob_hash = checksum::compute(staged, Algorithm::Sha256)?.hexdigest;

    let blobs_dir = repo_dir.join_within_root("blobs")?;
    std::fs::create_dir_all(blobs_dir.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create {}: {source}",
            blobs_dir.path().display()
        ))
    })?;
    let blob_path = blobs_dir.join_within_root(&blob_hash)?;
    if !blob_path.path().exists() {
        std::fs::rename(staged, blob_path.path()).map_err(|source| {
            Error::invalid_input(format!(
                "failed to move blob into {}: {source}",
                blob_path.path().display()
            ))
        })?;
        debug!(blob = %blob_path, "created blob");
    }

    let snapshot_file = repo_dir
        .join_within_root("snapshots")?
        .join_within_root(revision)?
        .join_within_root(file_path)?;
    if let Some(parent) = snapshot_file.path().parent() {
        std::fs::create_dir_all(parent).map_err(|source| {
            Error::invalid_input(format!("failed to create {}: {source}", parent.display()))
        })?;
    }
    if snapshot_file.path().exists() || std::fs::symlink_metadata(snapshot_file.path()).is_ok() {
        let _ = std::fs::remove_file(snapshot_file.path());
    }

    let depth = Path::new(file_path).components().count() - 1;
    let mut target = PathBuf::new();
    for _ in 0..(2 + depth) {
        target.push("..");
    }
    target.push("blobs");
    target.push(&blob_hash);

    make_symlink(&target, snapshot_file.path())?;
    debug!(link = %snapshot_file, target = %target.display(), "created snapshot link");
    Ok(())
}

fn write_ref(repo_dir: &RootedPath, ref_name: &str, revision: &str) -> Result<()> {
    let refs_dir = repo_dir.join_within_root("refs")?;
    std::fs::create_dir_all(refs_dir.path()).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create {}: {source}",
            refs_dir.path().display()
        ))
    })?;
    let ref_file = refs_dir.join_within_root(ref_name)?;
    std::fs::write(ref_file.path(), revision).map_err(|source| {
        Error::invalid_input(format!(
            "failed to write {}: {source}",
            ref_file.path().display()
        ))
    })
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create symlink {}: {source}",
            link.display()
        ))
    })
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::windows::fs::symlink_file(target, link).map_err(|source| {
        Error::invalid_input(format!(
            "failed to create symlink {}: {source}",
            link.display()
        ))
    })
}

fn environment_variables() -> Vec<EnvVar> {
    vec![
        EnvVar::path("HF_HOME", "${output_dir}/deps/huggingface"),
        EnvVar::path("HF_HUB_CACHE", "${output_dir}/deps/huggingface/hub"),
        EnvVar::literal("HF_HUB_OFFLINE", "1"),
        EnvVar::path("HUGGINGFACE_HUB_CACHE", "${output_dir}/deps/huggingface/hub"),
    ]
}

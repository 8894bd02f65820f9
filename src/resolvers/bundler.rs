use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use crate::checksum::ChecksumInfo;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::fetch::{self, DownloadSpec};
use crate::purl::PackageUrl;
use crate::request::{BundlerPackageInput, EnvVar, Request, RequestOutput};
use crate::rooted_path::RootedPath;
use crate::sbom::{Component, Property};
use crate::scm;

const GEMFILE: &str = "Gemfile";
const GEMFILE_LOCK: &str = "Gemfile.lock";
const DEPS_SUBDIR: &str = "deps/bundler";

/// A gem fetched from a rubygems source, for the plain `ruby` platform.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GemDependency {
    pub name: String,
    pub version: String,
    pub source: String,
}

/// A platform-specific (binary) gem.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinaryGemDependency {
    pub name: String,
    pub version: String,
    pub source: String,
    pub platform: String,
}

/// A gem pinned to a git repository at an exact revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitGemDependency {
    pub name: String,
    pub version: String,
    pub url: String,
    pub branch: Option<String>,
    pub revision: String,
}

impl GitGemDependency {
    fn repo_name(&self) -> &str {
        self.url
            .trim_end_matches(".git")
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.name)
    }

    fn checkout_dir_name(&self) -> String {
        let short_ref: String = self.revision.chars().take(12).collect();
        format!("{}-{short_ref}", self.repo_name())
    }
}

/// A gem vendored inside the package directory itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathGemDependency {
    pub name: String,
    pub version: String,
    pub subpath: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundlerDependency {
    Gem(GemDependency),
    BinaryGem(BinaryGemDependency),
    GitGem(GitGemDependency),
    PathGem(PathGemDependency),
}

/// The allow filter for binary gems: `None` means "all".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GemsFilter {
    pub packages: Option<BTreeSet<String>>,
    pub platforms: Option<BTreeSet<String>>,
}

impl GemsFilter {
    pub fn from_specs(packages: Option<&str>, platforms: Option<&str>) -> Self {
        Self {
            packages: parse_filter_spec(packages),
            platforms: parse_filter_spec(platforms),
        }
    }

    /// The four-way platform selection rule:
    /// - all packages, all platforms: prefer binary over `ruby` where available
    /// - all packages, given platforms: force the given platforms everywhere
    /// - given packages, all platforms: prefer binary for those, `ruby` for the rest
    /// - given packages, given platforms: force platforms for those, `ruby` for the rest
    fn select_platforms(&self, name: &str, platforms: &BTreeSet<String>) -> BTreeSet<String> {
        let ruby_only = || BTreeSet::from(["ruby".to_string()]);
        match (&self.packages, &self.platforms) {
            (None, None) => prefer_binary(platforms),
            (None, Some(selected)) => selected.clone(),
            (Some(packages), None) => {
                if packages.contains(name) {
                    prefer_binary(platforms)
                } else {
                    ruby_only()
                }
            }
            (Some(packages), Some(selected)) => {
                if packages.contains(name) {
                    selected.clone()
                } else {
                    ruby_only()
                }
            }
        }
    }
}

fn parse_filter_spec(spec: Option<&str>) -> Option<BTreeSet<String>> {
    let spec = spec?;
    let values: BTreeSet<String> = spec
        .split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    if values.contains(":all:") {
        return None;
    }
    Some(values)
}

fn prefer_binary(platforms: &BTreeSet<String>) -> BTreeSet<String> {
    if platforms.len() > 1 && platforms.contains("ruby") {
        platforms
            .iter()
            .filter(|platform| *platform != "ruby")
            .cloned()
            .collect()
    } else {
        platforms.clone()
    }
}

pub fn fetch(
    request: &Request,
    packages: &[&BundlerPackageInput],
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
        vec![
            EnvVar::path("BUNDLE_CACHE_PATH", format!("${{output_dir}}/{DEPS_SUBDIR}")),
            EnvVar::literal("BUNDLE_DEPLOYMENT", "true"),
        ],
        Vec::new(),
    ))
}

fn resolve_package(
    package: &BundlerPackageInput,
    package_dir: &RootedPath,
    deps_dir: &RootedPath,
    config: &Config,
) -> Result<Vec<Component>> {
    let gemfile = package_dir.join_within_root(GEMFILE)?;
    let lockfile = package_dir.join_within_root(GEMFILE_LOCK)?;
    if !gemfile.path().exists() || !lockfile.path().exists() {
        return Err(Error::package_rejected(
            "Gemfile and Gemfile.lock must be present in the package directory",
        )
        .with_solution(
            "Run `bundle init` to generate the Gemfile.\n\
             Run `bundle lock` to generate the Gemfile.lock.",
        ));
    }

    let raw = std::fs::read_to_string(lockfile.path()).map_err(|source| {
        Error::invalid_input(format!("failed to read {lockfile}: {source}"))
    })?;
    let parsed = parse_gemfile_lock(&raw).map_err(|detail| {
        Error::invalid_lockfile(&lockfile, detail)
    })?;

    if let Some(bundler_version) = &parsed.bundler_version {
        info!(
            package = %package_dir.subpath_from_root().display(),
            bundler_version = %bundler_version,
            "parsed Gemfile.lock"
        );
    }

    let filter = package
        .allow_binary
        .then(|| {
            GemsFilter::from_specs(
                package.binary_packages.as_deref(),
                package.binary_platforms.as_deref(),
            )
        });
    let dependencies = plan_dependencies(&parsed, filter.as_ref(), package_dir)?;

    download_dependencies(&dependencies, &parsed.checksums, deps_dir, config)?;

    let lockfile_label = lockfile.subpath_from_root().display().to_string();
    dependencies
        .iter()
        .map(|dependency| build_component(dependency, &parsed.checksums, package_dir, &lockfile_label))
        .collect()
}

/// Turn parsed lockfile sections into concrete dependencies, applying the
/// binary gem policy.
fn plan_dependencies(
    parsed: &GemfileLock,
    filter: Option<&GemsFilter>,
    package_dir: &RootedPath,
) -> Result<Vec<BundlerDependency>> {
    let mut dependencies = Vec::new();

    for section in &parsed.gem_sections {
        // Aggregate the platform variants of each (name, version).
        let mut platforms: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();
        for spec in &section.specs {
            platforms
                .entry((spec.name.clone(), spec.version.clone()))
                .or_default()
                .insert(spec.platform.clone().unwrap_or_else(|| "ruby".to_string()));
        }

        for ((name, version), gem_platforms) in platforms {
            let selected = match filter {
                Some(filter) => filter.select_platforms(&name, &gem_platforms),
                None => gem_platforms.clone(),
            };
            for platform in selected {
                if platform == "ruby" {
                    dependencies.push(BundlerDependency::Gem(GemDependency {
                        name: name.clone(),
                        version: version.clone(),
                        source: section.remote.clone(),
                    }));
                    continue;
                }
                let full_name = format!("{name}-{version}-{platform}");
                info!(gem = %full_name, "found a binary dependency");
                if filter.is_some() {
                    warn!(
                        gem = %full_name,
                        "will download binary dependency because allow_binary is set"
                    );
                    dependencies.push(BundlerDependency::BinaryGem(BinaryGemDependency {
                        name: name.clone(),
                        version: version.clone(),
                        source: section.remote.clone(),
                        platform,
                    }));
                } else {
                    warn!(
                        gem = %full_name,
                        "skipping binary dependency because allow_binary is not set; \
                         this will likely result in an unbuildable package"
                    );
                }
            }
        }
    }

    for section in &parsed.git_sections {
        validate_git_section(section)?;
        for spec in &section.specs {
            dependencies.push(BundlerDependency::GitGem(GitGemDependency {
                name: spec.name.clone(),
                version: spec.version.clone(),
                url: section.remote.clone(),
                branch: section.branch.clone(),
                revision: section.revision.clone().unwrap_or_default(),
            }));
        }
    }

    for section in &parsed.path_sections {
        // The subpath must stay inside the package directory.
        package_dir.join_within_root(&section.remote)?;
        for spec in &section.specs {
            dependencies.push(BundlerDependency::PathGem(PathGemDependency {
                name: spec.name.clone(),
                version: spec.version.clone(),
                subpath: section.remote.clone(),
            }));
        }
    }

    Ok(dependencies)
}

fn validate_git_section(section: &GitSection) -> Result<()> {
    if !section.remote.starts_with("https://") {
        return Err(Error::new(
            ErrorKind::UnexpectedFormat,
            format!(
                "git gem remote '{}' must use the https scheme",
                section.remote
            ),
        ));
    }
    let revision_ok = section
        .revision
        .as_deref()
        .is_some_and(|rev| rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit()));
    if !revision_ok {
        return Err(Error::new(
            ErrorKind::UnexpectedFormat,
            format!(
                "git gem remote '{}' must pin a 40-character commit revision",
                section.remote
            ),
        ));
    }
    Ok(())
}

fn download_dependencies(
    dependencies: &[BundlerDependency],
    checksums: &BTreeMap<String, ChecksumInfo>,
    deps_dir: &RootedPath,
    config: &Config,
) -> Result<()> {
    let mut downloads = Vec::new();
    for dependency in dependencies {
        match dependency {
            BundlerDependency::Gem(gem) => {
                info!(gem = %gem.name, version = %gem.version, "downloading gem");
                let file_name = format!("{}-{}.gem", gem.name, gem.version);
                downloads.push(gem_download_spec(
                    &gem.source,
                    &file_name,
                    checksums,
                    deps_dir,
                )?);
            }
            BundlerDependency::BinaryGem(gem) => {
                info!(
                    gem = %gem.name,
                    version = %gem.version,
                    platform = %gem.platform,
                    "downloading platform-specific gem"
                );
                let file_name = format!("{}-{}-{}.gem", gem.name, gem.version, gem.platform);
                downloads.push(gem_download_spec(
                    &gem.source,
                    &file_name,
                    checksums,
                    deps_dir,
                )?);
            }
            BundlerDependency::GitGem(gem) => {
                let checkout = deps_dir.join_within_root(gem.checkout_dir_name())?;
                if checkout.path().exists() {
                    info!(url = %gem.url, "skipping existing git gem checkout");
                } else {
                    info!(
                        url = %gem.url,
                        revision = %gem.revision,
                        branch = gem.branch.as_deref().unwrap_or_default(),
                        "cloning git gem"
                    );
                    scm::clone_git_dependency(&gem.url, &gem.revision, checkout.path())?;
                }
            }
            BundlerDependency::PathGem(_) => {}
        }
    }
    fetch::download_files(downloads, config)
}

fn gem_download_spec(
    source: &str,
    file_name: &str,
    checksums: &BTreeMap<String, ChecksumInfo>,
    deps_dir: &RootedPath,
) -> Result<DownloadSpec> {
    let base = source.trim_end_matches('/');
    let url = format!("{base}/downloads/{file_name}");
    let destination = deps_dir.join_within_root(file_name)?;
    let mut spec = DownloadSpec::new(url, destination);
    if let Some(info) = checksums.get(file_name.trim_end_matches(".gem")) {
        spec = spec.with_checksums(vec![info.clone()]);
    }
    Ok(spec)
}

fn build_component(
    dependency: &BundlerDependency,
    checksums: &BTreeMap<String, ChecksumInfo>,
    package_dir: &RootedPath,
    lockfile_label: &str,
) -> Result<Component> {
    match dependency {
        BundlerDependency::Gem(gem) => {
            let purl = PackageUrl::new("gem", &gem.name)
                .with_version(&gem.version)
                .to_string();
            let mut component = Component::library(&gem.name, &gem.version, purl);
            if !checksums.contains_key(&format!("{}-{}", gem.name, gem.version)) {
                component = component.with_property(Property::missing_hash(lockfile_label));
            }
            Ok(component)
        }
        BundlerDependency::BinaryGem(gem) => {
            let purl = PackageUrl::new("gem", &gem.name)
                .with_version(&gem.version)
                .with_qualifier("platform", &gem.platform)
                .to_string();
            let key = format!("{}-{}-{}", gem.name, gem.version, gem.platform);
            let mut component = Component::library(&gem.name, &gem.version, purl);
            if !checksums.contains_key(&key) {
                component = component.with_property(Property::missing_hash(lockfile_label));
            }
            Ok(component)
        }
        BundlerDependency::GitGem(gem) => {
            let vcs_url = format!("git+{}@{}", gem.url, gem.revision);
            let purl = PackageUrl::new("gem", &gem.name)
                .with_version(&gem.version)
                .with_qualifier("vcs_url", vcs_url)
                .to_string();
            Ok(Component::library(&gem.name, &gem.version, purl))
        }
        BundlerDependency::PathGem(gem) => {
            // Attribute the gem to the innermost repository containing it,
            // which matters when the gem lives in a submodule.
            let (workdir, _) = scm::get_repo_for_path(
                package_dir.path(),
                std::path::Path::new(&gem.subpath),
            )?;
            let repo_id = scm::get_repo_id(&workdir)?;
            let purl = PackageUrl::new("gem", &gem.name)
                .with_version(&gem.version)
                .with_qualifier("vcs_url", repo_id.as_vcs_url_qualifier())
                .with_subpath(&gem.subpath)
                .to_string();
            Ok(Component::library(&gem.name, &gem.version, purl))
        }
    }
}

// ---------------------------------------------------------------------------
// Gemfile.lock parsing

#[derive(Debug, Default, PartialEq, Eq)]
struct GemfileLock {
    bundler_version: Option<String>,
    gem_sections: Vec<GemSection>,
    git_sections: Vec<GitSection>,
    path_sections: Vec<PathSection>,
    /// CHECKSUMS entries keyed by `name-version[-platform]`.
    checksums: BTreeMap<String, ChecksumInfo>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct GemSection {
    remote: String,
    specs: Vec<GemSpec>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct GitSection {
    remote: String,
    revision: Option<String>,
    branch: Option<String>,
    specs: Vec<GemSpec>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct PathSection {
    remote: String,
    specs: Vec<GemSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct GemSpec {
    name: String,
    version: String,
    platform: Option<String>,
}

enum Section {
    Gem(GemSection),
    Git(GitSection),
    Path(PathSection),
    Platforms,
    Dependencies,
    Checksums,
    BundledWith,
    Other,
}

fn parse_gemfile_lock(raw: &str) -> std::result::Result<GemfileLock, String> {
    let mut lock = GemfileLock::default();
    let mut section = Section::Other;
    let mut in_specs = false;
    let mut expect_bundler_version = false;

    for (line_number, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();

        if indent == 0 {
            finish_section(&mut lock, std::mem::replace(&mut section, Section::Other));
            in_specs = false;
            expect_bundler_version = false;
            section = match trimmed {
                "GEM" => Section::Gem(GemSection::default()),
                "GIT" => Section::Git(GitSection::default()),
                "PATH" => Section::Path(PathSection::default()),
                "PLATFORMS" => Section::Platforms,
                "DEPENDENCIES" => Section::Dependencies,
                "CHECKSUMS" => Section::Checksums,
                "BUNDLED WITH" => {
                    expect_bundler_version = true;
                    Section::BundledWith
                }
                _ => Section::Other,
            };
            continue;
        }

        if expect_bundler_version {
            lock.bundler_version = Some(trimmed.to_string());
            expect_bundler_version = false;
            continue;
        }

        match &mut section {
            Section::Gem(gem_section) => {
                if indent == 2 {
                    if let Some(remote) = trimmed.strip_prefix("remote: ") {
                        gem_section.remote = remote.to_string();
                    } else if trimmed == "specs:" {
                        in_specs = true;
                    }
                } else if indent == 4 && in_specs {
                    let spec = parse_spec_line(trimmed)
                        .ok_or_else(|| format!("line {}: malformed gem spec '{trimmed}'", line_number + 1))?;
                    gem_section.specs.push(spec);
                }
                // deeper indentation lists transitive requirements, which the
                // flat spec entries already cover
            }
            Section::Git(git_section) => {
                if indent == 2 {
                    if let Some(remote) = trimmed.strip_prefix("remote: ") {
                        git_section.remote = remote.to_string();
                    } else if let Some(revision) = trimmed.strip_prefix("revision: ") {
                        git_section.revision = Some(revision.to_string());
                    } else if let Some(branch) = trimmed.strip_prefix("branch: ") {
                        git_section.branch = Some(branch.to_string());
                    } else if trimmed == "specs:" {
                        in_specs = true;
                    }
                } else if indent == 4 && in_specs {
                    let spec = parse_spec_line(trimmed)
                        .ok_or_else(|| format!("line {}: malformed gem spec '{trimmed}'", line_number + 1))?;
                    git_section.specs.push(spec);
                }
            }
            Section::Path(path_section) => {
                if indent == 2 {
                    if let Some(remote) = trimmed.strip_prefix("remote: ") {
                        path_section.remote = remote.to_string();
                    } else if trimmed == "specs:" {
                        in_specs = true;
                    }
                } else if indent == 4 && in_specs {
                    let spec = parse_spec_line(trimmed)
                        .ok_or_else(|| format!("line {}: malformed gem spec '{trimmed}'", line_number + 1))?;
                    path_section.specs.push(spec);
                }
            }
            Section::Checksums => {
                if let Some((key, info)) = parse_checksum_line(trimmed) {
                    lock.checksums.insert(key, info);
                }
            }
            Section::Platforms | Section::Dependencies | Section::BundledWith | Section::Other => {}
        }
    }
    finish_section(&mut lock, section);

    Ok(lock)
}

fn finish_section(lock: &mut GemfileLock, section: Section) {
    match section {
        Section::Gem(gem_section) => lock.gem_sections.push(gem_section),
        Section::Git(git_section) => lock.git_sections.push(git_section),
        Section::Path(path_section) => lock.path_sections.push(path_section),
        _ => {}
    }
}

/// Parse `name (version)` where the parenthesized value may carry a platform
/// suffix after the first dash, e.g. `nokogiri (1.15.4-x86_64-linux)`.
fn parse_spec_line(line: &str) -> Option<GemSpec> {
    let (name, rest) = line.split_once(" (")?;
    let value = rest.strip_suffix(')')?;
    if name.is_empty() || value.is_empty() {
        return None;
    }
    let (version, platform) = match value.split_once('-') {
        Some((version, platform)) => (version.to_string(), Some(platform.to_string())),
        None => (value.to_string(), None),
    };
    Some(GemSpec {
        name: name.to_string(),
        version,
        platform,
    })
}

/// Parse a CHECKSUMS entry: `name (version[-platform]) sha256=<hex>`.
fn parse_checksum_line(line: &str) -> Option<(String, ChecksumInfo)> {
    let (name, rest) = line.split_once(" (")?;
    let (value, rest) = rest.split_once(')')?;
    let (algorithm, digest) = rest.trim().split_once('=')?;
    let info = ChecksumInfo::from_parts(algorithm, digest).ok()?;
    Some((format!("{name}-{value}"), info))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::checksum::Algorithm;

    const GIT_REF: &str = "26487618a68443e94d623bb585cb464b07d36702";

    fn sample_lock() -> String {
        format!(
            r#"GIT
  remote: https://github.com/3scale/json-schema.git
  revision: {GIT_REF}
  branch: devel
  specs:
    json-schema (3.0.0)
      addressable (>= 2.8)

PATH
  remote: vendor/pathgem
  specs:
    pathgem (0.1.0)

GEM
  remote: https://rubygems.org/
  specs:
    addressable (2.8.7)
    nokogiri (1.15.4-x86_64-linux)
    rack (2.2.8)

PLATFORMS
  ruby
  x86_64-linux

DEPENDENCIES
  json-schema!
  rack

BUNDLED WITH
   2.5.10
"#
        )
    }

    #[test]
    fn parses_all_section_kinds() {
        let lock = parse_gemfile_lock(&sample_lock()).expect("parse");

        assert_eq!(lock.bundler_version.as_deref(), Some("2.5.10"));

        assert_eq!(lock.git_sections.len(), 1);
        let git = &lock.git_sections[0];
        assert_eq!(git.remote, "https://github.com/3scale/json-schema.git");
        assert_eq!(git.revision.as_deref(), Some(GIT_REF));
        assert_eq!(git.branch.as_deref(), Some("devel"));
        assert_eq!(
            git.specs,
            vec![GemSpec {
                name: "json-schema".to_string(),
                version: "3.0.0".to_string(),
                platform: None,
            }]
        );

        assert_eq!(lock.path_sections.len(), 1);
        assert_eq!(lock.path_sections[0].remote, "vendor/pathgem");

        assert_eq!(lock.gem_sections.len(), 1);
        let gems = &lock.gem_sections[0];
        assert_eq!(gems.remote, "https://rubygems.org/");
        assert_eq!(gems.specs.len(), 3);
        assert_eq!(
            gems.specs[1],
            GemSpec {
                name: "nokogiri".to_string(),
                version: "1.15.4".to_string(),
                platform: Some("x86_64-linux".to_string()),
            }
        );
    }

    #[test]
    fn parses_checksums_section() {
        let raw = r#"GEM
  remote: https://rubygems.org/
  specs:
    rack (2.2.8)

CHECKSUMS
  rack (2.2.8) sha256=27b14f7004e35a

BUNDLED WITH
   2.6.0
"#;
        let lock = parse_gemfile_lock(raw).expect("parse");
        let info = lock.checksums.get("rack-2.2.8").expect("checksum entry");
        assert_eq!(info.algorithm, Algorithm::Sha256);
        assert_eq!(info.hexdigest, "27b14f7004e35a");
    }

    fn rooted_tmp() -> (tempfile::TempDir, RootedPath) {
        let temp = tempfile::tempdir().expect("tempdir");
        let rooted = RootedPath::new(temp.path()).expect("rooted path");
        (temp, rooted)
    }

    #[test]
    fn plan_skips_binary_gems_without_allow_binary() {
        let (_temp, package_dir) = rooted_tmp();
        let lock = parse_gemfile_lock(&sample_lock()).expect("parse");
        let deps = plan_dependencies(&lock, None, &package_dir).expect("plan");

        let gem_names: Vec<&str> = deps
            .iter()
            .filter_map(|dep| match dep {
                BundlerDependency::Gem(gem) => Some(gem.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(gem_names, vec!["addressable", "rack"]);
        assert!(
            !deps
                .iter()
                .any(|dep| matches!(dep, BundlerDependency::BinaryGem(_)))
        );
    }

    #[test]
    fn plan_includes_binary_gems_with_allow_binary() {
        let (_temp, package_dir) = rooted_tmp();
        let lock = parse_gemfile_lock(&sample_lock()).expect("parse");
        let filter = GemsFilter::from_specs(Some(":all:"), Some(":all:"));
        let deps = plan_dependencies(&lock, Some(&filter), &package_dir).expect("plan");

        assert!(deps.iter().any(|dep| matches!(
            dep,
            BundlerDependency::BinaryGem(gem) if gem.name == "nokogiri" && gem.platform == "x86_64-linux"
        )));
    }

    #[test]
    fn filter_specs_with_all_marker_mean_all() {
        let filter = GemsFilter::from_specs(Some("rails,:all:,rack"), Some(":all:"));
        assert_eq!(filter.packages, None);
        assert_eq!(filter.platforms, None);

        let filter = GemsFilter::from_specs(Some("rails, rack"), Some("x86_64-linux"));
        assert_eq!(
            filter.packages,
            Some(BTreeSet::from(["rails".to_string(), "rack".to_string()]))
        );
        assert_eq!(
            filter.platforms,
            Some(BTreeSet::from(["x86_64-linux".to_string()]))
        );
    }

    fn platforms(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn four_way_platform_selection() {
        let all_all = GemsFilter::from_specs(Some(":all:"), Some(":all:"));
        assert_eq!(
            all_all.select_platforms("rails", &platforms(&["ruby", "x86_64-linux"])),
            platforms(&["x86_64-linux"])
        );
        assert_eq!(
            all_all.select_platforms("rails", &platforms(&["ruby"])),
            platforms(&["ruby"])
        );

        let all_subset = GemsFilter::from_specs(Some(":all:"), Some("x86_64-linux,x86_64-darwin"));
        assert_eq!(
            all_subset.select_platforms("anything", &platforms(&["ruby", "arm64-darwin"])),
            platforms(&["x86_64-linux", "x86_64-darwin"])
        );

        let subset_all = GemsFilter::from_specs(Some("rails,rack"), Some(":all:"));
        assert_eq!(
            subset_all.select_platforms("rails", &platforms(&["ruby", "x86_64-linux"])),
            platforms(&["x86_64-linux"])
        );
        assert_eq!(
            subset_all.select_platforms("nokogiri", &platforms(&["ruby", "x86_64-linux"])),
            platforms(&["ruby"])
        );

        let subset_subset = GemsFilter::from_specs(Some("rails"), Some("x86_64-linux"));
        assert_eq!(
            subset_subset.select_platforms("rails", &platforms(&["ruby", "arm64-darwin"])),
            platforms(&["x86_64-linux"])
        );
        assert_eq!(
            subset_subset.select_platforms("nokogiri", &platforms(&["ruby", "arm64-darwin"])),
            platforms(&["ruby"])
        );
    }

    #[test]
    fn git_sections_require_https_and_full_revision() {
        let mut section = GitSection {
            remote: "http://github.com/org/repo.git".to_string(),
            revision: Some(GIT_REF.to_string()),
            branch: None,
            specs: Vec::new(),
        };
        let err = validate_git_section(&section).expect_err("http rejected");
        assert_eq!(err.kind(), ErrorKind::UnexpectedFormat);
        assert!(err.reason().contains("https"));

        section.remote = "https://github.com/org/repo.git".to_string();
        section.revision = Some("abcd".to_string());
        let err = validate_git_section(&section).expect_err("short revision rejected");
        assert!(err.reason().contains("40-character"));

        section.revision = Some(GIT_REF.to_string());
        validate_git_section(&section).expect("valid section");
    }

    #[test]
    fn path_gems_outside_the_package_are_rejected() {
        let (_temp, package_dir) = rooted_tmp();
        let raw = r#"PATH
  remote: ../outside
  specs:
    escape (0.1.0)
"#;
        let lock = parse_gemfile_lock(raw).expect("parse");
        let err = plan_dependencies(&lock, None, &package_dir).expect_err("escape rejected");
        assert_eq!(err.kind(), ErrorKind::PathOutsideRoot);
    }

    #[test]
    fn gem_download_urls_follow_the_downloads_convention() {
        let (_temp, deps_dir) = rooted_tmp();
        let checksums = BTreeMap::new();

        for source in ["https://rubygems.org", "https://rubygems.org/"] {
            let spec = gem_download_spec(source, "foo-0.0.2.gem", &checksums, &deps_dir)
                .expect("download spec");
            assert_eq!(spec.url, "https://rubygems.org/downloads/foo-0.0.2.gem");
            assert!(spec.destination.path().ends_with("foo-0.0.2.gem"));
        }
    }

    #[test]
    fn git_gem_checkout_dir_uses_short_revision() {
        let gem = GitGemDependency {
            name: "json-schema".to_string(),
            version: "3.0.0".to_string(),
            url: "https://github.com/3scale/json-schema.git".to_string(),
            branch: None,
            revision: GIT_REF.to_string(),
        };
        assert_eq!(gem.checkout_dir_name(), "json-schema-26487618a684");
    }

    #[test]
    fn component_purls() {
        let (_temp, package_dir) = rooted_tmp();
        let checksums = BTreeMap::new();

        let gem = BundlerDependency::Gem(GemDependency {
            name: "my-gem-dep".to_string(),
            version: "0.1.0".to_string(),
            source: "https://rubygems.org".to_string(),
        });
        let component =
            build_component(&gem, &checksums, &package_dir, "Gemfile.lock").expect("component");
        assert_eq!(component.purl, "pkg:gem/my-gem-dep@0.1.0");
        assert_eq!(
            component.properties,
            vec![Property::missing_hash("Gemfile.lock")]
        );

        let git_gem = BundlerDependency::GitGem(GitGemDependency {
            name: "my-git-dep".to_string(),
            version: "0.1.0".to_string(),
            url: "https://github.com/rubygems/example.git".to_string(),
            branch: None,
            revision: GIT_REF.to_string(),
        });
        let component =
            build_component(&git_gem, &checksums, &package_dir, "Gemfile.lock").expect("component");
        assert_eq!(
            component.purl,
            format!(
                "pkg:gem/my-git-dep@0.1.0?vcs_url=git%2Bhttps://github.com/rubygems/example.git%40{GIT_REF}"
            )
        );
    }

    #[test]
    fn binary_gem_purl_carries_the_platform_qualifier() {
        let (_temp, package_dir) = rooted_tmp();
        let mut checksums = BTreeMap::new();
        checksums.insert(
            "nokogiri-1.15.4-x86_64-linux".to_string(),
            ChecksumInfo::from_parts("sha256", "deadbeef").expect("info"),
        );

        let gem = BundlerDependency::BinaryGem(BinaryGemDependency {
            name: "nokogiri".to_string(),
            version: "1.15.4".to_string(),
            source: "https://rubygems.org".to_string(),
            platform: "x86_64-linux".to_string(),
        });
        let component =
            build_component(&gem, &checksums, &package_dir, "Gemfile.lock").expect("component");
        assert_eq!(
            component.purl,
            "pkg:gem/nokogiri@1.15.4?platform=x86_64-linux"
        );
        assert!(component.properties.is_empty());
    }

    #[test]
    fn path_gem_purl_points_at_the_containing_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = git2::Repository::init(temp.path()).expect("init repo");
        std::fs::write(temp.path().join("file"), "x").expect("write file");
        {
            let mut index = repo.index().expect("index");
            index.add_path(Path::new("file")).expect("add");
            index.write().expect("write index");
            let tree_id = index.write_tree().expect("tree");
            let tree = repo.find_tree(tree_id).expect("find tree");
            let sig = git2::Signature::now("tester", "tester@example.com").expect("sig");
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .expect("commit");
        }
        repo.remote("origin", "git@github.com:user/repo.git")
            .expect("origin");
        let head = repo
            .head()
            .and_then(|h| h.peel_to_commit())
            .expect("head")
            .id()
            .to_string();

        let package_dir = RootedPath::new(temp.path()).expect("rooted");
        let gem = BundlerDependency::PathGem(PathGemDependency {
            name: "my-path-dep".to_string(),
            version: "0.1.0".to_string(),
            subpath: "vendor".to_string(),
        });
        let component = build_component(&gem, &BTreeMap::new(), &package_dir, "Gemfile.lock")
            .expect("component");
        assert_eq!(
            component.purl,
            format!(
                "pkg:gem/my-path-dep@0.1.0?vcs_url=git%2Bssh://git%40github.com/user/repo.git%40{head}#vendor"
            )
        );
    }
}

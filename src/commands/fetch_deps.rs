use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::{Mode, PackageInput, Request};
use crate::resolvers;
use crate::sbom::Sbom;

use super::{BUILD_CONFIG_FILE, absolutize};

pub(super) fn run_fetch_deps(
    cwd: &Path,
    config: &Config,
    source: PathBuf,
    output: PathBuf,
    mode: Mode,
    packages: String,
) -> Result<()> {
    let source_dir = absolutize(cwd, &source);
    let output_dir = absolutize(cwd, &output);
    std::fs::create_dir_all(&output_dir).map_err(|io_error| {
        Error::invalid_input(format!(
            "failed to create output directory {}: {io_error}",
            output_dir.display()
        ))
    })?;

    let packages = parse_packages_arg(&packages)?;
    let request = Request::new(source_dir, output_dir.clone(), mode, packages)?;

    info!(
        source_dir = %request.source_dir,
        output_dir = %request.output_dir,
        mode = %request.mode,
        package_count = request.packages.len(),
        "prefetching dependencies"
    );

    let output = resolvers::fetch_request(&request, config)?;

    let sbom = Sbom::new(output.components.clone());
    write_json(&output_dir.join("bom.json"), &sbom)?;
    write_json(&output_dir.join(BUILD_CONFIG_FILE), &output.build_config)?;

    println!(
        "Prefetched {} component(s) into {}",
        output.components.len(),
        output_dir.display()
    );
    println!(
        "Generate the environment file with: airlock generate-env {}",
        output_dir.display()
    );
    if !output.build_config.project_files.is_empty() {
        println!(
            "Apply project file rewrites with: airlock inject-files {}",
            output_dir.display()
        );
    }
    Ok(())
}

/// Accept the package list as a bare ecosystem name (`yarn`), a single JSON
/// object, a JSON list, or a JSON object with a `packages` key.
fn parse_packages_arg(raw: &str) -> Result<Vec<PackageInput>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_input("no packages were specified"));
    }

    if !trimmed.starts_with(['{', '[']) {
        let shorthand = format!(r#"{{"type": "{trimmed}"}}"#);
        let package: PackageInput = serde_json::from_str(&shorthand).map_err(|_| {
            Error::invalid_input(format!("unknown package type '{trimmed}'")).with_solution(
                "Supported package types: yarn, maven, huggingface, dvc, bundler.",
            )
        })?;
        return Ok(vec![package]);
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|source| Error::invalid_input(format!("invalid packages JSON: {source}")))?;

    let list = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(ref object) if object.contains_key("packages") => {
            match &object["packages"] {
                serde_json::Value::Array(items) => items.clone(),
                other => {
                    return Err(Error::invalid_input(format!(
                        "'packages' must be a list, got: {other}"
                    )));
                }
            }
        }
        single @ serde_json::Value::Object(_) => vec![single],
        other => {
            return Err(Error::invalid_input(format!(
                "packages must be a JSON object or list, got: {other}"
            )));
        }
    };

    if list.is_empty() {
        return Err(Error::invalid_input("no packages were specified"));
    }

    list.into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|source| Error::invalid_input(format!("invalid package input: {source}")))
        })
        .collect()
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|source| Error::invalid_input(format!("failed to serialize output: {source}")))?;
    std::fs::write(path, rendered + "\n").map_err(|source| {
        Error::invalid_input(format!("failed to write {}: {source}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_ecosystem_shorthand() {
        let packages = parse_packages_arg("maven").expect("shorthand");
        assert_eq!(packages.len(), 1);
        assert!(matches!(&packages[0], PackageInput::Maven(input) if input.path == Path::new(".")));
    }

    #[test]
    fn parses_single_object_and_list_forms() {
        let single = parse_packages_arg(r#"{"type": "yarn", "path": "web"}"#).expect("object");
        assert_eq!(single.len(), 1);

        let list = parse_packages_arg(
            r#"[{"type": "yarn"}, {"type": "dvc", "path": "ml"}]"#,
        )
        .expect("list");
        assert_eq!(list.len(), 2);

        let wrapped = parse_packages_arg(r#"{"packages": [{"type": "bundler"}]}"#).expect("wrapped");
        assert_eq!(wrapped.len(), 1);
    }

    #[test]
    fn rejects_unknown_shorthand_and_empty_lists() {
        let err = parse_packages_arg("cargo").expect_err("unknown type");
        assert!(err.reason().contains("cargo"));

        let err = parse_packages_arg("[]").expect_err("empty list");
        assert!(err.reason().contains("no packages"));

        let err = parse_packages_arg("   ").expect_err("blank");
        assert!(err.reason().contains("no packages"));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = parse_packages_arg("{not json").expect_err("bad json");
        assert!(err.reason().contains("invalid packages JSON"));
    }
}

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::{Error, Result};
use crate::request::{BuildConfig, EnvVar, EnvVarKind};

const OUTPUT_DIR_TOKEN: &str = "${output_dir}";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvFormat {
    Env,
    Json,
}

#[derive(Serialize)]
struct ResolvedEnvVar<'a> {
    name: &'a str,
    value: String,
}

/// Render the environment variables for a hermetic build. `path`-kind values
/// have the `${output_dir}` token resolved against the concrete output
/// directory; `literal` values pass through untouched. Variables from
/// `default_environment_variables` fill in names no resolver emitted.
pub fn render(
    build_config: &BuildConfig,
    defaults: &BTreeMap<String, String>,
    output_dir: &Path,
    format: EnvFormat,
) -> Result<String> {
    let mut resolved: Vec<ResolvedEnvVar<'_>> = build_config
        .environment_variables
        .iter()
        .map(|variable| ResolvedEnvVar {
            name: &variable.name,
            value: resolve_value(variable, output_dir),
        })
        .collect();

    for (name, value) in defaults {
        if resolved.iter().any(|existing| existing.name == name) {
            debug!(name = %name, "resolver-emitted variable wins over configured default");
            continue;
        }
        resolved.push(ResolvedEnvVar {
            name,
            value: value.clone(),
        });
    }

    match format {
        EnvFormat::Env => {
            let mut out = String::new();
            for variable in &resolved {
                out.push_str(&format!("export {}={}\n", variable.name, variable.value));
            }
            Ok(out)
        }
        EnvFormat::Json => serde_json::to_string_pretty(&resolved)
            .map(|json| json + "\n")
            .map_err(|source| Error::invalid_input(format!("failed to render envfile: {source}"))),
    }
}

fn resolve_value(variable: &EnvVar, output_dir: &Path) -> String {
    match variable.kind {
        EnvVarKind::Literal => variable.value.clone(),
        EnvVarKind::Path => variable
            .value
            .replace(OUTPUT_DIR_TOKEN, &output_dir.display().to_string()),
    }
}

/// Substitute the `${output_dir}` token in a project file template.
pub fn resolve_template(template: &str, output_dir: &Path) -> String {
    template.replace(OUTPUT_DIR_TOKEN, &output_dir.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_config() -> BuildConfig {
        BuildConfig {
            environment_variables: vec![
                EnvVar::literal("HF_HUB_OFFLINE", "1"),
                EnvVar::path("YARN_GLOBAL_FOLDER", "${output_dir}/deps/yarn"),
                EnvVar::path(
                    "MAVEN_OPTS",
                    "-Dmaven.repo.local=${output_dir}/deps/maven",
                ),
            ],
            project_files: Vec::new(),
        }
    }

    #[test]
    fn env_format_resolves_path_values_only() {
        let rendered = render(
            &build_config(),
            &BTreeMap::new(),
            Path::new("/work/output"),
            EnvFormat::Env,
        )
        .expect("render");
        assert_eq!(
            rendered,
            "export HF_HUB_OFFLINE=1\n\
             export YARN_GLOBAL_FOLDER=/work/output/deps/yarn\n\
             export MAVEN_OPTS=-Dmaven.repo.local=/work/output/deps/maven\n"
        );
    }

    #[test]
    fn json_format_lists_name_value_pairs() {
        let rendered = render(
            &build_config(),
            &BTreeMap::new(),
            Path::new("/work/output"),
            EnvFormat::Json,
        )
        .expect("render");
        let parsed: serde_json::Value = serde_json::from_str(&rendered).expect("valid json");
        assert_eq!(parsed[0]["name"], "HF_HUB_OFFLINE");
        assert_eq!(parsed[0]["value"], "1");
        assert_eq!(parsed[1]["value"], "/work/output/deps/yarn");
    }

    #[test]
    fn defaults_fill_gaps_but_never_override() {
        let mut defaults = BTreeMap::new();
        defaults.insert("HF_HUB_OFFLINE".to_string(), "0".to_string());
        defaults.insert("PIP_NO_INDEX".to_string(), "true".to_string());

        let rendered = render(
            &build_config(),
            &defaults,
            Path::new("/out"),
            EnvFormat::Env,
        )
        .expect("render");
        assert!(rendered.contains("export HF_HUB_OFFLINE=1\n"));
        assert!(rendered.contains("export PIP_NO_INDEX=true\n"));
    }

    #[test]
    fn template_substitution_replaces_every_token() {
        let template = r#"{"resolutions": {"a": "file:${output_dir}/a.tgz", "b": "file:${output_dir}/b.tgz"}}"#;
        let resolved = resolve_template(template, Path::new("/out"));
        assert_eq!(
            resolved,
            r#"{"resolutions": {"a": "file:/out/a.tgz", "b": "file:/out/b.tgz"}}"#
        );
    }
}

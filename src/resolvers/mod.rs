mod bundler;
mod dvc;
mod huggingface;
mod maven;
mod yarn;

use tracing::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::request::{Ecosystem, PackageInput, Request, RequestOutput};
use crate::sbom;

/// Route every package in the request to its resolver and merge the partial
/// outputs. Packages are grouped by ecosystem, groups run sequentially in
/// first-encounter order, and each resolver sees only its own inputs.
pub fn fetch_request(request: &Request, config: &Config) -> Result<RequestOutput> {
    let mut order: Vec<Ecosystem> = Vec::new();
    for package in &request.packages {
        if !order.contains(&package.ecosystem()) {
            order.push(package.ecosystem());
        }
    }

    let mut outputs = Vec::new();
    for ecosystem in order {
        info!(ecosystem = ecosystem.as_str(), "processing packages");
        let output = match ecosystem {
            Ecosystem::Yarn => {
                let group = collect(&request.packages, |package| match package {
                    PackageInput::Yarn(input) => Some(input),
                    _ => None,
                });
                yarn::fetch(request, &group, config)?
            }
            Ecosystem::Maven => {
                let group = collect(&request.packages, |package| match package {
                    PackageInput::Maven(input) => Some(input),
                    _ => None,
                });
                maven::fetch(request, &group, config)?
            }
            Ecosystem::Huggingface => {
                let group = collect(&request.packages, |package| match package {
                    PackageInput::Huggingface(input) => Some(input),
                    _ => None,
                });
                huggingface::fetch(request, &group, config)?
            }
            Ecosystem::Dvc => {
                let group = collect(&request.packages, |package| match package {
                    PackageInput::Dvc(input) => Some(input),
                    _ => None,
                });
                dvc::fetch(request, &group, config)?
            }
            Ecosystem::Bundler => {
                let group = collect(&request.packages, |package| match package {
                    PackageInput::Bundler(input) => Some(input),
                    _ => None,
                });
                bundler::fetch(request, &group, config)?
            }
        };
        outputs.push(output);
    }

    merge_outputs(outputs)
}

fn collect<'a, T>(
    packages: &'a [PackageInput],
    select: impl Fn(&'a PackageInput) -> Option<&'a T>,
) -> Vec<&'a T> {
    packages.iter().filter_map(select).collect()
}

/// Merge resolver outputs: components deduplicate by identity with property
/// union; environment variable and project file collisions are errors
/// because resolvers own disjoint namespaces.
fn merge_outputs(outputs: Vec<RequestOutput>) -> Result<RequestOutput> {
    let mut components = Vec::new();
    let mut environment_variables: Vec<crate::request::EnvVar> = Vec::new();
    let mut project_files: Vec<crate::request::ProjectFile> = Vec::new();

    for output in outputs {
        components.extend(output.components);
        for variable in output.build_config.environment_variables {
            if environment_variables
                .iter()
                .any(|existing| existing.name == variable.name)
            {
                return Err(Error::invalid_input(format!(
                    "conflicting environment variable '{}' emitted by multiple resolvers",
                    variable.name
                )));
            }
            environment_variables.push(variable);
        }
        for project_file in output.build_config.project_files {
            if project_files
                .iter()
                .any(|existing| existing.abspath == project_file.abspath)
            {
                return Err(Error::invalid_input(format!(
                    "conflicting project file '{}' emitted by multiple resolvers",
                    project_file.abspath.display()
                )));
            }
            project_files.push(project_file);
        }
    }

    Ok(RequestOutput::new(
        sbom::merge_components(components),
        environment_variables,
        project_files,
    ))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::request::{EnvVar, ProjectFile};
    use crate::sbom::{Component, Property};

    #[test]
    fn merge_deduplicates_components_and_unions_properties() {
        let first = RequestOutput::new(
            vec![
                Component::library("lib", "1.0", "pkg:generic/lib@1.0")
                    .with_property(Property::new("a", "1")),
            ],
            vec![EnvVar::literal("A", "1")],
            Vec::new(),
        );
        let second = RequestOutput::new(
            vec![
                Component::library("lib", "1.0", "pkg:generic/lib@1.0")
                    .with_property(Property::new("b", "2")),
            ],
            vec![EnvVar::literal("B", "2")],
            Vec::new(),
        );

        let merged = merge_outputs(vec![first, second]).expect("merge");
        assert_eq!(merged.components.len(), 1);
        assert_eq!(
            merged.components[0].properties,
            vec![Property::new("a", "1"), Property::new("b", "2")]
        );
        assert_eq!(merged.build_config.environment_variables.len(), 2);
    }

    #[test]
    fn duplicate_env_var_names_are_an_error() {
        let first = RequestOutput::new(Vec::new(), vec![EnvVar::literal("SAME", "1")], Vec::new());
        let second = RequestOutput::new(Vec::new(), vec![EnvVar::literal("SAME", "2")], Vec::new());

        let err = merge_outputs(vec![first, second]).expect_err("collision");
        assert!(err.reason().contains("SAME"));
    }

    #[test]
    fn duplicate_project_files_are_an_error() {
        let file = ProjectFile {
            abspath: PathBuf::from("/src/package.json"),
            template: "{}".to_string(),
        };
        let first = RequestOutput::new(Vec::new(), Vec::new(), vec![file.clone()]);
        let second = RequestOutput::new(Vec::new(), Vec::new(), vec![file]);

        let err = merge_outputs(vec![first, second]).expect_err("collision");
        assert!(err.reason().contains("package.json"));
    }

    #[test]
    fn empty_request_produces_empty_output() {
        let merged = merge_outputs(Vec::new()).expect("merge");
        assert!(merged.components.is_empty());
        assert!(merged.build_config.environment_variables.is_empty());
        assert!(merged.build_config.project_files.is_empty());
    }
}

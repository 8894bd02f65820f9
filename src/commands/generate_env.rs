use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::envfile::{self, EnvFormat};
use crate::error::{Error, Result};
use crate::request::BuildConfig;

use super::{BUILD_CONFIG_FILE, absolutize};

pub(super) fn run_generate_env(
    cwd: &Path,
    config: &Config,
    output: PathBuf,
    format: EnvFormat,
    for_output_dir: Option<PathBuf>,
    file: Option<PathBuf>,
) -> Result<()> {
    let output_dir = absolutize(cwd, &output);
    let build_config = read_build_config(&output_dir)?;

    let concrete_output_dir = for_output_dir
        .map(|dir| absolutize(cwd, &dir))
        .unwrap_or_else(|| output_dir.clone());

    let rendered = envfile::render(
        &build_config,
        &config.default_environment_variables,
        &concrete_output_dir,
        format,
    )?;

    match file {
        Some(file) => {
            let path = absolutize(cwd, &file);
            std::fs::write(&path, rendered).map_err(|source| {
                Error::invalid_input(format!("failed to write {}: {source}", path.display()))
            })?;
            println!("Wrote environment file to {}", path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

pub(super) fn read_build_config(output_dir: &Path) -> Result<BuildConfig> {
    let path = output_dir.join(BUILD_CONFIG_FILE);
    let raw = std::fs::read_to_string(&path).map_err(|_| {
        Error::invalid_input(format!(
            "no build configuration found at {}",
            path.display()
        ))
        .with_solution("Run `airlock fetch-deps` first; it writes the build configuration.")
    })?;
    serde_json::from_str(&raw).map_err(|source| {
        Error::invalid_input(format!(
            "corrupt build configuration {}: {source}",
            path.display()
        ))
    })
}

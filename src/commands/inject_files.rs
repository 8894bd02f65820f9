use std::path::{Path, PathBuf};

use tracing::info;

use crate::envfile;
use crate::error::{Error, Result};

use super::absolutize;
use super::generate_env::read_build_config;

/// Apply the project file rewrites the prefetch step planned: write each
/// template to its absolute path with `${output_dir}` substituted.
pub(super) fn run_inject_files(
    cwd: &Path,
    output: PathBuf,
    for_output_dir: Option<PathBuf>,
) -> Result<()> {
    let output_dir = absolutize(cwd, &output);
    let build_config = read_build_config(&output_dir)?;

    let concrete_output_dir = for_output_dir
        .map(|dir| absolutize(cwd, &dir))
        .unwrap_or_else(|| output_dir.clone());

    if build_config.project_files.is_empty() {
        println!("No project files to inject");
        return Ok(());
    }

    for project_file in &build_config.project_files {
        let content = envfile::resolve_template(&project_file.template, &concrete_output_dir);
        std::fs::write(&project_file.abspath, content).map_err(|source| {
            Error::invalid_input(format!(
                "failed to write {}: {source}",
                project_file.abspath.display()
            ))
        })?;
        info!(path = %project_file.abspath.display(), "injected project file");
        println!("Injected {}", project_file.abspath.display());
    }
    Ok(())
}

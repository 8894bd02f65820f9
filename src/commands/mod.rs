mod fetch_deps;
mod generate_env;
mod inject_files;

use std::path::Path;

use crate::cli::Command;
use crate::config::Config;
use crate::error::Result;

/// Name of the build configuration file persisted next to the prefetched
/// dependencies, consumed by `generate-env` and `inject-files`.
pub const BUILD_CONFIG_FILE: &str = ".build-config.json";

pub fn execute(cwd: &Path, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::FetchDeps {
            source,
            output,
            mode,
            packages,
        } => fetch_deps::run_fetch_deps(cwd, config, source, output, mode.into(), packages),
        Command::GenerateEnv {
            output,
            format,
            for_output_dir,
            file,
        } => {
            generate_env::run_generate_env(cwd, config, output, format.into(), for_output_dir, file)
        }
        Command::InjectFiles {
            output,
            for_output_dir,
        } => inject_files::run_inject_files(cwd, output, for_output_dir),
    }
}

fn absolutize(cwd: &Path, path: &Path) -> std::path::PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

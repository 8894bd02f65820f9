use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::envfile::EnvFormat;
use crate::request::Mode;

#[derive(Debug, Parser)]
#[command(
    name = "airlock",
    version,
    about = "Prefetch build dependencies into an offline cache for hermetic builds"
)]
pub struct Cli {
    /// Enable verbose logging (debug level).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a YAML configuration file (highest-precedence config layer).
    #[arg(long, global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download all declared dependencies and write the SBOM.
    FetchDeps {
        /// Packages to process: an ecosystem name (e.g. "maven"), a JSON
        /// object, a JSON list, or {"packages": [...]}.
        packages: String,

        /// Directory containing the sources and lockfiles.
        #[arg(long, default_value = ".")]
        source: PathBuf,

        /// Directory the dependency cache is written to.
        #[arg(long, default_value = "./airlock-output")]
        output: PathBuf,

        /// Relax checksum requirements instead of failing.
        #[arg(long, value_enum, default_value_t = ModeArg::Strict)]
        mode: ModeArg,
    },

    /// Render the environment variables a hermetic build must set.
    GenerateEnv {
        /// The output directory a fetch-deps run populated.
        output: PathBuf,

        /// Output format.
        #[arg(long, value_enum, default_value_t = EnvFormatArg::Env)]
        format: EnvFormatArg,

        /// Resolve ${output_dir} against this path instead of the output
        /// directory itself (useful when the cache is mounted elsewhere).
        #[arg(long)]
        for_output_dir: Option<PathBuf>,

        /// Write to this file instead of stdout.
        #[arg(short = 'o', long)]
        file: Option<PathBuf>,
    },

    /// Write the planned project-file rewrites back into the source tree.
    InjectFiles {
        /// The output directory a fetch-deps run populated.
        output: PathBuf,

        /// Resolve ${output_dir} against this path instead of the output
        /// directory itself.
        #[arg(long)]
        for_output_dir: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    Strict,
    Permissive,
}

impl From<ModeArg> for Mode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Strict => Mode::Strict,
            ModeArg::Permissive => Mode::Permissive,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum EnvFormatArg {
    Env,
    Json,
}

impl From<EnvFormatArg> for EnvFormat {
    fn from(format: EnvFormatArg) -> Self {
        match format {
            EnvFormatArg::Env => EnvFormat::Env,
            EnvFormatArg::Json => EnvFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fetch_deps_with_defaults() {
        let cli = Cli::try_parse_from(["airlock", "fetch-deps", "maven"]).expect("parse");
        match cli.command {
            Command::FetchDeps {
                packages,
                source,
                output,
                mode,
            } => {
                assert_eq!(packages, "maven");
                assert_eq!(source, PathBuf::from("."));
                assert_eq!(output, PathBuf::from("./airlock-output"));
                assert!(matches!(mode, ModeArg::Strict));
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn parses_permissive_mode() {
        let cli = Cli::try_parse_from([
            "airlock",
            "fetch-deps",
            r#"{"type": "dvc"}"#,
            "--mode",
            "permissive",
        ])
        .expect("parse");
        match cli.command {
            Command::FetchDeps { mode, .. } => assert!(matches!(mode, ModeArg::Permissive)),
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn parses_generate_env_flags() {
        let cli = Cli::try_parse_from([
            "airlock",
            "generate-env",
            "./out",
            "--format",
            "json",
            "--for-output-dir",
            "/mnt/cache",
            "-o",
            "env.json",
        ])
        .expect("parse");
        match cli.command {
            Command::GenerateEnv {
                output,
                format,
                for_output_dir,
                file,
            } => {
                assert_eq!(output, PathBuf::from("./out"));
                assert!(matches!(format, EnvFormatArg::Json));
                assert_eq!(for_output_dir, Some(PathBuf::from("/mnt/cache")));
                assert_eq!(file, Some(PathBuf::from("env.json")));
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn fetch_deps_requires_packages() {
        assert!(Cli::try_parse_from(["airlock", "fetch-deps"]).is_err());
    }

    #[test]
    fn parses_global_flags() {
        let cli = Cli::try_parse_from([
            "airlock",
            "--verbose",
            "--config-file",
            "custom.yaml",
            "inject-files",
            "./out",
        ])
        .expect("parse");
        assert!(cli.verbose);
        assert_eq!(cli.config_file, Some(PathBuf::from("custom.yaml")));
    }
}

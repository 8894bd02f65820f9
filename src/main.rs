mod checksum;
mod cli;
mod commands;
mod config;
mod envfile;
mod error;
mod exec;
mod fetch;
mod logging;
mod purl;
mod request;
mod resolvers;
mod rooted_path;
mod sbom;
mod scm;

use clap::Parser;
use tracing::{error, info};

use crate::cli::{Cli, Command};
use crate::error::Result;

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if let Err(err) = run(cli) {
        error!(error = %err, kind = ?err.kind(), "command failed");
        eprintln!("error: {}", err.friendly_msg());
        std::process::exit(err.exit_code());
    }
}

fn run(cli: Cli) -> Result<()> {
    let cwd = std::env::current_dir().map_err(|source| {
        error::Error::invalid_input(format!("failed to get current working directory: {source}"))
    })?;
    let config = config::load(&cwd, cli.config_file.as_deref())?;

    info!(
        command = command_name(&cli.command),
        cwd = %cwd.display(),
        concurrency_limit = config.concurrency_limit,
        requests_timeout = config.requests_timeout,
        "starting command"
    );

    commands::execute(&cwd, &config, cli.command)
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::FetchDeps { .. } => "fetch-deps",
        Command::GenerateEnv { .. } => "generate-env",
        Command::InjectFiles { .. } => "inject-files",
    }
}

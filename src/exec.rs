use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, ErrorKind, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a package-manager subprocess is invoked: explicit working directory,
/// deterministic environment built from an allow-list plus per-call extras.
pub struct CommandSpec<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
    pub cwd: &'a std::path::Path,
    /// Variables copied from the parent environment when present. `PATH` is
    /// always inherited.
    pub inherit_env: &'a [&'a str],
    /// Variables set explicitly for this invocation.
    pub extra_env: &'a [(&'a str, String)],
    pub timeout: Duration,
}

/// Run the command to completion, capturing stdout and stderr. Returns the
/// captured stdout on success.
pub fn run_cmd(spec: CommandSpec<'_>) -> Result<String> {
    let mut command = Command::new(spec.program);
    command
        .args(spec.args)
        .current_dir(spec.cwd)
        .env_clear()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    for key in std::iter::once(&"PATH").chain(spec.inherit_env) {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    for (key, value) in spec.extra_env {
        command.env(key, value);
    }

    debug!(
        program = spec.program,
        args = ?spec.args,
        cwd = %spec.cwd.display(),
        "running package manager command"
    );

    let mut child = command.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::new(
                ErrorKind::ExecutableNotFound,
                format!("'{}' executable not found in PATH", spec.program),
            )
            .with_solution(format!(
                "Please make sure that '{}' is installed and available on PATH.",
                spec.program
            ))
        } else {
            Error::package_manager(format!("failed to run '{}': {source}", spec.program))
        }
    })?;

    // Drain the pipes on separate threads so a chatty subprocess can't fill
    // a pipe buffer and deadlock against the wait loop below.
    let stdout_handle = child.stdout.take().map(spawn_reader);
    let stderr_handle = child.stderr.take().map(spawn_reader);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if started.elapsed() > spec.timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::package_manager(format!(
                        "'{}' timed out after {} seconds",
                        spec.program,
                        spec.timeout.as_secs()
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                return Err(Error::package_manager(format!(
                    "failed waiting for '{}': {source}",
                    spec.program
                )));
            }
        }
    };

    let stdout = join_reader(stdout_handle);
    let stderr = join_reader(stderr_handle);

    if !status.success() {
        return Err(Error::package_manager(format!(
            "the command '{} {}' failed with exit code {}",
            spec.program,
            spec.args.join(" "),
            status.code().unwrap_or(-1)
        ))
        .with_stderr(stderr));
    }

    Ok(stdout)
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut output = String::new();
        let _ = pipe.read_to_string(&mut output);
        output
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

use tracing_subscriber::EnvFilter;

/// Default filter directives: airlock itself logs at info (debug when
/// verbose), while the HTTP, TLS and git internals pulled in by the fetcher
/// only surface warnings. A `RUST_LOG` value overrides all of this.
fn filter_directives(verbose: bool) -> String {
    let crate_level = if verbose { "debug" } else { "info" };
    format!("warn,airlock={crate_level}")
}

/// Install the global subscriber, writing to stderr only: stdout carries
/// command results (envfiles, summaries) and must stay machine-readable.
/// Calling this more than once is a no-op, so test binaries can initialize
/// freely.
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(verbose)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .without_time()
        .compact()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_level_follows_verbosity() {
        assert_eq!(filter_directives(false), "warn,airlock=info");
        assert_eq!(filter_directives(true), "warn,airlock=debug");
    }

    #[test]
    fn repeated_init_is_harmless() {
        init(false);
        init(true);
    }
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

const CONFIG_FILE_NAME: &str = "config.yaml";
const ENV_PREFIX: &str = "AIRLOCK_";

/// Immutable process configuration, built once at startup from the layered
/// sources and passed explicitly to whoever needs it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub goproxy_url: String,
    pub default_environment_variables: BTreeMap<String, String>,
    pub gomod_download_max_tries: usize,
    pub subprocess_timeout: u64,
    pub requests_timeout: u64,
    pub concurrency_limit: usize,
    pub allow_yarnberry_processing: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            goproxy_url: "https://proxy.golang.org,direct".to_string(),
            default_environment_variables: BTreeMap::new(),
            gomod_download_max_tries: 5,
            subprocess_timeout: 3600,
            requests_timeout: 300,
            concurrency_limit: 5,
            allow_yarnberry_processing: true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialConfig {
    goproxy_url: Option<String>,
    default_environment_variables: Option<BTreeMap<String, String>>,
    gomod_download_max_tries: Option<usize>,
    subprocess_timeout: Option<u64>,
    requests_timeout: Option<u64>,
    concurrency_limit: Option<usize>,
    allow_yarnberry_processing: Option<bool>,
}

/// Load configuration with the documented precedence, highest first:
/// CLI-provided YAML file, `./config.yaml`, `~/.config/airlock/config.yaml`,
/// `AIRLOCK_*` environment variables, built-in defaults.
pub fn load(cwd: &Path, cli_config: Option<&Path>) -> Result<Config> {
    let cli = match cli_config {
        Some(path) => load_partial(path)?,
        None => PartialConfig::default(),
    };
    let project = load_partial_if_exists(&cwd.join(CONFIG_FILE_NAME))?;
    let home = match home_config_path() {
        Some(path) => load_partial_if_exists(&path)?,
        None => PartialConfig::default(),
    };
    let env = partial_from_env()?;

    merge_config([cli, project, home, env])
}

fn home_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("airlock").join(CONFIG_FILE_NAME))
}

fn load_partial_if_exists(path: &Path) -> Result<PartialConfig> {
    if !path.exists() {
        return Ok(PartialConfig::default());
    }
    load_partial(path)
}

fn load_partial(path: &Path) -> Result<PartialConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        Error::invalid_input(format!(
            "failed to read config file {}: {source}",
            path.display()
        ))
    })?;

    serde_yml::from_str(&raw).map_err(|source| {
        Error::invalid_input(format!(
            "failed to parse config file {}: {source}",
            path.display()
        ))
        .with_solution("Remove unrecognized keys and fix any YAML syntax issues.")
    })
}

fn partial_from_env() -> Result<PartialConfig> {
    Ok(PartialConfig {
        goproxy_url: env_string("GOPROXY_URL"),
        default_environment_variables: None,
        gomod_download_max_tries: env_parse("GOMOD_DOWNLOAD_MAX_TRIES")?,
        subprocess_timeout: env_parse("SUBPROCESS_TIMEOUT")?,
        requests_timeout: env_parse("REQUESTS_TIMEOUT")?,
        concurrency_limit: env_parse("CONCURRENCY_LIMIT")?,
        allow_yarnberry_processing: env_parse("ALLOW_YARNBERRY_PROCESSING")?,
    })
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    let Some(raw) = env_string(key) else {
        return Ok(None);
    };
    raw.parse::<T>().map(Some).map_err(|_| {
        Error::invalid_input(format!(
            "invalid value for {ENV_PREFIX}{key}: {raw:?}"
        ))
    })
}

/// Merge partial layers, earlier entries winning over later ones, on top of
/// the built-in defaults.
fn merge_config(layers: [PartialConfig; 4]) -> Result<Config> {
    let mut config = Config::default();

    for layer in layers.into_iter().rev() {
        if let Some(value) = layer.goproxy_url {
            config.goproxy_url = value;
        }
        if let Some(value) = layer.default_environment_variables {
            config.default_environment_variables = value;
        }
        if let Some(value) = layer.gomod_download_max_tries {
            config.gomod_download_max_tries = value;
        }
        if let Some(value) = layer.subprocess_timeout {
            config.subprocess_timeout = value;
        }
        if let Some(value) = layer.requests_timeout {
            config.requests_timeout = value;
        }
        if let Some(value) = layer.concurrency_limit {
            config.concurrency_limit = value;
        }
        if let Some(value) = layer.allow_yarnberry_processing {
            config.allow_yarnberry_processing = value;
        }
    }

    if config.concurrency_limit < 1 {
        return Err(Error::invalid_input(format!(
            "invalid concurrency_limit: {} (must be >= 1)",
            config.concurrency_limit
        )));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial(concurrency_limit: Option<usize>, requests_timeout: Option<u64>) -> PartialConfig {
        PartialConfig {
            concurrency_limit,
            requests_timeout,
            ..PartialConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.goproxy_url, "https://proxy.golang.org,direct");
        assert_eq!(config.gomod_download_max_tries, 5);
        assert_eq!(config.subprocess_timeout, 3600);
        assert_eq!(config.requests_timeout, 300);
        assert_eq!(config.concurrency_limit, 5);
        assert!(config.allow_yarnberry_processing);
    }

    #[test]
    fn higher_layers_win() {
        let cli = partial(Some(9), None);
        let project = partial(Some(2), Some(60));
        let home = partial(Some(1), None);
        let env = PartialConfig::default();

        let config = merge_config([cli, project, home, env]).expect("merge");
        assert_eq!(config.concurrency_limit, 9);
        assert_eq!(config.requests_timeout, 60);
    }

    #[test]
    fn lower_layers_fill_gaps() {
        let env = partial(None, Some(120));
        let config =
            merge_config([PartialConfig::default(), PartialConfig::default(), PartialConfig::default(), env])
                .expect("merge");
        assert_eq!(config.requests_timeout, 120);
        assert_eq!(config.concurrency_limit, 5);
    }

    #[test]
    fn zero_concurrency_limit_is_rejected() {
        let cli = partial(Some(0), None);
        let err = merge_config([
            cli,
            PartialConfig::default(),
            PartialConfig::default(),
            PartialConfig::default(),
        ])
        .expect_err("should fail");
        assert!(err.reason().contains("concurrency_limit"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.yaml");
        std::fs::write(&path, "concurrency_limit: 3\nno_such_key: 1\n").expect("write config");

        let err = load_partial(&path).expect_err("unknown key");
        assert!(err.reason().contains("no_such_key"));
    }

    #[test]
    fn parses_all_recognized_keys() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.yaml");
        std::fs::write(
            &path,
            "goproxy_url: https://proxy.example.com\n\
             default_environment_variables:\n  FOO: bar\n\
             gomod_download_max_tries: 3\n\
             subprocess_timeout: 600\n\
             requests_timeout: 30\n\
             concurrency_limit: 2\n\
             allow_yarnberry_processing: false\n",
        )
        .expect("write config");

        let layer = load_partial(&path).expect("load");
        let config = merge_config([
            layer,
            PartialConfig::default(),
            PartialConfig::default(),
            PartialConfig::default(),
        ])
        .expect("merge");

        assert_eq!(config.goproxy_url, "https://proxy.example.com");
        assert_eq!(
            config.default_environment_variables.get("FOO"),
            Some(&"bar".to_string())
        );
        assert_eq!(config.gomod_download_max_tries, 3);
        assert_eq!(config.subprocess_timeout, 600);
        assert_eq!(config.requests_timeout, 30);
        assert_eq!(config.concurrency_limit, 2);
        assert!(!config.allow_yarnberry_processing);
    }
}

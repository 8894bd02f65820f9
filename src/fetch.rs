use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::checksum::{self, ChecksumInfo};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::rooted_path::RootedPath;

const CHUNK_LOG_THRESHOLD: u64 = 50 * 1024 * 1024;
const RETRY_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 500;

/// A single planned download: where from, where to (always confined to the
/// output directory), optional credentials and expected checksums.
#[derive(Clone, Debug)]
pub struct DownloadSpec {
    pub url: String,
    pub destination: RootedPath,
    pub auth: Option<(String, Option<String>)>,
    pub checksums: Vec<ChecksumInfo>,
}

impl DownloadSpec {
    pub fn new(url: impl Into<String>, destination: RootedPath) -> Self {
        Self {
            url: url.into(),
            destination,
            auth: None,
            checksums: Vec::new(),
        }
    }

    pub fn with_checksums(mut self, checksums: Vec<ChecksumInfo>) -> Self {
        self.checksums = checksums;
        self
    }
}

/// Download all files with bounded parallelism. At most `concurrency_limit`
/// transfers are in flight; each is retried on transient failures. The first
/// non-retryable failure cancels every other in-flight transfer and closes
/// the connection pool. Completed files are left on disk; the failed task's
/// partial file is removed. No ordering is guaranteed between downloads.
pub fn download_files(specs: Vec<DownloadSpec>, config: &Config) -> Result<()> {
    if specs.is_empty() {
        return Ok(());
    }
    let runtime = build_runtime()?;
    runtime.block_on(download_all(specs, config))
}

/// Fetch a small text resource (API metadata) through the same client
/// configuration and retry discipline as file downloads. This module is the
/// only place network I/O happens.
pub fn get_text(url: &str, config: &Config) -> Result<String> {
    let runtime = build_runtime()?;
    let client = build_client(config)?;
    runtime.block_on(async {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match try_get_text(&client, url).await {
                Ok(body) => return Ok(body),
                Err(failure) => {
                    if !failure.retryable || attempt >= RETRY_ATTEMPTS {
                        return Err(Error::fetch(format!(
                            "could not fetch {url}: {}",
                            failure.detail
                        )));
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    })
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .map_err(|source| Error::fetch(format!("failed to start async runtime: {source}")))
}

fn build_client(config: &Config) -> Result<reqwest::Client> {
    // Proxy settings are picked up from the environment by default.
    reqwest::Client::builder()
        .user_agent(concat!("airlock/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.requests_timeout))
        .build()
        .map_err(|source| Error::fetch(format!("failed to build HTTP client: {source}")))
}

async fn download_all(specs: Vec<DownloadSpec>, config: &Config) -> Result<()> {
    let client = build_client(config)?;
    let semaphore = Arc::new(Semaphore::new(config.concurrency_limit));
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for spec in specs {
        let client = client.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| Error::fetch("download scheduler was shut down"))?;
            download_one(&client, &spec).await
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(err);
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                return Err(Error::fetch(format!("download task failed: {join_err}")));
            }
        }
    }
    Ok(())
}

async fn download_one(client: &reqwest::Client, spec: &DownloadSpec) -> Result<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match try_download(client, spec).await {
            Ok(bytes) => {
                debug!(url = %spec.url, bytes, "download completed");
                if !spec.checksums.is_empty()
                    && let Err(err) = checksum::must_match_any(spec.destination.path(), &spec.checksums)
                {
                    let _ = tokio::fs::remove_file(spec.destination.path()).await;
                    return Err(err);
                }
                return Ok(());
            }
            Err(failure) => {
                let _ = tokio::fs::remove_file(spec.destination.path()).await;
                if !failure.retryable || attempt >= RETRY_ATTEMPTS {
                    return Err(Error::fetch(format!(
                        "could not download {}: {}",
                        spec.url, failure.detail
                    )));
                }
                debug!(
                    url = %spec.url,
                    attempt,
                    detail = %failure.detail,
                    "transient download failure, retrying"
                );
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }
    }
}

struct AttemptFailure {
    retryable: bool,
    detail: String,
}

impl AttemptFailure {
    fn transient(detail: impl Into<String>) -> Self {
        Self {
            retryable: true,
            detail: detail.into(),
        }
    }

    fn fatal(detail: impl Into<String>) -> Self {
        Self {
            retryable: false,
            detail: detail.into(),
        }
    }
}

async fn try_download(
    client: &reqwest::Client,
    spec: &DownloadSpec,
) -> std::result::Result<u64, AttemptFailure> {
    let mut request = client.get(&spec.url);
    match &spec.auth {
        Some((user, password)) => {
            request = request.basic_auth(user, password.as_deref());
        }
        None => {
            if let Some((user, password)) = netrc_credentials(&spec.url) {
                request = request.basic_auth(user, Some(password));
            }
        }
    }

    let mut response = request
        .send()
        .await
        .map_err(|source| AttemptFailure::transient(source.to_string()))?;
    check_status(response.status())?;

    if let Some(parent) = spec.destination.path().parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| AttemptFailure::fatal(format!("cannot create directory: {source}")))?;
    }
    let mut file = tokio::fs::File::create(spec.destination.path())
        .await
        .map_err(|source| {
            AttemptFailure::fatal(format!(
                "cannot create {}: {source}",
                spec.destination.path().display()
            ))
        })?;

    let mut written: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|source| AttemptFailure::transient(source.to_string()))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|source| AttemptFailure::fatal(format!("write failed: {source}")))?;
        written += chunk.len() as u64;
        if written % CHUNK_LOG_THRESHOLD < chunk.len() as u64 && written > CHUNK_LOG_THRESHOLD {
            debug!(url = %spec.url, written, "download in progress");
        }
    }
    file.flush()
        .await
        .map_err(|source| AttemptFailure::fatal(format!("flush failed: {source}")))?;
    Ok(written)
}

async fn try_get_text(
    client: &reqwest::Client,
    url: &str,
) -> std::result::Result<String, AttemptFailure> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|source| AttemptFailure::transient(source.to_string()))?;
    check_status(response.status())?;
    response
        .text()
        .await
        .map_err(|source| AttemptFailure::transient(source.to_string()))
}

fn check_status(status: StatusCode) -> std::result::Result<(), AttemptFailure> {
    if status.is_success() {
        return Ok(());
    }
    // 5xx and the documented retryable 4xx codes back off and retry; any
    // other 4xx aborts the whole batch immediately.
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    let failure = AttemptFailure {
        retryable,
        detail: format!("server responded with status {status}"),
    };
    Err(failure)
}

fn backoff_delay(attempt: u32) -> Duration {
    let exponential = BACKOFF_BASE_MS.saturating_mul(1 << attempt.min(6));
    Duration::from_millis(exponential + jitter_ms(exponential))
}

// Deterministic RNG would be overkill here; sub-millisecond clock noise is
// plenty to de-synchronize retry storms.
fn jitter_ms(range_ms: u64) -> u64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % range_ms.max(1)
}

/// Look up credentials for the URL's host in `$NETRC` or `~/.netrc`.
fn netrc_credentials(url: &str) -> Option<(String, String)> {
    let host = url::Url::parse(url).ok()?.host_str()?.to_string();
    let path = std::env::var("NETRC")
        .map(std::path::PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|home| home.join(".netrc")))?;
    let content = std::fs::read_to_string(path).ok()?;
    parse_netrc(&content, &host)
}

fn parse_netrc(content: &str, host: &str) -> Option<(String, String)> {
    let mut tokens = content.split_whitespace().peekable();
    let mut matched = false;
    let mut login: Option<String> = None;
    let mut password: Option<String> = None;

    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                if matched && login.is_some() && password.is_some() {
                    break;
                }
                matched = tokens.next() == Some(host);
                if matched {
                    login = None;
                    password = None;
                }
            }
            "default" => {
                if matched && login.is_some() && password.is_some() {
                    break;
                }
                matched = true;
                login = None;
                password = None;
            }
            "login" if matched => login = tokens.next().map(ToOwned::to_owned),
            "password" if matched => password = tokens.next().map(ToOwned::to_owned),
            _ => {}
        }
    }

    match (login, password) {
        (Some(login), Some(password)) if matched => Some((login, password)),
        _ => None,
    }
}

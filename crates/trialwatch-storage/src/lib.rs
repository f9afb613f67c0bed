//! Day-keyed artifact storage, retry policy and HTTP fetch utilities for trialwatch.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trialwatch-storage";

const BODY_EXCERPT_CHARS: usize = 200;

/// A harvested export file. At most one exists per calendar date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HarvestArtifact {
    pub date: NaiveDate,
    pub path: PathBuf,
    pub byte_size: u64,
    pub content_hash: String,
}

impl HarvestArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Filesystem slot for harvest artifacts, one file per date:
/// `<root>/<prefix>_<YYYY-MM-DD>.<extension>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    prefix: String,
    extension: String,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>, extension: &str) -> Self {
        let ext = extension.trim_start_matches('.').trim();
        Self {
            root: root.into(),
            prefix: prefix.into(),
            extension: if ext.is_empty() { "bin".to_string() } else { ext.to_string() },
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!(
            "{}_{}.{}",
            self.prefix,
            date.format("%Y-%m-%d"),
            self.extension
        ))
    }

    /// A unique in-progress path next to the final artifact, so the final
    /// move is a same-filesystem rename.
    pub fn staging_path(&self, date: NaiveDate) -> PathBuf {
        self.root.join(format!(
            ".{}_{}.{}.part",
            self.prefix,
            date.format("%Y-%m-%d"),
            Uuid::new_v4()
        ))
    }

    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))
    }

    pub async fn existing(&self, date: NaiveDate) -> anyhow::Result<Option<HarvestArtifact>> {
        let path = self.artifact_path(date);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking artifact path {}", path.display()))?
        {
            return Ok(None);
        }
        Ok(Some(describe(date, path).await?))
    }

    /// Move a finished download into the canonical slot for `date`. If the
    /// slot is already occupied the staged file is discarded and the
    /// existing artifact is returned.
    pub async fn materialize(&self, date: NaiveDate, staged: &Path) -> anyhow::Result<HarvestArtifact> {
        self.ensure_root().await?;
        let target = self.artifact_path(date);

        if let Some(existing) = self.existing(date).await? {
            let _ = fs::remove_file(staged).await;
            return Ok(existing);
        }

        if fs::rename(staged, &target).await.is_err() {
            // Staged file lives on another filesystem: copy beside the
            // target first so the final step is still an atomic rename.
            let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
            let bytes = fs::read(staged)
                .await
                .with_context(|| format!("reading staged download {}", staged.display()))?;
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
            file.write_all(&bytes)
                .await
                .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
            file.flush()
                .await
                .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
            drop(file);

            if let Err(err) = fs::rename(&temp_path, &target).await {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        target.display()
                    )
                });
            }
            let _ = fs::remove_file(staged).await;
        }

        describe(date, target).await
    }
}

async fn describe(date: NaiveDate, path: PathBuf) -> anyhow::Result<HarvestArtifact> {
    let bytes = fs::read(&path)
        .await
        .with_context(|| format!("reading artifact {}", path.display()))?;
    Ok(HarvestArtifact {
        date,
        content_hash: ArtifactStore::sha256_hex(&bytes),
        byte_size: bytes.len() as u64,
        path,
    })
}

/// Destination for finished artifacts. Returns a retrievable reference.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn publish(&self, artifact: &HarvestArtifact, key: &str) -> anyhow::Result<String>;
}

pub fn publish_key(artifact: &HarvestArtifact) -> String {
    format!("raw/{}", artifact.file_name())
}

/// Copies artifacts under a local directory and hands back `file://` references.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn publish(&self, artifact: &HarvestArtifact, key: &str) -> anyhow::Result<String> {
        let target = self.root.join(key);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating publish directory {}", parent.display()))?;
        }
        fs::copy(&artifact.path, &target).await.with_context(|| {
            format!(
                "publishing {} -> {}",
                artifact.path.display(),
                target.display()
            )
        })?;
        let absolute = fs::canonicalize(&target)
            .await
            .with_context(|| format!("resolving {}", target.display()))?;
        info!(key, bytes = artifact.byte_size, "artifact published");
        Ok(format!("file://{}", absolute.display()))
    }
}

/// Errors that know whether another attempt could succeed.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: `base_delay * multiplier^attempt`, never below
/// `base_delay` and never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::api()
    }
}

impl BackoffPolicy {
    /// Registry API calls.
    pub const fn api() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Page loads inside a browser session.
    pub const fn navigation() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Whole export-harvest attempts.
    pub const fn harvest() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(4),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt_index.min(63) as i32);
        let secs = self.base_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).max(self.base_delay)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempts are used up. The last error is returned unchanged.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &BackoffPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(label, attempts = attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    label,
                    error = %err,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                if err.is_retryable() {
                    error!(label, error = %err, attempts = attempt, "retries exhausted");
                } else {
                    warn!(label, error = %err, "permanent failure, not retrying");
                }
                return Err(err);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::api(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body_excerpt}")]
    HttpStatus {
        status: u16,
        url: String,
        body_excerpt: String,
    },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err) == RetryDisposition::Retryable,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            FetchError::Decode { .. } => false,
        }
    }
}

/// GET-and-decode client with retry. No caching.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub async fn fetch_json(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        retry_with_backoff(&self.backoff, "http_fetch", || self.fetch_once(url, params))
            .instrument(span)
            .await
    }

    async fn fetch_once(&self, url: &str, params: &[(&str, String)]) -> Result<JsonValue, FetchError> {
        let resp = self.client.get(url).query(params).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body_excerpt: body.chars().take(BODY_EXCERPT_CHARS).collect(),
            });
        }

        serde_json::from_str(&body).map_err(|source| FetchError::Decode {
            url: final_url,
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 15).expect("date")
    }

    fn quick_policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(20),
        }
    }

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn artifact_path_is_keyed_by_date() {
        let store = ArtifactStore::new("/tmp/harvest", "ctis", ".csv");
        assert_eq!(
            store.artifact_path(day()),
            PathBuf::from("/tmp/harvest/ctis_2026-10-15.csv")
        );
        let staging = store.staging_path(day());
        assert_eq!(staging.parent(), Some(Path::new("/tmp/harvest")));
        assert_ne!(staging, store.staging_path(day()));
    }

    #[tokio::test]
    async fn materialize_moves_download_into_slot_once() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path(), "ctis", "csv");
        assert!(store.existing(day()).await.unwrap().is_none());

        store.ensure_root().await.unwrap();
        let staged = store.staging_path(day());
        fs::write(&staged, b"id,title\n1,a\n").await.unwrap();
        let first = store.materialize(day(), &staged).await.unwrap();
        assert_eq!(first.path, store.artifact_path(day()));
        assert_eq!(first.byte_size, 13);
        assert!(!staged.exists());

        let staged_again = store.staging_path(day());
        fs::write(&staged_again, b"different").await.unwrap();
        let second = store.materialize(day(), &staged_again).await.unwrap();
        assert_eq!(second, first);
        assert!(!staged_again.exists());
        assert_eq!(store.existing(day()).await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn fs_sink_copies_under_key() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join("downloads"), "ctis", "csv");
        store.ensure_root().await.unwrap();
        let staged = store.staging_path(day());
        fs::write(&staged, b"payload").await.unwrap();
        let artifact = store.materialize(day(), &staged).await.unwrap();

        let sink = FsArtifactSink::new(dir.path().join("published"));
        let key = publish_key(&artifact);
        assert_eq!(key, "raw/ctis_2026-10-15.csv");
        let reference = sink.publish(&artifact, &key).await.unwrap();
        assert!(reference.starts_with("file://"));
        assert!(reference.ends_with("raw/ctis_2026-10-15.csv"));
        assert!(dir.path().join("published/raw/ctis_2026-10-15.csv").exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn harvest_policy_is_slower_than_navigation() {
        let nav = BackoffPolicy::navigation();
        let harvest = BackoffPolicy::harvest();
        assert!(harvest.base_delay > nav.base_delay);
        assert!(harvest.max_attempts <= 3);
        assert_eq!(BackoffPolicy::api().delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(BackoffPolicy::api().delay_for_attempt(10), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&BackoffPolicy::api(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(TestError::Transient)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = retry_with_backoff(&BackoffPolicy::api(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Permanent) }
        })
        .await;
        assert!(matches!(result, Err(TestError::Permanent)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> = retry_with_backoff(&BackoffPolicy::harvest(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TestError::Transient) }
        })
        .await;
        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fetch_json_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/studies"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/studies"))
            .and(query_param("query.cond", "diabetes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"studies": []})))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: quick_policy(3),
            ..Default::default()
        })
        .unwrap();
        let body = fetcher
            .fetch_json(
                &format!("{}/studies", server.uri()),
                &[("query.cond", "diabetes".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(body, serde_json::json!({"studies": []}));
    }

    #[tokio::test]
    async fn fetch_json_surfaces_client_errors_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/studies"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad filter.advanced"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: quick_policy(5),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher
            .fetch_json(&format!("{}/studies", server.uri()), &[])
            .await
            .unwrap_err();
        match &err {
            FetchError::HttpStatus { status, body_excerpt, .. } => {
                assert_eq!(*status, 400);
                assert_eq!(body_excerpt, "bad filter.advanced");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn fetch_json_gives_up_after_policy_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpClientConfig {
            backoff: quick_policy(2),
            ..Default::default()
        })
        .unwrap();
        let err = fetcher.fetch_json(&server.uri(), &[]).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
    }
}

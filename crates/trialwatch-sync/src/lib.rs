//! Pipeline orchestration: configuration, batched persistence runs, the
//! harvest invocation handler and its cron schedule.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use trialwatch_adapters::harvest::DEFAULT_CTIS_SEARCH_URL;
use trialwatch_adapters::{
    read_export_file, BrowserLauncher, BufferedFeed, CtgovClient, ExportHarvester, ExportSelectors,
    HarvestConfig, TrialFeed, WalkQuery, DEFAULT_CTGOV_ENDPOINT, DEFAULT_PAGE_SIZE,
};
use trialwatch_core::UnifiedTrial;
use trialwatch_storage::{publish_key, ArtifactSink, BackoffPolicy, HttpClientConfig};
use uuid::Uuid;

pub mod writer;

pub use writer::{
    BatchUpsertWriter, DatabaseConfig, Field, PgConnector, StoreConnector, StoreError, TrialRow, TrialStore,
    TrialTable, CTGOV_TABLE, CTIS_TABLE,
};

pub const CRATE_NAME: &str = "trialwatch-sync";

pub const DEFAULT_HARVEST_CRON: &str = "0 30 6 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{key} has invalid value `{value}`")]
    Invalid { key: &'static str, value: String },
    #[error("reading selectors file {path}: {message}")]
    Selectors { path: PathBuf, message: String },
}

#[derive(Debug, Clone)]
pub struct TrialwatchConfig {
    pub database_url: Option<String>,
    pub db_connect_timeout_secs: u64,
    pub db_application_name: String,
    pub ctg_endpoint: String,
    pub ctg_rps: f64,
    pub ctg_page_size: u32,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub ctis_search_url: String,
    pub artifacts_dir: PathBuf,
    pub publish_dir: PathBuf,
    pub download_timeout_secs: u64,
    pub headless: bool,
    pub node_bin: String,
    pub selectors_file: Option<PathBuf>,
    pub harvest_cron: String,
}

impl TrialwatchConfig {
    /// Read settings from the process environment, loading `.env` first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            info!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            database_url: get("DATABASE_URL"),
            db_connect_timeout_secs: parse_or(&get, "DB_CONNECT_TIMEOUT_SECS", 10)?,
            db_application_name: get("DB_APPLICATION_NAME").unwrap_or_else(|| "trialwatch".to_string()),
            ctg_endpoint: get("CTG_ENDPOINT").unwrap_or_else(|| DEFAULT_CTGOV_ENDPOINT.to_string()),
            ctg_rps: parse_or(&get, "CTG_RPS", 5.0)?,
            ctg_page_size: parse_or(&get, "CTG_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            http_timeout_secs: parse_or(&get, "TRIALWATCH_HTTP_TIMEOUT_SECS", 30)?,
            user_agent: get("TRIALWATCH_USER_AGENT")
                .unwrap_or_else(|| format!("trialwatch/{}", env!("CARGO_PKG_VERSION"))),
            ctis_search_url: get("CTIS_SEARCH_URL").unwrap_or_else(|| DEFAULT_CTIS_SEARCH_URL.to_string()),
            artifacts_dir: get("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            publish_dir: get("PUBLISH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./published")),
            download_timeout_secs: parse_or(&get, "DOWNLOAD_TIMEOUT", 90)?,
            headless: get("TRIALWATCH_HEADLESS")
                .map(|v| !matches!(v.trim(), "0" | "false" | "FALSE" | "False" | "no"))
                .unwrap_or(true),
            node_bin: get("TRIALWATCH_NODE_BIN").unwrap_or_else(|| "node".to_string()),
            selectors_file: get("TRIALWATCH_SELECTORS_FILE").map(PathBuf::from),
            harvest_cron: get("HARVEST_CRON").unwrap_or_else(|| DEFAULT_HARVEST_CRON.to_string()),
        })
    }

    pub fn database(&self) -> Result<DatabaseConfig, ConfigError> {
        let url = self
            .database_url
            .clone()
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        Ok(DatabaseConfig {
            url,
            connect_timeout: Duration::from_secs(self.db_connect_timeout_secs),
            application_name: self.db_application_name.clone(),
        })
    }

    pub fn http_client(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::api(),
        }
    }

    pub fn harvest(&self) -> Result<HarvestConfig, ConfigError> {
        let selectors = match &self.selectors_file {
            Some(path) => load_selectors(path)?,
            None => ExportSelectors::default(),
        };
        Ok(HarvestConfig {
            search_url: self.ctis_search_url.clone(),
            artifacts_dir: self.artifacts_dir.clone(),
            selectors,
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            ..Default::default()
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

pub fn load_selectors(path: &Path) -> Result<ExportSelectors, ConfigError> {
    let to_error = |message: String| ConfigError::Selectors {
        path: path.to_path_buf(),
        message,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| to_error(e.to_string()))?;
    serde_yaml::from_str(&raw).map_err(|e| to_error(e.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunLimits {
    pub max_records: usize,
    pub batch_size: usize,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_records: 100,
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub fetched: usize,
    pub written: usize,
    pub batches: usize,
    pub error: Option<String>,
}

pub struct PipelineOrchestrator<C> {
    writer: BatchUpsertWriter<C>,
}

impl<C: StoreConnector> PipelineOrchestrator<C> {
    pub fn new(connector: C) -> Self {
        Self {
            writer: BatchUpsertWriter::new(connector),
        }
    }

    /// Walk the registry for `query` and persist up to `limits.max_records` trials.
    pub async fn run(&self, client: &CtgovClient, query: WalkQuery, limits: RunLimits) -> RunReport {
        let span = info_span!("sync_run", condition = %query.condition);
        async {
            let mut walk = client.walk(query);
            let report = self.drive(&mut walk, limits).await;
            info!(pages = walk.pages_fetched(), dropped = walk.dropped(), "registry walk finished");
            report
        }
        .instrument(span)
        .await
    }

    /// Persist the rows of a harvested export file into the EU table.
    pub async fn load_export(&self, path: &Path, limits: RunLimits) -> Result<RunReport> {
        let rows = read_export_file(path)
            .await
            .with_context(|| format!("loading export {}", path.display()))?;
        if rows.dropped > 0 {
            warn!(dropped = rows.dropped, "export rows without a trial number were skipped");
        }
        let mut feed = BufferedFeed::new(rows.trials);
        Ok(self.drive(&mut feed, limits).await)
    }

    /// Pull from `feed` in batches of `limits.batch_size` until the feed ends,
    /// fails, or `limits.max_records` trials were taken. Buffered trials are
    /// always flushed, including when the feed fails.
    pub async fn drive(&self, feed: &mut (dyn TrialFeed + '_), limits: RunLimits) -> RunReport {
        let batch_size = limits.batch_size.max(1);
        let mut report = RunReport {
            run_id: Uuid::new_v4(),
            fetched: 0,
            written: 0,
            batches: 0,
            error: None,
        };
        let mut buffer: Vec<UnifiedTrial> = Vec::with_capacity(batch_size);

        while report.fetched < limits.max_records {
            match feed.next_trial().await {
                Ok(Some(trial)) => {
                    report.fetched += 1;
                    buffer.push(trial);
                    if buffer.len() >= batch_size {
                        self.flush(&mut buffer, &mut report).await;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, buffered = buffer.len(), "feed failed, flushing buffered trials");
                    report.error = Some(err.to_string());
                    break;
                }
            }
        }
        self.flush(&mut buffer, &mut report).await;

        info!(
            run_id = %report.run_id,
            fetched = report.fetched,
            written = report.written,
            batches = report.batches,
            "run finished"
        );
        report
    }

    async fn flush(&self, buffer: &mut Vec<UnifiedTrial>, report: &mut RunReport) {
        if buffer.is_empty() {
            return;
        }
        let written = self.writer.write(buffer).await;
        report.batches += 1;
        report.written += written;
        info!(batch = report.batches, size = buffer.len(), written, "batch flushed");
        buffer.clear();
    }
}

/// Structured outcome of one harvest invocation.
#[derive(Debug, Clone, Serialize)]
pub struct InvocationResponse {
    pub status_code: u16,
    pub body: JsonValue,
}

/// Run one harvest, publish the artifact and report the outcome. Never fails:
/// errors are reported as a 500 response.
pub async fn invoke_harvest<L: BrowserLauncher>(
    harvester: &ExportHarvester<L>,
    sink: &dyn ArtifactSink,
    event: JsonValue,
) -> InvocationResponse {
    let outcome = async {
        let artifact = harvester.harvest().await?;
        let key = publish_key(&artifact);
        let reference = sink
            .publish(&artifact, &key)
            .await
            .with_context(|| format!("publishing {key}"))?;
        anyhow::Ok((artifact, reference))
    }
    .await;

    let timestamp = Utc::now().to_rfc3339();
    match outcome {
        Ok((artifact, reference)) => InvocationResponse {
            status_code: 200,
            body: json!({
                "message": "CTIS export harvested",
                "timestamp": timestamp,
                "reference": reference,
                "artifact": {
                    "date": artifact.date.to_string(),
                    "path": artifact.path.display().to_string(),
                    "bytes": artifact.byte_size,
                    "sha256": artifact.content_hash,
                },
                "event": event,
            }),
        },
        Err(err) => {
            error!(error = %format!("{err:#}"), "harvest invocation failed");
            InvocationResponse {
                status_code: 500,
                body: json!({
                    "message": "CTIS harvest failed",
                    "timestamp": timestamp,
                    "error": format!("{err:#}"),
                    "event": event,
                }),
            }
        }
    }
}

/// Cron-driven harvest invocations.
pub struct HarvestScheduler {
    scheduler: JobScheduler,
}

impl HarvestScheduler {
    pub async fn new<L>(
        cron: &str,
        harvester: Arc<ExportHarvester<L>>,
        sink: Arc<dyn ArtifactSink>,
    ) -> Result<Self>
    where
        L: BrowserLauncher + 'static,
    {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let harvester = harvester.clone();
            let sink = sink.clone();
            Box::pin(async move {
                let event = json!({ "trigger": "schedule" });
                let response = invoke_harvest(&harvester, sink.as_ref(), event).await;
                info!(status = response.status_code, body = %response.body, "scheduled harvest finished");
            })
        })
        .with_context(|| format!("creating harvest job for cron {cron}"))?;
        scheduler.add(job).await.context("adding harvest job")?;
        Ok(Self { scheduler })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await.context("stopping scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::writer::testing::MemoryConnector;
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use trialwatch_adapters::harvest::{AutomationError, BrowserSession};
    use trialwatch_adapters::AdapterError;
    use trialwatch_core::{TrialParts, SOURCE_CTGOV};
    use trialwatch_storage::FsArtifactSink;

    fn trial(id: usize) -> UnifiedTrial {
        UnifiedTrial::new(TrialParts {
            id: format!("NCT{id:08}"),
            status: "RECRUITING".to_string(),
            source: SOURCE_CTGOV.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    fn trials(n: usize) -> Vec<UnifiedTrial> {
        (1..=n).map(trial).collect()
    }

    /// Yields `items`, then fails once.
    struct FailingFeed {
        items: std::vec::IntoIter<UnifiedTrial>,
    }

    #[async_trait]
    impl TrialFeed for FailingFeed {
        async fn next_trial(&mut self) -> Result<Option<UnifiedTrial>, AdapterError> {
            match self.items.next() {
                Some(trial) => Ok(Some(trial)),
                None => Err(AdapterError::PageShape("studies is not an array".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn batches_until_feed_is_exhausted() {
        let connector = MemoryConnector::default();
        let orchestrator = PipelineOrchestrator::new(connector.clone());
        let mut feed = BufferedFeed::new(trials(25));

        let report = orchestrator
            .drive(&mut feed, RunLimits { max_records: 100, batch_size: 10 })
            .await;
        assert_eq!(report.fetched, 25);
        assert_eq!(report.written, 25);
        assert_eq!(report.batches, 3);
        assert!(report.error.is_none());
        assert_eq!(connector.row_count(), 25);
    }

    #[tokio::test]
    async fn stops_at_max_records() {
        let connector = MemoryConnector::default();
        let orchestrator = PipelineOrchestrator::new(connector.clone());
        let mut feed = BufferedFeed::new(trials(50));

        let report = orchestrator
            .drive(&mut feed, RunLimits { max_records: 12, batch_size: 5 })
            .await;
        assert_eq!(report.fetched, 12);
        assert_eq!(report.written, 12);
        assert_eq!(report.batches, 3);
        assert!(feed.next_trial().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn feed_error_flushes_buffer_and_is_reported() {
        let connector = MemoryConnector::default();
        let orchestrator = PipelineOrchestrator::new(connector.clone());
        let mut feed = FailingFeed {
            items: trials(7).into_iter(),
        };

        let report = orchestrator
            .drive(&mut feed, RunLimits { max_records: 100, batch_size: 5 })
            .await;
        assert_eq!(report.fetched, 7);
        assert_eq!(report.written, 7);
        assert_eq!(report.batches, 2);
        assert!(report.error.unwrap().contains("studies is not an array"));
    }

    #[tokio::test]
    async fn write_failures_still_produce_a_report() {
        let connector = MemoryConnector {
            fail_connect: true,
            ..Default::default()
        };
        let orchestrator = PipelineOrchestrator::new(connector);
        let mut feed = BufferedFeed::new(trials(4));
        let report = orchestrator
            .drive(&mut feed, RunLimits { max_records: 10, batch_size: 2 })
            .await;
        assert_eq!(report.fetched, 4);
        assert_eq!(report.written, 0);
        assert_eq!(report.batches, 2);
    }

    #[tokio::test]
    async fn load_export_writes_eu_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ctis_2026-10-15.csv");
        tokio::fs::write(
            &path,
            "Trial number,Title of the trial,Overall trial status\n\
             2024-500001-11-00,First,Ongoing\n\
             2024-500002-22-00,Second,Ended\n\
             ,Nameless,Ended\n",
        )
        .await
        .unwrap();

        let connector = MemoryConnector::default();
        let report = PipelineOrchestrator::new(connector.clone())
            .load_export(&path, RunLimits::default())
            .await
            .unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(
            connector.row(&CTIS_TABLE, "2024-500002-22-00").unwrap().status,
            "Ended"
        );
    }

    #[test]
    fn config_defaults_and_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/trials"),
            ("CTG_RPS", "2.5"),
            ("TRIALWATCH_HEADLESS", "false"),
            ("ARTIFACTS_DIR", ""),
        ]);
        let config = TrialwatchConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.ctg_rps, 2.5);
        assert_eq!(config.ctg_page_size, 50);
        assert_eq!(config.ctg_endpoint, DEFAULT_CTGOV_ENDPOINT);
        assert!(!config.headless);
        assert_eq!(config.artifacts_dir, PathBuf::from("./downloads"));
        assert_eq!(config.harvest_cron, DEFAULT_HARVEST_CRON);

        let db = config.database().unwrap();
        assert_eq!(db.connect_timeout, Duration::from_secs(10));
        assert_eq!(db.application_name, "trialwatch");
        assert_eq!(config.harvest().unwrap().download_timeout, Duration::from_secs(90));
    }

    #[test]
    fn missing_database_url_is_reported() {
        let config = TrialwatchConfig::from_lookup(|_| None).unwrap();
        assert!(matches!(config.database(), Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = TrialwatchConfig::from_lookup(|k| (k == "CTG_PAGE_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "CTG_PAGE_SIZE", .. }));
    }

    #[test]
    fn selectors_load_from_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("selectors.yaml");
        std::fs::write(&path, "download: \"a#export-csv\"\n").unwrap();
        let selectors = load_selectors(&path).unwrap();
        assert_eq!(selectors.download, "a#export-csv");
        assert_eq!(selectors.cookie_consent, ExportSelectors::default().cookie_consent);

        let missing = load_selectors(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Selectors { .. }));
    }

    struct BrokenLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl BrowserLauncher for BrokenLauncher {
        async fn launch(&self) -> Result<Box<dyn BrowserSession>, AutomationError> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Err(AutomationError::Launch("chromium missing".to_string()))
        }
    }

    fn harvester(dir: &Path) -> ExportHarvester<BrokenLauncher> {
        let quick = BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: Duration::from_millis(2),
        };
        ExportHarvester::new(
            BrokenLauncher {
                launches: AtomicUsize::new(0),
            },
            HarvestConfig {
                artifacts_dir: dir.join("downloads"),
                harvest_backoff: quick,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn invocation_publishes_existing_artifact() {
        let dir = tempdir().unwrap();
        let harvester = harvester(dir.path());
        let target = ExportHarvester::<BrokenLauncher>::target_date();
        let store = harvester.artifact_store();
        store.ensure_root().await.unwrap();
        tokio::fs::write(store.artifact_path(target), b"Trial number\n1\n")
            .await
            .unwrap();

        let sink = FsArtifactSink::new(dir.path().join("published"));
        let response = invoke_harvest(&harvester, &sink, json!({"source": "test"})).await;
        assert_eq!(response.status_code, 200);
        assert!(response.body["reference"].as_str().unwrap().starts_with("file://"));
        assert_eq!(response.body["event"]["source"], "test");
        assert_eq!(harvester_launches(&harvester), 0);
    }

    #[tokio::test]
    async fn invocation_reports_failures_as_500() {
        let dir = tempdir().unwrap();
        let harvester = harvester(dir.path());
        let sink = FsArtifactSink::new(dir.path().join("published"));

        let response = invoke_harvest(&harvester, &sink, JsonValue::Null).await;
        assert_eq!(response.status_code, 500);
        assert!(response.body["error"].as_str().unwrap().contains("chromium missing"));
        assert!(response.body["timestamp"].is_string());
        assert_eq!(harvester_launches(&harvester), 2);
    }

    fn harvester_launches(harvester: &ExportHarvester<BrokenLauncher>) -> usize {
        harvester.launcher().launches.load(Ordering::SeqCst)
    }

    #[tokio::test]
    async fn scheduler_rejects_bad_cron() {
        let dir = tempdir().unwrap();
        let harvester = Arc::new(harvester(dir.path()));
        let sink: Arc<dyn ArtifactSink> = Arc::new(FsArtifactSink::new(dir.path()));

        assert!(HarvestScheduler::new(DEFAULT_HARVEST_CRON, harvester.clone(), sink.clone())
            .await
            .is_ok());
        assert!(HarvestScheduler::new("every morning", harvester, sink).await.is_err());
    }
}

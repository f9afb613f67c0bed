//! EU CTIS export harvesting: drive the public search UI through a browser
//! session, capture the CSV download and store it in the day-keyed slot.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::Deserialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use trialwatch_core::UnifiedTrial;
use trialwatch_storage::{retry_with_backoff, ArtifactStore, BackoffPolicy, HarvestArtifact, IsRetryable};

use crate::AdapterError;

pub const DEFAULT_CTIS_SEARCH_URL: &str = "https://euclinicaltrials.eu/search-for-clinical-trials";
pub const ARTIFACT_PREFIX: &str = "ctis";
pub const EXPORT_EXTENSION: &str = ".csv";
pub const DOWNLOAD_MARKER: &str = "download";

const UI_DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("failed to start browser driver: {0}")]
    Launch(String),
    #[error("browser driver exited unexpectedly")]
    DriverExited,
    #[error("browser driver protocol error: {0}")]
    Protocol(String),
    #[error("step `{step}` timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },
    #[error("step `{step}` failed: {message}")]
    Step { step: String, message: String },
    #[error("browser driver io: {0}")]
    Io(#[from] std::io::Error),
}

impl IsRetryable for AutomationError {
    fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Automation(#[from] AutomationError),
    #[error(
        "export download did not complete within {timeout:?} (observed export request: {})",
        .observed_url.as_deref().unwrap_or("none")
    )]
    DownloadTimeout {
        timeout: Duration,
        observed_url: Option<String>,
    },
    #[error("artifact storage failed: {0:#}")]
    Storage(anyhow::Error),
    #[error("harvest misconfigured: {0}")]
    Config(String),
}

impl IsRetryable for HarvestError {
    fn is_retryable(&self) -> bool {
        !matches!(self, HarvestError::Config(_))
    }
}

/// One live browser page. Methods take `&self` so a session can be shared
/// with retry closures; implementations serialise commands internally.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn goto(&self, url: &str, timeout: Duration) -> Result<(), AutomationError>;
    /// Number of elements currently matching `selector`. Never waits.
    async fn count(&self, selector: &str) -> Result<usize, AutomationError>;
    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), AutomationError>;
    async fn fill(&self, selector: &str, value: &str, timeout: Duration) -> Result<(), AutomationError>;
    async fn press(&self, selector: &str, key: &str, timeout: Duration) -> Result<(), AutomationError>;
    /// Start recording the URL of every outbound request.
    async fn capture_requests(&self) -> Result<(), AutomationError>;
    async fn captured_requests(&self) -> Result<Vec<String>, AutomationError>;
    /// Register the download listener. Must be called before the action
    /// that triggers the download.
    async fn arm_download(&self, timeout: Duration) -> Result<(), AutomationError>;
    /// Wait for the armed download and save it to `save_to`.
    async fn await_download(&self, save_to: &Path) -> Result<PathBuf, AutomationError>;
    async fn close(&self) -> Result<(), AutomationError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn BrowserSession>, AutomationError>;
}

/// CSS/text selectors for the search UI controls touched by the harvest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExportSelectors {
    pub cookie_consent: String,
    pub advanced_filters: String,
    pub last_updated: String,
    pub date_input: String,
    pub download: String,
}

impl Default for ExportSelectors {
    fn default() -> Self {
        Self {
            cookie_consent: "button:has-text('Accept all cookies')".to_string(),
            advanced_filters: "button:has-text('Advanced filters')".to_string(),
            last_updated: "label:has-text('Last updated')".to_string(),
            date_input: "input[placeholder='DD/MM/YYYY']".to_string(),
            download: "button:has-text('Download CSV')".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub search_url: String,
    pub artifacts_dir: PathBuf,
    pub selectors: ExportSelectors,
    pub navigation_timeout: Duration,
    pub step_timeout: Duration,
    pub download_timeout: Duration,
    /// Pause after UI interactions that trigger client-side re-rendering.
    pub settle_delay: Duration,
    pub navigation_backoff: BackoffPolicy,
    pub harvest_backoff: BackoffPolicy,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_CTIS_SEARCH_URL.to_string(),
            artifacts_dir: PathBuf::from("./downloads"),
            selectors: ExportSelectors::default(),
            navigation_timeout: Duration::from_secs(60),
            step_timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(90),
            settle_delay: Duration::from_secs(2),
            navigation_backoff: BackoffPolicy::navigation(),
            harvest_backoff: BackoffPolicy::harvest(),
        }
    }
}

/// True for request URLs that look like the CSV export payload.
pub fn is_export_request(url: &str) -> bool {
    let lowered = url.to_ascii_lowercase();
    let without_query = lowered
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or_default();
    lowered.contains(DOWNLOAD_MARKER) && without_query.ends_with(EXPORT_EXTENSION)
}

pub struct ExportHarvester<L> {
    launcher: L,
    store: ArtifactStore,
    config: HarvestConfig,
}

impl<L: BrowserLauncher> ExportHarvester<L> {
    pub fn new(launcher: L, config: HarvestConfig) -> Self {
        let store = ArtifactStore::new(&config.artifacts_dir, ARTIFACT_PREFIX, EXPORT_EXTENSION);
        Self {
            launcher,
            store,
            config,
        }
    }

    pub fn artifact_store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// The day a scheduled harvest covers: yesterday, local time.
    pub fn target_date() -> NaiveDate {
        let today = Local::now().date_naive();
        today.pred_opt().unwrap_or(today)
    }

    pub async fn harvest(&self) -> Result<HarvestArtifact, HarvestError> {
        self.harvest_for(Self::target_date()).await
    }

    /// Harvest the export for `date`. Returns the existing artifact without
    /// launching a browser when the date was already harvested.
    pub async fn harvest_for(&self, date: NaiveDate) -> Result<HarvestArtifact, HarvestError> {
        if self.config.search_url.trim().is_empty() {
            return Err(HarvestError::Config("search url is empty".to_string()));
        }

        let span = info_span!("harvest", %date);
        let mut attempt = 0u32;
        retry_with_backoff(&self.config.harvest_backoff, "ctis_harvest", || {
            attempt += 1;
            self.attempt(date)
                .instrument(info_span!("harvest_attempt", attempt))
        })
        .instrument(span)
        .await
    }

    async fn attempt(&self, date: NaiveDate) -> Result<HarvestArtifact, HarvestError> {
        if let Some(existing) = self.store.existing(date).await.map_err(HarvestError::Storage)? {
            info!(path = %existing.path.display(), "artifact already present, skipping harvest");
            return Ok(existing);
        }

        self.store.ensure_root().await.map_err(HarvestError::Storage)?;
        let staged = self.store.staging_path(date);

        let session = self.launcher.launch().await?;
        let outcome = self.drive(session.as_ref(), date, &staged).await;
        if let Err(err) = session.close().await {
            warn!(error = %err, "closing browser session failed");
        }

        match outcome {
            Ok(downloaded) => {
                let artifact = self
                    .store
                    .materialize(date, &downloaded)
                    .await
                    .map_err(HarvestError::Storage)?;
                info!(
                    path = %artifact.path.display(),
                    bytes = artifact.byte_size,
                    sha256 = %artifact.content_hash,
                    "export harvested"
                );
                Ok(artifact)
            }
            Err(err) => {
                let _ = tokio::fs::remove_file(&staged).await;
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        session: &dyn BrowserSession,
        date: NaiveDate,
        staged: &Path,
    ) -> Result<PathBuf, HarvestError> {
        let config = &self.config;
        let selectors = &config.selectors;
        let step = config.step_timeout;

        let url = config.search_url.as_str();
        let nav_timeout = config.navigation_timeout;
        retry_with_backoff(&config.navigation_backoff, "ctis_navigation", move || {
            session.goto(url, nav_timeout)
        })
        .await?;

        if session.count(&selectors.cookie_consent).await? > 0 {
            session.click(&selectors.cookie_consent, step).await?;
            tokio::time::sleep(config.settle_delay).await;
        } else {
            debug!("no cookie consent banner");
        }

        session.click(&selectors.advanced_filters, step).await?;
        session.click(&selectors.last_updated, step).await?;
        let ui_date = date.format(UI_DATE_FORMAT).to_string();
        session.fill(&selectors.date_input, &ui_date, step).await?;
        session.press(&selectors.date_input, "Enter", step).await?;
        tokio::time::sleep(config.settle_delay).await;

        session.capture_requests().await?;
        session.arm_download(config.download_timeout).await?;
        session.click(&selectors.download, step).await?;

        let waited = tokio::time::timeout(config.download_timeout, session.await_download(staged)).await;
        let observed_url = match session.captured_requests().await {
            Ok(urls) => urls.into_iter().find(|u| is_export_request(u)),
            Err(err) => {
                debug!(error = %err, "request log unavailable");
                None
            }
        };

        match waited {
            Ok(Ok(path)) => {
                if let Some(url) = &observed_url {
                    debug!(url, "export request observed");
                }
                Ok(path)
            }
            Ok(Err(AutomationError::Timeout { .. })) | Err(_) => Err(HarvestError::DownloadTimeout {
                timeout: config.download_timeout,
                observed_url,
            }),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}

/// Rows read back from a harvested export file.
#[derive(Debug)]
pub struct ExportRows {
    pub trials: Vec<UnifiedTrial>,
    pub dropped: usize,
}

/// Parse a harvested CSV export into unified records. Rows without a trial
/// number or that the CSV reader rejects are dropped and counted. Cells that
/// are not valid UTF-8 are decoded lossily.
pub async fn read_export_file(path: &Path) -> Result<ExportRows, AdapterError> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading export file {}", path.display()))?;

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers: Vec<String> = reader
        .byte_headers()?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut trials = Vec::new();
    let mut dropped = 0;
    for (line, record) in reader.byte_records().enumerate() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                dropped += 1;
                warn!(row = line + 2, error = %err, "unreadable export row");
                continue;
            }
        };
        let row: Map<String, JsonValue> = headers
            .iter()
            .zip(record.iter())
            .map(|(header, cell)| (header, String::from_utf8_lossy(cell)))
            .filter(|(_, cell)| !cell.trim().is_empty())
            .map(|(header, cell)| (header.clone(), JsonValue::String(cell.trim().to_string())))
            .collect();

        match UnifiedTrial::from_ctis(JsonValue::Object(row)) {
            Ok(trial) => trials.push(trial),
            Err(err) => {
                dropped += 1;
                warn!(row = line + 2, error = %err, "dropping export row");
            }
        }
    }

    Ok(ExportRows { trials, dropped })
}

//! Source adapters: the ClinicalTrials.gov cursor walker and the EU CTIS
//! export harvester.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use trialwatch_core::UnifiedTrial;
use trialwatch_storage::{FetchError, HttpFetcher};

pub mod harvest;
pub mod playwright;

pub use harvest::{
    read_export_file, BrowserLauncher, BrowserSession, ExportHarvester, ExportRows, ExportSelectors,
    HarvestConfig, HarvestError,
};
pub use playwright::PlaywrightLauncher;

pub const CRATE_NAME: &str = "trialwatch-adapters";

pub const DEFAULT_CTGOV_ENDPOINT: &str = "https://clinicaltrials.gov/api/v2/studies";
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Field projection requested on every registry page. Phase and date filters
/// are applied locally and never sent to the API.
pub const CTGOV_FIELDS: &[&str] = &[
    "NCTId",
    "BriefTitle",
    "OfficialTitle",
    "OverallStatus",
    "Phase",
    "Condition",
    "LastUpdatePostDate",
    "LocationCountry",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected page shape: {0}")]
    PageShape(String),
    #[error("reading export file: {0}")]
    Export(#[from] csv::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Pull-based source of unified records, consumed one at a time.
#[async_trait]
pub trait TrialFeed: Send {
    async fn next_trial(&mut self) -> Result<Option<UnifiedTrial>, AdapterError>;
}

/// Feed over records that are already in memory.
#[derive(Debug)]
pub struct BufferedFeed {
    items: std::vec::IntoIter<UnifiedTrial>,
}

impl BufferedFeed {
    pub fn new(items: Vec<UnifiedTrial>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

#[async_trait]
impl TrialFeed for BufferedFeed {
    async fn next_trial(&mut self) -> Result<Option<UnifiedTrial>, AdapterError> {
        Ok(self.items.next())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WalkQuery {
    pub condition: String,
    pub phase: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub page_size: u32,
}

impl WalkQuery {
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            phase: None,
            since: None,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_phase(mut self, phase: Option<String>) -> Self {
        self.phase = phase.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn accepts(&self, trial: &UnifiedTrial) -> bool {
        if let Some(phase) = self.phase.as_deref() {
            if !trial.has_phase(phase) {
                return false;
            }
        }
        match self.since {
            Some(cutoff) => trial.changed_since(cutoff),
            None => true,
        }
    }

    fn page_params(&self, cursor: Option<&str>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("query.cond", self.condition.clone()),
            ("pageSize", self.page_size.to_string()),
            ("fields", CTGOV_FIELDS.join(",")),
            ("format", "json".to_string()),
        ];
        if let Some(cursor) = cursor {
            params.push(("pageToken", cursor.to_string()));
        }
        params
    }
}

/// Client for the ClinicalTrials.gov v2 `studies` endpoint.
#[derive(Debug, Clone)]
pub struct CtgovClient {
    http: HttpFetcher,
    endpoint: String,
    page_interval: Duration,
}

impl CtgovClient {
    /// `requests_per_second` sets the pause between consecutive page requests.
    pub fn new(http: HttpFetcher, endpoint: impl Into<String>, requests_per_second: f64) -> Self {
        let page_interval = if requests_per_second.is_finite() && requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        };
        Self {
            http,
            endpoint: endpoint.into(),
            page_interval,
        }
    }

    pub fn page_interval(&self) -> Duration {
        self.page_interval
    }

    /// Start a fresh walk. Nothing is requested until the first pull.
    pub fn walk(&self, query: WalkQuery) -> TrialWalk<'_> {
        TrialWalk {
            client: self,
            query,
            cursor: None,
            buffered: VecDeque::new(),
            pages_fetched: 0,
            dropped: 0,
            finished: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovPage {
    #[serde(default)]
    studies: Vec<JsonValue>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Lazy cursor walk over the registry. Ends when a page arrives without a
/// `nextPageToken`, or after the first error.
#[derive(Debug)]
pub struct TrialWalk<'a> {
    client: &'a CtgovClient,
    query: WalkQuery,
    cursor: Option<String>,
    buffered: VecDeque<UnifiedTrial>,
    pages_fetched: usize,
    dropped: usize,
    finished: bool,
}

impl TrialWalk<'_> {
    pub async fn next_trial(&mut self) -> Result<Option<UnifiedTrial>, AdapterError> {
        loop {
            if let Some(trial) = self.buffered.pop_front() {
                return Ok(Some(trial));
            }
            if self.finished {
                return Ok(None);
            }
            if let Err(err) = self.fetch_page().await {
                self.finished = true;
                return Err(err);
            }
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Records discarded because they lacked a required field.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    async fn fetch_page(&mut self) -> Result<(), AdapterError> {
        if self.pages_fetched > 0 && !self.client.page_interval.is_zero() {
            tokio::time::sleep(self.client.page_interval).await;
        }

        let params = self.query.page_params(self.cursor.as_deref());
        let body = self
            .client
            .http
            .fetch_json(&self.client.endpoint, &params)
            .await?;
        self.pages_fetched += 1;

        let page: CtgovPage =
            serde_json::from_value(body).map_err(|e| AdapterError::PageShape(e.to_string()))?;
        let received = page.studies.len();

        for raw in page.studies {
            match UnifiedTrial::from_ctgov(raw) {
                Ok(trial) if self.query.accepts(&trial) => self.buffered.push_back(trial),
                Ok(_) => {}
                Err(err) => {
                    self.dropped += 1;
                    warn!(page = self.pages_fetched, error = %err, "dropping registry study");
                }
            }
        }

        self.cursor = page.next_page_token.filter(|t| !t.is_empty());
        self.finished = self.cursor.is_none();
        debug!(
            page = self.pages_fetched,
            received,
            kept = self.buffered.len(),
            more = !self.finished,
            "registry page processed"
        );
        Ok(())
    }
}

#[async_trait]
impl TrialFeed for TrialWalk<'_> {
    async fn next_trial(&mut self) -> Result<Option<UnifiedTrial>, AdapterError> {
        TrialWalk::next_trial(self).await
    }
}

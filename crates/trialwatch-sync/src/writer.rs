//! Idempotent persistence of unified trials: one multi-row upsert per batch,
//! falling back to per-record insert-or-ignore when the batch fails.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use trialwatch_core::{UnifiedTrial, SOURCE_CTGOV, SOURCE_CTIS};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

/// One bindable value of a [`TrialRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Key,
    Title,
    Status,
    Phase,
    Conditions,
    Countries,
    LastUpdated,
    Source,
    Url,
    Raw,
}

/// A per-source target table: its name, key and the fields it stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrialTable {
    pub name: &'static str,
    pub key_column: &'static str,
    pub countries_column: &'static str,
    pub fields: &'static [Field],
    /// Optional jsonb column receiving the source payload. Off unless the
    /// table was migrated to carry it.
    pub raw_column: Option<&'static str>,
}

pub const CTGOV_TABLE: TrialTable = TrialTable {
    name: "clinical_trials",
    key_column: "nct_id",
    countries_column: "locations",
    fields: &[
        Field::Key,
        Field::Title,
        Field::Status,
        Field::Phase,
        Field::Conditions,
        Field::Countries,
        Field::LastUpdated,
        Field::Source,
        Field::Url,
    ],
    raw_column: None,
};

pub const CTIS_TABLE: TrialTable = TrialTable {
    name: "eu_clinical_trials",
    key_column: "eu_ct_number",
    countries_column: "countries",
    fields: &[
        Field::Key,
        Field::Title,
        Field::Status,
        Field::Phase,
        Field::Countries,
        Field::LastUpdated,
        Field::Source,
    ],
    raw_column: None,
};

impl TrialTable {
    pub fn for_source(source: &str) -> Option<TrialTable> {
        match source {
            SOURCE_CTGOV => Some(CTGOV_TABLE),
            SOURCE_CTIS => Some(CTIS_TABLE),
            _ => None,
        }
    }

    /// Also write the source payload into `column`.
    pub const fn with_raw_column(mut self, column: &'static str) -> Self {
        self.raw_column = Some(column);
        self
    }

    /// Bound fields in insert order; the key comes first.
    pub fn bound_fields(&self) -> Vec<Field> {
        let mut fields = self.fields.to_vec();
        if self.raw_column.is_some() {
            fields.push(Field::Raw);
        }
        fields
    }

    pub fn column(&self, field: Field) -> &'static str {
        match field {
            Field::Key => self.key_column,
            Field::Title => "title",
            Field::Status => "status",
            Field::Phase => "phase",
            Field::Conditions => "conditions",
            Field::Countries => self.countries_column,
            Field::LastUpdated => "last_updated",
            Field::Source => "source",
            Field::Url => "url",
            Field::Raw => self.raw_column.unwrap_or("raw"),
        }
    }

    pub fn columns(&self) -> Vec<&'static str> {
        self.bound_fields().into_iter().map(|f| self.column(f)).collect()
    }

    fn max_rows_per_statement(&self) -> usize {
        MAX_BIND_PARAMS / self.bound_fields().len()
    }
}

/// Column values for one trial, ready to bind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialRow {
    pub id: String,
    pub title: Option<String>,
    pub status: String,
    pub phase: Option<String>,
    pub conditions: Vec<String>,
    pub countries: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub source: String,
    pub url: Option<String>,
    pub raw: JsonValue,
}

impl TrialRow {
    /// `written_at` stands in for `last_updated` when the trial carries no date.
    pub fn from_trial(trial: &UnifiedTrial, written_at: DateTime<Utc>) -> Self {
        let phase = (!trial.phases().is_empty()).then(|| trial.phases().join(", "));
        Self {
            id: trial.id().to_string(),
            title: trial.title().map(str::to_string),
            status: trial.status().to_string(),
            phase,
            conditions: trial.conditions().iter().cloned().collect(),
            countries: trial.countries().iter().cloned().collect(),
            last_updated: trial.last_changed().unwrap_or(written_at),
            source: trial.source().to_string(),
            url: trial.public_url(),
            raw: JsonValue::Object(trial.raw().clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub application_name: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database connection timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("statement failed: {0}")]
    Statement(#[from] sqlx::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Minimal statement interface the writer needs from a database connection.
#[async_trait]
pub trait TrialStore: Send {
    /// Upsert every row atomically: either all rows are applied or none.
    async fn upsert_batch(&mut self, table: &TrialTable, rows: &[TrialRow]) -> Result<(), StoreError>;
    /// Insert one row, leaving an existing row with the same key untouched.
    async fn insert_or_ignore(&mut self, table: &TrialTable, row: &TrialRow) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn TrialStore>, StoreError>;
}

/// Multi-row upsert overwriting every non-key column on conflict.
pub fn upsert_statement<'a>(table: &TrialTable, rows: &'a [TrialRow]) -> QueryBuilder<'a, Postgres> {
    let columns = table.columns();
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        table.name,
        columns.join(", ")
    ));

    let fields = table.bound_fields();
    builder.push_values(rows, |mut b, row| {
        for field in &fields {
            match field {
                Field::Key => b.push_bind(&row.id),
                Field::Title => b.push_bind(&row.title),
                Field::Status => b.push_bind(&row.status),
                Field::Phase => b.push_bind(&row.phase),
                Field::Conditions => b.push_bind(&row.conditions),
                Field::Countries => b.push_bind(&row.countries),
                Field::LastUpdated => b.push_bind(row.last_updated),
                Field::Source => b.push_bind(&row.source),
                Field::Url => b.push_bind(&row.url),
                Field::Raw => b.push_bind(&row.raw),
            };
        }
    });

    let assignments = columns[1..]
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    builder.push(format!(
        " ON CONFLICT ({}) DO UPDATE SET {assignments}",
        table.key_column
    ));
    builder
}

pub fn insert_ignore_sql(table: &TrialTable) -> String {
    let columns = table.columns();
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({placeholders}) ON CONFLICT ({}) DO NOTHING",
        table.name,
        columns.join(", "),
        table.key_column
    )
}

/// Opens one Postgres connection per `connect` call.
#[derive(Debug, Clone)]
pub struct PgConnector {
    config: DatabaseConfig,
}

impl PgConnector {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn TrialStore>, StoreError> {
        let options = PgConnectOptions::from_str(&self.config.url)
            .map_err(StoreError::Connect)?
            .application_name(&self.config.application_name);
        let conn = tokio::time::timeout(self.config.connect_timeout, PgConnection::connect_with(&options))
            .await
            .map_err(|_| StoreError::ConnectTimeout(self.config.connect_timeout))?
            .map_err(StoreError::Connect)?;
        Ok(Box::new(PgTrialStore { conn }))
    }
}

pub struct PgTrialStore {
    conn: PgConnection,
}

#[async_trait]
impl TrialStore for PgTrialStore {
    async fn upsert_batch(&mut self, table: &TrialTable, rows: &[TrialRow]) -> Result<(), StoreError> {
        let mut tx = self.conn.begin().await?;
        for chunk in rows.chunks(table.max_rows_per_statement()) {
            let mut builder = upsert_statement(table, chunk);
            let result = builder.build().execute(&mut *tx).await;
            if let Err(err) = result {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed batch failed");
                }
                return Err(err.into());
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_or_ignore(&mut self, table: &TrialTable, row: &TrialRow) -> Result<(), StoreError> {
        let sql = insert_ignore_sql(table);
        let mut query = sqlx::query(&sql);
        for field in table.bound_fields() {
            query = match field {
                Field::Key => query.bind(&row.id),
                Field::Title => query.bind(&row.title),
                Field::Status => query.bind(&row.status),
                Field::Phase => query.bind(&row.phase),
                Field::Conditions => query.bind(&row.conditions),
                Field::Countries => query.bind(&row.countries),
                Field::LastUpdated => query.bind(row.last_updated),
                Field::Source => query.bind(&row.source),
                Field::Url => query.bind(&row.url),
                Field::Raw => query.bind(&row.raw),
            };
        }
        query.execute(&mut self.conn).await?;
        Ok(())
    }
}

/// Collapse rows sharing an id, keeping the position of the first and the
/// values of the last occurrence.
fn collapse_duplicates(rows: Vec<TrialRow>) -> Vec<TrialRow> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<TrialRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.id) {
            Some(&slot) => unique[slot] = row,
            None => {
                index.insert(row.id.clone(), unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

/// Groups trials by their source table, preserving arrival order.
fn rows_by_table(trials: &[UnifiedTrial], written_at: DateTime<Utc>) -> Vec<(TrialTable, Vec<TrialRow>)> {
    let mut groups: Vec<(TrialTable, Vec<TrialRow>)> = Vec::new();
    for trial in trials {
        let Some(table) = TrialTable::for_source(trial.source()) else {
            warn!(trial_id = %trial.id(), source = %trial.source(), "no table for source, skipping");
            continue;
        };
        let row = TrialRow::from_trial(trial, written_at);
        match groups.iter_mut().find(|(t, _)| *t == table) {
            Some((_, rows)) => rows.push(row),
            None => groups.push((table, vec![row])),
        }
    }
    groups
        .into_iter()
        .map(|(table, rows)| (table, collapse_duplicates(rows)))
        .collect()
}

pub struct BatchUpsertWriter<C> {
    connector: C,
}

impl<C: StoreConnector> BatchUpsertWriter<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Persist `trials` and return how many rows were written. Never fails:
    /// a connection error yields 0 and per-record failures are skipped.
    pub async fn write(&self, trials: &[UnifiedTrial]) -> usize {
        if trials.is_empty() {
            return 0;
        }

        let mut store = match self.connector.connect().await {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, records = trials.len(), "cannot open store, batch not written");
                return 0;
            }
        };

        let mut written = 0;
        for (table, rows) in rows_by_table(trials, Utc::now()) {
            match store.upsert_batch(&table, &rows).await {
                Ok(()) => {
                    debug!(table = table.name, rows = rows.len(), "batch upserted");
                    written += rows.len();
                }
                Err(err) => {
                    warn!(
                        table = table.name,
                        rows = rows.len(),
                        error = %err,
                        "batch upsert failed, falling back to per-record inserts"
                    );
                    written += Self::write_each(store.as_mut(), &table, &rows).await;
                }
            }
        }
        written
    }

    async fn write_each(store: &mut dyn TrialStore, table: &TrialTable, rows: &[TrialRow]) -> usize {
        let mut written = 0;
        for row in rows {
            match store.insert_or_ignore(table, row).await {
                Ok(()) => written += 1,
                Err(err) => warn!(trial_id = %row.id, table = table.name, error = %err, "record insert failed"),
            }
        }
        info!(table = table.name, written, attempted = rows.len(), "per-record fallback finished");
        written
    }
}

//! Unified clinical-trial model and source payload mappers for trialwatch.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "trialwatch-core";

/// Provenance tag for records read from the ClinicalTrials.gov v2 API.
pub const SOURCE_CTGOV: &str = "clinicaltrials.gov";
/// Provenance tag for records read from the EU CTIS search export.
pub const SOURCE_CTIS: &str = "eu-ctis";

const CTGOV_STUDY_URL: &str = "https://clinicaltrials.gov/study";
const CTIS_STUDY_URL: &str = "https://euclinicaltrials.eu/search-for-clinical-trials/?lang=en&EUCT=";

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Unvalidated field values handed to [`UnifiedTrial::new`].
#[derive(Debug, Clone, Default)]
pub struct TrialParts {
    pub id: String,
    pub title: Option<String>,
    pub status: String,
    pub phases: Vec<String>,
    pub conditions: Vec<String>,
    pub countries: Vec<String>,
    pub last_changed: Option<DateTime<Utc>>,
    pub source: String,
    pub raw: Map<String, JsonValue>,
}

/// Canonical cross-source trial representation.
///
/// Built once from a single source payload and never mutated afterwards.
/// `id` and `source` are guaranteed non-empty; every other field falls back
/// to an empty or absent value when the source omits it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnifiedTrial {
    id: String,
    title: Option<String>,
    status: String,
    phases: Vec<String>,
    conditions: BTreeSet<String>,
    countries: BTreeSet<String>,
    last_changed: Option<DateTime<Utc>>,
    source: String,
    raw: Map<String, JsonValue>,
}

impl UnifiedTrial {
    pub fn new(parts: TrialParts) -> Result<Self, ModelError> {
        let id = parts.id.trim().to_string();
        if id.is_empty() {
            return Err(ModelError::MissingField("id"));
        }
        let source = parts.source.trim().to_string();
        if source.is_empty() {
            return Err(ModelError::MissingField("source"));
        }

        Ok(Self {
            id,
            title: parts.title.filter(|t| !t.trim().is_empty()),
            status: parts.status,
            phases: clean_items(parts.phases).collect(),
            conditions: clean_items(parts.conditions).collect(),
            countries: clean_items(parts.countries).collect(),
            last_changed: parts.last_changed,
            source,
            raw: parts.raw,
        })
    }

    /// Map one study object from the ClinicalTrials.gov v2 `studies` array.
    pub fn from_ctgov(raw: JsonValue) -> Result<Self, ModelError> {
        let study = CtgovStudy::deserialize(&raw)?;
        let JsonValue::Object(raw) = raw else {
            return Err(ModelError::NotAnObject);
        };
        let protocol = study.protocol_section;
        let ident = &protocol.identification_module;

        Self::new(TrialParts {
            id: ident.nct_id.clone().unwrap_or_default(),
            title: first_non_empty([ident.brief_title.as_deref(), ident.official_title.as_deref()]),
            status: protocol.overall_status().to_string(),
            phases: protocol.phases().to_vec(),
            conditions: protocol.conditions().to_vec(),
            countries: protocol.countries().map(str::to_string).collect(),
            last_changed: protocol.last_changed(),
            source: SOURCE_CTGOV.to_string(),
            raw,
        })
    }

    /// Map one EU CTIS entry. Accepts both the JSON entry shape and a row of
    /// the CSV search export keyed by its column headers.
    pub fn from_ctis(raw: JsonValue) -> Result<Self, ModelError> {
        let entry = CtisEntry::deserialize(&raw)?;
        let JsonValue::Object(raw) = raw else {
            return Err(ModelError::NotAnObject);
        };

        Self::new(TrialParts {
            id: entry.trial_id.unwrap_or_default(),
            title: first_non_empty([entry.title.as_deref(), entry.short_title.as_deref()]),
            status: entry.status.unwrap_or_default(),
            phases: entry.phases.0,
            conditions: entry.conditions.0,
            countries: entry.countries.0,
            last_changed: entry.last_updated.as_deref().and_then(parse_permissive_timestamp),
            source: SOURCE_CTIS.to_string(),
            raw,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn phases(&self) -> &[String] {
        &self.phases
    }

    pub fn conditions(&self) -> &BTreeSet<String> {
        &self.conditions
    }

    pub fn countries(&self) -> &BTreeSet<String> {
        &self.countries
    }

    pub fn last_changed(&self) -> Option<DateTime<Utc>> {
        self.last_changed
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn raw(&self) -> &Map<String, JsonValue> {
        &self.raw
    }

    /// True when any phase label equals `wanted` after canonicalisation.
    pub fn has_phase(&self, wanted: &str) -> bool {
        let wanted = canonical_phase(wanted);
        self.phases.iter().any(|p| canonical_phase(p) == wanted)
    }

    /// A record without a parseable date is never considered stale.
    pub fn changed_since(&self, cutoff: DateTime<Utc>) -> bool {
        match self.last_changed {
            Some(ts) => ts >= cutoff,
            None => true,
        }
    }

    pub fn public_url(&self) -> Option<String> {
        match self.source.as_str() {
            SOURCE_CTGOV => Some(format!("{CTGOV_STUDY_URL}/{}", self.id)),
            SOURCE_CTIS => Some(format!("{CTIS_STUDY_URL}{}", self.id)),
            _ => None,
        }
    }
}

/// Upper-cased alphanumerics with the word `PHASE` removed, so `"2"`,
/// `"Phase 2"` and `"PHASE2"` compare equal.
pub fn canonical_phase(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect::<String>()
        .replace("PHASE", "")
}

/// Parse the date formats the sources are known to emit. Unrecognised input
/// yields `None` instead of an error.
pub fn parse_permissive_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let text = input.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(text, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|n| n.and_utc());
        }
    }
    // ClinicalTrials.gov reports some dates with month precision only.
    NaiveDate::parse_from_str(&format!("{text}-01"), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|n| n.and_utc())
}

fn clean_items(items: Vec<String>) -> impl Iterator<Item = String> {
    items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn first_non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Deserialize `T`, falling back to `T::default()` when the value has an
/// unexpected shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CtgovStudy {
    #[serde(default, deserialize_with = "lenient")]
    protocol_section: ProtocolSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolSection {
    #[serde(default, deserialize_with = "lenient")]
    identification_module: IdentificationModule,
    #[serde(default, deserialize_with = "lenient")]
    status_module: Option<StatusModule>,
    #[serde(default, deserialize_with = "lenient")]
    design_module: Option<DesignModule>,
    #[serde(default, deserialize_with = "lenient")]
    conditions_module: Option<ConditionsModule>,
    #[serde(default, deserialize_with = "lenient")]
    contacts_locations_module: Option<ContactsLocationsModule>,
}

impl ProtocolSection {
    fn overall_status(&self) -> &str {
        self.status_module
            .as_ref()
            .and_then(|m| m.overall_status.as_deref())
            .unwrap_or_default()
    }

    fn phases(&self) -> &[String] {
        self.design_module
            .as_ref()
            .map(|m| m.phases.as_slice())
            .unwrap_or(&[])
    }

    fn conditions(&self) -> &[String] {
        self.conditions_module
            .as_ref()
            .map(|m| m.conditions.as_slice())
            .unwrap_or(&[])
    }

    fn countries(&self) -> impl Iterator<Item = &str> {
        self.contacts_locations_module
            .iter()
            .flat_map(|m| m.locations.iter())
            .filter_map(|loc| loc.country.as_deref())
    }

    fn last_changed(&self) -> Option<DateTime<Utc>> {
        let status = self.status_module.as_ref()?;
        [
            status
                .last_update_post_date_struct
                .as_ref()
                .and_then(|d| d.date.as_deref()),
            status.last_changed_date.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find_map(parse_permissive_timestamp)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentificationModule {
    #[serde(default, deserialize_with = "lenient")]
    nct_id: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    brief_title: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    official_title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusModule {
    #[serde(default, deserialize_with = "lenient")]
    overall_status: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    last_changed_date: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    last_update_post_date_struct: Option<DateStruct>,
}

#[derive(Debug, Default, Deserialize)]
struct DateStruct {
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DesignModule {
    #[serde(default, deserialize_with = "lenient")]
    phases: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ConditionsModule {
    #[serde(default, deserialize_with = "lenient")]
    conditions: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ContactsLocationsModule {
    #[serde(default, deserialize_with = "lenient")]
    locations: Vec<Location>,
}

#[derive(Debug, Default, Deserialize)]
struct Location {
    #[serde(default, deserialize_with = "lenient")]
    country: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CtisEntry {
    #[serde(default, alias = "trialId", alias = "ctNumber", alias = "Trial number", deserialize_with = "lenient")]
    trial_id: Option<String>,
    #[serde(default, alias = "Title of the trial", deserialize_with = "lenient")]
    title: Option<String>,
    #[serde(default, alias = "shortTitle", alias = "Short title", deserialize_with = "lenient")]
    short_title: Option<String>,
    #[serde(default, alias = "trialStatus", alias = "Overall trial status", deserialize_with = "lenient")]
    status: Option<String>,
    #[serde(default, alias = "trialPhase", alias = "Trial phase")]
    phases: ListCell,
    #[serde(default, alias = "medicalConditions", alias = "Medical conditions", alias = "Medical condition")]
    conditions: ListCell,
    #[serde(default, alias = "locations", alias = "Location(s)", alias = "Countries")]
    countries: ListCell,
    #[serde(default, alias = "lastUpdated", alias = "Last updated", deserialize_with = "lenient")]
    last_updated: Option<String>,
}

/// A list-valued cell: a JSON array, an array of `{country|name}` objects, or
/// a `;` separated string as found in the CSV export. Commas stay inside
/// values such as "Korea, Republic of".
#[derive(Debug, Default)]
struct ListCell(Vec<String>);

impl<'de> Deserialize<'de> for ListCell {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = JsonValue::deserialize(deserializer)?;
        Ok(Self(list_from_value(&value)))
    }
}

fn list_from_value(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(text) => split_cell(text),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Object(obj) => obj
                    .get("country")
                    .or_else(|| obj.get("name"))
                    .and_then(JsonValue::as_str)
                    .map(str::to_string),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn split_cell(text: &str) -> Vec<String> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

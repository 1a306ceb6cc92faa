use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{PipelineError, PipelineResult};

/// Canonical three-letter country identifier (upper-case ISO alpha-3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CountryCode(String);

impl CountryCode {
    /// Accepts exactly three ASCII letters; normalizes to upper case.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.len() == 3 && raw.chars().all(|c| c.is_ascii_alphabetic()) {
            Some(CountryCode(raw.to_ascii_uppercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parsed global-event record from a daily bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub countries: BTreeSet<CountryCode>,
    pub tone: f64,
    pub themes: BTreeSet<String>,
}

/// Per-day fetch bookkeeping. Parse failures are counted, never surfaced.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FetchStats {
    pub bundles_ok: u32,
    pub bundles_failed: u32,
    pub rows_parsed: u64,
    pub rows_dropped: u64,
}

impl FetchStats {
    pub fn absorb(&mut self, other: FetchStats) {
        self.bundles_ok += other.bundles_ok;
        self.bundles_failed += other.bundles_failed;
        self.rows_parsed += other.rows_parsed;
        self.rows_dropped += other.rows_dropped;
    }
}

/// All event records for one calendar day plus fetch bookkeeping.
#[derive(Debug, Clone)]
pub struct DayEvents {
    pub date: NaiveDate,
    pub records: Vec<EventRecord>,
    pub stats: FetchStats,
}

/// Fixed enumerated theme categories for aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThemeCategory {
    Energy,
    Conflict,
    Sanctions,
    Trade,
    Economy,
    Policy,
}

pub const THEME_COUNT: usize = 6;

impl ThemeCategory {
    pub const ALL: [ThemeCategory; THEME_COUNT] = [
        ThemeCategory::Energy,
        ThemeCategory::Conflict,
        ThemeCategory::Sanctions,
        ThemeCategory::Trade,
        ThemeCategory::Economy,
        ThemeCategory::Policy,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ThemeCategory::Energy => "energy",
            ThemeCategory::Conflict => "conflict",
            ThemeCategory::Sanctions => "sanctions",
            ThemeCategory::Trade => "trade",
            ThemeCategory::Economy => "economy",
            ThemeCategory::Policy => "policy",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

/// Country×day aggregate of event records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedEvent {
    pub country: CountryCode,
    pub date: NaiveDate,
    pub event_count: u32,
    pub avg_tone: f64,
    pub tone_std: f64,
    pub unique_sources: u32,
    /// Indexed by `ThemeCategory::index()`. Themes overlap, so the sum may
    /// exceed `event_count`.
    pub theme_counts: [u32; THEME_COUNT],
}

/// One trading day of spot closes. Non-trading days are absent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub wti_close: f64,
    pub brent_close: f64,
}

/// Inner-joined WTI/Brent series. `stale` marks a cached snapshot served
/// after an upstream failure.
#[derive(Debug, Clone)]
pub struct PriceSeries {
    pub points: Vec<PricePoint>,
    pub stale: bool,
}

/// One `(country, date)` cell of the canonical grid: event aggregates
/// (zero-filled when the day was silent) plus forward-filled prices.
#[derive(Debug, Clone)]
pub struct AlignedRow {
    pub country: CountryCode,
    pub date: NaiveDate,
    pub event_count: u32,
    pub avg_tone: f64,
    pub tone_std: f64,
    pub unique_sources: u32,
    pub theme_counts: [u32; THEME_COUNT],
    pub wti_price: f64,
    pub brent_price: f64,
    /// True when the prices were carried from a prior trading day.
    pub price_filled: bool,
}

/// Derived feature vector for one `(country, date)`, ordered by the
/// canonical feature-name list.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub country: CountryCode,
    pub date: NaiveDate,
    pub values: Vec<f64>,
}

/// Immutable per-day publication of feature rows.
#[derive(Debug, Clone)]
pub struct ProcessedDataset {
    pub target_date: NaiveDate,
    pub feature_names: Vec<String>,
    pub rows: Vec<FeatureRow>,
}

impl ProcessedDataset {
    pub fn new(
        target_date: NaiveDate,
        feature_names: Vec<String>,
        rows: Vec<FeatureRow>,
    ) -> PipelineResult<Self> {
        for row in &rows {
            if row.values.len() != feature_names.len() {
                return Err(PipelineError::InternalInvariant(format!(
                    "feature row for ({}, {}) has {} values, expected {}",
                    row.country,
                    row.date,
                    row.values.len(),
                    feature_names.len()
                )));
            }
            if row.values.iter().any(|v| !v.is_finite()) {
                return Err(PipelineError::InternalInvariant(format!(
                    "non-finite feature value for ({}, {})",
                    row.country, row.date
                )));
            }
        }
        Ok(ProcessedDataset {
            target_date,
            feature_names,
            rows,
        })
    }

    /// Serializes to the wire payload: a JSON array of objects, one per row,
    /// keyed by the feature names plus `date` and `country`. serde_json
    /// orders object keys canonically, so equal datasets produce identical
    /// bytes.
    pub fn payload_bytes(&self) -> PipelineResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut obj = serde_json::Map::new();
            obj.insert(
                "date".to_string(),
                serde_json::Value::String(row.date.format("%Y-%m-%d").to_string()),
            );
            obj.insert(
                "country".to_string(),
                serde_json::Value::String(row.country.as_str().to_string()),
            );
            for (name, value) in self.feature_names.iter().zip(&row.values) {
                let number = serde_json::Number::from_f64(*value).ok_or_else(|| {
                    PipelineError::InternalInvariant(format!(
                        "non-finite value for '{name}' at ({}, {})",
                        row.country, row.date
                    ))
                })?;
                obj.insert(name.clone(), serde_json::Value::Number(number));
            }
            out.push(serde_json::Value::Object(obj));
        }
        Ok(serde_json::to_vec(&serde_json::Value::Array(out))?)
    }

    /// Rebuilds a dataset from the wire payload. Every row must carry
    /// exactly `expected_names` plus `date` and `country`, otherwise the
    /// payload is `Corrupt`.
    pub fn from_payload_bytes(
        bytes: &[u8],
        target_date: NaiveDate,
        expected_names: &[String],
    ) -> PipelineResult<Self> {
        let raw: Vec<BTreeMap<String, serde_json::Value>> = serde_json::from_slice(bytes)
            .map_err(|e| PipelineError::Corrupt(format!("payload is not a row array: {e}")))?;

        let mut rows = Vec::with_capacity(raw.len());
        for (i, obj) in raw.iter().enumerate() {
            if obj.len() != expected_names.len() + 2 {
                return Err(PipelineError::Corrupt(format!(
                    "row {i} has {} fields, expected {}",
                    obj.len(),
                    expected_names.len() + 2
                )));
            }
            let date = obj
                .get("date")
                .and_then(|v| v.as_str())
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
                .ok_or_else(|| PipelineError::Corrupt(format!("row {i} missing date")))?;
            let country = obj
                .get("country")
                .and_then(|v| v.as_str())
                .and_then(CountryCode::parse)
                .ok_or_else(|| PipelineError::Corrupt(format!("row {i} missing country")))?;

            let mut values = Vec::with_capacity(expected_names.len());
            for name in expected_names {
                let value = obj.get(name).and_then(|v| v.as_f64()).ok_or_else(|| {
                    PipelineError::Corrupt(format!("row {i} missing feature '{name}'"))
                })?;
                values.push(value);
            }
            rows.push(FeatureRow {
                country,
                date,
                values,
            });
        }

        ProcessedDataset::new(target_date, expected_names.to_vec(), rows)
    }

    /// sha256 of the canonical payload; the idempotency tag for a run.
    pub fn content_hash(&self) -> PipelineResult<String> {
        let bytes = self.payload_bytes()?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Latest date present in the dataset.
    pub fn last_date(&self) -> Option<NaiveDate> {
        self.rows.iter().map(|r| r.date).max()
    }

    /// Countries with fewer rows than the longest rolling window; their
    /// zero-filled history may mask cold-start effects.
    pub fn cold_start_countries(&self, min_rows: usize) -> Vec<CountryCode> {
        let mut counts: BTreeMap<&CountryCode, usize> = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(&row.country).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n < min_rows)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

/// Key and content hash of a published dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedArtifact {
    pub key: String,
    pub content_hash: String,
}

/// Per-country share of the aggregate prediction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CountryAttribution {
    pub raw_delta: f64,
    pub attention_weight: f64,
    pub contribution: f64,
    pub percentage: f64,
}

/// Output of the two-stage inference engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionReport {
    pub target_date: NaiveDate,
    pub reference_close: f64,
    pub predicted_delta: f64,
    pub predicted_close: f64,
    pub per_country: BTreeMap<CountryCode, CountryAttribution>,
    /// Countries ordered by |contribution| descending, truncated to the
    /// configured attribution count.
    pub top_contributors: Vec<CountryCode>,
    pub total_abs_contribution: f64,
    pub model_version: String,
    /// Countries in the universe that had no feature row or no regressor.
    pub skipped_countries: Vec<CountryCode>,
    /// Countries with under 30 rows of history; values are still zero-filled.
    pub cold_start_countries: Vec<CountryCode>,
}

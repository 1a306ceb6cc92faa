//! Daily WTI/Brent close fetcher.
//!
//! Both instruments are retrieved independently and inner-joined on date.
//! A rate-limit response or outage degrades to the last cached snapshot
//! when one exists and is under 24 hours old; the returned series is then
//! flagged stale.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use dashmap::DashMap;
use pipeline_core::{
    PipelineContext, PipelineError, PipelineResult, PricePoint, PriceSeries, PriceSource,
};
use std::collections::BTreeMap;
use std::time::Duration;

const SNAPSHOT_MAX_AGE_HOURS: i64 = 24;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instrument {
    Wti,
    Brent,
}

impl Instrument {
    pub fn function(&self) -> &'static str {
        match self {
            Instrument::Wti => "WTI",
            Instrument::Brent => "BRENT",
        }
    }
}

/// At-most-one cache entry per instrument.
#[derive(Debug, Clone)]
struct CachedSeries {
    points: Vec<(NaiveDate, f64)>,
    fetched_at: DateTime<Utc>,
}

pub struct PriceClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: DashMap<Instrument, CachedSeries>,
}

impl PriceClient {
    pub fn new(ctx: &PipelineContext) -> Self {
        let cfg = &ctx.config;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        PriceClient {
            client,
            base_url: cfg.price_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.price_api_key.clone(),
            cache: DashMap::new(),
        }
    }

    async fn fetch_instrument(&self, instrument: Instrument) -> PipelineResult<Vec<(NaiveDate, f64)>> {
        let url = format!("{}/query", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("function", instrument.function()),
                ("interval", "daily"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| PipelineError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Http(format!(
                "{} {}: HTTP {status}",
                instrument.function(),
                url
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Parse(e.to_string()))?;

        parse_daily_payload(&body, instrument)
    }

    /// Fetch with cache fallback: a fresh pull refreshes the snapshot; on a
    /// soft failure a snapshot under 24 h old is served flagged stale.
    async fn instrument_series(
        &self,
        instrument: Instrument,
    ) -> PipelineResult<(Vec<(NaiveDate, f64)>, bool)> {
        match self.fetch_instrument(instrument).await {
            Ok(points) => {
                self.cache.insert(
                    instrument,
                    CachedSeries {
                        points: points.clone(),
                        fetched_at: Utc::now(),
                    },
                );
                Ok((points, false))
            }
            Err(e) => {
                if let Some(entry) = self.cache.get(&instrument) {
                    let age = Utc::now() - entry.fetched_at;
                    if age.num_hours() < SNAPSHOT_MAX_AGE_HOURS {
                        tracing::warn!(
                            instrument = instrument.function(),
                            error = %e,
                            snapshot_age_hours = age.num_hours(),
                            "price fetch failed, serving cached snapshot"
                        );
                        return Ok((entry.points.clone(), true));
                    }
                }
                Err(PipelineError::UpstreamUnavailable(format!(
                    "{} price feed: {e}",
                    instrument.function()
                )))
            }
        }
    }
}

#[async_trait]
impl PriceSource for PriceClient {
    async fn fetch_prices(
        &self,
        end_date: NaiveDate,
        lookback_days: u32,
    ) -> PipelineResult<PriceSeries> {
        // Two instruments in parallel; each may independently fall back to
        // its snapshot.
        let (wti, brent) = tokio::join!(
            self.instrument_series(Instrument::Wti),
            self.instrument_series(Instrument::Brent)
        );
        let (wti, wti_stale) = wti?;
        let (brent, brent_stale) = brent?;

        let start = end_date
            .checked_sub_days(Days::new(lookback_days.saturating_sub(1) as u64))
            .unwrap_or(end_date);
        let points = inner_join(&wti, &brent, start, end_date);
        if points.is_empty() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "no joint WTI/Brent trading days in [{start}, {end_date}]"
            )));
        }

        Ok(PriceSeries {
            points,
            stale: wti_stale || brent_stale,
        })
    }
}

/// Parse a `{ "data": [{date, value}] }` daily payload. A top-level `Note`
/// or `Information` field is the upstream's rate-limit marker and must be
/// treated as a soft failure. Gap entries (non-numeric `value`) are skipped.
pub fn parse_daily_payload(
    body: &serde_json::Value,
    instrument: Instrument,
) -> PipelineResult<Vec<(NaiveDate, f64)>> {
    if body.get("Note").is_some() || body.get("Information").is_some() {
        return Err(PipelineError::UpstreamUnavailable(format!(
            "{} feed rate limited",
            instrument.function()
        )));
    }

    let data = body
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            PipelineError::Parse(format!("{} payload has no data array", instrument.function()))
        })?;

    let mut points = Vec::with_capacity(data.len());
    for entry in data {
        let Some(date) = entry
            .get("date")
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        else {
            continue;
        };
        // Values arrive as strings; the upstream writes "." for gaps.
        let value = match entry.get("value") {
            Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(serde_json::Value::Number(n)) => n.as_f64(),
            _ => None,
        };
        let Some(value) = value else { continue };
        if value <= 0.0 || !value.is_finite() {
            continue;
        }
        points.push((date, value));
    }

    points.sort_by_key(|(date, _)| *date);
    Ok(points)
}

/// Inner join the two instrument series on date, restricted to
/// `[start, end]`, ascending.
pub fn inner_join(
    wti: &[(NaiveDate, f64)],
    brent: &[(NaiveDate, f64)],
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<PricePoint> {
    let brent_by_date: BTreeMap<NaiveDate, f64> = brent.iter().copied().collect();
    wti.iter()
        .filter(|(date, _)| *date >= start && *date <= end)
        .filter_map(|(date, wti_close)| {
            brent_by_date.get(date).map(|brent_close| PricePoint {
                date: *date,
                wti_close: *wti_close,
                brent_close: *brent_close,
            })
        })
        .collect()
}

//! Daily global-event bundle fetcher.
//!
//! The upstream publishes 96 zipped tab-delimited bundles per day at
//! 15-minute boundaries. Individual bundle failures are recoverable; a day
//! only fails once fewer than the configured floor of bundles succeed.

pub mod parse;

use async_trait::async_trait;
use chrono::NaiveDate;
use futures_util::stream::{self, StreamExt};
use pipeline_core::{
    DayEvents, EventSource, FetchStats, PipelineContext, PipelineError, PipelineResult,
};
use std::time::Duration;

/// Bundles per day: one every 15 minutes.
pub const BUNDLES_PER_DAY: usize = 96;

pub struct GdeltClient {
    client: reqwest::Client,
    base_url: String,
    concurrency: usize,
    min_bundle_fraction: f64,
    bundle_timeout: Duration,
    day_timeout: Duration,
}

enum BundleOutcome {
    Ok { records: Vec<pipeline_core::EventRecord>, stats: FetchStats },
    Skipped,
}

impl GdeltClient {
    pub fn new(ctx: &PipelineContext) -> Self {
        let cfg = &ctx.config;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.bundle_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        GdeltClient {
            client,
            base_url: cfg.gdelt_base_url.trim_end_matches('/').to_string(),
            concurrency: cfg.event_bundle_concurrency.max(1),
            min_bundle_fraction: cfg.min_event_bundles_fraction,
            bundle_timeout: Duration::from_secs(cfg.bundle_timeout_secs),
            day_timeout: Duration::from_secs(cfg.day_timeout_secs),
        }
    }

    /// The 96 bundle ids for `date`, in `YYYYMMDDhhmmss` form.
    pub fn bundle_ids(date: NaiveDate) -> Vec<String> {
        let day = date.format("%Y%m%d").to_string();
        (0..BUNDLES_PER_DAY)
            .map(|slot| {
                let minutes = slot * 15;
                format!("{day}{:02}{:02}00", minutes / 60, minutes % 60)
            })
            .collect()
    }

    fn bundle_url(&self, bundle_id: &str) -> String {
        format!("{}/{}.gkg.csv.zip", self.base_url, bundle_id)
    }

    /// Download one bundle. 404 means the bundle was never published; 5xx is
    /// retried once. Both end up skipped, not failed.
    async fn download_bundle(&self, bundle_id: &str) -> PipelineResult<Vec<u8>> {
        let url = self.bundle_url(bundle_id);

        for attempt in 0..2u32 {
            let response = self
                .client
                .get(&url)
                .timeout(self.bundle_timeout)
                .send()
                .await
                .map_err(|e| PipelineError::Http(e.to_string()))?;

            let status = response.status();
            if status.as_u16() == 404 {
                return Err(PipelineError::NotFound(format!("bundle {bundle_id}")));
            }
            if status.is_server_error() && attempt == 0 {
                tracing::debug!(bundle_id, %status, "server error, retrying once");
                continue;
            }
            if !status.is_success() {
                return Err(PipelineError::Http(format!("{url}: HTTP {status}")));
            }

            let bytes = response
                .bytes()
                .await
                .map_err(|e| PipelineError::Http(e.to_string()))?;
            return Ok(bytes.to_vec());
        }

        Err(PipelineError::Http(format!("{url}: retries exhausted")))
    }

    async fn fetch_bundle(&self, bundle_id: &str, date: NaiveDate) -> BundleOutcome {
        let bytes = match self.download_bundle(bundle_id).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(bundle_id, error = %e, "skipping bundle");
                return BundleOutcome::Skipped;
            }
        };

        match parse::parse_bundle(&bytes, date) {
            Ok((records, stats)) => BundleOutcome::Ok { records, stats },
            Err(e) => {
                tracing::warn!(bundle_id, error = %e, "unreadable bundle, skipping");
                BundleOutcome::Skipped
            }
        }
    }

    async fn fetch_day_inner(&self, date: NaiveDate) -> PipelineResult<DayEvents> {
        let ids = Self::bundle_ids(date);

        let outcomes: Vec<BundleOutcome> = stream::iter(ids.iter().cloned())
            .map(|id| async move { self.fetch_bundle(&id, date).await })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut records = Vec::new();
        let mut stats = FetchStats::default();
        for outcome in outcomes {
            match outcome {
                BundleOutcome::Ok {
                    records: mut batch,
                    stats: bundle_stats,
                } => {
                    stats.bundles_ok += 1;
                    stats.absorb(bundle_stats);
                    records.append(&mut batch);
                }
                BundleOutcome::Skipped => stats.bundles_failed += 1,
            }
        }

        let floor = day_floor(BUNDLES_PER_DAY, self.min_bundle_fraction);
        if (stats.bundles_ok as usize) < floor {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "only {}/{} event bundles for {date} (floor {floor})",
                stats.bundles_ok, BUNDLES_PER_DAY
            )));
        }

        tracing::info!(
            %date,
            bundles_ok = stats.bundles_ok,
            bundles_failed = stats.bundles_failed,
            rows_parsed = stats.rows_parsed,
            rows_dropped = stats.rows_dropped,
            "event day fetched"
        );

        Ok(DayEvents {
            date,
            records,
            stats,
        })
    }
}

#[async_trait]
impl EventSource for GdeltClient {
    async fn fetch_day(&self, date: NaiveDate) -> PipelineResult<DayEvents> {
        match tokio::time::timeout(self.day_timeout, self.fetch_day_inner(date)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::UpstreamUnavailable(format!(
                "event fetch for {date} exceeded {}s wall clock",
                self.day_timeout.as_secs()
            ))),
        }
    }
}

/// Minimum successful bundles for a day to count.
pub fn day_floor(total: usize, fraction: f64) -> usize {
    (total as f64 * fraction).ceil() as usize
}

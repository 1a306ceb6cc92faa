//! Daily pipeline driver.
//!
//! One run walks `Pending -> FetchingEvents -> Aggregating ->
//! FetchingPrices -> Aligning -> Featurizing -> Publishing -> Done`;
//! soft and hard failures are terminal. Re-running a date with unchanged
//! upstream data reproduces the same content hash and atomically replaces
//! the artifact, so runs are idempotent. The in-flight guard is
//! process-local; across processes, correctness relies on the store's
//! atomic rename.

use chrono::{Days, NaiveDate, Utc};
use event_aggregator::aggregate;
use feature_pipeline::{align, engineer, feature_names};
use pipeline_core::{
    AggregatedEvent, ArtifactStore, CountryCode, EventSource, FetchStats, PipelineContext,
    PipelineError, PipelineResult, PriceSource, ProcessedDataset, PredictionReport,
    PublishedArtifact,
};
use prediction_engine::{predict, InferenceOptions, ModelLoader};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    FetchingEvents,
    Aggregating,
    FetchingPrices,
    Aligning,
    Featurizing,
    Publishing,
    Done,
    FailedSoft,
    FailedHard,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip publication; everything up to it still runs.
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub target_date: NaiveDate,
    pub state: RunState,
    pub published: Option<PublishedArtifact>,
    pub event_stats: FetchStats,
    pub price_stale: bool,
    pub clamped_values: u64,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }
}

#[derive(Debug, Clone)]
pub struct BackfillReport {
    pub succeeded: Vec<NaiveDate>,
    pub failed: Vec<(NaiveDate, String)>,
}

/// A prediction report plus staleness: when the newest run soft-failed,
/// `stale_as_of` carries the date of the last good publication.
#[derive(Debug, Clone)]
pub struct ReportEnvelope {
    pub report: PredictionReport,
    pub stale_as_of: Option<NaiveDate>,
}

pub struct Orchestrator<E, P, S> {
    ctx: PipelineContext,
    events: E,
    prices: P,
    store: S,
    loader: ModelLoader,
    /// At most one run per target date in flight in this process.
    in_flight: Mutex<BTreeSet<NaiveDate>>,
    /// Date of the most recent soft-failed run, cleared by the next success.
    last_soft_failure: Mutex<Option<NaiveDate>>,
}

struct InFlightGuard<'a> {
    set: &'a Mutex<BTreeSet<NaiveDate>>,
    date: NaiveDate,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.date);
    }
}

struct PipelineProduct {
    published: Option<PublishedArtifact>,
    event_stats: FetchStats,
    price_stale: bool,
    clamped_values: u64,
}

impl<E, P, S> Orchestrator<E, P, S>
where
    E: EventSource,
    P: PriceSource,
    S: ArtifactStore,
{
    pub fn new(ctx: PipelineContext, events: E, prices: P, store: S, loader: ModelLoader) -> Self {
        Orchestrator {
            ctx,
            events,
            prices,
            store,
            loader,
            in_flight: Mutex::new(BTreeSet::new()),
            last_soft_failure: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run the pipeline for `target_date` (default: yesterday UTC).
    pub async fn run(&self, target_date: Option<NaiveDate>, opts: RunOptions) -> RunOutcome {
        let target_date = target_date.unwrap_or_else(default_target_date);

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(target_date) {
                return RunOutcome {
                    target_date,
                    state: RunState::FailedSoft,
                    published: None,
                    event_stats: FetchStats::default(),
                    price_stale: false,
                    clamped_values: 0,
                    error: Some(format!("a run for {target_date} is already in flight")),
                };
            }
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            date: target_date,
        };

        transition(target_date, RunState::Pending);
        match self.run_inner(target_date, opts).await {
            Ok(product) => {
                transition(target_date, RunState::Done);
                *self.last_soft_failure.lock().unwrap() = None;
                RunOutcome {
                    target_date,
                    state: RunState::Done,
                    published: product.published,
                    event_stats: product.event_stats,
                    price_stale: product.price_stale,
                    clamped_values: product.clamped_values,
                    error: None,
                }
            }
            Err(e) => {
                let state = if e.is_soft() {
                    *self.last_soft_failure.lock().unwrap() = Some(target_date);
                    RunState::FailedSoft
                } else {
                    RunState::FailedHard
                };
                transition(target_date, state);
                tracing::error!(%target_date, error = %e, ?state, "pipeline run failed");
                RunOutcome {
                    target_date,
                    state,
                    published: None,
                    event_stats: FetchStats::default(),
                    price_stale: false,
                    clamped_values: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_inner(
        &self,
        target_date: NaiveDate,
        opts: RunOptions,
    ) -> PipelineResult<PipelineProduct> {
        let cfg = &self.ctx.config;

        // The universe comes from the trained adjacency axis, so grid and
        // model always agree.
        let bundle = self.loader.load(&cfg.model_run_id)?;
        let universe: BTreeSet<CountryCode> = bundle.metadata.countries.iter().cloned().collect();

        self.ctx.checkpoint()?;
        transition(target_date, RunState::FetchingEvents);

        let news_start = target_date
            .checked_sub_days(Days::new(cfg.news_lookback_days.saturating_sub(1) as u64))
            .unwrap_or(target_date);
        let mut aggregated: Vec<AggregatedEvent> = Vec::new();
        let mut event_stats = FetchStats::default();
        let mut day = news_start;
        while day <= target_date {
            self.ctx.checkpoint()?;
            match self.events.fetch_day(day).await {
                Ok(day_events) => {
                    event_stats.absorb(day_events.stats);
                    transition(target_date, RunState::Aggregating);
                    aggregated.extend(aggregate(&day_events.records, day, &universe));
                }
                // Missing history degrades to a zero day; a missing target
                // day fails the whole run.
                Err(e) if e.is_soft() && day != target_date => {
                    tracing::warn!(%day, error = %e, "no event data for window day");
                    event_stats.bundles_failed += gdelt_day_weight();
                }
                Err(e) => return Err(e),
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        self.ctx.checkpoint()?;
        transition(target_date, RunState::FetchingPrices);
        let price_series = self
            .prices
            .fetch_prices(target_date, cfg.lookback_days)
            .await?;

        self.ctx.checkpoint()?;
        transition(target_date, RunState::Aligning);
        let aligned = align(
            &aggregated,
            &price_series.points,
            &universe,
            target_date,
            cfg.lookback_days,
        );
        if aligned.is_empty() {
            return Err(PipelineError::UpstreamUnavailable(format!(
                "aligned grid for {target_date} is empty"
            )));
        }

        self.ctx.checkpoint()?;
        transition(target_date, RunState::Featurizing);
        let engineered = engineer(&aligned)?;
        let dataset = ProcessedDataset::new(target_date, feature_names(), engineered.rows)?;

        self.ctx.checkpoint()?;
        let published = if opts.dry_run {
            tracing::info!(%target_date, "dry run, skipping publication");
            None
        } else {
            transition(target_date, RunState::Publishing);
            Some(self.store.publish(&dataset).await?)
        };

        Ok(PipelineProduct {
            published,
            event_stats,
            price_stale: price_series.stale,
            clamped_values: engineered.clamped,
        })
    }

    /// Backfill `[start_date, end_date]` ascending. Individual day failures
    /// are recorded and do not stop the loop.
    pub async fn backfill(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        opts: RunOptions,
    ) -> BackfillReport {
        let mut report = BackfillReport {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        let mut day = start_date;
        while day <= end_date {
            if self.ctx.is_cancelled() {
                report
                    .failed
                    .push((day, PipelineError::Cancelled.to_string()));
                break;
            }
            let outcome = self.run(Some(day), opts).await;
            if outcome.is_success() {
                report.succeeded.push(day);
            } else {
                report
                    .failed
                    .push((day, outcome.error.unwrap_or_else(|| "unknown".to_string())));
            }
            day = match day.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        tracing::info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "backfill finished"
        );
        report
    }

    /// The most recent successful prediction. When the newest run
    /// soft-failed, the envelope is tagged with the date the data is stale
    /// as of.
    pub async fn latest_report(&self) -> PipelineResult<ReportEnvelope> {
        let (dataset_date, dataset) = self.store.load_latest().await?;
        let bundle = self.loader.load(&self.ctx.config.model_run_id)?;

        let opts = InferenceOptions {
            fallback_temperature: self.ctx.config.prediction_temperature,
            top_countries: self.ctx.config.top_countries_count,
        };
        let report = predict(&dataset, &bundle, &opts)?;

        let last_soft_failure = *self.last_soft_failure.lock().unwrap();
        let stale_as_of = last_soft_failure
            .filter(|failed| *failed > dataset_date)
            .map(|_| dataset_date);

        Ok(ReportEnvelope {
            report,
            stale_as_of,
        })
    }
}

/// Yesterday in UTC; the feed for the current day is still filling in.
pub fn default_target_date() -> NaiveDate {
    Utc::now()
        .date_naive()
        .pred_opt()
        .unwrap_or_else(|| Utc::now().date_naive())
}

/// Bundle count a fully missing day contributes to the failure tally.
fn gdelt_day_weight() -> u32 {
    96
}

fn transition(target_date: NaiveDate, state: RunState) {
    tracing::info!(%target_date, ?state, "state transition");
}

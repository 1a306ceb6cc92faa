use crate::error::{PipelineError, PipelineResult};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DEFAULT_GDELT_BASE_URL: &str = "http://data.gdeltproject.org/gkg";
const DEFAULT_PRICE_BASE_URL: &str = "https://www.alphavantage.co";

/// Pipeline configuration, loaded once from the environment and threaded
/// through every component inside a [`PipelineContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Root of the artifact store (bucket analog).
    pub data_dir: PathBuf,

    /// Key prefix for published datasets.
    pub processed_prefix: String,

    /// Key prefix for trained model bundles.
    pub models_prefix: String,

    /// Selects the ModelBundle to load.
    pub model_run_id: String,

    /// Trailing grid size in days.
    pub lookback_days: u32,

    /// Trailing window of event days fetched per run; covers the longest
    /// news lag and the theme z-score window.
    pub news_lookback_days: u32,

    /// Concurrent bundle downloads in the event fetcher.
    pub event_bundle_concurrency: usize,

    /// A day soft-fails when fewer than this fraction of bundles succeed.
    pub min_event_bundles_fraction: f64,

    /// Attention sharpness at inference.
    pub prediction_temperature: f64,

    /// Attribution truncation in prediction reports.
    pub top_countries_count: usize,

    /// Credentials for the daily-price service.
    pub price_api_key: String,

    pub gdelt_base_url: String,
    pub price_base_url: String,

    /// Per-bundle download timeout in seconds.
    pub bundle_timeout_secs: u64,

    /// Per-day wall-clock timeout for the event fetch in seconds.
    pub day_timeout_secs: u64,
}

impl PipelineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> PipelineResult<Self> {
        dotenv().ok();

        let data_dir = env::var("OIL_DATA_DIR")
            .map_err(|_| PipelineError::Config("OIL_DATA_DIR not set".to_string()))?;

        let price_api_key = env::var("PRICE_API_KEY")
            .map_err(|_| PipelineError::Config("PRICE_API_KEY not set".to_string()))?;

        let model_run_id = env::var("MODEL_RUN_ID")
            .map_err(|_| PipelineError::Config("MODEL_RUN_ID not set".to_string()))?;

        Ok(PipelineConfig {
            data_dir: PathBuf::from(data_dir),
            processed_prefix: env_or("PROCESSED_PREFIX", "processed_data/"),
            models_prefix: env_or("MODELS_PREFIX", "trained_models/"),
            model_run_id,
            lookback_days: parse_env("LOOKBACK_DAYS", 90)?,
            news_lookback_days: parse_env("NEWS_LOOKBACK_DAYS", 30)?,
            event_bundle_concurrency: parse_env("EVENT_BUNDLE_CONCURRENCY", 8)?,
            min_event_bundles_fraction: parse_env("MIN_EVENT_BUNDLES_FRACTION", 0.5)?,
            prediction_temperature: parse_env("PREDICTION_TEMPERATURE", 0.25)?,
            top_countries_count: parse_env("TOP_COUNTRIES_COUNT", 15)?,
            price_api_key,
            gdelt_base_url: env_or("GDELT_BASE_URL", DEFAULT_GDELT_BASE_URL),
            price_base_url: env_or("PRICE_BASE_URL", DEFAULT_PRICE_BASE_URL),
            bundle_timeout_secs: parse_env("BUNDLE_TIMEOUT_SECS", 30)?,
            day_timeout_secs: parse_env("DAY_TIMEOUT_SECS", 540)?,
        })
    }

    /// A config with defaults rooted at `data_dir` (for tests).
    pub fn default_with_dir(data_dir: PathBuf) -> Self {
        PipelineConfig {
            data_dir,
            processed_prefix: "processed_data/".to_string(),
            models_prefix: "trained_models/".to_string(),
            model_run_id: "latest".to_string(),
            lookback_days: 90,
            news_lookback_days: 30,
            event_bundle_concurrency: 8,
            min_event_bundles_fraction: 0.5,
            prediction_temperature: 0.25,
            top_countries_count: 15,
            price_api_key: String::new(),
            gdelt_base_url: DEFAULT_GDELT_BASE_URL.to_string(),
            price_base_url: DEFAULT_PRICE_BASE_URL.to_string(),
            bundle_timeout_secs: 30,
            day_timeout_secs: 540,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> PipelineResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| PipelineError::Config(format!("Invalid {key}: '{raw}'"))),
        Err(_) => Ok(default),
    }
}

/// Explicit replacement for process-wide singletons: owns the configuration
/// and the
/// cancellation flag, lives from process start to shutdown, and is handed
/// by reference to every component.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub config: PipelineConfig,
    cancelled: Arc<AtomicBool>,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig) -> Self {
        PipelineContext {
            config,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation; observed at the next state transition.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Errors with `Cancelled` once the flag is set. In-flight work is
    /// discarded; publication is all-or-nothing.
    pub fn checkpoint(&self) -> PipelineResult<()> {
        if self.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PipelineConfig::default_with_dir(PathBuf::from("/tmp/oilcast"));
        assert_eq!(cfg.lookback_days, 90);
        assert_eq!(cfg.event_bundle_concurrency, 8);
        assert!((cfg.min_event_bundles_fraction - 0.5).abs() < f64::EPSILON);
        assert!((cfg.prediction_temperature - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.top_countries_count, 15);
    }

    #[test]
    fn cancellation_checkpoint() {
        let ctx = PipelineContext::new(PipelineConfig::default_with_dir(PathBuf::from("/tmp")));
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel();
        assert!(matches!(ctx.checkpoint(), Err(PipelineError::Cancelled)));
    }
}

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::PipelineResult;
use crate::types::{DayEvents, PriceSeries, ProcessedDataset, PublishedArtifact};

/// Trait for daily global-event feeds.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn fetch_day(&self, date: NaiveDate) -> PipelineResult<DayEvents>;
}

/// Trait for daily spot-price feeds.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_prices(
        &self,
        end_date: NaiveDate,
        lookback_days: u32,
    ) -> PipelineResult<PriceSeries>;
}

/// Trait for the dated-dataset store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write-once with atomic replace on re-publication.
    async fn publish(&self, dataset: &ProcessedDataset) -> PipelineResult<PublishedArtifact>;

    /// The dataset under the lexicographically greatest key.
    async fn load_latest(&self) -> PipelineResult<(NaiveDate, ProcessedDataset)>;

    async fn load_for(&self, target_date: NaiveDate) -> PipelineResult<ProcessedDataset>;
}

//! Dated, content-addressed dataset store on a filesystem root.
//!
//! Keys sort by date, publication is write-to-temp plus rename, and the
//! latest dataset is simply the greatest key. Cross-process safety of
//! re-publication rests entirely on the atomic rename.

use async_trait::async_trait;
use chrono::NaiveDate;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use pipeline_core::{
    ArtifactStore, PipelineContext, PipelineError, PipelineResult, ProcessedDataset,
    PublishedArtifact,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

const KEY_STEM: &str = "final_aligned_data_";
const KEY_SUFFIX: &str = ".json.gz";

pub struct FsArtifactStore {
    root: PathBuf,
    prefix: String,
    feature_names: Vec<String>,
}

impl FsArtifactStore {
    /// `feature_names` pins the schema every loaded payload must match.
    pub fn new(ctx: &PipelineContext, feature_names: Vec<String>) -> Self {
        FsArtifactStore {
            root: ctx.config.data_dir.clone(),
            prefix: ctx.config.processed_prefix.clone(),
            feature_names,
        }
    }

    pub fn key_for(&self, target_date: NaiveDate) -> String {
        format!(
            "{}{KEY_STEM}{}{KEY_SUFFIX}",
            self.prefix,
            target_date.format("%Y%m%d")
        )
    }

    fn dir(&self) -> PathBuf {
        self.root.join(self.prefix.trim_end_matches('/'))
    }

    fn path_for(&self, target_date: NaiveDate) -> PathBuf {
        self.dir().join(format!(
            "{KEY_STEM}{}{KEY_SUFFIX}",
            target_date.format("%Y%m%d")
        ))
    }

    fn date_from_file_name(name: &str) -> Option<NaiveDate> {
        let digits = name.strip_prefix(KEY_STEM)?.strip_suffix(KEY_SUFFIX)?;
        NaiveDate::parse_from_str(digits, "%Y%m%d").ok()
    }

    fn decode(&self, path: &PathBuf, target_date: NaiveDate) -> PipelineResult<ProcessedDataset> {
        let compressed = fs::read(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipelineError::NotFound(format!("no dataset at {}", path.display()))
            }
            _ => PipelineError::Io(e),
        })?;

        let mut payload = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut payload)
            .map_err(|e| PipelineError::Corrupt(format!("{}: {e}", path.display())))?;

        ProcessedDataset::from_payload_bytes(&payload, target_date, &self.feature_names)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn publish(&self, dataset: &ProcessedDataset) -> PipelineResult<PublishedArtifact> {
        let payload = dataset.payload_bytes()?;
        let content_hash = hex::encode(Sha256::digest(&payload));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;

        let dir = self.dir();
        fs::create_dir_all(&dir)?;

        let path = self.path_for(dataset.target_date);
        let tmp = path.with_extension("gz.tmp");
        fs::write(&tmp, &compressed)?;
        fs::rename(&tmp, &path)?;

        let key = self.key_for(dataset.target_date);
        tracing::info!(%key, %content_hash, rows = dataset.rows.len(), "dataset published");

        Ok(PublishedArtifact { key, content_hash })
    }

    async fn load_latest(&self) -> PipelineResult<(NaiveDate, ProcessedDataset)> {
        let dir = self.dir();
        let entries = fs::read_dir(&dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                PipelineError::NotFound(format!("no datasets under {}", dir.display()))
            }
            _ => PipelineError::Io(e),
        })?;

        let mut latest: Option<(String, NaiveDate)> = None;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = Self::date_from_file_name(&name) else {
                continue;
            };
            // Keys are date-stamped, so the greatest key is the newest day.
            if latest.as_ref().map(|(n, _)| &name > n).unwrap_or(true) {
                latest = Some((name, date));
            }
        }

        let (_, date) = latest.ok_or_else(|| {
            PipelineError::NotFound(format!("no datasets under {}", dir.display()))
        })?;
        let dataset = self.decode(&self.path_for(date), date)?;
        Ok((date, dataset))
    }

    async fn load_for(&self, target_date: NaiveDate) -> PipelineResult<ProcessedDataset> {
        self.decode(&self.path_for(target_date), target_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::{CountryCode, FeatureRow, PipelineConfig};

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn store(root: &std::path::Path) -> FsArtifactStore {
        let ctx = PipelineContext::new(PipelineConfig::default_with_dir(root.to_path_buf()));
        FsArtifactStore::new(&ctx, vec!["wti_price".to_string(), "avg_tone".to_string()])
    }

    fn dataset(day: &str, wti: f64) -> ProcessedDataset {
        ProcessedDataset::new(
            date(day),
            vec!["wti_price".to_string(), "avg_tone".to_string()],
            vec![FeatureRow {
                country: CountryCode::parse("USA").unwrap(),
                date: date(day),
                values: vec![wti, 0.0],
            }],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn publish_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let ds = dataset("2025-03-10", 80.0);

        let published = store.publish(&ds).await.unwrap();
        assert_eq!(
            published.key,
            "processed_data/final_aligned_data_20250310.json.gz"
        );

        let loaded = store.load_for(date("2025-03-10")).await.unwrap();
        assert_eq!(loaded.rows, ds.rows);
        assert_eq!(loaded.content_hash().unwrap(), published.content_hash);
    }

    #[tokio::test]
    async fn republication_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let ds = dataset("2025-03-10", 80.0);

        let first = store.publish(&ds).await.unwrap();
        let second = store.publish(&ds).await.unwrap();
        assert_eq!(first.content_hash, second.content_hash);

        // Changed upstream data replaces the artifact atomically.
        let changed = dataset("2025-03-10", 81.0);
        let third = store.publish(&changed).await.unwrap();
        assert_ne!(third.content_hash, first.content_hash);
        let loaded = store.load_for(date("2025-03-10")).await.unwrap();
        assert_eq!(loaded.rows, changed.rows);
    }

    #[tokio::test]
    async fn load_latest_picks_greatest_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.publish(&dataset("2025-03-07", 79.5)).await.unwrap();
        store.publish(&dataset("2025-03-10", 80.0)).await.unwrap();

        let (latest_date, latest) = store.load_latest().await.unwrap();
        assert_eq!(latest_date, date("2025-03-10"));
        assert!((latest.rows[0].values[0] - 80.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn missing_dataset_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        assert!(matches!(
            store.load_for(date("2025-03-10")).await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            store.load_latest().await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn garbage_payload_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        let dir = tmp.path().join("processed_data");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("final_aligned_data_20250310.json.gz"), b"junk").unwrap();

        assert!(matches!(
            store.load_for(date("2025-03-10")).await,
            Err(PipelineError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn foreign_schema_is_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = store(tmp.path());
        writer.publish(&dataset("2025-03-10", 80.0)).await.unwrap();

        // A reader pinned to a different feature list must refuse the file.
        let ctx = PipelineContext::new(PipelineConfig::default_with_dir(tmp.path().to_path_buf()));
        let reader = FsArtifactStore::new(&ctx, vec!["wti_price".to_string()]);
        assert!(matches!(
            reader.load_for(date("2025-03-10")).await,
            Err(PipelineError::Corrupt(_))
        ));
    }
}

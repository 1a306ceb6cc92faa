//! Trained model bundle loading.
//!
//! A bundle is a `run_id` directory of per-country regressor JSON files, a
//! fitted feature scaler, an adjacency matrix over the universe, and the
//! metadata that pins feature order. Loads are memoized per context;
//! bundles are immutable and shared across concurrent inference calls.

use crate::regressor::Regressor;
use dashmap::DashMap;
use nalgebra::DMatrix;
use pipeline_core::{CountryCode, PipelineContext, PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const SUPPORTED_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub feature_names: Vec<String>,
    pub model_version: String,
    /// Attention sharpness; absent in older bundles, then the configured
    /// default applies.
    pub temperature: Option<f64>,
    pub countries: Vec<CountryCode>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SUPPORTED_SCHEMA_VERSION
}

/// Affine per-feature scaler fitted at training time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler {
    /// `(x - mean) / scale`, with zero scale passing the value through.
    pub fn transform(&self, features: &[f64]) -> Vec<f64> {
        features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (mean, scale))| {
                let divisor = if *scale == 0.0 { 1.0 } else { *scale };
                (x - mean) / divisor
            })
            .collect()
    }

    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.mean.len() != n_features || self.scale.len() != n_features {
            return Err(format!(
                "scaler covers {}/{} features, bundle has {n_features}",
                self.mean.len(),
                self.scale.len()
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub regressors: HashMap<CountryCode, Regressor>,
    pub scaler: FeatureScaler,
    /// Square over `metadata.countries`, value-typed and never mutated
    /// after load.
    pub adjacency: DMatrix<f64>,
    pub metadata: ModelMetadata,
}

impl ModelBundle {
    /// Sum of a country's adjacency row: its graph centrality.
    pub fn adjacency_row_sum(&self, country_index: usize) -> f64 {
        self.adjacency.row(country_index).iter().sum()
    }
}

pub struct ModelLoader {
    root: PathBuf,
    prefix: String,
    cache: DashMap<String, Arc<ModelBundle>>,
}

impl ModelLoader {
    pub fn new(ctx: &PipelineContext) -> Self {
        ModelLoader {
            root: ctx.config.data_dir.clone(),
            prefix: ctx.config.models_prefix.clone(),
            cache: DashMap::new(),
        }
    }

    /// Lazy and memoized: the first call per `run_id` reads the artifacts,
    /// later calls share the same immutable bundle.
    pub fn load(&self, run_id: &str) -> PipelineResult<Arc<ModelBundle>> {
        if let Some(bundle) = self.cache.get(run_id) {
            return Ok(bundle.clone());
        }

        let bundle = Arc::new(self.load_uncached(run_id)?);
        self.cache.insert(run_id.to_string(), bundle.clone());
        Ok(bundle)
    }

    fn artifacts_dir(&self, run_id: &str) -> PathBuf {
        self.root
            .join(self.prefix.trim_end_matches('/'))
            .join(run_id)
            .join("artifacts")
    }

    fn load_uncached(&self, run_id: &str) -> PipelineResult<ModelBundle> {
        let dir = self.artifacts_dir(run_id);
        if !dir.is_dir() {
            return Err(PipelineError::ModelMissing(format!(
                "run '{run_id}' has no artifacts at {}",
                dir.display()
            )));
        }

        let metadata: ModelMetadata = read_artifact(&dir.join("metadata.json"), run_id)?;
        if metadata.schema_version != SUPPORTED_SCHEMA_VERSION {
            return Err(PipelineError::ModelMissing(format!(
                "run '{run_id}' has schema version {}, supported is {SUPPORTED_SCHEMA_VERSION}",
                metadata.schema_version
            )));
        }
        if metadata.countries.is_empty() || metadata.feature_names.is_empty() {
            return Err(PipelineError::Corrupt(format!(
                "run '{run_id}' metadata declares no countries or features"
            )));
        }
        let n_features = metadata.feature_names.len();

        let scaler: FeatureScaler = read_artifact(&dir.join("scaler.json"), run_id)?;
        scaler
            .validate(n_features)
            .map_err(|e| PipelineError::Corrupt(format!("run '{run_id}': {e}")))?;

        let raw_adjacency: Vec<Vec<f64>> = read_artifact(&dir.join("adjacency.json"), run_id)?;
        let n = metadata.countries.len();
        if raw_adjacency.len() != n || raw_adjacency.iter().any(|row| row.len() != n) {
            return Err(PipelineError::Corrupt(format!(
                "run '{run_id}' adjacency is not {n}x{n}"
            )));
        }
        let adjacency =
            DMatrix::from_row_iterator(n, n, raw_adjacency.into_iter().flatten());

        let mut regressors = HashMap::new();
        for country in &metadata.countries {
            let path = dir.join(format!("{}.model.json", country.as_str()));
            if !path.is_file() {
                // The country is simply skipped at inference.
                tracing::warn!(run_id, country = %country, "no regressor artifact");
                continue;
            }
            let regressor: Regressor = read_artifact(&path, run_id)?;
            regressor
                .validate(n_features)
                .map_err(|e| PipelineError::Corrupt(format!("run '{run_id}' {country}: {e}")))?;
            regressors.insert(country.clone(), regressor);
        }
        if regressors.is_empty() {
            return Err(PipelineError::ModelMissing(format!(
                "run '{run_id}' has no regressor artifacts"
            )));
        }

        tracing::info!(
            run_id,
            countries = metadata.countries.len(),
            regressors = regressors.len(),
            version = %metadata.model_version,
            "model bundle loaded"
        );

        Ok(ModelBundle {
            regressors,
            scaler,
            adjacency,
            metadata,
        })
    }
}

fn read_artifact<T: serde::de::DeserializeOwned>(path: &Path, run_id: &str) -> PipelineResult<T> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::ModelMissing(format!(
            "run '{run_id}' is missing {}",
            path.display()
        )),
        _ => PipelineError::Io(e),
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| PipelineError::Corrupt(format!("{}: {e}", path.display())))
}

use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// An external feed failed beyond its soft threshold. Retried on the
    /// next scheduled run.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Dataset feature names disagree with the model's. Inference refuses
    /// to run.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Model artifacts missing: {0}")]
    ModelMissing(String),

    /// A NaN/infinity or broken ordering survived the clamps. A bug, not
    /// bad data.
    #[error("Internal invariant violation: {0}")]
    InternalInvariant(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt artifact: {0}")]
    Corrupt(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Soft failures preserve the previous publication and are retried;
    /// everything else needs operator attention.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            PipelineError::UpstreamUnavailable(_)
                | PipelineError::Http(_)
                | PipelineError::NotFound(_)
                | PipelineError::Cancelled
        )
    }
}

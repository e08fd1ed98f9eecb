use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("dissector failed: {0}")]
    Dissector(String),

    #[error("dissector timed out after {0:?}")]
    Timeout(Duration),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("{vectors} vectors supplied with {timestamps} timestamps")]
    LengthMismatch { vectors: usize, timestamps: usize },

    #[error("non-finite timestamp {0}")]
    NonFiniteTimestamp(f64),

    #[error("worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

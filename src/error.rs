use thiserror::Error;

/// Failures that abort the current ingestion cycle. Advisor and notification
/// transport problems are absorbed at their call sites and never appear here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("required fields unresolved: {}", missing.join(", "))]
    InsufficientSchema { missing: Vec<String> },

    #[error("storage failure: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("csv read failure: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization failure: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

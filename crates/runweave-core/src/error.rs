use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunweaveError {
    // Submission errors
    #[error("Run submission failed: {0}")]
    Submission(String),

    #[error("Run submission returned no batch")]
    NoBatch,

    // Cancellation errors
    #[error("Batch cancel failed: {batch_id}: {message}")]
    Cancel { batch_id: String, message: String },

    // Cost errors
    #[error("Cost estimation failed: {0}")]
    CostEstimate(String),

    // Graph errors
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Graph error: {0}")]
    Graph(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RunweaveError>;

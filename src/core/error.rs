// Error handling for the signal store

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signal {0} already holds stored data")]
    NonEmptySignal(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported compression type: {0}")]
    UnsupportedCompression(u8),

    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("Signal not found: {0}")]
    SignalNotFound(String),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Source not found: {0}")]
    SourceNotFound(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("A timestamp rewrite of signal {0} is still journaled")]
    RewriteInProgress(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Job queue is closed, {0} job dropped")]
    QueueClosed(String),
}

impl StoreError {
    pub fn format(msg: impl Into<String>) -> Self {
        StoreError::Format(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        StoreError::Configuration(msg.into())
    }

    /// True for errors caused by caller input rather than storage state.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StoreError::Configuration(_) | StoreError::Parse(_) | StoreError::SourceNotFound(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::SignalNotFound(_) | StoreError::DatasetNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::NonEmptySignal(_)
                | StoreError::InvalidTransition { .. }
                | StoreError::RewriteInProgress(_)
        )
    }
}

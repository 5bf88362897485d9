//! Error types for rowpipe

use thiserror::Error;

/// Result type alias for rowpipe operations
pub type Result<T> = std::result::Result<T, SdkError>;

/// Main error type for rowpipe
#[derive(Error, Debug)]
pub enum SdkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Row validation failed: missing or invalid fields: {}", .fields.join(", "))]
    Validation { fields: Vec<String> },

    #[error("Duplicate {kind} identifier: {identifier}")]
    DuplicateIdentifier { kind: &'static str, identifier: String },

    #[error("Unknown {kind} identifier: {identifier}")]
    UnknownIdentifier { kind: &'static str, identifier: String },

    #[error("Table '{table}' does not support source '{source_type}'")]
    UnsupportedSource { table: String, source_type: String },

    #[error("Invalid filter expression: {0}")]
    Filter(String),

    #[error("Invalid layout pattern: {0}")]
    Pattern(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SdkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error was caused by cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        match self {
            SdkError::Cancelled => true,
            SdkError::Other(err) => err
                .downcast_ref::<SdkError>()
                .is_some_and(SdkError::is_cancelled),
            _ => false,
        }
    }
}

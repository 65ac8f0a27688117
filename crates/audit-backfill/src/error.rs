//! Error types for the backfill library.

use thiserror::Error;

/// Main error type for backfill operations.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tenant descriptor is missing its identifier or routing key
    #[error("Invalid tenant: {0}")]
    InvalidTenant(String),

    /// Source database connection or query error
    #[error("Source database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Source error with context about where it occurred
    #[error("Source error: {message}\n  Context: {context}")]
    Source { message: String, context: String },

    /// Object store error
    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    /// Sink error for a specific record
    #[error("Sink write failed for record {record_id}: {message}")]
    Sink { record_id: String, message: String },

    /// Distributed queue error
    #[error("Queue error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Queue error with a plain message
    #[error("Queue error: {0}")]
    Queue(String),

    /// A spawned task failed to complete
    #[error("Task failed: {0}")]
    Task(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Backfill was cancelled (SIGINT, etc.)
    #[error("Backfill cancelled")]
    Cancelled,
}

impl BackfillError {
    /// Create a Source error with context about where it occurred
    pub fn source_error(message: impl Into<String>, context: impl Into<String>) -> Self {
        BackfillError::Source {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Sink error
    pub fn sink(record_id: impl Into<String>, message: impl Into<String>) -> Self {
        BackfillError::Sink {
            record_id: record_id.into(),
            message: message.into(),
        }
    }

    /// Create an InvalidTenant error
    pub fn invalid_tenant(message: impl Into<String>) -> Self {
        BackfillError::InvalidTenant(message.into())
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackfillError::Config(_) | BackfillError::Yaml(_) | BackfillError::InvalidTenant(_) => 2,
            BackfillError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for backfill operations.
pub type Result<T> = std::result::Result<T, BackfillError>;

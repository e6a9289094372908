//! Error taxonomy for the retrieval core.
//!
//! Workers decide between retry and terminal failure with [`CoreError::is_retryable`]; the user
//! layer only ever sees terminal task failures, [`CoreError::NoCapableModel`], and validation
//! problems with its own requests.

use focus_ai_context::TextError;
use focus_ai_models::{Capability, ModelError};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, CoreError>;

/// A model configuration the router looked at and why it was passed over.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptedModel {
    pub model_config_id: i64,
    pub display_name: String,
    pub reason: String,
}

impl std::fmt::Display for AttemptedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{} {} ({})",
            self.model_config_id, self.display_name, self.reason
        )
    }
}

fn describe_attempts(attempted: &[AttemptedModel]) -> String {
    if attempted.is_empty() {
        return "no models assigned".to_string();
    }
    attempted
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The request itself is malformed; retrying cannot help
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Temporary condition; the queue retries with backoff
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Vector dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("No capable model for {capability}: {}", describe_attempts(.attempted))]
    NoCapableModel {
        capability: Capability,
        attempted: Vec<AttemptedModel>,
    },

    /// Relational rows and the vector store disagree
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Text processing error: {0}")]
    Text(#[from] TextError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether a task that failed with this error should be requeued.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Transient(_) | CoreError::Io(_) => true,
            // All candidates may come back once their failure window passes
            CoreError::NoCapableModel { .. } => true,
            CoreError::Model(e) => e.is_retryable(),
            CoreError::Storage(e) => storage_error_is_transient(e),
            CoreError::Validation(_)
            | CoreError::DimensionMismatch { .. }
            | CoreError::Consistency(_)
            | CoreError::NotFound { .. }
            | CoreError::Serialization(_)
            | CoreError::Text(_)
            | CoreError::Config(_) => false,
        }
    }
}

fn storage_error_is_transient(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CoreError::transient("provider busy").is_retryable());
        assert!(!CoreError::validation("empty path").is_retryable());
        assert!(
            !CoreError::DimensionMismatch {
                expected: 384,
                actual: 768
            }
            .is_retryable()
        );
        assert!(
            CoreError::Model(ModelError::Timeout {
                after: std::time::Duration::from_secs(5)
            })
            .is_retryable()
        );
        assert!(!CoreError::Model(ModelError::invalid_config("no url")).is_retryable());
    }

    #[test]
    fn test_no_capable_model_lists_attempts() {
        let err = CoreError::NoCapableModel {
            capability: Capability::Vision,
            attempted: vec![
                AttemptedModel {
                    model_config_id: 1,
                    display_name: "llava".into(),
                    reason: "UNREACHABLE".into(),
                },
                AttemptedModel {
                    model_config_id: 2,
                    display_name: "gpt-4o".into(),
                    reason: "disabled".into(),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("VISION"));
        assert!(message.contains("#1 llava (UNREACHABLE)"));
        assert!(message.contains("#2 gpt-4o (disabled)"));

        let empty = CoreError::NoCapableModel {
            capability: Capability::TextGen,
            attempted: vec![],
        };
        assert!(empty.to_string().contains("no models assigned"));
    }
}

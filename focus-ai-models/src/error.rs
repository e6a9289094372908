//! Error types for model clients

use crate::capability::Capability;
use std::time::Duration;

/// Result type for model client operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Error type for every model client operation.
///
/// Callers mostly care about one question: is it worth trying again later? That is answered by
/// [`ModelError::is_retryable`]. Network trouble, timeouts, rate limits and server-side failures
/// are transient; bad configuration, unsupported capabilities and malformed requests are not.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// The client was asked for a capability its provider does not offer
    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: Capability,
    },

    /// The provider did not answer within the per-call timeout
    #[error("Provider call timed out after {after:?}")]
    Timeout { after: Duration },

    /// Transport-level failure talking to the provider
    #[error("HTTP request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    /// The provider answered with an error status
    #[error("Provider returned status {status}: {message}")]
    Provider { status: u16, message: String },

    /// The provider answered with something we could not interpret
    #[error("Malformed provider response: {message}")]
    MalformedResponse { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error during embedding generation
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors when reading model inputs
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl ModelError {
    pub fn model_init<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::ModelInitialization {
            source: Box::new(source),
        }
    }

    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::EmbeddingGeneration {
            source: Box::new(source),
        }
    }

    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    pub fn unsupported(provider: impl Into<String>, capability: Capability) -> Self {
        Self::Unsupported {
            provider: provider.into(),
            capability,
        }
    }

    /// Whether the failure is transient and the operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Timeout { .. }
            | ModelError::Http { .. }
            | ModelError::EmbeddingGeneration { .. }
            | ModelError::Io { .. }
            | ModelError::AsyncTask { .. }
            | ModelError::External { .. } => true,
            ModelError::Provider { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            ModelError::InvalidConfig { .. }
            | ModelError::Unsupported { .. }
            | ModelError::MalformedResponse { .. }
            | ModelError::ModelInitialization { .. } => false,
        }
    }

    /// Whether the failure says something about the provider's health, as opposed to the request.
    pub fn counts_against_health(&self) -> bool {
        match self {
            ModelError::Provider { status, .. } => *status == 401 || *status == 403 || *status >= 500 || *status == 429,
            ModelError::Unsupported { .. } | ModelError::MalformedResponse { .. } => false,
            ModelError::InvalidConfig { .. } => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ModelError::Timeout { after: Duration::from_secs(1) }.is_retryable());
        assert!(
            ModelError::Provider {
                status: 503,
                message: "overloaded".into()
            }
            .is_retryable()
        );
        assert!(
            ModelError::Provider {
                status: 429,
                message: "slow down".into()
            }
            .is_retryable()
        );
        assert!(
            !ModelError::Provider {
                status: 400,
                message: "bad request".into()
            }
            .is_retryable()
        );
        assert!(!ModelError::invalid_config("no base url").is_retryable());
        assert!(!ModelError::unsupported("hashing", Capability::Vision).is_retryable());
    }

    #[test]
    fn test_health_classification() {
        assert!(ModelError::Timeout { after: Duration::from_secs(1) }.counts_against_health());
        assert!(
            !ModelError::Provider {
                status: 400,
                message: "context too long".into()
            }
            .counts_against_health()
        );
        assert!(!ModelError::unsupported("hashing", Capability::TextGen).counts_against_health());
    }
}

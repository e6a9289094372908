//! Configuration for model clients

use crate::error::{ModelError, Result};
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which wire protocol / runtime a configuration talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// api.openai.com
    OpenAi,
    /// A local Ollama daemon (OpenAI-compatible endpoints)
    Ollama,
    /// LM Studio's local server
    LmStudio,
    /// Any other server speaking the OpenAI chat/embeddings protocol
    OpenAiCompatible,
    /// In-process ONNX embedding model
    LocalEmbed,
    /// Deterministic feature-hashing embedder, needs no model files
    Hashing,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Ollama => "ollama",
            ProviderKind::LmStudio => "lmstudio",
            ProviderKind::OpenAiCompatible => "openai_compatible",
            ProviderKind::LocalEmbed => "local_embed",
            ProviderKind::Hashing => "hashing",
        }
    }

    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            ProviderKind::OpenAi => Some("https://api.openai.com/v1"),
            ProviderKind::Ollama => Some("http://localhost:11434/v1"),
            ProviderKind::LmStudio => Some("http://localhost:1234/v1"),
            ProviderKind::OpenAiCompatible | ProviderKind::LocalEmbed | ProviderKind::Hashing => {
                None
            }
        }
    }

    /// Whether the provider runs on this machine.
    pub fn is_local(&self) -> bool {
        !matches!(self, ProviderKind::OpenAi | ProviderKind::OpenAiCompatible)
    }

    /// Whether the provider speaks HTTP.
    pub fn is_remote_protocol(&self) -> bool {
        matches!(
            self,
            ProviderKind::OpenAi
                | ProviderKind::Ollama
                | ProviderKind::LmStudio
                | ProviderKind::OpenAiCompatible
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "ollama" => Ok(ProviderKind::Ollama),
            "lmstudio" | "lm_studio" => Ok(ProviderKind::LmStudio),
            "openai_compatible" | "compatible" => Ok(ProviderKind::OpenAiCompatible),
            "local_embed" | "fastembed" | "local" => Ok(ProviderKind::LocalEmbed),
            "hashing" | "hash" => Ok(ProviderKind::Hashing),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Settings for one model client.
#[derive(Debug, Clone, Builder, Serialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ClientConfig {
    pub provider: ProviderKind,
    /// Provider-side model name, e.g. `gpt-4o-mini` or `all-minilm-l6-v2`
    pub model_id: String,
    /// Overrides the provider's default endpoint
    #[builder(default)]
    pub base_url: Option<String>,
    #[builder(default)]
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Per-call timeout
    #[builder(default = "Duration::from_secs(60)")]
    pub timeout: Duration,
    /// Maximum texts per embedding request
    #[builder(default = "32")]
    pub batch_size: usize,
    /// Output dimension for embedders that are configured rather than discovered
    #[builder(default)]
    pub dimension: Option<usize>,
    #[builder(default)]
    pub max_output_tokens: Option<u32>,
    #[builder(default)]
    pub temperature: Option<f32>,
    /// Where local models are cached
    #[builder(default)]
    pub cache_dir: Option<PathBuf>,
}

impl ClientConfigBuilder {
    fn validate(&self) -> std::result::Result<(), String> {
        if let Some(model_id) = &self.model_id
            && model_id.trim().is_empty()
        {
            return Err("model_id must not be empty".to_string());
        }
        if let Some(0) = self.batch_size {
            return Err("batch_size must be greater than zero".to_string());
        }
        if let Some(Some(0)) = self.dimension {
            return Err("dimension must be greater than zero".to_string());
        }
        if let (Some(provider), Some(None) | None) = (self.provider, &self.base_url)
            && provider == ProviderKind::OpenAiCompatible
        {
            return Err("openai_compatible providers need a base_url".to_string());
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Minimal configuration for `provider` / `model_id` with everything else defaulted.
    pub fn new(provider: ProviderKind, model_id: impl Into<String>) -> Result<Self> {
        let mut builder = ClientConfigBuilder::default();
        builder.provider(provider).model_id(model_id.into());
        builder
            .build()
            .map_err(|e| ModelError::invalid_config(e.to_string()))
    }

    /// Effective endpoint: the explicit base URL, else the provider default.
    pub fn endpoint(&self) -> Result<String> {
        self.base_url
            .as_deref()
            .or_else(|| self.provider.default_base_url())
            .map(|url| url.trim_end_matches('/').to_string())
            .ok_or_else(|| {
                ModelError::invalid_config(format!(
                    "{} model {} has no base_url",
                    self.provider, self.model_id
                ))
            })
    }

    /// Set the per-call timeout (builder style)
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }

    /// Set the embedding dimension (builder style)
    pub fn with_dimension(self, dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ClientConfig::new(ProviderKind::Ollama, "llama3.2").unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.endpoint().unwrap(), "http://localhost:11434/v1");
        assert!(config.provider.is_local());
    }

    #[test]
    fn test_builder_validation() {
        assert!(ClientConfig::new(ProviderKind::OpenAi, "  ").is_err());
        assert!(ClientConfig::new(ProviderKind::OpenAiCompatible, "m").is_err());

        let config = ClientConfig::builder()
            .provider(ProviderKind::OpenAiCompatible)
            .model_id("qwen")
            .base_url(Some("http://gpu-box:8000/v1/".to_string()))
            .build()
            .unwrap();
        assert_eq!(config.endpoint().unwrap(), "http://gpu-box:8000/v1");
    }

    #[test]
    fn test_hashing_has_no_endpoint() {
        let config = ClientConfig::new(ProviderKind::Hashing, "trigram").unwrap();
        assert!(config.endpoint().is_err());
        assert!(!config.provider.is_remote_protocol());
    }

    #[test]
    fn test_provider_names() {
        assert_eq!("LM-Studio".parse::<ProviderKind>().unwrap(), ProviderKind::LmStudio);
        assert_eq!(ProviderKind::LocalEmbed.to_string(), "local_embed");
        assert!("carrier-pigeon".parse::<ProviderKind>().is_err());
    }
}

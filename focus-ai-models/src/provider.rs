//! The model client interface and the types that cross it

use crate::capability::Capability;
use crate::config::{ClientConfig, ProviderKind};
use crate::error::{ModelError, Result};
use crate::stream::ResponseStream;
use async_trait::async_trait;
use half::f16;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result from a vector of f16 embeddings.
    ///
    /// The dimension is inferred from the first embedding vector. If the embeddings vector is
    /// empty, dimension defaults to 0.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Convert f32 embeddings to unit-length f16 vectors.
pub fn normalize_to_f16(embeddings: Vec<Vec<f32>>) -> Vec<Vec<f16>> {
    embeddings
        .into_iter()
        .map(|embedding| {
            let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
            embedding
                .into_iter()
                .map(|value| {
                    if norm > 0.0 {
                        f16::from_f32(value / norm)
                    } else {
                        f16::from_f32(value)
                    }
                })
                .collect()
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A streamed text-generation request.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub messages: Vec<PromptMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Image bytes handed to a vision model.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageInput {
    /// Guess the MIME type from a file extension; unknown extensions fall back to PNG.
    pub fn from_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Self {
        let mime_type = match extension.map(|e| e.to_ascii_lowercase()).as_deref() {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("bmp") => "image/bmp",
            _ => "image/png",
        };
        Self {
            bytes,
            mime_type: mime_type.to_string(),
        }
    }
}

/// Outcome of a lightweight liveness call.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub provider: String,
    pub model_id: String,
    pub latency_ms: u64,
    pub detail: String,
}

/// A client for one configured model.
///
/// Every provider implements the operations it supports; the defaults report
/// [`ModelError::Unsupported`] so the router can treat a missing capability like any other
/// configuration problem.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider_name(&self) -> &str;

    fn model_id(&self) -> &str;

    /// Capabilities this client can actually serve.
    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, _texts: &[String]) -> Result<EmbeddingResult> {
        Err(ModelError::unsupported(
            self.provider_name(),
            Capability::Embedding,
        ))
    }

    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let result = self.embed_texts(&[text.to_string()]).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::malformed("no embedding generated for text"))
    }

    /// Start a streamed completion. Errors returned here happen before the first fragment;
    /// later failures arrive as an error fragment on the stream.
    async fn generate(&self, _request: GenerationRequest) -> Result<ResponseStream> {
        Err(ModelError::unsupported(
            self.provider_name(),
            Capability::TextGen,
        ))
    }

    /// Describe an image in prose suitable for retrieval.
    async fn describe_image(&self, _image: &ImageInput, _prompt: &str) -> Result<String> {
        Err(ModelError::unsupported(
            self.provider_name(),
            Capability::Vision,
        ))
    }

    /// Cheapest call that proves the provider is alive.
    async fn probe(&self) -> Result<ProbeReport>;
}

/// Build the client for a configuration. Local embedding models are loaded here, so this can
/// take a while the first time a model is used.
pub async fn connect(
    config: ClientConfig,
    capabilities: &[Capability],
) -> Result<Arc<dyn ModelClient>> {
    match config.provider {
        ProviderKind::OpenAi
        | ProviderKind::Ollama
        | ProviderKind::LmStudio
        | ProviderKind::OpenAiCompatible => Ok(Arc::new(
            crate::openai_compat::OpenAiCompatClient::new(config, capabilities.to_vec())?,
        )),
        ProviderKind::Hashing => Ok(Arc::new(crate::hashing::HashingEmbedClient::new(
            &config.model_id,
            config.dimension.unwrap_or(crate::hashing::DEFAULT_HASHING_DIMENSION),
        ))),
        #[cfg(feature = "local-embeddings")]
        ProviderKind::LocalEmbed => Ok(Arc::new(
            crate::local::LocalEmbedClient::create(config).await?,
        )),
        #[cfg(not(feature = "local-embeddings"))]
        ProviderKind::LocalEmbed => Err(ModelError::invalid_config(
            "local embeddings are not compiled in (enable the `local-embeddings` feature)",
        )),
    }
}

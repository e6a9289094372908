//! # focus-ai-models
//!
//! Model clients behind one capability-oriented interface.
//!
//! Every configured model, whether a remote chat model, a local Ollama daemon or an in-process
//! ONNX embedder, is reached through [`ModelClient`]. A client declares which [`Capability`]s it
//! serves; operations it does not serve fail with [`ModelError::Unsupported`].
//!
//! ## Providers
//!
//! - [`openai_compat`]: OpenAI, Ollama, LM Studio and other OpenAI-compatible servers
//!   (chat streaming over SSE, embeddings, vision through image data URLs)
//! - `local`: fastembed ONNX models, behind the default `local-embeddings` feature
//! - [`hashing`]: deterministic trigram embedder for offline use and tests
//!
//! ## Streaming
//!
//! [`ModelClient::generate`] returns a [`ResponseStream`]: an ordered channel of text fragments
//! ending in one `End` or `Error` marker. Dropping the stream cancels the producer.
//!
//! ```no_run
//! use focus_ai_models::{Capability, ClientConfig, GenerationRequest, PromptMessage, ProviderKind, Role, connect};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ClientConfig::new(ProviderKind::Ollama, "llama3.2")?;
//! let client = connect(config, &[Capability::TextGen]).await?;
//!
//! let request = GenerationRequest {
//!     messages: vec![PromptMessage::new(Role::User, "Hello")],
//!     ..Default::default()
//! };
//! let reply = client.generate(request).await?.collect().await;
//! println!("{}", reply.text);
//! # Ok(())
//! # }
//! ```

pub mod capability;
pub mod config;
pub mod error;
pub mod hashing;
#[cfg(feature = "local-embeddings")]
pub mod local;
pub mod openai_compat;
pub mod provider;
pub mod stream;

pub use capability::{Capability, parse_capability_list};
pub use config::{ClientConfig, ClientConfigBuilder, ProviderKind};
pub use error::{ModelError, Result};
pub use hashing::HashingEmbedClient;
#[cfg(feature = "local-embeddings")]
pub use local::LocalEmbedClient;
pub use openai_compat::OpenAiCompatClient;
pub use provider::{
    EmbeddingResult, GenerationRequest, ImageInput, ModelClient, ProbeReport, PromptMessage, Role,
    connect, normalize_to_f16,
};
pub use stream::{CollectedResponse, ResponseFragment, ResponseSender, ResponseStream, response_channel};

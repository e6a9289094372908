//! In-process ONNX embedding models via FastEmbed

use crate::capability::Capability;
use crate::config::ClientConfig;
use crate::error::{ModelError, Result};
use crate::provider::{EmbeddingResult, ModelClient, ProbeReport, normalize_to_f16};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use fnv::FnvHasher;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Instant;

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

fn model_cache() -> MutexGuard<'static, HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Map a configured model name onto one of fastembed's built-in models.
pub fn builtin_model(model_id: &str) -> Result<EmbeddingModel> {
    match model_id.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" | "allminilml6v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-small-zh-v1.5" => Ok(EmbeddingModel::BGESmallZHV15),
        "multilingual-e5-small" => Ok(EmbeddingModel::MultilingualE5Small),
        "paraphrase-multilingual-minilm-l12-v2" => Ok(EmbeddingModel::ParaphraseMLMiniLML12V2),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        other => Err(ModelError::invalid_config(format!(
            "unknown local embedding model: {other}"
        ))),
    }
}

/// FastEmbed-based embedding client
#[derive(Clone)]
pub struct LocalEmbedClient {
    config: ClientConfig,
    model: Arc<Mutex<TextEmbedding>>,
    dimension: usize,
}

impl std::fmt::Debug for LocalEmbedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEmbedClient")
            .field("model_id", &self.config.model_id)
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl LocalEmbedClient {
    /// Load (or reuse) the model named by `config.model_id`.
    pub async fn create(config: ClientConfig) -> Result<Self> {
        let cache_key = cache_key(&config);

        let cached = model_cache()
            .get(&cache_key)
            .map(|(model, dim)| (Arc::clone(model), *dim));
        if let Some((model, dimension)) = cached {
            tracing::info!("Using cached model for: {}", config.model_id);
            return Ok(Self {
                config,
                model,
                dimension,
            });
        }

        let builtin = builtin_model(&config.model_id)?;
        let cache_dir = config.cache_dir.clone();
        let model_id = config.model_id.clone();
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                tracing::info!("Loading embedding model: {}", model_id);

                let mut init_options = InitOptions::new(builtin).with_show_download_progress(false);
                if let Some(dir) = cache_dir {
                    init_options = init_options.with_cache_dir(dir);
                }
                let mut model = TextEmbedding::try_new(init_options)
                    .map_err(|e| ModelError::External { source: e })?;

                // Get dimension by generating a test embedding
                let test_embeddings = model
                    .embed(vec!["test".to_string()], None)
                    .map_err(|e| ModelError::External { source: e })?;
                let dimension = test_embeddings
                    .first()
                    .map(|emb| emb.len())
                    .filter(|len| *len > 0)
                    .ok_or_else(|| ModelError::malformed("model produced an empty embedding"))?;

                tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                Ok((model, dimension))
            })
            .await??;

        let model = Arc::new(Mutex::new(model));
        model_cache().insert(cache_key, (Arc::clone(&model), dimension));

        Ok(Self {
            config,
            model,
            dimension,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Clears the global model cache.
    pub fn clear_cache() {
        model_cache().clear();
        tracing::info!("Model cache cleared");
    }

    pub fn cache_size() -> usize {
        model_cache().len()
    }
}

fn cache_key(config: &ClientConfig) -> String {
    let mut hasher = FnvHasher::default();
    hasher.write(b"v1:");
    hasher.write(config.model_id.to_ascii_lowercase().as_bytes());
    if let Some(dir) = &config.cache_dir {
        hasher.write(dir.to_string_lossy().as_bytes());
    }
    format!("v1:{:x}", hasher.finish())
}

const CAPABILITIES: &[Capability] = &[Capability::Embedding];

#[async_trait]
impl ModelClient for LocalEmbedClient {
    fn provider_name(&self) -> &str {
        "local_embed"
    }

    fn model_id(&self) -> &str {
        &self.config.model_id
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }
        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size) {
            let chunk = chunk.to_vec();
            let model = Arc::clone(&self.model);

            let batch = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                let mut guard = model.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard
                    .embed(chunk, None)
                    .map_err(|e| ModelError::External { source: e })
            })
            .await??;

            all_embeddings.extend(normalize_to_f16(batch));
        }

        tracing::debug!("Generated {} embeddings", all_embeddings.len());
        Ok(EmbeddingResult::new(all_embeddings))
    }

    async fn probe(&self) -> Result<ProbeReport> {
        let started = Instant::now();
        let vector = self.embed_text("probe").await?;
        Ok(ProbeReport {
            provider: "local_embed".to_string(),
            model_id: self.config.model_id.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            detail: format!("in-process, dimension {}", vector.len()),
        })
    }
}

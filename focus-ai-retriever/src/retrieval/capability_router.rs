//! Capability routing with health tracking.
//!
//! Each capability has an ordered fallback chain of model configurations. [`CapabilityRouter::resolve`]
//! walks the chain and returns the first model that is enabled and not UNREACHABLE.
//!
//! Health moves on reported outcomes:
//!
//! ```text
//!             failure                N consecutive failures in window
//! HEALTHY ───────────────▶ DEGRADED ─────────────────────────────────▶ UNREACHABLE
//!    ▲                        │                                            │
//!    └──────── success ───────┴─────────────────── success ────────────────┘
//! ```
//!
//! An UNREACHABLE model whose last failure is older than the window is let back in as DEGRADED
//! the next time its chain is walked, so one more failure sends it straight back.
//!
//! Provider calls made through the router are bounded by a per-call timeout, and their outcome is
//! reported to the tracker. A failed call is not retried against the next model on the spot; the
//! caller's task goes back through the queue's backoff and the next attempt resolves again.

use super::analyzer::ImageSource;
use super::chunking_strategy::ImageDescriber;
use super::vector_index::{EmbeddingBatch, Embedder};
use crate::config::RouterConfig;
use crate::error::{AttemptedModel, CoreError, Result};
use crate::storage::{Database, HealthState, ModelConfiguration, ModelHealth, now_millis};
use async_trait::async_trait;
use focus_ai_models::{
    Capability, GenerationRequest, ImageInput, ModelClient, ModelError, ProbeReport,
    ResponseStream,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds a client for a configuration. Swapped out in tests.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        model: &ModelConfiguration,
        timeout: Duration,
    ) -> Result<Arc<dyn ModelClient>>;
}

/// Connects through [`focus_ai_models::connect`].
#[derive(Debug, Clone, Default)]
pub struct DefaultClientFactory {
    /// Where local embedding models are cached
    pub cache_dir: Option<PathBuf>,
}

#[async_trait]
impl ClientFactory for DefaultClientFactory {
    async fn connect(
        &self,
        model: &ModelConfiguration,
        timeout: Duration,
    ) -> Result<Arc<dyn ModelClient>> {
        let mut config = model.client_config(timeout)?;
        config.cache_dir = self.cache_dir.clone();
        Ok(focus_ai_models::connect(config, &model.capabilities).await?)
    }
}

/// Thresholds for health transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub failure_threshold: u32,
    pub window: Duration,
}

impl From<&RouterConfig> for HealthPolicy {
    fn from(config: &RouterConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            window: config.failure_window(),
        }
    }
}

impl HealthPolicy {
    fn within_window(&self, earlier: Option<i64>, now_ms: i64) -> bool {
        earlier.is_some_and(|t| now_ms - t <= self.window.as_millis() as i64)
    }

    /// Health after one more failure at `now_ms`.
    pub fn after_failure(&self, current: &ModelHealth, now_ms: i64) -> ModelHealth {
        let consecutive_failures = if self.within_window(current.last_failure_at, now_ms) {
            current.consecutive_failures.saturating_add(1)
        } else {
            1
        };
        let state = if consecutive_failures >= self.failure_threshold {
            HealthState::Unreachable
        } else {
            HealthState::Degraded
        };
        ModelHealth {
            state,
            consecutive_failures,
            last_failure_at: Some(now_ms),
            last_success_at: current.last_success_at,
        }
    }

    pub fn after_success(&self, current: &ModelHealth, now_ms: i64) -> ModelHealth {
        ModelHealth {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_failure_at: current.last_failure_at,
            last_success_at: Some(now_ms),
        }
    }

    /// Whether an UNREACHABLE model has sat out its window.
    pub fn cooled_down(&self, current: &ModelHealth, now_ms: i64) -> bool {
        current.state == HealthState::Unreachable
            && current.last_failure_at.is_some()
            && !self.within_window(current.last_failure_at, now_ms)
    }
}

/// Result of probing one model.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub model_config_id: i64,
    pub display_name: String,
    pub report: Option<ProbeReport>,
    pub error: Option<String>,
    pub health: HealthState,
}

struct RouterInner {
    db: Database,
    factory: Arc<dyn ClientFactory>,
    policy: HealthPolicy,
    call_timeout: Duration,
    clients: Mutex<HashMap<i64, Arc<dyn ModelClient>>>,
    health_lock: tokio::sync::Mutex<()>,
}

/// Routes capability requests to configured models. Cheap to clone.
#[derive(Clone)]
pub struct CapabilityRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for CapabilityRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRouter")
            .field("policy", &self.inner.policy)
            .field("call_timeout", &self.inner.call_timeout)
            .finish()
    }
}

impl CapabilityRouter {
    pub fn new(db: Database, factory: Arc<dyn ClientFactory>, config: &RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                db,
                factory,
                policy: HealthPolicy::from(config),
                call_timeout: config.call_timeout(),
                clients: Mutex::new(HashMap::new()),
                health_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn policy(&self) -> HealthPolicy {
        self.inner.policy
    }

    /// First usable model in the chain for `capability`.
    ///
    /// # Errors
    /// [`CoreError::NoCapableModel`] listing every configuration that was passed over.
    pub async fn resolve(&self, capability: Capability) -> Result<ModelConfiguration> {
        let chain = self.inner.db.capability_chain(capability).await?;
        let mut attempted = Vec::new();

        for id in chain {
            let Some(mut model) = self.inner.db.get_model_configuration(id).await? else {
                attempted.push(AttemptedModel {
                    model_config_id: id,
                    display_name: "?".to_string(),
                    reason: "missing".to_string(),
                });
                continue;
            };
            if !model.enabled {
                attempted.push(attempt(&model, "disabled"));
                continue;
            }
            if model.health.state == HealthState::Unreachable {
                if self.inner.policy.cooled_down(&model.health, now_millis()) {
                    model.health = self.half_open(&model).await?;
                } else {
                    attempted.push(attempt(&model, "UNREACHABLE"));
                    continue;
                }
            }
            debug!(
                "Resolved {} to #{} {} ({})",
                capability, model.id, model.display_name, model.health.state
            );
            return Ok(model);
        }

        Err(CoreError::NoCapableModel {
            capability,
            attempted,
        })
    }

    /// The resolved configuration together with its client.
    pub async fn client_for(
        &self,
        capability: Capability,
    ) -> Result<(ModelConfiguration, Arc<dyn ModelClient>)> {
        let model = self.resolve(capability).await?;
        let client = self.client(&model).await?;
        Ok((model, client))
    }

    async fn client(&self, model: &ModelConfiguration) -> Result<Arc<dyn ModelClient>> {
        let cached = self
            .inner
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&model.id)
            .cloned();
        if let Some(client) = cached {
            return Ok(client);
        }

        let client = match self.inner.factory.connect(model, self.inner.call_timeout).await {
            Ok(client) => client,
            Err(e) => {
                if counts_against_health(&e) {
                    self.report_failure(model.id).await?;
                }
                return Err(e);
            }
        };
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(model.id, Arc::clone(&client));
        Ok(client)
    }

    /// Forget cached clients, e.g. after configurations were edited.
    pub fn clear_clients(&self) {
        self.inner
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    async fn half_open(&self, model: &ModelConfiguration) -> Result<ModelHealth> {
        let _guard = self.inner.health_lock.lock().await;
        let health = ModelHealth {
            state: HealthState::Degraded,
            ..model.health
        };
        self.inner.db.save_model_health(model.id, &health).await?;
        info!(
            "Model #{} {} is back on trial after its failure window",
            model.id, model.display_name
        );
        Ok(health)
    }

    pub async fn report_failure(&self, model_config_id: i64) -> Result<HealthState> {
        let _guard = self.inner.health_lock.lock().await;
        let model = self
            .inner
            .db
            .get_model_configuration(model_config_id)
            .await?
            .ok_or_else(|| CoreError::not_found("model configuration", model_config_id))?;
        let next = self.inner.policy.after_failure(&model.health, now_millis());
        self.inner.db.save_model_health(model_config_id, &next).await?;
        if next.state != model.health.state {
            warn!(
                "Model #{} {} is now {} after {} consecutive failure(s)",
                model.id, model.display_name, next.state, next.consecutive_failures
            );
        }
        Ok(next.state)
    }

    pub async fn report_success(&self, model_config_id: i64) -> Result<HealthState> {
        let _guard = self.inner.health_lock.lock().await;
        let model = self
            .inner
            .db
            .get_model_configuration(model_config_id)
            .await?
            .ok_or_else(|| CoreError::not_found("model configuration", model_config_id))?;
        let next = self.inner.policy.after_success(&model.health, now_millis());
        self.inner.db.save_model_health(model_config_id, &next).await?;
        if model.health.state != HealthState::Healthy {
            info!("Model #{} {} is HEALTHY again", model.id, model.display_name);
        }
        Ok(next.state)
    }

    /// Run a provider call under the per-call timeout and report its outcome.
    async fn call<T, F>(&self, model: &ModelConfiguration, call: F) -> Result<T>
    where
        F: Future<Output = focus_ai_models::Result<T>>,
    {
        let outcome = match tokio::time::timeout(self.inner.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ModelError::Timeout {
                after: self.inner.call_timeout,
            }),
        };
        match outcome {
            Ok(value) => {
                self.report_success(model.id).await?;
                Ok(value)
            }
            Err(e) => {
                if e.counts_against_health() {
                    self.report_failure(model.id).await?;
                }
                Err(e.into())
            }
        }
    }

    /// Start a streamed generation on the TEXT_GEN chain. Failures that happen mid-stream are the
    /// caller's to report.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<(ModelConfiguration, ResponseStream)> {
        let (model, client) = self.client_for(Capability::TextGen).await?;
        let stream = self.call(&model, client.generate(request)).await?;
        Ok((model, stream))
    }

    /// Describe an image with the VISION chain. `Ok(None)` when no vision model is available.
    pub async fn describe_image(&self, image: &ImageInput, prompt: &str) -> Result<Option<String>> {
        let (model, client) = match self.client_for(Capability::Vision).await {
            Ok(found) => found,
            Err(CoreError::NoCapableModel { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let description = self.call(&model, client.describe_image(image, prompt)).await?;
        Ok(Some(description))
    }

    /// Call the model's lightweight probe and feed the result into its health.
    pub async fn probe(&self, model_config_id: i64) -> Result<ProbeOutcome> {
        let model = self
            .inner
            .db
            .get_model_configuration(model_config_id)
            .await?
            .ok_or_else(|| CoreError::not_found("model configuration", model_config_id))?;

        let result = match self.client(&model).await {
            Ok(client) => self.call(&model, client.probe()).await,
            Err(e) => Err(e),
        };
        let health = self
            .inner
            .db
            .get_model_configuration(model_config_id)
            .await?
            .map(|m| m.health.state)
            .unwrap_or(model.health.state);

        Ok(match result {
            Ok(report) => ProbeOutcome {
                model_config_id,
                display_name: model.display_name,
                report: Some(report),
                error: None,
                health,
            },
            Err(e) => ProbeOutcome {
                model_config_id,
                display_name: model.display_name,
                report: None,
                error: Some(e.to_string()),
                health,
            },
        })
    }

    /// Probe every model that appears in some chain.
    pub async fn probe_assigned(&self) -> Result<Vec<ProbeOutcome>> {
        let mut ids: Vec<i64> = self
            .inner
            .db
            .list_capability_assignments()
            .await?
            .into_iter()
            .flat_map(|(_, chain)| chain)
            .collect();
        ids.sort_unstable();
        ids.dedup();

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.probe(id).await?);
        }
        Ok(outcomes)
    }
}

fn attempt(model: &ModelConfiguration, reason: &str) -> AttemptedModel {
    AttemptedModel {
        model_config_id: model.id,
        display_name: model.display_name.clone(),
        reason: reason.to_string(),
    }
}

fn counts_against_health(error: &CoreError) -> bool {
    match error {
        CoreError::Model(e) => e.counts_against_health(),
        CoreError::Transient(_) | CoreError::Io(_) => true,
        _ => false,
    }
}

#[async_trait]
impl Embedder for CapabilityRouter {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let (model, client) = self.client_for(Capability::Embedding).await?;
        let result = self.call(&model, client.embed_texts(texts)).await?;
        Ok(EmbeddingBatch {
            vectors: result.embeddings,
            model: model.display_name,
        })
    }
}

const DESCRIBE_PROMPT: &str = "Describe this image for a search index. Mention any visible text, labels, numbers and the overall subject. Answer in plain prose.";

#[async_trait]
impl ImageDescriber for CapabilityRouter {
    async fn describe(&self, image: &ImageSource) -> Result<Option<String>> {
        let bytes = tokio::fs::read(&image.path).await?;
        let extension = image.path.extension().and_then(|e| e.to_str());
        let input = ImageInput::from_bytes(bytes, extension);
        let prompt = match image.alt.trim() {
            "" => DESCRIBE_PROMPT.to_string(),
            alt => format!("{DESCRIBE_PROMPT} The author captioned it: \"{alt}\"."),
        };
        self.describe_image(&input, &prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewModelConfiguration;
    use focus_ai_models::HashingEmbedClient;

    /// Serves hashing embedders; models named `down*` fail every call.
    struct TestFactory;

    struct DownClient;

    #[async_trait]
    impl ModelClient for DownClient {
        fn provider_name(&self) -> &str {
            "down"
        }
        fn model_id(&self) -> &str {
            "down"
        }
        fn capabilities(&self) -> &[Capability] {
            &[Capability::Embedding, Capability::TextGen]
        }
        async fn embed_texts(
            &self,
            _texts: &[String],
        ) -> focus_ai_models::Result<focus_ai_models::EmbeddingResult> {
            Err(ModelError::Provider {
                status: 503,
                message: "unavailable".into(),
            })
        }
        async fn probe(&self) -> focus_ai_models::Result<ProbeReport> {
            Err(ModelError::Timeout {
                after: Duration::from_millis(1),
            })
        }
    }

    #[async_trait]
    impl ClientFactory for TestFactory {
        async fn connect(
            &self,
            model: &ModelConfiguration,
            _timeout: Duration,
        ) -> Result<Arc<dyn ModelClient>> {
            if model.display_name.starts_with("down") {
                Ok(Arc::new(DownClient))
            } else {
                Ok(Arc::new(HashingEmbedClient::new(&model.model_id, 8)))
            }
        }
    }

    async fn add(db: &Database, name: &str) -> i64 {
        db.add_model_configuration(&NewModelConfiguration {
            display_name: name.to_string(),
            provider: "hashing".into(),
            model_id: name.to_string(),
            capabilities: vec![Capability::Embedding],
            ..Default::default()
        })
        .await
        .unwrap()
        .id
    }

    async fn router(db: &Database) -> CapabilityRouter {
        CapabilityRouter::new(db.clone(), Arc::new(TestFactory), &RouterConfig::default())
    }

    #[test]
    fn test_policy_transitions() {
        let policy = HealthPolicy {
            failure_threshold: 3,
            window: Duration::from_secs(300),
        };
        let healthy = ModelHealth::default();
        let one = policy.after_failure(&healthy, 1_000);
        assert_eq!((one.state, one.consecutive_failures), (HealthState::Degraded, 1));
        let two = policy.after_failure(&one, 2_000);
        assert_eq!(two.state, HealthState::Degraded);
        let three = policy.after_failure(&two, 3_000);
        assert_eq!((three.state, three.consecutive_failures), (HealthState::Unreachable, 3));

        // a failure long after the previous one starts a new streak
        let late = policy.after_failure(&two, 2_000 + 301_000);
        assert_eq!((late.state, late.consecutive_failures), (HealthState::Degraded, 1));

        let back = policy.after_success(&three, 4_000);
        assert_eq!((back.state, back.consecutive_failures), (HealthState::Healthy, 0));

        assert!(!policy.cooled_down(&three, 3_000 + 1_000));
        assert!(policy.cooled_down(&three, 3_000 + 301_000));
    }

    #[tokio::test]
    async fn test_chain_skips_unreachable_then_falls_back() {
        let db = Database::open_memory().await.unwrap();
        let a = add(&db, "a").await;
        let b = add(&db, "b").await;
        let c = add(&db, "c").await;
        db.assign_capability(Capability::Embedding, &[a, b, c]).await.unwrap();
        db.save_model_health(
            a,
            &ModelHealth {
                state: HealthState::Unreachable,
                consecutive_failures: 3,
                last_failure_at: Some(now_millis()),
                last_success_at: None,
            },
        )
        .await
        .unwrap();

        let router = router(&db).await;
        assert_eq!(router.resolve(Capability::Embedding).await.unwrap().id, b);

        assert_eq!(router.report_failure(b).await.unwrap(), HealthState::Degraded);
        assert_eq!(router.resolve(Capability::Embedding).await.unwrap().id, b);
        router.report_failure(b).await.unwrap();
        assert_eq!(router.report_failure(b).await.unwrap(), HealthState::Unreachable);
        assert_eq!(router.resolve(Capability::Embedding).await.unwrap().id, c);

        router.report_success(b).await.unwrap();
        assert_eq!(router.resolve(Capability::Embedding).await.unwrap().id, b);
    }

    #[tokio::test]
    async fn test_no_capable_model_lists_attempts() {
        let db = Database::open_memory().await.unwrap();
        let a = add(&db, "a").await;
        db.assign_capability(Capability::Embedding, &[a]).await.unwrap();
        db.set_model_enabled(a, false).await.unwrap();

        let router = router(&db).await;
        match router.resolve(Capability::Embedding).await {
            Err(CoreError::NoCapableModel { capability, attempted }) => {
                assert_eq!(capability, Capability::Embedding);
                assert_eq!(attempted.len(), 1);
                assert_eq!(attempted[0].reason, "disabled");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            router.resolve(Capability::Vision).await,
            Err(CoreError::NoCapableModel { .. })
        ));
    }

    #[tokio::test]
    async fn test_calls_report_outcomes() {
        let db = Database::open_memory().await.unwrap();
        let down = add(&db, "down-1").await;
        let up = add(&db, "up").await;
        db.assign_capability(Capability::Embedding, &[down, up]).await.unwrap();
        let router = router(&db).await;

        for _ in 0..3 {
            assert!(router.embed(&["hello".to_string()]).await.is_err());
        }
        let down_model = db.get_model_configuration(down).await.unwrap().unwrap();
        assert_eq!(down_model.health.state, HealthState::Unreachable);

        let batch = router.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(batch.model, "up");
        assert_eq!(batch.vectors[0].len(), 8);
        let up_model = db.get_model_configuration(up).await.unwrap().unwrap();
        assert!(up_model.health.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_probe_feeds_health() {
        let db = Database::open_memory().await.unwrap();
        let down = add(&db, "down-probe").await;
        let up = add(&db, "fine").await;
        db.assign_capability(Capability::Embedding, &[down, up]).await.unwrap();
        let router = router(&db).await;

        let outcomes = router.probe_assigned().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        let bad = outcomes.iter().find(|o| o.model_config_id == down).unwrap();
        assert!(bad.error.is_some());
        assert_eq!(bad.health, HealthState::Degraded);
        let good = outcomes.iter().find(|o| o.model_config_id == up).unwrap();
        assert!(good.report.is_some());
        assert_eq!(good.health, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_describe_without_vision_model_is_none() {
        let db = Database::open_memory().await.unwrap();
        let router = router(&db).await;
        let image = ImageInput::from_bytes(vec![1, 2, 3], Some("png"));
        assert_eq!(router.describe_image(&image, "what").await.unwrap(), None);
    }
}

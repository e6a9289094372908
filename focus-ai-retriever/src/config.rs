//! Runtime configuration.
//!
//! Everything is read from one TOML file in which every field is optional:
//!
//! ```toml
//! data_dir = "/var/lib/focus"
//!
//! [queue]
//! max_retries = 5
//!
//! [engine]
//! high_workers = 2
//!
//! [context]
//! token_budget = 8000
//! ```
//!
//! Programmatic callers start from [`RetrieverConfig::default`] and chain `with_*` methods.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    /// Holds the relational database and the vector store
    pub data_dir: PathBuf,
    pub queue: QueueConfig,
    pub engine: EngineConfig,
    pub chunking: ChunkingConfig,
    pub router: RouterConfig,
    pub context: ContextConfig,
    pub chat: ChatConfig,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".focus"),
            queue: QueueConfig::default(),
            engine: EngineConfig::default(),
            chunking: ChunkingConfig::default(),
            router: RouterConfig::default(),
            context: ContextConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failures after which a task stops being retried
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long an idle worker sleeps before polling again
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            poll_interval_ms: 500,
        }
    }
}

impl QueueConfig {
    /// Delay before the retry following failure number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .backoff_base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_max_ms);
        Duration::from_millis(delay)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Workers that only claim HIGH tasks
    pub high_workers: usize,
    /// Workers that claim HIGH and MEDIUM tasks
    pub medium_workers: usize,
    /// Workers that claim anything
    pub low_workers: usize,
    /// Texts per embedding call
    pub embed_batch_size: usize,
    /// Schedule a reconciliation sweep this often; 0 disables it
    pub reconcile_interval_secs: u64,
    /// Probe every assigned model this often; 0 disables it
    pub probe_interval_secs: u64,
    /// Requeue RUNNING tasks left by a previous process when the engine opens. Only the
    /// process that runs workers should do this.
    pub recover_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            high_workers: 1,
            medium_workers: 1,
            low_workers: 1,
            embed_batch_size: 32,
            reconcile_interval_secs: 600,
            probe_interval_secs: 0,
            recover_on_open: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Sections longer than this are split into several parents
    pub parent_max_tokens: usize,
    pub child_target_tokens: usize,
    pub overlap_fraction: f32,
    /// Ask a VISION model to describe images when one is available
    pub describe_images: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            parent_max_tokens: 1024,
            child_target_tokens: 256,
            overlap_fraction: 0.15,
            describe_images: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Consecutive failures inside the window that make a model UNREACHABLE
    pub failure_threshold: u32,
    pub failure_window_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            failure_window_secs: 300,
            call_timeout_secs: 60,
        }
    }
}

impl RouterConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub token_budget: usize,
    /// Fraction of the budget pinned documents may use
    pub pinned_share: f32,
    pub top_k: usize,
    pub history_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: 4_000,
            pinned_share: 0.8,
            top_k: 8,
            history_limit: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub min_message_chars: usize,
    pub max_message_chars: usize,
    pub system_prompt: String,
    /// Fragments buffered between the provider and the consumer
    pub stream_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            min_message_chars: 2,
            max_message_chars: 1_000,
            system_prompt: "You are a helpful assistant. Answer using the provided context when it is relevant, and say so when it is not.".to_string(),
            stream_capacity: 64,
        }
    }
}

impl RetrieverConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoreError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        if self.engine.high_workers == 0 {
            return Err(CoreError::Config(
                "at least one HIGH worker is required".to_string(),
            ));
        }
        if self.engine.embed_batch_size == 0 {
            return Err(CoreError::Config("embed_batch_size must be positive".into()));
        }
        if self.chunking.child_target_tokens == 0
            || self.chunking.parent_max_tokens < self.chunking.child_target_tokens
        {
            return Err(CoreError::Config(
                "parent_max_tokens must be at least child_target_tokens, which must be positive"
                    .into(),
            ));
        }
        if !(0.0..1.0).contains(&self.chunking.overlap_fraction) {
            return Err(CoreError::Config("overlap_fraction must be in [0, 1)".into()));
        }
        if !(0.0..=1.0).contains(&self.context.pinned_share) {
            return Err(CoreError::Config("pinned_share must be in [0, 1]".into()));
        }
        if self.router.failure_threshold == 0 {
            return Err(CoreError::Config("failure_threshold must be positive".into()));
        }
        if self.chat.min_message_chars > self.chat.max_message_chars {
            return Err(CoreError::Config(
                "min_message_chars exceeds max_message_chars".into(),
            ));
        }
        Ok(())
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_workers(mut self, high: usize, medium: usize, low: usize) -> Self {
        self.engine.high_workers = high;
        self.engine.medium_workers = medium;
        self.engine.low_workers = low;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.queue.max_retries = max_retries;
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.queue.backoff_base_ms = base_ms;
        self.queue.backoff_max_ms = max_ms;
        self
    }

    pub fn with_poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.queue.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_token_budget(mut self, token_budget: usize) -> Self {
        self.context.token_budget = token_budget;
        self
    }

    pub fn with_child_target_tokens(mut self, tokens: usize) -> Self {
        self.chunking.child_target_tokens = tokens;
        self
    }

    pub fn with_reconcile_interval_secs(mut self, secs: u64) -> Self {
        self.engine.reconcile_interval_secs = secs;
        self
    }
}

/// Read a TOML config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<RetrieverConfig> {
    match std::fs::read_to_string(path) {
        Ok(text) => RetrieverConfig::from_toml_str(&text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(RetrieverConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RetrieverConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.chunking.child_target_tokens, 256);
        assert_eq!(config.context.pinned_share, 0.8);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RetrieverConfig::from_toml_str(
            r#"
            data_dir = "/tmp/focus"

            [queue]
            max_retries = 5

            [context]
            token_budget = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/focus"));
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.backoff_base_ms, 1_000);
        assert_eq!(config.context.token_budget, 100);
        assert_eq!(config.context.top_k, 8);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(RetrieverConfig::from_toml_str("[engine]\nhigh_workers = 0").is_err());
        assert!(RetrieverConfig::from_toml_str("[chunking]\noverlap_fraction = 1.5").is_err());
        assert!(RetrieverConfig::from_toml_str("queue = 3").is_err());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let queue = QueueConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..Default::default()
        };
        assert_eq!(queue.backoff_for(1), Duration::from_millis(100));
        assert_eq!(queue.backoff_for(2), Duration::from_millis(200));
        assert_eq!(queue.backoff_for(3), Duration::from_millis(400));
        assert_eq!(queue.backoff_for(10), Duration::from_millis(1_000));
        assert_eq!(queue.backoff_for(500), Duration::from_millis(1_000));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RetrieverConfig::default());
    }
}

//! Model configurations, capability assignments and persisted health.

use super::{Database, now_millis};
use crate::error::{CoreError, Result};
use focus_ai_models::{Capability, ClientConfig, ClientConfigBuilder, ProviderKind};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unreachable,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "HEALTHY",
            HealthState::Degraded => "DEGRADED",
            HealthState::Unreachable => "UNREACHABLE",
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "HEALTHY" => Ok(HealthState::Healthy),
            "DEGRADED" => Ok(HealthState::Degraded),
            "UNREACHABLE" => Ok(HealthState::Unreachable),
            other => Err(CoreError::Consistency(format!("unknown health state {other}"))),
        }
    }
}

/// Health bookkeeping persisted on the configuration row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelHealth {
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<i64>,
    pub last_success_at: Option<i64>,
}

impl Default for ModelHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            consecutive_failures: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelConfiguration {
    pub id: i64,
    pub display_name: String,
    pub provider: ProviderKind,
    pub model_id: String,
    pub capabilities: Vec<Capability>,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub is_local: bool,
    pub enabled: bool,
    pub max_context_tokens: Option<u32>,
    /// Embedding output size, when known up front
    pub dimension: Option<u32>,
    pub health: ModelHealth,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ModelConfiguration {
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Client settings for this configuration with the given per-call timeout.
    pub fn client_config(&self, timeout: Duration) -> Result<ClientConfig> {
        let mut builder = ClientConfigBuilder::default();
        builder
            .provider(self.provider)
            .model_id(self.model_id.clone())
            .base_url(self.base_url.clone())
            .api_key(self.api_key.clone())
            .timeout(timeout)
            .dimension(self.dimension.map(|d| d as usize));
        builder
            .build()
            .map_err(|e| CoreError::Config(format!("model #{}: {e}", self.id)))
    }
}

/// Fields supplied when registering a model.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewModelConfiguration {
    pub display_name: String,
    pub provider: String,
    pub model_id: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub max_context_tokens: Option<u32>,
    #[serde(default)]
    pub dimension: Option<u32>,
}

fn model_from_row(row: &SqliteRow) -> Result<ModelConfiguration> {
    let provider: String = row.get("provider");
    let capabilities: String = row.get("capabilities");
    let health_state: String = row.get("health_state");
    let consecutive_failures: i64 = row.get("consecutive_failures");
    let is_local: i64 = row.get("is_local");
    let enabled: i64 = row.get("enabled");
    let max_context_tokens: Option<i64> = row.get("max_context_tokens");
    let dimension: Option<i64> = row.get("dimension");

    Ok(ModelConfiguration {
        id: row.get("id"),
        display_name: row.get("display_name"),
        provider: provider.parse().map_err(CoreError::Consistency)?,
        model_id: row.get("model_id"),
        capabilities: serde_json::from_str(&capabilities)?,
        base_url: row.get("base_url"),
        api_key: row.get("api_key"),
        is_local: is_local != 0,
        enabled: enabled != 0,
        max_context_tokens: max_context_tokens.map(|v| v as u32),
        dimension: dimension.map(|v| v as u32),
        health: ModelHealth {
            state: health_state.parse()?,
            consecutive_failures: consecutive_failures.max(0) as u32,
            last_failure_at: row.get("last_failure_at"),
            last_success_at: row.get("last_success_at"),
        },
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl Database {
    pub async fn add_model_configuration(
        &self,
        new: &NewModelConfiguration,
    ) -> Result<ModelConfiguration> {
        if new.display_name.trim().is_empty() {
            return Err(CoreError::validation("display_name must not be empty"));
        }
        if new.model_id.trim().is_empty() {
            return Err(CoreError::validation("model_id must not be empty"));
        }
        if new.capabilities.is_empty() {
            return Err(CoreError::validation("a model needs at least one capability"));
        }
        let provider: ProviderKind = new.provider.parse().map_err(CoreError::Validation)?;
        if provider == ProviderKind::OpenAiCompatible && new.base_url.is_none() {
            return Err(CoreError::validation(
                "openai_compatible models need a base_url",
            ));
        }
        if new.dimension == Some(0) {
            return Err(CoreError::validation("dimension must be greater than zero"));
        }

        let mut capabilities = new.capabilities.clone();
        capabilities.sort();
        capabilities.dedup();

        let now = now_millis();
        let id = sqlx::query(
            r#"
            INSERT INTO model_configurations
                (display_name, provider, model_id, capabilities, base_url, api_key, is_local,
                 enabled, max_context_tokens, dimension, health_state, consecutive_failures,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, 'HEALTHY', 0, ?10, ?10)
            "#,
        )
        .bind(new.display_name.trim())
        .bind(provider.as_str())
        .bind(new.model_id.trim())
        .bind(serde_json::to_string(&capabilities)?)
        .bind(&new.base_url)
        .bind(&new.api_key)
        .bind(provider.is_local() as i64)
        .bind(new.max_context_tokens.map(|v| v as i64))
        .bind(new.dimension.map(|v| v as i64))
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        tracing::info!(
            "Registered model #{} {} ({} {})",
            id,
            new.display_name,
            provider,
            new.model_id
        );
        self.get_model_configuration(id)
            .await?
            .ok_or_else(|| CoreError::not_found("model configuration", id))
    }

    pub async fn get_model_configuration(&self, id: i64) -> Result<Option<ModelConfiguration>> {
        let row = sqlx::query("SELECT * FROM model_configurations WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(model_from_row).transpose()
    }

    pub async fn list_model_configurations(&self) -> Result<Vec<ModelConfiguration>> {
        let rows = sqlx::query("SELECT * FROM model_configurations ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(model_from_row).collect()
    }

    pub async fn set_model_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE model_configurations SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(enabled as i64)
        .bind(now_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("model configuration", id));
        }
        Ok(())
    }

    /// Remove a configuration; it drops out of every fallback chain.
    pub async fn delete_model_configuration(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM model_configurations WHERE id = ?1")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn save_model_health(&self, id: i64, health: &ModelHealth) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE model_configurations
            SET health_state = ?1, consecutive_failures = ?2, last_failure_at = ?3,
                last_success_at = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
        )
        .bind(health.state.as_str())
        .bind(health.consecutive_failures as i64)
        .bind(health.last_failure_at)
        .bind(health.last_success_at)
        .bind(now_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Replace the fallback chain for `capability`. Every model must exist and declare the
    /// capability; duplicates are rejected.
    pub async fn assign_capability(&self, capability: Capability, chain: &[i64]) -> Result<()> {
        for (i, id) in chain.iter().enumerate() {
            if chain[..i].contains(id) {
                return Err(CoreError::validation(format!(
                    "model #{id} appears twice in the {capability} chain"
                )));
            }
            let model = self
                .get_model_configuration(*id)
                .await?
                .ok_or_else(|| CoreError::not_found("model configuration", id))?;
            if !model.has_capability(capability) {
                return Err(CoreError::validation(format!(
                    "model #{id} {} does not declare {capability}",
                    model.display_name
                )));
            }
        }

        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM capability_assignments WHERE capability = ?1")
            .bind(capability.as_str())
            .execute(&mut *tx)
            .await?;
        for (position, id) in chain.iter().enumerate() {
            sqlx::query(
                "INSERT INTO capability_assignments (capability, position, model_config_id) VALUES (?1, ?2, ?3)",
            )
            .bind(capability.as_str())
            .bind(position as i64)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Ordered model ids assigned to `capability`.
    pub async fn capability_chain(&self, capability: Capability) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT model_config_id FROM capability_assignments WHERE capability = ?1 ORDER BY position",
        )
        .bind(capability.as_str())
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn list_capability_assignments(&self) -> Result<Vec<(Capability, Vec<i64>)>> {
        let mut out = Vec::new();
        for capability in Capability::ALL {
            let chain = self.capability_chain(capability).await?;
            if !chain.is_empty() {
                out.push((capability, chain));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_model(name: &str, caps: &[Capability]) -> NewModelConfiguration {
        NewModelConfiguration {
            display_name: name.to_string(),
            provider: "hashing".to_string(),
            model_id: name.to_string(),
            capabilities: caps.to_vec(),
            dimension: Some(16),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_and_list_models() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let model = db
            .add_model_configuration(&new_model("embedder", &[Capability::Embedding]))
            .await?;
        assert_eq!(model.provider, ProviderKind::Hashing);
        assert!(model.is_local);
        assert!(model.enabled);
        assert_eq!(model.health.state, HealthState::Healthy);
        assert_eq!(db.list_model_configurations().await?.len(), 1);

        let config = model.client_config(Duration::from_secs(5))?;
        assert_eq!(config.dimension, Some(16));
        assert_eq!(config.timeout, Duration::from_secs(5));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_invalid_models() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        assert!(db.add_model_configuration(&new_model("x", &[])).await.is_err());

        let mut bad_provider = new_model("y", &[Capability::TextGen]);
        bad_provider.provider = "carrier-pigeon".into();
        assert!(matches!(
            db.add_model_configuration(&bad_provider).await,
            Err(CoreError::Validation(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_assignment_chain_order_and_validation() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let a = db.add_model_configuration(&new_model("a", &[Capability::TextGen])).await?;
        let b = db.add_model_configuration(&new_model("b", &[Capability::TextGen])).await?;
        let e = db.add_model_configuration(&new_model("e", &[Capability::Embedding])).await?;

        db.assign_capability(Capability::TextGen, &[b.id, a.id]).await?;
        assert_eq!(db.capability_chain(Capability::TextGen).await?, vec![b.id, a.id]);

        assert!(db.assign_capability(Capability::TextGen, &[a.id, e.id]).await.is_err());
        assert!(db.assign_capability(Capability::TextGen, &[a.id, a.id]).await.is_err());
        // failed assignment leaves the old chain in place
        assert_eq!(db.capability_chain(Capability::TextGen).await?, vec![b.id, a.id]);

        db.delete_model_configuration(b.id).await?;
        assert_eq!(db.capability_chain(Capability::TextGen).await?, vec![a.id]);
        Ok(())
    }

    #[tokio::test]
    async fn test_health_round_trips() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let m = db.add_model_configuration(&new_model("m", &[Capability::Vision])).await?;
        let health = ModelHealth {
            state: HealthState::Degraded,
            consecutive_failures: 2,
            last_failure_at: Some(1_000),
            last_success_at: None,
        };
        db.save_model_health(m.id, &health).await?;
        let loaded = db.get_model_configuration(m.id).await?.unwrap();
        assert_eq!(loaded.health, health);
        Ok(())
    }
}

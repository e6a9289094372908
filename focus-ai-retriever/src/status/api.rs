use std::collections::HashSet;

use crate::error::{CoreError, Result};
use crate::retrieval::indexing_engine::IngestionEngine;
use crate::retrieval::task_queue::{Task, TaskKind};
use crate::storage::{Database, now_millis};
use focus_ai_models::Capability;

use super::{database::*, types::*};

/// Main status API implementation
pub struct StatusApi;

impl StatusApi {
    /// Snapshot of one task, for polling.
    pub async fn get_task_status(engine: &IngestionEngine, task_id: i64) -> Result<Task> {
        engine.get_status(task_id).await
    }

    /// Get comprehensive index statistics
    pub async fn get_index_statistics(engine: &IngestionEngine) -> Result<IndexStatistics> {
        let db = engine.database();
        let index = engine.vectors().index();
        Ok(IndexStatistics {
            documents: db.document_counts().await?,
            vector_count: index.len().await?,
            vector_dimension: index.dimension().await?,
            sessions_count: db.list_sessions().await?.len(),
            models_count: db.list_model_configurations().await?.len(),
        })
    }

    /// Get current ingestion status
    pub async fn get_ingestion_status(engine: &IngestionEngine) -> Result<IngestionStatus> {
        Ok(IngestionStatus {
            workers_running: engine.is_running(),
            queue: engine.queue().counts().await?,
            session_stats: engine.stats().await,
        })
    }

    /// Get index health check information
    pub async fn get_index_health(engine: &IngestionEngine) -> Result<IndexHealth> {
        let mut health = IndexHealth {
            database_connected: false,
            database_error: None,
            vector_store_connected: false,
            vector_store_error: None,
            database_integrity_ok: false,
            overall_status: HealthStatus::Critical,
        };

        match sqlx::query_scalar::<_, String>("PRAGMA quick_check")
            .fetch_one(engine.database().pool())
            .await
        {
            Ok(result) => {
                health.database_connected = true;
                health.database_integrity_ok = result == "ok";
            }
            Err(e) => health.database_error = Some(e.to_string()),
        }

        match engine.vectors().index().len().await {
            Ok(_) => health.vector_store_connected = true,
            Err(e) => health.vector_store_error = Some(e.to_string()),
        }

        health.overall_status = match (
            health.database_connected && health.vector_store_connected,
            health.database_integrity_ok,
        ) {
            (true, true) => HealthStatus::Healthy,
            (true, false) => HealthStatus::Warning,
            (false, _) => HealthStatus::Critical,
        };
        Ok(health)
    }

    /// Every configured model with its health
    pub async fn get_model_status(engine: &IngestionEngine) -> Result<Vec<ModelStatus>> {
        Ok(engine
            .database()
            .list_model_configurations()
            .await?
            .into_iter()
            .map(|m| ModelStatus {
                id: m.id,
                display_name: m.display_name,
                provider: m.provider.as_str().to_string(),
                model_id: m.model_id,
                capabilities: m.capabilities,
                enabled: m.enabled,
                is_local: m.is_local,
                health: m.health.state,
                consecutive_failures: m.health.consecutive_failures,
            })
            .collect())
    }

    /// Where each capability resolves right now
    pub async fn get_capability_routes(engine: &IngestionEngine) -> Result<Vec<CapabilityRoute>> {
        let mut routes = Vec::with_capacity(Capability::ALL.len());
        for capability in Capability::ALL {
            let chain = engine.database().capability_chain(capability).await?;
            let (resolved_model, error) = match engine.router().resolve(capability).await {
                Ok(model) => (Some(model.id), None),
                Err(e @ CoreError::NoCapableModel { .. }) => (None, Some(e.to_string())),
                Err(e) => return Err(e),
            };
            routes.push(CapabilityRoute {
                capability,
                chain,
                resolved_model,
                error,
            });
        }
        Ok(routes)
    }

    /// Get database information and statistics
    pub async fn get_database_info(db: &Database) -> Result<DatabaseInfo> {
        let pool = db.pool();
        let sqlite_version: String = sqlx::query_scalar("SELECT sqlite_version()")
            .fetch_one(pool)
            .await?;
        let journal_mode: Option<String> = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_optional(pool)
            .await?;
        let synchronous_mode: Option<i64> = sqlx::query_scalar("PRAGMA synchronous")
            .fetch_optional(pool)
            .await?;
        let synchronous_mode_str = synchronous_mode.map(|v| match v {
            0 => "OFF".to_string(),
            1 => "NORMAL".to_string(),
            2 => "FULL".to_string(),
            3 => "EXTRA".to_string(),
            _ => format!("{v}"),
        });
        let page_size: Option<i64> = sqlx::query_scalar("PRAGMA page_size")
            .fetch_optional(pool)
            .await?;
        let page_count: Option<i64> = sqlx::query_scalar("PRAGMA page_count")
            .fetch_optional(pool)
            .await?;

        let mut database_files = Vec::new();
        let mut total_size = 0u64;
        if let Some(db_path) = db.path() {
            for (path, file_type) in [
                (db_path.to_path_buf(), "main"),
                (db_path.with_extension("db-wal"), "wal"),
                (db_path.with_extension("db-shm"), "shm"),
            ] {
                if let Ok(metadata) = std::fs::metadata(&path) {
                    total_size += metadata.len();
                    database_files.push(DatabaseFile {
                        path: path.to_string_lossy().to_string(),
                        size_bytes: Some(metadata.len()),
                        file_type: file_type.to_string(),
                    });
                }
            }
        }

        Ok(DatabaseInfo {
            database_type: "SQLite".to_string(),
            database_version: Some(sqlite_version.clone()),
            connection_pool_status: ConnectionPoolStatus {
                total_connections: pool.size(),
                idle_connections: pool.num_idle(),
            },
            total_size_bytes: db.path().map(|_| total_size),
            database_files,
            sqlite_info: Some(SqliteInfo {
                version: sqlite_version,
                journal_mode,
                synchronous_mode: synchronous_mode_str,
                page_size: page_size.map(|p| p as u64),
                page_count: page_count.map(|p| p as u64),
            }),
        })
    }

    pub fn get_dependency_versions() -> DependencyVersions {
        DependencyVersions {
            retriever_version: env!("CARGO_PKG_VERSION").to_string(),
            rust_version: declared_or_unknown(option_env!("CARGO_PKG_RUST_VERSION")),
        }
    }

    /// Compare the relational rows with the vector store without repairing anything. The
    /// reconciliation sweep fixes what this reports.
    pub async fn validate_index_consistency(
        engine: &IngestionEngine,
    ) -> Result<IndexConsistencyReport> {
        let db = engine.database();
        let stored: HashSet<String> = engine
            .vectors()
            .index()
            .chunk_ids()
            .await?
            .into_iter()
            .collect();
        let live = db.live_child_ids().await?;
        let embedded = db.live_embedded_child_ids().await?;

        let mut missing: Vec<String> = embedded.difference(&stored).cloned().collect();
        missing.sort();
        let coverage = check(
            "Vector coverage",
            "Every embedded chunk has a vector",
            embedded.len(),
            ConsistencyStatus::Critical,
            missing
                .iter()
                .map(|id| format!("chunk {id} is marked embedded but has no vector"))
                .collect(),
        );

        let mut orphans: Vec<String> = stored.difference(&live).cloned().collect();
        orphans.sort();
        let orphan_check = check(
            "Orphan vectors",
            "Every vector belongs to a live chunk",
            stored.len(),
            ConsistencyStatus::Warning,
            orphans
                .iter()
                .map(|id| format!("vector {id} has no live chunk"))
                .collect(),
        );

        let delete_running = engine.queue().has_active(TaskKind::DeleteDocument).await?;
        let pending_purge = db.documents_pending_purge().await?;
        let purge_check = check(
            "Pending deletes",
            "Documents marked deleted have been purged",
            pending_purge.len(),
            ConsistencyStatus::Warning,
            if delete_running {
                Vec::new()
            } else {
                pending_purge
                    .iter()
                    .map(|id| format!("document {id} is marked deleted but not purged"))
                    .collect()
            },
        );

        let documents = db.list_documents().await?;
        let partial_check = check(
            "Failed units",
            "Documents ingested without unit parse failures",
            documents.len(),
            ConsistencyStatus::Warning,
            documents
                .iter()
                .filter(|d| d.failed_units > 0)
                .map(|d| {
                    format!(
                        "{}: {} unit(s) failed ({})",
                        d.source_path,
                        d.failed_units,
                        d.error_message.as_deref().unwrap_or("no detail")
                    )
                })
                .collect(),
        );

        let task_counts = engine.queue().counts().await?;
        let task_check = check(
            "Failed tasks",
            "No task ended FAILED",
            task_counts.total() as usize,
            ConsistencyStatus::Warning,
            if task_counts.failed > 0 {
                vec![format!("{} task(s) failed permanently", task_counts.failed)]
            } else {
                Vec::new()
            },
        );

        let checks = vec![coverage, orphan_check, purge_check, partial_check, task_check];
        let critical_issues: usize = checks
            .iter()
            .filter(|c| c.status == ConsistencyStatus::Critical)
            .map(|c| c.issues_found)
            .sum();
        let warning_issues: usize = checks
            .iter()
            .filter(|c| c.status == ConsistencyStatus::Warning)
            .map(|c| c.issues_found)
            .sum();

        let mut recommendations = Vec::new();
        if !missing.is_empty() || !orphans.is_empty() || (!pending_purge.is_empty() && !delete_running)
        {
            recommendations.push("Run `focus-retriever reconcile` to repair the vector store".to_string());
        }
        if task_counts.failed > 0 {
            recommendations.push("Inspect failed tasks with `focus-retriever tasks --status failed`".to_string());
        }

        let overall_status = if critical_issues > 0 {
            ConsistencyStatus::Critical
        } else if warning_issues > 0 {
            ConsistencyStatus::Warning
        } else {
            ConsistencyStatus::Healthy
        };

        Ok(IndexConsistencyReport {
            overall_status,
            checks_performed: checks,
            issues_summary: IssuesSummary {
                total_issues: critical_issues + warning_issues,
                critical_issues,
                warning_issues,
                recommendations,
            },
            check_timestamp: now_millis(),
        })
    }
}

/// A check that is healthy when `issues` is empty and `severity` otherwise.
fn check(
    name: &str,
    description: &str,
    items_checked: usize,
    severity: ConsistencyStatus,
    issues: Vec<String>,
) -> ConsistencyCheck {
    ConsistencyCheck {
        check_name: name.to_string(),
        status: if issues.is_empty() {
            ConsistencyStatus::Healthy
        } else {
            severity
        },
        description: description.to_string(),
        items_checked,
        issues_found: issues.len(),
        issue_details: issues,
    }
}

/// Cargo sets `CARGO_PKG_*` variables to an empty string when the field is absent.
pub(super) fn declared_or_unknown(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.to_string(),
        _ => "unknown".to_string(),
    }
}

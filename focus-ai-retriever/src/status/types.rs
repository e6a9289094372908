use crate::retrieval::indexing_engine::ProcessingStats;
use crate::retrieval::task_queue::TaskCounts;
use crate::storage::{DocumentCounts, HealthState};
use focus_ai_models::Capability;
use serde::Serialize;

/// Comprehensive index statistics
#[derive(Debug, Clone, Serialize)]
pub struct IndexStatistics {
    /// Documents by status plus chunk totals
    pub documents: DocumentCounts,
    /// Vectors held by the vector store
    pub vector_count: usize,
    /// Dimension fixed by the first stored vector
    pub vector_dimension: Option<usize>,
    pub sessions_count: usize,
    pub models_count: usize,
}

/// Current ingestion status
#[derive(Debug, Clone, Serialize)]
pub struct IngestionStatus {
    /// Are worker pools running in this process?
    pub workers_running: bool,
    pub queue: TaskCounts,
    /// Counters since the engine was constructed
    pub session_stats: ProcessingStats,
}

/// Index health check information
#[derive(Debug, Clone, Serialize)]
pub struct IndexHealth {
    pub database_connected: bool,
    pub database_error: Option<String>,
    pub vector_store_connected: bool,
    pub vector_store_error: Option<String>,
    /// Result of `PRAGMA quick_check` on the relational database
    pub database_integrity_ok: bool,
    pub overall_status: HealthStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// One configured model as the router sees it
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub id: i64,
    pub display_name: String,
    pub provider: String,
    pub model_id: String,
    pub capabilities: Vec<Capability>,
    pub enabled: bool,
    pub is_local: bool,
    pub health: HealthState,
    pub consecutive_failures: u32,
}

/// A capability's fallback chain and where it currently resolves
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityRoute {
    pub capability: Capability,
    pub chain: Vec<i64>,
    pub resolved_model: Option<i64>,
    pub error: Option<String>,
}

/// Index consistency check results
#[derive(Debug, Clone, Serialize)]
pub struct IndexConsistencyReport {
    pub overall_status: ConsistencyStatus,
    pub checks_performed: Vec<ConsistencyCheck>,
    pub issues_summary: IssuesSummary,
    /// Unix milliseconds
    pub check_timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsistencyStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyCheck {
    pub check_name: String,
    pub status: ConsistencyStatus,
    /// Description of what was checked
    pub description: String,
    pub items_checked: usize,
    pub issues_found: usize,
    pub issue_details: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuesSummary {
    pub total_issues: usize,
    pub critical_issues: usize,
    pub warning_issues: usize,
    pub recommendations: Vec<String>,
}

/// Version information for the workspace crates
#[derive(Debug, Clone, Serialize)]
pub struct DependencyVersions {
    pub retriever_version: String,
    pub rust_version: String,
}

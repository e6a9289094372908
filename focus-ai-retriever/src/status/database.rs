use serde::Serialize;

/// Database information and statistics
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseInfo {
    pub database_type: String,
    pub database_version: Option<String>,
    pub connection_pool_status: ConnectionPoolStatus,
    /// Database file locations and sizes; empty for in-memory stores
    pub database_files: Vec<DatabaseFile>,
    pub total_size_bytes: Option<u64>,
    pub sqlite_info: Option<SqliteInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionPoolStatus {
    /// Connections currently open
    pub total_connections: u32,
    /// Open connections not in use
    pub idle_connections: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseFile {
    pub path: String,
    pub size_bytes: Option<u64>,
    /// main, wal or shm
    pub file_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqliteInfo {
    pub version: String,
    /// Journal mode (WAL, DELETE, etc.)
    pub journal_mode: Option<String>,
    pub synchronous_mode: Option<String>,
    pub page_size: Option<u64>,
    pub page_count: Option<u64>,
}

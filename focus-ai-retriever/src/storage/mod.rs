//! Relational storage for focus-ai-retriever.
//!
//! One SQLite database holds every entity except the vectors themselves: tasks, documents and
//! their parent/child chunks, model configurations and capability assignments, chat sessions,
//! messages and pins. Vectors live in their own database file behind
//! [`VectorIndex`](crate::retrieval::vector_index::VectorIndex).
//!
//! Entity-specific queries are split across submodules as `impl Database` blocks:
//!
//! - [`documents`]: documents, parent chunks, child chunks, two-phase delete bookkeeping
//! - [`models`]: model configurations, capability assignments, persisted health
//! - [`sessions`]: chat sessions, messages and pinned documents
//!
//! The task table is owned by [`TaskQueue`](crate::retrieval::task_queue::TaskQueue).
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE documents (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     source_path TEXT UNIQUE NOT NULL,
//!     content_hash TEXT NOT NULL,        -- as supplied at submission
//!     processed_hash TEXT,               -- hex blake3 of the bytes last chunked
//!     status TEXT NOT NULL,              -- PENDING | PROCESSING | CHUNKED | VECTORIZED | FAILED
//!     failed_units INTEGER NOT NULL,
//!     error_message TEXT,
//!     deleted_at INTEGER,                -- phase one of a delete
//!     created_at INTEGER, updated_at INTEGER
//! );
//!
//! CREATE TABLE parent_chunks (
//!     id TEXT PRIMARY KEY,               -- hex blake3(document_id, sequence_index, content hash)
//!     document_id INTEGER REFERENCES documents(id) ON DELETE CASCADE,
//!     sequence_index INTEGER,            -- UNIQUE with document_id
//!     modality TEXT,                     -- TEXT | IMAGE | TABLE
//!     raw_content TEXT, metadata TEXT, content_hash TEXT, parse_error TEXT
//! );
//!
//! CREATE TABLE child_chunks (
//!     id TEXT PRIMARY KEY,               -- hex blake3(parent id, window index, text hash)
//!     parent_chunk_id TEXT REFERENCES parent_chunks(id) ON DELETE CASCADE,
//!     document_id INTEGER, window_index INTEGER, text TEXT, token_count INTEGER,
//!     vector_dim INTEGER, embedded_at INTEGER
//! );
//! ```
//!
//! All timestamps are Unix milliseconds.

use crate::error::Result;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod documents;
pub mod models;
pub mod sessions;

pub use documents::*;
pub use models::*;
pub use sessions::*;

/// File name of the relational database inside the data directory.
pub const DATABASE_FILE: &str = "focus.db";

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Handle to the relational database. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (creating if needed) the database in `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join(DATABASE_FILE);
        let pool = Self::connect_file(&db_path, 8).await?;
        Self::new_with_pool(pool, Some(db_path)).await
    }

    /// In-memory database for tests. Uses a single connection so every query sees the same data.
    pub async fn open_memory() -> Result<Self> {
        let pool = Self::connect_memory().await?;
        Self::new_with_pool(pool, None).await
    }

    pub(crate) async fn connect_memory() -> Result<SqlitePool> {
        // The database lives as long as its only connection does
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(
                SqliteConnectOptions::new()
                    .in_memory(true)
                    .foreign_keys(true),
            )
            .await?;
        Ok(pool)
    }

    pub(crate) async fn connect_file(path: &Path, max_connections: u32) -> Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(path)
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
                    .foreign_keys(true)
                    .create_if_missing(true),
            )
            .await?;
        Ok(pool)
    }

    async fn new_with_pool(pool: SqlitePool, path: Option<PathBuf>) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool, path })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Location of the database file; `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                priority INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                result_json TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0,
                available_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                started_at INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_path TEXT UNIQUE NOT NULL,
                content_hash TEXT NOT NULL,
                processed_hash TEXT,
                status TEXT NOT NULL,
                failed_units INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                deleted_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS parent_chunks (
                id TEXT PRIMARY KEY,
                document_id INTEGER NOT NULL,
                sequence_index INTEGER NOT NULL,
                modality TEXT NOT NULL,
                raw_content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                parse_error TEXT,
                created_at INTEGER NOT NULL,
                CONSTRAINT unique_parent_sequence UNIQUE(document_id, sequence_index),
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS child_chunks (
                id TEXT PRIMARY KEY,
                parent_chunk_id TEXT NOT NULL,
                document_id INTEGER NOT NULL,
                window_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                vector_dim INTEGER,
                embedded_at INTEGER,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (parent_chunk_id) REFERENCES parent_chunks(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS model_configurations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                display_name TEXT NOT NULL,
                provider TEXT NOT NULL,
                model_id TEXT NOT NULL,
                capabilities TEXT NOT NULL,
                base_url TEXT,
                api_key TEXT,
                is_local INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                max_context_tokens INTEGER,
                dimension INTEGER,
                health_state TEXT NOT NULL DEFAULT 'HEALTHY',
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_failure_at INTEGER,
                last_success_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS capability_assignments (
                capability TEXT NOT NULL,
                position INTEGER NOT NULL,
                model_config_id INTEGER NOT NULL,
                PRIMARY KEY (capability, position),
                CONSTRAINT unique_capability_model UNIQUE(capability, model_config_id),
                FOREIGN KEY (model_config_id) REFERENCES model_configurations(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                token_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pinned_documents (
                session_id INTEGER NOT NULL,
                document_id INTEGER NOT NULL,
                pinned_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, document_id),
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        // Create indexes
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(status, priority DESC, available_at, id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_parent_chunks_document ON parent_chunks(document_id, sequence_index)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_child_chunks_parent ON child_chunks(parent_chunk_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_child_chunks_document ON child_chunks(document_id)",
        )
        .execute(pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, id)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

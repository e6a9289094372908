//! Documents and their parent/child chunks.

use super::{Database, now_millis};
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Chunked,
    Vectorized,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Chunked => "CHUNKED",
            DocumentStatus::Vectorized => "VECTORIZED",
            DocumentStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(DocumentStatus::Pending),
            "PROCESSING" => Ok(DocumentStatus::Processing),
            "CHUNKED" => Ok(DocumentStatus::Chunked),
            "VECTORIZED" => Ok(DocumentStatus::Vectorized),
            "FAILED" => Ok(DocumentStatus::Failed),
            other => Err(CoreError::Consistency(format!(
                "unknown document status {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Modality {
    Text,
    Image,
    Table,
}

impl Modality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::Text => "TEXT",
            Modality::Image => "IMAGE",
            Modality::Table => "TABLE",
        }
    }
}

impl FromStr for Modality {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TEXT" => Ok(Modality::Text),
            "IMAGE" => Ok(Modality::Image),
            "TABLE" => Ok(Modality::Table),
            other => Err(CoreError::Consistency(format!("unknown modality {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub source_path: String,
    /// Hash supplied at submission; resubmitting the same value is a no-op
    pub content_hash: String,
    /// blake3 of the bytes the last chunking run read
    pub processed_hash: Option<String>,
    pub status: DocumentStatus,
    /// Parent chunks that failed to parse on the last run
    pub failed_units: u32,
    pub error_message: Option<String>,
    pub deleted_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DocumentRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A structural unit of a document: a section, a table or an image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParentChunkRecord {
    pub id: String,
    pub document_id: i64,
    pub sequence_index: u32,
    pub modality: Modality,
    pub raw_content: String,
    pub metadata: serde_json::Value,
    pub content_hash: String,
    /// Set when the unit could not be parsed; such chunks are never vectorized
    pub parse_error: Option<String>,
}

/// A retrievable window of a parent chunk; the unit that gets embedded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildChunkRecord {
    pub id: String,
    pub parent_chunk_id: String,
    pub document_id: i64,
    pub window_index: u32,
    pub text: String,
    pub token_count: u32,
    pub vector_dim: Option<u32>,
    pub embedded_at: Option<i64>,
}

/// Row counts used by the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DocumentCounts {
    pub documents: u64,
    pub pending: u64,
    pub processing: u64,
    pub chunked: u64,
    pub vectorized: u64,
    pub failed: u64,
    pub marked_deleted: u64,
    pub parent_chunks: u64,
    pub failed_units: u64,
    pub child_chunks: u64,
    pub embedded_child_chunks: u64,
}

fn document_from_row(row: &SqliteRow) -> Result<DocumentRecord> {
    let status: String = row.get("status");
    let failed_units: i64 = row.get("failed_units");
    Ok(DocumentRecord {
        id: row.get("id"),
        source_path: row.get("source_path"),
        content_hash: row.get("content_hash"),
        processed_hash: row.get("processed_hash"),
        status: status.parse()?,
        failed_units: failed_units.max(0) as u32,
        error_message: row.get("error_message"),
        deleted_at: row.get("deleted_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parent_from_row(row: &SqliteRow) -> Result<ParentChunkRecord> {
    let modality: String = row.get("modality");
    let metadata: String = row.get("metadata");
    let sequence_index: i64 = row.get("sequence_index");
    Ok(ParentChunkRecord {
        id: row.get("id"),
        document_id: row.get("document_id"),
        sequence_index: sequence_index as u32,
        modality: modality.parse()?,
        raw_content: row.get("raw_content"),
        metadata: serde_json::from_str(&metadata)?,
        content_hash: row.get("content_hash"),
        parse_error: row.get("parse_error"),
    })
}

fn child_from_row(row: &SqliteRow) -> ChildChunkRecord {
    let window_index: i64 = row.get("window_index");
    let token_count: i64 = row.get("token_count");
    let vector_dim: Option<i64> = row.get("vector_dim");
    ChildChunkRecord {
        id: row.get("id"),
        parent_chunk_id: row.get("parent_chunk_id"),
        document_id: row.get("document_id"),
        window_index: window_index as u32,
        text: row.get("text"),
        token_count: token_count as u32,
        vector_dim: vector_dim.map(|d| d as u32),
        embedded_at: row.get("embedded_at"),
    }
}

const DOCUMENT_COLUMNS: &str = "id, source_path, content_hash, processed_hash, status, failed_units, error_message, deleted_at, created_at, updated_at";
const CHILD_COLUMNS: &str =
    "c.id, c.parent_chunk_id, c.document_id, c.window_index, c.text, c.token_count, c.vector_dim, c.embedded_at";

impl Database {
    /// Record `source_path` with `content_hash`. A new path starts PENDING; a known path whose hash
    /// changed goes back to PENDING; an unchanged path is left alone.
    pub async fn register_document(
        &self,
        source_path: &str,
        content_hash: &str,
    ) -> Result<DocumentRecord> {
        if let Some(existing) = self.get_document_by_path(source_path).await? {
            if existing.is_deleted() {
                return Err(CoreError::validation(format!(
                    "document {} ({source_path}) is being deleted",
                    existing.id
                )));
            }
            if existing.content_hash == content_hash {
                return Ok(existing);
            }
            sqlx::query(
                "UPDATE documents SET content_hash = ?1, status = 'PENDING', error_message = NULL, updated_at = ?2 WHERE id = ?3",
            )
            .bind(content_hash)
            .bind(now_millis())
            .bind(existing.id)
            .execute(self.pool())
            .await?;
            return self
                .get_document(existing.id)
                .await?
                .ok_or_else(|| CoreError::not_found("document", existing.id));
        }

        let now = now_millis();
        let id = sqlx::query(
            r#"
            INSERT INTO documents (source_path, content_hash, status, failed_units, created_at, updated_at)
            VALUES (?1, ?2, 'PENDING', 0, ?3, ?3)
            "#,
        )
        .bind(source_path)
        .bind(content_hash)
        .bind(now)
        .execute(self.pool())
        .await?
        .last_insert_rowid();

        self.get_document(id)
            .await?
            .ok_or_else(|| CoreError::not_found("document", id))
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn get_document_by_path(&self, source_path: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE source_path = ?1"
        ))
        .bind(source_path)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    /// Documents not marked deleted, oldest first.
    pub async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE deleted_at IS NULL ORDER BY id"
        ))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn set_document_status(
        &self,
        id: i64,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE documents SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(now_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Record the outcome of chunking: the digest of the bytes read and the partial-failure tally.
    /// The submitted `content_hash` is left as is.
    pub async fn set_document_chunked(
        &self,
        id: i64,
        processed_hash: &str,
        failed_units: u32,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents
            SET status = 'CHUNKED', processed_hash = ?1, failed_units = ?2, error_message = ?3, updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(processed_hash)
        .bind(failed_units as i64)
        .bind(error_message)
        .bind(now_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Replace a document's parent chunks with `parents`.
    ///
    /// Parents whose id survives are kept untouched (ids are content-derived, so an unchanged
    /// region is a no-op). Parents that disappeared are deleted along with their children, whose
    /// ids are returned so the caller can drop their vectors.
    pub async fn replace_parent_chunks(
        &self,
        document_id: i64,
        parents: &[ParentChunkRecord],
    ) -> Result<Vec<String>> {
        let keep: HashSet<&str> = parents.iter().map(|p| p.id.as_str()).collect();
        let mut tx = self.pool().begin().await?;

        let existing: Vec<String> =
            sqlx::query_scalar("SELECT id FROM parent_chunks WHERE document_id = ?1")
                .bind(document_id)
                .fetch_all(&mut *tx)
                .await?;

        let mut stale_children = Vec::new();
        for parent_id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
            let children: Vec<String> =
                sqlx::query_scalar("SELECT id FROM child_chunks WHERE parent_chunk_id = ?1")
                    .bind(parent_id)
                    .fetch_all(&mut *tx)
                    .await?;
            stale_children.extend(children);
            sqlx::query("DELETE FROM parent_chunks WHERE id = ?1")
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;
        }

        let now = now_millis();
        for parent in parents {
            sqlx::query(
                r#"
                INSERT INTO parent_chunks
                    (id, document_id, sequence_index, modality, raw_content, metadata, content_hash, parse_error, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&parent.id)
            .bind(document_id)
            .bind(parent.sequence_index as i64)
            .bind(parent.modality.as_str())
            .bind(&parent.raw_content)
            .bind(serde_json::to_string(&parent.metadata)?)
            .bind(&parent.content_hash)
            .bind(&parent.parse_error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(stale_children)
    }

    pub async fn parent_chunks(&self, document_id: i64) -> Result<Vec<ParentChunkRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, sequence_index, modality, raw_content, metadata, content_hash, parse_error
            FROM parent_chunks WHERE document_id = ?1 ORDER BY sequence_index
            "#,
        )
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(parent_from_row).collect()
    }

    /// Replace the children of one parent. Returns `(inserted, stale child ids)`.
    pub async fn replace_child_chunks(
        &self,
        parent_chunk_id: &str,
        children: &[ChildChunkRecord],
    ) -> Result<(usize, Vec<String>)> {
        let keep: HashSet<&str> = children.iter().map(|c| c.id.as_str()).collect();
        let mut tx = self.pool().begin().await?;

        let existing: Vec<String> =
            sqlx::query_scalar("SELECT id FROM child_chunks WHERE parent_chunk_id = ?1")
                .bind(parent_chunk_id)
                .fetch_all(&mut *tx)
                .await?;
        let stale: Vec<String> = existing
            .into_iter()
            .filter(|id| !keep.contains(id.as_str()))
            .collect();
        for id in &stale {
            sqlx::query("DELETE FROM child_chunks WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }

        let now = now_millis();
        let mut inserted = 0;
        for child in children {
            let result = sqlx::query(
                r#"
                INSERT INTO child_chunks
                    (id, parent_chunk_id, document_id, window_index, text, token_count, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(&child.id)
            .bind(parent_chunk_id)
            .bind(child.document_id)
            .bind(child.window_index as i64)
            .bind(&child.text)
            .bind(child.token_count as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }

        tx.commit().await?;
        Ok((inserted, stale))
    }

    /// Children of a document's parseable parents that have no vector yet, in document order.
    pub async fn child_chunks_needing_embedding(
        &self,
        document_id: i64,
    ) -> Result<Vec<ChildChunkRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CHILD_COLUMNS}
            FROM child_chunks c JOIN parent_chunks p ON p.id = c.parent_chunk_id
            WHERE c.document_id = ?1 AND c.embedded_at IS NULL AND p.parse_error IS NULL
            ORDER BY p.sequence_index, c.window_index
            "#
        ))
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(child_from_row).collect())
    }

    pub async fn mark_children_embedded(&self, ids: &[String], vector_dim: usize) -> Result<()> {
        let now = now_millis();
        let mut tx = self.pool().begin().await?;
        for id in ids {
            sqlx::query("UPDATE child_chunks SET vector_dim = ?1, embedded_at = ?2 WHERE id = ?3")
                .bind(vector_dim as i64)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Forget embeddings for children (used when the vector store lost them).
    pub async fn clear_child_embeddings(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for id in ids {
            sqlx::query("UPDATE child_chunks SET vector_dim = NULL, embedded_at = NULL WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Live child chunks among `ids`: rows that exist and whose document is not marked deleted.
    pub async fn live_child_chunks(&self, ids: &[String]) -> Result<Vec<ChildChunkRecord>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let row = sqlx::query(&format!(
                r#"
                SELECT {CHILD_COLUMNS}
                FROM child_chunks c JOIN documents d ON d.id = c.document_id
                WHERE c.id = ?1 AND d.deleted_at IS NULL
                "#
            ))
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
            if let Some(row) = row {
                out.push(child_from_row(&row));
            }
        }
        Ok(out)
    }

    /// Every child chunk of a live document, in document order.
    pub async fn child_chunks_for_document(
        &self,
        document_id: i64,
    ) -> Result<Vec<ChildChunkRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {CHILD_COLUMNS}
            FROM child_chunks c
            JOIN parent_chunks p ON p.id = c.parent_chunk_id
            JOIN documents d ON d.id = c.document_id
            WHERE c.document_id = ?1 AND d.deleted_at IS NULL
            ORDER BY p.sequence_index, c.window_index
            "#
        ))
        .bind(document_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(child_from_row).collect())
    }

    pub async fn child_chunk_ids_for_document(&self, document_id: i64) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM child_chunks WHERE document_id = ?1 ORDER BY id")
                .bind(document_id)
                .fetch_all(self.pool())
                .await?,
        )
    }

    /// Ids of every child belonging to a live document, embedded or not.
    pub async fn live_child_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT c.id FROM child_chunks c JOIN documents d ON d.id = c.document_id WHERE d.deleted_at IS NULL",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Ids of embedded children belonging to live documents.
    pub async fn live_embedded_child_ids(&self) -> Result<HashSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT c.id FROM child_chunks c JOIN documents d ON d.id = c.document_id
            WHERE d.deleted_at IS NULL AND c.embedded_at IS NOT NULL
            "#,
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids.into_iter().collect())
    }

    /// Phase one of a delete: hide the document from every read path.
    pub async fn mark_document_deleted(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(now_millis())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Phase three of a delete: drop the document row; chunks and pins cascade.
    pub async fn purge_document(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE id = ?1 AND deleted_at IS NOT NULL")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Documents marked deleted but not yet purged.
    pub async fn documents_pending_purge(&self) -> Result<Vec<i64>> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM documents WHERE deleted_at IS NOT NULL ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?)
    }

    pub async fn document_counts(&self) -> Result<DocumentCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS documents,
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND status = 'PENDING' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND status = 'PROCESSING' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND status = 'CHUNKED' THEN 1 ELSE 0 END), 0) AS chunked,
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND status = 'VECTORIZED' THEN 1 ELSE 0 END), 0) AS vectorized,
                COALESCE(SUM(CASE WHEN deleted_at IS NULL AND status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN deleted_at IS NOT NULL THEN 1 ELSE 0 END), 0) AS marked_deleted
            FROM documents
            "#,
        )
        .fetch_one(self.pool())
        .await?;

        let parent_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM parent_chunks")
            .fetch_one(self.pool())
            .await?;
        let failed_units: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM parent_chunks WHERE parse_error IS NOT NULL")
                .fetch_one(self.pool())
                .await?;
        let child_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM child_chunks")
            .fetch_one(self.pool())
            .await?;
        let embedded: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM child_chunks WHERE embedded_at IS NOT NULL")
                .fetch_one(self.pool())
                .await?;

        let get = |name: &str| -> u64 { row.get::<i64, _>(name).max(0) as u64 };
        Ok(DocumentCounts {
            documents: get("documents"),
            pending: get("pending"),
            processing: get("processing"),
            chunked: get("chunked"),
            vectorized: get("vectorized"),
            failed: get("failed"),
            marked_deleted: get("marked_deleted"),
            parent_chunks: parent_chunks as u64,
            failed_units: failed_units as u64,
            child_chunks: child_chunks as u64,
            embedded_child_chunks: embedded as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parent(document_id: i64, seq: u32, id: &str) -> ParentChunkRecord {
        ParentChunkRecord {
            id: id.to_string(),
            document_id,
            sequence_index: seq,
            modality: Modality::Text,
            raw_content: format!("section {seq}"),
            metadata: serde_json::json!({}),
            content_hash: format!("h{seq}"),
            parse_error: None,
        }
    }

    fn child(parent: &ParentChunkRecord, window: u32, id: &str) -> ChildChunkRecord {
        ChildChunkRecord {
            id: id.to_string(),
            parent_chunk_id: parent.id.clone(),
            document_id: parent.document_id,
            window_index: window,
            text: format!("{} window {window}", parent.raw_content),
            token_count: 3,
            vector_dim: None,
            embedded_at: None,
        }
    }

    #[tokio::test]
    async fn test_register_document_tracks_hash_changes() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;

        let first = db.register_document("/docs/a.md", "aaa").await?;
        assert_eq!(first.status, DocumentStatus::Pending);

        db.set_document_status(first.id, DocumentStatus::Vectorized, None)
            .await?;
        let same = db.register_document("/docs/a.md", "aaa").await?;
        assert_eq!(same.id, first.id);
        assert_eq!(same.status, DocumentStatus::Vectorized);

        let changed = db.register_document("/docs/a.md", "bbb").await?;
        assert_eq!(changed.id, first.id);
        assert_eq!(changed.status, DocumentStatus::Pending);
        assert_eq!(changed.content_hash, "bbb");
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_parents_is_idempotent_and_reports_stale_children() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let doc = db.register_document("/docs/b.md", "h").await?;

        let p0 = parent(doc.id, 0, "p0");
        let p1 = parent(doc.id, 1, "p1");
        assert!(db.replace_parent_chunks(doc.id, &[p0.clone(), p1.clone()]).await?.is_empty());
        assert!(db.replace_parent_chunks(doc.id, &[p0.clone(), p1.clone()]).await?.is_empty());
        assert_eq!(db.parent_chunks(doc.id).await?.len(), 2);

        let (inserted, stale) = db.replace_child_chunks("p1", &[child(&p1, 0, "c10")]).await?;
        assert_eq!((inserted, stale.len()), (1, 0));
        let (inserted, _) = db.replace_child_chunks("p1", &[child(&p1, 0, "c10")]).await?;
        assert_eq!(inserted, 0);

        // p1 changes content and therefore id
        let p1b = parent(doc.id, 1, "p1b");
        let stale = db.replace_parent_chunks(doc.id, &[p0, p1b]).await?;
        assert_eq!(stale, vec!["c10".to_string()]);
        let ids: Vec<_> = db.parent_chunks(doc.id).await?.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["p0", "p1b"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_documents_are_hidden_then_purged() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let doc = db.register_document("/docs/c.md", "h").await?;
        let p0 = parent(doc.id, 0, "p0");
        db.replace_parent_chunks(doc.id, &[p0.clone()]).await?;
        db.replace_child_chunks("p0", &[child(&p0, 0, "c0")]).await?;

        assert_eq!(db.live_child_chunks(&["c0".to_string()]).await?.len(), 1);
        assert!(db.mark_document_deleted(doc.id).await?);
        assert!(!db.mark_document_deleted(doc.id).await?);
        assert!(db.live_child_chunks(&["c0".to_string()]).await?.is_empty());
        assert_eq!(db.documents_pending_purge().await?, vec![doc.id]);
        assert!(db.register_document("/docs/c.md", "h").await.is_err());

        db.purge_document(doc.id).await?;
        assert!(db.get_document(doc.id).await?.is_none());
        assert!(db.child_chunk_ids_for_document(doc.id).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_parse_errors_are_skipped_for_embedding() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let doc = db.register_document("/docs/d.md", "h").await?;
        let good = parent(doc.id, 0, "good");
        let mut bad = parent(doc.id, 1, "bad");
        bad.parse_error = Some("ragged table".into());
        db.replace_parent_chunks(doc.id, &[good.clone(), bad.clone()]).await?;
        db.replace_child_chunks("good", &[child(&good, 0, "g0")]).await?;
        db.replace_child_chunks("bad", &[child(&bad, 0, "b0")]).await?;

        let pending = db.child_chunks_needing_embedding(doc.id).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "g0");

        db.mark_children_embedded(&["g0".to_string()], 8).await?;
        assert!(db.child_chunks_needing_embedding(doc.id).await?.is_empty());
        let counts = db.document_counts().await?;
        assert_eq!(counts.failed_units, 1);
        assert_eq!(counts.embedded_child_chunks, 1);
        Ok(())
    }
}

//! Vector storage and the manager that keeps it consistent with the relational rows.
//!
//! [`VectorIndex`] is the storage seam: it maps a child chunk id to an f16 vector plus the
//! document and parent ids needed for filtering. [`SqliteVectorIndex`] keeps the vectors in their
//! own database file next to the relational one and answers queries with an exhaustive cosine
//! scan, which is exact and plenty fast for a personal knowledge base.
//!
//! [`VectorIndexManager`] sits on top and owns the invariants that span both stores:
//!
//! - one dimension per index; a vector of any other size is a
//!   [`CoreError::DimensionMismatch`], never truncated or padded
//! - query hits are hydrated against live child rows, so chunks of a deleted document never
//!   surface even if their vectors are still on disk
//! - deletes are relational first: mark the document deleted, remove its vectors, purge its rows
//! - [`VectorIndexManager::reconcile`] repairs whatever an interrupted delete or re-ingest left
//!   behind

use crate::error::{CoreError, Result};
use crate::storage::{ChildChunkRecord, Database};
use async_trait::async_trait;
use half::f16;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// File name of the vector store inside the data directory.
pub const VECTOR_DATABASE_FILE: &str = "vectors.db";

/// One stored vector.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub chunk_id: String,
    pub document_id: i64,
    pub parent_chunk_id: String,
    pub vector: Vec<f16>,
}

/// Restricts a query.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    /// Only consider these documents
    pub document_ids: Option<Vec<i64>>,
    /// Never return these chunks
    pub exclude_chunk_ids: HashSet<String>,
}

impl VectorFilter {
    fn allows(&self, chunk_id: &str, document_id: i64) -> bool {
        !self.exclude_chunk_ids.contains(chunk_id)
            && self
                .document_ids
                .as_ref()
                .is_none_or(|ids| ids.contains(&document_id))
    }
}

/// A scored query result. Scores are in `[0, 1]`, higher is closer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub chunk_id: String,
    pub score: f32,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// The index dimension, once the first vector fixed it.
    async fn dimension(&self) -> Result<Option<usize>>;

    /// Insert or overwrite vectors. All must have the index dimension.
    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize>;

    /// Top `k` vectors by similarity, score descending, ties broken by chunk id.
    async fn query(&self, vector: &[f16], k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>>;

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize>;

    async fn delete_document(&self, document_id: i64) -> Result<usize>;

    /// Every stored chunk id.
    async fn chunk_ids(&self) -> Result<Vec<String>>;

    async fn len(&self) -> Result<usize>;
}

/// Map cosine similarity from `[-1, 1]` onto `[0, 1]`.
pub fn cosine_score(a: &[f16], b: &[f16]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.5;
    }
    let cosine = dot / (norm_a.sqrt() * norm_b.sqrt());
    ((1.0 + cosine) / 2.0).clamp(0.0, 1.0)
}

/// SQLite-backed vector store.
#[derive(Clone, Debug)]
pub struct SqliteVectorIndex {
    pool: SqlitePool,
}

impl SqliteVectorIndex {
    pub async fn open(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let pool = Database::connect_file(&data_dir.join(VECTOR_DATABASE_FILE), 4).await?;
        Self::with_pool(pool).await
    }

    pub async fn open_memory() -> Result<Self> {
        Self::with_pool(Database::connect_memory().await?).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS index_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                chunk_id TEXT PRIMARY KEY,
                document_id INTEGER NOT NULL,
                parent_chunk_id TEXT NOT NULL,
                dimension INTEGER NOT NULL,
                vector BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_document ON vectors(document_id)")
            .execute(&pool)
            .await?;
        Ok(Self { pool })
    }

    /// Fix the dimension up front. Fails if the index already has a different one.
    pub async fn configure_dimension(&self, dimension: usize) -> Result<()> {
        match self.dimension().await? {
            Some(existing) if existing != dimension => Err(CoreError::DimensionMismatch {
                expected: existing,
                actual: dimension,
            }),
            Some(_) => Ok(()),
            None => {
                sqlx::query("INSERT INTO index_meta (key, value) VALUES ('dimension', ?1)")
                    .bind(dimension.to_string())
                    .execute(&self.pool)
                    .await?;
                info!("Vector index dimension set to {}", dimension);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl VectorIndex for SqliteVectorIndex {
    async fn dimension(&self) -> Result<Option<usize>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM index_meta WHERE key = 'dimension'")
                .fetch_optional(&self.pool)
                .await?;
        value
            .map(|v| {
                v.parse::<usize>().map_err(|_| {
                    CoreError::Consistency(format!("vector index has a corrupt dimension: {v}"))
                })
            })
            .transpose()
    }

    async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
        let Some(first) = entries.first() else {
            return Ok(0);
        };
        let dimension = match self.dimension().await? {
            Some(d) => d,
            None => {
                self.configure_dimension(first.vector.len()).await?;
                first.vector.len()
            }
        };
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != dimension) {
            return Err(CoreError::DimensionMismatch {
                expected: dimension,
                actual: bad.vector.len(),
            });
        }

        let now = crate::storage::now_millis();
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO vectors (chunk_id, document_id, parent_chunk_id, dimension, vector, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    parent_chunk_id = excluded.parent_chunk_id,
                    dimension = excluded.dimension,
                    vector = excluded.vector,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.chunk_id)
            .bind(entry.document_id)
            .bind(&entry.parent_chunk_id)
            .bind(dimension as i64)
            .bind(bytemuck::cast_slice::<f16, u8>(&entry.vector))
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(entries.len())
    }

    async fn query(&self, vector: &[f16], k: usize, filter: &VectorFilter) -> Result<Vec<VectorHit>> {
        let Some(dimension) = self.dimension().await? else {
            return Ok(Vec::new());
        };
        if vector.len() != dimension {
            return Err(CoreError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query("SELECT chunk_id, document_id, vector FROM vectors")
            .fetch_all(&self.pool)
            .await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let chunk_id: String = row.get("chunk_id");
            let document_id: i64 = row.get("document_id");
            if !filter.allows(&chunk_id, document_id) {
                continue;
            }
            let bytes: Vec<u8> = row.get("vector");
            let stored: Vec<f16> = bytemuck::pod_collect_to_vec(&bytes);
            if stored.len() != dimension {
                warn!("Skipping vector {} with {} dimensions", chunk_id, stored.len());
                continue;
            }
            hits.push(VectorHit {
                score: cosine_score(vector, &stored),
                chunk_id,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        let mut removed = 0;
        let mut tx = self.pool.begin().await?;
        for id in chunk_ids {
            removed += sqlx::query("DELETE FROM vectors WHERE chunk_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_document(&self, document_id: i64) -> Result<usize> {
        let result = sqlx::query("DELETE FROM vectors WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn chunk_ids(&self) -> Result<Vec<String>> {
        Ok(sqlx::query_scalar("SELECT chunk_id FROM vectors ORDER BY chunk_id")
            .fetch_all(&self.pool)
            .await?)
    }

    async fn len(&self) -> Result<usize> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as usize)
    }
}

/// Vectors for a batch of texts and the model that produced them.
#[derive(Debug, Clone)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Vec<f16>>,
    /// Display name of the model, for logs
    pub model: String,
}

/// Something that can embed text, usually the capability router's EMBEDDING chain.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch>;
}

/// A hydrated query hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub chunk: ChildChunkRecord,
    pub score: f32,
}

/// What one reconciliation sweep repaired.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub orphan_vectors_removed: usize,
    pub deletes_finished: usize,
    pub missing_vectors: usize,
    /// Live documents whose children lost their vectors and need to be embedded again
    pub documents_to_reembed: Vec<i64>,
    pub issues: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Coordinates the relational store, the vector store and the embedder.
#[derive(Clone)]
pub struct VectorIndexManager {
    db: Database,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    batch_size: usize,
}

impl std::fmt::Debug for VectorIndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndexManager")
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl VectorIndexManager {
    pub fn new(
        db: Database,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            index,
            embedder,
            batch_size: batch_size.max(1),
        }
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Embed `children` and store their vectors, `batch_size` texts per embedding call. The
    /// embedding call never runs inside a transaction; each batch is written back on its own.
    ///
    /// # Returns
    /// The number of vectors written.
    ///
    /// # Errors
    /// [`CoreError::DimensionMismatch`] if the embedder's output does not fit the index.
    pub async fn embed_and_store(&self, children: &[ChildChunkRecord]) -> Result<usize> {
        let mut indexed = 0;
        for batch in children.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let embedded = self.embedder.embed(&texts).await?;
            if embedded.vectors.len() != batch.len() {
                return Err(CoreError::Consistency(format!(
                    "{} returned {} vectors for {} texts",
                    embedded.model,
                    embedded.vectors.len(),
                    batch.len()
                )));
            }

            let entries: Vec<VectorEntry> = batch
                .iter()
                .zip(embedded.vectors)
                .map(|(child, vector)| VectorEntry {
                    chunk_id: child.id.clone(),
                    document_id: child.document_id,
                    parent_chunk_id: child.parent_chunk_id.clone(),
                    vector,
                })
                .collect();
            let dimension = entries[0].vector.len();
            indexed += self.index.upsert(&entries).await?;

            let ids: Vec<String> = batch.iter().map(|c| c.id.clone()).collect();
            self.db.mark_children_embedded(&ids, dimension).await?;
            debug!("Embedded {} chunk(s) with {}", batch.len(), embedded.model);
        }
        Ok(indexed)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f16>> {
        let batch = self.embedder.embed(&[text.to_string()]).await?;
        batch
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::Consistency(format!("{} returned no vector", batch.model)))
    }

    /// Top `k` live chunk ids for `vector`, score descending, ties by chunk id.
    pub async fn query(
        &self,
        vector: &[f16],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<(String, f32)>> {
        Ok(self
            .query_chunks(vector, k, filter)
            .await?
            .into_iter()
            .map(|hit| (hit.chunk.id, hit.score))
            .collect())
    }

    /// Like [`query`](Self::query) but returns the live child rows.
    pub async fn query_chunks(
        &self,
        vector: &[f16],
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let total = self.index.len().await?;
        let mut fetch = k.saturating_mul(2).max(k + 8);

        loop {
            let hits = self.index.query(vector, fetch, filter).await?;
            let exhausted = hits.len() < fetch || fetch >= total;

            let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
            let live = self.db.live_child_chunks(&ids).await?;
            let mut out: Vec<RetrievedChunk> = hits
                .into_iter()
                .filter_map(|hit| {
                    live.iter()
                        .find(|c| c.id == hit.chunk_id)
                        .map(|chunk| RetrievedChunk {
                            chunk: chunk.clone(),
                            score: hit.score,
                        })
                })
                .collect();

            if out.len() >= k || exhausted {
                out.truncate(k);
                return Ok(out);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Embed `text` and query with it.
    pub async fn query_text(
        &self,
        text: &str,
        k: usize,
        filter: &VectorFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        let vector = self.embed_query(text).await?;
        self.query_chunks(&vector, k, filter).await
    }

    /// Drop vectors of chunks that no longer exist (stale children of a re-ingest).
    pub async fn remove_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        self.index.delete_chunks(chunk_ids).await
    }

    /// Delete a document in three phases: hide it, drop its vectors, purge its rows. If this is
    /// interrupted after phase one, [`reconcile`](Self::reconcile) finishes the job.
    ///
    /// # Returns
    /// The number of vectors removed.
    pub async fn delete_document(&self, document_id: i64) -> Result<usize> {
        let document = self
            .db
            .get_document(document_id)
            .await?
            .ok_or_else(|| CoreError::not_found("document", document_id))?;
        if !document.is_deleted() {
            self.db.mark_document_deleted(document_id).await?;
        }
        let removed = self.index.delete_document(document_id).await?;
        self.db.purge_document(document_id).await?;
        info!(
            "Deleted document {} ({}), {} vector(s) removed",
            document_id, document.source_path, removed
        );
        Ok(removed)
    }

    /// Repair drift between the relational rows and the vector store. Every repair is reported as
    /// a consistency issue and logged.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for document_id in self.db.documents_pending_purge().await? {
            let removed = self.index.delete_document(document_id).await?;
            self.db.purge_document(document_id).await?;
            report.deletes_finished += 1;
            report.issues.push(
                CoreError::Consistency(format!(
                    "document {document_id} was marked deleted but not purged; removed {removed} vector(s) and purged it"
                ))
                .to_string(),
            );
        }

        // Child rows exist before their vectors, and vectors before the embedded mark, so with
        // ingest running the snapshots are read in this order.
        let embedded = self.db.live_embedded_child_ids().await?;
        let stored = self.index.chunk_ids().await?;
        let live = self.db.live_child_ids().await?;

        let mut orphans: Vec<String> = stored
            .iter()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            // A child may have been re-created under the same id since the live snapshot.
            let revived: HashSet<String> = self
                .db
                .live_child_chunks(&orphans)
                .await?
                .into_iter()
                .map(|c| c.id)
                .collect();
            orphans.retain(|id| !revived.contains(id));
        }
        if !orphans.is_empty() {
            report.orphan_vectors_removed = self.index.delete_chunks(&orphans).await?;
            report.issues.push(
                CoreError::Consistency(format!(
                    "removed {} orphan vector(s) with no live chunk",
                    orphans.len()
                ))
                .to_string(),
            );
        }

        let stored: HashSet<String> = stored.into_iter().collect();
        let mut unbacked: Vec<String> = embedded
            .into_iter()
            .filter(|id| !stored.contains(id))
            .collect();
        unbacked.sort();
        let documents = self.db.live_child_chunks(&unbacked).await?;
        let missing: Vec<String> = documents.iter().map(|c| c.id.clone()).collect();
        if !missing.is_empty() {
            let mut document_ids: Vec<i64> = documents.iter().map(|c| c.document_id).collect();
            document_ids.sort_unstable();
            document_ids.dedup();

            self.db.clear_child_embeddings(&missing).await?;
            report.missing_vectors = missing.len();
            report.documents_to_reembed = document_ids;
            report.issues.push(
                CoreError::Consistency(format!(
                    "{} embedded chunk(s) had no vector; marked for re-embedding",
                    missing.len()
                ))
                .to_string(),
            );
        }

        for issue in &report.issues {
            warn!("Reconciliation: {}", issue);
        }
        if report.is_clean() {
            debug!("Reconciliation found nothing to repair");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Modality, ParentChunkRecord};
    use tracing_test::traced_test;

    fn v(values: &[f32]) -> Vec<f16> {
        values.iter().map(|x| f16::from_f32(*x)).collect()
    }

    fn entry(id: &str, document_id: i64, values: &[f32]) -> VectorEntry {
        VectorEntry {
            chunk_id: id.to_string(),
            document_id,
            parent_chunk_id: format!("p-{id}"),
            vector: v(values),
        }
    }

    #[test]
    fn test_cosine_score_range() {
        assert!((cosine_score(&v(&[1.0, 0.0]), &v(&[1.0, 0.0])) - 1.0).abs() < 1e-3);
        assert!(cosine_score(&v(&[1.0, 0.0]), &v(&[-1.0, 0.0])).abs() < 1e-3);
        assert!((cosine_score(&v(&[1.0, 0.0]), &v(&[0.0, 1.0])) - 0.5).abs() < 1e-3);
        assert_eq!(cosine_score(&v(&[0.0, 0.0]), &v(&[1.0, 0.0])), 0.5);
    }

    #[tokio::test]
    async fn test_dimension_is_fixed_by_first_write() -> anyhow::Result<()> {
        let index = SqliteVectorIndex::open_memory().await?;
        assert_eq!(index.dimension().await?, None);
        assert!(index.query(&v(&[1.0]), 3, &VectorFilter::default()).await?.is_empty());

        index.upsert(&[entry("a", 1, &[1.0, 0.0, 0.0])]).await?;
        assert_eq!(index.dimension().await?, Some(3));

        let err = index.upsert(&[entry("b", 1, &[1.0, 0.0])]).await.unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { expected: 3, actual: 2 }));
        let err = index.query(&v(&[1.0, 0.0]), 1, &VectorFilter::default()).await.unwrap_err();
        assert!(matches!(err, CoreError::DimensionMismatch { .. }));
        assert!(index.configure_dimension(4).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_query_order_ties_and_overwrite() -> anyhow::Result<()> {
        let index = SqliteVectorIndex::open_memory().await?;
        index
            .upsert(&[
                entry("c", 1, &[1.0, 0.0]),
                entry("b", 1, &[1.0, 0.0]),
                entry("a", 2, &[0.0, 1.0]),
                entry("d", 2, &[-1.0, 0.0]),
            ])
            .await?;

        let hits = index.query(&v(&[1.0, 0.0]), 3, &VectorFilter::default()).await?;
        let ids: Vec<_> = hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.score)));

        let again = index.query(&v(&[1.0, 0.0]), 3, &VectorFilter::default()).await?;
        assert_eq!(hits, again);

        // last write wins
        index.upsert(&[entry("d", 2, &[1.0, 0.0])]).await?;
        assert_eq!(index.len().await?, 4);
        let top = index.query(&v(&[1.0, 0.0]), 3, &VectorFilter::default()).await?;
        assert_eq!(top[2].chunk_id, "d");

        let filter = VectorFilter {
            document_ids: Some(vec![2]),
            ..Default::default()
        };
        let filtered = index.query(&v(&[1.0, 0.0]), 10, &filter).await?;
        assert!(filtered.iter().all(|h| h.chunk_id == "a" || h.chunk_id == "d"));
        Ok(())
    }

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            Ok(EmbeddingBatch {
                vectors: texts
                    .iter()
                    .map(|t| if t.contains("cat") { v(&[1.0, 0.0]) } else { v(&[0.0, 1.0]) })
                    .collect(),
                model: "axis".into(),
            })
        }
    }

    async fn seeded() -> anyhow::Result<(Database, VectorIndexManager, i64)> {
        let db = Database::open_memory().await?;
        let index = Arc::new(SqliteVectorIndex::open_memory().await?);
        let manager = VectorIndexManager::new(db.clone(), index, Arc::new(AxisEmbedder), 2);
        let doc_id = seed_rows(&db).await?;
        Ok((db, manager, doc_id))
    }

    fn pet_child(document_id: i64, i: usize, text: &str) -> ChildChunkRecord {
        ChildChunkRecord {
            id: format!("c{i}"),
            parent_chunk_id: "p".into(),
            document_id,
            window_index: i as u32,
            text: text.to_string(),
            token_count: 2,
            vector_dim: None,
            embedded_at: None,
        }
    }

    async fn seed_rows(db: &Database) -> anyhow::Result<i64> {
        let doc = db.register_document("/pets.md", "h").await?;
        let parent = ParentChunkRecord {
            id: "p".into(),
            document_id: doc.id,
            sequence_index: 0,
            modality: Modality::Text,
            raw_content: "pets".into(),
            metadata: serde_json::json!({}),
            content_hash: "h".into(),
            parse_error: None,
        };
        db.replace_parent_chunks(doc.id, &[parent]).await?;
        let children: Vec<ChildChunkRecord> = ["cat one", "dog two", "cat three"]
            .iter()
            .enumerate()
            .map(|(i, text)| pet_child(doc.id, i, text))
            .collect();
        db.replace_child_chunks("p", &children).await?;
        Ok(doc.id)
    }

    /// Runs one ingest step (new child row, its vector, the embedded mark) just before listing
    /// stored ids, the way a worker can interleave with a sweep.
    struct InterleavedIndex {
        inner: SqliteVectorIndex,
        db: Database,
        document_id: i64,
        fired: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl VectorIndex for InterleavedIndex {
        async fn dimension(&self) -> Result<Option<usize>> {
            self.inner.dimension().await
        }

        async fn upsert(&self, entries: &[VectorEntry]) -> Result<usize> {
            self.inner.upsert(entries).await
        }

        async fn query(
            &self,
            vector: &[f16],
            k: usize,
            filter: &VectorFilter,
        ) -> Result<Vec<VectorHit>> {
            self.inner.query(vector, k, filter).await
        }

        async fn delete_chunks(&self, chunk_ids: &[String]) -> Result<usize> {
            self.inner.delete_chunks(chunk_ids).await
        }

        async fn delete_document(&self, document_id: i64) -> Result<usize> {
            self.inner.delete_document(document_id).await
        }

        async fn chunk_ids(&self) -> Result<Vec<String>> {
            if !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                let mut children = self.db.child_chunks_for_document(self.document_id).await?;
                let late = pet_child(self.document_id, children.len(), "cat four");
                children.push(late.clone());
                self.db.replace_child_chunks("p", &children).await?;
                self.inner
                    .upsert(&[entry(&late.id, self.document_id, &[1.0, 0.0])])
                    .await?;
                self.db.mark_children_embedded(&[late.id], 2).await?;
            }
            self.inner.chunk_ids().await
        }

        async fn len(&self) -> Result<usize> {
            self.inner.len().await
        }
    }

    #[tokio::test]
    async fn test_embed_and_query_hydrates_live_rows() -> anyhow::Result<()> {
        let (db, manager, doc_id) = seeded().await?;
        let pending = db.child_chunks_needing_embedding(doc_id).await?;
        assert_eq!(manager.embed_and_store(&pending).await?, 3);
        assert!(db.child_chunks_needing_embedding(doc_id).await?.is_empty());

        let hits = manager.query_text("a cat", 2, &VectorFilter::default()).await?;
        let ids: Vec<_> = hits.iter().map(|h| h.chunk.id.as_str()).collect();
        assert_eq!(ids, vec!["c0", "c2"]);
        assert_eq!(hits[0].chunk.text, "cat one");
        Ok(())
    }

    #[tokio::test]
    async fn test_deleted_document_is_never_returned() -> anyhow::Result<()> {
        let (db, manager, doc_id) = seeded().await?;
        let pending = db.child_chunks_needing_embedding(doc_id).await?;
        manager.embed_and_store(&pending).await?;

        // phase one only, as if the process died right after it
        db.mark_document_deleted(doc_id).await?;
        let query = v(&[1.0, 0.0]);
        assert!(manager.query(&query, 5, &VectorFilter::default()).await?.is_empty());
        assert_eq!(manager.index().len().await?, 3);

        let report = manager.reconcile().await?;
        assert_eq!(report.deletes_finished, 1);
        assert!(!report.is_clean());
        assert_eq!(manager.index().len().await?, 0);
        assert!(db.get_document(doc_id).await?.is_none());
        assert!(manager.reconcile().await?.is_clean());
        Ok(())
    }

    #[traced_test]
    #[tokio::test]
    async fn test_reconcile_removes_orphans_and_flags_missing_vectors() -> anyhow::Result<()> {
        let (db, manager, doc_id) = seeded().await?;
        let pending = db.child_chunks_needing_embedding(doc_id).await?;
        manager.embed_and_store(&pending).await?;

        manager.index().upsert(&[entry("ghost", doc_id, &[1.0, 0.0])]).await?;
        manager.index().delete_chunks(&["c1".to_string()]).await?;

        let report = manager.reconcile().await?;
        assert_eq!(report.orphan_vectors_removed, 1);
        assert_eq!(report.missing_vectors, 1);
        assert_eq!(report.documents_to_reembed, vec![doc_id]);
        assert_eq!(db.child_chunks_needing_embedding(doc_id).await?.len(), 1);
        assert!(logs_contain("orphan vector(s) with no live chunk"));
        Ok(())
    }

    #[tokio::test]
    async fn test_reconcile_keeps_vectors_written_during_the_sweep() -> anyhow::Result<()> {
        let db = Database::open_memory().await?;
        let doc_id = seed_rows(&db).await?;
        let index = Arc::new(InterleavedIndex {
            inner: SqliteVectorIndex::open_memory().await?,
            db: db.clone(),
            document_id: doc_id,
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let manager = VectorIndexManager::new(db.clone(), index, Arc::new(AxisEmbedder), 2);
        let pending = db.child_chunks_needing_embedding(doc_id).await?;
        manager.embed_and_store(&pending).await?;

        let report = manager.reconcile().await?;
        assert!(report.is_clean(), "unexpected repairs: {:?}", report.issues);
        assert_eq!(manager.index().len().await?, 4);
        assert!(db.child_chunks_needing_embedding(doc_id).await?.is_empty());

        let hits = manager.query(&v(&[1.0, 0.0]), 4, &VectorFilter::default()).await?;
        assert!(hits.iter().any(|(id, _)| id == "c3"));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_document_runs_all_phases() -> anyhow::Result<()> {
        let (db, manager, doc_id) = seeded().await?;
        let pending = db.child_chunks_needing_embedding(doc_id).await?;
        manager.embed_and_store(&pending).await?;

        assert_eq!(manager.delete_document(doc_id).await?, 3);
        assert!(db.get_document(doc_id).await?.is_none());
        assert!(manager.reconcile().await?.is_clean());
        Ok(())
    }
}

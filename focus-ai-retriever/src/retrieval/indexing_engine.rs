//! The ingestion engine: owned scheduler that turns submitted documents into searchable chunks.
//!
//! The engine owns every long-lived component and builds them in dependency order:
//!
//! ```text
//! Database → VectorIndex → CapabilityRouter → TaskQueue → (recover interrupted tasks) → workers
//! ```
//!
//! ## Worker pools
//!
//! Each priority class gets its own fixed pool. HIGH workers claim only HIGH tasks, MEDIUM workers
//! claim MEDIUM and above, LOW workers claim anything, so there is always capacity for urgent work
//! without ever interrupting a task that is already running.
//!
//! ## Task flow
//!
//! ```text
//! submit_document ─▶ INGEST_DOCUMENT ─▶ analyze ─▶ parents ─▶ children ─▶ embed ─▶ VECTORIZED
//!                                                   │  cancel checkpoint  │  cancel checkpoint
//! delete_document ─▶ mark deleted ─▶ DELETE_DOCUMENT ─▶ drop vectors ─▶ purge rows
//! reconcile timer ─▶ RECONCILE_INDEX (LOW) ─▶ repair drift ─▶ re-enqueue documents to embed
//! ```
//!
//! Embedding calls run outside any transaction and each batch is written back on its own.
//! [`IngestionEngine::shutdown`] stops claiming and waits for in-flight tasks to finish.

use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::analyzer::{DocumentAnalyzer, content_hash};
use super::capability_router::{CapabilityRouter, ClientFactory, DefaultClientFactory};
use super::chunking_strategy::{ChunkingPipeline, ChunkingSettings, ImageDescriber};
use super::context_assembler::ContextAssembler;
use super::task_queue::{
    DeletePayload, IngestPayload, ReconcilePayload, Task, TaskKind, TaskPayload, TaskPriority,
    TaskQueue, TaskStatus, WorkerCapacity,
};
use super::vector_index::{ReconcileReport, SqliteVectorIndex, VectorIndex, VectorIndexManager};
use crate::chat::ChatService;
use crate::config::RetrieverConfig;
use crate::error::{CoreError, Result};
use crate::storage::{Database, DocumentRecord, DocumentStatus};
use focus_ai_context::{HeuristicTokenEstimator, TokenEstimator};

/// Runtime counters, reset when the engine is constructed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStats {
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_retried: usize,
    pub tasks_cancelled: usize,
    pub documents_ingested: usize,
    pub documents_unchanged: usize,
    pub documents_deleted: usize,
    pub chunks_created: usize,
    pub vectors_written: usize,
    pub failed_units: usize,
    pub reconcile_repairs: usize,
}

/// Summary of one ingest task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestSummary {
    pub document_id: i64,
    pub unchanged: bool,
    pub parent_chunks: usize,
    pub child_chunks_inserted: usize,
    pub stale_chunks_removed: usize,
    pub vectors_written: usize,
    pub failed_units: u32,
    pub images_described: usize,
}

/// What [`IngestionEngine::pin`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinOutcome {
    pub newly_pinned: bool,
    /// HIGH ingest enqueued because the document was not searchable yet
    pub ingest_task_id: Option<i64>,
}

enum TaskOutcome {
    Done(Value),
    Cancelled,
}

/// Everything the workers share.
struct EngineInner {
    config: RetrieverConfig,
    db: Database,
    queue: TaskQueue,
    vectors: VectorIndexManager,
    router: CapabilityRouter,
    analyzer: DocumentAnalyzer,
    pipeline: ChunkingPipeline,
    assembler: ContextAssembler,
    estimator: Arc<dyn TokenEstimator>,
    stats: RwLock<ProcessingStats>,
}

/// The ingestion engine that owns storage, the queue and the worker pools.
pub struct IngestionEngine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for IngestionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionEngine")
            .field("data_dir", &self.inner.config.data_dir)
            .field("engine", &self.inner.config.engine)
            .finish()
    }
}

impl IngestionEngine {
    /// Open the engine on the databases under `config.data_dir`.
    ///
    /// Workers are not started; call [`start`](Self::start) or drive the queue with
    /// [`run_until_idle`](Self::run_until_idle).
    ///
    /// # Errors
    /// - Configuration validation errors
    /// - Database initialization errors
    pub async fn open(config: RetrieverConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open(&config.data_dir).await?;
        let index = Arc::new(SqliteVectorIndex::open(&config.data_dir).await?);
        let factory = Arc::new(DefaultClientFactory {
            cache_dir: Some(config.data_dir.join("models")),
        });
        Self::from_parts(config, db, index, factory).await
    }

    /// Open the engine on in-memory databases. Primarily intended for tests.
    pub async fn open_memory(config: RetrieverConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open_memory().await?;
        let index = Arc::new(SqliteVectorIndex::open_memory().await?);
        Self::from_parts(config, db, index, Arc::new(DefaultClientFactory::default())).await
    }

    /// Assemble the engine from already opened stores and a client factory.
    pub async fn from_parts(
        config: RetrieverConfig,
        db: Database,
        index: Arc<dyn VectorIndex>,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self> {
        info!("Initializing IngestionEngine in {}", config.data_dir.display());

        let router = CapabilityRouter::new(db.clone(), factory, &config.router);
        let vectors = VectorIndexManager::new(
            db.clone(),
            index,
            Arc::new(router.clone()),
            config.engine.embed_batch_size,
        );
        let queue = TaskQueue::new(db.clone(), config.queue.clone());
        if config.engine.recover_on_open {
            let recovered = queue.recover_interrupted().await?;
            if recovered > 0 {
                warn!("Recovered {} task(s) interrupted by a previous run", recovered);
            }
        }

        let estimator: Arc<dyn TokenEstimator> = Arc::new(HeuristicTokenEstimator::default());
        let analyzer = DocumentAnalyzer::new(config.chunking.parent_max_tokens, Arc::clone(&estimator));
        let pipeline = ChunkingPipeline::new(
            ChunkingSettings {
                child_target_tokens: config.chunking.child_target_tokens,
                overlap_fraction: config.chunking.overlap_fraction,
            },
            Arc::clone(&estimator),
        )?;
        let assembler = ContextAssembler::new(
            db.clone(),
            vectors.clone(),
            Arc::clone(&estimator),
            config.context.clone(),
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                db,
                queue,
                vectors,
                router,
                analyzer,
                pipeline,
                assembler,
                estimator,
                stats: RwLock::new(ProcessingStats::default()),
            }),
            workers: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn config(&self) -> &RetrieverConfig {
        &self.inner.config
    }

    pub fn database(&self) -> &Database {
        &self.inner.db
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.inner.queue
    }

    pub fn vectors(&self) -> &VectorIndexManager {
        &self.inner.vectors
    }

    pub fn router(&self) -> &CapabilityRouter {
        &self.inner.router
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.inner.assembler
    }

    /// A chat service over this engine's stores and router.
    pub fn chat(&self) -> ChatService {
        ChatService::new(
            self.inner.db.clone(),
            self.inner.assembler.clone(),
            self.inner.router.clone(),
            Arc::clone(&self.inner.estimator),
            self.inner.config.chat.clone(),
        )
    }

    pub async fn stats(&self) -> ProcessingStats {
        self.inner.stats.read().await.clone()
    }

    /// Whether worker pools are running.
    pub fn is_running(&self) -> bool {
        !self
            .workers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_empty()
    }

    /// Spawn the worker pools and the periodic timers.
    ///
    /// Calling this twice is a no-op.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
        if !workers.is_empty() {
            return;
        }
        self.shutdown.send_replace(false);

        let engine = &self.inner.config.engine;
        let pools = [
            ("high", engine.high_workers, WorkerCapacity::high_only()),
            ("medium", engine.medium_workers, WorkerCapacity::at_least(TaskPriority::Medium)),
            ("low", engine.low_workers, WorkerCapacity::any()),
        ];
        for (class, count, capacity) in pools {
            for n in 0..count {
                let name = format!("{class}-{n}");
                workers.push(tokio::spawn(worker_loop(
                    Arc::clone(&self.inner),
                    name,
                    capacity,
                    self.shutdown.subscribe(),
                )));
            }
        }

        if engine.reconcile_interval_secs > 0 {
            workers.push(tokio::spawn(reconcile_timer(
                Arc::clone(&self.inner),
                Duration::from_secs(engine.reconcile_interval_secs),
                self.shutdown.subscribe(),
            )));
        }
        if engine.probe_interval_secs > 0 {
            workers.push(tokio::spawn(probe_timer(
                Arc::clone(&self.inner),
                Duration::from_secs(engine.probe_interval_secs),
                self.shutdown.subscribe(),
            )));
        }

        info!(
            "Started {} high, {} medium and {} low worker(s)",
            engine.high_workers, engine.medium_workers, engine.low_workers
        );
    }

    /// Stop claiming new tasks and wait for in-flight tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.drain(..).collect()
        };
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker ended abnormally: {}", e);
            }
        }
        if count > 0 {
            info!("IngestionEngine stopped, {} background task(s) drained", count);
        }
    }

    /// Shut down and close both databases.
    pub async fn close(&self) {
        self.shutdown().await;
        self.inner.db.close().await;
    }

    /// Claim and run tasks inline until nothing is claimable right now. Tasks waiting behind a
    /// backoff gate are left for later.
    ///
    /// # Returns
    /// The number of tasks run.
    pub async fn run_until_idle(&self) -> Result<usize> {
        let mut processed = 0;
        while self.process_next(WorkerCapacity::any()).await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Claim one task and run it. Returns the task id and the status it ended in.
    pub async fn process_next(&self, capacity: WorkerCapacity) -> Result<Option<(i64, TaskStatus)>> {
        match self.inner.queue.claim_next(capacity).await? {
            Some(task) => {
                let id = task.id;
                let status = self.inner.run_task(task).await?;
                Ok(Some((id, status)))
            }
            None => Ok(None),
        }
    }

    /// Register `path` with `hash` and enqueue an ingest at MEDIUM priority.
    pub async fn submit_document(&self, path: &Path, hash: &str) -> Result<i64> {
        self.submit_document_with_priority(path, hash, TaskPriority::Medium)
            .await
    }

    /// Register `path` with `hash` and enqueue an ingest.
    ///
    /// # Errors
    /// `Validation` for an empty hash or a path whose document is being deleted.
    pub async fn submit_document_with_priority(
        &self,
        path: &Path,
        hash: &str,
        priority: TaskPriority,
    ) -> Result<i64> {
        if hash.trim().is_empty() {
            return Err(CoreError::validation("content hash must not be empty"));
        }
        let source_path = normalize_path(path)?;
        let document = self
            .inner
            .db
            .register_document(&source_path.to_string_lossy(), hash)
            .await?;
        let task_id = self.inner.enqueue_ingest(&document, priority).await?;
        info!(
            "Submitted {} as document {} (task {})",
            document.source_path, document.id, task_id
        );
        Ok(task_id)
    }

    /// Read `path`, hash it and submit it.
    pub async fn submit_file(&self, path: &Path, priority: TaskPriority) -> Result<i64> {
        let bytes = tokio::fs::read(path).await?;
        self.submit_document_with_priority(path, &content_hash(&bytes), priority)
            .await
    }

    /// Hide a document from retrieval right away and enqueue the rest of the delete.
    ///
    /// # Returns
    /// The DELETE_DOCUMENT task id.
    pub async fn delete_document(&self, document_id: i64) -> Result<i64> {
        if self.inner.db.get_document(document_id).await?.is_none() {
            return Err(CoreError::not_found("document", document_id));
        }
        self.inner.db.mark_document_deleted(document_id).await?;
        self.inner
            .queue
            .enqueue_payload(
                &TaskPayload::Delete(DeletePayload { document_id }),
                TaskPriority::Medium,
            )
            .await
    }

    /// Pin a document to a session. A document that is not searchable yet gets a HIGH ingest.
    pub async fn pin(&self, session_id: i64, document_id: i64) -> Result<PinOutcome> {
        if self.inner.db.get_session(session_id).await?.is_none() {
            return Err(CoreError::not_found("session", session_id));
        }
        let document = self
            .inner
            .db
            .get_document(document_id)
            .await?
            .ok_or_else(|| CoreError::not_found("document", document_id))?;
        if document.is_deleted() {
            return Err(CoreError::validation(format!(
                "document {document_id} is being deleted"
            )));
        }

        let newly_pinned = self.inner.db.pin_document(session_id, document_id).await?;
        let ingest_task_id = if document.status == DocumentStatus::Vectorized
            || self.inner.queue.has_active_for_document(document_id).await?
        {
            None
        } else {
            Some(self.inner.enqueue_ingest(&document, TaskPriority::High).await?)
        };
        Ok(PinOutcome {
            newly_pinned,
            ingest_task_id,
        })
    }

    pub async fn unpin(&self, session_id: i64, document_id: i64) -> Result<bool> {
        self.inner.db.unpin_document(session_id, document_id).await
    }

    /// Snapshot of one task.
    pub async fn get_status(&self, task_id: i64) -> Result<Task> {
        self.inner
            .queue
            .get(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))
    }

    pub async fn cancel(&self, task_id: i64) -> Result<TaskStatus> {
        self.inner.queue.cancel(task_id).await
    }

    /// Enqueue a LOW reconciliation sweep unless one is already queued or running.
    pub async fn schedule_reconcile(&self) -> Result<Option<i64>> {
        self.inner.schedule_reconcile().await
    }

    /// Run a reconciliation sweep inline.
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        self.inner.reconcile().await
    }
}

impl EngineInner {
    async fn enqueue_ingest(&self, document: &DocumentRecord, priority: TaskPriority) -> Result<i64> {
        self.queue
            .enqueue_payload(
                &TaskPayload::Ingest(IngestPayload {
                    document_id: document.id,
                    path: document.source_path.clone(),
                }),
                priority,
            )
            .await
    }

    async fn schedule_reconcile(&self) -> Result<Option<i64>> {
        if self.queue.has_active(TaskKind::ReconcileIndex).await? {
            debug!("Reconciliation already queued");
            return Ok(None);
        }
        let id = self
            .queue
            .enqueue_payload(&TaskPayload::Reconcile(ReconcilePayload {}), TaskPriority::Low)
            .await?;
        Ok(Some(id))
    }

    /// Run a claimed task to a terminal or requeued state.
    async fn run_task(&self, task: Task) -> Result<TaskStatus> {
        let started = Instant::now();
        let description = task.description();

        match self.process_task(&task).await {
            Ok(TaskOutcome::Done(result)) => {
                self.queue.complete(task.id, &result).await?;
                self.stats.write().await.tasks_completed += 1;
                debug!("Completed {} in {:?}", description, started.elapsed());
                Ok(TaskStatus::Done)
            }
            Ok(TaskOutcome::Cancelled) => {
                self.queue.mark_cancelled(task.id).await?;
                self.stats.write().await.tasks_cancelled += 1;
                self.after_ingest_stopped(&task, None).await;
                info!("Cancelled {}", description);
                Ok(TaskStatus::Cancelled)
            }
            Err(e) => {
                let status = self.queue.fail(task.id, &e).await?;
                {
                    let mut stats = self.stats.write().await;
                    match status {
                        TaskStatus::Pending => stats.tasks_retried += 1,
                        TaskStatus::Cancelled => stats.tasks_cancelled += 1,
                        _ => stats.tasks_failed += 1,
                    }
                }
                match status {
                    TaskStatus::Pending => {
                        warn!("{} failed, will retry: {}", description, e);
                        self.after_ingest_stopped(&task, None).await;
                    }
                    TaskStatus::Failed => {
                        error!("{} failed permanently: {}", description, e);
                        self.after_ingest_stopped(&task, Some(&e)).await;
                    }
                    _ => self.after_ingest_stopped(&task, None).await,
                }
                Ok(status)
            }
        }
    }

    /// Put a document back to PENDING (or FAILED on `terminal`) after an ingest stopped early.
    async fn after_ingest_stopped(&self, task: &Task, terminal: Option<&CoreError>) {
        let Ok(TaskPayload::Ingest(payload)) = task.typed_payload() else {
            return;
        };
        let (status, message) = match terminal {
            Some(e) => (DocumentStatus::Failed, Some(e.to_string())),
            None => (DocumentStatus::Pending, None),
        };
        if let Err(e) = self
            .db
            .set_document_status(payload.document_id, status, message.as_deref())
            .await
        {
            warn!(
                "Could not update status of document {}: {}",
                payload.document_id, e
            );
        }
    }

    async fn process_task(&self, task: &Task) -> Result<TaskOutcome> {
        match task.typed_payload()? {
            TaskPayload::Ingest(payload) => self.ingest(task, &payload).await,
            TaskPayload::Delete(payload) => self.delete(&payload).await,
            TaskPayload::Reconcile(_) => {
                let report = self.reconcile().await?;
                Ok(TaskOutcome::Done(serde_json::to_value(report)?))
            }
        }
    }

    /// Whether the running task should stop here.
    async fn should_stop(&self, task: &Task, document_id: i64) -> Result<bool> {
        if self.queue.is_cancel_requested(task.id).await? {
            return Ok(true);
        }
        let deleted = self
            .db
            .get_document(document_id)
            .await?
            .is_none_or(|d| d.is_deleted());
        if deleted {
            info!("Document {} was deleted while {} ran", document_id, task.description());
        }
        Ok(deleted)
    }

    async fn ingest(&self, task: &Task, payload: &IngestPayload) -> Result<TaskOutcome> {
        let document = self
            .db
            .get_document(payload.document_id)
            .await?
            .ok_or_else(|| CoreError::validation(format!(
                "document {} no longer exists",
                payload.document_id
            )))?;
        if document.is_deleted() {
            return Err(CoreError::validation(format!(
                "document {} is being deleted",
                document.id
            )));
        }

        let mut summary = IngestSummary {
            document_id: document.id,
            ..Default::default()
        };
        if document.status == DocumentStatus::Vectorized {
            debug!("{} is unchanged since it was vectorized", document.source_path);
            summary.unchanged = true;
            self.stats.write().await.documents_unchanged += 1;
            return Ok(TaskOutcome::Done(serde_json::to_value(summary)?));
        }

        self.db
            .set_document_status(document.id, DocumentStatus::Processing, None)
            .await?;
        let analyzed = self
            .analyzer
            .analyze_file(&PathBuf::from(&payload.path))
            .await?;

        let parents = self.pipeline.build_parents(document.id, &analyzed.parents);
        let stale = self.db.replace_parent_chunks(document.id, &parents).await?;
        summary.stale_chunks_removed += self.vectors.remove_chunks(&stale).await?;
        summary.parent_chunks = parents.len();

        // Parents that already have children were produced from identical content.
        let done_parents: HashSet<String> = self
            .db
            .child_chunks_for_document(document.id)
            .await?
            .into_iter()
            .map(|c| c.parent_chunk_id)
            .collect();

        let describer: Option<&dyn ImageDescriber> = if self.config.chunking.describe_images {
            Some(&self.router)
        } else {
            None
        };

        let mut errors = Vec::new();
        for (parent, draft) in parents.into_iter().zip(&analyzed.parents) {
            if self.should_stop(task, document.id).await? {
                return Ok(TaskOutcome::Cancelled);
            }
            if let Some(parse_error) = &parent.parse_error {
                summary.failed_units += 1;
                errors.push(format!("unit {}: {}", parent.sequence_index, parse_error));
                continue;
            }
            if done_parents.contains(&parent.id) {
                continue;
            }

            let processed = self.pipeline.process_parent(parent, draft, describer).await;
            if processed.described {
                summary.images_described += 1;
            }
            let (inserted, stale) = self
                .db
                .replace_child_chunks(&processed.parent.id, &processed.children)
                .await?;
            summary.child_chunks_inserted += inserted;
            summary.stale_chunks_removed += self.vectors.remove_chunks(&stale).await?;
        }

        let error_message = (!errors.is_empty()).then(|| errors.join("; "));
        self.db
            .set_document_chunked(
                document.id,
                &analyzed.content_hash,
                summary.failed_units,
                error_message.as_deref(),
            )
            .await?;

        let pending = self.db.child_chunks_needing_embedding(document.id).await?;
        for batch in pending.chunks(self.vectors.batch_size()) {
            if self.should_stop(task, document.id).await? {
                return Ok(TaskOutcome::Cancelled);
            }
            summary.vectors_written += self.vectors.embed_and_store(batch).await?;
        }

        self.db
            .set_document_status(document.id, DocumentStatus::Vectorized, error_message.as_deref())
            .await?;
        {
            let mut stats = self.stats.write().await;
            stats.documents_ingested += 1;
            stats.chunks_created += summary.child_chunks_inserted;
            stats.vectors_written += summary.vectors_written;
            stats.failed_units += summary.failed_units as usize;
        }
        info!(
            "Ingested {}: {} parent(s), {} new chunk(s), {} vector(s), {} failed unit(s)",
            document.source_path,
            summary.parent_chunks,
            summary.child_chunks_inserted,
            summary.vectors_written,
            summary.failed_units
        );
        Ok(TaskOutcome::Done(serde_json::to_value(summary)?))
    }

    async fn delete(&self, payload: &DeletePayload) -> Result<TaskOutcome> {
        match self.vectors.delete_document(payload.document_id).await {
            Ok(removed) => {
                self.stats.write().await.documents_deleted += 1;
                Ok(TaskOutcome::Done(json!({
                    "document_id": payload.document_id,
                    "vectors_removed": removed,
                })))
            }
            // A reconciliation sweep may have finished the delete first.
            Err(CoreError::NotFound { .. }) => Ok(TaskOutcome::Done(json!({
                "document_id": payload.document_id,
                "vectors_removed": 0,
                "already_purged": true,
            }))),
            Err(e) => Err(e),
        }
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.vectors.reconcile().await?;
        for &document_id in &report.documents_to_reembed {
            let Some(document) = self.db.get_document(document_id).await? else {
                continue;
            };
            self.db
                .set_document_status(document_id, DocumentStatus::Chunked, document.error_message.as_deref())
                .await?;
            self.enqueue_ingest(&document, TaskPriority::Low).await?;
        }
        self.stats.write().await.reconcile_repairs += report.issues.len();
        Ok(report)
    }
}

fn normalize_path(path: &Path) -> Result<PathBuf> {
    if path.as_os_str().is_empty() {
        return Err(CoreError::validation("document path must not be empty"));
    }
    Ok(std::path::absolute(path)?)
}

async fn worker_loop(
    inner: Arc<EngineInner>,
    name: String,
    capacity: WorkerCapacity,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker {} started (claims {} and above)", name, capacity.min_priority);
    let poll = inner.config.queue.poll_interval();

    while !*shutdown.borrow() {
        let idle = match inner.queue.claim_next(capacity).await {
            Ok(Some(task)) => {
                // a claimed task always runs to completion, even during shutdown
                if let Err(e) = inner.run_task(task).await {
                    error!("Worker {} could not record a task outcome: {}", name, e);
                }
                false
            }
            Ok(None) => true,
            Err(e) => {
                error!("Worker {} failed to claim: {}", name, e);
                true
            }
        };
        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
    debug!("Worker {} stopped", name);
}

async fn reconcile_timer(
    inner: Arc<EngineInner>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = inner.schedule_reconcile().await {
                    warn!("Could not schedule reconciliation: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

async fn probe_timer(inner: Arc<EngineInner>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match inner.router.probe_assigned().await {
                    Ok(outcomes) => {
                        for outcome in outcomes.iter().filter(|o| o.error.is_some()) {
                            debug!("Probe of {} failed: {:?}", outcome.display_name, outcome.error);
                        }
                    }
                    Err(e) => warn!("Model probe sweep failed: {}", e),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewModelConfiguration;
    use focus_ai_models::Capability;
    use tempfile::TempDir;

    async fn engine_with_embedder() -> IngestionEngine {
        let config = RetrieverConfig::default()
            .with_child_target_tokens(16)
            .with_backoff(0, 0);
        let engine = IngestionEngine::open_memory(config).await.unwrap();
        let db = engine.database();
        let model = db
            .add_model_configuration(&NewModelConfiguration {
                display_name: "hash".into(),
                provider: "hashing".into(),
                model_id: "hash-16".into(),
                capabilities: vec![Capability::Embedding],
                dimension: Some(16),
                ..Default::default()
            })
            .await
            .unwrap();
        db.assign_capability(Capability::Embedding, &[model.id]).await.unwrap();
        engine
    }

    fn write(dir: &TempDir, name: &str, text: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[tokio::test]
    async fn test_ingest_then_reingest_is_a_noop() {
        let engine = engine_with_embedder().await;
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "guide.md",
            "# Setup\n\nInstall the tool and run it once.\n\n# Usage\n\nCall it with a path to index.\n",
        );

        let task = engine.submit_file(&path, TaskPriority::Medium).await.unwrap();
        assert_eq!(engine.run_until_idle().await.unwrap(), 1);
        assert_eq!(engine.get_status(task).await.unwrap().status, TaskStatus::Done);

        let counts = engine.database().document_counts().await.unwrap();
        assert_eq!(counts.vectorized, 1);
        let chunks_before = counts.child_chunks;
        assert!(chunks_before >= 2);
        assert_eq!(engine.vectors().index().len().await.unwrap(), chunks_before as usize);

        let again = engine.submit_file(&path, TaskPriority::Medium).await.unwrap();
        engine.run_until_idle().await.unwrap();
        let result = engine.get_status(again).await.unwrap().result.unwrap();
        assert_eq!(result["unchanged"], json!(true));
        assert_eq!(
            engine.database().document_counts().await.unwrap().child_chunks,
            chunks_before
        );
    }

    #[tokio::test]
    async fn test_changed_file_replaces_stale_chunks() {
        let engine = engine_with_embedder().await;
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "notes.md", "# A\n\nfirst section\n\n# B\n\nsecond section\n");
        engine.submit_file(&path, TaskPriority::Medium).await.unwrap();
        engine.run_until_idle().await.unwrap();

        std::fs::write(&path, "# A\n\nfirst section\n\n# B\n\nrewritten entirely\n").unwrap();
        let task = engine.submit_file(&path, TaskPriority::Medium).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let result = engine.get_status(task).await.unwrap().result.unwrap();
        assert_eq!(result["stale_chunks_removed"], json!(1));
        let counts = engine.database().document_counts().await.unwrap();
        assert_eq!(
            engine.vectors().index().len().await.unwrap(),
            counts.child_chunks as usize
        );
        assert!(engine.reconcile_now().await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_missing_embedder_retries_then_fails_document() {
        let config = RetrieverConfig::default().with_max_retries(2).with_backoff(0, 0);
        let engine = IngestionEngine::open_memory(config).await.unwrap();
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.txt", "some plain text to index");

        let task = engine.submit_file(&path, TaskPriority::Low).await.unwrap();
        engine.run_until_idle().await.unwrap();

        let snapshot = engine.get_status(task).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.attempt_count, 2);
        let doc = engine.database().list_documents().await.unwrap().remove(0);
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert!(doc.error_message.unwrap().contains("No capable model"));
    }

    #[tokio::test]
    async fn test_delete_hides_immediately_and_purges() {
        let engine = engine_with_embedder().await;
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "gone.md", "# Gone\n\nsoon to be deleted\n");
        engine.submit_file(&path, TaskPriority::Medium).await.unwrap();
        engine.run_until_idle().await.unwrap();
        let doc = engine.database().list_documents().await.unwrap().remove(0);

        engine.delete_document(doc.id).await.unwrap();
        let hits = engine
            .vectors()
            .query_text("deleted", 5, &Default::default())
            .await
            .unwrap();
        assert!(hits.is_empty());

        engine.run_until_idle().await.unwrap();
        assert!(engine.database().get_document(doc.id).await.unwrap().is_none());
        assert_eq!(engine.vectors().index().len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pin_enqueues_high_ingest_for_unvectorized_document() {
        let engine = engine_with_embedder().await;
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "pin.md", "pinned text");
        engine
            .submit_document(&path, "deadbeef")
            .await
            .unwrap();
        let doc = engine.database().list_documents().await.unwrap().remove(0);
        let session = engine.database().create_session("s").await.unwrap();

        // an ingest is already queued, so pinning does not add another
        let outcome = engine.pin(session.id, doc.id).await.unwrap();
        assert!(outcome.newly_pinned);
        assert_eq!(outcome.ingest_task_id, None);

        engine.run_until_idle().await.unwrap();
        engine
            .database()
            .set_document_status(doc.id, DocumentStatus::Chunked, None)
            .await
            .unwrap();
        let outcome = engine.pin(session.id, doc.id).await.unwrap();
        assert!(!outcome.newly_pinned);
        let task = engine.get_status(outcome.ingest_task_id.unwrap()).await.unwrap();
        assert_eq!(task.priority, TaskPriority::High);
        assert!(engine.unpin(session.id, doc.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_workers_drain_on_shutdown() {
        let engine = engine_with_embedder().await;
        let dir = TempDir::new().unwrap();
        for i in 0..4 {
            let path = write(&dir, &format!("doc{i}.md"), &format!("# Doc {i}\n\nbody {i}\n"));
            engine.submit_file(&path, TaskPriority::Medium).await.unwrap();
        }

        engine.start();
        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.queue().counts().await.unwrap().done < 4 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        engine.shutdown().await;

        let counts = engine.queue().counts().await.unwrap();
        assert_eq!(counts.done, 4);
        assert_eq!(counts.running, 0);
        assert_eq!(engine.stats().await.documents_ingested, 4);
    }
}

//! Retrieval-augmented context for a chat turn.
//!
//! Fragments are gathered in three priority classes and packed greedily with
//! [`focus_ai_context::pack_fragments`]:
//!
//! 1. pinned chunks, every child of every pinned document in document order, against the pinned
//!    sub-budget
//! 2. top-k similarity hits for the query, one per parent chunk, skipping pinned chunks
//! 3. recent history, most recent first
//!
//! Packing never truncates a fragment and stops a phase at the first fragment that does not fit.

use super::vector_index::{VectorFilter, VectorIndexManager};
use crate::config::ContextConfig;
use crate::error::{CoreError, Result};
use crate::storage::Database;
use focus_ai_context::{
    ContextBudget, ContextFragment, PackedContext, TokenEstimator, pack_fragments,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds [`PackedContext`]s from session state and the vector index.
#[derive(Clone)]
pub struct ContextAssembler {
    db: Database,
    vectors: VectorIndexManager,
    estimator: Arc<dyn TokenEstimator>,
    config: ContextConfig,
}

impl std::fmt::Debug for ContextAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextAssembler")
            .field("config", &self.config)
            .finish()
    }
}

impl ContextAssembler {
    pub fn new(
        db: Database,
        vectors: VectorIndexManager,
        estimator: Arc<dyn TokenEstimator>,
        config: ContextConfig,
    ) -> Self {
        Self {
            db,
            vectors,
            estimator,
            config,
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Assemble context for `query_text` in `session_id` within `token_budget` tokens.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] for an unknown session. A missing EMBEDDING model only drops the
    /// similarity phase.
    pub async fn assemble(
        &self,
        session_id: i64,
        query_text: &str,
        token_budget: usize,
    ) -> Result<PackedContext> {
        self.assemble_excluding(session_id, query_text, token_budget, None)
            .await
    }

    /// Like [`assemble`](Self::assemble), leaving message `skip_message` out of the history. Used
    /// for the turn that is being answered, which the prompt carries on its own.
    pub async fn assemble_excluding(
        &self,
        session_id: i64,
        query_text: &str,
        token_budget: usize,
        skip_message: Option<i64>,
    ) -> Result<PackedContext> {
        if self.db.get_session(session_id).await?.is_none() {
            return Err(CoreError::not_found("session", session_id));
        }

        let pinned = self.pinned_fragments(session_id).await?;
        let pinned_ids: HashSet<String> =
            pinned.iter().filter_map(|f| f.chunk_id.clone()).collect();
        let retrieved = self.retrieved_fragments(query_text, pinned_ids).await?;
        let history = self.history_fragments(session_id, skip_message).await?;

        let budget = ContextBudget::with_pinned_share(token_budget, self.config.pinned_share);
        let packed = pack_fragments(budget, pinned, retrieved, history);
        debug!(
            "Assembled {} fragment(s), {} of {} tokens, {} dropped",
            packed.fragments.len(),
            packed.used_tokens,
            token_budget,
            packed.dropped
        );
        Ok(packed)
    }

    async fn pinned_fragments(&self, session_id: i64) -> Result<Vec<ContextFragment>> {
        let mut fragments = Vec::new();
        for document_id in self.db.pinned_documents(session_id).await? {
            for chunk in self.db.child_chunks_for_document(document_id).await? {
                let tokens = self.estimator.estimate(&chunk.text);
                fragments.push(ContextFragment::pinned(
                    chunk.id,
                    chunk.document_id,
                    chunk.text,
                    tokens,
                ));
            }
        }
        Ok(fragments)
    }

    async fn retrieved_fragments(
        &self,
        query_text: &str,
        pinned_ids: HashSet<String>,
    ) -> Result<Vec<ContextFragment>> {
        let top_k = self.config.top_k;
        if top_k == 0 || query_text.trim().is_empty() || self.vectors.index().len().await? == 0 {
            return Ok(Vec::new());
        }

        let filter = VectorFilter {
            document_ids: None,
            exclude_chunk_ids: pinned_ids,
        };
        // Over-fetch so that collapsing siblings still leaves k parents.
        let hits = match self
            .vectors
            .query_text(query_text, top_k.saturating_mul(3), &filter)
            .await
        {
            Ok(hits) => hits,
            Err(CoreError::NoCapableModel { attempted, .. }) => {
                warn!(
                    "No embedding model available ({} tried), answering without retrieval",
                    attempted.len()
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut seen_parents = HashSet::new();
        Ok(hits
            .into_iter()
            .filter(|hit| seen_parents.insert(hit.chunk.parent_chunk_id.clone()))
            .take(top_k)
            .map(|hit| {
                let tokens = self.estimator.estimate(&hit.chunk.text);
                ContextFragment::retrieved(
                    hit.chunk.id,
                    hit.chunk.document_id,
                    hit.chunk.text,
                    tokens,
                    hit.score,
                )
            })
            .collect())
    }

    async fn history_fragments(
        &self,
        session_id: i64,
        skip_message: Option<i64>,
    ) -> Result<Vec<ContextFragment>> {
        let limit = self.config.history_limit + usize::from(skip_message.is_some());
        Ok(self
            .db
            .recent_messages(session_id, limit)
            .await?
            .into_iter()
            .filter(|m| Some(m.id) != skip_message)
            .take(self.config.history_limit)
            .map(|m| {
                let tokens = self.estimator.estimate(&m.content);
                ContextFragment::history(m.id, m.role.as_str().to_string(), m.content, tokens)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::vector_index::{EmbeddingBatch, Embedder, SqliteVectorIndex};
    use crate::storage::{ChildChunkRecord, Modality, ParentChunkRecord};
    use async_trait::async_trait;
    use focus_ai_context::{FragmentSource, WordCountEstimator};
    use focus_ai_models::Role;
    use half::f16;

    /// "alpha" texts point one way, everything else the other.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<EmbeddingBatch> {
            Ok(EmbeddingBatch {
                vectors: texts
                    .iter()
                    .map(|t| {
                        if t.contains("alpha") {
                            vec![f16::from_f32(1.0), f16::from_f32(0.0)]
                        } else {
                            vec![f16::from_f32(0.0), f16::from_f32(1.0)]
                        }
                    })
                    .collect(),
                model: "keyword".into(),
            })
        }
    }

    struct Fixture {
        db: Database,
        vectors: VectorIndexManager,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = Database::open_memory().await.unwrap();
            let index = Arc::new(SqliteVectorIndex::open_memory().await.unwrap());
            let vectors = VectorIndexManager::new(db.clone(), index, Arc::new(KeywordEmbedder), 8);
            Self { db, vectors }
        }

        fn assembler(&self, config: ContextConfig) -> ContextAssembler {
            ContextAssembler::new(
                self.db.clone(),
                self.vectors.clone(),
                Arc::new(WordCountEstimator),
                config,
            )
        }

        /// One document, one parent per entry of `parents`, each with the given child texts.
        async fn document(&self, path: &str, parents: &[&[String]], embed: bool) -> i64 {
            let doc = self.db.register_document(path, path).await.unwrap();
            let parent_rows: Vec<ParentChunkRecord> = (0..parents.len())
                .map(|seq| ParentChunkRecord {
                    id: format!("{path}#{seq}"),
                    document_id: doc.id,
                    sequence_index: seq as u32,
                    modality: Modality::Text,
                    raw_content: format!("parent {seq}"),
                    metadata: serde_json::json!({}),
                    content_hash: format!("{seq}"),
                    parse_error: None,
                })
                .collect();
            self.db.replace_parent_chunks(doc.id, &parent_rows).await.unwrap();

            for (parent, texts) in parent_rows.iter().zip(parents) {
                let children: Vec<ChildChunkRecord> = texts
                    .iter()
                    .enumerate()
                    .map(|(i, text)| ChildChunkRecord {
                        id: format!("{}/{i}", parent.id),
                        parent_chunk_id: parent.id.clone(),
                        document_id: doc.id,
                        window_index: i as u32,
                        text: text.clone(),
                        token_count: text.split_whitespace().count() as u32,
                        vector_dim: None,
                        embedded_at: None,
                    })
                    .collect();
                self.db.replace_child_chunks(&parent.id, &children).await.unwrap();
                if embed {
                    self.vectors.embed_and_store(&children).await.unwrap();
                }
            }
            doc.id
        }
    }

    fn words(word: &str, n: usize) -> String {
        vec![word; n].join(" ")
    }

    #[tokio::test]
    async fn test_pinned_share_can_crowd_out_hits() {
        let fx = Fixture::new().await;
        let session = fx.db.create_session("budget").await.unwrap();

        let pinned_doc = fx
            .document("pinned.md", &[&[words("pin", 40), words("pin", 40)]], false)
            .await;
        fx.db.pin_document(session.id, pinned_doc).await.unwrap();
        for i in 0..5 {
            fx.document(&format!("hit{i}.md"), &[&[words("alpha", 30)]], true)
                .await;
        }

        let assembler = fx.assembler(ContextConfig {
            token_budget: 100,
            pinned_share: 0.8,
            top_k: 5,
            history_limit: 10,
        });
        let packed = assembler.assemble(session.id, "alpha", 100).await.unwrap();

        assert_eq!(packed.tokens_for(FragmentSource::Pinned), 80);
        assert_eq!(packed.tokens_for(FragmentSource::Retrieved), 0);
        assert_eq!(packed.used_tokens, 80);
        assert_eq!(packed.dropped, 5);
    }

    #[tokio::test]
    async fn test_priority_order_and_parent_dedup() {
        let fx = Fixture::new().await;
        let session = fx.db.create_session("order").await.unwrap();

        let pinned_doc = fx
            .document("notes.md", &[&["alpha pinned note".to_string()]], true)
            .await;
        fx.db.pin_document(session.id, pinned_doc).await.unwrap();
        // two alpha windows under one parent collapse into one hit
        fx.document(
            "guide.md",
            &[
                &["alpha first".to_string(), "alpha second".to_string()],
                &["beta only".to_string()],
            ],
            true,
        )
        .await;

        fx.db.add_message(session.id, Role::User, "earlier question", 2).await.unwrap();
        fx.db.add_message(session.id, Role::Assistant, "earlier answer", 2).await.unwrap();

        let assembler = fx.assembler(ContextConfig::default());
        let packed = assembler.assemble(session.id, "alpha", 1000).await.unwrap();
        let sources: Vec<_> = packed.fragments.iter().map(|f| f.source).collect();
        assert_eq!(
            sources,
            vec![
                FragmentSource::Pinned,
                FragmentSource::Retrieved,
                FragmentSource::Retrieved,
                FragmentSource::History,
                FragmentSource::History,
            ]
        );

        let hits: Vec<_> = packed
            .fragments
            .iter()
            .filter(|f| f.source == FragmentSource::Retrieved)
            .map(|f| f.chunk_id.clone().unwrap())
            .collect();
        // pinned chunk is not repeated; best alpha window of guide.md#0 wins its parent
        assert_eq!(hits, vec!["guide.md#0/0".to_string(), "guide.md#1/0".to_string()]);

        let history: Vec<_> = packed
            .fragments
            .iter()
            .filter(|f| f.source == FragmentSource::History)
            .map(|f| f.text.as_str())
            .collect();
        assert_eq!(history, vec!["earlier answer", "earlier question"]);

        let again = assembler.assemble(session.id, "alpha", 1000).await.unwrap();
        assert_eq!(packed, again);
    }

    #[tokio::test]
    async fn test_excluded_message_and_unknown_session() {
        let fx = Fixture::new().await;
        let session = fx.db.create_session("skip").await.unwrap();
        let kept = fx.db.add_message(session.id, Role::User, "keep me", 2).await.unwrap();
        let current = fx.db.add_message(session.id, Role::User, "current turn", 2).await.unwrap();

        let assembler = fx.assembler(ContextConfig::default());
        let packed = assembler
            .assemble_excluding(session.id, "current turn", 100, Some(current.id))
            .await
            .unwrap();
        let ids: Vec<_> = packed.fragments.iter().filter_map(|f| f.message_id).collect();
        assert_eq!(ids, vec![kept.id]);

        assert!(matches!(
            assembler.assemble(9999, "x", 100).await,
            Err(CoreError::NotFound { .. })
        ));
    }
}

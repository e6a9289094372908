//! Parent/child chunking with deterministic ids.
//!
//! Parent chunks are the structural units produced by the
//! [`DocumentAnalyzer`](super::analyzer::DocumentAnalyzer). Each parseable parent is cut into
//! overlapping child windows, and children are what gets embedded and retrieved.
//!
//! Ids are derived from content, so processing an unchanged region twice produces the same rows:
//!
//! ```text
//! parent id = blake3(document_id, sequence_index, blake3(modality, raw_content))
//! child id  = blake3(parent id, window_index, blake3(window text))
//! ```

use super::analyzer::{ImageSource, ParentDraft};
use crate::error::Result;
use crate::storage::{ChildChunkRecord, Modality, ParentChunkRecord};
use async_trait::async_trait;
use focus_ai_context::{TextWindowBuilder, TokenEstimator, WindowConfig};
use std::sync::Arc;

/// Produces retrieval text for an image, typically through a VISION model.
#[async_trait]
pub trait ImageDescriber: Send + Sync {
    /// `Ok(None)` means no describer is available right now and the caller should fall back to
    /// alt text.
    async fn describe(&self, image: &ImageSource) -> Result<Option<String>>;
}

/// A parent with the children cut from it.
#[derive(Debug, Clone)]
pub struct ProcessedParent {
    pub parent: ParentChunkRecord,
    pub children: Vec<ChildChunkRecord>,
    /// Whether a vision model supplied the child text
    pub described: bool,
}

/// Configuration for chunking
#[derive(Debug, Clone, Copy)]
pub struct ChunkingSettings {
    pub child_target_tokens: usize,
    pub overlap_fraction: f32,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            child_target_tokens: 256,
            overlap_fraction: 0.15,
        }
    }
}

pub fn parent_content_hash(modality: Modality, raw_content: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(modality.as_str().as_bytes());
    hasher.update(&[0]);
    hasher.update(raw_content.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn parent_chunk_id(document_id: i64, sequence_index: u32, content_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&document_id.to_le_bytes());
    hasher.update(&sequence_index.to_le_bytes());
    hasher.update(content_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

pub fn child_chunk_id(parent_id: &str, window_index: u32, text: &str) -> String {
    let text_hash = blake3::hash(text.as_bytes());
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent_id.as_bytes());
    hasher.update(&window_index.to_le_bytes());
    hasher.update(text_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Turns parent drafts into parent and child rows.
#[derive(Clone)]
pub struct ChunkingPipeline {
    text_windows: TextWindowBuilder,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for ChunkingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkingPipeline")
            .field("windows", self.text_windows.config())
            .finish()
    }
}

impl ChunkingPipeline {
    pub fn new(settings: ChunkingSettings, estimator: Arc<dyn TokenEstimator>) -> Result<Self> {
        let text_windows = TextWindowBuilder::markdown(
            WindowConfig {
                target_tokens: settings.child_target_tokens,
                overlap_fraction: settings.overlap_fraction,
            },
            Arc::clone(&estimator),
        )?;
        Ok(Self {
            text_windows,
            estimator,
        })
    }

    pub fn estimator(&self) -> &Arc<dyn TokenEstimator> {
        &self.estimator
    }

    /// Assign ids and sequence numbers to drafts, in document order.
    pub fn build_parents(&self, document_id: i64, drafts: &[ParentDraft]) -> Vec<ParentChunkRecord> {
        drafts
            .iter()
            .enumerate()
            .map(|(seq, draft)| {
                let sequence_index = seq as u32;
                let content_hash = parent_content_hash(draft.modality, &draft.raw_content);
                ParentChunkRecord {
                    id: parent_chunk_id(document_id, sequence_index, &content_hash),
                    document_id,
                    sequence_index,
                    modality: draft.modality,
                    raw_content: draft.raw_content.clone(),
                    metadata: draft.metadata.clone(),
                    content_hash,
                    parse_error: draft.parse_error.clone(),
                }
            })
            .collect()
    }

    /// Cut `text` into child rows of `parent`. Parents with a parse error have no children.
    pub fn derive_children(&self, parent: &ParentChunkRecord, text: &str) -> Vec<ChildChunkRecord> {
        if parent.parse_error.is_some() {
            return Vec::new();
        }
        self.text_windows
            .windows(text)
            .into_iter()
            .map(|window| {
                let window_index = window.index as u32;
                ChildChunkRecord {
                    id: child_chunk_id(&parent.id, window_index, &window.text),
                    parent_chunk_id: parent.id.clone(),
                    document_id: parent.document_id,
                    window_index,
                    token_count: window.token_count as u32,
                    text: window.text,
                    vector_dim: None,
                    embedded_at: None,
                }
            })
            .collect()
    }

    /// Build one parent and its children. IMAGE parents ask `describer` first and fall back to
    /// the draft's alt/surrounding text when it has nothing to offer or fails.
    pub async fn process_parent(
        &self,
        parent: ParentChunkRecord,
        draft: &ParentDraft,
        describer: Option<&dyn ImageDescriber>,
    ) -> ProcessedParent {
        let mut described = false;
        let mut text = draft.child_source.clone();

        if parent.parse_error.is_none()
            && let (Some(image), Some(describer)) = (&draft.image, describer)
        {
            match describer.describe(image).await {
                Ok(Some(description)) if !description.trim().is_empty() => {
                    text = match image.alt.trim() {
                        "" => description,
                        alt => format!("{alt}: {description}"),
                    };
                    described = true;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        "Vision description of {} failed, using alt text: {}",
                        image.path.display(),
                        e
                    );
                }
            }
        }

        let children = self.derive_children(&parent, &text);
        ProcessedParent {
            parent,
            children,
            described,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::retrieval::analyzer::{DocumentAnalyzer, SourceKind};
    use focus_ai_context::WordCountEstimator;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(target: usize) -> ChunkingPipeline {
        ChunkingPipeline::new(
            ChunkingSettings {
                child_target_tokens: target,
                overlap_fraction: 0.15,
            },
            Arc::new(WordCountEstimator),
        )
        .unwrap()
    }

    fn drafts(text: &str) -> Vec<ParentDraft> {
        DocumentAnalyzer::new(1024, Arc::new(WordCountEstimator))
            .analyze_text(Path::new("doc.md"), SourceKind::Markdown, text)
            .unwrap()
    }

    #[test]
    fn test_ids_are_deterministic() {
        let p = pipeline(8);
        let text = "# A\n\nalpha beta gamma delta epsilon zeta eta theta iota kappa lambda mu";
        let first = p.build_parents(7, &drafts(text));
        let second = p.build_parents(7, &drafts(text));
        assert_eq!(first, second);

        let children_a = p.derive_children(&first[0], &first[0].raw_content);
        let children_b = p.derive_children(&second[0], &second[0].raw_content);
        assert_eq!(children_a, children_b);
        assert!(children_a.len() > 1);

        // the same content in another document is a different chunk
        let other = p.build_parents(8, &drafts(text));
        assert_ne!(first[0].id, other[0].id);
    }

    #[test]
    fn test_changed_region_changes_only_its_ids() {
        let p = pipeline(64);
        let before = p.build_parents(1, &drafts("# A\n\none\n\n# B\n\ntwo"));
        let after = p.build_parents(1, &drafts("# A\n\none\n\n# B\n\ntwo changed"));
        assert_eq!(before[0].id, after[0].id);
        assert_ne!(before[1].id, after[1].id);
        assert_eq!(after[1].sequence_index, 1);
    }

    #[test]
    fn test_parse_errors_produce_no_children() {
        let p = pipeline(64);
        let parents = p.build_parents(1, &drafts("| a | b |\n|---|---|\n| 1 |\n"));
        assert_eq!(parents[0].modality, Modality::Table);
        assert!(parents[0].parse_error.is_some());
        assert!(p.derive_children(&parents[0], "a: 1").is_empty());
    }

    struct FixedDescriber {
        reply: std::result::Result<Option<String>, ()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageDescriber for FixedDescriber {
        async fn describe(&self, _image: &ImageSource) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .map_err(|_| CoreError::transient("vision model offline"))
        }
    }

    fn image_draft() -> ParentDraft {
        let source = ImageSource {
            path: PathBuf::from("/tmp/chart.png"),
            alt: "revenue chart".into(),
            surrounding: "Quarterly numbers.".into(),
        };
        ParentDraft {
            modality: Modality::Image,
            raw_content: "![revenue chart](chart.png)".into(),
            metadata: serde_json::json!({}),
            parse_error: None,
            child_source: source.fallback_text(),
            image: Some(source),
        }
    }

    #[tokio::test]
    async fn test_image_children_prefer_vision_description() {
        let p = pipeline(64);
        let draft = image_draft();
        let parent = p.build_parents(1, std::slice::from_ref(&draft)).remove(0);

        let describer = FixedDescriber {
            reply: Ok(Some("bars rising each quarter".into())),
            calls: AtomicUsize::new(0),
        };
        let processed = p.process_parent(parent.clone(), &draft, Some(&describer)).await;
        assert!(processed.described);
        assert_eq!(processed.children[0].text, "revenue chart: bars rising each quarter");

        let failing = FixedDescriber {
            reply: Err(()),
            calls: AtomicUsize::new(0),
        };
        let processed = p.process_parent(parent.clone(), &draft, Some(&failing)).await;
        assert!(!processed.described);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            processed.children[0].text,
            "Image: revenue chart. Quarterly numbers."
        );

        let processed = p.process_parent(parent, &draft, None).await;
        assert!(!processed.described);
        assert_eq!(processed.children.len(), 1);
    }
}

//! Source analysis: turn a file into ordered parent-chunk drafts.
//!
//! The analyzer picks a strategy from the file extension:
//!
//! - Markdown is split into heading-aware sections. Fenced code stays whole, pipe tables become
//!   TABLE units and `![alt](path)` references become IMAGE units.
//! - Plain text and source code become TEXT sections bounded by `parent_max_tokens`.
//! - CSV/TSV files become a single TABLE unit.
//! - Image files become a single IMAGE unit.
//!
//! A unit that cannot be parsed (a ragged table, an image that does not exist) keeps its error in
//! [`ParentDraft::parse_error`] instead of failing the document.

use crate::error::{CoreError, Result};
use crate::storage::Modality;
use focus_ai_context::{
    Block, BlockKind, ImageRef, TableBlock, TextWindowBuilder, TokenEstimator, WindowConfig,
    parse_delimited_table, parse_markdown_blocks,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How a source file is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Markdown,
    PlainText,
    Delimited(char),
    Image,
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

/// Classify `path` by extension. Returns `None` for formats that cannot be ingested.
pub fn classify_path(path: &Path) -> Option<SourceKind> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match extension.as_deref() {
        Some("md") | Some("markdown") | Some("mdx") => Some(SourceKind::Markdown),
        Some("csv") => Some(SourceKind::Delimited(',')),
        Some("tsv") | Some("tab") => Some(SourceKind::Delimited('\t')),
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext) => Some(SourceKind::Image),

        // Binary and archive formats we skip
        Some("exe") | Some("dll") | Some("so") | Some("dylib") | Some("bin") | Some("zip")
        | Some("gz") | Some("tar") | Some("pdf") | Some("docx") | Some("xlsx") | Some("wasm")
        | Some("ico") | Some("lock") => None,

        _ => Some(SourceKind::PlainText),
    }
}

/// A local image an IMAGE unit points at.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    pub path: PathBuf,
    pub alt: String,
    pub surrounding: String,
}

impl ImageSource {
    /// Text used when no vision model can describe the image.
    pub fn fallback_text(&self) -> String {
        match (self.alt.trim(), self.surrounding.trim()) {
            ("", "") => format!("Image {}", self.path.display()),
            (alt, "") => format!("Image: {alt}"),
            ("", surrounding) => format!("Image. {surrounding}"),
            (alt, surrounding) => format!("Image: {alt}. {surrounding}"),
        }
    }
}

/// One unit of a document before it is assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentDraft {
    pub modality: Modality,
    pub raw_content: String,
    pub metadata: serde_json::Value,
    pub parse_error: Option<String>,
    /// Text that child windows are cut from (linearized tables, section text)
    pub child_source: String,
    /// Set for IMAGE units whose file exists locally
    pub image: Option<ImageSource>,
}

/// A read and analyzed source file.
#[derive(Debug, Clone)]
pub struct AnalyzedDocument {
    /// Hex blake3 of the file bytes
    pub content_hash: String,
    pub kind: SourceKind,
    pub parents: Vec<ParentDraft>,
}

/// Hex blake3 of `bytes`; the content hash recorded on documents.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Splits sources into parent drafts.
#[derive(Clone)]
pub struct DocumentAnalyzer {
    parent_max_tokens: usize,
    estimator: Arc<dyn TokenEstimator>,
}

impl std::fmt::Debug for DocumentAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentAnalyzer")
            .field("parent_max_tokens", &self.parent_max_tokens)
            .finish()
    }
}

impl DocumentAnalyzer {
    pub fn new(parent_max_tokens: usize, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            parent_max_tokens: parent_max_tokens.max(1),
            estimator,
        }
    }

    /// Read `path` and analyze it.
    ///
    /// # Errors
    /// `Validation` for unsupported formats and text files that are not UTF-8; `Io` when the
    /// file cannot be read (retryable, the file may be mid-write).
    pub async fn analyze_file(&self, path: &Path) -> Result<AnalyzedDocument> {
        let kind = classify_path(path).ok_or_else(|| {
            CoreError::validation(format!("unsupported file type: {}", path.display()))
        })?;
        let bytes = tokio::fs::read(path).await?;
        let content_hash = content_hash(&bytes);

        let parents = match kind {
            SourceKind::Image => vec![image_file_draft(path)],
            _ => {
                let text = String::from_utf8(bytes).map_err(|_| {
                    CoreError::validation(format!("{} is not valid UTF-8", path.display()))
                })?;
                self.analyze_text(path, kind, &text)?
            }
        };

        tracing::debug!(
            "Analyzed {} into {} parent unit(s)",
            path.display(),
            parents.len()
        );
        Ok(AnalyzedDocument {
            content_hash,
            kind,
            parents,
        })
    }

    /// Analyze already-loaded text. `path` resolves relative image references.
    pub fn analyze_text(&self, path: &Path, kind: SourceKind, text: &str) -> Result<Vec<ParentDraft>> {
        match kind {
            SourceKind::Markdown => Ok(self.markdown_drafts(path, text)),
            SourceKind::PlainText => self.plain_text_drafts(text),
            SourceKind::Delimited(delimiter) => {
                let table = parse_delimited_table(text, delimiter);
                Ok(vec![table_draft(&table, &[])])
            }
            SourceKind::Image => Ok(vec![image_file_draft(path)]),
        }
    }

    fn markdown_drafts(&self, path: &Path, text: &str) -> Vec<ParentDraft> {
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut drafts = Vec::new();
        let mut section = Section::default();

        for block in parse_markdown_blocks(text) {
            match &block.kind {
                BlockKind::Heading { text: title, .. } => {
                    section.flush_into(&mut drafts);
                    let mut heading_path = block.heading_path.clone();
                    heading_path.push(title.clone());
                    section.start(heading_path);
                    self.push_block(&mut section, &mut drafts, &block);
                }
                BlockKind::Paragraph { .. } | BlockKind::Code { .. } => {
                    if section.pieces.is_empty() {
                        section.heading_path = block.heading_path.clone();
                    }
                    self.push_block(&mut section, &mut drafts, &block);
                }
                BlockKind::Table(table) => {
                    section.flush_into(&mut drafts);
                    drafts.push(table_draft(table, &block.heading_path));
                }
                BlockKind::Image(image) => {
                    section.flush_into(&mut drafts);
                    drafts.push(markdown_image_draft(base_dir, image, &block.heading_path));
                }
            }
        }
        section.flush_into(&mut drafts);
        drafts
    }

    fn push_block(&self, section: &mut Section, drafts: &mut Vec<ParentDraft>, block: &Block) {
        let text = block.text();
        let tokens = self.estimator.estimate(&text);
        if !section.pieces.is_empty() && section.tokens + tokens > self.parent_max_tokens {
            let heading_path = section.heading_path.clone();
            section.flush_into(drafts);
            section.start(heading_path);
        }
        section.pieces.push(text);
        section.tokens += tokens;
    }

    fn plain_text_drafts(&self, text: &str) -> Result<Vec<ParentDraft>> {
        let builder = TextWindowBuilder::plain_text(
            WindowConfig {
                target_tokens: self.parent_max_tokens,
                overlap_fraction: 0.0,
            },
            Arc::clone(&self.estimator),
        )?;
        Ok(builder
            .windows(text)
            .into_iter()
            .map(|window| ParentDraft {
                modality: Modality::Text,
                metadata: json!({
                    "heading_path": [],
                    "byte_range": [window.range.start, window.range.end],
                }),
                child_source: window.text.clone(),
                raw_content: window.text,
                parse_error: None,
                image: None,
            })
            .collect())
    }
}

#[derive(Debug, Default)]
struct Section {
    heading_path: Vec<String>,
    pieces: Vec<String>,
    tokens: usize,
}

impl Section {
    fn start(&mut self, heading_path: Vec<String>) {
        self.heading_path = heading_path;
        self.pieces.clear();
        self.tokens = 0;
    }

    fn flush_into(&mut self, drafts: &mut Vec<ParentDraft>) {
        let text = self.pieces.join("\n\n");
        if !text.trim().is_empty() {
            drafts.push(ParentDraft {
                modality: Modality::Text,
                metadata: json!({ "heading_path": self.heading_path }),
                child_source: text.clone(),
                raw_content: text,
                parse_error: None,
                image: None,
            });
        }
        self.pieces.clear();
        self.tokens = 0;
    }
}

fn table_draft(table: &TableBlock, heading_path: &[String]) -> ParentDraft {
    let ragged = table.ragged_rows();
    let parse_error = if table.header.is_empty() {
        Some("table has no header row".to_string())
    } else if !ragged.is_empty() {
        Some(format!(
            "ragged table: {} row(s) do not have {} cells (first at data row {})",
            ragged.len(),
            table.header.len(),
            ragged[0] + 1
        ))
    } else {
        None
    };

    ParentDraft {
        modality: Modality::Table,
        raw_content: table.raw.clone(),
        metadata: json!({
            "heading_path": heading_path,
            "header": table.header,
            "rows": table.rows,
        }),
        child_source: table.to_text(),
        parse_error,
        image: None,
    }
}

fn is_remote(target: &str) -> bool {
    let lower = target.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("data:")
}

fn markdown_image_draft(base_dir: &Path, image: &ImageRef, heading_path: &[String]) -> ParentDraft {
    let raw_content = format!("![{}]({})", image.alt, image.target);
    let mut metadata = json!({
        "heading_path": heading_path,
        "alt": image.alt,
        "target": image.target,
        "surrounding": image.surrounding,
    });

    if is_remote(&image.target) {
        // Remote images are never fetched; they are indexed by their alt and surrounding text
        let source = ImageSource {
            path: PathBuf::from(&image.target),
            alt: image.alt.clone(),
            surrounding: image.surrounding.clone(),
        };
        metadata["remote"] = json!(true);
        return ParentDraft {
            modality: Modality::Image,
            raw_content,
            metadata,
            child_source: source.fallback_text(),
            parse_error: None,
            image: None,
        };
    }

    let resolved = base_dir.join(&image.target);
    metadata["resolved_path"] = json!(resolved.to_string_lossy());
    let source = ImageSource {
        path: resolved.clone(),
        alt: image.alt.clone(),
        surrounding: image.surrounding.clone(),
    };

    if image.target.is_empty() || !resolved.is_file() {
        return ParentDraft {
            modality: Modality::Image,
            raw_content,
            metadata,
            child_source: String::new(),
            parse_error: Some(format!("image file not found: {}", resolved.display())),
            image: None,
        };
    }

    ParentDraft {
        modality: Modality::Image,
        raw_content,
        metadata,
        child_source: source.fallback_text(),
        parse_error: None,
        image: Some(source),
    }
}

fn image_file_draft(path: &Path) -> ParentDraft {
    let alt = path
        .file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_default();
    let source = ImageSource {
        path: path.to_path_buf(),
        alt,
        surrounding: String::new(),
    };
    ParentDraft {
        modality: Modality::Image,
        raw_content: path.to_string_lossy().to_string(),
        metadata: json!({
            "resolved_path": path.to_string_lossy(),
            "alt": source.alt,
            "surrounding": "",
        }),
        child_source: source.fallback_text(),
        parse_error: None,
        image: Some(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_ai_context::{HeuristicTokenEstimator, WordCountEstimator};
    use tempfile::tempdir;

    fn analyzer(max_tokens: usize) -> DocumentAnalyzer {
        DocumentAnalyzer::new(max_tokens, Arc::new(WordCountEstimator))
    }

    #[test]
    fn test_classify_path() {
        assert_eq!(classify_path(Path::new("a/README.md")), Some(SourceKind::Markdown));
        assert_eq!(classify_path(Path::new("data.CSV")), Some(SourceKind::Delimited(',')));
        assert_eq!(classify_path(Path::new("data.tsv")), Some(SourceKind::Delimited('\t')));
        assert_eq!(classify_path(Path::new("shot.PNG")), Some(SourceKind::Image));
        assert_eq!(classify_path(Path::new("notes")), Some(SourceKind::PlainText));
        assert_eq!(classify_path(Path::new("main.rs")), Some(SourceKind::PlainText));
        assert_eq!(classify_path(Path::new("archive.zip")), None);
    }

    #[test]
    fn test_markdown_sections_tables_and_missing_images() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("guide.md");
        let text = "# Guide\n\nIntro text.\n\n## Setup\n\nInstall it.\n\n```sh\ncargo install focus\n```\n\n| a | b |\n|---|---|\n| 1 | 2 |\n\nSee ![diagram](missing.png) below.\n";

        let drafts = analyzer(1024)
            .analyze_text(&doc, SourceKind::Markdown, text)
            .unwrap();
        let modalities: Vec<_> = drafts.iter().map(|d| d.modality).collect();
        assert_eq!(
            modalities,
            vec![
                Modality::Text,
                Modality::Text,
                Modality::Table,
                Modality::Text,
                Modality::Image
            ]
        );

        assert!(drafts[0].raw_content.starts_with("# Guide"));
        assert_eq!(drafts[1].metadata["heading_path"], json!(["Guide", "Setup"]));
        assert!(drafts[1].raw_content.contains("cargo install focus"));
        assert!(drafts[2].parse_error.is_none());
        assert_eq!(drafts[2].child_source, "a | b\na: 1; b: 2");
        assert!(drafts[4].parse_error.as_deref().unwrap().contains("not found"));
    }

    #[test]
    fn test_existing_image_uses_alt_and_surrounding_text() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("arch.png"), b"\x89PNG").unwrap();
        let doc = dir.path().join("doc.md");

        let drafts = analyzer(1024)
            .analyze_text(&doc, SourceKind::Markdown, "The pipeline:\n\n![architecture](arch.png)\n")
            .unwrap();
        let image = drafts.iter().find(|d| d.modality == Modality::Image).unwrap();
        assert!(image.parse_error.is_none());
        let source = image.image.as_ref().unwrap();
        assert_eq!(source.path, dir.path().join("arch.png"));
        assert_eq!(image.child_source, "Image: architecture. The pipeline:");
    }

    #[test]
    fn test_long_sections_are_split_under_the_same_heading() {
        let paragraphs: Vec<String> = (0..6).map(|i| format!("para{i} one two three four")).collect();
        let text = format!("# Big\n\n{}", paragraphs.join("\n\n"));
        let drafts = analyzer(12)
            .analyze_text(Path::new("big.md"), SourceKind::Markdown, &text)
            .unwrap();

        assert!(drafts.len() > 1);
        for draft in &drafts {
            assert_eq!(draft.metadata["heading_path"], json!(["Big"]));
        }
        let joined: String = drafts.iter().map(|d| d.raw_content.clone()).collect::<Vec<_>>().join(" ");
        for i in 0..6 {
            assert!(joined.contains(&format!("para{i}")));
        }
    }

    #[test]
    fn test_ragged_csv_is_a_parse_error() {
        let drafts = analyzer(1024)
            .analyze_text(Path::new("t.csv"), SourceKind::Delimited(','), "a,b\n1,2\n3\n")
            .unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].modality, Modality::Table);
        assert!(drafts[0].parse_error.as_deref().unwrap().contains("ragged"));
    }

    #[tokio::test]
    async fn test_analyze_file_hashes_and_rejects_binary() {
        let dir = tempdir().unwrap();
        let text_path = dir.path().join("notes.txt");
        std::fs::write(&text_path, "alpha beta gamma").unwrap();

        let analyzer = DocumentAnalyzer::new(256, Arc::new(HeuristicTokenEstimator::default()));
        let doc = analyzer.analyze_file(&text_path).await.unwrap();
        assert_eq!(doc.content_hash, content_hash(b"alpha beta gamma"));
        assert_eq!(doc.parents.len(), 1);

        let bad = dir.path().join("bad.txt");
        std::fs::write(&bad, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(
            analyzer.analyze_file(&bad).await,
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            analyzer.analyze_file(&dir.path().join("gone.txt")).await,
            Err(CoreError::Io(_))
        ));
    }
}

//! Structural parsing of Markdown and delimited text into typed blocks.
//!
//! The parser is line based and intentionally forgiving: anything it does not recognise becomes a
//! paragraph. It tracks the heading path above each block so callers can group blocks into
//! heading-aware sections.

use serde::Serialize;

/// A table with its header row, data rows, and original source text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableBlock {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub raw: String,
}

impl TableBlock {
    /// Indices (0-based, data rows only) of rows whose width differs from the header.
    pub fn ragged_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.len() != self.header.len())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Linearise the table as `column: value` lines, one line per row.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if !self.header.is_empty() {
            out.push_str(&self.header.join(" | "));
            out.push('\n');
        }
        for row in &self.rows {
            let line = row
                .iter()
                .enumerate()
                .map(|(idx, cell)| match self.header.get(idx) {
                    Some(column) if !column.is_empty() => format!("{column}: {cell}"),
                    _ => cell.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            out.push_str(&line);
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

/// An image reference found in Markdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRef {
    pub alt: String,
    pub target: String,
    /// Paragraph text the image appeared in, or the paragraph before it.
    pub surrounding: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Heading { level: u8, text: String },
    Paragraph { text: String },
    Code { language: Option<String>, text: String },
    Table(TableBlock),
    Image(ImageRef),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Block {
    pub kind: BlockKind,
    /// Titles of the enclosing headings, outermost first.
    pub heading_path: Vec<String>,
}

impl Block {
    /// Text used when the block is folded into a section.
    pub fn text(&self) -> String {
        match &self.kind {
            BlockKind::Heading { level, text } => {
                format!("{} {}", "#".repeat(*level as usize), text)
            }
            BlockKind::Paragraph { text } => text.clone(),
            BlockKind::Code { language, text } => {
                format!("```{}\n{}\n```", language.as_deref().unwrap_or(""), text)
            }
            BlockKind::Table(table) => table.raw.clone(),
            BlockKind::Image(image) => format!("![{}]({})", image.alt, image.target),
        }
    }
}

/// Parse Markdown into blocks in document order.
pub fn parse_markdown_blocks(text: &str) -> Vec<Block> {
    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut headings: Vec<(u8, String)> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();
    let mut last_paragraph = String::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();
        let path: Vec<String> = headings.iter().map(|(_, t)| t.clone()).collect();

        if let Some(fence) = fence_marker(trimmed) {
            flush_paragraph(&mut paragraph, &path, &mut last_paragraph, &mut blocks);
            let language = trimmed[fence.len()..].trim();
            let language = (!language.is_empty()).then(|| language.to_string());
            let mut body = Vec::new();
            i += 1;
            while i < lines.len() && !lines[i].trim().starts_with(fence) {
                body.push(lines[i]);
                i += 1;
            }
            blocks.push(Block {
                kind: BlockKind::Code {
                    language,
                    text: body.join("\n"),
                },
                heading_path: path,
            });
            // skip the closing fence (or run off the end of an unterminated block)
            i += 1;
            continue;
        }

        if let Some((level, title)) = parse_heading(trimmed) {
            flush_paragraph(&mut paragraph, &path, &mut last_paragraph, &mut blocks);
            while headings.last().is_some_and(|(l, _)| *l >= level) {
                headings.pop();
            }
            blocks.push(Block {
                kind: BlockKind::Heading {
                    level,
                    text: title.clone(),
                },
                heading_path: path,
            });
            headings.push((level, title));
            i += 1;
            continue;
        }

        if is_table_row(trimmed) && lines.get(i + 1).is_some_and(|l| is_table_separator(l)) {
            flush_paragraph(&mut paragraph, &path, &mut last_paragraph, &mut blocks);
            let header = split_pipe_row(trimmed);
            let mut raw = vec![line, lines[i + 1]];
            let mut rows = Vec::new();
            i += 2;
            while i < lines.len() && is_table_row(lines[i].trim()) {
                raw.push(lines[i]);
                rows.push(split_pipe_row(lines[i].trim()));
                i += 1;
            }
            blocks.push(Block {
                kind: BlockKind::Table(TableBlock {
                    header,
                    rows,
                    raw: raw.join("\n"),
                }),
                heading_path: path,
            });
            continue;
        }

        if trimmed.is_empty() {
            flush_paragraph(&mut paragraph, &path, &mut last_paragraph, &mut blocks);
        } else {
            paragraph.push(line);
        }
        i += 1;
    }

    let path: Vec<String> = headings.iter().map(|(_, t)| t.clone()).collect();
    flush_paragraph(&mut paragraph, &path, &mut last_paragraph, &mut blocks);
    blocks
}

/// Parse CSV/TSV-style text into a single table. Double-quoted cells may contain the delimiter.
pub fn parse_delimited_table(text: &str, delimiter: char) -> TableBlock {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .map(|l| split_delimited_row(l, delimiter))
        .unwrap_or_default();
    let rows = lines.map(|l| split_delimited_row(l, delimiter)).collect();
    TableBlock {
        header,
        rows,
        raw: text.trim_end().to_string(),
    }
}

fn flush_paragraph(
    paragraph: &mut Vec<&str>,
    heading_path: &[String],
    last_paragraph: &mut String,
    blocks: &mut Vec<Block>,
) {
    if paragraph.is_empty() {
        return;
    }
    let joined = paragraph.join("\n");
    paragraph.clear();

    let (stripped, images) = extract_images(&joined);
    let stripped = stripped.trim().to_string();
    let surrounding = if stripped.is_empty() {
        last_paragraph.clone()
    } else {
        stripped.clone()
    };

    if !stripped.is_empty() {
        blocks.push(Block {
            kind: BlockKind::Paragraph {
                text: stripped.clone(),
            },
            heading_path: heading_path.to_vec(),
        });
        *last_paragraph = stripped;
    }
    for (alt, target) in images {
        blocks.push(Block {
            kind: BlockKind::Image(ImageRef {
                alt,
                target,
                surrounding: surrounding.clone(),
            }),
            heading_path: heading_path.to_vec(),
        });
    }
}

// Pulls `![alt](target "title")` references out of a paragraph, returning the remaining text.
fn extract_images(text: &str) -> (String, Vec<(String, String)>) {
    let mut remaining = String::with_capacity(text.len());
    let mut images = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("![") {
        let after_bang = &rest[start + 2..];
        let Some(alt_end) = after_bang.find("](") else {
            break;
        };
        let after_paren = &after_bang[alt_end + 2..];
        let Some(target_end) = after_paren.find(')') else {
            break;
        };

        let alt = after_bang[..alt_end].trim().to_string();
        let target = after_paren[..target_end]
            .split_whitespace()
            .next()
            .unwrap_or("")
            .trim_matches(|c| c == '<' || c == '>')
            .to_string();

        remaining.push_str(&rest[..start]);
        if !target.is_empty() {
            images.push((alt, target));
        }
        rest = &after_paren[target_end + 1..];
    }
    remaining.push_str(rest);
    (remaining, images)
}

fn fence_marker(trimmed: &str) -> Option<&'static str> {
    if trimmed.starts_with("```") {
        Some("```")
    } else if trimmed.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

fn parse_heading(trimmed: &str) -> Option<(u8, String)> {
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some((level as u8, rest.trim().trim_end_matches('#').trim().to_string()))
}

fn is_table_row(trimmed: &str) -> bool {
    trimmed.starts_with('|')
}

fn is_table_separator(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.starts_with('|')
        && trimmed.contains('-')
        && trimmed
            .chars()
            .all(|c| matches!(c, '|' | '-' | ':' | ' ' | '\t'))
}

fn split_pipe_row(trimmed: &str) -> Vec<String> {
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    inner.split('|').map(|cell| cell.trim().to_string()).collect()
}

fn split_delimited_row(line: &str, delimiter: char) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => {
                cells.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    cells.push(current.trim().to_string());
    cells
}

pub mod blocks;
pub mod budget;
pub mod error;
pub mod text;
pub mod tokens;

pub use blocks::{Block, BlockKind, ImageRef, TableBlock, parse_delimited_table, parse_markdown_blocks};
pub use budget::{ContextBudget, ContextFragment, FragmentSource, PackedContext, pack_fragments};
pub use error::TextError;
pub use text::{TextWindow, TextWindowBuilder, WindowConfig, delimiters_for_path};
pub use tokens::{HeuristicTokenEstimator, TokenEstimator, WordCountEstimator};

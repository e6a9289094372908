use clap::{Parser, ValueEnum};
use focus_ai_context::blocks::parse_markdown_blocks;
use focus_ai_context::text::{DEFAULT_MARKDOWN_DELIMITERS, TextWindowBuilder, WindowConfig};
use focus_ai_context::tokens::{HeuristicTokenEstimator, TokenEstimator, WordCountEstimator};
use serde::Serialize;
use std::fs;
use std::io::{self, Read};
use std::sync::Arc;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Overlapping token windows
    Windows,
    /// Structural Markdown blocks
    Blocks,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Estimator {
    Heuristic,
    Words,
}

/// Split text into retrieval windows (or Markdown blocks) and print them as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input text file. If not provided, reads from stdin.
    #[arg(short, long)]
    input: Option<String>,

    #[arg(short, long, value_enum, default_value_t = Mode::Windows)]
    mode: Mode,

    /// Target tokens per window.
    #[arg(short, long, default_value_t = 256)]
    target_tokens: usize,

    /// Share of the target repeated between consecutive windows.
    #[arg(short, long, default_value_t = 0.15)]
    overlap: f32,

    #[arg(short, long, value_enum, default_value_t = Estimator::Heuristic)]
    estimator: Estimator,

    /// Comma-separated list of regex patterns for delimiters.
    /// Defaults to Markdown delimiters if not provided.
    #[arg(short, long, value_delimiter = ',')]
    delimiters: Option<Vec<String>>,
}

#[derive(Serialize)]
struct WindowOutput<'a> {
    index: usize,
    start: usize,
    end: usize,
    token_count: usize,
    text: &'a str,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let file_content = if let Some(input_path) = args.input {
        fs::read_to_string(input_path)?
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    };

    let json_output = match args.mode {
        Mode::Blocks => serde_json::to_string_pretty(&parse_markdown_blocks(&file_content))?,
        Mode::Windows => {
            let delimiter_patterns_owned: Vec<String> = match args.delimiters {
                Some(d) => d,
                None => DEFAULT_MARKDOWN_DELIMITERS
                    .iter()
                    .map(|&s| s.to_string())
                    .collect(),
            };
            let delimiter_patterns_refs: Vec<&str> = delimiter_patterns_owned
                .iter()
                .map(|s| s.as_str())
                .collect();

            let estimator: Arc<dyn TokenEstimator> = match args.estimator {
                Estimator::Heuristic => Arc::new(HeuristicTokenEstimator::default()),
                Estimator::Words => Arc::new(WordCountEstimator),
            };
            let builder = TextWindowBuilder::new(
                &delimiter_patterns_refs,
                WindowConfig {
                    target_tokens: args.target_tokens,
                    overlap_fraction: args.overlap,
                },
                estimator,
            )?;

            let windows = builder.windows(&file_content);
            let output: Vec<WindowOutput> = windows
                .iter()
                .map(|w| WindowOutput {
                    index: w.index,
                    start: w.range.start,
                    end: w.range.end,
                    token_count: w.token_count,
                    text: &w.text,
                })
                .collect();
            serde_json::to_string_pretty(&output)?
        }
    };

    println!("{}", json_output);
    Ok(())
}

//! focus-ai-retriever: the retrieval core of a local document chat assistant
//!
//! Documents are submitted to a persistent priority queue, split into parent units and child
//! windows, embedded through whichever model currently serves the EMBEDDING capability, and stored
//! in a vector index. Chat turns assemble a token-budgeted context from pinned documents, vector
//! hits and recent history, and stream the reply back fragment by fragment.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: task queue, chunking pipeline, vector index, capability router, context
//!   assembler and the ingestion engine that ties them together
//! - **[`chat`]**: sessions and streamed replies
//! - **[`storage`]**: the relational schema and its row types
//! - **[`status`]**: statistics, health and consistency reports
//! - **[`config`]**: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use focus_ai_retriever::config::RetrieverConfig;
//! use focus_ai_retriever::retrieval::indexing_engine::IngestionEngine;
//! use focus_ai_retriever::retrieval::task_queue::TaskPriority;
//! use std::path::Path;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RetrieverConfig::default().with_data_dir(".focus");
//! let engine = IngestionEngine::open(config).await?;
//! engine.start();
//!
//! let task_id = engine.submit_file(Path::new("notes.md"), TaskPriority::Medium).await?;
//! println!("queued as task {task_id}");
//!
//! let chat = engine.chat();
//! let session = chat.create_session("notes").await?;
//! let reply = chat.send(session.id, "What do my notes say about setup?").await?;
//! println!("{}", reply.collect().await.text);
//!
//! engine.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! submit → TaskQueue → workers → Analyzer → Chunking → Router(EMBEDDING) → VectorIndex
//!                                                                              ↓
//! chat send → ContextAssembler (pinned, hits, history) → Router(TEXT_GEN) → ResponseStream
//! ```

pub mod chat;
pub mod config;
pub mod error;
pub mod retrieval;
pub mod status;
pub mod storage;

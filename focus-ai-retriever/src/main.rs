use clap::{Parser, Subcommand};
use focus_ai_models::{Capability, ResponseFragment, parse_capability_list};
use focus_ai_retriever::{
    config::{RetrieverConfig, load_config},
    retrieval::{
        indexing_engine::IngestionEngine,
        task_queue::{TaskPriority, TaskStatus},
        vector_index::VectorFilter,
    },
    status::StatusApi,
    storage::NewModelConfiguration,
};
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use std::process;
use tracing_subscriber::EnvFilter;

/// Queue documents for indexing, manage models and chat against the index.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; missing files mean defaults
    #[arg(short, long, default_value = "focus.toml")]
    config: PathBuf,

    /// Overrides `data_dir` from the configuration
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the databases in the data directory
    Init,
    /// Submit documents for ingestion
    Submit {
        paths: Vec<PathBuf>,
        /// LOW, MEDIUM or HIGH
        #[arg(short, long, default_value = "medium")]
        priority: TaskPriority,
        /// Content hash (64 hex characters) to record instead of hashing the file
        #[arg(long)]
        hash: Option<String>,
    },
    /// Run workers
    Work {
        /// Drain the queue once and exit instead of running until interrupted
        #[arg(long)]
        until_idle: bool,
    },
    /// Show comprehensive status information
    Status {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List tasks
    Tasks {
        #[arg(short, long)]
        status: Option<TaskStatus>,
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show one task
    Task { id: i64 },
    /// Request cancellation of a task
    Cancel { id: i64 },
    /// List documents
    Documents {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Delete a document and its vectors
    DeleteDoc { id: i64 },
    /// Pin a document to a chat session
    Pin { session: i64, document: i64 },
    /// Unpin a document from a chat session
    Unpin { session: i64, document: i64 },
    /// Create a chat session
    SessionNew {
        #[arg(default_value = "New chat")]
        title: String,
    },
    /// List chat sessions
    Sessions,
    /// Delete a chat session with its messages and pins
    SessionDelete { id: i64 },
    /// Send a message and stream the reply
    Chat { session: i64, message: String },
    /// Search the vector index with a text query
    Query {
        text: String,
        #[arg(short, long, default_value_t = 5)]
        k: usize,
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Register a model configuration
    ModelAdd {
        #[arg(long)]
        name: String,
        /// openai, ollama, lm_studio, openai_compatible, local_embed or hashing
        #[arg(long)]
        provider: String,
        #[arg(long)]
        model_id: String,
        /// Comma-separated, e.g. TEXT_GEN,VISION
        #[arg(long)]
        capabilities: String,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        dimension: Option<u32>,
        #[arg(long)]
        max_context_tokens: Option<u32>,
    },
    /// List model configurations and their health
    ModelList {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Enable or disable a model configuration
    ModelEnable {
        id: i64,
        #[arg(long)]
        disable: bool,
    },
    /// Remove a model configuration and drop it from every chain
    ModelDelete { id: i64 },
    /// Set the fallback chain of a capability
    ModelAssign {
        capability: Capability,
        /// Model configuration ids in fallback order
        #[arg(value_delimiter = ',')]
        models: Vec<i64>,
    },
    /// Probe a model and record the outcome in its health
    ModelTest { id: i64 },
    /// Repair drift between the relational rows and the vector store
    Reconcile,
    /// Report drift without repairing it
    Consistency {
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show database statistics
    Stats,
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct QueryHitOutput {
    chunk_id: String,
    document_id: i64,
    score: f32,
    text: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load(args: &Args) -> anyhow::Result<RetrieverConfig> {
    let mut config = load_config(&args.config)?;
    if let Some(data_dir) = &args.data_dir {
        config = config.with_data_dir(data_dir);
    }
    Ok(config)
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = load(&args)?;
    // A `work` process may own RUNNING tasks; only workers reclaim them
    config.engine.recover_on_open = matches!(args.command, Commands::Work { .. });
    let engine = IngestionEngine::open(config).await?;
    let result = execute(&engine, args.command).await;
    engine.close().await;
    result
}

async fn execute(engine: &IngestionEngine, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init => {
            println!(
                "Initialized databases in {}",
                engine.config().data_dir.display()
            );
        }
        Commands::Submit {
            paths,
            priority,
            hash,
        } => {
            if paths.is_empty() {
                anyhow::bail!("No paths given");
            }
            if let Some(hash) = &hash {
                let bytes =
                    hex::decode(hash).map_err(|_| anyhow::anyhow!("Invalid hex hash: {hash}"))?;
                if bytes.len() != 32 {
                    anyhow::bail!("Hash must be 32 bytes (64 hex characters)");
                }
            }
            for path in paths {
                let task_id = match &hash {
                    Some(hash) => {
                        engine
                            .submit_document_with_priority(&path, &hash.to_lowercase(), priority)
                            .await?
                    }
                    None => engine.submit_file(&path, priority).await?,
                };
                println!("Queued {} as task {task_id}", path.display());
            }
        }
        Commands::Work { until_idle } => {
            if until_idle {
                let processed = engine.run_until_idle().await?;
                println!("Processed {processed} task(s)");
            } else {
                engine.start();
                println!("Workers running; press Ctrl-C to stop");
                tokio::signal::ctrl_c().await?;
                println!("Stopping after in-flight tasks finish...");
                engine.shutdown().await;
            }
        }
        Commands::Status { format } => {
            let index_statistics = StatusApi::get_index_statistics(engine).await?;
            let ingestion_status = StatusApi::get_ingestion_status(engine).await?;
            let index_health = StatusApi::get_index_health(engine).await?;
            let models = StatusApi::get_model_status(engine).await?;
            let routes = StatusApi::get_capability_routes(engine).await?;

            match format {
                OutputFormat::Json => {
                    #[derive(Serialize)]
                    struct StatusOutput {
                        index_statistics: focus_ai_retriever::status::IndexStatistics,
                        ingestion_status: focus_ai_retriever::status::IngestionStatus,
                        index_health: focus_ai_retriever::status::IndexHealth,
                        models: Vec<focus_ai_retriever::status::ModelStatus>,
                        capability_routes: Vec<focus_ai_retriever::status::CapabilityRoute>,
                        versions: focus_ai_retriever::status::DependencyVersions,
                    }

                    print_json(&StatusOutput {
                        index_statistics,
                        ingestion_status,
                        index_health,
                        models,
                        capability_routes: routes,
                        versions: StatusApi::get_dependency_versions(),
                    })?;
                }
                OutputFormat::Summary => {
                    println!("Focus AI Retriever Status");
                    println!("=========================");

                    let docs = &index_statistics.documents;
                    println!("\nIndex Statistics:");
                    println!(
                        "  Documents: {} ({} vectorized, {} pending, {} processing, {} failed, {} being deleted)",
                        docs.documents,
                        docs.vectorized,
                        docs.pending,
                        docs.processing,
                        docs.failed,
                        docs.marked_deleted
                    );
                    println!(
                        "  Chunks: {} parent, {} child, {} embedded",
                        docs.parent_chunks, docs.child_chunks, docs.embedded_child_chunks
                    );
                    println!("  Vectors: {}", index_statistics.vector_count);
                    if let Some(dimension) = index_statistics.vector_dimension {
                        println!("  Dimension: {dimension}");
                    }
                    println!("  Sessions: {}", index_statistics.sessions_count);

                    let queue = &ingestion_status.queue;
                    println!("\nTask Queue:");
                    println!(
                        "  {} pending, {} running, {} done, {} failed, {} cancelled",
                        queue.pending, queue.running, queue.done, queue.failed, queue.cancelled
                    );

                    println!("\nHealth Status:");
                    println!("  Overall status: {:?}", index_health.overall_status);
                    println!(
                        "  Database integrity: {}",
                        if index_health.database_integrity_ok {
                            "OK"
                        } else {
                            "Issues found"
                        }
                    );
                    if let Some(ref error) = index_health.database_error {
                        println!("  Database error: {error}");
                    }
                    if let Some(ref error) = index_health.vector_store_error {
                        println!("  Vector store error: {error}");
                    }

                    println!("\nCapabilities:");
                    for route in routes {
                        match (route.resolved_model, route.error) {
                            (Some(id), _) => {
                                println!("  {}: model #{id} (chain {:?})", route.capability, route.chain)
                            }
                            (None, error) => println!(
                                "  {}: unavailable ({})",
                                route.capability,
                                error.unwrap_or_default()
                            ),
                        }
                    }

                    println!("\nModels:");
                    if models.is_empty() {
                        println!("  None configured");
                    }
                    for model in models {
                        println!(
                            "  #{} {} [{}:{}] {}{}",
                            model.id,
                            model.display_name,
                            model.provider,
                            model.model_id,
                            model.health,
                            if model.enabled { "" } else { " (disabled)" }
                        );
                    }
                }
            }
        }
        Commands::Tasks {
            status,
            limit,
            format,
        } => {
            let tasks = engine.queue().list(status, limit).await?;
            match format {
                OutputFormat::Json => print_json(&tasks)?,
                OutputFormat::Summary => {
                    println!("Found {} tasks:", tasks.len());
                    for task in tasks {
                        println!(
                            "  {} | {} | {} | attempts {}{}",
                            task.description(),
                            task.priority,
                            task.status,
                            task.attempt_count,
                            task.error_message
                                .map(|e| format!(" | {e}"))
                                .unwrap_or_default()
                        );
                    }
                }
            }
        }
        Commands::Task { id } => print_json(&StatusApi::get_task_status(engine, id).await?)?,
        Commands::Cancel { id } => {
            let status = engine.cancel(id).await?;
            println!("Task {id}: {status}");
        }
        Commands::Documents { format } => {
            let documents = engine.database().list_documents().await?;
            match format {
                OutputFormat::Json => print_json(&documents)?,
                OutputFormat::Summary => {
                    println!("Found {} documents:", documents.len());
                    for doc in documents {
                        println!(
                            "  ID: {} | {} | {}{}",
                            doc.id,
                            doc.status,
                            doc.source_path,
                            if doc.is_deleted() { " (deleting)" } else { "" }
                        );
                    }
                }
            }
        }
        Commands::DeleteDoc { id } => {
            let task_id = engine.delete_document(id).await?;
            println!("Document {id} hidden; purge queued as task {task_id}");
        }
        Commands::Pin { session, document } => {
            let outcome = engine.pin(session, document).await?;
            if !outcome.newly_pinned {
                println!("Document {document} was already pinned to session {session}");
            } else {
                println!("Pinned document {document} to session {session}");
            }
            if let Some(task_id) = outcome.ingest_task_id {
                println!("Document not indexed yet; queued HIGH ingest as task {task_id}");
            }
        }
        Commands::Unpin { session, document } => {
            if engine.unpin(session, document).await? {
                println!("Unpinned document {document} from session {session}");
            } else {
                println!("Document {document} was not pinned to session {session}");
            }
        }
        Commands::SessionNew { title } => {
            let session = engine.chat().create_session(&title).await?;
            println!("Created session {} ({})", session.id, session.title);
        }
        Commands::Sessions => {
            for session in engine.chat().list_sessions().await? {
                println!("  {} | {}", session.id, session.title);
            }
        }
        Commands::SessionDelete { id } => {
            if engine.chat().delete_session(id).await? {
                println!("Deleted session {id}");
            } else {
                anyhow::bail!("Session {id} not found");
            }
        }
        Commands::Chat { session, message } => {
            let mut stream = engine.chat().send(session, &message).await?;
            let mut stdout = std::io::stdout();
            while let Some(fragment) = stream.next().await {
                match fragment {
                    ResponseFragment::Text(text) => {
                        write!(stdout, "{text}")?;
                        stdout.flush()?;
                    }
                    ResponseFragment::End { .. } => println!(),
                    ResponseFragment::Error(message) => {
                        println!();
                        anyhow::bail!("Generation failed: {message}");
                    }
                }
            }
        }
        Commands::Query { text, k, format } => {
            let hits = engine
                .vectors()
                .query_text(&text, k, &VectorFilter::default())
                .await?;
            let hits: Vec<QueryHitOutput> = hits
                .into_iter()
                .map(|hit| QueryHitOutput {
                    chunk_id: hit.chunk.id,
                    document_id: hit.chunk.document_id,
                    score: hit.score,
                    text: hit.chunk.text,
                })
                .collect();
            match format {
                OutputFormat::Json => print_json(&hits)?,
                OutputFormat::Summary => {
                    println!("Found {} similar chunks:", hits.len());
                    for hit in hits {
                        println!(
                            "  Score: {:.3} | Document: {} | {}",
                            hit.score,
                            hit.document_id,
                            hit.text.chars().take(100).collect::<String>()
                        );
                    }
                }
            }
        }
        Commands::ModelAdd {
            name,
            provider,
            model_id,
            capabilities,
            base_url,
            api_key,
            dimension,
            max_context_tokens,
        } => {
            let capabilities =
                parse_capability_list(&capabilities).map_err(anyhow::Error::msg)?;
            let model = engine
                .database()
                .add_model_configuration(&NewModelConfiguration {
                    display_name: name,
                    provider,
                    model_id,
                    capabilities,
                    base_url,
                    api_key,
                    max_context_tokens,
                    dimension,
                })
                .await?;
            println!("Registered model #{} ({})", model.id, model.display_name);
        }
        Commands::ModelList { format } => {
            let models = StatusApi::get_model_status(engine).await?;
            match format {
                OutputFormat::Json => print_json(&models)?,
                OutputFormat::Summary => {
                    for model in models {
                        let capabilities: Vec<&str> =
                            model.capabilities.iter().map(|c| c.as_str()).collect();
                        println!(
                            "  #{} {} [{}:{}] {} | {} | failures {}",
                            model.id,
                            model.display_name,
                            model.provider,
                            model.model_id,
                            capabilities.join(","),
                            model.health,
                            model.consecutive_failures
                        );
                    }
                }
            }
        }
        Commands::ModelEnable { id, disable } => {
            engine.database().set_model_enabled(id, !disable).await?;
            engine.router().clear_clients();
            println!(
                "Model #{id} {}",
                if disable { "disabled" } else { "enabled" }
            );
        }
        Commands::ModelDelete { id } => {
            if engine.database().delete_model_configuration(id).await? {
                println!("Deleted model #{id}");
            } else {
                anyhow::bail!("Model #{id} not found");
            }
        }
        Commands::ModelAssign { capability, models } => {
            engine.database().assign_capability(capability, &models).await?;
            println!("{capability} now routes to {models:?}");
        }
        Commands::ModelTest { id } => {
            let outcome = engine.router().probe(id).await?;
            match (&outcome.report, &outcome.error) {
                (Some(report), _) => println!(
                    "#{} {} is reachable ({} ms): {}",
                    id, outcome.display_name, report.latency_ms, report.detail
                ),
                (None, error) => println!(
                    "#{} {} failed: {}",
                    id,
                    outcome.display_name,
                    error.as_deref().unwrap_or("unknown error")
                ),
            }
            println!("Health is now {}", outcome.health);
        }
        Commands::Reconcile => {
            let report = engine.reconcile_now().await?;
            if report.is_clean() {
                println!("Index is consistent");
            } else {
                for issue in &report.issues {
                    println!("  {issue}");
                }
                if !report.documents_to_reembed.is_empty() {
                    println!(
                        "Queued re-embedding for documents {:?}; run `work --until-idle` to process",
                        report.documents_to_reembed
                    );
                }
            }
        }
        Commands::Consistency { format } => {
            let report = StatusApi::validate_index_consistency(engine).await?;
            match format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Summary => {
                    println!("Overall: {:?}", report.overall_status);
                    for check in &report.checks_performed {
                        println!(
                            "  {:?} {} ({} checked, {} issue(s))",
                            check.status, check.check_name, check.items_checked, check.issues_found
                        );
                        for detail in check.issue_details.iter().take(10) {
                            println!("    {detail}");
                        }
                    }
                    for recommendation in &report.issues_summary.recommendations {
                        println!("Recommendation: {recommendation}");
                    }
                }
            }
        }
        Commands::Stats => {
            let info = StatusApi::get_database_info(engine.database()).await?;
            let stats = engine.stats().await;
            println!("Database Statistics:");
            if let Some(version) = &info.database_version {
                println!("  SQLite version: {version}");
            }
            for file in &info.database_files {
                println!(
                    "  {} ({}): {} bytes",
                    file.path,
                    file.file_type,
                    file.size_bytes.unwrap_or(0)
                );
            }
            println!(
                "  Connections: {} open, {} idle",
                info.connection_pool_status.total_connections,
                info.connection_pool_status.idle_connections
            );
            println!("Session Counters:");
            println!("  Tasks completed: {}", stats.tasks_completed);
            println!("  Tasks failed: {}", stats.tasks_failed);
            println!("  Vectors written: {}", stats.vectors_written);
        }
    }
    Ok(())
}

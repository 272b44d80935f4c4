//! Chunkwise CLI: segment documents and inspect checkpoints.
//!
//! Usage:
//!   chunkwise segment <file> [--session id] [--json] [--db path] [--config path]
//!   chunkwise poll <session> [--db path]
//!   chunkwise checkpoint <list|history|delete> [--db path]

use chunkwise::embedding::Embedder;
use chunkwise::{
    CheckpointStore, DocumentRef, EngineConfig, RunConfig, SqliteCheckpointStore, StageController,
    StageRegistry,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chunkwise",
    version,
    about = "Chunk-oriented document analysis engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to a YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Path to the SQLite checkpoint database (overrides the config)
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment a document into chunks and checkpoint the result
    Segment {
        /// Document to segment
        file: PathBuf,
        /// Session id (generated when omitted)
        #[arg(long)]
        session: Option<String>,
        /// Print the chunk list as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the latest checkpointed progress of a session
    Poll {
        session: String,
    },
    /// Manage checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// List sessions, most recent first
    List,
    /// Show every kept checkpoint of a session
    History {
        session: String,
    },
    /// Delete every checkpoint of a session
    Delete {
        session: String,
    },
}

fn init_tracing(verbose: u8, quiet: bool) {
    let default_filter = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "chunkwise=debug,info",
        (false, _) => "chunkwise=trace,debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<PathBuf>, db: Option<PathBuf>) -> Result<EngineConfig, String> {
    let mut config = match path {
        Some(path) => EngineConfig::from_file(&path)
            .map_err(|e| format!("Failed to load config '{}': {}", path.display(), e))?,
        None => EngineConfig::default(),
    };
    if db.is_some() {
        config.checkpoint.path = db;
    }
    Ok(config)
}

fn open_store(config: &EngineConfig) -> Result<SqliteCheckpointStore, String> {
    config
        .open_store()
        .map_err(|e| format!("Failed to open checkpoint database: {}", e))
}

#[cfg(feature = "embeddings")]
fn embedder(config: &EngineConfig) -> Result<Option<Arc<dyn Embedder>>, String> {
    if config.segmentation.fallback != chunkwise::FallbackKind::Embedding {
        return Ok(None);
    }
    let embedder = chunkwise::embedding::FastEmbedEmbedder::default_model()
        .map_err(|e| format!("Failed to load embedding model: {}", e))?;
    Ok(Some(Arc::new(embedder)))
}

#[cfg(not(feature = "embeddings"))]
fn embedder(_config: &EngineConfig) -> Result<Option<Arc<dyn Embedder>>, String> {
    Ok(None)
}

fn cmd_segment(config: &EngineConfig, file: &PathBuf, session: Option<String>, json: bool) -> i32 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("Error: cannot read '{}': {}", file.display(), e);
            return 1;
        }
    };
    let segmenter = match embedder(config).and_then(|embedder| {
        config
            .build_segmenter(embedder)
            .map_err(|e| format!("Failed to build segmenter: {}", e))
    }) {
        Ok(segmenter) => segmenter,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let store = match open_store(config) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: cannot start runtime: {}", e);
            return 1;
        }
    };

    let controller = StageController::new(
        StageRegistry::new(),
        config.executor.clone(),
        Arc::new(store),
        segmenter,
    );
    let run_config = session.map(RunConfig::for_session).unwrap_or_default();
    let name = file.display().to_string();
    let report = match runtime.block_on(controller.analyze(
        DocumentRef::new(name, text),
        Vec::new(),
        run_config,
    )) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    if json {
        match serde_json::to_string_pretty(&report.state.chunks) {
            Ok(out) => println!("{}", out),
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    } else {
        println!("{:>6}  {:>5}  CONTENT", "CHUNK", "PARA");
        for chunk in &report.state.chunks {
            println!(
                "{:>6}  {:>5}  {}",
                chunk.chunk_index, chunk.paragraph_index, chunk.content
            );
        }
    }
    eprintln!(
        "Segmented into {} chunks (session {})",
        report.state.chunks.len(),
        report.state.session_id()
    );
    0
}

fn cmd_poll(store: &dyn CheckpointStore, session: &str) -> i32 {
    match store.load(session) {
        Ok(Some(state)) => {
            let progress = chunkwise::Progress::from_state(&state);
            match serde_json::to_string_pretty(&progress) {
                Ok(out) => {
                    println!("{}", out);
                    0
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    1
                }
            }
        }
        Ok(None) => {
            eprintln!("Error: session '{}' not found", session);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_checkpoint_list(store: &dyn CheckpointStore) -> i32 {
    let sessions = match store.list_sessions() {
        Ok(sessions) => sessions,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };
    if sessions.is_empty() {
        println!("No checkpoints stored.");
        return 0;
    }
    println!("{:<36}  {:>6}  {:>6}", "SESSION", "CHUNKS", "ERRORS");
    println!("{}", "-".repeat(52));
    for session in sessions {
        match store.history(&session) {
            Ok(history) => {
                if let Some(latest) = history.last() {
                    println!(
                        "{:<36}  {:>6}  {:>6}",
                        session, latest.chunk_count, latest.error_count
                    );
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        }
    }
    0
}

fn cmd_checkpoint_history(store: &dyn CheckpointStore, session: &str) -> i32 {
    match store.history(session) {
        Ok(history) if history.is_empty() => {
            eprintln!("Error: session '{}' not found", session);
            1
        }
        Ok(history) => {
            println!("{:>5}  {:<32}  {:>6}  {:>6}", "SEQ", "CREATED", "CHUNKS", "ERRORS");
            for meta in history {
                println!(
                    "{:>5}  {:<32}  {:>6}  {:>6}",
                    meta.seq,
                    meta.created_at.to_rfc3339(),
                    meta.chunk_count,
                    meta.error_count
                );
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn cmd_checkpoint_delete(store: &dyn CheckpointStore, session: &str) -> i32 {
    match store.delete_session(session) {
        Ok(true) => {
            println!("Deleted checkpoints of session '{}'", session);
            0
        }
        Ok(false) => {
            eprintln!("Error: session '{}' not found", session);
            1
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let config = match load_config(cli.config, cli.db) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let code = match cli.command {
        Commands::Segment { file, session, json } => cmd_segment(&config, &file, session, json),
        Commands::Poll { session } => match open_store(&config) {
            Ok(store) => cmd_poll(&store, &session),
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
        Commands::Checkpoint { action } => match open_store(&config) {
            Ok(store) => match action {
                CheckpointAction::List => cmd_checkpoint_list(&store),
                CheckpointAction::History { session } => cmd_checkpoint_history(&store, &session),
                CheckpointAction::Delete { session } => cmd_checkpoint_delete(&store, &session),
            },
            Err(e) => {
                eprintln!("Error: {}", e);
                1
            }
        },
    };
    std::process::exit(code);
}

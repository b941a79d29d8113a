use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use memvault::config::{self, AppConfig};
use memvault::embedding_client::EmbeddingClient;
use memvault::indexer::Indexer;
use memvault::retriever::Retriever;
use memvault::store::Store;

/// Local semantic memory engine: indexes a plain-text corpus and serves
/// vector-similarity search over it.
#[derive(Parser)]
#[command(name = "memvault")]
struct Cli {
    /// Directory holding the SQLite store and vector index snapshot.
    #[arg(long, global = true)]
    data_dir: Option<String>,

    /// Base URL of the embedding service.
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Embedding model name passed to the embedding service.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Raise log verbosity to debug.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a directory of files into the store and rebuild the vector index.
    Index {
        dir: PathBuf,
        /// File extensions to index, e.g. --ext md --ext txt.
        #[arg(long = "ext")]
        ext: Vec<String>,
        /// Re-index every matching file regardless of mtime.
        #[arg(long)]
        force: bool,
    },
    /// Search the indexed corpus.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        top: usize,
        #[arg(long)]
        json: bool,
    },
    /// Print store statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool, log_dir: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    std::fs::create_dir_all(log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(log_dir, "memvault.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("memvault={default_level}").into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false)
        .with_writer(non_blocking_writer)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        error!(target: "memvault::panic", location = %location, payload = %payload, "PANIC: thread panicked");
        default_panic(info);
    }));

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::from_env();
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(base_url) = &cli.base_url {
        config.embedding_base_url = base_url.clone();
    }
    if let Some(model) = &cli.model {
        config.embedding_model = model.clone();
    }

    let log_dir = std::path::PathBuf::from(&config.data_dir).join("logs");
    let _guard = init_logging(cli.verbose, &log_dir);

    info!(data_dir = %config.data_dir, "memvault starting");

    let store = Store::get_or_create(&config.store_path())?;
    let embedder = EmbeddingClient::new(
        config.embedding_base_url.clone(),
        config.embedding_model.clone(),
        config.embed_timeout_secs,
    );

    let exit_code = match cli.command {
        Commands::Index { dir, ext, force } => run_index(&store, &embedder, &config, &dir, ext, force).await,
        Commands::Search { query, top, json } => run_search(&store, &embedder, &config, &query, top, json).await,
        Commands::Stats { json } => run_stats(&store, json),
    };

    std::process::exit(exit_code);
}

async fn run_index(
    store: &Store,
    embedder: &EmbeddingClient,
    config: &AppConfig,
    dir: &std::path::Path,
    ext: Vec<String>,
    force: bool,
) -> i32 {
    if !dir.is_dir() {
        error!(dir = %dir.display(), "directory does not exist");
        eprintln!("error: directory does not exist: {}", dir.display());
        return 1;
    }

    let extensions = if ext.is_empty() {
        config::DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect()
    } else {
        ext
    };

    let indexer = Indexer::new(store, embedder, config);
    match indexer.index_directory(dir, &extensions, force).await {
        Ok(report) => {
            info!(?report, "indexing complete");
            println!(
                "scanned {} file(s); reindexed {}; purged {}; wrote {} chunk(s); skipped {}; vector index rebuilt: {}",
                report.files_scanned,
                report.files_reindexed,
                report.files_purged,
                report.chunks_written,
                report.chunks_skipped,
                report.rebuilt_vector_index
            );
            0
        }
        Err(e) => {
            error!(error = %e, "indexing failed");
            eprintln!("error: {e}");
            1
        }
    }
}

async fn run_search(
    store: &Store,
    embedder: &EmbeddingClient,
    config: &AppConfig,
    query: &str,
    top: usize,
    json: bool,
) -> i32 {
    let retriever = Retriever::new(store, embedder, config);
    match retriever.search(query, top).await {
        Ok(results) => {
            if json {
                let payload: Vec<_> = results
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "file": r.source_path,
                            "line": r.chunk_index,
                            "score": r.similarity,
                            "text": r.content,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "[]".to_string()));
            } else if results.is_empty() {
                println!("no results");
            } else {
                for r in &results {
                    println!("{} (chunk {}, score {:.4})", r.source_path, r.chunk_index, r.similarity);
                    println!("  {}", r.content);
                }
            }
            0
        }
        Err(e) => {
            error!(error = %e, "search failed");
            eprintln!("error: {e}");
            1
        }
    }
}

fn run_stats(store: &Store, json: bool) -> i32 {
    match store.get_stats() {
        Ok(stats) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&stats).unwrap_or_else(|_| "{}".to_string()));
            } else {
                println!("total_chunks: {}", stats.total_chunks);
                println!("total_files: {}", stats.total_files);
            }
            0
        }
        Err(e) => {
            error!(error = %e, "failed to read stats");
            eprintln!("error: {e}");
            1
        }
    }
}

//! CLI commands.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;

use crate::config::Settings;
use crate::ocr::TesseractFallback;
use crate::pipeline::{EngineConfig, PipelineEngine};
use crate::preprocess::Preprocessor;
use crate::progress::ProgressBus;
use crate::raster::PdftoppmRasterizer;
use crate::rate_limit::RateLimiter;
use crate::repository::{DocumentRepository, JobQueue};
use crate::schemas::SchemaRegistry;
use crate::server;
use crate::storage::BlobStore;
use crate::vision::{HttpVisionExtractor, VisionConfig};
use crate::worker::{WorkerPool, WorkerPoolConfig};

#[derive(Parser)]
#[command(name = "docloom")]
#[command(about = "Vision-model document extraction and spreadsheet export service")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API server
    Serve {
        /// Bind address, overriding BIND_ADDR
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run the processing worker pool
    Worker {
        /// Parallel workers, overriding WORKER_CONCURRENCY
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Create or upgrade the database schema
    Migrate,

    /// List the built-in extraction schemas
    Schemas,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_env()?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                settings.bind_addr = bind;
            }
            server::serve(&settings).await
        }
        Commands::Worker { concurrency } => {
            if let Some(concurrency) = concurrency {
                settings.worker_concurrency = concurrency;
            }
            run_worker(&settings).await
        }
        Commands::Migrate => {
            std::fs::create_dir_all(&settings.data_dir)?;
            let db_path = settings.db_path();
            DocumentRepository::new(&db_path)?;
            JobQueue::new(&db_path)?;
            println!("database ready at {}", db_path.display());
            Ok(())
        }
        Commands::Schemas => {
            let registry = SchemaRegistry::new();
            for schema in registry.list() {
                println!("{:<10} {} fields  {}", schema.name, schema.fields.len(), schema.description);
            }
            Ok(())
        }
    }
}

async fn run_worker(settings: &Settings) -> anyhow::Result<()> {
    std::fs::create_dir_all(&settings.data_dir)?;
    let db_path = settings.db_path();
    let repo = Arc::new(DocumentRepository::new(&db_path)?);
    let queue = Arc::new(JobQueue::new(&db_path)?);
    let blobs = Arc::new(BlobStore::new(settings.blobs_dir()));
    let bus = ProgressBus::new();

    let vision = Arc::new(HttpVisionExtractor::new(VisionConfig {
        api_url: settings.vision_api_url.clone(),
        api_key: settings.vision_api_key.clone(),
        model: settings.vision_model.clone(),
        timeout: settings.page_timeout,
    }));

    let engine = Arc::new(PipelineEngine::new(
        Arc::clone(&repo),
        Arc::clone(&queue),
        blobs,
        Arc::new(PdftoppmRasterizer::new()),
        Preprocessor::new(),
        vision,
        Arc::new(TesseractFallback::new()),
        Arc::new(SchemaRegistry::new()),
        Arc::new(RateLimiter::per_minute(settings.rate_limit_per_minute)),
        bus.clone(),
        EngineConfig {
            max_pages: settings.max_pages,
            page_timeout: settings.page_timeout,
            model_name: settings.vision_model.clone(),
            ..EngineConfig::default()
        },
    ));

    let pool = Arc::new(WorkerPool::new(
        engine,
        repo,
        queue,
        bus,
        WorkerPoolConfig {
            concurrency: settings.worker_concurrency,
            document_timeout: settings.processing_timeout,
            ..WorkerPoolConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, finishing in-flight work");
        let _ = shutdown_tx.send(true);
        // A second ctrl-c aborts without waiting.
        let _ = tokio::signal::ctrl_c().await;
        tracing::warn!("forced shutdown");
        std::process::exit(130);
    });

    tracing::info!(
        concurrency = settings.worker_concurrency,
        "worker pool starting"
    );
    pool.run(shutdown_rx).await;

    // Give any final progress events a moment to flush.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}

//! Configuration from environment variables.
//!
//! All knobs are plain environment variables (loaded from `.env` when
//! present). `Settings::from_env` applies defaults so a bare invocation
//! works against a local data directory.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};

/// Default upload ceiling: 100 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 104_857_600;

/// Default page ceiling per document.
pub const DEFAULT_MAX_PAGES: u32 = 100;

/// Blob storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobBackend {
    Local,
    S3,
}

impl BlobBackend {
    fn parse(s: &str) -> anyhow::Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => bail!("unknown BLOB_BACKEND '{other}' (expected 'local' or 's3')"),
        }
    }
}

/// Runtime settings shared by the API server and the worker pool.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root data directory; holds the database and blob store.
    pub data_dir: PathBuf,
    /// Address the API server binds to.
    pub bind_addr: String,
    /// Upload size ceiling in bytes.
    pub max_upload_bytes: u64,
    /// Reject documents with more pages than this.
    pub max_pages: u32,
    /// Vision model identifier sent with every extraction request.
    pub vision_model: String,
    /// Vision API endpoint (chat-completions style).
    pub vision_api_url: String,
    /// Vision API credential.
    pub vision_api_key: String,
    /// Parallel workers per worker process.
    pub worker_concurrency: usize,
    /// Wall-clock ceiling for one document.
    pub processing_timeout: Duration,
    /// Per-model-call timeout for one page.
    pub page_timeout: Duration,
    /// Vision requests per minute across the worker pool.
    pub rate_limit_per_minute: u32,
    /// Blob storage backend.
    pub blob_backend: BlobBackend,
}

impl Settings {
    /// Load settings from the environment, applying defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = env_or("DATA_DIR", "./data");
        let settings = Self {
            data_dir: PathBuf::from(data_dir),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES)?,
            max_pages: env_parse("MAX_PAGES_PER_DOCUMENT", DEFAULT_MAX_PAGES)?,
            vision_model: env_or("VISION_MODEL_NAME", "gpt-4o-mini"),
            vision_api_url: env_or("VISION_API_URL", "https://api.openai.com/v1/chat/completions"),
            vision_api_key: env_or("VISION_API_KEY", ""),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", 2usize)?,
            processing_timeout: Duration::from_secs(env_parse(
                "PROCESSING_TIMEOUT_SECONDS",
                3600u64,
            )?),
            page_timeout: Duration::from_secs(env_parse("PAGE_TIMEOUT_SECONDS", 120u64)?),
            rate_limit_per_minute: env_parse("RATE_LIMIT_PER_MINUTE", 20u32)?,
            blob_backend: BlobBackend::parse(&env_or("BLOB_BACKEND", "local"))?,
        };

        if settings.blob_backend == BlobBackend::S3 {
            bail!("BLOB_BACKEND=s3 is recognized but not implemented; use 'local'");
        }

        Ok(settings)
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("docloom.db")
    }

    /// Root of the blob store.
    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

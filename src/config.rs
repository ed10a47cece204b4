use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, time::Duration};

use crate::{
    constants::{
        DEFAULT_CONCURRENCY, FINISHED_RETENTION, LISTING_CACHE_MAX_ENTRIES,
        LISTING_CACHE_STALE_AFTER, ORPHAN_GRACE, SPEED_EMIT_INTERVAL, SPEED_WINDOW,
    },
    services::retry::RetryPolicy,
};

/// Tuning knobs of the transfer engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of transfers running at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Unknown multipart sessions younger than this are left alone.
    pub orphan_grace: Duration,
    /// Completed and cancelled records older than this are pruned.
    pub finished_retention: Duration,
    pub speed_window: Duration,
    pub speed_emit_interval: Duration,
    /// Fixed seed for retry jitter; random when unset.
    pub jitter_seed: Option<u64>,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            orphan_grace: ORPHAN_GRACE,
            finished_retention: FINISHED_RETENTION,
            speed_window: SPEED_WINDOW,
            speed_emit_interval: SPEED_EMIT_INTERVAL,
            jitter_seed: None,
            event_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Bounds of the listing cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub stale_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: LISTING_CACHE_MAX_ENTRIES,
            stale_after: LISTING_CACHE_STALE_AFTER,
        }
    }
}

/// Centralized command-line configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub store_dir: PathBuf,
    pub bucket: String,
    pub concurrency: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable object store transfers")]
pub struct Args {
    /// Transfer database URL (overrides OBJECT_TRANSFER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Root directory of the local object store (overrides OBJECT_TRANSFER_STORE_DIR)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,

    /// Bucket name (overrides OBJECT_TRANSFER_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Parallel transfers (overrides OBJECT_TRANSFER_CONCURRENCY)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Create the database schema and exit
    #[arg(long)]
    pub migrate: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upload a local file to a key
    Upload { local: PathBuf, key: String },
    /// Download a key to a local file
    Download { key: String, local: PathBuf },
    /// Resume transfers left over from a previous run
    Resume,
    /// Show recorded transfers
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List a prefix
    Ls {
        #[arg(default_value = "")]
        prefix: String,
    },
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig, the migrate
    /// flag and the requested command.
    pub fn from_env_and_args() -> Result<(Self, bool, Option<Command>)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_db = env::var("OBJECT_TRANSFER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/transfers.db".into());
        let env_store =
            env::var("OBJECT_TRANSFER_STORE_DIR").unwrap_or_else(|_| "./data/store".into());
        let env_bucket = env::var("OBJECT_TRANSFER_BUCKET").unwrap_or_else(|_| "default".into());
        let env_concurrency = match env::var("OBJECT_TRANSFER_CONCURRENCY") {
            Ok(value) => value
                .parse::<usize>()
                .with_context(|| format!("parsing OBJECT_TRANSFER_CONCURRENCY value `{}`", value))?,
            Err(env::VarError::NotPresent) => DEFAULT_CONCURRENCY,
            Err(err) => return Err(err).context("reading OBJECT_TRANSFER_CONCURRENCY"),
        };

        // --- Merge ---
        let cfg = Self {
            database_url: args.database_url.unwrap_or(env_db),
            store_dir: args.store_dir.unwrap_or_else(|| PathBuf::from(env_store)),
            bucket: args.bucket.unwrap_or(env_bucket),
            concurrency: args.concurrency.unwrap_or(env_concurrency).max(1),
        };

        Ok((cfg, args.migrate, args.command))
    }

    /// Directory of the configured bucket inside the store root.
    pub fn bucket_dir(&self) -> PathBuf {
        self.store_dir.join(&self.bucket)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default().with_concurrency(self.concurrency)
    }
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::cache::CacheKey;

/// Command-line arguments for the postcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "postcache",
    version,
    about = "Local post cache with freshness tracking and background sync"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "POSTCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run one background sync pass, retrying with backoff.
    Sync(SyncArgs),
    /// Sync periodically until interrupted.
    Daemon(SyncArgs),
    /// Read a cache key, refreshing it as its freshness requires, and print it as JSON.
    Get(KeyArgs),
    /// Mark a cache key expired.
    Invalidate(KeyArgs),
    /// Print row counts and the last clear time.
    Stats,
    /// Remove every cached row and all metadata.
    Clear,
}

#[derive(Debug, Args, Clone)]
pub struct KeyArgs {
    /// Cache key, e.g. `all_posts`, `categories` or `post_detail_42`.
    #[arg(value_name = "KEY")]
    pub key: CacheKey,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SyncArgs {
    /// Override the sync interval.
    #[arg(long = "sync-interval-seconds", value_name = "SECONDS")]
    pub interval_seconds: Option<u64>,

    /// Override the base retry delay; attempt `n` waits `n` times this long.
    #[arg(long = "sync-backoff-seconds", value_name = "SECONDS")]
    pub backoff_base_seconds: Option<u64>,

    /// Override the number of attempts per run.
    #[arg(long = "sync-max-attempts", value_name = "COUNT")]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the SQLite database URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Override the blog API base URL.
    #[arg(long = "api-base-url", value_name = "URL", global = true)]
    pub api_base_url: Option<String>,
}

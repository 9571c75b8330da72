//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{CliArgs, Command, GlobalOverrides, KeyArgs, SyncArgs};

use std::{num::NonZeroU32, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, FreshnessPolicy, KeyClass, SyncConfig};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "postcache";
const DEFAULT_DATABASE_URL: &str = "sqlite://postcache.db";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
const DEFAULT_API_TIMEOUT_SECS: u64 = 15;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub api: ApiSettings,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: String,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    /// Unset until configured; commands that reach the network require it.
    pub base_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("POSTCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Sync(args) | Command::Daemon(args)) = cli.command.as_ref() {
        raw.apply_sync_overrides(args);
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    api: RawApiSettings,
    cache: RawCacheSettings,
    sync: RawSyncSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(url) = overrides.api_base_url.as_ref() {
            self.api.base_url = Some(url.clone());
        }
    }

    fn apply_sync_overrides(&mut self, overrides: &SyncArgs) {
        if let Some(seconds) = overrides.interval_seconds {
            self.sync.interval_seconds = Some(seconds);
        }
        if let Some(seconds) = overrides.backoff_base_seconds {
            self.sync.backoff_base_seconds = Some(seconds);
        }
        if let Some(attempts) = overrides.max_attempts {
            self.sync.max_attempts = Some(attempts);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            api,
            cache,
            sync,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            api: build_api_settings(api)?,
            cache: build_cache_config(cache)?,
            sync: build_sync_config(sync)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = non_empty(database.url).unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());
    if !url.starts_with("sqlite:") {
        return Err(LoadError::invalid(
            "database.url",
            format!("expected a sqlite: URL, got `{url}`"),
        ));
    }

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_api_settings(api: RawApiSettings) -> Result<ApiSettings, LoadError> {
    let base_url = non_empty(api.base_url);
    if let Some(url) = base_url.as_deref() {
        url::Url::parse(url)
            .map_err(|err| LoadError::invalid("api.base_url", format!("{err}: `{url}`")))?;
    }

    let timeout = non_zero_seconds(
        api.timeout_seconds.unwrap_or(DEFAULT_API_TIMEOUT_SECS),
        "api.timeout_seconds",
    )?;

    Ok(ApiSettings { base_url, timeout })
}

fn build_cache_config(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();
    let mut config = CacheConfig {
        max_cached_posts: cache.max_cached_posts.unwrap_or(defaults.max_cached_posts),
        max_cached_comments_per_post: cache
            .max_cached_comments_per_post
            .unwrap_or(defaults.max_cached_comments_per_post),
        retention_window: cache
            .retention_window_seconds
            .map(Duration::from_secs)
            .unwrap_or(defaults.retention_window),
        ..defaults
    };

    let RawPolicies {
        posts,
        categories,
        post_detail,
        author_posts,
        category_posts,
    } = cache.policies;
    for (class, raw) in [
        (KeyClass::Posts, posts),
        (KeyClass::Categories, categories),
        (KeyClass::PostDetail, post_detail),
        (KeyClass::AuthorPosts, author_posts),
        (KeyClass::CategoryPosts, category_posts),
    ] {
        let current = config.policy(class);
        config.policies.set(
            class,
            FreshnessPolicy::new(
                raw.stale_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(current.stale_threshold),
                raw.expiry_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(current.expiry),
            ),
        );
    }

    config
        .validate()
        .map_err(|err| LoadError::invalid("cache", err.to_string()))?;
    Ok(config)
}

fn build_sync_config(sync: RawSyncSettings) -> Result<SyncConfig, LoadError> {
    let defaults = SyncConfig::default();

    let interval = match sync.interval_seconds {
        Some(seconds) => non_zero_seconds(seconds, "sync.interval_seconds")?,
        None => defaults.interval,
    };
    let backoff_base = sync
        .backoff_base_seconds
        .map(Duration::from_secs)
        .unwrap_or(defaults.backoff_base);
    let max_attempts = sync.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(LoadError::invalid(
            "sync.max_attempts",
            "must be greater than zero",
        ));
    }

    Ok(SyncConfig {
        interval,
        backoff_base,
        max_attempts,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawApiSettings {
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    max_cached_posts: Option<usize>,
    max_cached_comments_per_post: Option<usize>,
    retention_window_seconds: Option<u64>,
    policies: RawPolicies,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPolicies {
    posts: RawPolicy,
    categories: RawPolicy,
    post_detail: RawPolicy,
    author_posts: RawPolicy,
    category_posts: RawPolicy,
}

#[derive(Debug, Clone, Copy, Deserialize, Default)]
#[serde(default)]
struct RawPolicy {
    stale_seconds: Option<u64>,
    expiry_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSyncSettings {
    interval_seconds: Option<u64>,
    backoff_base_seconds: Option<u64>,
    max_attempts: Option<u32>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn non_zero_seconds(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

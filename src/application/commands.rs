//! Command handlers behind the `postcache` binary. Each returns the JSON
//! document the binary prints on stdout.

use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{
    application::{context::CacheContext, error::AppError},
    cache::{CacheKey, SyncOutcome},
    infra::error::InfraError,
};

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::unexpected(format!("failed to serialize output: {err}")))
}

/// One sync run with retry. A run that exhausts its attempts is an error.
pub async fn sync(ctx: &CacheContext) -> Result<Value, AppError> {
    let report = ctx.sync.run_with_retry().await;
    if report.outcome == SyncOutcome::Failed {
        let attempts = report.attempts;
        return Err(match report.error {
            Some(source) => AppError::Sync { attempts, source },
            None => AppError::unexpected(format!("sync failed after {attempts} attempt(s)")),
        });
    }
    to_json(&report)
}

/// Periodic sync until ctrl-c. Cache events are logged at debug level.
pub async fn daemon(ctx: &CacheContext) -> Result<Value, AppError> {
    info!(
        target = "postcache::daemon",
        interval_secs = ctx.sync.config().interval.as_secs(),
        "starting sync daemon"
    );

    let mut events = ctx.manager.events().subscribe();
    let event_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => debug!(
                    target = "postcache::daemon",
                    epoch = event.epoch,
                    event = ?event.kind,
                    "cache event"
                ),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(target = "postcache::daemon", skipped, "event log lagged")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
    let sync_handle = ctx.sync.spawn();

    let result = tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::from(InfraError::Signal(err)));

    sync_handle.abort();
    let _ = sync_handle.await;
    event_handle.abort();
    let _ = event_handle.await;

    result?;
    info!(target = "postcache::daemon", "sync daemon stopped");
    ctx.manager
        .get_cache_stats()
        .await
        .map_err(AppError::from)
        .and_then(|stats| to_json(&stats))
}

/// Read `key` through the freshness policy. Fallback reads carry the
/// refresh error alongside the rows.
pub async fn get(ctx: &CacheContext, key: &CacheKey) -> Result<Value, AppError> {
    let data = ctx.manager.get_or_refresh(key).await?;
    let mut value = to_json(&data)?;
    if let (Some(err), Value::Object(map)) = (data.fallback_error.as_ref(), &mut value) {
        map.insert("fallback_error".to_string(), Value::String(err.to_string()));
    }
    Ok(value)
}

pub async fn invalidate(ctx: &CacheContext, key: &CacheKey) -> Result<Value, AppError> {
    let invalidated = ctx.manager.invalidate(key).await?;
    Ok(json!({ "key": key, "invalidated": invalidated }))
}

pub async fn stats(ctx: &CacheContext) -> Result<Value, AppError> {
    let stats = ctx.manager.get_cache_stats().await?;
    to_json(&stats)
}

pub async fn clear(ctx: &CacheContext) -> Result<Value, AppError> {
    let report = ctx.manager.clear_all_cache().await?;
    Ok(json!({ "removed": report, "total": report.total() }))
}

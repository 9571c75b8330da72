//! Eviction manager: retention, capacity bounds and clear-all.
//!
//! Each pass is one store transaction, so readers never see a half-evicted
//! cache and observers are notified once per pass.

use std::sync::Arc;

use metrics::counter;
use time::OffsetDateTime;
use tracing::info;

use super::clock::Clock;
use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{CacheEvents, EventKind};
use crate::store::{CacheStore, EvictionReport};

pub const METRIC_EVICTED_ROWS_TOTAL: &str = "postcache_evicted_rows_total";

#[derive(Clone)]
pub struct EvictionManager {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    events: Arc<CacheEvents>,
    config: CacheConfig,
}

impl EvictionManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
        events: Arc<CacheEvents>,
        config: CacheConfig,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            config,
        }
    }

    /// Delete rows not synced within the retention window ending at `now`,
    /// and metadata not refreshed within it.
    pub async fn evict_expired(&self, now: OffsetDateTime) -> Result<EvictionReport, CacheError> {
        let cutoff = now - self.config.retention_window;
        let report = self
            .store
            .evict_synced_before(cutoff)
            .await
            .map_err(|err| CacheError::store(None, "evict_expired", err))?;
        self.record("expired", report, now);
        Ok(report)
    }

    /// Keep the newest `max_cached_posts` posts and the newest
    /// `max_cached_comments_per_post` comments of each post.
    pub async fn evict_over_capacity(&self) -> Result<EvictionReport, CacheError> {
        let report = self
            .store
            .evict_over_capacity(
                self.config.max_cached_posts,
                self.config.max_cached_comments_per_post,
            )
            .await
            .map_err(|err| CacheError::store(None, "evict_over_capacity", err))?;
        self.record("capacity", report, self.clock.now());
        Ok(report)
    }

    /// Empty every cached table and the metadata.
    pub async fn clear_all(&self) -> Result<EvictionReport, CacheError> {
        let now = self.clock.now();
        let report = self
            .store
            .clear_all(now)
            .await
            .map_err(|err| CacheError::store(None, "clear_all", err))?;
        record_metrics(report);
        info!(
            target = "postcache::cache::eviction",
            rows = report.total(),
            "cache cleared"
        );
        self.events.publish(EventKind::Cleared, now);
        Ok(report)
    }

    /// Retention pass followed by the capacity pass.
    pub async fn run(&self) -> Result<EvictionReport, CacheError> {
        let mut report = self.evict_expired(self.clock.now()).await?;
        report.merge(self.evict_over_capacity().await?);
        Ok(report)
    }

    fn record(&self, reason: &'static str, report: EvictionReport, at: OffsetDateTime) {
        if report.is_empty() {
            return;
        }
        record_metrics(report);
        info!(
            target = "postcache::cache::eviction",
            reason,
            posts = report.posts,
            comments = report.comments,
            categories = report.categories,
            users = report.users,
            metadata = report.metadata,
            "evicted cached rows"
        );
        self.events.publish(EventKind::Evicted { report }, at);
    }
}

fn record_metrics(report: EvictionReport) {
    for (table, rows) in report.per_table() {
        if rows > 0 {
            counter!(METRIC_EVICTED_ROWS_TOTAL, "table" => table.as_str()).increment(rows);
        }
    }
}

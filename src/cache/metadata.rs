//! Per-key freshness bookkeeping persisted next to the cached rows.

use serde::Serialize;
use time::OffsetDateTime;

use super::config::FreshnessPolicy;
use super::keys::CacheKey;

/// One row per logical cache key.
///
/// `expires_at >= last_refresh` always holds. `is_refreshing` is diagnostic
/// only: mutual exclusion lives in the in-memory refresh registry, and the
/// flag is reset on startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetadata {
    pub key: CacheKey,
    #[serde(with = "time::serde::rfc3339")]
    pub last_refresh: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub is_refreshing: bool,
}

impl CacheMetadata {
    /// Metadata written by a successful refresh at `refreshed_at`.
    pub fn refreshed(key: CacheKey, refreshed_at: OffsetDateTime, policy: FreshnessPolicy) -> Self {
        Self {
            key,
            last_refresh: refreshed_at,
            expires_at: refreshed_at + policy.expiry,
            is_refreshing: false,
        }
    }

    /// Copy of this row that classifies as expired from now on.
    pub fn invalidated(&self) -> Self {
        Self {
            expires_at: self.last_refresh,
            ..self.clone()
        }
    }

    pub fn stale_at(&self, policy: FreshnessPolicy) -> OffsetDateTime {
        self.last_refresh + policy.stale_threshold
    }
}

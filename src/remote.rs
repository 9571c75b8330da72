//! Network source the cache refreshes from.

use async_trait::async_trait;

use crate::cache::error::FetchError;
use crate::cache::keys::CacheKey;
use crate::domain::entities::FetchedBatch;

/// Fetches the authoritative rows behind one cache key.
///
/// Implementations return rows as the backend sent them; the refresh
/// coordinator stamps `last_sync_time` before writing.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<FetchedBatch, FetchError>;
}

/// Source used when no API endpoint is configured. Every fetch fails as a
/// connectivity error, so reads fall back to cached rows.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineRemote;

#[async_trait]
impl RemoteSource for OfflineRemote {
    async fn fetch(&self, _key: &CacheKey) -> Result<FetchedBatch, FetchError> {
        Err(FetchError::Connectivity(
            "no API base URL configured".to_string(),
        ))
    }
}

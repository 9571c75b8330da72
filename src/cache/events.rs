//! Cache event bus.
//!
//! Events describe what the cache core did: refreshes, invalidations,
//! evictions and local mutations. They are broadcast to any number of
//! subscribers; a subscriber that falls behind loses the oldest events.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::keys::CacheKey;
use crate::domain::types::PostId;
use crate::store::EvictionReport;

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Rows and metadata for `key` were replaced from the network.
    Refreshed { key: CacheKey, rows: usize },
    /// A refresh attempt failed; cached rows were left untouched.
    RefreshFailed { key: CacheKey, error: String },
    /// `key` was marked expired.
    Invalidated { key: CacheKey },
    /// An eviction pass removed rows.
    Evicted { report: EvictionReport },
    /// Every cached row was removed.
    Cleared,
    /// A post row was written or patched locally.
    PostChanged { post_id: PostId },
    PostDeleted { post_id: PostId },
    /// A background sync run ended.
    SyncFinished { succeeded: bool, attempts: u32 },
}

/// Broadcast channel for [`CacheEvent`]s.
#[derive(Debug)]
pub struct CacheEvents {
    tx: broadcast::Sender<CacheEvent>,
    epoch_counter: AtomicU64,
}

impl CacheEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish `kind`. Having no subscribers is not an error.
    pub fn publish(&self, kind: EventKind, timestamp: OffsetDateTime) -> Epoch {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(kind, epoch, timestamp);

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event published"
        );

        let _ = self.tx.send(event);
        epoch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}

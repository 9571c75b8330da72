//! Refresh coordinator.
//!
//! Guarantees at most one in-flight refresh per cache key. The first caller
//! for a key spawns the refresh task; later callers join it and observe the
//! same outcome. The task runs to completion even when every caller stops
//! waiting, so a refresh is never left half-written.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{CacheEvents, EventKind};
use super::keys::CacheKey;
use super::metadata::CacheMetadata;
use crate::remote::RemoteSource;
use crate::store::CacheStore;

pub const METRIC_REFRESH_TOTAL: &str = "postcache_refresh_total";
pub const METRIC_REFRESH_JOINED_TOTAL: &str = "postcache_refresh_joined_total";
pub const METRIC_REFRESH_MS: &str = "postcache_refresh_ms";

/// Result of one refresh, shared by every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub key: CacheKey,
    pub refreshed_at: OffsetDateTime,
    /// Rows written by the refresh.
    pub rows: usize,
    /// True when this caller joined a refresh started by someone else.
    pub joined: bool,
}

type SharedRefresh = Shared<BoxFuture<'static, Result<RefreshOutcome, CacheError>>>;

struct InFlight {
    generation: u64,
    refresh: SharedRefresh,
}

struct Inner {
    store: Arc<dyn CacheStore>,
    remote: Arc<dyn RemoteSource>,
    clock: Arc<dyn Clock>,
    events: Arc<CacheEvents>,
    config: CacheConfig,
    in_flight: DashMap<CacheKey, InFlight>,
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn CacheStore>,
        remote: Arc<dyn RemoteSource>,
        clock: Arc<dyn Clock>,
        events: Arc<CacheEvents>,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                remote,
                clock,
                events,
                config,
                in_flight: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Refresh `key` from the network, joining a refresh already in flight.
    ///
    /// On success the fetched rows and fresh metadata are committed in one
    /// transaction. On failure cached rows and metadata are left untouched.
    pub async fn refresh(&self, key: &CacheKey) -> Result<RefreshOutcome, CacheError> {
        let (refresh, joined) = self.acquire(key);
        let outcome = refresh.await?;
        Ok(RefreshOutcome { joined, ..outcome })
    }

    /// Start a refresh for `key` without waiting for it.
    ///
    /// Returns false when a refresh was already in flight.
    pub fn trigger(&self, key: &CacheKey) -> bool {
        let (_refresh, joined) = self.acquire(key);
        !joined
    }

    pub fn is_refreshing(&self, key: &CacheKey) -> bool {
        self.inner.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Clear `is_refreshing` flags left behind by a previous process.
    pub async fn recover(&self) -> Result<u64, CacheError> {
        let reset = self
            .inner
            .store
            .reset_refreshing_flags()
            .await
            .map_err(|err| CacheError::store(None, "reset_refreshing_flags", err))?;
        if reset > 0 {
            info!(
                target = "postcache::cache::refresh",
                reset, "cleared stale refresh flags"
            );
        }
        Ok(reset)
    }

    fn acquire(&self, key: &CacheKey) -> (SharedRefresh, bool) {
        match self.inner.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                counter!(METRIC_REFRESH_JOINED_TOTAL).increment(1);
                debug!(
                    target = "postcache::cache::refresh",
                    key = %key,
                    "joined in-flight refresh"
                );
                (entry.get().refresh.clone(), true)
            }
            Entry::Vacant(entry) => {
                let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
                let refresh = spawn_refresh(self.inner.clone(), key.clone(), generation);
                entry.insert(InFlight {
                    generation,
                    refresh: refresh.clone(),
                });
                (refresh, false)
            }
        }
    }
}

/// Removes the registry entry when the refresh task ends, including by panic.
struct InFlightGuard {
    inner: Arc<Inner>,
    key: CacheKey,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .remove_if(&self.key, |_, entry| entry.generation == self.generation);
    }
}

fn spawn_refresh(inner: Arc<Inner>, key: CacheKey, generation: u64) -> SharedRefresh {
    let guard = InFlightGuard {
        inner: inner.clone(),
        key: key.clone(),
        generation,
    };
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
        let _guard = guard;
        run_refresh(&inner, &task_key).await
    });

    async move {
        match handle.await {
            Ok(result) => result,
            Err(err) => Err(CacheError::coordination(
                &key,
                format!("refresh task ended abnormally: {err}"),
            )),
        }
    }
    .boxed()
    .shared()
}

async fn run_refresh(inner: &Inner, key: &CacheKey) -> Result<RefreshOutcome, CacheError> {
    let started_at = Instant::now();
    mark_refreshing(inner, key, true).await;

    let result = fetch_and_commit(inner, key).await;
    let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
    histogram!(METRIC_REFRESH_MS, "class" => key.class().as_str()).record(elapsed_ms);

    match &result {
        Ok(outcome) => {
            counter!(METRIC_REFRESH_TOTAL, "result" => "ok").increment(1);
            info!(
                target = "postcache::cache::refresh",
                key = %key,
                rows = outcome.rows,
                elapsed_ms,
                "refresh committed"
            );
            inner.events.publish(
                EventKind::Refreshed {
                    key: key.clone(),
                    rows: outcome.rows,
                },
                outcome.refreshed_at,
            );
        }
        Err(err) => {
            counter!(METRIC_REFRESH_TOTAL, "result" => "error").increment(1);
            warn!(
                target = "postcache::cache::refresh",
                key = %key,
                error = %err,
                elapsed_ms,
                "refresh failed; cached rows kept"
            );
            mark_refreshing(inner, key, false).await;
            inner.events.publish(
                EventKind::RefreshFailed {
                    key: key.clone(),
                    error: err.to_string(),
                },
                inner.clock.now(),
            );
        }
    }

    result
}

async fn fetch_and_commit(inner: &Inner, key: &CacheKey) -> Result<RefreshOutcome, CacheError> {
    let mut batch = inner
        .remote
        .fetch(key)
        .await
        .map_err(|err| CacheError::network(key, "refresh", err))?;

    let refreshed_at = inner.clock.now();
    batch.stamp(refreshed_at);
    let metadata = CacheMetadata::refreshed(
        key.clone(),
        refreshed_at,
        inner.config.policy(key.class()),
    );

    inner
        .store
        .commit_refresh(&batch, &metadata)
        .await
        .map_err(|err| CacheError::store(Some(key), "commit_refresh", err))?;

    for post_id in &batch.removed_posts {
        info!(
            target = "postcache::cache::refresh",
            key = %key,
            post_id = %post_id,
            "post gone on the server; removed from cache"
        );
        inner
            .events
            .publish(EventKind::PostDeleted { post_id: *post_id }, refreshed_at);
    }

    Ok(RefreshOutcome {
        key: key.clone(),
        refreshed_at,
        rows: batch.row_count(),
        joined: false,
    })
}

/// The persisted flag is diagnostic; failing to write it never fails a refresh.
async fn mark_refreshing(inner: &Inner, key: &CacheKey, refreshing: bool) {
    if let Err(err) = inner.store.set_refreshing(key, refreshing).await {
        debug!(
            target = "postcache::cache::refresh",
            key = %key,
            refreshing,
            error = %err,
            "could not update refresh flag"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use time::macros::datetime;
    use tokio::sync::Notify;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::error::FetchError;
    use crate::domain::entities::{Category, FetchedBatch};
    use crate::domain::types::CategoryId;
    use crate::store::{CachedPayload, MemoryStore};

    const T0: OffsetDateTime = datetime!(2024-03-01 12:00 UTC);

    /// Remote that blocks every fetch until released.
    struct GatedRemote {
        calls: AtomicUsize,
        gate: Notify,
        fail: bool,
    }

    impl GatedRemote {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: Notify::new(),
                fail,
            }
        }
    }

    #[async_trait]
    impl RemoteSource for GatedRemote {
        async fn fetch(&self, _key: &CacheKey) -> Result<FetchedBatch, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(FetchError::Timeout);
            }
            Ok(FetchedBatch::categories(vec![Category {
                id: CategoryId(1),
                name: "rust".into(),
                description: None,
                post_count: 3,
                last_sync_time: OffsetDateTime::UNIX_EPOCH,
            }]))
        }
    }

    fn coordinator(
        store: Arc<MemoryStore>,
        remote: Arc<GatedRemote>,
    ) -> (RefreshCoordinator, Arc<CacheEvents>) {
        let events = Arc::new(CacheEvents::new());
        let coordinator = RefreshCoordinator::new(
            store,
            remote,
            Arc::new(ManualClock::new(T0)),
            events.clone(),
            CacheConfig::default(),
        );
        (coordinator, events)
    }

    async fn wait_for_calls(remote: &GatedRemote, expected: usize) {
        for _ in 0..200 {
            if remote.calls.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("remote never reached {expected} calls");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(GatedRemote::new(false));
        let (coordinator, _events) = coordinator(store.clone(), remote.clone());

        let mut handles = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.refresh(&CacheKey::Categories).await
            }));
        }

        wait_for_calls(&remote, 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(coordinator.is_refreshing(&CacheKey::Categories));
        remote.gate.notify_waiters();

        let mut joined = 0;
        for handle in handles {
            let outcome = handle.await.expect("task").expect("refresh");
            assert_eq!(outcome.refreshed_at, T0);
            assert_eq!(outcome.rows, 1);
            if outcome.joined {
                joined += 1;
            }
        }

        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 4);
        assert_eq!(coordinator.in_flight_count(), 0);

        let view = store.load(&CacheKey::Categories).await.expect("load");
        let meta = view.metadata.expect("metadata written");
        assert_eq!(meta.last_refresh, T0);
        assert!(!meta.is_refreshing);
        assert!(matches!(view.payload, CachedPayload::Categories { ref categories } if categories[0].last_sync_time == T0));
    }

    #[tokio::test]
    async fn failure_leaves_cache_untouched_and_is_shared() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(GatedRemote::new(true));
        let (coordinator, events) = coordinator(store.clone(), remote.clone());
        let mut rx = events.subscribe();

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh(&CacheKey::Categories).await }
        });
        wait_for_calls(&remote, 1).await;
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.refresh(&CacheKey::Categories).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        remote.gate.notify_waiters();

        let first = first.await.expect("task");
        let second = second.await.expect("task");
        assert!(matches!(first, Err(CacheError::Network { .. })));
        assert!(matches!(second, Err(CacheError::Network { .. })));
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);

        assert!(store.metadata(&CacheKey::Categories).await.expect("read").is_none());
        assert!(store.counts().await.expect("counts").is_empty());

        let event = rx.recv().await.expect("event");
        assert!(matches!(event.kind, EventKind::RefreshFailed { .. }));
    }

    #[tokio::test]
    async fn next_refresh_after_completion_fetches_again() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(GatedRemote::new(false));
        let (coordinator, _events) = coordinator(store, remote.clone());

        for round in 1..=2 {
            let task = tokio::spawn({
                let coordinator = coordinator.clone();
                async move { coordinator.refresh(&CacheKey::Categories).await }
            });
            wait_for_calls(&remote, round).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            remote.gate.notify_waiters();
            let outcome = task.await.expect("task").expect("refresh");
            assert!(!outcome.joined);
        }
        assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trigger_runs_without_a_waiter() {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(GatedRemote::new(false));
        let (coordinator, _events) = coordinator(store.clone(), remote.clone());
        let mut changes = store.changes();

        assert!(coordinator.trigger(&CacheKey::Categories));
        wait_for_calls(&remote, 1).await;
        assert!(!coordinator.trigger(&CacheKey::Categories));
        tokio::time::sleep(Duration::from_millis(10)).await;
        remote.gate.notify_waiters();

        tokio::time::timeout(Duration::from_secs(2), changes.changed())
            .await
            .expect("commit within timeout")
            .expect("store alive");
        assert!(store.metadata(&CacheKey::Categories).await.expect("read").is_some());
    }
}

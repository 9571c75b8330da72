//! Cache manager: the read path and the local write hooks.

use std::sync::Arc;

use futures::stream::BoxStream;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::clock::Clock;
use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{CacheEvents, EventKind};
use super::eviction::EvictionManager;
use super::keys::CacheKey;
use super::policy::{Freshness, ReadDecision, classify};
use super::refresh::{RefreshCoordinator, RefreshOutcome};
use super::sync::{DeviceConditions, SyncConfig, SyncCoordinator};
use crate::domain::entities::{Comment, FetchedBatch, Post};
use crate::domain::types::PostId;
use crate::remote::RemoteSource;
use crate::store::{CacheStore, CachedPayload, CachedView, EvictionReport, PostPatch};

pub const METRIC_READ_TOTAL: &str = "postcache_read_total";

/// Data handed to a reader.
#[derive(Debug, Clone, Serialize)]
pub struct CachedData {
    pub key: CacheKey,
    /// Classification of the rows in `payload` at read time.
    pub freshness: Freshness,
    pub payload: CachedPayload,
    /// Set when a required refresh failed and last-known rows were returned
    /// instead. Such data may be out of date.
    #[serde(skip)]
    pub fallback_error: Option<CacheError>,
}

impl CachedData {
    pub fn is_fallback(&self) -> bool {
        self.fallback_error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_posts: u64,
    pub total_categories: u64,
    pub total_comments: u64,
    pub total_users: u64,
    pub metadata_entries: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_clear_time: Option<time::OffsetDateTime>,
}

#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    events: Arc<CacheEvents>,
    config: CacheConfig,
    refresh: RefreshCoordinator,
    eviction: EvictionManager,
}

impl CacheManager {
    pub fn new(
        store: Arc<dyn CacheStore>,
        remote: Arc<dyn RemoteSource>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let events = Arc::new(CacheEvents::new());
        let refresh = RefreshCoordinator::new(
            store.clone(),
            remote,
            clock.clone(),
            events.clone(),
            config.clone(),
        );
        let eviction =
            EvictionManager::new(store.clone(), clock.clone(), events.clone(), config.clone());
        Self {
            store,
            clock,
            events,
            config,
            refresh,
            eviction,
        }
    }

    pub fn events(&self) -> &Arc<CacheEvents> {
        &self.events
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.refresh
    }

    pub fn eviction(&self) -> &EvictionManager {
        &self.eviction
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Background sync sharing this manager's refresh registry and event bus.
    pub fn sync_coordinator(
        &self,
        conditions: Arc<dyn DeviceConditions>,
        config: SyncConfig,
    ) -> SyncCoordinator {
        SyncCoordinator::new(
            self.refresh.clone(),
            self.eviction.clone(),
            conditions,
            self.clock.clone(),
            self.events.clone(),
            config,
        )
    }

    /// Startup recovery; see [`RefreshCoordinator::recover`].
    pub async fn recover(&self) -> Result<u64, CacheError> {
        self.refresh.recover().await
    }

    /// Classify `key` against the current clock without side effects.
    pub async fn classify(&self, key: &CacheKey) -> Result<Freshness, CacheError> {
        let metadata = self
            .store
            .metadata(key)
            .await
            .map_err(|err| CacheError::store(Some(key), "classify", err))?;
        Ok(classify(
            metadata.as_ref(),
            self.config.policy(key.class()),
            self.clock.now(),
        ))
    }

    /// Read `key`, refreshing from the network as its freshness requires.
    ///
    /// Fresh rows are returned as is. Stale rows are returned immediately and
    /// a background refresh is started. Missing or expired keys wait for a
    /// refresh; if it fails and rows are cached, those rows are returned with
    /// [`CachedData::fallback_error`] set, otherwise the error is returned.
    pub async fn get_or_refresh(&self, key: &CacheKey) -> Result<CachedData, CacheError> {
        let (view, freshness) = self.read(key).await?;
        counter!(METRIC_READ_TOTAL, "freshness" => freshness.as_str()).increment(1);

        match freshness.decision() {
            ReadDecision::Serve => Ok(data(key, freshness, view.payload)),
            ReadDecision::ServeAndRevalidate => {
                if self.refresh.trigger(key) {
                    debug!(
                        target = "postcache::cache::manager",
                        key = %key,
                        "serving stale rows, background refresh started"
                    );
                }
                Ok(data(key, freshness, view.payload))
            }
            ReadDecision::RefreshBlocking => match self.refresh.refresh(key).await {
                Ok(_) => {
                    let (view, freshness) = self.read(key).await?;
                    Ok(data(key, freshness, view.payload))
                }
                Err(err) if !view.payload.is_empty() => {
                    warn!(
                        target = "postcache::cache::manager",
                        key = %key,
                        freshness = %freshness,
                        error = %err,
                        "refresh failed; serving last known rows"
                    );
                    Ok(CachedData {
                        fallback_error: Some(err),
                        ..data(key, freshness, view.payload)
                    })
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Current rows and classification for `key`, never touching the network.
    pub async fn current(&self, key: &CacheKey) -> Result<CachedData, CacheError> {
        let (view, freshness) = self.read(key).await?;
        Ok(data(key, freshness, view.payload))
    }

    /// Live query: applies the read policy once, then re-reads `key` after
    /// every committed store mutation. Dropping the stream stops it.
    pub fn observe(&self, key: CacheKey) -> BoxStream<'static, Result<CachedData, CacheError>> {
        let manager = self.clone();
        let mut changes = self.store.changes();
        Box::pin(async_stream::stream! {
            changes.borrow_and_update();
            yield manager.get_or_refresh(&key).await;
            while changes.changed().await.is_ok() {
                yield manager.current(&key).await;
            }
        })
    }

    /// Force a network refresh of `key`, joining one already in flight.
    pub async fn refresh(&self, key: &CacheKey) -> Result<RefreshOutcome, CacheError> {
        self.refresh.refresh(key).await
    }

    /// Mark `key` expired so the next read refreshes. Returns false when the
    /// key has no metadata.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let expired = self
            .store
            .invalidate(key)
            .await
            .map_err(|err| CacheError::store(Some(key), "invalidate", err))?;
        if !expired {
            return Ok(false);
        }
        debug!(target = "postcache::cache::manager", key = %key, "invalidated");
        self.events
            .publish(EventKind::Invalidated { key: key.clone() }, self.clock.now());
        Ok(true)
    }

    /// Remove every cached row (logout, explicit clear).
    pub async fn clear_all_cache(&self) -> Result<EvictionReport, CacheError> {
        self.eviction.clear_all().await
    }

    pub async fn get_cache_stats(&self) -> Result<CacheStats, CacheError> {
        let counts = self
            .store
            .counts()
            .await
            .map_err(|err| CacheError::store(None, "get_cache_stats", err))?;
        let last_clear_time = self
            .store
            .last_clear_time()
            .await
            .map_err(|err| CacheError::store(None, "get_cache_stats", err))?;
        Ok(CacheStats {
            total_posts: counts.posts,
            total_categories: counts.categories,
            total_comments: counts.comments,
            total_users: counts.users,
            metadata_entries: counts.metadata,
            last_clear_time,
        })
    }

    /// A post was deleted on the server: drop it with its comments and expire
    /// every list that may have shown it.
    pub async fn post_deleted(&self, id: PostId) -> Result<EvictionReport, CacheError> {
        let detail_key = CacheKey::PostDetail(id);
        let existing = self
            .store
            .post(id)
            .await
            .map_err(|err| CacheError::store(Some(&detail_key), "post_deleted", err))?;
        let report = self
            .store
            .delete_posts(&[id])
            .await
            .map_err(|err| CacheError::store(Some(&detail_key), "post_deleted", err))?;

        let mut keys = vec![CacheKey::AllPosts, detail_key];
        if let Some(post) = &existing {
            keys.extend(list_keys_for(post).into_iter().skip(1));
        }
        self.invalidate_all(&keys).await?;

        info!(
            target = "postcache::cache::manager",
            post_id = %id,
            comments = report.comments,
            "post removed from cache"
        );
        self.events
            .publish(EventKind::PostDeleted { post_id: id }, self.clock.now());
        Ok(report)
    }

    /// A post was created or edited on the server and `post` is the row it
    /// returned.
    pub async fn post_saved(&self, mut post: Post) -> Result<(), CacheError> {
        let now = self.clock.now();
        post.last_sync_time = now;
        let post_id = post.id;
        let keys = list_keys_for(&post);
        self.store
            .upsert(&FetchedBatch::posts(vec![post]))
            .await
            .map_err(|err| {
                CacheError::store(Some(&CacheKey::PostDetail(post_id)), "post_saved", err)
            })?;
        self.invalidate_all(&keys).await?;
        self.events.publish(EventKind::PostChanged { post_id }, now);
        Ok(())
    }

    /// A comment was posted; cache it and bump the parent's comment count
    /// unless the comment was already cached.
    pub async fn comment_added(&self, mut comment: Comment) -> Result<(), CacheError> {
        let now = self.clock.now();
        comment.last_sync_time = now;
        let post_id = comment.post_id;
        let key = CacheKey::PostDetail(post_id);

        let added = self
            .store
            .add_comment(&comment)
            .await
            .map_err(|err| CacheError::store(Some(&key), "comment_added", err))?;
        if !added {
            debug!(
                target = "postcache::cache::manager",
                comment_id = %comment.id,
                "comment already cached; count unchanged"
            );
        }

        self.invalidate(&key).await?;
        self.events.publish(EventKind::PostChanged { post_id }, now);
        Ok(())
    }

    /// Apply a like toggle confirmed by the server. Returns false when the
    /// post is not cached.
    pub async fn like_toggled(
        &self,
        post_id: PostId,
        liked: bool,
        like_count: i64,
    ) -> Result<bool, CacheError> {
        let patched = self
            .store
            .patch_post(post_id, &PostPatch::Like { liked, like_count })
            .await
            .map_err(|err| {
                CacheError::store(Some(&CacheKey::PostDetail(post_id)), "like_toggled", err)
            })?;
        if patched {
            self.events
                .publish(EventKind::PostChanged { post_id }, self.clock.now());
        }
        Ok(patched)
    }

    async fn read(&self, key: &CacheKey) -> Result<(CachedView, Freshness), CacheError> {
        let view = self
            .store
            .load(key)
            .await
            .map_err(|err| CacheError::store(Some(key), "load", err))?;
        let freshness = classify(
            view.metadata.as_ref(),
            self.config.policy(key.class()),
            self.clock.now(),
        );
        Ok((view, freshness))
    }

    async fn invalidate_all(&self, keys: &[CacheKey]) -> Result<(), CacheError> {
        for key in keys {
            self.invalidate(key).await?;
        }
        Ok(())
    }
}

fn data(key: &CacheKey, freshness: Freshness, payload: CachedPayload) -> CachedData {
    CachedData {
        key: key.clone(),
        freshness,
        payload,
        fallback_error: None,
    }
}

/// Keys whose rows include `post`: the feed first, then author and category lists.
fn list_keys_for(post: &Post) -> Vec<CacheKey> {
    let mut keys = vec![CacheKey::AllPosts];
    keys.extend(CacheKey::lists_containing(post.author_id, post.category_id));
    keys
}

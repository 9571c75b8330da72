//! In-memory store.
//!
//! All tables sit behind one lock, so every operation works on a consistent
//! snapshot and commits as a unit.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::cache::error::StoreError;
use crate::cache::keys::CacheKey;
use crate::cache::lock::{read_recovered, write_recovered};
use crate::cache::metadata::CacheMetadata;
use crate::domain::entities::{Category, Comment, FetchedBatch, Post, User};
use crate::domain::types::{CategoryId, CommentId, PostId, UserId};

use super::{
    CacheStore, CachedPayload, CachedView, ChangeNotifier, EvictionReport, PostPatch, StoreCounts,
    overflow_ids,
};

const SOURCE: &str = "store::memory";

#[derive(Debug, Default)]
struct Tables {
    posts: BTreeMap<PostId, Post>,
    categories: BTreeMap<CategoryId, Category>,
    comments: BTreeMap<CommentId, Comment>,
    users: BTreeMap<UserId, User>,
    metadata: HashMap<CacheKey, CacheMetadata>,
    last_clear_time: Option<OffsetDateTime>,
}

impl Tables {
    /// Delete the batch's removed posts, then upsert its rows.
    fn apply(&mut self, batch: &FetchedBatch) -> EvictionReport {
        let report = self.delete_posts(&batch.removed_posts);
        for post in &batch.posts {
            self.posts.insert(post.id, post.clone());
        }
        for category in &batch.categories {
            self.categories.insert(category.id, category.clone());
        }
        for comment in &batch.comments {
            self.comments.insert(comment.id, comment.clone());
        }
        for user in &batch.users {
            self.users.insert(user.id, user.clone());
        }
        report
    }

    /// Delete posts with their comments and detail metadata, and expire the
    /// author and category lists that showed them.
    fn delete_posts(&mut self, ids: &[PostId]) -> EvictionReport {
        let mut report = EvictionReport::default();
        let mut lists = Vec::new();
        for id in ids {
            if let Some(post) = self.posts.remove(id) {
                report.posts += 1;
                lists.extend(CacheKey::lists_containing(post.author_id, post.category_id));
            }
            if self.metadata.remove(&CacheKey::PostDetail(*id)).is_some() {
                report.metadata += 1;
            }
        }
        let before = self.comments.len();
        self.comments
            .retain(|_, comment| !ids.contains(&comment.post_id));
        report.comments = (before - self.comments.len()) as u64;

        for key in lists {
            self.expire(&key);
        }
        report
    }

    /// Delete comments and expire the detail keys of the posts they were on.
    fn delete_comments(&mut self, ids: &[CommentId]) -> u64 {
        let mut posts = Vec::new();
        for id in ids {
            if let Some(comment) = self.comments.remove(id) {
                posts.push(comment.post_id);
            }
        }
        let removed = posts.len() as u64;
        posts.dedup();
        for post in posts {
            self.expire(&CacheKey::PostDetail(post));
        }
        removed
    }

    /// Expire `key` in place. Returns false when it has no metadata.
    fn expire(&mut self, key: &CacheKey) -> bool {
        match self.metadata.get_mut(key) {
            Some(row) => {
                *row = row.invalidated();
                true
            }
            None => false,
        }
    }

    fn payload(&self, key: &CacheKey) -> CachedPayload {
        match key {
            CacheKey::AllPosts => self.posts_where(|_| true),
            CacheKey::AuthorPosts(author) => self.posts_where(|post| post.author_id == *author),
            CacheKey::CategoryPosts(category) => {
                self.posts_where(|post| post.category_id == Some(*category))
            }
            CacheKey::Categories => {
                let mut categories: Vec<Category> = self.categories.values().cloned().collect();
                categories.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
                CachedPayload::Categories { categories }
            }
            CacheKey::PostDetail(id) => {
                let post = self.posts.get(id).cloned();
                let author = post
                    .as_ref()
                    .and_then(|post| self.users.get(&post.author_id).cloned());
                let mut comments: Vec<Comment> = self
                    .comments
                    .values()
                    .filter(|comment| comment.post_id == *id)
                    .cloned()
                    .collect();
                comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                CachedPayload::PostDetail {
                    post,
                    comments,
                    author,
                }
            }
        }
    }

    fn posts_where(&self, predicate: impl Fn(&Post) -> bool) -> CachedPayload {
        let mut posts: Vec<Post> = self
            .posts
            .values()
            .filter(|post| predicate(post))
            .cloned()
            .collect();
        posts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        CachedPayload::Posts { posts }
    }

    fn counts(&self) -> StoreCounts {
        StoreCounts {
            posts: self.posts.len() as u64,
            categories: self.categories.len() as u64,
            comments: self.comments.len() as u64,
            users: self.users.len() as u64,
            metadata: self.metadata.len() as u64,
        }
    }
}

/// Store backed by process memory. Contents do not survive a restart.
#[derive(Debug)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    changes: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            changes: ChangeNotifier::new(),
        }
    }

    /// Run `mutate` under the write lock and notify observers if it reports a change.
    fn mutate<R>(&self, op: &'static str, mutate: impl FnOnce(&mut Tables) -> (R, bool)) -> R {
        let (result, changed) = {
            let mut tables = write_recovered(&self.tables, SOURCE, op);
            mutate(&mut tables)
        };
        if changed {
            self.changes.notify();
        }
        result
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn load(&self, key: &CacheKey) -> Result<CachedView, StoreError> {
        let tables = read_recovered(&self.tables, SOURCE, "load");
        Ok(CachedView {
            metadata: tables.metadata.get(key).cloned(),
            payload: tables.payload(key),
        })
    }

    async fn metadata(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, StoreError> {
        Ok(read_recovered(&self.tables, SOURCE, "metadata")
            .metadata
            .get(key)
            .cloned())
    }

    async fn all_metadata(&self) -> Result<Vec<CacheMetadata>, StoreError> {
        let tables = read_recovered(&self.tables, SOURCE, "all_metadata");
        let mut rows: Vec<CacheMetadata> = tables.metadata.values().cloned().collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rows)
    }

    async fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError> {
        if metadata.expires_at < metadata.last_refresh {
            return Err(StoreError::Integrity(format!(
                "expires_at precedes last_refresh for `{}`",
                metadata.key
            )));
        }
        self.mutate("put_metadata", |tables| {
            tables
                .metadata
                .insert(metadata.key.clone(), metadata.clone());
            ((), true)
        });
        Ok(())
    }

    async fn set_refreshing(&self, key: &CacheKey, refreshing: bool) -> Result<(), StoreError> {
        let mut tables = write_recovered(&self.tables, SOURCE, "set_refreshing");
        if let Some(row) = tables.metadata.get_mut(key) {
            row.is_refreshing = refreshing;
        }
        Ok(())
    }

    async fn reset_refreshing_flags(&self) -> Result<u64, StoreError> {
        let mut tables = write_recovered(&self.tables, SOURCE, "reset_refreshing_flags");
        let mut reset = 0;
        for row in tables.metadata.values_mut() {
            if row.is_refreshing {
                row.is_refreshing = false;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn commit_refresh(
        &self,
        batch: &FetchedBatch,
        metadata: &CacheMetadata,
    ) -> Result<(), StoreError> {
        if metadata.expires_at < metadata.last_refresh {
            return Err(StoreError::Integrity(format!(
                "expires_at precedes last_refresh for `{}`",
                metadata.key
            )));
        }
        self.mutate("commit_refresh", |tables| {
            tables.apply(batch);
            tables
                .metadata
                .insert(metadata.key.clone(), metadata.clone());
            ((), true)
        });
        Ok(())
    }

    async fn upsert(&self, batch: &FetchedBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.mutate("upsert", |tables| {
            tables.apply(batch);
            ((), true)
        });
        Ok(())
    }

    async fn add_comment(&self, comment: &Comment) -> Result<bool, StoreError> {
        Ok(self.mutate("add_comment", |tables| {
            let inserted = tables
                .comments
                .insert(comment.id, comment.clone())
                .is_none();
            if inserted {
                if let Some(post) = tables.posts.get_mut(&comment.post_id) {
                    PostPatch::IncrementComments.apply(post);
                }
            }
            (inserted, true)
        }))
    }

    async fn post(&self, id: PostId) -> Result<Option<Post>, StoreError> {
        Ok(read_recovered(&self.tables, SOURCE, "post").posts.get(&id).cloned())
    }

    async fn patch_post(&self, id: PostId, patch: &PostPatch) -> Result<bool, StoreError> {
        Ok(self.mutate("patch_post", |tables| match tables.posts.get_mut(&id) {
            Some(post) => {
                patch.apply(post);
                (true, true)
            }
            None => (false, false),
        }))
    }

    async fn delete_posts(&self, ids: &[PostId]) -> Result<EvictionReport, StoreError> {
        Ok(self.mutate("delete_posts", |tables| {
            let report = tables.delete_posts(ids);
            let changed = !report.is_empty();
            (report, changed)
        }))
    }

    async fn delete_comments(&self, ids: &[CommentId]) -> Result<EvictionReport, StoreError> {
        Ok(self.mutate("delete_comments", |tables| {
            let report = EvictionReport {
                comments: tables.delete_comments(ids),
                ..Default::default()
            };
            let changed = !report.is_empty();
            (report, changed)
        }))
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.mutate("invalidate", |tables| {
            let expired = tables.expire(key);
            (expired, expired)
        }))
    }

    async fn delete_metadata(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(self.mutate("delete_metadata", |tables| {
            let removed = tables.metadata.remove(key).is_some();
            (removed, removed)
        }))
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        Ok(read_recovered(&self.tables, SOURCE, "counts").counts())
    }

    async fn count_comments_for(&self, post: PostId) -> Result<u64, StoreError> {
        Ok(read_recovered(&self.tables, SOURCE, "count_comments_for")
            .comments
            .values()
            .filter(|comment| comment.post_id == post)
            .count() as u64)
    }

    async fn evict_synced_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<EvictionReport, StoreError> {
        Ok(self.mutate("evict_synced_before", |tables| {
            let expired_posts: Vec<PostId> = tables
                .posts
                .values()
                .filter(|post| post.last_sync_time < cutoff)
                .map(|post| post.id)
                .collect();
            let mut report = tables.delete_posts(&expired_posts);

            let stale_comments: Vec<CommentId> = tables
                .comments
                .values()
                .filter(|comment| comment.last_sync_time < cutoff)
                .map(|comment| comment.id)
                .collect();
            report.comments += tables.delete_comments(&stale_comments);

            let before = tables.categories.len();
            tables
                .categories
                .retain(|_, category| category.last_sync_time >= cutoff);
            report.categories = (before - tables.categories.len()) as u64;

            let before = tables.users.len();
            tables.users.retain(|_, user| user.last_sync_time >= cutoff);
            report.users = (before - tables.users.len()) as u64;

            let before = tables.metadata.len();
            tables
                .metadata
                .retain(|_, row| row.last_refresh >= cutoff);
            report.metadata += (before - tables.metadata.len()) as u64;

            let changed = !report.is_empty();
            (report, changed)
        }))
    }

    async fn evict_over_capacity(
        &self,
        max_posts: usize,
        max_comments_per_post: usize,
    ) -> Result<EvictionReport, StoreError> {
        Ok(self.mutate("evict_over_capacity", |tables| {
            let post_rows = tables
                .posts
                .values()
                .map(|post| (post.last_sync_time, post.id))
                .collect();
            let overflow = overflow_ids(post_rows, max_posts);
            let mut report = tables.delete_posts(&overflow);

            let mut per_post: HashMap<PostId, Vec<(OffsetDateTime, CommentId)>> = HashMap::new();
            for comment in tables.comments.values() {
                per_post
                    .entry(comment.post_id)
                    .or_default()
                    .push((comment.last_sync_time, comment.id));
            }
            let overflow: Vec<CommentId> = per_post
                .into_values()
                .flat_map(|rows| overflow_ids(rows, max_comments_per_post))
                .collect();
            report.comments += tables.delete_comments(&overflow);

            let changed = !report.is_empty();
            (report, changed)
        }))
    }

    async fn clear_all(&self, cleared_at: OffsetDateTime) -> Result<EvictionReport, StoreError> {
        Ok(self.mutate("clear_all", |tables| {
            let counts = tables.counts();
            let report = EvictionReport {
                posts: counts.posts,
                categories: counts.categories,
                comments: counts.comments,
                users: counts.users,
                metadata: counts.metadata,
            };
            tables.posts.clear();
            tables.categories.clear();
            tables.comments.clear();
            tables.users.clear();
            tables.metadata.clear();
            tables.last_clear_time = Some(cleared_at);
            let changed = !report.is_empty();
            (report, changed)
        }))
    }

    async fn last_clear_time(&self) -> Result<Option<OffsetDateTime>, StoreError> {
        Ok(read_recovered(&self.tables, SOURCE, "last_clear_time").last_clear_time)
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

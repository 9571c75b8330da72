//! Persistent store abstraction for cached rows and cache metadata.
//!
//! Every mutating operation is atomic: readers see either all of it or none of
//! it. After each committed mutation the store bumps its change version so
//! live observers re-run their queries.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::cache::error::StoreError;
use crate::cache::keys::CacheKey;
use crate::cache::metadata::CacheMetadata;
use crate::domain::entities::{Category, Comment, FetchedBatch, Post, User};
use crate::domain::types::{CommentId, PostId};

/// Rows answering one cache key.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CachedPayload {
    /// Newest first.
    Posts { posts: Vec<Post> },
    /// Ordered by name.
    Categories { categories: Vec<Category> },
    /// Comments oldest first.
    PostDetail {
        post: Option<Post>,
        comments: Vec<Comment>,
        author: Option<User>,
    },
}

impl CachedPayload {
    /// True when there is nothing a screen could show.
    pub fn is_empty(&self) -> bool {
        match self {
            CachedPayload::Posts { posts } => posts.is_empty(),
            CachedPayload::Categories { categories } => categories.is_empty(),
            CachedPayload::PostDetail { post, .. } => post.is_none(),
        }
    }

    pub fn row_count(&self) -> usize {
        match self {
            CachedPayload::Posts { posts } => posts.len(),
            CachedPayload::Categories { categories } => categories.len(),
            CachedPayload::PostDetail {
                post,
                comments,
                author,
            } => usize::from(post.is_some()) + comments.len() + usize::from(author.is_some()),
        }
    }
}

/// Metadata and rows for one key, read from the same snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedView {
    pub metadata: Option<CacheMetadata>,
    pub payload: CachedPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Posts,
    Categories,
    Comments,
    Users,
    Metadata,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Table::Posts => "posts",
            Table::Categories => "categories",
            Table::Comments => "comments",
            Table::Users => "users",
            Table::Metadata => "cache_metadata",
        }
    }
}

/// Row counts per table, taken from one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub posts: u64,
    pub categories: u64,
    pub comments: u64,
    pub users: u64,
    pub metadata: u64,
}

impl StoreCounts {
    pub fn get(&self, table: Table) -> u64 {
        match table {
            Table::Posts => self.posts,
            Table::Categories => self.categories,
            Table::Comments => self.comments,
            Table::Users => self.users,
            Table::Metadata => self.metadata,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.posts + self.categories + self.comments + self.users + self.metadata == 0
    }
}

/// Rows removed by an eviction pass or an explicit delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub posts: u64,
    pub categories: u64,
    pub comments: u64,
    pub users: u64,
    pub metadata: u64,
}

impl EvictionReport {
    pub fn total(&self) -> u64 {
        self.posts + self.categories + self.comments + self.users + self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn merge(&mut self, other: EvictionReport) {
        self.posts += other.posts;
        self.categories += other.categories;
        self.comments += other.comments;
        self.users += other.users;
        self.metadata += other.metadata;
    }

    pub(crate) fn per_table(&self) -> [(Table, u64); 5] {
        [
            (Table::Posts, self.posts),
            (Table::Categories, self.categories),
            (Table::Comments, self.comments),
            (Table::Users, self.users),
            (Table::Metadata, self.metadata),
        ]
    }
}

/// Partial update applied to a single post without touching `last_sync_time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostPatch {
    CommentCount(i64),
    /// Bump the cached count by one, relative to the stored value.
    IncrementComments,
    Like { liked: bool, like_count: i64 },
    Image(Option<String>),
}

impl PostPatch {
    pub(crate) fn apply(&self, post: &mut Post) {
        match self {
            PostPatch::CommentCount(count) => post.comment_count = *count,
            PostPatch::IncrementComments => post.comment_count += 1,
            PostPatch::Like { liked, like_count } => {
                post.liked_by_me = *liked;
                post.like_count = *like_count;
            }
            PostPatch::Image(url) => post.image_url = url.clone(),
        }
    }
}

/// Relational store for cached rows and per-key metadata.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read metadata and rows for `key` from one consistent snapshot.
    async fn load(&self, key: &CacheKey) -> Result<CachedView, StoreError>;

    async fn metadata(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, StoreError>;

    async fn all_metadata(&self) -> Result<Vec<CacheMetadata>, StoreError>;

    async fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError>;

    /// Best-effort diagnostic flag; a missing row is left missing.
    async fn set_refreshing(&self, key: &CacheKey, refreshing: bool) -> Result<(), StoreError>;

    /// Clear every persisted `is_refreshing` flag, returning how many were set.
    async fn reset_refreshing_flags(&self) -> Result<u64, StoreError>;

    /// Apply `batch` and write `metadata` in a single transaction.
    ///
    /// Posts listed in `batch.removed_posts` are deleted as by
    /// [`delete_posts`](Self::delete_posts) before the rows are upserted.
    async fn commit_refresh(
        &self,
        batch: &FetchedBatch,
        metadata: &CacheMetadata,
    ) -> Result<(), StoreError>;

    /// Upsert by primary id without touching metadata.
    async fn upsert(&self, batch: &FetchedBatch) -> Result<(), StoreError>;

    /// Store `comment` and, when its id was not cached yet, bump its post's
    /// comment count, atomically. Returns true for a new comment.
    async fn add_comment(&self, comment: &Comment) -> Result<bool, StoreError>;

    async fn post(&self, id: PostId) -> Result<Option<Post>, StoreError>;

    /// Apply `patch` to one post. Returns false when the post is not cached.
    async fn patch_post(&self, id: PostId, patch: &PostPatch) -> Result<bool, StoreError>;

    /// Delete posts and, by cascade, their comments.
    ///
    /// Metadata for each post's detail key is deleted too, and the author and
    /// category lists the posts belonged to are expired.
    async fn delete_posts(&self, ids: &[PostId]) -> Result<EvictionReport, StoreError>;

    async fn delete_comments(&self, ids: &[CommentId]) -> Result<EvictionReport, StoreError>;

    /// Expire `key` in place, keeping `last_refresh` and `is_refreshing`.
    /// Returns false when the key has no metadata.
    async fn invalidate(&self, key: &CacheKey) -> Result<bool, StoreError>;

    async fn delete_metadata(&self, key: &CacheKey) -> Result<bool, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;

    async fn count_comments_for(&self, post: PostId) -> Result<u64, StoreError>;

    /// Delete entity rows synced before `cutoff` and metadata refreshed before it.
    ///
    /// Keys whose rows were removed while their metadata survives are expired.
    async fn evict_synced_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<EvictionReport, StoreError>;

    /// Keep only the most recently synced posts and comments per post.
    ///
    /// Dependent metadata is handled as in [`delete_posts`](Self::delete_posts);
    /// a post that loses comments has its detail key expired.
    async fn evict_over_capacity(
        &self,
        max_posts: usize,
        max_comments_per_post: usize,
    ) -> Result<EvictionReport, StoreError>;

    /// Empty every table and record `cleared_at`.
    async fn clear_all(&self, cleared_at: OffsetDateTime) -> Result<EvictionReport, StoreError>;

    async fn last_clear_time(&self) -> Result<Option<OffsetDateTime>, StoreError>;

    /// Receiver whose value changes after every committed mutation.
    fn changes(&self) -> watch::Receiver<u64>;
}

/// Shared change-version counter used by store implementations.
#[derive(Debug)]
pub(crate) struct ChangeNotifier {
    tx: watch::Sender<u64>,
}

impl ChangeNotifier {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    pub(crate) fn notify(&self) {
        self.tx.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Ids of the rows beyond `limit` when ordered newest-synced first.
///
/// Ties on `last_sync_time` keep the higher id.
pub(crate) fn overflow_ids<I: Ord + Copy>(
    mut rows: Vec<(OffsetDateTime, I)>,
    limit: usize,
) -> Vec<I> {
    if rows.len() <= limit {
        return Vec::new();
    }
    rows.sort_by(|a, b| b.cmp(a));
    rows.split_off(limit).into_iter().map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn overflow_keeps_newest() {
        let rows = vec![
            (datetime!(2024-01-01 00:00 UTC), 1),
            (datetime!(2024-01-03 00:00 UTC), 2),
            (datetime!(2024-01-02 00:00 UTC), 3),
        ];
        assert_eq!(overflow_ids(rows, 2), vec![1]);
    }

    #[test]
    fn overflow_breaks_ties_by_id() {
        let same = datetime!(2024-01-01 00:00 UTC);
        let rows = vec![(same, 5), (same, 9), (same, 1)];
        let mut evicted = overflow_ids(rows, 1);
        evicted.sort();
        assert_eq!(evicted, vec![1, 5]);
    }

    #[test]
    fn overflow_within_limit_is_empty() {
        let rows = vec![(datetime!(2024-01-01 00:00 UTC), 1)];
        assert!(overflow_ids(rows, 10).is_empty());
    }

    #[test]
    fn eviction_report_merges() {
        let mut report = EvictionReport {
            posts: 1,
            ..Default::default()
        };
        report.merge(EvictionReport {
            comments: 3,
            metadata: 1,
            ..Default::default()
        });
        assert_eq!(report.total(), 5);
        assert!(!report.is_empty());
    }
}

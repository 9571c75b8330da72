use async_trait::async_trait;
use sqlx::SqliteConnection;
use time::OffsetDateTime;
use tokio::sync::watch;

use crate::cache::error::StoreError;
use crate::cache::keys::CacheKey;
use crate::cache::metadata::CacheMetadata;
use crate::domain::entities::{Category, Comment, FetchedBatch, Post, User};
use crate::domain::types::{CommentId, PostId};
use crate::store::{CacheStore, CachedPayload, CachedView, EvictionReport, PostPatch, StoreCounts};

use super::rows::{
    CategoryRow, CommentRow, MetadataRow, POST_COLUMNS, PostRow, UserRow, convert_all,
};
use super::util::{count, from_millis, map_sqlx_error, to_millis};
use super::{
    DETAIL_KEY_SQL, SqliteStore, apply_batch, delete_comments_by_id, delete_posts_cascade,
    expire_keys, upsert_batch,
};

/// Comments beyond the per-post limit bound as the single parameter.
const COMMENT_OVERFLOW_SQL: &str = "SELECT id, post_id FROM ( \
       SELECT id, post_id, ROW_NUMBER() OVER ( \
         PARTITION BY post_id ORDER BY last_sync_time DESC, id DESC \
       ) AS position FROM comments \
     ) WHERE position > ?";

fn check_metadata(metadata: &CacheMetadata) -> Result<(), StoreError> {
    if metadata.expires_at < metadata.last_refresh {
        return Err(StoreError::Integrity(format!(
            "expires_at precedes last_refresh for `{}`",
            metadata.key
        )));
    }
    Ok(())
}

async fn select_metadata(
    conn: &mut SqliteConnection,
    key: &CacheKey,
) -> Result<Option<CacheMetadata>, StoreError> {
    let row = sqlx::query_as::<_, MetadataRow>(
        "SELECT cache_key, last_refresh, expires_at, is_refreshing \
         FROM cache_metadata WHERE cache_key = ?",
    )
    .bind(key.as_storage_key())
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;
    row.map(CacheMetadata::try_from).transpose()
}

async fn upsert_metadata(
    conn: &mut SqliteConnection,
    metadata: &CacheMetadata,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO cache_metadata (cache_key, last_refresh, expires_at, is_refreshing) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(metadata.key.as_storage_key())
    .bind(to_millis(metadata.last_refresh))
    .bind(to_millis(metadata.expires_at))
    .bind(metadata.is_refreshing)
    .execute(&mut *conn)
    .await
    .map(|_| ())
}

async fn select_posts(
    conn: &mut SqliteConnection,
    filter: Option<(&'static str, i64)>,
) -> Result<Vec<Post>, StoreError> {
    let rows = match filter {
        Some((column, value)) => {
            let sql = format!(
                "SELECT {POST_COLUMNS} FROM posts WHERE {column} = ? ORDER BY created_at DESC, id DESC"
            );
            sqlx::query_as::<_, PostRow>(&sql)
                .bind(value)
                .fetch_all(&mut *conn)
                .await
        }
        None => {
            let sql = format!("SELECT {POST_COLUMNS} FROM posts ORDER BY created_at DESC, id DESC");
            sqlx::query_as::<_, PostRow>(&sql)
                .fetch_all(&mut *conn)
                .await
        }
    }
    .map_err(map_sqlx_error)?;
    convert_all(rows)
}

async fn select_payload(
    conn: &mut SqliteConnection,
    key: &CacheKey,
) -> Result<CachedPayload, StoreError> {
    match key {
        CacheKey::AllPosts => Ok(CachedPayload::Posts {
            posts: select_posts(conn, None).await?,
        }),
        CacheKey::AuthorPosts(author) => Ok(CachedPayload::Posts {
            posts: select_posts(conn, Some(("author_id", author.0))).await?,
        }),
        CacheKey::CategoryPosts(category) => Ok(CachedPayload::Posts {
            posts: select_posts(conn, Some(("category_id", category.0))).await?,
        }),
        CacheKey::Categories => {
            let rows = sqlx::query_as::<_, CategoryRow>(
                "SELECT id, name, description, post_count, last_sync_time \
                 FROM categories ORDER BY name, id",
            )
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
            let categories: Vec<Category> = convert_all(rows)?;
            Ok(CachedPayload::Categories { categories })
        }
        CacheKey::PostDetail(id) => {
            let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?");
            let post = sqlx::query_as::<_, PostRow>(&sql)
                .bind(id.0)
                .fetch_optional(&mut *conn)
                .await
                .map_err(map_sqlx_error)?
                .map(Post::try_from)
                .transpose()?;

            let rows = sqlx::query_as::<_, CommentRow>(
                "SELECT id, post_id, author_id, content, created_at, last_sync_time \
                 FROM comments WHERE post_id = ? ORDER BY created_at, id",
            )
            .bind(id.0)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
            let comments: Vec<Comment> = convert_all(rows)?;

            let author = match &post {
                Some(post) => sqlx::query_as::<_, UserRow>(
                    "SELECT id, username, display_name, avatar_url, last_sync_time \
                     FROM users WHERE id = ?",
                )
                .bind(post.author_id.0)
                .fetch_optional(&mut *conn)
                .await
                .map_err(map_sqlx_error)?
                .map(User::try_from)
                .transpose()?,
                None => None,
            };

            Ok(CachedPayload::PostDetail {
                post,
                comments,
                author,
            })
        }
    }
}

async fn select_counts(conn: &mut SqliteConnection) -> Result<StoreCounts, StoreError> {
    let (posts, categories, comments, users, metadata) =
        sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
            "SELECT \
               (SELECT COUNT(*) FROM posts), \
               (SELECT COUNT(*) FROM categories), \
               (SELECT COUNT(*) FROM comments), \
               (SELECT COUNT(*) FROM users), \
               (SELECT COUNT(*) FROM cache_metadata)",
        )
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(StoreCounts {
        posts: count(posts, "posts")?,
        categories: count(categories, "categories")?,
        comments: count(comments, "comments")?,
        users: count(users, "users")?,
        metadata: count(metadata, "cache_metadata")?,
    })
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn load(&self, key: &CacheKey) -> Result<CachedView, StoreError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let metadata = select_metadata(&mut tx, key).await?;
        let payload = select_payload(&mut tx, key).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(CachedView { metadata, payload })
    }

    async fn metadata(&self, key: &CacheKey) -> Result<Option<CacheMetadata>, StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        select_metadata(&mut conn, key).await
    }

    async fn all_metadata(&self) -> Result<Vec<CacheMetadata>, StoreError> {
        let rows = sqlx::query_as::<_, MetadataRow>(
            "SELECT cache_key, last_refresh, expires_at, is_refreshing FROM cache_metadata",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        let mut metadata: Vec<CacheMetadata> = convert_all(rows)?;
        metadata.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(metadata)
    }

    async fn put_metadata(&self, metadata: &CacheMetadata) -> Result<(), StoreError> {
        check_metadata(metadata)?;
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        upsert_metadata(&mut conn, metadata)
            .await
            .map_err(map_sqlx_error)?;
        self.notify();
        Ok(())
    }

    async fn set_refreshing(&self, key: &CacheKey, refreshing: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE cache_metadata SET is_refreshing = ? WHERE cache_key = ?")
            .bind(refreshing)
            .bind(key.as_storage_key())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn reset_refreshing_flags(&self) -> Result<u64, StoreError> {
        let result =
            sqlx::query("UPDATE cache_metadata SET is_refreshing = 0 WHERE is_refreshing = 1")
                .execute(self.pool())
                .await
                .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn commit_refresh(
        &self,
        batch: &FetchedBatch,
        metadata: &CacheMetadata,
    ) -> Result<(), StoreError> {
        check_metadata(metadata)?;
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        apply_batch(&mut tx, batch).await.map_err(map_sqlx_error)?;
        upsert_metadata(&mut tx, metadata)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        self.notify();
        Ok(())
    }

    async fn upsert(&self, batch: &FetchedBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        apply_batch(&mut tx, batch).await.map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        self.notify();
        Ok(())
    }

    async fn add_comment(&self, comment: &Comment) -> Result<bool, StoreError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        // Write first so the transaction holds the write lock before the count is read.
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO comments (id, post_id, author_id, content, created_at, last_sync_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(comment.id.0)
        .bind(comment.post_id.0)
        .bind(comment.author_id.0)
        .bind(&comment.content)
        .bind(to_millis(comment.created_at))
        .bind(to_millis(comment.last_sync_time))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query("UPDATE posts SET comment_count = comment_count + 1 WHERE id = ?")
                .bind(comment.post_id.0)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        } else {
            let batch = FetchedBatch {
                comments: vec![comment.clone()],
                ..Default::default()
            };
            upsert_batch(&mut tx, &batch)
                .await
                .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        self.notify();
        Ok(inserted)
    }

    async fn post(&self, id: PostId) -> Result<Option<Post>, StoreError> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE id = ?");
        sqlx::query_as::<_, PostRow>(&sql)
            .bind(id.0)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)?
            .map(Post::try_from)
            .transpose()
    }

    async fn patch_post(&self, id: PostId, patch: &PostPatch) -> Result<bool, StoreError> {
        let query = match patch {
            PostPatch::CommentCount(count) => {
                sqlx::query("UPDATE posts SET comment_count = ? WHERE id = ?").bind(*count)
            }
            PostPatch::IncrementComments => {
                sqlx::query("UPDATE posts SET comment_count = comment_count + 1 WHERE id = ?")
            }
            PostPatch::Like { liked, like_count } => {
                sqlx::query("UPDATE posts SET liked_by_me = ?, like_count = ? WHERE id = ?")
                    .bind(*liked)
                    .bind(*like_count)
            }
            PostPatch::Image(url) => {
                sqlx::query("UPDATE posts SET image_url = ? WHERE id = ?").bind(url.clone())
            }
        };
        let result = query
            .bind(id.0)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        let patched = result.rows_affected() > 0;
        if patched {
            self.notify();
        }
        Ok(patched)
    }

    async fn delete_posts(&self, ids: &[PostId]) -> Result<EvictionReport, StoreError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let report = delete_posts_cascade(&mut tx, ids)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        if !report.is_empty() {
            self.notify();
        }
        Ok(report)
    }

    async fn delete_comments(&self, ids: &[CommentId]) -> Result<EvictionReport, StoreError> {
        let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let comments = delete_comments_by_id(&mut tx, &raw)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        if comments > 0 {
            self.notify();
        }
        Ok(EvictionReport {
            comments,
            ..Default::default()
        })
    }

    async fn invalidate(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        let expired = expire_keys(&mut conn, &[key.as_storage_key()])
            .await
            .map_err(map_sqlx_error)?
            > 0;
        if expired {
            self.notify();
        }
        Ok(expired)
    }

    async fn delete_metadata(&self, key: &CacheKey) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM cache_metadata WHERE cache_key = ?")
            .bind(key.as_storage_key())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        let removed = result.rows_affected() > 0;
        if removed {
            self.notify();
        }
        Ok(removed)
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        let mut conn = self.pool().acquire().await.map_err(map_sqlx_error)?;
        select_counts(&mut conn).await
    }

    async fn count_comments_for(&self, post: PostId) -> Result<u64, StoreError> {
        let (total,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM comments WHERE post_id = ?")
            .bind(post.0)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        count(total, "comments")
    }

    async fn evict_synced_before(
        &self,
        cutoff: OffsetDateTime,
    ) -> Result<EvictionReport, StoreError> {
        let cutoff = to_millis(cutoff);
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let expired: Vec<(i64,)> = sqlx::query_as("SELECT id FROM posts WHERE last_sync_time < ?")
            .bind(cutoff)
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let expired: Vec<PostId> = expired.into_iter().map(|(id,)| PostId(id)).collect();
        let mut report = delete_posts_cascade(&mut tx, &expired)
            .await
            .map_err(map_sqlx_error)?;

        sqlx::query(&format!(
            "UPDATE cache_metadata SET expires_at = last_refresh WHERE cache_key IN \
             (SELECT {DETAIL_KEY_SQL} FROM comments WHERE last_sync_time < ?)"
        ))
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        for (table, column) in [
            ("comments", "last_sync_time"),
            ("categories", "last_sync_time"),
            ("users", "last_sync_time"),
            ("cache_metadata", "last_refresh"),
        ] {
            let removed = sqlx::query(&format!("DELETE FROM {table} WHERE {column} < ?"))
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
            match table {
                "comments" => report.comments += removed,
                "categories" => report.categories += removed,
                "users" => report.users += removed,
                _ => report.metadata += removed,
            }
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        if !report.is_empty() {
            self.notify();
        }
        Ok(report)
    }

    async fn evict_over_capacity(
        &self,
        max_posts: usize,
        max_comments_per_post: usize,
    ) -> Result<EvictionReport, StoreError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;

        let overflow: Vec<(i64,)> = sqlx::query_as(
            "SELECT id FROM posts ORDER BY last_sync_time DESC, id DESC LIMIT -1 OFFSET ?",
        )
        .bind(i64::try_from(max_posts).unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let overflow: Vec<PostId> = overflow.into_iter().map(|(id,)| PostId(id)).collect();
        let mut report = delete_posts_cascade(&mut tx, &overflow)
            .await
            .map_err(map_sqlx_error)?;

        let max_comments = i64::try_from(max_comments_per_post).unwrap_or(i64::MAX);
        sqlx::query(&format!(
            "UPDATE cache_metadata SET expires_at = last_refresh WHERE cache_key IN \
             (SELECT {DETAIL_KEY_SQL} FROM ({COMMENT_OVERFLOW_SQL}))"
        ))
        .bind(max_comments)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        let comments = sqlx::query(&format!(
            "DELETE FROM comments WHERE id IN (SELECT id FROM ({COMMENT_OVERFLOW_SQL}))"
        ))
        .bind(max_comments)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();
        report.comments += comments;

        tx.commit().await.map_err(map_sqlx_error)?;
        if !report.is_empty() {
            self.notify();
        }
        Ok(report)
    }

    async fn clear_all(&self, cleared_at: OffsetDateTime) -> Result<EvictionReport, StoreError> {
        let mut tx = self.begin().await.map_err(map_sqlx_error)?;
        let mut report = EvictionReport::default();
        for table in ["comments", "posts", "categories", "users", "cache_metadata"] {
            let removed = sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?
                .rows_affected();
            match table {
                "comments" => report.comments = removed,
                "posts" => report.posts = removed,
                "categories" => report.categories = removed,
                "users" => report.users = removed,
                _ => report.metadata = removed,
            }
        }
        sqlx::query(
            "INSERT INTO cache_info (id, last_clear_time) VALUES (1, ?) \
             ON CONFLICT (id) DO UPDATE SET last_clear_time = excluded.last_clear_time",
        )
        .bind(to_millis(cleared_at))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;

        if !report.is_empty() {
            self.notify();
        }
        Ok(report)
    }

    async fn last_clear_time(&self) -> Result<Option<OffsetDateTime>, StoreError> {
        let row: Option<(Option<i64>,)> =
            sqlx::query_as("SELECT last_clear_time FROM cache_info WHERE id = 1")
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_error)?;
        row.and_then(|(millis,)| millis)
            .map(|millis| from_millis(millis, "cache_info.last_clear_time"))
            .transpose()
    }

    fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

//! SQLite-backed cache store.

mod rows;
mod store;
mod util;

pub use util::map_sqlx_error;

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use sqlx::{
    Encode, QueryBuilder, Sqlite, SqliteConnection, Transaction, Type,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};

use crate::cache::keys::CacheKey;
use crate::domain::entities::FetchedBatch;
use crate::domain::types::{CategoryId, PostId, UserId};
use crate::store::{ChangeNotifier, EvictionReport};

use self::util::to_millis;

#[derive(Clone)]
pub struct SqliteStore {
    pool: Arc<SqlitePool>,
    changes: Arc<ChangeNotifier>,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool: Arc::new(pool),
            changes: Arc::new(ChangeNotifier::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Open a pool for `url`, creating the database file when missing.
    ///
    /// Connections are never recycled, so `sqlite::memory:` with a single
    /// connection keeps its contents for the life of the pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
    }

    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
    }

    pub(crate) fn notify(&self) {
        self.changes.notify();
    }
}

async fn upsert_batch(
    conn: &mut SqliteConnection,
    batch: &FetchedBatch,
) -> Result<(), sqlx::Error> {
    for user in &batch.users {
        sqlx::query(
            "INSERT OR REPLACE INTO users (id, username, display_name, avatar_url, last_sync_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(user.id.0)
        .bind(&user.username)
        .bind(&user.display_name)
        .bind(&user.avatar_url)
        .bind(to_millis(user.last_sync_time))
        .execute(&mut *conn)
        .await?;
    }

    for category in &batch.categories {
        sqlx::query(
            "INSERT OR REPLACE INTO categories (id, name, description, post_count, last_sync_time) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(category.id.0)
        .bind(&category.name)
        .bind(&category.description)
        .bind(category.post_count)
        .bind(to_millis(category.last_sync_time))
        .execute(&mut *conn)
        .await?;
    }

    for post in &batch.posts {
        sqlx::query(
            "INSERT OR REPLACE INTO posts (id, title, content, image_url, author_id, category_id, \
             like_count, comment_count, liked_by_me, created_at, updated_at, last_sync_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(post.id.0)
        .bind(&post.title)
        .bind(&post.content)
        .bind(&post.image_url)
        .bind(post.author_id.0)
        .bind(post.category_id.map(|id| id.0))
        .bind(post.like_count)
        .bind(post.comment_count)
        .bind(post.liked_by_me)
        .bind(to_millis(post.created_at))
        .bind(post.updated_at.map(to_millis))
        .bind(to_millis(post.last_sync_time))
        .execute(&mut *conn)
        .await?;
    }

    for comment in &batch.comments {
        sqlx::query(
            "INSERT OR REPLACE INTO comments (id, post_id, author_id, content, created_at, last_sync_time) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(comment.id.0)
        .bind(comment.post_id.0)
        .bind(comment.author_id.0)
        .bind(&comment.content)
        .bind(to_millis(comment.created_at))
        .bind(to_millis(comment.last_sync_time))
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

/// Host parameters bound per statement. SQLite rejects statements with more
/// than 32766.
const BIND_CHUNK: usize = 500;

/// Key of the detail screen for a post, matching the stored `cache_key`.
const DETAIL_KEY_SQL: &str = "'post_detail_' || post_id";

/// Run `<prefix> (v1, v2, ...)<suffix>` once per chunk of `values`, returning
/// the total of affected rows.
async fn execute_in_chunks<T>(
    conn: &mut SqliteConnection,
    prefix: &str,
    values: &[T],
    suffix: &str,
) -> Result<u64, sqlx::Error>
where
    T: for<'q> Encode<'q, Sqlite> + Type<Sqlite> + Clone + Send + 'static,
{
    let mut affected = 0;
    for chunk in values.chunks(BIND_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(prefix);
        qb.push(" (");
        let mut separated = qb.separated(", ");
        for value in chunk {
            separated.push_bind(value.clone());
        }
        separated.push_unseparated(")");
        qb.push(suffix);
        affected += qb.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// Expire metadata rows in place, keeping `last_refresh` and `is_refreshing`.
async fn expire_keys(conn: &mut SqliteConnection, keys: &[String]) -> Result<u64, sqlx::Error> {
    execute_in_chunks(
        conn,
        "UPDATE cache_metadata SET expires_at = last_refresh WHERE cache_key IN",
        keys,
        "",
    )
    .await
}

/// Delete comments by id and expire the detail keys of the posts they were on.
async fn delete_comments_by_id(
    conn: &mut SqliteConnection,
    ids: &[i64],
) -> Result<u64, sqlx::Error> {
    execute_in_chunks(
        conn,
        &format!(
            "UPDATE cache_metadata SET expires_at = last_refresh WHERE cache_key IN \
             (SELECT {DETAIL_KEY_SQL} FROM comments WHERE id IN"
        ),
        ids,
        ")",
    )
    .await?;
    execute_in_chunks(conn, "DELETE FROM comments WHERE id IN", ids, "").await
}

/// Delete posts and every comment that belongs to them.
///
/// Detail metadata of the deleted posts goes with them; the author and
/// category lists they appeared in are expired.
async fn delete_posts_cascade(
    conn: &mut SqliteConnection,
    ids: &[PostId],
) -> Result<EvictionReport, sqlx::Error> {
    let raw: Vec<i64> = ids.iter().map(|id| id.0).collect();

    let mut lists = BTreeSet::new();
    for chunk in raw.chunks(BIND_CHUNK) {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT id, author_id, category_id FROM posts WHERE id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
        let owners: Vec<(i64, i64, Option<i64>)> =
            qb.build_query_as().fetch_all(&mut *conn).await?;
        for (_, author, category) in owners {
            lists.extend(CacheKey::lists_containing(
                UserId(author),
                category.map(CategoryId),
            ));
        }
    }

    let comments =
        execute_in_chunks(conn, "DELETE FROM comments WHERE post_id IN", &raw, "").await?;
    let posts = execute_in_chunks(conn, "DELETE FROM posts WHERE id IN", &raw, "").await?;

    let details: Vec<String> = ids
        .iter()
        .map(|id| CacheKey::PostDetail(*id).as_storage_key())
        .collect();
    let metadata = execute_in_chunks(
        conn,
        "DELETE FROM cache_metadata WHERE cache_key IN",
        &details,
        "",
    )
    .await?;
    let lists: Vec<String> = lists.iter().map(CacheKey::as_storage_key).collect();
    expire_keys(conn, &lists).await?;

    Ok(EvictionReport {
        posts,
        comments,
        metadata,
        ..Default::default()
    })
}

/// Delete the batch's removed posts, then upsert its rows.
async fn apply_batch(
    conn: &mut SqliteConnection,
    batch: &FetchedBatch,
) -> Result<EvictionReport, sqlx::Error> {
    let report = delete_posts_cascade(conn, &batch.removed_posts).await?;
    upsert_batch(conn, batch).await?;
    Ok(report)
}

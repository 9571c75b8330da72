use crate::cache::error::StoreError;
use crate::cache::keys::CacheKey;
use crate::cache::metadata::CacheMetadata;
use crate::domain::entities::{Category, Comment, Post, User};
use crate::domain::types::{CategoryId, CommentId, PostId, UserId};

use super::util::from_millis;

pub(super) const POST_COLUMNS: &str = "id, title, content, image_url, author_id, category_id, \
    like_count, comment_count, liked_by_me, created_at, updated_at, last_sync_time";

#[derive(sqlx::FromRow)]
pub(super) struct PostRow {
    id: i64,
    title: String,
    content: String,
    image_url: Option<String>,
    author_id: i64,
    category_id: Option<i64>,
    like_count: i64,
    comment_count: i64,
    liked_by_me: bool,
    created_at: i64,
    updated_at: Option<i64>,
    last_sync_time: i64,
}

impl TryFrom<PostRow> for Post {
    type Error = StoreError;

    fn try_from(row: PostRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: PostId(row.id),
            title: row.title,
            content: row.content,
            image_url: row.image_url,
            author_id: UserId(row.author_id),
            category_id: row.category_id.map(CategoryId),
            like_count: row.like_count,
            comment_count: row.comment_count,
            liked_by_me: row.liked_by_me,
            created_at: from_millis(row.created_at, "posts.created_at")?,
            updated_at: row
                .updated_at
                .map(|millis| from_millis(millis, "posts.updated_at"))
                .transpose()?,
            last_sync_time: from_millis(row.last_sync_time, "posts.last_sync_time")?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct CategoryRow {
    id: i64,
    name: String,
    description: Option<String>,
    post_count: i64,
    last_sync_time: i64,
}

impl TryFrom<CategoryRow> for Category {
    type Error = StoreError;

    fn try_from(row: CategoryRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: CategoryId(row.id),
            name: row.name,
            description: row.description,
            post_count: row.post_count,
            last_sync_time: from_millis(row.last_sync_time, "categories.last_sync_time")?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct CommentRow {
    id: i64,
    post_id: i64,
    author_id: i64,
    content: String,
    created_at: i64,
    last_sync_time: i64,
}

impl TryFrom<CommentRow> for Comment {
    type Error = StoreError;

    fn try_from(row: CommentRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: CommentId(row.id),
            post_id: PostId(row.post_id),
            author_id: UserId(row.author_id),
            content: row.content,
            created_at: from_millis(row.created_at, "comments.created_at")?,
            last_sync_time: from_millis(row.last_sync_time, "comments.last_sync_time")?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct UserRow {
    id: i64,
    username: String,
    display_name: Option<String>,
    avatar_url: Option<String>,
    last_sync_time: i64,
}

impl TryFrom<UserRow> for User {
    type Error = StoreError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: UserId(row.id),
            username: row.username,
            display_name: row.display_name,
            avatar_url: row.avatar_url,
            last_sync_time: from_millis(row.last_sync_time, "users.last_sync_time")?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(super) struct MetadataRow {
    cache_key: String,
    last_refresh: i64,
    expires_at: i64,
    is_refreshing: bool,
}

impl TryFrom<MetadataRow> for CacheMetadata {
    type Error = StoreError;

    fn try_from(row: MetadataRow) -> Result<Self, Self::Error> {
        let key: CacheKey = row
            .cache_key
            .parse()
            .map_err(|err| StoreError::corrupt(format!("cache_metadata.cache_key: {err}")))?;
        Ok(Self {
            key,
            last_refresh: from_millis(row.last_refresh, "cache_metadata.last_refresh")?,
            expires_at: from_millis(row.expires_at, "cache_metadata.expires_at")?,
            is_refreshing: row.is_refreshing,
        })
    }
}

pub(super) fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, StoreError>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

//! Cached domain entities mirrored from the blog backend.
//!
//! Every row carries `last_sync_time`, the instant it was last written from the
//! network. The backend never sends that field; the refresh path stamps it.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::types::{CategoryId, CommentId, PostId, UserId};

fn unsynced() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub author_id: UserId,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    #[serde(default)]
    pub liked_by_me: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339", default = "unsynced")]
    pub last_sync_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub post_count: i64,
    #[serde(with = "time::serde::rfc3339", default = "unsynced")]
    pub last_sync_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,
    pub author_id: UserId,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339", default = "unsynced")]
    pub last_sync_time: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(with = "time::serde::rfc3339", default = "unsynced")]
    pub last_sync_time: OffsetDateTime,
}

/// Rows returned by one network fetch for a cache key.
///
/// A single refresh may write several entity kinds: a post detail brings the
/// post, its comments and its author. `removed_posts` lists posts the server
/// reported as gone; committing the batch deletes them with their comments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedBatch {
    pub posts: Vec<Post>,
    pub categories: Vec<Category>,
    pub comments: Vec<Comment>,
    pub users: Vec<User>,
    pub removed_posts: Vec<PostId>,
}

impl FetchedBatch {
    pub fn posts(posts: Vec<Post>) -> Self {
        Self {
            posts,
            ..Default::default()
        }
    }

    pub fn categories(categories: Vec<Category>) -> Self {
        Self {
            categories,
            ..Default::default()
        }
    }

    /// The server no longer has post `id`.
    pub fn gone(id: PostId) -> Self {
        Self {
            removed_posts: vec![id],
            ..Default::default()
        }
    }

    /// Overwrite `last_sync_time` on every row with the refresh instant.
    pub fn stamp(&mut self, synced_at: OffsetDateTime) {
        for post in &mut self.posts {
            post.last_sync_time = synced_at;
        }
        for category in &mut self.categories {
            category.last_sync_time = synced_at;
        }
        for comment in &mut self.comments {
            comment.last_sync_time = synced_at;
        }
        for user in &mut self.users {
            user.last_sync_time = synced_at;
        }
    }

    /// Rows written by the batch; removals are not counted.
    pub fn row_count(&self) -> usize {
        self.posts.len() + self.categories.len() + self.comments.len() + self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0 && self.removed_posts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn post_deserializes_without_sync_time() {
        let json = r#"{
            "id": 7,
            "title": "Hello",
            "content": "Body",
            "author_id": 3,
            "category_id": 2,
            "like_count": 4,
            "created_at": "2024-05-01T10:00:00Z"
        }"#;

        let post: Post = serde_json::from_str(json).expect("post json");
        assert_eq!(post.id, PostId(7));
        assert_eq!(post.category_id, Some(CategoryId(2)));
        assert_eq!(post.comment_count, 0);
        assert!(post.updated_at.is_none());
        assert_eq!(post.last_sync_time, OffsetDateTime::UNIX_EPOCH);
    }

    #[test]
    fn stamp_overwrites_every_row() {
        let created = datetime!(2024-05-01 10:00 UTC);
        let mut batch = FetchedBatch {
            posts: vec![Post {
                id: PostId(1),
                title: "t".into(),
                content: "c".into(),
                image_url: None,
                author_id: UserId(1),
                category_id: None,
                like_count: 0,
                comment_count: 0,
                liked_by_me: false,
                created_at: created,
                updated_at: None,
                last_sync_time: unsynced(),
            }],
            comments: vec![Comment {
                id: CommentId(9),
                post_id: PostId(1),
                author_id: UserId(2),
                content: "nice".into(),
                created_at: created,
                last_sync_time: unsynced(),
            }],
            ..Default::default()
        };

        let synced = datetime!(2024-06-01 00:00 UTC);
        batch.stamp(synced);

        assert_eq!(batch.posts[0].last_sync_time, synced);
        assert_eq!(batch.comments[0].last_sync_time, synced);
        assert_eq!(batch.row_count(), 2);
    }

    #[test]
    fn tombstone_batch_is_not_empty() {
        let batch = FetchedBatch::gone(PostId(4));
        assert_eq!(batch.row_count(), 0);
        assert!(!batch.is_empty());
        assert!(FetchedBatch::default().is_empty());
    }
}

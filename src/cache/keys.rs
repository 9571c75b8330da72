//! Cache key definitions.
//!
//! A `CacheKey` names one logical slice of cached data. Each key belongs to a
//! `KeyClass`, which selects its freshness policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::{CategoryId, PostId, UserId};

const ALL_POSTS: &str = "all_posts";
const CATEGORIES: &str = "categories";
const POST_DETAIL_PREFIX: &str = "post_detail_";
const AUTHOR_POSTS_PREFIX: &str = "author_posts_";
const CATEGORY_POSTS_PREFIX: &str = "category_posts_";

/// Logical identifier for a class of cached data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheKey {
    /// Home feed: every cached post.
    AllPosts,
    /// Category list.
    Categories,
    /// A single post with its comments and author.
    PostDetail(PostId),
    /// Posts written by one user.
    AuthorPosts(UserId),
    /// Posts filed under one category.
    CategoryPosts(CategoryId),
}

/// Groups keys that share one freshness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyClass {
    Posts,
    Categories,
    PostDetail,
    AuthorPosts,
    CategoryPosts,
}

impl KeyClass {
    pub const ALL: [KeyClass; 5] = [
        KeyClass::Posts,
        KeyClass::Categories,
        KeyClass::PostDetail,
        KeyClass::AuthorPosts,
        KeyClass::CategoryPosts,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KeyClass::Posts => "posts",
            KeyClass::Categories => "categories",
            KeyClass::PostDetail => "post_detail",
            KeyClass::AuthorPosts => "author_posts",
            KeyClass::CategoryPosts => "category_posts",
        }
    }
}

impl CacheKey {
    /// Keys refreshed by every background sync.
    pub const TOP_LEVEL: [CacheKey; 2] = [CacheKey::AllPosts, CacheKey::Categories];

    pub fn class(&self) -> KeyClass {
        match self {
            CacheKey::AllPosts => KeyClass::Posts,
            CacheKey::Categories => KeyClass::Categories,
            CacheKey::PostDetail(_) => KeyClass::PostDetail,
            CacheKey::AuthorPosts(_) => KeyClass::AuthorPosts,
            CacheKey::CategoryPosts(_) => KeyClass::CategoryPosts,
        }
    }

    /// Filtered list keys whose rows include a post by `author` filed under
    /// `category`. The feed (`all_posts`) is not included.
    pub fn lists_containing(author: UserId, category: Option<CategoryId>) -> Vec<CacheKey> {
        let mut keys = vec![CacheKey::AuthorPosts(author)];
        keys.extend(category.map(CacheKey::CategoryPosts));
        keys
    }

    /// Stored form of the key, e.g. `post_detail_42`.
    pub fn as_storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::AllPosts => f.write_str(ALL_POSTS),
            CacheKey::Categories => f.write_str(CATEGORIES),
            CacheKey::PostDetail(id) => write!(f, "{POST_DETAIL_PREFIX}{id}"),
            CacheKey::AuthorPosts(id) => write!(f, "{AUTHOR_POSTS_PREFIX}{id}"),
            CacheKey::CategoryPosts(id) => write!(f, "{CATEGORY_POSTS_PREFIX}{id}"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognised cache key `{0}`")]
pub struct ParseKeyError(pub String);

impl FromStr for CacheKey {
    type Err = ParseKeyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        match trimmed {
            ALL_POSTS => return Ok(CacheKey::AllPosts),
            CATEGORIES => return Ok(CacheKey::Categories),
            _ => {}
        }

        let parse_id = |rest: &str| -> Result<i64, ParseKeyError> {
            rest.parse::<i64>()
                .map_err(|_| ParseKeyError(trimmed.to_string()))
        };

        if let Some(rest) = trimmed.strip_prefix(POST_DETAIL_PREFIX) {
            return Ok(CacheKey::PostDetail(PostId(parse_id(rest)?)));
        }
        if let Some(rest) = trimmed.strip_prefix(AUTHOR_POSTS_PREFIX) {
            return Ok(CacheKey::AuthorPosts(UserId(parse_id(rest)?)));
        }
        if let Some(rest) = trimmed.strip_prefix(CATEGORY_POSTS_PREFIX) {
            return Ok(CacheKey::CategoryPosts(CategoryId(parse_id(rest)?)));
        }

        Err(ParseKeyError(trimmed.to_string()))
    }
}

impl Serialize for CacheKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CacheKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

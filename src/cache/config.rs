//! Cache configuration.
//!
//! Defaults are named constants; the binary may override them from
//! the `[cache]` table of `postcache.toml`.

use std::time::Duration;

use thiserror::Error;

use super::keys::KeyClass;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_MAX_CACHED_POSTS: usize = 200;
pub const DEFAULT_MAX_CACHED_COMMENTS_PER_POST: usize = 100;
pub const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

pub const POSTS_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const POSTS_EXPIRY: Duration = Duration::from_secs(30 * 60);
pub const CATEGORIES_STALE_THRESHOLD: Duration = HOUR;
pub const CATEGORIES_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);
pub const POST_DETAIL_STALE_THRESHOLD: Duration = MINUTE;
pub const POST_DETAIL_EXPIRY: Duration = Duration::from_secs(5 * 60);
pub const AUTHOR_POSTS_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const AUTHOR_POSTS_EXPIRY: Duration = Duration::from_secs(30 * 60);
pub const CATEGORY_POSTS_STALE_THRESHOLD: Duration = Duration::from_secs(5 * 60);
pub const CATEGORY_POSTS_EXPIRY: Duration = Duration::from_secs(30 * 60);

/// How long data for one key class stays fresh, and when it becomes unusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    /// Age after which data is served but a background refresh is kicked.
    pub stale_threshold: Duration,
    /// Age after which a blocking refresh is required.
    pub expiry: Duration,
}

impl FreshnessPolicy {
    pub const fn new(stale_threshold: Duration, expiry: Duration) -> Self {
        Self {
            stale_threshold,
            expiry,
        }
    }

    pub fn validate(&self, class: KeyClass) -> Result<(), ConfigError> {
        if self.expiry.is_zero() {
            return Err(ConfigError::ZeroExpiry { class });
        }
        if self.stale_threshold > self.expiry {
            return Err(ConfigError::StaleAfterExpiry { class });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassPolicies {
    pub posts: FreshnessPolicy,
    pub categories: FreshnessPolicy,
    pub post_detail: FreshnessPolicy,
    pub author_posts: FreshnessPolicy,
    pub category_posts: FreshnessPolicy,
}

impl Default for ClassPolicies {
    fn default() -> Self {
        Self {
            posts: FreshnessPolicy::new(POSTS_STALE_THRESHOLD, POSTS_EXPIRY),
            categories: FreshnessPolicy::new(CATEGORIES_STALE_THRESHOLD, CATEGORIES_EXPIRY),
            post_detail: FreshnessPolicy::new(POST_DETAIL_STALE_THRESHOLD, POST_DETAIL_EXPIRY),
            author_posts: FreshnessPolicy::new(AUTHOR_POSTS_STALE_THRESHOLD, AUTHOR_POSTS_EXPIRY),
            category_posts: FreshnessPolicy::new(
                CATEGORY_POSTS_STALE_THRESHOLD,
                CATEGORY_POSTS_EXPIRY,
            ),
        }
    }
}

impl ClassPolicies {
    pub fn get(&self, class: KeyClass) -> FreshnessPolicy {
        match class {
            KeyClass::Posts => self.posts,
            KeyClass::Categories => self.categories,
            KeyClass::PostDetail => self.post_detail,
            KeyClass::AuthorPosts => self.author_posts,
            KeyClass::CategoryPosts => self.category_posts,
        }
    }

    pub fn set(&mut self, class: KeyClass, policy: FreshnessPolicy) {
        match class {
            KeyClass::Posts => self.posts = policy,
            KeyClass::Categories => self.categories = policy,
            KeyClass::PostDetail => self.post_detail = policy,
            KeyClass::AuthorPosts => self.author_posts = policy,
            KeyClass::CategoryPosts => self.category_posts = policy,
        }
    }
}

/// Cache core configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub policies: ClassPolicies,
    /// Upper bound on cached posts across all keys.
    pub max_cached_posts: usize,
    /// Upper bound on cached comments for a single post.
    pub max_cached_comments_per_post: usize,
    /// Rows not synced within this window are purged regardless of capacity.
    pub retention_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policies: ClassPolicies::default(),
            max_cached_posts: DEFAULT_MAX_CACHED_POSTS,
            max_cached_comments_per_post: DEFAULT_MAX_CACHED_COMMENTS_PER_POST,
            retention_window: DEFAULT_RETENTION_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expiry for `{}` must be greater than zero", class.as_str())]
    ZeroExpiry { class: KeyClass },
    #[error("stale threshold for `{}` exceeds its expiry", class.as_str())]
    StaleAfterExpiry { class: KeyClass },
    #[error("retention window must be at least the longest expiry ({longest_expiry:?})")]
    RetentionTooShort { longest_expiry: Duration },
    #[error("`{key}` must be greater than zero")]
    ZeroLimit { key: &'static str },
}

impl CacheConfig {
    pub fn policy(&self, class: KeyClass) -> FreshnessPolicy {
        self.policies.get(class)
    }

    pub fn longest_expiry(&self) -> Duration {
        KeyClass::ALL
            .iter()
            .map(|class| self.policy(*class).expiry)
            .max()
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for class in KeyClass::ALL {
            self.policy(class).validate(class)?;
        }
        if self.max_cached_posts == 0 {
            return Err(ConfigError::ZeroLimit {
                key: "max_cached_posts",
            });
        }
        if self.max_cached_comments_per_post == 0 {
            return Err(ConfigError::ZeroLimit {
                key: "max_cached_comments_per_post",
            });
        }
        let longest_expiry = self.longest_expiry();
        if self.retention_window < longest_expiry {
            return Err(ConfigError::RetentionTooShort { longest_expiry });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.max_cached_posts, 200);
        assert_eq!(config.max_cached_comments_per_post, 100);
        assert_eq!(config.retention_window, Duration::from_secs(86_400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn categories_outlive_post_detail() {
        let config = CacheConfig::default();
        assert!(
            config.policy(KeyClass::Categories).expiry > config.policy(KeyClass::PostDetail).expiry
        );
    }

    #[test]
    fn stale_threshold_may_be_zero() {
        let policy = FreshnessPolicy::new(Duration::ZERO, Duration::from_millis(3_600_000));
        assert!(policy.validate(KeyClass::Categories).is_ok());
    }

    #[test]
    fn rejects_stale_after_expiry() {
        let mut config = CacheConfig::default();
        config.policies.set(
            KeyClass::Posts,
            FreshnessPolicy::new(Duration::from_secs(10), Duration::from_secs(5)),
        );
        assert_eq!(
            config.validate(),
            Err(ConfigError::StaleAfterExpiry {
                class: KeyClass::Posts
            })
        );
    }

    #[test]
    fn rejects_retention_shorter_than_expiry() {
        let config = CacheConfig {
            retention_window: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RetentionTooShort { .. })
        ));
    }

    #[test]
    fn rejects_zero_limits() {
        let config = CacheConfig {
            max_cached_posts: 0,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ZeroLimit {
                key: "max_cached_posts"
            })
        );
    }
}

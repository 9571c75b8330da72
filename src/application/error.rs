use thiserror::Error;

use crate::{cache::CacheError, config::LoadError, infra::error::InfraError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("sync failed after {attempts} attempt(s): {source}")]
    Sync { attempts: u32, source: CacheError },
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit status for this error. Network failures are temporary
    /// (75, `EX_TEMPFAIL`) so supervisors may retry; configuration problems
    /// use 78 (`EX_CONFIG`).
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Cache(err) if err.is_retryable() => 75,
            AppError::Sync { source, .. } if source.is_retryable() => 75,
            AppError::Infra(err) if err.is_misconfiguration() => 78,
            AppError::Config(_) | AppError::Validation(_) => 78,
            AppError::Cache(_)
            | AppError::Sync { .. }
            | AppError::Infra(_)
            | AppError::Unexpected(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, FetchError, StoreError};

    #[test]
    fn exit_codes_separate_temporary_failures() {
        let network = AppError::from(CacheError::network(
            &CacheKey::AllPosts,
            "refresh",
            FetchError::Timeout,
        ));
        assert_eq!(network.exit_code(), 75);

        let store = AppError::from(CacheError::store(
            None,
            "load",
            StoreError::backend("locked"),
        ));
        assert_eq!(store.exit_code(), 1);

        let sync = AppError::Sync {
            attempts: 3,
            source: CacheError::network(&CacheKey::AllPosts, "refresh", FetchError::Timeout),
        };
        assert_eq!(sync.exit_code(), 75);
        assert!(sync.to_string().starts_with("sync failed after 3 attempt(s): "));
        let sync = AppError::Sync {
            attempts: 1,
            source: CacheError::store(None, "evict", StoreError::backend("disk full")),
        };
        assert_eq!(sync.exit_code(), 1);

        assert_eq!(AppError::validation("missing key").exit_code(), 78);

        let endpoint = AppError::from(InfraError::endpoint("ftp:/nowhere", "unsupported scheme"));
        assert_eq!(endpoint.exit_code(), 78);
        assert_eq!(
            AppError::from(InfraError::Migrate("checksum mismatch".into())).exit_code(),
            1
        );
    }

    #[test]
    fn cache_errors_display_transparently() {
        let err = AppError::from(CacheError::coordination(
            &CacheKey::Categories,
            "task panicked",
        ));
        assert_eq!(
            err.to_string(),
            "refresh coordination for `categories` failed: task panicked"
        );
    }
}

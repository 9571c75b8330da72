//! Error types for the cache core.
//!
//! Missing or expired data is never an error; these types cover genuine I/O
//! failures only. Every type is `Clone` because one refresh outcome is handed
//! to every caller that joined it.

use thiserror::Error;

use super::keys::CacheKey;

/// Failure reported by a [`crate::remote::RemoteSource`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("no connectivity: {0}")]
    Connectivity(String),
    #[error("unexpected status {status}")]
    Status { status: u16 },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Failure reported by a [`crate::store::CacheStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
    #[error("integrity error: {0}")]
    Integrity(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt(message.into())
    }
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("network fetch for `{key}` failed during {op}: {source}")]
    Network {
        key: CacheKey,
        op: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("store operation {op} failed{}: {source}", key_suffix(.key.as_ref()))]
    Store {
        key: Option<CacheKey>,
        op: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("refresh coordination for `{key}` failed: {message}")]
    Coordination { key: CacheKey, message: String },
}

fn key_suffix(key: Option<&CacheKey>) -> String {
    key.map(|key| format!(" for `{key}`")).unwrap_or_default()
}

impl CacheError {
    pub fn network(key: &CacheKey, op: &'static str, source: FetchError) -> Self {
        Self::Network {
            key: key.clone(),
            op,
            source,
        }
    }

    pub fn store(key: Option<&CacheKey>, op: &'static str, source: StoreError) -> Self {
        Self::Store {
            key: key.cloned(),
            op,
            source,
        }
    }

    pub fn coordination(key: &CacheKey, message: impl Into<String>) -> Self {
        Self::Coordination {
            key: key.clone(),
            message: message.into(),
        }
    }

    /// Network failures and lost refresh tasks are worth retrying; local store
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. } | Self::Coordination { .. })
    }

    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            Self::Network { key, .. } | Self::Coordination { key, .. } => Some(key),
            Self::Store { key, .. } => key.as_ref(),
        }
    }
}

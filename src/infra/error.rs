use thiserror::Error;

/// Failures while bringing up the process around the cache core.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to open cache database `{url}`: {message}")]
    Open { url: String, message: String },
    #[error("cache schema migration failed: {0}")]
    Migrate(String),
    #[error("invalid api endpoint `{base_url}`: {message}")]
    Endpoint { base_url: String, message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
}

impl InfraError {
    pub fn open(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Open {
            url: url.into(),
            message: err.to_string(),
        }
    }

    pub fn endpoint(base_url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Endpoint {
            base_url: base_url.into(),
            message: err.to_string(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    /// Settings named something that cannot work; retrying will not help.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::Endpoint { .. } | Self::Open { .. })
    }
}

impl From<sqlx::migrate::MigrateError> for InfraError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Migrate(err.to_string())
    }
}

use std::time::Duration;

use thiserror::Error;

/// Upstream providers this service talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    Chat,
    Embedding,
    Llm,
    Vector,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Chat => "chat",
            Provider::Embedding => "embedding",
            Provider::Llm => "llm",
            Provider::Vector => "vector",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy shared by every component.
///
/// Each variant carries enough context to decide how the caller should react:
/// [`Error::retryable`] drives the pipeline's retry loops, [`Error::is_fatal`]
/// aborts the current ingestion run, and the request server maps variants to
/// JSON-RPC error codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{provider} rejected credentials: {detail}")]
    AuthUpstream { provider: Provider, detail: String },

    #[error("authentication failed")]
    AuthClient,

    #[error("session invalid or expired")]
    SessionInvalid,

    #[error("{provider} throttled after retries")]
    UpstreamThrottled {
        provider: Provider,
        retry_after: Option<Duration>,
    },

    #[error("{provider} request timed out")]
    UpstreamTimeout { provider: Provider },

    #[error("{provider} returned an invalid response: {detail}")]
    UpstreamInvalid { provider: Provider, detail: String },

    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("failed to persist state: {0}")]
    PersistenceWrite(String),

    #[error("service not ready")]
    NotReady,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Stable kind label used in run reports and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::AuthUpstream { .. } => "auth_upstream",
            Error::AuthClient => "auth_client",
            Error::SessionInvalid => "session_invalid",
            Error::UpstreamThrottled { .. } => "upstream_throttled",
            Error::UpstreamTimeout { .. } => "upstream_timeout",
            Error::UpstreamInvalid { .. } => "upstream_invalid",
            Error::DimensionMismatch { .. } => "dimension_mismatch",
            Error::PersistenceWrite(_) => "persistence_write",
            Error::NotReady => "not_ready",
            Error::Internal(_) => "internal",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Error::UpstreamThrottled { .. }
                | Error::UpstreamTimeout { .. }
                | Error::PersistenceWrite(_)
        )
    }

    /// Fatal errors abort the entire ingestion run without advancing
    /// checkpoints.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::AuthUpstream { .. } | Error::DimensionMismatch { .. }
        )
    }

    /// The provider this error originated from, when there is one.
    pub fn provider(&self) -> Option<Provider> {
        match self {
            Error::AuthUpstream { provider, .. }
            | Error::UpstreamThrottled { provider, .. }
            | Error::UpstreamTimeout { provider }
            | Error::UpstreamInvalid { provider, .. } => Some(*provider),
            _ => None,
        }
    }

    /// Classify a transport error from a specific provider.
    pub fn from_reqwest(provider: Provider, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::UpstreamTimeout { provider }
        } else {
            Error::UpstreamInvalid {
                provider,
                detail: err.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::UpstreamTimeout {
            provider: Provider::Chat
        }
        .retryable());
        assert!(!Error::AuthClient.retryable());
        assert!(!Error::DimensionMismatch {
            expected: 1536,
            got: 768
        }
        .retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::DimensionMismatch {
            expected: 1536,
            got: 768
        }
        .is_fatal());
        assert!(Error::Config("missing".into()).is_fatal());
        assert!(!Error::UpstreamThrottled {
            provider: Provider::Embedding,
            retry_after: None
        }
        .is_fatal());
    }
}

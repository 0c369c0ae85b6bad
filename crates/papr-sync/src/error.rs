//! Error types for the remote API and the sync coordinator.

use papr_embeddings::EmbeddingError;
use papr_types::ErrorKind;
use papr_vector::VectorError;
use thiserror::Error;

/// Errors from the remote memory service.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// No API key or base URL
    #[error("Remote memory service not configured: {0}")]
    NotConfigured(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Request exceeded the HTTP timeout
    #[error("Request timed out")]
    Timeout,

    /// Response body did not parse
    #[error("Failed to decode response: {0}")]
    Decode(String),

    /// HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl ApiError {
    /// Worth retrying: 5xx, 429 and connection failures. Timeouts are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ApiError::Http { status, .. } => *status == 429 || *status >= 500,
            ApiError::Network(_) => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NotConfigured(_) | ApiError::Client(_) => ErrorKind::ConfigMissing,
            _ => ErrorKind::RemoteHttpError,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout
        } else if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ApiError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

/// Errors from a sync cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Retries exhausted; the coordinator is degraded
    #[error("Sync degraded after {attempts} attempts: {source}")]
    Degraded { attempts: u32, source: ApiError },

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// The user context changed while the sync was running
    #[error("User context changed (sync for version {expected}, current {current})")]
    StaleContext { expected: u64, current: u64 },

    /// No user context to sync for
    #[error("User context not set")]
    NoContext,

    #[error("Sync timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Vector(e) => e.kind(),
            SyncError::Api(ApiError::NotConfigured(_)) | SyncError::NoContext => {
                ErrorKind::ConfigMissing
            }
            _ => ErrorKind::SyncDegraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let http = |status| ApiError::Http {
            status,
            message: String::new(),
        };
        assert!(http(500).is_transient());
        assert!(http(503).is_transient());
        assert!(http(429).is_transient());
        assert!(!http(400).is_transient());
        assert!(!http(404).is_transient());
        assert!(ApiError::Network("reset".into()).is_transient());
        assert!(!ApiError::Timeout.is_transient());
        assert!(!ApiError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn test_kinds() {
        assert_eq!(
            ApiError::NotConfigured("x".into()).kind(),
            ErrorKind::ConfigMissing
        );
        assert_eq!(ApiError::Timeout.kind(), ErrorKind::RemoteHttpError);
        assert_eq!(
            SyncError::Degraded {
                attempts: 5,
                source: ApiError::Network("x".into())
            }
            .kind(),
            ErrorKind::SyncDegraded
        );
        assert_eq!(
            SyncError::StaleContext {
                expected: 1,
                current: 2
            }
            .kind(),
            ErrorKind::SyncDegraded
        );
        assert_eq!(
            SyncError::Vector(VectorError::Corrupt("x".into())).kind(),
            ErrorKind::VectorStoreCorrupt
        );
    }
}

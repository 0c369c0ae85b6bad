//! Retrieval and telemetry error types.

use papr_embeddings::EmbeddingError;
use papr_sync::ApiError;
use papr_types::ErrorKind;
use papr_vector::VectorError;
use thiserror::Error;

pub const REMOTE_NOT_CONFIGURED: &str = "remote memory service not configured";

/// Errors from a search call.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// End-to-end deadline exceeded
    #[error("Search timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// Remote search failed or is unavailable
    #[error("Remote search failed: {message}")]
    RemoteHttp {
        status: Option<u16>,
        message: String,
    },

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Vector query failed: {0}")]
    Vector(#[from] VectorError),

    /// Both tier queries failed, or one failed and the other found nothing
    #[error("Local search failed: {0}")]
    LocalFailed(String),
}

impl RetrievalError {
    pub fn remote_not_configured() -> Self {
        RetrievalError::RemoteHttp {
            status: None,
            message: REMOTE_NOT_CONFIGURED.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RetrievalError::Timeout { .. } => ErrorKind::SearchTimeout,
            RetrievalError::RemoteHttp { .. } => ErrorKind::RemoteHttpError,
            RetrievalError::Embedding(e) => e.kind(),
            RetrievalError::Vector(e) => e.kind(),
            RetrievalError::LocalFailed(_) => ErrorKind::VectorStoreCorrupt,
        }
    }

    /// Collapse into one of the two errors callers may see.
    pub fn into_user_facing(self) -> Self {
        match self {
            e @ (RetrievalError::Timeout { .. } | RetrievalError::RemoteHttp { .. }) => e,
            other => RetrievalError::RemoteHttp {
                status: None,
                message: format!("{}; {}", REMOTE_NOT_CONFIGURED, other),
            },
        }
    }
}

impl From<ApiError> for RetrievalError {
    fn from(e: ApiError) -> Self {
        RetrievalError::RemoteHttp {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

/// Errors from the telemetry sink. Never surfaced to search callers.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Endpoint or credentials absent
    #[error("Telemetry not configured: {0}")]
    NotConfigured(String),

    #[error("Telemetry HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Telemetry request failed: {0}")]
    Request(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TelemetryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TelemetryError::NotConfigured(_) => ErrorKind::ConfigMissing,
            _ => ErrorKind::RemoteHttpError,
        }
    }
}

impl From<reqwest::Error> for TelemetryError {
    fn from(e: reqwest::Error) -> Self {
        TelemetryError::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_keeps_status() {
        let err = RetrievalError::from(ApiError::Http {
            status: 502,
            message: "bad gateway".into(),
        });
        assert!(matches!(
            err,
            RetrievalError::RemoteHttp {
                status: Some(502),
                ..
            }
        ));
        assert_eq!(err.kind(), ErrorKind::RemoteHttpError);
    }

    #[test]
    fn test_user_facing_collapses_local_errors() {
        let err = RetrievalError::LocalFailed("both tiers".into()).into_user_facing();
        match err {
            RetrievalError::RemoteHttp { status, message } => {
                assert_eq!(status, None);
                assert!(message.starts_with(REMOTE_NOT_CONFIGURED));
            }
            other => panic!("unexpected {other:?}"),
        }

        let timeout = RetrievalError::Timeout { elapsed_ms: 5 }.into_user_facing();
        assert_eq!(timeout.kind(), ErrorKind::SearchTimeout);
    }

    #[test]
    fn test_telemetry_kinds() {
        assert_eq!(
            TelemetryError::NotConfigured("x".into()).kind(),
            ErrorKind::ConfigMissing
        );
    }
}

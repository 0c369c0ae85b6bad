//! Error types for the Papr client.

use thiserror::Error;

use papr_retrieval::RetrievalError;
use papr_sync::{ApiError, SyncError};
use papr_types::{ErrorKind, PaprError};
use papr_vector::VectorError;

/// Errors that can occur when using the client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Search exceeded its deadline
    #[error("Search timed out after {elapsed_ms} ms")]
    SearchTimeout { elapsed_ms: u64 },

    /// Remote memory service failed or is not configured
    #[error("Remote memory service error: {message}")]
    RemoteHttp {
        status: Option<u16>,
        message: String,
    },

    /// Settings failed to load or validate
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local store could not be opened or cleared
    #[error("Vector store error: {0}")]
    Store(#[from] VectorError),

    /// Explicit sync request failed
    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    /// Background task failed to join
    #[error("Background task failed: {0}")]
    Task(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::SearchTimeout { .. } => ErrorKind::SearchTimeout,
            ClientError::RemoteHttp { .. } => ErrorKind::RemoteHttpError,
            ClientError::Config(_) => ErrorKind::ConfigMissing,
            ClientError::Store(e) => e.kind(),
            ClientError::Sync(e) => e.kind(),
            ClientError::Task(_) => ErrorKind::InferenceFailed,
        }
    }

    /// HTTP status of a remote failure, when one was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::RemoteHttp { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<RetrievalError> for ClientError {
    fn from(e: RetrievalError) -> Self {
        match e.into_user_facing() {
            RetrievalError::Timeout { elapsed_ms } => ClientError::SearchTimeout { elapsed_ms },
            RetrievalError::RemoteHttp { status, message } => {
                ClientError::RemoteHttp { status, message }
            }
            other => ClientError::RemoteHttp {
                status: None,
                message: other.to_string(),
            },
        }
    }
}

impl From<ApiError> for ClientError {
    fn from(e: ApiError) -> Self {
        ClientError::RemoteHttp {
            status: e.status(),
            message: e.to_string(),
        }
    }
}

impl From<PaprError> for ClientError {
    fn from(e: PaprError) -> Self {
        ClientError::Config(e.to_string())
    }
}

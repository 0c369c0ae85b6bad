//! Error types for the Papr retrieval core.

use thiserror::Error;

/// Error type for configuration and domain-type operations.
#[derive(Debug, Error)]
pub enum PaprError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Cross-cutting failure kinds.
///
/// Every crate-level error maps onto one of these so the orchestrator and the
/// facade can decide between local recovery, remote fallback, or surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing API key, endpoint, or model path. Disables the affected subsystem.
    ConfigMissing,
    /// Model path does not exist.
    ModelMissing,
    /// Model shape does not match the tokenizer or declared dimension.
    ModelIncompatible,
    /// Runtime failure inside inference.
    InferenceFailed,
    /// Sync gave up after retries; local path is bypassed until the next success.
    SyncDegraded,
    /// Local collections are unreadable or inconsistent; drop and resync.
    VectorStoreCorrupt,
    /// End-to-end deadline exceeded.
    SearchTimeout,
    /// Remote memory service failure, surfaced with its HTTP status.
    RemoteHttpError,
    /// Resource probe disabled the local path.
    ResourceExhausted,
}

impl ErrorKind {
    /// Returns the display name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ConfigMissing => "ConfigMissing",
            ErrorKind::ModelMissing => "ModelMissing",
            ErrorKind::ModelIncompatible => "ModelIncompatible",
            ErrorKind::InferenceFailed => "InferenceFailed",
            ErrorKind::SyncDegraded => "SyncDegraded",
            ErrorKind::VectorStoreCorrupt => "VectorStoreCorrupt",
            ErrorKind::SearchTimeout => "SearchTimeout",
            ErrorKind::RemoteHttpError => "RemoteHttpError",
            ErrorKind::ResourceExhausted => "ResourceExhausted",
        }
    }

    /// Whether a failure of this kind on the local path may fall back to remote.
    pub fn allows_remote_fallback(&self) -> bool {
        !matches!(self, ErrorKind::SearchTimeout | ErrorKind::RemoteHttpError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

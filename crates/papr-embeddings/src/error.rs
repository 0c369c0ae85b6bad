//! Embedding error types.

use papr_types::ErrorKind;
use thiserror::Error;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Candle model error
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Tokenizer error
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// No model path configured and download disabled
    #[error("Model not configured: {0}")]
    NotConfigured(String),

    /// Model file not found
    #[error("Model file not found: {0}")]
    ModelNotFound(String),

    /// Model shape does not fit the tokenizer or declared dimension
    #[error("Model incompatible: {0}")]
    ModelIncompatible(String),

    /// Inference worker failed or stopped
    #[error("Inference failed: {0}")]
    Inference(String),

    /// Download error
    #[error("Failed to download model: {0}")]
    Download(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EmbeddingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbeddingError::NotConfigured(_) => ErrorKind::ConfigMissing,
            EmbeddingError::ModelNotFound(_) | EmbeddingError::Download(_) => {
                ErrorKind::ModelMissing
            }
            EmbeddingError::ModelIncompatible(_)
            | EmbeddingError::DimensionMismatch { .. }
            | EmbeddingError::Serialization(_) => ErrorKind::ModelIncompatible,
            EmbeddingError::Candle(_)
            | EmbeddingError::Tokenizer(_)
            | EmbeddingError::Inference(_)
            | EmbeddingError::Io(_)
            | EmbeddingError::InvalidInput(_) => ErrorKind::InferenceFailed,
        }
    }
}

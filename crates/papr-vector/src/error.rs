//! Vector store error types.

use papr_types::ErrorKind;
use thiserror::Error;

/// Errors that can occur during vector operations.
#[derive(Debug, Error)]
pub enum VectorError {
    /// usearch index error
    #[error("Index error: {0}")]
    Index(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Vector contains NaN or infinite values
    #[error("Invalid vector for {0}: non-finite component")]
    InvalidVector(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// RocksDB error
    #[error("Database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// Stored state is inconsistent
    #[error("Store corrupt: {0}")]
    Corrupt(String),

    /// Column family missing from an opened database
    #[error("Column family missing: {0}")]
    MissingColumnFamily(String),

    /// A lock was poisoned by a panicking writer
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

impl VectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VectorError::DimensionMismatch { .. } | VectorError::InvalidVector(_) => {
                ErrorKind::ModelIncompatible
            }
            _ => ErrorKind::VectorStoreCorrupt,
        }
    }
}

impl From<serde_json::Error> for VectorError {
    fn from(e: serde_json::Error) -> Self {
        VectorError::Serialization(e.to_string())
    }
}

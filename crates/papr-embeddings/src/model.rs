//! Embedding types and the embedder trait.

use async_trait::async_trait;

use crate::error::EmbeddingError;

/// Vector embedding as produced by the model.
///
/// Values are the raw pooled hidden state; nothing here normalizes them.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// Get the embedding dimension
    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in `[-1, 1]`. Zero when dimensions differ or
    /// either vector has zero norm.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Cosine similarity over raw slices.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut na = 0.0f64;
    let mut nb = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    (dot / (na.sqrt() * nb.sqrt())) as f32
}

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    /// Model name (e.g., "Qwen4B")
    pub name: String,
    /// Embedding dimension
    pub dimension: usize,
    /// Fixed sequence length in tokens
    pub max_sequence_length: usize,
    /// Device the model runs on ("cpu", "cuda", "metal", "mock")
    pub device: String,
}

/// A query embedding plus the number of non-pad tokens that produced it.
#[derive(Debug, Clone)]
pub struct QueryEmbedding {
    pub embedding: Embedding,
    pub active_tokens: usize,
}

/// Async text embedder.
///
/// Implementations must be thread-safe (Send + Sync) for concurrent use.
#[async_trait]
pub trait TextEmbedder: Send + Sync {
    /// Get model information
    fn info(&self) -> &ModelInfo;

    /// Embed a single text. One call is one inference.
    async fn embed(&self, text: &str) -> Result<QueryEmbedding, EmbeddingError>;
}

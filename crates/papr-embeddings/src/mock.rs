//! Mock embedder for tests that don't need model weights.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EmbeddingError;
use crate::model::{Embedding, ModelInfo, QueryEmbedding, TextEmbedder};

/// Embedder returning canned vectors and counting calls.
///
/// Texts without a canned vector get a deterministic vector derived from a
/// hash of the text.
pub struct MockEmbedder {
    info: ModelInfo,
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    failure: Option<String>,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            info: ModelInfo {
                name: "mock".to_string(),
                dimension,
                max_sequence_length: 32,
                device: "mock".to_string(),
            },
            vectors: HashMap::new(),
            calls: AtomicUsize::new(0),
            delay: None,
            failure: None,
        }
    }

    pub fn with_vector(mut self, text: impl Into<String>, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.into(), vector);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Number of `embed` calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hashed_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();
        (0..self.info.dimension)
            .map(|i| {
                let x = seed.rotate_left((i % 64) as u32) ^ (i as u64).wrapping_mul(0x9E37_79B9);
                (x % 1000) as f32 / 1000.0 + 0.001
            })
            .collect()
    }
}

#[async_trait]
impl TextEmbedder for MockEmbedder {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn embed(&self, text: &str) -> Result<QueryEmbedding, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(EmbeddingError::Inference(message.clone()));
        }

        let values = self
            .vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| self.hashed_vector(text));

        Ok(QueryEmbedding {
            embedding: Embedding::new(values),
            active_tokens: text.split_whitespace().count(),
        })
    }
}

//! # papr-embeddings
//!
//! On-device query embedding for the Papr retrieval core.
//!
//! ## Features
//! - Fixed-shape tokenization (`[1, L]`, default `L = 32`)
//! - Candle BERT backend bound to CPU, CUDA or Metal by compute preference
//! - One inference thread per engine; calls are serialized FIFO
//! - Three warm-up inferences after load
//! - Mean pooling over the padded length, no normalization
//! - Model files from a configured directory or the HuggingFace cache

pub mod backend;
pub mod cache;
pub mod candle;
pub mod engine;
pub mod error;
pub mod mock;
pub mod model;
pub mod tokenizer;

pub use crate::candle::{select_device, CandleBackend};
pub use backend::InferenceBackend;
pub use cache::{
    get_or_download_model, resolve_model, ModelCache, ModelPaths, DEFAULT_MODEL_REPO, MODEL_FILES,
};
pub use engine::{mean_pool, EmbeddingEngine, EngineConfig, WarmupReport, WARMUP_RUNS};
pub use error::EmbeddingError;
pub use mock::MockEmbedder;
pub use model::{cosine_similarity, Embedding, ModelInfo, QueryEmbedding, TextEmbedder};
pub use tokenizer::{pad_and_truncate, TokenizedInput, TokenizerAdapter, DEFAULT_SEQ_LEN};

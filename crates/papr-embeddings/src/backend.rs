//! Inference backend trait.
//!
//! A backend owns a loaded model and maps one fixed-shape tokenized input to
//! its final hidden states. Pooling happens in the engine.

use candle_core::Tensor;

use crate::error::EmbeddingError;
use crate::tokenizer::TokenizedInput;

/// A loaded transformer, bound to a device.
///
/// Backends are moved onto the engine's inference thread and never shared,
/// so they need `Send` but not `Sync`.
pub trait InferenceBackend: Send {
    /// Width of the final hidden state.
    fn hidden_size(&self) -> usize;

    /// Longest sequence the model accepts, when known.
    fn max_positions(&self) -> Option<usize>;

    /// Device label reported in metrics.
    fn device_label(&self) -> &str;

    /// Returns final hidden states with shape `[1, L, D]`.
    fn forward(&self, input: &TokenizedInput) -> Result<Tensor, EmbeddingError>;
}

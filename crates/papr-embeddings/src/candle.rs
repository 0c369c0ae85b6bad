//! Candle-based inference backend.
//!
//! Loads a BERT-family encoder from safetensors and binds it to the device
//! selected from the configured compute preference.

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use papr_types::ComputePreference;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::cache::ModelPaths;
use crate::error::EmbeddingError;
use crate::tokenizer::TokenizedInput;

/// Shape fields read from config.json for compatibility checks.
#[derive(Debug, Clone, Deserialize)]
struct ModelShape {
    hidden_size: usize,
    #[serde(default)]
    max_position_embeddings: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
enum Accelerator {
    Cuda,
    Metal,
}

impl Accelerator {
    fn open(self) -> Result<Device, candle_core::Error> {
        match self {
            Accelerator::Cuda => Device::new_cuda(0),
            Accelerator::Metal => Device::new_metal(0),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Accelerator::Cuda => "cuda",
            Accelerator::Metal => "metal",
        }
    }
}

/// Map a compute preference onto a candle device.
///
/// Falls back along the preference order and finally to CPU.
pub fn select_device(preference: ComputePreference) -> (Device, &'static str) {
    let order: &[Accelerator] = match preference {
        ComputePreference::CpuOnly => &[],
        ComputePreference::CpuAndGpu => &[Accelerator::Cuda, Accelerator::Metal],
        ComputePreference::CpuAndNe | ComputePreference::All => {
            &[Accelerator::Metal, Accelerator::Cuda]
        }
    };

    for (i, accel) in order.iter().enumerate() {
        match accel.open() {
            Ok(device) => {
                if i > 0 {
                    warn!(
                        preference = preference.as_str(),
                        device = accel.label(),
                        "Preferred accelerator unavailable, using fallback"
                    );
                }
                return (device, accel.label());
            }
            Err(e) => debug!(device = accel.label(), error = %e, "Accelerator unavailable"),
        }
    }

    if !order.is_empty() {
        warn!(
            preference = preference.as_str(),
            "No accelerator available, falling back to CPU"
        );
    }
    (Device::Cpu, "cpu")
}

/// BERT encoder running under candle.
pub struct CandleBackend {
    model: BertModel,
    device: Device,
    device_label: &'static str,
    hidden_size: usize,
    max_positions: Option<usize>,
}

impl CandleBackend {
    /// Load config and weights onto the preferred device.
    pub fn load(paths: &ModelPaths, preference: ComputePreference) -> Result<Self, EmbeddingError> {
        for path in [&paths.config, &paths.weights] {
            if !path.exists() {
                return Err(EmbeddingError::ModelNotFound(path.display().to_string()));
            }
        }

        let (device, device_label) = select_device(preference);
        info!(device = device_label, "Loading embedding model...");

        let config_str = std::fs::read_to_string(&paths.config)?;
        let shape: ModelShape = serde_json::from_str(&config_str)
            .map_err(|e| EmbeddingError::ModelIncompatible(format!("Invalid config: {}", e)))?;
        let config: BertConfig = serde_json::from_str(&config_str)
            .map_err(|e| EmbeddingError::ModelIncompatible(format!("Invalid config: {}", e)))?;

        let model = load_weights(&paths.weights, &config, &device)?;

        info!(
            device = device_label,
            hidden = shape.hidden_size,
            "Model loaded successfully"
        );

        Ok(Self {
            model,
            device,
            device_label,
            hidden_size: shape.hidden_size,
            max_positions: shape.max_position_embeddings,
        })
    }
}

fn load_weights(
    weights: &Path,
    config: &BertConfig,
    device: &Device,
) -> Result<BertModel, EmbeddingError> {
    // SAFETY: the weights file is not modified while mapped.
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights.to_path_buf()], DType::F32, device)?
    };
    Ok(BertModel::load(vb, config)?)
}

impl InferenceBackend for CandleBackend {
    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn max_positions(&self) -> Option<usize> {
        self.max_positions
    }

    fn device_label(&self) -> &str {
        self.device_label
    }

    fn forward(&self, input: &TokenizedInput) -> Result<Tensor, EmbeddingError> {
        let ids: Vec<u32> = input.input_ids.iter().map(|&id| id.max(0) as u32).collect();
        let mask: Vec<u32> = input
            .attention_mask
            .iter()
            .map(|&m| m.max(0) as u32)
            .collect();

        let input_ids = Tensor::from_vec(ids, input.shape(), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, input.shape(), &self.device)?;
        let token_type_ids = Tensor::zeros_like(&input_ids)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        Ok(hidden)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{get_or_download_model, ModelCache};

    #[test]
    fn test_cpu_only_selects_cpu() {
        let (device, label) = select_device(ComputePreference::CpuOnly);
        assert!(device.is_cpu());
        assert_eq!(label, "cpu");
    }

    #[test]
    fn test_missing_files_is_model_not_found() {
        let temp = tempfile::TempDir::new().unwrap();
        let paths = ModelPaths::in_dir(temp.path());
        let result = CandleBackend::load(&paths, ComputePreference::CpuOnly);
        assert!(matches!(result, Err(EmbeddingError::ModelNotFound(_))));
    }

    #[test]
    #[ignore = "requires model files"]
    fn test_forward_shape() {
        let cache = ModelCache::default();
        let paths = get_or_download_model(&cache, true).unwrap();
        let backend = CandleBackend::load(&paths, ComputePreference::CpuOnly).unwrap();
        let input = crate::tokenizer::pad_and_truncate(&[101, 102], &[1, 1], 8, 0);
        let hidden = backend.forward(&input).unwrap();
        assert_eq!(hidden.dims(), &[1, 8, backend.hidden_size()]);
    }
}

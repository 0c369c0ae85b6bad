//! Single-inference embedding engine.
//!
//! The engine owns one backend on a dedicated inference thread. Requests are
//! queued FIFO and executed one at a time, so the model never sees concurrent
//! calls. Each request carries a reply channel; if the caller has gone away by
//! the time inference finishes, the result is dropped.
//!
//! Pooling is the plain mean over the sequence axis, dividing by the fixed
//! sequence length `L` rather than the active token count. The output is not
//! normalized.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use candle_core::{DType, Tensor};
use papr_types::{ComputePreference, Settings};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::backend::InferenceBackend;
use crate::cache::{resolve_model, ModelCache, DEFAULT_MODEL_REPO};
use crate::candle::CandleBackend;
use crate::error::EmbeddingError;
use crate::model::{Embedding, ModelInfo, QueryEmbedding, TextEmbedder};
use crate::tokenizer::{TokenizedInput, TokenizerAdapter, DEFAULT_SEQ_LEN};

/// Synthetic inferences run after load.
pub const WARMUP_RUNS: usize = 3;

const WARMUP_TEXT: &str = "warm up the embedding model";
const FIRST_INFERENCE_BUDGET: Duration = Duration::from_secs(1);
const MISROUTE_THRESHOLD: Duration = Duration::from_secs(5);
const STEADY_STATE_BUDGET: Duration = Duration::from_millis(150);

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit model directory; falls back to the cache when unset
    pub model_dir: Option<PathBuf>,
    pub compute_preference: ComputePreference,
    pub output_dim: usize,
    pub seq_len: usize,
    pub model_name: String,
    pub cache: ModelCache,
    pub allow_download: bool,
}

impl EngineConfig {
    pub fn new(output_dim: usize) -> Self {
        Self {
            model_dir: None,
            compute_preference: ComputePreference::default(),
            output_dim,
            seq_len: DEFAULT_SEQ_LEN,
            model_name: "Qwen4B".to_string(),
            cache: ModelCache::default(),
            allow_download: false,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let repo = settings
            .model_repo
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL_REPO.to_string());
        Self {
            model_dir: settings.coreml_model.clone(),
            compute_preference: settings.coreml_compute_units,
            output_dim: settings.embedding_dim,
            seq_len: settings.max_seq_len,
            model_name: settings.embed_model.clone(),
            cache: ModelCache::new(settings.model_cache_dir(), repo),
            allow_download: settings.download_model,
        }
    }

    pub fn with_seq_len(mut self, seq_len: usize) -> Self {
        self.seq_len = seq_len;
        self
    }

    pub fn with_model_name(mut self, name: impl Into<String>) -> Self {
        self.model_name = name.into();
        self
    }
}

/// Wall-clock timings of the warm-up inferences.
#[derive(Debug, Clone, Default)]
pub struct WarmupReport {
    pub runs: Vec<Duration>,
}

struct InferenceJob {
    input: TokenizedInput,
    reply: oneshot::Sender<Result<Vec<f32>, EmbeddingError>>,
}

/// Owns the loaded model and serializes inference.
pub struct EmbeddingEngine {
    tokenizer: TokenizerAdapter,
    jobs: mpsc::UnboundedSender<InferenceJob>,
    info: ModelInfo,
    inference_count: AtomicU64,
    warmup: WarmupReport,
}

impl EmbeddingEngine {
    /// Resolve model files, load the candle backend and warm it up.
    ///
    /// Blocks; call from a blocking context.
    pub fn load(config: &EngineConfig) -> Result<Self, EmbeddingError> {
        let paths = resolve_model(
            config.model_dir.as_deref(),
            &config.cache,
            config.allow_download,
        )?;
        let tokenizer = TokenizerAdapter::from_file(&paths.tokenizer, config.seq_len)?;
        let backend = CandleBackend::load(&paths, config.compute_preference)?;
        Self::with_backend(Box::new(backend), tokenizer, config)
    }

    /// Start the engine over an already-loaded backend.
    ///
    /// Validates shapes, spawns the inference thread, and runs warm-up.
    /// Blocks; call from a blocking context.
    pub fn with_backend(
        backend: Box<dyn InferenceBackend>,
        tokenizer: TokenizerAdapter,
        config: &EngineConfig,
    ) -> Result<Self, EmbeddingError> {
        validate_shape(backend.as_ref(), &tokenizer, config)?;

        let info = ModelInfo {
            name: config.model_name.clone(),
            dimension: config.output_dim,
            max_sequence_length: config.seq_len,
            device: backend.device_label().to_string(),
        };

        let jobs = spawn_worker(backend, config.seq_len, config.output_dim)?;

        let mut engine = Self {
            tokenizer,
            jobs,
            info,
            inference_count: AtomicU64::new(0),
            warmup: WarmupReport::default(),
        };
        engine.warmup = engine.warm_up()?;

        info!(
            model = %engine.info.name,
            device = %engine.info.device,
            dim = engine.info.dimension,
            seq_len = engine.info.max_sequence_length,
            "Embedding engine ready"
        );
        Ok(engine)
    }

    /// Number of `embed` calls served (warm-up excluded).
    pub fn inference_count(&self) -> u64 {
        self.inference_count.load(Ordering::SeqCst)
    }

    pub fn warmup_report(&self) -> &WarmupReport {
        &self.warmup
    }

    pub fn tokenizer(&self) -> &TokenizerAdapter {
        &self.tokenizer
    }

    fn submit(
        &self,
        input: TokenizedInput,
    ) -> Result<oneshot::Receiver<Result<Vec<f32>, EmbeddingError>>, EmbeddingError> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(InferenceJob { input, reply })
            .map_err(|_| EmbeddingError::Inference("inference worker stopped".to_string()))?;
        Ok(rx)
    }

    fn infer_blocking(&self, input: TokenizedInput) -> Result<Vec<f32>, EmbeddingError> {
        self.submit(input)?
            .blocking_recv()
            .map_err(|_| EmbeddingError::Inference("inference worker stopped".to_string()))?
    }

    fn warm_up(&self) -> Result<WarmupReport, EmbeddingError> {
        let input = self.tokenizer.tokenize(WARMUP_TEXT)?;
        let mut runs = Vec::with_capacity(WARMUP_RUNS);

        for run in 0..WARMUP_RUNS {
            let start = Instant::now();
            self.infer_blocking(input.clone())?;
            let elapsed = start.elapsed();
            debug!(run, elapsed_ms = elapsed.as_millis() as u64, "Warm-up inference");
            runs.push(elapsed);
        }

        if runs[0] > FIRST_INFERENCE_BUDGET {
            warn!(
                elapsed_ms = runs[0].as_millis() as u64,
                "First inference exceeded 1s budget"
            );
        }
        if runs[1] > MISROUTE_THRESHOLD {
            warn!(
                elapsed_ms = runs[1].as_millis() as u64,
                device = %self.info.device,
                "Second inference exceeded 5s, model is likely misrouted off the GPU/ANE"
            );
        }

        Ok(WarmupReport { runs })
    }
}

#[async_trait]
impl TextEmbedder for EmbeddingEngine {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    async fn embed(&self, text: &str) -> Result<QueryEmbedding, EmbeddingError> {
        let input = self.tokenizer.tokenize(text)?;
        let active_tokens = input.active_tokens;

        self.inference_count.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let rx = self.submit(input)?;
        let values = rx
            .await
            .map_err(|_| EmbeddingError::Inference("inference worker stopped".to_string()))??;

        let elapsed = start.elapsed();
        if elapsed > STEADY_STATE_BUDGET {
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                "Inference above steady-state target"
            );
        }

        Ok(QueryEmbedding {
            embedding: Embedding::new(values),
            active_tokens,
        })
    }
}

fn validate_shape(
    backend: &dyn InferenceBackend,
    tokenizer: &TokenizerAdapter,
    config: &EngineConfig,
) -> Result<(), EmbeddingError> {
    if backend.hidden_size() != config.output_dim {
        return Err(EmbeddingError::ModelIncompatible(format!(
            "hidden size {} does not match declared dimension {}",
            backend.hidden_size(),
            config.output_dim
        )));
    }
    if let Some(max) = backend.max_positions() {
        if max < config.seq_len {
            return Err(EmbeddingError::ModelIncompatible(format!(
                "model accepts {} positions, tokenizer produces {}",
                max, config.seq_len
            )));
        }
    }
    if tokenizer.seq_len() != config.seq_len {
        return Err(EmbeddingError::ModelIncompatible(format!(
            "tokenizer length {} does not match configured length {}",
            tokenizer.seq_len(),
            config.seq_len
        )));
    }
    Ok(())
}

fn spawn_worker(
    backend: Box<dyn InferenceBackend>,
    seq_len: usize,
    output_dim: usize,
) -> Result<mpsc::UnboundedSender<InferenceJob>, EmbeddingError> {
    let (tx, mut rx) = mpsc::unbounded_channel::<InferenceJob>();

    std::thread::Builder::new()
        .name("papr-inference".to_string())
        .spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                let result = run_inference(backend.as_ref(), &job.input, seq_len, output_dim);
                if job.reply.send(result).is_err() {
                    debug!("Caller went away, discarding embedding");
                }
            }
            debug!("Inference worker stopped");
        })?;

    Ok(tx)
}

fn run_inference(
    backend: &dyn InferenceBackend,
    input: &TokenizedInput,
    seq_len: usize,
    output_dim: usize,
) -> Result<Vec<f32>, EmbeddingError> {
    let hidden = backend.forward(input)?;
    let values = mean_pool(&hidden, seq_len)?;
    if values.len() != output_dim {
        return Err(EmbeddingError::DimensionMismatch {
            expected: output_dim,
            actual: values.len(),
        });
    }
    Ok(values)
}

/// Mean over the sequence axis of `[1, L, D]`, divided by the constant `L`.
pub fn mean_pool(hidden: &Tensor, seq_len: usize) -> Result<Vec<f32>, EmbeddingError> {
    let dims = hidden.dims();
    if dims.len() != 3 || dims[1] != seq_len {
        return Err(EmbeddingError::ModelIncompatible(format!(
            "expected hidden states [1, {}, D], got {:?}",
            seq_len, dims
        )));
    }
    let summed = hidden.sum(1)?;
    let mean = (summed / seq_len as f64)?;
    Ok(mean.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::tests::test_adapter;
    use candle_core::Device;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// Hidden state at (l, d) is `ids[l] + d`.
    struct FakeBackend {
        hidden: usize,
        positions: Option<usize>,
        forwards: Arc<AtomicUsize>,
        fail_after: Option<usize>,
        delay: Duration,
    }

    impl FakeBackend {
        fn new(hidden: usize) -> Self {
            Self {
                hidden,
                positions: Some(512),
                forwards: Arc::new(AtomicUsize::new(0)),
                fail_after: None,
                delay: Duration::ZERO,
            }
        }
    }

    impl InferenceBackend for FakeBackend {
        fn hidden_size(&self) -> usize {
            self.hidden
        }

        fn max_positions(&self) -> Option<usize> {
            self.positions
        }

        fn device_label(&self) -> &str {
            "cpu"
        }

        fn forward(&self, input: &TokenizedInput) -> Result<Tensor, EmbeddingError> {
            let n = self.forwards.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_after {
                if n >= limit {
                    return Err(EmbeddingError::Inference("device lost".to_string()));
                }
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let l = input.len();
            let mut data = Vec::with_capacity(l * self.hidden);
            for &id in &input.input_ids {
                for d in 0..self.hidden {
                    data.push(id as f32 + d as f32);
                }
            }
            Ok(Tensor::from_vec(data, (1, l, self.hidden), &Device::Cpu)?)
        }
    }

    fn config(dim: usize, seq_len: usize) -> EngineConfig {
        EngineConfig::new(dim).with_seq_len(seq_len)
    }

    #[test]
    fn test_mean_pool_divides_by_fixed_length() {
        let backend = FakeBackend::new(2);
        let input = test_adapter(4).tokenize("buy milk").unwrap();
        let hidden = backend.forward(&input).unwrap();
        // ids [2, 3, 0, 0]: (2 + 3) / 4 = 1.25, pads still count
        let pooled = mean_pool(&hidden, 4).unwrap();
        assert_eq!(pooled, vec![1.25, 2.25]);
    }

    #[test]
    fn test_mean_pool_rejects_wrong_shape() {
        let hidden = Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            mean_pool(&hidden, 4),
            Err(EmbeddingError::ModelIncompatible(_))
        ));
    }

    #[test]
    fn test_warmup_runs_three_inferences() {
        let backend = FakeBackend::new(2);
        let forwards = backend.forwards.clone();
        let engine =
            EmbeddingEngine::with_backend(Box::new(backend), test_adapter(4), &config(2, 4))
                .unwrap();
        assert_eq!(forwards.load(Ordering::SeqCst), WARMUP_RUNS);
        assert_eq!(engine.warmup_report().runs.len(), WARMUP_RUNS);
        assert_eq!(engine.inference_count(), 0);
        assert_eq!(engine.info().device, "cpu");
    }

    #[test]
    fn test_hidden_size_mismatch_is_incompatible() {
        let result =
            EmbeddingEngine::with_backend(Box::new(FakeBackend::new(3)), test_adapter(4), &config(2, 4));
        assert!(matches!(result, Err(EmbeddingError::ModelIncompatible(_))));
    }

    #[test]
    fn test_short_position_table_is_incompatible() {
        let mut backend = FakeBackend::new(2);
        backend.positions = Some(2);
        let result =
            EmbeddingEngine::with_backend(Box::new(backend), test_adapter(4), &config(2, 4));
        assert!(matches!(result, Err(EmbeddingError::ModelIncompatible(_))));
    }

    #[test]
    fn test_warmup_failure_fails_load() {
        let mut backend = FakeBackend::new(2);
        backend.fail_after = Some(0);
        let result =
            EmbeddingEngine::with_backend(Box::new(backend), test_adapter(4), &config(2, 4));
        assert!(matches!(result, Err(EmbeddingError::Inference(_))));
    }

    async fn start(backend: FakeBackend, dim: usize, seq_len: usize) -> Arc<EmbeddingEngine> {
        tokio::task::spawn_blocking(move || {
            EmbeddingEngine::with_backend(
                Box::new(backend),
                test_adapter(seq_len),
                &config(dim, seq_len),
            )
            .map(Arc::new)
        })
        .await
        .unwrap()
        .unwrap()
    }

    #[tokio::test]
    async fn test_embed_once_per_call() {
        let backend = FakeBackend::new(2);
        let forwards = backend.forwards.clone();
        let engine = start(backend, 2, 4).await;

        let out = engine.embed("buy milk").await.unwrap();
        assert_eq!(out.embedding.values, vec![1.25, 2.25]);
        assert_eq!(out.active_tokens, 2);
        assert_eq!(engine.inference_count(), 1);
        assert_eq!(forwards.load(Ordering::SeqCst), WARMUP_RUNS + 1);
    }

    #[tokio::test]
    async fn test_empty_query_still_embeds() {
        let engine = start(FakeBackend::new(2), 2, 4).await;
        let out = engine.embed("").await.unwrap();
        assert_eq!(out.embedding.values, vec![0.0, 1.0]);
        assert_eq!(out.active_tokens, 0);
        assert_eq!(engine.inference_count(), 1);
    }

    #[tokio::test]
    async fn test_runtime_failure_is_reported() {
        let mut backend = FakeBackend::new(2);
        backend.fail_after = Some(WARMUP_RUNS);
        let engine = start(backend, 2, 4).await;
        let err = engine.embed("hello").await.unwrap_err();
        assert_eq!(err.kind(), papr_types::ErrorKind::InferenceFailed);
    }

    #[tokio::test]
    async fn test_abandoned_request_does_not_wedge_worker() {
        let mut backend = FakeBackend::new(2);
        backend.delay = Duration::from_millis(50);
        let engine = start(backend, 2, 4).await;

        let abandoned = tokio::time::timeout(Duration::from_millis(1), engine.embed("hello")).await;
        assert!(abandoned.is_err());

        let out = engine.embed("world").await.unwrap();
        assert_eq!(out.embedding.dimension(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let engine = start(FakeBackend::new(2), 2, 4).await;
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.embed("buy milk").await })
            })
            .collect();
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().embedding.values, vec![1.25, 2.25]);
        }
        assert_eq!(engine.inference_count(), 8);
    }
}

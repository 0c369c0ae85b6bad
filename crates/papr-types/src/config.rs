//! Configuration loading for the Papr retrieval core.
//!
//! Layered config: defaults -> config file -> `PAPR_*` env vars -> builder args.
//! Config file lives at `~/.config/papr/config.toml` unless a path is given.
//! Env names map 1:1 onto field names: `PAPR_EMBED_LIMIT` -> `embed_limit`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::PaprError;
use crate::flags::{deserialize_flag, deserialize_optional_flag};
use crate::memory::{EmbeddingFormat, DEFAULT_EMBEDDING_DIM};

/// Default remote memory service endpoint.
pub const DEFAULT_BASE_URL: &str = "https://memory.papr.ai";

/// Compute units the embedding model may run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ComputePreference {
    #[default]
    All,
    CpuAndNe,
    CpuAndGpu,
    CpuOnly,
}

impl ComputePreference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputePreference::All => "ALL",
            ComputePreference::CpuAndNe => "CPU_AND_NE",
            ComputePreference::CpuAndGpu => "CPU_AND_GPU",
            ComputePreference::CpuOnly => "CPU_ONLY",
        }
    }
}

impl FromStr for ComputePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALL" => Ok(ComputePreference::All),
            "CPU_AND_NE" => Ok(ComputePreference::CpuAndNe),
            "CPU_AND_GPU" => Ok(ComputePreference::CpuAndGpu),
            "CPU_ONLY" => Ok(ComputePreference::CpuOnly),
            other => Err(format!("unknown compute units '{}'", other)),
        }
    }
}

impl TryFrom<String> for ComputePreference {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ComputePreference> for String {
    fn from(p: ComputePreference) -> Self {
        p.as_str().to_string()
    }
}

/// Process-wide settings.
#[derive(Clone, Deserialize)]
pub struct Settings {
    /// API key for the remote memory service
    #[serde(default)]
    pub memory_api_key: Option<String>,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub external_user_id: Option<String>,

    #[serde(default)]
    pub workspace_id: Option<String>,

    /// Explicit on-device override. `None` means auto-configure from the probe.
    #[serde(default, deserialize_with = "deserialize_optional_flag")]
    pub ondevice_processing: Option<bool>,

    /// Enables the local embedding model.
    #[serde(default = "default_true", deserialize_with = "deserialize_flag")]
    pub enable_coreml: bool,

    /// Model directory (config.json, tokenizer.json, model.safetensors)
    #[serde(default)]
    pub coreml_model: Option<PathBuf>,

    #[serde(default)]
    pub coreml_compute_units: ComputePreference,

    #[serde(default = "default_true", deserialize_with = "deserialize_flag")]
    pub enable_parallel_search: bool,

    /// Local results below this confidence fall back to remote
    #[serde(default = "default_similarity_threshold")]
    pub ondevice_similarity_threshold: f32,

    #[serde(default = "default_true", deserialize_with = "deserialize_flag")]
    pub include_server_embeddings: bool,

    #[serde(default = "default_embed_limit")]
    pub embed_limit: usize,

    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    #[serde(default)]
    pub embedding_format: EmbeddingFormat,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default = "default_true", deserialize_with = "deserialize_flag")]
    pub enable_metrics: bool,

    /// Telemetry record service
    #[serde(default)]
    pub parse_server_url: Option<String>,
    #[serde(default)]
    pub parse_app_id: Option<String>,
    #[serde(default)]
    pub parse_master_key: Option<String>,
    #[serde(default)]
    pub parse_api_key: Option<String>,

    /// Root for per-user cache directories and the model cache
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Fixed tokenizer sequence length
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Weight of cosine similarity in the hybrid score
    #[serde(default = "default_hybrid_alpha")]
    pub hybrid_alpha: f32,

    #[serde(default = "default_min_disk_gb")]
    pub min_disk_gb: f64,
    #[serde(default = "default_min_ram_gb")]
    pub min_ram_gb: f64,
    #[serde(default = "default_max_memory_percent")]
    pub max_memory_percent: f64,

    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_sync_timeout_secs")]
    pub sync_timeout_secs: u64,

    #[serde(default = "default_max_tier0")]
    pub max_tier0: usize,
    #[serde(default = "default_max_tier1")]
    pub max_tier1: usize,

    /// JSON-lines file receiving one record per flushed metric
    #[serde(default)]
    pub metrics_log_file: Option<PathBuf>,

    #[serde(default = "default_infrastructure_region")]
    pub infrastructure_region: String,

    /// Hugging Face repo used to populate the model cache
    #[serde(default)]
    pub model_repo: Option<String>,

    #[serde(default, deserialize_with = "deserialize_flag")]
    pub download_model: bool,
}

fn default_true() -> bool {
    true
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_similarity_threshold() -> f32 {
    0.30
}

fn default_embed_limit() -> usize {
    200
}

fn default_embed_model() -> String {
    "Qwen4B".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    ProjectDirs::from("ai", "papr", "papr")
        .map(|p| p.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./papr-data"))
}

fn default_embedding_dim() -> usize {
    DEFAULT_EMBEDDING_DIM
}

fn default_max_seq_len() -> usize {
    32
}

fn default_hybrid_alpha() -> f32 {
    0.7
}

fn default_min_disk_gb() -> f64 {
    30.0
}

fn default_min_ram_gb() -> f64 {
    6.0
}

fn default_max_memory_percent() -> f64 {
    85.0
}

fn default_search_timeout_secs() -> u64 {
    120
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_sync_timeout_secs() -> u64 {
    180
}

fn default_max_tier0() -> usize {
    100
}

fn default_max_tier1() -> usize {
    500
}

fn default_infrastructure_region() -> String {
    "on-device".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            memory_api_key: None,
            base_url: default_base_url(),
            user_id: None,
            external_user_id: None,
            workspace_id: None,
            ondevice_processing: None,
            enable_coreml: true,
            coreml_model: None,
            coreml_compute_units: ComputePreference::default(),
            enable_parallel_search: true,
            ondevice_similarity_threshold: default_similarity_threshold(),
            include_server_embeddings: true,
            embed_limit: default_embed_limit(),
            embed_model: default_embed_model(),
            embedding_format: EmbeddingFormat::default(),
            log_level: default_log_level(),
            log_file: None,
            enable_metrics: true,
            parse_server_url: None,
            parse_app_id: None,
            parse_master_key: None,
            parse_api_key: None,
            data_dir: default_data_dir(),
            embedding_dim: default_embedding_dim(),
            max_seq_len: default_max_seq_len(),
            hybrid_alpha: default_hybrid_alpha(),
            min_disk_gb: default_min_disk_gb(),
            min_ram_gb: default_min_ram_gb(),
            max_memory_percent: default_max_memory_percent(),
            search_timeout_secs: default_search_timeout_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            sync_timeout_secs: default_sync_timeout_secs(),
            max_tier0: default_max_tier0(),
            max_tier1: default_max_tier1(),
            metrics_log_file: None,
            infrastructure_region: default_infrastructure_region(),
            model_repo: None,
            download_model: false,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("Settings")
            .field("memory_api_key", &redact(&self.memory_api_key))
            .field("base_url", &self.base_url)
            .field("user_id", &self.user_id)
            .field("external_user_id", &self.external_user_id)
            .field("ondevice_processing", &self.ondevice_processing)
            .field("enable_coreml", &self.enable_coreml)
            .field("coreml_model", &self.coreml_model)
            .field("coreml_compute_units", &self.coreml_compute_units)
            .field("embedding_format", &self.embedding_format)
            .field("parse_server_url", &self.parse_server_url)
            .field("parse_master_key", &redact(&self.parse_master_key))
            .field("parse_api_key", &redact(&self.parse_api_key))
            .field("data_dir", &self.data_dir)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/papr/config.toml)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (PAPR_*)
    ///
    /// Builder arguments are applied by the caller after this returns.
    pub fn load(config_path: Option<&str>) -> Result<Self, PaprError> {
        Self::load_with_env(config_path, None)
    }

    /// Like [`Settings::load`], reading env values from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        config_path: Option<&str>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, PaprError> {
        let config_dir = ProjectDirs::from("ai", "papr", "papr")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // Flat keys: PAPR_PARSE_MASTER_KEY -> parse_master_key
        builder = builder.add_source(
            Environment::with_prefix("PAPR")
                .try_parsing(true)
                .source(env),
        );

        let config = builder
            .build()
            .map_err(|e| PaprError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| PaprError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), PaprError> {
        if !(0.0..=1.0).contains(&self.ondevice_similarity_threshold) {
            return Err(PaprError::Config(format!(
                "ondevice_similarity_threshold must be 0.0-1.0, got {}",
                self.ondevice_similarity_threshold
            )));
        }
        if self.embedding_dim == 0 {
            return Err(PaprError::Config("embedding_dim must be > 0".to_string()));
        }
        if self.max_seq_len == 0 {
            return Err(PaprError::Config("max_seq_len must be > 0".to_string()));
        }
        if self.search_timeout_secs == 0 || self.http_timeout_secs == 0 || self.sync_timeout_secs == 0
        {
            return Err(PaprError::Config("timeouts must be > 0".to_string()));
        }
        Ok(())
    }

    /// Hybrid weight clamped to `[0, 1]`.
    pub fn hybrid_alpha(&self) -> f32 {
        if self.hybrid_alpha.is_nan() {
            return default_hybrid_alpha();
        }
        self.hybrid_alpha.clamp(0.0, 1.0)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_timeout_secs)
    }

    /// Expand ~ in data_dir to the home directory
    pub fn expanded_data_dir(&self) -> PathBuf {
        let raw = self.data_dir.to_string_lossy();
        if let Some(rest) = raw.strip_prefix("~/") {
            if let Some(base) = BaseDirs::new() {
                return base.home_dir().join(rest);
            }
        }
        self.data_dir.clone()
    }

    /// Directory holding downloaded model files.
    pub fn model_cache_dir(&self) -> PathBuf {
        self.expanded_data_dir().join("models")
    }
}

//! Model directory resolution.
//!
//! A model lives in one directory holding `config.json`, `tokenizer.json` and
//! `model.safetensors`. That directory is either configured explicitly or is
//! a per-repo slot under the cache root, populated from the Hugging Face Hub
//! on first use.

use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::EmbeddingError;

/// Hub repository used when no model directory is configured.
pub const DEFAULT_MODEL_REPO: &str = "Papr/qwen4b-embed-ondevice";

/// Files a model directory must hold.
pub const MODEL_FILES: &[&str] = &["config.json", "tokenizer.json", "model.safetensors"];

const STAGING_SUFFIX: &str = ".partial";

/// Cache root plus the repo whose files it holds.
#[derive(Debug, Clone)]
pub struct ModelCache {
    pub cache_dir: PathBuf,
    pub repo_id: String,
}

impl Default for ModelCache {
    fn default() -> Self {
        let root = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(root.join("papr").join("models"), DEFAULT_MODEL_REPO)
    }
}

impl ModelCache {
    pub fn new(cache_dir: impl Into<PathBuf>, repo_id: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            repo_id: repo_id.into(),
        }
    }

    /// `<cache_dir>/<owner>_<name>`
    pub fn model_dir(&self) -> PathBuf {
        self.cache_dir.join(self.repo_id.replace('/', "_"))
    }

    fn staging_dir(&self) -> PathBuf {
        let mut name = self.repo_id.replace('/', "_");
        name.push_str(STAGING_SUFFIX);
        self.cache_dir.join(name)
    }

    pub fn is_cached(&self) -> bool {
        ModelPaths::in_dir(&self.model_dir()).missing().is_empty()
    }

    pub fn file_path(&self, filename: &str) -> PathBuf {
        self.model_dir().join(filename)
    }
}

/// Resolved locations of the three model files.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join(MODEL_FILES[0]),
            tokenizer: dir.join(MODEL_FILES[1]),
            weights: dir.join(MODEL_FILES[2]),
        }
    }

    /// File names not present on disk.
    pub fn missing(&self) -> Vec<&'static str> {
        [&self.config, &self.tokenizer, &self.weights]
            .iter()
            .zip(MODEL_FILES)
            .filter(|(path, _)| !path.is_file())
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Locate the model to load.
///
/// A configured directory must exist and be complete; nothing is downloaded
/// for it. Without one the cache slot for `cache.repo_id` is used, fetched
/// from the Hub only when `allow_download` is set.
pub fn resolve_model(
    explicit: Option<&Path>,
    cache: &ModelCache,
    allow_download: bool,
) -> Result<ModelPaths, EmbeddingError> {
    let Some(dir) = explicit else {
        return get_or_download_model(cache, allow_download);
    };
    if !dir.is_dir() {
        return Err(EmbeddingError::ModelNotFound(dir.display().to_string()));
    }
    let paths = ModelPaths::in_dir(dir);
    let missing = paths.missing();
    if !missing.is_empty() {
        return Err(EmbeddingError::ModelNotFound(format!(
            "{} lacks {}",
            dir.display(),
            missing.join(", ")
        )));
    }
    debug!(path = %dir.display(), "Using configured model directory");
    Ok(paths)
}

/// Use the cached copy of `cache.repo_id`, downloading it first if allowed.
pub fn get_or_download_model(
    cache: &ModelCache,
    allow_download: bool,
) -> Result<ModelPaths, EmbeddingError> {
    let model_dir = cache.model_dir();
    if cache.is_cached() {
        debug!(path = %model_dir.display(), "Using cached model");
        return Ok(ModelPaths::in_dir(&model_dir));
    }
    if !allow_download {
        return Err(EmbeddingError::NotConfigured(format!(
            "no model path configured and {} is not cached",
            cache.repo_id
        )));
    }

    info!(repo = %cache.repo_id, "Fetching model from the Hub");
    download_into_cache(cache)?;
    Ok(ModelPaths::in_dir(&model_dir))
}

/// Fetch every model file into a staging directory, then move it into place
/// so a half-finished download is never taken for a cached model.
fn download_into_cache(cache: &ModelCache) -> Result<(), EmbeddingError> {
    use hf_hub::api::sync::Api;

    let api = Api::new().map_err(|e| EmbeddingError::Download(e.to_string()))?;
    let repo = api.model(cache.repo_id.clone());

    let staging = cache.staging_dir();
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    for name in MODEL_FILES {
        let fetched = repo
            .get(name)
            .map_err(|e| EmbeddingError::Download(format!("{name}: {e}")))?;
        std::fs::copy(&fetched, staging.join(name))?;
        debug!(file = name, "Model file fetched");
    }

    let model_dir = cache.model_dir();
    if model_dir.exists() {
        warn!(path = %model_dir.display(), "Replacing incomplete cached model");
        std::fs::remove_dir_all(&model_dir)?;
    }
    std::fs::rename(&staging, &model_dir)?;
    info!(path = %model_dir.display(), "Model cached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_model(dir: &Path, files: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        for f in files {
            std::fs::write(dir.join(f), b"{}").unwrap();
        }
    }

    #[test]
    fn test_default_cache_lives_under_papr() {
        let cache = ModelCache::default();
        assert!(cache.cache_dir.ends_with("papr/models"));
        assert_eq!(cache.repo_id, DEFAULT_MODEL_REPO);
    }

    #[test]
    fn test_model_dir_flattens_repo_id() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path(), "owner/model");
        assert!(!cache.is_cached());
        assert!(cache.model_dir().ends_with("owner_model"));
    }

    #[test]
    fn test_uncached_without_download_is_not_configured() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path(), "owner/model");
        let result = resolve_model(None, &cache, false);
        assert!(matches!(result, Err(EmbeddingError::NotConfigured(_))));
    }

    #[test]
    fn test_explicit_missing_dir() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path(), "owner/model");
        let result = resolve_model(Some(&temp.path().join("nope")), &cache, true);
        assert!(matches!(result, Err(EmbeddingError::ModelNotFound(_))));
    }

    #[test]
    fn test_explicit_dir_reports_missing_files() {
        let temp = TempDir::new().unwrap();
        write_model(temp.path(), &["config.json"]);
        let cache = ModelCache::new(temp.path().join("cache"), "owner/model");

        let err = resolve_model(Some(temp.path()), &cache, false).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("tokenizer.json"));
        assert!(message.contains("model.safetensors"));
        assert!(!message.contains("config.json"));
    }

    #[test]
    fn test_explicit_dir_with_files() {
        let temp = TempDir::new().unwrap();
        write_model(temp.path(), MODEL_FILES);
        let cache = ModelCache::new(temp.path().join("cache"), "owner/model");
        let paths = resolve_model(Some(temp.path()), &cache, false).unwrap();
        assert_eq!(paths.weights, temp.path().join("model.safetensors"));
    }

    #[test]
    fn test_cached_files_are_used() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path(), "owner/model");
        write_model(&cache.model_dir(), MODEL_FILES);
        let paths = resolve_model(None, &cache, false).unwrap();
        assert_eq!(paths.tokenizer, cache.file_path("tokenizer.json"));
    }

    #[test]
    fn test_partial_cache_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let cache = ModelCache::new(temp.path(), "owner/model");
        write_model(&cache.model_dir(), &["config.json", "tokenizer.json"]);
        assert!(!cache.is_cached());
        assert_eq!(
            ModelPaths::in_dir(&cache.model_dir()).missing(),
            vec!["model.safetensors"]
        );
    }
}

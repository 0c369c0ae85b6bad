//! Per-tier usearch HNSW index over cosine distance.
//!
//! Defaults: M = 16, ef_construction = 200, ef_search = 100. Candidates are
//! rescored exactly by the collection, so the index only has to get the
//! right ids into the oversampled window. RocksDB records stay authoritative
//! and the index is rebuilt from them whenever it cannot be trusted.

use std::path::Path;
use std::sync::RwLock;

use tracing::{debug, info};
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::error::VectorError;

/// Minimum capacity growth step.
const MIN_RESERVE: usize = 64;

/// HNSW index configuration
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Embedding dimension (must match model)
    pub dimension: usize,
    /// Number of connections per layer (M parameter)
    pub connectivity: usize,
    /// Build-time search depth (ef_construction)
    pub expansion_add: usize,
    /// Query-time search depth (ef_search)
    pub expansion_search: usize,
    /// Initial capacity; grows on demand
    pub capacity: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            dimension: papr_types::DEFAULT_EMBEDDING_DIM,
            connectivity: 16,
            expansion_add: 200,
            expansion_search: 100,
            capacity: 256,
        }
    }
}

impl HnswConfig {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            ..Default::default()
        }
    }

    pub fn with_connectivity(mut self, m: usize) -> Self {
        self.connectivity = m;
        self
    }

    pub fn with_expansion(mut self, ef_add: usize, ef_search: usize) -> Self {
        self.expansion_add = ef_add;
        self.expansion_search = ef_search;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn options(&self) -> IndexOptions {
        IndexOptions {
            dimensions: self.dimension,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: self.connectivity,
            expansion_add: self.expansion_add,
            expansion_search: self.expansion_search,
            multi: false,
        }
    }
}

/// HNSW index wrapper around usearch.
pub struct HnswIndex {
    index: RwLock<Index>,
    config: HnswConfig,
}

impl HnswIndex {
    /// Create an empty index.
    pub fn create(config: HnswConfig) -> Result<Self, VectorError> {
        let index = new_index(&config)?;
        Ok(Self {
            index: RwLock::new(index),
            config,
        })
    }

    /// Load a saved index. Fails when the file is missing or unreadable.
    pub fn load(config: HnswConfig, path: &Path) -> Result<Self, VectorError> {
        if !path.exists() {
            return Err(VectorError::Index(format!("{} not found", path.display())));
        }
        let index = Index::new(&config.options()).map_err(index_err)?;
        index
            .load(path_str(path)?)
            .map_err(|e| VectorError::Index(format!("{}: {e}", path.display())))?;
        if index.dimensions() != config.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: config.dimension,
                actual: index.dimensions(),
            });
        }
        debug!(path = ?path, vectors = index.size(), "Loaded vector index");
        Ok(Self {
            index: RwLock::new(index),
            config,
        })
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn len(&self) -> Result<usize, VectorError> {
        Ok(self.read()?.size())
    }

    pub fn is_empty(&self) -> Result<bool, VectorError> {
        Ok(self.len()? == 0)
    }

    pub fn contains(&self, key: u64) -> Result<bool, VectorError> {
        Ok(self.read()?.contains(key))
    }

    /// Insert or replace the vector under `key`.
    #[allow(clippy::readonly_write_lock)] // usearch::Index uses interior mutability
    pub fn add(&self, key: u64, vector: &[f32]) -> Result<(), VectorError> {
        if vector.len() != self.config.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }

        let index = self.write()?;
        if index.contains(key) {
            index.remove(key).map_err(index_err)?;
        }
        if index.size() + 1 > index.capacity() {
            let target = (index.capacity() * 2).max(index.size() + MIN_RESERVE);
            index.reserve(target).map_err(index_err)?;
        }
        index.add(key, vector).map_err(index_err)?;

        Ok(())
    }

    /// Returns `(key, cosine distance)` pairs, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>, VectorError> {
        if query.len() != self.config.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.config.dimension,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let index = self.read()?;
        let matches = index.search(query, k).map_err(index_err)?;

        Ok(matches.keys.into_iter().zip(matches.distances).collect())
    }

    #[allow(clippy::readonly_write_lock)] // usearch::Index uses interior mutability
    pub fn remove(&self, key: u64) -> Result<bool, VectorError> {
        let index = self.write()?;
        let removed = index.remove(key).map_err(index_err)?;
        Ok(removed > 0)
    }

    pub fn save(&self, path: &Path) -> Result<(), VectorError> {
        let index = self.read()?;
        index
            .save(path_str(path)?)
            .map_err(|e| VectorError::Index(format!("{}: {e}", path.display())))?;
        info!(path = ?path, vectors = index.size(), "Saved vector index");
        Ok(())
    }

    /// Replace with an empty index.
    pub fn clear(&self) -> Result<(), VectorError> {
        let fresh = new_index(&self.config)?;
        *self.write()? = fresh;
        debug!("Cleared vector index");
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Index>, VectorError> {
        self.index
            .read()
            .map_err(|e| VectorError::LockPoisoned(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Index>, VectorError> {
        self.index
            .write()
            .map_err(|e| VectorError::LockPoisoned(e.to_string()))
    }
}

fn new_index(config: &HnswConfig) -> Result<Index, VectorError> {
    let index = Index::new(&config.options()).map_err(index_err)?;
    index.reserve(config.capacity.max(MIN_RESERVE)).map_err(index_err)?;
    Ok(index)
}

fn index_err(e: impl std::fmt::Display) -> VectorError {
    VectorError::Index(e.to_string())
}

fn path_str(path: &Path) -> Result<&str, VectorError> {
    path.to_str()
        .ok_or_else(|| VectorError::Index("Invalid path encoding".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn random_vector(dim: usize) -> Vec<f32> {
        use rand::Rng;
        let mut rng = rand::rng();
        (0..dim).map(|_| rng.random::<f32>() + 0.01).collect()
    }

    #[test]
    fn test_create_index() {
        let index = HnswIndex::create(HnswConfig::new(16)).unwrap();
        assert_eq!(index.dimension(), 16);
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn test_add_and_search() {
        let index = HnswIndex::create(HnswConfig::new(16)).unwrap();
        for key in 0..10 {
            index.add(key, &random_vector(16)).unwrap();
        }
        assert_eq!(index.len().unwrap(), 10);

        let results = index.search(&random_vector(16), 5).unwrap();
        assert_eq!(results.len(), 5);
        for pair in results.windows(2) {
            assert!(pair[0].1 <= pair[1].1);
        }
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let index = HnswIndex::create(HnswConfig::new(8).with_capacity(4)).unwrap();
        for key in 0..200 {
            index.add(key, &random_vector(8)).unwrap();
        }
        assert_eq!(index.len().unwrap(), 200);
    }

    #[test]
    fn test_re_add_replaces() {
        let index = HnswIndex::create(HnswConfig::new(4)).unwrap();
        index.add(7, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add(7, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.len().unwrap(), 1);
        let hits = index.search(&[0.0, 1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].0, 7);
        assert!(hits[0].1.abs() < 1e-4);
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tier0.usearch");
        {
            let index = HnswIndex::create(HnswConfig::new(16)).unwrap();
            for key in 0..5 {
                index.add(key, &random_vector(16)).unwrap();
            }
            index.save(&path).unwrap();
        }
        let index = HnswIndex::load(HnswConfig::new(16), &path).unwrap();
        assert_eq!(index.len().unwrap(), 5);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let temp = TempDir::new().unwrap();
        let result = HnswIndex::load(HnswConfig::new(16), &temp.path().join("none.usearch"));
        assert!(result.is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let index = HnswIndex::create(HnswConfig::new(16)).unwrap();
        let result = index.add(0, &random_vector(8));
        assert!(matches!(result, Err(VectorError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_remove() {
        let index = HnswIndex::create(HnswConfig::new(16)).unwrap();
        index.add(42, &random_vector(16)).unwrap();
        assert!(index.contains(42).unwrap());
        assert!(index.remove(42).unwrap());
        assert!(!index.contains(42).unwrap());
    }

    #[test]
    fn test_clear() {
        let index = HnswIndex::create(HnswConfig::new(4)).unwrap();
        index.add(1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        index.clear().unwrap();
        assert!(index.is_empty().unwrap());
    }
}

//! Two-tier vector store scoped to one user.
//!
//! Layout under `<data_dir>/users/<user_key>/`:
//! - `manifest.json`: `{user_key, context_version, dimension}`
//! - `db/`: RocksDB with per-tier column families
//! - `tier0.usearch`, `tier1.usearch`: HNSW index files
//!
//! A missing or garbled manifest, a dimension change, or a context version
//! mismatch wipes the directory before opening.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use papr_types::Tier;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collection::{column_families, TierCollection, CF_META};
use crate::error::VectorError;
use crate::hnsw::HnswConfig;
use crate::record::{LogEntry, Metadata, MetadataFilter, QueryHit, UpsertOutcome, VectorRecord};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root holding `users/<user_key>/`
    pub data_dir: PathBuf,
    pub hnsw: HnswConfig,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            data_dir: data_dir.into(),
            hnsw: HnswConfig::new(dimension),
        }
    }

    pub fn dimension(&self) -> usize {
        self.hnsw.dimension
    }

    pub fn user_dir(&self, user_key: &str) -> PathBuf {
        self.data_dir.join("users").join(user_key)
    }
}

/// Identity of the on-disk cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub user_key: String,
    pub context_version: u64,
    pub dimension: usize,
}

/// Why an existing cache directory was wiped on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipeReason {
    MissingManifest,
    Corrupt,
    DimensionChanged,
    VersionMismatch,
}

/// Both tiers for one user.
pub struct VectorStore {
    root: PathBuf,
    manifest: Mutex<Manifest>,
    tier0: TierCollection,
    tier1: TierCollection,
    wiped: Option<WipeReason>,
}

impl VectorStore {
    /// Open or create the store for `user_key` at `context_version`.
    pub fn open(
        config: &StoreConfig,
        user_key: &str,
        context_version: u64,
    ) -> Result<Self, VectorError> {
        let root = config.user_dir(user_key);
        let expected = Manifest {
            user_key: user_key.to_string(),
            context_version,
            dimension: config.dimension(),
        };

        let wiped = check_manifest(&root, &expected);
        if let Some(reason) = wiped {
            warn!(user = user_key, ?reason, "Wiping local vector cache");
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;

        let db = Arc::new(open_db(&root.join("db"))?);
        let tier0 = TierCollection::open(
            Tier::Tier0,
            db.clone(),
            root.join("tier0.usearch"),
            config.hnsw.clone(),
        )?;
        let tier1 = TierCollection::open(
            Tier::Tier1,
            db,
            root.join("tier1.usearch"),
            config.hnsw.clone(),
        )?;

        write_manifest(&root, &expected)?;
        info!(
            user = user_key,
            version = context_version,
            tier0 = tier0.count(),
            tier1 = tier1.count(),
            "Opened vector store"
        );

        Ok(Self {
            root,
            manifest: Mutex::new(expected),
            tier0,
            tier1,
            wiped,
        })
    }

    pub fn collection(&self, tier: Tier) -> &TierCollection {
        match tier {
            Tier::Tier0 => &self.tier0,
            Tier::Tier1 => &self.tier1,
        }
    }

    pub fn upsert(
        &self,
        tier: Tier,
        id: &str,
        vector: &[f32],
        metadata: Metadata,
        document: &str,
    ) -> Result<UpsertOutcome, VectorError> {
        self.collection(tier).upsert(id, vector, metadata, document)
    }

    pub fn delete(&self, tier: Tier, ids: &[String]) -> Result<usize, VectorError> {
        self.collection(tier).delete(ids)
    }

    pub fn query(
        &self,
        tier: Tier,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<QueryHit>, VectorError> {
        self.collection(tier).query(vector, k, filter)
    }

    pub fn count(&self, tier: Tier) -> usize {
        self.collection(tier).count()
    }

    /// Destroy and recreate one tier.
    pub fn drop_tier(&self, tier: Tier) -> Result<(), VectorError> {
        self.collection(tier).drop_all()
    }

    pub fn get(&self, tier: Tier, id: &str) -> Result<Option<VectorRecord>, VectorError> {
        self.collection(tier).get(id)
    }

    pub fn ids(&self, tier: Tier) -> Result<Vec<String>, VectorError> {
        self.collection(tier).ids()
    }

    pub fn upsert_log(&self, tier: Tier, since: u64) -> Result<Vec<LogEntry>, VectorError> {
        self.collection(tier).upsert_log(since)
    }

    /// True when both tiers are empty. Cheap enough for the search path.
    pub fn is_empty(&self) -> bool {
        self.tier0.count() == 0 && self.tier1.count() == 0
    }

    /// Persist both index files.
    pub fn flush(&self) -> Result<(), VectorError> {
        self.tier0.flush()?;
        self.tier1.flush()
    }

    /// Record a new context version in the manifest.
    pub fn stamp_version(&self, context_version: u64) -> Result<(), VectorError> {
        let mut manifest = self
            .manifest
            .lock()
            .map_err(|e| VectorError::LockPoisoned(e.to_string()))?;
        if manifest.context_version != context_version {
            manifest.context_version = context_version;
            write_manifest(&self.root, &manifest)?;
        }
        Ok(())
    }

    /// Bring an already-open store to `context_version`.
    ///
    /// Same outcome as reopening it at that version: a different version
    /// empties both tiers. Use this instead of [`VectorStore::open`] while
    /// another handle to the same user directory is alive.
    pub fn reset_to_version(
        &self,
        context_version: u64,
    ) -> Result<Option<WipeReason>, VectorError> {
        if self.manifest().context_version == context_version {
            return Ok(None);
        }
        warn!(
            root = %self.root.display(),
            version = context_version,
            "Context version changed, clearing open vector store"
        );
        self.tier0.drop_all()?;
        self.tier1.drop_all()?;
        self.stamp_version(context_version)?;
        Ok(Some(WipeReason::VersionMismatch))
    }

    pub fn manifest(&self) -> Manifest {
        match self.manifest.lock() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Why the cache was wiped when opening, if it was.
    pub fn wiped(&self) -> Option<WipeReason> {
        self.wiped
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dimension(&self) -> usize {
        self.tier0.dimension()
    }
}

fn open_db(path: &Path) -> Result<DB, VectorError> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let mut descriptors = vec![ColumnFamilyDescriptor::new(CF_META, Options::default())];
    for tier in Tier::ALL {
        for name in column_families(tier) {
            descriptors.push(ColumnFamilyDescriptor::new(name, Options::default()));
        }
    }

    Ok(DB::open_cf_descriptors(&opts, path, descriptors)?)
}

fn check_manifest(root: &Path, expected: &Manifest) -> Option<WipeReason> {
    if !root.exists() {
        return None;
    }
    let path = root.join(MANIFEST_FILE);
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(_) => {
            // An empty directory carries nothing to distrust
            let has_entries = std::fs::read_dir(root)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(true);
            return has_entries.then_some(WipeReason::MissingManifest);
        }
    };
    let found: Manifest = match serde_json::from_slice(&bytes) {
        Ok(m) => m,
        Err(_) => return Some(WipeReason::Corrupt),
    };
    if found.user_key != expected.user_key {
        return Some(WipeReason::Corrupt);
    }
    if found.dimension != expected.dimension {
        return Some(WipeReason::DimensionChanged);
    }
    if found.context_version != expected.context_version {
        return Some(WipeReason::VersionMismatch);
    }
    None
}

fn write_manifest(root: &Path, manifest: &Manifest) -> Result<(), VectorError> {
    let tmp = root.join(format!("{}.tmp", MANIFEST_FILE));
    std::fs::write(&tmp, serde_json::to_vec_pretty(manifest)?)?;
    std::fs::rename(&tmp, root.join(MANIFEST_FILE))?;
    Ok(())
}

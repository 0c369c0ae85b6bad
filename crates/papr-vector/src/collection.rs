//! One tier's persistent collection.
//!
//! Records live in RocksDB under three column families per tier:
//! - `<tier>_records`: memory id -> record JSON
//! - `<tier>_keys`: index key (u64 BE) -> memory id
//! - `<tier>_log`: sequence (u64 BE) -> log entry JSON
//!
//! Each upsert or delete is one `WriteBatch`, so a crash leaves every id either
//! fully written or untouched. The HNSW index is rebuilt from records whenever
//! it disagrees with them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use papr_types::Tier;
use rocksdb::{ColumnFamily, IteratorMode, WriteBatch, DB};
use tracing::{debug, info, warn};

use crate::error::VectorError;
use crate::hnsw::{HnswConfig, HnswIndex};
use crate::record::{
    LogEntry, LogOp, Metadata, MetadataFilter, QueryHit, StoredRecord, UpsertOutcome,
    VectorRecord,
};

/// Column family holding per-tier counters.
pub const CF_META: &str = "meta";

/// Column family names for one tier.
pub fn column_families(tier: Tier) -> [String; 3] {
    [
        format!("{}_records", tier.as_str()),
        format!("{}_keys", tier.as_str()),
        format!("{}_log", tier.as_str()),
    ]
}

/// Smallest HNSW fetch when oversampling for filtered queries.
const MIN_FETCH: usize = 16;

/// A single tier: RocksDB records plus a derived HNSW index.
pub struct TierCollection {
    tier: Tier,
    db: Arc<DB>,
    index: HnswIndex,
    index_path: PathBuf,
    dimension: usize,
    cf_records: String,
    cf_keys: String,
    cf_log: String,
    writer: Mutex<()>,
    dirty: AtomicBool,
    /// Record count, seeded from RocksDB on open and kept under the writer lock
    len: AtomicUsize,
}

impl TierCollection {
    /// Open a tier over an already-opened database, healing the index.
    pub fn open(
        tier: Tier,
        db: Arc<DB>,
        index_path: PathBuf,
        config: HnswConfig,
    ) -> Result<Self, VectorError> {
        let [cf_records, cf_keys, cf_log] = column_families(tier);
        let dimension = config.dimension;

        let index = match HnswIndex::load(config.clone(), &index_path) {
            Ok(index) => index,
            Err(e) => {
                if index_path.exists() {
                    warn!(tier = %tier, error = %e, "Vector index unreadable, rebuilding");
                }
                HnswIndex::create(config)?
            }
        };

        let collection = Self {
            tier,
            db,
            index,
            index_path,
            dimension,
            cf_records,
            cf_keys,
            cf_log,
            writer: Mutex::new(()),
            dirty: AtomicBool::new(false),
            len: AtomicUsize::new(0),
        };
        collection.heal_index()?;
        Ok(collection)
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Insert or overwrite the record for `id`.
    pub fn upsert(
        &self,
        id: &str,
        vector: &[f32],
        metadata: Metadata,
        document: &str,
    ) -> Result<UpsertOutcome, VectorError> {
        if vector.len() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(VectorError::InvalidVector(id.to_string()));
        }

        let _guard = self.lock_writer()?;

        let existing = self.stored(id)?;
        if let Some(stored) = &existing {
            if stored.same_content(vector, &metadata, document) {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let mut batch = WriteBatch::default();
        let (key, outcome) = match &existing {
            Some(stored) => (stored.key, UpsertOutcome::Updated),
            None => {
                let key = self.next_counter("next_key")?;
                batch.put_cf(self.cf(CF_META)?, self.counter_name("next_key"), (key + 1).to_be_bytes());
                (key, UpsertOutcome::Inserted)
            }
        };

        let record = StoredRecord {
            key,
            vector: vector.to_vec(),
            metadata,
            document: document.to_string(),
        };
        batch.put_cf(self.cf(&self.cf_records)?, id.as_bytes(), serde_json::to_vec(&record)?);
        batch.put_cf(self.cf(&self.cf_keys)?, key.to_be_bytes(), id.as_bytes());
        self.append_log(&mut batch, id, LogOp::Upsert)?;
        self.db.write(batch)?;

        self.index.add(key, vector)?;
        self.dirty.store(true, Ordering::SeqCst);
        if outcome == UpsertOutcome::Inserted {
            self.len.fetch_add(1, Ordering::SeqCst);
        }

        debug!(tier = %self.tier, id, key, ?outcome, "Upserted record");
        Ok(outcome)
    }

    /// Delete records by id. Returns how many existed.
    pub fn delete(&self, ids: &[String]) -> Result<usize, VectorError> {
        let _guard = self.lock_writer()?;
        let mut removed = 0;

        for id in ids {
            let Some(stored) = self.stored(id)? else {
                continue;
            };
            let mut batch = WriteBatch::default();
            batch.delete_cf(self.cf(&self.cf_records)?, id.as_bytes());
            batch.delete_cf(self.cf(&self.cf_keys)?, stored.key.to_be_bytes());
            self.append_log(&mut batch, id, LogOp::Delete)?;
            self.db.write(batch)?;

            self.index.remove(stored.key)?;
            self.len.fetch_sub(1, Ordering::SeqCst);
            removed += 1;
        }

        if removed > 0 {
            self.dirty.store(true, Ordering::SeqCst);
            debug!(tier = %self.tier, removed, "Deleted records");
        }
        Ok(removed)
    }

    /// Nearest `k` records passing `filter`, ascending by exact cosine distance.
    ///
    /// HNSW candidates are over-fetched until `k` pass the filter or the tier
    /// is exhausted, then rescored against the stored vectors.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<QueryHit>, VectorError> {
        if vector.len() != self.dimension {
            return Err(VectorError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let total = self.index.len()?;
        if k == 0 || total == 0 {
            return Ok(Vec::new());
        }

        let mut fetch = (k * 2).max(MIN_FETCH).min(total);
        let mut hits = loop {
            let candidates = self.index.search(vector, fetch)?;
            let mut hits = Vec::with_capacity(candidates.len());
            for (key, _) in &candidates {
                let Some(id) = self.id_for_key(*key)? else {
                    continue;
                };
                let Some(stored) = self.stored(&id)? else {
                    continue;
                };
                if !filter.matches(&stored.metadata) {
                    continue;
                }
                hits.push(QueryHit {
                    distance: cosine_distance(vector, &stored.vector),
                    id,
                    metadata: stored.metadata,
                    document: stored.document,
                });
            }
            if hits.len() >= k || fetch >= total {
                break hits;
            }
            fetch = (fetch * 2).min(total);
        };

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Number of records. Does not touch RocksDB.
    pub fn count(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn get(&self, id: &str) -> Result<Option<VectorRecord>, VectorError> {
        Ok(self.stored(id)?.map(|s| s.into_record(id.to_string())))
    }

    /// All record ids, sorted.
    pub fn ids(&self) -> Result<Vec<String>, VectorError> {
        let mut ids = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(&self.cf_records)?, IteratorMode::Start)
        {
            let (key, _) = item?;
            ids.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(ids)
    }

    /// Log entries with `seq >= since`, in order.
    pub fn upsert_log(&self, since: u64) -> Result<Vec<LogEntry>, VectorError> {
        let start = since.to_be_bytes();
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(
            self.cf(&self.cf_log)?,
            IteratorMode::From(&start, rocksdb::Direction::Forward),
        ) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(&value)?);
        }
        Ok(entries)
    }

    /// Destroy all records, the log, and the index; the tier stays usable.
    pub fn drop_all(&self) -> Result<(), VectorError> {
        let _guard = self.lock_writer()?;

        for cf_name in [&self.cf_records, &self.cf_keys, &self.cf_log] {
            let cf = self.cf(cf_name)?;
            // Collect all keys first to avoid iterator invalidation
            let keys: Vec<Box<[u8]>> = self
                .db
                .iterator_cf(cf, IteratorMode::Start)
                .map(|item| item.map(|(k, _)| k))
                .collect::<Result<_, _>>()?;
            let mut batch = WriteBatch::default();
            for key in keys {
                batch.delete_cf(cf, key);
            }
            self.db.write(batch)?;
        }

        let meta = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(meta, self.counter_name("next_key"));
        batch.delete_cf(meta, self.counter_name("next_seq"));
        self.db.write(batch)?;

        self.index.clear()?;
        self.len.store(0, Ordering::SeqCst);
        if self.index_path.exists() {
            std::fs::remove_file(&self.index_path)?;
        }
        self.dirty.store(false, Ordering::SeqCst);

        info!(tier = %self.tier, "Dropped tier");
        Ok(())
    }

    /// Persist the index file if anything changed since the last flush.
    pub fn flush(&self) -> Result<(), VectorError> {
        if self.dirty.swap(false, Ordering::SeqCst) {
            if let Err(e) = self.index.save(&self.index_path) {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    /// Rebuild the index from records when it does not cover them exactly.
    fn heal_index(&self) -> Result<(), VectorError> {
        let mut records = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(&self.cf_records)?, IteratorMode::Start)
        {
            let (_, value) = item?;
            let stored: StoredRecord = serde_json::from_slice(&value)?;
            records.push(stored);
        }
        self.len.store(records.len(), Ordering::SeqCst);

        let mut consistent = self.index.len()? == records.len();
        if consistent {
            for stored in &records {
                if !self.index.contains(stored.key)? {
                    consistent = false;
                    break;
                }
            }
        }
        if consistent {
            return Ok(());
        }

        info!(tier = %self.tier, records = records.len(), "Rebuilding vector index from records");
        self.index.clear()?;
        for stored in &records {
            self.index.add(stored.key, &stored.vector)?;
        }
        self.dirty.store(true, Ordering::SeqCst);
        self.flush()
    }

    fn stored(&self, id: &str) -> Result<Option<StoredRecord>, VectorError> {
        match self.db.get_cf(self.cf(&self.cf_records)?, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn id_for_key(&self, key: u64) -> Result<Option<String>, VectorError> {
        Ok(self
            .db
            .get_cf(self.cf(&self.cf_keys)?, key.to_be_bytes())?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn append_log(&self, batch: &mut WriteBatch, id: &str, op: LogOp) -> Result<(), VectorError> {
        let seq = self.next_counter("next_seq")?;
        let entry = LogEntry {
            seq,
            id: id.to_string(),
            op,
            at: Utc::now(),
        };
        batch.put_cf(self.cf(&self.cf_log)?, seq.to_be_bytes(), serde_json::to_vec(&entry)?);
        batch.put_cf(self.cf(CF_META)?, self.counter_name("next_seq"), (seq + 1).to_be_bytes());
        Ok(())
    }

    fn counter_name(&self, name: &str) -> String {
        format!("{}:{}", self.tier.as_str(), name)
    }

    /// Read a per-tier counter. Callers hold the writer lock.
    fn next_counter(&self, name: &str) -> Result<u64, VectorError> {
        match self.db.get_cf(self.cf(CF_META)?, self.counter_name(name))? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    VectorError::Corrupt(format!("counter {} has {} bytes", name, bytes.len()))
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(1),
        }
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, VectorError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| VectorError::MissingColumnFamily(name.to_string()))
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, VectorError> {
        self.writer
            .lock()
            .map_err(|e| VectorError::LockPoisoned(e.to_string()))
    }
}

impl Drop for TierCollection {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(tier = %self.tier, error = %e, "Failed to persist vector index");
        }
    }
}

/// Exact cosine distance, `1 - cos`. Degenerate vectors are at distance 1.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
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
        return 1.0;
    }
    (1.0 - dot / (na.sqrt() * nb.sqrt())) as f32
}

//! Deduplicating, persistent embedding cache.
//!
//! `VectorCache` memorizes expensive per-key encoder outputs across process
//! runs. Keys (exact strings) map to row offsets in a growable, append-only,
//! memory-mapped half-precision store; misses are batch-encoded through an
//! injected [`BatchEncoder`] and appended. The cache guarantees that a key
//! seen once is never re-encoded, and that stored vectors are bit-identical
//! across runs.
//!
//! On-disk layout, per store directory:
//! - `key_index.json`: key → row offset (offsets are never reassigned)
//! - `store_meta.json`: capacity, stored count, dimensionality, precision
//! - `vectors_f16.bin`: primary half-precision region
//! - `vectors_f32_norm.bin`: derived full-precision L2-normalized region
//!
//! Single-writer: concurrent mutation of one store directory from multiple
//! processes is not supported and there is no internal locking. This is a
//! correctness precondition, not a performance hint.

mod store;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use half::f16;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::cache::store::{NormRegion, VectorStore, l2_normalize};

const INDEX_FILE: &str = "key_index.json";
const META_FILE: &str = "store_meta.json";
const VECTORS_FILE: &str = "vectors_f16.bin";
const NORM_FILE: &str = "vectors_f32_norm.bin";

/// First growth allocates this many rows even when fewer are needed.
const INITIAL_CAPACITY: usize = 1024;
/// Rows normalized per pass when extending the derived region.
const NORM_CHUNK_ROWS: usize = 8192;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum CacheError {
    /// Disk failure while mutating the store. Fatal for the run; the
    /// tmp-then-rename discipline guarantees no partial region is left.
    Io(String),
    /// Index/metadata inconsistent with the data region. Recovered at open
    /// time by resetting the store; surfaced only for unrecoverable reads.
    Corrupt(String),
    /// The batch encoder failed; the offending batch is identified so no
    /// vector is silently dropped.
    Encoder { batch_start: usize, reason: String },
    /// Encoder output dimensionality disagrees with the store.
    Dimension { expected: usize, got: usize },
    Invalid(String),
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheError::Io(e) => write!(f, "IO error: {}", e),
            CacheError::Corrupt(e) => write!(f, "Corrupt store: {}", e),
            CacheError::Encoder { batch_start, reason } => {
                write!(f, "Encoder failed on batch starting at {}: {}", batch_start, reason)
            }
            CacheError::Dimension { expected, got } => {
                write!(f, "Vector dimension {} does not match store dimension {}", got, expected)
            }
            CacheError::Invalid(e) => write!(f, "Invalid: {}", e),
        }
    }
}

impl std::error::Error for CacheError {}

pub type CacheResult<T> = Result<T, CacheError>;

// ============================================================================
// Collaborator contract
// ============================================================================

/// Batch text encoder: a pure function of its input strings, invocable with
/// arbitrary sub-batches in any order. `encode` returns one vector of
/// [`dimension`](Self::dimension) values per input key.
pub trait BatchEncoder {
    fn dimension(&self) -> usize;
    fn encode(&mut self, keys: &[&str]) -> Result<Vec<Vec<f32>>, String>;
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub dimension: usize,
    /// Keys per encoder invocation.
    pub batch_size: usize,
    /// Upper bound on persisted rows; `None` means unbounded.
    pub max_rows: Option<usize>,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>, dimension: usize) -> Self {
        Self {
            dir: dir.into(),
            dimension,
            batch_size: 32,
            max_rows: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

// ============================================================================
// Persisted metadata
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    capacity: usize,
    stored_count: usize,
    dimension: usize,
    precision: String,
}

// ============================================================================
// VectorCache
// ============================================================================

/// The cache handle. Explicit lifecycle: [`open`](Self::open) loads or
/// recovers the on-disk state, every successful `embed_many` persists it,
/// [`flush`](Self::flush) persists on demand and `Drop` flushes best-effort.
pub struct VectorCache {
    config: CacheConfig,
    index: HashMap<String, usize>,
    stored: usize,
    store: VectorStore,
    norm: NormRegion,
    dirty: bool,
}

/// Deduplicated view of one `embed_many` key list, plus the vectors that
/// could not be persisted this call (capacity cap reached).
struct Resolved {
    unique: Vec<String>,
    pos_to_slot: Vec<usize>,
    overflow: HashMap<usize, Vec<f32>>,
}

impl VectorCache {
    /// Open (or create) the store under `config.dir`.
    ///
    /// Any inconsistency between index, metadata and the data region is
    /// treated as corruption: the store is reset to empty and the reason is
    /// logged, so a damaged cache costs recomputation, never a failed run.
    pub fn open(config: CacheConfig) -> CacheResult<Self> {
        if config.dimension == 0 {
            return Err(CacheError::Invalid("dimension must be positive".to_string()));
        }
        std::fs::create_dir_all(&config.dir).map_err(|e| CacheError::Io(e.to_string()))?;
        let norm = NormRegion::new(&config.dir.join(NORM_FILE), config.dimension);

        match Self::load_state(&config) {
            Ok((index, meta, store)) => {
                let cache = Self {
                    config,
                    index,
                    stored: meta.stored_count,
                    store,
                    norm,
                    dirty: false,
                };
                // A derived region longer than the source means it was built
                // against different data.
                if cache.norm.rows()? > cache.stored {
                    warn!("normalized region longer than store, resetting it");
                    cache.norm.reset();
                }
                info!(
                    "opened vector store at {:?}: {} keys, {}/{} rows",
                    cache.config.dir,
                    cache.index.len(),
                    cache.stored,
                    cache.store.capacity()
                );
                Ok(cache)
            }
            Err(e) => {
                warn!("vector store at {:?} unusable ({}), resetting", config.dir, e);
                let _ = std::fs::remove_file(config.dir.join(INDEX_FILE));
                let _ = std::fs::remove_file(config.dir.join(META_FILE));
                let _ = std::fs::remove_file(config.dir.join(VECTORS_FILE));
                norm.reset();
                let store = VectorStore::open(&config.dir.join(VECTORS_FILE), config.dimension, 0)?;
                Ok(Self {
                    config,
                    index: HashMap::new(),
                    stored: 0,
                    store,
                    norm,
                    dirty: false,
                })
            }
        }
    }

    fn load_state(config: &CacheConfig) -> CacheResult<(HashMap<String, usize>, StoreMeta, VectorStore)> {
        let meta_path = config.dir.join(META_FILE);
        if !meta_path.exists() {
            // Fresh directory: empty store, nothing to validate.
            let store = VectorStore::open(&config.dir.join(VECTORS_FILE), config.dimension, 0)?;
            return Ok((
                HashMap::new(),
                StoreMeta {
                    capacity: 0,
                    stored_count: 0,
                    dimension: config.dimension,
                    precision: "f16".to_string(),
                },
                store,
            ));
        }
        let meta_json =
            std::fs::read_to_string(&meta_path).map_err(|e| CacheError::Io(e.to_string()))?;
        let meta: StoreMeta = serde_json::from_str(&meta_json)
            .map_err(|e| CacheError::Corrupt(format!("unreadable metadata: {}", e)))?;
        if meta.dimension != config.dimension {
            return Err(CacheError::Dimension {
                expected: config.dimension,
                got: meta.dimension,
            });
        }
        if meta.precision != "f16" {
            return Err(CacheError::Corrupt(format!(
                "unsupported precision '{}'",
                meta.precision
            )));
        }
        if meta.stored_count > meta.capacity {
            return Err(CacheError::Corrupt(format!(
                "stored count {} exceeds capacity {}",
                meta.stored_count, meta.capacity
            )));
        }
        let index_json = std::fs::read_to_string(config.dir.join(INDEX_FILE))
            .map_err(|e| CacheError::Corrupt(format!("unreadable index: {}", e)))?;
        let index: HashMap<String, usize> = serde_json::from_str(&index_json)
            .map_err(|e| CacheError::Corrupt(format!("unparseable index: {}", e)))?;
        if index.len() != meta.stored_count {
            return Err(CacheError::Corrupt(format!(
                "index has {} keys, metadata claims {} stored rows",
                index.len(),
                meta.stored_count
            )));
        }
        if index.values().any(|&row| row >= meta.stored_count) {
            return Err(CacheError::Corrupt(
                "index references an unwritten row".to_string(),
            ));
        }
        let store = VectorStore::open(&config.dir.join(VECTORS_FILE), config.dimension, meta.capacity)?;
        Ok((index, meta, store))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Embed every key, encoding only unseen ones, and return the
    /// `len(keys) x D` matrix of raw (f16-dequantized) rows. Duplicate keys
    /// share one encoding and one stored row but each original position gets
    /// its row in the output.
    pub fn embed_many<E: BatchEncoder>(
        &mut self,
        keys: &[String],
        encoder: &mut E,
    ) -> CacheResult<DenseMatrix<f64>> {
        let resolved = self.resolve(keys, encoder)?;
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(keys.len());
        for &slot in &resolved.pos_to_slot {
            let row_f32 = match self.index.get(&resolved.unique[slot]) {
                Some(&row) => self.store.read_row(row)?,
                None => resolved
                    .overflow
                    .get(&slot)
                    .cloned()
                    .ok_or_else(|| CacheError::Invalid(format!(
                        "key '{}' neither stored nor in overflow",
                        resolved.unique[slot]
                    )))?,
            };
            rows.push(row_f32.iter().map(|&v| v as f64).collect());
        }
        DenseMatrix::from_2d_vec(&rows).map_err(|e| CacheError::Invalid(e.to_string()))
    }

    /// Like [`embed_many`](Self::embed_many) but returning full-precision
    /// L2-normalized rows, the form the clustering engine consumes. The
    /// normalized rows are derived from the store lazily and cached in the
    /// `vectors_f32_norm.bin` region, so re-runs skip the work.
    pub fn embed_many_normalized<E: BatchEncoder>(
        &mut self,
        keys: &[String],
        encoder: &mut E,
    ) -> CacheResult<DenseMatrix<f64>> {
        let resolved = self.resolve(keys, encoder)?;
        self.extend_norm_region()?;
        let mut rows: Vec<Vec<f64>> = Vec::with_capacity(keys.len());
        for &slot in &resolved.pos_to_slot {
            let row_f32 = match self.index.get(&resolved.unique[slot]) {
                Some(&row) => self.norm.read_row(row)?,
                None => {
                    let raw = resolved.overflow.get(&slot).ok_or_else(|| {
                        CacheError::Invalid(format!(
                            "key '{}' neither stored nor in overflow",
                            resolved.unique[slot]
                        ))
                    })?;
                    l2_normalize(raw)
                }
            };
            rows.push(row_f32.iter().map(|&v| v as f64).collect());
        }
        DenseMatrix::from_2d_vec(&rows).map_err(|e| CacheError::Invalid(e.to_string()))
    }

    /// Dedup, partition into hits/misses, grow, encode misses, persist.
    fn resolve<E: BatchEncoder>(&mut self, keys: &[String], encoder: &mut E) -> CacheResult<Resolved> {
        if encoder.dimension() != self.config.dimension {
            return Err(CacheError::Dimension {
                expected: self.config.dimension,
                got: encoder.dimension(),
            });
        }

        let mut unique: Vec<String> = Vec::new();
        let mut slot_of: HashMap<&str, usize> = HashMap::new();
        let mut pos_to_slot = Vec::with_capacity(keys.len());
        for key in keys {
            let slot = match slot_of.get(key.as_str()) {
                Some(&s) => s,
                None => {
                    let s = unique.len();
                    unique.push(key.clone());
                    slot_of.insert(key.as_str(), s);
                    s
                }
            };
            pos_to_slot.push(slot);
        }

        let to_compute: Vec<usize> = (0..unique.len())
            .filter(|&s| !self.index.contains_key(&unique[s]))
            .collect();
        debug!(
            "embed_many: {} keys, {} unique, {} to compute",
            keys.len(),
            unique.len(),
            to_compute.len()
        );

        let mut overflow: HashMap<usize, Vec<f32>> = HashMap::new();
        if !to_compute.is_empty() {
            self.ensure_capacity(to_compute.len())?;

            for batch in to_compute.chunks(self.config.batch_size) {
                let batch_start = batch[0];
                let batch_keys: Vec<&str> = batch.iter().map(|&s| unique[s].as_str()).collect();
                let vectors = encoder.encode(&batch_keys).map_err(|reason| {
                    CacheError::Encoder { batch_start, reason }
                })?;
                if vectors.len() != batch.len() {
                    return Err(CacheError::Encoder {
                        batch_start,
                        reason: format!(
                            "returned {} vectors for {} keys",
                            vectors.len(),
                            batch.len()
                        ),
                    });
                }
                for (&slot, vector) in batch.iter().zip(vectors) {
                    if vector.len() != self.config.dimension {
                        return Err(CacheError::Dimension {
                            expected: self.config.dimension,
                            got: vector.len(),
                        });
                    }
                    if self.stored < self.store.capacity() {
                        let row = self.stored;
                        self.store.write_row(row, &vector)?;
                        self.index.insert(unique[slot].clone(), row);
                        self.stored += 1;
                        self.dirty = true;
                    } else {
                        // Same f16 round-trip as the store, so a key's row is
                        // identical whether or not it was persisted.
                        let quantized = vector
                            .iter()
                            .map(|&v| f16::from_f32(v).to_f32())
                            .collect();
                        overflow.insert(slot, quantized);
                    }
                }
            }
            if !overflow.is_empty() {
                warn!(
                    "store at {:?} reached its row cap; {} vectors computed this call will not persist",
                    self.config.dir,
                    overflow.len()
                );
            }
            self.flush()?;
        }

        Ok(Resolved {
            unique,
            pos_to_slot,
            overflow,
        })
    }

    /// Grow the primary region when free capacity cannot hold `needed` new
    /// rows. New capacity is `max(capacity * 2, capacity + needed)`, at least
    /// [`INITIAL_CAPACITY`] on first growth, clamped to `max_rows`. Once the
    /// cap is reached, growth is refused and callers fall back to transient
    /// overflow.
    fn ensure_capacity(&mut self, needed: usize) -> CacheResult<()> {
        let free = self.store.capacity() - self.stored;
        if free >= needed {
            return Ok(());
        }
        if let Some(max) = self.config.max_rows {
            if self.store.capacity() >= max {
                return Ok(());
            }
        }
        let base = if self.store.capacity() == 0 {
            INITIAL_CAPACITY
        } else {
            self.store.capacity() * 2
        };
        let mut new_capacity = base.max(self.stored + needed);
        if let Some(max) = self.config.max_rows {
            new_capacity = new_capacity.min(max);
        }
        self.store.grow(new_capacity, self.stored)?;
        self.dirty = true;
        Ok(())
    }

    /// Bring the derived normalized region up to `stored` rows, in chunks.
    fn extend_norm_region(&mut self) -> CacheResult<()> {
        let mut derived = self.norm.rows()?;
        while derived < self.stored {
            let end = (derived + NORM_CHUNK_ROWS).min(self.stored);
            let mut chunk = Vec::with_capacity(end - derived);
            for row in derived..end {
                chunk.push(l2_normalize(&self.store.read_row(row)?));
            }
            self.norm.append_rows(&chunk)?;
            derived = end;
        }
        Ok(())
    }

    /// Persist index and metadata (tmp then rename) and flush the map.
    pub fn flush(&mut self) -> CacheResult<()> {
        self.store.flush()?;
        let meta = StoreMeta {
            capacity: self.store.capacity(),
            stored_count: self.stored,
            dimension: self.config.dimension,
            precision: "f16".to_string(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| CacheError::Invalid(format!("Failed to serialize metadata: {}", e)))?;
        write_atomic(&self.config.dir.join(META_FILE), meta_json.as_bytes())?;
        let index_json = serde_json::to_string(&self.index)
            .map_err(|e| CacheError::Invalid(format!("Failed to serialize index: {}", e)))?;
        write_atomic(&self.config.dir.join(INDEX_FILE), index_json.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for VectorCache {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                warn!("flush on drop failed: {}", e);
            }
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| CacheError::Io(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| CacheError::Io(e.to_string()))?;
    Ok(())
}

//! Memory-mapped vector regions backing the embedding cache.
//!
//! Two on-disk regions per store directory:
//! - `vectors_f16.bin`: the primary region: `capacity` fixed-length rows of
//!   half-precision little-endian values, written in place through a mutable
//!   memory map. Grown (never shrunk) via a temporary file and an atomic
//!   rename, so a crash mid-growth leaves the old region intact.
//! - `vectors_f32_norm.bin`: a derived region of full-precision
//!   L2-normalized rows, appended lazily in row order. Row `r` here is the
//!   normalized form of row `r` in the primary region.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use half::f16;
use log::{debug, trace};
use memmap2::MmapMut;

use crate::cache::{CacheError, CacheResult};

pub(crate) const F16_WIDTH: usize = 2;
pub(crate) const F32_WIDTH: usize = 4;

// ============================================================================
// Primary region
// ============================================================================

/// The primary half-precision region. `capacity` rows of `dim` values;
/// callers track how many of those rows hold data.
pub(crate) struct VectorStore {
    path: PathBuf,
    dim: usize,
    capacity: usize,
    map: Option<MmapMut>,
}

impl VectorStore {
    /// Map an existing region, verifying its length against the declared
    /// capacity. A zero-capacity store has no file and no map.
    pub(crate) fn open(path: &Path, dim: usize, capacity: usize) -> CacheResult<Self> {
        if capacity == 0 {
            return Ok(Self {
                path: path.to_path_buf(),
                dim,
                capacity: 0,
                map: None,
            });
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CacheError::Corrupt(format!("cannot open vector region: {}", e)))?;
        let expected = (capacity * dim * F16_WIDTH) as u64;
        let actual = file
            .metadata()
            .map_err(|e| CacheError::Io(e.to_string()))?
            .len();
        if actual != expected {
            return Err(CacheError::Corrupt(format!(
                "vector region is {} bytes, metadata implies {}",
                actual, expected
            )));
        }
        // Single-writer precondition: no other process maps this file.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| CacheError::Io(e.to_string()))?;
        Ok(Self {
            path: path.to_path_buf(),
            dim,
            capacity,
            map: Some(map),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grow the region to `new_capacity` rows: build a temporary file of the
    /// new length, copy the first `stored` rows over, atomically replace the
    /// old file, remap. Any I/O failure aborts with the old region untouched.
    pub(crate) fn grow(&mut self, new_capacity: usize, stored: usize) -> CacheResult<()> {
        debug!(
            "growing vector region {:?}: {} -> {} rows ({} stored)",
            self.path, self.capacity, new_capacity, stored
        );
        let tmp_path = self.path.with_extension("bin.tmp");
        {
            let mut tmp = File::create(&tmp_path).map_err(|e| CacheError::Io(e.to_string()))?;
            tmp.set_len((new_capacity * self.dim * F16_WIDTH) as u64)
                .map_err(|e| CacheError::Io(e.to_string()))?;
            if let Some(map) = &self.map {
                let live = stored * self.dim * F16_WIDTH;
                tmp.write_all(&map[..live])
                    .map_err(|e| CacheError::Io(e.to_string()))?;
            }
            tmp.flush().map_err(|e| CacheError::Io(e.to_string()))?;
        }
        // Unmap before replacing the backing file.
        self.map = None;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| CacheError::Io(e.to_string()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| CacheError::Io(e.to_string()))?;
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| CacheError::Io(e.to_string()))?;
        self.map = Some(map);
        self.capacity = new_capacity;
        Ok(())
    }

    /// Quantize `values` to f16 and write them at `row`.
    pub(crate) fn write_row(&mut self, row: usize, values: &[f32]) -> CacheResult<()> {
        debug_assert_eq!(values.len(), self.dim);
        if row >= self.capacity {
            return Err(CacheError::Invalid(format!(
                "row {} outside capacity {}",
                row, self.capacity
            )));
        }
        let map = self
            .map
            .as_mut()
            .ok_or_else(|| CacheError::Invalid("write into unmapped region".to_string()))?;
        let start = row * self.dim * F16_WIDTH;
        for (j, &v) in values.iter().enumerate() {
            let bytes = f16::from_f32(v).to_le_bytes();
            let at = start + j * F16_WIDTH;
            map[at..at + F16_WIDTH].copy_from_slice(&bytes);
        }
        trace!("wrote row {} to {:?}", row, self.path);
        Ok(())
    }

    /// Dequantize row `row` back to f32.
    pub(crate) fn read_row(&self, row: usize) -> CacheResult<Vec<f32>> {
        if row >= self.capacity {
            return Err(CacheError::Invalid(format!(
                "row {} outside capacity {}",
                row, self.capacity
            )));
        }
        let map = self
            .map
            .as_ref()
            .ok_or_else(|| CacheError::Invalid("read from unmapped region".to_string()))?;
        let start = row * self.dim * F16_WIDTH;
        let mut out = Vec::with_capacity(self.dim);
        for j in 0..self.dim {
            let at = start + j * F16_WIDTH;
            out.push(f16::from_le_bytes([map[at], map[at + 1]]).to_f32());
        }
        Ok(out)
    }

    pub(crate) fn flush(&self) -> CacheResult<()> {
        if let Some(map) = &self.map {
            map.flush().map_err(|e| CacheError::Io(e.to_string()))?;
        }
        Ok(())
    }
}

// ============================================================================
// Derived normalized region
// ============================================================================

/// The derived full-precision L2-normalized region. Append-only: rows are
/// written once, in primary-region row order, and the row count is inferred
/// from the file length so no extra metadata is needed.
pub(crate) struct NormRegion {
    path: PathBuf,
    dim: usize,
}

impl NormRegion {
    pub(crate) fn new(path: &Path, dim: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            dim,
        }
    }

    /// Rows currently derived, from the file length (0 when absent).
    pub(crate) fn rows(&self) -> CacheResult<usize> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() as usize / (self.dim * F32_WIDTH)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CacheError::Io(e.to_string())),
        }
    }

    /// Drop the region; it will be re-derived on demand.
    pub(crate) fn reset(&self) {
        let _ = std::fs::remove_file(&self.path);
    }

    /// Append rows in order. Callers guarantee each row follows the last
    /// derived one.
    pub(crate) fn append_rows(&self, rows: &[Vec<f32>]) -> CacheResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| CacheError::Io(e.to_string()))?;
        let mut buf = Vec::with_capacity(rows.len() * self.dim * F32_WIDTH);
        for row in rows {
            debug_assert_eq!(row.len(), self.dim);
            for &v in row {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        file.write_all(&buf).map_err(|e| CacheError::Io(e.to_string()))?;
        file.flush().map_err(|e| CacheError::Io(e.to_string()))?;
        trace!("appended {} normalized rows to {:?}", rows.len(), self.path);
        Ok(())
    }

    pub(crate) fn read_row(&self, row: usize) -> CacheResult<Vec<f32>> {
        let mut file = File::open(&self.path).map_err(|e| CacheError::Io(e.to_string()))?;
        file.seek(SeekFrom::Start((row * self.dim * F32_WIDTH) as u64))
            .map_err(|e| CacheError::Io(e.to_string()))?;
        let mut bytes = vec![0u8; self.dim * F32_WIDTH];
        file.read_exact(&mut bytes).map_err(|e| {
            CacheError::Corrupt(format!("normalized region truncated at row {}: {}", row, e))
        })?;
        let mut out = Vec::with_capacity(self.dim);
        for chunk in bytes.chunks_exact(F32_WIDTH) {
            out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        Ok(out)
    }
}

/// `v / (||v|| + epsilon)`; the epsilon keeps all-zero vectors finite.
pub(crate) fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm + 1e-8;
    v.iter().map(|x| x / denom).collect()
}

//! Shared test fixtures: deterministic data generators, a recording
//! progress sink, and encoder doubles for the cache tests.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cache::BatchEncoder;
use crate::progress::ProgressSink;

/// Points drawn around the given centers, `per_center` each, uniform noise.
pub fn make_blobs(centers: &[Vec<f64>], per_center: usize, noise: f64, seed: u64) -> Vec<Vec<f64>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut rows = Vec::with_capacity(centers.len() * per_center);
    for center in centers {
        for _ in 0..per_center {
            rows.push(
                center
                    .iter()
                    .map(|&c| c + noise * (rng.random::<f64>() - 0.5))
                    .collect(),
            );
        }
    }
    rows
}

/// Two well-separated blobs in `dim` dimensions, `per_center` points each.
pub fn make_two_blobs(per_center: usize, dim: usize, seed: u64) -> Vec<Vec<f64>> {
    let mut near = vec![0.0; dim];
    let mut far = vec![0.0; dim];
    near[0] = -5.0;
    far[0] = 5.0;
    make_blobs(&[near.clone(), far.clone()], per_center, 0.5, seed)
}

// -------------------- Progress recording --------------------

/// Sink capturing every protocol line for later assertions.
pub struct RecordingSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl RecordingSink {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                lines: Arc::clone(&lines),
            },
            lines,
        )
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&mut self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}

/// Percentages from the recorded `PROGRESS:` lines, in emission order.
pub fn progress_values(lines: &[String]) -> Vec<u32> {
    lines
        .iter()
        .filter_map(|l| l.strip_prefix("PROGRESS: "))
        .map(|v| v.parse().unwrap())
        .collect()
}

pub fn done_count(lines: &[String]) -> usize {
    lines.iter().filter(|l| l.as_str() == "DONE").count()
}

// -------------------- Encoder doubles --------------------

/// Deterministic encoder: each key hashes to a reproducible vector, and
/// every encoded key is recorded so tests can assert cache-hit behavior.
pub struct HashEncoder {
    dim: usize,
    pub encoded: Vec<String>,
}

impl HashEncoder {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            encoded: Vec::new(),
        }
    }

    pub fn times_encoded(&self, key: &str) -> usize {
        self.encoded.iter().filter(|k| k.as_str() == key).count()
    }

    pub fn vector_for(&self, key: &str) -> Vec<f32> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let mut rng = StdRng::seed_from_u64(hasher.finish());
        (0..self.dim).map(|_| rng.random::<f32>()).collect()
    }
}

impl BatchEncoder for HashEncoder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn encode(&mut self, keys: &[&str]) -> Result<Vec<Vec<f32>>, String> {
        self.encoded.extend(keys.iter().map(|k| k.to_string()));
        Ok(keys.iter().map(|k| self.vector_for(k)).collect())
    }
}

/// Encoder placing keys into two far-apart groups by prefix, so clustering
/// over the embeddings is trivially separable.
pub struct PrefixEncoder {
    dim: usize,
}

impl PrefixEncoder {
    pub fn new(dim: usize) -> Self {
        assert!(dim >= 2);
        Self { dim }
    }
}

impl BatchEncoder for PrefixEncoder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn encode(&mut self, keys: &[&str]) -> Result<Vec<Vec<f32>>, String> {
        Ok(keys
            .iter()
            .map(|k| {
                let mut v = vec![0.0f32; self.dim];
                if k.starts_with("alpha") {
                    v[0] = 10.0;
                } else {
                    v[1] = 10.0;
                }
                v
            })
            .collect())
    }
}

/// Encoder that always fails, for error-propagation tests.
pub struct FailingEncoder {
    pub dim: usize,
}

impl BatchEncoder for FailingEncoder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn encode(&mut self, _keys: &[&str]) -> Result<Vec<Vec<f32>>, String> {
        Err("model unavailable".to_string())
    }
}

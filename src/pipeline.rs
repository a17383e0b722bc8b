//! End-to-end clustering run: stage accounting and the synchronous driver.
//!
//! The pipeline is 8 named stages. Each costs one progress unit except the
//! model fit, whose cost is the engine's own internal step count, so a
//! single percentage spans the whole run including every split. The first
//! two stages (parsing and tokenization) belong to the caller: it advances
//! their units on the shared tracker before handing over to
//! [`run_clustering`], which drives the remaining six.
//!
//! Everything is single-threaded and synchronous; long steps block and the
//! tracker is the only observability channel while they do.

use log::info;

use crate::bisect::{BisectingEngine, ClusterError};
use crate::cache::{BatchEncoder, CacheError, VectorCache};
use crate::matrix::{FeatureMatrix, MatrixError};
use crate::metrics::{calinski_harabasz, davies_bouldin, silhouette};
use crate::progress::{ProgressTracker, bisecting_units};

/// Pipeline stages in execution order.
pub const STAGES: [&str; 8] = [
    "read_and_parse",
    "extract_and_tokenize",
    "embed_keys",
    "vectorize_other_features",
    "combine_and_sample",
    "fit_model_on_sample",
    "assign_and_save",
    "evaluate_and_finish",
];

/// Unit cost of one stage on the shared progress scale.
pub fn stage_units(stage: &str, n_clusters: usize) -> usize {
    if stage == "fit_model_on_sample" {
        bisecting_units(n_clusters)
    } else {
        1
    }
}

/// Total unit budget for one run; size the shared tracker with this.
pub fn total_units(n_clusters: usize) -> usize {
    STAGES.iter().map(|s| stage_units(s, n_clusters)).sum()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum PipelineError {
    Cluster(ClusterError),
    Cache(CacheError),
    Matrix(MatrixError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Cluster(e) => write!(f, "Clustering failed: {}", e),
            PipelineError::Cache(e) => write!(f, "Embedding cache failed: {}", e),
            PipelineError::Matrix(e) => write!(f, "Feature combination failed: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ClusterError> for PipelineError {
    fn from(e: ClusterError) -> Self {
        PipelineError::Cluster(e)
    }
}

impl From<CacheError> for PipelineError {
    fn from(e: CacheError) -> Self {
        PipelineError::Cache(e)
    }
}

impl From<MatrixError> for PipelineError {
    fn from(e: MatrixError) -> Self {
        PipelineError::Matrix(e)
    }
}

// ============================================================================
// Driver
// ============================================================================

/// Everything one run produces: per-row labels, fitted centers (kept inside
/// the engine for later `predict` calls), inertia, and the optional quality
/// scores.
#[derive(Debug)]
pub struct ClusteringOutcome {
    pub labels: Vec<usize>,
    pub inertia: f64,
    pub silhouette: Option<f64>,
    pub calinski_harabasz: Option<f64>,
    pub davies_bouldin: Option<f64>,
}

/// Drive stages 3-8 on a shared tracker: embed `keys` through the cache
/// (normalized, full precision), concatenate with the externally produced
/// feature blocks, fit, assign via `predict`, evaluate, complete.
///
/// `tracker` must be sized by [`total_units`] for the engine's cluster
/// count, with the first two stages' units already advanced by the caller.
/// Row order of `keys` and every block in `extra_blocks` must match.
pub fn run_clustering<E: BatchEncoder>(
    keys: &[String],
    extra_blocks: &[FeatureMatrix],
    encoder: &mut E,
    cache: &mut VectorCache,
    engine: &mut BisectingEngine,
    tracker: &mut ProgressTracker,
) -> Result<ClusteringOutcome, PipelineError> {
    info!(
        "pipeline: {} keys, {} extra feature blocks, k={}",
        keys.len(),
        extra_blocks.len(),
        engine.config().n_clusters
    );

    tracker.set_status("Embedding keys");
    let embedded = cache.embed_many_normalized(keys, encoder)?;
    tracker.advance(1);

    tracker.set_status("Collecting feature blocks");
    let mut blocks = Vec::with_capacity(1 + extra_blocks.len());
    blocks.push(FeatureMatrix::Dense(embedded));
    blocks.extend_from_slice(extra_blocks);
    tracker.advance(1);

    tracker.set_status("Combining feature blocks");
    let combined = FeatureMatrix::hstack(&blocks)?;
    tracker.advance(1);

    let fit = engine.fit(&combined, None, Some(&mut *tracker))?;

    tracker.set_status("Assigning cluster labels");
    let labels = engine.predict(&combined)?;
    tracker.advance(1);

    tracker.set_status("Evaluating clusters");
    let sil = silhouette(&combined, &labels);
    let ch = calinski_harabasz(&combined, &labels);
    let db = davies_bouldin(&combined, &labels);
    tracker.advance(1);
    tracker.complete();

    Ok(ClusteringOutcome {
        labels,
        inertia: fit.inertia,
        silhouette: sil,
        calinski_harabasz: ch,
        davies_bouldin: db,
    })
}

//! Divisive ("bisecting") clustering engine.
//!
//! `BisectingEngine` repeatedly splits the worst current cluster in two with
//! a seeded 2-means sub-clustering until the target cluster count is
//! reached, reporting fine-grained progress throughout:
//! - `SplitStrategy`: which leaf to bisect next (largest inertia or largest
//!   population, with deterministic tie-breaking)
//! - arena-backed `BisectingTree` holding the split hierarchy
//! - `fit` producing labels, centers and an inertia score; `predict`
//!   assigning new rows to the fitted centers
//!
//! **DETERMINISTIC**: all random restarts derive their seed from the
//! configured base seed and the split step, so a fixed seed, input and k
//! reproduce identical labels and centers.

use std::str::FromStr;

use log::{debug, info, trace, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use smartcore::linalg::basic::matrix::DenseMatrix;

use crate::matrix::FeatureMatrix;
use crate::progress::{ProgressTracker, bisecting_units};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum ClusterError {
    /// Bad k, bad weights, bad input shape. Never retried.
    InvalidParameter(String),
    /// A cluster with fewer than 2 members cannot be bisected.
    EmptyCluster { size: usize },
    /// No splittable leaf remained before reaching the requested k.
    Underfilled { reached: usize, requested: usize },
    /// Feature columns inconsistent with the fitted centers.
    DimensionMismatch { expected: usize, got: usize },
    /// `predict` called before a successful `fit`.
    NotFitted,
}

impl std::fmt::Display for ClusterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterError::InvalidParameter(e) => write!(f, "Invalid parameter: {}", e),
            ClusterError::EmptyCluster { size } => {
                write!(f, "Cluster of size {} cannot be bisected", size)
            }
            ClusterError::Underfilled { reached, requested } => write!(
                f,
                "Only {} clusters could be formed, {} requested",
                reached, requested
            ),
            ClusterError::DimensionMismatch { expected, got } => {
                write!(f, "Feature dimension {} does not match fitted {}", got, expected)
            }
            ClusterError::NotFitted => write!(f, "Engine is not fitted"),
        }
    }
}

impl std::error::Error for ClusterError {}

pub type ClusterResult<T> = Result<T, ClusterError>;

// ============================================================================
// Configuration
// ============================================================================

/// Policy for choosing the next leaf to bisect.
///
/// Both strategies pick the leaf with the largest score; they differ in what
/// the score is and how ties resolve:
/// - `LargestInertia`: within-cluster sum of squares; ties broken by larger
///   population, then by lower (earlier-created) node id.
/// - `LargestCluster`: member count; ties broken by lower node id.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SplitStrategy {
    LargestInertia,
    LargestCluster,
}

impl FromStr for SplitStrategy {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "largest_inertia" => Ok(SplitStrategy::LargestInertia),
            "largest_cluster" => Ok(SplitStrategy::LargestCluster),
            other => Err(ClusterError::InvalidParameter(format!(
                "unknown split strategy '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SplitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitStrategy::LargestInertia => write!(f, "largest_inertia"),
            SplitStrategy::LargestCluster => write!(f, "largest_cluster"),
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct BisectingConfig {
    pub n_clusters: usize,
    pub strategy: SplitStrategy,
    pub seed: u64,
    /// Random restarts per split; the best restart by within-cluster sum of
    /// squares wins.
    pub n_init: usize,
    /// Iteration cap for the 2-means inner loop.
    pub max_iter: usize,
}

impl Default for BisectingConfig {
    fn default() -> Self {
        Self {
            n_clusters: 8,
            strategy: SplitStrategy::LargestInertia,
            seed: 42,
            n_init: 5,
            max_iter: 30,
        }
    }
}

impl BisectingConfig {
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: SplitStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init.max(1);
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter.max(1);
        self
    }

    /// Unit cost of one fit on the shared progress scale.
    pub fn progress_units(&self) -> usize {
        bisecting_units(self.n_clusters)
    }
}

// ============================================================================
// Bisecting tree (arena)
// ============================================================================

/// One node of the bisecting tree. A node exclusively owns its member row
/// indices until it is split; afterwards the indices move to its two
/// children and the node is internal, no longer addressable as a cluster.
#[derive(Clone, Debug)]
struct ClusterNode {
    indices: Vec<usize>,
    center: Vec<f64>,
    score: f64,
    label: Option<usize>,
    children: Option<(usize, usize)>,
}

impl ClusterNode {
    fn new(indices: Vec<usize>, center: Vec<f64>, score: f64) -> Self {
        Self {
            indices,
            center,
            score,
            label: None,
            children: None,
        }
    }

    fn is_leaf(&self) -> bool {
        self.children.is_none()
    }
}

/// Arena of nodes referenced by index; the root covers all samples. At every
/// point the union of leaf index sets is the full sample set exactly once.
struct BisectingTree {
    nodes: Vec<ClusterNode>,
}

impl BisectingTree {
    fn new(root: ClusterNode) -> Self {
        Self { nodes: vec![root] }
    }

    /// Leaf node ids in creation order (stable across runs).
    fn leaf_ids(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&id| self.nodes[id].is_leaf())
            .collect()
    }

    /// Pick the splittable leaf (>= 2 members) with the worst score under
    /// `strategy`. Leaves too small to split are skipped so the partition
    /// invariant is never at risk. Returns `None` when nothing is splittable.
    fn select_split_target(&self, strategy: SplitStrategy) -> Option<usize> {
        let mut best: Option<usize> = None;
        for id in self.leaf_ids() {
            let node = &self.nodes[id];
            if node.indices.len() < 2 {
                trace!("leaf {} has {} members, skipping", id, node.indices.len());
                continue;
            }
            match best {
                None => best = Some(id),
                Some(b) => {
                    let cur = &self.nodes[b];
                    let better = match strategy {
                        SplitStrategy::LargestInertia => {
                            node.score > cur.score
                                || (node.score == cur.score
                                    && node.indices.len() > cur.indices.len())
                        }
                        SplitStrategy::LargestCluster => node.indices.len() > cur.indices.len(),
                    };
                    if better {
                        best = Some(id);
                    }
                }
            }
        }
        best
    }

    /// Replace leaf `parent` with two children holding the partitioned row
    /// indices. The parent's index set is cleared; it becomes internal.
    fn split(&mut self, parent: usize, left: ClusterNode, right: ClusterNode) {
        debug_assert!(self.nodes[parent].is_leaf());
        debug_assert_eq!(
            left.indices.len() + right.indices.len(),
            self.nodes[parent].indices.len()
        );
        let left_id = self.nodes.len();
        self.nodes.push(left);
        let right_id = self.nodes.len();
        self.nodes.push(right);
        let parent_node = &mut self.nodes[parent];
        parent_node.indices = Vec::new();
        parent_node.children = Some((left_id, right_id));
    }
}

// ============================================================================
// Fit-time data access
// ============================================================================

/// Row accessor over the fit input. Dense input is centered into a flat
/// working copy; sparse input is read through the matrix uncentered, to
/// preserve sparsity (a deliberate precision/performance trade-off).
struct FitData<'a> {
    features: &'a FeatureMatrix,
    centered: Option<Vec<f64>>,
    ncols: usize,
}

impl FitData<'_> {
    fn row_into(&self, i: usize, buf: &mut [f64]) {
        match &self.centered {
            Some(flat) => buf.copy_from_slice(&flat[i * self.ncols..(i + 1) * self.ncols]),
            None => self.features.row_into(i, buf),
        }
    }
}

/// Squared Euclidean distance, the single metric used by both fitting and
/// prediction.
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Linear-scan nearest center: returns (index, squared_distance).
fn nearest_center(row: &[f64], centers: &[Vec<f64>]) -> (usize, f64) {
    let mut best_idx = 0;
    let mut best_dist2 = f64::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let d2 = squared_distance(row, c);
        if d2 < best_dist2 {
            best_dist2 = d2;
            best_idx = i;
        }
    }
    (best_idx, best_dist2)
}

// ============================================================================
// 2-means sub-clustering
// ============================================================================

struct SplitOutcome {
    left_indices: Vec<usize>,
    right_indices: Vec<usize>,
    left_center: Vec<f64>,
    right_center: Vec<f64>,
    left_sse: f64,
    right_sse: f64,
}

/// Bisect the member rows of one leaf with 2-means: `n_init` seeded restarts,
/// k-means++-style center seeding, Lloyd iterations, best restart by total
/// within-cluster sum of squares. An emptied side is repaired by moving the
/// member farthest from the surviving center.
fn two_means(
    data: &FitData<'_>,
    members: &[usize],
    config: &BisectingConfig,
    step: usize,
) -> ClusterResult<SplitOutcome> {
    let m = members.len();
    if m < 2 {
        return Err(ClusterError::EmptyCluster { size: m });
    }
    let d = data.ncols;

    // Materialize member rows once; every restart re-reads them many times.
    let mut rows = vec![0.0; m * d];
    for (p, &i) in members.iter().enumerate() {
        data.row_into(i, &mut rows[p * d..(p + 1) * d]);
    }
    let row = |p: usize| &rows[p * d..(p + 1) * d];

    let mut best: Option<(Vec<u8>, Vec<f64>, Vec<f64>, f64, f64)> = None;

    for trial in 0..config.n_init {
        let trial_seed = config
            .seed
            .wrapping_add((step as u64) * 1000)
            .wrapping_add(trial as u64);
        let mut rng = StdRng::seed_from_u64(trial_seed);

        // k-means++ seeding for two centers: first uniform, second weighted
        // by squared distance to the first.
        let c0 = rng.random_range(0..m);
        let mut d2 = vec![0.0; m];
        let mut total = 0.0;
        for p in 0..m {
            d2[p] = squared_distance(row(p), row(c0));
            total += d2[p];
        }
        let c1 = if total > 0.0 {
            let target = rng.random::<f64>() * total;
            let mut acc = 0.0;
            let mut pick = (c0 + 1) % m;
            for p in 0..m {
                acc += d2[p];
                if acc >= target && p != c0 {
                    pick = p;
                    break;
                }
            }
            pick
        } else {
            (c0 + 1) % m
        };

        let mut centers = [row(c0).to_vec(), row(c1).to_vec()];
        let mut assign = vec![0u8; m];

        for _ in 0..config.max_iter {
            let mut changed = false;
            for p in 0..m {
                let d_left = squared_distance(row(p), &centers[0]);
                let d_right = squared_distance(row(p), &centers[1]);
                let side = u8::from(d_right < d_left);
                if side != assign[p] {
                    assign[p] = side;
                    changed = true;
                }
            }

            // Repair an emptied side before recomputing means.
            for side in 0..2u8 {
                if assign.iter().all(|&a| a != side) {
                    let other = 1 - side;
                    let mut far_p = 0;
                    let mut far_d = -1.0;
                    for p in 0..m {
                        let dist = squared_distance(row(p), &centers[other as usize]);
                        if dist > far_d {
                            far_d = dist;
                            far_p = p;
                        }
                    }
                    assign[far_p] = side;
                    changed = true;
                }
            }

            let mut sums = [vec![0.0; d], vec![0.0; d]];
            let mut counts = [0usize; 2];
            for p in 0..m {
                let side = assign[p] as usize;
                counts[side] += 1;
                for (j, v) in row(p).iter().enumerate() {
                    sums[side][j] += v;
                }
            }
            for side in 0..2 {
                for v in &mut sums[side] {
                    *v /= counts[side] as f64;
                }
            }
            centers = [sums[0].clone(), sums[1].clone()];

            if !changed {
                break;
            }
        }

        let mut sse = [0.0; 2];
        for p in 0..m {
            sse[assign[p] as usize] += squared_distance(row(p), &centers[assign[p] as usize]);
        }
        let total_sse = sse[0] + sse[1];
        trace!(
            "split step {}, trial {}: sse={:.6} (left={}, right={})",
            step,
            trial,
            total_sse,
            assign.iter().filter(|&&a| a == 0).count(),
            assign.iter().filter(|&&a| a == 1).count()
        );

        let replace = match &best {
            None => true,
            Some((_, _, _, best_l, best_r)) => total_sse < best_l + best_r,
        };
        if replace {
            let [c_left, c_right] = centers;
            best = Some((assign, c_left, c_right, sse[0], sse[1]));
        }
    }

    // n_init >= 1, so best is always populated.
    let (assign, left_center, right_center, left_sse, right_sse) = best.ok_or_else(|| {
        ClusterError::InvalidParameter("n_init must be at least 1".to_string())
    })?;

    let mut left_indices = Vec::new();
    let mut right_indices = Vec::new();
    for (p, &i) in members.iter().enumerate() {
        if assign[p] == 0 {
            left_indices.push(i);
        } else {
            right_indices.push(i);
        }
    }

    Ok(SplitOutcome {
        left_indices,
        right_indices,
        left_center,
        right_center,
        left_sse,
        right_sse,
    })
}

// ============================================================================
// Engine
// ============================================================================

/// Result of one fit: every sample belongs to exactly one of the k clusters,
/// labels use exactly the integers `0..k`, centers are `k x D`, inertia >= 0.
pub struct FitOutput {
    pub labels: Vec<usize>,
    pub centers: DenseMatrix<f64>,
    pub inertia: f64,
}

/// The clustering engine. One `fit` call builds and consumes a bisecting
/// tree; the fitted centers survive for subsequent `predict` calls.
pub struct BisectingEngine {
    config: BisectingConfig,
    fitted_centers: Option<Vec<Vec<f64>>>,
    n_features: usize,
}

impl BisectingEngine {
    pub fn new(config: BisectingConfig) -> Self {
        Self {
            config,
            fitted_centers: None,
            n_features: 0,
        }
    }

    pub fn config(&self) -> &BisectingConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted_centers.is_some()
    }

    /// Cluster `features` into `config.n_clusters` groups.
    ///
    /// `sample_weight` weights each sample's contribution to the final
    /// inertia (default weight 1). When `tracker` is given, the engine's
    /// internal steps advance the shared scale by exactly
    /// [`BisectingConfig::progress_units`]; otherwise a local tracker over
    /// the same unit formula is used and terminated with `DONE`.
    pub fn fit(
        &mut self,
        features: &FeatureMatrix,
        sample_weight: Option<&[f64]>,
        tracker: Option<&mut ProgressTracker>,
    ) -> ClusterResult<FitOutput> {
        let (n, d) = features.shape();
        let k = self.config.n_clusters;

        if n == 0 || d == 0 {
            return Err(ClusterError::InvalidParameter(format!(
                "feature matrix must be non-empty, got {} x {}",
                n, d
            )));
        }
        if k < 1 || k > n {
            return Err(ClusterError::InvalidParameter(format!(
                "n_clusters={} must be between 1 and n_samples={}",
                k, n
            )));
        }
        if let Some(w) = sample_weight {
            if w.len() != n {
                return Err(ClusterError::InvalidParameter(format!(
                    "sample_weight has {} entries for {} samples",
                    w.len(),
                    n
                )));
            }
            if w.iter().any(|&x| x < 0.0 || !x.is_finite()) {
                return Err(ClusterError::InvalidParameter(
                    "sample weights must be finite and non-negative".to_string(),
                ));
            }
        }

        let shared = tracker.is_some();
        let mut local = None;
        let tracker = match tracker {
            Some(t) => t,
            None => local.insert(ProgressTracker::new(self.config.progress_units())),
        };

        info!(
            "bisecting fit: N={}, D={}, k={}, strategy={}, seed={}",
            n, d, k, self.config.strategy, self.config.seed
        );
        tracker.set_status("Starting bisecting initialization");
        tracker.advance(1);

        tracker.set_status(&format!(
            "Parameters validated (k={}, strategy={})",
            k, self.config.strategy
        ));
        tracker.advance(1);

        // Center dense data around the global column mean; sparse data is
        // never centered so sparsity is preserved.
        let column_mean = features.column_means();
        let data = match features {
            FeatureMatrix::Dense(_) => {
                let mut flat = vec![0.0; n * d];
                let mut buf = vec![0.0; d];
                for i in 0..n {
                    features.row_into(i, &mut buf);
                    for j in 0..d {
                        flat[i * d + j] = buf[j] - column_mean[j];
                    }
                }
                tracker.set_status("Data centering complete");
                FitData {
                    features,
                    centered: Some(flat),
                    ncols: d,
                }
            }
            FeatureMatrix::Sparse(_) => {
                tracker.set_status("Sparse input, centering skipped");
                FitData {
                    features,
                    centered: None,
                    ncols: d,
                }
            }
        };
        tracker.advance(1);

        // Root covers all samples, centered-space mean as its center.
        let root_center = {
            let mut sum = vec![0.0; d];
            let mut buf = vec![0.0; d];
            for i in 0..n {
                data.row_into(i, &mut buf);
                for j in 0..d {
                    sum[j] += buf[j];
                }
            }
            for v in &mut sum {
                *v /= n as f64;
            }
            sum
        };
        let mut tree = BisectingTree::new(ClusterNode::new((0..n).collect(), root_center, 0.0));
        tracker.set_status("Root cluster created");
        tracker.advance(1);

        let total_splits = 1.max(k.saturating_sub(1));
        for step in 0..k.saturating_sub(1) {
            let target = match tree.select_split_target(self.config.strategy) {
                Some(t) => t,
                None => {
                    let reached = tree.leaf_ids().len();
                    warn!(
                        "no splittable leaf after {} clusters ({} requested)",
                        reached, k
                    );
                    return Err(ClusterError::Underfilled {
                        reached,
                        requested: k,
                    });
                }
            };
            let size = tree.nodes[target].indices.len();
            tracker.set_status(&format!(
                "Bisecting cluster {} of {} (size={})",
                step + 1,
                total_splits,
                size
            ));

            let outcome = two_means(&data, &tree.nodes[target].indices, &self.config, step)?;
            debug!(
                "step {}: split node {} ({} members) into {} + {}",
                step,
                target,
                size,
                outcome.left_indices.len(),
                outcome.right_indices.len()
            );

            let (left_score, right_score) = match self.config.strategy {
                SplitStrategy::LargestInertia => (outcome.left_sse, outcome.right_sse),
                SplitStrategy::LargestCluster => (
                    outcome.left_indices.len() as f64,
                    outcome.right_indices.len() as f64,
                ),
            };
            let left = ClusterNode::new(outcome.left_indices, outcome.left_center, left_score);
            let right = ClusterNode::new(outcome.right_indices, outcome.right_center, right_score);
            tree.split(target, left, right);
            tracker.advance(1);
        }
        if k == 1 {
            tracker.set_status("Single cluster requested, no splits required");
            tracker.advance(1);
        }

        // Walk leaves in creation order: assign 0-based labels, collect
        // centers (un-centered for dense input), release per-node index sets.
        let mut labels = vec![0usize; n];
        let mut center_rows: Vec<Vec<f64>> = Vec::with_capacity(k);
        let leaf_ids = tree.leaf_ids();
        debug_assert_eq!(leaf_ids.len(), k);
        for (label, &id) in leaf_ids.iter().enumerate() {
            let node = &mut tree.nodes[id];
            for &i in &node.indices {
                labels[i] = label;
            }
            let mut center = node.center.clone();
            if data.centered.is_some() {
                for (j, v) in center.iter_mut().enumerate() {
                    *v += column_mean[j];
                }
            }
            center_rows.push(center);
            node.label = Some(label);
            node.indices = Vec::new();
        }
        debug!(
            "finalized leaves: {:?}",
            leaf_ids
                .iter()
                .map(|&id| (id, tree.nodes[id].label))
                .collect::<Vec<_>>()
        );
        tracker.set_status("Cluster labels assigned");
        tracker.advance(1);

        // Inertia over the original (uncentered) rows and uncentered centers.
        let mut inertia = 0.0;
        let mut buf = vec![0.0; d];
        for i in 0..n {
            features.row_into(i, &mut buf);
            let w = sample_weight.map_or(1.0, |w| w[i]);
            inertia += w * squared_distance(&buf, &center_rows[labels[i]]);
        }
        tracker.advance(1);
        tracker.set_status(&format!("Clustering finished (total inertia={:.3})", inertia));

        let centers = DenseMatrix::from_2d_vec(&center_rows)
            .map_err(|e| ClusterError::InvalidParameter(e.to_string()))?;
        self.fitted_centers = Some(center_rows);
        self.n_features = d;

        tracker.advance(1);
        if !shared {
            tracker.complete();
        }

        Ok(FitOutput {
            labels,
            centers,
            inertia,
        })
    }

    /// Assign each row of a new feature matrix to the nearest fitted center
    /// (squared Euclidean, the same metric as fitting). No retraining.
    pub fn predict(&self, features: &FeatureMatrix) -> ClusterResult<Vec<usize>> {
        let centers = self.fitted_centers.as_ref().ok_or(ClusterError::NotFitted)?;
        let (n, d) = features.shape();
        if d != self.n_features {
            return Err(ClusterError::DimensionMismatch {
                expected: self.n_features,
                got: d,
            });
        }
        let mut labels = Vec::with_capacity(n);
        let mut buf = vec![0.0; d];
        for i in 0..n {
            features.row_into(i, &mut buf);
            let (idx, _) = nearest_center(&buf, centers);
            labels.push(idx);
        }
        Ok(labels)
    }
}

//! Cluster quality scores used by the evaluation stage.
//!
//! Both scores work on a materialized dense view of the features. Sparse
//! input is densified only below a size threshold; above it the score is
//! skipped (`None`) rather than risking an out-of-memory densification.

use log::{debug, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::bisect::squared_distance;
use crate::matrix::FeatureMatrix;

/// Largest `rows * cols` a sparse matrix may have and still be densified
/// for evaluation.
const DENSIFY_LIMIT: usize = 50_000 * 1500;

/// Silhouette is quadratic in sample count, so larger inputs are scored on
/// a seeded random sample of this many rows.
const SILHOUETTE_SAMPLE_CAP: usize = 20_000;

/// Dense row view for evaluation, or `None` when the input is sparse and
/// too large to densify.
fn evaluation_rows(features: &FeatureMatrix) -> Option<Vec<Vec<f64>>> {
    let (n, d) = features.shape();
    if features.is_sparse() && n * d >= DENSIFY_LIMIT {
        debug!(
            "skipping metric: sparse {} x {} exceeds densify limit",
            n, d
        );
        return None;
    }
    Some((0..n).map(|i| features.row(i)).collect())
}

fn cluster_centroids(rows: &[Vec<f64>], labels: &[usize], k: usize) -> Vec<(Vec<f64>, usize)> {
    let f = rows[0].len();
    let mut centroids = vec![(vec![0.0; f], 0usize); k];
    for (row, &c) in rows.iter().zip(labels) {
        let (centroid, count) = &mut centroids[c];
        for (j, v) in row.iter().enumerate() {
            centroid[j] += v;
        }
        *count += 1;
    }
    for (centroid, count) in &mut centroids {
        if *count > 0 {
            for v in centroid.iter_mut() {
                *v /= *count as f64;
            }
        }
    }
    centroids
}

/// Calinski-Harabasz index: between-cluster dispersion over within-cluster
/// dispersion, scaled by the degrees of freedom. Higher is better. Returns
/// `None` when the input is sparse and too large to densify.
pub fn calinski_harabasz(features: &FeatureMatrix, labels: &[usize]) -> Option<f64> {
    let (n, _) = features.shape();
    if labels.len() != n {
        warn!("labels length {} does not match {} rows", labels.len(), n);
        return None;
    }
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    if k <= 1 || k >= n {
        return Some(0.0);
    }
    let rows = evaluation_rows(features)?;
    let f = rows[0].len();

    let mut global_centroid = vec![0.0; f];
    for row in &rows {
        for (j, v) in row.iter().enumerate() {
            global_centroid[j] += v;
        }
    }
    for v in &mut global_centroid {
        *v /= n as f64;
    }

    let centroids = cluster_centroids(&rows, labels, k);

    let bgss: f64 = centroids
        .iter()
        .filter(|(_, count)| *count > 0)
        .map(|(centroid, count)| *count as f64 * squared_distance(centroid, &global_centroid))
        .sum();
    let wgss: f64 = rows
        .iter()
        .zip(labels)
        .map(|(row, &c)| squared_distance(row, &centroids[c].0))
        .sum();

    if wgss <= 0.0 {
        return Some(0.0);
    }
    Some((bgss / (k - 1) as f64) / (wgss / (n - k) as f64))
}

/// Mean silhouette coefficient: for each sample, `(b - a) / max(a, b)`
/// where `a` is its mean distance to its own cluster and `b` the smallest
/// mean distance to any other cluster. Ranges over [-1, 1], higher is
/// better; singleton-cluster samples score 0. Inputs above
/// [`SILHOUETTE_SAMPLE_CAP`] rows are scored on a seeded sample. Returns
/// `None` for fewer than 2 clusters or an un-densifiable sparse input.
pub fn silhouette(features: &FeatureMatrix, labels: &[usize]) -> Option<f64> {
    let (n, _) = features.shape();
    if labels.len() != n {
        warn!("labels length {} does not match {} rows", labels.len(), n);
        return None;
    }
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    if k < 2 {
        return None;
    }
    let rows = evaluation_rows(features)?;

    let sample: Vec<usize> = if n > SILHOUETTE_SAMPLE_CAP {
        let mut rng = StdRng::seed_from_u64(42);
        let mut idx: Vec<usize> = (0..n).collect();
        idx.shuffle(&mut rng);
        idx.truncate(SILHOUETTE_SAMPLE_CAP);
        idx.sort_unstable();
        idx
    } else {
        (0..n).collect()
    };
    let m = sample.len();

    let mut counts = vec![0usize; k];
    for &i in &sample {
        counts[labels[i]] += 1;
    }
    if counts.iter().filter(|&&c| c > 0).count() < 2 {
        return None;
    }

    let mut total = 0.0;
    for &i in &sample {
        let own = labels[i];
        if counts[own] <= 1 {
            continue;
        }
        let mut dist_sum = vec![0.0; k];
        for &j in &sample {
            if j != i {
                dist_sum[labels[j]] += squared_distance(&rows[i], &rows[j]).sqrt();
            }
        }
        let a = dist_sum[own] / (counts[own] - 1) as f64;
        let b = (0..k)
            .filter(|&c| c != own && counts[c] > 0)
            .map(|c| dist_sum[c] / counts[c] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Some(total / m as f64)
}

/// Davies-Bouldin index: mean over clusters of the worst ratio of summed
/// intra-cluster scatter to inter-centroid distance. Lower is better.
/// Returns `None` when the input is sparse and too large to densify.
pub fn davies_bouldin(features: &FeatureMatrix, labels: &[usize]) -> Option<f64> {
    let (n, _) = features.shape();
    if labels.len() != n {
        warn!("labels length {} does not match {} rows", labels.len(), n);
        return None;
    }
    let k = labels.iter().copied().max().map_or(0, |m| m + 1);
    if k <= 1 {
        return Some(0.0);
    }
    let rows = evaluation_rows(features)?;
    let centroids = cluster_centroids(&rows, labels, k);

    // Mean Euclidean distance of members to their centroid.
    let mut scatter = vec![0.0; k];
    for (row, &c) in rows.iter().zip(labels) {
        scatter[c] += squared_distance(row, &centroids[c].0).sqrt();
    }
    for (s, (_, count)) in scatter.iter_mut().zip(&centroids) {
        if *count > 0 {
            *s /= *count as f64;
        }
    }

    let mut total = 0.0;
    for i in 0..k {
        let mut worst: f64 = 0.0;
        for j in 0..k {
            if i == j {
                continue;
            }
            let dist = squared_distance(&centroids[i].0, &centroids[j].0).sqrt();
            let ratio = if dist > 0.0 {
                (scatter[i] + scatter[j]) / dist
            } else {
                f64::INFINITY
            };
            worst = worst.max(ratio);
        }
        total += worst;
    }
    Some(total / k as f64)
}

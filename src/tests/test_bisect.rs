//! Bisecting engine tests.
//!
//! Tests cover:
//! - Label coverage and the partition invariant at the output boundary
//! - Determinism under a fixed seed
//! - Parameter validation and the error taxonomy
//! - Progress accounting with a shared tracker
//! - Sparse input, sample weights, predict

use approx::assert_relative_eq;
use smartcore::linalg::basic::arrays::Array;
use sprs::TriMat;

use crate::bisect::{BisectingConfig, BisectingEngine, ClusterError, SplitStrategy};
use crate::matrix::FeatureMatrix;
use crate::progress::{ProgressTracker, bisecting_units};
use crate::tests::init;
use crate::tests::test_data::{RecordingSink, done_count, make_blobs, make_two_blobs, progress_values};

fn blob_matrix(per_center: usize, dim: usize, seed: u64) -> FeatureMatrix {
    FeatureMatrix::from_rows(&make_two_blobs(per_center, dim, seed)).unwrap()
}

// -------------------- Output contract --------------------

#[test]
fn test_labels_cover_every_cluster() {
    init();
    let centers = vec![
        vec![0.0, 0.0],
        vec![10.0, 0.0],
        vec![0.0, 10.0],
    ];
    let features = FeatureMatrix::from_rows(&make_blobs(&centers, 10, 0.5, 7)).unwrap();
    let mut engine = BisectingEngine::new(BisectingConfig::new(3).with_seed(7));
    let fit = engine.fit(&features, None, None).unwrap();

    assert_eq!(fit.labels.len(), 30);
    for label in 0..3 {
        assert!(fit.labels.iter().any(|&l| l == label), "label {} missing", label);
    }
    assert!(fit.labels.iter().all(|&l| l < 3));
    assert_eq!(fit.centers.shape(), (3, 2));
    assert!(fit.inertia >= 0.0);
}

#[test]
fn test_single_cluster_fit() {
    let features = blob_matrix(5, 3, 1);
    let mut engine = BisectingEngine::new(BisectingConfig::new(1));
    let fit = engine.fit(&features, None, None).unwrap();
    assert!(fit.labels.iter().all(|&l| l == 0));
    assert_eq!(fit.centers.shape(), (1, 3));
}

#[test]
fn test_end_to_end_n100_d5_k4() {
    init();
    let centers = vec![
        vec![0.0, 0.0, 0.0, 0.0, 0.0],
        vec![8.0, 0.0, 0.0, 0.0, 0.0],
        vec![0.0, 8.0, 0.0, 0.0, 0.0],
        vec![0.0, 0.0, 8.0, 0.0, 0.0],
    ];
    let features = FeatureMatrix::from_rows(&make_blobs(&centers, 25, 0.4, 11)).unwrap();
    let mut engine = BisectingEngine::new(BisectingConfig::new(4).with_seed(11));
    let fit = engine.fit(&features, None, None).unwrap();

    let mut distinct: Vec<usize> = fit.labels.clone();
    distinct.sort_unstable();
    distinct.dedup();
    assert_eq!(distinct, vec![0, 1, 2, 3]);
    assert_eq!(fit.centers.shape(), (4, 5));
    assert!(fit.inertia >= 0.0);
}

// -------------------- Determinism --------------------

#[test]
fn test_fit_deterministic_under_fixed_seed() {
    let features = blob_matrix(20, 4, 3);
    let config = BisectingConfig::new(4).with_seed(42);

    let mut first = BisectingEngine::new(config.clone());
    let mut second = BisectingEngine::new(config);
    let a = first.fit(&features, None, None).unwrap();
    let b = second.fit(&features, None, None).unwrap();

    assert_eq!(a.labels, b.labels);
    let (k, d) = a.centers.shape();
    for i in 0..k {
        for j in 0..d {
            assert_eq!(a.centers.get((i, j)), b.centers.get((i, j)));
        }
    }
    assert_eq!(a.inertia, b.inertia);
}

#[test]
fn test_strategies_both_partition() {
    let features = blob_matrix(15, 3, 9);
    for strategy in [SplitStrategy::LargestInertia, SplitStrategy::LargestCluster] {
        let mut engine =
            BisectingEngine::new(BisectingConfig::new(3).with_strategy(strategy).with_seed(9));
        let fit = engine.fit(&features, None, None).unwrap();
        let mut counts = [0usize; 3];
        for &l in &fit.labels {
            counts[l] += 1;
        }
        assert_eq!(counts.iter().sum::<usize>(), 30);
        assert!(counts.iter().all(|&c| c > 0));
    }
}

#[test]
fn test_strategy_parsing() {
    assert_eq!(
        "largest_inertia".parse::<SplitStrategy>().unwrap(),
        SplitStrategy::LargestInertia
    );
    assert_eq!(
        "largest_cluster".parse::<SplitStrategy>().unwrap(),
        SplitStrategy::LargestCluster
    );
    assert!(matches!(
        "median".parse::<SplitStrategy>(),
        Err(ClusterError::InvalidParameter(_))
    ));
}

// -------------------- Parameter validation --------------------

#[test]
fn test_k_zero_rejected() {
    let features = blob_matrix(5, 2, 1);
    let mut engine = BisectingEngine::new(BisectingConfig::new(0));
    assert!(matches!(
        engine.fit(&features, None, None),
        Err(ClusterError::InvalidParameter(_))
    ));
}

#[test]
fn test_k_above_n_rejected() {
    let features = blob_matrix(2, 2, 1);
    let mut engine = BisectingEngine::new(BisectingConfig::new(5));
    assert!(matches!(
        engine.fit(&features, None, None),
        Err(ClusterError::InvalidParameter(_))
    ));
}

#[test]
fn test_bad_sample_weight_rejected() {
    let features = blob_matrix(5, 2, 1);
    let mut engine = BisectingEngine::new(BisectingConfig::new(2));
    let short = vec![1.0; 3];
    assert!(matches!(
        engine.fit(&features, Some(&short), None),
        Err(ClusterError::InvalidParameter(_))
    ));
    let negative = vec![-1.0; 10];
    assert!(matches!(
        engine.fit(&features, Some(&negative), None),
        Err(ClusterError::InvalidParameter(_))
    ));
}

#[test]
fn test_sample_weight_scales_inertia() {
    let features = blob_matrix(10, 3, 5);
    let config = BisectingConfig::new(2).with_seed(5);
    let mut unweighted = BisectingEngine::new(config.clone());
    let mut weighted = BisectingEngine::new(config);
    let base = unweighted.fit(&features, None, None).unwrap();
    let doubled = weighted.fit(&features, Some(&vec![2.0; 20]), None).unwrap();
    assert_eq!(base.labels, doubled.labels);
    assert_relative_eq!(doubled.inertia, 2.0 * base.inertia, max_relative = 1e-12);
}

// -------------------- Progress accounting --------------------

#[test]
fn test_shared_tracker_ends_at_100() {
    let features = blob_matrix(20, 3, 13);
    let k = 4;
    let (sink, lines) = RecordingSink::new();
    let mut tracker = ProgressTracker::with_sink(bisecting_units(k), Box::new(sink));
    let mut engine = BisectingEngine::new(BisectingConfig::new(k).with_seed(13));
    engine.fit(&features, None, Some(&mut tracker)).unwrap();

    let lines = lines.lock().unwrap();
    let values = progress_values(&lines);
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*values.last().unwrap(), 100);
    // DONE belongs to the run owner, not a shared-tracker participant
    assert_eq!(done_count(&lines), 0);
    assert!(lines.iter().any(|l| l.starts_with("STATUS: Bisecting cluster")));
}

// -------------------- Sparse input --------------------

#[test]
fn test_sparse_input_separates_groups() {
    init();
    let mut tri = TriMat::new((20, 6));
    for i in 0..10 {
        tri.add_triplet(i, 0, 5.0 + (i as f64) * 0.01);
    }
    for i in 10..20 {
        tri.add_triplet(i, 1, 5.0 + (i as f64) * 0.01);
    }
    let features = FeatureMatrix::Sparse(tri.to_csr());
    let mut engine = BisectingEngine::new(BisectingConfig::new(2).with_seed(21));
    let fit = engine.fit(&features, None, None).unwrap();

    let first = fit.labels[0];
    assert!(fit.labels[..10].iter().all(|&l| l == first));
    assert!(fit.labels[10..].iter().all(|&l| l != first));
}

// -------------------- Predict --------------------

#[test]
fn test_predict_before_fit_fails() {
    let features = blob_matrix(5, 2, 1);
    let engine = BisectingEngine::new(BisectingConfig::new(2));
    assert!(matches!(
        engine.predict(&features),
        Err(ClusterError::NotFitted)
    ));
}

#[test]
fn test_predict_dimension_mismatch() {
    let features = blob_matrix(10, 3, 17);
    let mut engine = BisectingEngine::new(BisectingConfig::new(2).with_seed(17));
    engine.fit(&features, None, None).unwrap();

    let narrow = blob_matrix(4, 2, 17);
    assert!(matches!(
        engine.predict(&narrow),
        Err(ClusterError::DimensionMismatch { expected: 3, got: 2 })
    ));
}

#[test]
fn test_predict_recovers_training_labels() {
    let features = blob_matrix(15, 4, 19);
    let mut engine = BisectingEngine::new(BisectingConfig::new(2).with_seed(19));
    let fit = engine.fit(&features, None, None).unwrap();
    let predicted = engine.predict(&features).unwrap();
    assert_eq!(fit.labels, predicted);
}

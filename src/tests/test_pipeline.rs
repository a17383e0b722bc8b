//! Pipeline driver tests: unit budgeting and the end-to-end run.

use tempfile::TempDir;

use crate::bisect::{BisectingConfig, BisectingEngine};
use crate::cache::{CacheConfig, VectorCache};
use crate::matrix::FeatureMatrix;
use crate::pipeline::{PipelineError, STAGES, run_clustering, stage_units, total_units};
use crate::progress::{ProgressTracker, bisecting_units};
use crate::tests::init;
use crate::tests::test_data::{
    FailingEncoder, PrefixEncoder, RecordingSink, done_count, progress_values,
};

const DIM: usize = 4;

#[test]
fn test_stage_units_budget() {
    assert_eq!(STAGES.len(), 8);
    for stage in STAGES {
        if stage == "fit_model_on_sample" {
            assert_eq!(stage_units(stage, 6), bisecting_units(6));
        } else {
            assert_eq!(stage_units(stage, 6), 1);
        }
    }
    assert_eq!(total_units(2), 7 + bisecting_units(2));
}

fn group_keys() -> Vec<String> {
    let mut keys: Vec<String> = (0..20).map(|i| format!("alpha-{}", i)).collect();
    keys.extend((0..20).map(|i| format!("beta-{}", i)));
    keys
}

#[test]
fn test_run_clustering_end_to_end() {
    init();
    let dir = TempDir::new().unwrap();
    let keys = group_keys();
    // a second feature block reinforcing the same grouping
    let extra: Vec<Vec<f64>> = (0..40)
        .map(|i| if i < 20 { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        .collect();
    let extra_block = FeatureMatrix::from_rows(&extra).unwrap();

    let k = 2;
    let (sink, lines) = RecordingSink::new();
    let mut tracker = ProgressTracker::with_sink(total_units(k), Box::new(sink));
    // parsing and tokenization are the caller's stages
    tracker.set_status("Parsing log lines");
    tracker.advance(1);
    tracker.set_status("Tokenizing requests");
    tracker.advance(1);

    let mut encoder = PrefixEncoder::new(DIM);
    let mut cache = VectorCache::open(CacheConfig::new(dir.path(), DIM)).unwrap();
    let mut engine = BisectingEngine::new(BisectingConfig::new(k).with_seed(3));
    let outcome = run_clustering(
        &keys,
        &[extra_block],
        &mut encoder,
        &mut cache,
        &mut engine,
        &mut tracker,
    )
    .unwrap();

    assert_eq!(outcome.labels.len(), 40);
    let first = outcome.labels[0];
    assert!(outcome.labels[..20].iter().all(|&l| l == first));
    assert!(outcome.labels[20..].iter().all(|&l| l != first));
    assert!(outcome.inertia >= 0.0);
    // two tight, far-apart groups score near the silhouette maximum
    let sil = outcome.silhouette.unwrap();
    assert!(sil > 0.5 && sil <= 1.0, "silhouette {}", sil);
    assert!(outcome.calinski_harabasz.unwrap() > 0.0);
    assert!(outcome.davies_bouldin.unwrap() >= 0.0);

    let lines = lines.lock().unwrap();
    let values = progress_values(&lines);
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(*values.last().unwrap(), 100);
    assert_eq!(done_count(&lines), 1);
    assert_eq!(lines.last().unwrap(), "DONE");
}

#[test]
fn test_silhouette_none_for_single_cluster() {
    let features =
        FeatureMatrix::from_rows(&[vec![0.0, 1.0], vec![0.1, 1.1], vec![0.2, 0.9]]).unwrap();
    assert!(crate::metrics::silhouette(&features, &[0, 0, 0]).is_none());
}

#[test]
fn test_silhouette_separated_groups() {
    let features = FeatureMatrix::from_rows(&[
        vec![0.0, 0.0],
        vec![0.1, 0.0],
        vec![10.0, 10.0],
        vec![10.1, 10.0],
    ])
    .unwrap();
    let sil = crate::metrics::silhouette(&features, &[0, 0, 1, 1]).unwrap();
    assert!(sil > 0.9, "silhouette {}", sil);

    // labels that cut across the groups score worse
    let bad = crate::metrics::silhouette(&features, &[0, 1, 0, 1]).unwrap();
    assert!(bad < sil);
}

#[test]
fn test_encoder_failure_propagates() {
    let dir = TempDir::new().unwrap();
    let keys = group_keys();
    let mut tracker = ProgressTracker::new(total_units(2));
    let mut encoder = FailingEncoder { dim: DIM };
    let mut cache = VectorCache::open(CacheConfig::new(dir.path(), DIM)).unwrap();
    let mut engine = BisectingEngine::new(BisectingConfig::new(2));

    let err = run_clustering(&keys, &[], &mut encoder, &mut cache, &mut engine, &mut tracker)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cache(_)));
}

#[test]
fn test_engine_usable_for_predict_after_run() {
    init();
    let dir = TempDir::new().unwrap();
    let keys = group_keys();
    let mut tracker = ProgressTracker::new(total_units(2));
    tracker.advance(2);

    let mut encoder = PrefixEncoder::new(DIM);
    let mut cache = VectorCache::open(CacheConfig::new(dir.path(), DIM)).unwrap();
    let mut engine = BisectingEngine::new(BisectingConfig::new(2).with_seed(3));
    let outcome =
        run_clustering(&keys, &[], &mut encoder, &mut cache, &mut engine, &mut tracker).unwrap();

    // the fitted engine can label fresh rows of the same shape
    let fresh = cache
        .embed_many_normalized(&["alpha-new".to_string(), "beta-new".to_string()], &mut encoder)
        .unwrap();
    let labels = engine.predict(&FeatureMatrix::Dense(fresh)).unwrap();
    assert_eq!(labels[0], outcome.labels[0]);
    assert_eq!(labels[1], outcome.labels[20]);
}

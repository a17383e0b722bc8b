//! logbisect: bisecting clustering of access-log feature vectors with a
//! persistent, deduplicating embedding cache.
//!
//! The crate groups web-server access-log entries (feature vectors derived
//! from URL text, HTTP method, status, size and user-agent) for security
//! investigation. Two subsystems carry the weight:
//!
//! - [`bisect::BisectingEngine`]: a divisive clustering engine that
//!   repeatedly splits the worst cluster in two until a target count is
//!   reached, reporting fine-grained progress throughout a long-running job.
//! - [`cache::VectorCache`]: a deduplicating, growable vector cache that
//!   memorizes expensive per-key text-encoder outputs across runs, using
//!   append-only, memory-mapped half-precision storage.
//!
//! Around them: [`matrix::FeatureMatrix`] (explicit dense/sparse tagged
//! variant with column-wise concatenation), [`progress::ProgressTracker`]
//! (the `STATUS:`/`PROGRESS:`/`DONE` line protocol on a unit-based 0-100%
//! scale), [`metrics`] (cluster quality scores) and [`pipeline`] (the
//! 8-stage synchronous driver tying them together under one progress
//! budget).
//!
//! Everything is single-threaded and deterministic under a fixed seed.
//! Diagnostics go through the `log` facade; the progress protocol is a
//! separate channel for the parent process driving a run.

pub mod bisect;
pub mod cache;
pub mod matrix;
pub mod metrics;
pub mod pipeline;
pub mod progress;

#[cfg(test)]
mod tests;

pub use bisect::{BisectingConfig, BisectingEngine, ClusterError, FitOutput, SplitStrategy};
pub use cache::{BatchEncoder, CacheConfig, CacheError, VectorCache};
pub use matrix::{FeatureMatrix, MatrixError};
pub use progress::{ProgressSink, ProgressTracker, bisecting_units};

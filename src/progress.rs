//! Unit-based progress accounting shared across the whole pipeline.
//!
//! Every long-running stage reports through one `ProgressTracker` so a single
//! 0-100% scale spans parsing, embedding, clustering and export. The tracker
//! speaks a plain text protocol, one ASCII directive per line:
//!
//! - `STATUS: <free text>`: informational, any number of times
//! - `PROGRESS: <integer 0-100>`: monotonically non-decreasing within a run
//! - `DONE`: exactly once, at the very end of a successful run
//!
//! Output goes through a [`ProgressSink`] so callers can redirect the stream
//! (stdout by default). The sink is not a logging facility; diagnostics go
//! through the `log` facade as everywhere else in the crate.

use std::io::Write;

/// Destination for progress protocol lines.
pub trait ProgressSink {
    fn emit(&mut self, line: &str);
}

/// Default sink: write the line to stdout and flush immediately, so a parent
/// process polling the stream sees every directive as it happens.
pub struct StdoutSink;

impl ProgressSink for StdoutSink {
    fn emit(&mut self, line: &str) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{}", line);
        let _ = lock.flush();
    }
}

/// Progress accounting over a fixed number of work units.
///
/// `current` only moves forward and saturates at `total_units`; the reported
/// percentage is `round(current / total_units * 100)` and therefore
/// monotonically non-decreasing for the life of one tracker.
pub struct ProgressTracker {
    total_units: usize,
    current: usize,
    status: String,
    done_emitted: bool,
    sink: Box<dyn ProgressSink>,
}

impl ProgressTracker {
    /// Create a tracker over `total_units` (clamped to at least 1) reporting
    /// to stdout.
    pub fn new(total_units: usize) -> Self {
        Self::with_sink(total_units, Box::new(StdoutSink))
    }

    /// Create a tracker reporting to a custom sink.
    pub fn with_sink(total_units: usize, sink: Box<dyn ProgressSink>) -> Self {
        Self {
            total_units: total_units.max(1),
            current: 0,
            status: String::new(),
            done_emitted: false,
            sink,
        }
    }

    pub fn total_units(&self) -> usize {
        self.total_units
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Latest status message set through [`set_status`](Self::set_status).
    pub fn status(&self) -> &str {
        &self.status
    }

    /// Reported percentage, rounded to the nearest integer.
    pub fn percent(&self) -> u32 {
        ((self.current as f64 / self.total_units as f64) * 100.0).round() as u32
    }

    /// Record and emit a status message immediately.
    pub fn set_status(&mut self, msg: &str) {
        self.status = msg.to_string();
        self.sink.emit(&format!("STATUS: {}", msg));
    }

    /// Advance by `units`, saturating at `total_units`, and emit the new
    /// percentage. Never decreases.
    pub fn advance(&mut self, units: usize) {
        self.current = (self.current + units).min(self.total_units);
        self.report();
    }

    /// Force progress to 100% and emit the terminal `DONE` marker. The marker
    /// is emitted at most once even if `complete` is called again.
    pub fn complete(&mut self) {
        self.current = self.total_units;
        self.report();
        if !self.done_emitted {
            self.done_emitted = true;
            self.sink.emit("DONE");
        }
    }

    fn report(&mut self) {
        let pct = self.percent();
        self.sink.emit(&format!("PROGRESS: {}", pct));
    }
}

/// Unit cost of one bisecting fit: 4 setup steps, one per split, 3 teardown
/// steps. Orchestrators use this to budget the clustering stage so the
/// engine's internal steps contribute to the end-to-end percentage.
pub fn bisecting_units(n_clusters: usize) -> usize {
    4 + 1.max(n_clusters.saturating_sub(1)) + 3
}

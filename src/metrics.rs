//! Metrics collector interface (spec §6): "out of scope" externally
//! implemented, the core only needs a narrow trait to call into. Mirrors
//! the `PageManager` pattern — an interface the embedder supplies, with an
//! in-process reference implementation here for tests and local use.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters and histograms the core reports into during normal operation.
/// Every method has a default no-op body so an embedder only needs to
/// override the handful it cares about.
pub trait MetricsCollector: Send + Sync {
    fn record_read(&self) {}
    fn record_write(&self) {}
    fn record_commit(&self, _duration: Duration) {}
    fn record_pages_written(&self, _count: u64) {}
    fn record_pages_reused(&self, _count: u64) {}
    fn record_pages_allocated(&self, _count: u64) {}
    fn record_pages_abandoned(&self, _count: u64) {}
    fn record_finalizer_queue_depth(&self, _depth: u64) {}
    fn record_lowest_reader_batch_id(&self, _batch_id: u32) {}
    fn record_last_written_batch_id(&self, _batch_id: u32) {}
}

/// A `MetricsCollector` that discards everything. The default for a
/// `PagedDb` opened without one.
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {}

/// A simple in-process collector backed by atomics, useful for tests and
/// for embedders without their own telemetry stack. Histograms are
/// summarized as running count/sum/max rather than full distributions.
#[derive(Default)]
pub struct InMemoryMetrics {
    reads: AtomicU64,
    writes: AtomicU64,
    commits: AtomicU64,
    commit_duration_sum_micros: AtomicU64,
    commit_duration_max_micros: AtomicU64,
    pages_written: AtomicU64,
    pages_reused: AtomicU64,
    pages_allocated: AtomicU64,
    pages_abandoned: AtomicU64,
    finalizer_queue_depth: AtomicU64,
    lowest_reader_batch_id: AtomicU64,
    last_written_batch_id: AtomicU64,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    pub fn mean_commit_duration(&self) -> Duration {
        let commits = self.commits();
        if commits == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.commit_duration_sum_micros.load(Ordering::Relaxed) / commits)
    }

    pub fn max_commit_duration(&self) -> Duration {
        Duration::from_micros(self.commit_duration_max_micros.load(Ordering::Relaxed))
    }

    pub fn pages_written(&self) -> u64 {
        self.pages_written.load(Ordering::Relaxed)
    }

    pub fn pages_reused(&self) -> u64 {
        self.pages_reused.load(Ordering::Relaxed)
    }

    pub fn pages_allocated(&self) -> u64 {
        self.pages_allocated.load(Ordering::Relaxed)
    }

    pub fn pages_abandoned(&self) -> u64 {
        self.pages_abandoned.load(Ordering::Relaxed)
    }

    pub fn finalizer_queue_depth(&self) -> u64 {
        self.finalizer_queue_depth.load(Ordering::Relaxed)
    }

    pub fn lowest_reader_batch_id(&self) -> u32 {
        self.lowest_reader_batch_id.load(Ordering::Relaxed) as u32
    }

    pub fn last_written_batch_id(&self) -> u32 {
        self.last_written_batch_id.load(Ordering::Relaxed) as u32
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    fn record_commit(&self, duration: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        let micros = duration.as_micros() as u64;
        self.commit_duration_sum_micros.fetch_add(micros, Ordering::Relaxed);
        self.commit_duration_max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    fn record_pages_written(&self, count: u64) {
        self.pages_written.fetch_add(count, Ordering::Relaxed);
    }

    fn record_pages_reused(&self, count: u64) {
        self.pages_reused.fetch_add(count, Ordering::Relaxed);
    }

    fn record_pages_allocated(&self, count: u64) {
        self.pages_allocated.fetch_add(count, Ordering::Relaxed);
    }

    fn record_pages_abandoned(&self, count: u64) {
        self.pages_abandoned.fetch_add(count, Ordering::Relaxed);
    }

    fn record_finalizer_queue_depth(&self, depth: u64) {
        self.finalizer_queue_depth.store(depth, Ordering::Relaxed);
    }

    fn record_lowest_reader_batch_id(&self, batch_id: u32) {
        self.lowest_reader_batch_id.store(batch_id as u64, Ordering::Relaxed);
    }

    fn record_last_written_batch_id(&self, batch_id: u32) {
        self.last_written_batch_id.store(batch_id as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_duration_tracks_mean_and_max() {
        let metrics = InMemoryMetrics::new();
        metrics.record_commit(Duration::from_micros(100));
        metrics.record_commit(Duration::from_micros(300));
        assert_eq!(metrics.commits(), 2);
        assert_eq!(metrics.mean_commit_duration(), Duration::from_micros(200));
        assert_eq!(metrics.max_commit_duration(), Duration::from_micros(300));
    }

    #[test]
    fn noop_metrics_accepts_every_call_without_panicking() {
        let metrics = NoopMetrics;
        metrics.record_read();
        metrics.record_commit(Duration::from_secs(1));
        metrics.record_pages_written(10);
    }
}

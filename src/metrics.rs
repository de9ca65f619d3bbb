#[cfg(feature = "metrics")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "metrics")]
use std::time::Instant;

/// Optional event counters for the scheduler.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct Metrics {
    /// Tasks run to completion.
    pub tasks_executed: AtomicU64,
    /// Fibers parked on a counter.
    pub fibers_parked: AtomicU64,
    /// Fibers taken off a resumable queue.
    pub fibers_resumed: AtomicU64,
    /// Resumptions served from a worker's pinned queue.
    pub pinned_resumes: AtomicU64,
    /// Fibers parked on Fibtex contention.
    pub lock_parks: AtomicU64,
    /// Contended injector steal attempts.
    pub steal_retries: AtomicU64,
    /// When collection started.
    pub start_time: Instant,
}

#[cfg(feature = "metrics")]
impl Metrics {
    pub fn new() -> Self {
        Self {
            tasks_executed: AtomicU64::new(0),
            fibers_parked: AtomicU64::new(0),
            fibers_resumed: AtomicU64::new(0),
            pinned_resumes: AtomicU64::new(0),
            lock_parks: AtomicU64::new(0),
            steal_retries: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Returns a snapshot of the current values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            fibers_parked: self.fibers_parked.load(Ordering::Relaxed),
            fibers_resumed: self.fibers_resumed.load(Ordering::Relaxed),
            pinned_resumes: self.pinned_resumes.load(Ordering::Relaxed),
            lock_parks: self.lock_parks.load(Ordering::Relaxed),
            steal_retries: self.steal_retries.load(Ordering::Relaxed),
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(feature = "metrics")]
impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

/// Point-in-time view of [`Metrics`].
#[cfg(feature = "metrics")]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub tasks_executed: u64,
    pub fibers_parked: u64,
    pub fibers_resumed: u64,
    pub pinned_resumes: u64,
    pub lock_parks: u64,
    pub steal_retries: u64,
    pub elapsed_seconds: f64,
}

#[cfg(feature = "metrics")]
impl MetricsSnapshot {
    /// Task completion throughput since startup.
    pub fn tasks_per_second(&self) -> f64 {
        if self.elapsed_seconds > 0.0 {
            self.tasks_executed as f64 / self.elapsed_seconds
        } else {
            0.0
        }
    }

    /// Parked fibers not yet resumed.
    pub fn fibers_outstanding(&self) -> i64 {
        self.fibers_parked as i64 + self.lock_parks as i64 - self.fibers_resumed as i64
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_updates() {
        let metrics = Metrics::new();
        metrics.tasks_executed.fetch_add(5, Ordering::Relaxed);
        metrics.fibers_parked.fetch_add(3, Ordering::Relaxed);
        metrics.fibers_resumed.fetch_add(2, Ordering::Relaxed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_executed, 5);
        assert_eq!(snapshot.fibers_outstanding(), 1);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }
}

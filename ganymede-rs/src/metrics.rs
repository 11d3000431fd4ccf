//! Records how often something was invoked and how long it took on average.
//!
//! Used to track the utilization of each command as well as of each client connection. All
//! operations work on atomics so that a single instance can be shared between tasks without
//! any locking.
//!
//! # Example
//!
//! ```
//! # use ganymede::metrics::CallMetrics;
//! let metrics = CallMetrics::new();
//! metrics.record(100);
//! metrics.record(300);
//!
//! assert_eq!(metrics.count(), 2);
//! assert_eq!(metrics.avg_micros(), 200);
//! ```
use std::sync::atomic::{AtomicU64, Ordering};

/// Counts invocations and sums up their durations in microseconds.
#[derive(Default, Debug)]
pub struct CallMetrics {
    count: AtomicU64,
    total_micros: AtomicU64,
}

impl Clone for CallMetrics {
    fn clone(&self) -> Self {
        CallMetrics {
            count: AtomicU64::new(self.count()),
            total_micros: AtomicU64::new(self.total_micros.load(Ordering::Relaxed)),
        }
    }
}

impl CallMetrics {
    /// Creates a new and empty set of metrics.
    pub fn new() -> Self {
        CallMetrics::default()
    }

    /// Records a single invocation which took the given number of microseconds.
    pub fn record(&self, micros: u64) {
        let _ = self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self.total_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Returns the number of recorded invocations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns the average duration in microseconds or 0 if nothing was recorded yet.
    pub fn avg_micros(&self) -> u64 {
        let count = self.count();
        if count == 0 {
            0
        } else {
            self.total_micros.load(Ordering::Relaxed) / count
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::metrics::CallMetrics;

    #[test]
    fn empty_metrics_report_zero() {
        let metrics = CallMetrics::new();
        assert_eq!(metrics.count(), 0);
        assert_eq!(metrics.avg_micros(), 0);
    }

    #[test]
    fn clones_are_snapshots() {
        let metrics = CallMetrics::new();
        metrics.record(10);

        let snapshot = metrics.clone();
        metrics.record(30);

        assert_eq!(snapshot.count(), 1);
        assert_eq!(snapshot.avg_micros(), 10);
        assert_eq!(metrics.count(), 2);
        assert_eq!(metrics.avg_micros(), 20);
    }
}

//! Coordinator instrumentation hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Hooks called by a coordinator as requests and transactions move through it.
///
/// Implementations must be cheap; hooks run on the database worker.
pub trait CoordinatorMetrics: Send + Sync {
    /// An open or delete request became the current request.
    fn request_admitted(&self);

    /// A current request was reported blocked by open connections.
    fn request_blocked(&self);

    /// A transaction was activated in the backing store.
    fn transaction_started(&self);

    /// A scheduling pass left `count` transactions queued behind a conflict.
    fn transaction_deferred(&self, count: usize);

    /// A transaction left the in-progress set.
    ///
    /// # Parameters
    /// * `committed` - `true` for a successful commit, `false` for any abort.
    fn transaction_finished(&self, committed: bool);

    /// The quota arbiter denied an operation.
    fn quota_denied(&self);
}

/// Metrics sink that records nothing.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl CoordinatorMetrics for NoopMetrics {
    fn request_admitted(&self) {}
    fn request_blocked(&self) {}
    fn transaction_started(&self) {}
    fn transaction_deferred(&self, _count: usize) {}
    fn transaction_finished(&self, _committed: bool) {}
    fn quota_denied(&self) {}
}

/// Atomic counters behind [`CoordinatorMetrics`].
///
/// One instance may be shared by every coordinator of a manager.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    /// Requests that became current.
    pub requests_admitted: AtomicU64,
    /// Blocked notifications sent.
    pub requests_blocked: AtomicU64,
    /// Transactions activated.
    pub transactions_started: AtomicU64,
    /// Deferrals observed across scheduling passes.
    pub transactions_deferred: AtomicU64,
    /// Transactions committed.
    pub transactions_committed: AtomicU64,
    /// Transactions aborted.
    pub transactions_aborted: AtomicU64,
    /// Space requests denied.
    pub quota_denials: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Requests that became current.
    pub requests_admitted: u64,
    /// Blocked notifications sent.
    pub requests_blocked: u64,
    /// Transactions activated.
    pub transactions_started: u64,
    /// Deferrals observed across scheduling passes.
    pub transactions_deferred: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Space requests denied.
    pub quota_denials: u64,
}

impl CounterMetrics {
    /// Shared counters ready to hand to a manager.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_admitted: self.requests_admitted.load(Ordering::Relaxed),
            requests_blocked: self.requests_blocked.load(Ordering::Relaxed),
            transactions_started: self.transactions_started.load(Ordering::Relaxed),
            transactions_deferred: self.transactions_deferred.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_aborted: self.transactions_aborted.load(Ordering::Relaxed),
            quota_denials: self.quota_denials.load(Ordering::Relaxed),
        }
    }
}

impl CoordinatorMetrics for CounterMetrics {
    fn request_admitted(&self) {
        self.requests_admitted.fetch_add(1, Ordering::Relaxed);
    }

    fn request_blocked(&self) {
        self.requests_blocked.fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_started(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_deferred(&self, count: usize) {
        self.transactions_deferred
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn transaction_finished(&self, committed: bool) {
        if committed {
            self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn quota_denied(&self) {
        self.quota_denials.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_hooks() {
        let metrics = CounterMetrics::default();
        metrics.request_admitted();
        metrics.transaction_started();
        metrics.transaction_deferred(3);
        metrics.transaction_finished(true);
        metrics.transaction_finished(false);
        metrics.quota_denied();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_admitted, 1);
        assert_eq!(snapshot.transactions_deferred, 3);
        assert_eq!(snapshot.transactions_committed, 1);
        assert_eq!(snapshot.transactions_aborted, 1);
        assert_eq!(snapshot.quota_denials, 1);
        assert_eq!(snapshot.requests_blocked, 0);
    }
}

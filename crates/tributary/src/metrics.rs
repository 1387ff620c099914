//! Run loop metrics.
//!
//! [`RunLoopMetrics`] provides lock-free atomic counters for observing the
//! consumer run loop: poll activity, fetch completions, rebalances, and
//! commit outcomes.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters for run loop statistics.
#[derive(Debug, Default)]
pub struct RunLoopMetrics {
    /// Total poll cycles that reached the client.
    polls: AtomicU64,
    /// Total records returned by client polls.
    records_polled: AtomicU64,
    /// Total fetches completed with records.
    fetches_completed: AtomicU64,
    /// Total fetch tokens completed with a revocation (revoked partition,
    /// stale request, or displaced token).
    fetches_revoked: AtomicU64,
    /// Total rebalance cycles observed (assignment callbacks).
    rebalances: AtomicU64,
    /// Total commits acknowledged by the client.
    commits_completed: AtomicU64,
    /// Total commits that failed at the client.
    commits_failed: AtomicU64,
    /// Total commits deferred because a rebalance was in progress.
    commits_deferred: AtomicU64,
}

impl RunLoopMetrics {
    /// Creates a new metrics instance with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_poll(&self, records: u64) {
        self.polls.fetch_add(1, Ordering::Relaxed);
        self.records_polled.fetch_add(records, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_completed(&self) {
        self.fetches_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_revoked(&self) {
        self.fetches_revoked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rebalance(&self) {
        self.rebalances.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_completed(&self) {
        self.commits_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_failed(&self) {
        self.commits_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_deferred(&self) {
        self.commits_deferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns total poll cycles that reached the client.
    #[must_use]
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::Relaxed)
    }

    /// Returns total records returned by client polls.
    #[must_use]
    pub fn records_polled(&self) -> u64 {
        self.records_polled.load(Ordering::Relaxed)
    }

    /// Returns total fetches completed with records.
    #[must_use]
    pub fn fetches_completed(&self) -> u64 {
        self.fetches_completed.load(Ordering::Relaxed)
    }

    /// Returns total fetch tokens completed with a revocation.
    #[must_use]
    pub fn fetches_revoked(&self) -> u64 {
        self.fetches_revoked.load(Ordering::Relaxed)
    }

    /// Returns total rebalance cycles observed.
    #[must_use]
    pub fn rebalances(&self) -> u64 {
        self.rebalances.load(Ordering::Relaxed)
    }

    /// Returns total commits acknowledged by the client.
    #[must_use]
    pub fn commits_completed(&self) -> u64 {
        self.commits_completed.load(Ordering::Relaxed)
    }

    /// Returns total commits that failed at the client.
    #[must_use]
    pub fn commits_failed(&self) -> u64 {
        self.commits_failed.load(Ordering::Relaxed)
    }

    /// Returns total commits deferred during rebalances.
    #[must_use]
    pub fn commits_deferred(&self) -> u64 {
        self.commits_deferred.load(Ordering::Relaxed)
    }
}

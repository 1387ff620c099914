//! Rebalance reactor.
//!
//! The client invokes its revoke/assign callbacks synchronously from inside
//! a poll, on the run loop's thread. [`RebalanceReactor`] turns each
//! callback into one atomic state transaction, executes the resulting fetch
//! completions after the lock is released, and then notifies registered
//! listeners in registration order.
//!
//! Pending commits are *not* flushed here: the next poll handler observes
//! the `rebalancing` true-to-false transition and replays them.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::metrics::RunLoopMetrics;
use crate::runloop::state::StateStore;
use crate::types::{CompletionReason, TopicPartition};

/// Reacts to partition revoke/assign callbacks from the client.
pub struct RebalanceReactor {
    state: Arc<StateStore>,
    metrics: Arc<RunLoopMetrics>,
}

impl RebalanceReactor {
    pub(crate) fn new(state: Arc<StateStore>, metrics: Arc<RunLoopMetrics>) -> Self {
        Self { state, metrics }
    }

    /// Handles partition revocation.
    ///
    /// In one transaction: marks a rebalance in progress and evicts the
    /// revoked partitions. Every waiting fetch completes exactly once with
    /// `PartitionRevoked`, carrying the partition's buffered records as a
    /// final chunk when there are any. Listeners run after all completions.
    pub fn on_partitions_revoked(&self, revoked: &BTreeSet<TopicPartition>) {
        let (completions, listeners) = self.state.modify(|state| {
            state.rebalancing = true;
            (state.revoke_partitions(revoked), state.listeners.clone())
        });

        let fetches = completions.len();
        for completion in completions {
            self.metrics.record_fetch_revoked();
            completion
                .token
                .complete(completion.records, CompletionReason::PartitionRevoked);
        }
        for listener in &listeners {
            listener.notify_revoked(revoked);
        }
        info!(
            partitions = revoked.len(),
            fetches, "revoked partitions and completed their fetches"
        );
    }

    /// Handles partition assignment: ends the rebalance and notifies
    /// listeners in registration order.
    pub fn on_partitions_assigned(&self, assigned: &BTreeSet<TopicPartition>) {
        let listeners = self.state.modify(|state| {
            state.rebalancing = false;
            state.listeners.clone()
        });
        self.metrics.record_rebalance();

        for listener in &listeners {
            listener.notify_assigned(assigned);
        }
        debug!(partitions = assigned.len(), "assignment installed");
    }
}

impl std::fmt::Debug for RebalanceReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceReactor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runloop::request::{FetchToken, RebalanceEvent, RebalanceListener};
    use crate::types::{PartitionStreamId, StreamId};

    fn reactor() -> (RebalanceReactor, Arc<StateStore>) {
        let state = Arc::new(StateStore::new());
        let metrics = Arc::new(RunLoopMetrics::new());
        (
            RebalanceReactor::new(Arc::clone(&state), metrics),
            state,
        )
    }

    fn tps(partitions: &[i32]) -> BTreeSet<TopicPartition> {
        partitions
            .iter()
            .map(|p| TopicPartition::new("t", *p))
            .collect()
    }

    #[test]
    fn test_revoke_sets_rebalancing_and_drains() {
        let (reactor, state) = reactor();
        let (token, mut rx) = FetchToken::new();
        state.modify(|s| {
            s.install_fetch(
                TopicPartition::new("t", 0),
                StreamId(1),
                PartitionStreamId(1),
                token,
            )
        });

        reactor.on_partitions_revoked(&tps(&[0]));

        assert!(state.read(|s| s.rebalancing));
        assert!(state.read(|s| s.fetches.is_empty()));
        assert_eq!(
            rx.try_recv().unwrap().reason,
            CompletionReason::PartitionRevoked
        );
    }

    #[test]
    fn test_assign_clears_rebalancing() {
        let (reactor, state) = reactor();
        reactor.on_partitions_revoked(&tps(&[0]));
        assert!(state.read(|s| s.rebalancing));

        reactor.on_partitions_assigned(&tps(&[0, 1]));
        assert!(!state.read(|s| s.rebalancing));
    }

    #[test]
    fn test_listeners_notified_in_registration_order() {
        let (reactor, state) = reactor();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for id in 0..3 {
            let assigned_order = Arc::clone(&order);
            let revoked_order = Arc::clone(&order);
            let listener = RebalanceListener::new(
                move |_| assigned_order.lock().push(("assigned", id)),
                move |_| revoked_order.lock().push(("revoked", id)),
            );
            state.modify(|s| s.listeners.push(listener));
        }

        reactor.on_partitions_revoked(&tps(&[0]));
        reactor.on_partitions_assigned(&tps(&[1]));

        let seen = order.lock().clone();
        assert_eq!(
            seen,
            vec![
                ("revoked", 0),
                ("revoked", 1),
                ("revoked", 2),
                ("assigned", 0),
                ("assigned", 1),
                ("assigned", 2),
            ]
        );
    }

    #[test]
    fn test_revoke_completions_precede_listener_callbacks() {
        let (reactor, state) = reactor();
        let (token, rx) = FetchToken::new();
        let rx = Arc::new(parking_lot::Mutex::new(Some(rx)));

        state.modify(|s| {
            s.install_fetch(
                TopicPartition::new("t", 0),
                StreamId(1),
                PartitionStreamId(1),
                token,
            )
        });

        let observed = Arc::new(parking_lot::Mutex::new(None));
        let observed_in_listener = Arc::clone(&observed);
        let listener_rx = Arc::clone(&rx);
        let listener = RebalanceListener::new(
            |_| {},
            move |_| {
                // By the time the listener runs, the fetch is already done.
                let mut slot = listener_rx.lock();
                let completed = slot
                    .as_mut()
                    .is_some_and(|rx| rx.try_recv().is_ok());
                *observed_in_listener.lock() = Some(completed);
            },
        );
        state.modify(|s| s.listeners.push(listener));

        reactor.on_partitions_revoked(&tps(&[0]));
        assert_eq!(*observed.lock(), Some(true));
    }

    #[test]
    fn test_channel_listener_receives_events() {
        let (reactor, state) = reactor();
        let (listener, mut events) = RebalanceListener::channel();
        state.modify(|s| s.listeners.push(listener));

        reactor.on_partitions_revoked(&tps(&[0]));
        reactor.on_partitions_assigned(&tps(&[1, 2]));

        assert_eq!(
            events.try_recv().unwrap(),
            RebalanceEvent::Revoked(tps(&[0]))
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RebalanceEvent::Assigned(tps(&[1, 2]))
        );
    }
}

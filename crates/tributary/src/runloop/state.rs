//! The run loop's authoritative state.
//!
//! [`State`] is the single record of in-flight fetches, partition stream
//! ids, buffered records, pending commits, rebalance listeners, and
//! lifecycle flags. It is mutated only through [`StateStore::modify`], whose
//! closure runs under a short lock and returns the side effects to perform
//! as a value; callers execute those effects after the lock is released.
//! The guard is not `Send`, so no suspension point can occur inside the
//! critical section.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::record::CommittableRecord;
use crate::runloop::commit::CommitRequest;
use crate::runloop::request::{FetchToken, RebalanceListener};
use crate::types::{PartitionStreamId, StreamId, TopicPartition};

/// A fetch completion computed inside a state transaction and executed
/// after the lock is released.
pub(crate) struct Completion {
    /// The token to complete.
    pub token: FetchToken,
    /// The chunk to deliver.
    pub records: Vec<CommittableRecord>,
}

/// The run loop's mutable state.
///
/// Invariants:
///
/// - at most one token per `(partition, stream)` key in `fetches`,
/// - `partition_stream_ids` entries never decrease,
/// - `records` entries are non-empty,
/// - `pending_commits` is non-empty only while `rebalancing` is true.
#[derive(Default)]
pub(crate) struct State {
    /// Outstanding fetch tokens keyed by partition, then stream.
    pub fetches: BTreeMap<TopicPartition, BTreeMap<StreamId, FetchToken>>,
    /// Highest partition-stream id seen per partition.
    pub partition_stream_ids: BTreeMap<TopicPartition, PartitionStreamId>,
    /// Records polled before any stream asked for them.
    pub records: BTreeMap<TopicPartition, Vec<CommittableRecord>>,
    /// Commits held back while a rebalance is in progress.
    pub pending_commits: Vec<CommitRequest>,
    /// Rebalance listeners in registration order.
    pub listeners: Vec<RebalanceListener>,
    /// True from entry into a revoke callback until the matching assign
    /// callback completes.
    pub rebalancing: bool,
    /// True after the first successful subscribe or assign.
    pub subscribed: bool,
    /// True once any stream has registered a rebalance listener.
    pub streaming: bool,
}

impl State {
    /// Installs a fetch token, or rejects it as stale.
    ///
    /// Returns a token that must be completed with a revocation: the
    /// submitted token when the request predates the partition's current
    /// run, or a displaced prior token for the same `(partition, stream)`.
    pub fn install_fetch(
        &mut self,
        partition: TopicPartition,
        stream: StreamId,
        partition_stream: PartitionStreamId,
        token: FetchToken,
    ) -> Option<FetchToken> {
        let current = self
            .partition_stream_ids
            .get(&partition)
            .copied()
            .unwrap_or_default();

        if current > partition_stream {
            // A newer run of this partition exists. Reject the request and
            // drop the buffer that predates the reassignment; the new run
            // re-fetches from the client.
            self.records.remove(&partition);
            return Some(token);
        }

        self.partition_stream_ids
            .insert(partition.clone(), partition_stream.max(current));
        self.fetches
            .entry(partition)
            .or_default()
            .insert(stream, token)
    }

    /// Merges newly polled records with the buffered ones and completes
    /// every fetch whose partition now has records.
    ///
    /// Each completed fetch receives the partition's full chunk (buffered
    /// records first, then new ones, in broker order). When several streams
    /// hold tokens for the same partition they all receive the same chunk.
    /// Partitions with records but no waiting fetch keep their buffer.
    pub fn integrate_poll(
        &mut self,
        new_records: BTreeMap<TopicPartition, Vec<CommittableRecord>>,
    ) -> Vec<Completion> {
        for (tp, records) in new_records {
            if records.is_empty() {
                continue;
            }
            self.records.entry(tp).or_default().extend(records);
        }

        if self.fetches.is_empty() {
            return Vec::new();
        }

        let completable: Vec<TopicPartition> = self
            .records
            .keys()
            .filter(|tp| self.fetches.contains_key(*tp))
            .cloned()
            .collect();

        let mut completions = Vec::new();
        for tp in completable {
            let chunk = self.records.remove(&tp).unwrap_or_default();
            if let Some(tokens) = self.fetches.remove(&tp) {
                for token in tokens.into_values() {
                    completions.push(Completion {
                        token,
                        records: chunk.clone(),
                    });
                }
            }
        }
        completions
    }

    /// Evicts the given partitions: every waiting fetch is completed with
    /// whatever the partition had buffered, and buffers without waiters are
    /// dropped. Partition stream ids are retained so later runs of the same
    /// partition stay monotonic.
    pub fn revoke_partitions(&mut self, revoked: &BTreeSet<TopicPartition>) -> Vec<Completion> {
        let mut completions = Vec::new();
        for tp in revoked {
            let buffered = self.records.remove(tp).unwrap_or_default();
            if let Some(tokens) = self.fetches.remove(tp) {
                for token in tokens.into_values() {
                    completions.push(Completion {
                        token,
                        records: buffered.clone(),
                    });
                }
            }
        }
        completions
    }

    /// Removes and returns all pending commits, in submission order.
    pub fn take_pending_commits(&mut self) -> Vec<CommitRequest> {
        std::mem::take(&mut self.pending_commits)
    }
}

/// Shared, lock-protected [`State`].
pub(crate) struct StateStore {
    inner: Mutex<State>,
}

impl StateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(State::default()),
        }
    }

    /// Runs a state transaction. The closure's return value is the action
    /// to execute after the lock is released; any completion or I/O must
    /// flow through it rather than run inside the closure.
    pub fn modify<A>(&self, f: impl FnOnce(&mut State) -> A) -> A {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }

    /// Reads a snapshot of the state. Advisory only: decisions that span a
    /// read and a write must use [`StateStore::modify`].
    pub fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let guard = self.inner.lock();
        f(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use crate::runloop::commit::Committer;
    use crate::types::CompletionReason;
    use std::collections::BTreeMap;
    use tokio::sync::oneshot::error::TryRecvError;

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("t", partition)
    }

    fn committer() -> Committer {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        Committer::new(tx, &crate::config::ConsumerConfig::default())
    }

    fn committable(partition: &TopicPartition, offset: i64) -> CommittableRecord {
        CommittableRecord::new(
            Record::new(partition.clone(), offset, Some(vec![1])),
            committer(),
        )
    }

    fn batch(partition: &TopicPartition, offsets: &[i64]) -> BTreeMap<TopicPartition, Vec<CommittableRecord>> {
        let mut map = BTreeMap::new();
        map.insert(
            partition.clone(),
            offsets.iter().map(|o| committable(partition, *o)).collect(),
        );
        map
    }

    // -- install_fetch --

    #[test]
    fn test_install_fetch_records_stream_id() {
        let mut state = State::default();
        let (token, _rx) = FetchToken::new();

        let revoked = state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), token);
        assert!(revoked.is_none());
        assert_eq!(
            state.partition_stream_ids.get(&tp(0)),
            Some(&PartitionStreamId(1))
        );
        assert_eq!(state.fetches[&tp(0)].len(), 1);
    }

    #[test]
    fn test_install_fetch_displaces_prior_token_for_same_key() {
        let mut state = State::default();
        let (first, mut first_rx) = FetchToken::new();
        let (second, _second_rx) = FetchToken::new();

        assert!(state
            .install_fetch(tp(0), StreamId(1), PartitionStreamId(1), first)
            .is_none());
        let displaced = state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), second);

        // At most one token per (partition, stream): the first is displaced.
        let displaced = displaced.expect("prior token displaced");
        displaced.complete(Vec::new(), CompletionReason::PartitionRevoked);
        assert_eq!(
            first_rx.try_recv().unwrap().reason,
            CompletionReason::PartitionRevoked
        );
        assert_eq!(state.fetches[&tp(0)].len(), 1);
    }

    #[test]
    fn test_install_fetch_distinct_streams_coexist() {
        let mut state = State::default();
        let (a, _rx_a) = FetchToken::new();
        let (b, _rx_b) = FetchToken::new();

        assert!(state
            .install_fetch(tp(0), StreamId(1), PartitionStreamId(1), a)
            .is_none());
        assert!(state
            .install_fetch(tp(0), StreamId(2), PartitionStreamId(1), b)
            .is_none());
        assert_eq!(state.fetches[&tp(0)].len(), 2);
    }

    #[test]
    fn test_install_fetch_stale_is_rejected() {
        let mut state = State::default();
        let (fresh, _fresh_rx) = FetchToken::new();
        let (stale, mut stale_rx) = FetchToken::new();

        assert!(state
            .install_fetch(tp(0), StreamId(1), PartitionStreamId(2), fresh)
            .is_none());
        state.records.insert(tp(0), vec![committable(&tp(0), 0)]);

        let rejected = state.install_fetch(tp(0), StreamId(2), PartitionStreamId(1), stale);

        // The stale token comes back for revoked completion; the installed
        // fetch and the stream id are untouched; the buffer is dropped.
        let rejected = rejected.expect("stale token rejected");
        rejected.complete(Vec::new(), CompletionReason::PartitionRevoked);
        assert_eq!(
            stale_rx.try_recv().unwrap().reason,
            CompletionReason::PartitionRevoked
        );
        assert_eq!(state.fetches[&tp(0)].len(), 1);
        assert_eq!(
            state.partition_stream_ids.get(&tp(0)),
            Some(&PartitionStreamId(2))
        );
        assert!(state.records.is_empty());
    }

    #[test]
    fn test_partition_stream_ids_never_decrease() {
        let mut state = State::default();
        for psid in [1, 3, 2, 3, 1] {
            let (token, _rx) = FetchToken::new();
            state.install_fetch(tp(0), StreamId(psid), PartitionStreamId(psid), token);
            let current = state.partition_stream_ids[&tp(0)];
            assert!(current >= PartitionStreamId(psid.min(3)));
        }
        assert_eq!(state.partition_stream_ids[&tp(0)], PartitionStreamId(3));
    }

    // -- integrate_poll --

    #[test]
    fn test_integrate_poll_buffers_without_fetches() {
        let mut state = State::default();
        let completions = state.integrate_poll(batch(&tp(0), &[0, 1]));
        assert!(completions.is_empty());
        assert_eq!(state.records[&tp(0)].len(), 2);
    }

    #[test]
    fn test_integrate_poll_empty_is_noop() {
        let mut state = State::default();
        let completions = state.integrate_poll(BTreeMap::new());
        assert!(completions.is_empty());
        assert!(state.records.is_empty());
    }

    #[test]
    fn test_integrate_poll_completes_fetch_with_merged_chunk() {
        let mut state = State::default();
        state.records.insert(tp(0), vec![committable(&tp(0), 0)]);
        let (token, mut rx) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), token);

        let completions = state.integrate_poll(batch(&tp(0), &[1]));
        assert_eq!(completions.len(), 1);
        for c in completions {
            c.token.complete(c.records, CompletionReason::FetchedRecords);
        }

        // Buffered records come first, new records after, in order.
        let response = rx.try_recv().unwrap();
        assert_eq!(response.reason, CompletionReason::FetchedRecords);
        let offsets: Vec<i64> = response.records.iter().map(CommittableRecord::offset).collect();
        assert_eq!(offsets, vec![0, 1]);
        assert!(state.records.is_empty());
        assert!(state.fetches.is_empty());
    }

    #[test]
    fn test_integrate_poll_completes_from_buffer_alone() {
        let mut state = State::default();
        state.records.insert(tp(0), vec![committable(&tp(0), 5)]);
        let (token, mut rx) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), token);

        let completions = state.integrate_poll(BTreeMap::new());
        assert_eq!(completions.len(), 1);
        for c in completions {
            c.token.complete(c.records, CompletionReason::FetchedRecords);
        }
        assert_eq!(rx.try_recv().unwrap().records.len(), 1);
    }

    #[test]
    fn test_integrate_poll_fans_out_same_chunk() {
        let mut state = State::default();
        let (a, mut rx_a) = FetchToken::new();
        let (b, mut rx_b) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), a);
        state.install_fetch(tp(0), StreamId(2), PartitionStreamId(1), b);

        let completions = state.integrate_poll(batch(&tp(0), &[7, 8]));
        assert_eq!(completions.len(), 2);
        for c in completions {
            c.token.complete(c.records, CompletionReason::FetchedRecords);
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let response = rx.try_recv().unwrap();
            let offsets: Vec<i64> =
                response.records.iter().map(CommittableRecord::offset).collect();
            assert_eq!(offsets, vec![7, 8]);
        }
    }

    #[test]
    fn test_integrate_poll_stores_undemanded_partitions() {
        let mut state = State::default();
        let (token, mut rx) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), token);

        let mut new_records = batch(&tp(0), &[0]);
        new_records.extend(batch(&tp(1), &[9]));

        let completions = state.integrate_poll(new_records);
        assert_eq!(completions.len(), 1);
        for c in completions {
            c.token.complete(c.records, CompletionReason::FetchedRecords);
        }
        assert_eq!(rx.try_recv().unwrap().records.len(), 1);
        // The partition nobody asked for stays buffered.
        assert_eq!(state.records[&tp(1)].len(), 1);
    }

    // -- revoke_partitions --

    #[test]
    fn test_revoke_drains_fetches_exactly_once() {
        let mut state = State::default();
        let (a, mut rx_a) = FetchToken::new();
        let (b, mut rx_b) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), a);
        state.install_fetch(tp(0), StreamId(2), PartitionStreamId(1), b);

        let revoked: BTreeSet<TopicPartition> = [tp(0)].into_iter().collect();
        let completions = state.revoke_partitions(&revoked);
        assert_eq!(completions.len(), 2);
        for c in completions {
            c.token.complete(c.records, CompletionReason::PartitionRevoked);
        }

        assert!(state.fetches.is_empty());
        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(
                rx.try_recv().unwrap().reason,
                CompletionReason::PartitionRevoked
            );
            // One-shot: nothing further arrives.
            assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        }
    }

    #[test]
    fn test_revoke_delivers_buffered_records_as_final_chunk() {
        let mut state = State::default();
        state
            .records
            .insert(tp(0), vec![committable(&tp(0), 3), committable(&tp(0), 4)]);
        let (token, mut rx) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), token);

        let revoked: BTreeSet<TopicPartition> = [tp(0)].into_iter().collect();
        for c in state.revoke_partitions(&revoked) {
            c.token.complete(c.records, CompletionReason::PartitionRevoked);
        }

        let response = rx.try_recv().unwrap();
        assert_eq!(response.reason, CompletionReason::PartitionRevoked);
        let offsets: Vec<i64> = response.records.iter().map(CommittableRecord::offset).collect();
        assert_eq!(offsets, vec![3, 4]);
        assert!(state.records.is_empty());
    }

    #[test]
    fn test_revoke_drops_buffers_without_waiters() {
        let mut state = State::default();
        state.records.insert(tp(0), vec![committable(&tp(0), 0)]);

        let revoked: BTreeSet<TopicPartition> = [tp(0)].into_iter().collect();
        let completions = state.revoke_partitions(&revoked);
        assert!(completions.is_empty());
        assert!(state.records.is_empty());
    }

    #[test]
    fn test_revoke_keeps_partition_stream_ids() {
        let mut state = State::default();
        let (token, _rx) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(4), token);

        let revoked: BTreeSet<TopicPartition> = [tp(0)].into_iter().collect();
        state.revoke_partitions(&revoked);
        assert_eq!(state.partition_stream_ids[&tp(0)], PartitionStreamId(4));
    }

    #[test]
    fn test_revoke_untouched_partition_keeps_state() {
        let mut state = State::default();
        let (token, _rx) = FetchToken::new();
        state.install_fetch(tp(0), StreamId(1), PartitionStreamId(1), token);
        state.records.insert(tp(1), vec![committable(&tp(1), 0)]);

        let revoked: BTreeSet<TopicPartition> = [tp(2)].into_iter().collect();
        let completions = state.revoke_partitions(&revoked);
        assert!(completions.is_empty());
        assert_eq!(state.fetches.len(), 1);
        assert_eq!(state.records.len(), 1);
    }

    // -- store --

    #[test]
    fn test_store_modify_returns_action() {
        let store = StateStore::new();
        let flagged = store.modify(|s| {
            s.subscribed = true;
            s.subscribed
        });
        assert!(flagged);
        assert!(store.read(|s| s.subscribed));
    }

    #[test]
    fn test_take_pending_commits_clears() {
        let store = StateStore::new();
        let (tx, _rx) = tokio::sync::oneshot::channel();
        store.modify(|s| {
            s.pending_commits.push(CommitRequest {
                offsets: BTreeMap::new(),
                reply: tx,
            });
        });
        let taken = store.modify(State::take_pending_commits);
        assert_eq!(taken.len(), 1);
        assert!(store.read(|s| s.pending_commits.is_empty()));
    }
}

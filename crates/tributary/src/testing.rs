//! Testing utilities for the consumer run loop.
//!
//! Provides a scriptable [`MockConsumerClient`] plus helper functions for
//! driving a run loop without a broker. Each poll consumes one
//! [`PollScript`], which can inject rebalance callbacks, deliver records,
//! or fail, in the same order a real client would: revocation first, then
//! assignment, then the poll outcome.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::error::KafkaError;

use crate::client::{CommitCallback, ConsumerClient};
use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::record::Record;
use crate::runloop::{RebalanceReactor, RunLoop, RunLoopHandle};
use crate::types::{OffsetAndMetadata, TopicPartition};

/// Creates a record with a synthetic payload for tests.
#[must_use]
pub fn mock_record(topic: &str, partition: i32, offset: i64) -> Record {
    Record {
        partition: TopicPartition::new(topic, partition),
        offset,
        key: None,
        value: Some(format!("value-{offset}").into_bytes()),
        timestamp: None,
    }
}

/// Spawns a run loop backed by a [`MockConsumerClient`], returning both
/// handles.
///
/// # Errors
///
/// Returns [`crate::ConsumerError::Configuration`] for an invalid
/// configuration.
pub fn spawn_with_mock(config: ConsumerConfig) -> Result<(RunLoopHandle, MockClientHandle)> {
    let mut mock = None;
    let handle = RunLoop::spawn(config, |reactor| {
        let (client, client_handle) = MockConsumerClient::new(reactor);
        mock = Some(client_handle);
        let client: Box<dyn ConsumerClient> = Box::new(client);
        Ok(client)
    })?;
    Ok((handle, mock.expect("client factory ran")))
}

/// How the mock answers commit submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockCommitMode {
    /// Complete each commit callback immediately with success.
    #[default]
    Succeed,
    /// Complete each commit callback immediately with an error.
    Fail,
    /// Queue callbacks; the test completes them through
    /// [`MockClientHandle::complete_next_commit`] (or never, to exercise
    /// timeouts).
    Manual,
}

/// One scripted poll outcome.
#[derive(Default)]
pub struct PollScript {
    revoke: Option<BTreeSet<TopicPartition>>,
    assign: Option<BTreeSet<TopicPartition>>,
    records: BTreeMap<TopicPartition, Vec<Record>>,
    error: Option<KafkaError>,
}

impl PollScript {
    /// Creates an empty script (a poll returning nothing).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the revoke callback for the given partitions during the poll.
    #[must_use]
    pub fn revoke(mut self, partitions: BTreeSet<TopicPartition>) -> Self {
        self.revoke = Some(partitions);
        self
    }

    /// Fires the assign callback with the full new assignment during the
    /// poll.
    #[must_use]
    pub fn assign(mut self, partitions: BTreeSet<TopicPartition>) -> Self {
        self.assign = Some(partitions);
        self
    }

    /// Delivers records for a partition from this poll.
    #[must_use]
    pub fn records(mut self, partition: TopicPartition, records: Vec<Record>) -> Self {
        self.records.entry(partition).or_default().extend(records);
        self
    }

    /// Makes the poll fail after any scripted callbacks have fired.
    #[must_use]
    pub fn error(mut self, error: KafkaError) -> Self {
        self.error = Some(error);
        self
    }
}

#[derive(Default)]
struct MockInner {
    assignment: BTreeSet<TopicPartition>,
    subscriptions: Vec<String>,
    scripts: VecDeque<PollScript>,
    last_paused: Option<BTreeSet<TopicPartition>>,
    last_resumed: Option<BTreeSet<TopicPartition>>,
    commit_mode: MockCommitMode,
    commits: Vec<BTreeMap<TopicPartition, OffsetAndMetadata>>,
    pending_commit_callbacks: VecDeque<CommitCallback>,
    next_error: Option<KafkaError>,
    polls: u64,
}

impl MockInner {
    fn take_error(&mut self) -> std::result::Result<(), KafkaError> {
        match self.next_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Scriptable stand-in for the native consumer client.
///
/// Rebalance callbacks fire synchronously from inside `poll`, exactly as a
/// real client's do. `unsubscribe` fires a full revoke followed by an empty
/// assignment, modelling the rebalance cycle a real client runs when it
/// leaves the group.
pub struct MockConsumerClient {
    shared: Arc<Mutex<MockInner>>,
    reactor: Arc<RebalanceReactor>,
}

impl MockConsumerClient {
    /// Creates a mock client wired to the given reactor, plus the handle
    /// tests use to script and inspect it.
    #[must_use]
    pub fn new(reactor: Arc<RebalanceReactor>) -> (Self, MockClientHandle) {
        let shared = Arc::new(Mutex::new(MockInner::default()));
        let client = Self {
            shared: Arc::clone(&shared),
            reactor,
        };
        (client, MockClientHandle { shared })
    }
}

impl ConsumerClient for MockConsumerClient {
    fn subscribe(&mut self, topics: &[String]) -> std::result::Result<(), KafkaError> {
        let mut inner = self.shared.lock();
        inner.take_error()?;
        inner.subscriptions = topics.to_vec();
        Ok(())
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> std::result::Result<(), KafkaError> {
        let mut inner = self.shared.lock();
        inner.take_error()?;
        inner.subscriptions = vec![pattern.to_string()];
        Ok(())
    }

    fn assign(&mut self, partitions: &BTreeSet<TopicPartition>) -> std::result::Result<(), KafkaError> {
        let mut inner = self.shared.lock();
        inner.take_error()?;
        inner.assignment = partitions.clone();
        Ok(())
    }

    fn unsubscribe(&mut self) -> std::result::Result<(), KafkaError> {
        let departing = {
            let mut inner = self.shared.lock();
            inner.take_error()?;
            inner.subscriptions.clear();
            std::mem::take(&mut inner.assignment)
        };
        if !departing.is_empty() {
            self.reactor.on_partitions_revoked(&departing);
            self.reactor.on_partitions_assigned(&BTreeSet::new());
        }
        Ok(())
    }

    fn assignment(&self) -> std::result::Result<BTreeSet<TopicPartition>, KafkaError> {
        let mut inner = self.shared.lock();
        inner.take_error()?;
        Ok(inner.assignment.clone())
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> std::result::Result<(), KafkaError> {
        self.shared.lock().last_paused = Some(partitions.clone());
        Ok(())
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> std::result::Result<(), KafkaError> {
        self.shared.lock().last_resumed = Some(partitions.clone());
        Ok(())
    }

    fn poll(
        &mut self,
        _timeout: Duration,
    ) -> std::result::Result<BTreeMap<TopicPartition, Vec<Record>>, KafkaError> {
        let script = {
            let mut inner = self.shared.lock();
            inner.polls += 1;
            inner.take_error()?;
            inner.scripts.pop_front()
        };
        let Some(script) = script else {
            return Ok(BTreeMap::new());
        };

        // Callbacks run outside the mock's lock: the reactor takes the
        // state lock and may complete fetches.
        if let Some(revoked) = script.revoke {
            {
                let mut inner = self.shared.lock();
                for tp in &revoked {
                    inner.assignment.remove(tp);
                }
            }
            self.reactor.on_partitions_revoked(&revoked);
        }
        if let Some(assigned) = script.assign {
            self.shared.lock().assignment = assigned.clone();
            self.reactor.on_partitions_assigned(&assigned);
        }
        if let Some(error) = script.error {
            return Err(error);
        }
        Ok(script.records)
    }

    fn commit(
        &mut self,
        offsets: &BTreeMap<TopicPartition, OffsetAndMetadata>,
        done: CommitCallback,
    ) {
        let mode = {
            let mut inner = self.shared.lock();
            inner.commits.push(offsets.clone());
            inner.commit_mode
        };
        match mode {
            MockCommitMode::Succeed => done(Ok(())),
            MockCommitMode::Fail => done(Err(KafkaError::MessageConsumption(
                rdkafka::types::RDKafkaErrorCode::OperationTimedOut,
            ))),
            MockCommitMode::Manual => {
                self.shared.lock().pending_commit_callbacks.push_back(done);
            }
        }
    }
}

impl std::fmt::Debug for MockConsumerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConsumerClient").finish_non_exhaustive()
    }
}

/// Scripting and inspection handle for a [`MockConsumerClient`].
pub struct MockClientHandle {
    shared: Arc<Mutex<MockInner>>,
}

impl MockClientHandle {
    /// Queues a script for the next unconsumed poll.
    pub fn push_poll(&self, script: PollScript) {
        self.shared.lock().scripts.push_back(script);
    }

    /// Sets the assignment directly, without firing callbacks.
    pub fn set_assignment(&self, partitions: BTreeSet<TopicPartition>) {
        self.shared.lock().assignment = partitions;
    }

    /// Sets how subsequent commit submissions are answered.
    pub fn set_commit_mode(&self, mode: MockCommitMode) {
        self.shared.lock().commit_mode = mode;
    }

    /// Makes the next client operation fail with the given error.
    pub fn fail_next(&self, error: KafkaError) {
        self.shared.lock().next_error = Some(error);
    }

    /// Completes the oldest queued commit callback (manual mode). Returns
    /// false when none is pending.
    pub fn complete_next_commit(&self, result: std::result::Result<(), KafkaError>) -> bool {
        let callback = self.shared.lock().pending_commit_callbacks.pop_front();
        match callback {
            Some(done) => {
                done(result);
                true
            }
            None => false,
        }
    }

    /// Number of commit callbacks awaiting manual completion.
    #[must_use]
    pub fn pending_commits(&self) -> usize {
        self.shared.lock().pending_commit_callbacks.len()
    }

    /// Number of commits submitted to the client.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.shared.lock().commits.len()
    }

    /// All submitted commits, in submission order.
    #[must_use]
    pub fn commits(&self) -> Vec<BTreeMap<TopicPartition, OffsetAndMetadata>> {
        self.shared.lock().commits.clone()
    }

    /// The client's current assignment.
    #[must_use]
    pub fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.shared.lock().assignment.clone()
    }

    /// The topics or pattern most recently subscribed.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.lock().subscriptions.clone()
    }

    /// The set passed to the most recent `pause` call.
    #[must_use]
    pub fn last_paused(&self) -> Option<BTreeSet<TopicPartition>> {
        self.shared.lock().last_paused.clone()
    }

    /// The set passed to the most recent `resume` call.
    #[must_use]
    pub fn last_resumed(&self) -> Option<BTreeSet<TopicPartition>> {
        self.shared.lock().last_resumed.clone()
    }

    /// Number of polls the client has served.
    #[must_use]
    pub fn polls(&self) -> u64 {
        self.shared.lock().polls
    }

    /// Number of queued scripts not yet consumed.
    #[must_use]
    pub fn remaining_scripts(&self) -> usize {
        self.shared.lock().scripts.len()
    }
}

impl std::fmt::Debug for MockClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("MockClientHandle")
            .field("assignment", &inner.assignment)
            .field("polls", &inner.polls)
            .field("commits", &inner.commits.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RunLoopMetrics;
    use crate::runloop::state::StateStore;

    fn mock() -> (MockConsumerClient, MockClientHandle) {
        let state = Arc::new(StateStore::new());
        let metrics = Arc::new(RunLoopMetrics::new());
        let reactor = Arc::new(RebalanceReactor::new(state, metrics));
        MockConsumerClient::new(reactor)
    }

    fn tp(partition: i32) -> TopicPartition {
        TopicPartition::new("t", partition)
    }

    #[test]
    fn test_empty_poll_returns_nothing() {
        let (mut client, handle) = mock();
        let records = client.poll(Duration::ZERO).unwrap();
        assert!(records.is_empty());
        assert_eq!(handle.polls(), 1);
    }

    #[test]
    fn test_scripted_records_are_delivered_once() {
        let (mut client, handle) = mock();
        handle.push_poll(PollScript::new().records(tp(0), vec![mock_record("t", 0, 0)]));

        let first = client.poll(Duration::ZERO).unwrap();
        assert_eq!(first[&tp(0)].len(), 1);
        let second = client.poll(Duration::ZERO).unwrap();
        assert!(second.is_empty());
        assert_eq!(handle.remaining_scripts(), 0);
    }

    #[test]
    fn test_script_callbacks_update_assignment() {
        let (mut client, handle) = mock();
        let assigned: BTreeSet<TopicPartition> = [tp(0), tp(1)].into_iter().collect();
        handle.push_poll(PollScript::new().assign(assigned.clone()));
        client.poll(Duration::ZERO).unwrap();
        assert_eq!(handle.assignment(), assigned);

        let revoked: BTreeSet<TopicPartition> = [tp(0)].into_iter().collect();
        handle.push_poll(PollScript::new().revoke(revoked));
        client.poll(Duration::ZERO).unwrap();
        assert_eq!(handle.assignment(), [tp(1)].into_iter().collect());
    }

    #[test]
    fn test_scripted_error_fails_poll() {
        let (mut client, handle) = mock();
        handle.push_poll(PollScript::new().error(KafkaError::MessageConsumption(
            rdkafka::types::RDKafkaErrorCode::OperationTimedOut,
        )));
        assert!(client.poll(Duration::ZERO).is_err());
    }

    #[test]
    fn test_fail_next_applies_once() {
        let (mut client, handle) = mock();
        handle.fail_next(KafkaError::Subscription("boom".into()));
        assert!(client.subscribe(&["t".into()]).is_err());
        assert!(client.subscribe(&["t".into()]).is_ok());
    }

    #[test]
    fn test_manual_commit_mode_queues_callbacks() {
        let (mut client, handle) = mock();
        handle.set_commit_mode(MockCommitMode::Manual);

        let (tx, rx) = std::sync::mpsc::channel();
        client.commit(
            &BTreeMap::new(),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        assert_eq!(handle.pending_commits(), 1);
        assert!(handle.complete_next_commit(Ok(())));
        assert!(rx.try_recv().unwrap());
        assert!(!handle.complete_next_commit(Ok(())));
    }

    #[test]
    fn test_unsubscribe_revokes_assignment() {
        let (mut client, handle) = mock();
        let assigned: BTreeSet<TopicPartition> = [tp(0)].into_iter().collect();
        handle.push_poll(PollScript::new().assign(assigned));
        client.poll(Duration::ZERO).unwrap();

        client.unsubscribe().unwrap();
        assert!(handle.assignment().is_empty());
    }
}

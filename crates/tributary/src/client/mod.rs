//! The narrow client interface and its exclusive-access gate.
//!
//! [`ConsumerClient`] models the surface of a partitioned-log consumer
//! client (librdkafka's consumer API): subscribe/assign, pause/resume,
//! poll, and asynchronous commit. Implementations are not assumed to be
//! thread-safe; every call goes through the [`ClientGate`], which serializes
//! access in arrival order.
//!
//! Rebalance callbacks are not part of this trait: they are wired into the
//! client at construction time (see [`kafka::KafkaConsumerClient`] and
//! [`crate::testing::MockConsumerClient`]) and fire synchronously from
//! inside [`ConsumerClient::poll`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rdkafka::error::KafkaError;

use crate::record::Record;
use crate::types::{OffsetAndMetadata, TopicPartition};

pub mod kafka;

/// Completion callback for an asynchronous commit.
///
/// Invoked exactly once with the commit outcome. Implementations must not
/// block: the callback may run on the client's polling thread.
pub type CommitCallback = Box<dyn FnOnce(Result<(), KafkaError>) + Send>;

/// The downward interface to the native consumer client.
///
/// All methods are synchronous; the run loop holds the [`ClientGate`] for
/// the duration of each call. `poll` may synchronously invoke the rebalance
/// reactor before returning.
pub trait ConsumerClient: Send {
    /// Subscribes to the given topics, replacing any previous subscription.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the subscription is rejected.
    fn subscribe(&mut self, topics: &[String]) -> Result<(), KafkaError>;

    /// Subscribes to all topics matching a regex pattern.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the subscription is rejected.
    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), KafkaError>;

    /// Manually assigns the given partitions. No rebalance callbacks fire
    /// for manually assigned partitions.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the assignment is rejected.
    fn assign(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError>;

    /// Drops the current subscription. Revocation of the departing
    /// partitions is reported through the rebalance callbacks.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the operation fails.
    fn unsubscribe(&mut self) -> Result<(), KafkaError>;

    /// Returns the set of partitions currently assigned to this client.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the assignment cannot be read.
    fn assignment(&self) -> Result<BTreeSet<TopicPartition>, KafkaError>;

    /// Pauses fetching for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the operation fails.
    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError>;

    /// Resumes fetching for the given partitions.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the operation fails.
    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError>;

    /// Polls for records, waiting up to `timeout`.
    ///
    /// Returns records grouped per partition in broker order. May invoke
    /// rebalance callbacks synchronously before returning.
    ///
    /// # Errors
    ///
    /// Returns the client's error if the poll fails.
    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Result<BTreeMap<TopicPartition, Vec<Record>>, KafkaError>;

    /// Starts an asynchronous offset commit.
    ///
    /// `done` is invoked exactly once with the outcome, including when the
    /// submission itself fails.
    fn commit(
        &mut self,
        offsets: &BTreeMap<TopicPartition, OffsetAndMetadata>,
        done: CommitCallback,
    );
}

/// Mutually exclusive access to the consumer client.
///
/// Callers are served in arrival order. This is the only path to the
/// client; nothing else in the crate holds a reference to it.
pub struct ClientGate {
    client: tokio::sync::Mutex<Box<dyn ConsumerClient>>,
}

impl ClientGate {
    /// Wraps a client in a gate.
    #[must_use]
    pub fn new(client: Box<dyn ConsumerClient>) -> Self {
        Self {
            client: tokio::sync::Mutex::new(client),
        }
    }

    /// Runs `f` with exclusive access to the client.
    ///
    /// The closure is synchronous: no suspension point can occur while the
    /// gate is held, so rebalance callbacks re-entering from inside `poll`
    /// observe a consistent world.
    pub async fn with_client<T>(&self, f: impl FnOnce(&mut dyn ConsumerClient) -> T) -> T {
        let mut guard = self.client.lock().await;
        f(guard.as_mut())
    }
}

impl std::fmt::Debug for ClientGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientGate").finish_non_exhaustive()
    }
}

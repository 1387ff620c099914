//! Kafka-backed consumer client.
//!
//! [`KafkaConsumerClient`] implements [`ConsumerClient`] over rdkafka's
//! `BaseConsumer`. A custom consumer context forwards partition
//! revoke/assign callbacks to the [`RebalanceReactor`] and bridges commit
//! callbacks onto their pending completions.
//!
//! `BaseConsumer` serves its callbacks from inside `poll` on the calling
//! thread, which is exactly the re-entry model the run loop is built
//! around: the client gate is held across the whole poll, and the reactor
//! mutates state without touching the gate.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::client::{CommitCallback, ConsumerClient};
use crate::config::ConsumerConfig;
use crate::record::Record;
use crate::runloop::RebalanceReactor;
use crate::types::{OffsetAndMetadata, TopicPartition};

/// Pending commit completions, served FIFO by the commit callback.
type CommitSlots = Arc<Mutex<VecDeque<CommitCallback>>>;

/// Consumer context wiring rdkafka callbacks into the run loop.
pub struct RunLoopContext {
    reactor: Arc<RebalanceReactor>,
    commit_slots: CommitSlots,
}

impl RunLoopContext {
    fn new(reactor: Arc<RebalanceReactor>, commit_slots: CommitSlots) -> Self {
        Self {
            reactor,
            commit_slots,
        }
    }
}

impl ClientContext for RunLoopContext {}

impl ConsumerContext for RunLoopContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let revoked = tpl_to_set(tpl);
                info!(partitions = revoked.len(), "partitions being revoked");
                self.reactor.on_partitions_revoked(&revoked);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                warn!(error = %e, "rebalance error");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let assigned = tpl_to_set(tpl);
            info!(partitions = assigned.len(), "partitions assigned");
            self.reactor.on_partitions_assigned(&assigned);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        // Commits are submitted under the gate and librdkafka serves their
        // callbacks in submission order, so FIFO matching is sound.
        match self.commit_slots.lock().pop_front() {
            Some(done) => done(result),
            None => warn!("commit callback arrived with no pending completion"),
        }
    }
}

/// Production [`ConsumerClient`] over an rdkafka `BaseConsumer`.
pub struct KafkaConsumerClient {
    consumer: BaseConsumer<RunLoopContext>,
    commit_slots: CommitSlots,
}

impl KafkaConsumerClient {
    /// Creates a Kafka consumer from the given configuration, wiring
    /// rebalance callbacks into `reactor`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConsumerError::Configuration`] if broker settings
    /// are missing, or the client's error if construction fails.
    pub fn from_config(
        config: &ConsumerConfig,
        reactor: Arc<RebalanceReactor>,
    ) -> crate::error::Result<Self> {
        config.validate_for_kafka()?;
        let commit_slots: CommitSlots = Arc::new(Mutex::new(VecDeque::new()));
        let context = RunLoopContext::new(reactor, Arc::clone(&commit_slots));
        let consumer: BaseConsumer<RunLoopContext> =
            config.to_rdkafka_config().create_with_context(context)?;
        Ok(Self {
            consumer,
            commit_slots,
        })
    }

    fn convert(msg: &rdkafka::message::BorrowedMessage<'_>) -> Record {
        Record {
            partition: TopicPartition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(<[u8]>::to_vec),
            value: msg.payload().map(<[u8]>::to_vec),
            timestamp: msg.timestamp().to_millis(),
        }
    }
}

impl ConsumerClient for KafkaConsumerClient {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), KafkaError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), KafkaError> {
        // librdkafka treats topic names starting with '^' as regex patterns.
        let topic = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{pattern}")
        };
        self.consumer.subscribe(&[topic.as_str()])
    }

    fn assign(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        self.consumer.assign(&set_to_tpl(partitions))
    }

    fn unsubscribe(&mut self) -> Result<(), KafkaError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn assignment(&self) -> Result<BTreeSet<TopicPartition>, KafkaError> {
        self.consumer.assignment().map(|tpl| tpl_to_set(&tpl))
    }

    fn pause(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer.pause(&set_to_tpl(partitions))
    }

    fn resume(&mut self, partitions: &BTreeSet<TopicPartition>) -> Result<(), KafkaError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer.resume(&set_to_tpl(partitions))
    }

    fn poll(
        &mut self,
        timeout: Duration,
    ) -> Result<BTreeMap<TopicPartition, Vec<Record>>, KafkaError> {
        let mut out: BTreeMap<TopicPartition, Vec<Record>> = BTreeMap::new();

        // One bounded wait, then drain whatever is already buffered so a
        // single poll request delivers a batch rather than one record.
        match self.consumer.poll(timeout) {
            None => return Ok(out),
            Some(Err(e)) => return Err(e),
            Some(Ok(msg)) => {
                let record = Self::convert(&msg);
                out.entry(record.partition.clone()).or_default().push(record);
            }
        }
        while let Some(next) = self.consumer.poll(Duration::ZERO) {
            match next {
                Ok(msg) => {
                    let record = Self::convert(&msg);
                    out.entry(record.partition.clone()).or_default().push(record);
                }
                Err(e) => {
                    warn!(error = %e, "consumer error while draining poll");
                    break;
                }
            }
        }

        debug!(
            partitions = out.len(),
            records = out.values().map(Vec::len).sum::<usize>(),
            "polled records"
        );
        Ok(out)
    }

    fn commit(
        &mut self,
        offsets: &BTreeMap<TopicPartition, OffsetAndMetadata>,
        done: CommitCallback,
    ) {
        let mut tpl = TopicPartitionList::new();
        for (tp, entry) in offsets {
            if let Err(e) =
                tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(entry.offset))
            {
                done(Err(e));
                return;
            }
        }

        // The completion must be queued before the commit is submitted;
        // the callback can only fire during poll, and the gate is held for
        // the duration of this call, so the slot cannot be consumed early.
        self.commit_slots.lock().push_back(done);
        if let Err(e) = self.consumer.commit(&tpl, CommitMode::Async) {
            if let Some(done) = self.commit_slots.lock().pop_back() {
                done(Err(e));
            }
        }
    }
}

impl std::fmt::Debug for KafkaConsumerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConsumerClient")
            .field("pending_commits", &self.commit_slots.lock().len())
            .finish_non_exhaustive()
    }
}

fn tpl_to_set(tpl: &TopicPartitionList) -> BTreeSet<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

fn set_to_tpl(partitions: &BTreeSet<TopicPartition>) -> TopicPartitionList {
    let mut tpl = TopicPartitionList::new();
    for tp in partitions {
        tpl.add_partition(&tp.topic, tp.partition);
    }
    tpl
}

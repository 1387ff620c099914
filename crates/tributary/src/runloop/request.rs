//! Typed requests delivered to the run loop, and their completion slots.
//!
//! Every request carries a one-shot result slot. Slots are completed by
//! moving the sender into `send`, so double completion is unrepresentable.
//! A caller that stops waiting does not cancel the handler; the completion
//! is simply observed by no one.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::record::CommittableRecord;
use crate::runloop::commit::CommitRequest;
use crate::types::{CompletionReason, PartitionStreamId, StreamId, TopicPartition};

/// One-shot result slot for a request returning `T`.
pub(crate) type ReplySlot<T> = oneshot::Sender<Result<T>>;

/// The outcome of a fetch: a chunk of records plus the reason it completed.
#[derive(Debug)]
pub struct FetchResponse {
    /// Records delivered for the requested partition, in partition order.
    /// May be empty when the partition was revoked with nothing buffered.
    pub records: Vec<CommittableRecord>,
    /// Why the fetch completed.
    pub reason: CompletionReason,
}

/// One-shot completion slot for a fetch.
///
/// A token is owned jointly by the requesting stream (which awaits the
/// receiver) and the run loop state (which holds the completer side); after
/// completion it is owned by neither.
pub(crate) struct FetchToken {
    tx: oneshot::Sender<FetchResponse>,
}

impl FetchToken {
    /// Creates a token and the receiver the requester awaits.
    pub(crate) fn new() -> (Self, oneshot::Receiver<FetchResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Completes the token. Consuming `self` makes re-completion
    /// impossible; a dropped receiver is ignored.
    pub(crate) fn complete(self, records: Vec<CommittableRecord>, reason: CompletionReason) {
        let _ = self.tx.send(FetchResponse { records, reason });
    }
}

impl fmt::Debug for FetchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchToken").finish_non_exhaustive()
    }
}

/// A rebalance notification delivered through [`RebalanceListener::channel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Partitions newly assigned to this consumer.
    Assigned(BTreeSet<TopicPartition>),
    /// Partitions revoked from this consumer.
    Revoked(BTreeSet<TopicPartition>),
}

type RebalanceCallback = Arc<dyn Fn(&BTreeSet<TopicPartition>) + Send + Sync>;

/// A pair of callbacks invoked on partition assignment and revocation.
///
/// Callbacks run synchronously on the run loop's thread, in registration
/// order, with the sorted set of affected partitions. They must not block.
#[derive(Clone)]
pub struct RebalanceListener {
    on_assigned: RebalanceCallback,
    on_revoked: RebalanceCallback,
}

impl RebalanceListener {
    /// Creates a listener from two callbacks.
    pub fn new(
        on_assigned: impl Fn(&BTreeSet<TopicPartition>) + Send + Sync + 'static,
        on_revoked: impl Fn(&BTreeSet<TopicPartition>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_assigned: Arc::new(on_assigned),
            on_revoked: Arc::new(on_revoked),
        }
    }

    /// Creates a listener that forwards events into an unbounded channel.
    ///
    /// The send never blocks, which keeps the rebalance callback safe to run
    /// inside a poll.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RebalanceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let assigned_tx = tx.clone();
        let listener = Self::new(
            move |tps| {
                let _ = assigned_tx.send(RebalanceEvent::Assigned(tps.clone()));
            },
            move |tps| {
                let _ = tx.send(RebalanceEvent::Revoked(tps.clone()));
            },
        );
        (listener, rx)
    }

    pub(crate) fn notify_assigned(&self, partitions: &BTreeSet<TopicPartition>) {
        (self.on_assigned)(partitions);
    }

    pub(crate) fn notify_revoked(&self, partitions: &BTreeSet<TopicPartition>) {
        (self.on_revoked)(partitions);
    }
}

impl fmt::Debug for RebalanceListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebalanceListener").finish_non_exhaustive()
    }
}

/// A request delivered to the run loop dispatcher.
pub(crate) enum Request {
    Subscribe {
        topics: Vec<String>,
        reply: ReplySlot<()>,
    },
    SubscribePattern {
        pattern: String,
        reply: ReplySlot<()>,
    },
    Assign {
        partitions: BTreeSet<TopicPartition>,
        reply: ReplySlot<()>,
    },
    Unsubscribe {
        reply: ReplySlot<()>,
    },
    Assignment {
        listener: Option<RebalanceListener>,
        reply: ReplySlot<BTreeSet<TopicPartition>>,
    },
    Fetch {
        partition: TopicPartition,
        stream: StreamId,
        partition_stream: PartitionStreamId,
        token: FetchToken,
    },
    Commit(CommitRequest),
    Poll,
}

impl Request {
    /// Short name for trace output.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Request::Subscribe { .. } => "subscribe",
            Request::SubscribePattern { .. } => "subscribe_pattern",
            Request::Assign { .. } => "assign",
            Request::Unsubscribe { .. } => "unsubscribe",
            Request::Assignment { .. } => "assignment",
            Request::Fetch { .. } => "fetch",
            Request::Commit(_) => "commit",
            Request::Poll => "poll",
        }
    }
}

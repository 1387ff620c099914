//! Consumed records and their commit handles.
//!
//! [`Record`] is the raw unit delivered by the client: key/value bytes plus
//! position metadata. [`CommittableRecord`] pairs a record with a
//! [`Committer`] so user code can acknowledge processing directly from the
//! record it just handled.

use crate::error::Result;
use crate::runloop::commit::Committer;
use crate::types::TopicPartition;

/// A single record consumed from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The partition this record came from.
    pub partition: TopicPartition,
    /// The record's offset within the partition.
    pub offset: i64,
    /// Raw key bytes, if the record has a key.
    pub key: Option<Vec<u8>>,
    /// Raw value bytes, if the record has a payload.
    pub value: Option<Vec<u8>>,
    /// Broker or producer timestamp in milliseconds, when available.
    pub timestamp: Option<i64>,
}

impl Record {
    /// Creates a record with the given position and payload.
    #[must_use]
    pub fn new(partition: TopicPartition, offset: i64, value: Option<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value,
            timestamp: None,
        }
    }
}

/// A consumed record carrying its own commit handle.
///
/// Committing acknowledges everything up to and including this record's
/// offset (the committed offset is `offset + 1`, the next offset to read).
#[derive(Debug, Clone)]
pub struct CommittableRecord {
    record: Record,
    committer: Committer,
}

impl CommittableRecord {
    /// Pairs a record with the committer that will acknowledge it.
    #[must_use]
    pub fn new(record: Record, committer: Committer) -> Self {
        Self { record, committer }
    }

    /// The underlying record.
    #[must_use]
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// The partition this record came from.
    #[must_use]
    pub fn partition(&self) -> &TopicPartition {
        &self.record.partition
    }

    /// The record's offset within its partition.
    #[must_use]
    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    /// Raw key bytes, if present.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.record.key.as_deref()
    }

    /// Raw value bytes, if present.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.record.value.as_deref()
    }

    /// The consumer group this record's commits are attributed to.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.committer.group_id()
    }

    /// Commits this record's offset (as `offset + 1`).
    ///
    /// Waits up to the configured commit timeout and applies the configured
    /// commit-recovery policy on failure.
    ///
    /// # Errors
    ///
    /// Returns [`crate::ConsumerError::CommitTimeout`] if the commit does not
    /// complete in time, [`crate::ConsumerError::CommitFailed`] if the client
    /// reports a failure that recovery does not absorb, or
    /// [`crate::ConsumerError::Shutdown`] if the run loop is gone.
    pub async fn commit(&self) -> Result<()> {
        self.committer.commit_record(&self.record).await
    }

    /// Consumes the committable wrapper, returning the plain record.
    #[must_use]
    pub fn into_record(self) -> Record {
        self.record
    }
}

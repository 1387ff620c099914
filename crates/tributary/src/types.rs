//! Core identifiers used throughout the consumer.
//!
//! [`TopicPartition`] keys every per-partition structure and is totally
//! ordered so that partition sets and record maps iterate deterministically.
//! [`StreamId`] and [`PartitionStreamId`] identify a logical consumer stream
//! and a particular run of that stream over one partition.

use std::fmt;

/// A topic name plus partition index: one shard of a partitioned log.
///
/// Ordering is by topic name first, then partition index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    /// The topic name.
    pub topic: String,
    /// The partition index within the topic.
    pub partition: i32,
}

impl TopicPartition {
    /// Creates a new topic-partition.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Identifies a logical consumer stream (one user subscription instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Identifies one run of a stream over a partition.
///
/// Callers issue increasing values per stream across successive assignments
/// of the same partition; the run loop uses them to discard fetches that
/// predate a re-assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PartitionStreamId(pub u64);

impl fmt::Display for PartitionStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// An offset to commit for one partition, with optional broker-side metadata.
///
/// The offset is the *next* offset to consume, per Kafka convention
/// (last processed offset plus one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    /// Next offset to consume.
    pub offset: i64,
    /// Optional metadata stored alongside the committed offset.
    pub metadata: Option<String>,
}

impl OffsetAndMetadata {
    /// Creates an offset entry without metadata.
    #[must_use]
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }

    /// Creates an offset entry with metadata.
    #[must_use]
    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: Some(metadata.into()),
        }
    }
}

/// Why a fetch completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// Records were fetched for the requested partition.
    FetchedRecords,
    /// The partition was revoked (or the fetch was stale); the stream should
    /// end its current run. The chunk may still carry buffered records.
    PartitionRevoked,
}

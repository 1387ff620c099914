//! Offset commit requests and the user-facing commit wrapper.
//!
//! A [`CommitRequest`] is the raw form handled by the run loop: offsets
//! plus a one-shot result slot. [`Committer`] is the wrapper handed to user
//! code (and embedded in every [`crate::CommittableRecord`]): it submits a
//! request, bounds the wait with the configured commit timeout, and applies
//! the commit-recovery policy on failure.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::config::{CommitRecovery, ConsumerConfig, RecordMetadataFn};
use crate::error::{ConsumerError, Result};
use crate::record::Record;
use crate::runloop::request::Request;
use crate::types::{OffsetAndMetadata, TopicPartition};

/// An offset commit awaiting execution: the offsets to commit and the slot
/// that receives the outcome.
pub(crate) struct CommitRequest {
    /// Offsets to commit, keyed by partition.
    pub offsets: BTreeMap<TopicPartition, OffsetAndMetadata>,
    /// Completed with the commit outcome.
    pub reply: oneshot::Sender<Result<()>>,
}

/// Submits offset commits to the run loop and waits for their results.
///
/// Cloning is cheap; every committable record carries a clone. A commit
/// that times out is *not* cancelled: the underlying commit may still
/// complete, and its late result is discarded.
#[derive(Clone)]
pub struct Committer {
    tx: mpsc::UnboundedSender<Request>,
    commit_timeout: Duration,
    recovery: CommitRecovery,
    group_id: Option<Arc<str>>,
    record_metadata: Option<RecordMetadataFn>,
}

impl Committer {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Request>, config: &ConsumerConfig) -> Self {
        Self {
            tx,
            commit_timeout: config.commit_timeout,
            recovery: config.commit_recovery,
            group_id: config.group_id.as_deref().map(Arc::from),
            record_metadata: config.record_metadata.clone(),
        }
    }

    /// The consumer group commits are attributed to, if one is configured.
    #[must_use]
    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// Submits a raw commit request and returns the receiver for its
    /// outcome, without applying the timeout or recovery policy.
    pub(crate) fn request(
        &self,
        offsets: BTreeMap<TopicPartition, OffsetAndMetadata>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request::Commit(CommitRequest { offsets, reply }))
            .map_err(|_| ConsumerError::Shutdown)?;
        Ok(rx)
    }

    /// Commits the given offsets, waiting up to the configured commit
    /// timeout and applying the recovery policy on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::CommitTimeout`] when the wait expires,
    /// [`ConsumerError::CommitFailed`] when the client reports a failure the
    /// recovery policy does not absorb, or [`ConsumerError::Shutdown`] when
    /// the run loop is gone.
    pub async fn commit(&self, offsets: BTreeMap<TopicPartition, OffsetAndMetadata>) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let rx = self.request(offsets.clone())?;
            match tokio::time::timeout(self.commit_timeout, rx).await {
                Err(_elapsed) => {
                    return Err(ConsumerError::CommitTimeout {
                        timeout: self.commit_timeout,
                    });
                }
                Ok(Err(_recv)) => return Err(ConsumerError::Shutdown),
                Ok(Ok(Ok(()))) => return Ok(()),
                Ok(Ok(Err(err))) => match self.recovery {
                    CommitRecovery::Retry {
                        max_attempts,
                        backoff,
                    } if attempt < max_attempts => {
                        warn!(error = %err, attempt, "commit failed, retrying");
                        tokio::time::sleep(backoff).await;
                    }
                    _ => return Err(err),
                },
            }
        }
    }

    /// Commits a single record's offset as `offset + 1`, attaching metadata
    /// from the configured hook when one is set.
    ///
    /// # Errors
    ///
    /// Same as [`Committer::commit`].
    pub async fn commit_record(&self, record: &Record) -> Result<()> {
        let metadata = self
            .record_metadata
            .as_ref()
            .and_then(|hook| hook(record));
        let mut offsets = BTreeMap::new();
        offsets.insert(
            record.partition.clone(),
            OffsetAndMetadata {
                offset: record.offset + 1,
                metadata,
            },
        );
        self.commit(offsets).await
    }
}

impl fmt::Debug for Committer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Committer")
            .field("commit_timeout", &self.commit_timeout)
            .field("recovery", &self.recovery)
            .field("group_id", &self.group_id)
            .finish_non_exhaustive()
    }
}

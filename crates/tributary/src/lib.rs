//! # Tributary
//!
//! Backpressure-driven Kafka consumer streams for Rust.
//!
//! Tributary mediates between many concurrent per-partition stream consumers
//! and a single underlying Kafka consumer client. All client access is
//! serialized through one single-threaded **run loop** that translates
//! per-partition demand into explicit `pause`/`resume` calls, so the client
//! only fetches what downstream consumers have asked for.
//!
//! ## Architecture
//!
//! ```text
//! Streams / user tasks          Run loop (one task)            Native client
//! ┌──────────────┐  request   ┌─────────────────────┐  gate   ┌────────────┐
//! │ fetch(tp, …) │──────────► │ dispatcher          │───────► │ pause      │
//! │ commit(…)    │──────────► │   fetch / commit /  │         │ resume     │
//! │ subscribe(…) │──────────► │   poll handlers     │ ◄─────  │ poll       │
//! └──────────────┘  one-shot  └─────────────────────┘ rebal.  └────────────┘
//!        ▲          result         │ callbacks run inside poll
//!        └─────────────────────────┘
//! ```
//!
//! Key guarantees:
//!
//! - at most one outstanding fetch per `(partition, stream)`,
//! - per-partition record order is preserved across buffering and rebalances,
//! - offset commits submitted during a rebalance are replayed, in submission
//!   order, once the new assignment is in place,
//! - a revoked partition completes its pending fetches exactly once, handing
//!   over any buffered records as a final chunk.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tributary::{ConsumerConfig, RunLoop, RebalanceListener, StreamId, PartitionStreamId};
//!
//! let mut config = ConsumerConfig::default();
//! config.bootstrap_servers = "localhost:9092".into();
//! config.group_id = Some("pipeline".into());
//!
//! let handle = RunLoop::spawn_kafka(config)?;
//! handle.subscribe(vec!["events".into()]).await?;
//!
//! let (listener, mut rebalances) = RebalanceListener::channel();
//! let assignment = handle.assignment_with_listener(listener).await?;
//!
//! let response = handle
//!     .fetch(tp, StreamId(1), PartitionStreamId(1))
//!     .await?;
//! for record in response.records {
//!     record.commit().await?;
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Common test patterns that are acceptable
#![cfg_attr(
    test,
    allow(
        clippy::field_reassign_with_default,
        clippy::manual_let_else,
        clippy::needless_return,
        clippy::cast_possible_truncation,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        unused_mut
    )
)]

/// Consumer error types.
pub mod error;

/// Core identifiers: topic-partitions, stream ids, offsets.
pub mod types;

/// Consumed records and their commit handles.
pub mod record;

/// Consumer configuration.
pub mod config;

/// Run loop metrics counters.
pub mod metrics;

/// The narrow client interface and its exclusive-access gate.
pub mod client;

/// The consumer run loop: request queue, state, handlers.
pub mod runloop;

/// Testing utilities (mock client, record helpers).
pub mod testing;

pub use client::{ClientGate, CommitCallback, ConsumerClient};
pub use config::{CommitRecovery, ConsumerConfig, OffsetReset, RecordMetadataFn};
pub use error::{ConsumerError, Result};
pub use metrics::RunLoopMetrics;
pub use record::{CommittableRecord, Record};
pub use runloop::commit::Committer;
pub use runloop::request::{FetchResponse, RebalanceEvent, RebalanceListener};
pub use runloop::{RebalanceReactor, RunLoop, RunLoopHandle};
pub use types::{
    CompletionReason, OffsetAndMetadata, PartitionStreamId, StreamId, TopicPartition,
};

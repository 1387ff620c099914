//! Consumer error types.
//!
//! [`ConsumerError`] is the single error hierarchy surfaced through request
//! result slots. Client-level failures carry the underlying
//! [`rdkafka::error::KafkaError`] unchanged.

use std::time::Duration;

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Convenience alias for results carrying a [`ConsumerError`].
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors that can occur while driving the consumer run loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// An assignment was requested before any subscribe or assign succeeded.
    #[error("not subscribed")]
    NotSubscribed,

    /// The underlying client reported an error.
    #[error("client error: {0}")]
    Client(#[from] KafkaError),

    /// An offset commit did not complete within the configured timeout.
    ///
    /// The underlying commit is not cancelled and may still succeed later.
    #[error("commit timed out after {timeout:?}")]
    CommitTimeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The asynchronous commit callback reported a failure.
    #[error("commit failed: {0}")]
    CommitFailed(#[source] KafkaError),

    /// Invalid consumer configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The run loop has shut down and can no longer serve requests.
    #[error("consumer run loop has shut down")]
    Shutdown,
}

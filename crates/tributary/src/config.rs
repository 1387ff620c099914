//! Consumer configuration.
//!
//! [`ConsumerConfig`] covers broker connection, the run loop cadence
//! (poll interval and poll timeout), commit behavior (timeout and recovery
//! policy), and pass-through `rdkafka` properties.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rdkafka::config::ClientConfig;

use crate::error::{ConsumerError, Result};
use crate::record::Record;

/// Auto-offset reset policy for partitions without a committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Start from the earliest available offset.
    #[default]
    Earliest,
    /// Start from the latest offset (only new messages).
    Latest,
    /// Fail if no committed offset exists.
    None,
}

impl OffsetReset {
    /// Returns the rdkafka config value string.
    #[must_use]
    pub fn as_rdkafka_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::None => "error",
        }
    }
}

impl std::str::FromStr for OffsetReset {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "earliest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "end" => Ok(OffsetReset::Latest),
            "none" | "error" => Ok(OffsetReset::None),
            other => Err(ConsumerError::Configuration(format!(
                "invalid auto.offset.reset: '{other}' (expected earliest/latest/none)"
            ))),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_rdkafka_str())
    }
}

/// Policy applied when an asynchronous commit reports a failure.
///
/// Recovery resubmits the same offsets; commit timeouts are surfaced
/// directly because the original commit may still land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitRecovery {
    /// Surface the failure to the caller immediately.
    #[default]
    Fail,
    /// Resubmit the same commit up to `max_attempts` total attempts,
    /// sleeping `backoff` between attempts.
    Retry {
        /// Total attempts, including the initial one. Must be at least 1.
        max_attempts: u32,
        /// Delay between attempts.
        backoff: Duration,
    },
}

/// Computes optional metadata to attach to a record's offset-commit entry.
pub type RecordMetadataFn = Arc<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Configuration for a consumer run loop.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// Comma-separated list of broker addresses.
    pub bootstrap_servers: String,
    /// Consumer group identifier. Required for subscribe-based consumption;
    /// optional for manual assignment.
    pub group_id: Option<String>,
    /// Where to start reading when no committed offset exists.
    pub auto_offset_reset: OffsetReset,

    /// Cadence at which the periodic poll source enqueues poll requests.
    /// A lower bound on poll frequency, not an upper bound on latency.
    pub poll_interval: Duration,
    /// Timeout passed to each client poll call.
    pub poll_timeout: Duration,
    /// Bound on how long a caller waits for a commit result.
    pub commit_timeout: Duration,
    /// Policy applied when an asynchronous commit fails.
    pub commit_recovery: CommitRecovery,
    /// Optional hook attaching metadata to offset-commit entries.
    pub record_metadata: Option<RecordMetadataFn>,

    /// Additional rdkafka properties passed directly to librdkafka.
    pub kafka_properties: HashMap<String, String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: String::new(),
            group_id: None,
            auto_offset_reset: OffsetReset::default(),
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            commit_timeout: Duration::from_secs(5),
            commit_recovery: CommitRecovery::default(),
            record_metadata: None,
            kafka_properties: HashMap::new(),
        }
    }
}

impl ConsumerConfig {
    /// Validates the run-loop portion of the configuration.
    ///
    /// Broker connectivity fields are checked separately when a Kafka client
    /// is constructed, so mock-backed run loops can use an empty
    /// `bootstrap_servers`.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Configuration`] if a duration is zero or the
    /// retry policy allows zero attempts.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(ConsumerError::Configuration(
                "poll.interval must be > 0".into(),
            ));
        }
        if self.commit_timeout.is_zero() {
            return Err(ConsumerError::Configuration(
                "commit.timeout must be > 0".into(),
            ));
        }
        if let CommitRecovery::Retry { max_attempts, .. } = self.commit_recovery {
            if max_attempts == 0 {
                return Err(ConsumerError::Configuration(
                    "commit.recovery max_attempts must be >= 1".into(),
                ));
            }
        }
        Ok(())
    }

    /// Validates the fields required to construct a Kafka-backed client.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::Configuration`] if `bootstrap_servers` is
    /// empty.
    pub fn validate_for_kafka(&self) -> Result<()> {
        self.validate()?;
        if self.bootstrap_servers.is_empty() {
            return Err(ConsumerError::Configuration(
                "bootstrap.servers cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Builds an rdkafka [`ClientConfig`] from this configuration.
    ///
    /// Auto-commit is always disabled: offsets flow only through the commit
    /// coordinator.
    #[must_use]
    pub fn to_rdkafka_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();

        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", self.auto_offset_reset.as_rdkafka_str());
        if let Some(ref group_id) = self.group_id {
            config.set("group.id", group_id);
        }

        // Pass-through properties may override the defaults above, except
        // auto-commit: offsets must only ever flow through the commit
        // coordinator.
        for (key, value) in &self.kafka_properties {
            if key != "enable.auto.commit" {
                config.set(key, value);
            }
        }

        config
    }
}

impl fmt::Debug for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerConfig")
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("group_id", &self.group_id)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("poll_interval", &self.poll_interval)
            .field("poll_timeout", &self.poll_timeout)
            .field("commit_timeout", &self.commit_timeout)
            .field("commit_recovery", &self.commit_recovery)
            .field("record_metadata", &self.record_metadata.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TopicPartition;

    #[test]
    fn test_defaults() {
        let cfg = ConsumerConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_millis(50));
        assert_eq!(cfg.poll_timeout, Duration::from_millis(50));
        assert_eq!(cfg.commit_timeout, Duration::from_secs(5));
        assert_eq!(cfg.commit_recovery, CommitRecovery::Fail);
        assert_eq!(cfg.auto_offset_reset, OffsetReset::Earliest);
        assert!(cfg.group_id.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_poll_interval() {
        let mut cfg = ConsumerConfig::default();
        cfg.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_zero_commit_timeout() {
        let mut cfg = ConsumerConfig::default();
        cfg.commit_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_zero_retry_attempts() {
        let mut cfg = ConsumerConfig::default();
        cfg.commit_recovery = CommitRecovery::Retry {
            max_attempts: 0,
            backoff: Duration::from_millis(10),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_for_kafka_requires_brokers() {
        let cfg = ConsumerConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.validate_for_kafka().is_err());

        let mut cfg = ConsumerConfig::default();
        cfg.bootstrap_servers = "localhost:9092".into();
        assert!(cfg.validate_for_kafka().is_ok());
    }

    #[test]
    fn test_rdkafka_config() {
        let mut cfg = ConsumerConfig::default();
        cfg.bootstrap_servers = "localhost:9092".into();
        cfg.group_id = Some("pipeline".into());
        cfg.auto_offset_reset = OffsetReset::Latest;
        cfg.kafka_properties
            .insert("session.timeout.ms".into(), "30000".into());

        let rdkafka = cfg.to_rdkafka_config();
        assert_eq!(rdkafka.get("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(rdkafka.get("group.id"), Some("pipeline"));
        assert_eq!(rdkafka.get("enable.auto.commit"), Some("false"));
        assert_eq!(rdkafka.get("auto.offset.reset"), Some("latest"));
        assert_eq!(rdkafka.get("session.timeout.ms"), Some("30000"));
    }

    #[test]
    fn test_rdkafka_config_passthrough_cannot_reenable_auto_commit() {
        let mut cfg = ConsumerConfig::default();
        cfg.bootstrap_servers = "localhost:9092".into();
        cfg.kafka_properties
            .insert("enable.auto.commit".into(), "true".into());
        cfg.kafka_properties
            .insert("session.timeout.ms".into(), "30000".into());

        let rdkafka = cfg.to_rdkafka_config();
        assert_eq!(rdkafka.get("enable.auto.commit"), Some("false"));
        // Other passthrough keys still apply.
        assert_eq!(rdkafka.get("session.timeout.ms"), Some("30000"));
    }

    #[test]
    fn test_rdkafka_config_without_group() {
        let mut cfg = ConsumerConfig::default();
        cfg.bootstrap_servers = "localhost:9092".into();
        let rdkafka = cfg.to_rdkafka_config();
        assert_eq!(rdkafka.get("group.id"), None);
    }

    #[test]
    fn test_offset_reset_parsing() {
        assert_eq!(
            "earliest".parse::<OffsetReset>().unwrap(),
            OffsetReset::Earliest
        );
        assert_eq!("latest".parse::<OffsetReset>().unwrap(), OffsetReset::Latest);
        assert_eq!("none".parse::<OffsetReset>().unwrap(), OffsetReset::None);
        assert!("invalid".parse::<OffsetReset>().is_err());
    }

    #[test]
    fn test_record_metadata_hook() {
        let mut cfg = ConsumerConfig::default();
        cfg.record_metadata = Some(Arc::new(|record: &Record| {
            Some(format!("offset-{}", record.offset))
        }));

        let record = Record::new(TopicPartition::new("t", 0), 7, None);
        let hook = cfg.record_metadata.as_ref().unwrap();
        assert_eq!(hook(&record), Some("offset-7".to_string()));

        // Debug must not try to print the closure.
        let debug = format!("{cfg:?}");
        assert!(debug.contains("record_metadata: true"));
    }
}

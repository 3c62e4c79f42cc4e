//! Queue configuration
//!
//! `StreamQueueOptions` and `ReliableQueueOptions` are builder-style and can
//! also be loaded from `QUEUE_*` environment variables.

use crate::retry::SendRetry;
use core_config::{env_or_default, env_parse_or, ConfigError, FromEnv};
use std::time::Duration;

/// Default approximate stream cap
pub const DEFAULT_MAX_LENGTH: u64 = 1_000_000;
/// Default delivery budget before an entry is discarded
pub const DEFAULT_MAX_RETRY: u64 = 10;
/// Default pending-entry retry interval
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(60);
/// Default blocking-read timeout
pub const DEFAULT_BLOCK_TIME: Duration = Duration::from_secs(15);
/// Default cursor of an independent consumer
pub const DEFAULT_START_ID: &str = "0-0";
/// Status records expire after a week without refresh
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

/// Configuration for a stream queue
#[derive(Debug, Clone, PartialEq)]
pub struct StreamQueueOptions {
    /// Consumer group; empty means independent consumption
    pub group: String,

    /// Consumer name (`hostname@pid` when not provided)
    pub consumer: String,

    /// Approximate cap; 0 disables trimming
    pub max_length: u64,

    /// Deliveries allowed before an entry is discarded
    pub max_retry: u64,

    /// Idle time after which pending entries are reclaimed, also the
    /// minimum spacing between reclaim sweeps
    pub retry_interval: Duration,

    /// Timeout used by the consume loop's blocking reads
    pub block_time: Duration,

    /// Send retry budget, applied only when the store reports "not yet visible"
    pub send_retry: SendRetry,

    /// Cursor for independent consumption
    pub start_id: String,

    /// Move the group cursor to the tail before the first group read
    pub from_last_offset: bool,
}

impl StreamQueueOptions {
    pub fn new() -> Self {
        Self {
            group: String::new(),
            consumer: default_consumer_name(),
            max_length: DEFAULT_MAX_LENGTH,
            max_retry: DEFAULT_MAX_RETRY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            block_time: DEFAULT_BLOCK_TIME,
            send_retry: SendRetry::default(),
            start_id: DEFAULT_START_ID.to_string(),
            from_last_offset: false,
        }
    }

    /// Set the consumer group
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Set the consumer name
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    /// Set the approximate cap (0 disables trimming)
    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set the delivery budget
    pub fn with_max_retry(mut self, max_retry: u64) -> Self {
        self.max_retry = max_retry;
        self
    }

    /// Set the reclaim interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the blocking-read timeout
    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }

    /// Set the send retry budget
    pub fn with_send_retry(mut self, times: u32, interval: Duration) -> Self {
        self.send_retry = SendRetry::new(times, interval);
        self
    }

    /// Set the independent cursor
    pub fn with_start_id(mut self, start_id: impl Into<String>) -> Self {
        self.start_id = start_id.into();
        self
    }

    /// Start group consumption at the tail
    pub fn with_from_last_offset(mut self, enable: bool) -> Self {
        self.from_last_offset = enable;
        self
    }

    pub fn is_group_mode(&self) -> bool {
        !self.group.is_empty()
    }
}

impl Default for StreamQueueOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for StreamQueueOptions {
    /// Reads `QUEUE_GROUP`, `QUEUE_CONSUMER`, `QUEUE_MAX_LENGTH`,
    /// `QUEUE_MAX_RETRY`, `QUEUE_RETRY_INTERVAL_SECS`, `QUEUE_BLOCK_TIME_SECS`,
    /// `QUEUE_SEND_RETRY_TIMES`, `QUEUE_SEND_RETRY_INTERVAL_MS`,
    /// `QUEUE_START_ID` and `QUEUE_FROM_LAST_OFFSET`. All are optional.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();
        Ok(Self {
            group: env_or_default("QUEUE_GROUP", ""),
            consumer: env_or_default("QUEUE_CONSUMER", &defaults.consumer),
            max_length: env_parse_or("QUEUE_MAX_LENGTH", defaults.max_length)?,
            max_retry: env_parse_or("QUEUE_MAX_RETRY", defaults.max_retry)?,
            retry_interval: Duration::from_secs(env_parse_or(
                "QUEUE_RETRY_INTERVAL_SECS",
                defaults.retry_interval.as_secs(),
            )?),
            block_time: Duration::from_secs(env_parse_or(
                "QUEUE_BLOCK_TIME_SECS",
                defaults.block_time.as_secs(),
            )?),
            send_retry: send_retry_from_env()?,
            start_id: env_or_default("QUEUE_START_ID", DEFAULT_START_ID),
            from_last_offset: env_parse_or("QUEUE_FROM_LAST_OFFSET", false)?,
        })
    }
}

/// Configuration for a reliable list queue
#[derive(Debug, Clone, PartialEq)]
pub struct ReliableQueueOptions {
    /// Minimum spacing between rollback sweeps, also the `AllStatus` lease
    pub retry_interval: Duration,

    /// Send retry budget for pushes that report nothing written
    pub send_retry: SendRetry,

    /// Largest `take` served by single pops; bigger batches are pipelined
    pub min_pipeline: usize,

    /// Time-to-live of the heartbeat record
    pub status_ttl: Duration,

    /// Timeout used by the consume loop's blocking pops
    pub block_time: Duration,
}

impl ReliableQueueOptions {
    pub fn new() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            send_retry: SendRetry::default(),
            min_pipeline: 3,
            status_ttl: DEFAULT_STATUS_TTL,
            block_time: DEFAULT_BLOCK_TIME,
        }
    }

    /// Set the rollback interval
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Set the send retry budget
    pub fn with_send_retry(mut self, times: u32, interval: Duration) -> Self {
        self.send_retry = SendRetry::new(times, interval);
        self
    }

    /// Set the pipeline threshold
    pub fn with_min_pipeline(mut self, min_pipeline: usize) -> Self {
        self.min_pipeline = min_pipeline.max(1);
        self
    }

    /// Set the heartbeat TTL
    pub fn with_status_ttl(mut self, ttl: Duration) -> Self {
        self.status_ttl = ttl;
        self
    }

    /// Set the blocking-pop timeout
    pub fn with_block_time(mut self, block_time: Duration) -> Self {
        self.block_time = block_time;
        self
    }
}

impl Default for ReliableQueueOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl FromEnv for ReliableQueueOptions {
    /// Reads `QUEUE_RETRY_INTERVAL_SECS`, `QUEUE_SEND_RETRY_TIMES`,
    /// `QUEUE_SEND_RETRY_INTERVAL_MS`, `QUEUE_MIN_PIPELINE` and
    /// `QUEUE_BLOCK_TIME_SECS`.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new();
        Ok(Self {
            retry_interval: Duration::from_secs(env_parse_or(
                "QUEUE_RETRY_INTERVAL_SECS",
                defaults.retry_interval.as_secs(),
            )?),
            send_retry: send_retry_from_env()?,
            min_pipeline: env_parse_or("QUEUE_MIN_PIPELINE", defaults.min_pipeline)?.max(1),
            status_ttl: defaults.status_ttl,
            block_time: Duration::from_secs(env_parse_or(
                "QUEUE_BLOCK_TIME_SECS",
                defaults.block_time.as_secs(),
            )?),
        })
    }
}

fn send_retry_from_env() -> Result<SendRetry, ConfigError> {
    let defaults = SendRetry::default();
    Ok(SendRetry::new(
        env_parse_or("QUEUE_SEND_RETRY_TIMES", defaults.times)?,
        Duration::from_millis(env_parse_or(
            "QUEUE_SEND_RETRY_INTERVAL_MS",
            defaults.interval.as_millis() as u64,
        )?),
    ))
}

/// `hostname@pid`
pub fn default_consumer_name() -> String {
    format!("{}@{}", core_config::hostname(), std::process::id())
}

//! Builds queues that share one store connection.

use crate::clock::{Clock, SystemClock};
use crate::config::{ReliableQueueOptions, StreamQueueOptions};
use crate::error::QueueResult;
use crate::reliable::ReliableQueue;
use crate::store::{LogStore, RedisStore};
use crate::stream::StreamQueue;
use core_config::redis::RedisConfig;
use std::sync::Arc;
use tracing::info;

/// Creates stream and reliable queues over a shared store.
///
/// Topics are prefixed with the configured key prefix (`{prefix}:{topic}`).
#[derive(Clone)]
pub struct QueueFactory {
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    stream_options: StreamQueueOptions,
    reliable_options: ReliableQueueOptions,
}

impl QueueFactory {
    pub fn new(store: Arc<dyn LogStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            key_prefix: String::new(),
            stream_options: StreamQueueOptions::default(),
            reliable_options: ReliableQueueOptions::default(),
        }
    }

    /// Connect to Redis and use `config.key_prefix` for every topic.
    pub async fn connect(config: &RedisConfig) -> QueueResult<Self> {
        let store = RedisStore::connect(&config.uri).await?;
        info!(prefix = %config.key_prefix, "Queue factory connected to Redis");
        Ok(Self::new(Arc::new(store)).with_key_prefix(config.key_prefix.clone()))
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_stream_options(mut self, options: StreamQueueOptions) -> Self {
        self.stream_options = options;
        self
    }

    pub fn with_reliable_options(mut self, options: ReliableQueueOptions) -> Self {
        self.reliable_options = options;
        self
    }

    pub fn store(&self) -> Arc<dyn LogStore> {
        self.store.clone()
    }

    fn key(&self, topic: &str) -> String {
        if self.key_prefix.is_empty() {
            topic.to_string()
        } else {
            format!("{}:{}", self.key_prefix, topic)
        }
    }

    pub fn stream(&self, topic: &str) -> StreamQueue {
        StreamQueue::with_options(self.store.clone(), self.key(topic), self.stream_options.clone())
            .with_clock(self.clock.clone())
    }

    pub fn reliable(&self, topic: &str) -> ReliableQueue {
        ReliableQueue::with_options(self.store.clone(), self.key(topic), self.reliable_options.clone())
            .with_clock(self.clock.clone())
    }
}

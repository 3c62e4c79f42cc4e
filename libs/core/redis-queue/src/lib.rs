//! Redis Queue
//!
//! Reliable message queues on top of a Redis-compatible store.
//!
//! ## Queue kinds
//!
//! - **`StreamQueue`**: append-only stream with consumer groups. Entries stay
//!   pending until acknowledged, are reclaimed after `retry_interval` and
//!   discarded after `max_retry` deliveries. Without a group it reads
//!   independently from its own cursor.
//! - **`ReliableQueue`**: list with a private ack list per consumer. Items
//!   left unacknowledged are rolled back to the main list; a heartbeat record
//!   lets one instance recover the ack lists of dead consumers.
//!
//! Both drive a `ConsumeLoop` that polls, hands batches to a handler and
//! acknowledges what the handler accepts, until a shutdown signal arrives.
//!
//! ## Example
//!
//! ```ignore
//! use redis_queue::{QueueFactory, StreamMessage, StreamQueueOptions};
//! use core_config::{redis::RedisConfig, FromEnv};
//!
//! let factory = QueueFactory::connect(&RedisConfig::from_env()?)
//!     .await?
//!     .with_stream_options(StreamQueueOptions::from_env()?.with_group("billing"));
//!
//! let queue = Arc::new(factory.stream("invoices"));
//! queue.add(r#"{"id":42}"#).await;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let handle = queue.consume_block(shutdown_rx, |batch: &[StreamMessage]| {
//!     batch.iter().all(|m| m.payload().is_some())
//! });
//! ```

mod clock;
mod config;
mod consume;
mod error;
mod factory;
mod message;
pub mod metrics;
mod reliable;
mod retry;
mod status;
pub mod store;
mod stream;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ReliableQueueOptions, StreamQueueOptions, default_consumer_name, DEFAULT_BLOCK_TIME,
    DEFAULT_MAX_LENGTH, DEFAULT_MAX_RETRY, DEFAULT_RETRY_INTERVAL, DEFAULT_START_ID,
};
pub use consume::{Consumable, ConsumeLoop, MessageHandler, IDLE_SLEEP};
pub use error::{ErrorCategory, QueueError, QueueResult};
pub use factory::QueueFactory;
pub use message::{MessageId, StreamMessage};
pub use metrics::{init_metrics, QueueMetrics};
pub use reliable::ReliableQueue;
pub use retry::{ErrorBackoff, RetryGate, SendRetry};
pub use status::QueueStatus;
pub use store::{LogStore, MemoryStore, RedisStore};
pub use stream::{RetryReport, StreamQueue};

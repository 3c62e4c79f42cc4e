//! Reliable list queue
//!
//! Producers push to the head of `{key}`. A consumer atomically moves items
//! from the tail into its private ack list `{key}:Ack:{status}` and removes
//! them once processed. Whatever is left in an ack list is rolled back to the
//! main list: a consumer's own list on every sweep, and the lists of
//! consumers whose heartbeat `{key}:Status:{status}` went stale by whichever
//! instance wins the short `{key}:AllStatus` lease.
//!
//! Delivery is at-least-once; a rollback can hand an item out twice.

use crate::clock::{Clock, SystemClock};
use crate::config::ReliableQueueOptions;
use crate::consume::{Consumable, ConsumeLoop, MessageHandler};
use crate::error::QueueResult;
use crate::metrics::{QueueKind, QueueMetrics};
use crate::retry::RetryGate;
use crate::status::QueueStatus;
use crate::store::LogStore;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Extra time a heartbeat may lag behind `retry_interval` before its owner
/// counts as dead
const STALE_GRACE: Duration = Duration::from_secs(10);

/// List-based queue with per-consumer acknowledgment lists.
pub struct ReliableQueue {
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    key: String,
    options: ReliableQueueOptions,
    status: Mutex<QueueStatus>,
    retry_gate: RetryGate,
    metrics: QueueMetrics,
}

impl std::fmt::Debug for ReliableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableQueue")
            .field("key", &self.key)
            .field("ack_key", &self.ack_key())
            .finish()
    }
}

impl ReliableQueue {
    pub fn new(store: Arc<dyn LogStore>, key: impl Into<String>) -> Self {
        Self::with_options(store, key, ReliableQueueOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn LogStore>,
        key: impl Into<String>,
        options: ReliableQueueOptions,
    ) -> Self {
        let key = key.into();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            store,
            status: Mutex::new(QueueStatus::create(clock.now_ms())),
            clock,
            retry_gate: RetryGate::new(options.retry_interval),
            metrics: QueueMetrics::new(key.clone(), QueueKind::Reliable),
            options,
            key,
        }
    }

    /// Replace the time source; the heartbeat restarts at the new clock's now.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_ms();
        {
            let mut status = self.lock_status();
            status.create_time = now;
            status.last_active = now;
        }
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn options(&self) -> &ReliableQueueOptions {
        &self.options
    }

    fn lock_status(&self) -> MutexGuard<'_, QueueStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn instance_key(&self) -> String {
        self.lock_status().key.clone()
    }

    /// This instance's in-flight list
    pub fn ack_key(&self) -> String {
        format!("{}:Ack:{}", self.key, self.instance_key())
    }

    /// This instance's heartbeat key
    pub fn status_key(&self) -> String {
        format!("{}:Status:{}", self.key, self.instance_key())
    }

    fn all_status_key(&self) -> String {
        format!("{}:AllStatus", self.key)
    }

    /// Snapshot of the heartbeat record
    pub fn status(&self) -> QueueStatus {
        self.lock_status().clone()
    }

    // --- producing ---

    /// Push values to the head; returns the list length reported by the store.
    ///
    /// A zero length or an error is retried within the send budget; after
    /// that the failure is logged and 0 returned.
    pub async fn add<I, V>(&self, values: I) -> u64
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return 0;
        }

        let store = &self.store;
        let key = self.key.as_str();
        let batch = &values;
        let result = self
            .options
            .send_retry
            .run(
                move || store.lpush(key, batch),
                |result| !matches!(result, Ok(n) if *n > 0),
            )
            .await;

        match result {
            Ok(len) if len > 0 => {
                self.metrics.added(values.len() as u64);
                self.metrics.depth(len);
                len
            }
            Ok(_) => {
                self.metrics.add_failed();
                warn!(queue = %self.key, count = values.len(), "Push not confirmed after retries");
                0
            }
            Err(e) => {
                self.metrics.add_failed();
                warn!(queue = %self.key, count = values.len(), error = %e, "Push failed");
                0
            }
        }
    }

    pub async fn add_json<T: Serialize>(&self, value: &T) -> u64 {
        match serde_json::to_string(value) {
            Ok(json) => self.add([json]).await,
            Err(e) => {
                warn!(queue = %self.key, error = %e, "Failed to serialize item");
                0
            }
        }
    }

    // --- consuming ---

    /// Move one item into the ack list.
    ///
    /// `Some(timeout)` blocks (zero waits forever); `None` makes a single
    /// non-blocking attempt. Runs the rollback sweep first.
    pub async fn take_one(&self, timeout: Option<Duration>) -> Option<String> {
        self.retry_ack().await;
        self.pop(timeout)
            .await
            .map_err(|e| warn!(queue = %self.key, error = %e, "Take failed"))
            .ok()
            .flatten()
    }

    async fn pop(&self, timeout: Option<Duration>) -> QueueResult<Option<String>> {
        let item = self
            .store
            .rpoplpush(&self.key, &self.ack_key(), timeout)
            .await?;
        if item.is_some() {
            self.lock_status().consumes += 1;
            self.metrics.consumed(1);
        }
        Ok(item)
    }

    /// Move up to `count` items into the ack list without blocking.
    ///
    /// Batches above `min_pipeline` go out in one round trip.
    pub async fn take(&self, count: usize) -> Vec<String> {
        if count == 0 {
            return vec![];
        }
        self.retry_ack().await;

        let items = if count > self.options.min_pipeline {
            self.store
                .rpoplpush_many(&self.key, &self.ack_key(), count)
                .await
                .map_err(|e| warn!(queue = %self.key, error = %e, "Pipelined take failed"))
                .unwrap_or_default()
        } else {
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                match self.store.rpoplpush(&self.key, &self.ack_key(), None).await {
                    Ok(Some(item)) => items.push(item),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(queue = %self.key, error = %e, "Take failed");
                        break;
                    }
                }
            }
            items
        };

        if !items.is_empty() {
            self.lock_status().consumes += items.len() as i64;
            self.metrics.consumed(items.len() as u64);
        }
        items
    }

    /// Remove processed items from the ack list; returns how many were removed.
    pub async fn acknowledge<S: AsRef<str>>(&self, items: &[S]) -> u64 {
        self.ack_items(items)
            .await
            .map_err(|e| warn!(queue = %self.key, error = %e, "Acknowledge failed"))
            .unwrap_or(0)
    }

    async fn ack_items<S: AsRef<str>>(&self, items: &[S]) -> QueueResult<u64> {
        let ack_key = self.ack_key();
        let mut removed = 0;
        for item in items {
            removed += self.store.lrem(&ack_key, 1, item.as_ref()).await?;
        }
        self.lock_status().acks += removed as i64;
        self.metrics.acked(removed);
        Ok(removed)
    }

    // --- rollback ---

    /// Return in-flight items to the main list, at most once per
    /// `retry_interval`.
    ///
    /// Rolls back this instance's own ack list, refreshes the heartbeat and,
    /// if this instance wins the `AllStatus` lease, sweeps dead consumers.
    /// Returns the number of items moved, or `None` when rate-limited.
    pub async fn retry_ack(&self) -> Option<u64> {
        if !self.retry_gate.try_enter(self.clock.as_ref()) {
            return None;
        }

        let own = self.rollback_ack(&self.ack_key(), &self.key).await.len() as u64;
        if own > 0 {
            info!(queue = %self.key, count = own, "Rolled back unacknowledged items");
        }

        self.update_status().await;

        let encoded = self.lock_status().to_json();
        let won = match encoded {
            Ok(json) => self.take_lease(&json).await,
            Err(e) => {
                warn!(queue = %self.key, error = %e, "Failed to encode status");
                false
            }
        };

        let others = if won { self.rollback_all_ack().await } else { 0 };
        Some(own + others)
    }

    /// Only one instance per interval sweeps dead consumers. The lease is
    /// advisory: concurrent sweeps stay safe because every move is atomic.
    async fn take_lease(&self, status_json: &str) -> bool {
        self.store
            .set_nx(&self.all_status_key(), status_json, Some(self.options.retry_interval))
            .await
            .map_err(|e| warn!(queue = %self.key, error = %e, "Failed to take sweep lease"))
            .unwrap_or(false)
    }

    /// Drain `from` into `to` one item at a time; returns the moved items.
    pub async fn rollback_ack(&self, from: &str, to: &str) -> Vec<String> {
        let mut moved = Vec::new();
        loop {
            match self.store.rpoplpush(from, to, None).await {
                Ok(Some(item)) => moved.push(item),
                Ok(None) => break,
                Err(e) => {
                    warn!(queue = %self.key, from = %from, error = %e, "Rollback interrupted");
                    break;
                }
            }
        }
        self.metrics.rolled_back(moved.len() as u64);
        moved
    }

    /// Roll back the ack lists of consumers whose heartbeat is stale, plus
    /// ack lists left without any heartbeat. Returns the number of items
    /// moved.
    pub async fn rollback_all_ack(&self) -> u64 {
        let own = self.instance_key();
        let status_prefix = format!("{}:Status:", self.key);
        let ack_prefix = format!("{}:Ack:", self.key);
        let now = self.clock.now_ms();
        let grace_ms = (self.options.retry_interval + STALE_GRACE).as_millis() as i64;
        let mut total = 0;

        for status_key in self.scan(&format!("{status_prefix}*")).await {
            let Some(instance) = status_key.strip_prefix(&status_prefix) else {
                continue;
            };
            if instance == own {
                continue;
            }

            let stale = match self.store.get(&status_key).await {
                Ok(Some(raw)) => match QueueStatus::from_json(&raw) {
                    Ok(status) => status.is_stale(now, grace_ms),
                    Err(e) => {
                        warn!(key = %status_key, error = %e, "Unreadable status record, skipping");
                        false
                    }
                },
                Ok(None) => true,
                Err(e) => {
                    warn!(key = %status_key, error = %e, "Failed to read status record");
                    false
                }
            };
            if !stale {
                continue;
            }

            let ack_key = format!("{ack_prefix}{instance}");
            let moved = self.rollback_ack(&ack_key, &self.key).await.len() as u64;
            // A drained list no longer exists. The ack key is left alone: a
            // consumer that is only slow may have popped into it since, and
            // the orphan pass below picks that up.
            if let Err(e) = self.store.del(&[status_key.clone()]).await {
                warn!(key = %status_key, error = %e, "Failed to remove stale status record");
            }
            info!(queue = %self.key, consumer = %instance, count = moved, "Recovered items of stale consumer");
            total += moved;
        }

        for ack_key in self.scan(&format!("{ack_prefix}*")).await {
            let Some(instance) = ack_key.strip_prefix(&ack_prefix) else {
                continue;
            };
            if instance == own {
                continue;
            }
            match self.store.exists(&format!("{status_prefix}{instance}")).await {
                Ok(false) => {
                    let moved = self.rollback_ack(&ack_key, &self.key).await.len() as u64;
                    if moved > 0 {
                        info!(queue = %self.key, consumer = %instance, count = moved, "Recovered orphaned ack list");
                    }
                    total += moved;
                }
                Ok(true) => {}
                Err(e) => warn!(key = %ack_key, error = %e, "Failed to check consumer status"),
            }
        }

        total
    }

    async fn scan(&self, pattern: &str) -> Vec<String> {
        self.store
            .scan(pattern)
            .await
            .map_err(|e| warn!(queue = %self.key, pattern = %pattern, error = %e, "Key scan failed"))
            .unwrap_or_default()
    }

    // --- status and inspection ---

    /// Refresh the heartbeat record.
    pub async fn update_status(&self) -> bool {
        let (key, json) = {
            let mut status = self.lock_status();
            status.last_active = self.clock.now_ms();
            (format!("{}:Status:{}", self.key, status.key), status.to_json())
        };
        let json = match json {
            Ok(json) => json,
            Err(e) => {
                warn!(queue = %self.key, error = %e, "Failed to encode status");
                return false;
            }
        };

        match self.store.set(&key, &json, Some(self.options.status_ttl)).await {
            Ok(()) => {
                debug!(queue = %self.key, key = %key, "Heartbeat updated");
                true
            }
            Err(e) => {
                warn!(queue = %self.key, error = %e, "Failed to write heartbeat");
                false
            }
        }
    }

    /// Items waiting in the main list
    pub async fn count(&self) -> u64 {
        match self.store.llen(&self.key).await {
            Ok(len) => {
                self.metrics.depth(len);
                len
            }
            Err(e) => {
                warn!(queue = %self.key, error = %e, "Failed to read queue length");
                0
            }
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.count().await == 0
    }

    /// Items in this instance's ack list
    pub async fn ack_count(&self) -> u64 {
        self.store
            .llen(&self.ack_key())
            .await
            .map_err(|e| warn!(queue = %self.key, error = %e, "Failed to read ack list length"))
            .unwrap_or(0)
    }

    /// Spawn the consume loop: pop with `block_time`, remove accepted items
    /// from the ack list.
    pub fn consume<H>(self: &Arc<Self>, shutdown: watch::Receiver<bool>, handler: H) -> JoinHandle<()>
    where
        H: MessageHandler<String> + 'static,
    {
        ConsumeLoop::new(self.clone(), handler, shutdown).spawn()
    }
}

#[async_trait]
impl Consumable for ReliableQueue {
    type Item = String;

    fn name(&self) -> &str {
        &self.key
    }

    fn block_time(&self) -> Duration {
        self.options.block_time
    }

    async fn prepare(&self) -> QueueResult<()> {
        self.update_status().await;
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> QueueResult<Vec<String>> {
        self.retry_ack().await;
        Ok(self.pop(Some(timeout)).await?.into_iter().collect())
    }

    async fn settle(&self, items: &[String]) -> QueueResult<u64> {
        self.ack_items(items).await
    }
}

//! Stream queue
//!
//! Producer and consumer over an append-only stream. With a consumer group
//! set, entries are delivered to exactly one consumer and stay pending until
//! acknowledged; unacknowledged entries are reclaimed after `retry_interval`
//! and discarded once they exceed `max_retry` deliveries. Without a group the
//! queue reads independently and keeps its own cursor.
//!
//! Queue operations log failures and return empty results; the store layer
//! underneath reports errors as [`QueueResult`].

use crate::clock::{Clock, SystemClock};
use crate::config::StreamQueueOptions;
use crate::consume::{Consumable, ConsumeLoop, MessageHandler};
use crate::error::QueueResult;
use crate::message::StreamMessage;
use crate::metrics::{QueueKind, QueueMetrics};
use crate::retry::RetryGate;
use crate::store::{ConsumerInfo, GroupInfo, LogStore, PendingEntry, PendingSummary, StreamInfo};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Appends between two approximate trims
const TRIM_EVERY: i64 = 1000;
/// Pending entries inspected per page during a reclaim sweep
const PENDING_PAGE: usize = 100;
/// Consumers idle longer than this with nothing pending are removed
const IDLE_CONSUMER_MS: u64 = 3_600_000;
/// Block time of the history read after an empty blocking read
const HISTORY_BLOCK_MS: u64 = 3_000;
/// Batches this small are appended one by one
const SEQUENTIAL_BATCH: usize = 2;

/// Outcome of one reclaim sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// Entries reassigned to this consumer
    pub claimed: u64,
    /// Entries acknowledged and dropped after too many deliveries
    pub discarded: u64,
    /// Idle consumers deleted from the group
    pub consumers_removed: u64,
}

/// Reliable queue over a stream with consumer groups.
pub struct StreamQueue {
    store: Arc<dyn LogStore>,
    clock: Arc<dyn Clock>,
    key: String,
    options: StreamQueueOptions,
    group: RwLock<String>,
    cursor: Mutex<String>,
    /// Local approximation of the stream length, drives periodic trims
    count: AtomicI64,
    cursor_moved: AtomicBool,
    retry_gate: RetryGate,
    metrics: QueueMetrics,
}

impl std::fmt::Debug for StreamQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamQueue")
            .field("key", &self.key)
            .field("group", &self.group())
            .field("consumer", &self.options.consumer)
            .finish()
    }
}

impl StreamQueue {
    /// Queue with default options.
    pub fn new(store: Arc<dyn LogStore>, key: impl Into<String>) -> Self {
        Self::with_options(store, key, StreamQueueOptions::default())
    }

    pub fn with_options(
        store: Arc<dyn LogStore>,
        key: impl Into<String>,
        options: StreamQueueOptions,
    ) -> Self {
        let key = key.into();
        Self {
            store,
            clock: Arc::new(SystemClock),
            group: RwLock::new(options.group.clone()),
            cursor: Mutex::new(options.start_id.clone()),
            count: AtomicI64::new(0),
            cursor_moved: AtomicBool::new(false),
            retry_gate: RetryGate::new(options.retry_interval),
            metrics: QueueMetrics::new(key.clone(), QueueKind::Stream),
            options,
            key,
        }
    }

    /// Replace the time source used for reclaim scheduling.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn consumer(&self) -> &str {
        &self.options.consumer
    }

    pub fn options(&self) -> &StreamQueueOptions {
        &self.options
    }

    /// Current consumer group; empty in independent mode.
    pub fn group(&self) -> String {
        self.group
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current cursor of the independent consumer.
    pub fn start_id(&self) -> String {
        self.cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move the independent cursor.
    pub fn set_start_id(&self, id: impl Into<String>) {
        *self.cursor.lock().unwrap_or_else(PoisonError::into_inner) = id.into();
    }

    fn advance_cursor(&self, messages: &[StreamMessage]) {
        if let Some(last) = messages.last() {
            self.set_start_id(last.id.clone());
        }
    }

    fn payload(&self, value: String) -> Vec<(String, String)> {
        vec![(self.key.clone(), value)]
    }

    // --- inspection ---

    /// Number of entries (0 on failure).
    pub async fn count(&self) -> u64 {
        match self.store.len(&self.key).await {
            Ok(len) => {
                self.metrics.depth(len);
                len
            }
            Err(e) => {
                warn!(stream = %self.key, error = %e, "Failed to read stream length");
                0
            }
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.count().await == 0
    }

    pub async fn info(&self) -> Option<StreamInfo> {
        self.store
            .info(&self.key)
            .await
            .map_err(|e| warn!(stream = %self.key, error = %e, "Failed to read stream info"))
            .ok()
            .flatten()
    }

    pub async fn groups(&self) -> Vec<GroupInfo> {
        self.store
            .groups(&self.key)
            .await
            .map_err(|e| warn!(stream = %self.key, error = %e, "Failed to list groups"))
            .unwrap_or_default()
    }

    pub async fn consumers(&self, group: &str) -> Vec<ConsumerInfo> {
        if group.is_empty() {
            return vec![];
        }
        self.store
            .consumers(&self.key, group)
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Failed to list consumers"))
            .unwrap_or_default()
    }

    /// Pending entries of `group` between `start` and `end`
    /// (defaults `-`, `+` and 100 rows).
    pub async fn pending(
        &self,
        group: &str,
        start: Option<&str>,
        end: Option<&str>,
        count: Option<usize>,
    ) -> Vec<PendingEntry> {
        if group.is_empty() {
            return vec![];
        }
        self.store
            .pending(
                &self.key,
                group,
                start.filter(|s| !s.is_empty()).unwrap_or("-"),
                end.filter(|s| !s.is_empty()).unwrap_or("+"),
                count.unwrap_or(PENDING_PAGE),
            )
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Failed to read pending list"))
            .unwrap_or_default()
    }

    pub async fn pending_summary(&self, group: &str) -> Option<PendingSummary> {
        if group.is_empty() {
            return None;
        }
        self.store
            .pending_summary(&self.key, group)
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Failed to read pending summary"))
            .ok()
    }

    // --- groups ---

    /// Use `group` for consumption and create it (and the stream) if missing.
    ///
    /// Returns true only when the group was created by this call. An existing
    /// group keeps its cursor.
    pub async fn set_group(&self, group: &str) -> bool {
        if group.is_empty() {
            return false;
        }
        *self.group.write().unwrap_or_else(PoisonError::into_inner) = group.to_string();

        match self.store.exists(&self.key).await {
            Ok(false) => return self.group_create(group, None).await,
            Ok(true) => {}
            Err(e) => {
                warn!(stream = %self.key, error = %e, "Failed to check stream existence");
                return false;
            }
        }

        let groups = self.groups().await;
        if groups.iter().any(|g| g.name == group) {
            debug!(stream = %self.key, group = %group, "Consumer group already exists");
            return false;
        }
        self.group_create(group, None).await
    }

    /// Create a group starting at `start_id` (default `"0"`, the beginning).
    pub async fn group_create(&self, group: &str, start_id: Option<&str>) -> bool {
        if group.is_empty() {
            return false;
        }
        let start_id = start_id.filter(|s| !s.is_empty()).unwrap_or("0");
        self.store
            .group_create(&self.key, group, start_id, true)
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Failed to create consumer group"))
            .unwrap_or(false)
    }

    pub async fn group_destroy(&self, group: &str) -> bool {
        if group.is_empty() {
            return false;
        }
        self.store
            .group_destroy(&self.key, group)
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Failed to destroy consumer group"))
            .unwrap_or(false)
    }

    /// Move the group cursor (default `"$"`, the tail).
    pub async fn group_set_id(&self, group: &str, start_id: Option<&str>) -> bool {
        if group.is_empty() {
            return false;
        }
        let start_id = start_id.filter(|s| !s.is_empty()).unwrap_or("$");
        match self.store.group_set_id(&self.key, group, start_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(stream = %self.key, group = %group, error = %e, "Failed to move group cursor");
                false
            }
        }
    }

    /// Remove a consumer; returns the number of entries it still had pending.
    pub async fn group_delete_consumer(&self, group: &str, consumer: &str) -> u64 {
        if group.is_empty() || consumer.is_empty() {
            return 0;
        }
        self.store
            .group_delete_consumer(&self.key, group, consumer)
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Failed to delete consumer"))
            .unwrap_or(0)
    }

    /// With `from_last_offset`, the first group read moves the cursor to the
    /// tail. Runs once per instance.
    async fn move_to_tail_once(&self, group: &str) {
        if !self.options.from_last_offset {
            return;
        }
        if self
            .cursor_moved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(stream = %self.key, group = %group, "Starting group from the last offset");
            self.group_set_id(group, Some("$")).await;
        }
    }

    // --- producing ---

    /// Approximate trim target when the next `appended` entries cross a
    /// multiple of [`TRIM_EVERY`]. Nothing is counted until the store confirms.
    async fn trim_due(&self, appended: i64) -> Option<u64> {
        if self.options.max_length == 0 {
            return None;
        }
        if self.count.load(Ordering::SeqCst) <= 0 {
            let len = self.store.len(&self.key).await.unwrap_or(0);
            self.count.store(len as i64, Ordering::SeqCst);
        }
        let before = self.count.load(Ordering::SeqCst);
        let after = before + appended;
        (after / TRIM_EVERY != before / TRIM_EVERY).then_some(self.options.max_length)
    }

    /// Count confirmed appends. After a trim rode along, the counter is
    /// resynced with the stream length.
    async fn record_appended(&self, written: i64, trimmed: bool) {
        if written == 0 {
            return;
        }
        if !trimmed {
            self.count.fetch_add(written, Ordering::SeqCst);
            return;
        }
        let len = self.store.len(&self.key).await.unwrap_or(0);
        self.count.store(len as i64, Ordering::SeqCst);
        self.metrics.trimmed();
        debug!(stream = %self.key, max_length = self.options.max_length, len, "Trimmed stream");
    }

    /// Append with the send retry budget. Only the store's "not confirmed"
    /// answer is retried.
    async fn append_with_retry(
        &self,
        id: Option<&str>,
        fields: Vec<(String, String)>,
        trim: Option<u64>,
    ) -> QueueResult<Option<String>> {
        let store = &self.store;
        let key = self.key.as_str();
        let fields = &fields;
        self.options
            .send_retry
            .run(
                move || store.append(key, id, fields, trim),
                |result| matches!(result, Ok(None)),
            )
            .await
    }

    async fn add_fields(&self, id: Option<&str>, value: String) -> Option<String> {
        let trim = self.trim_due(1).await;
        match self.append_with_retry(id, self.payload(value), trim).await {
            Ok(Some(id)) => {
                self.record_appended(1, trim.is_some()).await;
                self.metrics.added(1);
                Some(id)
            }
            Ok(None) => {
                self.metrics.add_failed();
                warn!(
                    stream = %self.key,
                    attempts = self.options.send_retry.times,
                    "Append not confirmed after retries"
                );
                None
            }
            Err(e) => {
                self.metrics.add_failed();
                warn!(stream = %self.key, error = %e, "Failed to append to stream");
                None
            }
        }
    }

    /// Append a message; returns its id.
    pub async fn add(&self, value: impl Into<String>) -> Option<String> {
        self.add_fields(None, value.into()).await
    }

    /// Append with an explicit id, which must exceed the stream's last id.
    pub async fn add_with_id(&self, value: impl Into<String>, id: &str) -> Option<String> {
        let id = Some(id).filter(|s| !s.is_empty());
        self.add_fields(id, value.into()).await
    }

    /// Append a value serialized as JSON.
    pub async fn add_json<T: Serialize>(&self, value: &T) -> Option<String> {
        match serde_json::to_string(value) {
            Ok(json) => self.add(json).await,
            Err(e) => {
                warn!(stream = %self.key, error = %e, "Failed to serialize message");
                None
            }
        }
    }

    /// Append several messages; one result per input, in order.
    ///
    /// Two or fewer values are appended one by one; larger batches go out in a
    /// single pipeline whose first entry carries the trim when one is due.
    pub async fn adds<I, V>(&self, values: I) -> Vec<Option<String>>
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            return vec![];
        }

        if values.len() <= SEQUENTIAL_BATCH {
            let mut ids = Vec::with_capacity(values.len());
            for value in values {
                ids.push(self.add(value).await);
            }
            return ids;
        }

        let n = values.len();
        let trim = self.trim_due(n as i64).await;
        let entries: Vec<Vec<(String, String)>> =
            values.into_iter().map(|v| self.payload(v)).collect();

        match self.store.append_batch(&self.key, &entries, trim).await {
            Ok(ids) => {
                let written = ids.iter().filter(|id| id.is_some()).count();
                // The trim rides on the first entry only
                let trimmed = trim.is_some() && ids.first().is_some_and(Option::is_some);
                self.record_appended(written as i64, trimmed).await;
                self.metrics.added(written as u64);
                if written < n {
                    warn!(stream = %self.key, written, requested = n, "Batch append partially confirmed");
                }
                ids
            }
            Err(e) => {
                self.metrics.add_failed();
                warn!(stream = %self.key, error = %e, count = n, "Batch append failed");
                vec![None; n]
            }
        }
    }

    // --- consuming ---

    /// Take up to `count` messages without blocking.
    ///
    /// Group mode runs the reclaim sweep and reads new entries for this
    /// consumer; independent mode reads after the cursor and advances it.
    pub async fn take(&self, count: usize) -> Vec<StreamMessage> {
        let group = self.group();
        if !group.is_empty() {
            self.retry_ack().await;
            return self.read_group(&group, &self.options.consumer, count).await;
        }

        let start = self.start_id();
        let messages = self.read(&start, count).await;
        self.advance_cursor(&messages);
        messages
    }

    pub async fn take_one(&self) -> Option<StreamMessage> {
        self.take(1).await.into_iter().next()
    }

    /// Take up to `count` messages, blocking up to `timeout_secs`
    /// (0 blocks until something arrives).
    ///
    /// In group mode an empty blocking read is followed by a history read that
    /// returns entries already delivered to (or claimed by) this consumer.
    pub async fn take_message_block(&self, count: usize, timeout_secs: u64) -> Vec<StreamMessage> {
        self.poll_block(count, Duration::from_secs(timeout_secs))
            .await
            .map_err(|e| warn!(stream = %self.key, error = %e, "Blocking take failed"))
            .unwrap_or_default()
    }

    pub async fn take_one_block(&self, timeout_secs: u64) -> Option<StreamMessage> {
        self.take_message_block(1, timeout_secs)
            .await
            .into_iter()
            .next()
    }

    pub(crate) async fn poll_block(
        &self,
        count: usize,
        timeout: Duration,
    ) -> QueueResult<Vec<StreamMessage>> {
        let block_ms = timeout.as_millis() as u64;
        let group = self.group();

        if group.is_empty() {
            let start = Some(self.start_id())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "$".to_string());
            let messages = self
                .store
                .read(&self.key, &start, count, Some(block_ms))
                .await?;
            self.advance_cursor(&messages);
            self.metrics.consumed(messages.len() as u64);
            return Ok(messages);
        }

        self.move_to_tail_once(&group).await;
        self.retry_ack().await;

        let consumer = self.options.consumer.as_str();
        let fresh = self
            .store
            .read_group(&self.key, &group, consumer, ">", count, Some(block_ms))
            .await?;
        if !fresh.is_empty() {
            self.metrics.consumed(fresh.len() as u64);
            return Ok(fresh);
        }

        let history = self
            .store
            .read_group(&self.key, &group, consumer, "0", count, Some(HISTORY_BLOCK_MS))
            .await?;
        if let Some(first) = history.first() {
            debug!(stream = %self.key, group = %group, id = %first.id, "Redelivering pending history");
            self.metrics.consumed(history.len() as u64);
        }
        Ok(history)
    }

    /// Independent read after `start_id` (empty means `$`: only entries
    /// appended from now on, so a non-blocking read returns nothing).
    pub async fn read(&self, start_id: &str, count: usize) -> Vec<StreamMessage> {
        self.read_inner(start_id, count, None).await
    }

    /// Independent read that waits up to `block_ms` (0 = forever).
    pub async fn read_block(&self, start_id: &str, count: usize, block_ms: u64) -> Vec<StreamMessage> {
        self.read_inner(start_id, count, Some(block_ms)).await
    }

    async fn read_inner(&self, start_id: &str, count: usize, block_ms: Option<u64>) -> Vec<StreamMessage> {
        let start_id = if start_id.is_empty() { "$" } else { start_id };
        match self.store.read(&self.key, start_id, count, block_ms).await {
            Ok(messages) => {
                self.metrics.consumed(messages.len() as u64);
                messages
            }
            Err(e) => {
                warn!(stream = %self.key, error = %e, "Stream read failed");
                vec![]
            }
        }
    }

    /// Read new entries for `consumer` in `group` without blocking.
    pub async fn read_group(&self, group: &str, consumer: &str, count: usize) -> Vec<StreamMessage> {
        self.read_group_block_inner(group, consumer, count, None, ">").await
    }

    /// Group read waiting up to `block_ms` (0 = forever). `id` defaults to
    /// `>` (new entries); any other id replays this consumer's pending
    /// entries after it.
    pub async fn read_group_block(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
        id: Option<&str>,
    ) -> Vec<StreamMessage> {
        let id = id.filter(|s| !s.is_empty()).unwrap_or(">");
        self.read_group_block_inner(group, consumer, count, Some(block_ms), id)
            .await
    }

    async fn read_group_block_inner(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: Option<u64>,
        id: &str,
    ) -> Vec<StreamMessage> {
        if group.is_empty() {
            return vec![];
        }
        self.move_to_tail_once(group).await;

        match self
            .store
            .read_group(&self.key, group, consumer, id, count, block_ms)
            .await
        {
            Ok(messages) => {
                self.metrics.consumed(messages.len() as u64);
                messages
            }
            Err(e) if e.is_nogroup() => {
                warn!(stream = %self.key, group = %group, "Consumer group missing, call set_group first");
                vec![]
            }
            Err(e) => {
                warn!(stream = %self.key, group = %group, error = %e, "Group read failed");
                vec![]
            }
        }
    }

    // --- acknowledgement and reclaim ---

    /// Acknowledge ids in the current group.
    pub async fn acknowledge(&self, ids: &[String]) -> u64 {
        let group = self.group();
        if group.is_empty() || ids.is_empty() {
            return 0;
        }
        self.ack_ids(&group, ids)
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Acknowledge failed"))
            .unwrap_or(0)
    }

    /// Acknowledge one id in `group`.
    pub async fn ack(&self, group: &str, id: &str) -> u64 {
        if group.is_empty() || id.is_empty() {
            return 0;
        }
        self.ack_ids(group, &[id.to_string()])
            .await
            .map_err(|e| warn!(stream = %self.key, group = %group, error = %e, "Acknowledge failed"))
            .unwrap_or(0)
    }

    async fn ack_ids(&self, group: &str, ids: &[String]) -> QueueResult<u64> {
        let acked = self.store.ack(&self.key, group, ids).await?;
        self.metrics.acked(acked);
        Ok(acked)
    }

    /// Take ownership of a pending entry idle for at least `min_idle_ms`.
    pub async fn claim(
        &self,
        group: &str,
        consumer: &str,
        id: &str,
        min_idle_ms: u64,
    ) -> Vec<StreamMessage> {
        if group.is_empty() || consumer.is_empty() || id.is_empty() {
            return vec![];
        }
        match self
            .store
            .claim(&self.key, group, consumer, min_idle_ms, &[id.to_string()])
            .await
        {
            Ok(messages) => {
                self.metrics.claimed(messages.len() as u64);
                messages
            }
            Err(e) => {
                warn!(stream = %self.key, group = %group, id = %id, error = %e, "Claim failed");
                vec![]
            }
        }
    }

    /// Reclaim stale pending entries, at most once per `retry_interval`.
    ///
    /// Returns `None` when rate-limited, in independent mode, or when the
    /// sweep failed.
    pub async fn retry_ack(&self) -> Option<RetryReport> {
        let group = self.group();
        if group.is_empty() || !self.retry_gate.try_enter(self.clock.as_ref()) {
            return None;
        }

        match self.sweep_pending(&group).await {
            Ok(report) => {
                if report != RetryReport::default() {
                    info!(
                        stream = %self.key,
                        group = %group,
                        claimed = report.claimed,
                        discarded = report.discarded,
                        consumers_removed = report.consumers_removed,
                        "Reclaim sweep finished"
                    );
                }
                Some(report)
            }
            Err(e) if e.is_nogroup() => {
                debug!(stream = %self.key, group = %group, "No consumer group yet, nothing to reclaim");
                None
            }
            Err(e) => {
                warn!(stream = %self.key, group = %group, error = %e, "Reclaim sweep failed");
                None
            }
        }
    }

    async fn sweep_pending(&self, group: &str) -> QueueResult<RetryReport> {
        let retry_ms = self.options.retry_interval.as_millis() as u64;
        let consumer = self.options.consumer.as_str();
        let mut report = RetryReport::default();
        let mut start = "-".to_string();

        loop {
            let page = self
                .store
                .pending(&self.key, group, &start, "+", PENDING_PAGE)
                .await?;
            let Some(last) = page.last() else { break };

            for entry in page.iter().filter(|p| p.idle_ms >= retry_ms) {
                let ids = [entry.id.clone()];
                if entry.delivery_count > self.options.max_retry {
                    self.store
                        .claim(&self.key, group, consumer, retry_ms, &ids)
                        .await?;
                    self.store.ack(&self.key, group, &ids).await?;
                    warn!(
                        stream = %self.key,
                        group = %group,
                        id = %entry.id,
                        owner = %entry.consumer,
                        deliveries = entry.delivery_count,
                        "Discarding message after too many deliveries"
                    );
                    report.discarded += 1;
                } else {
                    let claimed = self
                        .store
                        .claim(&self.key, group, consumer, retry_ms, &ids)
                        .await?;
                    debug!(
                        stream = %self.key,
                        group = %group,
                        id = %entry.id,
                        from = %entry.consumer,
                        "Reclaimed pending message"
                    );
                    report.claimed += claimed.len() as u64;
                }
            }

            if page.len() < PENDING_PAGE {
                break;
            }
            start = format!("({}", last.id);
        }

        for idle in self
            .store
            .consumers(&self.key, group)
            .await?
            .into_iter()
            .filter(|c| c.pending == 0 && c.idle_ms > IDLE_CONSUMER_MS)
        {
            self.store
                .group_delete_consumer(&self.key, group, &idle.name)
                .await?;
            debug!(stream = %self.key, group = %group, consumer = %idle.name, "Removed idle consumer");
            report.consumers_removed += 1;
        }

        self.metrics.claimed(report.claimed);
        self.metrics.discarded(report.discarded);
        self.metrics.consumers_removed(report.consumers_removed);
        Ok(report)
    }

    // --- maintenance ---

    /// Trim to exactly `max_len` entries; returns how many were removed.
    pub async fn trim(&self, max_len: u64) -> u64 {
        self.store
            .trim(&self.key, max_len, false)
            .await
            .map_err(|e| warn!(stream = %self.key, error = %e, "Trim failed"))
            .unwrap_or(0)
    }

    pub async fn delete(&self, ids: &[String]) -> u64 {
        if ids.is_empty() {
            return 0;
        }
        self.store
            .delete(&self.key, ids)
            .await
            .map_err(|e| warn!(stream = %self.key, error = %e, "Delete failed"))
            .unwrap_or(0)
    }

    /// Entries between `start` and `end` (defaults `-` and `+`).
    pub async fn range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
        count: Option<usize>,
    ) -> Vec<StreamMessage> {
        self.store
            .range(
                &self.key,
                start.filter(|s| !s.is_empty()).unwrap_or("-"),
                end.filter(|s| !s.is_empty()).unwrap_or("+"),
                count,
            )
            .await
            .map_err(|e| warn!(stream = %self.key, error = %e, "Range failed"))
            .unwrap_or_default()
    }

    /// Entries appended between two epoch-millisecond timestamps.
    pub async fn range_time_span(
        &self,
        start_ms: u64,
        end_ms: u64,
        count: Option<usize>,
    ) -> Vec<StreamMessage> {
        let start = format!("{start_ms}-0");
        let end = format!("{end_ms}-0");
        self.range(Some(&start), Some(&end), count).await
    }

    /// Spawn the consume loop: ensure the group exists, then poll with
    /// `block_time` and acknowledge every batch the handler accepts.
    pub fn consume_block<H>(self: &Arc<Self>, shutdown: watch::Receiver<bool>, handler: H) -> JoinHandle<()>
    where
        H: MessageHandler<StreamMessage> + 'static,
    {
        ConsumeLoop::new(self.clone(), handler, shutdown).spawn()
    }
}

#[async_trait]
impl Consumable for StreamQueue {
    type Item = StreamMessage;

    fn name(&self) -> &str {
        &self.key
    }

    fn block_time(&self) -> Duration {
        self.options.block_time
    }

    async fn prepare(&self) -> QueueResult<()> {
        let group = self.group();
        if !group.is_empty() {
            self.set_group(&group).await;
        }
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> QueueResult<Vec<StreamMessage>> {
        self.poll_block(1, timeout).await
    }

    async fn settle(&self, items: &[StreamMessage]) -> QueueResult<u64> {
        let group = self.group();
        if group.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = items.iter().map(|m| m.id.clone()).collect();
        self.ack_ids(&group, &ids).await
    }
}

//! Store abstraction
//!
//! Every queue talks to its backend through [`LogStore`]: append-only streams
//! with consumer groups, plain lists, and string keys with expiry.
//!
//! - [`RedisStore`]: production backend over a Redis connection manager
//! - [`MemoryStore`]: in-process backend with the same semantics, used in
//!   tests and single-process deployments

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::QueueResult;
use crate::message::StreamMessage;
use async_trait::async_trait;
use std::time::Duration;

/// Field/value pairs of one stream entry
pub type Fields = Vec<(String, String)>;

/// One row of the pending-entries list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Milliseconds since the entry was last delivered
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// Pending-list summary of a group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: u64,
    pub lowest_id: Option<String>,
    pub highest_id: Option<String>,
    /// Pending count per consumer
    pub consumers: Vec<(String, u64)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub length: u64,
    pub last_generated_id: String,
    pub groups: u64,
    pub first_entry: Option<StreamMessage>,
    pub last_entry: Option<StreamMessage>,
}

/// Backend operations used by the queues.
///
/// Blocking parameters follow the store convention: `None` returns
/// immediately, `Some(0)` blocks until data arrives, anything else is a
/// timeout in milliseconds.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogStore: Send + Sync {
    // --- streams ---

    /// Append one entry. `id` of `None` lets the store allocate one.
    /// `approx_max_len` trims the stream approximately in the same command.
    /// `Ok(None)` means the store did not confirm the write.
    async fn append<'a>(
        &self,
        stream: &str,
        id: Option<&'a str>,
        fields: &[(String, String)],
        approx_max_len: Option<u64>,
    ) -> QueueResult<Option<String>>;

    /// Append several entries in one round trip; the first one carries the
    /// trim when `approx_max_len` is set.
    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Fields],
        approx_max_len: Option<u64>,
    ) -> QueueResult<Vec<Option<String>>>;

    /// Number of entries in the stream (0 when missing)
    async fn len(&self, stream: &str) -> QueueResult<u64>;

    /// Entries with id greater than `after_id` (`$` = only new ones)
    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> QueueResult<Vec<StreamMessage>>;

    /// Entries in `[start, end]`; bounds accept `-`, `+`, `(id` and bare ms
    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> QueueResult<Vec<StreamMessage>>;

    /// Trim to `max_len`; approximate trims may leave extra entries
    async fn trim(&self, stream: &str, max_len: u64, approx: bool) -> QueueResult<u64>;

    async fn delete(&self, stream: &str, ids: &[String]) -> QueueResult<u64>;

    async fn info(&self, stream: &str) -> QueueResult<Option<StreamInfo>>;

    // --- consumer groups ---

    /// Create a group; `Ok(false)` when it already exists
    async fn group_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> QueueResult<bool>;

    async fn group_destroy(&self, stream: &str, group: &str) -> QueueResult<bool>;

    async fn group_set_id(&self, stream: &str, group: &str, id: &str) -> QueueResult<()>;

    /// Remove a consumer; returns how many entries it still had pending
    async fn group_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> QueueResult<u64>;

    /// `id` of `>` delivers new entries; any other id replays this
    /// consumer's own pending entries after it
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> QueueResult<Vec<StreamMessage>>;

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>>;

    async fn pending_summary(&self, stream: &str, group: &str) -> QueueResult<PendingSummary>;

    /// Reassign pending entries idle for at least `min_idle_ms`
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> QueueResult<Vec<StreamMessage>>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64>;

    async fn groups(&self, stream: &str) -> QueueResult<Vec<GroupInfo>>;

    async fn consumers(&self, stream: &str, group: &str) -> QueueResult<Vec<ConsumerInfo>>;

    // --- lists ---

    /// Push to the head; returns the new length
    async fn lpush(&self, key: &str, values: &[String]) -> QueueResult<u64>;

    /// Pop from the tail of `source` and push to the head of `destination`
    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
        block: Option<Duration>,
    ) -> QueueResult<Option<String>>;

    /// Up to `count` non-blocking moves in one round trip
    async fn rpoplpush_many(
        &self,
        source: &str,
        destination: &str,
        count: usize,
    ) -> QueueResult<Vec<String>>;

    /// Remove occurrences of `value` (0 = all)
    async fn lrem(&self, key: &str, count: i64, value: &str) -> QueueResult<u64>;

    async fn llen(&self, key: &str) -> QueueResult<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>>;

    // --- keys ---

    async fn get(&self, key: &str) -> QueueResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()>;

    /// Set only if absent; true when this call wrote the key
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<bool>;

    async fn del(&self, keys: &[String]) -> QueueResult<u64>;

    async fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Keys matching a glob pattern (`*`, `?`)
    async fn scan(&self, pattern: &str) -> QueueResult<Vec<String>>;
}

/// Glob match supporting `*` and `?`, as used by key scans.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

//! In-process store
//!
//! Mirrors the Redis semantics the queues rely on: monotonically increasing
//! stream ids, consumer groups with a pending-entries list, delivery counts
//! and idle times, approximate trimming, blocking reads, lists and expiring
//! string keys. Time comes from the injected [`Clock`].

use super::{
    glob_match, ConsumerInfo, Fields, GroupInfo, LogStore, PendingEntry, PendingSummary,
    StreamInfo,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult};
use crate::message::{MessageId, StreamMessage};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Approximate trims remove whole nodes of this many entries.
const TRIM_NODE_SIZE: u64 = 100;

/// In-memory [`LogStore`].
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
    written: Notify,
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Value>,
    /// Absolute expiry in epoch milliseconds
    expiry: HashMap<String, i64>,
}

#[derive(Debug)]
enum Value {
    Stream(Stream),
    List(VecDeque<String>),
    Str(String),
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<MessageId, Fields>,
    last_id: MessageId,
    groups: BTreeMap<String, Group>,
}

#[derive(Debug)]
struct Group {
    last_delivered: MessageId,
    pending: BTreeMap<MessageId, Delivery>,
    consumers: BTreeMap<String, Consumer>,
}

#[derive(Debug)]
struct Delivery {
    consumer: String,
    delivered_at: i64,
    count: u64,
}

#[derive(Debug)]
struct Consumer {
    seen_at: i64,
}

impl Group {
    fn new(last_delivered: MessageId) -> Self {
        Self {
            last_delivered,
            pending: BTreeMap::new(),
            consumers: BTreeMap::new(),
        }
    }

    fn touch(&mut self, consumer: &str, now: i64) {
        self.consumers
            .entry(consumer.to_string())
            .and_modify(|c| c.seen_at = now)
            .or_insert(Consumer { seen_at: now });
    }

    fn pending_for(&self, consumer: &str) -> u64 {
        self.pending
            .values()
            .filter(|d| d.consumer == consumer)
            .count() as u64
    }
}

impl Stream {
    fn next_id(&self, now: i64) -> MessageId {
        let now = now.max(0) as u64;
        if now > self.last_id.ms {
            MessageId::new(now, 0)
        } else {
            // Clock went backwards or several appends in one millisecond
            MessageId::new(self.last_id.ms, self.last_id.seq.saturating_add(1))
        }
    }

    fn message(&self, id: &MessageId) -> Option<StreamMessage> {
        self.entries
            .get(id)
            .map(|fields| StreamMessage::new(id.to_string(), fields.clone()))
    }

    fn trim(&mut self, max_len: u64, approx: bool) -> u64 {
        let len = self.entries.len() as u64;
        if len <= max_len {
            return 0;
        }
        let mut excess = len - max_len;
        if approx {
            excess -= excess % TRIM_NODE_SIZE;
        }
        for _ in 0..excess {
            self.entries.pop_first();
        }
        excess
    }

    fn group(&self, stream: &str, group: &str) -> QueueResult<&Group> {
        self.groups.get(group).ok_or_else(|| no_group(stream, group))
    }

    fn group_mut(&mut self, stream: &str, group: &str) -> QueueResult<&mut Group> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| no_group(stream, group))
    }
}

fn no_group(stream: &str, group: &str) -> QueueError {
    QueueError::NoGroup {
        stream: stream.to_string(),
        group: group.to_string(),
    }
}

fn bounds(start: &str, end: &str) -> QueueResult<Option<(MessageId, MessageId)>> {
    let start = MessageId::parse_bound(start, true)?;
    let end = MessageId::parse_bound(end, false)?;
    Ok(match (start, end) {
        (Some(s), Some(e)) if s <= e => Some((s, e)),
        _ => None,
    })
}

fn limit(count: usize) -> usize {
    if count == 0 { usize::MAX } else { count }
}

impl State {
    fn expire(&mut self, now: i64) {
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expiry.remove(&key);
            self.keys.remove(&key);
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        self.keys.remove(key).is_some()
    }

    fn stream(&self, key: &str) -> QueueResult<Option<&Stream>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Value::Stream(s)) => Ok(Some(s)),
            Some(_) => Err(QueueError::WrongType(key.to_string())),
        }
    }

    fn stream_mut(&mut self, key: &str) -> QueueResult<Option<&mut Stream>> {
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(Value::Stream(s)) => Ok(Some(s)),
            Some(_) => Err(QueueError::WrongType(key.to_string())),
        }
    }

    fn stream_or_create(&mut self, key: &str) -> QueueResult<&mut Stream> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::Stream(Stream::default()))
        {
            Value::Stream(s) => Ok(s),
            _ => Err(QueueError::WrongType(key.to_string())),
        }
    }

    fn list(&self, key: &str) -> QueueResult<Option<&VecDeque<String>>> {
        match self.keys.get(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(QueueError::WrongType(key.to_string())),
        }
    }

    fn list_mut(&mut self, key: &str) -> QueueResult<Option<&mut VecDeque<String>>> {
        match self.keys.get_mut(key) {
            None => Ok(None),
            Some(Value::List(l)) => Ok(Some(l)),
            Some(_) => Err(QueueError::WrongType(key.to_string())),
        }
    }

    fn list_or_create(&mut self, key: &str) -> QueueResult<&mut VecDeque<String>> {
        match self
            .keys
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()))
        {
            Value::List(l) => Ok(l),
            _ => Err(QueueError::WrongType(key.to_string())),
        }
    }

    /// Empty lists do not exist.
    fn drop_if_empty_list(&mut self, key: &str) {
        if matches!(self.keys.get(key), Some(Value::List(l)) if l.is_empty()) {
            self.remove(key);
        }
    }

    fn append(
        &mut self,
        key: &str,
        id: Option<&str>,
        fields: &[(String, String)],
        approx_max_len: Option<u64>,
        now: i64,
    ) -> QueueResult<String> {
        let stream = self.stream_or_create(key)?;
        let id = match id {
            None | Some("*") => stream.next_id(now),
            Some(raw) => {
                let id: MessageId = raw.parse()?;
                if id <= stream.last_id {
                    return Err(QueueError::InvalidId(format!(
                        "{raw} is equal or smaller than the stream top item {}",
                        stream.last_id
                    )));
                }
                id
            }
        };

        stream.entries.insert(id, fields.to_vec());
        stream.last_id = id;
        if let Some(max_len) = approx_max_len {
            stream.trim(max_len, true);
        }
        Ok(id.to_string())
    }

    fn rpoplpush(&mut self, source: &str, destination: &str) -> QueueResult<Option<String>> {
        // Type-check the destination before popping
        self.list(destination)?;
        let item = match self.list_mut(source)? {
            Some(list) => list.pop_back(),
            None => None,
        };
        let Some(item) = item else {
            return Ok(None);
        };
        self.drop_if_empty_list(source);
        self.list_or_create(destination)?.push_front(item.clone());
        Ok(Some(item))
    }

    fn read_after(&self, key: &str, after: MessageId, count: usize) -> QueueResult<Vec<StreamMessage>> {
        let Some(stream) = self.stream(key)? else {
            return Ok(vec![]);
        };
        Ok(stream
            .entries
            .range(after..)
            .filter(|(id, _)| **id > after)
            .take(limit(count))
            .map(|(id, fields)| StreamMessage::new(id.to_string(), fields.clone()))
            .collect())
    }

    fn deliver_new(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        now: i64,
    ) -> QueueResult<Vec<StreamMessage>> {
        let stream = self
            .stream_mut(key)?
            .ok_or_else(|| no_group(key, group))?;
        let ids: Vec<MessageId> = {
            let g = stream.group(key, group)?;
            stream
                .entries
                .range(g.last_delivered..)
                .map(|(id, _)| *id)
                .filter(|id| *id > g.last_delivered)
                .take(limit(count))
                .collect()
        };
        let messages: Vec<StreamMessage> = ids.iter().filter_map(|id| stream.message(id)).collect();

        let g = stream.group_mut(key, group)?;
        g.touch(consumer, now);
        for id in &ids {
            g.pending.insert(
                *id,
                Delivery {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    count: 1,
                },
            );
        }
        if let Some(last) = ids.last() {
            g.last_delivered = *last;
        }
        Ok(messages)
    }

    fn deliver_history(
        &mut self,
        key: &str,
        group: &str,
        consumer: &str,
        after: MessageId,
        count: usize,
        now: i64,
    ) -> QueueResult<Vec<StreamMessage>> {
        let stream = self
            .stream_mut(key)?
            .ok_or_else(|| no_group(key, group))?;
        let ids: Vec<MessageId> = stream
            .group(key, group)?
            .pending
            .range(after..)
            .filter(|(id, d)| **id > after && d.consumer == consumer)
            .map(|(id, _)| *id)
            .take(limit(count))
            .collect();
        let messages: Vec<StreamMessage> = ids.iter().filter_map(|id| stream.message(id)).collect();

        let g = stream.group_mut(key, group)?;
        g.touch(consumer, now);
        for id in &ids {
            if let Some(d) = g.pending.get_mut(id) {
                d.delivered_at = now;
                d.count += 1;
            }
        }
        Ok(messages)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
            written: Notify::new(),
        }
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    async fn locked(&self) -> tokio::sync::MutexGuard<'_, State> {
        let mut state = self.state.lock().await;
        state.expire(self.now());
        state
    }

    /// Poll `attempt` until it yields something, the deadline passes, or
    /// `block` is `None`. Writers wake waiters through `written`.
    async fn wait_for<T, F>(&self, block: Option<Duration>, mut attempt: F) -> QueueResult<Option<T>>
    where
        F: FnMut(&mut State, i64) -> QueueResult<Option<T>>,
    {
        let deadline = match block {
            None => None,
            Some(d) if d.is_zero() => None,
            Some(d) => Some(Instant::now() + d),
        };

        loop {
            let mut notified = pin!(self.written.notified());
            notified.as_mut().enable();

            {
                let mut state = self.locked().await;
                let now = self.now();
                if let Some(found) = attempt(&mut *state, now)? {
                    return Ok(Some(found));
                }
            }

            if block.is_none() {
                return Ok(None);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    fn wake(&self) {
        self.written.notify_waiters();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn append<'a>(
        &self,
        stream: &str,
        id: Option<&'a str>,
        fields: &[(String, String)],
        approx_max_len: Option<u64>,
    ) -> QueueResult<Option<String>> {
        let now = self.now();
        let id = self
            .locked()
            .await
            .append(stream, id, fields, approx_max_len, now)?;
        self.wake();
        Ok(Some(id))
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Fields],
        approx_max_len: Option<u64>,
    ) -> QueueResult<Vec<Option<String>>> {
        let now = self.now();
        let mut state = self.locked().await;
        let mut ids = Vec::with_capacity(entries.len());
        for (i, fields) in entries.iter().enumerate() {
            let trim = if i == 0 { approx_max_len } else { None };
            ids.push(state.append(stream, None, fields, trim, now).ok());
        }
        drop(state);
        self.wake();
        Ok(ids)
    }

    async fn len(&self, stream: &str) -> QueueResult<u64> {
        let state = self.locked().await;
        Ok(state
            .stream(stream)?
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> QueueResult<Vec<StreamMessage>> {
        let after = if after_id == "$" {
            let state = self.locked().await;
            state.stream(stream)?.map(|s| s.last_id).unwrap_or_default()
        } else {
            after_id.parse::<MessageId>()?
        };

        let found = self
            .wait_for(block_ms.map(Duration::from_millis), |state, _| {
                let messages = state.read_after(stream, after, count)?;
                Ok((!messages.is_empty()).then_some(messages))
            })
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> QueueResult<Vec<StreamMessage>> {
        let Some((start, end)) = bounds(start, end)? else {
            return Ok(vec![]);
        };
        let state = self.locked().await;
        let Some(s) = state.stream(stream)? else {
            return Ok(vec![]);
        };
        Ok(s.entries
            .range(start..=end)
            .take(count.unwrap_or(usize::MAX))
            .map(|(id, fields)| StreamMessage::new(id.to_string(), fields.clone()))
            .collect())
    }

    async fn trim(&self, stream: &str, max_len: u64, approx: bool) -> QueueResult<u64> {
        let mut state = self.locked().await;
        Ok(state
            .stream_mut(stream)?
            .map(|s| s.trim(max_len, approx))
            .unwrap_or(0))
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> QueueResult<u64> {
        let ids = ids
            .iter()
            .map(|id| id.parse::<MessageId>())
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.locked().await;
        let Some(s) = state.stream_mut(stream)? else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| s.entries.remove(*id).is_some())
            .count() as u64)
    }

    async fn info(&self, stream: &str) -> QueueResult<Option<StreamInfo>> {
        let state = self.locked().await;
        Ok(state.stream(stream)?.map(|s| StreamInfo {
            length: s.entries.len() as u64,
            last_generated_id: s.last_id.to_string(),
            groups: s.groups.len() as u64,
            first_entry: s
                .entries
                .first_key_value()
                .map(|(id, f)| StreamMessage::new(id.to_string(), f.clone())),
            last_entry: s
                .entries
                .last_key_value()
                .map(|(id, f)| StreamMessage::new(id.to_string(), f.clone())),
        }))
    }

    async fn group_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> QueueResult<bool> {
        let mut state = self.locked().await;
        let s = if mkstream {
            state.stream_or_create(stream)?
        } else {
            state.stream_mut(stream)?.ok_or_else(|| {
                QueueError::invalid(format!("stream '{stream}' does not exist"))
            })?
        };
        if s.groups.contains_key(group) {
            return Ok(false);
        }
        let start = if start_id == "$" {
            s.last_id
        } else {
            start_id.parse::<MessageId>()?
        };
        s.groups.insert(group.to_string(), Group::new(start));
        Ok(true)
    }

    async fn group_destroy(&self, stream: &str, group: &str) -> QueueResult<bool> {
        let mut state = self.locked().await;
        Ok(state
            .stream_mut(stream)?
            .map(|s| s.groups.remove(group).is_some())
            .unwrap_or(false))
    }

    async fn group_set_id(&self, stream: &str, group: &str, id: &str) -> QueueResult<()> {
        let mut state = self.locked().await;
        let s = state
            .stream_mut(stream)?
            .ok_or_else(|| no_group(stream, group))?;
        let id = if id == "$" { s.last_id } else { id.parse()? };
        s.group_mut(stream, group)?.last_delivered = id;
        Ok(())
    }

    async fn group_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> QueueResult<u64> {
        let mut state = self.locked().await;
        let s = state
            .stream_mut(stream)?
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.group_mut(stream, group)?;
        let pending = g.pending_for(consumer);
        g.pending.retain(|_, d| d.consumer != consumer);
        g.consumers.remove(consumer);
        Ok(pending)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> QueueResult<Vec<StreamMessage>> {
        if id != ">" {
            // History reads never block
            let after: MessageId = id.parse()?;
            let now = self.now();
            let mut state = self.locked().await;
            return state.deliver_history(stream, group, consumer, after, count, now);
        }

        let found = self
            .wait_for(block_ms.map(Duration::from_millis), |state, now| {
                let messages = state.deliver_new(stream, group, consumer, count, now)?;
                Ok((!messages.is_empty()).then_some(messages))
            })
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        let now = self.now();
        let state = self.locked().await;
        let s = state
            .stream(stream)?
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.group(stream, group)?;
        let Some((start, end)) = bounds(start, end)? else {
            return Ok(vec![]);
        };
        Ok(g.pending
            .range(start..=end)
            .take(limit(count))
            .map(|(id, d)| PendingEntry {
                id: id.to_string(),
                consumer: d.consumer.clone(),
                idle_ms: (now - d.delivered_at).max(0) as u64,
                delivery_count: d.count,
            })
            .collect())
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> QueueResult<PendingSummary> {
        let state = self.locked().await;
        let s = state
            .stream(stream)?
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.group(stream, group)?;

        let mut per_consumer: BTreeMap<&str, u64> = BTreeMap::new();
        for d in g.pending.values() {
            *per_consumer.entry(d.consumer.as_str()).or_default() += 1;
        }
        Ok(PendingSummary {
            count: g.pending.len() as u64,
            lowest_id: g.pending.keys().next().map(|id| id.to_string()),
            highest_id: g.pending.keys().next_back().map(|id| id.to_string()),
            consumers: per_consumer
                .into_iter()
                .map(|(name, n)| (name.to_string(), n))
                .collect(),
        })
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> QueueResult<Vec<StreamMessage>> {
        let ids = ids
            .iter()
            .map(|id| id.parse::<MessageId>())
            .collect::<Result<Vec<_>, _>>()?;
        let now = self.now();
        let mut state = self.locked().await;
        let s = state
            .stream_mut(stream)?
            .ok_or_else(|| no_group(stream, group))?;

        let mut claimed = Vec::new();
        let mut vanished = Vec::new();
        {
            let g = s.groups.get(group).ok_or_else(|| no_group(stream, group))?;
            for id in &ids {
                let Some(d) = g.pending.get(id) else { continue };
                if ((now - d.delivered_at).max(0) as u64) < min_idle_ms {
                    continue;
                }
                if s.entries.contains_key(id) {
                    claimed.push(*id);
                } else {
                    vanished.push(*id);
                }
            }
        }
        let messages: Vec<StreamMessage> = claimed.iter().filter_map(|id| s.message(id)).collect();

        let g = s.group_mut(stream, group)?;
        g.touch(consumer, now);
        for id in &vanished {
            g.pending.remove(id);
        }
        for id in &claimed {
            if let Some(d) = g.pending.get_mut(id) {
                d.consumer = consumer.to_string();
                d.delivered_at = now;
                d.count += 1;
            }
        }
        Ok(messages)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64> {
        let ids = ids
            .iter()
            .map(|id| id.parse::<MessageId>())
            .collect::<Result<Vec<_>, _>>()?;
        let mut state = self.locked().await;
        let Some(s) = state.stream_mut(stream)? else {
            return Ok(0);
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(0);
        };
        Ok(ids
            .iter()
            .filter(|id| g.pending.remove(*id).is_some())
            .count() as u64)
    }

    async fn groups(&self, stream: &str) -> QueueResult<Vec<GroupInfo>> {
        let state = self.locked().await;
        let Some(s) = state.stream(stream)? else {
            return Ok(vec![]);
        };
        Ok(s.groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len() as u64,
                pending: g.pending.len() as u64,
                last_delivered_id: g.last_delivered.to_string(),
            })
            .collect())
    }

    async fn consumers(&self, stream: &str, group: &str) -> QueueResult<Vec<ConsumerInfo>> {
        let now = self.now();
        let state = self.locked().await;
        let s = state
            .stream(stream)?
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.group(stream, group)?;
        Ok(g.consumers
            .iter()
            .map(|(name, c)| ConsumerInfo {
                name: name.clone(),
                pending: g.pending_for(name),
                idle_ms: (now - c.seen_at).max(0) as u64,
            })
            .collect())
    }

    async fn lpush(&self, key: &str, values: &[String]) -> QueueResult<u64> {
        if values.is_empty() {
            return Err(QueueError::invalid("LPUSH requires at least one value"));
        }
        let mut state = self.locked().await;
        let list = state.list_or_create(key)?;
        for value in values {
            list.push_front(value.clone());
        }
        let len = list.len() as u64;
        drop(state);
        self.wake();
        Ok(len)
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
        block: Option<Duration>,
    ) -> QueueResult<Option<String>> {
        let item = self
            .wait_for(block, |state, _| state.rpoplpush(source, destination))
            .await?;
        if item.is_some() {
            self.wake();
        }
        Ok(item)
    }

    async fn rpoplpush_many(
        &self,
        source: &str,
        destination: &str,
        count: usize,
    ) -> QueueResult<Vec<String>> {
        let mut state = self.locked().await;
        let mut items = Vec::new();
        while items.len() < count {
            match state.rpoplpush(source, destination)? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        drop(state);
        if !items.is_empty() {
            self.wake();
        }
        Ok(items)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> QueueResult<u64> {
        let mut state = self.locked().await;
        let Some(list) = state.list_mut(key)? else {
            return Ok(0);
        };

        let budget = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0usize;
        if count >= 0 {
            let mut i = 0;
            while i < list.len() && removed < budget {
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                } else {
                    i += 1;
                }
            }
        } else {
            let mut i = list.len();
            while i > 0 && removed < budget {
                i -= 1;
                if list[i] == value {
                    list.remove(i);
                    removed += 1;
                }
            }
        }
        state.drop_if_empty_list(key);
        Ok(removed as u64)
    }

    async fn llen(&self, key: &str) -> QueueResult<u64> {
        let state = self.locked().await;
        Ok(state.list(key)?.map(|l| l.len() as u64).unwrap_or(0))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>> {
        let state = self.locked().await;
        let Some(list) = state.list(key)? else {
            return Ok(vec![]);
        };
        let len = list.len() as i64;
        let norm = |i: i64| if i < 0 { len + i } else { i };
        let start = norm(start).max(0);
        let stop = norm(stop).min(len - 1);
        if start > stop {
            return Ok(vec![]);
        }
        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let state = self.locked().await;
        match state.keys.get(key) {
            None => Ok(None),
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(QueueError::WrongType(key.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let now = self.now();
        let mut state = self.locked().await;
        state.keys.insert(key.to_string(), Value::Str(value.to_string()));
        match ttl {
            Some(ttl) => {
                state
                    .expiry
                    .insert(key.to_string(), now + ttl.as_millis() as i64);
            }
            None => {
                state.expiry.remove(key);
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<bool> {
        let now = self.now();
        let mut state = self.locked().await;
        if state.keys.contains_key(key) {
            return Ok(false);
        }
        state.keys.insert(key.to_string(), Value::Str(value.to_string()));
        if let Some(ttl) = ttl {
            state
                .expiry
                .insert(key.to_string(), now + ttl.as_millis() as i64);
        }
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> QueueResult<u64> {
        let mut state = self.locked().await;
        Ok(keys.iter().filter(|k| state.remove(k)).count() as u64)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let state = self.locked().await;
        Ok(state.keys.contains_key(key))
    }

    async fn scan(&self, pattern: &str) -> QueueResult<Vec<String>> {
        let state = self.locked().await;
        let mut keys: Vec<String> = state
            .keys
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

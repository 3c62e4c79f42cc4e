//! Redis backend
//!
//! Non-blocking commands share one `ConnectionManager`. Blocking reads
//! (`XREAD BLOCK`, `XREADGROUP BLOCK`, `BRPOPLPUSH`) check out a connection of
//! their own from a small pool. Those connections carry no client-side
//! response timeout, since the server holds the reply for the whole block
//! period.

use super::{
    ConsumerInfo, Fields, GroupInfo, LogStore, PendingEntry, PendingSummary, StreamInfo,
};
use crate::error::{QueueError, QueueResult};
use crate::message::StreamMessage;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoConsumersReply, StreamInfoGroupsReply,
    StreamInfoStreamReply, StreamPendingCountReply, StreamPendingReply, StreamRangeReply,
    StreamReadReply,
};
use redis::{AsyncConnectionConfig, Client, Cmd, ParsingError, RedisError, RedisResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Extra time granted on top of the server-side block before giving up on a
/// blocking reply.
const BLOCK_MARGIN: Duration = Duration::from_secs(5);

/// Redis-backed [`LogStore`].
#[derive(Clone)]
pub struct RedisStore {
    redis: Arc<ConnectionManager>,
    blocking: Arc<BlockingConnections>,
}

/// Idle connections reserved for blocking commands.
struct BlockingConnections {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl BlockingConnections {
    fn new(client: Client) -> Self {
        Self {
            client,
            idle: Mutex::new(Vec::new()),
        }
    }

    async fn checkout(&self) -> RedisResult<MultiplexedConnection> {
        let reused = self.idle.lock().await.pop();
        if let Some(conn) = reused {
            return Ok(conn);
        }
        let config = AsyncConnectionConfig::new().set_response_timeout(None);
        let conn = self
            .client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;
        debug!("Opened blocking Redis connection");
        Ok(conn)
    }

    async fn checkin(&self, conn: MultiplexedConnection) {
        self.idle.lock().await.push(conn);
    }

    #[cfg(test)]
    async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

impl RedisStore {
    /// Connect and verify the connection with `PING`.
    pub async fn connect(url: &str) -> QueueResult<Self> {
        info!("Attempting to connect to Redis at {}", url);

        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;

        let mut conn = manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let store = Self::from_parts(client, manager);
        // Warm one blocking connection
        let blocking = store.blocking.checkout().await?;
        store.blocking.checkin(blocking).await;

        info!("Successfully connected to Redis");
        Ok(store)
    }

    /// Build from an existing client and manager.
    pub fn from_parts(client: Client, manager: ConnectionManager) -> Self {
        Self {
            redis: Arc::new(manager),
            blocking: Arc::new(BlockingConnections::new(client)),
        }
    }

    /// Get a cloned ConnectionManager
    pub fn manager(&self) -> ConnectionManager {
        (*self.redis).clone()
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &Cmd) -> Result<T, RedisError> {
        let mut conn = (*self.redis).clone();
        cmd.query_async(&mut conn).await
    }

    /// Run a command that may block server-side for `block`.
    ///
    /// `None` runs on the shared manager. A zero block waits indefinitely.
    async fn query_blocking<T: redis::FromRedisValue>(
        &self,
        cmd: &Cmd,
        block: Option<Duration>,
    ) -> Result<T, RedisError> {
        let Some(block) = block else {
            return self.query(cmd).await;
        };

        let mut conn = self.blocking.checkout().await?;
        let result = if block.is_zero() {
            cmd.query_async(&mut conn).await
        } else {
            match tokio::time::timeout(block + BLOCK_MARGIN, cmd.query_async(&mut conn)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(block_ms = block.as_millis() as u64, "Blocking command got no reply");
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "blocking command got no reply",
                    )
                    .into());
                }
            }
        };

        match &result {
            Err(e) if e.is_unrecoverable_error() || e.is_io_error() || e.is_timeout() => {
                debug!(error = %e, "Dropping blocking Redis connection");
            }
            _ => self.blocking.checkin(conn).await,
        }
        result
    }
}

/// Translate server error replies into queue errors.
fn classify(err: RedisError, key: &str, group: &str) -> QueueError {
    let message = err.to_string();
    if message.contains("NOGROUP") {
        QueueError::NoGroup {
            stream: key.to_string(),
            group: group.to_string(),
        }
    } else if message.contains("BUSYGROUP") {
        QueueError::BusyGroup(group.to_string())
    } else if message.contains("WRONGTYPE") {
        QueueError::WrongType(key.to_string())
    } else if message.contains("equal or smaller than the target stream top item")
        || message.contains("Invalid stream ID")
    {
        QueueError::InvalidId(message)
    } else {
        QueueError::Redis(err)
    }
}

fn on_key(key: &str) -> impl Fn(RedisError) -> QueueError + '_ {
    move |e| classify(e, key, "")
}

fn on_group<'a>(key: &'a str, group: &'a str) -> impl Fn(RedisError) -> QueueError + 'a {
    move |e| classify(e, key, group)
}

fn xadd(stream: &str, id: Option<&str>, fields: &[(String, String)], approx_max_len: Option<u64>) -> Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(stream);
    if let Some(max_len) = approx_max_len {
        cmd.arg("MAXLEN").arg("~").arg(max_len);
    }
    cmd.arg(id.unwrap_or("*"));
    for (field, value) in fields {
        cmd.arg(field).arg(value);
    }
    cmd
}

// --- reply decoding ---

/// Entries whose data is gone (deleted but still pending) come back empty and
/// are skipped. Fields are ordered by name.
fn messages(ids: Vec<StreamId>) -> RedisResult<Vec<StreamMessage>> {
    let mut out = Vec::with_capacity(ids.len());
    for entry in ids {
        if let Some(message) = message(entry)? {
            out.push(message);
        }
    }
    Ok(out)
}

fn message(entry: StreamId) -> RedisResult<Option<StreamMessage>> {
    if entry.id.is_empty() || entry.map.is_empty() {
        return Ok(None);
    }
    let mut fields = entry
        .map
        .into_iter()
        .map(|(field, value)| Ok((field, redis::from_redis_value::<String>(value)?)))
        .collect::<Result<Vec<_>, ParsingError>>()?;
    fields.sort();
    Ok(Some(StreamMessage::new(entry.id, fields)))
}

/// `XREAD`/`XREADGROUP` reply; nil when a blocking read times out.
fn read_messages(reply: Option<StreamReadReply>) -> RedisResult<Vec<StreamMessage>> {
    let ids = reply
        .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
        .unwrap_or_default();
    messages(ids)
}

fn pending_rows(reply: StreamPendingCountReply) -> Vec<PendingEntry> {
    reply
        .ids
        .into_iter()
        .map(|p| PendingEntry {
            id: p.id,
            consumer: p.consumer,
            idle_ms: p.last_delivered_ms as u64,
            delivery_count: p.times_delivered as u64,
        })
        .collect()
}

fn pending_summary(reply: StreamPendingReply) -> PendingSummary {
    match reply {
        StreamPendingReply::Data(data) => PendingSummary {
            count: data.count as u64,
            lowest_id: Some(data.start_id),
            highest_id: Some(data.end_id),
            consumers: data
                .consumers
                .into_iter()
                .map(|c| (c.name, c.pending as u64))
                .collect(),
        },
        _ => PendingSummary::default(),
    }
}

fn is_missing_key(err: &RedisError) -> bool {
    err.to_string().contains("no such key")
}

#[async_trait]
impl LogStore for RedisStore {
    async fn append<'a>(
        &self,
        stream: &str,
        id: Option<&'a str>,
        fields: &[(String, String)],
        approx_max_len: Option<u64>,
    ) -> QueueResult<Option<String>> {
        self.query(&xadd(stream, id, fields, approx_max_len))
            .await
            .map_err(on_key(stream))
    }

    async fn append_batch(
        &self,
        stream: &str,
        entries: &[Fields],
        approx_max_len: Option<u64>,
    ) -> QueueResult<Vec<Option<String>>> {
        let mut pipe = redis::pipe();
        for (i, fields) in entries.iter().enumerate() {
            let trim = if i == 0 { approx_max_len } else { None };
            pipe.add_command(xadd(stream, None, fields, trim));
        }

        let mut conn = (*self.redis).clone();
        let ids: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(on_key(stream))?;
        debug!(stream = %stream, count = ids.len(), "Pipelined append");
        Ok(ids)
    }

    async fn len(&self, stream: &str) -> QueueResult<u64> {
        self.query(redis::cmd("XLEN").arg(stream))
            .await
            .map_err(on_key(stream))
    }

    async fn read(
        &self,
        stream: &str,
        after_id: &str,
        count: usize,
        block_ms: Option<u64>,
    ) -> QueueResult<Vec<StreamMessage>> {
        let mut cmd = redis::cmd("XREAD");
        if count > 0 {
            cmd.arg("COUNT").arg(count);
        }
        if let Some(block) = block_ms {
            cmd.arg("BLOCK").arg(block);
        }
        cmd.arg("STREAMS").arg(stream).arg(after_id);

        let reply: Option<StreamReadReply> = self
            .query_blocking(&cmd, block_ms.map(Duration::from_millis))
            .await
            .map_err(on_key(stream))?;
        Ok(read_messages(reply)?)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> QueueResult<Vec<StreamMessage>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(stream).arg(start).arg(end);
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        let reply: StreamRangeReply = self.query(&cmd).await.map_err(on_key(stream))?;
        Ok(messages(reply.ids)?)
    }

    async fn trim(&self, stream: &str, max_len: u64, approx: bool) -> QueueResult<u64> {
        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(stream).arg("MAXLEN");
        if approx {
            cmd.arg("~");
        }
        cmd.arg(max_len);
        self.query(&cmd).await.map_err(on_key(stream))
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> QueueResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("XDEL").arg(stream).arg(ids))
            .await
            .map_err(on_key(stream))
    }

    async fn info(&self, stream: &str) -> QueueResult<Option<StreamInfo>> {
        // XINFO STREAM carries the boundary entries too, but only the ids
        // survive its typed reply, so they are read with XRANGE/XREVRANGE.
        let mut pipe = redis::pipe();
        pipe.cmd("XINFO").arg("STREAM").arg(stream);
        pipe.cmd("XRANGE").arg(stream).arg("-").arg("+").arg("COUNT").arg(1);
        pipe.cmd("XREVRANGE").arg(stream).arg("+").arg("-").arg("COUNT").arg(1);

        let mut conn = (*self.redis).clone();
        let reply: RedisResult<(StreamInfoStreamReply, StreamRangeReply, StreamRangeReply)> =
            pipe.query_async(&mut conn).await;
        let (info, first, last) = match reply {
            Ok(reply) => reply,
            Err(e) if is_missing_key(&e) => return Ok(None),
            Err(e) => return Err(classify(e, stream, "")),
        };

        Ok(Some(StreamInfo {
            length: info.length as u64,
            last_generated_id: info.last_generated_id,
            groups: info.groups as u64,
            first_entry: messages(first.ids)?.into_iter().next(),
            last_entry: messages(last.ids)?.into_iter().next(),
        }))
    }

    async fn group_create(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
        mkstream: bool,
    ) -> QueueResult<bool> {
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(stream).arg(group).arg(start_id);
        if mkstream {
            cmd.arg("MKSTREAM");
        }

        match self.query::<()>(&cmd).await {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(true)
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %stream, group = %group, "Consumer group already exists");
                Ok(false)
            }
            Err(e) => Err(classify(e, stream, group)),
        }
    }

    async fn group_destroy(&self, stream: &str, group: &str) -> QueueResult<bool> {
        let removed: u64 = self
            .query(redis::cmd("XGROUP").arg("DESTROY").arg(stream).arg(group))
            .await
            .map_err(on_group(stream, group))?;
        Ok(removed > 0)
    }

    async fn group_set_id(&self, stream: &str, group: &str, id: &str) -> QueueResult<()> {
        self.query(redis::cmd("XGROUP").arg("SETID").arg(stream).arg(group).arg(id))
            .await
            .map_err(on_group(stream, group))
    }

    async fn group_delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> QueueResult<u64> {
        self.query(
            redis::cmd("XGROUP")
                .arg("DELCONSUMER")
                .arg(stream)
                .arg(group)
                .arg(consumer),
        )
        .await
        .map_err(on_group(stream, group))
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
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        if count > 0 {
            cmd.arg("COUNT").arg(count);
        }
        if let Some(block) = block_ms {
            cmd.arg("BLOCK").arg(block);
        }
        cmd.arg("STREAMS").arg(stream).arg(id);

        // The server only blocks on new entries; history reads return at once
        let block = block_ms.filter(|_| id == ">").map(Duration::from_millis);
        let reply: Option<StreamReadReply> = self
            .query_blocking(&cmd, block)
            .await
            .map_err(on_group(stream, group))?;
        Ok(read_messages(reply)?)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        let reply: StreamPendingCountReply = self
            .query(
                redis::cmd("XPENDING")
                    .arg(stream)
                    .arg(group)
                    .arg(start)
                    .arg(end)
                    .arg(count),
            )
            .await
            .map_err(on_group(stream, group))?;
        Ok(pending_rows(reply))
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> QueueResult<PendingSummary> {
        let reply: StreamPendingReply = self
            .query(redis::cmd("XPENDING").arg(stream).arg(group))
            .await
            .map_err(on_group(stream, group))?;
        Ok(pending_summary(reply))
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> QueueResult<Vec<StreamMessage>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let reply: StreamClaimReply = self
            .query(
                redis::cmd("XCLAIM")
                    .arg(stream)
                    .arg(group)
                    .arg(consumer)
                    .arg(min_idle_ms)
                    .arg(ids),
            )
            .await
            .map_err(on_group(stream, group))?;
        Ok(messages(reply.ids)?)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("XACK").arg(stream).arg(group).arg(ids))
            .await
            .map_err(on_group(stream, group))
    }

    async fn groups(&self, stream: &str) -> QueueResult<Vec<GroupInfo>> {
        let reply: RedisResult<StreamInfoGroupsReply> =
            self.query(redis::cmd("XINFO").arg("GROUPS").arg(stream)).await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) if is_missing_key(&e) => return Ok(vec![]),
            Err(e) => return Err(classify(e, stream, "")),
        };

        Ok(reply
            .groups
            .into_iter()
            .map(|g| GroupInfo {
                name: g.name,
                consumers: g.consumers as u64,
                pending: g.pending as u64,
                last_delivered_id: g.last_delivered_id,
            })
            .collect())
    }

    async fn consumers(&self, stream: &str, group: &str) -> QueueResult<Vec<ConsumerInfo>> {
        let reply: StreamInfoConsumersReply = self
            .query(redis::cmd("XINFO").arg("CONSUMERS").arg(stream).arg(group))
            .await
            .map_err(on_group(stream, group))?;

        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending as u64,
                idle_ms: c.idle as u64,
            })
            .collect())
    }

    async fn lpush(&self, key: &str, values: &[String]) -> QueueResult<u64> {
        self.query(redis::cmd("LPUSH").arg(key).arg(values))
            .await
            .map_err(on_key(key))
    }

    async fn rpoplpush(
        &self,
        source: &str,
        destination: &str,
        block: Option<Duration>,
    ) -> QueueResult<Option<String>> {
        match block {
            None => self
                .query(redis::cmd("RPOPLPUSH").arg(source).arg(destination))
                .await
                .map_err(on_key(source)),
            Some(timeout) => self
                .query_blocking(
                    redis::cmd("BRPOPLPUSH")
                        .arg(source)
                        .arg(destination)
                        .arg(timeout.as_secs_f64()),
                    Some(timeout),
                )
                .await
                .map_err(on_key(source)),
        }
    }

    async fn rpoplpush_many(
        &self,
        source: &str,
        destination: &str,
        count: usize,
    ) -> QueueResult<Vec<String>> {
        let mut pipe = redis::pipe();
        for _ in 0..count {
            pipe.cmd("RPOPLPUSH").arg(source).arg(destination);
        }
        let mut conn = (*self.redis).clone();
        let items: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(on_key(source))?;
        Ok(items.into_iter().flatten().collect())
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> QueueResult<u64> {
        self.query(redis::cmd("LREM").arg(key).arg(count).arg(value))
            .await
            .map_err(on_key(key))
    }

    async fn llen(&self, key: &str) -> QueueResult<u64> {
        self.query(redis::cmd("LLEN").arg(key))
            .await
            .map_err(on_key(key))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> QueueResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop))
            .await
            .map_err(on_key(key))
    }

    async fn get(&self, key: &str) -> QueueResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key))
            .await
            .map_err(on_key(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.query(&cmd).await.map_err(on_key(key))
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = self.query(&cmd).await.map_err(on_key(key))?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> QueueResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys))
            .await
            .map_err(QueueError::from)
    }

    async fn exists(&self, key: &str) -> QueueResult<bool> {
        let count: u64 = self
            .query(redis::cmd("EXISTS").arg(key))
            .await
            .map_err(on_key(key))?;
        Ok(count > 0)
    }

    async fn scan(&self, pattern: &str) -> QueueResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = "0".to_string();
        loop {
            let (next, batch): (String, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(&cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(1000),
                )
                .await?;
            keys.extend(batch);
            if next == "0" {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

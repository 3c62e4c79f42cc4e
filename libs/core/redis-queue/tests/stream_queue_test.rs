//! StreamQueue behaviour against the in-memory store
//!
//! Time-dependent paths (reclaim, discard, idle consumers) share one
//! `ManualClock` between the store and the queues so idle times and the
//! reclaim gate move together.

use redis_queue::{
    ManualClock, MemoryStore, StreamMessage, StreamQueue, StreamQueueOptions,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::{assert_some, assert_stream_id};
use test_utils::TestDataBuilder;
use tokio::sync::watch;

const START_MS: i64 = 1_700_000_000_000;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Self { clock, store }
    }

    fn queue(&self, key: &str, options: StreamQueueOptions) -> StreamQueue {
        StreamQueue::with_options(self.store.clone(), key, options).with_clock(self.clock.clone())
    }

    fn consumer(&self, key: &str, group: &str, consumer: &str) -> StreamQueue {
        self.queue(
            key,
            StreamQueueOptions::new()
                .with_group(group)
                .with_consumer(consumer),
        )
    }

    fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

fn ids(messages: &[StreamMessage]) -> Vec<String> {
    messages.iter().map(|m| m.id.clone()).collect()
}

#[tokio::test]
async fn test_add_then_independent_take() {
    let h = Harness::new();
    let builder = TestDataBuilder::from_test_name("test_add_then_independent_take");
    let queue = h.queue(&builder.key("stream", "events"), StreamQueueOptions::new());

    let id = assert_some(queue.add("hello").await, "add");
    assert_stream_id(&id, "add");

    let message = assert_some(queue.take_one().await, "take_one");
    assert_eq!(message.id, id);
    assert_eq!(message.payload(), Some("hello"));
    assert_eq!(queue.start_id(), id);

    // Cursor moved past the only entry
    assert!(queue.take_one().await.is_none());
}

#[tokio::test]
async fn test_empty_start_id_reads_only_new_entries() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new());
    queue.add("before").await;

    assert!(queue.read("", 10).await.is_empty());
    assert_eq!(queue.read("0-0", 10).await.len(), 1);
}

#[tokio::test]
async fn test_independent_consumer_sees_append_order() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new());

    let mut added = Vec::new();
    for i in 0..5 {
        added.push(assert_some(queue.add(format!("m{i}")).await, "add"));
    }

    let mut taken = ids(&queue.take(2).await);
    taken.extend(ids(&queue.take(10).await));
    assert_eq!(taken, added);
}

#[tokio::test]
async fn test_adds_reports_each_item() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new());
    let builder = TestDataBuilder::new(1);

    let results = queue.adds(builder.payloads("job", 5)).await;
    assert_eq!(results.len(), 5);
    let ids: Vec<String> = results.into_iter().map(|id| assert_some(id, "adds")).collect();
    let mut sorted = ids.clone();
    sorted.sort_by_key(|id| id.parse::<redis_queue::MessageId>().ok());
    assert_eq!(ids, sorted);
    assert_eq!(queue.count().await, 5);

    // Small batches go through single appends
    assert_eq!(queue.adds(["a", "b"]).await.len(), 2);
    assert_eq!(queue.count().await, 7);
    assert!(queue.adds(Vec::<String>::new()).await.is_empty());
}

#[tokio::test]
async fn test_add_json_payload() {
    #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
    struct Order {
        id: u32,
    }

    let h = Harness::new();
    let queue = h.queue("orders", StreamQueueOptions::new());
    queue.add_json(&Order { id: 7 }).await;

    let message = assert_some(queue.take_one().await, "take_one");
    assert_eq!(message.get("orders"), Some(r#"{"id":7}"#));
    assert_eq!(message.json::<Order>().unwrap(), Order { id: 7 });
}

#[tokio::test]
async fn test_explicit_id_must_increase() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new());

    assert_eq!(queue.add_with_id("a", "5-1").await.as_deref(), Some("5-1"));
    assert!(queue.add_with_id("b", "5-1").await.is_none());
    assert!(queue.add_with_id("c", "4-0").await.is_none());
    assert_eq!(queue.count().await, 1);
}

#[tokio::test]
async fn test_thousandth_append_trims_towards_max_length() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new().with_max_length(100));

    for i in 0..999 {
        queue.add(format!("m{i}")).await;
    }
    assert_eq!(queue.count().await, 999);

    queue.add("m999").await;
    let len = queue.count().await;
    assert!(len >= 100, "trimmed below max_length: {len}");
    assert!(len < 200, "trim did not happen: {len}");
}

#[tokio::test]
async fn test_batch_crossing_thousand_trims_on_first_entry() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new().with_max_length(100));
    let builder = TestDataBuilder::new(11);

    let ids = queue.adds(builder.payloads("m", 995)).await;
    assert!(ids.iter().all(Option::is_some));
    assert_eq!(queue.count().await, 995);

    let ids = queue.adds(builder.payloads("n", 10)).await;
    assert_eq!(ids.len(), 10);
    assert!(ids.iter().all(Option::is_some));

    // Trimmed at 996 entries, 800 removed in whole nodes of 100, then nine more
    assert_eq!(queue.count().await, 205);
}

#[tokio::test]
async fn test_set_group_twice_keeps_cursor() {
    let h = Harness::new();
    let queue = h.consumer("events", "workers", "c1");

    assert!(queue.set_group("workers").await);
    queue.add("a").await;
    queue.add("b").await;
    let first = queue.take(1).await;
    assert_eq!(first.len(), 1);

    let before = queue.groups().await;
    assert!(!queue.set_group("workers").await);
    assert_eq!(queue.groups().await, before);
    assert_eq!(before[0].last_delivered_id, first[0].id);

    assert!(!queue.set_group("").await);
}

#[tokio::test]
async fn test_set_group_on_existing_stream_starts_from_beginning() {
    let h = Harness::new();
    let queue = h.consumer("events", "workers", "c1");
    queue.add("early").await;

    assert!(queue.set_group("workers").await);
    let messages = queue.take(10).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload(), Some("early"));
}

#[tokio::test]
async fn test_group_members_own_entries_exclusively() {
    let h = Harness::new();
    let a = h.consumer("events", "workers", "a");
    let b = h.consumer("events", "workers", "b");
    a.set_group("workers").await;
    b.set_group("workers").await;

    a.add("one").await;
    a.add("two").await;

    let got_a = a.take(1).await;
    let got_b = b.take(1).await;
    assert_eq!(got_a.len(), 1);
    assert_eq!(got_b.len(), 1);
    assert_ne!(got_a[0].id, got_b[0].id);
    assert!(a.take(1).await.is_empty());

    let summary = assert_some(a.pending_summary("workers").await, "pending_summary");
    assert_eq!(summary.count, 2);
    assert_eq!(
        summary.consumers,
        vec![("a".to_string(), 1), ("b".to_string(), 1)]
    );

    assert_eq!(a.acknowledge(&ids(&got_a)).await, 1);
    assert_eq!(b.ack("workers", &got_b[0].id).await, 1);
    let summary = assert_some(a.pending_summary("workers").await, "pending_summary");
    assert_eq!(summary.count, 0);
}

#[tokio::test]
async fn test_unacked_entry_is_reclaimed_after_retry_interval() {
    let h = Harness::new();
    let crashed = h.consumer("events", "workers", "crashed");
    let survivor = h.consumer("events", "workers", "survivor");
    crashed.set_group("workers").await;

    let id = assert_some(crashed.add("job").await, "add");
    assert_eq!(ids(&crashed.take(1).await), vec![id.clone()]);

    // Not idle long enough yet
    let report = assert_some(survivor.retry_ack().await, "first sweep");
    assert_eq!(report.claimed, 0);

    h.advance_secs(61);
    let retried = h.consumer("events", "workers", "survivor");
    let report = assert_some(retried.retry_ack().await, "second sweep");
    assert_eq!(report.claimed, 1);

    let pending = retried.pending("workers", None, None, None).await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consumer, "survivor");
    assert_eq!(pending[0].delivery_count, 2);

    let history = retried
        .read_group_block("workers", "survivor", 10, 0, Some("0"))
        .await;
    assert_eq!(ids(&history), vec![id]);
}

#[tokio::test]
async fn test_blocking_take_returns_reclaimed_history() {
    let h = Harness::new();
    let crashed = h.consumer("events", "workers", "crashed");
    crashed.set_group("workers").await;
    let id = assert_some(crashed.add("job").await, "add");
    crashed.take(1).await;

    h.advance_secs(61);
    let survivor = h.consumer("events", "workers", "survivor");
    let messages = survivor.take_message_block(1, 1).await;
    assert_eq!(ids(&messages), vec![id]);
}

#[tokio::test]
async fn test_entry_discarded_after_max_retry() {
    let h = Harness::new();
    let queue = h.queue(
        "events",
        StreamQueueOptions::new()
            .with_group("workers")
            .with_consumer("c1")
            .with_max_retry(1),
    );
    queue.set_group("workers").await;
    queue.add("poison").await;
    queue.take(1).await;

    h.advance_secs(61);
    let report = assert_some(queue.retry_ack().await, "claim sweep");
    assert_eq!((report.claimed, report.discarded), (1, 0));

    h.advance_secs(61);
    let report = assert_some(queue.retry_ack().await, "discard sweep");
    assert_eq!((report.claimed, report.discarded), (0, 1));

    assert!(queue.pending("workers", None, None, None).await.is_empty());
    // Discarding acknowledges, it does not delete
    assert_eq!(queue.count().await, 1);
}

#[tokio::test]
async fn test_retry_ack_runs_once_per_interval() {
    let h = Harness::new();
    let queue = h.consumer("events", "workers", "c1");
    queue.set_group("workers").await;

    assert!(queue.retry_ack().await.is_some());
    assert!(queue.retry_ack().await.is_none());
    h.advance_secs(60);
    assert!(queue.retry_ack().await.is_some());

    let independent = h.queue("events", StreamQueueOptions::new());
    assert!(independent.retry_ack().await.is_none());
}

#[tokio::test]
async fn test_idle_consumers_are_removed() {
    let h = Harness::new();
    let queue = h.consumer("events", "workers", "c1");
    queue.set_group("workers").await;
    queue.add("a").await;
    let taken = queue.take(1).await;
    queue.acknowledge(&ids(&taken)).await;
    assert_eq!(queue.consumers("workers").await.len(), 1);

    h.advance_secs(3_601);
    let report = assert_some(queue.retry_ack().await, "sweep");
    assert_eq!(report.consumers_removed, 1);
    assert!(queue.consumers("workers").await.is_empty());
}

#[tokio::test]
async fn test_from_last_offset_skips_backlog_once() {
    let h = Harness::new();
    let producer = h.queue("events", StreamQueueOptions::new());
    producer.add("old").await;

    let queue = h.queue(
        "events",
        StreamQueueOptions::new()
            .with_group("workers")
            .with_consumer("c1")
            .with_from_last_offset(true),
    );
    assert!(queue.set_group("workers").await);
    assert!(queue.read_group("workers", "c1", 10).await.is_empty());

    producer.add("new").await;
    let messages = queue.read_group("workers", "c1", 10).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].payload(), Some("new"));

    // The cursor is only moved once per instance
    producer.add("newer").await;
    assert_eq!(queue.read_group("workers", "c1", 10).await.len(), 1);
}

#[tokio::test]
async fn test_group_administration() {
    let h = Harness::new();
    let queue = h.consumer("events", "workers", "c1");

    assert!(queue.group_create("audit", None).await);
    assert!(!queue.group_create("audit", None).await);
    queue.add("a").await;
    assert!(queue.group_set_id("audit", None).await);
    assert!(queue.read_group("audit", "c1", 10).await.is_empty());

    assert!(queue.group_set_id("audit", Some("0")).await);
    assert_eq!(queue.read_group("audit", "c1", 10).await.len(), 1);
    assert_eq!(queue.group_delete_consumer("audit", "c1").await, 1);
    assert_eq!(queue.group_delete_consumer("", "c1").await, 0);

    assert!(queue.group_destroy("audit").await);
    assert!(queue.groups().await.is_empty());
    assert!(queue.read_group("audit", "c1", 10).await.is_empty());
}

#[tokio::test]
async fn test_claim_requires_idle_time() {
    let h = Harness::new();
    let a = h.consumer("events", "workers", "a");
    a.set_group("workers").await;
    let id = assert_some(a.add("job").await, "add");
    a.take(1).await;

    assert!(a.claim("workers", "b", &id, 10_000).await.is_empty());
    h.advance_secs(11);
    assert_eq!(ids(&a.claim("workers", "b", &id, 10_000).await), vec![id.clone()]);

    let pending = a.pending("workers", Some(&id), Some(&id), Some(1)).await;
    assert_eq!(pending[0].consumer, "b");
}

#[tokio::test]
async fn test_trim_delete_and_ranges() {
    let h = Harness::new();
    let queue = h.queue("events", StreamQueueOptions::new());

    let first = assert_some(queue.add("a").await, "add");
    h.advance_secs(1);
    let second = assert_some(queue.add("b").await, "add");
    h.advance_secs(1);
    queue.add("c").await;

    let span = queue
        .range_time_span(START_MS as u64, START_MS as u64 + 500, None)
        .await;
    assert_eq!(ids(&span), vec![first.clone()]);

    assert_eq!(queue.range(None, None, Some(2)).await.len(), 2);
    assert_eq!(queue.delete(&[second]).await, 1);
    assert_eq!(queue.count().await, 2);

    assert_eq!(queue.trim(1).await, 1);
    let info = assert_some(queue.info().await, "info");
    assert_eq!(info.length, 1);
    let first = info.first_entry.and_then(|m| m.payload().map(str::to_string));
    assert_eq!(first.as_deref(), Some("c"));
    assert!(!queue.is_empty().await);
}

#[tokio::test]
async fn test_consume_block_acknowledges_handled_batches() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(StreamQueue::with_options(
        store,
        "events",
        StreamQueueOptions::new()
            .with_group("workers")
            .with_consumer("c1")
            .with_block_time(Duration::from_millis(200)),
    ));
    queue.add("one").await;
    queue.add("two").await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = queue.consume_block(shutdown_rx, move |batch: &[StreamMessage]| {
        let mut seen = sink.lock().unwrap();
        seen.extend(batch.iter().filter_map(|m| m.payload().map(str::to_string)));
        true
    });

    for _ in 0..50 {
        if seen.lock().unwrap().len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("consume loop did not stop")
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    let summary = assert_some(queue.pending_summary("workers").await, "pending_summary");
    assert_eq!(summary.count, 0);
}

#[tokio::test]
async fn test_consume_block_leaves_declined_batches_pending() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(StreamQueue::with_options(
        store,
        "events",
        StreamQueueOptions::new()
            .with_group("workers")
            .with_consumer("c1")
            .with_block_time(Duration::from_millis(100)),
    ));
    queue.add("one").await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = queue.consume_block(shutdown_rx, |_: &[StreamMessage]| false);

    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(shutdown_tx);
    tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("consume loop did not stop")
        .unwrap();

    let summary = assert_some(queue.pending_summary("workers").await, "pending_summary");
    assert_eq!(summary.count, 1);
}

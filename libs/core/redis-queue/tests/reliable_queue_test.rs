//! ReliableQueue behaviour against the in-memory store

use redis_queue::{LogStore, ManualClock, MemoryStore, ReliableQueue, ReliableQueueOptions, QueueStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::assertions::assert_some;
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

    fn queue(&self, key: &str) -> ReliableQueue {
        ReliableQueue::with_options(self.store.clone(), key, ReliableQueueOptions::new())
            .with_clock(self.clock.clone())
    }

    fn advance_secs(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

#[tokio::test]
async fn test_items_are_taken_in_push_order() {
    let h = Harness::new();
    let queue = h.queue("jobs");

    assert_eq!(queue.add(["a", "b"]).await, 2);
    assert_eq!(queue.add(["c"]).await, 3);

    assert_eq!(queue.take_one(None).await.as_deref(), Some("a"));
    assert_eq!(queue.take_one(None).await.as_deref(), Some("b"));
    assert_eq!(queue.count().await, 1);
    assert_eq!(queue.ack_count().await, 2);

    assert_eq!(queue.acknowledge(&["a", "b"]).await, 2);
    assert_eq!(queue.ack_count().await, 0);
    assert_eq!(queue.acknowledge(&["a"]).await, 0);

    let status = queue.status();
    assert_eq!((status.consumes, status.acks), (2, 2));
}

#[tokio::test]
async fn test_batch_take_uses_ack_list() {
    let h = Harness::new();
    let queue = h.queue("jobs");
    let builder = TestDataBuilder::new(3);

    queue.add(builder.payloads("job", 6)).await;

    // Above min_pipeline: one round trip
    let batch = queue.take(4).await;
    assert_eq!(batch, vec!["job-0", "job-1", "job-2", "job-3"]);

    // At or below min_pipeline: item by item, stops when empty
    let rest = queue.take(3).await;
    assert_eq!(rest, vec!["job-4", "job-5"]);

    assert!(queue.is_empty().await);
    assert_eq!(queue.ack_count().await, 6);
    assert!(queue.take(0).await.is_empty());
}

#[tokio::test]
async fn test_blocking_take_waits_for_push() {
    let queue = Arc::new(ReliableQueue::new(Arc::new(MemoryStore::new()), "jobs"));

    let waiter = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.take_one(Some(Duration::from_secs(5))).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.add(["late"]).await;

    let item = waiter.await.unwrap();
    assert_eq!(item.as_deref(), Some("late"));
}

#[tokio::test]
async fn test_blocking_take_times_out() {
    let queue = ReliableQueue::new(Arc::new(MemoryStore::new()), "jobs");
    assert!(queue.take_one(Some(Duration::from_millis(100))).await.is_none());
}

#[tokio::test]
async fn test_retry_ack_rolls_back_own_ack_list() {
    let h = Harness::new();
    let queue = h.queue("jobs");
    queue.add(["a", "b"]).await;
    queue.take_one(None).await;
    assert_eq!(queue.ack_count().await, 1);

    // Rate-limited until the interval has passed
    assert!(queue.retry_ack().await.is_none());

    h.advance_secs(61);
    assert_eq!(queue.retry_ack().await, Some(1));
    assert_eq!(queue.ack_count().await, 0);
    assert_eq!(queue.count().await, 2);

    let stored = assert_some(h.store.get(&queue.status_key()).await.unwrap(), "status");
    let status = QueueStatus::from_json(&stored).unwrap();
    assert_eq!(status.key, queue.status().key);
    assert_eq!(status.last_active, START_MS + 61_000);
}

#[tokio::test]
async fn test_crashed_consumer_items_return_within_one_sweep() {
    let h = Harness::new();
    let crashed = h.queue("jobs");
    crashed.add(["job"]).await;
    assert_eq!(crashed.take_one(None).await.as_deref(), Some("job"));
    let crashed_status = crashed.status_key();
    let crashed_ack = crashed.ack_key();
    drop(crashed);

    let survivor = h.queue("jobs");
    h.advance_secs(71);
    assert_eq!(survivor.retry_ack().await, Some(1));

    assert_eq!(survivor.count().await, 1);
    assert!(!h.store.exists(&crashed_status).await.unwrap());
    assert!(!h.store.exists(&crashed_ack).await.unwrap());
    assert_eq!(survivor.take_one(None).await.as_deref(), Some("job"));
}

#[tokio::test]
async fn test_live_consumer_is_left_alone() {
    let h = Harness::new();
    let busy = h.queue("jobs");
    busy.add(["job"]).await;
    busy.take_one(None).await;

    // Past the lease but within the heartbeat grace period
    h.advance_secs(65);
    let other = h.queue("jobs");
    assert_eq!(other.retry_ack().await, Some(0));
    assert_eq!(busy.ack_count().await, 1);
}

#[tokio::test]
async fn test_sweep_lease_allows_one_winner() {
    let h = Harness::new();
    let first = h.queue("jobs");
    let second = h.queue("jobs");

    // Orphaned ack list with no heartbeat record
    h.store
        .lpush("jobs:Ack:deadbeef", &["lost".to_string()])
        .await
        .unwrap();

    assert_eq!(first.retry_ack().await, Some(1));
    // The lease is held, so the second instance only handles its own list
    h.store
        .lpush("jobs:Ack:cafebabe", &["lost-too".to_string()])
        .await
        .unwrap();
    assert_eq!(second.retry_ack().await, Some(0));
    assert_eq!(first.count().await, 1);

    h.advance_secs(60);
    assert_eq!(second.retry_ack().await, Some(1));
    assert_eq!(first.count().await, 2);
}

#[tokio::test]
async fn test_rollback_ack_drains_list() {
    let h = Harness::new();
    let queue = h.queue("jobs");
    h.store
        .lpush("elsewhere", &["x".to_string(), "y".to_string()])
        .await
        .unwrap();

    let moved = queue.rollback_ack("elsewhere", "jobs").await;
    assert_eq!(moved, vec!["x", "y"]);
    assert_eq!(queue.count().await, 2);
    assert!(queue.rollback_ack("elsewhere", "jobs").await.is_empty());
}

#[tokio::test]
async fn test_add_json_and_update_status() {
    let h = Harness::new();
    let queue = h.queue("jobs");

    assert_eq!(queue.add_json(&serde_json::json!({"id": 1})).await, 1);
    assert_eq!(queue.take_one(None).await.as_deref(), Some(r#"{"id":1}"#));

    assert!(queue.update_status().await);
    assert!(h.store.exists(&queue.status_key()).await.unwrap());
}

#[tokio::test]
async fn test_consume_removes_handled_items() {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(ReliableQueue::with_options(
        store,
        "jobs",
        ReliableQueueOptions::new().with_block_time(Duration::from_millis(200)),
    ));
    queue.add(["one", "two"]).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = queue.consume(shutdown_rx, move |batch: &[String]| {
        sink.lock().unwrap().extend(batch.iter().cloned());
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
    assert_eq!(queue.ack_count().await, 0);
    assert_eq!(queue.status().acks, 2);
}

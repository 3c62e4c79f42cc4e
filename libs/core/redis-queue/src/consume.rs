//! Cancellable consume loop shared by both queue kinds.
//!
//! ```text
//! Polling --(messages)--> Processing --(handled)--> Polling
//!    |                                                 |
//!    +------------------ shutdown ---------------------+--> Cancelled
//! ```
//!
//! The shutdown flag is checked at the top of every iteration and while
//! sleeping after an empty poll. A blocking read already in flight runs to
//! its timeout before the flag is seen.

use crate::error::QueueResult;
use crate::retry::ErrorBackoff;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a poll that returned nothing.
pub const IDLE_SLEEP: Duration = Duration::from_millis(1000);

/// Processes a batch of delivered messages.
///
/// Returning `true` acknowledges the whole batch; `false` leaves it for
/// redelivery. Plain closures `Fn(&[T]) -> bool` implement this trait.
#[async_trait]
pub trait MessageHandler<T: Sync>: Send + Sync {
    async fn handle(&self, messages: &[T]) -> bool;
}

#[async_trait]
impl<T, F> MessageHandler<T> for F
where
    T: Sync + 'static,
    F: Fn(&[T]) -> bool + Send + Sync,
{
    async fn handle(&self, messages: &[T]) -> bool {
        self(messages)
    }
}

/// A queue the consume loop can drive.
#[async_trait]
pub trait Consumable: Send + Sync + 'static {
    type Item: Send + Sync + 'static;

    /// Queue key, for logging
    fn name(&self) -> &str;

    /// Timeout of each blocking poll
    fn block_time(&self) -> Duration;

    /// One-time setup before the first poll
    async fn prepare(&self) -> QueueResult<()> {
        Ok(())
    }

    /// Blocking poll for the next batch
    async fn poll(&self, timeout: Duration) -> QueueResult<Vec<Self::Item>>;

    /// Acknowledge a batch the handler accepted
    async fn settle(&self, items: &[Self::Item]) -> QueueResult<u64>;
}

/// Polling driver around a [`Consumable`] queue.
pub struct ConsumeLoop<Q: Consumable, H> {
    queue: Arc<Q>,
    handler: H,
    shutdown: watch::Receiver<bool>,
    idle_sleep: Duration,
}

impl<Q, H> ConsumeLoop<Q, H>
where
    Q: Consumable,
    H: MessageHandler<Q::Item> + 'static,
{
    pub fn new(queue: Arc<Q>, handler: H, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            queue,
            handler,
            shutdown,
            idle_sleep: IDLE_SLEEP,
        }
    }

    /// Override the pause after an empty poll
    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    /// Run on a new task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until the shutdown flag is set or its sender is dropped.
    pub async fn run(mut self) {
        let queue = self.queue.name().to_string();
        info!(
            queue = %queue,
            block_time_ms = self.queue.block_time().as_millis() as u64,
            "Starting consume loop"
        );

        if let Err(e) = self.queue.prepare().await {
            warn!(queue = %queue, error = %e, "Consume loop setup failed, polling anyway");
        }

        let mut backoff = ErrorBackoff::new();

        loop {
            if self.stopping() {
                info!(queue = %queue, "Received shutdown signal, stopping consume loop");
                break;
            }

            let batch = match self.queue.poll(self.queue.block_time()).await {
                Ok(batch) => {
                    let recovered = backoff.record_success();
                    if recovered > 0 {
                        info!(queue = %queue, "Store recovered after {} errors", recovered);
                    }
                    batch
                }
                Err(e) => {
                    let delay = backoff.record_failure();
                    warn!(
                        queue = %queue,
                        error = %e,
                        category = ?e.category(),
                        consecutive_errors = backoff.consecutive_errors(),
                        backoff_ms = delay.as_millis() as u64,
                        "Poll failed, backing off"
                    );
                    if self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if self.pause(self.idle_sleep).await {
                    break;
                }
                continue;
            }

            if self.handler.handle(&batch).await {
                match self.queue.settle(&batch).await {
                    Ok(n) => debug!(queue = %queue, acked = n, "Batch acknowledged"),
                    Err(e) => warn!(queue = %queue, error = %e, "Failed to acknowledge batch"),
                }
            } else {
                debug!(queue = %queue, count = batch.len(), "Handler declined batch, leaving it pending");
            }
        }

        info!(queue = %queue, "Consume loop stopped");
    }

    /// Shutdown was requested or every sender is gone.
    fn stopping(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Sleep unless shutdown arrives first; returns true when stopping.
    async fn pause(&mut self, duration: Duration) -> bool {
        tokio::select! {
            changed = self.shutdown.changed() => {
                changed.is_err() || *self.shutdown.borrow()
            }
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted poll results, then reports nothing.
    struct ScriptedQueue {
        polls: Mutex<VecDeque<QueueResult<Vec<u32>>>>,
        settled: Mutex<Vec<u32>>,
    }

    impl ScriptedQueue {
        fn new(polls: Vec<QueueResult<Vec<u32>>>) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(polls.into()),
                settled: Mutex::new(vec![]),
            })
        }

        fn settled(&self) -> Vec<u32> {
            self.settled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Consumable for ScriptedQueue {
        type Item = u32;

        fn name(&self) -> &str {
            "scripted"
        }

        fn block_time(&self) -> Duration {
            Duration::from_millis(10)
        }

        async fn poll(&self, _timeout: Duration) -> QueueResult<Vec<u32>> {
            self.polls.lock().unwrap().pop_front().unwrap_or(Ok(vec![]))
        }

        async fn settle(&self, items: &[u32]) -> QueueResult<u64> {
            self.settled.lock().unwrap().extend_from_slice(items);
            Ok(items.len() as u64)
        }
    }

    async fn run_until_idle(queue: Arc<ScriptedQueue>, handler: impl MessageHandler<u32> + 'static) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ConsumeLoop::new(queue, handler, shutdown_rx)
            .with_idle_sleep(Duration::from_millis(10))
            .spawn();

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_accepted_batches_are_settled() {
        let queue = ScriptedQueue::new(vec![Ok(vec![1, 2]), Ok(vec![]), Ok(vec![3])]);
        run_until_idle(queue.clone(), |_: &[u32]| true).await;
        assert_eq!(queue.settled(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_declined_batches_are_not_settled() {
        let queue = ScriptedQueue::new(vec![Ok(vec![1]), Ok(vec![2])]);
        run_until_idle(queue.clone(), |batch: &[u32]| batch[0] == 2).await;
        assert_eq!(queue.settled(), vec![2]);
    }

    #[tokio::test]
    async fn test_stops_when_sender_dropped() {
        let queue = ScriptedQueue::new(vec![Ok(vec![1])]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ConsumeLoop::new(queue.clone(), |_: &[u32]| true, shutdown_rx)
            .with_idle_sleep(Duration::from_millis(10))
            .spawn();

        drop(shutdown_tx);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_poll_errors_back_off_and_recover() {
        let queue = ScriptedQueue::new(vec![
            Err(QueueError::Store("connection reset".to_string())),
            Ok(vec![7]),
        ]);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ConsumeLoop::new(queue.clone(), |_: &[u32]| true, shutdown_rx)
            .with_idle_sleep(Duration::from_millis(10))
            .spawn();

        // First backoff step is one second
        tokio::time::sleep(Duration::from_millis(1300)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
        assert_eq!(queue.settled(), vec![7]);
    }
}

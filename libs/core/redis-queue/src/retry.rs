//! Retry and rate-limiting helpers shared by both queue kinds.
//!
//! - `SendRetry`: fixed-delay retry of a producer write
//! - `RetryGate`: "at most once per interval" gate for dead-letter sweeps
//! - `ErrorBackoff`: exponential backoff for consume loops hitting store errors

use crate::clock::Clock;
use crate::error::{ErrorCategory, QueueResult};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Fixed-interval retry budget for producer writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRetry {
    /// Total number of attempts (at least one attempt is always made)
    pub times: u32,
    /// Delay between attempts
    pub interval: Duration,
}

impl Default for SendRetry {
    fn default() -> Self {
        Self {
            times: 3,
            interval: Duration::from_millis(1000),
        }
    }
}

impl SendRetry {
    pub fn new(times: u32, interval: Duration) -> Self {
        Self { times, interval }
    }

    /// Run `operation` until `should_retry` rejects its result or the budget
    /// runs out. The last result is returned either way.
    pub async fn run<T, F, Fut, P>(&self, mut operation: F, should_retry: P) -> QueueResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = QueueResult<T>>,
        P: Fn(&QueueResult<T>) -> bool,
    {
        let attempts = self.times.max(1);
        let mut attempt = 1;

        loop {
            let result = operation().await;
            if attempt >= attempts || !should_retry(&result) {
                return result;
            }

            debug!(
                attempt = attempt,
                max_attempts = attempts,
                interval_ms = self.interval.as_millis() as u64,
                "Send not confirmed, retrying"
            );
            tokio::time::sleep(self.interval).await;
            attempt += 1;
        }
    }
}

/// Lets a caller through at most once per interval.
///
/// State is owned by a single queue instance, so independent queues in one
/// process never throttle each other.
#[derive(Debug)]
pub struct RetryGate {
    interval_ms: i64,
    next_at_ms: AtomicI64,
}

impl RetryGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            next_at_ms: AtomicI64::new(i64::MIN),
        }
    }

    /// Returns true if the interval has elapsed; the next window starts now.
    pub fn try_enter(&self, clock: &dyn Clock) -> bool {
        let now = clock.now_ms();
        let next = self.next_at_ms.load(Ordering::SeqCst);
        if next > now {
            return false;
        }

        self.next_at_ms
            .compare_exchange(
                next,
                now.saturating_add(self.interval_ms),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Forget the current window so the next `try_enter` passes.
    pub fn reset(&self) {
        self.next_at_ms.store(i64::MIN, Ordering::SeqCst);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(0) as u64)
    }
}

/// Exponential backoff driven by consecutive store failures.
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    consecutive_errors: u32,
}

impl ErrorBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn record_failure(&mut self) -> Duration {
        let delay = ErrorCategory::Transient.backoff_delay_ms(self.consecutive_errors.min(5));
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        Duration::from_millis(delay)
    }

    /// Record a success; returns how many failures preceded it.
    pub fn record_success(&mut self) -> u32 {
        std::mem::take(&mut self.consecutive_errors)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::QueueError;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_retry_gate_once_per_interval() {
        let clock = ManualClock::new(10_000);
        let gate = RetryGate::new(Duration::from_secs(60));

        assert!(gate.try_enter(&clock));
        assert!(!gate.try_enter(&clock));

        clock.advance(Duration::from_secs(59));
        assert!(!gate.try_enter(&clock));

        clock.advance(Duration::from_secs(1));
        assert!(gate.try_enter(&clock));
    }

    #[test]
    fn test_retry_gate_reset() {
        let clock = ManualClock::new(0);
        let gate = RetryGate::new(Duration::from_secs(60));

        assert!(gate.try_enter(&clock));
        gate.reset();
        assert!(gate.try_enter(&clock));
    }

    #[test]
    fn test_error_backoff() {
        let mut backoff = ErrorBackoff::new();
        assert_eq!(backoff.record_failure(), Duration::from_secs(1));
        assert_eq!(backoff.record_failure(), Duration::from_secs(2));
        assert_eq!(backoff.record_failure(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.record_failure();
        }
        assert_eq!(backoff.record_failure(), Duration::from_secs(30));
        assert_eq!(backoff.record_success(), 14);
        assert_eq!(backoff.consecutive_errors(), 0);
    }

    #[tokio::test]
    async fn test_send_retry_stops_when_confirmed() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retry = SendRetry::new(3, Duration::from_millis(1));

        let result = retry
            .run(
                || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, QueueError>(if n == 0 { None } else { Some(n) })
                },
                |r| matches!(r, Ok(None)),
            )
            .await
            .unwrap();

        assert_eq!(result, Some(1));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_send_retry_exhausts_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retry = SendRetry::new(3, Duration::from_millis(1));

        let result: Option<u32> = retry
            .run(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, QueueError>(None)
                },
                |r| matches!(r, Ok(None)),
            )
            .await
            .unwrap();

        assert_eq!(result, None);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_send_retry_does_not_retry_rejected_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let retry = SendRetry::default();

        let result: QueueResult<Option<u32>> = retry
            .run(
                || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(QueueError::invalid("bad id"))
                },
                |r| matches!(r, Ok(None)),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

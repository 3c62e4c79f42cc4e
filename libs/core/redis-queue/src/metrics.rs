//! Prometheus metrics for queues
//!
//! Every series is labelled with the queue key and its kind (`stream` or
//! `reliable`). Without an installed recorder the macros are no-ops.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call once at startup; later calls are no-ops. Returns false when another
/// recorder is already installed.
pub fn init_metrics() -> bool {
    PROMETHEUS_HANDLE
        .get_or_try_init(|| {
            let handle = PrometheusBuilder::new().install_recorder()?;
            info!("Prometheus metrics initialized");
            Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
        })
        .map_err(|e| warn!(error = %e, "Failed to install Prometheus recorder"))
        .is_ok()
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Queue kind label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Stream,
    Reliable,
}

impl QueueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Stream => "stream",
            QueueKind::Reliable => "reliable",
        }
    }
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    queue: String,
    kind: QueueKind,
}

impl QueueMetrics {
    pub fn new(queue: impl Into<String>, kind: QueueKind) -> Self {
        Self {
            queue: queue.into(),
            kind,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    fn count(&self, name: &'static str, n: u64) {
        if n == 0 {
            return;
        }
        counter!(
            name,
            "queue" => self.queue.clone(),
            "kind" => self.kind.as_str()
        )
        .increment(n);
    }

    /// Messages written
    pub fn added(&self, n: u64) {
        self.count("redis_queue_messages_added_total", n);
    }

    /// Writes that were not confirmed after all retries
    pub fn add_failed(&self) {
        self.count("redis_queue_add_failures_total", 1);
    }

    /// Messages handed to consumers
    pub fn consumed(&self, n: u64) {
        self.count("redis_queue_messages_consumed_total", n);
    }

    /// Messages acknowledged
    pub fn acked(&self, n: u64) {
        self.count("redis_queue_messages_acked_total", n);
    }

    /// Pending entries reclaimed by this consumer
    pub fn claimed(&self, n: u64) {
        self.count("redis_queue_messages_claimed_total", n);
    }

    /// Entries dropped after exhausting their delivery budget
    pub fn discarded(&self, n: u64) {
        self.count("redis_queue_messages_discarded_total", n);
    }

    /// In-flight items returned to the main list
    pub fn rolled_back(&self, n: u64) {
        self.count("redis_queue_messages_rolled_back_total", n);
    }

    /// Approximate trims issued
    pub fn trimmed(&self) {
        self.count("redis_queue_trims_total", 1);
    }

    /// Idle consumers removed from a group
    pub fn consumers_removed(&self, n: u64) {
        self.count("redis_queue_consumers_removed_total", n);
    }

    /// Current queue length
    pub fn depth(&self, len: u64) {
        gauge!(
            "redis_queue_depth",
            "queue" => self.queue.clone(),
            "kind" => self.kind.as_str()
        )
        .set(len as f64);
    }
}

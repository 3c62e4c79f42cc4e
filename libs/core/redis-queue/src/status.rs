//! Heartbeat record of a reliable-queue consumer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Consumer heartbeat stored at `{key}:Status:{status.key}`.
///
/// Field names are PascalCase on the wire so records written by other
/// producers of the same keys stay readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueStatus {
    /// Random identifier of the consumer instance
    pub key: String,
    pub machine_name: String,
    #[serde(default)]
    pub user_name: String,
    pub process_id: u32,
    #[serde(default)]
    pub ip: String,
    /// Creation time, epoch milliseconds
    pub create_time: i64,
    /// Last heartbeat, epoch milliseconds
    pub last_active: i64,
    #[serde(default)]
    pub consumes: i64,
    #[serde(default)]
    pub acks: i64,
}

impl QueueStatus {
    /// Fresh record for this process with a random 8-character key.
    pub fn create(now_ms: i64) -> Self {
        Self {
            key: random_key(),
            machine_name: core_config::hostname(),
            user_name: core_config::user_name(),
            process_id: std::process::id(),
            ip: String::new(),
            create_time: now_ms,
            last_active: now_ms,
            consumes: 0,
            acks: 0,
        }
    }

    /// Whether the owner has missed its heartbeat window.
    pub fn is_stale(&self, now_ms: i64, grace_ms: i64) -> bool {
        self.last_active.saturating_add(grace_ms) < now_ms
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

fn random_key() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

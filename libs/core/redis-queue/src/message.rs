//! Stream ids and delivered messages.

use crate::error::QueueError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::fmt;
use std::str::FromStr;

/// Compound stream id `(milliseconds, sequence)`, rendered `"<ms>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MessageId {
    pub ms: u64,
    pub seq: u64,
}

impl MessageId {
    pub const MIN: MessageId = MessageId { ms: 0, seq: 0 };
    pub const MAX: MessageId = MessageId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The smallest id strictly greater than this one.
    pub fn successor(&self) -> Option<MessageId> {
        if self.seq < u64::MAX {
            Some(MessageId::new(self.ms, self.seq + 1))
        } else if self.ms < u64::MAX {
            Some(MessageId::new(self.ms + 1, 0))
        } else {
            None
        }
    }

    /// The largest id strictly smaller than this one.
    pub fn predecessor(&self) -> Option<MessageId> {
        if self.seq > 0 {
            Some(MessageId::new(self.ms, self.seq - 1))
        } else if self.ms > 0 {
            Some(MessageId::new(self.ms - 1, u64::MAX))
        } else {
            None
        }
    }

    /// Parse a range bound: `-`, `+`, `<ms>`, `<ms>-<seq>` or exclusive `(<id>`.
    ///
    /// A bare `<ms>` expands to `<ms>-0` for a start bound and `<ms>-MAX` for
    /// an end bound. Returns `None` when an exclusive bound leaves nothing.
    pub fn parse_bound(raw: &str, is_start: bool) -> Result<Option<MessageId>, QueueError> {
        match raw {
            "-" => return Ok(Some(MessageId::MIN)),
            "+" => return Ok(Some(MessageId::MAX)),
            _ => {}
        }

        let (exclusive, body) = match raw.strip_prefix('(') {
            Some(rest) => (true, rest),
            None => (false, raw),
        };

        let id = if body.contains('-') {
            body.parse::<MessageId>()?
        } else {
            let ms = body
                .parse::<u64>()
                .map_err(|_| QueueError::InvalidId(raw.to_string()))?;
            if is_start {
                MessageId::new(ms, 0)
            } else {
                MessageId::new(ms, u64::MAX)
            }
        };

        if !exclusive {
            return Ok(Some(id));
        }
        Ok(if is_start {
            id.successor()
        } else {
            id.predecessor()
        })
    }

    /// Creation time encoded in the id.
    pub fn timestamp(&self) -> DateTime<Utc> {
        i64::try_from(self.ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for MessageId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms
            .parse::<u64>()
            .map_err(|_| QueueError::InvalidId(s.to_string()))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| QueueError::InvalidId(s.to_string()))?;
        Ok(MessageId { ms, seq })
    }
}

/// A stream entry as returned by reads, claims and ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Stream entry id (e.g., "1234567890123-0")
    pub id: String,
    /// Field/value pairs (insertion order in memory, by field name from Redis)
    pub fields: Vec<(String, String)>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>, fields: Vec<(String, String)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Value of the named field.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == field)
            .map(|(_, v)| v.as_str())
    }

    /// The payload of a single-field message, whatever the field is named.
    pub fn payload(&self) -> Option<&str> {
        self.fields.first().map(|(_, v)| v.as_str())
    }

    /// Deserialize a JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        let raw = self
            .payload()
            .ok_or_else(|| QueueError::Serialization(format!("message {} has no payload", self.id)))?;
        Ok(serde_json::from_str(raw)?)
    }

    /// Parsed id, if well formed.
    pub fn message_id(&self) -> Option<MessageId> {
        self.id.parse().ok()
    }

    /// When the entry was appended (parsed from the id).
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.message_id()
            .map(|id| id.timestamp())
            .unwrap_or_else(Utc::now)
    }

    /// Age in milliseconds.
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.timestamp()).num_milliseconds()
    }
}

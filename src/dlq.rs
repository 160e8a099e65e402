//! Dead-letter path for messages that exhausted their redeliveries.
//!
//! When a delivery's count exceeds `max_redeliveries`, the dispatcher
//! routes it through a [`DeadLetterSink`] and acknowledges it so it stops
//! circulating. The Redis sink appends to a per-API stream
//! (`axon:dead:<api_name>`) for manual investigation and potential replay.
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::dlq::RedisDeadLetterQueue;
//!
//! let dlq = RedisDeadLetterQueue::new(redis_pool);
//! let failed = dlq.list("store", 10, 0).await?;
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::message::Kwargs;
use crate::transport::TransportError;

/// Maximum entries to keep per dead-letter stream (older entries are trimmed)
const DEAD_LETTER_MAX_LEN: usize = 10_000;

/// What kind of envelope was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterKind {
    Rpc,
    Event,
}

impl DeadLetterKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Rpc => "rpc",
            Self::Event => "event",
        }
    }
}

/// A message that exhausted its redeliveries.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub kind: DeadLetterKind,
    pub api_name: String,
    pub member: String,
    pub message_id: String,
    pub kwargs: Kwargs,
    pub error: String,
    pub delivery_count: u32,
    pub native_id: Option<String>,
}

/// Destination for dead-lettered messages.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn dead_letter(&self, entry: DeadLetter) -> Result<(), TransportError>;
}

pub(crate) fn dead_letter_key(api_name: &str) -> String {
    format!("axon:dead:{api_name}")
}

/// Dead-letter streams on Redis, one per API.
#[derive(Clone)]
pub struct RedisDeadLetterQueue {
    pool: Pool,
}

impl RedisDeadLetterQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Number of dead-lettered entries for one API.
    pub async fn count(&self, api_name: &str) -> Result<u64, TransportError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let count: u64 = cmd("XLEN")
            .arg(dead_letter_key(api_name))
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(e.to_string()))?;

        Ok(count)
    }

    /// List dead-lettered entries for one API as (stream id, fields) pairs.
    pub async fn list(
        &self,
        api_name: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<(String, Value)>, TransportError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(dead_letter_key(api_name))
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(e.to_string()))?;

        let result = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| {
                let mut obj = serde_json::Map::new();
                for (key, value) in fields {
                    if key == "kwargs" {
                        match serde_json::from_str::<Value>(&value) {
                            Ok(parsed) => obj.insert(key, parsed),
                            Err(_) => obj.insert(key, Value::String(value)),
                        };
                    } else if key == "delivery_count" {
                        match value.parse::<u32>() {
                            Ok(n) => obj.insert(key, Value::from(n)),
                            Err(_) => obj.insert(key, Value::String(value)),
                        };
                    } else {
                        obj.insert(key, Value::String(value));
                    }
                }
                (id, Value::Object(obj))
            })
            .collect();

        Ok(result)
    }

    /// Remove an entry after manual review or replay.
    pub async fn remove(&self, api_name: &str, id: &str) -> Result<bool, TransportError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let removed: u64 = cmd("XDEL")
            .arg(dead_letter_key(api_name))
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, api = %api_name, "Removed dead-lettered entry");
            Ok(true)
        } else {
            debug!(id = %id, api = %api_name, "Entry not found in dead-letter stream");
            Ok(false)
        }
    }
}

#[async_trait]
impl DeadLetterSink for RedisDeadLetterQueue {
    async fn dead_letter(&self, entry: DeadLetter) -> Result<(), TransportError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let kwargs_json = serde_json::to_string(&entry.kwargs)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        let failed_at = chrono::Utc::now().to_rfc3339();

        let id: String = cmd("XADD")
            .arg(dead_letter_key(&entry.api_name))
            .arg("MAXLEN")
            .arg("~")
            .arg(DEAD_LETTER_MAX_LEN)
            .arg("*")
            .arg("kind")
            .arg(entry.kind.as_str())
            .arg("member")
            .arg(&entry.member)
            .arg("message_id")
            .arg(&entry.message_id)
            .arg("kwargs")
            .arg(&kwargs_json)
            .arg("error")
            .arg(&entry.error)
            .arg("delivery_count")
            .arg(entry.delivery_count)
            .arg("failed_at")
            .arg(&failed_at)
            .arg("native_id")
            .arg(entry.native_id.as_deref().unwrap_or(""))
            .query_async(&mut conn)
            .await
            .map_err(|e| TransportError::Command(e.to_string()))?;

        info!(
            dead_letter_id = %id,
            message_id = %entry.message_id,
            address = format!("{}.{}", entry.api_name, entry.member),
            delivery_count = entry.delivery_count,
            "Message moved to dead-letter stream"
        );
        Ok(())
    }
}

/// A sink that records dead letters in memory and logs them. Used with the
/// in-process broker and as the default when no Redis pool exists.
#[derive(Default)]
pub struct LogDeadLetterQueue {
    entries: parking_lot::Mutex<Vec<DeadLetter>>,
}

impl LogDeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DeadLetter> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DeadLetterSink for LogDeadLetterQueue {
    async fn dead_letter(&self, entry: DeadLetter) -> Result<(), TransportError> {
        warn!(
            message_id = %entry.message_id,
            address = format!("{}.{}", entry.api_name, entry.member),
            delivery_count = entry.delivery_count,
            error = %entry.error,
            "Message dead-lettered"
        );
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_entry() -> DeadLetter {
        let mut kwargs = Kwargs::new();
        kwargs.insert("id".to_string(), json!(42));
        DeadLetter {
            kind: DeadLetterKind::Event,
            api_name: "store".to_string(),
            member: "page_view".to_string(),
            message_id: "abc".to_string(),
            kwargs,
            error: "handler kept failing".to_string(),
            delivery_count: 4,
            native_id: Some("1234-0".to_string()),
        }
    }

    #[test]
    fn test_dead_letter_key() {
        assert_eq!(dead_letter_key("store"), "axon:dead:store");
    }

    #[tokio::test]
    async fn test_log_sink_records() {
        let sink = LogDeadLetterQueue::new();
        sink.dead_letter(sample_entry()).await.unwrap();

        assert_eq!(sink.len(), 1);
        let entries = sink.entries();
        assert_eq!(entries[0].kind, DeadLetterKind::Event);
        assert_eq!(entries[0].delivery_count, 4);
    }
}

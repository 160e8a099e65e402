//! Event transport over Redis Streams with consumer groups.
//!
//! One stream per API (`events:<api_name>`), one consumer group per
//! `listener_name`, one uniquely named consumer per replica. New entries
//! arrive via `XREADGROUP`; a periodic `XAUTOCLAIM` pass adopts entries
//! stuck pending with crashed replicas; `XACK` is the final
//! acknowledgement. Delivery counts come from `XPENDING`, so redelivered
//! entries carry a monotonically increasing count.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamAutoClaimReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use tracing::{debug, info, warn};

use crate::message::{EventMessage, Kwargs, Metadata};
use crate::transport::{
    Delivery, EventConsumer, EventTransport, Lease, ListenerSpec, StreamPosition, TransportError,
};

use super::{command_error, connection, get_str_field, ping, stream_key, RedisTransportOptions};

pub struct RedisEventTransport {
    pool: Pool,
    options: RedisTransportOptions,
    closed: Arc<AtomicBool>,
}

impl RedisEventTransport {
    pub fn new(pool: Pool, options: RedisTransportOptions) -> Self {
        Self {
            pool,
            options,
            closed: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl EventTransport for RedisEventTransport {
    async fn open(&self) -> Result<(), TransportError> {
        ping(&self.pool).await?;
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_event(&self, message: &EventMessage) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let kwargs_json = serde_json::to_string(&message.kwargs)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
        let metadata_json = serde_json::to_string(&message.metadata)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;

        let mut conn = connection(&self.pool).await?;
        let native_id: String = cmd("XADD")
            .arg(stream_key(&message.api_name))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.options.stream_max_len)
            .arg("*")
            .arg("id")
            .arg(message.id.as_str())
            .arg("event_name")
            .arg(&message.event_name)
            .arg("kwargs_json")
            .arg(&kwargs_json)
            .arg("metadata_json")
            .arg(&metadata_json)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(
            id = %message.id,
            address = %message.canonical_name(),
            native_id = %native_id,
            "Event published"
        );
        Ok(native_id)
    }

    async fn consume(&self, spec: ListenerSpec) -> Result<Box<dyn EventConsumer>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut apis: Vec<String> = spec.addresses.iter().map(|a| a.api_name.clone()).collect();
        apis.sort();
        apis.dedup();

        let start = match &spec.since {
            StreamPosition::New => "$".to_string(),
            StreamPosition::Tail => "0".to_string(),
            StreamPosition::Explicit(pos) => pos.clone(),
        };

        let mut conn = connection(&self.pool).await?;
        for api in &apis {
            let created: Result<(), _> = cmd("XGROUP")
                .arg("CREATE")
                .arg(stream_key(api))
                .arg(&spec.listener_name)
                .arg(&start)
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match created {
                Ok(()) => info!(
                    group = %spec.listener_name,
                    api = %api,
                    "Created consumer group"
                ),
                Err(e) if e.to_string().contains("BUSYGROUP") => {
                    debug!(group = %spec.listener_name, api = %api, "Consumer group already exists");
                }
                Err(e) => return Err(command_error(e)),
            }
        }

        Ok(Box::new(RedisEventConsumer {
            pool: self.pool.clone(),
            options: self.options.clone(),
            closed: self.closed.clone(),
            spec,
            apis,
            buffer: VecDeque::new(),
            last_reclaim: Instant::now(),
        }))
    }

    async fn history(
        &self,
        api_name: &str,
        event_name: &str,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<EventMessage>, TransportError> {
        let mut conn = connection(&self.pool).await?;
        let entries: Vec<(String, HashMap<String, RedisValue>)> = cmd("XRANGE")
            .arg(stream_key(api_name))
            .arg(since.unwrap_or("-"))
            .arg(until.unwrap_or("+"))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(entries
            .into_iter()
            .filter_map(|(native_id, map)| parse_event(api_name, &native_id, &map))
            .filter(|e| e.event_name == event_name)
            .collect())
    }
}

/// Build an [`EventMessage`] from stream entry fields, or `None` if the
/// entry is missing required fields.
fn parse_event(
    api_name: &str,
    native_id: &str,
    map: &HashMap<String, RedisValue>,
) -> Option<EventMessage> {
    let id = get_str_field(map, "id")?;
    let event_name = get_str_field(map, "event_name")?;

    let kwargs: Kwargs = match get_str_field(map, "kwargs_json") {
        Some(raw) => match serde_json::from_str(&raw) {
            Ok(k) => k,
            Err(e) => {
                warn!(native_id = %native_id, error = %e, "Failed to parse event kwargs, using empty object");
                Kwargs::new()
            }
        },
        None => Kwargs::new(),
    };
    let metadata: Metadata = get_str_field(map, "metadata_json")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Some(EventMessage {
        id: id.into(),
        api_name: api_name.to_string(),
        event_name,
        kwargs,
        metadata,
        native_id: Some(native_id.to_string()),
    })
}

struct BufferedDelivery {
    api_name: String,
    native_id: String,
    message: EventMessage,
    delivery_count: u32,
}

struct RedisEventConsumer {
    pool: Pool,
    options: RedisTransportOptions,
    closed: Arc<AtomicBool>,
    spec: ListenerSpec,
    apis: Vec<String>,
    buffer: VecDeque<BufferedDelivery>,
    last_reclaim: Instant,
}

impl RedisEventConsumer {
    fn wants(&self, message: &EventMessage) -> bool {
        self.spec
            .addresses
            .iter()
            .any(|a| a.api_name == message.api_name && a.event_name == message.event_name)
    }

    fn lease(&self, api_name: &str, native_id: String, delivery_count: u32) -> RedisEventLease {
        RedisEventLease {
            pool: self.pool.clone(),
            stream: stream_key(api_name),
            group: self.spec.listener_name.clone(),
            native_id,
            delivery_count,
        }
    }

    async fn ack_entry(
        &self,
        conn: &mut deadpool_redis::Connection,
        api_name: &str,
        native_id: &str,
    ) -> Result<(), TransportError> {
        let _: i64 = cmd("XACK")
            .arg(stream_key(api_name))
            .arg(&self.spec.listener_name)
            .arg(native_id)
            .query_async(conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    /// Claim pending entries idle past the acknowledgement timeout from
    /// other (possibly dead) replicas of this group.
    async fn reclaim(&mut self, conn: &mut deadpool_redis::Connection) -> Result<(), TransportError> {
        let min_idle_ms = self.options.acknowledgement_timeout.as_millis() as u64;

        for api in self.apis.clone() {
            let claimed: Result<StreamAutoClaimReply, _> = cmd("XAUTOCLAIM")
                .arg(stream_key(&api))
                .arg(&self.spec.listener_name)
                .arg(&self.spec.replica)
                .arg(min_idle_ms)
                .arg("0-0")
                .arg("COUNT")
                .arg(self.options.batch_size)
                .query_async(conn)
                .await;

            let reply = match claimed {
                Ok(reply) => reply,
                Err(e) => {
                    // XAUTOCLAIM needs Redis >= 6.2; degrade to lease-less
                    // consumption rather than failing the loop.
                    debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
                    continue;
                }
            };

            if !reply.claimed.is_empty() {
                info!(
                    count = reply.claimed.len(),
                    group = %self.spec.listener_name,
                    api = %api,
                    "Claimed pending entries from previous replicas"
                );
            }

            for entry in reply.claimed {
                let Some(message) = parse_event(&api, &entry.id, &entry.map) else {
                    warn!(native_id = %entry.id, "Acknowledging unparseable pending entry");
                    self.ack_entry(conn, &api, &entry.id).await?;
                    continue;
                };
                if !self.wants(&message) {
                    self.ack_entry(conn, &api, &entry.id).await?;
                    continue;
                }

                let delivery_count = self
                    .pending_delivery_count(conn, &api, &entry.id)
                    .await
                    .unwrap_or(2);
                self.buffer.push_back(BufferedDelivery {
                    api_name: api.clone(),
                    native_id: entry.id,
                    message,
                    delivery_count,
                });
            }
        }
        Ok(())
    }

    async fn pending_delivery_count(
        &self,
        conn: &mut deadpool_redis::Connection,
        api_name: &str,
        native_id: &str,
    ) -> Option<u32> {
        let rows: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(stream_key(api_name))
            .arg(&self.spec.listener_name)
            .arg(native_id)
            .arg(native_id)
            .arg(1)
            .query_async(conn)
            .await
            .ok()?;
        rows.first().map(|(_, _, _, count)| *count as u32)
    }

    async fn read_new(&mut self, conn: &mut deadpool_redis::Connection) -> Result<(), TransportError> {
        let keys: Vec<String> = self.apis.iter().map(|a| stream_key(a)).collect();
        let ids: Vec<&str> = self.apis.iter().map(|_| ">").collect();

        let opts = StreamReadOptions::default()
            .group(&self.spec.listener_name, &self.spec.replica)
            .block(self.options.block_timeout.as_millis() as usize)
            .count(self.options.batch_size);

        let reply: Option<StreamReadReply> = conn
            .xread_options(&keys, &ids, &opts)
            .await
            .map_err(command_error)?;

        let Some(reply) = reply else {
            return Ok(());
        };

        for stream in reply.keys {
            let api_name = stream
                .key
                .strip_prefix("events:")
                .unwrap_or(&stream.key)
                .to_string();
            for entry in stream.ids {
                let Some(message) = parse_event(&api_name, &entry.id, &entry.map) else {
                    warn!(native_id = %entry.id, "Acknowledging unparseable stream entry");
                    self.ack_entry(conn, &api_name, &entry.id).await?;
                    continue;
                };
                if !self.wants(&message) {
                    // This group subscribes at stream level but not to this
                    // event; ack so it does not pile up as pending.
                    self.ack_entry(conn, &api_name, &entry.id).await?;
                    continue;
                }
                self.buffer.push_back(BufferedDelivery {
                    api_name: api_name.clone(),
                    native_id: entry.id.clone(),
                    message,
                    delivery_count: 1,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EventConsumer for RedisEventConsumer {
    async fn next(&mut self) -> Result<Option<Delivery<EventMessage>>, TransportError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            if let Some(buffered) = self.buffer.pop_front() {
                let lease = self.lease(
                    &buffered.api_name,
                    buffered.native_id,
                    buffered.delivery_count,
                );
                return Ok(Some(Delivery {
                    message: buffered.message,
                    lease: Box::new(lease),
                }));
            }

            let mut conn = connection(&self.pool).await?;

            if self.last_reclaim.elapsed() >= self.options.reclaim_interval {
                self.last_reclaim = Instant::now();
                self.reclaim(&mut conn).await?;
                if !self.buffer.is_empty() {
                    continue;
                }
            }

            self.read_new(&mut conn).await?;
        }
    }
}

struct RedisEventLease {
    pool: Pool,
    stream: String,
    group: String,
    native_id: String,
    delivery_count: u32,
}

#[async_trait]
impl Lease for RedisEventLease {
    async fn acknowledge(&mut self) -> Result<(), TransportError> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.native_id)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    fn native_id(&self) -> &str {
        &self.native_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry_map(pairs: &[(&str, &str)]) -> HashMap<String, RedisValue> {
        pairs
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    RedisValue::BulkString(v.as_bytes().to_vec()),
                )
            })
            .collect()
    }

    #[test]
    fn test_parse_event() {
        let map = entry_map(&[
            ("id", "abc-123"),
            ("event_name", "page_view"),
            ("kwargs_json", r#"{"id": 42}"#),
            ("metadata_json", r#"{"codec": "json"}"#),
        ]);

        let event = parse_event("store", "1700000000000-0", &map).unwrap();
        assert_eq!(event.canonical_name(), "store.page_view");
        assert_eq!(event.kwargs["id"], json!(42));
        assert_eq!(event.metadata.get("codec").map(String::as_str), Some("json"));
        assert_eq!(event.native_id.as_deref(), Some("1700000000000-0"));
    }

    #[test]
    fn test_parse_event_missing_fields() {
        let map = entry_map(&[("kwargs_json", "{}")]);
        assert!(parse_event("store", "1-0", &map).is_none());
    }

    #[test]
    fn test_parse_event_bad_kwargs_degrades() {
        let map = entry_map(&[
            ("id", "abc"),
            ("event_name", "page_view"),
            ("kwargs_json", "not json"),
        ]);
        let event = parse_event("store", "1-0", &map).unwrap();
        assert!(event.kwargs.is_empty());
    }
}

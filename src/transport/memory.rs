//! In-process broker implementing all four transports.
//!
//! [`MemoryBroker`] mirrors the delivery semantics of the Redis realisation
//! without leaving the process: single-pop RPC queues, per-group event
//! cursors with pending tables and lease-expiry redelivery, result slots
//! keyed by return path, and schema entries with TTLs. It backs the test
//! suite and doubles as a broker for single-process buses.
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::transport::memory::MemoryBroker;
//!
//! let broker = MemoryBroker::new(Duration::from_secs(60));
//! let transports = broker.transport_set();
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use crate::message::{EventMessage, MessageId, ResultMessage, RpcMessage};
use crate::transport::{
    Delivery, EventConsumer, EventTransport, Lease, ListenerSpec, ResultTransport, RpcConsumer,
    RpcTransport, SchemaTransport, StreamPosition, TransportError, TransportSet,
};

/// How long consumers sleep between wakeup checks while idle. Keeps reclaim
/// passes running even when no publish notification arrives.
const IDLE_POLL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct QueuedRpc {
    message: RpcMessage,
    delivery_count: u32,
}

#[derive(Debug)]
struct PendingRpc {
    message: RpcMessage,
    claimed_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Clone)]
struct StoredEvent {
    seq: u64,
    message: EventMessage,
}

#[derive(Debug)]
struct PendingEvent {
    seq: u64,
    claimed_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the api stream of the next entry this group has not seen.
    cursor: usize,
    /// Entries delivered but not yet acknowledged, keyed by native id.
    pending: HashMap<String, PendingEvent>,
    /// Entries redelivered after lease expiry, served before new ones.
    redeliver: VecDeque<(u64, u32)>,
}

#[derive(Default)]
struct BrokerState {
    rpc_queues: HashMap<String, VecDeque<QueuedRpc>>,
    /// In-flight RPCs keyed by message id.
    rpc_pending: HashMap<MessageId, (String, PendingRpc)>,
    rpc_consumers: HashMap<String, u64>,
    results: HashMap<String, VecDeque<ResultMessage>>,
    streams: HashMap<String, Vec<StoredEvent>>,
    groups: HashMap<(String, String), GroupState>,
    schemas: HashMap<String, (Value, Duration, Instant)>,
    next_seq: u64,
    closed: bool,
}

/// A shared in-process broker. Clone handles via [`Arc`] and hand the same
/// broker to several clients to simulate a multi-process bus in one test.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    notify: Notify,
    acknowledgement_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(acknowledgement_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            notify: Notify::new(),
            acknowledgement_timeout,
        })
    }

    /// All four transports backed by this broker.
    pub fn transport_set(self: &Arc<Self>) -> TransportSet {
        TransportSet {
            rpc: Arc::new(MemoryRpcTransport {
                broker: self.clone(),
            }),
            result: Arc::new(MemoryResultTransport {
                broker: self.clone(),
            }),
            event: Arc::new(MemoryEventTransport {
                broker: self.clone(),
            }),
            schema: Arc::new(MemorySchemaTransport {
                broker: self.clone(),
            }),
        }
    }

    /// Number of retained entries on one api stream. Test helper.
    pub fn stream_len(&self, api_name: &str) -> usize {
        self.state
            .lock()
            .streams
            .get(api_name)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn ensure_open(state: &BrokerState) -> Result<(), TransportError> {
        if state.closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Move expired RPC claims back to the front of their queue.
    fn reclaim_rpcs(&self, state: &mut BrokerState) {
        let now = Instant::now();
        let expired: Vec<MessageId> = state
            .rpc_pending
            .iter()
            .filter(|(_, (_, p))| now.duration_since(p.claimed_at) >= self.acknowledgement_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some((api_name, pending)) = state.rpc_pending.remove(&id) {
                tracing::debug!(id = %id, api = %api_name, "Re-queueing expired RPC claim");
                state
                    .rpc_queues
                    .entry(api_name)
                    .or_default()
                    .push_front(QueuedRpc {
                        message: pending.message,
                        delivery_count: pending.delivery_count,
                    });
            }
        }
    }

    /// Move expired event claims onto their group's redelivery queue.
    fn reclaim_events(&self, state: &mut BrokerState, api_name: &str, group: &str) {
        let now = Instant::now();
        let key = (api_name.to_string(), group.to_string());
        let Some(group_state) = state.groups.get_mut(&key) else {
            return;
        };

        let expired: Vec<String> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.claimed_at) >= self.acknowledgement_timeout)
            .map(|(native_id, _)| native_id.clone())
            .collect();

        for native_id in expired {
            if let Some(pending) = group_state.pending.remove(&native_id) {
                tracing::debug!(
                    native_id = %native_id,
                    group = %group,
                    delivery_count = pending.delivery_count,
                    "Redelivering expired event claim"
                );
                group_state
                    .redeliver
                    .push_back((pending.seq, pending.delivery_count));
            }
        }
    }
}

fn native_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_seq(native: &str) -> Option<u64> {
    native.split('-').next().and_then(|s| s.parse().ok())
}

// ---------------------------------------------------------------------------
// RPC
// ---------------------------------------------------------------------------

pub struct MemoryRpcTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl RpcTransport for MemoryRpcTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.broker.state.lock().closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().closed = true;
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, message: &RpcMessage) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            MemoryBroker::ensure_open(&state)?;
            state
                .rpc_queues
                .entry(message.api_name.clone())
                .or_default()
                .push_back(QueuedRpc {
                    message: message.clone(),
                    delivery_count: 0,
                });
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        api_names: Vec<String>,
        replica: String,
    ) -> Result<Box<dyn RpcConsumer>, TransportError> {
        let mut state = self.broker.state.lock();
        MemoryBroker::ensure_open(&state)?;
        for api in &api_names {
            *state.rpc_consumers.entry(api.clone()).or_insert(0) += 1;
        }
        drop(state);

        Ok(Box::new(MemoryRpcConsumer {
            broker: self.broker.clone(),
            api_names,
            _replica: replica,
        }))
    }

    async fn responder_count(&self, api_name: &str) -> Result<Option<u64>, TransportError> {
        let state = self.broker.state.lock();
        Ok(Some(
            state.rpc_consumers.get(api_name).copied().unwrap_or(0),
        ))
    }
}

struct MemoryRpcConsumer {
    broker: Arc<MemoryBroker>,
    api_names: Vec<String>,
    _replica: String,
}

impl MemoryRpcConsumer {
    fn try_pop(&self) -> Result<Option<Delivery<RpcMessage>>, TransportError> {
        let mut state = self.broker.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        self.broker.reclaim_rpcs(&mut state);

        for api in &self.api_names {
            let Some(queue) = state.rpc_queues.get_mut(api) else {
                continue;
            };
            if let Some(queued) = queue.pop_front() {
                let delivery_count = queued.delivery_count + 1;
                let message = queued.message.clone();
                state.rpc_pending.insert(
                    message.id.clone(),
                    (
                        api.clone(),
                        PendingRpc {
                            message: queued.message,
                            claimed_at: Instant::now(),
                            delivery_count,
                        },
                    ),
                );
                return Ok(Some(Delivery {
                    lease: Box::new(MemoryRpcLease {
                        broker: self.broker.clone(),
                        message_id: message.id.clone(),
                        delivery_count,
                        native: message.id.to_string(),
                    }),
                    message,
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RpcConsumer for MemoryRpcConsumer {
    async fn next(&mut self) -> Result<Option<Delivery<RpcMessage>>, TransportError> {
        loop {
            match self.try_pop() {
                Ok(Some(delivery)) => return Ok(Some(delivery)),
                Ok(None) => {}
                Err(TransportError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(IDLE_POLL, notified).await;
        }
    }
}

impl Drop for MemoryRpcConsumer {
    fn drop(&mut self) {
        let mut state = self.broker.state.lock();
        for api in &self.api_names {
            if let Some(count) = state.rpc_consumers.get_mut(api) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

struct MemoryRpcLease {
    broker: Arc<MemoryBroker>,
    message_id: MessageId,
    delivery_count: u32,
    native: String,
}

#[async_trait]
impl Lease for MemoryRpcLease {
    async fn acknowledge(&mut self) -> Result<(), TransportError> {
        self.broker.state.lock().rpc_pending.remove(&self.message_id);
        Ok(())
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    fn native_id(&self) -> &str {
        &self.native
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

pub struct MemoryResultTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl ResultTransport for MemoryResultTransport {
    async fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.notify.notify_waiters();
        Ok(())
    }

    fn return_path(&self, rpc_message: &RpcMessage) -> String {
        format!("memory.{}", rpc_message.id)
    }

    async fn send_result(
        &self,
        _rpc_message: &RpcMessage,
        result_message: &ResultMessage,
        return_path: &str,
    ) -> Result<(), TransportError> {
        {
            let mut state = self.broker.state.lock();
            MemoryBroker::ensure_open(&state)?;
            state
                .results
                .entry(return_path.to_string())
                .or_default()
                .push_back(result_message.clone());
        }
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn receive_result(
        &self,
        _rpc_message: &RpcMessage,
        return_path: &str,
        timeout: Duration,
    ) -> Result<ResultMessage, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.broker.state.lock();
                if let Some(queue) = state.results.get_mut(return_path) {
                    if let Some(result) = queue.pop_front() {
                        if queue.is_empty() {
                            state.results.remove(return_path);
                        }
                        return Ok(result);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::ReceiveTimeout(timeout));
            }
            let wait = (deadline - now).min(IDLE_POLL);
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub struct MemoryEventTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl EventTransport for MemoryEventTransport {
    async fn open(&self) -> Result<(), TransportError> {
        self.broker.state.lock().closed = false;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.state.lock().closed = true;
        self.broker.notify.notify_waiters();
        Ok(())
    }

    async fn send_event(&self, message: &EventMessage) -> Result<String, TransportError> {
        let id = {
            let mut state = self.broker.state.lock();
            MemoryBroker::ensure_open(&state)?;
            state.next_seq += 1;
            let seq = state.next_seq;
            let mut stored = message.clone();
            stored.native_id = Some(native_id(seq));
            state
                .streams
                .entry(message.api_name.clone())
                .or_default()
                .push(StoredEvent {
                    seq,
                    message: stored,
                });
            native_id(seq)
        };
        self.broker.notify.notify_waiters();
        Ok(id)
    }

    async fn consume(&self, spec: ListenerSpec) -> Result<Box<dyn EventConsumer>, TransportError> {
        let mut state = self.broker.state.lock();
        MemoryBroker::ensure_open(&state)?;

        // Join (or create) the group for each api this listener covers.
        let mut apis: Vec<String> = spec.addresses.iter().map(|a| a.api_name.clone()).collect();
        apis.sort();
        apis.dedup();

        for api in &apis {
            let key = (api.clone(), spec.listener_name.clone());
            if !state.groups.contains_key(&key) {
                let cursor = match &spec.since {
                    StreamPosition::New => {
                        state.streams.get(api).map(|s| s.len()).unwrap_or(0)
                    }
                    StreamPosition::Tail => 0,
                    StreamPosition::Explicit(pos) => {
                        let seq = parse_seq(pos).unwrap_or(0);
                        state
                            .streams
                            .get(api)
                            .map(|s| s.iter().take_while(|e| e.seq < seq).count())
                            .unwrap_or(0)
                    }
                };
                state.groups.insert(
                    key,
                    GroupState {
                        cursor,
                        ..GroupState::default()
                    },
                );
            }
        }
        drop(state);

        Ok(Box::new(MemoryEventConsumer {
            broker: self.broker.clone(),
            spec,
            apis,
        }))
    }

    async fn history(
        &self,
        api_name: &str,
        event_name: &str,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<EventMessage>, TransportError> {
        let state = self.broker.state.lock();
        let since_seq = since.and_then(parse_seq).unwrap_or(0);
        let until_seq = until.and_then(parse_seq).unwrap_or(u64::MAX);

        Ok(state
            .streams
            .get(api_name)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| {
                        e.seq >= since_seq
                            && e.seq <= until_seq
                            && e.message.event_name == event_name
                    })
                    .map(|e| e.message.clone())
                    .collect()
            })
            .unwrap_or_default())
    }
}

struct MemoryEventConsumer {
    broker: Arc<MemoryBroker>,
    spec: ListenerSpec,
    apis: Vec<String>,
}

impl MemoryEventConsumer {
    fn wants(&self, message: &EventMessage) -> bool {
        self.spec
            .addresses
            .iter()
            .any(|a| a.api_name == message.api_name && a.event_name == message.event_name)
    }

    fn try_pop(&self) -> Result<Option<Delivery<EventMessage>>, TransportError> {
        let mut state = self.broker.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }

        for api in &self.apis {
            self.broker
                .reclaim_events(&mut state, api, &self.spec.listener_name);

            let key = (api.clone(), self.spec.listener_name.clone());

            // Redeliveries first (broker order is preserved per queue).
            let redelivered = state
                .groups
                .get_mut(&key)
                .and_then(|g| g.redeliver.pop_front());
            if let Some((seq, prior_count)) = redelivered {
                let stored = state
                    .streams
                    .get(api)
                    .and_then(|s| s.iter().find(|e| e.seq == seq))
                    .cloned();
                if let Some(stored) = stored {
                    return Ok(Some(self.deliver(&mut state, &key, stored, prior_count + 1)));
                }
                continue;
            }

            // Then new entries past the group cursor.
            loop {
                let group = state.groups.get(&key).expect("group joined in consume()");
                let cursor = group.cursor;
                let stored = state
                    .streams
                    .get(api)
                    .and_then(|s| s.get(cursor))
                    .cloned();
                let Some(stored) = stored else {
                    break;
                };

                state.groups.get_mut(&key).expect("group exists").cursor += 1;
                if self.wants(&stored.message) {
                    return Ok(Some(self.deliver(&mut state, &key, stored, 1)));
                }
                // Not subscribed to this event; skip it for this group.
            }
        }
        Ok(None)
    }

    fn deliver(
        &self,
        state: &mut BrokerState,
        key: &(String, String),
        stored: StoredEvent,
        delivery_count: u32,
    ) -> Delivery<EventMessage> {
        let native = native_id(stored.seq);
        state.groups.get_mut(key).expect("group exists").pending.insert(
            native.clone(),
            PendingEvent {
                seq: stored.seq,
                claimed_at: Instant::now(),
                delivery_count,
            },
        );

        let mut message = stored.message;
        message.native_id = Some(native.clone());
        Delivery {
            message,
            lease: Box::new(MemoryEventLease {
                broker: self.broker.clone(),
                key: key.clone(),
                native,
                delivery_count,
            }),
        }
    }
}

#[async_trait]
impl EventConsumer for MemoryEventConsumer {
    async fn next(&mut self) -> Result<Option<Delivery<EventMessage>>, TransportError> {
        loop {
            match self.try_pop() {
                Ok(Some(delivery)) => return Ok(Some(delivery)),
                Ok(None) => {}
                Err(TransportError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
            let notified = self.broker.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(IDLE_POLL, notified).await;
        }
    }
}

struct MemoryEventLease {
    broker: Arc<MemoryBroker>,
    key: (String, String),
    native: String,
    delivery_count: u32,
}

#[async_trait]
impl Lease for MemoryEventLease {
    async fn acknowledge(&mut self) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        if let Some(group) = state.groups.get_mut(&self.key) {
            group.pending.remove(&self.native);
        }
        Ok(())
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    fn native_id(&self) -> &str {
        &self.native
    }
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

pub struct MemorySchemaTransport {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl SchemaTransport for MemorySchemaTransport {
    async fn open(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn store(
        &self,
        api_name: &str,
        schema: &Value,
        ttl: Duration,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        state.schemas.insert(
            api_name.to_string(),
            (schema.clone(), ttl, Instant::now() + ttl),
        );
        Ok(())
    }

    async fn load(&self, api_name: &str) -> Result<Option<Value>, TransportError> {
        let state = self.broker.state.lock();
        Ok(state.schemas.get(api_name).and_then(|(schema, _, expires)| {
            if Instant::now() < *expires {
                Some(schema.clone())
            } else {
                None
            }
        }))
    }

    async fn ping(&self, api_name: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        if let Some((_, ttl, expires)) = state.schemas.get_mut(api_name) {
            *expires = Instant::now() + *ttl;
        }
        Ok(())
    }

    async fn api_names(&self) -> Result<Vec<String>, TransportError> {
        let state = self.broker.state.lock();
        let now = Instant::now();
        Ok(state
            .schemas
            .iter()
            .filter(|(_, (_, _, expires))| now < *expires)
            .map(|(name, _)| name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kwargs;
    use serde_json::json;

    fn kwargs(value: serde_json::Value) -> Kwargs {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn spec(listener: &str, api: &str, event: &str) -> ListenerSpec {
        ListenerSpec {
            listener_name: listener.to_string(),
            addresses: vec![crate::transport::EventAddress::new(api, event)],
            since: StreamPosition::New,
            replica: format!("{listener}-replica"),
        }
    }

    #[tokio::test]
    async fn test_rpc_single_delivery_between_consumers() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        let mut a = transports
            .rpc
            .consume(vec!["auth".to_string()], "a".to_string())
            .await
            .unwrap();
        let mut b = transports
            .rpc
            .consume(vec!["auth".to_string()], "b".to_string())
            .await
            .unwrap();

        let msg = RpcMessage::new("auth", "login", Kwargs::new());
        transports.rpc.publish(&msg).await.unwrap();

        // Exactly one consumer wins the pop.
        let winner = tokio::select! {
            d = a.next() => d.unwrap().unwrap(),
            d = b.next() => d.unwrap().unwrap(),
        };
        assert_eq!(winner.message.id, msg.id);
        assert_eq!(winner.lease.delivery_count(), 1);

        let count = transports.rpc.responder_count("auth").await.unwrap();
        assert_eq!(count, Some(2));
    }

    #[tokio::test]
    async fn test_rpc_redelivery_after_lease_expiry() {
        let broker = MemoryBroker::new(Duration::from_millis(30));
        let transports = broker.transport_set();

        let mut consumer = transports
            .rpc
            .consume(vec!["auth".to_string()], "a".to_string())
            .await
            .unwrap();

        let msg = RpcMessage::new("auth", "login", Kwargs::new());
        transports.rpc.publish(&msg).await.unwrap();

        // Take delivery but never acknowledge.
        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.lease.delivery_count(), 1);
        drop(first);

        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.message.id, msg.id);
        assert!(second.lease.delivery_count() >= 2);
    }

    #[tokio::test]
    async fn test_event_fan_out_across_groups() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        let mut audit = transports
            .event
            .consume(spec("audit", "store", "page_view"))
            .await
            .unwrap();
        let mut cache = transports
            .event
            .consume(spec("cache", "store", "page_view"))
            .await
            .unwrap();

        let event = EventMessage::new("store", "page_view", kwargs(json!({"id": 42})));
        transports.event.send_event(&event).await.unwrap();

        let mut a = audit.next().await.unwrap().unwrap();
        let mut c = cache.next().await.unwrap().unwrap();
        assert_eq!(a.message.id, event.id);
        assert_eq!(c.message.id, event.id);
        a.lease.acknowledge().await.unwrap();
        c.lease.acknowledge().await.unwrap();
    }

    #[tokio::test]
    async fn test_event_partitioned_within_group() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        let mut replica_one = transports
            .event
            .consume(spec("audit", "store", "page_view"))
            .await
            .unwrap();
        let mut replica_two = transports
            .event
            .consume(spec("audit", "store", "page_view"))
            .await
            .unwrap();

        for i in 0..4 {
            let event = EventMessage::new("store", "page_view", kwargs(json!({"id": i})));
            transports.event.send_event(&event).await.unwrap();
        }

        // Replicas of the same group split the stream between them.
        let mut seen = Vec::new();
        for _ in 0..2 {
            let mut d = replica_one.next().await.unwrap().unwrap();
            d.lease.acknowledge().await.unwrap();
            seen.push(d.message.kwargs["id"].clone());
        }
        for _ in 0..2 {
            let mut d = replica_two.next().await.unwrap().unwrap();
            d.lease.acknowledge().await.unwrap();
            seen.push(d.message.kwargs["id"].clone());
        }

        seen.sort_by_key(|v| v.as_i64().unwrap());
        assert_eq!(seen, vec![json!(0), json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_event_redelivery_and_delivery_count() {
        let broker = MemoryBroker::new(Duration::from_millis(30));
        let transports = broker.transport_set();

        let mut consumer = transports
            .event
            .consume(spec("audit", "store", "page_view"))
            .await
            .unwrap();

        let event = EventMessage::new("store", "page_view", kwargs(json!({"id": 1})));
        transports.event.send_event(&event).await.unwrap();

        let first = consumer.next().await.unwrap().unwrap();
        assert_eq!(first.lease.delivery_count(), 1);
        drop(first); // crash before ack

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = consumer.next().await.unwrap().unwrap();
        assert_eq!(second.message.id, event.id);
        assert_eq!(second.lease.delivery_count(), 2);
        second.lease.acknowledge().await.unwrap();
    }

    #[tokio::test]
    async fn test_since_new_skips_old_entries() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        let old = EventMessage::new("store", "page_view", kwargs(json!({"id": "old"})));
        transports.event.send_event(&old).await.unwrap();

        let mut consumer = transports
            .event
            .consume(spec("audit", "store", "page_view"))
            .await
            .unwrap();

        let fresh = EventMessage::new("store", "page_view", kwargs(json!({"id": "new"})));
        transports.event.send_event(&fresh).await.unwrap();

        let d = consumer.next().await.unwrap().unwrap();
        assert_eq!(d.message.kwargs["id"], json!("new"));
    }

    #[tokio::test]
    async fn test_result_round_trip_and_timeout() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        let rpc = RpcMessage::new("auth", "login", Kwargs::new());
        let return_path = transports.result.return_path(&rpc);

        let err = transports
            .result
            .receive_result(&rpc, &return_path, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ReceiveTimeout(_)));

        let result = ResultMessage::success(&rpc, json!(true));
        transports
            .result
            .send_result(&rpc, &result, &return_path)
            .await
            .unwrap();

        let received = transports
            .result
            .receive_result(&rpc, &return_path, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(received.rpc_message_id, rpc.id);
    }

    #[tokio::test]
    async fn test_schema_store_load_expiry() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        let schema = json!({"version": 1});
        transports
            .schema
            .store("auth", &schema, Duration::from_millis(30))
            .await
            .unwrap();

        assert_eq!(
            transports.schema.load("auth").await.unwrap(),
            Some(schema.clone())
        );
        assert_eq!(transports.schema.api_names().await.unwrap(), vec!["auth"]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(transports.schema.load("auth").await.unwrap(), None);

        // ping after store keeps it alive
        transports
            .schema
            .store("auth", &schema, Duration::from_millis(40))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        transports.schema.ping("auth").await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(transports.schema.load("auth").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_history() {
        let broker = MemoryBroker::new(Duration::from_secs(60));
        let transports = broker.transport_set();

        for i in 0..3 {
            let event = EventMessage::new("store", "page_view", kwargs(json!({"id": i})));
            transports.event.send_event(&event).await.unwrap();
        }
        let other = EventMessage::new("store", "checkout", Kwargs::new());
        transports.event.send_event(&other).await.unwrap();

        let history = transports
            .event
            .history("store", "page_view", None, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|e| e.event_name == "page_view"));
    }
}

//! Transport abstraction over the broker.
//!
//! Four orthogonal transports isolate the bus core from broker mechanics:
//!
//! - [`RpcTransport`]: producer/consumer sides of RPC queues with single
//!   delivery among competing consumers
//! - [`ResultTransport`]: the reply path back to the originating caller
//! - [`EventTransport`]: per-API event streams with consumer-group fan-out
//! - [`SchemaTransport`]: out-of-band schema publication keyed by API name
//!
//! A concrete backend may multiplex all four onto one connection pool; the
//! Redis realisation in [`redis`] does exactly that. [`memory`] provides a
//! full in-process broker with the same delivery semantics.
//!
//! Consumption is pull-based: `consume` returns a consumer object whose
//! `next()` suspends until a message is available. Each delivered message
//! carries a [`Lease`]; a message whose lease is never acknowledged is
//! redelivered once the acknowledgement timeout elapses.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::codec::CodecError;
use crate::message::{EventMessage, ResultMessage, RpcMessage};

/// Errors produced by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Broker unreachable or connection pool exhausted.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A broker command failed.
    #[error("broker command error: {0}")]
    Command(String),

    /// A payload could not be encoded or decoded, or exceeded size bounds.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// `receive_result` expired without a reply arriving.
    #[error("no result received within {0:?}")]
    ReceiveTimeout(Duration),

    /// The transport does not implement this optional operation.
    #[error("operation not supported by this transport: {0}")]
    UnsupportedOperation(&'static str),

    /// The transport has been closed.
    #[error("transport is closed")]
    Closed,
}

impl From<CodecError> for TransportError {
    fn from(e: CodecError) -> Self {
        Self::InvalidMessage(e.to_string())
    }
}

/// Transient ownership of an in-flight message.
///
/// The dispatcher holds the lease while a handler runs and acknowledges it
/// once processing (and, for RPCs, the result send) has completed. Leases
/// that expire unacknowledged cause broker-ordered redelivery with a
/// monotonically increasing [`delivery_count`](Lease::delivery_count).
#[async_trait]
pub trait Lease: Send {
    /// Final acknowledgement. The message will not be redelivered.
    async fn acknowledge(&mut self) -> Result<(), TransportError>;

    /// How many times this message has been delivered, this delivery
    /// included. Starts at 1.
    fn delivery_count(&self) -> u32;

    /// Broker-assigned identifier for this delivery (e.g. a stream entry
    /// id), if the broker exposes one.
    fn native_id(&self) -> &str;
}

/// A message together with the lease granted for it.
pub struct Delivery<M> {
    pub message: M,
    pub lease: Box<dyn Lease>,
}

/// A position in an event stream from which to begin consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPosition {
    /// Only entries published after the group joins.
    New,
    /// Everything still retained by the broker.
    Tail,
    /// An explicit broker-native position.
    Explicit(String),
}

impl Default for StreamPosition {
    fn default() -> Self {
        Self::New
    }
}

/// Canonical address of one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventAddress {
    pub api_name: String,
    pub event_name: String,
}

impl EventAddress {
    pub fn new(api_name: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            event_name: event_name.into(),
        }
    }

    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

/// One listener group's subscription: every distinct `listener_name`
/// receives every event once; replicas sharing a `listener_name`
/// load-balance within the group.
#[derive(Debug, Clone)]
pub struct ListenerSpec {
    /// Consumer group name.
    pub listener_name: String,
    /// The events this group subscribes to.
    pub addresses: Vec<EventAddress>,
    /// Where to begin when the group is first created.
    pub since: StreamPosition,
    /// Unique name for this replica within the group.
    pub replica: String,
}

/// Pull side of an RPC subscription. `next` suspends until a call arrives;
/// `Ok(None)` means the transport was closed.
#[async_trait]
pub trait RpcConsumer: Send {
    async fn next(&mut self) -> Result<Option<Delivery<RpcMessage>>, TransportError>;
}

/// Pull side of one listener group's event subscription.
#[async_trait]
pub trait EventConsumer: Send {
    async fn next(&mut self) -> Result<Option<Delivery<EventMessage>>, TransportError>;
}

/// Producer and consumer sides of RPC queues.
///
/// Must provide single delivery among competing consumers for the same
/// `api_name`, and must be safe under concurrent `publish` and `consume`.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;

    /// Enqueue a call, routed to subscribers of `message.api_name`.
    async fn publish(&self, message: &RpcMessage) -> Result<(), TransportError>;

    /// Subscribe a worker to the given APIs. `replica` uniquely names this
    /// consumer for lease bookkeeping.
    async fn consume(
        &self,
        api_names: Vec<String>,
        replica: String,
    ) -> Result<Box<dyn RpcConsumer>, TransportError>;

    /// Number of live consumers for `api_name`, if the broker can tell.
    /// `None` means unknown.
    async fn responder_count(&self, api_name: &str) -> Result<Option<u64>, TransportError>;
}

/// The reply path for RPC results.
#[async_trait]
pub trait ResultTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;

    /// Mint the ephemeral return address for a call.
    fn return_path(&self, rpc_message: &RpcMessage) -> String;

    /// Write a single result to the caller's return address.
    async fn send_result(
        &self,
        rpc_message: &RpcMessage,
        result_message: &ResultMessage,
        return_path: &str,
    ) -> Result<(), TransportError>;

    /// Block (cooperatively) until the result arrives or `timeout` elapses,
    /// failing with [`TransportError::ReceiveTimeout`].
    async fn receive_result(
        &self,
        rpc_message: &RpcMessage,
        return_path: &str,
        timeout: Duration,
    ) -> Result<ResultMessage, TransportError>;
}

/// Per-API event streams with consumer-group delivery.
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;

    /// Append to the per-`api_name` stream. Returns the broker-native entry
    /// id, and returns only after the broker has durably accepted the
    /// message.
    async fn send_event(&self, message: &EventMessage) -> Result<String, TransportError>;

    /// Start or rejoin the consumer group for one listener. Redelivers on
    /// lease expiry and reclaims stale pending entries from dead replicas.
    async fn consume(&self, spec: ListenerSpec) -> Result<Box<dyn EventConsumer>, TransportError>;

    /// Replay retained entries for one event between two stream positions.
    /// Optional; transports without retention return
    /// [`TransportError::UnsupportedOperation`].
    async fn history(
        &self,
        api_name: &str,
        event_name: &str,
        since: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<EventMessage>, TransportError>;
}

/// Out-of-band schema publication, keyed by API name.
#[async_trait]
pub trait SchemaTransport: Send + Sync {
    async fn open(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;

    /// Publish a schema with a time-to-live.
    async fn store(
        &self,
        api_name: &str,
        schema: &Value,
        ttl: Duration,
    ) -> Result<(), TransportError>;

    /// Fetch the schema for one API, `None` if absent or expired.
    async fn load(&self, api_name: &str) -> Result<Option<Value>, TransportError>;

    /// Refresh the TTL of a previously stored schema.
    async fn ping(&self, api_name: &str) -> Result<(), TransportError>;

    /// All API names with a live schema on the broker.
    async fn api_names(&self) -> Result<Vec<String>, TransportError>;
}

/// The four transports a bus client runs on.
#[derive(Clone)]
pub struct TransportSet {
    pub rpc: std::sync::Arc<dyn RpcTransport>,
    pub result: std::sync::Arc<dyn ResultTransport>,
    pub event: std::sync::Arc<dyn EventTransport>,
    pub schema: std::sync::Arc<dyn SchemaTransport>,
}

impl TransportSet {
    /// Open all transports in order. If any open fails, the transports
    /// already opened are closed again before the error is returned.
    pub async fn open_all(&self) -> Result<(), TransportError> {
        if let Err(e) = self.rpc.open().await {
            return Err(self.rollback("rpc", e, &[]).await);
        }
        if let Err(e) = self.result.open().await {
            return Err(self.rollback("result", e, &[Closer::Rpc]).await);
        }
        if let Err(e) = self.event.open().await {
            return Err(self.rollback("event", e, &[Closer::Result, Closer::Rpc]).await);
        }
        if let Err(e) = self.schema.open().await {
            return Err(self
                .rollback("schema", e, &[Closer::Event, Closer::Result, Closer::Rpc])
                .await);
        }
        Ok(())
    }

    async fn rollback(&self, failed: &str, error: TransportError, opened: &[Closer]) -> TransportError {
        tracing::error!(transport = failed, error = %error, "Transport failed to open, rolling back");
        for closer in opened {
            let result = match closer {
                Closer::Rpc => self.rpc.close().await,
                Closer::Result => self.result.close().await,
                Closer::Event => self.event.close().await,
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Error closing transport during rollback");
            }
        }
        error
    }

    /// Close all transports, logging (not propagating) individual failures.
    pub async fn close_all(&self) {
        if let Err(e) = self.event.close().await {
            tracing::warn!(error = %e, "Error closing event transport");
        }
        if let Err(e) = self.rpc.close().await {
            tracing::warn!(error = %e, "Error closing RPC transport");
        }
        if let Err(e) = self.result.close().await {
            tracing::warn!(error = %e, "Error closing result transport");
        }
        if let Err(e) = self.schema.close().await {
            tracing::warn!(error = %e, "Error closing schema transport");
        }
    }
}

enum Closer {
    Rpc,
    Result,
    Event,
}

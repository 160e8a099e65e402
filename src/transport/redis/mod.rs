//! Redis realisation of the four transports.
//!
//! All four transports multiplex one [`deadpool_redis::Pool`]:
//!
//! - RPCs ride a blocking list per API (`rpc:<api_name>`); one consumer wins
//!   each pop, and a claims hash plus reclaim pass provides lease semantics.
//! - Results ride a short-lived list keyed by the caller's ephemeral return
//!   path (`result:<return_path>`).
//! - Events ride streams (`events:<api_name>`) with one consumer group per
//!   listener name, `XACK` acknowledgement and `XAUTOCLAIM` recovery of
//!   entries stuck with crashed replicas.
//! - Schemas live in a hash (`schemas`) paired with per-API liveness keys
//!   carrying the TTL.

mod event;
mod result;
mod rpc;
mod schema;

pub use event::RedisEventTransport;
pub use result::RedisResultTransport;
pub use rpc::RedisRpcTransport;
pub use schema::RedisSchemaTransport;

use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::redis::{cmd, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};

use crate::codec::Codec;
use crate::transport::{TransportError, TransportSet};

/// Upper bound on a single serialized envelope.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Tuning knobs shared by the Redis transports.
#[derive(Debug, Clone)]
pub struct RedisTransportOptions {
    /// Lease duration: unacknowledged deliveries older than this are
    /// redelivered.
    pub acknowledgement_timeout: Duration,
    /// How often consumers scan for stale pending entries.
    pub reclaim_interval: Duration,
    /// How long blocking reads wait before re-checking for shutdown.
    pub block_timeout: Duration,
    /// Batch size for stream reads and reclaim passes.
    pub batch_size: usize,
    /// Approximate retention cap per event stream.
    pub stream_max_len: usize,
    /// Retention of result keys beyond the call timeout.
    pub result_ttl_grace: Duration,
    /// TTL for published schemas.
    pub schema_ttl: Duration,
}

impl Default for RedisTransportOptions {
    fn default() -> Self {
        Self {
            acknowledgement_timeout: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(20),
            block_timeout: Duration::from_secs(2),
            batch_size: 10,
            stream_max_len: 100_000,
            result_ttl_grace: Duration::from_secs(60),
            schema_ttl: Duration::from_secs(60),
        }
    }
}

/// Create a connection pool for the given Redis URL.
pub fn create_pool(url: &str) -> Result<Pool, TransportError> {
    let cfg = Config::from_url(url);
    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|e| TransportError::Connection(e.to_string()))
}

/// All four transports on one pool.
pub fn redis_transport_set(
    pool: Pool,
    codec: Arc<dyn Codec>,
    options: RedisTransportOptions,
) -> TransportSet {
    TransportSet {
        rpc: Arc::new(RedisRpcTransport::new(
            pool.clone(),
            codec.clone(),
            options.clone(),
        )),
        result: Arc::new(RedisResultTransport::new(
            pool.clone(),
            codec,
            options.clone(),
        )),
        event: Arc::new(RedisEventTransport::new(pool.clone(), options.clone())),
        schema: Arc::new(RedisSchemaTransport::new(pool, options)),
    }
}

pub(crate) fn rpc_queue_key(api_name: &str) -> String {
    format!("rpc:{api_name}")
}

pub(crate) fn rpc_claims_key(api_name: &str) -> String {
    format!("rpc:claims:{api_name}")
}

pub(crate) fn rpc_deliveries_key(api_name: &str) -> String {
    format!("rpc:deliveries:{api_name}")
}

pub(crate) fn rpc_consumers_key(api_name: &str) -> String {
    format!("rpc:consumers:{api_name}")
}

pub(crate) fn result_key(return_path: &str) -> String {
    format!("result:{return_path}")
}

pub(crate) fn stream_key(api_name: &str) -> String {
    format!("events:{api_name}")
}

pub(crate) const SCHEMAS_HASH: &str = "schemas";

pub(crate) fn schema_alive_key(api_name: &str) -> String {
    format!("schema:alive:{api_name}")
}

/// Get a connection, mapping pool errors to [`TransportError::Connection`].
pub(crate) async fn connection(pool: &Pool) -> Result<deadpool_redis::Connection, TransportError> {
    pool.get()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))
}

/// Verify broker reachability with a PING.
pub(crate) async fn ping(pool: &Pool) -> Result<(), TransportError> {
    let mut conn = connection(pool).await?;
    let _: String = cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    Ok(())
}

/// Extract a string field from stream entry data.
pub(crate) fn get_str_field(
    map: &std::collections::HashMap<String, RedisValue>,
    key: &str,
) -> Option<String> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    })
}

pub(crate) fn command_error(e: deadpool_redis::redis::RedisError) -> TransportError {
    TransportError::Command(e.to_string())
}

//! RPC transport over Redis lists.
//!
//! One blocking list per API. `publish` pushes the encoded envelope with
//! `LPUSH`; competing consumers `BRPOP`, so exactly one wins each call. A
//! popped call is recorded in a per-API claims hash until acknowledged;
//! a reclaim pass re-queues claims older than the acknowledgement timeout,
//! which is what turns the pop into a lease. Delivery counts live in a
//! separate hash that survives the requeue.
//!
//! Consumer presence is tracked in a per-API sorted set scored by the last
//! poll time, which is what lets callers distinguish "no responders" from
//! a slow responder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::message::{MessageId, RpcMessage};
use crate::transport::{Delivery, Lease, RpcConsumer, RpcTransport, TransportError};

use super::{
    command_error, connection, ping, rpc_claims_key, rpc_consumers_key, rpc_deliveries_key,
    rpc_queue_key, RedisTransportOptions, MAX_MESSAGE_BYTES,
};

/// Presence entries older than this many blocking-read windows are
/// considered dead.
const PRESENCE_WINDOWS: u32 = 3;

/// Claim record stored in `rpc:claims:<api>` while a call is in flight.
#[derive(Debug, Serialize, Deserialize)]
struct Claim {
    claimed_at_ms: u64,
    /// The original queue payload, replayed verbatim on reclaim.
    payload: String,
}

pub struct RedisRpcTransport {
    pool: Pool,
    codec: Arc<dyn Codec>,
    options: RedisTransportOptions,
    closed: Arc<AtomicBool>,
}

impl RedisRpcTransport {
    pub fn new(pool: Pool, codec: Arc<dyn Codec>, options: RedisTransportOptions) -> Self {
        Self {
            pool,
            codec,
            options,
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    fn presence_ttl_ms(&self) -> u64 {
        self.options.block_timeout.as_millis() as u64 * PRESENCE_WINDOWS as u64
    }
}

#[async_trait]
impl RpcTransport for RedisRpcTransport {
    async fn open(&self) -> Result<(), TransportError> {
        ping(&self.pool).await?;
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, message: &RpcMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let payload = self.codec.encode_rpc(message)?;
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(TransportError::InvalidMessage(format!(
                "RPC payload is {} bytes, limit is {}",
                payload.len(),
                MAX_MESSAGE_BYTES
            )));
        }

        let mut conn = connection(&self.pool).await?;
        let _: i64 = cmd("LPUSH")
            .arg(rpc_queue_key(&message.api_name))
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(
            id = %message.id,
            address = %message.canonical_name(),
            "RPC published"
        );
        Ok(())
    }

    async fn consume(
        &self,
        api_names: Vec<String>,
        replica: String,
    ) -> Result<Box<dyn RpcConsumer>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        Ok(Box::new(RedisRpcConsumer {
            pool: self.pool.clone(),
            codec: self.codec.clone(),
            options: self.options.clone(),
            closed: self.closed.clone(),
            api_names,
            replica,
            last_reclaim: Instant::now(),
        }))
    }

    async fn responder_count(&self, api_name: &str) -> Result<Option<u64>, TransportError> {
        let mut conn = connection(&self.pool).await?;
        let key = rpc_consumers_key(api_name);
        let horizon = now_ms().saturating_sub(self.presence_ttl_ms());

        // Drop dead replicas, then count the live ones.
        let _: i64 = cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg(0)
            .arg(horizon)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let count: u64 = cmd("ZCARD")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(Some(count))
    }
}

struct RedisRpcConsumer {
    pool: Pool,
    codec: Arc<dyn Codec>,
    options: RedisTransportOptions,
    closed: Arc<AtomicBool>,
    api_names: Vec<String>,
    replica: String,
    last_reclaim: Instant,
}

impl RedisRpcConsumer {
    async fn refresh_presence(
        &self,
        conn: &mut deadpool_redis::Connection,
    ) -> Result<(), TransportError> {
        let now = now_ms();
        for api in &self.api_names {
            let _: i64 = cmd("ZADD")
                .arg(rpc_consumers_key(api))
                .arg(now)
                .arg(&self.replica)
                .query_async(conn)
                .await
                .map_err(command_error)?;
        }
        Ok(())
    }

    /// Re-queue claims older than the acknowledgement timeout.
    async fn reclaim(&self, conn: &mut deadpool_redis::Connection) -> Result<(), TransportError> {
        let horizon = now_ms().saturating_sub(self.options.acknowledgement_timeout.as_millis() as u64);

        for api in &self.api_names {
            let claims: HashMap<String, String> = cmd("HGETALL")
                .arg(rpc_claims_key(api))
                .query_async(conn)
                .await
                .map_err(command_error)?;

            for (message_id, raw) in claims {
                let claim: Claim = match serde_json::from_str(&raw) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(id = %message_id, error = %e, "Dropping unparseable RPC claim");
                        let _: i64 = cmd("HDEL")
                            .arg(rpc_claims_key(api))
                            .arg(&message_id)
                            .query_async(conn)
                            .await
                            .map_err(command_error)?;
                        continue;
                    }
                };
                if claim.claimed_at_ms > horizon {
                    continue;
                }

                // Remove the claim first so only one replica requeues it.
                let removed: i64 = cmd("HDEL")
                    .arg(rpc_claims_key(api))
                    .arg(&message_id)
                    .query_async(conn)
                    .await
                    .map_err(command_error)?;
                if removed == 0 {
                    continue;
                }

                debug!(id = %message_id, api = %api, "Re-queueing expired RPC claim");
                let _: i64 = cmd("RPUSH")
                    .arg(rpc_queue_key(api))
                    .arg(&claim.payload)
                    .query_async(conn)
                    .await
                    .map_err(command_error)?;
            }
        }
        Ok(())
    }

    async fn claim(
        &self,
        conn: &mut deadpool_redis::Connection,
        api_name: &str,
        payload: &str,
        message_id: &MessageId,
    ) -> Result<u32, TransportError> {
        let claim = Claim {
            claimed_at_ms: now_ms(),
            payload: payload.to_string(),
        };
        let raw = serde_json::to_string(&claim)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;

        let _: i64 = cmd("HSET")
            .arg(rpc_claims_key(api_name))
            .arg(message_id.as_str())
            .arg(raw)
            .query_async(conn)
            .await
            .map_err(command_error)?;

        let delivery_count: i64 = cmd("HINCRBY")
            .arg(rpc_deliveries_key(api_name))
            .arg(message_id.as_str())
            .arg(1)
            .query_async(conn)
            .await
            .map_err(command_error)?;

        Ok(delivery_count.max(1) as u32)
    }
}

#[async_trait]
impl RpcConsumer for RedisRpcConsumer {
    async fn next(&mut self) -> Result<Option<Delivery<RpcMessage>>, TransportError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let mut conn = connection(&self.pool).await?;
            self.refresh_presence(&mut conn).await?;

            if self.last_reclaim.elapsed() >= self.options.reclaim_interval {
                self.last_reclaim = Instant::now();
                self.reclaim(&mut conn).await?;
            }

            let mut pop = cmd("BRPOP");
            for api in &self.api_names {
                pop.arg(rpc_queue_key(api));
            }
            pop.arg(self.options.block_timeout.as_secs_f64());

            let popped: Option<(String, String)> =
                pop.query_async(&mut conn).await.map_err(command_error)?;

            let Some((key, payload)) = popped else {
                // Blocking read expired; loop to refresh presence/reclaim.
                continue;
            };
            let api_name = key.strip_prefix("rpc:").unwrap_or(&key).to_string();

            let message = match self.codec.decode_rpc(payload.as_bytes()) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, api = %api_name, "Skipping unparseable RPC payload");
                    continue;
                }
            };

            let delivery_count = self.claim(&mut conn, &api_name, &payload, &message.id).await?;

            let lease = RedisRpcLease {
                pool: self.pool.clone(),
                api_name,
                message_id: message.id.clone(),
                delivery_count,
                native: message.id.to_string(),
            };
            return Ok(Some(Delivery {
                message,
                lease: Box::new(lease),
            }));
        }
    }
}

struct RedisRpcLease {
    pool: Pool,
    api_name: String,
    message_id: MessageId,
    delivery_count: u32,
    native: String,
}

#[async_trait]
impl Lease for RedisRpcLease {
    async fn acknowledge(&mut self) -> Result<(), TransportError> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = cmd("HDEL")
            .arg(rpc_claims_key(&self.api_name))
            .arg(self.message_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let _: i64 = cmd("HDEL")
            .arg(rpc_deliveries_key(&self.api_name))
            .arg(self.message_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    fn native_id(&self) -> &str {
        &self.native
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

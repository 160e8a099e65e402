//! Result transport over short-lived Redis lists.
//!
//! The caller mints an ephemeral return path (`<client_id>.<rpc_id>`) and
//! blocks on `result:<return_path>` with a timeout; the responder pushes a
//! single encoded [`ResultMessage`](crate::message::ResultMessage) there and
//! sets a TTL so abandoned results age out on their own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::debug;
use uuid::Uuid;

use crate::codec::Codec;
use crate::message::{ResultMessage, RpcMessage};
use crate::transport::{ResultTransport, TransportError};

use super::{command_error, connection, ping, result_key, RedisTransportOptions, MAX_MESSAGE_BYTES};

pub struct RedisResultTransport {
    pool: Pool,
    codec: Arc<dyn Codec>,
    options: RedisTransportOptions,
    /// Per-client prefix baked into every return path this transport mints.
    client_id: String,
}

impl RedisResultTransport {
    pub fn new(pool: Pool, codec: Arc<dyn Codec>, options: RedisTransportOptions) -> Self {
        Self {
            pool,
            codec,
            options,
            client_id: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
impl ResultTransport for RedisResultTransport {
    async fn open(&self) -> Result<(), TransportError> {
        ping(&self.pool).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn return_path(&self, rpc_message: &RpcMessage) -> String {
        format!("{}.{}", self.client_id, rpc_message.id)
    }

    async fn send_result(
        &self,
        rpc_message: &RpcMessage,
        result_message: &ResultMessage,
        return_path: &str,
    ) -> Result<(), TransportError> {
        let payload = self.codec.encode_result(result_message)?;
        if payload.len() > MAX_MESSAGE_BYTES {
            return Err(TransportError::InvalidMessage(format!(
                "result payload is {} bytes, limit is {}",
                payload.len(),
                MAX_MESSAGE_BYTES
            )));
        }

        let key = result_key(return_path);
        let mut conn = connection(&self.pool).await?;
        let _: i64 = cmd("LPUSH")
            .arg(&key)
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let _: i64 = cmd("EXPIRE")
            .arg(&key)
            .arg(self.options.result_ttl_grace.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(
            rpc_id = %rpc_message.id,
            return_path = %return_path,
            error = result_message.is_error(),
            "Result sent"
        );
        Ok(())
    }

    async fn receive_result(
        &self,
        _rpc_message: &RpcMessage,
        return_path: &str,
        timeout: Duration,
    ) -> Result<ResultMessage, TransportError> {
        let key = result_key(return_path);
        let mut conn = connection(&self.pool).await?;

        let popped: Option<(String, String)> = cmd("BLPOP")
            .arg(&key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        match popped {
            Some((_, payload)) => Ok(self.codec.decode_result(payload.as_bytes())?),
            None => Err(TransportError::ReceiveTimeout(timeout)),
        }
    }
}

//! Schema transport over a Redis hash.
//!
//! Schemas live in the `schemas` hash, one field per API. Redis hashes have
//! no per-field TTL, so each field is paired with a `schema:alive:<api>`
//! liveness key carrying the TTL; `ping` refreshes the liveness key and
//! `load` treats a dead liveness key as absence (removing the stale field
//! opportunistically).

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::transport::{SchemaTransport, TransportError};

use super::{command_error, connection, ping, schema_alive_key, RedisTransportOptions, SCHEMAS_HASH};

pub struct RedisSchemaTransport {
    pool: Pool,
    options: RedisTransportOptions,
}

impl RedisSchemaTransport {
    pub fn new(pool: Pool, options: RedisTransportOptions) -> Self {
        Self { pool, options }
    }

    async fn is_alive(
        &self,
        conn: &mut deadpool_redis::Connection,
        api_name: &str,
    ) -> Result<bool, TransportError> {
        let exists: i64 = cmd("EXISTS")
            .arg(schema_alive_key(api_name))
            .query_async(conn)
            .await
            .map_err(command_error)?;
        Ok(exists > 0)
    }
}

#[async_trait]
impl SchemaTransport for RedisSchemaTransport {
    async fn open(&self) -> Result<(), TransportError> {
        ping(&self.pool).await
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
        let raw = serde_json::to_string(schema)
            .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;

        let mut conn = connection(&self.pool).await?;
        let _: i64 = cmd("HSET")
            .arg(SCHEMAS_HASH)
            .arg(api_name)
            .arg(raw)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        let _: String = cmd("SET")
            .arg(schema_alive_key(api_name))
            .arg("1")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        debug!(api = %api_name, ttl_secs = ttl.as_secs(), "Schema stored");
        Ok(())
    }

    async fn load(&self, api_name: &str) -> Result<Option<Value>, TransportError> {
        let mut conn = connection(&self.pool).await?;

        if !self.is_alive(&mut conn, api_name).await? {
            // Expired; drop the stale hash field while we are here.
            let _: i64 = cmd("HDEL")
                .arg(SCHEMAS_HASH)
                .arg(api_name)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            return Ok(None);
        }

        let raw: Option<String> = cmd("HGET")
            .arg(SCHEMAS_HASH)
            .arg(api_name)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| TransportError::InvalidMessage(e.to_string())),
            None => Ok(None),
        }
    }

    async fn ping(&self, api_name: &str) -> Result<(), TransportError> {
        let mut conn = connection(&self.pool).await?;
        let _: i64 = cmd("EXPIRE")
            .arg(schema_alive_key(api_name))
            .arg(self.options.schema_ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn api_names(&self) -> Result<Vec<String>, TransportError> {
        let mut conn = connection(&self.pool).await?;
        let names: Vec<String> = cmd("HKEYS")
            .arg(SCHEMAS_HASH)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;

        let mut alive = Vec::with_capacity(names.len());
        for name in names {
            if self.is_alive(&mut conn, &name).await? {
                alive.push(name);
            }
        }
        Ok(alive)
    }
}

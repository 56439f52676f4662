//! Redis-backed implementations of the event-bus and key-value seams.
//!
//! Streams are appended with XADD (approximate MAXLEN trimming where a
//! bound is given); the pending store and ledgers use plain string, set
//! and hash commands with TTLs.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

use opsfabric_core::bus::{EventBus, FlatFields, KvStore};
use opsfabric_core::error::{FabricError, Result};

fn store_err(e: redis::RedisError) -> FabricError {
    FabricError::Network {
        message: format!("redis: {e}"),
    }
}

/// Opens one multiplexed connection shared by both seam implementations.
pub async fn connect(url: &str) -> Result<(RedisKv, RedisBus)> {
    let client = redis::Client::open(url).map_err(store_err)?;
    let conn = client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(store_err)?;
    info!(url, "connected to redis");
    Ok((RedisKv { conn: conn.clone() }, RedisBus { conn }))
}

pub struct RedisKv {
    conn: MultiplexedConnection,
}

#[async_trait]
impl KvStore for RedisKv {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs())
            .await
            .map_err(store_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(store_err)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(key, member).await.map_err(store_err)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(key, member).await.map_err(store_err)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.sismember(key, member).await.map_err(store_err)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(key).await.map_err(store_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(store_err)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(store_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64)
            .await
            .map_err(store_err)
    }
}

pub struct RedisBus {
    conn: MultiplexedConnection,
}

#[async_trait]
impl EventBus for RedisBus {
    async fn append(&self, stream: &str, fields: FlatFields, maxlen: Option<usize>) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(maxlen) = maxlen {
            cmd.arg("MAXLEN").arg("~").arg(maxlen);
        }
        cmd.arg("*");
        for (k, v) in &fields {
            cmd.arg(k).arg(v);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(store_err)?;
        Ok(())
    }

    async fn range_scan(&self, stream: &str) -> Result<Vec<FlatFields>> {
        let mut conn = self.conn.clone();
        let reply: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(stream)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(reply.into_iter().map(|(_id, fields)| fields).collect())
    }

    async fn len(&self, stream: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(store_err)
    }
}

//! Short-lived coordination store: task-running locks, proxy-blocked markers, the proxy-list
//! cache, and pub/sub of found-item events. The teacher carries no KV-store dependency itself
//! (its coordination primitives are all in Postgres); this module is grounded instead on the
//! pack's canonical async-Redis users and follows the teacher's general struct-wraps-a-client,
//! `async_trait`-object shape (see `Queue`/`ObjectStore`).

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomic `SET key value NX EX=ttl`. Returns `true` if the lock was acquired, `false` if
    /// another holder already has it.
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Reads the ISO-8601 acquisition timestamp stored under `key`, if present.
    async fn lock_acquired_at(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// `EXPIRE key ttl`, provided the key still exists. Returns `false` if the key was absent
    /// (meaning someone else cleared it while the caller held what it believed was the lock).
    async fn refresh_lock(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn try_acquire_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let value = Utc::now().to_rfc3339();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn lock_acquired_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    async fn refresh_lock(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let applied: bool = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(applied)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }
}

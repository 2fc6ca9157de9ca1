//! Durable work queue: generalizes the teacher's `SELECT ... FOR UPDATE SKIP LOCKED` +
//! `invisible_until` pattern with retry-count headers and dead-lettering, per the Message
//! Broker Contract (persistent messages, per-consumer QoS, delayed redelivery, DLQ on retry
//! exhaustion).

use crate::error::{Error, ErrorKind, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// A message popped off a queue, carrying the wire headers the broker contract mandates:
/// `x-retry-count`, `x-published-at` (`x-task-id` lives inside `payload` since every payload
/// this system ever queues is a `parsing_task` carrying its own `task_id`).
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub ack_token: String,
    pub message_id: String,
    pub queue_name: String,
    pub payload: Value,
    pub deliveries: i32,
    pub retry_count: i32,
    pub published_at: DateTime<Utc>,
}

#[async_trait]
pub trait Queue: Send + Sync {
    async fn publish(&self, queue: &str, payload: Value, available_at: DateTime<Utc>)
        -> Result<String>;

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>>;

    async fn ack(&self, ack_token: &str) -> Result<()>;

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()>;

    /// Reports a worker-side failure for a received message, implementing the retry policy:
    /// either republish with `delay = min(60 * 2^retry_count, 600)` seconds, or — once
    /// `retry_count` has reached `max_retries` — insert a row into `parsing_tasks_dlq` and ack
    /// the original so it is never redelivered.
    async fn fail(&self, msg: &QueueMessage, max_retries: i32, error: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `min(60 * 2^retry_count, 600)` seconds, per the broker contract's retry policy.
    pub fn retry_delay(retry_count: i32) -> Duration {
        let capped_exp = retry_count.clamp(0, 16);
        let secs = 60u64.saturating_mul(1u64 << capped_exp);
        Duration::from_secs(secs.min(600))
    }
}

#[async_trait]
impl Queue for PgQueue {
    async fn publish(
        &self,
        queue: &str,
        payload: Value,
        available_at: DateTime<Utc>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO queue_messages (message_id, queue_name, payload, available_at, published_at)
            VALUES ($1, $2, $3, $4, now())
            "#,
        )
        .bind(message_id)
        .bind(queue)
        .bind(payload)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        Ok(message_id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        max: i64,
        visibility_timeout: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let visibility_millis = duration_millis(visibility_timeout);
        let rows = sqlx::query(
            r#"
            WITH picked AS (
              SELECT message_id
              FROM queue_messages
              WHERE queue_name = $1
                AND available_at <= now()
                AND (invisible_until IS NULL OR invisible_until <= now())
              ORDER BY available_at, created_at
              LIMIT $2
              FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_messages AS m
            SET invisible_until = now() + ($3::text || ' milliseconds')::interval,
                deliveries = deliveries + 1
            FROM picked
            WHERE m.message_id = picked.message_id
            RETURNING m.message_id, m.queue_name, m.payload, m.deliveries, m.retry_count, m.published_at
            "#,
        )
        .bind(queue)
        .bind(max)
        .bind(visibility_millis)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let message_id: Uuid = row.try_get("message_id")?;
            let message_id = message_id.to_string();
            messages.push(QueueMessage {
                ack_token: message_id.clone(),
                message_id,
                queue_name: row.try_get("queue_name")?,
                payload: row.try_get("payload")?,
                deliveries: row.try_get("deliveries")?,
                retry_count: row.try_get("retry_count")?,
                published_at: row.try_get("published_at")?,
            });
        }

        Ok(messages)
    }

    async fn ack(&self, ack_token: &str) -> Result<()> {
        let message_id = parse_ack_token(ack_token)?;
        sqlx::query("DELETE FROM queue_messages WHERE message_id = $1")
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn nack_or_requeue(&self, ack_token: &str, delay: Duration) -> Result<()> {
        let message_id = parse_ack_token(ack_token)?;
        let delay_millis = duration_millis(delay);
        sqlx::query(
            r#"
            UPDATE queue_messages
            SET available_at = now() + ($2::text || ' milliseconds')::interval,
                invisible_until = NULL,
                retry_count = retry_count + 1
            WHERE message_id = $1
            "#,
        )
        .bind(message_id)
        .bind(delay_millis)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, msg: &QueueMessage, max_retries: i32, error: &str) -> Result<()> {
        if msg.retry_count >= max_retries {
            tracing::warn!(
                event = "marketwatch.queue.dead_letter",
                queue = %msg.queue_name,
                message_id = %msg.message_id,
                retry_count = msg.retry_count,
                "message exhausted retries, diverting to dead-letter table"
            );
            sqlx::query(
                r#"
                INSERT INTO parsing_tasks_dlq (id, original_queue, payload, error, retry_count, failed_at)
                VALUES ($1, $2, $3, $4, $5, now())
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&msg.queue_name)
            .bind(&msg.payload)
            .bind(error)
            .bind(msg.retry_count)
            .execute(&self.pool)
            .await?;
            return self.ack(&msg.ack_token).await;
        }

        let delay = Self::retry_delay(msg.retry_count);
        self.nack_or_requeue(&msg.ack_token, delay).await
    }
}

/// Reads up to `max` pending dead-letter rows for a queue, oldest first. Used by operational
/// tooling and tests; the worker/scheduler never read from this table themselves.
pub async fn list_dlq_entries(
    pool: &PgPool,
    original_queue: &str,
    max: i64,
) -> Result<Vec<crate::models::DlqEntry>> {
    let rows = sqlx::query(
        r#"
        SELECT id, original_queue, payload, error, retry_count, failed_at
        FROM parsing_tasks_dlq
        WHERE original_queue = $1
        ORDER BY failed_at
        LIMIT $2
        "#,
    )
    .bind(original_queue)
    .bind(max)
    .fetch_all(pool)
    .await?;

    rows.iter().map(crate::models::DlqEntry::from_row).collect()
}

fn parse_ack_token(ack_token: &str) -> Result<Uuid> {
    Uuid::parse_str(ack_token)
        .map_err(|e| Error::new(ErrorKind::ParsePayload, anyhow::Error::from(e)))
}

fn duration_millis(d: Duration) -> i64 {
    let ms = d.as_millis();
    if ms > i64::MAX as u128 {
        i64::MAX
    } else {
        ms as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(PgQueue::retry_delay(0), Duration::from_secs(60));
        assert_eq!(PgQueue::retry_delay(1), Duration::from_secs(120));
        assert_eq!(PgQueue::retry_delay(2), Duration::from_secs(240));
        assert_eq!(PgQueue::retry_delay(10), Duration::from_secs(600));
    }

    /// Requires a live Postgres reachable via `DATABASE_URL`, migrated with this crate's
    /// `migrations/` directory. Mirrors the teacher's own
    /// `publish_receive_ack_requeue_visibility` test.
    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn publish_receive_ack_requeue_visibility() -> anyhow::Result<()> {
        use anyhow::Context;
        use sqlx::postgres::PgPoolOptions;

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("connect database")?;

        let queue_name = format!("pgqueue_test_{}", Uuid::new_v4());
        let pgq = PgQueue::new(pool);

        let available_at = Utc::now() - chrono::Duration::seconds(5);

        let id1 = pgq
            .publish(&queue_name, serde_json::json!({"n": 1}), available_at)
            .await?;
        let id2 = pgq
            .publish(&queue_name, serde_json::json!({"n": 2}), available_at)
            .await?;

        let mut got = pgq
            .receive(&queue_name, 2, Duration::from_millis(200))
            .await?;
        got.sort_by_key(|m| m.payload["n"].as_i64().unwrap_or_default());
        anyhow::ensure!(got.len() == 2, "expected 2 messages, got {}", got.len());
        anyhow::ensure!(got[0].message_id == id1 || got[0].message_id == id2);

        pgq.ack(&id1).await?;
        pgq.nack_or_requeue(&id2, Duration::from_millis(200))
            .await?;

        let got2 = pgq
            .receive(&queue_name, 10, Duration::from_millis(200))
            .await?;
        anyhow::ensure!(
            got2.is_empty(),
            "expected no visible messages immediately after requeue"
        );

        tokio::time::sleep(Duration::from_millis(250)).await;

        let got3 = pgq
            .receive(&queue_name, 10, Duration::from_millis(200))
            .await?;
        anyhow::ensure!(got3.len() == 1, "expected 1 message after delay");
        anyhow::ensure!(got3[0].message_id == id2);
        pgq.ack(&id2).await?;

        Ok(())
    }

    /// Covers invariant 7 (retry bound): once a message's `retry_count` has reached
    /// `max_retries`, `fail` diverts it to the DLQ instead of requeuing it. Drives `retry_count`
    /// directly rather than waiting out real (minutes-scale) retry delays.
    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn fail_diverts_to_dlq_once_retries_exhausted() -> anyhow::Result<()> {
        use anyhow::Context;
        use sqlx::postgres::PgPoolOptions;

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("connect database")?;

        let queue_name = format!("pgqueue_test_{}", Uuid::new_v4());
        let pgq = PgQueue::new(pool.clone());

        let message_id = pgq
            .publish(&queue_name, serde_json::json!({"n": 1}), Utc::now())
            .await?;
        let max_retries = 2;

        // Not yet exhausted: fail() requeues rather than dead-lettering.
        let not_exhausted = QueueMessage {
            ack_token: message_id.clone(),
            message_id: message_id.clone(),
            queue_name: queue_name.clone(),
            payload: serde_json::json!({"n": 1}),
            deliveries: 1,
            retry_count: max_retries - 1,
            published_at: Utc::now(),
        };
        pgq.fail(&not_exhausted, max_retries, "upstream timeout")
            .await?;
        let dlq_before = list_dlq_entries(&pool, &queue_name, 10).await?;
        anyhow::ensure!(dlq_before.is_empty(), "should not dead-letter before exhaustion");

        // Exhausted: fail() dead-letters and acks the original message.
        let exhausted = QueueMessage {
            retry_count: max_retries,
            ..not_exhausted
        };
        pgq.fail(&exhausted, max_retries, "upstream timeout")
            .await?;

        let remaining = pgq
            .receive(&queue_name, 1, Duration::from_millis(50))
            .await?;
        anyhow::ensure!(remaining.is_empty(), "original queue should be drained");

        let dlq = list_dlq_entries(&pool, &queue_name, 10).await?;
        anyhow::ensure!(dlq.len() == 1, "expected exactly one DLQ row");

        Ok(())
    }
}

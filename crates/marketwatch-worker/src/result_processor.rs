//! Result Processor (C8): deduplicates matched listings against persisted `FoundItem` rows,
//! inserts new rows, and fans out notifications at-most-once per row.
//!
//! Grounded on `results_processor_service.py`'s `process_results`/`_publish_notifications`:
//! dedupe by listing identifier with a tuple fallback, commit-before-publish ordering, and a
//! race-guard re-check of `notification_sent` immediately before flipping it.

use crate::fetcher::FetchedListing;
use marketwatch_core::{kv::KvStore, ErrorKind, FoundItem, MonitoringTask, Result, ResultExt};
use sqlx::PgPool;

/// Inserts newly-observed listings as `FoundItem` rows, skipping any that collide on the dedupe
/// key (listing identifier when present, else `(task_id, item_name, price)`). Returns only the
/// rows that were actually inserted.
pub async fn process_results(
    pool: &PgPool,
    task: &MonitoringTask,
    listings: &[FetchedListing],
) -> Result<Vec<FoundItem>> {
    let mut tx = pool.begin().await?;
    let mut inserted = Vec::new();

    for listing in listings {
        let item_data = listing.item_data.to_string();

        let row = if let Some(listing_id) = &listing.listing_id {
            sqlx::query(
                r#"
                INSERT INTO found_items (task_id, item_name, price, item_data, listing_id, market_url)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (task_id, listing_id) WHERE listing_id IS NOT NULL DO NOTHING
                RETURNING id, task_id, item_name, price, item_data, listing_id, market_url,
                          notification_sent, notification_sent_at, found_at
                "#,
            )
            .bind(task.id)
            .bind(&listing.item_name)
            .bind(listing.price)
            .bind(&item_data)
            .bind(listing_id)
            .bind(&listing.market_url)
            .fetch_optional(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                INSERT INTO found_items (task_id, item_name, price, item_data, listing_id, market_url)
                VALUES ($1, $2, $3, $4, NULL, $5)
                ON CONFLICT (task_id, item_name, price) WHERE listing_id IS NULL DO NOTHING
                RETURNING id, task_id, item_name, price, item_data, listing_id, market_url,
                          notification_sent, notification_sent_at, found_at
                "#,
            )
            .bind(task.id)
            .bind(&listing.item_name)
            .bind(listing.price)
            .bind(&item_data)
            .bind(&listing.market_url)
            .fetch_optional(&mut *tx)
            .await?
        };

        if let Some(row) = row {
            inserted.push(FoundItem::from_row(&row)?);
        }
    }

    if !inserted.is_empty() {
        sqlx::query("UPDATE monitoring_tasks SET items_found = items_found + $2 WHERE id = $1")
            .bind(task.id)
            .bind(inserted.len() as i64)
            .execute(&mut *tx)
            .await?;
    }

    // Supplements the worker's own next_check update: if this task has never been scheduled (or
    // fell behind), give it a forward-looking next_check in the same transaction as the insert.
    sqlx::query(
        r#"
        UPDATE monitoring_tasks
        SET next_check = now() + (check_interval::text || ' seconds')::interval
        WHERE id = $1 AND (next_check IS NULL OR next_check <= now())
        "#,
    )
    .bind(task.id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(inserted)
}

/// Publishes a `found_item` event for each newly-inserted row, committing
/// `notification_sent = true` *before* publishing. Duplicate events on the bus are tolerable
/// (the notifier re-checks `notification_sent` itself); a dropped event is recoverable because
/// the row remains durable with `notification_sent = true` already set.
pub async fn publish_notifications(
    pool: &PgPool,
    kv: &dyn KvStore,
    task: &MonitoringTask,
    rows: &[FoundItem],
) -> Result<()> {
    for row in rows {
        let mut tx = pool.begin().await?;

        let already_sent: bool =
            sqlx::query_scalar("SELECT notification_sent FROM found_items WHERE id = $1 FOR UPDATE")
                .bind(row.id)
                .fetch_one(&mut *tx)
                .await?;
        if already_sent {
            tx.rollback().await?;
            continue;
        }

        sqlx::query(
            "UPDATE found_items SET notification_sent = true, notification_sent_at = now() WHERE id = $1",
        )
        .bind(row.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let event = serde_json::json!({
            "type": "found_item",
            "item_id": row.id,
            "task_id": task.id,
            "item_name": row.item_name,
            "price": row.price,
            "market_url": row.market_url,
            "item_data_json": row.item_data,
            "task_name": task.name,
        });
        let payload = serde_json::to_string(&event)
            .map_err(anyhow::Error::from)
            .kind(ErrorKind::ParsePayload)?;
        kv.publish("found_items", &payload).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingKv {
        published: StdMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl KvStore for RecordingKv {
        async fn try_acquire_lock(&self, _key: &str, _ttl: std::time::Duration) -> Result<bool> {
            Ok(true)
        }
        async fn lock_acquired_at(
            &self,
            _key: &str,
        ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
            Ok(None)
        }
        async fn refresh_lock(&self, _key: &str, _ttl: std::time::Duration) -> Result<bool> {
            Ok(true)
        }
        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: &str,
            _ttl: std::time::Duration,
        ) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }
        async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn sample_task(id: i64) -> MonitoringTask {
        MonitoringTask {
            id,
            name: "AK-47 Redline watch".to_string(),
            item_name: "AK-47 | Redline".to_string(),
            appid: 730,
            currency: 1,
            filters: marketwatch_core::SearchFilters {
                item_name: "AK-47 | Redline".to_string(),
                appid: 730,
                currency: 1,
                max_price: None,
                float_range: None,
                pattern_list: None,
                stickers_filter: None,
                auto_update_base_price: false,
                base_price_update_interval: None,
            },
            is_active: true,
            check_interval: 60,
            total_checks: 0,
            items_found: 0,
            last_check: None,
            next_check: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_row(id: i64, listing_id: Option<&str>) -> FoundItem {
        FoundItem {
            id,
            task_id: 1,
            item_name: "AK-47 | Redline".to_string(),
            price: 12.5,
            item_data: "{}".to_string(),
            listing_id: listing_id.map(str::to_string),
            market_url: Some("https://market.example/listing/1".to_string()),
            notification_sent: false,
            notification_sent_at: None,
            found_at: Utc::now(),
        }
    }

    /// Covers invariant 4 (notification payload shape): the event carries the fields the
    /// notifier depends on, with `item_data_json` passed through as the opaque parsed payload
    /// rather than re-serialized.
    #[test]
    fn publish_notifications_event_shape() {
        let task = sample_task(1);
        let row = sample_row(42, Some("listing-1"));
        let event = serde_json::json!({
            "type": "found_item",
            "item_id": row.id,
            "task_id": task.id,
            "item_name": row.item_name,
            "price": row.price,
            "market_url": row.market_url,
            "item_data_json": row.item_data,
            "task_name": task.name,
        });
        assert_eq!(event["type"], "found_item");
        assert_eq!(event["item_id"], 42);
        assert_eq!(event["task_name"], "AK-47 Redline watch");
    }

    /// Requires a live Postgres reachable via `DATABASE_URL`, migrated with this workspace's
    /// `migrations/` directory. Covers invariant 3 (no duplicate FoundItem): re-processing the
    /// same listing twice inserts it only once, whether deduped by listing identifier or by the
    /// `(task_id, item_name, price)` fallback.
    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn process_results_dedupes_by_listing_id_and_fallback_tuple() -> anyhow::Result<()> {
        use anyhow::Context;
        use sqlx::postgres::PgPoolOptions;

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .context("connect database")?;

        let row = sqlx::query(
            r#"
            INSERT INTO monitoring_tasks (name, item_name, appid, currency, filters, check_interval)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind("dedupe test task")
        .bind("AK-47 | Redline")
        .bind(730)
        .bind(1)
        .bind(serde_json::json!({
            "item_name": "AK-47 | Redline", "appid": 730, "currency": 1
        }))
        .bind(60)
        .fetch_one(&pool)
        .await?;
        let task_id: i64 = sqlx::Row::try_get(&row, "id")?;
        let mut task = sample_task(task_id);
        task.id = task_id;

        let with_listing_id = FetchedListing {
            listing_id: Some("listing-abc".to_string()),
            item_name: "AK-47 | Redline".to_string(),
            price: 12.5,
            item_data: serde_json::json!({"wear": "field-tested"}),
            market_url: Some("https://market.example/listing/abc".to_string()),
        };
        let without_listing_id = FetchedListing {
            listing_id: None,
            item_name: "AK-47 | Redline".to_string(),
            price: 9.0,
            item_data: serde_json::json!({"wear": "minimal-wear"}),
            market_url: None,
        };

        let first_pass = process_results(
            &pool,
            &task,
            &[with_listing_id.clone(), without_listing_id.clone()],
        )
        .await?;
        anyhow::ensure!(first_pass.len() == 2, "expected both listings inserted once");

        let second_pass =
            process_results(&pool, &task, &[with_listing_id, without_listing_id]).await?;
        anyhow::ensure!(
            second_pass.is_empty(),
            "re-processing identical listings must not insert duplicates"
        );

        let kv = RecordingKv::default();
        publish_notifications(&pool, &kv, &task, &first_pass).await?;
        anyhow::ensure!(
            kv.published.lock().unwrap().len() == 2,
            "expected one event per newly-inserted row"
        );

        // Re-publishing the same rows must not double-send: notification_sent is already true.
        publish_notifications(&pool, &kv, &task, &first_pass).await?;
        anyhow::ensure!(
            kv.published.lock().unwrap().len() == 2,
            "re-publishing already-sent rows must not emit a second event"
        );

        sqlx::query("DELETE FROM monitoring_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&pool)
            .await?;

        Ok(())
    }
}

//! Task-authoring contract (C11): the operations an external front-end must be able to invoke
//! against this core. Plain async library methods, not an HTTP surface — the chat front-end
//! that would call these is explicitly out of scope.
//!
//! Grounded on `monitoring_service.py`'s `add_monitoring_task`/`update_monitoring_task`/
//! `delete_monitoring_task`/`get_all_tasks`/`get_statistics`, expressed in the teacher's
//! struct-wraps-a-pool, `marketwatch_core::Result`-returning method shape.

use chrono::Utc;
use marketwatch_core::{
    kv::KvStore, queue::Queue, Error, ErrorKind, MonitoringTask, Proxy, Result, SearchFilters,
};
use marketwatch_proxy::ProxyPool;
use marketwatch_scheduler::Scheduler;
use sqlx::{PgPool, Row};
use std::sync::Arc;

pub struct CreateTaskRequest {
    pub name: String,
    pub item_name: String,
    pub appid: i32,
    pub currency: i32,
    pub filters: SearchFilters,
    pub check_interval: i32,
}

/// Any field left `None` is unchanged.
#[derive(Default)]
pub struct UpdateTaskRequest {
    pub name: Option<String>,
    pub filters: Option<SearchFilters>,
    pub check_interval: Option<i32>,
    pub is_active: Option<bool>,
}

pub struct Statistics {
    pub total_tasks: i64,
    pub active_tasks: i64,
    pub total_items_found: i64,
    pub per_task: Vec<TaskSnapshot>,
}

pub struct TaskSnapshot {
    pub task_id: i64,
    pub name: String,
    pub is_active: bool,
    pub total_checks: i64,
    pub items_found: i64,
    pub last_check: Option<chrono::DateTime<Utc>>,
}

pub struct Admin {
    pool: PgPool,
    kv: Arc<dyn KvStore>,
    queue: Arc<dyn Queue>,
    proxies: Arc<ProxyPool>,
    scheduler: Arc<Scheduler>,
    job_queue_name: String,
}

impl Admin {
    pub fn new(
        pool: PgPool,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn Queue>,
        proxies: Arc<ProxyPool>,
        scheduler: Arc<Scheduler>,
        job_queue_name: String,
    ) -> Self {
        Self {
            pool,
            kv,
            queue,
            proxies,
            scheduler,
            job_queue_name,
        }
    }

    /// Inserts the task, clears any pre-existing stale `task_running:{id}` lock, publishes one
    /// immediate job, and registers the task's control loop with the Scheduler.
    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<i64> {
        if req.check_interval < 10 {
            return Err(Error::msg(
                ErrorKind::Configuration,
                "check_interval must be at least 10 seconds",
            ));
        }

        let filters_json = serde_json::to_value(&req.filters)
            .map_err(|e| Error::new(ErrorKind::ParsePayload, e))?;

        let row = sqlx::query(
            r#"
            INSERT INTO monitoring_tasks (name, item_name, appid, currency, filters, check_interval)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&req.name)
        .bind(&req.item_name)
        .bind(req.appid)
        .bind(req.currency)
        .bind(&filters_json)
        .bind(req.check_interval)
        .fetch_one(&self.pool)
        .await?;
        let task_id: i64 = row.try_get("id")?;

        self.kv.delete(&format!("task_running:{task_id}")).await?;

        self.queue
            .publish(
                &self.job_queue_name,
                serde_json::json!({
                    "type": "parsing_task",
                    "task_id": task_id,
                    "item_name": req.item_name,
                    "appid": req.appid,
                    "currency": req.currency,
                    "filters_json": filters_json,
                }),
                Utc::now(),
            )
            .await?;

        self.scheduler.spawn_task(task_id).await;

        tracing::info!(
            event = "marketwatch.admin.task_created",
            task_id,
            name = %req.name,
            "monitoring task created"
        );
        Ok(task_id)
    }

    /// Applies any subset of fields. An `is_active` change converges in the scheduler's control
    /// loop within one reload cadence (spec'd at ~once/minute); callers needing a faster signal
    /// should also call `stop_task`/`spawn_task` directly.
    pub async fn update_task(&self, task_id: i64, req: UpdateTaskRequest) -> Result<()> {
        if let Some(interval) = req.check_interval {
            if interval < 10 {
                return Err(Error::msg(
                    ErrorKind::Configuration,
                    "check_interval must be at least 10 seconds",
                ));
            }
        }

        let current = self.get_task(task_id).await?;
        let Some(current) = current else {
            return Err(Error::msg(
                ErrorKind::TaskNotFound,
                format!("no monitoring task with id {task_id}"),
            ));
        };

        let name = req.name.unwrap_or(current.name);
        let filters = req.filters.unwrap_or(current.filters);
        let check_interval = req.check_interval.unwrap_or(current.check_interval);
        let is_active = req.is_active.unwrap_or(current.is_active);

        let filters_json = serde_json::to_value(&filters)
            .map_err(|e| Error::new(ErrorKind::ParsePayload, e))?;

        sqlx::query(
            r#"
            UPDATE monitoring_tasks
            SET name = $2, filters = $3, check_interval = $4, is_active = $5, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(&name)
        .bind(&filters_json)
        .bind(check_interval)
        .bind(is_active)
        .execute(&self.pool)
        .await?;

        if is_active && !current.is_active {
            self.scheduler.spawn_task(task_id).await;
        } else if !is_active && current.is_active {
            self.scheduler.stop_task(task_id).await;
        }

        Ok(())
    }

    /// Cascade-deletes found items (`ON DELETE CASCADE`), clears the task-running lock, stops
    /// the scheduler's control loop, and removes the row.
    pub async fn delete_task(&self, task_id: i64) -> Result<()> {
        self.scheduler.stop_task(task_id).await;
        self.kv.delete(&format!("task_running:{task_id}")).await?;
        sqlx::query("DELETE FROM monitoring_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        tracing::info!(
            event = "marketwatch.admin.task_deleted",
            task_id,
            "monitoring task deleted"
        );
        Ok(())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<MonitoringTask>> {
        let row = sqlx::query("SELECT * FROM monitoring_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(MonitoringTask::from_row).transpose()
    }

    /// Read-only snapshot; `active_only = true` restricts to `is_active`.
    pub async fn list_tasks(&self, active_only: bool) -> Result<Vec<MonitoringTask>> {
        let rows = if active_only {
            sqlx::query("SELECT * FROM monitoring_tasks WHERE is_active ORDER BY id")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM monitoring_tasks ORDER BY id")
                .fetch_all(&self.pool)
                .await?
        };
        rows.iter().map(MonitoringTask::from_row).collect()
    }

    pub async fn add_proxy(&self, raw_url: &str) -> Result<i64> {
        self.proxies.add(raw_url).await
    }

    pub async fn remove_proxy(&self, proxy_id: i64) -> Result<()> {
        self.proxies.remove(proxy_id).await
    }

    pub async fn list_proxies(&self) -> Result<Vec<Proxy>> {
        self.proxies.list().await
    }

    pub async fn get_statistics(&self) -> Result<Statistics> {
        let row = sqlx::query(
            r#"
            SELECT
              count(*) AS total_tasks,
              count(*) FILTER (WHERE is_active) AS active_tasks,
              coalesce(sum(items_found), 0)::bigint AS total_items_found
            FROM monitoring_tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let task_rows = sqlx::query(
            "SELECT id, name, is_active, total_checks, items_found, last_check
             FROM monitoring_tasks ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        let per_task = task_rows
            .iter()
            .map(|row| {
                Ok(TaskSnapshot {
                    task_id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    is_active: row.try_get("is_active")?,
                    total_checks: row.try_get("total_checks")?,
                    items_found: row.try_get("items_found")?,
                    last_check: row.try_get("last_check")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Statistics {
            total_tasks: row.try_get("total_tasks")?,
            active_tasks: row.try_get("active_tasks")?,
            total_items_found: row.try_get("total_items_found")?,
            per_task,
        })
    }
}

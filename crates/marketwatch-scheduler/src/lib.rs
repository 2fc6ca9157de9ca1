//! Per-task control loop registry. Re-architects the original's "per-task background coroutine
//! set" as an explicit registry keyed by task id (spec section 9): one long-running unit of work
//! per entry, with explicit start/stop/recovery lifecycle.
//!
//! Grounded on `monitoring_service.py`'s `monitor_loop`/`recovery_loop` for the decision cadence
//! and backoff shape, and on the teacher's `reap_expired_leases_once`/`head_observer_tick_once`
//! for the "poll, act, log-and-continue on a per-row error" tick structure.

pub mod decide;

use chrono::{DateTime, Utc};
use decide::{classify_lock, tick, LockState, Tick};
use marketwatch_core::{kv::KvStore, queue::Queue, MonitoringTask};
use sqlx::{PgPool, Row};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{watch, Mutex};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_name: String,
    /// Iterations between full row reloads; chosen so reload happens roughly once a minute.
    pub reload_every: u64,
    pub recovery_backoff_base: Duration,
    pub recovery_backoff_cap: Duration,
    pub recovery_max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_name: "parsing_tasks".to_string(),
            reload_every: 6,
            recovery_backoff_base: Duration::from_secs(60),
            recovery_backoff_cap: Duration::from_secs(600),
            recovery_max_attempts: 10,
        }
    }
}

pub struct Scheduler {
    pool: PgPool,
    kv: Arc<dyn KvStore>,
    queue: Arc<dyn Queue>,
    config: SchedulerConfig,
    loops: Mutex<HashMap<i64, watch::Sender<bool>>>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn Queue>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            kv,
            queue,
            config,
            loops: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns a control loop for every currently-active task. Called once at process startup;
    /// on restart, loops resume purely from C1 state, with no coordination required against
    /// workers that may still be running.
    pub async fn start_all(self: &Arc<Self>) -> anyhow::Result<()> {
        let rows = sqlx::query("SELECT id FROM monitoring_tasks WHERE is_active")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let task_id: i64 = row.try_get("id")?;
            self.spawn_task(task_id).await;
        }
        Ok(())
    }

    /// Starts a control loop for `task_id` if one isn't already registered. Idempotent, so the
    /// task-authoring contract can call this unconditionally after creating a task.
    pub async fn spawn_task(self: &Arc<Self>, task_id: i64) {
        let mut loops = self.loops.lock().await;
        if loops.contains_key(&task_id) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        loops.insert(task_id, shutdown_tx);
        drop(loops);

        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.recovery_loop(task_id, shutdown_rx).await;
        });
    }

    /// Signals the control loop for `task_id` to stop. Used when a task is deleted or
    /// deactivated outside the loop's own reload cadence (e.g. an admin-triggered delete should
    /// not wait up to a minute for the loop to notice the row is gone).
    pub async fn stop_task(&self, task_id: i64) {
        let mut loops = self.loops.lock().await;
        if let Some(tx) = loops.remove(&task_id) {
            let _ = tx.send(true);
        }
    }

    pub async fn shutdown(&self) {
        let mut loops = self.loops.lock().await;
        for (_, tx) in loops.drain() {
            let _ = tx.send(true);
        }
    }

    async fn recovery_loop(self: Arc<Self>, task_id: i64, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.control_loop(task_id, shutdown.clone()).await {
                Ok(()) => {
                    tracing::info!(
                        event = "marketwatch.scheduler.control_loop_stopped",
                        task_id,
                        "control loop terminated (task deleted, inactive, or shutdown)"
                    );
                    return;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > self.config.recovery_max_attempts {
                        tracing::error!(
                            event = "marketwatch.scheduler.recovery_exhausted",
                            task_id,
                            attempts = attempt,
                            error = %err,
                            "control loop crashed repeatedly, giving up on this task"
                        );
                        return;
                    }

                    let backoff = recovery_backoff(
                        attempt,
                        self.config.recovery_backoff_base,
                        self.config.recovery_backoff_cap,
                    );
                    tracing::warn!(
                        event = "marketwatch.scheduler.control_loop_crashed",
                        task_id,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %err,
                        "restarting control loop after backoff"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn control_loop(
        &self,
        task_id: i64,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut task = match self.load_task(task_id).await? {
            Some(task) if task.is_active => task,
            _ => return Ok(()),
        };

        let mut iteration: u64 = 0;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            if iteration % self.config.reload_every == 0 {
                match self.load_task(task_id).await? {
                    Some(reloaded) if reloaded.is_active => task = reloaded,
                    _ => return Ok(()),
                }
            }
            iteration += 1;

            let now = Utc::now();
            let lock_key = format!("task_running:{task_id}");
            let lock_state = self.lock_state(&lock_key, now).await;
            let check_interval = Duration::from_secs(task.check_interval.max(10) as u64);

            match tick(now, task.next_check, check_interval, lock_state) {
                Tick::WaitUntil(until) => {
                    self.sleep_or_shutdown((until - now).to_std().unwrap_or_default(), &mut shutdown)
                        .await;
                }
                Tick::Enqueue { clear_stuck_lock } => {
                    if clear_stuck_lock {
                        tracing::warn!(
                            event = "marketwatch.scheduler.stuck_lock_cleared",
                            task_id,
                            "deleting stale task-running lock"
                        );
                        self.kv.delete(&lock_key).await?;
                    }
                    self.enqueue(&task).await?;
                    self.sleep_or_shutdown(check_interval, &mut shutdown).await;
                }
                Tick::SkipAndAdvance { advance_to } => {
                    sqlx::query("UPDATE monitoring_tasks SET next_check = $2 WHERE id = $1")
                        .bind(task_id)
                        .bind(advance_to)
                        .execute(&self.pool)
                        .await?;
                    task.next_check = Some(advance_to);
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }
        }
    }

    async fn sleep_or_shutdown(&self, duration: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn lock_state(&self, key: &str, now: DateTime<Utc>) -> LockState {
        match self.kv.lock_acquired_at(key).await {
            Ok(Some(acquired_at)) => classify_lock(acquired_at, now),
            Ok(None) => LockState::Absent,
            Err(err) => {
                tracing::warn!(
                    event = "marketwatch.scheduler.kv_unavailable",
                    error = %err,
                    "treating lock as absent while the coordination store is unreachable"
                );
                LockState::Absent
            }
        }
    }

    async fn load_task(&self, task_id: i64) -> anyhow::Result<Option<MonitoringTask>> {
        let row = sqlx::query("SELECT * FROM monitoring_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref()
            .map(MonitoringTask::from_row)
            .transpose()
            .map_err(anyhow::Error::from)
    }

    async fn enqueue(&self, task: &MonitoringTask) -> anyhow::Result<()> {
        let payload = serde_json::json!({
            "type": "parsing_task",
            "task_id": task.id,
            "item_name": task.item_name,
            "appid": task.appid,
            "currency": task.currency,
            "filters_json": task.filters,
        });
        self.queue
            .publish(&self.config.queue_name, payload, Utc::now())
            .await
            .map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// Exponential backoff capped at `cap`, matching `monitoring_service.py`'s recovery loop
/// (60s doubling to a 600s cap).
fn recovery_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let secs = base.as_secs().saturating_mul(1u64 << exp);
    Duration::from_secs(secs.min(cap.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovery_backoff_doubles_and_caps() {
        let base = Duration::from_secs(60);
        let cap = Duration::from_secs(600);
        assert_eq!(recovery_backoff(1, base, cap), Duration::from_secs(60));
        assert_eq!(recovery_backoff(2, base, cap), Duration::from_secs(120));
        assert_eq!(recovery_backoff(4, base, cap), Duration::from_secs(480));
        assert_eq!(recovery_backoff(5, base, cap), Duration::from_secs(600));
        assert_eq!(recovery_backoff(20, base, cap), Duration::from_secs(600));
    }
}

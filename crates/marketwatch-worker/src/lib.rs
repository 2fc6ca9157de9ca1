//! Worker (C7): safely executes a single task invocation end-to-end, preserving the per-task
//! mutual-exclusion invariant, handing results to the Result Processor, and acking/nacking the
//! broker correctly.
//!
//! Grounded on `harness/src/worker.rs`'s receive-loop/`select!` shutdown pattern and per-message
//! error-swallow-and-log handling, generalized from "one message at a time" to a
//! semaphore-bounded pool of concurrently in-flight jobs.

pub mod fetcher;
pub mod heartbeat;
pub mod result_processor;

use chrono::Utc;
use fetcher::{FetchOutcome, ItemFetcher};
use heartbeat::Heartbeat;
use marketwatch_core::{
    kv::KvStore, queue::Queue, queue::QueueMessage, MonitoringTask, Proxy, ProxyOutcome,
};
use marketwatch_proxy::ProxyPool;
use marketwatch_scheduler::decide::{classify_lock, LockState};
use serde::Deserialize;
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue_name: String,
    pub max_concurrency: usize,
    pub receive_batch: i64,
    pub idle_poll_interval: Duration,
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub visibility_timeout: Duration,
    pub max_retries: i32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_name: "parsing_tasks".to_string(),
            max_concurrency: 10,
            receive_batch: 10,
            idle_poll_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(15 * 60),
            heartbeat_interval: Duration::from_secs(300),
            visibility_timeout: Duration::from_secs(15 * 60),
            max_retries: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ParsingTask {
    #[serde(rename = "type")]
    kind: String,
    task_id: i64,
}

pub struct Worker {
    pool: PgPool,
    kv: Arc<dyn KvStore>,
    queue: Arc<dyn Queue>,
    proxies: Arc<ProxyPool>,
    fetcher: Arc<dyn ItemFetcher>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        pool: PgPool,
        kv: Arc<dyn KvStore>,
        queue: Arc<dyn Queue>,
        proxies: Arc<ProxyPool>,
        fetcher: Arc<dyn ItemFetcher>,
        config: WorkerConfig,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Arc::new(Self {
            pool,
            kv,
            queue,
            proxies,
            fetcher,
            config,
            semaphore,
        })
    }

    /// Consumes the queue until `shutdown` fires, spawning one job per message, bounded by
    /// `max_concurrency`. In-flight jobs are allowed to finish; this call returns once the
    /// receive loop itself has stopped, not once every spawned job has completed.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            event = "marketwatch.worker.started",
            queue = %self.config.queue_name,
            max_concurrency = self.config.max_concurrency,
            "worker started"
        );

        loop {
            if *shutdown.borrow() {
                return;
            }

            let batch = (self.semaphore.available_permits() as i64)
                .min(self.config.receive_batch)
                .max(1);

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!(event = "marketwatch.worker.shutdown", "worker shutting down");
                        return;
                    }
                }
                result = self.queue.receive(&self.config.queue_name, batch, self.config.visibility_timeout) => {
                    match result {
                        Ok(messages) if messages.is_empty() => {
                            tokio::time::sleep(self.config.idle_poll_interval).await;
                        }
                        Ok(messages) => {
                            for msg in messages {
                                let permit = match self.semaphore.clone().acquire_owned().await {
                                    Ok(permit) => permit,
                                    Err(_) => return,
                                };
                                let worker = self.clone();
                                tokio::spawn(async move {
                                    worker.run_job(msg).await;
                                    drop(permit);
                                });
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                event = "marketwatch.worker.receive_failed",
                                error = %err,
                                "failed to receive from broker, backing off"
                            );
                            tokio::time::sleep(self.config.idle_poll_interval).await;
                        }
                    }
                }
            }
        }
    }

    async fn run_job(&self, msg: QueueMessage) {
        let message_id = msg.message_id.clone();
        if let Err(err) = self.handle_message(&msg).await {
            tracing::warn!(
                event = "marketwatch.worker.job.error",
                message_id = %message_id,
                error = %err,
                "job failed, reporting to broker retry policy"
            );
            if let Err(err) = self
                .queue
                .fail(&msg, self.config.max_retries, &err.to_string())
                .await
            {
                tracing::error!(
                    event = "marketwatch.worker.fail_report_failed",
                    message_id = %message_id,
                    error = %err,
                    "could not report job failure to the broker"
                );
            }
        }
    }

    async fn handle_message(&self, msg: &QueueMessage) -> anyhow::Result<()> {
        let task: ParsingTask = match serde_json::from_value(msg.payload.clone()) {
            Ok(task) => task,
            Err(err) => {
                tracing::warn!(
                    event = "marketwatch.worker.message.invalid",
                    message_id = %msg.message_id,
                    error = %err,
                    "message is not a recognizable parsing task, dropping"
                );
                self.queue.ack(&msg.ack_token).await?;
                return Ok(());
            }
        };
        if task.kind != "parsing_task" {
            self.queue.ack(&msg.ack_token).await?;
            return Ok(());
        }

        let task_id = task.task_id;
        let lock_key = format!("task_running:{task_id}");

        if !self.acquire_or_recover_lock(task_id, &lock_key).await? {
            // Another worker already holds this task; let it do the work.
            self.queue.ack(&msg.ack_token).await?;
            return Ok(());
        }

        let job_result = self.run_locked_job(task_id).await;

        if let Err(err) = self.kv.delete(&lock_key).await {
            tracing::warn!(
                event = "marketwatch.worker.lock_release_retry",
                task_id,
                error = %err,
                "first lock release attempt failed, retrying once"
            );
            if let Err(err) = self.kv.delete(&lock_key).await {
                tracing::error!(
                    event = "marketwatch.worker.lock_release_failed",
                    task_id,
                    error = %err,
                    "task-running lock release failed twice; TTL expiry will eventually clear it"
                );
            }
        }

        job_result?;
        self.queue.ack(&msg.ack_token).await?;
        Ok(())
    }

    /// Implements step 2 of the per-job protocol: attempt the NX lock; if already held, consult
    /// C1 for a stale/stuck holder before giving up on this cycle.
    async fn acquire_or_recover_lock(&self, task_id: i64, lock_key: &str) -> anyhow::Result<bool> {
        if self.kv.try_acquire_lock(lock_key, self.config.lock_ttl).await? {
            return Ok(true);
        }

        if self.load_task(task_id).await?.is_none() {
            self.kv.delete(lock_key).await?;
            return Ok(self.kv.try_acquire_lock(lock_key, self.config.lock_ttl).await?);
        }

        match self.kv.lock_acquired_at(lock_key).await? {
            Some(acquired_at) if classify_lock(acquired_at, Utc::now()) == LockState::Stuck => {
                tracing::warn!(
                    event = "marketwatch.worker.stuck_lock_cleared",
                    task_id,
                    "clearing stale task-running lock before retrying"
                );
                self.kv.delete(lock_key).await?;
                Ok(self.kv.try_acquire_lock(lock_key, self.config.lock_ttl).await?)
            }
            Some(_) => Ok(false),
            None => Ok(self.kv.try_acquire_lock(lock_key, self.config.lock_ttl).await?),
        }
    }

    /// Steps 3-9 of the per-job protocol, run while the caller holds the per-task lock.
    async fn run_locked_job(&self, task_id: i64) -> anyhow::Result<()> {
        let lock_key = format!("task_running:{task_id}");
        let heartbeat = Heartbeat::spawn(
            self.kv.clone(),
            lock_key,
            self.config.lock_ttl,
            self.config.heartbeat_interval,
        );

        let result = self.execute_job(task_id).await;
        heartbeat.stop().await;
        result
    }

    /// Steps 5-9. Only failures that mean the job was never really attempted (the task row
    /// couldn't be loaded, no proxy could be leased) propagate — those drive a broker-level
    /// retry. Once the fetcher has returned a classified outcome, the job counts as attempted:
    /// downstream bookkeeping failures (counters, result processing, re-enqueue) are logged and
    /// swallowed, matching the protocol's "acked after a real attempt, retry is driven by the
    /// re-enqueue" rule rather than a broker nack.
    async fn execute_job(&self, task_id: i64) -> anyhow::Result<()> {
        let Some(task) = self.load_task(task_id).await? else {
            return Ok(());
        };
        if !task.is_active {
            return Ok(());
        }

        let listings = match self.proxies.lease().await? {
            Some(proxy) => self.invoke_fetcher(&task, &proxy).await,
            None => {
                tracing::warn!(
                    event = "marketwatch.worker.no_proxy_available",
                    task_id,
                    "no active proxy available, skipping this invocation"
                );
                Vec::new()
            }
        };

        if let Err(err) = self.finish_job(&task, listings).await {
            tracing::error!(
                event = "marketwatch.worker.post_fetch_failed",
                task_id,
                error = %err,
                "bookkeeping after a completed fetch attempt failed; recovery relies on the \
                 scheduler's own next_check cadence"
            );
        }

        Ok(())
    }

    /// Step 7-9: update counters, hand results to the Result Processor, re-enqueue.
    async fn finish_job(
        &self,
        task: &MonitoringTask,
        listings: Vec<fetcher::FetchedListing>,
    ) -> anyhow::Result<()> {
        let now = Utc::now();
        let next_check = now + chrono::Duration::seconds(task.check_interval.max(10) as i64);
        sqlx::query(
            r#"
            UPDATE monitoring_tasks
            SET total_checks = total_checks + 1, last_check = $2, next_check = $3
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(now)
        .bind(next_check)
        .execute(&self.pool)
        .await?;

        if !listings.is_empty() {
            let inserted = result_processor::process_results(&self.pool, task, &listings).await?;
            if !inserted.is_empty() {
                result_processor::publish_notifications(&self.pool, self.kv.as_ref(), task, &inserted)
                    .await?;
            }
        }

        let requeue_delay =
            Duration::from_secs(task.check_interval.max(10) as u64).max(Duration::from_secs(10));
        self.queue
            .publish(
                &self.config.queue_name,
                serde_json::json!({
                    "type": "parsing_task",
                    "task_id": task.id,
                    "item_name": task.item_name,
                    "appid": task.appid,
                    "currency": task.currency,
                    "filters_json": task.filters,
                }),
                Utc::now() + chrono::Duration::from_std(requeue_delay).unwrap_or_default(),
            )
            .await?;

        Ok(())
    }

    /// Invokes the fetcher and reports the outcome back to C4. Reporting failures are logged,
    /// not propagated: the fetch itself already produced a classified outcome, so the job counts
    /// as attempted regardless of whether the proxy pool's bookkeeping succeeds.
    async fn invoke_fetcher(
        &self,
        task: &MonitoringTask,
        proxy: &Proxy,
    ) -> Vec<fetcher::FetchedListing> {
        let (outcome_label, proxy_outcome, listings) = match self.fetcher.fetch(&task.filters, proxy).await {
            FetchOutcome::Matches(listings) => ("ok", ProxyOutcome::Ok, listings),
            FetchOutcome::RateLimited => ("rate_limited", ProxyOutcome::RateLimited, Vec::new()),
            FetchOutcome::Transient(err) => {
                tracing::warn!(
                    event = "marketwatch.worker.fetch_transient",
                    task_id = task.id,
                    error = %err,
                    "transient fetch failure"
                );
                ("transient_fail", ProxyOutcome::TransientFail, Vec::new())
            }
            FetchOutcome::Hard(err) => {
                tracing::error!(
                    event = "marketwatch.worker.fetch_hard_failure",
                    task_id = task.id,
                    error = %err,
                    "hard fetch failure, deactivating proxy"
                );
                ("hard_fail", ProxyOutcome::HardFail, Vec::new())
            }
            FetchOutcome::ParseError(err) => {
                tracing::warn!(
                    event = "marketwatch.worker.fetch_parse_error",
                    task_id = task.id,
                    error = %err,
                    "fetch payload failed to parse"
                );
                ("transient_fail", ProxyOutcome::TransientFail, Vec::new())
            }
        };

        if let Err(err) = self.proxies.report(proxy, proxy_outcome).await {
            tracing::warn!(
                event = "marketwatch.worker.proxy_report_failed",
                task_id = task.id,
                outcome = outcome_label,
                error = %err,
                "failed to report fetch outcome back to the proxy pool"
            );
        }

        listings
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
}

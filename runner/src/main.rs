use anyhow::Context;
use clap::{Parser, Subcommand};
use marketwatch_admin::Admin;
use marketwatch_core::{kv::KvStore, queue::Queue, PgQueue, RedisKv};
use marketwatch_proxy::ProxyPool;
use marketwatch_scheduler::{Scheduler, SchedulerConfig};
use marketwatch_worker::{Worker, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod fetcher_stub;
mod migrate;

#[derive(Parser, Debug)]
#[command(name = "marketwatch-runner")]
#[command(about = "Marketplace listing monitor: task execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations.
    Migrate,

    /// Run the scheduler: one control loop per active monitoring task.
    Scheduler,

    /// Run a worker: consumes jobs, executes the per-job protocol.
    Worker,

    /// Print aggregate and per-task statistics as JSON, then exit.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::RunnerConfig::from_env().context("load runner config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Scheduler => run_scheduler(&cfg).await,
        Command::Worker => run_worker(&cfg).await,
        Command::Stats => print_stats(&cfg).await,
    }
}

async fn connect(cfg: &config::RunnerConfig) -> anyhow::Result<(sqlx::PgPool, Arc<dyn KvStore>)> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;
    let kv: Arc<dyn KvStore> = Arc::new(RedisKv::connect(&cfg.redis_url).await.context("connect redis")?);
    Ok((pool, kv))
}

async fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = tx.send(true);
    });
    rx
}

async fn run_scheduler(cfg: &config::RunnerConfig) -> anyhow::Result<()> {
    let (pool, kv) = connect(cfg).await?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(pool.clone()));

    let scheduler = Scheduler::new(
        pool,
        kv,
        queue,
        SchedulerConfig {
            queue_name: cfg.job_queue_name.clone(),
            reload_every: cfg.scheduler_reload_every,
            recovery_backoff_base: Duration::from_secs(cfg.scheduler_recovery_backoff_base_secs),
            recovery_backoff_cap: Duration::from_secs(cfg.scheduler_recovery_backoff_cap_secs),
            recovery_max_attempts: cfg.scheduler_recovery_max_attempts,
        },
    );

    scheduler.start_all().await.context("start control loops")?;
    tracing::info!(event = "marketwatch.runner.scheduler_started", "scheduler started");

    tokio::signal::ctrl_c().await.context("wait for shutdown signal")?;
    tracing::info!(event = "marketwatch.runner.scheduler_shutdown", "scheduler shutting down");
    scheduler.shutdown().await;
    Ok(())
}

async fn print_stats(cfg: &config::RunnerConfig) -> anyhow::Result<()> {
    let (pool, kv) = connect(cfg).await?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(pool.clone()));
    let proxies = Arc::new(ProxyPool::new(pool.clone(), kv.clone()));
    let scheduler = Scheduler::new(pool.clone(), kv.clone(), queue.clone(), SchedulerConfig::default());

    let admin = Admin::new(pool, kv, queue, proxies, scheduler, cfg.job_queue_name.clone());
    let stats = admin.get_statistics().await.context("load statistics")?;

    let out = serde_json::json!({
        "total_tasks": stats.total_tasks,
        "active_tasks": stats.active_tasks,
        "total_items_found": stats.total_items_found,
        "tasks": stats.per_task.iter().map(|t| serde_json::json!({
            "task_id": t.task_id,
            "name": t.name,
            "is_active": t.is_active,
            "total_checks": t.total_checks,
            "items_found": t.items_found,
            "last_check": t.last_check,
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run_worker(cfg: &config::RunnerConfig) -> anyhow::Result<()> {
    let (pool, kv) = connect(cfg).await?;
    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(pool.clone()));
    let proxies = Arc::new(ProxyPool::new(pool.clone(), kv.clone()));
    let fetcher = Arc::new(fetcher_stub::UnconfiguredFetcher);

    let worker = Worker::new(
        pool,
        kv,
        queue,
        proxies,
        fetcher,
        WorkerConfig {
            queue_name: cfg.job_queue_name.clone(),
            max_concurrency: cfg.worker_max_concurrency,
            receive_batch: cfg.worker_receive_batch,
            idle_poll_interval: Duration::from_millis(cfg.worker_idle_poll_ms),
            lock_ttl: Duration::from_secs(cfg.task_lock_ttl_secs),
            heartbeat_interval: Duration::from_secs(cfg.heartbeat_interval_secs),
            visibility_timeout: Duration::from_secs(cfg.visibility_timeout_secs),
            max_retries: cfg.max_retries,
        },
    );

    let shutdown = shutdown_signal().await;
    worker.run(shutdown).await;
    tracing::info!(event = "marketwatch.runner.worker_shutdown", "worker shutting down");
    Ok(())
}

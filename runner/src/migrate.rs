use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::RunnerConfig;

/// Runs migrations against the single relational store (collapsed from the teacher's dual
/// state/data split, since this system has one Postgres database).
pub async fn run(cfg: &RunnerConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .context("run migrations")?;

    tracing::info!(event = "marketwatch.migrate.complete", "migrations complete");
    Ok(())
}

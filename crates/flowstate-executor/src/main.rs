// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flowstate Executor - standalone workflow executor process
//!
//! Connects to the shared instance store, registers the bundled workflow
//! definitions and processes ready instances until interrupted. Any number
//! of executors may run against the same database.

mod workflows;

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use flowstate_core::config::Config;
use flowstate_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use flowstate_core::runtime::EngineRuntime;

/// Open the store named by `database_url` and bring its schema up to date.
async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<dyn Persistence>> {
    if database_url.starts_with("sqlite:") {
        info!("Opening SQLite database...");
        let persistence = SqlitePersistence::connect(database_url, max_connections).await?;
        return Ok(Arc::new(persistence));
    }

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    info!("Running database migrations...");
    flowstate_core::migrations::run_postgres(&pool).await?;
    info!("Migrations completed");

    Ok(Arc::new(PostgresPersistence::new(pool)))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowstate_core=info".parse()?),
        )
        .init();

    info!("Starting Flowstate Executor");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        executor_group = %config.engine.executor_group,
        thread_count = config.engine.thread_count,
        queue_threshold = config.engine.queue_threshold,
        poll_interval_ms = u64::try_from(config.engine.poll_interval.as_millis()).unwrap_or(u64::MAX),
        "Configuration loaded"
    );

    // Workers, the dispatcher and the liveness monitor each hold a connection.
    let max_connections = u32::try_from(config.engine.thread_count + 2).unwrap_or(u32::MAX);
    let persistence = connect(&config.database_url, max_connections).await?;
    if !persistence.health_check().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database health check passed");

    let registry = workflows::registry()?;
    let runtime = EngineRuntime::builder()
        .persistence(persistence)
        .registry(registry)
        .config(config.engine)
        .build()?
        .start()
        .await?;

    info!(executor_id = runtime.executor_id(), "Flowstate Executor running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

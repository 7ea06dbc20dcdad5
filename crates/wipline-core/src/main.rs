// Copyright (C) 2025 Wipline Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wipline Worker - maintenance daemon
//!
//! Runs the reconcile and prune workers against a shared task store. Task
//! execution itself lives in the applications that embed
//! [`wipline_core::runtime::WorkerRuntime`] with their action registries;
//! this daemon keeps the shared pool healthy when those workers crash.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use wipline_core::config::Config;
use wipline_core::persistence::{PostgresStore, SqliteStore};
use wipline_core::runtime::WorkerRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wipline_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Wipline Worker");

    let config = Config::from_env()?;
    info!(
        poll_interval_secs = config.worker.poll_interval.as_secs(),
        batch_size = config.worker.batch_size,
        "Configuration loaded"
    );

    let builder = WorkerRuntime::builder()
        .worker_config(config.worker.clone())
        .reconcile_config(config.reconcile.clone())
        .prune_config(config.prune.clone());

    // Pick the backend from the URL scheme; migrations run on connect.
    let builder = if config.database_url.starts_with("sqlite:") {
        info!("Connecting to SQLite...");
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        builder.single_store(store)
    } else {
        info!("Connecting to PostgreSQL...");
        let store = Arc::new(PostgresStore::connect(&config.database_url).await?);
        builder.single_store(store)
    };

    info!("Database connection established, migrations applied");

    let runtime = builder.build()?.start().await?;
    info!("Wipline Worker initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drydock Engine - Deployment Orchestration Daemon
//!
//! The engine is responsible for:
//! - Building images from uploaded archives
//! - Container lifecycle under plan resource limits
//! - Tenant networks and reverse-proxy route labels
//! - Reconciling recorded status with runtime state
//!
//! Note: the public API surface (uploads, tenant management) lives in the
//! control plane; this daemon consumes its queue and its database.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use drydock_core::{PgTaskQueue, PostgresStore};
use drydock_engine::config::Config;
use drydock_engine::runtime::{ContainerRuntime, DockerRuntime};
use drydock_engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("drydock_engine=info".parse().unwrap())
                .add_directive("drydock_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Drydock Engine");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        workers = config.workers,
        ingress_network = %config.ingress_network,
        root_domain = %config.root_domain,
        "Configuration loaded"
    );

    // Connect to database
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    info!("Database connection established");

    info!("Running database migrations...");
    drydock_core::migrations::run(&pool).await?;
    info!("Migrations completed");

    // Connect to the container runtime and verify it is reachable
    let runtime = Arc::new(DockerRuntime::connect()?);
    runtime.ping().await?;
    info!("Container runtime connection established");

    let store = Arc::new(PostgresStore::new(pool.clone()));
    let queue = Arc::new(PgTaskQueue::new(pool.clone()));

    let engine = Engine::builder()
        .store(store)
        .queue(queue)
        .runtime(runtime)
        .config(config)
        .build()?
        .start();

    info!("Drydock Engine initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    engine.shutdown().await;
    pool.close().await;
    info!("Shutdown complete");

    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Robohub Worker - Run Execution Host
//!
//! Registers with the hub's database, heartbeats, claims runs and executes
//! robot artifacts until SIGTERM/ctrl-c, then drains in-flight runs.

use std::sync::Arc;

use tracing::{info, warn};

use robohub_core::cipher::Cipher;
use robohub_core::config::CoreConfig;
use robohub_core::engine::{EnginePolicy, RunEngine};
use robohub_core::persistence::SqliteStore;
use robohub_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robohub_worker=info,robohub_core=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let core_config = CoreConfig::from_env()?;
    let config = WorkerConfig::from_env()?;
    let worker_id = config.load_or_create_worker_id()?;

    // A worker without the envelope key could not materialize secret
    // bindings; refuse to start instead of failing runs later.
    let cipher = Cipher::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;

    let store = Arc::new(
        SqliteStore::from_url(&config.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    info!("Connected to database");

    let engine = Arc::new(RunEngine::new(store, EnginePolicy::from(&core_config)));
    let worker = Worker::new(engine, cipher, config, worker_id);

    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.notify_waiters();
        }
    });

    worker.run().await;

    info!("Robohub worker shut down");
    Ok(())
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Robohub Server - Automation Hub Daemon
//!
//! Hosts the HTTP/WS surface and drives the scheduler, SLA monitor,
//! watchdog and retention loops.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use robohub_core::blobstore::BlobStore;
use robohub_core::cipher::Cipher;
use robohub_core::config::CoreConfig;
use robohub_core::engine::{EnginePolicy, RunEngine};
use robohub_core::persistence::{SqliteStore, Store};

use robohub_server::config::ServerConfig;
use robohub_server::http::{AppState, build_router};
use robohub_server::retention::{RetentionConfig, RetentionWorker};
use robohub_server::scheduler::{Scheduler, SchedulerConfig};
use robohub_server::sla_monitor::{SlaMonitor, SlaMonitorConfig};
use robohub_server::watchdog::Watchdog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "robohub_server=info,robohub_core=info".into()),
        )
        .init();

    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let core_config = CoreConfig::from_env()?;
    let server_config = ServerConfig::from_env()?;
    if server_config.api_token.is_none() {
        warn!("ROBOHUB_API_TOKEN not set, the API is open");
    }

    // Env routes and workers share the envelope; refuse to start without it.
    let cipher = Cipher::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;

    let store: Arc<SqliteStore> = Arc::new(
        SqliteStore::from_url(&core_config.database_url)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?,
    );
    info!("Connected to database, schema verified");

    let engine = Arc::new(RunEngine::new(
        store.clone() as Arc<dyn Store>,
        EnginePolicy::from(&core_config),
    ));

    let scheduler = Arc::new(Scheduler::new(
        engine.clone(),
        SchedulerConfig {
            interval: core_config.scheduler_interval,
            app_timezone: core_config.app_timezone.clone(),
        },
    ));
    let sla_monitor = Arc::new(SlaMonitor::new(
        engine.clone(),
        SlaMonitorConfig {
            interval: core_config.sla_monitor_interval,
            app_timezone: core_config.app_timezone.clone(),
            queue_backlog_threshold: core_config.queue_backlog_alert_threshold,
            worker_stale_seconds: core_config.worker_stale_seconds,
            failure_streak_threshold: core_config.failure_streak_threshold,
        },
    ));
    let watchdog = Arc::new(Watchdog::new(engine.clone()));
    let retention = Arc::new(RetentionWorker::new(
        store.clone() as Arc<dyn Store>,
        RetentionConfig {
            interval: core_config.cleanup_interval,
            run_retention_days: core_config.run_retention_days,
            log_retention_days: core_config.log_retention_days,
            artifact_retention_days: core_config.artifact_retention_days,
        },
    ));

    let shutdown_handles = vec![
        scheduler.shutdown_handle(),
        sla_monitor.shutdown_handle(),
        watchdog.shutdown_handle(),
        retention.shutdown_handle(),
    ];

    let mut loops = tokio::task::JoinSet::new();
    {
        let scheduler = scheduler.clone();
        loops.spawn(async move { scheduler.run().await });
    }
    {
        let sla_monitor = sla_monitor.clone();
        loops.spawn(async move { sla_monitor.run().await });
    }
    {
        let watchdog = watchdog.clone();
        loops.spawn(async move { watchdog.run().await });
    }
    {
        let retention = retention.clone();
        loops.spawn(async move { retention.run().await });
    }

    let state = AppState {
        engine,
        store: store as Arc<dyn Store>,
        cipher,
        blobstore: BlobStore::new(&core_config.data_dir),
        core_config: core_config.clone(),
        server_config: server_config.clone(),
        started_at: Instant::now(),
    };
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(server_config.http_addr).await?;
    info!(addr = %server_config.http_addr, "Robohub server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    for handle in shutdown_handles {
        handle.notify_waiters();
    }
    while loops.join_next().await.is_some() {}

    info!("Robohub server shut down");
    Ok(())
}

//! Drover Server - standalone job server over a SQLite store
//!
//! Runs the promotion and timeout sweeps for one queue root until interrupted,
//! then gives running jobs the configured grace period before failing them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use drover_persist::{SqliteConfig, SqliteJobStore};
use drover_queue::options::ShutdownServerOptions;
use drover_queue::{JobQuery, JobServer, JobStatus, JobStore, ServerConfig, ServerState};

/// How often queue depth is written to the log
const STATS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    drover_queue::init_tracing();

    let config = ServerConfig::from_env();
    let db = SqliteConfig::from_env();
    tracing::info!(root = %config.root, db = %db.url, "Starting Drover job server");

    let store = SqliteJobStore::connect(&config.root, db).await.map_err(|e| {
        tracing::error!("Failed to open job store: {}", e);
        e
    })?;
    let store: Arc<dyn JobStore> = Arc::new(store);
    let server = Arc::new(JobServer::new(store, config));
    server
        .start_server()
        .await
        .context("failed to start job server")?;

    let mut stats = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats.tick() => log_stats(&server).await,
        }
    }

    let grace = server.config().shutdown_timeout_ms;
    tracing::info!(grace_ms = grace, "Interrupt received, stopping");
    server
        .shutdown_server(ShutdownServerOptions::default())
        .await
        .context("failed to begin shutdown")?;

    // A second interrupt skips the rest of the grace period
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_millis(grace)) => {}
    }
    if server.state() != ServerState::Stopped {
        server
            .shutdown_server(ShutdownServerOptions { timeout: Some(0) })
            .await
            .context("failed to stop running jobs")?;
    }

    log_stats(&server).await;
    tracing::info!("Drover job server stopped");
    Ok(())
}

async fn log_stats(server: &JobServer) {
    let mut counts = Vec::with_capacity(JobStatus::ALL.len());
    for status in JobStatus::ALL {
        match server
            .store()
            .find(&JobQuery::new().with_status(status), None, None)
            .await
        {
            Ok(docs) => counts.push(format!("{}={}", status, docs.len())),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read queue depth");
                return;
            }
        }
    }
    tracing::info!(state = ?server.state(), jobs = %counts.join(" "), "Queue depth");
}

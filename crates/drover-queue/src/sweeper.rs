//! Promotion sweeper
//!
//! Periodically fails runs whose `expiresAfter` has passed and promotes
//! due, dependency-free `waiting` jobs to `ready`.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::server::JobServer;

/// Message recorded on runs reclaimed by the sweeper
pub const WORK_TIMEOUT_MESSAGE: &str = "Failed for exceeding worker set workTimeout";

/// Handle to a running sweeper task
#[derive(Debug)]
pub struct Sweeper {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweep loop. The loop only holds a weak reference so a
    /// dropped server also ends its sweeper.
    pub fn spawn(server: Weak<JobServer>, interval: Duration) -> Self {
        let token = CancellationToken::new();
        let shutdown = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "Promotion sweeper started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Promotion sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let Some(server) = server.upgrade() else {
                            debug!("Job server dropped, sweeper exiting");
                            break;
                        };
                        if let Err(e) = server.promote_jobs().await {
                            error!(error = %e, "Promotion sweep failed");
                        }
                    }
                }
            }
        });

        Self { token, task }
    }

    /// Stop the loop after its current tick
    pub fn stop(self) {
        self.token.cancel();
        drop(self.task);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

//! Configuration for the job server

use std::env;
use std::time::Duration;

/// Job server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Queue name; remote methods are addressed as `{root}_{operation}`
    pub root: String,
    /// Interval between promotion sweeps (ms)
    pub promote_interval_ms: u64,
    /// Default grace period before `shutdownServer` fails running jobs (ms)
    pub shutdown_timeout_ms: u64,
    /// Upper bound on contention rounds within one `getWork` call
    pub max_claim_rounds: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: "queue".to_string(),
            promote_interval_ms: 15_000,
            shutdown_timeout_ms: 60_000,
            max_claim_rounds: 16,
        }
    }
}

impl ServerConfig {
    /// Config with a custom root and default timings
    pub fn with_root(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables
    ///
    /// Reads:
    /// - DROVER_ROOT: queue name (default: "queue")
    /// - DROVER_PROMOTE_INTERVAL_MS (default: 15000)
    /// - DROVER_SHUTDOWN_TIMEOUT_MS (default: 60000)
    /// - DROVER_MAX_CLAIM_ROUNDS (default: 16)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            root: env::var("DROVER_ROOT").unwrap_or(defaults.root),
            promote_interval_ms: env_parse("DROVER_PROMOTE_INTERVAL_MS")
                .unwrap_or(defaults.promote_interval_ms),
            shutdown_timeout_ms: env_parse("DROVER_SHUTDOWN_TIMEOUT_MS")
                .unwrap_or(defaults.shutdown_timeout_ms),
            max_claim_rounds: env_parse("DROVER_MAX_CLAIM_ROUNDS")
                .unwrap_or(defaults.max_claim_rounds),
        }
    }

    pub fn promote_interval(&self) -> Duration {
        Duration::from_millis(self.promote_interval_ms.max(1))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Install the default `tracing` subscriber, honouring `RUST_LOG`
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,drover_queue=debug"));

    // A host may already have installed a subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init();
}

//! Option objects accepted by the state machine operations
//!
//! Every struct deserializes from a camelCase JSON object with all fields
//! optional, so remote callers may omit any of them (or the whole object).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::LogLevel;

/// `jobSave` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaveOptions {
    /// Cancel earlier same-type jobs that repeat forever before inserting
    pub cancel_repeats: bool,
}

/// `getWork` options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetWorkOptions {
    pub max_jobs: usize,
    /// Run deadline in ms; stamps `expiresAfter` on claimed jobs
    pub work_timeout: Option<u64>,
}

impl Default for GetWorkOptions {
    fn default() -> Self {
        Self {
            max_jobs: 1,
            work_timeout: None,
        }
    }
}

/// `getJob` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GetJobOptions {
    pub get_log: bool,
    pub get_failures: bool,
}

/// `jobLog` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogOptions {
    pub level: LogLevel,
    pub data: Option<Value>,
    /// Also emit the message through `tracing`
    pub echo: bool,
}

/// `jobDone` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DoneOptions {
    /// Keep resolved dependents waiting at least this many ms
    pub delay_deps: Option<u64>,
}

/// `jobFail` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FailOptions {
    /// Skip any remaining retries
    pub fatal: bool,
}

/// `jobCancel` options; propagates downstream by default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CancelOptions {
    pub antecedents: bool,
    pub dependents: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            antecedents: false,
            dependents: true,
        }
    }
}

/// `jobRestart` options; propagates upstream by default
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestartOptions {
    /// Added to the job's remaining retries
    pub retries: u64,
    /// New `retryUntil`
    pub until: Option<DateTime<Utc>>,
    pub antecedents: bool,
    pub dependents: bool,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            retries: 1,
            until: None,
            antecedents: true,
            dependents: false,
        }
    }
}

/// `jobRerun` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RerunOptions {
    pub repeats: u64,
    /// Delay before the clone becomes due (ms)
    pub wait: u64,
    /// Defaults to the original's `repeatUntil`
    pub until: Option<DateTime<Utc>>,
}

/// `jobReady` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadyOptions {
    /// Promote even with unresolved antecedents, clearing `depends`
    pub force: bool,
    /// Reference time for the due check; defaults to now
    pub time: Option<DateTime<Utc>>,
}

/// `shutdownServer` options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShutdownServerOptions {
    /// Grace period before running jobs are failed (ms)
    pub timeout: Option<u64>,
}

/// A single value or an array of them, as accepted for id arguments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(value) => vec![value],
            OneOrMany::Many(values) => values,
        }
    }
}

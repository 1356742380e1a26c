//! Job document model

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::QueueError;

/// Job Identifier
pub type JobId = Uuid;

/// Identifier of one claimed execution of a job
pub type RunId = Uuid;

/// Retry/repeat count meaning "forever" (2^53)
pub const FOREVER: u64 = 9_007_199_254_740_992;

/// Default retry and repeat wait: five minutes
pub const DEFAULT_WAIT_MS: u64 = 5 * 60 * 1000;

/// Latest representable deadline (9999-12-31T23:59:59Z)
pub fn far_future() -> DateTime<Utc> {
    DateTime::from_timestamp(253_402_300_799, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `t + ms`, saturating at [`far_future`]
pub fn add_ms(t: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    TimeDelta::try_milliseconds(ms)
        .and_then(|d| t.checked_add_signed(d))
        .map(|t| t.min(far_future()))
        .unwrap_or_else(far_future)
}

/// `t - ms`, saturating at the earliest representable time
pub fn sub_ms(t: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    let ms = i64::try_from(ms).unwrap_or(i64::MAX);
    TimeDelta::try_milliseconds(ms)
        .and_then(|d| t.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Job Status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Saved, waiting for its due time or antecedents
    Waiting,
    /// Held back from promotion until resumed
    Paused,
    /// Eligible to be claimed by a worker
    Ready,
    /// Claimed by a worker
    Running,
    /// Permanently failed
    Failed,
    /// Cancelled before completion
    Cancelled,
    /// Successfully completed
    Completed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Waiting,
        JobStatus::Paused,
        JobStatus::Ready,
        JobStatus::Running,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::Completed,
    ];

    /// Statuses from which `jobCancel` may move a job
    pub const CANCELLABLE: [JobStatus; 4] = [
        JobStatus::Running,
        JobStatus::Ready,
        JobStatus::Waiting,
        JobStatus::Paused,
    ];

    /// Statuses from which `jobPause` may move a job
    pub const PAUSABLE: [JobStatus; 2] = [JobStatus::Ready, JobStatus::Waiting];

    /// Statuses from which `jobRemove` may delete a job
    pub const REMOVABLE: [JobStatus; 3] = [
        JobStatus::Cancelled,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Statuses from which `jobRestart` may move a job
    pub const RESTARTABLE: [JobStatus; 2] = [JobStatus::Cancelled, JobStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Paused => "paused",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::REMOVABLE.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("Invalid job status: {s}")))
    }
}

/// Job priority; lower values are served first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(10);
    pub const NORMAL: Priority = Priority(0);
    pub const MEDIUM: Priority = Priority(-5);
    pub const HIGH: Priority = Priority(-10);
    pub const CRITICAL: Priority = Priority(-15);

    pub fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    /// Accepts a named level (`low`, `normal`, `medium`, `high`, `critical`) or an integer
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::LOW),
            "normal" => Ok(Self::NORMAL),
            "medium" => Ok(Self::MEDIUM),
            "high" => Ok(Self::HIGH),
            "critical" => Ok(Self::CRITICAL),
            other => other.parse::<i32>().map(Self).map_err(|_| {
                QueueError::validation(format!("Invalid string priority or integer value: {other}"))
            }),
        }
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    #[default]
    Constant,
    Exponential,
}

impl Backoff {
    /// Delay in ms before the next attempt, given the attempts already consumed
    pub fn delay(self, wait_ms: u64, retried: u64) -> u64 {
        match self {
            Self::Constant => wait_ms,
            Self::Exponential => {
                let exp = retried.saturating_sub(1).min(63) as u32;
                wait_ms.saturating_mul(2u64.saturating_pow(exp))
            }
        }
    }
}

impl FromStr for Backoff {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(Self::Constant),
            "exponential" => Ok(Self::Exponential),
            other => Err(QueueError::validation(format!(
                "Invalid retry backoff: {other} (expected constant or exponential)"
            ))),
        }
    }
}

/// Spacing between recurrences of a repeating job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepeatWait {
    /// Fixed delay in milliseconds after completion
    Interval(u64),
    /// Cron expression (with a seconds field)
    Schedule(String),
}

impl Default for RepeatWait {
    fn default() -> Self {
        Self::Interval(DEFAULT_WAIT_MS)
    }
}

impl RepeatWait {
    /// Parse and wrap a cron expression
    pub fn schedule(expr: &str) -> Result<Self, QueueError> {
        parse_schedule(expr)?;
        Ok(Self::Schedule(expr.to_string()))
    }

    /// Up to `count` schedule occurrences at or after `from`.
    /// Intervals have no occurrences.
    pub fn occurrences(
        &self,
        from: DateTime<Utc>,
        count: usize,
    ) -> Result<Vec<DateTime<Utc>>, QueueError> {
        match self {
            Self::Interval(_) => Ok(Vec::new()),
            Self::Schedule(expr) => {
                let schedule = parse_schedule(expr)?;
                // cron's iterator is exclusive of its start
                let start = sub_ms(from, 1);
                Ok(schedule.after(&start).take(count).collect())
            }
        }
    }
}

fn parse_schedule(expr: &str) -> Result<cron::Schedule, QueueError> {
    cron::Schedule::from_str(expr).map_err(|e| QueueError::Schedule(format!("{expr}: {e}")))
}

/// Completion progress of a running job
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    pub percent: f64,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            completed: 0,
            total: 1,
            percent: 0.0,
        }
    }
}

impl Progress {
    /// Validated progress; requires `0 <= completed <= total` and `total > 0`
    pub fn new(completed: u64, total: u64) -> Result<Self, QueueError> {
        if total == 0 || completed > total {
            return Err(QueueError::validation(format!(
                "Invalid progress {completed}/{total}: need 0 <= completed <= total and total > 0"
            )));
        }
        Ok(Self {
            completed,
            total,
            percent: 100.0 * completed as f64 / total as f64,
        })
    }

    /// Progress of a finished job
    pub fn full(total: u64) -> Self {
        let total = total.max(1);
        Self {
            completed: total,
            total,
            percent: 100.0,
        }
    }
}

/// Severity of a job log entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Success,
    Warning,
    Danger,
}

impl FromStr for LogLevel {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "success" => Ok(Self::Success),
            "warning" => Ok(Self::Warning),
            "danger" => Ok(Self::Danger),
            other => Err(QueueError::validation(format!("Invalid log level: {other}"))),
        }
    }
}

/// One timestamped line in a job's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    pub message: String,
    #[serde(default)]
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new(time: DateTime<Utc>, run_id: Option<RunId>, message: impl Into<String>) -> Self {
        Self {
            time,
            run_id,
            message: message.into(),
            level: LogLevel::Info,
            data: None,
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

/// A persisted job document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub data: Value,
    pub status: JobStatus,
    pub priority: i32,
    #[serde(default)]
    pub depends: Vec<JobId>,
    #[serde(default)]
    pub resolved: Vec<JobId>,
    pub after: DateTime<Utc>,
    pub retries: u64,
    pub retried: u64,
    pub retry_wait: u64,
    pub retry_backoff: Backoff,
    pub retry_until: DateTime<Utc>,
    /// Retry budget every recurrence starts with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_retries: Option<u64>,
    pub repeats: u64,
    pub repeated: u64,
    pub repeat_wait: RepeatWait,
    pub repeat_until: DateTime<Utc>,
    pub progress: Progress,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    #[serde(default)]
    pub failures: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_after: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl JobDoc {
    /// Fresh, unsaved `waiting` document with default retry and repeat settings
    pub fn new(job_type: impl Into<String>, data: Value) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            run_id: None,
            job_type: job_type.into(),
            data,
            status: JobStatus::Waiting,
            priority: Priority::NORMAL.value(),
            depends: Vec::new(),
            resolved: Vec::new(),
            after: now,
            retries: 1,
            retried: 0,
            retry_wait: DEFAULT_WAIT_MS,
            retry_backoff: Backoff::Constant,
            retry_until: far_future(),
            repeat_retries: None,
            repeats: 0,
            repeated: 0,
            repeat_wait: RepeatWait::default(),
            repeat_until: far_future(),
            progress: Progress::default(),
            log: Vec::new(),
            failures: Vec::new(),
            result: None,
            work_timeout: None,
            expires_after: None,
            created: now,
            updated: now,
        }
    }

    /// Append a log entry describing a transition
    pub fn push_log(&mut self, entry: LogEntry) {
        self.log.push(entry);
    }

    /// Clear the run-only fields held while `running`
    pub(crate) fn clear_run(&mut self) {
        self.run_id = None;
        self.work_timeout = None;
        self.expires_after = None;
    }
}

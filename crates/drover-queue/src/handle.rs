//! Client-side job handle
//!
//! A [`Job`] owns one job document and talks to a job server through a
//! [`Transport`]. Configuration methods chain on `&mut Job`; actions are
//! async remote calls. `log`, `progress`, `pause` and `resume` on a job
//! that has not been saved yet only change the local document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

use crate::auth::Operation;
use crate::error::{QueueError, QueueResult};
use crate::job::{
    add_ms, Backoff, JobDoc, JobId, JobStatus, LogEntry, Priority, Progress, RepeatWait, RunId,
    FOREVER,
};
use crate::options::{
    CancelOptions, DoneOptions, FailOptions, GetJobOptions, LogOptions, ReadyOptions, RerunOptions,
    RestartOptions, SaveOptions,
};
use crate::transport::Transport;

/// Arguments to [`Job::retry`]
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Attempts allowed after the first one
    pub retries: u64,
    /// Base delay between attempts (ms)
    pub wait: Option<u64>,
    pub backoff: Option<Backoff>,
    pub until: Option<DateTime<Utc>>,
}

impl RetryOptions {
    pub fn new(retries: u64) -> Self {
        Self {
            retries,
            ..Default::default()
        }
    }

    pub fn forever() -> Self {
        Self::new(FOREVER)
    }

    pub fn wait(mut self, ms: u64) -> Self {
        self.wait = Some(ms);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }
}

/// Arguments to [`Job::repeat`]
#[derive(Debug, Clone, Default)]
pub struct RepeatOptions {
    /// Recurrences after the first run
    pub repeats: u64,
    pub wait: Option<RepeatWait>,
    pub until: Option<DateTime<Utc>>,
}

impl RepeatOptions {
    pub fn new(repeats: u64) -> Self {
        Self {
            repeats,
            ..Default::default()
        }
    }

    pub fn forever() -> Self {
        Self::new(FOREVER)
    }

    /// Fixed delay after each completion (ms)
    pub fn every(mut self, ms: u64) -> Self {
        self.wait = Some(RepeatWait::Interval(ms));
        self
    }

    /// Cron expression; validated by [`Job::repeat`]
    pub fn schedule(mut self, expr: impl Into<String>) -> Self {
        self.wait = Some(RepeatWait::Schedule(expr.into()));
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }
}

/// Handle to one job
#[derive(Clone)]
pub struct Job {
    doc: JobDoc,
    root: String,
    transport: Arc<dyn Transport>,
}

impl Job {
    /// New unsaved job
    pub fn new(
        transport: Arc<dyn Transport>,
        root: impl Into<String>,
        job_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self::from_doc(transport, root, JobDoc::new(job_type, data))
    }

    /// Wrap an existing document, e.g. one returned by `getWork`
    pub fn from_doc(transport: Arc<dyn Transport>, root: impl Into<String>, doc: JobDoc) -> Self {
        Self {
            doc,
            root: root.into(),
            transport,
        }
    }

    /// Fetch a job by id
    pub async fn get(
        transport: Arc<dyn Transport>,
        root: impl Into<String>,
        id: JobId,
        options: GetJobOptions,
    ) -> QueueResult<Option<Job>> {
        let root = root.into();
        let method = format!("{root}_{}", Operation::GetJob);
        let value = transport
            .call(&method, vec![json!(id), serde_json::to_value(options)?])
            .await?;
        let docs: Vec<JobDoc> = serde_json::from_value(value)?;
        Ok(docs
            .into_iter()
            .next()
            .map(|doc| Self::from_doc(transport, root, doc)))
    }

    pub fn id(&self) -> Option<JobId> {
        self.doc.id
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.doc.run_id
    }

    pub fn status(&self) -> JobStatus {
        self.doc.status
    }

    pub fn job_type(&self) -> &str {
        &self.doc.job_type
    }

    pub fn data(&self) -> &Value {
        &self.doc.data
    }

    pub fn doc(&self) -> &JobDoc {
        &self.doc
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    // ---------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------

    pub fn priority(&mut self, priority: impl Into<Priority>) -> &mut Self {
        self.doc.priority = priority.into().value();
        self
    }

    /// Allow `retries` more attempts after the first
    pub fn retry(&mut self, options: RetryOptions) -> &mut Self {
        self.doc.retries = options.retries.saturating_add(1).min(FOREVER);
        self.doc.retried = 0;
        if let Some(wait) = options.wait {
            self.doc.retry_wait = wait;
        }
        if let Some(backoff) = options.backoff {
            self.doc.retry_backoff = backoff;
        }
        if let Some(until) = options.until {
            self.doc.retry_until = until;
        }
        self
    }

    /// Run `repeats` more times after the first completion
    pub fn repeat(&mut self, options: RepeatOptions) -> QueueResult<&mut Self> {
        let wait = match options.wait {
            Some(RepeatWait::Schedule(expr)) => Some(RepeatWait::schedule(&expr)?),
            other => other,
        };
        self.doc.repeats = options.repeats.min(FOREVER);
        self.doc.repeated = 0;
        if let Some(wait) = wait {
            self.doc.repeat_wait = wait;
        }
        if let Some(until) = options.until {
            self.doc.repeat_until = until;
        }
        Ok(self)
    }

    /// Not due until `ms` from now
    pub fn delay(&mut self, ms: u64) -> &mut Self {
        self.doc.after = add_ms(Utc::now(), ms);
        self
    }

    pub fn after(&mut self, time: DateTime<Utc>) -> &mut Self {
        self.doc.after = time;
        self
    }

    /// Replace the antecedent set; every antecedent must already be saved
    pub fn depends(&mut self, jobs: &[&Job]) -> QueueResult<&mut Self> {
        let mut ids = Vec::with_capacity(jobs.len());
        for job in jobs {
            let id = job.id().ok_or_else(|| {
                QueueError::validation(format!(
                    "Antecedent job of type {} has not been saved",
                    job.job_type()
                ))
            })?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.doc.depends = ids;
        Ok(self)
    }

    // ---------------------------------------------------------------
    // Actions
    // ---------------------------------------------------------------

    /// Persist the job; returns its id unless the server declined
    pub async fn save(&mut self, options: SaveOptions) -> QueueResult<Option<JobId>> {
        let id: Option<JobId> = self
            .call(
                Operation::JobSave,
                vec![serde_json::to_value(&self.doc)?, serde_json::to_value(options)?],
            )
            .await?;
        if let Some(id) = id {
            self.doc.id = Some(id);
        }
        Ok(id)
    }

    /// Reload the document from the server; `false` if it no longer exists
    pub async fn refresh(&mut self, options: GetJobOptions) -> QueueResult<bool> {
        let id = self.require_id("refresh")?;
        let docs: Vec<JobDoc> = self
            .call(Operation::GetJob, vec![json!(id), serde_json::to_value(options)?])
            .await?;
        match docs.into_iter().next() {
            Some(doc) => {
                self.doc = doc;
                Ok(true)
            }
            None => {
                warn!(job_id = %id, "Refresh found no job");
                Ok(false)
            }
        }
    }

    pub async fn log(&mut self, message: impl Into<String>, options: LogOptions) -> QueueResult<bool> {
        let message = message.into();
        let Some(id) = self.doc.id else {
            self.doc.push_log(LogEntry {
                time: Utc::now(),
                run_id: None,
                message,
                level: options.level,
                data: options.data,
            });
            return Ok(true);
        };
        self.call(
            Operation::JobLog,
            vec![
                json!(id),
                json!(self.doc.run_id),
                json!(message),
                serde_json::to_value(options)?,
            ],
        )
        .await
    }

    pub async fn progress(&mut self, completed: u64, total: u64) -> QueueResult<bool> {
        let progress = Progress::new(completed, total)?;
        match (self.doc.id, self.doc.run_id) {
            (None, _) => {
                self.doc.progress = progress;
                Ok(true)
            }
            (Some(id), Some(run_id)) => {
                let ok = self
                    .call(
                        Operation::JobProgress,
                        vec![json!(id), json!(run_id), json!(completed), json!(total)],
                    )
                    .await?;
                if ok {
                    self.doc.progress = progress;
                }
                Ok(ok)
            }
            (Some(id), None) => {
                warn!(job_id = %id, "Progress ignored: job is not running");
                Ok(false)
            }
        }
    }

    /// Report success; non-object results are stored as `{"value": result}`
    pub async fn done(&self, result: Value) -> QueueResult<bool> {
        self.done_with(result, DoneOptions::default()).await
    }

    /// [`Job::done`] with options, e.g. holding dependents back by `delay_deps` ms
    pub async fn done_with(&self, result: Value, options: DoneOptions) -> QueueResult<bool> {
        let (id, run_id) = self.require_run("done")?;
        let result = match result {
            Value::Object(_) => result,
            Value::Null => json!({}),
            other => json!({ "value": other }),
        };
        self.call(
            Operation::JobDone,
            vec![json!(id), json!(run_id), result, serde_json::to_value(options)?],
        )
        .await
    }

    /// Report failure; non-object errors are stored as `{"value": err}`
    pub async fn fail(&self, err: Value, options: FailOptions) -> QueueResult<bool> {
        let (id, run_id) = self.require_run("fail")?;
        let err = match err {
            Value::Object(_) => err,
            other => json!({ "value": other }),
        };
        self.call(
            Operation::JobFail,
            vec![json!(id), json!(run_id), err, serde_json::to_value(options)?],
        )
        .await
    }

    pub async fn pause(&mut self) -> QueueResult<bool> {
        let Some(id) = self.doc.id else {
            self.doc.status = JobStatus::Paused;
            self.doc.push_log(LogEntry::new(Utc::now(), None, "Job Paused"));
            return Ok(true);
        };
        self.call(Operation::JobPause, vec![json!(id)]).await
    }

    pub async fn resume(&mut self) -> QueueResult<bool> {
        let Some(id) = self.doc.id else {
            self.doc.status = JobStatus::Waiting;
            self.doc.push_log(LogEntry::new(Utc::now(), None, "Job Resumed"));
            return Ok(true);
        };
        self.call(Operation::JobResume, vec![json!(id)]).await
    }

    pub async fn ready(&self, options: ReadyOptions) -> QueueResult<bool> {
        let id = self.require_id("ready")?;
        self.call(Operation::JobReady, vec![json!(id), serde_json::to_value(options)?])
            .await
    }

    pub async fn cancel(&self, options: CancelOptions) -> QueueResult<bool> {
        let id = self.require_id("cancel")?;
        self.call(Operation::JobCancel, vec![json!(id), serde_json::to_value(options)?])
            .await
    }

    pub async fn restart(&self, options: RestartOptions) -> QueueResult<bool> {
        let id = self.require_id("restart")?;
        self.call(Operation::JobRestart, vec![json!(id), serde_json::to_value(options)?])
            .await
    }

    /// Clone a completed job as a new one; returns the new id
    pub async fn rerun(&self, options: RerunOptions) -> QueueResult<Option<JobId>> {
        let id = self.require_id("rerun")?;
        self.call(Operation::JobRerun, vec![json!(id), serde_json::to_value(options)?])
            .await
    }

    pub async fn remove(&self) -> QueueResult<bool> {
        let id = self.require_id("remove")?;
        self.call(Operation::JobRemove, vec![json!(id)]).await
    }

    fn require_id(&self, action: &str) -> QueueResult<JobId> {
        self.doc
            .id
            .ok_or_else(|| QueueError::validation(format!("Can't {action} an unsaved job")))
    }

    fn require_run(&self, action: &str) -> QueueResult<(JobId, RunId)> {
        let id = self.require_id(action)?;
        let run_id = self.doc.run_id.ok_or_else(|| {
            QueueError::validation(format!("Can't {action} job {id}: it is not running"))
        })?;
        Ok((id, run_id))
    }

    async fn call<T: DeserializeOwned>(&self, op: Operation, params: Vec<Value>) -> QueueResult<T> {
        let method = format!("{}_{}", self.root, op);
        let value = self.transport.call(&method, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("root", &self.root)
            .field("doc", &self.doc)
            .finish()
    }
}

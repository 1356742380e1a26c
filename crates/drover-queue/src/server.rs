//! Job state machine
//!
//! Every operation is a self-contained conditional read/update against the
//! store. When a precondition has been invalidated by a concurrent caller
//! the operation does nothing and reports `false` (or no id / no jobs);
//! that is the normal outcome under contention, not an error.

use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::{Authorizer, Caller, Operation};
use crate::config::ServerConfig;
use crate::deps::DependencyResolver;
use crate::error::{QueueError, QueueResult};
use crate::job::{
    add_ms, sub_ms, JobDoc, JobId, JobStatus, LogEntry, LogLevel, Progress, RepeatWait, RunId,
    FOREVER,
};
use crate::options::{
    CancelOptions, DoneOptions, FailOptions, GetJobOptions, GetWorkOptions, LogOptions,
    OneOrMany, ReadyOptions, RerunOptions, RestartOptions, SaveOptions, ShutdownServerOptions,
};
use crate::store::{JobIndex, JobOrder, JobQuery, JobStore, RunIdFilter};
use crate::sweeper::{Sweeper, WORK_TIMEOUT_MESSAGE};

/// Message recorded on runs still active when the server stops
pub const SERVER_SHUTDOWN_MESSAGE: &str = "Running at Job Server shutdown.";

/// A scheduled recurrence landing this close to now is skipped for the next one
const SCHEDULE_SKIP_MS: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not handing out work (initial state)
    Stopped,
    Running,
    /// Not handing out work; running jobs fail when the grace period ends
    ShuttingDown,
}

#[derive(Debug)]
struct Lifecycle {
    state: ServerState,
    sweeper: Option<Sweeper>,
    shutdown_timer: Option<JoinHandle<()>>,
}

/// The authoritative job state machine for one queue
pub struct JobServer {
    config: ServerConfig,
    store: Arc<dyn JobStore>,
    auth: Authorizer,
    lifecycle: Mutex<Lifecycle>,
    indexed: AtomicBool,
}

impl JobServer {
    pub fn new(store: Arc<dyn JobStore>, config: ServerConfig) -> Self {
        Self {
            config,
            store,
            auth: Authorizer::new(),
            lifecycle: Mutex::new(Lifecycle {
                state: ServerState::Stopped,
                sweeper: None,
                shutdown_timer: None,
            }),
            indexed: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &str {
        &self.config.root
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Allow/deny rules consulted by [`JobServer::invoke`]
    pub fn authorizer(&self) -> &Authorizer {
        &self.auth
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle().state
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolver(&self) -> DependencyResolver<'_> {
        DependencyResolver::new(self.store.as_ref())
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Start handing out work and run the promotion sweeper.
    /// Aborts a pending shutdown.
    pub async fn start_server(self: &Arc<Self>) -> QueueResult<bool> {
        if !self.indexed.swap(true, Ordering::SeqCst) {
            for index in JobIndex::ALL {
                if let Err(e) = self.store.create_index(index).await {
                    self.indexed.store(false, Ordering::SeqCst);
                    return Err(e.into());
                }
            }
        }

        let mut lifecycle = self.lifecycle();
        if let Some(timer) = lifecycle.shutdown_timer.take() {
            timer.abort();
            info!(root = %self.config.root, "Pending shutdown aborted");
        }
        lifecycle.state = ServerState::Running;
        if lifecycle.sweeper.as_ref().map_or(true, Sweeper::is_finished) {
            lifecycle.sweeper = Some(Sweeper::spawn(
                Arc::downgrade(self),
                self.config.promote_interval(),
            ));
        }
        info!(root = %self.config.root, store = self.store.name(), "Job server started");
        Ok(true)
    }

    /// Stop handing out work immediately; once `timeout` ms have passed,
    /// stop the sweeper and fail every job still running.
    ///
    /// On a server that is already stopped there is no grace period: runs
    /// left in the store (e.g. by a crashed process) are failed at once.
    pub async fn shutdown_server(
        self: &Arc<Self>,
        options: ShutdownServerOptions,
    ) -> QueueResult<bool> {
        let timeout = options.timeout.unwrap_or(self.config.shutdown_timeout_ms);
        let stopped = {
            let mut lifecycle = self.lifecycle();
            if let Some(timer) = lifecycle.shutdown_timer.take() {
                timer.abort();
            }
            lifecycle.state == ServerState::Stopped
        };
        if stopped {
            self.stop_jobs().await?;
            return Ok(true);
        }
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = ServerState::ShuttingDown;
            info!(root = %self.config.root, timeout_ms = timeout, "Job server shutting down");

            if timeout > 0 {
                let server = Arc::downgrade(self);
                lifecycle.shutdown_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(timeout)).await;
                    if let Some(server) = server.upgrade() {
                        if let Err(e) = server.stop_jobs().await {
                            error!(error = %e, "Failed to stop running jobs at shutdown");
                        }
                    }
                }));
                return Ok(true);
            }
        }

        self.stop_jobs().await?;
        Ok(true)
    }

    async fn stop_jobs(&self) -> QueueResult<()> {
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = ServerState::Stopped;
            lifecycle.shutdown_timer = None;
            if let Some(sweeper) = lifecycle.sweeper.take() {
                sweeper.stop();
            }
        }

        let running = self
            .store
            .find(&JobQuery::new().with_status(JobStatus::Running), None, None)
            .await?;
        let count = running.len();
        for doc in running {
            if let (Some(id), Some(run_id)) = (doc.id, doc.run_id) {
                self.job_fail(id, run_id, json!({ "value": SERVER_SHUTDOWN_MESSAGE }), FailOptions::default())
                    .await?;
            }
        }
        info!(root = %self.config.root, failed = count, "Job server stopped");
        Ok(())
    }

    /// One promotion sweep: reclaim expired runs, then promote due jobs
    pub async fn promote_jobs(&self) -> QueueResult<()> {
        let now = Utc::now();
        let expired = self
            .store
            .find(
                &JobQuery::new()
                    .with_status(JobStatus::Running)
                    .expired_before(now),
                None,
                None,
            )
            .await?;

        for doc in expired {
            if let (Some(id), Some(run_id)) = (doc.id, doc.run_id) {
                warn!(job_id = %id, run_id = %run_id, "Run exceeded its work timeout");
                self.job_fail(id, run_id, json!({ "value": WORK_TIMEOUT_MESSAGE }), FailOptions::default())
                    .await?;
            }
        }

        self.job_ready(Vec::new(), ReadyOptions::default()).await?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Producer operations
    // ---------------------------------------------------------------

    /// Persist a new job, or resubmit a paused one. Returns the job id, or
    /// `None` when nothing was saved or the job was cancelled on save.
    pub async fn job_save(&self, mut doc: JobDoc, options: SaveOptions) -> QueueResult<Option<JobId>> {
        if !matches!(doc.status, JobStatus::Waiting | JobStatus::Paused) {
            return Err(QueueError::validation(format!(
                "Cannot save a job with status {}",
                doc.status
            )));
        }

        doc.retries = doc.retries.min(FOREVER);
        doc.repeats = doc.repeats.min(FOREVER);

        let now = Utc::now();
        doc.after = doc.after.max(now);
        doc.retry_until = doc.retry_until.max(now);
        doc.repeat_until = doc.repeat_until.max(now);

        if let RepeatWait::Schedule(expr) = &doc.repeat_wait {
            match doc.repeat_wait.occurrences(doc.after, 1)?.first() {
                Some(next) if *next <= doc.repeat_until => doc.after = *next,
                _ => {
                    warn!(schedule = %expr, "No scheduled occurrence before repeatUntil, job not saved");
                    return Ok(None);
                }
            }
        }

        match doc.id {
            Some(id) => self.resubmit(id, doc, now).await,
            None => self.submit(doc, options, now).await,
        }
    }

    async fn resubmit(&self, id: JobId, doc: JobDoc, now: DateTime<Utc>) -> QueueResult<Option<JobId>> {
        let mutation = |job: &mut JobDoc| {
            job.status = JobStatus::Waiting;
            job.data = doc.data.clone();
            job.priority = doc.priority;
            job.depends = doc.depends.clone();
            job.after = doc.after;
            job.retries = doc.retries;
            job.retry_wait = doc.retry_wait;
            job.retry_backoff = doc.retry_backoff;
            job.retry_until = doc.retry_until;
            job.repeat_retries = doc.repeat_retries;
            job.repeats = doc.repeats;
            job.repeat_wait = doc.repeat_wait.clone();
            job.repeat_until = doc.repeat_until;
            job.updated = now;
            job.push_log(LogEntry::new(now, None, "Job Resubmitted"));
        };
        let query = JobQuery::id(id)
            .with_status(JobStatus::Paused)
            .with_run_id(RunIdFilter::Absent);

        if self.store.update(&query, &mutation, false).await? == 0 {
            warn!(job_id = %id, "Resubmit ignored: job is not paused");
            return Ok(None);
        }

        let mut saved = doc;
        saved.id = Some(id);
        Ok(self.check_and_promote(&saved).await?.then_some(id))
    }

    async fn submit(&self, mut doc: JobDoc, options: SaveOptions, now: DateTime<Utc>) -> QueueResult<Option<JobId>> {
        if doc.repeats == FOREVER && options.cancel_repeats {
            let query = JobQuery::new()
                .with_types(vec![doc.job_type.clone()])
                .with_statuses(&JobStatus::CANCELLABLE)
                .with_repeats(FOREVER);
            let previous: Vec<JobId> = self
                .store
                .find(&query, None, None)
                .await?
                .into_iter()
                .filter_map(|d| d.id)
                .collect();
            if !previous.is_empty() {
                debug!(job_type = %doc.job_type, count = previous.len(), "Cancelling earlier repeating jobs");
                self.job_cancel(previous, CancelOptions::default()).await?;
            }
        }

        doc.run_id = None;
        doc.created = now;
        doc.updated = now;
        doc.push_log(LogEntry::new(now, None, "Job Submitted"));

        let id = self.store.insert(doc.clone()).await?;
        doc.id = Some(id);
        debug!(job_id = %id, job_type = %doc.job_type, "Job saved");

        Ok(self.check_and_promote(&doc).await?.then_some(id))
    }

    /// Resolve what can be resolved, cancel on a doomed antecedent,
    /// otherwise offer the job for promotion
    async fn check_and_promote(&self, doc: &JobDoc) -> QueueResult<bool> {
        let Some(id) = doc.id else { return Ok(false) };
        let check = self.resolver().check_deps(doc, false).await?;
        if check.must_cancel() {
            info!(
                job_id = %id,
                failed = check.failed.len(),
                cancelled = check.cancelled.len(),
                missing = check.removed.len(),
                "Antecedent cannot complete, cancelling job"
            );
            self.job_cancel(vec![id], CancelOptions::default()).await?;
            return Ok(false);
        }
        self.job_ready(vec![id], ReadyOptions::default()).await?;
        Ok(true)
    }

    /// Clone a completed job as a new `waiting` recurrence
    pub async fn job_rerun(&self, id: JobId, options: RerunOptions) -> QueueResult<Option<JobId>> {
        let found = self
            .store
            .find(&JobQuery::id(id).with_status(JobStatus::Completed), None, Some(1))
            .await?;
        let Some(doc) = found.into_iter().next() else {
            warn!(job_id = %id, "Rerun ignored: job is not completed");
            return Ok(None);
        };
        let until = options.until.unwrap_or(doc.repeat_until);
        self.rerun_doc(doc, options.repeats, options.wait, until)
            .await
            .map(Some)
    }

    async fn rerun_doc(
        &self,
        doc: JobDoc,
        repeats: u64,
        wait: u64,
        until: DateTime<Utc>,
    ) -> QueueResult<JobId> {
        let now = Utc::now();
        let previous = doc.id;
        let previous_run = doc.run_id;

        let mut next = doc;
        next.id = None;
        next.result = None;
        next.failures.clear();
        next.clear_run();
        next.status = JobStatus::Waiting;

        let budget = next
            .repeat_retries
            .unwrap_or_else(|| next.retries.saturating_add(next.retried))
            .min(FOREVER);
        next.repeat_retries = Some(budget);
        next.retries = budget;
        next.retried = 0;
        next.retry_until = until;
        next.repeats = repeats.min(FOREVER);
        next.repeat_until = until;
        next.repeated = next.repeated.saturating_add(1);
        next.progress = Progress::default();
        next.created = now;
        next.updated = now;
        next.after = add_ms(now, wait);
        let origin = previous.map(|id| id.to_string()).unwrap_or_default();
        next.log = vec![LogEntry::new(now, previous_run, format!("Rerunning job {origin}"))];

        let new_id = self.store.insert(next).await?;
        debug!(job_id = %new_id, previous = %origin, wait_ms = wait, "Recurrence scheduled");
        self.job_ready(vec![new_id], ReadyOptions::default()).await?;
        Ok(new_id)
    }

    // ---------------------------------------------------------------
    // Worker operations
    // ---------------------------------------------------------------

    /// Claim up to `max_jobs` ready jobs of the given types.
    ///
    /// Candidates are found, then claimed with one conditional multi-update
    /// that only matches documents still `ready` and unclaimed; exactly the
    /// documents carrying this call's run id are returned. Rounds repeat
    /// while candidates remain, bounded by `max_claim_rounds`.
    pub async fn get_work(&self, types: &[String], options: GetWorkOptions) -> QueueResult<Vec<JobDoc>> {
        if self.state() != ServerState::Running || options.max_jobs == 0 {
            return Ok(Vec::new());
        }

        let run_id: RunId = Uuid::new_v4();
        let work_timeout = options.work_timeout;
        let mut claimed: Vec<JobDoc> = Vec::new();

        for _ in 0..self.config.max_claim_rounds.max(1) {
            let needed = options.max_jobs - claimed.len();
            if needed == 0 {
                break;
            }

            let available = JobQuery::new()
                .with_types(types.to_vec())
                .with_status(JobStatus::Ready)
                .with_run_id(RunIdFilter::Absent);
            let ids: Vec<JobId> = self
                .store
                .find(&available, Some(JobOrder::Claim), Some(needed))
                .await?
                .into_iter()
                .filter_map(|doc| doc.id)
                .collect();
            if ids.is_empty() {
                break;
            }

            let now = Utc::now();
            let expires_after = work_timeout.map(|ms| add_ms(now, ms));
            let mutation = move |doc: &mut JobDoc| {
                doc.status = JobStatus::Running;
                doc.run_id = Some(run_id);
                doc.retries = doc.retries.saturating_sub(1);
                doc.retried = doc.retried.saturating_add(1);
                doc.work_timeout = work_timeout;
                doc.expires_after = expires_after;
                doc.updated = now;
                doc.push_log(LogEntry::new(now, Some(run_id), "Job Running"));
            };
            let claim = JobQuery::new()
                .with_ids(ids.clone())
                .with_status(JobStatus::Ready)
                .with_run_id(RunIdFilter::Absent);

            let count = self.store.update(&claim, &mutation, true).await?;
            if count == 0 {
                debug!(run_id = %run_id, candidates = ids.len(), "Lost every candidate to another claimant");
                continue;
            }

            let mine = JobQuery::new()
                .with_ids(ids)
                .with_run_id(RunIdFilter::Equals(run_id));
            let docs = self.store.find(&mine, Some(JobOrder::Claim), None).await?;
            if docs.is_empty() {
                warn!(run_id = %run_id, "Claimed jobs could not be read back");
            }
            claimed.extend(docs.into_iter().map(|mut doc| {
                doc.log.clear();
                doc.failures.clear();
                doc
            }));
        }

        if !claimed.is_empty() {
            debug!(run_id = %run_id, count = claimed.len(), "Claimed jobs");
        }
        Ok(claimed)
    }

    /// Fetch documents by id
    pub async fn get_job(&self, ids: Vec<JobId>, options: GetJobOptions) -> QueueResult<Vec<JobDoc>> {
        let docs = self
            .store
            .find(&JobQuery::new().with_ids(ids), None, None)
            .await?;
        Ok(docs
            .into_iter()
            .map(|mut doc| {
                if !options.get_log {
                    doc.log.clear();
                }
                if !options.get_failures {
                    doc.failures.clear();
                }
                doc
            })
            .collect())
    }

    /// Record progress of a running job; refreshes `expiresAfter` when a
    /// work timeout is set
    pub async fn job_progress(&self, id: JobId, run_id: RunId, completed: u64, total: u64) -> QueueResult<bool> {
        let progress = Progress::new(completed, total)?;
        let now = Utc::now();
        let mutation = move |doc: &mut JobDoc| {
            doc.progress = progress;
            doc.updated = now;
            if let Some(timeout) = doc.work_timeout {
                doc.expires_after = Some(add_ms(now, timeout));
            }
        };
        let count = self
            .store
            .update(&running(id, run_id), &mutation, false)
            .await?;
        if count == 0 {
            warn!(job_id = %id, run_id = %run_id, "Progress ignored: job is not running under this run");
        }
        Ok(count > 0)
    }

    /// Append a log entry; allowed in any status
    pub async fn job_log(
        &self,
        id: JobId,
        run_id: Option<RunId>,
        message: String,
        options: LogOptions,
    ) -> QueueResult<bool> {
        if options.echo {
            match options.level {
                LogLevel::Info | LogLevel::Success => info!(job_id = %id, "{message}"),
                LogLevel::Warning => warn!(job_id = %id, "{message}"),
                LogLevel::Danger => error!(job_id = %id, "{message}"),
            }
        }

        let now = Utc::now();
        let entry = LogEntry {
            time: now,
            run_id,
            message,
            level: options.level,
            data: options.data,
        };
        let mutation = |doc: &mut JobDoc| {
            doc.push_log(entry.clone());
            doc.updated = now;
        };
        let count = self.store.update(&JobQuery::id(id), &mutation, false).await?;
        Ok(count > 0)
    }

    /// Complete a running job, schedule its next recurrence and resolve its
    /// dependents
    pub async fn job_done(
        &self,
        id: JobId,
        run_id: RunId,
        result: Value,
        options: DoneOptions,
    ) -> QueueResult<bool> {
        let Some(doc) = self.find_running(id, run_id).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let total = doc.progress.total;
        let mutation = |job: &mut JobDoc| {
            job.status = JobStatus::Completed;
            job.result = Some(result.clone());
            job.progress = Progress::full(total);
            job.clear_run();
            job.updated = now;
            job.push_log(
                LogEntry::new(now, Some(run_id), "Job Completed").with_level(LogLevel::Success),
            );
        };
        if self.store.update(&running(id, run_id), &mutation, false).await? != 1 {
            warn!(job_id = %id, run_id = %run_id, "Done ignored: job changed concurrently");
            return Ok(false);
        }
        info!(job_id = %id, run_id = %run_id, "Job completed");

        if doc.repeats > 0 {
            self.schedule_recurrence(doc, now).await?;
        }

        let not_before = options.delay_deps.map(|ms| add_ms(now, ms));
        let dependents = self.resolver().resolve(id, now, not_before).await?;
        if !dependents.is_empty() {
            self.job_ready(dependents, ReadyOptions::default()).await?;
        }
        Ok(true)
    }

    async fn schedule_recurrence(&self, doc: JobDoc, now: DateTime<Utc>) -> QueueResult<Option<JobId>> {
        let repeats = doc.repeats - 1;
        let until = doc.repeat_until;

        let wait = match &doc.repeat_wait {
            RepeatWait::Interval(wait) => {
                if sub_ms(until, *wait) < now {
                    debug!(job_id = ?doc.id, "Repeat window closed");
                    return Ok(None);
                }
                *wait
            }
            RepeatWait::Schedule(_) => {
                let next = doc.repeat_wait.occurrences(now, 2)?;
                let skip = TimeDelta::milliseconds(SCHEDULE_SKIP_MS);
                let pick = match next.first() {
                    Some(first) if *first - now > skip => Some(*first),
                    _ => next.get(1).copied(),
                };
                match pick {
                    Some(at) if at <= until => (at - now).num_milliseconds().max(0) as u64,
                    _ => {
                        debug!(job_id = ?doc.id, "No scheduled occurrence before repeatUntil");
                        return Ok(None);
                    }
                }
            }
        };

        self.rerun_doc(doc, repeats, wait, until).await.map(Some)
    }

    /// Fail a running job: back to `waiting` while retries remain inside
    /// `retryUntil`, otherwise `failed`, which cancels its dependents
    pub async fn job_fail(&self, id: JobId, run_id: RunId, err: Value, options: FailOptions) -> QueueResult<bool> {
        let Some(doc) = self.find_running(id, run_id).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let next_after = add_ms(now, doc.retry_backoff.delay(doc.retry_wait, doc.retried));
        let status = if !options.fatal && doc.retries > 0 && doc.retry_until >= next_after {
            JobStatus::Waiting
        } else {
            JobStatus::Failed
        };

        let mut record = match err {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        record.insert("runId".to_string(), json!(run_id));
        let reason = record
            .get("message")
            .or_else(|| record.get("value"))
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .unwrap_or_default();
        let record = Value::Object(record);
        let message = if options.fatal {
            format!("Job Failed with Fatal Error: {reason}")
        } else {
            format!("Job Failed with Error: {reason}")
        };

        let mutation = |job: &mut JobDoc| {
            job.status = status;
            job.clear_run();
            job.after = next_after;
            job.updated = now;
            job.failures.push(record.clone());
            job.push_log(
                LogEntry::new(now, Some(run_id), message.clone()).with_level(LogLevel::Danger),
            );
        };
        let count = self.store.update(&running(id, run_id), &mutation, false).await?;
        if count != 1 {
            warn!(job_id = %id, run_id = %run_id, "Fail ignored: job changed concurrently");
            return Ok(false);
        }
        info!(job_id = %id, run_id = %run_id, status = %status, error = %reason, "Job failed");

        if status == JobStatus::Failed {
            let dependents = self
                .resolver()
                .dependents_of(id, Some(&JobStatus::CANCELLABLE))
                .await?;
            if !dependents.is_empty() {
                self.job_cancel(dependents, CancelOptions::default()).await?;
            }
        }
        Ok(true)
    }

    async fn find_running(&self, id: JobId, run_id: RunId) -> QueueResult<Option<JobDoc>> {
        let found = self
            .store
            .find(
                &JobQuery::id(id).with_run_id(RunIdFilter::Equals(run_id)),
                None,
                Some(1),
            )
            .await?;
        match found.into_iter().next() {
            Some(doc) if doc.status == JobStatus::Running => Ok(Some(doc)),
            Some(doc) => {
                warn!(job_id = %id, status = %doc.status, "Job is not running");
                Ok(None)
            }
            None => {
                warn!(job_id = %id, run_id = %run_id, "Running job not found");
                Ok(None)
            }
        }
    }

    // ---------------------------------------------------------------
    // Bulk transitions
    // ---------------------------------------------------------------

    /// Promote due `waiting` jobs to `ready`; an empty `ids` means every job.
    /// Jobs with unresolved antecedents stay put unless `force`d.
    pub async fn job_ready(&self, ids: Vec<JobId>, options: ReadyOptions) -> QueueResult<bool> {
        let now = Utc::now();
        let mut query = JobQuery::new()
            .with_status(JobStatus::Waiting)
            .due_by(options.time.unwrap_or(now));
        if !ids.is_empty() {
            query = query.with_ids(ids);
        }
        let force = options.force;
        if !force {
            query = query.without_depends();
        }

        let mutation = move |doc: &mut JobDoc| {
            doc.status = JobStatus::Ready;
            doc.updated = now;
            let message = if force && !doc.depends.is_empty() {
                doc.depends.clear();
                "Promoted to ready, dependencies force resolved"
            } else {
                "Promoted to ready"
            };
            doc.push_log(LogEntry::new(now, None, message));
        };
        let count = self.store.update(&query, &mutation, true).await?;
        if count > 0 {
            debug!(count = count, "Promoted jobs");
        }
        Ok(count > 0)
    }

    pub async fn job_pause(&self, ids: Vec<JobId>) -> QueueResult<bool> {
        let now = Utc::now();
        let mutation = |doc: &mut JobDoc| {
            doc.status = JobStatus::Paused;
            doc.updated = now;
            doc.push_log(LogEntry::new(now, None, "Job Paused"));
        };
        let query = JobQuery::new()
            .with_ids(ids)
            .with_statuses(&JobStatus::PAUSABLE);
        Ok(self.store.update(&query, &mutation, true).await? > 0)
    }

    pub async fn job_resume(&self, ids: Vec<JobId>) -> QueueResult<bool> {
        let now = Utc::now();
        let mutation = |doc: &mut JobDoc| {
            doc.status = JobStatus::Waiting;
            doc.updated = now;
            doc.push_log(LogEntry::new(now, None, "Job Resumed"));
        };
        let query = JobQuery::new()
            .with_ids(ids.clone())
            .with_status(JobStatus::Paused);
        let count = self.store.update(&query, &mutation, true).await?;
        if count > 0 && !ids.is_empty() {
            self.job_ready(ids, ReadyOptions::default()).await?;
        }
        Ok(count > 0)
    }

    /// Cancel jobs and, per `options`, their antecedents and/or dependents.
    /// The cascade visits each job at most once.
    pub async fn job_cancel(&self, ids: Vec<JobId>, options: CancelOptions) -> QueueResult<bool> {
        let mut visited: HashSet<JobId> = ids.iter().copied().collect();
        let mut frontier = ids;
        let mut cancelled_requested = false;
        let mut first = true;

        while !frontier.is_empty() {
            let now = Utc::now();
            let mutation = |doc: &mut JobDoc| {
                doc.status = JobStatus::Cancelled;
                doc.clear_run();
                doc.progress = Progress::default();
                doc.updated = now;
                doc.push_log(LogEntry::new(now, None, "Job Cancelled").with_level(LogLevel::Warning));
            };
            let query = JobQuery::new()
                .with_ids(frontier.clone())
                .with_statuses(&JobStatus::CANCELLABLE);
            let count = self.store.update(&query, &mutation, true).await?;
            if first {
                cancelled_requested = count > 0;
                first = false;
            }
            debug!(count = count, "Cancelled jobs");

            if !options.antecedents && !options.dependents {
                break;
            }
            frontier = self
                .resolver()
                .ids_of_deps(
                    &frontier,
                    options.antecedents,
                    options.dependents,
                    &JobStatus::CANCELLABLE,
                )
                .await?
                .into_iter()
                .filter(|id| visited.insert(*id))
                .collect();
        }

        Ok(cancelled_requested)
    }

    /// Return cancelled or failed jobs to `waiting` with extra retries, then
    /// offer them for promotion. The cascade visits each job at most once.
    pub async fn job_restart(&self, ids: Vec<JobId>, options: RestartOptions) -> QueueResult<bool> {
        let mut visited: HashSet<JobId> = ids.iter().copied().collect();
        let mut restarted = Vec::new();
        let mut frontier = ids;
        let mut restarted_requested = false;
        let mut first = true;

        while !frontier.is_empty() {
            let now = Utc::now();
            let extra = options.retries;
            let until = options.until;
            let mutation = move |doc: &mut JobDoc| {
                doc.status = JobStatus::Waiting;
                doc.progress = Progress::default();
                doc.retries = doc.retries.saturating_add(extra).min(FOREVER);
                if let Some(until) = until {
                    doc.retry_until = until;
                }
                doc.updated = now;
                doc.push_log(LogEntry::new(now, None, "Job Restarted"));
            };
            let query = JobQuery::new()
                .with_ids(frontier.clone())
                .with_statuses(&JobStatus::RESTARTABLE);
            let count = self.store.update(&query, &mutation, true).await?;
            if first {
                restarted_requested = count > 0;
                first = false;
            }
            restarted.extend(frontier.iter().copied());

            if !options.antecedents && !options.dependents {
                break;
            }
            frontier = self
                .resolver()
                .ids_of_deps(
                    &frontier,
                    options.antecedents,
                    options.dependents,
                    &JobStatus::RESTARTABLE,
                )
                .await?
                .into_iter()
                .filter(|id| visited.insert(*id))
                .collect();
        }

        if !restarted.is_empty() {
            self.job_ready(restarted, ReadyOptions::default()).await?;
        }
        Ok(restarted_requested)
    }

    /// Delete jobs in a terminal status
    pub async fn job_remove(&self, ids: Vec<JobId>) -> QueueResult<bool> {
        let query = JobQuery::new()
            .with_ids(ids)
            .with_statuses(&JobStatus::REMOVABLE);
        let count = self.store.delete(&query).await?;
        if count > 0 {
            debug!(count = count, "Removed jobs");
        }
        Ok(count > 0)
    }

    // ---------------------------------------------------------------
    // Remote entry point
    // ---------------------------------------------------------------

    /// Run a named operation on behalf of `caller` with positional JSON
    /// arguments. `method` is `{root}_{operation}`.
    pub async fn invoke(self: &Arc<Self>, caller: &Caller, method: &str, params: Vec<Value>) -> QueueResult<Value> {
        let name = method
            .strip_prefix(self.config.root.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .ok_or_else(|| QueueError::UnknownMethod(method.to_string()))?;
        let op: Operation = name.parse()?;
        self.auth.check(caller, op, &params)?;
        debug!(caller = %caller, method = %op, "Invoking operation");

        let args = Args { op, params: &params };
        let value = match op {
            Operation::StartServer => json!(self.start_server().await?),
            Operation::ShutdownServer => json!(self.shutdown_server(args.opt(0)?).await?),
            Operation::JobSave => json!(self.job_save(args.req(0)?, args.opt(1)?).await?),
            Operation::GetWork => {
                let types: OneOrMany<String> = args.req(0)?;
                serde_json::to_value(self.get_work(&types.into_vec(), args.opt(1)?).await?)?
            }
            Operation::GetJob => {
                serde_json::to_value(self.get_job(args.ids(0)?, args.opt(1)?).await?)?
            }
            Operation::JobRemove => json!(self.job_remove(args.ids(0)?).await?),
            Operation::JobPause => json!(self.job_pause(args.ids(0)?).await?),
            Operation::JobResume => json!(self.job_resume(args.ids(0)?).await?),
            Operation::JobReady => json!(self.job_ready(args.ids(0)?, args.opt(1)?).await?),
            Operation::JobCancel => json!(self.job_cancel(args.ids(0)?, args.opt(1)?).await?),
            Operation::JobRestart => json!(self.job_restart(args.ids(0)?, args.opt(1)?).await?),
            Operation::JobRerun => json!(self.job_rerun(args.req(0)?, args.opt(1)?).await?),
            Operation::JobLog => json!(
                self.job_log(args.req(0)?, args.opt(1)?, args.req(2)?, args.opt(3)?)
                    .await?
            ),
            Operation::JobProgress => json!(
                self.job_progress(args.req(0)?, args.req(1)?, args.req(2)?, args.req(3)?)
                    .await?
            ),
            Operation::JobDone => json!(
                self.job_done(args.req(0)?, args.req(1)?, args.opt(2)?, args.opt(3)?)
                    .await?
            ),
            Operation::JobFail => json!(
                self.job_fail(args.req(0)?, args.req(1)?, args.opt(2)?, args.opt(3)?)
                    .await?
            ),
        };
        Ok(value)
    }
}

impl std::fmt::Debug for JobServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobServer")
            .field("config", &self.config)
            .field("store", &self.store.name())
            .field("state", &self.state())
            .finish()
    }
}

fn running(id: JobId, run_id: RunId) -> JobQuery {
    JobQuery::id(id)
        .with_status(JobStatus::Running)
        .with_run_id(RunIdFilter::Equals(run_id))
}

/// Positional argument decoding for [`JobServer::invoke`]
struct Args<'a> {
    op: Operation,
    params: &'a [Value],
}

impl Args<'_> {
    fn req<T: DeserializeOwned>(&self, idx: usize) -> QueueResult<T> {
        let value = self.params.get(idx).ok_or_else(|| {
            QueueError::validation(format!("{}: missing argument {idx}", self.op))
        })?;
        self.decode(idx, value)
    }

    fn opt<T: DeserializeOwned + Default>(&self, idx: usize) -> QueueResult<T> {
        match self.params.get(idx) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(value) => self.decode(idx, value),
        }
    }

    fn ids(&self, idx: usize) -> QueueResult<Vec<JobId>> {
        let ids: OneOrMany<JobId> = self.req(idx)?;
        Ok(ids.into_vec())
    }

    fn decode<T: DeserializeOwned>(&self, idx: usize, value: &Value) -> QueueResult<T> {
        serde_json::from_value(value.clone())
            .map_err(|e| QueueError::validation(format!("{}: argument {idx}: {e}", self.op)))
    }
}

//! Worker Pool for processing jobs
//!
//! Two drivers keep the pool busy: a claim driver that asks the server for
//! just enough work to fill free slots (plus `prefetch`), and a dispatch
//! driver that hands queued jobs to the work function whenever a slot is
//! free. At most one claim is in flight at a time.

use futures::future::join_all;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Operation;
use crate::error::{QueueError, QueueResult};
use crate::handle::Job;
use crate::job::JobDoc;
use crate::options::FailOptions;
use crate::transport::Transport;

/// Message recorded on jobs failed by a pool shutdown
pub const WORKER_SHUTDOWN_MESSAGE: &str = "Worker shutdown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Work function invocations allowed at once
    pub concurrency: usize,
    /// Jobs handed to each invocation
    pub payload: usize,
    /// Extra jobs claimed ahead of need
    pub prefetch: usize,
    /// Claim cadence in ms; `None` claims only on [`WorkerPool::trigger`]
    pub poll_interval_ms: Option<u64>,
    /// Passed to `getWork` so abandoned runs are reclaimed (ms)
    pub work_timeout_ms: Option<u64>,
    /// Panic when a completion is signalled twice
    pub callback_strict: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            payload: 1,
            prefetch: 0,
            poll_interval_ms: Some(5_000),
            work_timeout_ms: None,
            callback_strict: false,
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> QueueResult<()> {
        if self.concurrency == 0 {
            return Err(QueueError::validation("Worker concurrency must be at least 1"));
        }
        if self.payload == 0 {
            return Err(QueueError::validation("Worker payload must be at least 1"));
        }
        if self.poll_interval_ms == Some(0) {
            return Err(QueueError::validation("Worker poll interval must be positive"));
        }
        Ok(())
    }
}

/// What one work function invocation receives
#[derive(Debug, Clone)]
pub enum Work {
    /// Pools with `payload == 1`
    Single(Job),
    Batch(Vec<Job>),
}

impl Work {
    pub fn jobs(&self) -> &[Job] {
        match self {
            Work::Single(job) => std::slice::from_ref(job),
            Work::Batch(jobs) => jobs,
        }
    }

    pub fn into_jobs(self) -> Vec<Job> {
        match self {
            Work::Single(job) => vec![job],
            Work::Batch(jobs) => jobs,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownLevel {
    /// Drain queued and in-flight work, fail nothing
    Soft,
    /// Let in-flight work finish, fail what is still queued
    #[default]
    Normal,
    /// Fail queued and in-flight jobs without waiting
    Hard,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownOptions {
    pub level: ShutdownLevel,
    /// Suppress the shutdown log lines
    pub quiet: bool,
}

impl ShutdownOptions {
    pub fn level(level: ShutdownLevel) -> Self {
        Self { level, quiet: false }
    }
}

pub type ErrorCallback = Arc<dyn Fn(&QueueError) + Send + Sync>;

type WorkFn = dyn Fn(Work, Completion) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Stopping(ShutdownLevel),
    Stopped,
}

struct PoolState {
    phase: Phase,
    paused: bool,
    queue: VecDeque<Job>,
    tasks: HashMap<u64, Vec<Job>>,
    next_task: u64,
    claiming: bool,
}

struct Inner {
    transport: Arc<dyn Transport>,
    root: String,
    types: Vec<String>,
    config: WorkerConfig,
    work_fn: Arc<WorkFn>,
    on_error: RwLock<Option<ErrorCallback>>,
    state: Mutex<PoolState>,
    changed: Notify,
    token: CancellationToken,
    runtime: Handle,
}

/// Signals that one work function invocation has finished
///
/// Must be invoked exactly once. Dropping every clone without invoking it
/// is reported and frees the slot.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

struct CompletionInner {
    pool: Arc<Inner>,
    task_id: u64,
    done: AtomicBool,
}

impl Completion {
    pub fn task_id(&self) -> u64 {
        self.inner.task_id
    }

    pub fn complete(&self) {
        let inner = &self.inner;
        if inner.done.swap(true, Ordering::SeqCst) {
            let err = QueueError::Callback(format!(
                "completion for task {} invoked more than once",
                inner.task_id
            ));
            inner.pool.report(&err);
            if inner.pool.config.callback_strict {
                panic!("{err}");
            }
            return;
        }
        inner.pool.finish(inner.task_id);
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("task_id", &self.inner.task_id)
            .field("done", &self.inner.done.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for CompletionInner {
    fn drop(&mut self) {
        if !*self.done.get_mut() {
            self.pool.report(&QueueError::Callback(format!(
                "completion for task {} dropped without being invoked",
                self.task_id
            )));
            self.pool.finish(self.task_id);
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn report(&self, err: &QueueError) {
        let callback = self
            .on_error
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match callback {
            Some(callback) => callback(err),
            None => error!(root = %self.root, error = %err, "Worker pool error"),
        }
    }

    fn method(&self, op: Operation) -> String {
        format!("{}_{}", self.root, op)
    }

    /// Number of additional jobs to claim right now, if any
    fn claim_size(&self, state: &PoolState) -> usize {
        let free = self.config.concurrency.saturating_sub(state.tasks.len());
        (self.config.prefetch + self.config.payload * free).saturating_sub(state.queue.len())
    }

    /// Claim driver: at most one `getWork` in flight
    fn claim(self: &Arc<Self>) {
        let wanted = {
            let mut state = self.state();
            if state.phase != Phase::Active || state.paused || state.claiming {
                return;
            }
            let wanted = self.claim_size(&state);
            if wanted == 0 {
                return;
            }
            state.claiming = true;
            wanted
        };

        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let params = vec![
                json!(inner.types),
                json!({ "maxJobs": wanted, "workTimeout": inner.config.work_timeout_ms }),
            ];
            let claimed = inner
                .transport
                .call(&inner.method(Operation::GetWork), params)
                .await
                .and_then(|value| jobs_from_value(&inner.transport, &inner.root, value));

            let count = {
                let mut state = inner.state();
                state.claiming = false;
                match claimed {
                    Ok(jobs) => {
                        let count = jobs.len();
                        state.queue.extend(jobs);
                        Ok(count)
                    }
                    Err(e) => Err(e),
                }
            };
            inner.changed.notify_waiters();

            match count {
                Ok(0) => {}
                Ok(count) => debug!(root = %inner.root, requested = wanted, claimed = count, "Claimed work"),
                Err(e) => inner.report(&e),
            }
            inner.dispatch();
        });
    }

    /// Dispatch driver: fill free slots from the queue
    fn dispatch(self: &Arc<Self>) {
        loop {
            let (task_id, mut jobs) = {
                let mut state = self.state();
                let draining = matches!(state.phase, Phase::Active | Phase::Stopping(ShutdownLevel::Soft));
                if !draining
                    || state.paused
                    || state.tasks.len() >= self.config.concurrency
                    || state.queue.is_empty()
                {
                    return;
                }
                let take = self.config.payload.min(state.queue.len());
                let jobs: Vec<Job> = state.queue.drain(..take).collect();
                let task_id = state.next_task;
                state.next_task += 1;
                state.tasks.insert(task_id, jobs.clone());
                (task_id, jobs)
            };

            let completion = Completion {
                inner: Arc::new(CompletionInner {
                    pool: Arc::clone(self),
                    task_id,
                    done: AtomicBool::new(false),
                }),
            };
            let work = if self.config.payload == 1 && jobs.len() == 1 {
                Work::Single(jobs.remove(0))
            } else {
                Work::Batch(jobs)
            };

            let work_fn = Arc::clone(&self.work_fn);
            let guard = completion.clone();
            if catch_unwind(AssertUnwindSafe(move || work_fn(work, completion))).is_err() {
                self.report(&QueueError::Callback(format!(
                    "work function panicked in task {task_id}"
                )));
                if !guard.inner.done.swap(true, Ordering::SeqCst) {
                    self.finish(task_id);
                }
            }
        }
    }

    /// Free a slot and wake both drivers
    fn finish(self: &Arc<Self>, task_id: u64) {
        let removed = self.state().tasks.remove(&task_id).is_some();
        self.changed.notify_waiters();
        if !removed {
            return;
        }
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.dispatch();
            inner.claim();
        });
    }

    async fn wait_until(&self, ready: impl Fn(&PoolState) -> bool) {
        loop {
            let changed = self.changed.notified();
            if ready(&self.state()) {
                return;
            }
            changed.await;
        }
    }

    async fn fail_all(&self, jobs: Vec<Job>) {
        let results = join_all(jobs.iter().map(|job| {
            job.fail(json!(WORKER_SHUTDOWN_MESSAGE), FailOptions::default())
        }))
        .await;
        for (job, result) in jobs.iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => debug!(job_id = ?job.id(), "Job already settled at worker shutdown"),
                Err(e) => self.report(&e),
            }
        }
    }
}

/// Pulls jobs of some types from a job server and runs them through a work function
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<Inner>,
}

impl WorkerPool {
    /// Start claiming and dispatching. Must be called inside a tokio runtime.
    pub fn start<F>(
        transport: Arc<dyn Transport>,
        root: impl Into<String>,
        types: Vec<String>,
        config: WorkerConfig,
        work_fn: F,
    ) -> QueueResult<Self>
    where
        F: Fn(Work, Completion) + Send + Sync + 'static,
    {
        config.validate()?;
        if types.is_empty() {
            return Err(QueueError::validation("Worker pool needs at least one job type"));
        }
        let runtime = Handle::try_current()
            .map_err(|e| QueueError::validation(format!("Worker pool needs a tokio runtime: {e}")))?;

        let inner = Arc::new(Inner {
            transport,
            root: root.into(),
            types,
            config,
            work_fn: Arc::new(work_fn),
            on_error: RwLock::new(None),
            state: Mutex::new(PoolState {
                phase: Phase::Active,
                paused: false,
                queue: VecDeque::new(),
                tasks: HashMap::new(),
                next_task: 0,
                claiming: false,
            }),
            changed: Notify::new(),
            token: CancellationToken::new(),
            runtime,
        });

        info!(
            root = %inner.root,
            types = ?inner.types,
            concurrency = inner.config.concurrency,
            payload = inner.config.payload,
            "Worker pool started"
        );

        if let Some(ms) = inner.config.poll_interval_ms {
            spawn_poller(Arc::downgrade(&inner), inner.token.clone(), Duration::from_millis(ms));
        } else {
            inner.claim();
        }

        Ok(Self { inner })
    }

    /// Replace the error callback (default: log through `tracing`)
    pub fn on_error<F>(&self, callback: F)
    where
        F: Fn(&QueueError) + Send + Sync + 'static,
    {
        *self.inner.on_error.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Stop claiming and dispatching
    pub fn pause(&self) {
        self.inner.state().paused = true;
        debug!(root = %self.inner.root, "Worker pool paused");
    }

    pub fn resume(&self) {
        self.inner.state().paused = false;
        debug!(root = %self.inner.root, "Worker pool resumed");
        self.inner.claim();
        self.inner.dispatch();
    }

    /// Claim now instead of waiting for the next poll
    pub fn trigger(&self) {
        self.inner.claim();
    }

    /// Jobs claimed but not yet dispatched
    pub fn length(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Work function invocations in flight
    pub fn running(&self) -> usize {
        self.inner.state().tasks.len()
    }

    pub fn idle(&self) -> bool {
        let state = self.inner.state();
        state.queue.is_empty() && state.tasks.is_empty()
    }

    pub fn full(&self) -> bool {
        self.inner.state().tasks.len() >= self.inner.config.concurrency
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state().paused
    }

    /// Stop intake and settle outstanding work according to `options.level`.
    /// Concurrent calls all return once the first shutdown has drained.
    pub async fn shutdown(&self, options: ShutdownOptions) {
        let inner = &self.inner;
        let first = {
            let mut state = inner.state();
            if state.phase == Phase::Active {
                state.phase = Phase::Stopping(options.level);
                if options.level == ShutdownLevel::Soft {
                    state.paused = false;
                }
                true
            } else {
                false
            }
        };
        if !first {
            inner.wait_until(|s| s.phase == Phase::Stopped).await;
            return;
        }
        inner.token.cancel();
        if !options.quiet {
            info!(root = %inner.root, level = ?options.level, "Worker pool shutting down");
        }

        inner.wait_until(|s| !s.claiming).await;

        match options.level {
            ShutdownLevel::Hard => {
                let jobs: Vec<Job> = {
                    let mut state = inner.state();
                    let mut jobs: Vec<Job> = state.queue.drain(..).collect();
                    jobs.extend(state.tasks.values().flatten().cloned());
                    jobs
                };
                inner.fail_all(jobs).await;
            }
            ShutdownLevel::Normal => {
                inner.wait_until(|s| s.tasks.is_empty()).await;
                let queued: Vec<Job> = inner.state().queue.drain(..).collect();
                inner.fail_all(queued).await;
            }
            ShutdownLevel::Soft => {
                inner.dispatch();
                inner
                    .wait_until(|s| s.tasks.is_empty() && s.queue.is_empty())
                    .await;
            }
        }

        inner.state().phase = Phase::Stopped;
        inner.changed.notify_waiters();
        if !options.quiet {
            info!(root = %inner.root, "Worker pool shut down");
        }
    }

    /// [`WorkerPool::shutdown`] in the background, then `callback` once
    pub fn shutdown_then<F>(&self, options: ShutdownOptions, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = self.clone();
        self.inner.runtime.spawn(async move {
            pool.shutdown(options).await;
            callback();
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("WorkerPool")
            .field("root", &self.inner.root)
            .field("types", &self.inner.types)
            .field("queued", &state.queue.len())
            .field("running", &state.tasks.len())
            .field("phase", &state.phase)
            .finish()
    }
}

fn spawn_poller(pool: Weak<Inner>, token: CancellationToken, interval: Duration) {
    let Some(runtime) = pool.upgrade().map(|inner| inner.runtime.clone()) else {
        return;
    };
    runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = pool.upgrade() else {
                        warn!("Worker pool dropped without shutdown, poller exiting");
                        break;
                    };
                    inner.claim();
                }
            }
        }
    });
}

/// Decode a `getWork` reply into handles
fn jobs_from_value(
    transport: &Arc<dyn Transport>,
    root: &str,
    value: Value,
) -> QueueResult<Vec<Job>> {
    let docs: Vec<JobDoc> = serde_json::from_value(value)?;
    Ok(docs
        .into_iter()
        .map(|doc| Job::from_doc(Arc::clone(transport), root, doc))
        .collect())
}

//! # Drover Queue
//!
//! Persistent, priority-ordered job queue with a lock-free claim protocol.
//!
//! Features:
//! - Job state machine (`JobServer`) over a pluggable `JobStore`
//! - Optimistic claim protocol: at most one worker holds a run at a time
//! - Retries with constant or exponential backoff, repeats by interval or cron schedule
//! - Dependency graphs with cascading cancel and restart
//! - Client-side `Job` handles and a `WorkerPool` that talk through a `Transport`
//! - Promotion sweeper reclaiming runs past their work timeout

pub mod auth;
pub mod config;
pub mod deps;
pub mod error;
pub mod handle;
pub mod job;
pub mod memory;
pub mod options;
pub mod server;
pub mod store;
pub mod sweeper;
pub mod transport;
pub mod worker;

pub use auth::{Authorizer, Caller, Operation, PermissionGroup, Rule};
pub use config::{init_tracing, ServerConfig};
pub use error::{QueueError, QueueResult, StoreError};
pub use handle::{Job, RepeatOptions, RetryOptions};
pub use job::{Backoff, JobDoc, JobId, JobStatus, LogLevel, Priority, Progress, RepeatWait, RunId, FOREVER};
pub use memory::MemoryStore;
pub use server::{JobServer, ServerState};
pub use store::{JobIndex, JobOrder, JobQuery, JobStore, RunIdFilter};
pub use transport::{LocalTransport, Transport};
pub use worker::{Completion, ShutdownLevel, ShutdownOptions, Work, WorkerConfig, WorkerPool};

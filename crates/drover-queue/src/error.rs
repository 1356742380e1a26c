//! Error types for the queue and its store adapter

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced to callers of the state machine, job handles and worker pools.
///
/// A precondition that no longer holds (wrong status, stale run id) is not an
/// error: operations report it as `Ok(false)`, `Ok(None)` or an empty result.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Caller {caller} is not allowed to invoke {method}")]
    Forbidden { caller: String, method: String },

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid repeat schedule: {0}")]
    Schedule(String),

    #[error("Completion callback misuse: {0}")]
    Callback(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

/// Queue result type alias
pub type QueueResult<T> = Result<T, QueueError>;

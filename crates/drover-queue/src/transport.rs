//! Remote call seam between job handles / worker pools and a job server

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::auth::Caller;
use crate::error::QueueResult;
use crate::server::JobServer;

/// Invokes `{root}_{operation}` with positional JSON arguments
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, method: &str, params: Vec<Value>) -> QueueResult<Value>;
}

/// In-process transport dispatching straight into a [`JobServer`]
#[derive(Debug, Clone)]
pub struct LocalTransport {
    server: Arc<JobServer>,
    caller: Caller,
}

impl LocalTransport {
    /// Calls made as `caller` go through the server's permission checks
    pub fn new(server: Arc<JobServer>, caller: Caller) -> Self {
        Self { server, caller }
    }

    /// Trusted transport that bypasses permission checks
    pub fn trusted(server: Arc<JobServer>) -> Self {
        Self::new(server, Caller::Server)
    }

    pub fn server(&self) -> &Arc<JobServer> {
        &self.server
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> QueueResult<Value> {
        self.server.invoke(&self.caller, method, params).await
    }
}


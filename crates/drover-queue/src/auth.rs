//! Permission checks for remotely invoked operations
//!
//! Rules are registered per permission group (`admin`, `manager`,
//! `creator`, `worker`) or per operation name. A call is permitted when no
//! deny rule matches and at least one allow rule does; with no rules at all
//! every remote call is denied.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use crate::error::QueueError;

/// Named operations of the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    StartServer,
    ShutdownServer,
    JobSave,
    JobRemove,
    JobPause,
    JobResume,
    JobReady,
    JobCancel,
    JobRestart,
    JobRerun,
    GetWork,
    GetJob,
    JobLog,
    JobProgress,
    JobDone,
    JobFail,
}

impl Operation {
    pub const ALL: [Operation; 16] = [
        Operation::StartServer,
        Operation::ShutdownServer,
        Operation::JobSave,
        Operation::JobRemove,
        Operation::JobPause,
        Operation::JobResume,
        Operation::JobReady,
        Operation::JobCancel,
        Operation::JobRestart,
        Operation::JobRerun,
        Operation::GetWork,
        Operation::GetJob,
        Operation::JobLog,
        Operation::JobProgress,
        Operation::JobDone,
        Operation::JobFail,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::StartServer => "startServer",
            Operation::ShutdownServer => "shutdownServer",
            Operation::JobSave => "jobSave",
            Operation::JobRemove => "jobRemove",
            Operation::JobPause => "jobPause",
            Operation::JobResume => "jobResume",
            Operation::JobReady => "jobReady",
            Operation::JobCancel => "jobCancel",
            Operation::JobRestart => "jobRestart",
            Operation::JobRerun => "jobRerun",
            Operation::GetWork => "getWork",
            Operation::GetJob => "getJob",
            Operation::JobLog => "jobLog",
            Operation::JobProgress => "jobProgress",
            Operation::JobDone => "jobDone",
            Operation::JobFail => "jobFail",
        }
    }

    /// The non-admin permission group this operation belongs to
    pub fn group(&self) -> PermissionGroup {
        match self {
            Operation::StartServer
            | Operation::ShutdownServer
            | Operation::JobRemove
            | Operation::JobPause
            | Operation::JobResume
            | Operation::JobReady
            | Operation::JobCancel
            | Operation::JobRestart => PermissionGroup::Manager,
            Operation::JobSave | Operation::JobRerun => PermissionGroup::Creator,
            Operation::GetWork
            | Operation::GetJob
            | Operation::JobLog
            | Operation::JobProgress
            | Operation::JobDone
            | Operation::JobFail => PermissionGroup::Worker,
        }
    }

    /// Rule keys consulted for this operation, most specific first
    pub fn permission_keys(&self) -> [&'static str; 3] {
        [
            self.as_str(),
            PermissionGroup::Admin.as_str(),
            self.group().as_str(),
        ]
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| QueueError::UnknownMethod(s.to_string()))
    }
}

/// Permission groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionGroup {
    Admin,
    Manager,
    Creator,
    Worker,
}

impl PermissionGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionGroup::Admin => "admin",
            PermissionGroup::Manager => "manager",
            PermissionGroup::Creator => "creator",
            PermissionGroup::Worker => "worker",
        }
    }
}

/// Who is invoking an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Caller {
    /// Trusted in-process code; never checked
    Server,
    /// A remote caller identified by id
    User(String),
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Self::User(id.into())
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Caller::Server => f.write_str("<server>"),
            Caller::User(id) => f.write_str(id),
        }
    }
}

/// What a rule gets to look at
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub caller: &'a str,
    pub operation: Operation,
    pub params: &'a [Value],
}

type RulePredicate = Arc<dyn Fn(&CallContext<'_>) -> bool + Send + Sync>;

/// An allow or deny rule
#[derive(Clone)]
pub enum Rule {
    Predicate(RulePredicate),
    AllowList(HashSet<String>),
}

impl Rule {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&CallContext<'_>) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn users<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AllowList(ids.into_iter().map(Into::into).collect())
    }

    pub fn evaluate(&self, ctx: &CallContext<'_>) -> bool {
        match self {
            Rule::Predicate(f) => f(ctx),
            Rule::AllowList(ids) => ids.contains(ctx.caller),
        }
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Predicate(_) => f.write_str("Rule::Predicate(..)"),
            Rule::AllowList(ids) => f.debug_tuple("Rule::AllowList").field(ids).finish(),
        }
    }
}

#[derive(Debug, Default)]
struct RuleTable {
    rules: HashMap<String, Vec<Rule>>,
}

impl RuleTable {
    fn any_match(&self, ctx: &CallContext<'_>) -> bool {
        ctx.operation
            .permission_keys()
            .iter()
            .filter_map(|key| self.rules.get(*key))
            .flatten()
            .any(|rule| rule.evaluate(ctx))
    }
}

/// Allow/deny tables owned by one job server
#[derive(Debug, Default)]
pub struct Authorizer {
    allow: RwLock<RuleTable>,
    deny: RwLock<RuleTable>,
}

impl Authorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an allow rule for a group or operation name
    pub fn allow(&self, key: &str, rule: Rule) {
        let mut table = self.allow.write().unwrap_or_else(|e| e.into_inner());
        table.rules.entry(key.to_string()).or_default().push(rule);
    }

    /// Register a deny rule for a group or operation name
    pub fn deny(&self, key: &str, rule: Rule) {
        let mut table = self.deny.write().unwrap_or_else(|e| e.into_inner());
        table.rules.entry(key.to_string()).or_default().push(rule);
    }

    pub fn allow_group(&self, group: PermissionGroup, rule: Rule) {
        self.allow(group.as_str(), rule);
    }

    pub fn deny_group(&self, group: PermissionGroup, rule: Rule) {
        self.deny(group.as_str(), rule);
    }

    /// `not denied AND allowed`
    pub fn allowed(&self, caller: &str, operation: Operation, params: &[Value]) -> bool {
        let ctx = CallContext {
            caller,
            operation,
            params,
        };
        let denied = self
            .deny
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .any_match(&ctx);
        if denied {
            return false;
        }
        self.allow
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .any_match(&ctx)
    }

    /// Fails with [`QueueError::Forbidden`] unless the caller may invoke `operation`
    pub fn check(
        &self,
        caller: &Caller,
        operation: Operation,
        params: &[Value],
    ) -> Result<(), QueueError> {
        match caller {
            Caller::Server => Ok(()),
            Caller::User(id) if self.allowed(id, operation, params) => Ok(()),
            Caller::User(id) => Err(QueueError::Forbidden {
                caller: id.clone(),
                method: operation.as_str().to_string(),
            }),
        }
    }
}

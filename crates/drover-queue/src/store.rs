//! Job Store Trait
//!
//! The state machine only needs four primitives from persistence:
//! conditional find, conditional multi-document update returning the
//! affected count, insert and delete. `update` doubles as the
//! compare-and-swap the claim protocol relies on, so implementations must
//! evaluate the query and apply the mutation atomically per document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;

use crate::error::StoreError;
use crate::job::{JobDoc, JobId, JobStatus, RunId};

/// Constraint on a document's `runId`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunIdFilter {
    #[default]
    Any,
    Absent,
    Equals(RunId),
}

/// Conjunction of optional predicates over job documents
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub ids: Option<Vec<JobId>>,
    pub statuses: Option<Vec<JobStatus>>,
    pub types: Option<Vec<String>>,
    pub run_id: RunIdFilter,
    /// Matches documents whose `depends` contains any of these ids
    pub depends_on_any: Option<Vec<JobId>>,
    pub depends_empty: bool,
    /// `after <= t`
    pub due_by: Option<DateTime<Utc>>,
    /// `expiresAfter < t`
    pub expired_before: Option<DateTime<Utc>>,
    pub repeats: Option<u64>,
}

impl JobQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(id: JobId) -> Self {
        Self::new().with_ids(vec![id])
    }

    pub fn with_ids(mut self, ids: Vec<JobId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    pub fn with_statuses(mut self, statuses: &[JobStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn with_types(mut self, types: Vec<String>) -> Self {
        self.types = Some(types);
        self
    }

    pub fn with_run_id(mut self, run_id: RunIdFilter) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn depending_on(mut self, ids: Vec<JobId>) -> Self {
        self.depends_on_any = Some(ids);
        self
    }

    pub fn without_depends(mut self) -> Self {
        self.depends_empty = true;
        self
    }

    pub fn due_by(mut self, time: DateTime<Utc>) -> Self {
        self.due_by = Some(time);
        self
    }

    pub fn expired_before(mut self, time: DateTime<Utc>) -> Self {
        self.expired_before = Some(time);
        self
    }

    pub fn with_repeats(mut self, repeats: u64) -> Self {
        self.repeats = Some(repeats);
        self
    }

    /// Filter semantics shared by every store implementation
    pub fn matches(&self, doc: &JobDoc) -> bool {
        if let Some(ids) = &self.ids {
            match doc.id {
                Some(id) if ids.contains(&id) => {}
                _ => return false,
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&doc.status) {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.iter().any(|t| *t == doc.job_type) {
                return false;
            }
        }
        match self.run_id {
            RunIdFilter::Any => {}
            RunIdFilter::Absent if doc.run_id.is_some() => return false,
            RunIdFilter::Equals(run_id) if doc.run_id != Some(run_id) => return false,
            _ => {}
        }
        if let Some(ids) = &self.depends_on_any {
            if !doc.depends.iter().any(|d| ids.contains(d)) {
                return false;
            }
        }
        if self.depends_empty && !doc.depends.is_empty() {
            return false;
        }
        if let Some(time) = self.due_by {
            if doc.after > time {
                return false;
            }
        }
        if let Some(time) = self.expired_before {
            match doc.expires_after {
                Some(expiry) if expiry < time => {}
                _ => return false,
            }
        }
        if let Some(repeats) = self.repeats {
            if doc.repeats != repeats {
                return false;
            }
        }
        true
    }
}

/// Result ordering for `find`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrder {
    /// priority, retryUntil, after, created (all ascending)
    Claim,
    /// created ascending
    Created,
}

impl JobOrder {
    pub fn compare(&self, a: &JobDoc, b: &JobDoc) -> Ordering {
        match self {
            JobOrder::Claim => a
                .priority
                .cmp(&b.priority)
                .then(a.retry_until.cmp(&b.retry_until))
                .then(a.after.cmp(&b.after))
                .then(a.created.cmp(&b.created)),
            JobOrder::Created => a.created.cmp(&b.created),
        }
    }

    /// Sort, then truncate to `limit`
    pub fn apply(order: Option<JobOrder>, docs: &mut Vec<JobDoc>, limit: Option<usize>) {
        if let Some(order) = order {
            docs.sort_by(|a, b| order.compare(a, b));
        }
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
    }
}

/// Secondary indexes the state machine benefits from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobIndex {
    /// (type, status) for claims
    TypeStatus,
    /// (priority, retryUntil, after) for claim ordering
    ClaimOrder,
    /// status alone for sweeps
    Status,
}

impl JobIndex {
    pub const ALL: [JobIndex; 3] = [JobIndex::TypeStatus, JobIndex::ClaimOrder, JobIndex::Status];
}

/// In-place document mutation applied by [`JobStore::update`]
pub type Mutation<'a> = &'a (dyn Fn(&mut JobDoc) + Send + Sync);

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Backend name for diagnostics
    fn name(&self) -> &str;

    /// Documents matching `query`, optionally ordered and limited
    async fn find(
        &self,
        query: &JobQuery,
        order: Option<JobOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<JobDoc>, StoreError>;

    /// Apply `mutation` to the first (or, with `multi`, every) document still
    /// matching `query`; returns how many documents were updated
    async fn update(
        &self,
        query: &JobQuery,
        mutation: Mutation<'_>,
        multi: bool,
    ) -> Result<u64, StoreError>;

    /// Insert a new document, assigning its id
    async fn insert(&self, doc: JobDoc) -> Result<JobId, StoreError>;

    /// Delete every matching document; returns how many were removed
    async fn delete(&self, query: &JobQuery) -> Result<u64, StoreError>;

    /// Create a secondary index if the backend supports them
    async fn create_index(&self, _index: JobIndex) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::add_ms;
    use serde_json::json;
    use uuid::Uuid;

    fn saved(job_type: &str) -> JobDoc {
        let mut doc = JobDoc::new(job_type, json!({}));
        doc.id = Some(Uuid::new_v4());
        doc
    }

    #[test]
    fn test_empty_id_set_matches_nothing() {
        let doc = saved("a");
        assert!(JobQuery::new().matches(&doc));
        assert!(!JobQuery::new().with_ids(vec![]).matches(&doc));
        assert!(JobQuery::id(doc.id.unwrap()).matches(&doc));
    }

    #[test]
    fn test_run_id_filter() {
        let mut doc = saved("a");
        let run = Uuid::new_v4();
        assert!(JobQuery::new().with_run_id(RunIdFilter::Absent).matches(&doc));
        doc.run_id = Some(run);
        assert!(!JobQuery::new().with_run_id(RunIdFilter::Absent).matches(&doc));
        assert!(JobQuery::new().with_run_id(RunIdFilter::Equals(run)).matches(&doc));
        assert!(!JobQuery::new()
            .with_run_id(RunIdFilter::Equals(Uuid::new_v4()))
            .matches(&doc));
    }

    #[test]
    fn test_depends_and_time_predicates() {
        let antecedent = Uuid::new_v4();
        let mut doc = saved("a");
        doc.depends = vec![antecedent];
        assert!(JobQuery::new().depending_on(vec![antecedent]).matches(&doc));
        assert!(!JobQuery::new().without_depends().matches(&doc));

        let now = Utc::now();
        doc.after = add_ms(now, 1000);
        assert!(!JobQuery::new().due_by(now).matches(&doc));
        assert!(JobQuery::new().due_by(add_ms(now, 1000)).matches(&doc));

        assert!(!JobQuery::new().expired_before(now).matches(&doc));
        doc.expires_after = Some(now);
        assert!(JobQuery::new().expired_before(add_ms(now, 1)).matches(&doc));
    }

    #[test]
    fn test_claim_order() {
        let mut low = saved("a");
        low.priority = 10;
        let mut high = saved("a");
        high.priority = -10;
        let mut docs = vec![low.clone(), high.clone()];
        JobOrder::apply(Some(JobOrder::Claim), &mut docs, Some(1));
        assert_eq!(docs, vec![high]);
    }
}

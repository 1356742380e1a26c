//! Dependency resolution across the job graph

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::debug;

use crate::error::QueueResult;
use crate::job::{JobDoc, JobId, JobStatus, LogEntry, LogLevel};
use crate::store::{JobQuery, JobStore};

/// Outcome of inspecting a job's antecedents
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepsCheck {
    /// Antecedents already completed
    pub resolved: Vec<JobId>,
    pub failed: Vec<JobId>,
    pub cancelled: Vec<JobId>,
    /// Antecedents that do not exist
    pub removed: Vec<JobId>,
}

impl DepsCheck {
    /// A failed, cancelled or missing antecedent dooms the dependent
    pub fn must_cancel(&self) -> bool {
        !self.failed.is_empty() || !self.cancelled.is_empty() || !self.removed.is_empty()
    }
}

/// Computes antecedent/dependent sets and moves resolved ids between
/// `depends` and `resolved`
pub struct DependencyResolver<'a> {
    store: &'a dyn JobStore,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(store: &'a dyn JobStore) -> Self {
        Self { store }
    }

    /// Inspect `doc`'s antecedents. Unless `dry_run`, completed antecedents
    /// are moved from `depends` to `resolved` right away and missing ones are
    /// noted in the job's log.
    pub async fn check_deps(&self, doc: &JobDoc, dry_run: bool) -> QueueResult<DepsCheck> {
        let mut check = DepsCheck::default();
        if doc.depends.is_empty() {
            return Ok(check);
        }

        let deps = self
            .store
            .find(&JobQuery::new().with_ids(doc.depends.clone()), None, None)
            .await?;

        for id in &doc.depends {
            if !deps.iter().any(|dep| dep.id == Some(*id)) {
                check.removed.push(*id);
            }
        }
        for dep in &deps {
            let Some(dep_id) = dep.id else { continue };
            match dep.status {
                JobStatus::Completed => check.resolved.push(dep_id),
                JobStatus::Failed => check.failed.push(dep_id),
                JobStatus::Cancelled => check.cancelled.push(dep_id),
                _ => {}
            }
        }

        let Some(job_id) = doc.id else {
            return Ok(check);
        };
        if dry_run || (check.resolved.is_empty() && check.removed.is_empty()) {
            return Ok(check);
        }

        let now = Utc::now();
        let resolved = check.resolved.clone();
        let removed = check.removed.clone();
        let mutation = move |doc: &mut JobDoc| {
            doc.depends.retain(|id| !resolved.contains(id));
            for id in &resolved {
                if !doc.resolved.contains(id) {
                    doc.resolved.push(*id);
                }
            }
            for id in &removed {
                doc.push_log(
                    LogEntry::new(now, None, format!("Antecedent job {id} missing at save"))
                        .with_level(LogLevel::Warning),
                );
            }
            doc.updated = now;
        };
        self.store
            .update(&JobQuery::id(job_id), &mutation, false)
            .await?;

        debug!(
            job_id = %job_id,
            resolved = check.resolved.len(),
            missing = check.removed.len(),
            "Checked antecedents"
        );
        Ok(check)
    }

    /// One level of the dependency graph around `ids`: their antecedents
    /// and/or the jobs depending on them, restricted to `statuses`
    pub async fn ids_of_deps(
        &self,
        ids: &[JobId],
        antecedents: bool,
        dependents: bool,
        statuses: &[JobStatus],
    ) -> QueueResult<Vec<JobId>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        if ids.is_empty() {
            return Ok(out);
        }

        if dependents {
            let query = JobQuery::new()
                .depending_on(ids.to_vec())
                .with_statuses(statuses);
            for doc in self.store.find(&query, None, None).await? {
                if let Some(id) = doc.id.filter(|id| seen.insert(*id)) {
                    out.push(id);
                }
            }
        }

        if antecedents {
            let mut ants = Vec::new();
            let parents = self
                .store
                .find(&JobQuery::new().with_ids(ids.to_vec()), None, None)
                .await?;
            for doc in parents {
                for id in doc.depends {
                    if !ants.contains(&id) {
                        ants.push(id);
                    }
                }
            }
            if !ants.is_empty() {
                let query = JobQuery::new().with_ids(ants).with_statuses(statuses);
                for doc in self.store.find(&query, None, None).await? {
                    if let Some(id) = doc.id.filter(|id| seen.insert(*id)) {
                        out.push(id);
                    }
                }
            }
        }

        Ok(out)
    }

    /// Jobs listing `id` among their antecedents, optionally restricted to `statuses`
    pub async fn dependents_of(
        &self,
        id: JobId,
        statuses: Option<&[JobStatus]>,
    ) -> QueueResult<Vec<JobId>> {
        let mut query = JobQuery::new().depending_on(vec![id]);
        if let Some(statuses) = statuses {
            query = query.with_statuses(statuses);
        }
        let docs = self.store.find(&query, None, None).await?;
        Ok(docs.into_iter().filter_map(|doc| doc.id).collect())
    }

    /// Mark `id` as satisfied in every dependent; returns the dependents touched.
    /// With `not_before`, each dependent's `after` is pushed to at least that time.
    pub async fn resolve(
        &self,
        id: JobId,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> QueueResult<Vec<JobId>> {
        let dependents = self.dependents_of(id, None).await?;
        if dependents.is_empty() {
            return Ok(dependents);
        }

        let mutation = move |doc: &mut JobDoc| {
            doc.depends.retain(|dep| *dep != id);
            if !doc.resolved.contains(&id) {
                doc.resolved.push(id);
            }
            if let Some(time) = not_before {
                doc.after = doc.after.max(time);
            }
            doc.push_log(LogEntry::new(now, None, format!("Antecedent job {id} completed")));
            doc.updated = now;
        };
        let query = JobQuery::new()
            .with_ids(dependents.clone())
            .depending_on(vec![id]);
        let count = self.store.update(&query, &mutation, true).await?;

        debug!(job_id = %id, dependents = count, "Resolved dependents");
        Ok(dependents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use serde_json::json;

    async fn insert(store: &MemoryStore, status: JobStatus, depends: Vec<JobId>) -> JobId {
        let mut doc = JobDoc::new("dep", json!({}));
        doc.status = status;
        doc.depends = depends;
        store.insert(doc).await.unwrap()
    }

    #[tokio::test]
    async fn test_check_deps_classifies_antecedents() {
        let store = MemoryStore::new();
        let done = insert(&store, JobStatus::Completed, vec![]).await;
        let failed = insert(&store, JobStatus::Failed, vec![]).await;
        let missing = uuid::Uuid::new_v4();
        let job = insert(&store, JobStatus::Waiting, vec![done, failed, missing]).await;

        let doc = store.find(&JobQuery::id(job), None, None).await.unwrap().remove(0);
        let resolver = DependencyResolver::new(&store);

        let dry = resolver.check_deps(&doc, true).await.unwrap();
        assert_eq!(dry.resolved, vec![done]);
        assert_eq!(dry.failed, vec![failed]);
        assert_eq!(dry.removed, vec![missing]);
        assert!(dry.must_cancel());
        // dry run leaves the document alone
        let unchanged = store.find(&JobQuery::id(job), None, None).await.unwrap().remove(0);
        assert_eq!(unchanged.depends.len(), 3);

        resolver.check_deps(&doc, false).await.unwrap();
        let updated = store.find(&JobQuery::id(job), None, None).await.unwrap().remove(0);
        assert_eq!(updated.depends, vec![failed, missing]);
        assert_eq!(updated.resolved, vec![done]);
    }

    #[tokio::test]
    async fn test_ids_of_deps_filters_by_status() {
        let store = MemoryStore::new();
        let a = insert(&store, JobStatus::Waiting, vec![]).await;
        let b = insert(&store, JobStatus::Waiting, vec![a]).await;
        let c = insert(&store, JobStatus::Completed, vec![a]).await;
        let resolver = DependencyResolver::new(&store);

        let down = resolver
            .ids_of_deps(&[a], false, true, &JobStatus::CANCELLABLE)
            .await
            .unwrap();
        assert_eq!(down, vec![b]);
        assert!(!down.contains(&c));

        let up = resolver
            .ids_of_deps(&[b], true, false, &JobStatus::CANCELLABLE)
            .await
            .unwrap();
        assert_eq!(up, vec![a]);
    }

    #[tokio::test]
    async fn test_resolve_moves_id_and_delays() {
        let store = MemoryStore::new();
        let a = insert(&store, JobStatus::Completed, vec![]).await;
        let b = insert(&store, JobStatus::Waiting, vec![a]).await;
        let resolver = DependencyResolver::new(&store);

        let now = Utc::now();
        let later = crate::job::add_ms(now, 60_000);
        let touched = resolver.resolve(a, now, Some(later)).await.unwrap();
        assert_eq!(touched, vec![b]);

        let doc = store.find(&JobQuery::id(b), None, None).await.unwrap().remove(0);
        assert!(doc.depends.is_empty());
        assert_eq!(doc.resolved, vec![a]);
        assert_eq!(doc.after, later);
    }
}

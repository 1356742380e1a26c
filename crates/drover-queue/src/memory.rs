//! In-memory job store

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{JobDoc, JobId};
use crate::store::{JobOrder, JobQuery, JobStore, Mutation};

/// Job store backed by a map behind a single async lock.
///
/// Every `update` and `delete` holds the write lock for its whole
/// evaluation, which makes each call atomic relative to the others.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobDoc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find(
        &self,
        query: &JobQuery,
        order: Option<JobOrder>,
        limit: Option<usize>,
    ) -> Result<Vec<JobDoc>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut docs: Vec<JobDoc> = jobs
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect();
        drop(jobs);

        JobOrder::apply(Some(order.unwrap_or(JobOrder::Created)), &mut docs, limit);
        Ok(docs)
    }

    async fn update(
        &self,
        query: &JobQuery,
        mutation: Mutation<'_>,
        multi: bool,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut count = 0;

        for doc in jobs.values_mut().filter(|doc| query.matches(doc)) {
            mutation(doc);
            count += 1;
            if !multi {
                break;
            }
        }

        Ok(count)
    }

    async fn insert(&self, mut doc: JobDoc) -> Result<JobId, StoreError> {
        let id = Uuid::new_v4();
        doc.id = Some(id);
        self.jobs.write().await.insert(id, doc);
        Ok(id)
    }

    async fn delete(&self, query: &JobQuery) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, doc| !query.matches(doc));
        Ok((before - jobs.len()) as u64)
    }
}

//! SQLite job store behind the job server

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use drover_persist::{SqliteConfig, SqliteJobStore};
use drover_queue::options::{DoneOptions, GetJobOptions, GetWorkOptions, SaveOptions};
use drover_queue::job::add_ms;
use drover_queue::{
    JobDoc, JobIndex, JobOrder, JobQuery, JobServer, JobStatus, JobStore, RepeatWait,
    RunIdFilter, ServerConfig,
};

async fn store(root: &str) -> SqliteJobStore {
    SqliteJobStore::connect(root, SqliteConfig::memory())
        .await
        .unwrap()
}

async fn server() -> Arc<JobServer> {
    let store: Arc<dyn JobStore> = Arc::new(store("persist").await);
    let mut config = ServerConfig::with_root("persist");
    config.promote_interval_ms = 3_600_000;
    let server = Arc::new(JobServer::new(store, config));
    server.start_server().await.unwrap();
    server
}

#[tokio::test]
async fn test_insert_find_and_filter() {
    let store = store("crud").await;
    assert_eq!(store.name(), "sqlite");
    for index in JobIndex::ALL {
        store.create_index(index).await.unwrap();
    }

    let mut low = JobDoc::new("email", json!({"n": 1}));
    low.priority = 10;
    let mut high = JobDoc::new("email", json!({"n": 2}));
    high.priority = -10;
    let other = JobDoc::new("sms", json!({"n": 3}));

    let low_id = store.insert(low).await.unwrap();
    let high_id = store.insert(high).await.unwrap();
    store.insert(other).await.unwrap();

    let emails = store
        .find(&JobQuery::new().with_types(vec!["email".into()]), None, None)
        .await
        .unwrap();
    assert_eq!(emails.len(), 2);
    assert_eq!(emails[0].id, Some(low_id));

    let claimable = store
        .find(
            &JobQuery::new().with_types(vec!["email".into()]),
            Some(JobOrder::Claim),
            Some(1),
        )
        .await
        .unwrap();
    assert_eq!(claimable[0].id, Some(high_id));
    assert_eq!(claimable[0].data, json!({"n": 2}));

    let none = store
        .find(&JobQuery::new().with_ids(vec![]), None, None)
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_update_is_conditional() {
    let store = store("cas").await;
    let id = store.insert(JobDoc::new("email", json!({}))).await.unwrap();

    let to_ready = |doc: &mut JobDoc| doc.status = JobStatus::Ready;
    let query = JobQuery::id(id).with_status(JobStatus::Waiting);
    assert_eq!(store.update(&query, &to_ready, false).await.unwrap(), 1);
    // the status guard no longer matches
    assert_eq!(store.update(&query, &to_ready, false).await.unwrap(), 0);

    let docs = store.find(&JobQuery::id(id), None, None).await.unwrap();
    assert_eq!(docs[0].status, JobStatus::Ready);
}

#[tokio::test]
async fn test_update_single_and_multi() {
    let store = store("multi").await;
    for _ in 0..3 {
        store.insert(JobDoc::new("email", json!({}))).await.unwrap();
    }
    let bump = |doc: &mut JobDoc| doc.priority += 1;
    let all = JobQuery::new();
    assert_eq!(store.update(&all, &bump, false).await.unwrap(), 1);
    assert_eq!(store.update(&all, &bump, true).await.unwrap(), 3);

    let mut priorities: Vec<i32> = store
        .find(&all, None, None)
        .await
        .unwrap()
        .iter()
        .map(|doc| doc.priority)
        .collect();
    priorities.sort();
    assert_eq!(priorities, vec![1, 1, 2]);
}

#[tokio::test]
async fn test_delete() {
    let store = store("del").await;
    let keep = store.insert(JobDoc::new("email", json!({}))).await.unwrap();
    let gone = store.insert(JobDoc::new("email", json!({}))).await.unwrap();

    assert_eq!(store.delete(&JobQuery::id(gone)).await.unwrap(), 1);
    assert_eq!(store.delete(&JobQuery::id(gone)).await.unwrap(), 0);
    let left = store.find(&JobQuery::new(), None, None).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, Some(keep));
}

#[tokio::test]
async fn test_roots_are_separate_tables() {
    let pool = store("first").await.pool().clone();
    let first = SqliteJobStore::new(pool.clone(), "first").await.unwrap();
    let second = SqliteJobStore::new(pool, "second").await.unwrap();
    first.insert(JobDoc::new("email", json!({}))).await.unwrap();

    assert_eq!(first.find(&JobQuery::new(), None, None).await.unwrap().len(), 1);
    assert!(second.find(&JobQuery::new(), None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_lifecycle_over_sqlite() {
    let server = server().await;
    let parent = server
        .job_save(JobDoc::new("render", json!({})), SaveOptions::default())
        .await
        .unwrap()
        .unwrap();
    let mut child = JobDoc::new("send", json!({}));
    child.depends = vec![parent];
    let child = server
        .job_save(child, SaveOptions::default())
        .await
        .unwrap()
        .unwrap();

    // the dependent is not claimable yet
    let work = server
        .get_work(&["send".to_string()], GetWorkOptions::default())
        .await
        .unwrap();
    assert!(work.is_empty());

    let claimed = server
        .get_work(&["render".to_string()], GetWorkOptions::default())
        .await
        .unwrap()
        .remove(0);
    assert_eq!(claimed.id, Some(parent));
    assert_eq!(claimed.status, JobStatus::Running);
    let run_id = claimed.run_id.unwrap();

    assert!(server.job_progress(parent, run_id, 1, 2).await.unwrap());
    assert!(server
        .job_done(parent, run_id, json!({"pages": 3}), DoneOptions::default())
        .await
        .unwrap());

    let docs = server
        .get_job(vec![parent, child], GetJobOptions::default())
        .await
        .unwrap();
    let parent_doc = docs.iter().find(|d| d.id == Some(parent)).unwrap();
    let child_doc = docs.iter().find(|d| d.id == Some(child)).unwrap();
    assert_eq!(parent_doc.status, JobStatus::Completed);
    assert_eq!(parent_doc.result, Some(json!({"pages": 3})));
    assert!(parent_doc.run_id.is_none());
    assert_eq!(child_doc.status, JobStatus::Ready);
    assert!(child_doc.depends.is_empty());
    assert_eq!(child_doc.resolved, vec![parent]);
}

#[tokio::test]
async fn test_repeating_job_over_sqlite() {
    let server = server().await;
    let mut doc = JobDoc::new("tick", json!({}));
    doc.repeats = 1;
    doc.repeat_wait = RepeatWait::Interval(0);
    let id = server
        .job_save(doc, SaveOptions::default())
        .await
        .unwrap()
        .unwrap();

    let claimed = server
        .get_work(&["tick".to_string()], GetWorkOptions::default())
        .await
        .unwrap()
        .remove(0);
    server
        .job_done(id, claimed.run_id.unwrap(), json!({}), DoneOptions::default())
        .await
        .unwrap();

    let ticks = server
        .store()
        .find(&JobQuery::new().with_types(vec!["tick".into()]), None, None)
        .await
        .unwrap();
    assert_eq!(ticks.len(), 2);
    let next = ticks.iter().find(|d| d.id != Some(id)).unwrap();
    assert_eq!(next.repeats, 0);
    assert_eq!(next.repeated, 1);
    assert_eq!(next.status, JobStatus::Ready);
}

#[tokio::test]
async fn test_cancelled_update_leaves_store_usable() {
    let store = store("cancel").await;
    for _ in 0..50 {
        store.insert(JobDoc::new("email", json!({}))).await.unwrap();
    }
    let pause = |doc: &mut JobDoc| doc.status = JobStatus::Paused;
    let bump = |doc: &mut JobDoc| doc.priority += 1;

    // drop the write transaction at different points
    for micros in [0, 10, 50, 200, 1_000] {
        let _ = tokio::time::timeout(
            Duration::from_micros(micros),
            store.update(&JobQuery::new(), &pause, true),
        )
        .await;
        assert_eq!(store.update(&JobQuery::new(), &bump, true).await.unwrap(), 50);
    }

    let docs = store.find(&JobQuery::new(), None, None).await.unwrap();
    assert_eq!(docs.len(), 50);
    assert!(docs.iter().all(|doc| doc.priority == 5));
}

#[tokio::test]
async fn test_filters_run_in_sql() {
    let store = store("filters").await;
    let now = Utc::now();

    let mut due = JobDoc::new("email", json!({}));
    due.after = now;
    let mut later = JobDoc::new("email", json!({}));
    later.after = add_ms(now, 60_000);
    let mut expired = JobDoc::new("email", json!({}));
    let run_id = Uuid::new_v4();
    expired.status = JobStatus::Running;
    expired.run_id = Some(run_id);
    expired.after = add_ms(now, 60_000);
    expired.expires_after = Some(now);

    let due = store.insert(due).await.unwrap();
    store.insert(later).await.unwrap();
    let expired = store.insert(expired).await.unwrap();

    let mut dependent = JobDoc::new("email", json!({}));
    dependent.depends = vec![due];
    dependent.after = add_ms(now, 60_000);
    let dependent = store.insert(dependent).await.unwrap();

    let ids = |docs: Vec<JobDoc>| docs.into_iter().filter_map(|d| d.id).collect::<Vec<_>>();
    let found = store
        .find(&JobQuery::new().due_by(now), None, None)
        .await
        .unwrap();
    assert_eq!(ids(found), vec![due]);

    let found = store
        .find(&JobQuery::new().expired_before(add_ms(now, 1)), None, None)
        .await
        .unwrap();
    assert_eq!(ids(found), vec![expired]);

    let found = store
        .find(
            &JobQuery::new().with_run_id(RunIdFilter::Equals(run_id)),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(ids(found), vec![expired]);
    let unclaimed = store
        .find(&JobQuery::new().with_run_id(RunIdFilter::Absent), None, None)
        .await
        .unwrap();
    assert_eq!(unclaimed.len(), 3);

    let found = store
        .find(&JobQuery::new().depending_on(vec![due]), None, None)
        .await
        .unwrap();
    assert_eq!(ids(found), vec![dependent]);
    let independent = store
        .find(&JobQuery::new().without_depends(), None, None)
        .await
        .unwrap();
    assert_eq!(independent.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = SqliteConfig {
        url: format!("sqlite:{}?mode=rwc", dir.path().join("queue.db").display()),
        max_connections: 6,
        ..SqliteConfig::default()
    };
    let store: Arc<dyn JobStore> =
        Arc::new(SqliteJobStore::connect("shared", config).await.unwrap());
    let mut server_config = ServerConfig::with_root("shared");
    server_config.promote_interval_ms = 3_600_000;
    let server = Arc::new(JobServer::new(store, server_config));
    server.start_server().await.unwrap();

    const JOBS: usize = 40;
    for n in 0..JOBS {
        server
            .job_save(JobDoc::new("crunch", json!({ "n": n })), SaveOptions::default())
            .await
            .unwrap();
    }

    let claim = |server: Arc<JobServer>| async move {
        let mut mine = Vec::new();
        loop {
            let batch = server
                .get_work(
                    &["crunch".to_string()],
                    GetWorkOptions {
                        max_jobs: 3,
                        work_timeout: None,
                    },
                )
                .await
                .unwrap();
            if batch.is_empty() {
                return mine;
            }
            mine.extend(batch);
        }
    };

    let workers: Vec<_> = (0..6)
        .map(|_| tokio::spawn(claim(Arc::clone(&server))))
        .collect();
    let mut claimed = Vec::new();
    for worker in workers {
        claimed.extend(worker.await.unwrap());
    }
    // a worker may give up after losing every claim round
    claimed.extend(claim(Arc::clone(&server)).await);

    let mut seen = HashSet::new();
    for doc in &claimed {
        assert!(seen.insert(doc.id.unwrap()), "job claimed twice");
        assert_eq!(doc.status, JobStatus::Running);
    }
    assert_eq!(claimed.len(), JOBS);

    // every claimed document carries its claimant's run id in the database
    let running = server
        .store()
        .find(&JobQuery::new().with_status(JobStatus::Running), None, None)
        .await
        .unwrap();
    assert_eq!(running.len(), JOBS);
    for doc in &claimed {
        let stored = running.iter().find(|d| d.id == doc.id).unwrap();
        assert_eq!(stored.run_id, doc.run_id);
    }
}

//! Job handles talking to an in-process job server

use std::sync::Arc;

use serde_json::json;

use drover_queue::options::{
    CancelOptions, DoneOptions, FailOptions, GetJobOptions, GetWorkOptions, LogOptions, RerunOptions,
    RestartOptions, SaveOptions,
};
use drover_queue::{
    Backoff, Job, JobServer, JobStatus, JobStore, LocalTransport, LogLevel, MemoryStore,
    Priority, QueueError, RepeatOptions, RetryOptions, ServerConfig, Transport,
};

async fn setup() -> (Arc<JobServer>, Arc<dyn Transport>) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let mut config = ServerConfig::with_root("mail");
    config.promote_interval_ms = 3_600_000;
    let server = Arc::new(JobServer::new(store, config));
    server.start_server().await.unwrap();
    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::trusted(Arc::clone(&server)));
    (server, transport)
}

async fn claim(transport: &Arc<dyn Transport>, job_type: &str) -> Job {
    let value = transport
        .call(
            "mail_getWork",
            vec![json!([job_type]), serde_json::to_value(GetWorkOptions::default()).unwrap()],
        )
        .await
        .unwrap();
    let mut docs: Vec<drover_queue::JobDoc> = serde_json::from_value(value).unwrap();
    Job::from_doc(Arc::clone(transport), "mail", docs.remove(0))
}

#[tokio::test]
async fn test_save_and_refresh() {
    let (_server, transport) = setup().await;
    let mut job = Job::new(Arc::clone(&transport), "mail", "send", json!({"to": "a@b.c"}));
    job.priority(Priority::CRITICAL)
        .retry(RetryOptions::new(2).wait(1_000).backoff(Backoff::Exponential));
    job.log("prepared offline", LogOptions::default()).await.unwrap();

    let id = job.save(SaveOptions::default()).await.unwrap().unwrap();
    assert_eq!(job.id(), Some(id));

    let opts = GetJobOptions {
        get_log: true,
        get_failures: false,
    };
    assert!(job.refresh(opts).await.unwrap());
    assert_eq!(job.status(), JobStatus::Ready);
    assert_eq!(job.doc().priority, -15);
    assert_eq!(job.doc().retries, 3);
    assert_eq!(job.doc().log[0].message, "prepared offline");

    let fetched = Job::get(Arc::clone(&transport), "mail", id, GetJobOptions::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.data(), &json!({"to": "a@b.c"}));
}

#[tokio::test]
async fn test_worker_round_trip() {
    let (_server, transport) = setup().await;
    let mut job = Job::new(Arc::clone(&transport), "mail", "send", json!({}));
    let id = job.save(SaveOptions::default()).await.unwrap().unwrap();

    let mut claimed = claim(&transport, "send").await;
    assert_eq!(claimed.id(), Some(id));
    assert!(claimed.progress(1, 2).await.unwrap());
    let log = LogOptions {
        level: LogLevel::Success,
        ..Default::default()
    };
    assert!(claimed.log("half way", log).await.unwrap());
    assert!(claimed.done(json!(42)).await.unwrap());

    job.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(job.status(), JobStatus::Completed);
    assert_eq!(job.doc().result, Some(json!({"value": 42})));
    assert_eq!(job.doc().progress.percent, 100.0);

    // a second report for the same run changes nothing
    assert!(!claimed.done(json!(43)).await.unwrap());

    let rerun = job.rerun(RerunOptions::default()).await.unwrap();
    assert!(rerun.is_some());
    assert!(job.remove().await.unwrap());
}

#[tokio::test]
async fn test_depends_chain_through_handles() {
    let (_server, transport) = setup().await;
    let mut parent = Job::new(Arc::clone(&transport), "mail", "render", json!({}));
    parent.save(SaveOptions::default()).await.unwrap();

    let mut child = Job::new(Arc::clone(&transport), "mail", "send", json!({}));
    child.depends(&[&parent]).unwrap();
    child.save(SaveOptions::default()).await.unwrap();

    let claimed = claim(&transport, "render").await;
    claimed
        .fail(json!({"message": "template missing"}), FailOptions { fatal: true })
        .await
        .unwrap();

    child.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(child.status(), JobStatus::Cancelled);

    // restarting the child brings its antecedent back too
    assert!(child.restart(RestartOptions::default()).await.unwrap());
    parent.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(parent.status(), JobStatus::Ready);
    child.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(child.status(), JobStatus::Waiting);

    assert!(parent.cancel(CancelOptions::default()).await.unwrap());
    child.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(child.status(), JobStatus::Cancelled);
}

#[tokio::test]
async fn test_paused_before_save() {
    let (_server, transport) = setup().await;
    let mut job = Job::new(Arc::clone(&transport), "mail", "send", json!({}));
    job.repeat(RepeatOptions::new(3).every(10_000)).unwrap();
    job.pause().await.unwrap();
    job.save(SaveOptions::default()).await.unwrap();

    job.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(job.status(), JobStatus::Paused);
    assert_eq!(job.doc().repeats, 3);

    assert!(job.resume().await.unwrap());
    job.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(job.status(), JobStatus::Ready);
}

#[tokio::test]
async fn test_actions_need_a_saved_job() {
    let (_server, transport) = setup().await;
    let mut job = Job::new(transport, "mail", "send", json!({}));
    assert!(matches!(job.remove().await, Err(QueueError::Validation(_))));
    assert!(matches!(
        job.refresh(GetJobOptions::default()).await,
        Err(QueueError::Validation(_))
    ));
    assert!(matches!(
        job.fail(json!("x"), FailOptions::default()).await,
        Err(QueueError::Validation(_))
    ));
}

#[tokio::test]
async fn test_done_with_delays_dependents() {
    let (_server, transport) = setup().await;
    let mut parent = Job::new(Arc::clone(&transport), "mail", "render", json!({}));
    parent.save(SaveOptions::default()).await.unwrap();
    let mut child = Job::new(Arc::clone(&transport), "mail", "send", json!({}));
    child.depends(&[&parent]).unwrap();
    child.save(SaveOptions::default()).await.unwrap();

    let claimed = claim(&transport, "render").await;
    let options = DoneOptions {
        delay_deps: Some(60_000),
    };
    assert!(claimed.done_with(json!({}), options).await.unwrap());

    // resolved, but not due for another minute
    child.refresh(GetJobOptions::default()).await.unwrap();
    assert_eq!(child.status(), JobStatus::Waiting);
    assert!(child.doc().depends.is_empty());
    assert!(child.doc().after > chrono::Utc::now() + chrono::TimeDelta::seconds(50));
}

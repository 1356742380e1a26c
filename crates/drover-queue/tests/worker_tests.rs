//! Integration tests for the drover-queue worker pool

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use drover_queue::options::SaveOptions;
use drover_queue::worker::WORKER_SHUTDOWN_MESSAGE;
use drover_queue::{
    Completion, JobDoc, JobQuery, JobServer, JobStatus, JobStore, LocalTransport, MemoryStore,
    QueueError, ServerConfig, ShutdownLevel, ShutdownOptions, Transport, Work, WorkerConfig,
    WorkerPool,
};

type Held = Arc<Mutex<Vec<(Work, Completion)>>>;

async fn setup(jobs: usize) -> (Arc<JobServer>, Arc<dyn Transport>) {
    let store: Arc<dyn JobStore> = Arc::new(MemoryStore::new());
    let mut config = ServerConfig::with_root("work");
    config.promote_interval_ms = 3_600_000;
    let server = Arc::new(JobServer::new(store, config));
    server.start_server().await.unwrap();
    for n in 0..jobs {
        server
            .job_save(JobDoc::new("crunch", json!({ "n": n })), SaveOptions::default())
            .await
            .unwrap();
    }
    let transport: Arc<dyn Transport> = Arc::new(LocalTransport::trusted(Arc::clone(&server)));
    (server, transport)
}

/// Pool whose work function parks every invocation in `held`
fn holding_pool(transport: Arc<dyn Transport>, config: WorkerConfig) -> (WorkerPool, Held) {
    let held: Held = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&held);
    let pool = WorkerPool::start(
        transport,
        "work",
        vec!["crunch".to_string()],
        config,
        move |work, completion| sink.lock().unwrap().push((work, completion)),
    )
    .unwrap();
    (pool, held)
}

fn manual(concurrency: usize, payload: usize, prefetch: usize) -> WorkerConfig {
    WorkerConfig {
        concurrency,
        payload,
        prefetch,
        poll_interval_ms: None,
        ..Default::default()
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn count(server: &JobServer, status: JobStatus) -> usize {
    server
        .store()
        .find(&JobQuery::new().with_status(status), None, None)
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_worker_config_defaults() {
    let config = WorkerConfig::default();
    assert_eq!(config.concurrency, 1);
    assert_eq!(config.payload, 1);
    assert_eq!(config.prefetch, 0);
    assert_eq!(config.poll_interval_ms, Some(5_000));
    assert!(!config.callback_strict);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (_server, transport) = setup(0).await;
    let result = WorkerPool::start(
        transport,
        "work",
        vec!["crunch".to_string()],
        manual(0, 1, 0),
        |_, completion| completion.complete(),
    );
    assert!(matches!(result, Err(QueueError::Validation(_))));
}

#[tokio::test]
async fn test_claim_sizing_and_soft_drain() {
    let (server, transport) = setup(10).await;
    let (pool, held) = holding_pool(transport, manual(2, 3, 0));

    wait_for(|| pool.running() == 2).await;
    {
        let held = held.lock().unwrap();
        let in_flight: usize = held.iter().map(|(work, _)| work.len()).sum();
        assert_eq!(in_flight, 6);
        assert!(held.iter().all(|(work, _)| matches!(work, Work::Batch(jobs) if jobs.len() == 3)));
    }
    assert_eq!(pool.length(), 0);
    assert!(pool.full());
    assert_eq!(count(&server, JobStatus::Running).await, 6);

    for _ in 0..500 {
        let batch: Vec<(Work, Completion)> = held.lock().unwrap().drain(..).collect();
        for (work, completion) in batch {
            for job in work.jobs() {
                assert!(job.done(json!({"ok": true})).await.unwrap());
            }
            completion.complete();
        }
        if count(&server, JobStatus::Completed).await == 10 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(count(&server, JobStatus::Completed).await, 10);

    let fired = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let counter = Arc::clone(&fired);
    pool.shutdown_then(ShutdownOptions::level(ShutdownLevel::Soft), move || {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(());
    });
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(pool.running(), 0);
    assert!(pool.idle());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_single_payload_gets_single_work() {
    let (server, transport) = setup(1).await;
    let (pool, held) = holding_pool(transport, manual(1, 1, 0));

    wait_for(|| pool.running() == 1).await;
    let (work, completion) = held.lock().unwrap().pop().unwrap();
    let Work::Single(job) = work else {
        panic!("payload 1 should hand out a single job");
    };
    assert_eq!(job.status(), JobStatus::Running);
    assert!(job.run_id().is_some());
    job.done(json!({})).await.unwrap();
    completion.complete();

    wait_for(|| pool.running() == 0).await;
    assert_eq!(count(&server, JobStatus::Completed).await, 1);
    pool.shutdown(ShutdownOptions::default()).await;
}

#[tokio::test]
async fn test_hard_shutdown_fails_queued_and_in_flight() {
    let (server, transport) = setup(3).await;
    let (pool, held) = holding_pool(transport, manual(1, 1, 2));

    wait_for(|| pool.running() == 1 && pool.length() == 2).await;
    pool.shutdown(ShutdownOptions::level(ShutdownLevel::Hard)).await;

    let failed = server
        .store()
        .find(&JobQuery::new().with_status(JobStatus::Failed), None, None)
        .await
        .unwrap();
    assert_eq!(failed.len(), 3);
    assert!(failed
        .iter()
        .all(|doc| doc.failures[0]["value"] == WORKER_SHUTDOWN_MESSAGE));

    // the parked invocation may still finish afterwards
    let (_, completion) = held.lock().unwrap().pop().unwrap();
    completion.complete();
}

#[tokio::test]
async fn test_normal_shutdown_waits_for_in_flight() {
    let (server, transport) = setup(2).await;
    let (pool, held) = holding_pool(transport, manual(1, 1, 1));
    wait_for(|| pool.running() == 1 && pool.length() == 1).await;

    let stopping = pool.clone();
    let shutdown = tokio::spawn(async move {
        stopping.shutdown(ShutdownOptions::default()).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());

    let (work, completion) = held.lock().unwrap().pop().unwrap();
    for job in work.jobs() {
        job.done(json!({})).await.unwrap();
    }
    completion.complete();
    tokio::time::timeout(Duration::from_secs(5), shutdown)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(count(&server, JobStatus::Completed).await, 1);
    assert_eq!(count(&server, JobStatus::Failed).await, 1);
}

#[tokio::test]
async fn test_completion_misuse_is_reported() {
    let (_server, transport) = setup(2).await;
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));

    let pool = WorkerPool::start(
        transport,
        "work",
        vec!["crunch".to_string()],
        WorkerConfig {
            poll_interval_ms: Some(20),
            ..Default::default()
        },
        |work, completion| {
            let first = work.jobs()[0].data()["n"] == 0;
            if first {
                completion.complete();
                completion.complete();
            }
            // the second job's completion is dropped unused
        },
    )
    .unwrap();
    let sink = Arc::clone(&errors);
    pool.on_error(move |err: &QueueError| {
        assert!(matches!(err, QueueError::Callback(_)));
        sink.lock().unwrap().push(err.to_string());
    });

    wait_for(|| errors.lock().unwrap().len() >= 2).await;
    wait_for(|| pool.running() == 0).await;
    let errors = errors.lock().unwrap().clone();
    assert!(errors.iter().any(|e| e.contains("more than once")));
    assert!(errors.iter().any(|e| e.contains("dropped without being invoked")));
    pool.shutdown(ShutdownOptions { level: ShutdownLevel::Hard, quiet: true }).await;
}

#[tokio::test]
async fn test_panicking_work_function_frees_slot() {
    let (_server, transport) = setup(1).await;
    let reported = Arc::new(AtomicUsize::new(0));

    let pool = WorkerPool::start(
        transport,
        "work",
        vec!["crunch".to_string()],
        WorkerConfig {
            poll_interval_ms: Some(20),
            ..Default::default()
        },
        |_, _| panic!("work function bug"),
    )
    .unwrap();
    let counter = Arc::clone(&reported);
    pool.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    wait_for(|| reported.load(Ordering::SeqCst) >= 1).await;
    wait_for(|| pool.running() == 0).await;
    pool.shutdown(ShutdownOptions { level: ShutdownLevel::Hard, quiet: true }).await;
}

#[tokio::test]
async fn test_paused_pool_claims_nothing() {
    let (server, transport) = setup(2).await;
    let (pool, _held) = holding_pool(
        transport,
        WorkerConfig {
            poll_interval_ms: Some(20),
            ..Default::default()
        },
    );
    pool.pause();
    // a claim may already be in flight from the first tick
    tokio::time::sleep(Duration::from_millis(50)).await;
    let running_before = count(&server, JobStatus::Running).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    pool.trigger();
    assert_eq!(count(&server, JobStatus::Running).await, running_before);
    assert!(pool.is_paused());

    pool.resume();
    wait_for(|| pool.running() == 1).await;
    pool.shutdown(ShutdownOptions { level: ShutdownLevel::Hard, quiet: true }).await;
}

//! Integration tests for kvq.
//!
//! These tests drive the queue end to end through the `JobBackend` surface.

use chrono::Utc;
use kvq_core::config::{QueueSettings, StoreConfig};
use kvq_core::jobs::{Job, JobBackend, JobState, KvJobBackend, NewJob};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MAX_RUN_TIME: Duration = Duration::from_secs(60);

// ============================================================================
// Test Utilities
// ============================================================================

fn create_backend() -> KvJobBackend {
    KvJobBackend::in_memory(QueueSettings::default()).unwrap()
}

async fn enqueue_many(backend: &KvJobBackend, count: usize) -> Vec<Job> {
    let mut jobs = Vec::with_capacity(count);
    for i in 0..count {
        jobs.push(backend.create(NewJob::new(format!("job-{}", i))).await.unwrap());
    }
    jobs
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_create_claim_destroy_lifecycle() {
    let backend = create_backend();
    backend.create(NewJob::new("keep")).await.unwrap();
    let created = backend
        .create(NewJob::new("send-mail").run_at(Utc::now() - chrono::Duration::seconds(30)))
        .await
        .unwrap();
    assert_eq!(backend.count().await.unwrap(), 2);

    let found = backend.find_available("w1", 1, MAX_RUN_TIME).await.unwrap();
    assert_eq!(found, vec![created.clone()]);

    let mut first = found[0].clone();
    let mut second = found[0].clone();
    assert!(backend.lock_exclusively(&mut first, "w1").await.unwrap());
    assert!(!backend.lock_exclusively(&mut second, "w2").await.unwrap());

    assert_eq!(first.state(), JobState::Locked);
    assert_eq!(backend.worker_locks("w1").await.unwrap(), vec![first.clone()]);

    backend.destroy(&first).await.unwrap();
    assert_eq!(backend.count().await.unwrap(), 1);
    assert!(backend.worker_locks("w1").await.unwrap().is_empty());

    // Destroying again is harmless.
    backend.destroy(&first).await.unwrap();
}

#[tokio::test]
async fn test_release_returns_job_to_queue() {
    let backend = create_backend();
    backend.create(NewJob::new("retry-me")).await.unwrap();

    let mut job = backend.reserve("w1", MAX_RUN_TIME).await.unwrap().unwrap();
    job.attempts += 1;
    job.last_error = Some("timeout".into());
    backend.release(&mut job).await.unwrap();

    assert_eq!(job.state(), JobState::Pending);
    let again = backend.reserve("w2", MAX_RUN_TIME).await.unwrap().unwrap();
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempts, 1);
    assert_eq!(again.last_error.as_deref(), Some("timeout"));
    assert_eq!(again.locked_by.as_deref(), Some("w2"));
}

#[tokio::test]
async fn test_create_from_attributes() {
    let backend = create_backend();
    let attributes = json!({
        "handler": "ReportJob",
        "queue": "reports",
        "priority": 3,
        "run_at": "2020-01-01T00:00:00Z"
    });
    let job = backend
        .create(NewJob::from_attributes(attributes.as_object().unwrap()).unwrap())
        .await
        .unwrap();

    assert_eq!(job.queue, "reports");
    assert_eq!(job.priority, 3);
    assert_eq!(job.run_at.timestamp(), 1_577_836_800);

    let reloaded = backend.reload(&job).await.unwrap();
    assert_eq!(reloaded.payload, "ReportJob");
}

// ============================================================================
// Worker Loop
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_workers_process_each_job_once() {
    let backend = create_backend();
    let jobs = enqueue_many(&backend, 20).await;
    let processed = Arc::new(Mutex::new(Vec::new()));

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let backend = backend.clone();
            let processed = processed.clone();
            tokio::spawn(async move {
                let worker = format!("worker-{}", n);
                while let Some(job) = backend.reserve(&worker, MAX_RUN_TIME).await.unwrap() {
                    processed.lock().await.push(job.id.clone());
                    backend.destroy(&job).await.unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    let processed = processed.lock().await;
    let unique: HashSet<_> = processed.iter().cloned().collect();
    assert_eq!(processed.len(), jobs.len());
    assert_eq!(unique.len(), jobs.len());
    assert_eq!(backend.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_crashed_worker_jobs_picked_up_after_restart() {
    let backend = create_backend();
    enqueue_many(&backend, 3).await;

    for _ in 0..2 {
        backend.reserve("host-1:100", MAX_RUN_TIME).await.unwrap().unwrap();
    }
    assert_eq!(backend.find_available("host-2:7", 5, MAX_RUN_TIME).await.unwrap().len(), 1);

    assert_eq!(backend.clear_locks("host-1:100").await.unwrap(), 2);
    assert_eq!(backend.find_available("host-2:7", 5, MAX_RUN_TIME).await.unwrap().len(), 3);
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_connect_with_default_store_config() {
    let backend = KvJobBackend::connect(&StoreConfig::default(), QueueSettings::default())
        .await
        .unwrap();
    assert_eq!(backend.store().name(), "memory");

    backend.create(NewJob::new("x")).await.unwrap();
    assert_eq!(backend.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_namespaces_share_a_store() {
    let primary = create_backend();
    let secondary = KvJobBackend::new(
        primary.store().clone(),
        QueueSettings {
            namespace: "other".into(),
            ..Default::default()
        },
    )
    .unwrap();

    primary.create(NewJob::new("a")).await.unwrap();
    secondary.create(NewJob::new("b")).await.unwrap();
    secondary.create(NewJob::new("c")).await.unwrap();

    assert_eq!(primary.count().await.unwrap(), 1);
    assert_eq!(secondary.delete_all().await.unwrap(), 2);
    assert_eq!(primary.count().await.unwrap(), 1);
    assert_eq!(
        primary.find_available("w", 5, MAX_RUN_TIME).await.unwrap()[0].payload,
        "a"
    );
}

// ============================================================================
// Admin
// ============================================================================

#[tokio::test]
async fn test_delete_all_includes_locks() {
    let backend = create_backend();
    enqueue_many(&backend, 4).await;
    backend.reserve("w1", MAX_RUN_TIME).await.unwrap().unwrap();

    assert_eq!(backend.count().await.unwrap(), 4);
    assert_eq!(backend.delete_all().await.unwrap(), 4);
    assert_eq!(backend.count().await.unwrap(), 0);
    assert!(backend.worker_locks("w1").await.unwrap().is_empty());
}

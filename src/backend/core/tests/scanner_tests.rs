//! Availability scanner tests.
//!
//! Covers:
//! - Due-window filtering
//! - run_at / priority / id ordering
//! - Priority bounds
//! - Multi-queue scans and escaping
//! - Read-ahead window

use chrono::{DateTime, TimeZone, Utc};
use kvq_core::config::QueueSettings;
use kvq_core::jobs::{AvailabilityScanner, Job, JobBackend, KvJobBackend, NewJob};
use std::time::Duration;

const MAX_RUN_TIME: Duration = Duration::from_secs(60);

// ============================================================================
// Test Utilities
// ============================================================================

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn backend(settings: QueueSettings) -> KvJobBackend {
    KvJobBackend::in_memory(settings).unwrap()
}

async fn scan(backend: &KvJobBackend, limit: usize, now: i64) -> Vec<Job> {
    backend
        .scanner()
        .find_available_at("scanner", limit, MAX_RUN_TIME, at(now))
        .await
        .unwrap()
}

fn payloads(jobs: &[Job]) -> Vec<&str> {
    jobs.iter().map(|j| j.payload.as_str()).collect()
}

// ============================================================================
// Due Window
// ============================================================================

#[tokio::test]
async fn test_future_job_is_not_found() {
    let backend = backend(QueueSettings::default());
    backend
        .create(NewJob::new("future").queue("q").run_at(at(2_000)))
        .await
        .unwrap();
    backend
        .create(NewJob::new("due").queue("q").run_at(at(1_000)))
        .await
        .unwrap();

    let backend = KvJobBackend::new(
        backend.store().clone(),
        QueueSettings {
            queues: vec!["q".into()],
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(payloads(&scan(&backend, 10, 1_500).await), vec!["due"]);
    assert_eq!(payloads(&scan(&backend, 10, 2_000).await), vec!["due", "future"]);
}

#[tokio::test]
async fn test_run_at_equal_to_now_is_due() {
    let backend = backend(QueueSettings::default());
    backend.create(NewJob::new("edge").run_at(at(500))).await.unwrap();

    assert!(scan(&backend, 1, 499).await.is_empty());
    assert_eq!(payloads(&scan(&backend, 1, 500).await), vec!["edge"]);
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_earlier_run_at_first_then_lower_priority() {
    let backend = backend(QueueSettings::default());
    backend.create(NewJob::new("late-urgent").run_at(at(30)).priority(-100)).await.unwrap();
    backend.create(NewJob::new("early-low").run_at(at(10)).priority(7)).await.unwrap();
    backend.create(NewJob::new("early-high").run_at(at(10)).priority(-7)).await.unwrap();
    backend.create(NewJob::new("negative").run_at(at(-10)).priority(0)).await.unwrap();

    assert_eq!(
        payloads(&scan(&backend, 10, 100).await),
        vec!["negative", "early-high", "early-low", "late-urgent"]
    );
}

#[tokio::test]
async fn test_limit_truncates_in_order() {
    let backend = backend(QueueSettings::default());
    for i in 0..5 {
        backend
            .create(NewJob::new(format!("job-{}", i)).run_at(at(i)))
            .await
            .unwrap();
    }
    assert_eq!(payloads(&scan(&backend, 2, 100).await), vec!["job-0", "job-1"]);
}

// ============================================================================
// Priority Bounds
// ============================================================================

#[tokio::test]
async fn test_priority_bounds_exclude_earliest_job() {
    let settings = QueueSettings {
        max_priority: Some(5),
        read_ahead: 2,
        ..Default::default()
    };
    let backend = backend(settings);
    backend.create(NewJob::new("too-low").run_at(at(1)).priority(10)).await.unwrap();
    backend.create(NewJob::new("in-range").run_at(at(2)).priority(0)).await.unwrap();

    assert_eq!(payloads(&scan(&backend, 1, 100).await), vec!["in-range"]);
}

#[tokio::test]
async fn test_min_priority_is_inclusive() {
    let settings = QueueSettings {
        min_priority: Some(-2),
        ..Default::default()
    };
    let backend = backend(settings);
    backend.create(NewJob::new("edge").run_at(at(1)).priority(-2)).await.unwrap();
    backend.create(NewJob::new("below").run_at(at(1)).priority(-3)).await.unwrap();

    assert_eq!(payloads(&scan(&backend, 10, 100).await), vec!["edge"]);
}

// ============================================================================
// Queues
// ============================================================================

#[tokio::test]
async fn test_queues_scanned_in_configured_order() {
    let settings = QueueSettings {
        queues: vec!["urgent".into(), "bulk".into()],
        ..Default::default()
    };
    let backend = backend(settings);
    backend.create(NewJob::new("bulk-old").queue("bulk").run_at(at(1))).await.unwrap();
    backend.create(NewJob::new("urgent-new").queue("urgent").run_at(at(50))).await.unwrap();
    backend.create(NewJob::new("elsewhere").queue("other").run_at(at(1))).await.unwrap();

    assert_eq!(
        payloads(&scan(&backend, 10, 100).await),
        vec!["urgent-new", "bulk-old"]
    );
}

#[tokio::test]
async fn test_blank_queue_goes_to_default() {
    let backend = backend(QueueSettings::default());
    let job = backend.create(NewJob::new("x").queue("")).await.unwrap();
    assert_eq!(job.queue, "default");
}

#[tokio::test]
async fn test_similar_queue_names_stay_separate() {
    let settings = QueueSettings {
        queues: vec!["mail".into()],
        ..Default::default()
    };
    let backend = backend(settings);
    backend.create(NewJob::new("mail").queue("mail").run_at(at(5))).await.unwrap();
    backend.create(NewJob::new("mail_out").queue("mail_out").run_at(at(1))).await.unwrap();
    backend.create(NewJob::new("mail%").queue("mail%").run_at(at(1))).await.unwrap();

    assert_eq!(payloads(&scan(&backend, 10, 100).await), vec!["mail"]);
}

#[tokio::test]
async fn test_claimed_jobs_are_not_candidates() {
    let backend = backend(QueueSettings::default());
    backend.create(NewJob::new("a").run_at(at(1))).await.unwrap();
    backend.create(NewJob::new("b").run_at(at(2))).await.unwrap();

    let mut first = scan(&backend, 1, 100).await.remove(0);
    assert!(backend.lock_exclusively(&mut first, "w1").await.unwrap());

    assert_eq!(payloads(&scan(&backend, 10, 100).await), vec!["b"]);
}

// ============================================================================
// Read-ahead
// ============================================================================

#[tokio::test]
async fn test_read_ahead_skips_failed_heads() {
    let settings = QueueSettings {
        read_ahead: 3,
        ..Default::default()
    };
    let backend = backend(settings.clone());
    for i in 0..2 {
        let mut job = backend
            .create(NewJob::new(format!("failed-{}", i)).run_at(at(i)))
            .await
            .unwrap();
        job.failed_at = Some(at(50));
        backend.save(&mut job).await.unwrap();
    }
    backend.create(NewJob::new("healthy").run_at(at(10))).await.unwrap();

    assert_eq!(payloads(&scan(&backend, 1, 100).await), vec!["healthy"]);

    let narrow = AvailabilityScanner::new(
        backend.store().clone(),
        QueueSettings {
            read_ahead: 1,
            ..settings
        },
    );
    let found = narrow
        .find_available_at("scanner", 1, MAX_RUN_TIME, at(100))
        .await
        .unwrap();
    assert!(found.is_empty());
}

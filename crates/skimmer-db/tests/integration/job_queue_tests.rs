use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use skimmer_core::job::{BackoffPolicy, JobDefaults, JobProgress, JobResult, JobStatus, NewJob};
use skimmer_core::job_queue::JobQueue;
use skimmer_core::ratelimit::ClientIdentity;
use skimmer_core::AppError;
use skimmer_db::ExtractionJobRepository;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn request() -> NewJob {
    NewJob::new("https://example.com/post/1")
}

#[tokio::test]
async fn enqueue_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo
        .enqueue(
            request()
                .with_kind("profile")
                .with_scope("residential")
                .with_identity(ClientIdentity::from_ip("198.51.100.4").with_user("alice"))
                .with_priority(7),
        )
        .await
        .unwrap();

    assert_eq!(job.url, "https://example.com/post/1");
    assert_eq!(job.kind, "profile");
    assert_eq!(job.scope.as_deref(), Some("residential"));
    assert_eq!(job.identity.user_id.as_deref(), Some("alice"));
    assert_eq!(job.priority, 7);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.progress, JobProgress::queued());
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.backoff, BackoffPolicy::default());
    assert!(job.worker_id.is_none());
    assert!(job.started_at.is_none());

    let fetched = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.identity, job.identity);
}

#[tokio::test]
async fn enqueue_applies_repository_defaults() {
    let (pool, _container) = setup_test_db().await;
    let defaults = JobDefaults {
        max_attempts: 5,
        backoff: BackoffPolicy::new(Duration::from_millis(250), Duration::from_secs(10)),
    };
    let repo = ExtractionJobRepository::new(pool).with_defaults(defaults);

    let job = repo.enqueue(request()).await.unwrap();
    assert_eq!(job.max_attempts, 5);
    assert_eq!(job.backoff.base, Duration::from_millis(250));

    let explicit = repo.enqueue(request().with_max_attempts(2)).await.unwrap();
    assert_eq!(explicit.max_attempts, 2);
}

#[tokio::test]
async fn enqueue_rejects_invalid_request() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let err = repo.enqueue(NewJob::new("ftp://example.com")).await.unwrap_err();
    assert!(matches!(err, AppError::ValidationError(_)));
    assert!(repo.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_sets_active_and_worker() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    repo.enqueue(request()).await.unwrap();

    let claimed = repo
        .claim("worker-1")
        .await
        .unwrap()
        .expect("Should claim the job");

    assert_eq!(claimed.status, JobStatus::Active);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-1"));
    assert!(claimed.started_at.is_some());

    assert!(repo.claim("worker-2").await.unwrap().is_none());
}

#[tokio::test]
async fn claim_orders_by_priority_then_age() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let first = repo.enqueue(request()).await.unwrap();
    let urgent = repo.enqueue(request().with_priority(10)).await.unwrap();
    let second = repo.enqueue(request()).await.unwrap();

    let order: Vec<Uuid> = vec![
        repo.claim("w").await.unwrap().unwrap().id,
        repo.claim("w").await.unwrap().unwrap().id,
        repo.claim("w").await.unwrap().unwrap().id,
    ];
    assert_eq!(order, vec![urgent.id, first.id, second.id]);
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    for i in 0..20 {
        repo.enqueue(NewJob::new(format!("https://example.com/{i}")))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..5 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            while let Some(job) = repo.claim(&format!("worker-{w}")).await.unwrap() {
                ids.push(job.id);
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn defer_hides_job_without_charging_an_attempt() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();
    assert!(repo
        .defer(job.id, "worker-1", Utc::now() + TimeDelta::minutes(5))
        .await
        .unwrap());

    let deferred = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(deferred.status, JobStatus::Delayed);
    assert_eq!(deferred.attempts, 0);
    assert!(deferred.worker_id.is_none());
    assert!(repo.claim("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_job_is_claimable_once_due() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();
    repo.defer(job.id, "worker-1", Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();

    let reclaimed = repo.claim("worker-2").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);
    assert_eq!(reclaimed.worker_id.as_deref(), Some("worker-2"));
}

#[tokio::test]
async fn progress_and_complete() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();
    repo.update_progress(job.id, "worker-1", JobProgress::new("extracting", 50))
        .await
        .unwrap();
    assert_eq!(
        repo.get(job.id).await.unwrap().unwrap().progress,
        JobProgress::new("extracting", 50)
    );

    let result = JobResult {
        content_id: Uuid::new_v4(),
        title: Some("Hello".into()),
    };
    assert!(repo.complete(job.id, "worker-1", result.clone()).await.unwrap());

    let done = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(result));
    assert_eq!(done.progress, JobProgress::new("completed", 100));
    assert!(done.completed_at.is_some());
    assert!(done.worker_id.is_none());
}

#[tokio::test]
async fn progress_ignored_for_inactive_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.update_progress(job.id, "worker-1", JobProgress::new("extracting", 50))
        .await
        .unwrap();

    assert_eq!(
        repo.get(job.id).await.unwrap().unwrap().progress,
        JobProgress::queued()
    );
}

#[tokio::test]
async fn fail_with_retry_delays_job() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();

    let retry_at = Utc::now() + TimeDelta::minutes(5);
    assert!(repo
        .fail(job.id, "worker-1", "HTTP 503 for https://example.com", Some(retry_at))
        .await
        .unwrap());

    let updated = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Delayed);
    assert_eq!(updated.attempts, 1);
    assert!((updated.not_before - retry_at).num_milliseconds().abs() < 1);
    assert_eq!(
        updated.error.as_deref(),
        Some("HTTP 503 for https://example.com")
    );
    assert!(updated.worker_id.is_none());
}

#[tokio::test]
async fn fail_without_retry_marks_failed() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();
    repo.fail(job.id, "worker-1", "permanent error", None)
        .await
        .unwrap();

    let updated = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Failed);
    assert_eq!(updated.attempts, 1);
    assert_eq!(updated.progress.status, "failed");
    assert!(updated.completed_at.is_some());
}

#[tokio::test]
async fn cancel_waiting_active_and_unknown() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let queued = repo.enqueue(request()).await.unwrap();
    assert!(repo.cancel(queued.id).await.unwrap());
    assert_eq!(
        repo.get(queued.id).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    let active = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();
    assert!(!repo.cancel(active.id).await.unwrap());
    assert_eq!(
        repo.get(active.id).await.unwrap().unwrap().status,
        JobStatus::Active
    );

    let err = repo.cancel(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn release_worker_jobs_on_shutdown() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    repo.enqueue(request()).await.unwrap();
    repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();
    repo.claim("worker-1").await.unwrap();

    let released = repo.release_worker_jobs("worker-1").await.unwrap();
    assert_eq!(released, 2);
    assert_eq!(repo.count_by_status(JobStatus::Queued).await.unwrap(), 2);
}

#[tokio::test]
async fn requeue_orphaned_and_purge_terminal() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let orphan = repo.enqueue(request()).await.unwrap();
    repo.claim("dead-worker").await.unwrap();
    let done = repo.enqueue(request()).await.unwrap();
    repo.cancel(done.id).await.unwrap();

    let future = Utc::now() + TimeDelta::minutes(1);
    assert_eq!(repo.requeue_orphaned(future).await.unwrap(), 1);
    assert_eq!(
        repo.get(orphan.id).await.unwrap().unwrap().status,
        JobStatus::Queued
    );

    assert_eq!(repo.purge_terminal(future).await.unwrap(), 1);
    assert!(repo.get(done.id).await.unwrap().is_none());
    assert!(repo.get(orphan.id).await.unwrap().is_some());
}

#[tokio::test]
async fn stale_owner_updates_are_ignored_after_requeue() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    let job = repo.enqueue(request()).await.unwrap();
    repo.claim("worker-a").await.unwrap();
    repo.requeue_orphaned(Utc::now() + TimeDelta::minutes(1))
        .await
        .unwrap();
    repo.claim("worker-b").await.unwrap();

    let result = JobResult {
        content_id: Uuid::new_v4(),
        title: None,
    };
    assert!(!repo.complete(job.id, "worker-a", result).await.unwrap());
    assert!(!repo.fail(job.id, "worker-a", "late", None).await.unwrap());
    assert!(!repo
        .defer(job.id, "worker-a", Utc::now() + TimeDelta::minutes(5))
        .await
        .unwrap());
    repo.update_progress(job.id, "worker-a", JobProgress::new("processing", 50))
        .await
        .unwrap();

    let current = repo.get(job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Active);
    assert_eq!(current.worker_id.as_deref(), Some("worker-b"));
    assert_eq!(current.attempts, 0);
    assert!(current.result.is_none());
    assert_ne!(current.progress.status, "processing");
}

#[tokio::test]
async fn list_with_status_filter() {
    let (pool, _container) = setup_test_db().await;
    let repo = ExtractionJobRepository::new(pool);

    repo.enqueue(request()).await.unwrap();
    repo.enqueue(request()).await.unwrap();
    repo.claim("worker-1").await.unwrap();

    let queued = repo.list(Some(JobStatus::Queued), 10).await.unwrap();
    assert_eq!(queued.len(), 1);
    let active = repo.list(Some(JobStatus::Active), 10).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(repo.list(None, 10).await.unwrap().len(), 2);
    assert_eq!(repo.list(None, 1).await.unwrap().len(), 1);
}

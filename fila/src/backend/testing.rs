//! Test suite for ensuring a correct implementation of a pull backend.
use std::{collections::HashSet, time::Duration};

use chrono::{TimeDelta, Utc};

use crate::job::{JobState, DEFAULT_MAX_ATTEMPTS};

use super::*;

const DEFAULT_QUEUE: &str = "orcamento";
const DEFAULT_JOB_TYPE: &str = "generate-pdf";

impl EnqueuableJob {
    pub(crate) const DEFAULT_QUEUE: &'static str = DEFAULT_QUEUE;

    pub(crate) fn mock_job() -> Self {
        Self {
            id: JobId::generate(),
            queue: DEFAULT_QUEUE.to_owned(),
            job_type: DEFAULT_JOB_TYPE.to_owned(),
            payload: serde_json::json!({"orcamentoId": 42}),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: None,
        }
    }

    pub(crate) fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: id.into(),
            ..self
        }
    }

    pub(crate) fn with_queue(self, queue: impl ToString) -> Self {
        Self {
            queue: queue.to_string(),
            ..self
        }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at: Some(scheduled_at),
            ..self
        }
    }
}

/// Expands to one test per conformance case for a pull backend.
///
/// ```
/// use fila::{backend::memory::InMemoryBackend, test_suite};
///
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// Backends that need a fixture pass their own test attributes and arguments. The Postgres
/// backend runs it under `sqlx::test` with a fresh pool per case:
///
/// ```ignore
/// fila::test_suite!(
///     attrs: [sqlx::test(migrations = "./migrations"), ignore = "requires a postgres database"],
///     args: (pool: PgPool),
///     backend: PgBackend::from_pool(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attrs: [tokio::test], args: (), backend: $backend);
    };
    (attrs: [$($attr:meta),* $(,)?], args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@cases [$($attr),*] $args $backend;
            enqueue_and_get_job,
            enqueue_duplicate_id_is_noop,
            claim_next_job_oldest_first,
            claim_next_job_skips_delayed,
            claim_next_job_is_scoped_to_queue,
            claim_next_job_empty,
            claims_are_exclusive,
            mark_job_complete,
            mark_job_complete_not_found,
            mark_job_complete_twice_rejected,
            mark_job_failed_schedules_retry,
            mark_job_failed_exhausts_attempts,
            mark_job_failed_non_retryable,
            mark_job_failed_not_found,
            queue_metrics,
            prune_jobs,
            requeue_stalled,
        );
    };
    (@cases $attrs:tt $args:tt $backend:expr; $($case:ident),* $(,)?) => {
        $(
            $crate::test_suite!(@case $attrs $args $backend; $case);
        )*
    };
    (@case [$($attr:meta),*] $args:tt $backend:expr; $case:ident) => {
        $(#[$attr])*
        async fn $case $args {
            let backend = $backend;
            $crate::backend::testing::$case(backend).await;
        }
    };
}

pub use test_suite;

#[doc(hidden)]
pub async fn enqueue_and_get_job(backend: impl Backend) {
    let id1 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let id2 = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(id1, id2);
    let job = backend.get_job(DEFAULT_QUEUE, &id1).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
    assert_eq!(job.job_type, DEFAULT_JOB_TYPE);
    assert_eq!(job.payload, serde_json::json!({"orcamentoId": 42}));
    assert!(backend.get_job(DEFAULT_QUEUE, &id2).await.unwrap().is_some());
    assert!(backend
        .get_job(DEFAULT_QUEUE, &JobId::from("missing"))
        .await
        .unwrap()
        .is_none());
}

#[doc(hidden)]
pub async fn enqueue_duplicate_id_is_noop(backend: impl Backend) {
    let first = backend
        .enqueue(EnqueuableJob::mock_job().with_id("orcamento-42"))
        .await
        .unwrap();
    let second = backend
        .enqueue(
            EnqueuableJob {
                payload: serde_json::json!({"orcamentoId": 7}),
                ..EnqueuableJob::mock_job()
            }
            .with_id("orcamento-42"),
        )
        .await
        .unwrap();

    assert_eq!(first, second);
    let job = backend.get_job(DEFAULT_QUEUE, &first).await.unwrap().unwrap();
    assert_eq!(job.payload, serde_json::json!({"orcamentoId": 42}));
    assert_eq!(backend.queue_metrics(DEFAULT_QUEUE).await.unwrap().total, 1);
}

#[doc(hidden)]
pub async fn claim_next_job_oldest_first(backend: impl Backend) {
    let mut ids = vec![];
    for _ in 0..3 {
        ids.push(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    for id in ids {
        let job = backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();
        assert_eq!(job.id, id);
    }
}

#[doc(hidden)]
pub async fn claim_next_job_skips_delayed(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    let ready = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let job = backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_eq!(job.id, ready);
    assert!(backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_job_is_scoped_to_queue(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("outra"))
        .await
        .unwrap();

    assert!(backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().is_none());
    assert!(backend.claim_next_job("outra").await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn claim_next_job_empty(backend: impl Backend) {
    assert!(backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claims_are_exclusive(backend: impl Backend) {
    let mut enqueued = HashSet::new();
    for _ in 0..3 {
        enqueued.insert(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap());
    }

    let claimed = futures::future::join_all((0..8).map(|_| backend.claim_next_job(DEFAULT_QUEUE)))
        .await
        .into_iter()
        .filter_map(|result| result.unwrap())
        .map(|job| {
            assert_eq!(job.status, JobStatus::Processing);
            job.id
        })
        .collect::<Vec<_>>();

    assert_eq!(claimed.len(), 3);
    assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), enqueued);
}

#[doc(hidden)]
pub async fn mark_job_complete(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();

    backend
        .mark_job_complete(&id, serde_json::json!({"pdfUrl": "/artifacts/42.pdf"}))
        .await
        .unwrap();

    let job = backend.get_job(DEFAULT_QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(
        job.result,
        Some(serde_json::json!({"pdfUrl": "/artifacts/42.pdf"}))
    );
    assert!(job.processed_at.is_some());
}

#[doc(hidden)]
pub async fn mark_job_complete_not_found(backend: impl Backend) {
    let result = backend
        .mark_job_complete(&JobId::from("missing"), serde_json::Value::Null)
        .await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn mark_job_complete_twice_rejected(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    backend
        .mark_job_complete(&id, serde_json::json!(1))
        .await
        .unwrap();

    let complete_again = backend.mark_job_complete(&id, serde_json::json!(2)).await;
    let fail_after = backend.mark_job_failed(&id, "late", true).await;

    assert!(matches!(
        complete_again,
        Err(BackendError::InvalidTransition {
            status: JobStatus::Completed,
            ..
        })
    ));
    assert!(matches!(
        fail_after,
        Err(BackendError::InvalidTransition { .. })
    ));
    let job = backend.get_job(DEFAULT_QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(serde_json::json!(1)));
    assert_eq!(job.last_error, None);
}

#[doc(hidden)]
pub async fn mark_job_failed_schedules_retry(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    let before = Utc::now();

    let status = backend.mark_job_failed(&id, "renderer crashed", true).await.unwrap();

    assert_eq!(status, JobStatus::Pending);
    let job = backend.get_job(DEFAULT_QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("renderer crashed"));
    let next_attempt_at = job.next_attempt_at.unwrap();
    assert!(next_attempt_at >= before + TimeDelta::milliseconds(1900));
    assert!(next_attempt_at <= Utc::now() + TimeDelta::seconds(2));
    assert_eq!(job.state_at(Utc::now()), JobState::Delayed);
    assert!(backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().is_none());
    assert_eq!(backend.queue_metrics(DEFAULT_QUEUE).await.unwrap().delayed, 1);
}

#[doc(hidden)]
pub async fn mark_job_failed_exhausts_attempts(backend: impl Backend) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(1))
        .await
        .unwrap();
    backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();

    let status = backend.mark_job_failed(&id, "boom", true).await.unwrap();

    assert_eq!(status, JobStatus::Failed);
    let job = backend.get_job(DEFAULT_QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("boom"));
    assert!(backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_job_failed_non_retryable(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();

    let status = backend
        .mark_job_failed(&id, "unknown job type", false)
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Failed);
    let job = backend.get_job(DEFAULT_QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Failed);
}

#[doc(hidden)]
pub async fn mark_job_failed_not_found(backend: impl Backend) {
    let result = backend
        .mark_job_failed(&JobId::from("missing"), "boom", true)
        .await;

    assert!(matches!(result, Err(BackendError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn queue_metrics(backend: impl Backend) {
    let mut ids = vec![];
    for _ in 0..5 {
        ids.push(backend.enqueue(EnqueuableJob::mock_job()).await.unwrap());
    }
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("outra"))
        .await
        .unwrap();
    for _ in 0..2 {
        let job = backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();
        backend
            .mark_job_complete(&job.id, serde_json::Value::Null)
            .await
            .unwrap();
    }

    let metrics = backend.queue_metrics(DEFAULT_QUEUE).await.unwrap();

    assert_eq!(metrics, QueueMetrics::new(DEFAULT_QUEUE, 3, 0, 2, 0, 0));
    assert_eq!(metrics.total, 5);
}

#[doc(hidden)]
pub async fn prune_jobs(backend: impl Backend) {
    let first = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;
    let second = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let claimed = backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    backend
        .mark_job_complete(&first, serde_json::Value::Null)
        .await
        .unwrap();

    assert_eq!(backend.prune_jobs(TimeDelta::days(1)).await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.prune_jobs(TimeDelta::milliseconds(5)).await.unwrap(), 1);

    assert!(backend.get_job(DEFAULT_QUEUE, &first).await.unwrap().is_none());
    assert!(backend.get_job(DEFAULT_QUEUE, &second).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn requeue_stalled(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    backend.claim_next_job(DEFAULT_QUEUE).await.unwrap().unwrap();

    assert_eq!(
        backend
            .requeue_stalled(DEFAULT_QUEUE, TimeDelta::hours(1))
            .await
            .unwrap(),
        0
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        backend
            .requeue_stalled(DEFAULT_QUEUE, TimeDelta::milliseconds(5))
            .await
            .unwrap(),
        1
    );

    let job = backend.get_job(DEFAULT_QUEUE, &id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
    assert!(job.next_attempt_at.is_some());
}

//! The storage/broker abstraction behind [`crate::QueueManager`].
//!
//! There are two kinds of backend, distinguished by [`Dispatch`]:
//!
//! - __pull__ backends keep jobs in a store that workers poll. They implement
//!   [`Backend::claim_next_job`], [`Backend::mark_job_complete`] and [`Backend::mark_job_failed`].
//! - __push__ backends hand jobs to waiting workers. They implement [`Backend::receive`] and
//!   settle each job through the [`Delivery`] they hand out, keeping retry bookkeeping internal.
//!
//! Operations that do not apply to a backend's dispatch model return
//! [`BackendError::Unsupported`] rather than silently doing nothing.
use std::{pin::Pin, sync::Arc, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::job::{Job, JobId, JobStatus};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// How jobs reach workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dispatch {
    /// The backend delivers jobs to subscribed workers.
    Push,
    /// Workers poll the backend and claim jobs.
    Pull,
}

/// A job ready to be handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub max_attempts: u16,
    /// When set, the job is not eligible before this instant.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl EnqueuableJob {
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            next_attempt_at: self.scheduled_at,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Counts of jobs per state for a single queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub queue_name: String,
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
    pub total: u64,
}

impl QueueMetrics {
    pub fn new(
        queue_name: impl Into<String>,
        waiting: u64,
        active: u64,
        completed: u64,
        failed: u64,
        delayed: u64,
    ) -> Self {
        Self {
            queue_name: queue_name.into(),
            waiting,
            active,
            completed,
            failed,
            delayed,
            total: waiting + active + completed + failed + delayed,
        }
    }
}

/// The result of running a job's handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(serde_json::Value),
    Failed { error: String, retry: bool },
}

/// Backend specific acknowledgement of a pushed job.
#[async_trait]
pub trait Settle: Send {
    async fn settle(self: Box<Self>, job: &Job, outcome: Outcome) -> Result<(), BackendError>;
}

/// A job handed to a worker by a push backend.
///
/// The worker runs the job and reports back through [`Delivery::settle`]; retry scheduling is up to
/// the backend.
pub struct Delivery {
    pub job: Job,
    settle: Box<dyn Settle>,
}

impl Delivery {
    pub fn new(job: Job, settle: impl Settle + 'static) -> Self {
        Self {
            job,
            settle: Box::new(settle),
        }
    }

    pub async fn settle(self, outcome: Outcome) -> Result<(), BackendError> {
        self.settle.settle(&self.job, outcome).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery").field("job", &self.job).finish()
    }
}

pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BackendError>> + Send>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// A short human readable name, used in logs and errors.
    fn name(&self) -> &'static str;

    fn dispatch(&self) -> Dispatch;

    /// Enqueue a job. Enqueuing an id that already exists is a no-op returning that id.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, BackendError>;

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, BackendError>;

    /// Delete terminal jobs last updated before `older_than` ago, returning how many were removed.
    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<u64, BackendError>;

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Atomically claim the oldest eligible job of `queue`, moving it to `processing`.
    async fn claim_next_job(&self, _queue: &str) -> Result<Option<Job>, BackendError> {
        Err(BackendError::unsupported("claim_next_job", self.name()))
    }

    async fn mark_job_complete(
        &self,
        _id: &JobId,
        _result: serde_json::Value,
    ) -> Result<(), BackendError> {
        Err(BackendError::unsupported("mark_job_complete", self.name()))
    }

    /// Record a failed attempt, returning the status the job moved to.
    async fn mark_job_failed(
        &self,
        _id: &JobId,
        _error: &str,
        _should_retry: bool,
    ) -> Result<JobStatus, BackendError> {
        Err(BackendError::unsupported("mark_job_failed", self.name()))
    }

    /// Return jobs stuck in `processing` for longer than `lease` to the queue, counting the stalled
    /// run as a failed attempt.
    async fn requeue_stalled(&self, _queue: &str, _lease: TimeDelta) -> Result<u64, BackendError> {
        Err(BackendError::unsupported("requeue_stalled", self.name()))
    }

    /// Wait up to `wait` for the backend to hand over the next job of `queue`.
    async fn receive(&self, _queue: &str, _wait: Duration) -> Result<Option<Delivery>, BackendError> {
        Err(BackendError::unsupported("receive", self.name()))
    }
}

/// Subscribe to the jobs a push backend delivers for `queue`.
///
/// The stream ends once `cancellation_token` is cancelled. Cancellation is only observed between
/// receives so a job taken from the broker is never dropped on the floor.
pub fn subscribe_ready_jobs(
    backend: Arc<dyn Backend>,
    queue: String,
    wait: Duration,
    cancellation_token: CancellationToken,
) -> DeliveryStream {
    Box::pin(stream! {
        while !cancellation_token.is_cancelled() {
            match backend.receive(&queue, wait).await {
                Ok(Some(delivery)) => yield Ok(delivery),
                Ok(None) => {}
                Err(error @ BackendError::Unsupported { .. }) => {
                    yield Err(error);
                    break;
                }
                Err(error) => {
                    yield Err(error);
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = cancellation_token.cancelled() => {}
                    }
                }
            }
        }
    })
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {id} is {status} and cannot make this transition")]
    InvalidTransition { id: JobId, status: JobStatus },
    #[error("`{operation}` is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
    #[error("Backend has been closed")]
    Closed,
}

impl BackendError {
    pub fn unsupported(operation: &'static str, backend: &'static str) -> Self {
        Self::Unsupported { operation, backend }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use futures::StreamExt;

    use super::{memory::InMemoryBackend, *};

    #[test]
    fn metrics_total_sums_every_state() {
        let metrics = QueueMetrics::new("orcamento", 3, 1, 2, 4, 5);

        assert_eq!(metrics.total, 15);
        assert_eq!(
            serde_json::to_value(&metrics).unwrap(),
            serde_json::json!({
                "queueName": "orcamento",
                "waiting": 3,
                "active": 1,
                "completed": 2,
                "failed": 4,
                "delayed": 5,
                "total": 15,
            })
        );
    }

    #[tokio::test]
    async fn pull_backend_rejects_push_operations() {
        let backend = InMemoryBackend::new();

        assert_matches!(
            backend.receive("orcamento", Duration::from_millis(1)).await,
            Err(BackendError::Unsupported {
                operation: "receive",
                backend: "memory"
            })
        );
    }

    #[tokio::test]
    async fn subscription_to_pull_backend_ends_with_error() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let mut stream = subscribe_ready_jobs(
            backend,
            "orcamento".to_owned(),
            Duration::from_millis(1),
            CancellationToken::new(),
        );

        assert_matches!(
            stream.next().await,
            Some(Err(BackendError::Unsupported { .. }))
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn subscription_ends_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new());
        let mut stream = subscribe_ready_jobs(
            backend,
            "orcamento".to_owned(),
            Duration::from_millis(1),
            token,
        );

        assert!(stream.next().await.is_none());
    }
}

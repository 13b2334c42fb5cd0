//! The uniform queue API used by callers and workers.
//!
//! [`QueueManager::initialize`] tries the primary (push) backend, falls back to the table backed
//! (pull) backend when the primary cannot be reached, and from then on exposes the same API
//! whichever backend won.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{
        subscribe_ready_jobs, Backend, BackendError, DeliveryStream, Dispatch, EnqueuableJob,
        QueueMetrics,
    },
    backoff::{Strategy, CONNECT_BACKOFF},
    job::{Job, JobId, JobOptions, JobState, JobStatus, DEFAULT_MAX_ATTEMPTS},
    QueueError,
};

/// Something that can produce a connected [`Backend`].
#[async_trait]
pub trait Connect: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How many times to try the primary backend before falling back.
    pub connect_attempts: u16,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
        }
    }
}

impl ManagerConfig {
    pub fn with_connect_attempts(self, connect_attempts: u16) -> Self {
        Self { connect_attempts }
    }
}

/// Acknowledgement returned by [`QueueManager::add_job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedJob {
    pub success: bool,
    pub job_id: JobId,
    #[serde(rename = "queueName")]
    pub queue: String,
    pub job_type: String,
}

/// The uniform view of a job returned by [`QueueManager::job_status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusReport {
    pub exists: bool,
    pub id: Option<JobId>,
    pub name: Option<String>,
    pub data: Option<serde_json::Value>,
    pub state: Option<JobState>,
    pub attempts_made: u16,
    pub failed_reason: Option<String>,
    pub result: Option<serde_json::Value>,
    pub timestamp: Option<DateTime<Utc>>,
    pub processed_on: Option<DateTime<Utc>>,
}

impl JobStatusReport {
    pub fn missing() -> Self {
        Self {
            exists: false,
            id: None,
            name: None,
            data: None,
            state: None,
            attempts_made: 0,
            failed_reason: None,
            result: None,
            timestamp: None,
            processed_on: None,
        }
    }

    pub fn from_job(job: Job, now: DateTime<Utc>) -> Self {
        Self {
            exists: true,
            state: Some(job.state_at(now)),
            id: Some(job.id),
            name: Some(job.job_type),
            data: Some(job.payload),
            attempts_made: job.attempts,
            failed_reason: job.last_error,
            result: job.result,
            timestamp: Some(job.created_at),
            processed_on: job.processed_at,
        }
    }
}

/// Façade over the single active [`Backend`].
///
/// Construct it once at startup and share it as an `Arc<QueueManager>`.
pub struct QueueManager {
    backend: Arc<dyn Backend>,
    closed: AtomicBool,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("backend", &self.backend.name())
            .field("closed", &self.closed)
            .finish()
    }
}

impl QueueManager {
    /// Wrap an already connected backend.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            closed: AtomicBool::new(false),
        }
    }

    /// Select the backend to use for the lifetime of the process.
    ///
    /// The primary is tried `config.connect_attempts` times with [`CONNECT_BACKOFF`] between
    /// attempts. If it never connects, or none is given, the fallback is tried once. Fails with
    /// [`QueueError::NoBackendAvailable`] if neither can be reached.
    pub async fn initialize(
        config: ManagerConfig,
        primary: Option<&dyn Connect>,
        fallback: &dyn Connect,
    ) -> Result<Self, QueueError> {
        let mut primary_error = None;
        if let Some(primary) = primary {
            match connect_with_retries(primary, config.connect_attempts).await {
                Ok(backend) => {
                    tracing::info!(backend = primary.name(), "Queue backend selected");
                    return Ok(Self::new(backend));
                }
                Err(error) => {
                    tracing::warn!(
                        ?error,
                        primary = primary.name(),
                        fallback = fallback.name(),
                        "Primary queue backend unavailable, falling back to {}",
                        fallback.name()
                    );
                    primary_error = Some(error.to_string());
                }
            }
        }

        match fallback.connect().await {
            Ok(backend) => {
                tracing::info!(backend = fallback.name(), "Queue backend selected");
                Ok(Self::new(backend))
            }
            Err(error) => {
                tracing::error!(?error, "No queue backend available");
                Err(QueueError::NoBackendAvailable {
                    primary: primary_error.unwrap_or_else(|| "not configured".to_owned()),
                    fallback: error.to_string(),
                })
            }
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn dispatch(&self) -> Dispatch {
        self.backend.dispatch()
    }

    #[instrument(skip(self, payload, options), fields(backend = self.backend_name()))]
    pub async fn add_job<D: Serialize>(
        &self,
        queue: &str,
        job_type: &str,
        payload: D,
        options: JobOptions,
    ) -> Result<AddedJob, QueueError> {
        self.ensure_open()?;
        let explicit_id = options.job_id.is_some();
        let job = EnqueuableJob {
            id: options.job_id.unwrap_or_else(JobId::generate),
            queue: queue.to_owned(),
            job_type: job_type.to_owned(),
            payload: serde_json::to_value(payload).map_err(BackendError::from)?,
            max_attempts: options.attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            scheduled_at: options.delay.map(|delay| Utc::now() + delay),
        };
        let job_id = self.backend.enqueue(job).await?;
        tracing::debug!(%job_id, "Job {job_id} added to {queue}");

        // A reused id leaves the stored job in place; report that job, not the request.
        let stored = match explicit_id {
            true => self.backend.get_job(queue, &job_id).await?,
            false => None,
        };
        let (queue, job_type) = match stored {
            Some(job) => (job.queue, job.job_type),
            None => (queue.to_owned(), job_type.to_owned()),
        };
        Ok(AddedJob {
            success: true,
            job_id,
            queue,
            job_type,
        })
    }

    pub async fn job_status(&self, queue: &str, id: &JobId) -> Result<JobStatusReport, QueueError> {
        self.ensure_open()?;
        Ok(match self.backend.get_job(queue, id).await? {
            Some(job) => JobStatusReport::from_job(job, Utc::now()),
            None => JobStatusReport::missing(),
        })
    }

    pub async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, QueueError> {
        self.ensure_open()?;
        Ok(self.backend.queue_metrics(queue).await?)
    }

    /// Claim the next job of `queue`. Pull backends only.
    pub async fn next_job(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        self.ensure_open()?;
        Ok(self.backend.claim_next_job(queue).await?)
    }

    /// Pull backends only.
    pub async fn complete_job(
        &self,
        id: &JobId,
        result: serde_json::Value,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        Ok(self.backend.mark_job_complete(id, result).await?)
    }

    /// Record a failed attempt. Pull backends only.
    pub async fn fail_job(
        &self,
        id: &JobId,
        error: &str,
        should_retry: bool,
    ) -> Result<JobStatus, QueueError> {
        self.ensure_open()?;
        Ok(self.backend.mark_job_failed(id, error, should_retry).await?)
    }

    pub async fn requeue_stalled(&self, queue: &str, lease: TimeDelta) -> Result<u64, QueueError> {
        self.ensure_open()?;
        Ok(self.backend.requeue_stalled(queue, lease).await?)
    }

    /// Subscribe to jobs delivered by a push backend.
    pub fn subscribe(
        &self,
        queue: &str,
        wait: Duration,
        cancellation_token: CancellationToken,
    ) -> Result<DeliveryStream, QueueError> {
        self.ensure_open()?;
        if self.dispatch() != Dispatch::Push {
            return Err(BackendError::unsupported("subscribe", self.backend_name()).into());
        }
        Ok(subscribe_ready_jobs(
            self.backend.clone(),
            queue.to_owned(),
            wait,
            cancellation_token,
        ))
    }

    /// Delete terminal jobs older than `older_than`.
    pub async fn prune(&self, older_than: TimeDelta) -> Result<u64, QueueError> {
        self.ensure_open()?;
        let pruned = self.backend.prune_jobs(older_than).await?;
        tracing::debug!(pruned, "Pruned {pruned} jobs");
        Ok(pruned)
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Closed);
        }
        tracing::debug!(backend = self.backend_name(), "Closing queue backend");
        Ok(self.backend.close().await?)
    }
}

async fn connect_with_retries(
    connector: &dyn Connect,
    attempts: u16,
) -> Result<Arc<dyn Backend>, BackendError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match connector.connect().await {
            Ok(backend) => return Ok(backend),
            Err(error) if attempt >= attempts => return Err(error),
            Err(error) => {
                let delay = CONNECT_BACKOFF.backoff(attempt);
                tracing::debug!(
                    ?error,
                    attempt,
                    backend = connector.name(),
                    "Failed to connect to {}, retrying in {delay}",
                    connector.name()
                );
                tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicU16;

    use assert_matches::assert_matches;

    use super::*;
    use crate::backend::memory::InMemoryBackend;

    struct Unreachable {
        attempts: AtomicU16,
    }

    impl Unreachable {
        fn new() -> Self {
            Self {
                attempts: AtomicU16::new(0),
            }
        }
    }

    #[async_trait]
    impl Connect for Unreachable {
        fn name(&self) -> &'static str {
            "unreachable"
        }

        async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::Unavailable("connection refused".to_owned()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_prefers_primary() {
        let primary = InMemoryBackend::new().push();
        let fallback = InMemoryBackend::new();

        let manager = QueueManager::initialize(Default::default(), Some(&primary), &fallback)
            .await
            .unwrap();

        assert_eq!(manager.dispatch(), Dispatch::Push);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_falls_back_after_retries() {
        let primary = Unreachable::new();
        let fallback = InMemoryBackend::new();

        let manager = QueueManager::initialize(
            ManagerConfig::default().with_connect_attempts(3),
            Some(&primary),
            &fallback,
        )
        .await
        .unwrap();

        assert_eq!(primary.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(manager.backend_name(), "memory");
        assert_eq!(manager.dispatch(), Dispatch::Pull);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_without_primary_uses_fallback() {
        let fallback = InMemoryBackend::new();

        let manager = QueueManager::initialize(Default::default(), None, &fallback)
            .await
            .unwrap();

        assert_eq!(manager.dispatch(), Dispatch::Pull);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_fails_when_no_backend_available() {
        let primary = Unreachable::new();
        let fallback = Unreachable::new();

        let result = QueueManager::initialize(Default::default(), Some(&primary), &fallback).await;

        assert_matches!(result, Err(QueueError::NoBackendAvailable { .. }));
        assert_eq!(fallback.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn add_job_and_report_status() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new()));

        let added = manager
            .add_job(
                "orcamento",
                "generate-pdf",
                serde_json::json!({"targetId": "o1"}),
                JobOptions::default().with_job_id("t1"),
            )
            .await
            .unwrap();
        let status = manager
            .job_status("orcamento", &JobId::from("t1"))
            .await
            .unwrap();

        assert_eq!(
            serde_json::to_value(&added).unwrap(),
            serde_json::json!({
                "success": true,
                "jobId": "t1",
                "queueName": "orcamento",
                "jobType": "generate-pdf",
            })
        );
        let report = serde_json::to_value(&status).unwrap();
        assert_eq!(report["exists"], serde_json::json!(true));
        assert_eq!(report["state"], serde_json::json!("pending"));
        assert_eq!(report["attemptsMade"], serde_json::json!(0));
        assert_eq!(status.state, Some(JobState::Pending));
        assert_eq!(status.name.as_deref(), Some("generate-pdf"));
        assert_eq!(status.data, Some(serde_json::json!({"targetId": "o1"})));
    }

    #[tokio::test]
    async fn explicit_job_id_is_idempotent() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new()));
        let options = JobOptions::default().with_job_id("t1");

        let first = manager
            .add_job("orcamento", "generate-pdf", 1, options.clone())
            .await
            .unwrap();
        let second = manager
            .add_job("orcamento", "send-sms", 2, options)
            .await
            .unwrap();

        assert_eq!(first.job_id, JobId::from("t1"));
        assert_eq!(second.job_id, first.job_id);
        assert_eq!(second.job_type, "generate-pdf");
        assert_eq!(
            manager
                .job_status("orcamento", &first.job_id)
                .await
                .unwrap()
                .data,
            Some(serde_json::json!(1))
        );
        assert_eq!(
            manager.queue_metrics("orcamento").await.unwrap().total,
            1
        );
    }

    #[tokio::test]
    async fn delayed_job_reports_delayed() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new()));

        let added = manager
            .add_job(
                "orcamento",
                "generate-pdf",
                (),
                JobOptions::default().with_delay(TimeDelta::minutes(5)),
            )
            .await
            .unwrap();

        assert_eq!(
            manager
                .job_status("orcamento", &added.job_id)
                .await
                .unwrap()
                .state,
            Some(JobState::Delayed)
        );
        assert!(manager.next_job("orcamento").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_job_reports_missing() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new()));

        let status = manager
            .job_status("orcamento", &JobId::from("nope"))
            .await
            .unwrap();

        assert_eq!(status, JobStatusReport::missing());
    }

    #[tokio::test]
    async fn pull_operations_rejected_by_push_backend() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new().push()));

        assert_matches!(
            manager.next_job("orcamento").await,
            Err(QueueError::Unsupported {
                operation: "claim_next_job",
                backend: "memory"
            })
        );
        assert_matches!(
            manager
                .complete_job(&JobId::from("x"), serde_json::Value::Null)
                .await,
            Err(QueueError::Unsupported { .. })
        );
        assert_matches!(
            manager.fail_job(&JobId::from("x"), "boom", true).await,
            Err(QueueError::Unsupported { .. })
        );
    }

    #[tokio::test]
    async fn subscribe_rejected_by_pull_backend() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new()));

        assert_matches!(
            manager
                .subscribe(
                    "orcamento",
                    Duration::from_millis(1),
                    CancellationToken::new()
                )
                .err(),
            Some(QueueError::Unsupported { .. })
        );
    }

    #[tokio::test]
    async fn closed_manager_rejects_calls() {
        let manager = QueueManager::new(Arc::new(InMemoryBackend::new()));
        manager.close().await.unwrap();

        assert_matches!(manager.close().await, Err(QueueError::Closed));
        assert_matches!(
            manager.add_job("orcamento", "generate-pdf", (), JobOptions::default()).await,
            Err(QueueError::Closed)
        );
        assert_matches!(
            manager.queue_metrics("orcamento").await,
            Err(QueueError::Closed)
        );
    }

    #[test]
    fn status_report_serializes_camel_case() {
        let report = serde_json::to_value(JobStatusReport::missing()).unwrap();

        assert_eq!(report["exists"], serde_json::json!(false));
        assert_eq!(report["attemptsMade"], serde_json::json!(0));
        assert!(report.get("failedReason").is_some());
    }
}

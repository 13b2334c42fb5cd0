//! Consumes jobs from the active backend and routes them to handlers by `job_type`.
//!
//! In pull mode the worker polls [`QueueManager::next_job`] on a fixed interval and executes at
//! most one job per tick. In push mode it holds `concurrency` subscriptions to the queue, all
//! sharing one [`RateLimiter`], and settles each [`Delivery`] with the handler's outcome.
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use futures::StreamExt;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backend::{Delivery, Dispatch, Outcome},
    handler::HandlerRegistry,
    job::{Job, JobId},
    manager::QueueManager,
    QueueError,
};

pub mod rate_limit;

pub use rate_limit::{RateLimit, RateLimiter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub queue: String,
    /// Pull mode only.
    pub poll_interval: Duration,
    /// Push mode only: the number of concurrent subscriptions.
    pub concurrency: usize,
    /// Push mode only.
    pub rate_limit: Option<RateLimit>,
    /// Push mode only: how long a single receive blocks before checking for shutdown.
    pub receive_timeout: Duration,
    /// Pull mode only: when set, jobs processing for longer than this are requeued every tick.
    pub stalled_after: Option<TimeDelta>,
}

impl WorkerConfig {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            poll_interval: Duration::from_secs(5),
            concurrency: 2,
            rate_limit: Some(RateLimit::per_minute(10)),
            receive_timeout: Duration::from_secs(1),
            stalled_after: None,
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_concurrency(self, concurrency: usize) -> Self {
        Self {
            concurrency,
            ..self
        }
    }

    pub fn with_rate_limit(self, rate_limit: Option<RateLimit>) -> Self {
        Self { rate_limit, ..self }
    }

    pub fn with_receive_timeout(self, receive_timeout: Duration) -> Self {
        Self {
            receive_timeout,
            ..self
        }
    }

    pub fn with_stalled_after(self, stalled_after: Option<TimeDelta>) -> Self {
        Self {
            stalled_after,
            ..self
        }
    }
}

#[derive(Debug)]
pub struct Worker {
    manager: Arc<QueueManager>,
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(manager: Arc<QueueManager>, registry: HandlerRegistry, config: WorkerConfig) -> Self {
        Self {
            manager,
            registry: Arc::new(registry),
            config,
        }
    }

    /// Run the worker until `cancellation_token` is cancelled.
    ///
    /// The returned handle resolves once in-flight jobs have finished.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        let worker = Arc::new(self);
        tokio::spawn(async move {
            match worker.manager.dispatch() {
                Dispatch::Pull => worker.run_pull(cancellation_token).await,
                Dispatch::Push => worker.run_push(cancellation_token).await,
            }
            tracing::debug!(queue = %worker.config.queue, "Shutting down worker");
        })
    }

    async fn run_pull(&self, cancellation_token: CancellationToken) {
        tracing::info!(
            queue = %self.config.queue,
            backend = self.manager.backend_name(),
            "Polling {} every {:?}",
            self.config.queue,
            self.config.poll_interval
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let _ = self.tick().await;
                }
                _ = cancellation_token.cancelled() => break,
            }
        }
    }

    async fn run_push(self: &Arc<Self>, cancellation_token: CancellationToken) {
        let limiter = self.config.rate_limit.map(|limit| Arc::new(RateLimiter::new(limit)));
        let concurrency = self.config.concurrency.max(1);
        tracing::info!(
            queue = %self.config.queue,
            backend = self.manager.backend_name(),
            concurrency,
            "Subscribing to {}",
            self.config.queue
        );
        let subscriptions = (0..concurrency).map(|subscription| {
            let worker = self.clone();
            let limiter = limiter.clone();
            let cancellation_token = cancellation_token.clone();
            tokio::spawn(
                async move { worker.consume(limiter, cancellation_token).await }
                    .instrument(tracing::debug_span!("subscription", subscription)),
            )
        });
        for result in futures::future::join_all(subscriptions).await {
            let _ = result.inspect_err(|error| {
                tracing::error!(?error, "Worker subscription terminated abnormally: {error}")
            });
        }
    }

    async fn consume(&self, limiter: Option<Arc<RateLimiter>>, cancellation_token: CancellationToken) {
        let mut stream = match self.manager.subscribe(
            &self.config.queue,
            self.config.receive_timeout,
            cancellation_token.clone(),
        ) {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(?error, "Failed to subscribe to {}: {error}", self.config.queue);
                return;
            }
        };
        while let Some(next) = stream.next().await {
            match next {
                Ok(delivery) => {
                    // The job is already ours; wait for a token rather than hand it back.
                    if let Some(limiter) = &limiter {
                        limiter.acquire().await;
                    }
                    self.settle(delivery).await
                }
                Err(error) => tracing::error!(?error, "Failed to receive job: {error}"),
            }
        }
    }

    async fn settle(&self, delivery: Delivery) {
        let outcome = self.execute(&delivery.job).await;
        let job_id = delivery.job.id.clone();
        let _ = delivery.settle(outcome).await.inspect_err(|error| {
            tracing::error!(?error, %job_id, "Failed to settle job {job_id}: {error}")
        });
    }

    /// Claim and run at most one job. Pull mode only.
    ///
    /// Queue errors are logged and returned; a handler failure is not an error here, it is
    /// recorded against the job.
    pub async fn tick(&self) -> Result<Option<JobId>, QueueError> {
        let queue = self.config.queue.as_str();
        if let Some(lease) = self.config.stalled_after {
            let requeued = self
                .manager
                .requeue_stalled(queue, lease)
                .await
                .inspect_err(|error| {
                    tracing::error!(?error, "Failed to requeue stalled jobs: {error}")
                })?;
            if requeued > 0 {
                tracing::warn!(requeued, "Requeued {requeued} stalled jobs in {queue}");
            }
        }

        let Some(job) = self.manager.next_job(queue).await.inspect_err(|error| {
            tracing::error!(?error, "Failed to claim next job from {queue}: {error}")
        })?
        else {
            return Ok(None);
        };

        let job_id = job.id.clone();
        match self.execute(&job).await {
            Outcome::Completed(result) => {
                self.manager
                    .complete_job(&job_id, result)
                    .await
                    .inspect_err(|error| {
                        tracing::error!(?error, %job_id, "Failed to mark job {job_id} as complete: {error}")
                    })?;
            }
            Outcome::Failed { error, retry } => {
                let status = self
                    .manager
                    .fail_job(&job_id, &error, retry)
                    .await
                    .inspect_err(|error| {
                        tracing::error!(?error, %job_id, "Failed to mark job {job_id} as failed: {error}")
                    })?;
                tracing::debug!(%job_id, %status, "Job {job_id} is now {status}");
            }
        }
        Ok(Some(job_id))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts + 1))]
    async fn execute(&self, job: &Job) -> Outcome {
        let Some(handler) = self.registry.get(&job.job_type) else {
            tracing::error!(
                job_type = %job.job_type,
                "No handler registered for job type {}, discarding",
                job.job_type
            );
            return Outcome::Failed {
                error: format!("no handler registered for job type `{}`", job.job_type),
                retry: false,
            };
        };

        tracing::debug!("Executing job {}", job.id);
        let result = tokio::spawn({
            let job = job.clone();
            async move { handler.handle(&job).await }.in_current_span()
        })
        .await;

        match result {
            Ok(Ok(value)) => {
                tracing::debug!("Job {} complete", job.id);
                Outcome::Completed(value)
            }
            Ok(Err(error)) => {
                let retry = error.is_retryable() && job.attempts + 1 < job.max_attempts;
                if retry {
                    tracing::warn!(%error, "Job {} failed and will be retried", job.id);
                } else {
                    tracing::error!(%error, "Job {} failed and will be discarded", job.id);
                }
                Outcome::Failed {
                    error: error.to_string(),
                    retry: error.is_retryable(),
                }
            }
            Err(error) => {
                let error = panic_message(error);
                tracing::error!(%error, "Job {} panicked", job.id);
                Outcome::Failed { error, retry: true }
            }
        }
    }
}

fn panic_message(error: JoinError) -> String {
    let message = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(message),
        Err(_) => message,
    }
}

//! A process local [`Backend`] holding jobs in a vector.
//!
//! Used by the conformance suite and by worker and manager tests. Jobs are lost on restart.
//! By default it behaves like a pull backend. [`InMemoryBackend::push`] turns it into a push
//! backend so workers can be exercised in either mode without external services.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tokio::sync::Notify;

use crate::{
    job::{transition::FailureTransition, Job, JobId, JobState, JobStatus},
    manager::Connect,
};

use super::{
    Backend, BackendError, Delivery, Dispatch, EnqueuableJob, Outcome, QueueMetrics, Settle,
};

/// Jobs kept behind a lock, scanned linearly on every claim.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    jobs: Arc<RwLock<Vec<Job>>>,
    dispatch: Dispatch,
    notify: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            jobs: Default::default(),
            dispatch: Dispatch::Pull,
            notify: Default::default(),
            closed: Default::default(),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver jobs to subscribers rather than letting workers claim them.
    pub fn push(self) -> Self {
        Self {
            dispatch: Dispatch::Push,
            ..self
        }
    }

    /// Move every scheduled retry `by` closer, as if that much time had passed.
    #[cfg(test)]
    pub(crate) fn fast_forward(&self, by: TimeDelta) -> Result<(), BackendError> {
        self.jobs
            .write()
            .map_err(|_| BackendError::BadState)?
            .iter_mut()
            .for_each(|job| job.next_attempt_at = job.next_attempt_at.map(|at| at - by));
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    fn ensure_dispatch(&self, dispatch: Dispatch, operation: &'static str) -> Result<(), BackendError> {
        self.ensure_open()?;
        if self.dispatch == dispatch {
            Ok(())
        } else {
            Err(BackendError::unsupported(operation, Backend::name(self)))
        }
    }

    fn claim(&self, queue: &str) -> Result<Option<Job>, BackendError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let next = jobs
            .iter_mut()
            .filter(|job| job.queue == queue && job.is_claimable_at(now))
            .min_by_key(|job| job.created_at);
        match next {
            None => Ok(None),
            Some(job) => {
                job.mark_job_processing(now)?;
                Ok(Some(job.clone()))
            }
        }
    }

    fn with_job<T>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut Job) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        match jobs.iter_mut().find(|job| &job.id == id) {
            None => Err(BackendError::JobNotFound(id.clone())),
            Some(job) => f(job),
        }
    }

    fn complete(&self, id: &JobId, result: serde_json::Value) -> Result<(), BackendError> {
        self.with_job(id, |job| job.mark_job_complete(result, Utc::now()))
    }

    fn fail(&self, id: &JobId, error: &str, should_retry: bool) -> Result<JobStatus, BackendError> {
        let transition =
            self.with_job(id, |job| job.mark_job_failed(error, should_retry, Utc::now()))?;
        if let FailureTransition::Retry { .. } = transition {
            self.notify.notify_waiters();
        }
        Ok(transition.status())
    }
}

struct InMemorySettle {
    backend: InMemoryBackend,
}

#[async_trait]
impl Settle for InMemorySettle {
    async fn settle(self: Box<Self>, job: &Job, outcome: Outcome) -> Result<(), BackendError> {
        match outcome {
            Outcome::Completed(result) => self.backend.complete(&job.id, result),
            Outcome::Failed { error, retry } => {
                self.backend.fail(&job.id, &error, retry).map(|_| ())
            }
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        self.ensure_open()?;
        let id = job.id.clone();
        {
            let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
            if jobs.iter().any(|existing| existing.id == id) {
                return Ok(id);
            }
            jobs.push(job.into_job(Utc::now()));
        }
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, BackendError> {
        self.ensure_open()?;
        Ok(self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .find(|job| job.queue == queue && &job.id == id)
            .cloned())
    }

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, BackendError> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut metrics = QueueMetrics::new(queue, 0, 0, 0, 0, 0);
        for job in self
            .jobs
            .read()
            .map_err(|_| BackendError::BadState)?
            .iter()
            .filter(|job| job.queue == queue)
        {
            let count = match job.state_at(now) {
                JobState::Pending => &mut metrics.waiting,
                JobState::Delayed => &mut metrics.delayed,
                JobState::Active => &mut metrics.active,
                JobState::Completed => &mut metrics.completed,
                JobState::Failed => &mut metrics.failed,
            };
            *count += 1;
            metrics.total += 1;
        }
        Ok(metrics)
    }

    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        self.ensure_open()?;
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| !(job.status.is_terminal() && job.updated_at < cutoff));
        Ok((before - jobs.len()) as u64)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim_next_job(&self, queue: &str) -> Result<Option<Job>, BackendError> {
        self.ensure_dispatch(Dispatch::Pull, "claim_next_job")?;
        self.claim(queue)
    }

    async fn mark_job_complete(
        &self,
        id: &JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        self.ensure_dispatch(Dispatch::Pull, "mark_job_complete")?;
        self.complete(id, result)
    }

    async fn mark_job_failed(
        &self,
        id: &JobId,
        error: &str,
        should_retry: bool,
    ) -> Result<JobStatus, BackendError> {
        self.ensure_dispatch(Dispatch::Pull, "mark_job_failed")?;
        self.fail(id, error, should_retry)
    }

    async fn requeue_stalled(&self, queue: &str, lease: TimeDelta) -> Result<u64, BackendError> {
        self.ensure_open()?;
        let now = Utc::now();
        let cutoff = now - lease;
        let mut requeued = 0;
        {
            let mut jobs = self.jobs.write().map_err(|_| BackendError::BadState)?;
            for job in jobs.iter_mut().filter(|job| {
                job.queue == queue && job.status == JobStatus::Processing && job.updated_at < cutoff
            }) {
                job.mark_job_failed("stalled: lease expired", true, now)?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.notify.notify_waiters();
        }
        Ok(requeued)
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BackendError> {
        self.ensure_dispatch(Dispatch::Push, "receive")?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(job) = self.claim(queue)? {
                return Ok(Some(Delivery::new(
                    job,
                    InMemorySettle {
                        backend: self.clone(),
                    },
                )));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            self.ensure_open()?;
        }
    }
}

#[async_trait]
impl Connect for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        self.ensure_open()?;
        Ok(Arc::new(self.clone()))
    }
}

use std::{sync::OnceLock, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fila::{
    backend::{
        Backend, BackendError, Delivery, Dispatch, EnqueuableJob, Outcome, QueueMetrics, Settle,
    },
    job::{transition::FailureTransition, Job, JobId},
};
use redis::{aio::ConnectionManager, AsyncCommands};
use tracing::instrument;

use crate::{
    keys::{NameSpacedKey, QueueKeys},
    map_err, map_pool_err,
    policy::Retention,
    RedisBackend, BACKEND_NAME,
};

/// Due delayed jobs moved back to the wait list per receive.
const PROMOTE_BATCH: isize = 100;

/// Shortest `BLMOVE` timeout; zero would block forever.
const MIN_BLOCK: Duration = Duration::from_millis(10);

/// Writes the record and places its id in one step, so a stored job is never left unqueued.
///
/// KEYS: job record, wait list, delayed set, queue registry.
/// ARGV: record, queue name, due time in millis (empty when ready now), job id.
const ENQUEUE_SCRIPT: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return 0
end
redis.call('SADD', KEYS[4], ARGV[2])
if ARGV[3] == '' then
  redis.call('LPUSH', KEYS[2], ARGV[4])
else
  redis.call('ZADD', KEYS[3], ARGV[3], ARGV[4])
end
return 1
"#;

/// Where a freshly enqueued job goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Wait,
    /// Scored by due time in millis.
    Delayed(i64),
}

impl Placement {
    fn of(job: &Job, now: DateTime<Utc>) -> Self {
        match job.next_attempt_at.filter(|at| *at > now) {
            Some(at) => Self::Delayed(at.timestamp_millis()),
            None => Self::Wait,
        }
    }

    fn score_arg(self) -> String {
        match self {
            Self::Wait => String::new(),
            Self::Delayed(score) => score.to_string(),
        }
    }
}

fn enqueue_invocation(
    keys: QueueKeys<'_>,
    queues: &str,
    job: &Job,
    record: &str,
    placement: Placement,
) -> redis::ScriptInvocation<'static> {
    static SCRIPT: OnceLock<redis::Script> = OnceLock::new();
    let mut invocation = SCRIPT
        .get_or_init(|| redis::Script::new(ENQUEUE_SCRIPT))
        .prepare_invoke();
    invocation
        .key(keys.job(&job.id))
        .key(keys.wait())
        .key(keys.delayed())
        .key(queues)
        .arg(record)
        .arg(&job.queue)
        .arg(placement.score_arg())
        .arg(job.id.as_str());
    invocation
}

/// Takes `id` off the active list and puts it back at the consuming end of the wait list.
fn requeue_pipe(keys: QueueKeys<'_>, id: &JobId) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic()
        .lrem(keys.active(), 1, id.as_str())
        .ignore()
        .rpush(keys.wait(), id.as_str())
        .ignore();
    pipe
}

/// `ZRANGE` stop index selecting everything but the newest `max_count` entries.
fn overflow_stop(max_count: usize) -> isize {
    -isize::try_from(max_count).unwrap_or(isize::MAX) - 1
}

impl RedisBackend {
    async fn load(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &JobId,
    ) -> Result<Option<Job>, BackendError> {
        let record: Option<String> = conn
            .get(self.namespace.queue(queue).job(id))
            .await
            .map_err(map_err)?;
        record
            .map(|record| serde_json::from_str(&record))
            .transpose()
            .map_err(Into::into)
    }

    async fn store(&self, conn: &mut ConnectionManager, job: &Job) -> Result<(), BackendError> {
        let _: () = conn
            .set(
                self.namespace.queue(&job.queue).job(&job.id),
                serde_json::to_string(job)?,
            )
            .await
            .map_err(map_err)?;
        Ok(())
    }

    /// Move due delayed jobs to the wait list. `ZREM` decides the winner when several receivers
    /// promote the same id.
    async fn promote_due(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, BackendError> {
        let keys = self.namespace.queue(queue);
        let due: Vec<String> = conn
            .zrangebyscore_limit(
                keys.delayed(),
                "-inf",
                now.timestamp_millis(),
                0,
                PROMOTE_BATCH,
            )
            .await
            .map_err(map_err)?;
        let mut promoted = 0;
        for id in due {
            let removed: u64 = conn.zrem(keys.delayed(), &id).await.map_err(map_err)?;
            if removed == 1 {
                let _: () = conn.lpush(keys.wait(), &id).await.map_err(map_err)?;
                promoted += 1;
            }
        }
        if promoted > 0 {
            tracing::debug!(queue, promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Turns an id just moved to the active list into a processing job. `None` means the id was
    /// unusable and has been dropped.
    async fn claim(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        id: &JobId,
    ) -> Result<Option<Job>, BackendError> {
        let keys = self.namespace.queue(queue);
        let loaded = match self.load(conn, queue, id).await {
            Err(BackendError::EncodeDecode(error)) => {
                tracing::warn!(?error, job_id = %id, queue, "Dropping unreadable job record");
                None
            }
            loaded => loaded?,
        };
        let Some(mut job) = loaded else {
            tracing::warn!(job_id = %id, queue, "Dropping id without a job record");
            let _: () = conn
                .lrem(keys.active(), 1, id.as_str())
                .await
                .map_err(map_err)?;
            return Ok(None);
        };
        if let Err(error) = job.mark_job_processing(Utc::now()) {
            tracing::warn!(?error, job_id = %id, queue, "Dropping job that is not pending");
            let _: () = conn
                .lrem(keys.active(), 1, id.as_str())
                .await
                .map_err(map_err)?;
            return Ok(None);
        }
        self.store(conn, &job).await?;
        tracing::debug!(job_id = %id, queue, "Delivering job");
        Ok(Some(job))
    }

    /// Drop the settled jobs of one retention set that fall outside `retention`.
    async fn trim(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        set: NameSpacedKey<'_>,
        retention: Retention,
        now: DateTime<Utc>,
    ) -> Result<u64, BackendError> {
        let mut expired: Vec<String> = conn
            .zrangebyscore(set, "-inf", retention.cutoff(now).timestamp_millis())
            .await
            .map_err(map_err)?;
        if let Some(max_count) = retention.max_count {
            let overflow: Vec<String> = conn
                .zrange(set, 0, overflow_stop(max_count))
                .await
                .map_err(map_err)?;
            expired.extend(overflow);
            expired.sort();
            expired.dedup();
        }
        if expired.is_empty() {
            return Ok(0);
        }

        let keys = self.namespace.queue(queue);
        let mut pipe = redis::pipe();
        pipe.atomic();
        for id in &expired {
            let id = JobId::from(id.as_str());
            pipe.del(keys.job(&id)).ignore();
        }
        pipe.zrem(set, &expired).ignore();
        let _: () = pipe.query_async(conn).await.map_err(map_err)?;
        Ok(expired.len() as u64)
    }

    #[instrument(skip(self, job, outcome), fields(job_id = %job.id))]
    async fn settle_job(&self, mut job: Job, outcome: Outcome) -> Result<(), BackendError> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let queue = job.queue.clone();
        let keys = self.namespace.queue(&queue);

        match outcome {
            Outcome::Completed(result) => {
                job.mark_job_complete(result, now)?;
                let _: () = redis::pipe()
                    .atomic()
                    .set(keys.job(&job.id), serde_json::to_string(&job)?)
                    .ignore()
                    .lrem(keys.active(), 1, job.id.as_str())
                    .ignore()
                    .zadd(keys.completed(), job.id.as_str(), now.timestamp_millis())
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(map_err)?;
                self.trim(&mut conn, &queue, keys.completed(), self.policy.completed, now)
                    .await?;
            }
            Outcome::Failed { error, retry } => match job.mark_job_failed(&error, retry, now)? {
                FailureTransition::Retry { attempts, .. } => {
                    let due = self.policy.retry_at(attempts, now);
                    job.next_attempt_at = Some(due);
                    tracing::warn!(attempts, %due, "Job failed, retry scheduled: {error}");
                    let _: () = redis::pipe()
                        .atomic()
                        .set(keys.job(&job.id), serde_json::to_string(&job)?)
                        .ignore()
                        .lrem(keys.active(), 1, job.id.as_str())
                        .ignore()
                        .zadd(keys.delayed(), job.id.as_str(), due.timestamp_millis())
                        .ignore()
                        .query_async(&mut conn)
                        .await
                        .map_err(map_err)?;
                }
                FailureTransition::Discard { attempts } => {
                    tracing::error!(attempts, "Job failed permanently: {error}");
                    let _: () = redis::pipe()
                        .atomic()
                        .set(keys.job(&job.id), serde_json::to_string(&job)?)
                        .ignore()
                        .lrem(keys.active(), 1, job.id.as_str())
                        .ignore()
                        .zadd(keys.failed(), job.id.as_str(), now.timestamp_millis())
                        .ignore()
                        .query_async(&mut conn)
                        .await
                        .map_err(map_err)?;
                    self.trim(&mut conn, &queue, keys.failed(), self.policy.failed, now)
                        .await?;
                }
            },
        }
        Ok(())
    }
}

/// Settles a job delivered by [`RedisBackend::receive`].
struct RedisSettle {
    backend: RedisBackend,
}

#[async_trait]
impl Settle for RedisSettle {
    async fn settle(self: Box<Self>, job: &Job, outcome: Outcome) -> Result<(), BackendError> {
        self.backend.settle_job(job.clone(), outcome).await
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::Push
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let job = job.into_job(now);
        let record = serde_json::to_string(&job)?;
        let queues = self.namespace.queues();

        let created: bool = enqueue_invocation(
            self.namespace.queue(&job.queue),
            &queues,
            &job,
            &record,
            Placement::of(&job, now),
        )
        .invoke_async(&mut conn)
        .await
        .map_err(map_err)?;
        if !created {
            tracing::debug!("Job already exists, skipping enqueue");
        }
        Ok(job.id)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, BackendError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        Ok(self
            .load(&mut conn, queue, id)
            .await?
            .filter(|job| job.queue == queue))
    }

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, BackendError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        let keys = self.namespace.queue(queue);
        let (waiting, active, completed, failed, delayed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .llen(keys.wait())
                .llen(keys.active())
                .zcard(keys.completed())
                .zcard(keys.failed())
                .zcard(keys.delayed())
                .query_async(&mut conn)
                .await
                .map_err(map_err)?;
        Ok(QueueMetrics::new(
            queue, waiting, active, completed, failed, delayed,
        ))
    }

    #[instrument(skip(self))]
    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        self.ensure_open()?;
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let queues: Vec<String> = conn
            .smembers(self.namespace.queues())
            .await
            .map_err(map_err)?;
        let retention = Retention::age(older_than);
        let mut pruned = 0;
        for queue in &queues {
            let keys = self.namespace.queue(queue);
            pruned += self
                .trim(&mut conn, queue, keys.completed(), retention, now)
                .await?;
            pruned += self
                .trim(&mut conn, queue, keys.failed(), retention, now)
                .await?;
        }
        Ok(pruned)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.closed.store(true, std::sync::atomic::Ordering::Release);
        self.blocking.close();
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BackendError> {
        self.ensure_open()?;
        let mut conn = self.conn.clone();
        self.promote_due(&mut conn, queue, Utc::now()).await?;

        let keys = self.namespace.queue(queue);
        let mut blocking = self.blocking.get().await.map_err(map_pool_err)?;
        let id: Option<String> = redis::cmd("BLMOVE")
            .arg(keys.wait())
            .arg(keys.active())
            .arg("RIGHT")
            .arg("LEFT")
            .arg(wait.max(MIN_BLOCK).as_secs_f64())
            .query_async(&mut blocking)
            .await
            .map_err(map_err)?;
        drop(blocking);
        let Some(id) = id else {
            return Ok(None);
        };

        let id = JobId::from(id);
        match self.claim(&mut conn, queue, &id).await {
            Ok(Some(job)) => Ok(Some(Delivery::new(
                job,
                RedisSettle {
                    backend: self.clone(),
                },
            ))),
            Ok(None) => Ok(None),
            Err(error) => {
                tracing::warn!(?error, job_id = %id, queue, "Returning job to the wait list");
                let requeued: Result<(), _> =
                    requeue_pipe(keys, &id).query_async(&mut conn).await;
                if let Err(requeue_error) = requeued {
                    tracing::error!(
                        ?requeue_error,
                        job_id = %id,
                        queue,
                        "Job left on the active list"
                    );
                }
                Err(error)
            }
        }
    }
}

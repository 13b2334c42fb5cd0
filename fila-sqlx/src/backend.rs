use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use fila::{
    backend::{Backend, BackendError, Dispatch, EnqueuableJob, QueueMetrics},
    job::{
        transition::{on_failure, FailureTransition},
        Job, JobId, JobStatus,
    },
};
use sqlx::{Postgres, Transaction};
use tracing::instrument;

use crate::{
    map_err,
    types::{attempts, parse_status, AttemptRow, JobRow, MetricsRow, JOB_COLUMNS},
    PgBackend, BACKEND_NAME,
};

/// Matches the rows whose `tipo` belongs to the queue bound at `$1`.
const IN_QUEUE: &str = "starts_with(tipo, $1 || ':')";

impl PgBackend {
    async fn insert_job(&self, job: &EnqueuableJob, now: DateTime<Utc>) -> sqlx::Result<u64> {
        sqlx::query(
            r#"INSERT INTO fila_jobs (
                job_id,
                tipo,
                payload,
                status,
                attempts,
                max_attempts,
                proxima_tentativa,
                criado_em,
                atualizado_em
            ) VALUES ($1, $2, $3, 'pending', 0, $4, $5, $6, $6)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.id.as_str())
        .bind(format!("{}:{}", job.queue, job.job_type))
        .bind(&job.payload)
        .bind(i32::from(job.max_attempts))
        .bind(job.scheduled_at)
        .bind(now)
        .execute(self.deref())
        .await
        .map(|result| result.rows_affected())
    }

    async fn load_job(&self, queue: &str, id: &JobId) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM fila_jobs WHERE {IN_QUEUE} AND job_id = $2"
        ))
        .bind(queue)
        .bind(id.as_str())
        .fetch_optional(self.deref())
        .await
    }

    async fn load_job_mark_as_processing(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<Option<JobRow>> {
        let mut tx = self.begin().await?;
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"UPDATE fila_jobs
            SET
                status = 'processing',
                atualizado_em = $2
            WHERE id IN (
                SELECT id
                FROM fila_jobs
                WHERE {IN_QUEUE}
                    AND status = 'pending'
                    AND attempts < max_attempts
                    AND (proxima_tentativa IS NULL OR proxima_tentativa <= $2)
                ORDER BY criado_em, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(queue)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn mark_completed(
        &self,
        id: &JobId,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> sqlx::Result<u64> {
        sqlx::query(
            r#"UPDATE fila_jobs
            SET
                status = 'completed',
                resultado = $2,
                processado_em = $3,
                atualizado_em = $3
            WHERE job_id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.as_str())
        .bind(result)
        .bind(now)
        .execute(self.deref())
        .await
        .map(|result| result.rows_affected())
    }

    async fn load_status(&self, id: &JobId) -> sqlx::Result<Option<String>> {
        sqlx::query_scalar("SELECT status FROM fila_jobs WHERE job_id = $1")
            .bind(id.as_str())
            .fetch_optional(self.deref())
            .await
    }

    async fn lock_attempts(
        tx: &mut Transaction<'_, Postgres>,
        id: &JobId,
    ) -> sqlx::Result<Option<AttemptRow>> {
        sqlx::query_as::<_, AttemptRow>(
            r#"SELECT job_id, status, attempts, max_attempts
            FROM fila_jobs
            WHERE job_id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&mut **tx)
        .await
    }

    async fn lock_stalled(
        tx: &mut Transaction<'_, Postgres>,
        queue: &str,
        stalled_since: DateTime<Utc>,
    ) -> sqlx::Result<Vec<AttemptRow>> {
        sqlx::query_as::<_, AttemptRow>(&format!(
            r#"SELECT job_id, status, attempts, max_attempts
            FROM fila_jobs
            WHERE {IN_QUEUE}
                AND status = 'processing'
                AND atualizado_em < $2
            FOR UPDATE SKIP LOCKED
            "#
        ))
        .bind(queue)
        .bind(stalled_since)
        .fetch_all(&mut **tx)
        .await
    }

    async fn record_failure(
        tx: &mut Transaction<'_, Postgres>,
        id: &str,
        error: &str,
        transition: FailureTransition,
        now: DateTime<Utc>,
    ) -> sqlx::Result<u64> {
        let query = match transition {
            FailureTransition::Retry {
                attempts,
                next_attempt_at,
            } => sqlx::query(
                r#"UPDATE fila_jobs
                SET
                    status = 'pending',
                    attempts = $2,
                    erro = $3,
                    proxima_tentativa = $4,
                    atualizado_em = $5
                WHERE job_id = $1
                "#,
            )
            .bind(id)
            .bind(i32::from(attempts))
            .bind(error)
            .bind(next_attempt_at)
            .bind(now),
            FailureTransition::Discard { attempts } => sqlx::query(
                r#"UPDATE fila_jobs
                SET
                    status = 'failed',
                    attempts = $2,
                    erro = $3,
                    processado_em = $4,
                    atualizado_em = $4
                WHERE job_id = $1
                "#,
            )
            .bind(id)
            .bind(i32::from(attempts))
            .bind(error)
            .bind(now),
        };
        query
            .execute(&mut **tx)
            .await
            .map(|result| result.rows_affected())
    }

    async fn metrics(&self, queue: &str, now: DateTime<Utc>) -> sqlx::Result<MetricsRow> {
        sqlx::query_as::<_, MetricsRow>(&format!(
            r#"SELECT
                COUNT(*) FILTER (
                    WHERE status = 'pending'
                        AND (proxima_tentativa IS NULL OR proxima_tentativa <= $2)
                ) AS waiting,
                COUNT(*) FILTER (WHERE status = 'processing') AS active,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (
                    WHERE status = 'pending' AND proxima_tentativa > $2
                ) AS delayed
            FROM fila_jobs
            WHERE {IN_QUEUE}
            "#
        ))
        .bind(queue)
        .bind(now)
        .fetch_one(self.deref())
        .await
    }

    async fn delete_terminal_jobs(&self, before: DateTime<Utc>) -> sqlx::Result<u64> {
        sqlx::query(
            r#"DELETE FROM fila_jobs
            WHERE status IN ('completed', 'failed')
                AND atualizado_em < $1
            "#,
        )
        .bind(before)
        .execute(self.deref())
        .await
        .map(|result| result.rows_affected())
    }

    /// Explain why a guarded update touched no rows.
    async fn transition_error(&self, id: &JobId) -> BackendError {
        match self.load_status(id).await {
            Ok(None) => BackendError::JobNotFound(id.clone()),
            Ok(Some(status)) => match parse_status(&status) {
                Ok(status) => BackendError::InvalidTransition {
                    id: id.clone(),
                    status,
                },
                Err(error) => error,
            },
            Err(error) => map_err(error),
        }
    }
}

fn handle_update(result: sqlx::Result<u64>, id: &JobId) -> Result<(), BackendError> {
    match result {
        Ok(0) => Err(BackendError::JobNotFound(id.clone())),
        Ok(1) => Ok(()),
        Ok(_) => Err(BackendError::BadState),
        Err(error) => Err(map_err(error)),
    }
}

#[async_trait]
impl Backend for PgBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::Pull
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let inserted = self
            .insert_job(&job, Utc::now())
            .await
            .map_err(map_err)?;
        if inserted == 0 {
            tracing::debug!(job_id = %job.id, "Job already exists, skipping insert");
        }
        Ok(job.id)
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> Result<Option<Job>, BackendError> {
        self.load_job(queue, id)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn queue_metrics(&self, queue: &str) -> Result<QueueMetrics, BackendError> {
        let row = self.metrics(queue, Utc::now()).await.map_err(map_err)?;
        let count = |value: i64| {
            u64::try_from(value).map_err(|error| {
                tracing::error!(?error, value, "Negative job count");
                BackendError::BadState
            })
        };
        Ok(QueueMetrics::new(
            queue,
            count(row.waiting)?,
            count(row.active)?,
            count(row.completed)?,
            count(row.failed)?,
            count(row.delayed)?,
        ))
    }

    async fn prune_jobs(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        self.delete_terminal_jobs(Utc::now() - older_than)
            .await
            .map_err(map_err)
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.pool.close().await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn claim_next_job(&self, queue: &str) -> Result<Option<Job>, BackendError> {
        self.load_job_mark_as_processing(queue, Utc::now())
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    #[instrument(skip(self, result))]
    async fn mark_job_complete(
        &self,
        id: &JobId,
        result: serde_json::Value,
    ) -> Result<(), BackendError> {
        let updated = self.mark_completed(id, &result, Utc::now()).await;
        match handle_update(updated, id) {
            Err(BackendError::JobNotFound(_)) => Err(self.transition_error(id).await),
            other => other,
        }
        .inspect_err(|error| tracing::error!(?error, job_id = %id, "Failed to complete job"))
    }

    #[instrument(skip(self))]
    async fn mark_job_failed(
        &self,
        id: &JobId,
        error: &str,
        should_retry: bool,
    ) -> Result<JobStatus, BackendError> {
        let now = Utc::now();
        let mut tx = self.begin().await.map_err(map_err)?;
        let row = Self::lock_attempts(&mut tx, id)
            .await
            .map_err(map_err)?
            .ok_or_else(|| BackendError::JobNotFound(id.clone()))?;
        let status = parse_status(&row.status)?;
        if status != JobStatus::Processing {
            return Err(BackendError::InvalidTransition {
                id: id.clone(),
                status,
            });
        }
        let transition = on_failure(
            attempts(row.attempts)?,
            attempts(row.max_attempts)?,
            should_retry,
            now,
        );
        let updated = Self::record_failure(&mut tx, &row.job_id, error, transition, now).await;
        handle_update(updated, id)?;
        tx.commit().await.map_err(map_err)?;
        Ok(transition.status())
    }

    #[instrument(skip(self))]
    async fn requeue_stalled(&self, queue: &str, lease: TimeDelta) -> Result<u64, BackendError> {
        let now = Utc::now();
        let mut tx = self.begin().await.map_err(map_err)?;
        let stalled = Self::lock_stalled(&mut tx, queue, now - lease)
            .await
            .map_err(map_err)?;
        for row in &stalled {
            let transition = on_failure(
                attempts(row.attempts)?,
                attempts(row.max_attempts)?,
                true,
                now,
            );
            tracing::warn!(job_id = %row.job_id, ?transition, "Requeueing stalled job");
            let updated =
                Self::record_failure(&mut tx, &row.job_id, "job stalled", transition, now).await;
            handle_update(updated, &JobId::from(row.job_id.as_str()))?;
        }
        tx.commit().await.map_err(map_err)?;
        Ok(stalled.len() as u64)
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use assert_matches::assert_matches;
    use sqlx::PgPool;

    use super::*;

    fila::test_suite!(
        attrs: [
            sqlx::test(migrations = "./migrations"),
            ignore = "requires a postgres database"
        ],
        args: (pool: PgPool),
        backend: PgBackend::from_pool(pool)
    );

    fn job(queue: &str) -> EnqueuableJob {
        EnqueuableJob {
            id: JobId::generate(),
            queue: queue.to_owned(),
            job_type: "generate-pdf".to_owned(),
            payload: serde_json::json!({"orcamentoId": 7}),
            max_attempts: 3,
            scheduled_at: None,
        }
    }

    #[test]
    fn handle_update_maps_row_counts() {
        let id = JobId::from("a");
        assert_matches!(handle_update(Ok(1), &id), Ok(()));
        assert_matches!(
            handle_update(Ok(0), &id),
            Err(BackendError::JobNotFound(_))
        );
        assert_matches!(handle_update(Ok(2), &id), Err(BackendError::BadState));
        assert_matches!(
            handle_update(Err(sqlx::Error::PoolClosed), &id),
            Err(BackendError::Closed)
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn row_layout_matches_table(pool: PgPool) {
        let backend = PgBackend::from(pool.clone());
        let id = backend.enqueue(job("orcamento")).await.unwrap();

        let (tipo, status, attempts): (String, String, i32) =
            sqlx::query_as("SELECT tipo, status, attempts FROM fila_jobs WHERE job_id = $1")
                .bind(id.as_str())
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(tipo, "orcamento:generate-pdf");
        assert_eq!(status, "pending");
        assert_eq!(attempts, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn queue_prefix_does_not_leak(pool: PgPool) {
        let backend = PgBackend::from(pool);
        backend.enqueue(job("orcamento-urgente")).await.unwrap();

        assert!(backend.claim_next_job("orcamento").await.unwrap().is_none());
        assert_eq!(backend.queue_metrics("orcamento").await.unwrap().total, 0);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn concurrent_workers_never_share_a_job(pool: PgPool) {
        let backend = PgBackend::from(pool);
        let mut enqueued = HashSet::new();
        for _ in 0..40 {
            enqueued.insert(backend.enqueue(job("orcamento")).await.unwrap());
        }

        let workers = (0..8).map(|_| {
            let backend = backend.clone();
            tokio::spawn(async move {
                let mut claimed = vec![];
                while let Some(job) = backend.claim_next_job("orcamento").await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            })
        });
        let claimed = futures::future::join_all(workers)
            .await
            .into_iter()
            .flat_map(|result| result.unwrap())
            .collect::<Vec<_>>();

        assert_eq!(claimed.len(), 40);
        assert_eq!(claimed.into_iter().collect::<HashSet<_>>(), enqueued);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires a postgres database"]
    async fn closed_backend_reports_closed(pool: PgPool) {
        let backend = PgBackend::from(pool);
        backend.close().await.unwrap();

        assert_matches!(
            backend.enqueue(job("orcamento")).await,
            Err(BackendError::Closed)
        );
    }
}

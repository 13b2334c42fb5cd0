use chrono::{DateTime, Utc};
use fila::{
    backend::BackendError,
    job::{Job, JobStatus},
};
use sqlx::prelude::FromRow;

pub(crate) const JOB_COLUMNS: &str = r#"
    job_id,
    tipo,
    payload,
    status,
    attempts,
    max_attempts,
    proxima_tentativa,
    resultado,
    erro,
    criado_em,
    atualizado_em,
    processado_em
"#;

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub job_id: String,
    pub tipo: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
    pub proxima_tentativa: Option<DateTime<Utc>>,
    pub resultado: Option<serde_json::Value>,
    pub erro: Option<String>,
    pub criado_em: DateTime<Utc>,
    pub atualizado_em: DateTime<Utc>,
    pub processado_em: Option<DateTime<Utc>>,
}

/// The row lock taken before recording a failed attempt.
#[derive(Debug, FromRow)]
pub(crate) struct AttemptRow {
    pub job_id: String,
    pub status: String,
    pub attempts: i32,
    pub max_attempts: i32,
}

#[derive(Debug, FromRow)]
pub(crate) struct MetricsRow {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

/// Split `queue:job_type` at the last separator; job types never contain `:`.
pub(crate) fn split_type_key(tipo: &str) -> Result<(&str, &str), BackendError> {
    tipo.rsplit_once(':').ok_or_else(|| {
        tracing::error!(tipo, "Malformed job type key {tipo}");
        BackendError::BadState
    })
}

pub(crate) fn parse_status(status: &str) -> Result<JobStatus, BackendError> {
    status.parse().map_err(|error| {
        tracing::error!(?error, "Unexpected job status in database: {error}");
        BackendError::BadState
    })
}

pub(crate) fn attempts(value: i32) -> Result<u16, BackendError> {
    u16::try_from(value).map_err(|error| {
        tracing::error!(?error, value, "Attempt count out of range");
        BackendError::BadState
    })
}

impl TryFrom<JobRow> for Job {
    type Error = BackendError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        let (queue, job_type) = split_type_key(&value.tipo)?;
        Ok(Self {
            queue: queue.to_owned(),
            job_type: job_type.to_owned(),
            id: value.job_id.into(),
            payload: value.payload,
            status: parse_status(&value.status)?,
            attempts: attempts(value.attempts)?,
            max_attempts: attempts(value.max_attempts)?,
            next_attempt_at: value.proxima_tentativa,
            result: value.resultado,
            last_error: value.erro,
            created_at: value.criado_em,
            updated_at: value.atualizado_em,
            processed_at: value.processado_em,
        })
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use fila::job::JobId;

    use super::*;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            job_id: "t1".to_owned(),
            tipo: "orcamento:generate-pdf".to_owned(),
            payload: serde_json::json!({"orcamentoId": 42}),
            status: "processing".to_owned(),
            attempts: 1,
            max_attempts: 3,
            proxima_tentativa: None,
            resultado: None,
            erro: Some("timeout".to_owned()),
            criado_em: now,
            atualizado_em: now,
            processado_em: None,
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = Job::try_from(row()).unwrap();

        assert_eq!(job.id, JobId::from("t1"));
        assert_eq!(job.queue, "orcamento");
        assert_eq!(job.job_type, "generate-pdf");
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn queue_names_may_contain_separator() {
        let job = Job::try_from(JobRow {
            tipo: "clinica:orcamento:generate-pdf".to_owned(),
            ..row()
        })
        .unwrap();

        assert_eq!(job.queue, "clinica:orcamento");
        assert_eq!(job.job_type, "generate-pdf");
    }

    #[test]
    fn malformed_rows_are_bad_state() {
        assert_matches!(
            Job::try_from(JobRow {
                tipo: "no-separator".to_owned(),
                ..row()
            }),
            Err(BackendError::BadState)
        );
        assert_matches!(
            Job::try_from(JobRow {
                status: "executing".to_owned(),
                ..row()
            }),
            Err(BackendError::BadState)
        );
        assert_matches!(
            Job::try_from(JobRow {
                attempts: -1,
                ..row()
            }),
            Err(BackendError::BadState)
        );
    }
}

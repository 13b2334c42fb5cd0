//! The job record and the types describing its lifecycle.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod transition;

/// The default maximum number of attempts for a job when none is given in [`JobOptions`].
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

/// Opaque identifier of a job.
///
/// Callers may supply their own identifier through [`JobOptions::with_job_id`], which makes
/// submission idempotent by id. Otherwise a UUID v4 is generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The persisted status of a job.
///
/// [`JobStatus::Completed`] and [`JobStatus::Failed`] are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("Unknown job status `{0}`")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// The state of a job as reported by the uniform status surface.
///
/// This is independent of which backend is active: a pending job whose next attempt lies in the
/// future is [`JobState::Delayed`], otherwise [`JobState::Pending`]. Queue metrics count the
/// latter as `waiting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// One unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    /// Owned by the handler; never inspected by the queue.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u16,
    pub max_attempts: u16,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The composite `queue:job_type` key under which the job is stored.
    pub fn type_key(&self) -> String {
        type_key(&self.queue, &self.job_type)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match self.status {
            JobStatus::Pending => match self.next_attempt_at {
                Some(at) if at > now => JobState::Delayed,
                _ => JobState::Pending,
            },
            JobStatus::Processing => JobState::Active,
            JobStatus::Completed => JobState::Completed,
            JobStatus::Failed => JobState::Failed,
        }
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending
            && self.attempts < self.max_attempts
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

pub fn type_key(queue: &str, job_type: &str) -> String {
    format!("{queue}:{job_type}")
}

/// Per-job options accepted by [`crate::QueueManager::add_job`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    pub job_id: Option<JobId>,
    pub attempts: Option<u16>,
    pub delay: Option<TimeDelta>,
}

impl JobOptions {
    pub fn with_job_id(self, job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..self
        }
    }

    pub fn with_attempts(self, attempts: u16) -> Self {
        Self {
            attempts: Some(attempts),
            ..self
        }
    }

    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self {
            delay: Some(delay),
            ..self
        }
    }
}

//! The job state machine.
//!
//! ```text
//! pending --claim--> processing --success--> completed
//!                    processing --failure, retries remain--> pending
//!                    processing --failure, exhausted or non-retryable--> failed
//! ```
//!
//! Nothing leaves `completed` or `failed`. Backends that keep jobs in memory apply these methods
//! directly; the SQL backend encodes the same guards in its `WHERE` clauses and uses
//! [`on_failure`] to decide between retry and discard.
use chrono::{DateTime, Utc};

use crate::{
    backend::BackendError,
    backoff::{Strategy, RETRY_BACKOFF},
};

use super::{Job, JobStatus};

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureTransition {
    /// Back to `pending`, eligible again at `next_attempt_at`.
    Retry {
        attempts: u16,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal.
    Discard { attempts: u16 },
}

impl FailureTransition {
    pub fn status(&self) -> JobStatus {
        match self {
            Self::Retry { .. } => JobStatus::Pending,
            Self::Discard { .. } => JobStatus::Failed,
        }
    }
}

/// Decide the outcome of a failed attempt given the attempts made before it.
pub fn on_failure(
    attempts: u16,
    max_attempts: u16,
    should_retry: bool,
    now: DateTime<Utc>,
) -> FailureTransition {
    let attempts = attempts.saturating_add(1);
    if !should_retry || attempts >= max_attempts {
        FailureTransition::Discard { attempts }
    } else {
        FailureTransition::Retry {
            attempts,
            next_attempt_at: now + RETRY_BACKOFF.backoff(attempts),
        }
    }
}

impl Job {
    fn ensure_status(&self, expected: JobStatus) -> Result<(), BackendError> {
        if self.status == expected {
            Ok(())
        } else {
            Err(BackendError::InvalidTransition {
                id: self.id.clone(),
                status: self.status,
            })
        }
    }

    pub fn mark_job_processing(&mut self, now: DateTime<Utc>) -> Result<(), BackendError> {
        self.ensure_status(JobStatus::Pending)?;
        self.status = JobStatus::Processing;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_job_complete(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.ensure_status(JobStatus::Processing)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.processed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_job_failed(
        &mut self,
        error: &str,
        should_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<FailureTransition, BackendError> {
        self.ensure_status(JobStatus::Processing)?;
        let transition = on_failure(self.attempts, self.max_attempts, should_retry, now);
        match transition {
            FailureTransition::Retry {
                attempts,
                next_attempt_at,
            } => {
                self.attempts = attempts;
                self.next_attempt_at = Some(next_attempt_at);
            }
            FailureTransition::Discard { attempts } => {
                self.attempts = attempts;
                self.processed_at = Some(now);
            }
        }
        self.status = transition.status();
        self.last_error = Some(error.to_owned());
        self.updated_at = now;
        Ok(transition)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn retryable_failure_schedules_backoff() {
        let now = Utc::now();

        assert_eq!(
            on_failure(0, 3, true, now),
            FailureTransition::Retry {
                attempts: 1,
                next_attempt_at: now + TimeDelta::seconds(2)
            }
        );
        assert_eq!(
            on_failure(1, 3, true, now),
            FailureTransition::Retry {
                attempts: 2,
                next_attempt_at: now + TimeDelta::seconds(4)
            }
        );
    }

    #[test]
    fn final_attempt_discards() {
        assert_eq!(
            on_failure(2, 3, true, Utc::now()),
            FailureTransition::Discard { attempts: 3 }
        );
    }

    #[test]
    fn non_retryable_failure_discards_immediately() {
        assert_eq!(
            on_failure(0, 3, false, Utc::now()),
            FailureTransition::Discard { attempts: 1 }
        );
    }

    #[test]
    fn n_failures_end_in_failed_with_n_attempts() {
        for max_attempts in 1..=6 {
            let mut job = Job {
                max_attempts,
                ..Job::raw_job()
            };
            let mut now = Utc::now();
            for _ in 0..max_attempts {
                if let Some(at) = job.next_attempt_at {
                    now = at;
                }
                assert!(job.is_claimable_at(now));
                job.mark_job_processing(now).unwrap();
                job.mark_job_failed("boom", true, now).unwrap();
            }

            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.attempts, max_attempts);
            assert_eq!(job.last_error.as_deref(), Some("boom"));
        }
    }

    #[test]
    fn terminal_states_are_immutable() {
        let now = Utc::now();
        let mut job = Job::raw_job();
        job.mark_job_processing(now).unwrap();
        job.mark_job_complete(serde_json::json!({"url": "x"}), now)
            .unwrap();

        assert_matches!(
            job.mark_job_failed("late", true, now),
            Err(BackendError::InvalidTransition {
                status: JobStatus::Completed,
                ..
            })
        );
        assert_matches!(
            job.mark_job_processing(now),
            Err(BackendError::InvalidTransition { .. })
        );
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.last_error, None);
    }

    #[test]
    fn completing_a_pending_job_is_rejected() {
        let mut job = Job::raw_job();

        assert_matches!(
            job.mark_job_complete(serde_json::Value::Null, Utc::now()),
            Err(BackendError::InvalidTransition {
                status: JobStatus::Pending,
                ..
            })
        );
    }
}

use chrono::{DateTime, TimeDelta, Utc};
use fila::backoff::{BackoffStrategy, Exponential, Strategy, BROKER_RETRY_BACKOFF};

/// How long settled jobs are kept in a retention set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub max_age: TimeDelta,
    /// Keep at most this many of the most recent jobs.
    pub max_count: Option<usize>,
}

impl Retention {
    pub const fn age(max_age: TimeDelta) -> Self {
        Self {
            max_age,
            max_count: None,
        }
    }

    pub const fn with_max_count(self, max_count: usize) -> Self {
        Self {
            max_count: Some(max_count),
            ..self
        }
    }

    pub(crate) fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.max_age
    }
}

/// Per queue settings applied by the broker.
///
/// The attempt limit travels with each job (see [`fila::job::JobOptions::with_attempts`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub backoff: BackoffStrategy<Exponential>,
    pub completed: Retention,
    pub failed: Retention,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            backoff: BROKER_RETRY_BACKOFF,
            completed: Retention::age(TimeDelta::hours(24)).with_max_count(100),
            failed: Retention::age(TimeDelta::days(7)),
        }
    }
}

impl QueuePolicy {
    pub fn with_backoff(self, backoff: BackoffStrategy<Exponential>) -> Self {
        Self { backoff, ..self }
    }

    pub fn with_completed_retention(self, completed: Retention) -> Self {
        Self { completed, ..self }
    }

    pub fn with_failed_retention(self, failed: Retention) -> Self {
        Self { failed, ..self }
    }

    /// When the retry following attempt number `attempts` becomes due.
    pub fn retry_at(&self, attempts: u16, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.backoff.backoff(attempts)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = QueuePolicy::default();

        assert_eq!(policy.completed.max_age, TimeDelta::hours(24));
        assert_eq!(policy.completed.max_count, Some(100));
        assert_eq!(policy.failed.max_age, TimeDelta::days(7));
        assert_eq!(policy.failed.max_count, None);
    }

    #[test]
    fn retries_back_off_exponentially_from_two_seconds() {
        let policy = QueuePolicy::default();
        let now = Utc::now();

        assert_eq!(policy.retry_at(1, now), now + TimeDelta::seconds(2));
        assert_eq!(policy.retry_at(2, now), now + TimeDelta::seconds(4));
        assert_eq!(policy.retry_at(3, now), now + TimeDelta::seconds(8));
    }
}

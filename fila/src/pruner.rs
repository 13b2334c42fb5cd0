//! The API for configuring the retention sweep.
//!
//! Completed and failed jobs are kept so their status stays queryable. The pruner deletes them
//! once they are older than the retention threshold, on a [`cron::Schedule`].
//!
//! # Example
//!
//! To remove terminal jobs older than two weeks every night at 03:00:
//!
//! ```
//! use chrono::TimeDelta;
//! use fila::pruner::PrunerConfig;
//!
//! let config = PrunerConfig::from_cron("0 0 3 * * *")
//!     .unwrap()
//!     .with_retention(TimeDelta::days(14));
//! assert_eq!(config.retention(), TimeDelta::days(14));
//! ```
use std::str::FromStr;

use chrono::TimeDelta;

pub(crate) mod runner;

pub use runner::PrunerRunner;

/// Runs every day at 03:00 UTC.
pub const DEFAULT_SCHEDULE: &str = "0 0 3 * * *";

/// How long terminal jobs are kept by default.
pub const DEFAULT_RETENTION: TimeDelta = TimeDelta::days(7);

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: cron::Schedule,
    older_than: TimeDelta,
}

impl PrunerConfig {
    /// Sweep on `schedule`, keeping terminal jobs for [`DEFAULT_RETENTION`].
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            older_than: DEFAULT_RETENTION,
        }
    }

    pub fn from_cron(expression: &str) -> Result<Self, cron::error::Error> {
        Ok(Self::new(cron::Schedule::from_str(expression)?))
    }

    /// Terminal jobs last updated more than `older_than` ago are deleted.
    pub fn with_retention(mut self, older_than: TimeDelta) -> Self {
        self.older_than = older_than;
        self
    }

    pub fn retention(&self) -> TimeDelta {
        self.older_than
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_runs_daily_with_week_retention() {
        let config = PrunerConfig::from_cron(DEFAULT_SCHEDULE).unwrap();

        assert_eq!(config.retention(), TimeDelta::days(7));
        let mut upcoming = config.schedule.upcoming(chrono::Utc);
        let first = upcoming.next().unwrap();
        let second = upcoming.next().unwrap();
        assert_eq!(second - first, TimeDelta::days(1));
    }

    #[test]
    fn invalid_cron_is_rejected() {
        assert!(PrunerConfig::from_cron("every day").is_err());
    }
}

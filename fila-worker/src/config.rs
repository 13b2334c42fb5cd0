use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use chrono::TimeDelta;
use fila::{
    manager::ManagerConfig,
    pruner::{PrunerConfig, DEFAULT_SCHEDULE},
    worker::{RateLimit, WorkerConfig},
};

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// The broker is skipped entirely when unset.
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub queue: String,
    pub poll_interval: Duration,
    pub concurrency: usize,
    pub rate_limit_per_minute: u32,
    pub connect_attempts: u16,
    pub migrate_on_startup: bool,
    pub prune_schedule: String,
    pub retention_days: i64,
    pub stalled_after: Option<Duration>,
    pub render_command: Vec<String>,
    pub artifact_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_owned())
        };

        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is missing"))?;
        let redis_url = lookup("REDIS_URL").filter(|value| !value.trim().is_empty());
        let render_command = text("FILA_RENDER_COMMAND", "wkhtmltopdf - -")
            .split_whitespace()
            .map(str::to_owned)
            .collect::<Vec<_>>();
        anyhow::ensure!(
            !render_command.is_empty(),
            "FILA_RENDER_COMMAND must name a program"
        );

        Ok(Self {
            database_url,
            redis_url,
            redis_prefix: text("FILA_REDIS_PREFIX", fila_redis::DEFAULT_PREFIX),
            queue: text("FILA_QUEUE", "orcamento"),
            poll_interval: Duration::from_millis(number(&lookup, "FILA_POLL_INTERVAL_MS", 5000)?),
            concurrency: number(&lookup, "FILA_CONCURRENCY", 2)?,
            rate_limit_per_minute: number(&lookup, "FILA_RATE_LIMIT_PER_MINUTE", 10)?,
            connect_attempts: number(&lookup, "FILA_CONNECT_ATTEMPTS", 3)?,
            migrate_on_startup: number(&lookup, "FILA_MIGRATE_ON_STARTUP", false)?,
            prune_schedule: text("FILA_PRUNE_SCHEDULE", DEFAULT_SCHEDULE),
            retention_days: number(&lookup, "FILA_RETENTION_DAYS", 7)?,
            stalled_after: optional(&lookup, "FILA_STALLED_AFTER_SECS")?.map(Duration::from_secs),
            render_command,
            artifact_dir: text("FILA_ARTIFACT_DIR", "./artifacts").into(),
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig::default().with_connect_attempts(self.connect_attempts)
    }

    pub fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let stalled_after = self
            .stalled_after
            .map(TimeDelta::from_std)
            .transpose()
            .context("FILA_STALLED_AFTER_SECS is out of range")?;
        let rate_limit =
            (self.rate_limit_per_minute > 0).then(|| RateLimit::per_minute(self.rate_limit_per_minute));
        Ok(WorkerConfig::new(&self.queue)
            .with_poll_interval(self.poll_interval)
            .with_concurrency(self.concurrency.max(1))
            .with_rate_limit(rate_limit)
            .with_stalled_after(stalled_after))
    }

    pub fn pruner_config(&self) -> anyhow::Result<PrunerConfig> {
        let retention = TimeDelta::try_days(self.retention_days)
            .context("FILA_RETENTION_DAYS is out of range")?;
        Ok(PrunerConfig::from_cron(&self.prune_schedule)
            .with_context(|| format!("invalid FILA_PRUNE_SCHEDULE `{}`", self.prune_schedule))?
            .with_retention(retention))
    }
}

fn optional<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .trim()
                .parse()
                .with_context(|| format!("{key} has an invalid value `{value}`"))
        })
        .transpose()
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(optional(lookup, key)?.unwrap_or(default))
}

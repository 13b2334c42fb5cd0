//! The Postgres pull backend for fila.
//!
//! Jobs live in the `fila_jobs` table. Workers poll with [`fila::backend::Backend::claim_next_job`],
//! which claims with `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the same job.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use fila_sqlx::PgBackend;
//! use sqlx::postgres::PgPoolOptions;
//!
//! let pool = PgPoolOptions::new().connect("postgres://localhost/clinica").await?;
//! fila_sqlx::MIGRATOR.run(&pool).await?;
//! let backend = PgBackend::from(pool);
//! # let _ = backend;
//! # Ok(())
//! # }
//! ```
use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;
use fila::{
    backend::{Backend, BackendError},
    manager::Connect,
};
use sqlx::{migrate::Migrator, PgPool};

mod backend;
mod types;

/// Migrations creating the `fila_jobs` table.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const BACKEND_NAME: &str = "postgres";

#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: PgPool,
}

impl Deref for PgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgBackend {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgBackend {
    pub fn from_pool(pool: PgPool) -> Self {
        Self::from(pool)
    }

    /// Check the database answers and the jobs table exists.
    pub async fn verify(&self) -> Result<(), BackendError> {
        let table: Option<String> = sqlx::query_scalar("SELECT to_regclass('fila_jobs')::text")
            .fetch_one(self.deref())
            .await
            .map_err(map_err)?;
        match table {
            Some(_) => Ok(()),
            None => Err(BackendError::Unavailable(
                "table fila_jobs does not exist".to_owned(),
            )),
        }
    }
}

/// Connects the Postgres backend during [`fila::QueueManager::initialize`].
#[derive(Clone, Debug)]
pub struct PgConnector {
    pool: PgPool,
    migrate: bool,
}

impl PgConnector {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            migrate: false,
        }
    }

    /// Run [`MIGRATOR`] before verifying the table.
    pub fn with_migrations(mut self, migrate: bool) -> Self {
        self.migrate = migrate;
        self
    }
}

#[async_trait]
impl Connect for PgConnector {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        if self.migrate {
            MIGRATOR.run(&self.pool).await.map_err(|error| {
                tracing::error!(?error, "Failed to migrate the jobs table");
                BackendError::Unavailable(error.to_string())
            })?;
        }
        let backend = PgBackend::from(self.pool.clone());
        backend.verify().await?;
        Ok(Arc::new(backend))
    }
}

pub(crate) fn map_err(error: sqlx::Error) -> BackendError {
    match error {
        sqlx::Error::PoolClosed => BackendError::Closed,
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::WorkerCrashed => BackendError::Unavailable(error.to_string()),
        error => {
            tracing::error!(?error, "Database error: {error}");
            BackendError::BadState
        }
    }
}

//! The Redis push backend for fila.
//!
//! Each queue is a handful of keys under a common prefix (see [`RedisBackend::from_url`]):
//!
//! - `{prefix}:{queue}:{id}` the job record, as JSON,
//! - `{prefix}:{queue}:wait` ids ready to run, oldest at the right,
//! - `{prefix}:{queue}:active` ids handed to a worker,
//! - `{prefix}:{queue}:delayed` ids waiting for a retry or a delay, scored by due time,
//! - `{prefix}:{queue}:completed` and `{prefix}:{queue}:failed` retention sets, scored by the time
//!   the job was settled.
//!
//! Workers receive jobs with `BLMOVE wait -> active` so each id goes to exactly one consumer, and
//! settle them through the [`fila::backend::Delivery`] they were given.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use fila::{
    backend::{Backend, BackendError},
    manager::Connect,
};
use deadpool_redis::{PoolConfig, PoolError, Runtime};
use redis::{aio::ConnectionManager, Client, ErrorKind, RedisError};

mod backend;
mod keys;
mod policy;

use keys::NameSpace;
pub use policy::{QueuePolicy, Retention};

pub const BACKEND_NAME: &str = "redis";

pub const DEFAULT_PREFIX: &str = "fila";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on connections parked in `BLMOVE` at once.
const MAX_BLOCKING: usize = 16;

#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    /// `BLMOVE` holds its connection for the whole wait, so receivers check one out of here
    /// instead of sharing `conn`.
    blocking: deadpool_redis::Pool,
    namespace: NameSpace,
    policy: QueuePolicy,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RedisBackend {
    pub async fn from_url(redis_url: &str, prefix: impl ToString) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| BackendError::Unavailable("timed out connecting to redis".to_owned()))?
            .map_err(map_err)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        let mut blocking = deadpool_redis::Config::from_url(redis_url);
        blocking.pool = Some(PoolConfig::new(MAX_BLOCKING));
        let blocking = blocking
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|error| BackendError::Unavailable(error.to_string()))?;

        Ok(Self {
            conn,
            blocking,
            namespace: NameSpace::new(prefix),
            policy: QueuePolicy::default(),
            closed: Default::default(),
        })
    }

    pub fn with_policy(self, policy: QueuePolicy) -> Self {
        Self { policy, ..self }
    }

    fn ensure_open(&self) -> Result<(), BackendError> {
        if self.closed.load(Ordering::Acquire) {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }
}

/// Connects the Redis backend during [`fila::QueueManager::initialize`].
#[derive(Clone, Debug)]
pub struct RedisConnector {
    url: String,
    prefix: String,
    policy: QueuePolicy,
}

impl RedisConnector {
    pub fn new(url: impl ToString) -> Self {
        Self {
            url: url.to_string(),
            prefix: DEFAULT_PREFIX.to_owned(),
            policy: QueuePolicy::default(),
        }
    }

    pub fn with_prefix(self, prefix: impl ToString) -> Self {
        Self {
            prefix: prefix.to_string(),
            ..self
        }
    }

    pub fn with_policy(self, policy: QueuePolicy) -> Self {
        Self { policy, ..self }
    }
}

#[async_trait]
impl Connect for RedisConnector {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn connect(&self) -> Result<Arc<dyn Backend>, BackendError> {
        let backend = RedisBackend::from_url(&self.url, &self.prefix)
            .await?
            .with_policy(self.policy);
        Ok(Arc::new(backend))
    }
}

pub(crate) fn map_err(error: RedisError) -> BackendError {
    if error.kind() == ErrorKind::IoError
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        BackendError::Unavailable(error.to_string())
    } else {
        tracing::error!(?error, "Redis error: {error}");
        BackendError::BadState
    }
}

pub(crate) fn map_pool_err(error: PoolError) -> BackendError {
    match error {
        PoolError::Backend(error) => map_err(error),
        PoolError::Closed => BackendError::Closed,
        error => BackendError::Unavailable(error.to_string()),
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn redis_errors_map_to_backend_errors() {
        assert_matches!(
            map_err(RedisError::from((ErrorKind::IoError, "connection refused"))),
            BackendError::Unavailable(_)
        );
        assert_matches!(
            map_err(RedisError::from((ErrorKind::TypeError, "unexpected reply"))),
            BackendError::BadState
        );
    }

    #[test]
    fn pool_errors_map_to_backend_errors() {
        assert_matches!(map_pool_err(PoolError::Closed), BackendError::Closed);
        assert_matches!(
            map_pool_err(PoolError::Backend(RedisError::from((
                ErrorKind::IoError,
                "broken pipe"
            )))),
            BackendError::Unavailable(_)
        );
        assert_matches!(
            map_pool_err(PoolError::NoRuntimeSpecified),
            BackendError::Unavailable(_)
        );
    }

    #[tokio::test]
    async fn connector_reports_unreachable_server() {
        let connector = RedisConnector::new("redis://127.0.0.1:1");

        assert_matches!(
            connector.connect().await.err(),
            Some(BackendError::Unavailable(_))
        );
    }

    #[tokio::test]
    async fn connector_rejects_malformed_url() {
        let connector = RedisConnector::new("not a url").with_prefix("clinica");

        assert!(connector.connect().await.is_err());
    }
}

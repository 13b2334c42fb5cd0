//! A background job queue with a push (broker) backend and a pull (table) backend behind one API.
//!
//! The pieces:
//!
//! - [`job::Job`], the unit of work, and its state machine in [`job::transition`],
//! - [`backend::Backend`], implemented in memory here and by the `fila-sqlx` and `fila-redis`
//!   crates,
//! - [`QueueManager`], which picks a backend once at startup and exposes the uniform API,
//! - [`worker::Worker`], which runs jobs through a [`handler::HandlerRegistry`], and
//! - [`pruner`], the retention sweep.
//!
//! # Example
//!
//! ```
//! # use std::sync::Arc;
//! use fila::prelude::*;
//! use fila::backend::memory::InMemoryBackend;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let manager = Arc::new(QueueManager::new(Arc::new(InMemoryBackend::new())));
//! let added = manager
//!     .add_job("orcamento", "generate-pdf", serde_json::json!({"orcamentoId": 1}), JobOptions::default())
//!     .await
//!     .unwrap();
//!
//! let status = manager.job_status("orcamento", &added.job_id).await.unwrap();
//! assert_eq!(status.state, Some(JobState::Pending));
//! # });
//! ```

use backend::BackendError;
use thiserror::Error;

pub mod backend;
pub mod backoff;
pub mod handler;
pub mod job;
pub mod manager;
pub mod prelude;
pub mod pruner;
pub mod worker;

pub use manager::QueueManager;

/// Errors returned by [`QueueManager`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("No queue backend available (primary: {primary}; fallback: {fallback})")]
    NoBackendAvailable { primary: String, fallback: String },
    #[error("`{operation}` is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
    #[error("The queue has been closed")]
    Closed,
    #[error("Error communicating with the backend")]
    Backend(#[source] BackendError),
}

impl From<BackendError> for QueueError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Unsupported { operation, backend } => {
                Self::Unsupported { operation, backend }
            }
            BackendError::Closed => Self::Closed,
            other => Self::Backend(other),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::job::JobId;

    #[test]
    fn backend_errors_map_to_queue_errors() {
        assert_matches!(
            QueueError::from(BackendError::unsupported("receive", "postgres")),
            QueueError::Unsupported {
                operation: "receive",
                backend: "postgres"
            }
        );
        assert_matches!(QueueError::from(BackendError::Closed), QueueError::Closed);
        assert_matches!(
            QueueError::from(BackendError::JobNotFound(JobId::from("x"))),
            QueueError::Backend(BackendError::JobNotFound(_))
        );
    }
}

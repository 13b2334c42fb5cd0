//! Job handlers and the registry the worker routes jobs through.
use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use thiserror::Error;

use crate::job::Job;

/// Why a handler failed, and whether the job should be attempted again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("{0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(error: impl ToString) -> Self {
        Self::Retryable(error.to_string())
    }

    pub fn non_retryable(error: impl ToString) -> Self {
        Self::NonRetryable(error.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Executes jobs of one `job_type`.
///
/// The returned value is stored as the job's result.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<serde_json::Value, HandlerError>;
}

/// Maps a `job_type` to its [`Handler`].
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, job_type: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers.insert(job_type.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
            Ok(job.payload.clone())
        }
    }

    #[tokio::test]
    async fn routes_by_job_type() {
        let registry = HandlerRegistry::new().with_handler("echo", Echo);

        let handler = registry.get("echo").unwrap();
        let job = Job {
            payload: serde_json::json!({"a": 1}),
            ..Job::raw_job()
        };

        assert_eq!(handler.handle(&job).await.unwrap(), serde_json::json!({"a": 1}));
        assert!(registry.get("generate-pdf").is_none());
        assert_eq!(registry.job_types().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn retryable_classification() {
        assert!(HandlerError::retryable("timeout").is_retryable());
        assert!(!HandlerError::non_retryable("missing record").is_retryable());
        assert_eq!(HandlerError::retryable("timeout").to_string(), "timeout");
    }
}

//! The types most callers need: the manager, job options and reports, handlers and worker config.
//!
//! ```
//! # #![allow(unused_imports)]
//! use fila::prelude::*;
//! ```
pub use crate::backend::{Backend, Dispatch, QueueMetrics};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Strategy;
pub use crate::handler::{Handler, HandlerError, HandlerRegistry};
pub use crate::job::{Job, JobId, JobOptions, JobState, JobStatus};
pub use crate::manager::{AddedJob, Connect, JobStatusReport, ManagerConfig};
pub use crate::pruner::{PrunerConfig, PrunerRunner};
pub use crate::worker::{RateLimit, Worker, WorkerConfig};
pub use crate::QueueError;
pub use crate::QueueManager;

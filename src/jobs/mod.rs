//! Job scheduling: download queue, workers, cancellation and progress.
//!
//! # Overview
//!
//! - [`JobManager`] - Owns the registry, the FIFO download queue and the
//!   active set; constructed once per process and shared by handle
//! - [`JobContext`] - Given to every task: `should_cancel()` and `report()`
//! - [`JobSpec`] / [`TaskFactory`] - What is submitted
//! - [`JobSnapshot`] - Polling view (`status`, `current`, `total`, `error`,
//!   `output_path`)
//!
//! Every transition is mirrored into the vault through
//! [`JobLedger`](crate::vault::JobLedger), so readers never need the
//! in-memory state.
//!
//! # Example
//!
//! ```ignore
//! let manager = JobManager::new(Arc::new(vault.clone()), JobManagerConfig::default());
//! let job_id = manager
//!     .submit(spec, task_factory(move |ctx| run_download(ctx)))
//!     .await?;
//! let finished = manager.wait_for(&job_id).await;
//! ```

mod context;
mod error;
mod manager;
mod types;

pub use context::JobContext;
pub use error::{JobError, Result};
pub use manager::{
    DEFAULT_CANCEL_GRACE, DEFAULT_MAX_CONCURRENT_DOWNLOADS, JobManager, JobManagerConfig,
};
pub use types::{
    ExportJobSpec, JobKind, JobOutcome, JobSnapshot, JobSpec, JobStatus, TaskError, TaskFactory,
    TaskFuture, task_factory,
};

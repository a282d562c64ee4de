//! Job kinds, statuses, submissions and snapshots.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::Serialize;

use super::context::JobContext;
use crate::vault::{DownloadJobStatus, ExportItem, ExportJobStatus, SelectionMode};

/// The three kinds of work the manager runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Page acquisition; subject to the download concurrency ceiling.
    Download,
    /// Transcription; runs immediately, not persisted.
    Ocr,
    /// Export; runs immediately.
    Export,
}

impl JobKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Ocr => "ocr",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-memory lifecycle status shared by every job kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Pending,
    Running,
    Cancelling,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        self.to_download().as_str()
    }

    /// `completed`, `error` and `cancelled`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Download-ledger equivalent.
    #[must_use]
    pub fn to_download(self) -> DownloadJobStatus {
        match self {
            Self::Queued => DownloadJobStatus::Queued,
            Self::Pending => DownloadJobStatus::Pending,
            Self::Running => DownloadJobStatus::Running,
            Self::Cancelling => DownloadJobStatus::Cancelling,
            Self::Paused => DownloadJobStatus::Paused,
            Self::Completed => DownloadJobStatus::Completed,
            Self::Error => DownloadJobStatus::Error,
            Self::Cancelled => DownloadJobStatus::Cancelled,
        }
    }

    /// Export-ledger equivalent; exports have no pending, cancelling or paused rows.
    #[must_use]
    pub fn to_export(self) -> ExportJobStatus {
        match self {
            Self::Queued | Self::Pending => ExportJobStatus::Queued,
            Self::Running | Self::Cancelling | Self::Paused => ExportJobStatus::Running,
            Self::Completed => ExportJobStatus::Completed,
            Self::Error => ExportJobStatus::Error,
            Self::Cancelled => ExportJobStatus::Cancelled,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Export parameters carried by an export submission.
#[derive(Debug, Clone)]
pub struct ExportJobSpec {
    pub items: Vec<ExportItem>,
    pub export_format: String,
    pub compression: String,
    pub destination: String,
    pub selection_mode: SelectionMode,
    pub selected_pages: Vec<u32>,
}

/// What is being submitted; the manager creates the matching ledger row.
#[derive(Debug, Clone)]
pub enum JobSpec {
    Download {
        doc_id: String,
        library: String,
        manifest_url: String,
    },
    Ocr {
        doc_id: String,
        library: String,
    },
    Export(ExportJobSpec),
}

impl JobSpec {
    #[must_use]
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Download { .. } => JobKind::Download,
            Self::Ocr { .. } => JobKind::Ocr,
            Self::Export(_) => JobKind::Export,
        }
    }

    /// `(doc_id, library)` a download holds exclusively while active.
    #[must_use]
    pub fn manuscript_key(&self) -> Option<(String, String)> {
        match self {
            Self::Download { doc_id, library, .. } => Some((doc_id.clone(), library.clone())),
            Self::Ocr { .. } | Self::Export(_) => None,
        }
    }
}

/// Result of a task that finished without error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    /// Artifact produced by the job (exports).
    pub output_path: Option<PathBuf>,
    /// Informational note kept on the job (partial acquisitions).
    pub message: Option<String>,
}

impl JobOutcome {
    #[must_use]
    pub fn done() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_output(path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: Some(path.into()),
            message: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Error crossing the worker boundary; only its text is persisted.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Future run by a job worker.
pub type TaskFuture = BoxFuture<'static, Result<JobOutcome, TaskError>>;

/// Builds the task future for one run; resuming a job calls it again.
pub type TaskFactory = Arc<dyn Fn(JobContext) -> TaskFuture + Send + Sync>;

/// Wraps an async closure into a [`TaskFactory`].
pub fn task_factory<F, Fut>(f: F) -> TaskFactory
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutcome, TaskError>> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

/// Polling view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub current: u32,
    pub total: u32,
    pub error: Option<String>,
    pub output_path: Option<PathBuf>,
}

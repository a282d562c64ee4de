//! Per-run handle given to every task: cancellation and progress.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Receives progress from a running task.
#[async_trait]
pub(crate) trait ProgressSink: Send + Sync {
    async fn publish(&self, job_id: &str, run: u64, current: u32, total: u32);
}

#[derive(Debug)]
struct ProgressState {
    last: Mutex<(u32, u32)>,
}

/// Context injected into a task by the job manager.
///
/// Clones share the cancellation token and the progress state. Reports are
/// serialized per run, and a report whose `current` is lower than the last
/// accepted one is dropped, so observers never see progress go backwards.
#[derive(Clone)]
pub struct JobContext {
    job_id: Arc<str>,
    run: u64,
    token: CancellationToken,
    progress: Arc<ProgressState>,
    sink: Option<Arc<dyn ProgressSink>>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("run", &self.run)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub(crate) fn attached(
        job_id: &str,
        run: u64,
        token: CancellationToken,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            job_id: Arc::from(job_id),
            run,
            token,
            progress: Arc::new(ProgressState {
                last: Mutex::new((0, 0)),
            }),
            sink: Some(sink),
        }
    }

    /// Context not tied to a manager, for running a task inline.
    #[must_use]
    pub fn detached(job_id: &str) -> Self {
        Self {
            job_id: Arc::from(job_id),
            run: 0,
            token: CancellationToken::new(),
            progress: Arc::new(ProgressState {
                last: Mutex::new((0, 0)),
            }),
            sink: None,
        }
    }

    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// True once cancel or pause was requested; tasks check this between units of work.
    #[must_use]
    pub fn should_cancel(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.token
    }

    /// Reports `(current, total)`.
    pub async fn report(&self, current: u32, total: u32) {
        let mut last = self.progress.last.lock().await;
        if current < last.0 || (current, total) == *last {
            return;
        }
        *last = (current, total);
        if let Some(sink) = &self.sink {
            sink.publish(&self.job_id, self.run, current, total).await;
        }
    }

    /// Last accepted `(current, total)`.
    pub async fn progress(&self) -> (u32, u32) {
        *self.progress.last.lock().await
    }
}

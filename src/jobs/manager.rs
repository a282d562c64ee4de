//! The scheduler: registry, download queue, workers and ledger mirroring.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::context::{JobContext, ProgressSink};
use super::error::{JobError, Result};
use super::types::{JobKind, JobOutcome, JobSnapshot, JobSpec, JobStatus, TaskError, TaskFactory};
use crate::storage::normalize_library;
use crate::vault::{DownloadJobUpdate, ExportJobUpdate, JobLedger, NewDownloadJob, NewExportJob, VaultError};

/// Default number of manuscripts downloaded at the same time.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 2;

/// Default time a job may stay `cancelling` before it is finalized anyway.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(30);

const CANCELLED_BEFORE_START: &str = "Cancelled before start";
const CANCELLED_BY_USER: &str = "Cancelled by user";
const CANCEL_GRACE_EXPIRED: &str = "Cancelled (worker did not stop within the grace period)";

/// Scheduler settings, captured at construction.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub max_concurrent_downloads: usize,
    pub cancel_grace: Duration,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

/// Runs download, OCR and export jobs and mirrors their lifecycle into the ledger.
///
/// Downloads go through a FIFO queue gated by `max_concurrent_downloads`;
/// other kinds start immediately. Each job runs on its own tokio task, and
/// a panicking or failing task only ever fails its own job.
///
/// Cheap to clone; clones drive the same scheduler.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: Arc<dyn JobLedger>,
    config: JobManagerConfig,
    state: std::sync::Mutex<SchedulerState>,
    /// Serializes status mirroring so the ledger ends on the latest status.
    ledger_writes: tokio::sync::Mutex<()>,
    changed: Notify,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    queue: VecDeque<String>,
    active_downloads: HashSet<String>,
    /// `(doc_id, library)` held by a queued or running download.
    locked: HashMap<(String, String), String>,
    next_seq: u64,
}

struct JobEntry {
    kind: JobKind,
    spec: JobSpec,
    status: JobStatus,
    current: u32,
    total: u32,
    error: Option<String>,
    output_path: Option<PathBuf>,
    factory: TaskFactory,
    token: CancellationToken,
    pause_requested: bool,
    worker_alive: bool,
    run: u64,
    seq: u64,
}

impl JobEntry {
    fn snapshot(&self, job_id: &str) -> JobSnapshot {
        JobSnapshot {
            job_id: job_id.to_string(),
            kind: self.kind,
            status: self.status,
            current: self.current,
            total: self.total,
            error: self.error.clone(),
            output_path: self.output_path.clone(),
        }
    }

    /// Snapshot of this job as it will read once settled in `status`.
    fn settled(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
        output_path: Option<PathBuf>,
    ) -> JobSnapshot {
        JobSnapshot {
            status,
            error,
            output_path,
            ..self.snapshot(job_id)
        }
    }
}

impl SchedulerState {
    fn release_key(&mut self, spec: &JobSpec, job_id: &str) {
        if let Some(key) = spec.manuscript_key()
            && self.locked.get(&key).is_some_and(|holder| holder == job_id)
        {
            self.locked.remove(&key);
        }
    }
}

impl JobManager {
    /// Creates a scheduler writing through `ledger`.
    #[must_use]
    pub fn new(ledger: Arc<dyn JobLedger>, config: JobManagerConfig) -> Self {
        let config = JobManagerConfig {
            max_concurrent_downloads: config.max_concurrent_downloads.max(1),
            ..config
        };
        Self {
            inner: Arc::new(Inner {
                ledger,
                config,
                state: std::sync::Mutex::new(SchedulerState::default()),
                ledger_writes: tokio::sync::Mutex::new(()),
                changed: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a job, creates its ledger row and queues or starts it.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::AlreadyActive`] when a download for the same
    /// manuscript is queued or running, and [`JobError::Ledger`] when the
    /// ledger row cannot be created (nothing is registered in that case).
    #[instrument(skip(self, spec, factory), fields(kind = %spec.kind()))]
    pub async fn submit(&self, spec: JobSpec, factory: TaskFactory) -> Result<String> {
        let spec = normalize_spec(spec);
        let kind = spec.kind();
        let job_id = new_job_id();
        let initial = if kind == JobKind::Download {
            JobStatus::Queued
        } else {
            JobStatus::Pending
        };

        {
            let mut state = self.lock();
            if let Some(key) = spec.manuscript_key() {
                if let Some(holder) = state.locked.get(&key) {
                    return Err(JobError::AlreadyActive {
                        job_id: holder.clone(),
                    });
                }
                state.locked.insert(key, job_id.clone());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.insert(
                job_id.clone(),
                JobEntry {
                    kind,
                    spec: spec.clone(),
                    status: initial,
                    current: 0,
                    total: 0,
                    error: None,
                    output_path: None,
                    factory,
                    token: CancellationToken::new(),
                    pause_requested: false,
                    worker_alive: false,
                    run: 0,
                    seq,
                },
            );
        }

        if let Err(e) = self.create_ledger_row(&job_id, &spec).await {
            let mut state = self.lock();
            state.jobs.remove(&job_id);
            state.release_key(&spec, &job_id);
            return Err(e.into());
        }
        info!(job_id = %job_id, kind = %kind, "job submitted");

        if kind == JobKind::Download {
            self.lock().queue.push_back(job_id.clone());
            self.dispatch().await;
        } else {
            self.start_worker(&job_id);
        }
        Ok(job_id)
    }

    async fn create_ledger_row(&self, job_id: &str, spec: &JobSpec) -> std::result::Result<(), VaultError> {
        match spec {
            JobSpec::Download {
                doc_id,
                library,
                manifest_url,
            } => {
                self.inner
                    .ledger
                    .create_download_job(&NewDownloadJob {
                        job_id,
                        doc_id,
                        library,
                        manifest_url,
                        status: JobStatus::Queued.to_download(),
                    })
                    .await
            }
            JobSpec::Export(export) => {
                self.inner
                    .ledger
                    .create_export_job(&NewExportJob {
                        job_id,
                        items: &export.items,
                        export_format: &export.export_format,
                        compression: &export.compression,
                        destination: &export.destination,
                        selection_mode: export.selection_mode,
                        selected_pages: &export.selected_pages,
                    })
                    .await
            }
            JobSpec::Ocr { .. } => Ok(()),
        }
    }

    /// Starts queued downloads while download slots are free.
    async fn dispatch(&self) {
        let started = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let mut started = Vec::new();
            while state.active_downloads.len() < self.inner.config.max_concurrent_downloads {
                let Some(job_id) = state.queue.pop_front() else {
                    break;
                };
                match state.jobs.get_mut(&job_id) {
                    Some(entry) if entry.status == JobStatus::Queued => {
                        entry.status = JobStatus::Pending;
                        state.active_downloads.insert(job_id.clone());
                        started.push(job_id);
                    }
                    _ => debug!(job_id = %job_id, "dropping stale queue entry"),
                }
            }
            started
        };

        for job_id in &started {
            self.start_worker(job_id);
        }
        self.persist_queue_positions().await;
    }

    async fn persist_queue_positions(&self) {
        let queued: Vec<String> = self.lock().queue.iter().cloned().collect();
        if let Err(e) = self.inner.ledger.set_queue_positions(&queued).await {
            warn!(error = %e, "failed to persist queue positions");
        }
    }

    fn start_worker(&self, job_id: &str) {
        let (ctx, factory, run) = {
            let mut state = self.lock();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return;
            };
            entry.run += 1;
            entry.worker_alive = true;
            let sink: Arc<dyn ProgressSink> = self.inner.clone();
            let ctx = JobContext::attached(job_id, entry.run, entry.token.clone(), sink);
            (ctx, entry.factory.clone(), entry.run)
        };

        let manager = self.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            manager.mark_running(&job_id, run).await;
            let outcome = match tokio::spawn(factory(ctx)).await {
                Ok(result) => result,
                Err(join_error) => Err(join_error_message(join_error).into()),
            };
            manager.finish(&job_id, run, outcome).await;
        });
    }

    async fn mark_running(&self, job_id: &str, run: u64) {
        {
            let mut state = self.lock();
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return;
            };
            if entry.run != run || entry.status != JobStatus::Pending {
                return;
            }
            entry.status = JobStatus::Running;
        }
        info!(job_id, "job running");
        self.mirror(job_id).await;
        self.inner.changed.notify_waiters();
    }

    async fn finish(&self, job_id: &str, run: u64, result: std::result::Result<JobOutcome, TaskError>) {
        let mut current_run = false;
        let settled = self
            .settle(job_id, |state| {
                let entry = state.jobs.get_mut(job_id)?;
                if entry.run != run {
                    return None;
                }
                current_run = true;
                entry.worker_alive = false;

                if entry.status.is_terminal() || entry.status == JobStatus::Paused {
                    // Already finalized by the grace watchdog; the slot was freed then.
                    debug!(job_id, "late worker exit after forced finalization");
                    return None;
                }

                let (status, error, output) = if entry.pause_requested {
                    (JobStatus::Paused, None, None)
                } else if entry.token.is_cancelled() {
                    (JobStatus::Cancelled, Some(CANCELLED_BY_USER.to_string()), None)
                } else {
                    match result {
                        Ok(outcome) => {
                            let missing_artifact = entry.kind == JobKind::Export
                                && outcome.output_path.as_ref().is_none_or(|p| !p.is_file());
                            if missing_artifact {
                                (
                                    JobStatus::Error,
                                    Some("export finished without producing an artifact".to_string()),
                                    None,
                                )
                            } else {
                                (JobStatus::Completed, outcome.message, outcome.output_path)
                            }
                        }
                        Err(e) => (JobStatus::Error, Some(e.to_string()), None),
                    }
                };
                Some(entry.settled(job_id, status, error, output))
            })
            .await;
        if !current_run {
            return;
        }

        {
            let mut guard = self.lock();
            let state = &mut *guard;
            if let Some(entry) = state.jobs.get(job_id) {
                let spec = entry.spec.clone();
                state.release_key(&spec, job_id);
            }
            state.active_downloads.remove(job_id);
        }
        if let Some(status) = settled {
            info!(job_id, status = %status, "job finished");
        }
        self.inner.changed.notify_waiters();
        self.dispatch().await;
    }

    /// Persists a final (terminal or paused) state, then publishes it in memory.
    ///
    /// `decide` runs under the state lock and returns the target snapshot,
    /// or `None` to leave the job alone. Readers only observe the new status
    /// once the ledger row holds it, and `ledger_writes` stays held so no
    /// older snapshot can land afterwards.
    async fn settle<F>(&self, job_id: &str, decide: F) -> Option<JobStatus>
    where
        F: FnOnce(&mut SchedulerState) -> Option<JobSnapshot>,
    {
        let _serial = self.inner.ledger_writes.lock().await;
        let target = {
            let mut state = self.lock();
            decide(&mut *state)?
        };
        let written = self.write_snapshot(job_id, target).await;

        let mut state = self.lock();
        let entry = state.jobs.get_mut(job_id)?;
        entry.status = written.status;
        entry.error = written.error;
        entry.output_path = written.output_path;
        Some(written.status)
    }

    /// Writes the job's current in-memory state to its ledger row.
    async fn mirror(&self, job_id: &str) {
        let _serial = self.inner.ledger_writes.lock().await;
        let Some(snapshot) = self.get_job(job_id) else {
            return;
        };
        let written = self.write_snapshot(job_id, snapshot.clone()).await;
        if written.status != snapshot.status {
            let mut state = self.lock();
            if let Some(entry) = state.jobs.get_mut(job_id) {
                entry.status = written.status;
                entry.error = written.error;
                entry.output_path = written.output_path;
            }
        }
    }

    /// Writes `snapshot` to the ledger row and returns what was recorded.
    ///
    /// An export whose artifact vanished before completion is recorded as
    /// an error instead; callers must hold `ledger_writes`.
    async fn write_snapshot(&self, job_id: &str, snapshot: JobSnapshot) -> JobSnapshot {
        let result = match snapshot.kind {
            JobKind::Download => {
                self.inner
                    .ledger
                    .update_download_job(
                        job_id,
                        &DownloadJobUpdate {
                            status: Some(snapshot.status.to_download()),
                            current: Some(snapshot.current),
                            total: Some(snapshot.total),
                            error_message: snapshot.error.clone(),
                        },
                    )
                    .await
            }
            JobKind::Export => {
                self.inner
                    .ledger
                    .update_export_job(
                        job_id,
                        &ExportJobUpdate {
                            status: Some(snapshot.status.to_export()),
                            current_step: Some(snapshot.current),
                            total_steps: (snapshot.total > 0).then_some(snapshot.total),
                            output_path: snapshot.output_path.clone(),
                            error_message: snapshot.error.clone(),
                        },
                    )
                    .await
            }
            JobKind::Ocr => Ok(()),
        };

        match result {
            Ok(()) => snapshot,
            Err(VaultError::MissingArtifact { path, .. }) => {
                warn!(job_id, path = %path.display(), "export artifact vanished before completion was recorded");
                let message = format!("export artifact missing: {}", path.display());
                let update = ExportJobUpdate::status(JobStatus::Error.to_export()).with_message(message.clone());
                if let Err(e) = self.inner.ledger.update_export_job(job_id, &update).await {
                    warn!(job_id, error = %e, "failed to mirror export error");
                }
                JobSnapshot {
                    status: JobStatus::Error,
                    error: Some(message),
                    output_path: None,
                    ..snapshot
                }
            }
            Err(e) => {
                warn!(job_id, error = %e, "failed to mirror job state");
                snapshot
            }
        }
    }

    /// Requests cooperative cancellation.
    ///
    /// A queued job is cancelled at once; a running one moves to
    /// `cancelling` until its task notices, or until the grace period
    /// expires. Returns `false` for unknown or already-terminal jobs.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, job_id: &str) -> bool {
        self.stop(job_id, false).await.unwrap_or(false)
    }

    /// Requests a pause of a download; resumable with [`Self::resume`].
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] for an unknown id and
    /// [`JobError::InvalidState`] for non-download jobs.
    #[instrument(skip(self))]
    pub async fn request_pause(&self, job_id: &str) -> Result<bool> {
        {
            let state = self.lock();
            let entry = state
                .jobs
                .get(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if entry.kind != JobKind::Download {
                return Err(JobError::InvalidState {
                    job_id: job_id.to_string(),
                    action: "pause",
                    status: entry.status.to_string(),
                });
            }
        }
        self.stop(job_id, true).await
    }

    async fn stop(&self, job_id: &str, pause: bool) -> Result<bool> {
        let arm_watchdog = {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            match entry.status {
                JobStatus::Queued => None,
                JobStatus::Paused if !pause => None,
                JobStatus::Pending | JobStatus::Running => {
                    entry.pause_requested = pause;
                    entry.token.cancel();
                    entry.status = JobStatus::Cancelling;
                    Some(entry.run)
                }
                JobStatus::Cancelling => {
                    entry.pause_requested |= pause;
                    return Ok(true);
                }
                JobStatus::Paused | JobStatus::Completed | JobStatus::Error | JobStatus::Cancelled => {
                    return Ok(false);
                }
            }
        };

        if let Some(run) = arm_watchdog {
            info!(job_id, pause, "stop requested");
            self.mirror(job_id).await;
            self.inner.changed.notify_waiters();
            self.spawn_grace_watchdog(job_id, run);
            return Ok(true);
        }

        // Not running: settle directly, re-checking the status under the lock.
        let settled = self
            .settle(job_id, |state| {
                let entry = state.jobs.get_mut(job_id)?;
                let (status, error) = match entry.status {
                    JobStatus::Queued if pause => (JobStatus::Paused, None),
                    JobStatus::Queued => (JobStatus::Cancelled, Some(CANCELLED_BEFORE_START.to_string())),
                    JobStatus::Paused if !pause => (JobStatus::Cancelled, Some(CANCELLED_BY_USER.to_string())),
                    _ => return None,
                };
                let spec = entry.spec.clone();
                let snapshot = entry.settled(job_id, status, error, None);
                state.queue.retain(|queued| queued != job_id);
                state.release_key(&spec, job_id);
                Some(snapshot)
            })
            .await;
        let Some(status) = settled else {
            return Ok(false);
        };

        info!(job_id, pause, status = %status, "stopped before running");
        self.inner.changed.notify_waiters();
        self.persist_queue_positions().await;
        Ok(true)
    }

    fn spawn_grace_watchdog(&self, job_id: &str, run: u64) {
        let manager = self.clone();
        let job_id = job_id.to_string();
        let grace = self.inner.config.cancel_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            manager.force_finalize(&job_id, run).await;
        });
    }

    /// Finalizes a job still `cancelling` after the grace period.
    ///
    /// The download slot is released; the manuscript lock stays with the
    /// job until its worker actually returns.
    async fn force_finalize(&self, job_id: &str, run: u64) {
        let settled = self
            .settle(job_id, |state| {
                let entry = state.jobs.get(job_id)?;
                if entry.run != run || entry.status != JobStatus::Cancelling || !entry.worker_alive {
                    return None;
                }
                Some(if entry.pause_requested {
                    entry.settled(job_id, JobStatus::Paused, None, None)
                } else {
                    entry.settled(
                        job_id,
                        JobStatus::Cancelled,
                        Some(CANCEL_GRACE_EXPIRED.to_string()),
                        None,
                    )
                })
            })
            .await;
        if settled.is_none() {
            return;
        }

        self.lock().active_downloads.remove(job_id);
        warn!(job_id, "worker ignored cancellation; finalized after grace period");
        self.inner.changed.notify_waiters();
        self.dispatch().await;
    }

    /// Re-queues a paused, failed or cancelled download under the same id.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`], [`JobError::InvalidState`] (wrong
    /// kind or status, or its previous worker is still running) or
    /// [`JobError::AlreadyActive`] when another download took the manuscript.
    #[instrument(skip(self))]
    pub async fn resume(&self, job_id: &str) -> Result<()> {
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let entry = state
                .jobs
                .get_mut(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            let resumable = matches!(
                entry.status,
                JobStatus::Paused | JobStatus::Error | JobStatus::Cancelled
            );
            if entry.kind != JobKind::Download || !resumable || entry.worker_alive {
                return Err(JobError::InvalidState {
                    job_id: job_id.to_string(),
                    action: "resume",
                    status: entry.status.to_string(),
                });
            }
            if let Some(key) = entry.spec.manuscript_key() {
                if let Some(holder) = state.locked.get(&key)
                    && holder != job_id
                {
                    return Err(JobError::AlreadyActive {
                        job_id: holder.clone(),
                    });
                }
                state.locked.insert(key, job_id.to_string());
            }
            entry.status = JobStatus::Queued;
            entry.error = None;
            entry.output_path = None;
            entry.current = 0;
            entry.token = CancellationToken::new();
            entry.pause_requested = false;
            state.queue.push_back(job_id.to_string());
        }

        info!(job_id, "job re-queued");
        self.mirror(job_id).await;
        self.inner.changed.notify_waiters();
        self.dispatch().await;
        Ok(())
    }

    /// Moves a queued download to the front of the queue.
    ///
    /// Returns `false` when the job is not queued.
    #[instrument(skip(self))]
    pub async fn prioritize(&self, job_id: &str) -> bool {
        {
            let mut state = self.lock();
            let Some(index) = state.queue.iter().position(|queued| queued == job_id) else {
                return false;
            };
            if let Some(id) = state.queue.remove(index) {
                state.queue.push_front(id);
            }
        }
        if let Err(e) = self.inner.ledger.bump_download_priority(job_id).await {
            warn!(job_id, error = %e, "failed to persist priority");
        }
        self.persist_queue_positions().await;
        true
    }

    /// Polling read of one job.
    #[must_use]
    pub fn get_job(&self, job_id: &str) -> Option<JobSnapshot> {
        self.lock().jobs.get(job_id).map(|entry| entry.snapshot(job_id))
    }

    /// All registered jobs in submission order; `active_only` hides terminal ones.
    #[must_use]
    pub fn list_jobs(&self, active_only: bool) -> Vec<JobSnapshot> {
        let state = self.lock();
        let mut entries: Vec<(&String, &JobEntry)> = state
            .jobs
            .iter()
            .filter(|(_, entry)| !active_only || !entry.status.is_terminal())
            .collect();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(job_id, entry)| entry.snapshot(job_id))
            .collect()
    }

    /// Forgets a terminal job and deletes its ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`], [`JobError::NotTerminal`] or
    /// [`JobError::Ledger`].
    #[instrument(skip(self))]
    pub async fn remove(&self, job_id: &str) -> Result<()> {
        let kind = {
            let mut state = self.lock();
            let entry = state
                .jobs
                .get(job_id)
                .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
            if !entry.status.is_terminal() || entry.worker_alive {
                return Err(JobError::NotTerminal {
                    job_id: job_id.to_string(),
                    status: entry.status.to_string(),
                });
            }
            let kind = entry.kind;
            state.jobs.remove(job_id);
            kind
        };

        match kind {
            JobKind::Download => self.inner.ledger.delete_download_job(job_id).await?,
            JobKind::Export => self.inner.ledger.delete_export_job(job_id).await?,
            JobKind::Ocr => {}
        }
        self.inner.changed.notify_waiters();
        Ok(())
    }

    /// Waits until the job is terminal or paused; `None` for unknown ids.
    pub async fn wait_for(&self, job_id: &str) -> Option<JobSnapshot> {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.get_job(job_id)?;
            if snapshot.status.is_terminal() || snapshot.status == JobStatus::Paused {
                return Some(snapshot);
            }
            notified.await;
        }
    }

    /// Number of downloads currently holding a slot.
    #[must_use]
    pub fn active_download_count(&self) -> usize {
        self.lock().active_downloads.len()
    }
}

#[async_trait]
impl ProgressSink for Inner {
    async fn publish(&self, job_id: &str, run: u64, current: u32, total: u32) {
        // Same serialization as status mirroring, so rows never move backwards.
        let _serial = self.ledger_writes.lock().await;
        let kind = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(entry) = state.jobs.get_mut(job_id) else {
                return;
            };
            if entry.run != run || entry.status.is_terminal() || entry.status == JobStatus::Paused {
                return;
            }
            entry.current = current;
            entry.total = total;
            entry.kind
        };

        let result = match kind {
            JobKind::Download => {
                self.ledger
                    .update_download_job(job_id, &DownloadJobUpdate::progress(current, total))
                    .await
            }
            JobKind::Export => {
                self.ledger
                    .update_export_job(job_id, &ExportJobUpdate::progress(current, total))
                    .await
            }
            JobKind::Ocr => Ok(()),
        };
        if let Err(e) = result {
            warn!(job_id, error = %e, "failed to mirror progress");
        }
        self.changed.notify_waiters();
    }
}

fn normalize_spec(spec: JobSpec) -> JobSpec {
    match spec {
        JobSpec::Download {
            doc_id,
            library,
            manifest_url,
        } => JobSpec::Download {
            doc_id,
            library: normalize_library(&library),
            manifest_url,
        },
        JobSpec::Ocr { doc_id, library } => JobSpec::Ocr {
            doc_id,
            library: normalize_library(&library),
        },
        export @ JobSpec::Export(_) => export,
    }
}

/// First eight hex characters of a v4 UUID.
fn new_job_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

fn join_error_message(error: tokio::task::JoinError) -> String {
    if error.is_cancelled() {
        return "worker task was aborted".to_string();
    }
    let panic = error.into_panic();
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("worker panicked: {detail}")
}

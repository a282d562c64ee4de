//! Download-job records.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, instrument};

use super::{Result, Vault, VaultError, check_affected};
use crate::storage::normalize_library;

/// Lifecycle status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadJobStatus {
    /// Waiting for a free download slot.
    Queued,
    /// Accepted, worker not started yet.
    Pending,
    /// Worker is acquiring pages.
    Running,
    /// Cancel or pause requested, worker has not stopped yet.
    Cancelling,
    /// Stopped by the user; can be resumed.
    Paused,
    /// Worker finished.
    Completed,
    /// Worker failed, or the process died while it ran.
    Error,
    /// Stopped by the user.
    Cancelled,
}

impl DownloadJobStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// `completed`, `error` and `cancelled` never transition on their own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// States in which the job still owns (or waits for) its manuscript.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Pending | Self::Running | Self::Cancelling
        )
    }

    /// Statuses that stamp `finished_at`.
    fn finishes(self) -> bool {
        self.is_terminal() || self == Self::Paused
    }
}

impl fmt::Display for DownloadJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadJobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid download job status: {s}")),
        }
    }
}

/// A download-job row.
#[derive(Debug, Clone, FromRow)]
pub struct DownloadJobRecord {
    pub job_id: String,
    pub doc_id: String,
    pub library: String,
    pub manifest_url: String,
    /// Stored as text, parsed via `status()`.
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub current_page: i64,
    pub total_pages: i64,
    pub queue_position: Option<i64>,
    pub priority: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    /// Title of the owning manuscript, only filled by listing queries.
    #[sqlx(default)]
    pub display_title: Option<String>,
}

impl DownloadJobRecord {
    /// Parses the stored status.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidStatus`] for an unknown value.
    pub fn status(&self) -> Result<DownloadJobStatus> {
        self.status_str
            .parse()
            .map_err(|_| VaultError::InvalidStatus {
                table: "download_jobs",
                status: self.status_str.clone(),
            })
    }
}

/// Fields for a new download-job row.
#[derive(Debug, Clone)]
pub struct NewDownloadJob<'a> {
    pub job_id: &'a str,
    pub doc_id: &'a str,
    pub library: &'a str,
    pub manifest_url: &'a str,
    pub status: DownloadJobStatus,
}

/// Partial update of a download job. `None` keeps the stored value.
///
/// Moving to `queued` or `running` without an explicit message clears the
/// previous error message.
#[derive(Debug, Clone, Default)]
pub struct DownloadJobUpdate {
    pub status: Option<DownloadJobStatus>,
    pub current: Option<u32>,
    pub total: Option<u32>,
    pub error_message: Option<String>,
}

impl DownloadJobUpdate {
    /// Update that only changes the status.
    #[must_use]
    pub fn status(status: DownloadJobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Update that only moves progress counters.
    #[must_use]
    pub fn progress(current: u32, total: u32) -> Self {
        Self {
            current: Some(current),
            total: Some(total),
            ..Self::default()
        }
    }

    /// Attaches a message to the update.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

impl Vault {
    /// Creates a download-job row.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the insert fails (for example a duplicate id).
    #[instrument(skip(self, job), fields(job_id = job.job_id, doc_id = job.doc_id))]
    pub async fn create_download_job(&self, job: &NewDownloadJob<'_>) -> Result<DownloadJobRecord> {
        let row = sqlx::query_as::<_, DownloadJobRecord>(
            r"INSERT INTO download_jobs (job_id, doc_id, library, manifest_url, status)
              VALUES (?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(job.job_id)
        .bind(job.doc_id)
        .bind(normalize_library(job.library))
        .bind(job.manifest_url)
        .bind(job.status.as_str())
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Applies a partial update to a download job.
    ///
    /// `running` stamps `started_at` once and clears `finished_at`; terminal
    /// statuses and `paused` stamp `finished_at`.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::JobNotFound`] if the row does not exist.
    #[instrument(skip(self, update), fields(status = ?update.status))]
    pub async fn update_download_job(&self, job_id: &str, update: &DownloadJobUpdate) -> Result<()> {
        let status = update.status.map(|s| s.as_str());
        let finishes = update.status.map(DownloadJobStatus::finishes);
        let result = sqlx::query(
            r"UPDATE download_jobs SET
                status = COALESCE(?1, status),
                current_page = COALESCE(?2, current_page),
                total_pages = COALESCE(?3, total_pages),
                error_message = CASE
                    WHEN ?4 IS NOT NULL THEN ?4
                    WHEN ?1 IN ('queued', 'running') THEN NULL
                    ELSE error_message
                END,
                started_at = CASE
                    WHEN ?1 = 'running' THEN COALESCE(started_at, datetime('now'))
                    ELSE started_at
                END,
                finished_at = CASE
                    WHEN ?5 = 1 THEN datetime('now')
                    WHEN ?1 IN ('queued', 'running') THEN NULL
                    ELSE finished_at
                END,
                queue_position = CASE
                    WHEN ?1 IS NOT NULL AND ?1 != 'queued' THEN NULL
                    ELSE queue_position
                END,
                updated_at = datetime('now')
              WHERE job_id = ?6",
        )
        .bind(status)
        .bind(update.current.map(i64::from))
        .bind(update.total.map(i64::from))
        .bind(update.error_message.as_deref())
        .bind(finishes)
        .bind(job_id)
        .execute(self.db.pool())
        .await?;

        check_affected(job_id, result.rows_affected())
    }

    /// Writes 1-based queue positions for queued jobs in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the transaction fails.
    #[instrument(skip(self, ordered_job_ids), fields(queued = ordered_job_ids.len()))]
    pub async fn set_queue_positions(&self, ordered_job_ids: &[String]) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        for (index, job_id) in ordered_job_ids.iter().enumerate() {
            let position = i64::try_from(index + 1).unwrap_or(i64::MAX);
            sqlx::query(
                r"UPDATE download_jobs SET queue_position = ?, updated_at = datetime('now')
                  WHERE job_id = ? AND status = 'queued'",
            )
            .bind(position)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Increments the priority of a job.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::JobNotFound`] if the row does not exist.
    #[instrument(skip(self))]
    pub async fn bump_download_priority(&self, job_id: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE download_jobs SET priority = priority + 1, updated_at = datetime('now')
              WHERE job_id = ?",
        )
        .bind(job_id)
        .execute(self.db.pool())
        .await?;
        check_affected(job_id, result.rows_affected())
    }

    /// Gets a download job by id.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_download_job(&self, job_id: &str) -> Result<Option<DownloadJobRecord>> {
        let row = sqlx::query_as::<_, DownloadJobRecord>(
            r"SELECT j.*, m.display_title AS display_title
              FROM download_jobs j
              LEFT JOIN manuscripts m ON m.doc_id = j.doc_id AND m.library = j.library
              WHERE j.job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Lists download jobs for display.
    ///
    /// Terminal jobs whose manuscript no longer exists are hidden. Running
    /// jobs come first, then queued/paused, then the rest; ties break on
    /// priority (high first), queue position, then most recent update.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_download_jobs(&self, limit: u32) -> Result<Vec<DownloadJobRecord>> {
        let rows = sqlx::query_as::<_, DownloadJobRecord>(
            r"SELECT j.*, m.display_title AS display_title
              FROM download_jobs j
              LEFT JOIN manuscripts m ON m.doc_id = j.doc_id AND m.library = j.library
              WHERE m.doc_id IS NOT NULL
                 OR j.status NOT IN ('completed', 'error', 'cancelled')
              ORDER BY
                CASE j.status
                    WHEN 'running' THEN 0
                    WHEN 'cancelling' THEN 0
                    WHEN 'pending' THEN 1
                    WHEN 'queued' THEN 1
                    WHEN 'paused' THEN 2
                    ELSE 3
                END,
                j.priority DESC,
                COALESCE(j.queue_position, 2147483647) ASC,
                j.updated_at DESC
              LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Download jobs that still own or wait for their manuscript.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_active_downloads(&self) -> Result<Vec<DownloadJobRecord>> {
        let rows = sqlx::query_as::<_, DownloadJobRecord>(
            r"SELECT * FROM download_jobs
              WHERE status IN ('queued', 'pending', 'running', 'cancelling')
              ORDER BY created_at ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Removes a terminal download job.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::JobNotFound`] if the row does not exist, or
    /// [`VaultError::JobNotTerminal`] while it is still active or paused.
    #[instrument(skip(self))]
    pub async fn delete_download_job(&self, job_id: &str) -> Result<()> {
        let Some(row) = self.get_download_job(job_id).await? else {
            return Err(VaultError::JobNotFound(job_id.to_string()));
        };
        if !row.status()?.is_terminal() {
            return Err(VaultError::JobNotTerminal {
                job_id: job_id.to_string(),
                status: row.status_str,
            });
        }
        let result = sqlx::query(
            r"DELETE FROM download_jobs
              WHERE job_id = ? AND status IN ('completed', 'error', 'cancelled')",
        )
        .bind(job_id)
        .execute(self.db.pool())
        .await?;
        debug!(job_id, "download job removed");
        check_affected(job_id, result.rows_affected())
    }
}

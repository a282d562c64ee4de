//! Export-job records.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::instrument;

use super::{Result, Vault, VaultError, check_affected};

/// Lifecycle status of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportJobStatus {
    Queued,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExportJobStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

impl fmt::Display for ExportJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExportJobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid export job status: {s}")),
        }
    }
}

/// One manuscript or many.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportScope {
    Single,
    Batch,
}

impl ExportScope {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Batch => "batch",
        }
    }

    /// Scope implied by the number of items.
    #[must_use]
    pub fn for_item_count(count: usize) -> Self {
        if count > 1 { Self::Batch } else { Self::Single }
    }
}

/// Which pages of each item go into the export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    All,
    Custom,
}

impl SelectionMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Custom => "custom",
        }
    }
}

impl std::str::FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "custom" => Ok(Self::Custom),
            other => Err(format!("invalid selection mode: {other}")),
        }
    }
}

/// A manuscript targeted by an export.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportItem {
    pub doc_id: String,
    pub library: String,
}

impl ExportItem {
    #[must_use]
    pub fn new(doc_id: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            library: library.into(),
        }
    }
}

/// An export-job row.
#[derive(Debug, Clone, FromRow)]
pub struct ExportJobRecord {
    pub job_id: String,
    pub scope: String,
    pub items_json: String,
    pub export_format: String,
    pub compression: String,
    pub destination: String,
    pub selection_mode: String,
    pub selected_pages_json: String,
    pub output_path: Option<String>,
    /// Stored as text, parsed via `status()`.
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub current_step: i64,
    pub total_steps: i64,
    pub error_message: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ExportJobRecord {
    /// Parses the stored status.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidStatus`] for an unknown value.
    pub fn status(&self) -> Result<ExportJobStatus> {
        self.status_str
            .parse()
            .map_err(|_| VaultError::InvalidStatus {
                table: "export_jobs",
                status: self.status_str.clone(),
            })
    }

    /// Target items. A malformed column reads as empty.
    #[must_use]
    pub fn items(&self) -> Vec<ExportItem> {
        serde_json::from_str(&self.items_json).unwrap_or_default()
    }

    /// Explicit page list for `custom` selections.
    #[must_use]
    pub fn selected_pages(&self) -> Vec<u32> {
        serde_json::from_str(&self.selected_pages_json).unwrap_or_default()
    }
}

/// Fields for a new export-job row.
#[derive(Debug, Clone)]
pub struct NewExportJob<'a> {
    pub job_id: &'a str,
    pub items: &'a [ExportItem],
    pub export_format: &'a str,
    pub compression: &'a str,
    pub destination: &'a str,
    pub selection_mode: SelectionMode,
    pub selected_pages: &'a [u32],
}

/// Partial update of an export job. `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct ExportJobUpdate {
    pub status: Option<ExportJobStatus>,
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub output_path: Option<PathBuf>,
    pub error_message: Option<String>,
}

impl ExportJobUpdate {
    #[must_use]
    pub fn status(status: ExportJobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn progress(current: u32, total: u32) -> Self {
        Self {
            current_step: Some(current),
            total_steps: Some(total),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

impl Vault {
    /// Creates an export-job row in `queued` state.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the insert fails.
    #[instrument(skip(self, job), fields(job_id = job.job_id, items = job.items.len()))]
    pub async fn create_export_job(&self, job: &NewExportJob<'_>) -> Result<ExportJobRecord> {
        let items_json =
            serde_json::to_string(job.items).map_err(|e| VaultError::json("items_json", &e))?;
        let pages_json = serde_json::to_string(job.selected_pages)
            .map_err(|e| VaultError::json("selected_pages_json", &e))?;
        let scope = ExportScope::for_item_count(job.items.len());
        let total_steps = i64::try_from(job.items.len()).unwrap_or(i64::MAX);

        let row = sqlx::query_as::<_, ExportJobRecord>(
            r"INSERT INTO export_jobs (
                job_id, scope, items_json, export_format, compression, destination,
                selection_mode, selected_pages_json, status, total_steps
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING *",
        )
        .bind(job.job_id)
        .bind(scope.as_str())
        .bind(items_json)
        .bind(job.export_format)
        .bind(job.compression)
        .bind(job.destination)
        .bind(job.selection_mode.as_str())
        .bind(pages_json)
        .bind(ExportJobStatus::Queued.as_str())
        .bind(total_steps)
        .fetch_one(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Applies a partial update to an export job.
    ///
    /// Completing requires an artifact that exists on disk, either in this
    /// update or already stored on the row.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::JobNotFound`] for an unknown id and
    /// [`VaultError::MissingArtifact`] for a completion without a file.
    #[instrument(skip(self, update), fields(status = ?update.status))]
    pub async fn update_export_job(&self, job_id: &str, update: &ExportJobUpdate) -> Result<()> {
        let output_path = update
            .output_path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned());

        let mut tx = self.db.pool().begin().await?;
        if update.status == Some(ExportJobStatus::Completed) {
            let stored: Option<(Option<String>,)> =
                sqlx::query_as(r"SELECT output_path FROM export_jobs WHERE job_id = ?")
                    .bind(job_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let Some((stored,)) = stored else {
                return Err(VaultError::JobNotFound(job_id.to_string()));
            };
            let artifact = output_path.clone().or(stored).unwrap_or_default();
            if artifact.is_empty() || !Path::new(&artifact).is_file() {
                return Err(VaultError::MissingArtifact {
                    job_id: job_id.to_string(),
                    path: PathBuf::from(artifact),
                });
            }
        }

        let result = sqlx::query(
            r"UPDATE export_jobs SET
                status = COALESCE(?1, status),
                current_step = COALESCE(?2, current_step),
                total_steps = COALESCE(?3, total_steps),
                output_path = COALESCE(?4, output_path),
                error_message = COALESCE(?5, error_message),
                started_at = CASE
                    WHEN ?1 = 'running' THEN COALESCE(started_at, datetime('now'))
                    ELSE started_at
                END,
                finished_at = CASE
                    WHEN ?1 IN ('completed', 'error', 'cancelled') THEN datetime('now')
                    ELSE finished_at
                END,
                updated_at = datetime('now')
              WHERE job_id = ?6",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.current_step.map(i64::from))
        .bind(update.total_steps.map(i64::from))
        .bind(output_path)
        .bind(update.error_message.as_deref())
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        check_affected(job_id, result.rows_affected())?;
        tx.commit().await?;
        Ok(())
    }

    /// Gets an export job by id.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_export_job(&self, job_id: &str) -> Result<Option<ExportJobRecord>> {
        let row = sqlx::query_as::<_, ExportJobRecord>(r"SELECT * FROM export_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row)
    }

    /// Lists export jobs, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_export_jobs(&self, limit: u32) -> Result<Vec<ExportJobRecord>> {
        let rows = sqlx::query_as::<_, ExportJobRecord>(
            r"SELECT * FROM export_jobs ORDER BY created_at DESC, job_id ASC LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Removes a terminal export job. The artifact on disk is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::JobNotFound`] or [`VaultError::JobNotTerminal`].
    #[instrument(skip(self))]
    pub async fn delete_export_job(&self, job_id: &str) -> Result<()> {
        let Some(row) = self.get_export_job(job_id).await? else {
            return Err(VaultError::JobNotFound(job_id.to_string()));
        };
        if !row.status()?.is_terminal() {
            return Err(VaultError::JobNotTerminal {
                job_id: job_id.to_string(),
                status: row.status_str,
            });
        }
        let result = sqlx::query(r"DELETE FROM export_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(self.db.pool())
            .await?;
        check_affected(job_id, result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn seed(vault: &Vault, job_id: &str) -> ExportJobRecord {
        let items = vec![
            ExportItem::new("ms1", "Gallica"),
            ExportItem::new("ms2", "Vaticana"),
        ];
        vault
            .create_export_job(&NewExportJob {
                job_id,
                items: &items,
                export_format: "zip_images",
                compression: "standard",
                destination: "local_filesystem",
                selection_mode: SelectionMode::Custom,
                selected_pages: &[1, 3],
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_export_job_stores_items_and_scope() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        let row = seed(&vault, "e1").await;

        assert_eq!(row.scope, "batch");
        assert_eq!(row.items().len(), 2);
        assert_eq!(row.selected_pages(), vec![1, 3]);
        assert_eq!(row.total_steps, 2);
        assert_eq!(row.status().unwrap(), ExportJobStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_export_job_completion_requires_artifact() {
        let (vault, dir) = Vault::in_memory_for_tests().await;
        seed(&vault, "e1").await;

        let err = vault
            .update_export_job("e1", &ExportJobUpdate::status(ExportJobStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::MissingArtifact { .. }));

        let artifact = dir.path().join("bundle.zip");
        std::fs::write(&artifact, b"PK").unwrap();
        vault
            .update_export_job(
                "e1",
                &ExportJobUpdate::status(ExportJobStatus::Completed).with_output(&artifact),
            )
            .await
            .unwrap();

        let row = vault.get_export_job("e1").await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), ExportJobStatus::Completed);
        assert_eq!(row.output_path.unwrap(), artifact.to_string_lossy());
        assert!(row.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_update_export_job_progress_respects_step_bound() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        seed(&vault, "e1").await;

        vault
            .update_export_job("e1", &ExportJobUpdate::progress(1, 2))
            .await
            .unwrap();
        let result = vault
            .update_export_job("e1", &ExportJobUpdate::progress(3, 2))
            .await;
        assert!(result.is_err(), "current_step above total_steps must be rejected");
    }

    #[tokio::test]
    async fn test_delete_export_job_requires_terminal() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        seed(&vault, "e1").await;
        assert!(matches!(
            vault.delete_export_job("e1").await.unwrap_err(),
            VaultError::JobNotTerminal { .. }
        ));
        vault
            .update_export_job("e1", &ExportJobUpdate::status(ExportJobStatus::Cancelled))
            .await
            .unwrap();
        vault.delete_export_job("e1").await.unwrap();
    }
}

//! Startup reconciliation, housekeeping and compound deletes.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, instrument, warn};

use super::{AssetState, ManuscriptRecord, ManuscriptUpsert, Result, Vault, VaultError};
use crate::storage::{normalize_library, scan_page_numbers};

/// Message recorded on jobs interrupted by a process restart.
pub const RESTART_MESSAGE: &str = "Server restarted";

/// Rows touched by [`Vault::reset_active_downloads`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub downloads: u64,
    pub exports: u64,
}

/// What [`Vault::cleanup_stale_data`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub download_jobs: u64,
    pub export_jobs: u64,
    pub temp_dirs: u64,
}

impl Vault {
    /// Forces every download job that a previous process left active to `error`.
    ///
    /// Meant to run once at startup, before any job can be submitted: no
    /// in-memory worker can exist yet, so any `queued`, `pending`, `running`
    /// or `cancelling` row is stale. Export jobs left `queued`/`running` are
    /// failed the same way.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if an update fails.
    #[instrument(skip(self))]
    pub async fn reset_active_downloads(&self, message: &str) -> Result<ResetSummary> {
        let downloads = sqlx::query(
            r"UPDATE download_jobs
              SET status = 'error',
                  error_message = COALESCE(error_message, ?) || ' (server restart)',
                  queue_position = NULL,
                  finished_at = datetime('now'),
                  updated_at = datetime('now')
              WHERE status IN ('queued', 'pending', 'running', 'cancelling')",
        )
        .bind(message)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        let exports = sqlx::query(
            r"UPDATE export_jobs
              SET status = 'error',
                  error_message = COALESCE(error_message, ?) || ' (server restart)',
                  finished_at = datetime('now'),
                  updated_at = datetime('now')
              WHERE status IN ('queued', 'running')",
        )
        .bind(message)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if downloads + exports > 0 {
            info!(downloads, exports, "reset jobs left active by a previous run");
        }
        Ok(ResetSummary { downloads, exports })
    }

    /// Removes aged, terminal, orphaned job rows and aged staging folders.
    ///
    /// A download job is removed only when it is terminal, older than the
    /// window and its manuscript row is gone. An export job is removed when
    /// terminal, older than the window and its artifact no longer exists.
    /// Staging folders under the temp root are pruned when older than the
    /// window and not used by an active download. Manuscript folders are
    /// never touched.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if a query fails. Filesystem
    /// failures are logged and skipped.
    #[instrument(skip(self))]
    pub async fn cleanup_stale_data(&self, retention_hours: u32) -> Result<CleanupReport> {
        let window = format!("-{retention_hours} hours");

        let download_jobs = sqlx::query(
            r"DELETE FROM download_jobs
              WHERE status IN ('completed', 'error', 'cancelled')
                AND created_at < datetime('now', ?)
                AND NOT EXISTS (
                    SELECT 1 FROM manuscripts m
                    WHERE m.doc_id = download_jobs.doc_id AND m.library = download_jobs.library
                )",
        )
        .bind(&window)
        .execute(self.db.pool())
        .await?
        .rows_affected();

        let export_candidates: Vec<(String, Option<String>)> = sqlx::query_as(
            r"SELECT job_id, output_path FROM export_jobs
              WHERE status IN ('completed', 'error', 'cancelled')
                AND created_at < datetime('now', ?)",
        )
        .bind(&window)
        .fetch_all(self.db.pool())
        .await?;
        let mut export_jobs = 0;
        for (job_id, output_path) in export_candidates {
            let artifact_alive = output_path
                .as_deref()
                .is_some_and(|path| !path.is_empty() && Path::new(path).exists());
            if artifact_alive {
                continue;
            }
            export_jobs += sqlx::query(r"DELETE FROM export_jobs WHERE job_id = ?")
                .bind(&job_id)
                .execute(self.db.pool())
                .await?
                .rows_affected();
        }

        let active: HashSet<PathBuf> = self
            .get_active_downloads()
            .await?
            .into_iter()
            .map(|job| self.layout.staging_dir(&job.doc_id, &job.library))
            .collect();
        let max_age = Duration::from_secs(u64::from(retention_hours) * 3600);
        let temp_dirs = self.prune_staging_dirs(max_age, &active).await;

        let report = CleanupReport {
            download_jobs,
            export_jobs,
            temp_dirs,
        };
        debug!(?report, "stale data cleanup finished");
        Ok(report)
    }

    /// Walks `temp/<library>/<doc_id>` and removes idle folders older than `max_age`.
    async fn prune_staging_dirs(&self, max_age: Duration, active: &HashSet<PathBuf>) -> u64 {
        let now = SystemTime::now();
        let mut removed = 0;
        for library_dir in child_dirs(self.layout.temp_dir()).await {
            for (path, meta) in child_dirs_with_meta(&library_dir).await {
                if active.contains(&path) || self.layout.contains_download_path(&path) {
                    continue;
                }
                let age = meta
                    .modified()
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .unwrap_or_default();
                if age < max_age {
                    continue;
                }
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => {
                        info!(path = %path.display(), "pruned stale staging folder");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to prune staging folder"),
                }
            }
            // Only succeeds once the library folder is empty.
            let _ = tokio::fs::remove_dir(&library_dir).await;
        }
        removed
    }

    /// Reconciles manuscript counters and asset states with the files on disk.
    ///
    /// Pages are counted in the manuscript's `scans/` folder and in its
    /// staging folder. A `downloading` row with no active download job
    /// falls back to the state implied by its counts. Only rows that
    /// actually change are written; the number of rewritten rows is returned.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if a query or upsert fails.
    #[instrument(skip(self))]
    pub async fn normalize_asset_states(&self, limit: u32) -> Result<u64> {
        let rows = self.list_manuscripts(limit.max(1)).await?;
        let active_keys: HashSet<(String, String)> = self
            .get_active_downloads()
            .await?
            .into_iter()
            .map(|job| (job.doc_id, job.library))
            .collect();

        let mut updated = 0;
        for row in rows {
            let is_active = active_keys.contains(&(row.doc_id.clone(), row.library.clone()));
            let observed = self.observe_disk(&row);
            let Some(upsert) = reconcile_row(&row, &observed, is_active)? else {
                continue;
            };
            self.upsert_manuscript(upsert).await?;
            updated += 1;
        }
        if updated > 0 {
            info!(updated, "normalized manuscript asset states");
        }
        Ok(updated)
    }

    fn observe_disk(&self, row: &ManuscriptRecord) -> DiskObservation {
        let scans = row.local_path.as_deref().map_or_else(
            || self.layout.document(&row.doc_id, &row.library).scans,
            |root| PathBuf::from(root).join("scans"),
        );
        let staging = self.layout.staging_dir(&row.doc_id, &row.library);
        let present = scans.is_dir() || staging.is_dir();
        let mut pages = scan_page_numbers(&scans);
        pages.extend(scan_page_numbers(&staging));
        DiskObservation { present, pages }
    }

    /// Deletes a manuscript with its snippets, download jobs and folder.
    ///
    /// The folder is first moved aside, then the rows are deleted in one
    /// transaction; a failed commit moves the folder back. Folders outside
    /// the downloads root are never removed. Any failure after the commit
    /// (removing the moved folder or snippet files) is still reported.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::ManuscriptNotFound`], [`VaultError::ActiveDownload`]
    /// while a download job is active, [`VaultError::Io`] or [`VaultError::Database`].
    #[instrument(skip(self))]
    pub async fn delete_manuscript(&self, doc_id: &str, library: &str) -> Result<()> {
        let library = normalize_library(library);
        let Some(row) = self.get_manuscript(doc_id, &library).await? else {
            return Err(VaultError::ManuscriptNotFound {
                doc_id: doc_id.to_string(),
                library,
            });
        };

        if let Some(job) = self
            .get_active_downloads()
            .await?
            .into_iter()
            .find(|job| job.doc_id == row.doc_id && job.library == row.library)
        {
            return Err(VaultError::ActiveDownload {
                doc_id: row.doc_id,
                library: row.library,
                job_id: job.job_id,
            });
        }

        let folder = row.local_path.as_deref().map_or_else(
            || self.layout.document(&row.doc_id, &row.library).root,
            PathBuf::from,
        );
        let removable = folder.is_dir() && self.layout.contains_download_path(&folder);
        if folder.is_dir() && !removable {
            warn!(path = %folder.display(), "manuscript folder outside downloads root left in place");
        }

        let mut tx = self.db.pool().begin().await?;
        let snippet_paths: Vec<(String,)> = sqlx::query_as(
            r"DELETE FROM snippets WHERE doc_id = ? AND library = ? RETURNING image_path",
        )
        .bind(&row.doc_id)
        .bind(&row.library)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query(r"DELETE FROM download_jobs WHERE doc_id = ? AND library = ?")
            .bind(&row.doc_id)
            .bind(&row.library)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r"DELETE FROM manuscripts WHERE doc_id = ? AND library = ?")
            .bind(&row.doc_id)
            .bind(&row.library)
            .execute(&mut *tx)
            .await?;

        let parked = if removable {
            let parked = parked_path(&folder);
            tokio::fs::rename(&folder, &parked)
                .await
                .map_err(|e| VaultError::io(&folder, e))?;
            Some(parked)
        } else {
            None
        };

        if let Err(e) = tx.commit().await {
            if let Some(parked) = &parked
                && let Err(restore) = tokio::fs::rename(parked, &folder).await
            {
                warn!(path = %folder.display(), error = %restore, "failed to restore manuscript folder");
            }
            return Err(e.into());
        }

        let mut first_failure = None;
        if let Some(parked) = parked
            && let Err(e) = tokio::fs::remove_dir_all(&parked).await
        {
            first_failure.get_or_insert(VaultError::io(parked, e));
        }
        for (path,) in snippet_paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    first_failure.get_or_insert(VaultError::io(path, e));
                }
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => {
                info!(doc_id = %row.doc_id, library = %row.library, "manuscript deleted");
                Ok(())
            }
        }
    }
}

struct DiskObservation {
    /// Whether a scans or staging folder exists at all.
    present: bool,
    pages: BTreeSet<u32>,
}

fn reconcile_row(
    row: &ManuscriptRecord,
    observed: &DiskObservation,
    is_active: bool,
) -> Result<Option<ManuscriptUpsert>> {
    let stored_total = row.total();
    let stored_downloaded = row.downloaded();

    let mut total = stored_total;
    let mut downloaded = if observed.present {
        let counted = observed
            .pages
            .iter()
            .filter(|&&page| total == 0 || page <= total)
            .count();
        u32::try_from(counted).unwrap_or(u32::MAX)
    } else {
        stored_downloaded
    };
    if total == 0 && downloaded > 0 {
        total = downloaded;
    }
    downloaded = downloaded.min(total);

    let stored_state = row.asset_state()?;
    let state = match stored_state {
        AssetState::Downloading if is_active => AssetState::Downloading,
        AssetState::Error if downloaded < total || total == 0 => AssetState::Error,
        _ => AssetState::from_counts(total, downloaded),
    };

    let missing: Vec<u32> = if state == AssetState::Complete || total == 0 {
        Vec::new()
    } else if observed.present {
        (1..=total).filter(|page| !observed.pages.contains(page)).collect()
    } else if downloaded > 0 {
        (downloaded + 1..=total).collect()
    } else {
        Vec::new()
    };

    if state == stored_state
        && total == stored_total
        && downloaded == stored_downloaded
        && missing == row.missing_pages()
    {
        return Ok(None);
    }

    Ok(Some(ManuscriptUpsert {
        asset_state: Some(state),
        total_canvases: Some(total),
        downloaded_canvases: Some(downloaded),
        missing_pages: Some(missing),
        ..ManuscriptUpsert::new(row.doc_id.clone(), row.library.clone())
    }))
}

fn parked_path(folder: &Path) -> PathBuf {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = folder
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    folder.with_file_name(format!(".{name}.deleting-{}", &suffix[..8]))
}

async fn child_dirs(parent: &Path) -> Vec<PathBuf> {
    child_dirs_with_meta(parent)
        .await
        .into_iter()
        .map(|(path, _)| path)
        .collect()
}

async fn child_dirs_with_meta(parent: &Path) -> Vec<(PathBuf, std::fs::Metadata)> {
    let Ok(mut entries) = tokio::fs::read_dir(parent).await else {
        return Vec::new();
    };
    let mut dirs = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(meta) = entry.metadata().await
            && meta.is_dir()
        {
            dirs.push((entry.path(), meta));
        }
    }
    dirs
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::page_file_name;
    use crate::vault::{DownloadJobStatus, DownloadJobUpdate, NewDownloadJob, NewSnippet};

    async fn add_job(vault: &Vault, job_id: &str, doc_id: &str, status: DownloadJobStatus) {
        vault
            .create_download_job(&NewDownloadJob {
                job_id,
                doc_id,
                library: "Gallica",
                manifest_url: "https://example.org/m.json",
                status: DownloadJobStatus::Queued,
            })
            .await
            .unwrap();
        if status != DownloadJobStatus::Queued {
            vault
                .update_download_job(job_id, &DownloadJobUpdate::status(status))
                .await
                .unwrap();
        }
    }

    fn write_pages(dir: &Path, pages: &[u32]) {
        std::fs::create_dir_all(dir).unwrap();
        for page in pages {
            std::fs::write(dir.join(page_file_name(*page)), b"jpeg").unwrap();
        }
    }

    #[tokio::test]
    async fn test_reset_active_downloads_marks_stale_rows_error() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        add_job(&vault, "run", "ms1", DownloadJobStatus::Running).await;
        add_job(&vault, "queue", "ms2", DownloadJobStatus::Queued).await;
        add_job(&vault, "done", "ms3", DownloadJobStatus::Completed).await;
        add_job(&vault, "hold", "ms4", DownloadJobStatus::Paused).await;

        let summary = vault.reset_active_downloads(RESTART_MESSAGE).await.unwrap();
        assert_eq!(summary.downloads, 2);

        let run = vault.get_download_job("run").await.unwrap().unwrap();
        assert_eq!(run.status().unwrap(), DownloadJobStatus::Error);
        assert_eq!(
            run.error_message.as_deref(),
            Some("Server restarted (server restart)")
        );
        let done = vault.get_download_job("done").await.unwrap().unwrap();
        assert_eq!(done.status().unwrap(), DownloadJobStatus::Completed);
        let hold = vault.get_download_job("hold").await.unwrap().unwrap();
        assert_eq!(hold.status().unwrap(), DownloadJobStatus::Paused);
    }

    #[tokio::test]
    async fn test_cleanup_stale_data_keeps_owned_and_active_jobs() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        vault
            .upsert_manuscript(ManuscriptUpsert::new("owned", "Gallica"))
            .await
            .unwrap();
        add_job(&vault, "orphan", "gone", DownloadJobStatus::Error).await;
        add_job(&vault, "owned", "owned", DownloadJobStatus::Completed).await;
        add_job(&vault, "live", "gone2", DownloadJobStatus::Running).await;
        sqlx::query("UPDATE download_jobs SET created_at = datetime('now', '-48 hours')")
            .execute(vault.db().pool())
            .await
            .unwrap();

        let report = vault.cleanup_stale_data(24).await.unwrap();
        assert_eq!(report.download_jobs, 1);
        assert!(vault.get_download_job("orphan").await.unwrap().is_none());
        assert!(vault.get_download_job("owned").await.unwrap().is_some());
        assert!(vault.get_download_job("live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_stale_data_respects_retention_window() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        add_job(&vault, "fresh", "gone", DownloadJobStatus::Error).await;

        let report = vault.cleanup_stale_data(24).await.unwrap();
        assert_eq!(report.download_jobs, 0);
        assert!(vault.get_download_job("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_stale_data_prunes_only_idle_staging() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        let idle = vault.layout().staging_dir("idle", "Gallica");
        let busy = vault.layout().staging_dir("busy", "Gallica");
        let other_library = vault.layout().staging_dir("busy", "Vaticana");
        write_pages(&idle, &[1]);
        write_pages(&busy, &[1]);
        write_pages(&other_library, &[1]);
        let scans = vault.layout().document("kept", "Gallica").scans;
        write_pages(&scans, &[1]);
        add_job(&vault, "busy", "busy", DownloadJobStatus::Running).await;

        // Zero-hour window: everything is old enough.
        let report = vault.cleanup_stale_data(0).await.unwrap();
        assert_eq!(report.temp_dirs, 2);
        assert!(!idle.exists());
        assert!(!other_library.exists());
        assert!(busy.exists());
        assert!(scans.join(page_file_name(1)).exists());
    }

    #[tokio::test]
    async fn test_normalize_asset_states_counts_pages_on_disk() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        let doc = vault.layout().document("ms1", "Gallica");
        vault
            .upsert_manuscript(ManuscriptUpsert {
                total_canvases: Some(10),
                downloaded_canvases: Some(0),
                asset_state: Some(AssetState::Downloading),
                local_path: Some(doc.root.clone()),
                ..ManuscriptUpsert::new("ms1", "Gallica")
            })
            .await
            .unwrap();
        write_pages(&doc.scans, &[1, 2, 4, 5, 6]);
        write_pages(&vault.layout().staging_dir("ms1", "Gallica"), &[8, 9, 10]);

        let updated = vault.normalize_asset_states(200).await.unwrap();
        assert_eq!(updated, 1);

        let row = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
        assert_eq!(row.downloaded_canvases, 8);
        assert_eq!(row.asset_state().unwrap(), AssetState::Partial);
        assert_eq!(row.missing_pages(), vec![3, 7]);

        assert_eq!(vault.normalize_asset_states(200).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_normalize_asset_states_keeps_active_download() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        vault
            .upsert_manuscript(ManuscriptUpsert {
                total_canvases: Some(4),
                asset_state: Some(AssetState::Downloading),
                ..ManuscriptUpsert::new("ms1", "Gallica")
            })
            .await
            .unwrap();
        write_pages(&vault.layout().staging_dir("ms1", "Gallica"), &[1, 2]);
        add_job(&vault, "j1", "ms1", DownloadJobStatus::Running).await;

        vault.normalize_asset_states(200).await.unwrap();
        let row = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
        assert_eq!(row.asset_state().unwrap(), AssetState::Downloading);
        assert_eq!(row.downloaded_canvases, 2);
    }

    #[tokio::test]
    async fn test_normalize_asset_states_infers_total_from_pages() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        vault
            .upsert_manuscript(ManuscriptUpsert::new("ms1", "Gallica"))
            .await
            .unwrap();
        write_pages(&vault.layout().document("ms1", "Gallica").scans, &[1, 2, 3]);

        vault.normalize_asset_states(200).await.unwrap();
        let row = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
        assert_eq!(row.total_canvases, 3);
        assert_eq!(row.asset_state().unwrap(), AssetState::Complete);
    }

    #[tokio::test]
    async fn test_delete_manuscript_removes_rows_files_and_folder() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        let doc = vault.layout().document("ms1", "Gallica");
        write_pages(&doc.scans, &[1, 2]);
        vault
            .upsert_manuscript(ManuscriptUpsert {
                local_path: Some(doc.root.clone()),
                ..ManuscriptUpsert::new("ms1", "Gallica")
            })
            .await
            .unwrap();
        let snippet = doc.data.join("snip.jpg");
        std::fs::create_dir_all(&doc.data).unwrap();
        std::fs::write(&snippet, b"jpeg").unwrap();
        vault
            .save_snippet(&NewSnippet {
                doc_id: "ms1",
                library: "Gallica",
                page_num: 1,
                image_path: snippet.clone(),
                category: None,
                transcription: None,
                notes: None,
                coords: None,
            })
            .await
            .unwrap();
        add_job(&vault, "old", "ms1", DownloadJobStatus::Completed).await;

        vault.delete_manuscript("ms1", "Gallica").await.unwrap();

        assert!(vault.get_manuscript("ms1", "Gallica").await.unwrap().is_none());
        assert!(vault.get_download_job("old").await.unwrap().is_none());
        assert!(vault.list_snippets("ms1", "Gallica", None).await.unwrap().is_empty());
        assert!(!doc.root.exists());
        let leftovers: Vec<_> = std::fs::read_dir(doc.root.parent().unwrap())
            .unwrap()
            .collect();
        assert!(leftovers.is_empty(), "no parked folder should remain");
    }

    #[tokio::test]
    async fn test_delete_manuscript_refuses_active_download() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        vault
            .upsert_manuscript(ManuscriptUpsert::new("ms1", "Gallica"))
            .await
            .unwrap();
        add_job(&vault, "live", "ms1", DownloadJobStatus::Running).await;

        let err = vault.delete_manuscript("ms1", "Gallica").await.unwrap_err();
        assert!(matches!(err, VaultError::ActiveDownload { .. }));
        assert!(vault.get_manuscript("ms1", "Gallica").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_manuscript_never_removes_outside_root() {
        let (vault, dir) = Vault::in_memory_for_tests().await;
        let outside = dir.path().join("elsewhere").join("ms1");
        write_pages(&outside.join("scans"), &[1]);
        vault
            .upsert_manuscript(ManuscriptUpsert {
                local_path: Some(outside.clone()),
                ..ManuscriptUpsert::new("ms1", "Gallica")
            })
            .await
            .unwrap();

        vault.delete_manuscript("ms1", "Gallica").await.unwrap();
        assert!(outside.exists());
    }
}

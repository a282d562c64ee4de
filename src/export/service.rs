//! Export service: request validation and the export job body.

use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::artifacts::{
    self, batch_bundle_name, batch_item_name, export_stamp, resolve_selected_pages, single_pdf_name,
    single_zip_name,
};
use super::error::{ExportError, Result};
use super::formats::{ExportFormat, ensure_supported};
use crate::jobs::{ExportJobSpec, JobContext, JobManager, JobOutcome, JobSpec, TaskError, task_factory};
use crate::storage::{StorageLayout, sanitize_filename};
use crate::vault::{ExportItem, SelectionMode, Vault};

/// Default number of export PDFs kept per item.
pub const DEFAULT_MAX_EXPORTS_PER_ITEM: usize = 5;

/// Default age after which files under the exports root are pruned.
pub const DEFAULT_EXPORTS_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub max_exports_per_item: usize,
    pub exports_retention_days: u32,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            max_exports_per_item: DEFAULT_MAX_EXPORTS_PER_ITEM,
            exports_retention_days: DEFAULT_EXPORTS_RETENTION_DAYS,
        }
    }
}

/// Parameters of one export.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub items: Vec<ExportItem>,
    /// Format key, e.g. `pdf_images`.
    pub format: String,
    pub selection_mode: SelectionMode,
    /// 1-based pages; used only with [`SelectionMode::Custom`].
    pub selected_pages: Vec<u32>,
    pub destination: String,
    pub compression: String,
}

impl ExportRequest {
    #[must_use]
    pub fn new(items: Vec<ExportItem>, format: impl Into<String>) -> Self {
        Self {
            items,
            format: format.into(),
            selection_mode: SelectionMode::All,
            selected_pages: Vec::new(),
            destination: "local_filesystem".to_string(),
            compression: "standard".to_string(),
        }
    }

    #[must_use]
    pub fn with_pages(mut self, pages: Vec<u32>) -> Self {
        self.selection_mode = SelectionMode::Custom;
        self.selected_pages = pages;
        self
    }
}

/// Starts exports as jobs on the shared [`JobManager`].
#[derive(Clone)]
pub struct ExportService {
    vault: Vault,
    jobs: JobManager,
    settings: ExportSettings,
}

impl ExportService {
    #[must_use]
    pub fn new(vault: Vault, jobs: JobManager, settings: ExportSettings) -> Self {
        Self { vault, jobs, settings }
    }

    /// Validates the request and submits the export job; returns its id.
    ///
    /// Nothing is submitted when validation fails.
    ///
    /// # Errors
    ///
    /// Unknown or unavailable format/destination, unknown items, custom
    /// pages missing on disk, or a ledger failure while submitting.
    #[instrument(skip(self, request), fields(items = request.items.len(), format = %request.format))]
    pub async fn start(&self, request: ExportRequest) -> Result<String> {
        if request.items.is_empty() {
            return Err(ExportError::NoItems);
        }
        let (format, destination) = ensure_supported(&request.format, &request.destination)?;

        for item in &request.items {
            if self.vault.get_manuscript(&item.doc_id, &item.library).await?.is_none() {
                return Err(ExportError::ItemNotFound {
                    doc_id: item.doc_id.clone(),
                    library: item.library.clone(),
                });
            }
            let scans = self.vault.layout().document(&item.doc_id, &item.library).scans;
            resolve_selected_pages(&item.doc_id, &scans, request.selection_mode, &request.selected_pages)?;
        }

        let spec = JobSpec::Export(ExportJobSpec {
            items: request.items.clone(),
            export_format: format.as_str().to_string(),
            compression: request.compression.clone(),
            destination: destination.as_str().to_string(),
            selection_mode: request.selection_mode,
            selected_pages: request.selected_pages.clone(),
        });
        let run = ExportRun {
            layout: self.vault.layout().clone(),
            settings: self.settings.clone(),
            format,
            items: request.items,
            selection_mode: request.selection_mode,
            selected_pages: request.selected_pages,
        };
        let factory = task_factory(move |ctx| {
            let run = run.clone();
            async move { run.execute(ctx).await.map_err(|e| Box::new(e) as TaskError) }
        });

        let job_id = self.jobs.submit(spec, factory).await?;
        info!(job_id = %job_id, "export job submitted");
        Ok(job_id)
    }
}

/// Everything an export job needs, detached from the service.
#[derive(Debug, Clone)]
struct ExportRun {
    layout: StorageLayout,
    settings: ExportSettings,
    format: ExportFormat,
    items: Vec<ExportItem>,
    selection_mode: SelectionMode,
    selected_pages: Vec<u32>,
}

impl ExportRun {
    #[instrument(skip(self, ctx), fields(job_id = ctx.job_id(), format = %self.format))]
    async fn execute(self, ctx: JobContext) -> Result<JobOutcome> {
        let exports_dir = self.layout.exports_dir().to_path_buf();
        let retention = self.settings.exports_retention_days;
        let pruned = blocking(move || Ok(artifacts::prune_exports_dir(&exports_dir, retention))).await?;
        if pruned > 0 {
            debug!(pruned, "old exports removed");
        }

        let output = if self.items.len() == 1 {
            self.single(&ctx).await?
        } else {
            self.batch(&ctx).await?
        };
        info!(output = %output.display(), "export finished");
        Ok(JobOutcome::with_output(output))
    }

    /// One item: progress is a single 0 to 1 step.
    async fn single(&self, ctx: &JobContext) -> Result<PathBuf> {
        ctx.report(0, 1).await;
        let Some(item) = self.items.first() else {
            return Err(ExportError::NoItems);
        };
        let paths = self.layout.document(&item.doc_id, &item.library);
        let stamp = export_stamp();
        let zip = self.format == ExportFormat::ZipImages;

        let (doc_id, mode, requested) = (item.doc_id.clone(), self.selection_mode, self.selected_pages.clone());
        let keep = self.settings.max_exports_per_item;
        let output = blocking(move || {
            let pages = resolve_selected_pages(&doc_id, &paths.scans, mode, &requested)?;
            if zip {
                let target = paths.exports.join(single_zip_name(&doc_id, &stamp));
                artifacts::zip_pages(&paths.scans, &pages, &target)
            } else {
                let target = paths.pdf.join(single_pdf_name(&doc_id, mode, &pages, &stamp));
                let written = artifacts::pdf_pages(&paths.scans, &pages, &target)?;
                artifacts::prune_item_exports(&paths.pdf, keep);
                Ok(written)
            }
        })
        .await?;

        ctx.report(1, 1).await;
        Ok(output)
    }

    /// Many items: one artifact each under `{exports}/{job_id}/`, then a bundle.
    async fn batch(&self, ctx: &JobContext) -> Result<PathBuf> {
        let out_dir = self.layout.exports_dir().join(sanitize_filename(ctx.job_id()));
        tokio::fs::create_dir_all(&out_dir)
            .await
            .map_err(|e| ExportError::io(&out_dir, e))?;

        let total = u32::try_from(self.items.len()).unwrap_or(u32::MAX);
        let zip = self.format == ExportFormat::ZipImages;
        let mut produced = Vec::with_capacity(self.items.len());

        for (done, item) in (0u32..).zip(&self.items) {
            if ctx.should_cancel() {
                discard(&out_dir).await;
                return Err(ExportError::Cancelled);
            }
            ctx.report(done, total).await;

            let paths = self.layout.document(&item.doc_id, &item.library);
            let target = out_dir.join(batch_item_name(&item.doc_id, zip, &export_stamp()));
            let (doc_id, mode, requested) = (item.doc_id.clone(), self.selection_mode, self.selected_pages.clone());
            let artifact = blocking(move || {
                let pages = resolve_selected_pages(&doc_id, &paths.scans, mode, &requested)?;
                if zip {
                    artifacts::zip_pages(&paths.scans, &pages, &target)
                } else {
                    artifacts::pdf_pages(&paths.scans, &pages, &target)
                }
            })
            .await;
            match artifact {
                Ok(path) => produced.push(path),
                Err(e) => {
                    discard(&out_dir).await;
                    return Err(e);
                }
            }
            ctx.report(done + 1, total).await;
        }

        if ctx.should_cancel() {
            discard(&out_dir).await;
            return Err(ExportError::Cancelled);
        }
        let bundle_path = out_dir.join(batch_bundle_name(ctx.job_id(), &export_stamp()));
        blocking(move || artifacts::bundle(&produced, &bundle_path)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ExportError::io("<export task>", std::io::Error::other(e)))?
}

/// Removes a partially produced batch folder.
async fn discard(out_dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(out_dir).await {
        warn!(path = %out_dir.display(), error = %e, "failed to remove partial export");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::download::validate::tests::sample_jpeg;
    use crate::jobs::{JobManagerConfig, JobStatus};
    use crate::storage::page_file_name;
    use crate::vault::{ExportJobStatus, ManuscriptUpsert};

    async fn service_with(pages: &[u32]) -> (ExportService, Vault, tempfile::TempDir) {
        let (vault, dir) = Vault::in_memory_for_tests().await;
        vault.upsert_manuscript(ManuscriptUpsert::new("ms1", "Gallica")).await.unwrap();
        let paths = vault.layout().document("ms1", "Gallica");
        paths.ensure().await.unwrap();
        for &page in pages {
            std::fs::write(paths.page_path(page), sample_jpeg(30, 40)).unwrap();
        }
        let jobs = JobManager::new(Arc::new(vault.clone()), JobManagerConfig::default());
        (ExportService::new(vault.clone(), jobs, ExportSettings::default()), vault, dir)
    }

    #[tokio::test]
    async fn test_start_rejects_before_submitting() {
        let (service, vault, _dir) = service_with(&[1, 2]).await;

        let unknown = ExportRequest::new(vec![ExportItem::new("nope", "Gallica")], "zip_images");
        assert!(matches!(
            service.start(unknown).await,
            Err(ExportError::ItemNotFound { .. })
        ));

        let disabled = ExportRequest::new(vec![ExportItem::new("ms1", "Gallica")], "txt_transcription");
        assert!(matches!(
            service.start(disabled).await,
            Err(ExportError::FormatUnavailable(_))
        ));

        let missing = ExportRequest::new(vec![ExportItem::new("ms1", "Gallica")], "pdf_images").with_pages(vec![2, 7]);
        assert!(matches!(
            service.start(missing).await,
            Err(ExportError::PagesMissing { .. })
        ));

        assert!(vault.list_export_jobs(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_single_zip_export_completes_with_artifact() {
        let (service, vault, _dir) = service_with(&[1, 2, 3]).await;
        let request = ExportRequest::new(vec![ExportItem::new("ms1", "Gallica")], "zip_images").with_pages(vec![1, 3]);

        let job_id = service.start(request).await.unwrap();
        let snapshot = service.jobs.wait_for(&job_id).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
        assert_eq!((snapshot.current, snapshot.total), (1, 1));
        let output = snapshot.output_path.unwrap();
        assert!(output.exists());
        assert!(output.starts_with(vault.layout().document("ms1", "Gallica").exports));

        let row = vault.get_export_job(&job_id).await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), ExportJobStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_pdf_export_lands_in_item_pdf_folder() {
        let (service, vault, _dir) = service_with(&[1, 2]).await;
        let request = ExportRequest::new(vec![ExportItem::new("ms1", "Gallica")], "pdf_images");

        let job_id = service.start(request).await.unwrap();
        let snapshot = service.jobs.wait_for(&job_id).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
        let output = snapshot.output_path.unwrap();
        assert_eq!(output.parent().unwrap(), vault.layout().document("ms1", "Gallica").pdf);
        let name = output.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("ms1_export_full_"), "{name}");
    }

    #[tokio::test]
    async fn test_batch_export_bundles_every_item() {
        let (service, vault, _dir) = service_with(&[1]).await;
        vault.upsert_manuscript(ManuscriptUpsert::new("ms2", "Gallica")).await.unwrap();
        let other = vault.layout().document("ms2", "Gallica");
        other.ensure().await.unwrap();
        std::fs::write(other.scans.join(page_file_name(1)), sample_jpeg(30, 40)).unwrap();

        let request = ExportRequest::new(
            vec![ExportItem::new("ms1", "Gallica"), ExportItem::new("ms2", "Gallica")],
            "zip_images",
        );
        let job_id = service.start(request).await.unwrap();
        let snapshot = service.jobs.wait_for(&job_id).await.unwrap();

        assert_eq!(snapshot.status, JobStatus::Completed, "{:?}", snapshot.error);
        assert_eq!((snapshot.current, snapshot.total), (2, 2));
        let bundle = snapshot.output_path.unwrap();
        let name = bundle.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(&format!("export_batch_{job_id}_")), "{name}");

        let archive = zip::ZipArchive::new(std::fs::File::open(&bundle).unwrap()).unwrap();
        assert_eq!(archive.len(), 2);
    }
}

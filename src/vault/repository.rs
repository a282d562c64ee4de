//! Write seam between the job manager and the vault.
//!
//! The scheduler only needs a handful of job-row operations. Depending on
//! this trait instead of [`Vault`] keeps the scheduler testable against a
//! recording ledger and lets it hold an `Arc<dyn JobLedger>`.

use async_trait::async_trait;

use super::{
    DownloadJobUpdate, ExportJobUpdate, NewDownloadJob, NewExportJob, Result, Vault,
};

/// Data-access contract for job lifecycle mirroring.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Persists a new download-job row.
    async fn create_download_job(&self, job: &NewDownloadJob<'_>) -> Result<()>;

    /// Applies a status/progress update to a download-job row.
    async fn update_download_job(&self, job_id: &str, update: &DownloadJobUpdate) -> Result<()>;

    /// Persists a new export-job row.
    async fn create_export_job(&self, job: &NewExportJob<'_>) -> Result<()>;

    /// Applies a status/progress update to an export-job row.
    async fn update_export_job(&self, job_id: &str, update: &ExportJobUpdate) -> Result<()>;

    /// Rewrites 1-based queue positions of queued download jobs.
    async fn set_queue_positions(&self, ordered_job_ids: &[String]) -> Result<()>;

    /// Raises the persisted priority of a download job.
    async fn bump_download_priority(&self, job_id: &str) -> Result<()>;

    /// Deletes a terminal download-job row.
    async fn delete_download_job(&self, job_id: &str) -> Result<()>;

    /// Deletes a terminal export-job row.
    async fn delete_export_job(&self, job_id: &str) -> Result<()>;
}

#[async_trait]
impl JobLedger for Vault {
    async fn create_download_job(&self, job: &NewDownloadJob<'_>) -> Result<()> {
        Vault::create_download_job(self, job).await.map(|_| ())
    }

    async fn update_download_job(&self, job_id: &str, update: &DownloadJobUpdate) -> Result<()> {
        Vault::update_download_job(self, job_id, update).await
    }

    async fn create_export_job(&self, job: &NewExportJob<'_>) -> Result<()> {
        Vault::create_export_job(self, job).await.map(|_| ())
    }

    async fn update_export_job(&self, job_id: &str, update: &ExportJobUpdate) -> Result<()> {
        Vault::update_export_job(self, job_id, update).await
    }

    async fn set_queue_positions(&self, ordered_job_ids: &[String]) -> Result<()> {
        Vault::set_queue_positions(self, ordered_job_ids).await
    }

    async fn bump_download_priority(&self, job_id: &str) -> Result<()> {
        Vault::bump_download_priority(self, job_id).await
    }

    async fn delete_download_job(&self, job_id: &str) -> Result<()> {
        Vault::delete_download_job(self, job_id).await
    }

    async fn delete_export_job(&self, job_id: &str) -> Result<()> {
        Vault::delete_export_job(self, job_id).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::vault::DownloadJobStatus;

    async fn mark_running(ledger: &dyn JobLedger, job_id: &str) -> Result<()> {
        ledger
            .update_download_job(job_id, &DownloadJobUpdate::status(DownloadJobStatus::Running))
            .await
    }

    #[tokio::test]
    async fn test_job_ledger_trait_delegates_download_lifecycle() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        let ledger: &dyn JobLedger = &vault;

        ledger
            .create_download_job(&NewDownloadJob {
                job_id: "j1",
                doc_id: "ms1",
                library: "Gallica",
                manifest_url: "https://example.org/m.json",
                status: DownloadJobStatus::Queued,
            })
            .await
            .unwrap();
        mark_running(ledger, "j1").await.unwrap();
        ledger.bump_download_priority("j1").await.unwrap();

        let row = vault.get_download_job("j1").await.unwrap().unwrap();
        assert_eq!(row.status().unwrap(), DownloadJobStatus::Running);
        assert_eq!(row.priority, 1);
    }

    #[tokio::test]
    async fn test_job_ledger_trait_reports_unknown_job() {
        let (vault, _dir) = Vault::in_memory_for_tests().await;
        assert!(mark_running(&vault, "missing").await.is_err());
    }
}

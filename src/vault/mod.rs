//! Vault: the persisted ledger of manuscripts, download jobs and export jobs.
//!
//! The vault is the only source of truth that survives a restart. Workers
//! mirror every state change into it; readers (CLI, exports) never consult
//! in-memory scheduler state.
//!
//! # Overview
//!
//! - [`Vault`] - Handle over the database and the on-disk [`StorageLayout`]
//! - [`ManuscriptRecord`] / [`ManuscriptUpsert`] - Manuscript rows
//! - [`DownloadJobRecord`] / [`DownloadJobStatus`] - Download-job rows
//! - [`ExportJobRecord`] / [`ExportJobStatus`] - Export-job rows
//! - [`JobLedger`] - The narrow write seam used by the job manager
//!
//! Startup reconciliation ([`Vault::reset_active_downloads`],
//! [`Vault::cleanup_stale_data`], [`Vault::normalize_asset_states`]) lives in
//! `reconcile`.
//!
//! # Example
//!
//! ```ignore
//! use scriptorium_core::{Database, StorageLayout, Vault};
//!
//! let db = Database::open(Path::new("vault.db")).await?;
//! let vault = Vault::new(db, StorageLayout::under(Path::new(".")));
//! vault.reset_active_downloads(RESTART_MESSAGE).await?;
//! ```

mod download_job;
mod error;
mod export_job;
mod manuscript;
mod reconcile;
mod repository;
mod snippet;

pub use download_job::{DownloadJobRecord, DownloadJobStatus, DownloadJobUpdate, NewDownloadJob};
pub use error::{VaultDbErrorKind, VaultError};
pub use export_job::{
    ExportItem, ExportJobRecord, ExportJobStatus, ExportJobUpdate, ExportScope, NewExportJob,
    SelectionMode,
};
pub use manuscript::{AssetState, ManuscriptRecord, ManuscriptUpsert};
pub use reconcile::{CleanupReport, RESTART_MESSAGE, ResetSummary};
pub use repository::JobLedger;
pub use snippet::{NewSnippet, SnippetRecord};

use crate::db::Database;
use crate::storage::StorageLayout;

/// Result type for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`VaultError::JobNotFound`].
fn check_affected(job_id: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(VaultError::JobNotFound(job_id.to_string()))
    } else {
        Ok(())
    }
}

/// Handle over the ledger database and the storage roots it reconciles against.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Vault {
    db: Database,
    layout: StorageLayout,
}

impl Vault {
    /// Creates a vault over an opened (and migrated) database.
    #[must_use]
    pub fn new(db: Database, layout: StorageLayout) -> Self {
        Self { db, layout }
    }

    #[must_use]
    pub fn db(&self) -> &Database {
        &self.db
    }

    #[must_use]
    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// In-memory vault with storage roots under a fresh temporary directory.
    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub(crate) async fn in_memory_for_tests() -> (Self, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        let layout = StorageLayout::under(dir.path());
        (Self::new(db, layout), dir)
    }
}

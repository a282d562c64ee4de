//! Manuscript records and their upsert path.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, instrument};

use super::{Result, Vault, VaultError};
use crate::storage::normalize_library;

/// Asset state of a manuscript's local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetState {
    /// Registered, nothing on disk yet.
    Saved,
    /// An acquisition is writing pages.
    Downloading,
    /// Some pages are present, some are missing.
    Partial,
    /// Every page is present.
    Complete,
    /// The last acquisition failed outright.
    Error,
}

impl AssetState {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Downloading => "downloading",
            Self::Partial => "partial",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    /// State implied purely by page counters.
    #[must_use]
    pub fn from_counts(total: u32, downloaded: u32) -> Self {
        if downloaded == 0 {
            Self::Saved
        } else if total == 0 || downloaded >= total {
            Self::Complete
        } else {
            Self::Partial
        }
    }
}

impl fmt::Display for AssetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AssetState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "saved" => Ok(Self::Saved),
            "downloading" => Ok(Self::Downloading),
            "partial" => Ok(Self::Partial),
            "complete" => Ok(Self::Complete),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid asset state: {s}")),
        }
    }
}

/// A manuscript row.
#[derive(Debug, Clone, FromRow)]
pub struct ManuscriptRecord {
    pub doc_id: String,
    pub library: String,
    pub manifest_url: String,
    pub display_title: String,
    pub catalog_title: Option<String>,
    pub item_type: String,
    pub local_path: Option<String>,
    /// Stored as text, parsed via `asset_state()`.
    #[sqlx(rename = "asset_state")]
    pub asset_state_str: String,
    pub total_canvases: i64,
    pub downloaded_canvases: i64,
    pub missing_pages_json: String,
    pub has_native_pdf: bool,
    pub user_notes: Option<String>,
    pub metadata_json: Option<String>,
    pub error_log: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ManuscriptRecord {
    /// Parses the stored asset state.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::InvalidStatus`] for an unknown value.
    pub fn asset_state(&self) -> Result<AssetState> {
        self.asset_state_str
            .parse()
            .map_err(|_| VaultError::InvalidStatus {
                table: "manuscripts",
                status: self.asset_state_str.clone(),
            })
    }

    /// Missing page numbers (1-based). A malformed column reads as empty.
    #[must_use]
    pub fn missing_pages(&self) -> Vec<u32> {
        serde_json::from_str(&self.missing_pages_json).unwrap_or_default()
    }

    #[must_use]
    pub fn total(&self) -> u32 {
        u32::try_from(self.total_canvases).unwrap_or(0)
    }

    #[must_use]
    pub fn downloaded(&self) -> u32 {
        u32::try_from(self.downloaded_canvases).unwrap_or(0)
    }
}

/// Partial manuscript write. `None` fields keep the stored value (or the
/// column default on first insert).
#[derive(Debug, Clone, Default)]
pub struct ManuscriptUpsert {
    pub doc_id: String,
    pub library: String,
    pub manifest_url: Option<String>,
    pub display_title: Option<String>,
    pub catalog_title: Option<String>,
    pub item_type: Option<String>,
    pub local_path: Option<PathBuf>,
    pub asset_state: Option<AssetState>,
    pub total_canvases: Option<u32>,
    pub downloaded_canvases: Option<u32>,
    pub missing_pages: Option<Vec<u32>>,
    pub has_native_pdf: Option<bool>,
    pub user_notes: Option<String>,
    pub metadata_json: Option<String>,
    pub error_log: Option<String>,
}

impl ManuscriptUpsert {
    /// Starts an upsert for one manuscript identity.
    #[must_use]
    pub fn new(doc_id: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            library: library.into(),
            ..Self::default()
        }
    }
}

/// Fully merged row, ready to be written.
struct MergedManuscript {
    manifest_url: String,
    display_title: String,
    catalog_title: Option<String>,
    item_type: String,
    local_path: Option<String>,
    asset_state: AssetState,
    total: u32,
    downloaded: u32,
    missing_pages_json: String,
    has_native_pdf: bool,
    user_notes: Option<String>,
    metadata_json: Option<String>,
    error_log: Option<String>,
}

fn merge(existing: Option<&ManuscriptRecord>, upsert: ManuscriptUpsert) -> Result<MergedManuscript> {
    let total = upsert
        .total_canvases
        .or(existing.map(ManuscriptRecord::total))
        .unwrap_or(0);
    let mut downloaded = upsert
        .downloaded_canvases
        .or(existing.map(ManuscriptRecord::downloaded))
        .unwrap_or(0);
    if total > 0 && downloaded > total {
        downloaded = total;
    }

    let stored_state = existing.map(ManuscriptRecord::asset_state).transpose()?;
    let asset_state = upsert
        .asset_state
        .or(stored_state)
        .unwrap_or(AssetState::Saved);

    let mut missing = upsert
        .missing_pages
        .or_else(|| existing.map(ManuscriptRecord::missing_pages))
        .unwrap_or_default();
    if asset_state == AssetState::Complete {
        missing.clear();
    }
    missing.sort_unstable();
    missing.dedup();
    let missing_pages_json =
        serde_json::to_string(&missing).map_err(|e| VaultError::json("missing_pages_json", &e))?;

    let display_title = upsert
        .display_title
        .filter(|title| !title.trim().is_empty())
        .or_else(|| existing.map(|row| row.display_title.clone()))
        .filter(|title| !title.trim().is_empty())
        .unwrap_or_else(|| upsert.doc_id.clone());

    Ok(MergedManuscript {
        manifest_url: upsert
            .manifest_url
            .or_else(|| existing.map(|row| row.manifest_url.clone()))
            .unwrap_or_default(),
        display_title,
        catalog_title: upsert
            .catalog_title
            .or_else(|| existing.and_then(|row| row.catalog_title.clone())),
        item_type: upsert
            .item_type
            .or_else(|| existing.map(|row| row.item_type.clone()))
            .unwrap_or_else(|| "unclassified".to_string()),
        local_path: upsert
            .local_path
            .map(|path| path.to_string_lossy().into_owned())
            .or_else(|| existing.and_then(|row| row.local_path.clone())),
        asset_state,
        total,
        downloaded,
        missing_pages_json,
        has_native_pdf: upsert
            .has_native_pdf
            .or(existing.map(|row| row.has_native_pdf))
            .unwrap_or(false),
        user_notes: upsert
            .user_notes
            .or_else(|| existing.and_then(|row| row.user_notes.clone())),
        metadata_json: upsert
            .metadata_json
            .or_else(|| existing.and_then(|row| row.metadata_json.clone())),
        error_log: upsert
            .error_log
            .or_else(|| existing.and_then(|row| row.error_log.clone())),
    })
}

impl Vault {
    /// Inserts or updates a manuscript keyed by `(doc_id, library)`.
    ///
    /// The read-merge-write runs in one transaction so concurrent writers
    /// never observe or produce a half-updated row. Counters are clamped so
    /// `downloaded <= total`, and a `complete` row never lists missing pages.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the transaction fails.
    #[instrument(skip(self, upsert), fields(doc_id = %upsert.doc_id, library = %upsert.library))]
    pub async fn upsert_manuscript(&self, mut upsert: ManuscriptUpsert) -> Result<ManuscriptRecord> {
        upsert.library = normalize_library(&upsert.library);
        let doc_id = upsert.doc_id.clone();
        let library = upsert.library.clone();

        let mut tx = self.db.pool().begin().await?;
        let existing = sqlx::query_as::<_, ManuscriptRecord>(
            r"SELECT * FROM manuscripts WHERE doc_id = ? AND library = ?",
        )
        .bind(&doc_id)
        .bind(&library)
        .fetch_optional(&mut *tx)
        .await?;

        let merged = merge(existing.as_ref(), upsert)?;

        let row = sqlx::query_as::<_, ManuscriptRecord>(
            r"INSERT INTO manuscripts (
                doc_id, library, manifest_url, display_title, catalog_title, item_type,
                local_path, asset_state, total_canvases, downloaded_canvases,
                missing_pages_json, has_native_pdf, user_notes, metadata_json, error_log
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
              ON CONFLICT(doc_id, library) DO UPDATE SET
                manifest_url = excluded.manifest_url,
                display_title = excluded.display_title,
                catalog_title = excluded.catalog_title,
                item_type = excluded.item_type,
                local_path = excluded.local_path,
                asset_state = excluded.asset_state,
                total_canvases = excluded.total_canvases,
                downloaded_canvases = excluded.downloaded_canvases,
                missing_pages_json = excluded.missing_pages_json,
                has_native_pdf = excluded.has_native_pdf,
                user_notes = excluded.user_notes,
                metadata_json = excluded.metadata_json,
                error_log = excluded.error_log,
                updated_at = datetime('now')
              RETURNING *",
        )
        .bind(&doc_id)
        .bind(&library)
        .bind(&merged.manifest_url)
        .bind(&merged.display_title)
        .bind(&merged.catalog_title)
        .bind(&merged.item_type)
        .bind(&merged.local_path)
        .bind(merged.asset_state.as_str())
        .bind(i64::from(merged.total))
        .bind(i64::from(merged.downloaded))
        .bind(&merged.missing_pages_json)
        .bind(merged.has_native_pdf)
        .bind(&merged.user_notes)
        .bind(&merged.metadata_json)
        .bind(&merged.error_log)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(asset_state = %merged.asset_state, "manuscript upserted");
        Ok(row)
    }

    /// Gets a manuscript by identity.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_manuscript(&self, doc_id: &str, library: &str) -> Result<Option<ManuscriptRecord>> {
        let row = sqlx::query_as::<_, ManuscriptRecord>(
            r"SELECT * FROM manuscripts WHERE doc_id = ? AND library = ?",
        )
        .bind(doc_id)
        .bind(normalize_library(library))
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Lists manuscripts, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_manuscripts(&self, limit: u32) -> Result<Vec<ManuscriptRecord>> {
        let rows = sqlx::query_as::<_, ManuscriptRecord>(
            r"SELECT * FROM manuscripts ORDER BY updated_at DESC, doc_id ASC LIMIT ?",
        )
        .bind(i64::from(limit.max(1)))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Finds manuscripts whose identifier, titles or library contain `query`,
    /// most recently updated first. A blank query matches everything.
    ///
    /// `%` and `_` in the query match literally.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn search_manuscripts(&self, query: &str) -> Result<Vec<ManuscriptRecord>> {
        let pattern = format!("%{}%", escape_like(query.trim()));
        let rows = sqlx::query_as::<_, ManuscriptRecord>(
            r"SELECT * FROM manuscripts
              WHERE doc_id LIKE ?1 ESCAPE '\'
                 OR display_title LIKE ?1 ESCAPE '\'
                 OR COALESCE(catalog_title, '') LIKE ?1 ESCAPE '\'
                 OR library LIKE ?1 ESCAPE '\'
              ORDER BY updated_at DESC, doc_id ASC",
        )
        .bind(pattern)
        .fetch_all(self.db.pool())
        .await?;
        debug!(matches = rows.len(), "manuscript search");
        Ok(rows)
    }

    /// Replaces the free-text notes of a manuscript.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::ManuscriptNotFound`] if the manuscript does not exist.
    #[instrument(skip(self, notes))]
    pub async fn update_manuscript_notes(&self, doc_id: &str, library: &str, notes: &str) -> Result<()> {
        let library = normalize_library(library);
        let result = sqlx::query(
            r"UPDATE manuscripts SET user_notes = ?, updated_at = datetime('now')
              WHERE doc_id = ? AND library = ?",
        )
        .bind(notes)
        .bind(doc_id)
        .bind(&library)
        .execute(self.db.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(VaultError::ManuscriptNotFound {
                doc_id: doc_id.to_string(),
                library,
            });
        }
        Ok(())
    }
}

fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

//! Page snippets (cropped regions with notes) owned by a manuscript.

use std::path::PathBuf;

use sqlx::FromRow;
use tracing::{instrument, warn};

use super::{Result, Vault, VaultError};
use crate::storage::normalize_library;

/// A snippet row.
#[derive(Debug, Clone, FromRow)]
pub struct SnippetRecord {
    pub id: i64,
    pub doc_id: String,
    pub library: String,
    pub page_num: i64,
    pub image_path: String,
    pub category: Option<String>,
    pub transcription: Option<String>,
    pub notes: Option<String>,
    pub coords_json: Option<String>,
    pub created_at: String,
}

/// Fields for a new snippet.
#[derive(Debug, Clone)]
pub struct NewSnippet<'a> {
    pub doc_id: &'a str,
    pub library: &'a str,
    pub page_num: u32,
    pub image_path: PathBuf,
    pub category: Option<&'a str>,
    pub transcription: Option<&'a str>,
    pub notes: Option<&'a str>,
    /// Crop rectangle `[x, y, width, height]` in page pixels.
    pub coords: Option<[u32; 4]>,
}

impl Vault {
    /// Stores a snippet and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the insert fails.
    #[instrument(skip(self, snippet), fields(doc_id = snippet.doc_id, page = snippet.page_num))]
    pub async fn save_snippet(&self, snippet: &NewSnippet<'_>) -> Result<i64> {
        let coords_json = snippet
            .coords
            .map(|c| serde_json::to_string(&c))
            .transpose()
            .map_err(|e| VaultError::json("coords_json", &e))?;
        let (id,): (i64,) = sqlx::query_as(
            r"INSERT INTO snippets (
                doc_id, library, page_num, image_path, category, transcription, notes, coords_json
              )
              VALUES (?, ?, ?, ?, ?, ?, ?, ?)
              RETURNING id",
        )
        .bind(snippet.doc_id)
        .bind(normalize_library(snippet.library))
        .bind(i64::from(snippet.page_num))
        .bind(snippet.image_path.to_string_lossy().into_owned())
        .bind(snippet.category)
        .bind(snippet.transcription)
        .bind(snippet.notes)
        .bind(coords_json)
        .fetch_one(self.db.pool())
        .await?;
        Ok(id)
    }

    /// Lists snippets of a manuscript, optionally for a single page.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_snippets(
        &self,
        doc_id: &str,
        library: &str,
        page: Option<u32>,
    ) -> Result<Vec<SnippetRecord>> {
        let rows = sqlx::query_as::<_, SnippetRecord>(
            r"SELECT * FROM snippets
              WHERE doc_id = ? AND library = ? AND (? IS NULL OR page_num = ?)
              ORDER BY page_num ASC, id ASC",
        )
        .bind(doc_id)
        .bind(normalize_library(library))
        .bind(page.map(i64::from))
        .bind(page.map(i64::from))
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    /// Deletes a snippet row and its image file.
    ///
    /// Returns false when no such snippet exists.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_snippet(&self, id: i64) -> Result<bool> {
        let path: Option<(String,)> =
            sqlx::query_as(r"DELETE FROM snippets WHERE id = ? RETURNING image_path")
                .bind(id)
                .fetch_optional(self.db.pool())
                .await?;
        let Some((path,)) = path else {
            return Ok(false);
        };
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path, error = %e, "failed to remove snippet image");
        }
        Ok(true)
    }
}

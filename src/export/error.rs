//! Export error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::jobs::JobError;
use crate::pdf::PdfError;
use crate::vault::VaultError;

/// Errors raised while validating or running an export.
///
/// Validation variants are returned by [`ExportService::start`](super::ExportService::start)
/// before any job exists; the rest end a running export job as `error`.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("no items selected for export")]
    NoItems,

    #[error("manuscript not found: {library}::{doc_id}")]
    ItemNotFound { doc_id: String, library: String },

    #[error("unknown export format: {0}")]
    UnknownFormat(String),

    #[error("export format not available in this version: {0}")]
    FormatUnavailable(String),

    #[error("unknown export destination: {0}")]
    UnknownDestination(String),

    #[error("export destination not available in this version: {0}")]
    DestinationUnavailable(String),

    #[error("invalid page selection '{input}': {reason}")]
    InvalidSelection { input: String, reason: String },

    #[error("custom selection is empty: give at least one page or range")]
    EmptySelection,

    #[error("{doc_id} has no local page images")]
    NoLocalPages { doc_id: String },

    #[error("pages not available locally for {doc_id}: {pages:?}")]
    PagesMissing { doc_id: String, pages: Vec<u32> },

    #[error("export cancelled by user")]
    Cancelled,

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Pdf(#[from] PdfError),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Job(#[from] JobError),
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for export operations.
pub type Result<T> = std::result::Result<T, ExportError>;

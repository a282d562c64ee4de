//! Export capabilities and request parsing.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::error::{ExportError, Result};
use crate::vault::ExportItem;

/// Every export format the application knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    PdfImages,
    ZipImages,
    PdfSearchable,
    PdfFacing,
    TxtTranscription,
    MdTranscription,
}

/// Shape of the artifact a format produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Binary,
    Bundle,
    Text,
}

impl ExportFormat {
    pub const ALL: [Self; 6] = [
        Self::PdfImages,
        Self::ZipImages,
        Self::PdfSearchable,
        Self::PdfFacing,
        Self::TxtTranscription,
        Self::MdTranscription,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PdfImages => "pdf_images",
            Self::ZipImages => "zip_images",
            Self::PdfSearchable => "pdf_searchable",
            Self::PdfFacing => "pdf_facing",
            Self::TxtTranscription => "txt_transcription",
            Self::MdTranscription => "md_transcription",
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::PdfImages => "PDF (images only)",
            Self::ZipImages => "ZIP of images",
            Self::PdfSearchable => "Searchable PDF (planned)",
            Self::PdfFacing => "PDF with facing text (planned)",
            Self::TxtTranscription => "TXT transcription (planned)",
            Self::MdTranscription => "Markdown transcription (planned)",
        }
    }

    /// Whether this build can produce the format.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::PdfImages | Self::ZipImages)
    }

    #[must_use]
    pub fn output_kind(&self) -> OutputKind {
        match self {
            Self::ZipImages => OutputKind::Bundle,
            Self::TxtTranscription | Self::MdTranscription => OutputKind::Text,
            Self::PdfImages | Self::PdfSearchable | Self::PdfFacing => OutputKind::Binary,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|format| format.as_str() == wanted)
            .ok_or_else(|| ExportError::UnknownFormat(s.to_string()))
    }
}

/// Where the artifact is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportDestination {
    LocalFilesystem,
    GoogleDrive,
}

impl ExportDestination {
    pub const ALL: [Self; 2] = [Self::LocalFilesystem, Self::GoogleDrive];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalFilesystem => "local_filesystem",
            Self::GoogleDrive => "google_drive",
        }
    }

    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::LocalFilesystem => "Local file",
            Self::GoogleDrive => "Google Drive (planned)",
        }
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(self, Self::LocalFilesystem)
    }
}

impl fmt::Display for ExportDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportDestination {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|destination| destination.as_str() == wanted)
            .ok_or_else(|| ExportError::UnknownDestination(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormatCapability {
    pub key: &'static str,
    pub label: &'static str,
    pub available: bool,
    pub output_kind: OutputKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestinationCapability {
    pub key: &'static str,
    pub label: &'static str,
    pub available: bool,
}

/// Declared formats and destinations, with their availability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportCapabilities {
    pub formats: Vec<FormatCapability>,
    pub destinations: Vec<DestinationCapability>,
}

#[must_use]
pub fn capabilities() -> ExportCapabilities {
    ExportCapabilities {
        formats: ExportFormat::ALL
            .iter()
            .map(|f| FormatCapability {
                key: f.as_str(),
                label: f.label(),
                available: f.is_available(),
                output_kind: f.output_kind(),
            })
            .collect(),
        destinations: ExportDestination::ALL
            .iter()
            .map(|d| DestinationCapability {
                key: d.as_str(),
                label: d.label(),
                available: d.is_available(),
            })
            .collect(),
    }
}

/// Parses a format and destination pair, rejecting declared-but-disabled ones.
///
/// # Errors
///
/// Unknown or unavailable format or destination.
pub fn ensure_supported(format: &str, destination: &str) -> Result<(ExportFormat, ExportDestination)> {
    let format: ExportFormat = format.parse()?;
    if !format.is_available() {
        return Err(ExportError::FormatUnavailable(format.to_string()));
    }
    let destination: ExportDestination = destination.parse()?;
    if !destination.is_available() {
        return Err(ExportError::DestinationUnavailable(destination.to_string()));
    }
    Ok((format, destination))
}

/// Parses `library::doc_id|library::doc_id` into unique items, in order.
///
/// Tokens without `::` or with an empty side are ignored.
#[must_use]
pub fn parse_items_csv(raw: &str) -> Vec<ExportItem> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for token in raw.split('|') {
        let Some((library, doc_id)) = token.trim().split_once("::") else {
            continue;
        };
        let (library, doc_id) = (library.trim(), doc_id.trim());
        if library.is_empty() || doc_id.is_empty() {
            continue;
        }
        if seen.insert((library.to_string(), doc_id.to_string())) {
            items.push(ExportItem::new(doc_id, library));
        }
    }
    items
}

/// Parses `1,3-5,9` into sorted unique 1-based page numbers.
///
/// Ranges may be written backwards (`5-3`). Blank input yields no pages.
///
/// # Errors
///
/// [`ExportError::InvalidSelection`] for non-numeric or non-positive pages.
pub fn parse_page_selection(raw: &str) -> Result<Vec<u32>> {
    let mut pages = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('-') {
            None => {
                pages.insert(positive_page(raw, token)?);
            }
            Some((left, right)) => {
                let start = positive_page(raw, left.trim())?;
                let end = positive_page(raw, right.trim())?;
                let (start, end) = if end < start { (end, start) } else { (start, end) };
                pages.extend(start..=end);
            }
        }
    }
    Ok(pages.into_iter().collect())
}

fn positive_page(input: &str, token: &str) -> Result<u32> {
    let invalid = |reason: String| ExportError::InvalidSelection {
        input: input.to_string(),
        reason,
    };
    let value: u32 = token
        .parse()
        .map_err(|_| invalid(format!("'{token}' is not a page number")))?;
    if value == 0 {
        return Err(invalid("page numbers start at 1".to_string()));
    }
    Ok(value)
}

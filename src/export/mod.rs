//! Export pipeline: page images out of the vault as zip or PDF artifacts.
//!
//! # Overview
//!
//! - [`ExportService::start`] - Validates a request and submits it as an export job
//! - [`capabilities`] - Declared formats and destinations with availability
//! - [`parse_items_csv`] / [`parse_page_selection`] - Request parsing helpers
//! - [`list_item_pdf_files`] - PDFs stored for one manuscript, classified
//!
//! A single-item export writes next to the item (`exports/` for zips, `pdf/`
//! for PDFs). A batch writes one artifact per item under
//! `{exports_dir}/{job_id}/` and bundles them into one archive, which becomes
//! the job's `output_path`.
//!
//! # Example
//!
//! ```ignore
//! let service = ExportService::new(vault, jobs, ExportSettings::default());
//! let items = parse_items_csv("Gallica::btv1b8452439q");
//! let request = ExportRequest::new(items, "pdf_images").with_pages(parse_page_selection("1-4")?);
//! let job_id = service.start(request).await?;
//! ```

mod artifacts;
mod error;
mod formats;
mod service;

pub use artifacts::{
    PdfFileEntry, PdfKind, batch_bundle_name, export_stamp, list_item_pdf_files, prune_exports_dir,
    prune_item_exports, resolve_selected_pages, single_pdf_name, single_zip_name,
};
pub use error::{ExportError, Result};
pub use formats::{
    DestinationCapability, ExportCapabilities, ExportDestination, ExportFormat, FormatCapability,
    OutputKind, capabilities, ensure_supported, parse_items_csv, parse_page_selection,
};
pub use service::{
    DEFAULT_EXPORTS_RETENTION_DAYS, DEFAULT_MAX_EXPORTS_PER_ITEM, ExportRequest, ExportService,
    ExportSettings,
};

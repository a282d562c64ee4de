//! Scriptorium Core Library
//!
//! Resumable acquisition of IIIF manuscripts into a local vault, a job
//! scheduler that survives restarts, and export of the acquired pages.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`db`] - Database connection and schema management
//! - [`storage`] - On-disk layout of manuscripts, staging and exports
//! - [`vault`] - Persisted ledger of manuscripts, download and export jobs
//! - [`manifest`] - IIIF Presentation v2/v3 adapters and candidate URLs
//! - [`download`] - HTTP client, retries, host throttling, acquisition pipeline
//! - [`pdf`] - Images-only PDF writer and embedded JPEG extraction
//! - [`jobs`] - Job manager: queue, concurrency ceiling, cancel and progress
//! - [`export`] - Zip and PDF export jobs
//! - [`config`] - Config file parsing and merged settings

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod export;
pub mod jobs;
pub mod manifest;
pub mod pdf;
pub mod storage;
pub mod vault;

// Re-export commonly used types
pub use config::{FileConfig, LoadedConfig, Settings, load_config, parse_config_str};
pub use db::{Database, DbError};
pub use download::{
    AcquireError, AcquireReport, AcquireRequest, AcquireSettings, AcquireSource, AcquisitionPipeline,
    DownloadError, FailureType, HostThrottle, HttpClient, PreparedManuscript, RetryDecision, RetryPolicy,
    classify_error,
};
pub use export::{
    ExportError, ExportFormat, ExportRequest, ExportService, ExportSettings, capabilities,
    list_item_pdf_files, parse_items_csv, parse_page_selection,
};
pub use jobs::{
    JobContext, JobError, JobKind, JobManager, JobManagerConfig, JobOutcome, JobSnapshot, JobSpec,
    JobStatus, TaskError, TaskFactory, task_factory,
};
pub use manifest::{Manifest, ManifestError, PageRef};
pub use storage::{DocumentPaths, StorageLayout};
pub use vault::{
    AssetState, ExportItem, ManuscriptRecord, ManuscriptUpsert, RESTART_MESSAGE, SelectionMode, Vault,
    VaultError,
};

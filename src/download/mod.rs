//! Page acquisition: HTTP fetching, retries, host throttling and the pipeline.
//!
//! # Overview
//!
//! - [`HttpClient`] - Shared client with connect/read timeouts and image checks
//! - [`RetryPolicy`] / [`classify_error`] - Linear-backoff passes over candidate URLs
//! - [`HostThrottle`] - Minimum spacing and 429 backoff, keyed by host
//! - [`AcquisitionPipeline`] - Manifest to validated page files, resumable
//!
//! # Example
//!
//! ```ignore
//! let pipeline = AcquisitionPipeline::new(vault, HttpClient::new(), throttle, AcquireSettings::default());
//! let prepared = pipeline.prepare(manifest_url, "Gallica", None).await?;
//! let report = pipeline.acquire(prepared.request(), &ctx).await?;
//! println!("{} pages, {} failed", report.succeeded.len(), report.failed.len());
//! ```

mod client;
mod constants;
mod error;
mod pipeline;
mod retry;
mod throttle;
mod tiles;
pub(crate) mod validate;

pub use client::{FetchedImage, HttpClient};
pub use constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_BACKOFF_STEP, DEFAULT_PAGE_WORKERS, DEFAULT_RETRY_PASSES,
    DEFAULT_THROTTLE_BACKOFF, READ_TIMEOUT_SECS, default_user_agent,
};
pub use error::DownloadError;
pub use pipeline::{
    AcquireError, AcquireReport, AcquireRequest, AcquireSettings, AcquireSource, AcquisitionPipeline,
    ImageStat, PreparedManuscript,
};
pub use retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
pub use throttle::{HostThrottle, extract_host, parse_retry_after};
pub use validate::{inspect_image_bytes, inspect_image_file};

// Module-local Result aliases are not defined here; signatures spell out
// `Result<T, DownloadError>`.

//! Constants for the download module (timeouts, pacing, retries).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large native PDFs).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default number of passes over a page's candidate list.
pub const DEFAULT_RETRY_PASSES: u32 = 5;

/// Default linear backoff step between passes.
pub const DEFAULT_BACKOFF_STEP: Duration = Duration::from_millis(1000);

/// Default per-manuscript page pool width.
pub const DEFAULT_PAGE_WORKERS: usize = 4;

/// Back-off applied to a host answering 429 without a usable Retry-After.
pub const DEFAULT_THROTTLE_BACKOFF: Duration = Duration::from_secs(15);

/// Warning threshold for cumulative throttling delay per host (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After header value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/scriptorium-iiif/scriptorium";

/// User-Agent sent with every request.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("scriptorium/{version} (iiif-manuscript-archiver; +{PROJECT_UA_URL})")
}

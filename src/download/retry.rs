//! Retry passes with linear backoff for page downloads.
//!
//! A page is fetched by walking its candidate URL list; one walk is a
//! *pass*. When every candidate of a pass fails, the [`RetryPolicy`] decides
//! whether another pass runs and how long to wait before it:
//!
//! ```text
//! delay before pass n+1 = step * n + jitter
//! ```
//!
//! Individual failures are classified with [`classify_error`]. Permanent
//! failures (404, malformed URL) drop that candidate from later passes;
//! everything else (timeouts, 5xx, non-image bodies, empty bodies) is
//! transient.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;
use super::constants::{DEFAULT_BACKOFF_STEP, DEFAULT_RETRY_PASSES};

/// Classification of download failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on a later pass.
    ///
    /// Examples: timeout, 5xx, HTML error page, zero-byte body.
    Transient,

    /// Failure that will not change on retry.
    ///
    /// Examples: 404 Not Found, 400 Bad Request, invalid URL.
    Permanent,

    /// Server rate limiting (HTTP 429).
    ///
    /// Retried, after the host throttle's back-off.
    RateLimited,
}

/// Decision on whether to run another pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another pass after the specified delay.
    Retry {
        delay: Duration,
        /// 1-indexed number of the pass about to run.
        pass: u32,
    },

    /// Give up on the page.
    DoNotRetry { reason: String },
}

/// Linear retry policy.
///
/// # Default Values
///
/// - `max_passes`: 5
/// - `step`: 1 second
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of passes (including the first).
    max_passes: u32,

    /// Backoff added per completed pass.
    step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_passes: DEFAULT_RETRY_PASSES,
            step: DEFAULT_BACKOFF_STEP,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_passes` is clamped to at least one.
    #[must_use]
    pub fn new(max_passes: u32, step: Duration) -> Self {
        Self {
            max_passes: max_passes.max(1),
            step,
        }
    }

    /// Single pass, no waiting.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    #[must_use]
    pub fn max_passes(&self) -> u32 {
        self.max_passes
    }

    #[must_use]
    pub fn step(&self) -> Duration {
        self.step
    }

    /// Decides whether to run another pass after `pass` (1-indexed) failed.
    #[instrument(skip(self), fields(max_passes = self.max_passes))]
    pub fn should_retry(&self, failure_type: FailureType, pass: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if pass >= self.max_passes {
            debug!(pass, max = self.max_passes, "max passes reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max passes ({}) exhausted", self.max_passes),
            };
        }

        let delay = self.delay_after(pass);
        debug!(pass, next_pass = pass + 1, delay_ms = delay.as_millis(), "will retry");
        RetryDecision::Retry {
            delay,
            pass: pass + 1,
        }
    }

    /// `step * pass`, plus up to a quarter step of jitter.
    fn delay_after(&self, pass: u32) -> Duration {
        let base = self.step.saturating_mul(pass);
        let jitter_cap = u64::try_from(self.step.as_millis() / 4).unwrap_or(u64::MAX);
        if jitter_cap == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        base + Duration::from_millis(jitter)
    }
}

/// Classifies a download error for retry decisions.
///
/// | Error | Type |
/// |-------|------|
/// | 429 | RateLimited |
/// | 408, 5xx | Transient |
/// | other 4xx | Permanent |
/// | Timeout, Network | Transient |
/// | NonImageContent, EmptyBody, UndecodableImage | Transient |
/// | InvalidJson | Transient |
/// | Io, InvalidUrl | Permanent |
#[instrument]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. }
        | DownloadError::Network { .. }
        | DownloadError::NonImageContent { .. }
        | DownloadError::EmptyBody { .. }
        | DownloadError::UndecodableImage { .. }
        | DownloadError::InvalidJson { .. } => FailureType::Transient,
        DownloadError::Io { .. } | DownloadError::InvalidUrl { .. } => FailureType::Permanent,
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        408 => FailureType::Transient, // Request Timeout
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        // 3xx that were not followed, 1xx: let another pass try.
        _ => FailureType::Transient,
    }
}

//! Per-host request pacing and shared 429 back-off.
//!
//! Every page worker of every running job goes through one [`HostThrottle`]
//! before hitting the network. Requests to one host are spaced by a minimum
//! interval; a 429 from a host pauses *all* workers talking to that host
//! until the server's `Retry-After` (or a default back-off) has elapsed.
//! Requests to different hosts never wait for each other.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, DEFAULT_THROTTLE_BACKOFF, MAX_RETRY_AFTER};

/// Per-host throttle shared across page workers (wrap in `Arc`).
///
/// Uses `DashMap` for per-host state and a `tokio::sync::Mutex` per host
/// so the check-and-update of the last request time is atomic.
#[derive(Debug)]
pub struct HostThrottle {
    /// Minimum spacing between two requests to the same host.
    min_interval: Duration,

    disabled: bool,

    /// Uses Arc so the `DashMap` shard lock is released before awaiting.
    hosts: DashMap<String, Arc<HostState>>,
}

#[derive(Debug)]
struct HostState {
    /// `None` until the first request (first request is immediate).
    last_request: Mutex<Option<Instant>>,

    /// Back-off deadline set by a 429 answer.
    backoff_until: std::sync::Mutex<Option<Instant>>,

    cumulative_delay_ms: AtomicU64,
}

impl HostState {
    fn new() -> Self {
        Self {
            last_request: Mutex::new(None),
            backoff_until: std::sync::Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            .saturating_add(delay_ms);
        Duration::from_millis(new_total)
    }

    fn backoff_deadline(&self) -> Option<Instant> {
        *self
            .backoff_until
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl HostThrottle {
    /// Creates a throttle spacing same-host requests by `min_interval`.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = min_interval.as_millis()))]
    pub fn new(min_interval: Duration) -> Self {
        debug!("creating host throttle");
        Self {
            min_interval,
            disabled: false,
            hosts: DashMap::new(),
        }
    }

    /// Throttle that never waits (429 back-off included).
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            min_interval: Duration::ZERO,
            disabled: true,
            hosts: DashMap::new(),
        }
    }

    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn state(&self, host: &str) -> Arc<HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostState::new()))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed.
    #[instrument(skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        if self.disabled {
            return;
        }
        let host = extract_host(url);
        tracing::Span::current().record("host", &host);
        let state = self.state(&host);

        let mut last_request = state.last_request.lock().await;

        if let Some(deadline) = state.backoff_deadline() {
            let now = Instant::now();
            if deadline > now {
                let wait = deadline - now;
                debug!(host = %host, wait_ms = wait.as_millis(), "waiting out host back-off");
                tokio::time::sleep(wait).await;
            }
        }

        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let delay = self.min_interval.saturating_sub(elapsed);
                let cumulative = state.add_cumulative_delay(delay);
                if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                    debug!(
                        host = %host,
                        cumulative_delay_secs = cumulative.as_secs(),
                        "host pacing has added significant delay"
                    );
                }
                tokio::time::sleep(delay).await;
            }
        }

        *last_request = Some(Instant::now());
    }

    /// Records a 429 from `url`'s host; later requests wait out the back-off.
    ///
    /// The longer of the current and the new deadline wins.
    #[instrument(skip(self), fields(host))]
    pub fn record_rate_limit(&self, url: &str, retry_after: Option<Duration>) {
        if self.disabled {
            return;
        }
        let host = extract_host(url);
        tracing::Span::current().record("host", &host);
        let state = self.state(&host);

        let delay = retry_after.unwrap_or(DEFAULT_THROTTLE_BACKOFF).min(MAX_RETRY_AFTER);
        let deadline = Instant::now() + delay;
        {
            let mut guard = state
                .backoff_until
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.is_none_or(|current| current < deadline) {
                *guard = Some(deadline);
            }
        }

        let cumulative = state.add_cumulative_delay(delay);
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                host = %host,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - host may be under heavy load"
            );
        } else {
            debug!(host = %host, delay_ms = delay.as_millis(), "recorded server rate limit");
        }
    }
}

/// Extracts the lowercase host of a URL, `"unknown"` when unparseable.
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value (seconds or HTTP-date), capped at one hour.
///
/// A date in the past yields zero; anything unparseable yields `None`.
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(Duration::from_secs(seconds).min(MAX_RETRY_AFTER));
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host_variants() {
        assert_eq!(extract_host("https://Digi.VatLib.it/iiif/x"), "digi.vatlib.it");
        assert_eq!(extract_host("http://127.0.0.1:8080/x"), "127.0.0.1");
        assert_eq!(extract_host("not a url"), "unknown");
    }

    #[test]
    fn test_parse_retry_after_seconds_and_cap() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("999999"), Some(MAX_RETRY_AFTER));
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::ZERO)
        );
        let future = std::time::SystemTime::now() + Duration::from_secs(90);
        let parsed = parse_retry_after(&httpdate::fmt_http_date(future)).unwrap();
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(85));
    }

    #[tokio::test]
    async fn test_acquire_spaces_same_host_requests() {
        let throttle = HostThrottle::new(Duration::from_millis(150));
        let start = Instant::now();
        throttle.acquire("https://a.example.org/1").await;
        throttle.acquire("https://a.example.org/2").await;
        assert!(start.elapsed() >= Duration::from_millis(140));

        let other = Instant::now();
        throttle.acquire("https://b.example.org/1").await;
        assert!(other.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_rate_limit_delays_next_request_to_host() {
        let throttle = HostThrottle::new(Duration::ZERO);
        throttle.acquire("https://a.example.org/1").await;
        throttle.record_rate_limit("https://a.example.org/1", Some(Duration::from_millis(300)));

        let start = Instant::now();
        throttle.acquire("https://a.example.org/2").await;
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_disabled_throttle_never_waits() {
        let throttle = HostThrottle::disabled();
        throttle.record_rate_limit("https://a.example.org/1", Some(Duration::from_secs(60)));
        let start = Instant::now();
        throttle.acquire("https://a.example.org/1").await;
        throttle.acquire("https://a.example.org/2").await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(throttle.is_disabled());
    }
}

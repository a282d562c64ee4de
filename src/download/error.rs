//! Error types for the download module.
//!
//! Every variant carries the URL (or path) it concerns so that a page's
//! failure log reads on its own.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while fetching manifests, page images or PDFs.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS errors, etc.)
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout { url: String },

    /// Non-2xx response.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// 2xx response whose content type is not an image.
    #[error("non-image content ({content_type}) from {url}")]
    NonImageContent { url: String, content_type: String },

    /// 2xx response with a zero-length body.
    #[error("empty body from {url}")]
    EmptyBody { url: String },

    /// Bytes were received but do not decode as an image.
    #[error("undecodable image from {url}: {reason}")]
    UndecodableImage { url: String, reason: String },

    /// A JSON document (manifest) could not be parsed.
    #[error("invalid JSON from {url}: {reason}")]
    InvalidJson { url: String, reason: String },

    /// File system error while staging or writing.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },
}

impl DownloadError {
    /// Creates a network error from a reqwest error.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    pub fn non_image(url: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self::NonImageContent {
            url: url.into(),
            content_type: content_type.into(),
        }
    }

    pub fn empty_body(url: impl Into<String>) -> Self {
        Self::EmptyBody { url: url.into() }
    }

    pub fn undecodable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UndecodableImage {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_json(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidJson {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Short, log-friendly label of the failure kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Timeout { .. } => "timeout",
            Self::HttpStatus { .. } => "http_status",
            Self::NonImageContent { .. } => "non_image",
            Self::EmptyBody { .. } => "empty_body",
            Self::UndecodableImage { .. } => "undecodable",
            Self::InvalidJson { .. } => "invalid_json",
            Self::Io { .. } => "io",
            Self::InvalidUrl { .. } => "invalid_url",
        }
    }
}

// No `From<reqwest::Error>` / `From<std::io::Error>`: every variant needs the
// url or path the source error does not carry.

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/p1.jpg", 503);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected '503' in: {msg}");
        assert!(msg.contains("https://example.com/p1.jpg"));
        assert_eq!(error.kind(), "http_status");
    }

    #[test]
    fn test_download_error_non_image_display() {
        let error = DownloadError::non_image("https://example.com/p1.jpg", "text/html");
        assert_eq!(
            error.to_string(),
            "non-image content (text/html) from https://example.com/p1.jpg"
        );
    }

    #[test]
    fn test_download_error_io_keeps_source() {
        let source = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error = DownloadError::io("/tmp/pag_0000.jpg", source);
        assert!(error.to_string().contains("/tmp/pag_0000.jpg"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_download_error_retry_after_is_preserved() {
        let error =
            DownloadError::http_status_with_retry_after("https://example.com", 429, Some("7".into()));
        assert!(matches!(
            error,
            DownloadError::HttpStatus { status: 429, retry_after: Some(ref v), .. } if v == "7"
        ));
    }
}

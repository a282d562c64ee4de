//! HTTP client wrapper for manifests, page images and native PDFs.
//!
//! One `HttpClient` is built per pipeline and reused for every request so
//! connections are pooled.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, default_user_agent};
use super::error::DownloadError;
use super::validate::inspect_image_bytes;

/// HTTP client for IIIF traffic.
///
/// # Example
///
/// ```no_run
/// use scriptorium_core::download::HttpClient;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = HttpClient::new();
/// let manifest = client.get_json("https://example.org/iiif/ms1/manifest.json").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

/// A fetched page image that passed validation.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient {
    /// Creates a client with default timeouts (connect 30 s, read 300 s).
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the static
    /// configuration. This should never happen in practice.
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a client with explicit timeouts.
    ///
    /// # Panics
    ///
    /// Panics if the HTTP client builder fails to build with the supplied
    /// timeout configuration.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_timeouts(connect_timeout_secs: u64, read_timeout_secs: u64) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .gzip(true)
            .user_agent(default_user_agent())
            .build()
            .expect("failed to build HTTP client with static configuration");
        Self { client }
    }

    /// Fetches and parses a JSON document (a manifest).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport failures, non-2xx answers and
    /// bodies that are not JSON.
    #[instrument(skip(self))]
    pub async fn get_json(&self, url: &str) -> Result<Value, DownloadError> {
        let response = self.send(url).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(url, e))?;
        serde_json::from_slice(&body).map_err(|e| DownloadError::invalid_json(url, e.to_string()))
    }

    /// Fetches one page image and checks that it is a decodable, non-empty image.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::NonImageContent`], [`DownloadError::EmptyBody`]
    /// or [`DownloadError::UndecodableImage`] for bodies that cannot be a
    /// page, plus the transport and status errors.
    #[instrument(skip(self))]
    pub async fn fetch_image(&self, url: &str) -> Result<FetchedImage, DownloadError> {
        let response = self.send(url).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);
        if let Some(content_type) = content_type
            && !is_image_content_type(&content_type)
        {
            return Err(DownloadError::non_image(url, content_type));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| map_transport_error(url, e))?;
        if bytes.is_empty() {
            return Err(DownloadError::empty_body(url));
        }
        let bytes = bytes.to_vec();

        let (width, height) =
            inspect_image_bytes(&bytes).map_err(|reason| DownloadError::undecodable(url, reason))?;
        debug!(bytes = bytes.len(), width, height, "page image fetched");
        Ok(FetchedImage {
            bytes,
            width,
            height,
        })
    }

    /// Streams a response body to `dest` through a `.part` file.
    ///
    /// Returns the number of bytes written. The partial file is removed on
    /// failure so `dest` only ever holds a complete body.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for transport, status or IO failures.
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn download_to_file(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let response = self.send(url).await?;
        let part = dest.with_extension("part");
        let mut file = File::create(&part)
            .await
            .map_err(|e| DownloadError::io(&part, e))?;

        match stream_to_file(&mut file, response, url, &part).await {
            Ok(bytes_written) => {
                drop(file);
                if bytes_written == 0 {
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(DownloadError::empty_body(url));
                }
                tokio::fs::rename(&part, dest)
                    .await
                    .map_err(|e| DownloadError::io(dest, e))?;
                debug!(bytes_written, "download complete");
                Ok(bytes_written)
            }
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response, DownloadError> {
        let parsed = url::Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::invalid_url(url));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| map_transport_error(url, e))?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status().as_u16(),
                retry_after,
            ));
        }
        Ok(response)
    }

    /// Returns a reference to the underlying reqwest client.
    #[must_use]
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn map_transport_error(url: &str, error: reqwest::Error) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(url)
    } else {
        DownloadError::network(url, error)
    }
}

/// `image/*`, plus generic binary types some image servers answer with.
fn is_image_content_type(content_type: &str) -> bool {
    let mime = content_type.split(';').next().unwrap_or_default().trim();
    mime.starts_with("image/") || mime == "application/octet-stream" || mime == "binary/octet-stream"
}

/// Streams response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| map_transport_error(url, e))?;
        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path, e))?;
        bytes_written += chunk.len() as u64;
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path, e))?;
    Ok(bytes_written)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::validate::tests::sample_jpeg;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_is_image_content_type() {
        assert!(is_image_content_type("image/jpeg"));
        assert!(is_image_content_type("image/jpeg; charset=binary"));
        assert!(is_image_content_type("application/octet-stream"));
        assert!(!is_image_content_type("text/html; charset=utf-8"));
        assert!(!is_image_content_type("application/json"));
    }

    #[tokio::test]
    async fn test_get_json_parses_manifest() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/manifest.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"items": []})))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let value = client
            .get_json(&format!("{}/manifest.json", server.uri()))
            .await
            .unwrap();
        assert!(value.get("items").is_some());
    }

    #[tokio::test]
    async fn test_get_json_rejects_html() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = HttpClient::new().get_json(&server.uri()).await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidJson { .. }));
    }

    #[tokio::test]
    async fn test_fetch_image_accepts_valid_jpeg() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(sample_jpeg(40, 30)),
            )
            .mount(&server)
            .await;

        let image = HttpClient::new().fetch_image(&server.uri()).await.unwrap();
        assert_eq!((image.width, image.height), (40, 30));
    }

    #[tokio::test]
    async fn test_fetch_image_classifies_bad_bodies() {
        let server = MockServer::start().await;
        Mock::given(path("/html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;
        Mock::given(path("/empty"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "image/jpeg"))
            .mount(&server)
            .await;
        Mock::given(path("/garbage"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/jpeg")
                    .set_body_bytes(b"definitely not a jpeg".to_vec()),
            )
            .mount(&server)
            .await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let client = HttpClient::new();
        let base = server.uri();
        assert!(matches!(
            client.fetch_image(&format!("{base}/html")).await.unwrap_err(),
            DownloadError::NonImageContent { .. }
        ));
        assert!(matches!(
            client.fetch_image(&format!("{base}/empty")).await.unwrap_err(),
            DownloadError::EmptyBody { .. }
        ));
        assert!(matches!(
            client.fetch_image(&format!("{base}/garbage")).await.unwrap_err(),
            DownloadError::UndecodableImage { .. }
        ));
        assert!(matches!(
            client.fetch_image(&format!("{base}/busy")).await.unwrap_err(),
            DownloadError::HttpStatus { status: 429, retry_after: Some(ref v), .. } if v == "2"
        ));
    }

    #[tokio::test]
    async fn test_fetch_image_invalid_url() {
        let err = HttpClient::new().fetch_image("ftp://example.org/x.jpg").await.unwrap_err();
        assert!(matches!(err, DownloadError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_download_to_file_streams_and_renames() {
        let server = MockServer::start().await;
        let body = vec![7_u8; 64 * 1024];
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ms.pdf");
        let written = HttpClient::new()
            .download_to_file(&server.uri(), &dest)
            .await
            .unwrap();

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!dir.path().join("ms.part").exists());
    }

    #[tokio::test]
    async fn test_download_to_file_leaves_nothing_on_404() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("ms.pdf");
        let err = HttpClient::new()
            .download_to_file(&server.uri(), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
        assert!(!dest.exists());
    }
}

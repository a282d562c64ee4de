//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, ImageOutputFormat, RgbImage};
use scriptorium_core::{
    AcquireSettings, AcquisitionPipeline, Database, HostThrottle, HttpClient, RetryPolicy,
    StorageLayout, Vault,
};
use serde_json::{Value, json};

/// Small valid JPEG.
pub fn sample_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 180, 140])));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, ImageOutputFormat::Jpeg(85)).unwrap();
    out.into_inner()
}

/// Vault over an in-memory database with folders under `base`.
pub async fn vault_in(base: &Path) -> Vault {
    let db = Database::in_memory().await.unwrap();
    Vault::new(db, StorageLayout::under(base))
}

/// Image path served for page `page` at the `max` size.
pub fn page_path(page: u32) -> String {
    format!("/iiif/p{page}/full/max/0/default.jpg")
}

/// IIIF v2 manifest with `pages` canvases whose image services live on `server_uri`.
pub fn v2_manifest(server_uri: &str, pages: u32, pdf_url: Option<&str>) -> Value {
    let canvases: Vec<Value> = (1..=pages)
        .map(|page| {
            json!({
                "@id": format!("{server_uri}/canvas/{page}"),
                "label": format!("f. {page}"),
                "images": [{"resource": {
                    "@id": format!("{server_uri}/iiif/p{page}/full/full/0/default.jpg"),
                    "service": {"@id": format!("{server_uri}/iiif/p{page}")}
                }}]
            })
        })
        .collect();

    let mut doc = json!({
        "@context": "http://iiif.io/api/presentation/2/context.json",
        "label": "Codex Testensis",
        "metadata": [{"label": "Shelfmark", "value": "Test. 1"}],
        "sequences": [{"canvases": canvases}]
    });
    if let Some(url) = pdf_url {
        doc["rendering"] = json!({"@id": url, "format": "application/pdf"});
    }
    doc
}

/// Pipeline with a disabled throttle, `max`-only candidates and short backoff.
pub fn pipeline(vault: &Vault, max_passes: u32) -> AcquisitionPipeline {
    let settings = AcquireSettings {
        page_workers: 2,
        retry: RetryPolicy::new(max_passes, Duration::from_millis(10)),
        resolution_strategy: vec!["max".to_string()],
        ..AcquireSettings::default()
    };
    AcquisitionPipeline::new(
        vault.clone(),
        HttpClient::new(),
        Arc::new(HostThrottle::disabled()),
        settings,
    )
}

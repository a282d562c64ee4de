//! Integration tests for the page acquisition pipeline.
//!
//! A wiremock server plays the IIIF image service; the vault sits in a
//! temp directory.

mod support;

use std::collections::BTreeSet;

use scriptorium_core::storage::scan_page_numbers;
use std::sync::Arc;
use std::time::Duration;

use scriptorium_core::{
    AcquireError, AcquireSettings, AcquireSource, AcquisitionPipeline, AssetState, HostThrottle, HttpClient,
    JobContext, Manifest, RetryPolicy,
};
use tempfile::TempDir;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{page_path, pipeline, sample_jpeg, v2_manifest, vault_in};

fn jpeg_response() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(sample_jpeg(40, 60), "image/jpeg")
}

async fn serve_manifest(server: &MockServer, pages: u32, pdf_url: Option<&str>) -> String {
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(v2_manifest(&server.uri(), pages, pdf_url)))
        .mount(server)
        .await;
    format!("{}/manifest.json", server.uri())
}

async fn serve_page(server: &MockServer, page: u32) {
    Mock::given(method("GET"))
        .and(path(page_path(page)))
        .respond_with(jpeg_response())
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_acquire_full_manuscript_completes_and_writes_data_files() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 3, None).await;
    for page in 1..=3 {
        serve_page(&server, page).await;
    }
    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 2);

    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    assert_eq!(prepared.record.total(), 3);
    assert_eq!(prepared.record.asset_state().unwrap(), AssetState::Saved);

    let ctx = JobContext::detached("job1");
    let report = pipeline.acquire(prepared.request(), &ctx).await.unwrap();

    assert_eq!(report.source, AcquireSource::Canvases);
    assert_eq!(report.succeeded, vec![1, 2, 3]);
    assert!(report.failed.is_empty());
    assert_eq!(report.asset_state, AssetState::Complete);
    assert_eq!(ctx.progress().await, (3, 3));

    let paths = vault.layout().document("ms1", "Gallica");
    assert_eq!(scan_page_numbers(&paths.scans), BTreeSet::from([1, 2, 3]));
    assert!(paths.manifest_file().exists());
    assert!(paths.metadata_file().exists());
    assert!(paths.data.join("image_stats.json").exists());
    assert!(!vault.layout().staging_dir("ms1", "Gallica").exists());

    let record = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
    assert_eq!(record.asset_state().unwrap(), AssetState::Complete);
    assert_eq!(record.downloaded(), 3);
    assert!(record.missing_pages().is_empty());
}

#[tokio::test]
async fn test_acquire_resumes_without_refetching_present_pages() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 3, None).await;
    Mock::given(method("GET"))
        .and(path(page_path(3)))
        .respond_with(jpeg_response())
        .expect(1)
        .mount(&server)
        .await;
    for page in [1, 2] {
        Mock::given(method("GET"))
            .and(path(page_path(page)))
            .respond_with(jpeg_response())
            .expect(0)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let paths = vault.layout().document("ms1", "Gallica");
    paths.ensure().await.unwrap();
    std::fs::write(paths.page_path(1), sample_jpeg(40, 60)).unwrap();
    std::fs::write(paths.page_path(2), sample_jpeg(40, 60)).unwrap();

    let pipeline = pipeline(&vault, 2);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.resumed, 2);
    assert_eq!(report.succeeded, vec![1, 2, 3]);
    assert_eq!(report.asset_state, AssetState::Complete);
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_retries_transient_failures_on_later_passes() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 1, None).await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    serve_page(&server, 1).await;

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 3);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![1]);
    assert_eq!(report.asset_state, AssetState::Complete);
}

#[tokio::test]
async fn test_acquire_gives_up_after_max_passes_and_records_partial() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 2, None).await;
    serve_page(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(page_path(2)))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 2);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![1]);
    assert_eq!(report.failed, vec![2]);
    assert_eq!(report.asset_state, AssetState::Partial);

    let record = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
    assert_eq!(record.missing_pages(), vec![2]);
    assert_eq!(record.downloaded(), 1);
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_targeted_pages_only_fetches_targets() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 8, None).await;
    for page in [3, 7] {
        serve_page(&server, page).await;
    }

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let ctx = JobContext::detached("job1");
    let report = pipeline
        .acquire(prepared.request().with_targets(BTreeSet::from([3, 7])), &ctx)
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![3, 7]);
    assert_eq!(report.total, 8);
    assert_eq!(report.asset_state, AssetState::Partial);
    assert_eq!(ctx.progress().await, (2, 2));

    let record = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
    assert_eq!(record.missing_pages(), vec![1, 2, 4, 5, 6, 8]);
}

#[tokio::test]
async fn test_acquire_rejects_out_of_range_target() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 2, None).await;
    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);

    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let result = pipeline
        .acquire(
            prepared.request().with_targets(BTreeSet::from([5])),
            &JobContext::detached("job1"),
        )
        .await;

    assert!(matches!(result, Err(AcquireError::PageOutOfRange { page: 5, total: 2 })));
}

#[tokio::test]
async fn test_acquire_all_pages_failing_records_error_state() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 2, None).await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(page_path(2)))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html>nope</html>", "text/html"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 2);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let result = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await;

    assert!(matches!(result, Err(AcquireError::AllPagesFailed { failed: 2 })));
    let record = vault.get_manuscript("ms1", "Gallica").await.unwrap().unwrap();
    assert_eq!(record.asset_state().unwrap(), AssetState::Error);
    assert_eq!(record.missing_pages(), vec![1, 2]);
}

#[tokio::test]
async fn test_acquire_cancelled_before_start_touches_nothing() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 2, None).await;
    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();

    let ctx = JobContext::detached("job1");
    ctx.cancel_token().cancel();
    let result = pipeline.acquire(prepared.request(), &ctx).await;

    assert!(matches!(result, Err(AcquireError::Cancelled)));
    assert!(!vault.layout().document("ms1", "Gallica").scans.exists());
}

#[tokio::test]
async fn test_acquire_prefers_native_pdf_rendering() {
    let dir = TempDir::new().unwrap();
    let jpegs: Vec<_> = (1..=2)
        .map(|page| {
            let file = dir.path().join(format!("src_{page}.jpg"));
            std::fs::write(&file, sample_jpeg(50, 70)).unwrap();
            file
        })
        .collect();
    let pdf_file = dir.path().join("rendering.pdf");
    scriptorium_core::pdf::write_images_pdf(&jpegs, &pdf_file).unwrap();

    let server = MockServer::start().await;
    let pdf_url = format!("{}/ms1.pdf", server.uri());
    let manifest_url = serve_manifest(&server, 2, Some(&pdf_url)).await;
    Mock::given(method("GET"))
        .and(path("/ms1.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(std::fs::read(&pdf_file).unwrap(), "application/pdf"))
        .mount(&server)
        .await;
    for page in 1..=2 {
        Mock::given(method("GET"))
            .and(path(page_path(page)))
            .respond_with(jpeg_response())
            .expect(0)
            .mount(&server)
            .await;
    }

    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    assert!(prepared.record.has_native_pdf);
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.source, AcquireSource::NativePdf);
    assert_eq!(report.succeeded, vec![1, 2]);
    assert_eq!(report.asset_state, AssetState::Complete);
    let paths = vault.layout().document("ms1", "Gallica");
    assert!(paths.native_pdf("ms1").exists());
    assert_eq!(scan_page_numbers(&paths.scans), BTreeSet::from([1, 2]));
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_falls_back_to_canvases_when_pdf_unavailable() {
    let server = MockServer::start().await;
    let pdf_url = format!("{}/missing.pdf", server.uri());
    let manifest_url = serve_manifest(&server, 2, Some(&pdf_url)).await;
    Mock::given(method("GET"))
        .and(path("/missing.pdf"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    for page in 1..=2 {
        serve_page(&server, page).await;
    }

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.source, AcquireSource::Canvases);
    assert_eq!(report.succeeded, vec![1, 2]);
}

#[tokio::test]
async fn test_acquire_with_preloaded_manifest_skips_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifest.json"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    serve_page(&server, 1).await;

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let manifest = Manifest::from_json(v2_manifest(&server.uri(), 1, None)).unwrap();
    let request = scriptorium_core::AcquireRequest::new(format!("{}/manifest.json", server.uri()), "ms9", "Gallica")
        .with_manifest(manifest);

    let report = pipeline.acquire(request, &JobContext::detached("job1")).await.unwrap();
    assert_eq!(report.succeeded, vec![1]);
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_walks_strategy_until_a_candidate_answers() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 2, None).await;
    for page in 1..=2 {
        for size in ["tier-A", "max"] {
            Mock::given(method("GET"))
                .and(path(format!("/iiif/p{page}/full/{size}/0/default.jpg")))
                .respond_with(ResponseTemplate::new(503))
                .expect(1)
                .mount(&server)
                .await;
        }
        // `default` resolves to the canvas resource URL.
        Mock::given(method("GET"))
            .and(path(format!("/iiif/p{page}/full/full/0/default.jpg")))
            .respond_with(jpeg_response())
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let settings = AcquireSettings {
        page_workers: 2,
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
        resolution_strategy: vec!["tier-A".to_string(), "max".to_string(), "default".to_string()],
        ..AcquireSettings::default()
    };
    let pipeline = AcquisitionPipeline::new(
        vault.clone(),
        HttpClient::new(),
        Arc::new(HostThrottle::disabled()),
        settings,
    );
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![1, 2]);
    assert!(report.failed.is_empty());
    assert_eq!(report.asset_state, AssetState::Complete);
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_skips_native_pdf_when_pages_already_on_disk() {
    let dir = TempDir::new().unwrap();
    let jpegs: Vec<_> = (1..=2)
        .map(|page| {
            let file = dir.path().join(format!("src_{page}.jpg"));
            std::fs::write(&file, sample_jpeg(50, 70)).unwrap();
            file
        })
        .collect();
    let pdf_file = dir.path().join("rendering.pdf");
    scriptorium_core::pdf::write_images_pdf(&jpegs, &pdf_file).unwrap();
    let pdf_bytes = std::fs::read(&pdf_file).unwrap();

    let server = MockServer::start().await;
    let pdf_url = format!("{}/ms1.pdf", server.uri());
    let manifest_url = serve_manifest(&server, 2, Some(&pdf_url)).await;
    Mock::given(method("GET"))
        .and(path("/ms1.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pdf_bytes.clone(), "application/pdf"))
        .expect(1)
        .mount(&server)
        .await;

    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let first = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();
    assert_eq!(first.source, AcquireSource::NativePdf);
    server.verify().await;

    server.reset().await;
    let manifest_url = serve_manifest(&server, 2, Some(&pdf_url)).await;
    Mock::given(method("GET"))
        .and(path("/ms1.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(pdf_bytes, "application/pdf"))
        .expect(0)
        .mount(&server)
        .await;
    for page in 1..=2 {
        Mock::given(method("GET"))
            .and(path(page_path(page)))
            .respond_with(jpeg_response())
            .expect(0)
            .mount(&server)
            .await;
    }

    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let second = pipeline
        .acquire(prepared.request(), &JobContext::detached("job2"))
        .await
        .unwrap();

    assert_eq!(second.source, AcquireSource::Canvases);
    assert_eq!(second.resumed, 2);
    assert_eq!(second.succeeded, vec![1, 2]);
    assert_eq!(second.asset_state, AssetState::Complete);
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_stitches_page_from_tiles_when_candidates_fail() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 1, None).await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/iiif/p1/info.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "@id": format!("{}/iiif/p1", server.uri()),
            "width": 80,
            "height": 60,
            "tiles": [{"width": 50, "scaleFactors": [1]}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    for (x, y, w, h) in [(0, 0, 50, 50), (50, 0, 30, 50), (0, 50, 50, 10), (50, 50, 30, 10)] {
        Mock::given(method("GET"))
            .and(path(format!("/iiif/p1/{x},{y},{w},{h}/{w},/0/default.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sample_jpeg(w, h), "image/jpeg"))
            .expect(1)
            .mount(&server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let pipeline = pipeline(&vault, 1);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![1]);
    assert_eq!(report.asset_state, AssetState::Complete);
    let paths = vault.layout().document("ms1", "Gallica");
    let stitched = std::fs::read(paths.page_path(1)).unwrap();
    assert_eq!(scriptorium_core::download::inspect_image_bytes(&stitched).unwrap(), (80, 60));
    server.verify().await;
}

#[tokio::test]
async fn test_acquire_without_tile_stitching_leaves_page_failed() {
    let server = MockServer::start().await;
    let manifest_url = serve_manifest(&server, 2, None).await;
    serve_page(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/iiif/p2/info.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"width": 80, "height": 60, "tiles": [{"width": 50}]})))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let vault = vault_in(dir.path()).await;
    let mut settings = pipeline(&vault, 1).settings().clone();
    settings.tile_stitch = false;
    let pipeline = pipeline(&vault, 1).with_settings(settings);
    let prepared = pipeline.prepare(&manifest_url, "Gallica", Some("ms1")).await.unwrap();
    let report = pipeline
        .acquire(prepared.request(), &JobContext::detached("job1"))
        .await
        .unwrap();

    assert_eq!(report.succeeded, vec![1]);
    assert_eq!(report.failed, vec![2]);
    assert_eq!(report.asset_state, AssetState::Partial);
    server.verify().await;
}

//! Page acquisition: manifest to validated page files on disk.
//!
//! One [`AcquisitionPipeline::acquire`] call handles one manuscript:
//!
//! 1. Parse the manifest once and enumerate its pages.
//! 2. Skip every requested page whose file already exists and validates
//!    (in `scans/` or in the staging folder of an interrupted run).
//! 3. Fetch the remaining pages on a bounded worker pool. Each page walks
//!    its candidate URLs in order; a full walk is a pass, and failed passes
//!    are retried with linear backoff.
//!    A page whose candidates all fail is rebuilt from its IIIF tiles when
//!    the image service publishes them.
//! 4. Promote staged pages into `scans/`, reconcile the manuscript row with
//!    what is on disk, and optionally compile a PDF.
//!
//! When the manifest advertises a PDF rendering and the caller prefers it,
//! the rendering is fetched and split into page images first, unless every
//! page is already on disk; any failure there falls back to the canvas path.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::constants::{DEFAULT_PAGE_WORKERS, default_user_agent};
use super::error::DownloadError;
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::throttle::{HostThrottle, parse_retry_after};
use super::tiles::{self, MAX_STITCH_BYTES, TILE_ATTEMPTS, TilePlan};
use super::validate::inspect_image_file;
use crate::jobs::JobContext;
use crate::manifest::{ImageRef, Manifest, ManifestError, ManifestVersion, PageRef, candidate_urls};
use crate::pdf;
use crate::storage::{
    DocumentPaths, derive_identifier, normalize_library, page_file_name, page_number_from_file_name,
    scan_page_numbers,
};
use crate::vault::{AssetState, ManuscriptRecord, ManuscriptUpsert, Vault, VaultError};

/// Widths above this are reported as high resolution in `image_stats.json`.
const HIGH_RESOLUTION_WIDTH: u32 = 2500;

/// Errors that end an acquisition as a whole (single pages never do).
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("failed to fetch manifest: {0}")]
    ManifestFetch(#[source] DownloadError),

    #[error("invalid manifest: {0}")]
    Manifest(#[from] ManifestError),

    #[error("manifest lists no pages")]
    NoPages,

    #[error("page {page} is outside the manuscript (1..={total})")]
    PageOutOfRange { page: u32, total: u32 },

    #[error("all {failed} requested pages failed to download")]
    AllPagesFailed { failed: usize },

    #[error("native PDF unavailable: {0}")]
    NativePdf(#[source] DownloadError),

    #[error("acquisition cancelled")]
    Cancelled,

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_error(path: &Path, source: std::io::Error) -> AcquireError {
    AcquireError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Acquisition settings, captured when the pipeline is built.
#[derive(Debug, Clone)]
pub struct AcquireSettings {
    /// Width of the per-manuscript page pool.
    pub page_workers: usize,
    pub retry: RetryPolicy,
    /// Ordered size tiers, e.g. `["max", "3000", "1740"]`.
    pub resolution_strategy: Vec<String>,
    pub iiif_quality: String,
    pub prefer_native_pdf: bool,
    /// Assemble `pdf/{doc_id}_compiled.pdf` after a successful run.
    pub create_pdf: bool,
    /// Rebuild a page from its IIIF tiles once every candidate failed.
    pub tile_stitch: bool,
}

impl Default for AcquireSettings {
    fn default() -> Self {
        Self {
            page_workers: DEFAULT_PAGE_WORKERS,
            retry: RetryPolicy::default(),
            resolution_strategy: vec!["max".to_string(), "3000".to_string(), "1740".to_string()],
            iiif_quality: "default".to_string(),
            prefer_native_pdf: true,
            create_pdf: false,
            tile_stitch: true,
        }
    }
}

/// One acquisition run.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub manifest_url: String,
    pub doc_id: String,
    pub library: String,
    /// Restricts the run to these 1-based pages; other pages are left alone.
    pub target_pages: Option<BTreeSet<u32>>,
    /// Manifest already fetched by [`AcquisitionPipeline::prepare`].
    pub manifest: Option<Manifest>,
}

impl AcquireRequest {
    #[must_use]
    pub fn new(manifest_url: impl Into<String>, doc_id: impl Into<String>, library: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            doc_id: doc_id.into(),
            library: library.into(),
            target_pages: None,
            manifest: None,
        }
    }

    #[must_use]
    pub fn with_targets(mut self, pages: BTreeSet<u32>) -> Self {
        self.target_pages = Some(pages);
        self
    }

    #[must_use]
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }
}

/// A registered manuscript together with its parsed manifest.
#[derive(Debug, Clone)]
pub struct PreparedManuscript {
    pub doc_id: String,
    pub library: String,
    pub manifest_url: String,
    pub manifest: Manifest,
    pub record: ManuscriptRecord,
}

impl PreparedManuscript {
    /// Full-run request reusing the parsed manifest.
    #[must_use]
    pub fn request(&self) -> AcquireRequest {
        AcquireRequest::new(&self.manifest_url, &self.doc_id, &self.library)
            .with_manifest(self.manifest.clone())
    }
}

/// Where the page files came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireSource {
    Canvases,
    NativePdf,
}

/// Outcome of an acquisition that did not fail as a whole.
#[derive(Debug, Clone)]
pub struct AcquireReport {
    pub doc_id: String,
    pub library: String,
    /// Pages in the manuscript.
    pub total: u32,
    /// Requested pages present after the run (resumed ones included), ascending.
    pub succeeded: Vec<u32>,
    /// Requested pages that exhausted every candidate, ascending.
    pub failed: Vec<u32>,
    /// Requested pages accepted from disk without a request.
    pub resumed: u32,
    pub source: AcquireSource,
    pub asset_state: AssetState,
    pub compiled_pdf: Option<PathBuf>,
}

/// Per-page entry of `data/image_stats.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageStat {
    /// 0-based page index (the file index).
    pub page_index: u32,
    pub filename: String,
    pub original_url: Option<String>,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub resolution_category: String,
}

impl ImageStat {
    fn new(page: u32, original_url: Option<String>, size_bytes: u64, width: u32, height: u32) -> Self {
        let resolution_category = if width > HIGH_RESOLUTION_WIDTH {
            "High"
        } else {
            "Medium"
        };
        Self {
            page_index: page.saturating_sub(1),
            filename: page_file_name(page),
            original_url,
            size_bytes,
            width,
            height,
            resolution_category: resolution_category.to_string(),
        }
    }
}

enum PageOutcome {
    Fetched(ImageStat),
    Failed { page: u32, reason: String },
    Skipped(u32),
}

/// Shared per-run state handed to every page task.
#[derive(Clone)]
struct PageWorker {
    client: HttpClient,
    throttle: Arc<HostThrottle>,
    retry: RetryPolicy,
    strategy: Arc<Vec<String>>,
    quality: Arc<str>,
    staging: PathBuf,
    token: CancellationToken,
    /// One tile stitch at a time per pipeline; `None` disables stitching.
    stitch_gate: Option<Arc<Semaphore>>,
}

impl PageWorker {
    /// Fetches one page: candidates first, then tiles as a last resort.
    #[instrument(skip(self, page), fields(page = page.page))]
    async fn fetch_page(&self, page: PageRef) -> PageOutcome {
        let Some(image) = page.image.as_ref() else {
            return PageOutcome::Failed {
                page: page.page,
                reason: "canvas has no image resource".to_string(),
            };
        };
        match self.walk_candidates(page.page, image).await {
            PageOutcome::Failed { page, reason } => match image.service_base.as_deref() {
                Some(base) => self
                    .stitch_page(page, base)
                    .await
                    .unwrap_or(PageOutcome::Failed { page, reason }),
                None => PageOutcome::Failed { page, reason },
            },
            outcome => outcome,
        }
    }

    /// Walks the page's candidates pass after pass until one validates.
    async fn walk_candidates(&self, page_number: u32, image: &ImageRef) -> PageOutcome {
        let mut candidates = candidate_urls(image, &self.strategy, &self.quality);
        if candidates.is_empty() {
            return PageOutcome::Failed {
                page: page_number,
                reason: "no candidate URL".to_string(),
            };
        }

        let mut pass: u32 = 1;
        let mut last_error = String::new();
        loop {
            let mut survivors = Vec::with_capacity(candidates.len());
            let mut pass_failure = FailureType::Permanent;

            for url in candidates {
                if self.token.is_cancelled() {
                    return PageOutcome::Skipped(page_number);
                }
                self.throttle.acquire(&url).await;
                match self.client.fetch_image(&url).await {
                    Ok(fetched) => {
                        return match self.stage(page_number, &fetched.bytes).await {
                            Ok(size) => {
                                debug!(url = %url, pass, "page fetched");
                                PageOutcome::Fetched(ImageStat::new(
                                    page_number,
                                    Some(url),
                                    size,
                                    fetched.width,
                                    fetched.height,
                                ))
                            }
                            Err(e) => PageOutcome::Failed {
                                page: page_number,
                                reason: e.to_string(),
                            },
                        };
                    }
                    Err(e) => {
                        let failure = classify_error(&e);
                        if failure == FailureType::RateLimited {
                            let retry_after = match &e {
                                DownloadError::HttpStatus {
                                    retry_after: Some(value),
                                    ..
                                } => parse_retry_after(value),
                                _ => None,
                            };
                            self.throttle.record_rate_limit(&url, retry_after);
                        }
                        debug!(url = %url, pass, kind = e.kind(), error = %e, "candidate failed");
                        last_error = e.to_string();
                        if failure != FailureType::Permanent {
                            pass_failure = FailureType::Transient;
                            survivors.push(url);
                        }
                    }
                }
            }

            if survivors.is_empty() {
                return PageOutcome::Failed {
                    page: page_number,
                    reason: last_error,
                };
            }
            match self.retry.should_retry(pass_failure, pass) {
                RetryDecision::Retry { delay, pass: next } => {
                    tokio::select! {
                        () = self.token.cancelled() => return PageOutcome::Skipped(page_number),
                        () = tokio::time::sleep(delay) => {}
                    }
                    pass = next;
                    candidates = survivors;
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(reason = %reason, "giving up on page");
                    return PageOutcome::Failed {
                        page: page_number,
                        reason: last_error,
                    };
                }
            }
        }
    }

    /// Rebuilds a page from its `info.json` tiles; `None` when the service
    /// publishes no usable tiles or any tile fails.
    async fn stitch_page(&self, page: u32, service_base: &str) -> Option<PageOutcome> {
        let gate = self.stitch_gate.as_ref()?;
        let Ok(_permit) = Arc::clone(gate).acquire_owned().await else {
            return None;
        };
        if self.token.is_cancelled() {
            return Some(PageOutcome::Skipped(page));
        }

        let info_url = format!("{}/info.json", service_base.trim_end_matches('/'));
        self.throttle.acquire(&info_url).await;
        let info = match self.client.get_json(&info_url).await {
            Ok(info) => info,
            Err(e) => {
                debug!(url = %info_url, error = %e, "no image info for tile stitching");
                return None;
            }
        };
        let plan = TilePlan::from_info(&info)?;
        if plan.canvas_bytes() > MAX_STITCH_BYTES {
            warn!(width = plan.width, height = plan.height, "image too large to stitch in memory");
            return None;
        }

        let regions = plan.regions();
        debug!(tiles = regions.len(), "stitching page from tiles");
        let mut fetched = Vec::with_capacity(regions.len());
        for region in regions {
            if self.token.is_cancelled() {
                return Some(PageOutcome::Skipped(page));
            }
            let url = tiles::tile_url(service_base, region, &self.quality);
            fetched.push((region, self.fetch_tile(&url).await?));
        }

        let composed = match tokio::task::spawn_blocking(move || tiles::compose(&plan, fetched)).await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(reason)) => {
                debug!(reason = %reason, "tile stitching failed");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "tile stitching task ended abnormally");
                return None;
            }
        };
        Some(match self.stage(page, &composed).await {
            Ok(size) => {
                info!(page, width = plan.width, height = plan.height, "page stitched from tiles");
                PageOutcome::Fetched(ImageStat::new(
                    page,
                    Some(format!("{service_base} (tile-stitch)")),
                    size,
                    plan.width,
                    plan.height,
                ))
            }
            Err(e) => PageOutcome::Failed {
                page,
                reason: e.to_string(),
            },
        })
    }

    async fn fetch_tile(&self, url: &str) -> Option<Vec<u8>> {
        for attempt in 1..=TILE_ATTEMPTS {
            self.throttle.acquire(url).await;
            match self.client.fetch_image(url).await {
                Ok(tile) => return Some(tile.bytes),
                Err(e) => {
                    let failure = classify_error(&e);
                    if failure == FailureType::RateLimited {
                        self.throttle.record_rate_limit(url, None);
                    }
                    debug!(url = %url, attempt, error = %e, "tile failed");
                    if failure == FailureType::Permanent {
                        return None;
                    }
                }
            }
        }
        None
    }

    /// Writes a page into staging through a `.part` file.
    async fn stage(&self, page: u32, bytes: &[u8]) -> Result<u64, DownloadError> {
        let target = self.staging.join(page_file_name(page));
        let part = self.staging.join(format!("{}.part", page_file_name(page)));
        tokio::fs::write(&part, bytes)
            .await
            .map_err(|e| DownloadError::io(&part, e))?;
        tokio::fs::rename(&part, &target)
            .await
            .map_err(|e| DownloadError::io(&target, e))?;
        Ok(bytes.len() as u64)
    }
}

/// Outcomes of the page tasks of one run.
#[derive(Debug, Default)]
struct PageTally {
    /// Spawned pages that have not reported yet.
    unsettled: BTreeSet<u32>,
    succeeded: Vec<u32>,
    failed: Vec<u32>,
    stats: Vec<ImageStat>,
}

impl PageTally {
    fn spawned(&mut self, page: u32) {
        self.unsettled.insert(page);
    }

    /// Records one joined task. Returns `true` when it advances progress.
    fn record(&mut self, joined: Result<PageOutcome, JoinError>) -> bool {
        match joined {
            Ok(PageOutcome::Fetched(stat)) => {
                let page = stat.page_index + 1;
                self.unsettled.remove(&page);
                self.succeeded.push(page);
                self.stats.push(stat);
            }
            Ok(PageOutcome::Failed { page, reason }) => {
                warn!(page, reason = %reason, "page failed after all candidates and passes");
                self.unsettled.remove(&page);
                self.failed.push(page);
            }
            Ok(PageOutcome::Skipped(page)) => {
                self.unsettled.remove(&page);
                return false;
            }
            Err(join_error) => warn!(error = %join_error, "page task ended abnormally"),
        }
        true
    }

    /// Pages whose task never reported (panicked or aborted) count as failed.
    fn finish(mut self) -> Self {
        if !self.unsettled.is_empty() {
            warn!(pages = ?self.unsettled, "page tasks ended without an outcome, counting them as failed");
            let lost = std::mem::take(&mut self.unsettled);
            self.failed.extend(lost);
        }
        self.succeeded.sort_unstable();
        self.failed.sort_unstable();
        self
    }
}

/// Acquires manuscripts into the vault's storage layout.
#[derive(Debug, Clone)]
pub struct AcquisitionPipeline {
    client: HttpClient,
    throttle: Arc<HostThrottle>,
    vault: Vault,
    settings: AcquireSettings,
    stitch_gate: Arc<Semaphore>,
}

impl AcquisitionPipeline {
    #[must_use]
    pub fn new(vault: Vault, client: HttpClient, throttle: Arc<HostThrottle>, settings: AcquireSettings) -> Self {
        debug!(user_agent = %default_user_agent(), workers = settings.page_workers, "creating acquisition pipeline");
        Self {
            client,
            throttle,
            vault,
            settings,
            stitch_gate: Arc::new(Semaphore::new(1)),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &AcquireSettings {
        &self.settings
    }

    /// Same client, throttle and vault with different run settings.
    #[must_use]
    pub fn with_settings(mut self, settings: AcquireSettings) -> Self {
        self.settings = settings;
        self
    }

    #[must_use]
    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    /// Fetches and parses a manifest, retrying transient failures.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::ManifestFetch`] or [`AcquireError::Manifest`].
    #[instrument(skip(self))]
    pub async fn fetch_manifest(&self, manifest_url: &str) -> Result<Manifest, AcquireError> {
        let mut pass = 1;
        loop {
            self.throttle.acquire(manifest_url).await;
            match self.client.get_json(manifest_url).await {
                Ok(doc) => return Ok(Manifest::from_json(doc)?),
                Err(e) => {
                    let failure = classify_error(&e);
                    match self.settings.retry.should_retry(failure, pass) {
                        RetryDecision::Retry { delay, pass: next } => {
                            warn!(error = %e, pass, "manifest fetch failed, retrying");
                            tokio::time::sleep(delay).await;
                            pass = next;
                        }
                        RetryDecision::DoNotRetry { .. } => return Err(AcquireError::ManifestFetch(e)),
                    }
                }
            }
        }
    }

    /// Registers a manuscript from its manifest without downloading pages.
    ///
    /// # Errors
    ///
    /// Returns manifest errors and vault errors.
    #[instrument(skip(self))]
    pub async fn prepare(
        &self,
        manifest_url: &str,
        library: &str,
        id_override: Option<&str>,
    ) -> Result<PreparedManuscript, AcquireError> {
        let manifest = self.fetch_manifest(manifest_url).await?;
        let label = manifest.label();
        let doc_id = derive_identifier(manifest_url, id_override, label.as_deref());
        let library = normalize_library(library);
        let total = u32::try_from(manifest.enumerate_pages().len()).unwrap_or(u32::MAX);
        let paths = self.vault.layout().document(&doc_id, &library);

        let mut upsert = ManuscriptUpsert::new(&doc_id, &library);
        upsert.manifest_url = Some(manifest_url.to_string());
        upsert.display_title = label.clone();
        upsert.catalog_title = label;
        upsert.local_path = Some(paths.root);
        upsert.total_canvases = Some(total);
        upsert.has_native_pdf = Some(manifest.native_pdf_url().is_some());
        upsert.metadata_json = manifest.raw().get("metadata").map(ToString::to_string);
        let record = self.vault.upsert_manuscript(upsert).await?;
        info!(doc_id = %doc_id, library = %library, total, "manuscript registered");

        Ok(PreparedManuscript {
            doc_id,
            library,
            manifest_url: manifest_url.to_string(),
            manifest,
            record,
        })
    }

    /// Runs one acquisition; see the module documentation for the steps.
    ///
    /// Progress `(settled, requested)` is reported after every page settles.
    /// Returns the per-page outcome even when some pages failed.
    ///
    /// # Errors
    ///
    /// Fails as a whole for manifest problems, out-of-range targets,
    /// cancellation, storage errors, and when every requested page failed.
    #[instrument(skip(self, request, ctx), fields(job_id = ctx.job_id(), doc_id = %request.doc_id))]
    pub async fn acquire(&self, mut request: AcquireRequest, ctx: &JobContext) -> Result<AcquireReport, AcquireError> {
        if ctx.should_cancel() {
            return Err(AcquireError::Cancelled);
        }
        let library = normalize_library(&request.library);
        let manifest = match request.manifest.take() {
            Some(manifest) => manifest,
            None => self.fetch_manifest(&request.manifest_url).await?,
        };
        let pages = manifest.enumerate_pages();
        let total = u32::try_from(pages.len()).unwrap_or(u32::MAX);
        if total == 0 {
            return Err(AcquireError::NoPages);
        }

        let targets: BTreeSet<u32> = match &request.target_pages {
            Some(requested) => {
                if let Some(&page) = requested.iter().find(|&&p| p == 0 || p > total) {
                    return Err(AcquireError::PageOutOfRange { page, total });
                }
                requested.clone()
            }
            None => (1..=total).collect(),
        };

        let paths = self.vault.layout().document(&request.doc_id, &library);
        paths.ensure().await.map_err(|e| io_error(&paths.root, e))?;
        write_data_files(&paths, &manifest, &request, &library, total).await?;
        let native_url = manifest.native_pdf_url();

        let mut upsert = ManuscriptUpsert::new(&request.doc_id, &library);
        upsert.manifest_url = Some(request.manifest_url.clone());
        upsert.display_title = manifest.label();
        upsert.local_path = Some(paths.root.clone());
        upsert.asset_state = Some(AssetState::Downloading);
        upsert.total_canvases = Some(total);
        upsert.has_native_pdf = Some(native_url.is_some());
        self.vault.upsert_manuscript(upsert).await?;
        info!(total, requested = targets.len(), "acquisition started");

        let on_disk = valid_pages(
            paths.scans.clone(),
            self.vault.layout().staging_dir(&request.doc_id, &library),
            targets.clone(),
        )
        .await;
        let already_complete = on_disk.len() == targets.len();
        if already_complete && native_url.is_some() {
            debug!(pages = on_disk.len(), "every page already on disk, not fetching the native PDF");
        }

        if self.settings.prefer_native_pdf
            && request.target_pages.is_none()
            && !already_complete
            && let Some(url) = native_url.as_deref()
        {
            match self.acquire_native_pdf(url, &request.doc_id, &paths, ctx).await {
                Ok(written) if written > 0 => {
                    let pages: Vec<u32> = (1..=written).collect();
                    let state = self.record_state(&request.doc_id, &library, &paths, written, false).await?;
                    let compiled_pdf = self.compile_pdf(&request.doc_id, &paths, state).await;
                    info!(pages = written, "acquired from native PDF");
                    return Ok(AcquireReport {
                        doc_id: request.doc_id,
                        library,
                        total: written,
                        succeeded: pages,
                        failed: Vec::new(),
                        resumed: 0,
                        source: AcquireSource::NativePdf,
                        asset_state: state,
                        compiled_pdf,
                    });
                }
                Ok(_) => warn!("native PDF held no extractable pages, falling back to canvases"),
                Err(AcquireError::Cancelled) => {
                    self.record_state(&request.doc_id, &library, &paths, total, false).await?;
                    return Err(AcquireError::Cancelled);
                }
                Err(e) => warn!(error = %e, "native PDF path failed, falling back to canvases"),
            }
        }

        self.acquire_canvases(&request.doc_id, &library, &paths, pages, total, &targets, ctx)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn acquire_canvases(
        &self,
        doc_id: &str,
        library: &str,
        paths: &DocumentPaths,
        pages: Vec<PageRef>,
        total: u32,
        targets: &BTreeSet<u32>,
        ctx: &JobContext,
    ) -> Result<AcquireReport, AcquireError> {
        let staging = self.vault.layout().staging_dir(doc_id, library);
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| io_error(&staging, e))?;

        let present = valid_pages(paths.scans.clone(), staging.clone(), targets.clone()).await;
        let requested = u32::try_from(targets.len()).unwrap_or(u32::MAX);
        let succeeded: Vec<u32> = present.iter().copied().collect();
        let resumed = u32::try_from(succeeded.len()).unwrap_or(u32::MAX);
        let mut settled = resumed;
        ctx.report(settled, requested).await;
        if resumed > 0 {
            info!(resumed, "pages already on disk, skipping them");
        }

        let worker = PageWorker {
            client: self.client.clone(),
            throttle: Arc::clone(&self.throttle),
            retry: self.settings.retry.clone(),
            strategy: Arc::new(self.settings.resolution_strategy.clone()),
            quality: Arc::from(self.settings.iiif_quality.as_str()),
            staging: staging.clone(),
            token: ctx.cancel_token().clone(),
            stitch_gate: self.settings.tile_stitch.then(|| Arc::clone(&self.stitch_gate)),
        };
        let semaphore = Arc::new(Semaphore::new(self.settings.page_workers.max(1)));
        let mut set = JoinSet::new();
        let mut tally = PageTally {
            succeeded,
            ..PageTally::default()
        };
        for page in pages
            .into_iter()
            .filter(|p| targets.contains(&p.page) && !present.contains(&p.page))
        {
            tally.spawned(page.page);
            let worker = worker.clone();
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return PageOutcome::Skipped(page.page);
                };
                if worker.token.is_cancelled() {
                    return PageOutcome::Skipped(page.page);
                }
                worker.fetch_page(page).await
            });
        }

        while let Some(joined) = set.join_next().await {
            if tally.record(joined) {
                settled += 1;
                ctx.report(settled, requested).await;
            }
        }
        let PageTally {
            succeeded,
            failed,
            stats,
            ..
        } = tally.finish();

        promote_staged(&staging, &paths.scans).await;
        if let Err(e) = merge_image_stats(&paths.data.join("image_stats.json"), stats).await {
            warn!(error = %e, "failed to write image statistics");
        }

        if ctx.should_cancel() {
            self.record_state(doc_id, library, paths, total, false).await?;
            info!(succeeded = succeeded.len(), "acquisition cancelled");
            return Err(AcquireError::Cancelled);
        }

        let all_failed = !failed.is_empty() && succeeded.is_empty();
        let state = self.record_state(doc_id, library, paths, total, all_failed).await?;
        if all_failed {
            return Err(AcquireError::AllPagesFailed {
                failed: failed.len(),
            });
        }
        let compiled_pdf = self.compile_pdf(doc_id, paths, state).await;
        info!(
            succeeded = succeeded.len(),
            failed = failed.len(),
            state = %state,
            "acquisition finished"
        );

        Ok(AcquireReport {
            doc_id: doc_id.to_string(),
            library: library.to_string(),
            total,
            succeeded,
            failed,
            resumed,
            source: AcquireSource::Canvases,
            asset_state: state,
            compiled_pdf,
        })
    }

    /// Downloads the PDF rendering and writes its page images into `scans/`.
    ///
    /// Returns the number of pages written; zero means nothing usable was found
    /// and `scans/` was left untouched.
    async fn acquire_native_pdf(
        &self,
        url: &str,
        doc_id: &str,
        paths: &DocumentPaths,
        ctx: &JobContext,
    ) -> Result<u32, AcquireError> {
        let pdf_path = paths.native_pdf(doc_id);
        self.throttle.acquire(url).await;
        let bytes = self
            .client
            .download_to_file(url, &pdf_path)
            .await
            .map_err(AcquireError::NativePdf)?;
        debug!(bytes, path = %pdf_path.display(), "native PDF downloaded");
        if ctx.should_cancel() {
            return Err(AcquireError::Cancelled);
        }

        let scans = paths.scans.clone();
        let written = tokio::task::spawn_blocking(move || split_pdf_into_pages(&pdf_path, &scans))
            .await
            .map_err(|e| io_error(&paths.scans, std::io::Error::other(e)))?
            .map_err(|e| io_error(&paths.scans, e))?;
        if written > 0 {
            ctx.report(written, written).await;
        }
        Ok(written)
    }

    /// Reconciles the manuscript row with the page files present on disk.
    async fn record_state(
        &self,
        doc_id: &str,
        library: &str,
        paths: &DocumentPaths,
        total: u32,
        failed_run: bool,
    ) -> Result<AssetState, AcquireError> {
        let present: BTreeSet<u32> = scan_page_numbers(&paths.scans)
            .into_iter()
            .filter(|&page| page <= total)
            .collect();
        let downloaded = u32::try_from(present.len()).unwrap_or(u32::MAX);
        let missing: Vec<u32> = (1..=total).filter(|page| !present.contains(page)).collect();
        let state = if failed_run && downloaded == 0 {
            AssetState::Error
        } else {
            AssetState::from_counts(total, downloaded)
        };

        let mut upsert = ManuscriptUpsert::new(doc_id, library);
        upsert.asset_state = Some(state);
        upsert.total_canvases = Some(total);
        upsert.downloaded_canvases = Some(downloaded);
        upsert.missing_pages = Some(missing);
        if failed_run {
            upsert.error_log = Some("every requested page failed to download".to_string());
        }
        self.vault.upsert_manuscript(upsert).await?;
        Ok(state)
    }

    /// Best-effort combined PDF; failures are logged, not raised.
    async fn compile_pdf(&self, doc_id: &str, paths: &DocumentPaths, state: AssetState) -> Option<PathBuf> {
        if !self.settings.create_pdf || matches!(state, AssetState::Error | AssetState::Saved) {
            return None;
        }
        let files: Vec<PathBuf> = scan_page_numbers(&paths.scans)
            .into_iter()
            .map(|page| paths.page_path(page))
            .collect();
        let output = paths.compiled_pdf(doc_id);
        let target = output.clone();
        match tokio::task::spawn_blocking(move || pdf::write_images_pdf(&files, &target)).await {
            Ok(Ok(())) => {
                info!(path = %output.display(), "compiled PDF written");
                Some(output)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "failed to compile PDF");
                None
            }
            Err(e) => {
                warn!(error = %e, "PDF task ended abnormally");
                None
            }
        }
    }
}

/// Pages among `targets` that already validate in `scans/` or in staging.
async fn valid_pages(scans: PathBuf, staging: PathBuf, targets: BTreeSet<u32>) -> BTreeSet<u32> {
    let checked = tokio::task::spawn_blocking(move || {
        targets
            .into_iter()
            .filter(|&page| {
                let name = page_file_name(page);
                inspect_image_file(&scans.join(&name)).is_some()
                    || inspect_image_file(&staging.join(&name)).is_some()
            })
            .collect::<BTreeSet<u32>>()
    })
    .await;
    checked.unwrap_or_else(|e| {
        warn!(error = %e, "resume check failed, fetching every requested page");
        BTreeSet::new()
    })
}

/// Moves valid staged pages into `scans/` and removes the staging folder.
async fn promote_staged(staging: &Path, scans: &Path) {
    let staging = staging.to_path_buf();
    let scans = scans.to_path_buf();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<u32> {
        let mut promoted = 0;
        let entries = match std::fs::read_dir(&staging) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };
            if page_number_from_file_name(&name).is_none() || inspect_image_file(&path).is_none() {
                continue;
            }
            let dest = scans.join(&name);
            if std::fs::rename(&path, &dest).is_err() {
                std::fs::copy(&path, &dest)?;
                std::fs::remove_file(&path)?;
            }
            promoted += 1;
        }
        std::fs::remove_dir_all(&staging)?;
        Ok(promoted)
    })
    .await;

    match result {
        Ok(Ok(promoted)) => debug!(promoted, "staged pages promoted"),
        Ok(Err(e)) => warn!(error = %e, "failed to finalize staged pages"),
        Err(e) => warn!(error = %e, "finalize task ended abnormally"),
    }
}

/// Replaces the page files in `scans` with the images embedded in a PDF.
fn split_pdf_into_pages(pdf_path: &Path, scans: &Path) -> std::io::Result<u32> {
    let bytes = std::fs::read(pdf_path)?;
    let images = pdf::extract_jpeg_pages(&bytes);
    if images.is_empty() {
        return Ok(0);
    }

    for page in scan_page_numbers(scans) {
        std::fs::remove_file(scans.join(page_file_name(page)))?;
    }
    let mut written: u32 = 0;
    for data in &images {
        let page = written + 1;
        let target = scans.join(page_file_name(page));
        let part = scans.join(format!("{}.part", page_file_name(page)));
        std::fs::write(&part, data)?;
        std::fs::rename(&part, &target)?;
        written = page;
    }
    Ok(written)
}

/// Writes `data/manifest.json` and `data/metadata.json`.
async fn write_data_files(
    paths: &DocumentPaths,
    manifest: &Manifest,
    request: &AcquireRequest,
    library: &str,
    total: u32,
) -> Result<(), AcquireError> {
    let manifest_file = paths.manifest_file();
    let pretty = serde_json::to_vec_pretty(manifest.raw())
        .map_err(|e| io_error(&manifest_file, std::io::Error::other(e)))?;
    tokio::fs::write(&manifest_file, pretty)
        .await
        .map_err(|e| io_error(&manifest_file, e))?;

    let version = match manifest.version() {
        ManifestVersion::V2 => "2",
        ManifestVersion::V3 => "3",
    };
    let metadata = json!({
        "doc_id": request.doc_id,
        "library": library,
        "label": manifest.label(),
        "attribution": manifest.text_field("attribution").or_else(|| manifest.text_field("requiredStatement")),
        "manifest_url": request.manifest_url,
        "presentation_version": version,
        "page_count": total,
        "acquired_at": Utc::now().to_rfc3339(),
    });
    let metadata_file = paths.metadata_file();
    let pretty = serde_json::to_vec_pretty(&metadata)
        .map_err(|e| io_error(&metadata_file, std::io::Error::other(e)))?;
    tokio::fs::write(&metadata_file, pretty)
        .await
        .map_err(|e| io_error(&metadata_file, e))
}

/// Merges this run's page statistics into `image_stats.json`, keyed by page index.
async fn merge_image_stats(path: &Path, stats: Vec<ImageStat>) -> std::io::Result<()> {
    if stats.is_empty() {
        return Ok(());
    }
    let mut merged: BTreeMap<u32, ImageStat> = match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice::<Vec<ImageStat>>(&bytes)
            .unwrap_or_default()
            .into_iter()
            .map(|stat| (stat.page_index, stat))
            .collect(),
        Err(_) => BTreeMap::new(),
    };
    for stat in stats {
        merged.insert(stat.page_index, stat);
    }
    let list: Vec<&ImageStat> = merged.values().collect();
    let bytes = serde_json::to_vec_pretty(&list).map_err(std::io::Error::other)?;
    tokio::fs::write(path, bytes).await
}

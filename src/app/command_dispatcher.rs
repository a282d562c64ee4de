//! CLI command routing: one handler per subcommand.

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use scriptorium_core::{
    AcquireRequest, AcquisitionPipeline, ExportRequest, JobContext, JobOutcome, JobSpec, RetryPolicy,
    TaskError, parse_items_csv, parse_page_selection, task_factory,
};
use tracing::info;

use crate::ProcessExit;
use crate::app::exit_handler::exit_for_job;
use crate::app::progress_manager::follow_job;
use crate::app::runtime::AppContext;
use crate::cli::{Command, DownloadArgs, ExportArgs, ItemArgs, ManuscriptArgs};

/// Manuscript rows re-derived from disk by `reconcile`.
const RECONCILE_LIMIT: u32 = 10_000;

pub(crate) async fn dispatch(command: &Command, ctx: &AppContext, quiet: bool) -> Result<ProcessExit> {
    match command {
        Command::Add(args) => run_add(ctx, args).await,
        Command::Download(args) => run_download(ctx, args, quiet).await,
        Command::RetryMissing(args) => run_retry_missing(ctx, args, quiet).await,
        Command::Export(args) => run_export(ctx, args, quiet).await,
        Command::List { limit, search } => run_list(ctx, *limit, search.as_deref()).await,
        Command::Jobs { limit } => run_jobs(ctx, *limit).await,
        Command::Reconcile => run_reconcile(ctx).await,
        Command::Delete(args) => run_delete(ctx, args).await,
    }
}

async fn run_add(ctx: &AppContext, args: &ManuscriptArgs) -> Result<ProcessExit> {
    let prepared = ctx
        .pipeline
        .prepare(&args.manifest_url, &args.library, args.id.as_deref())
        .await
        .context("Failed to register manuscript")?;
    println!(
        "Registered {}::{} ({} pages) {}",
        prepared.library,
        prepared.doc_id,
        prepared.record.total(),
        prepared.record.display_title
    );
    Ok(ProcessExit::Success)
}

async fn run_download(ctx: &AppContext, args: &DownloadArgs, quiet: bool) -> Result<ProcessExit> {
    let targets = match args.pages.as_deref() {
        Some(raw) => {
            let pages = parse_page_selection(raw)?;
            if pages.is_empty() {
                bail!("--pages selects no pages");
            }
            Some(pages.into_iter().collect::<BTreeSet<u32>>())
        }
        None => None,
    };

    let mut settings = ctx.pipeline.settings().clone();
    if args.no_native_pdf {
        settings.prefer_native_pdf = false;
    }
    if args.create_pdf {
        settings.create_pdf = true;
    }
    if let Some(workers) = args.workers {
        settings.page_workers = usize::from(workers);
    }
    if let Some(retries) = args.max_retries {
        settings.retry = RetryPolicy::new(u32::from(retries), settings.retry.step());
    }
    let pipeline = ctx.pipeline.clone().with_settings(settings);

    let manuscript = &args.manuscript;
    let prepared = pipeline
        .prepare(&manuscript.manifest_url, &manuscript.library, manuscript.id.as_deref())
        .await
        .context("Failed to load manifest")?;
    let mut request = prepared.request();
    if let Some(pages) = targets {
        request = request.with_targets(pages);
    }
    submit_acquisition(ctx, pipeline, request, quiet).await
}

async fn run_retry_missing(ctx: &AppContext, args: &ItemArgs, quiet: bool) -> Result<ProcessExit> {
    let Some(record) = ctx.vault.get_manuscript(&args.doc_id, &args.library).await? else {
        bail!("Manuscript not found: {}::{}", args.library, args.doc_id);
    };
    let missing: BTreeSet<u32> = record.missing_pages().into_iter().collect();
    if missing.is_empty() {
        println!("{}::{} has no missing pages", record.library, record.doc_id);
        return Ok(ProcessExit::Success);
    }
    info!(doc_id = %record.doc_id, pages = missing.len(), "retrying missing pages");
    let request = AcquireRequest::new(&record.manifest_url, &record.doc_id, &record.library).with_targets(missing);
    submit_acquisition(ctx, ctx.pipeline.clone(), request, quiet).await
}

/// Runs one acquisition as a download job and reports the result.
async fn submit_acquisition(
    ctx: &AppContext,
    pipeline: AcquisitionPipeline,
    request: AcquireRequest,
    quiet: bool,
) -> Result<ProcessExit> {
    let spec = JobSpec::Download {
        doc_id: request.doc_id.clone(),
        library: request.library.clone(),
        manifest_url: request.manifest_url.clone(),
    };
    let (doc_id, library) = (request.doc_id.clone(), request.library.clone());
    let factory = task_factory(move |job_ctx| {
        let pipeline = pipeline.clone();
        let request = request.clone();
        async move { acquire_task(&pipeline, request, job_ctx).await }
    });

    let job_id = ctx.jobs.submit(spec, factory).await?;
    info!(job_id = %job_id, doc_id = %doc_id, "download job submitted");
    let snapshot = follow_job(&ctx.jobs, &job_id, &doc_id, !quiet).await;

    if let Some(record) = ctx.vault.get_manuscript(&doc_id, &library).await? {
        println!(
            "{library}::{doc_id}: {} ({}/{} pages)",
            record.asset_state_str,
            record.downloaded(),
            record.total()
        );
        let missing = record.missing_pages();
        if !missing.is_empty() {
            println!("Missing pages: {missing:?}");
        }
    }
    if let Some(s) = &snapshot {
        println!("Job {} {}", s.job_id, s.status);
        if let Some(error) = &s.error {
            println!("  {error}");
        }
    }
    Ok(exit_for_job(snapshot.as_ref()))
}

async fn acquire_task(
    pipeline: &AcquisitionPipeline,
    request: AcquireRequest,
    ctx: JobContext,
) -> std::result::Result<JobOutcome, TaskError> {
    let report = pipeline.acquire(request, &ctx).await?;
    let outcome = match &report.compiled_pdf {
        Some(path) => JobOutcome::with_output(path),
        None => JobOutcome::done(),
    };
    if report.failed.is_empty() {
        Ok(outcome)
    } else {
        let requested = report.succeeded.len() + report.failed.len();
        Ok(outcome.with_message(format!(
            "{} of {requested} pages failed: {:?}",
            report.failed.len(),
            report.failed
        )))
    }
}

async fn run_export(ctx: &AppContext, args: &ExportArgs, quiet: bool) -> Result<ProcessExit> {
    let items = parse_items_csv(&args.items);
    if items.is_empty() {
        bail!("No valid items in '{}': expected library::doc_id", args.items);
    }
    let mut request = ExportRequest::new(items, &args.format);
    request.destination.clone_from(&args.destination);
    if let Some(raw) = args.pages.as_deref() {
        request = request.with_pages(parse_page_selection(raw)?);
    }

    let job_id = ctx.exports.start(request).await?;
    let snapshot = follow_job(&ctx.jobs, &job_id, "export", !quiet).await;
    if let Some(s) = &snapshot {
        match (&s.output_path, &s.error) {
            (Some(path), _) => println!("Export {} {}: {}", s.job_id, s.status, path.display()),
            (None, Some(error)) => println!("Export {} {}: {error}", s.job_id, s.status),
            (None, None) => println!("Export {} {}", s.job_id, s.status),
        }
    }
    Ok(exit_for_job(snapshot.as_ref()))
}

async fn run_list(ctx: &AppContext, limit: u32, search: Option<&str>) -> Result<ProcessExit> {
    let manuscripts = match search {
        Some(query) => {
            let mut found = ctx.vault.search_manuscripts(query).await?;
            found.truncate(usize::try_from(limit.max(1)).unwrap_or(usize::MAX));
            if found.is_empty() {
                println!("No manuscripts match '{query}'");
            }
            found
        }
        None => {
            let listed = ctx.vault.list_manuscripts(limit).await?;
            if listed.is_empty() {
                println!("No manuscripts registered");
            }
            listed
        }
    };
    for m in manuscripts {
        println!(
            "{}::{}  {:<11} {:>4}/{:<4} {}",
            m.library,
            m.doc_id,
            m.asset_state_str,
            m.downloaded(),
            m.total(),
            m.display_title
        );
    }
    Ok(ProcessExit::Success)
}

async fn run_jobs(ctx: &AppContext, limit: u32) -> Result<ProcessExit> {
    let downloads = ctx.vault.list_download_jobs(limit).await?;
    println!("Download jobs: {}", downloads.len());
    for job in downloads {
        println!(
            "  {}  {:<10} {}::{}  {}/{}{}",
            job.job_id,
            job.status_str,
            job.library,
            job.doc_id,
            job.current_page,
            job.total_pages,
            job.error_message.map(|e| format!("  {e}")).unwrap_or_default()
        );
    }

    let exports = ctx.vault.list_export_jobs(limit).await?;
    println!("Export jobs: {}", exports.len());
    for job in exports {
        println!(
            "  {}  {:<10} {} {}/{}  {}",
            job.job_id,
            job.status_str,
            job.export_format,
            job.current_step,
            job.total_steps,
            job.output_path.or(job.error_message).unwrap_or_default()
        );
    }
    Ok(ProcessExit::Success)
}

async fn run_reconcile(ctx: &AppContext) -> Result<ProcessExit> {
    let cleanup = ctx
        .vault
        .cleanup_stale_data(ctx.settings.temp_retention_hours)
        .await?;
    let normalized = ctx.vault.normalize_asset_states(RECONCILE_LIMIT).await?;
    println!(
        "Removed {} download jobs, {} export jobs, {} temp folders; {normalized} manuscripts updated",
        cleanup.download_jobs, cleanup.export_jobs, cleanup.temp_dirs
    );
    Ok(ProcessExit::Success)
}

async fn run_delete(ctx: &AppContext, args: &ItemArgs) -> Result<ProcessExit> {
    ctx.vault.delete_manuscript(&args.doc_id, &args.library).await?;
    println!("Deleted {}::{}", args.library, args.doc_id);
    Ok(ProcessExit::Success)
}

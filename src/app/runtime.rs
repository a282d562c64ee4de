//! Process context: settings, vault, scheduler and services, built once.

use std::sync::Arc;

use anyhow::{Context, Result};
use scriptorium_core::{
    AcquisitionPipeline, Database, ExportService, HttpClient, JobManager, RESTART_MESSAGE, Settings,
    Vault, load_config,
};
use tracing::{debug, info, warn};

use crate::cli::Cli;

/// Manuscript rows re-derived from disk by the startup hook.
const NORMALIZE_LIMIT: u32 = 500;

pub(crate) struct AppContext {
    pub settings: Settings,
    pub vault: Vault,
    pub jobs: JobManager,
    pub pipeline: AcquisitionPipeline,
    pub exports: ExportService,
}

/// Defaults, then the config file, then command-line overrides.
pub(crate) fn resolve_settings(cli: &Cli) -> Result<Settings> {
    let loaded = load_config(cli.config.as_deref())?;
    if loaded.loaded_from_file()
        && let Some(path) = &loaded.path
    {
        debug!(path = %path.display(), "config file loaded");
    }

    let mut settings = loaded.config.as_ref().map(Settings::from_file).unwrap_or_default();
    if let Some(dir) = &cli.downloads_dir {
        settings.downloads_dir.clone_from(dir);
    }
    if let Some(path) = &cli.database {
        settings.database_path.clone_from(path);
    }
    Ok(settings)
}

impl AppContext {
    /// Opens the vault, runs the startup hook and builds the services.
    pub(crate) async fn open(settings: Settings) -> Result<Self> {
        let db = Database::open(&settings.database_path)
            .await
            .with_context(|| format!("Failed to open vault '{}'", settings.database_path.display()))?;
        if let Ok(Some(schema)) = db.schema_version().await {
            debug!(schema, path = %settings.database_path.display(), "vault opened");
        }
        let vault = Vault::new(db, settings.layout());

        startup_hook(&vault, &settings).await?;

        let jobs = JobManager::new(Arc::new(vault.clone()), settings.job_manager_config());
        let client = HttpClient::with_timeouts(settings.connect_timeout_secs, settings.read_timeout_secs);
        let pipeline = AcquisitionPipeline::new(
            vault.clone(),
            client,
            settings.throttle(),
            settings.acquire_settings(),
        );
        let exports = ExportService::new(vault.clone(), jobs.clone(), settings.export_settings());

        Ok(Self {
            settings,
            vault,
            jobs,
            pipeline,
            exports,
        })
    }
}

/// Fails jobs a previous process left active, then cleans up in the background.
///
/// The reset runs before any job can be submitted, so no live worker is
/// ever touched.
async fn startup_hook(vault: &Vault, settings: &Settings) -> Result<()> {
    let reset = vault
        .reset_active_downloads(RESTART_MESSAGE)
        .await
        .context("Failed to reset jobs left active by a previous run")?;
    if reset.downloads > 0 || reset.exports > 0 {
        info!(downloads = reset.downloads, exports = reset.exports, "stale jobs marked as failed");
    }

    let background = vault.clone();
    let retention_hours = settings.temp_retention_hours;
    tokio::spawn(async move {
        match background.cleanup_stale_data(retention_hours).await {
            Ok(report) => debug!(?report, "stale data cleanup finished"),
            Err(e) => warn!(error = %e, "stale data cleanup failed"),
        }
        match background.normalize_asset_states(NORMALIZE_LIMIT).await {
            Ok(changed) => debug!(changed, "asset states normalized"),
            Err(e) => warn!(error = %e, "asset state normalization failed"),
        }
    });
    Ok(())
}

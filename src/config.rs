//! Configuration file loading and the merged runtime settings.
//!
//! The file is a flat `key = value` list (strings double-quoted, `#`
//! comments). Unknown keys, malformed values and out-of-range numbers are
//! errors naming the key and line.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::download::{AcquireSettings, HostThrottle, RetryPolicy};
use crate::export::ExportSettings;
use crate::jobs::JobManagerConfig;
use crate::storage::StorageLayout;

/// Values read from the config file; `None` means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    pub downloads_dir: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub exports_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    /// Manuscripts downloaded at once (1..=8).
    pub max_concurrent_downloads: Option<u64>,
    /// Page pool width per manuscript (1..=32).
    pub download_workers: Option<u64>,
    /// Passes per page (0..=10); 0 behaves as a single pass.
    pub max_retries: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    /// Minimum spacing between requests to one host.
    pub host_interval_ms: Option<u64>,
    pub resolution_strategy: Option<Vec<String>>,
    pub iiif_quality: Option<String>,
    pub prefer_native_pdf: Option<bool>,
    pub create_pdf_after_download: Option<bool>,
    /// Rebuild pages from IIIF tiles when every candidate URL fails.
    pub tile_stitch_fallback: Option<bool>,
    pub temp_retention_hours: Option<u64>,
    pub cancel_grace_secs: Option<u64>,
    pub exports_retention_days: Option<u64>,
    pub max_exports_per_item: Option<u64>,
}

impl FileConfig {
    /// Validates numeric ranges.
    pub fn validate(&self) -> Result<()> {
        check_range("max_concurrent_downloads", self.max_concurrent_downloads, 1, 8)?;
        check_range("download_workers", self.download_workers, 1, 32)?;
        check_range("max_retries", self.max_retries, 0, 10)?;
        check_range("retry_backoff_ms", self.retry_backoff_ms, 0, 60_000)?;
        check_range("connect_timeout_secs", self.connect_timeout_secs, 1, 3600)?;
        check_range("read_timeout_secs", self.read_timeout_secs, 1, 3600)?;
        check_range("host_interval_ms", self.host_interval_ms, 0, 10_000)?;
        check_range("temp_retention_hours", self.temp_retention_hours, 1, 8760)?;
        check_range("cancel_grace_secs", self.cancel_grace_secs, 1, 3600)?;
        check_range("exports_retention_days", self.exports_retention_days, 1, 3650)?;
        check_range("max_exports_per_item", self.max_exports_per_item, 1, 100)?;

        if let Some(strategy) = &self.resolution_strategy
            && strategy.is_empty()
        {
            bail!("Invalid config value for `resolution_strategy`: expected at least one size");
        }
        Ok(())
    }
}

fn check_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Effective settings: defaults, overlaid by the file, then by CLI flags.
///
/// Captured once at startup; running jobs never observe later changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub downloads_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub exports_dir: PathBuf,
    pub database_path: PathBuf,
    pub max_concurrent_downloads: usize,
    pub download_workers: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub host_interval: Duration,
    pub resolution_strategy: Vec<String>,
    pub iiif_quality: String,
    pub prefer_native_pdf: bool,
    pub create_pdf_after_download: bool,
    pub tile_stitch_fallback: bool,
    pub temp_retention_hours: u32,
    pub cancel_grace: Duration,
    pub exports_retention_days: u32,
    pub max_exports_per_item: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downloads_dir: PathBuf::from("./downloads"),
            temp_dir: PathBuf::from("./temp"),
            exports_dir: PathBuf::from("./exports"),
            database_path: PathBuf::from("./data/vault.db"),
            max_concurrent_downloads: 2,
            download_workers: 4,
            max_retries: 5,
            retry_backoff: Duration::from_millis(1000),
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            host_interval: Duration::from_millis(400),
            resolution_strategy: vec!["max".to_string(), "3000".to_string(), "1740".to_string()],
            iiif_quality: "default".to_string(),
            prefer_native_pdf: true,
            create_pdf_after_download: false,
            tile_stitch_fallback: true,
            temp_retention_hours: 24,
            cancel_grace: Duration::from_secs(30),
            exports_retention_days: 30,
            max_exports_per_item: 5,
        }
    }
}

fn narrow<T: TryFrom<u64>>(value: u64, fallback: T) -> T {
    T::try_from(value).unwrap_or(fallback)
}

impl Settings {
    /// Defaults overlaid with validated file values.
    #[must_use]
    pub fn from_file(file: &FileConfig) -> Self {
        let mut s = Self::default();
        if let Some(v) = &file.downloads_dir {
            s.downloads_dir.clone_from(v);
        }
        if let Some(v) = &file.temp_dir {
            s.temp_dir.clone_from(v);
        }
        if let Some(v) = &file.exports_dir {
            s.exports_dir.clone_from(v);
        }
        if let Some(v) = &file.database_path {
            s.database_path.clone_from(v);
        }
        if let Some(v) = file.max_concurrent_downloads {
            s.max_concurrent_downloads = narrow(v, s.max_concurrent_downloads);
        }
        if let Some(v) = file.download_workers {
            s.download_workers = narrow(v, s.download_workers);
        }
        if let Some(v) = file.max_retries {
            s.max_retries = narrow(v, s.max_retries);
        }
        if let Some(v) = file.retry_backoff_ms {
            s.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = file.connect_timeout_secs {
            s.connect_timeout_secs = v;
        }
        if let Some(v) = file.read_timeout_secs {
            s.read_timeout_secs = v;
        }
        if let Some(v) = file.host_interval_ms {
            s.host_interval = Duration::from_millis(v);
        }
        if let Some(v) = &file.resolution_strategy {
            s.resolution_strategy.clone_from(v);
        }
        if let Some(v) = &file.iiif_quality {
            s.iiif_quality.clone_from(v);
        }
        if let Some(v) = file.prefer_native_pdf {
            s.prefer_native_pdf = v;
        }
        if let Some(v) = file.create_pdf_after_download {
            s.create_pdf_after_download = v;
        }
        if let Some(v) = file.tile_stitch_fallback {
            s.tile_stitch_fallback = v;
        }
        if let Some(v) = file.temp_retention_hours {
            s.temp_retention_hours = narrow(v, s.temp_retention_hours);
        }
        if let Some(v) = file.cancel_grace_secs {
            s.cancel_grace = Duration::from_secs(v);
        }
        if let Some(v) = file.exports_retention_days {
            s.exports_retention_days = narrow(v, s.exports_retention_days);
        }
        if let Some(v) = file.max_exports_per_item {
            s.max_exports_per_item = narrow(v, s.max_exports_per_item);
        }
        s
    }

    #[must_use]
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.downloads_dir, &self.temp_dir, &self.exports_dir)
    }

    #[must_use]
    pub fn acquire_settings(&self) -> AcquireSettings {
        AcquireSettings {
            page_workers: self.download_workers,
            retry: RetryPolicy::new(self.max_retries, self.retry_backoff),
            resolution_strategy: self.resolution_strategy.clone(),
            iiif_quality: self.iiif_quality.clone(),
            prefer_native_pdf: self.prefer_native_pdf,
            create_pdf: self.create_pdf_after_download,
            tile_stitch: self.tile_stitch_fallback,
        }
    }

    #[must_use]
    pub fn job_manager_config(&self) -> JobManagerConfig {
        JobManagerConfig {
            max_concurrent_downloads: self.max_concurrent_downloads,
            cancel_grace: self.cancel_grace,
        }
    }

    #[must_use]
    pub fn export_settings(&self) -> ExportSettings {
        ExportSettings {
            max_exports_per_item: self.max_exports_per_item,
            exports_retention_days: self.exports_retention_days,
        }
    }

    #[must_use]
    pub fn throttle(&self) -> Arc<HostThrottle> {
        if self.host_interval.is_zero() {
            Arc::new(HostThrottle::disabled())
        } else {
            Arc::new(HostThrottle::new(self.host_interval))
        }
    }
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

impl LoadedConfig {
    #[must_use]
    pub fn loaded_from_file(&self) -> bool {
        self.config.is_some()
    }
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/scriptorium/config.toml`
/// 2. `$HOME/.config/scriptorium/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("scriptorium").join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(PathBuf::from(home).join(".config").join("scriptorium").join("config.toml"))
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config at `explicit`, or at the default path if it exists.
///
/// An explicit path that does not exist is an error; a missing default
/// file is not.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = load_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(p) if p.exists() => Some(load_file_config(p)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw).with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

/// Parses config text; see the module docs for the syntax.
pub fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "downloads_dir" => cfg.downloads_dir = Some(parse_path(value).with_context(invalid)?),
            "temp_dir" => cfg.temp_dir = Some(parse_path(value).with_context(invalid)?),
            "exports_dir" => cfg.exports_dir = Some(parse_path(value).with_context(invalid)?),
            "database_path" => cfg.database_path = Some(parse_path(value).with_context(invalid)?),
            "max_concurrent_downloads" => {
                cfg.max_concurrent_downloads = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "download_workers" => cfg.download_workers = Some(parse_integer_u64(value).with_context(invalid)?),
            "max_retries" => cfg.max_retries = Some(parse_integer_u64(value).with_context(invalid)?),
            "retry_backoff_ms" => cfg.retry_backoff_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "read_timeout_secs" => cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(invalid)?),
            "host_interval_ms" => cfg.host_interval_ms = Some(parse_integer_u64(value).with_context(invalid)?),
            "resolution_strategy" => {
                let list = parse_string_literal(value).with_context(invalid)?;
                cfg.resolution_strategy = Some(
                    list.split(',')
                        .map(str::trim)
                        .filter(|token| !token.is_empty())
                        .map(str::to_string)
                        .collect(),
                );
            }
            "iiif_quality" => cfg.iiif_quality = Some(parse_string_literal(value).with_context(invalid)?),
            "prefer_native_pdf" => cfg.prefer_native_pdf = Some(parse_boolean(value).with_context(invalid)?),
            "create_pdf_after_download" => {
                cfg.create_pdf_after_download = Some(parse_boolean(value).with_context(invalid)?);
            }
            "tile_stitch_fallback" => cfg.tile_stitch_fallback = Some(parse_boolean(value).with_context(invalid)?),
            "temp_retention_hours" => {
                cfg.temp_retention_hours = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "cancel_grace_secs" => cfg.cancel_grace_secs = Some(parse_integer_u64(value).with_context(invalid)?),
            "exports_retention_days" => {
                cfg.exports_retention_days = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            "max_exports_per_item" => {
                cfg.max_exports_per_item = Some(parse_integer_u64(value).with_context(invalid)?);
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_no}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_path(raw_value: &str) -> Result<PathBuf> {
    let text = parse_string_literal(raw_value)?;
    if text.trim().is_empty() {
        bail!("Expected a non-empty path");
    }
    Ok(PathBuf::from(text))
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}

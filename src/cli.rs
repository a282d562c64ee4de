//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Resumable acquisition and export of IIIF manuscripts.
///
/// Manuscripts are registered from their IIIF manifest, downloaded page by
/// page into a local vault, and exported as image bundles or PDFs.
#[derive(Parser, Debug)]
#[command(name = "scriptorium")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/scriptorium/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root folder for downloaded manuscripts
    #[arg(long, global = true, value_name = "DIR")]
    pub downloads_dir: Option<PathBuf>,

    /// Vault database file
    #[arg(long, global = true, value_name = "PATH")]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register a manuscript from its manifest without downloading pages
    Add(ManuscriptArgs),

    /// Download a manuscript's pages (resumes what is already on disk)
    Download(DownloadArgs),

    /// Download only the pages recorded as missing
    RetryMissing(ItemArgs),

    /// Export manuscripts as a zip of images or a PDF
    Export(ExportArgs),

    /// List registered manuscripts
    List {
        /// Maximum rows shown
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Only manuscripts whose identifier, title or library contains this text
        #[arg(long)]
        search: Option<String>,
    },

    /// List download and export jobs
    Jobs {
        /// Maximum rows shown per kind
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },

    /// Reconcile the vault with the filesystem and clear stale jobs
    Reconcile,

    /// Delete a manuscript, its jobs and its files
    Delete(ItemArgs),
}

#[derive(Args, Debug)]
pub struct ManuscriptArgs {
    /// IIIF manifest URL
    pub manifest_url: String,

    /// Holding library (e.g. Gallica, Vaticana)
    #[arg(short, long, default_value = "Unknown")]
    pub library: String,

    /// Folder/identifier override
    #[arg(long = "id", value_name = "ID")]
    pub id: Option<String>,
}

#[derive(Args, Debug)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub manuscript: ManuscriptArgs,

    /// Restrict the run to these pages, e.g. "3,7-9"
    #[arg(long, value_name = "SELECTION")]
    pub pages: Option<String>,

    /// Ignore a PDF rendering advertised by the manifest
    #[arg(long)]
    pub no_native_pdf: bool,

    /// Assemble a PDF from the pages after downloading
    #[arg(long)]
    pub create_pdf: bool,

    /// Page workers for this manuscript (1-32)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub workers: Option<u8>,

    /// Retry passes per page (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,
}

#[derive(Args, Debug)]
pub struct ItemArgs {
    /// Manuscript identifier
    pub doc_id: String,

    /// Holding library
    #[arg(short, long)]
    pub library: String,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Items as "library::doc_id", separated by "|"
    pub items: String,

    /// Export format (pdf_images, zip_images)
    #[arg(short, long, default_value = "pdf_images")]
    pub format: String,

    /// Custom page selection, e.g. "1,3-5"; all pages when omitted
    #[arg(long, value_name = "SELECTION")]
    pub pages: Option<String>,

    /// Delivery destination
    #[arg(long, default_value = "local_filesystem")]
    pub destination: String,
}

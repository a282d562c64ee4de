//! Blocking artifact builders: page selection, zip and PDF output, pruning.
//!
//! Everything here touches the filesystem synchronously and is run through
//! `spawn_blocking` by the export service.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, warn};
use zip::CompressionMethod;
use zip::write::FileOptions;

use super::error::{ExportError, Result};
use crate::pdf;
use crate::storage::{DocumentPaths, page_file_name, sanitize_filename, scan_page_numbers};
use crate::vault::SelectionMode;

/// Timestamp used in artifact names, `%Y%m%d_%H%M%S`.
#[must_use]
pub fn export_stamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn export_prefix(doc_id: &str) -> String {
    format!("{}_export", sanitize_filename(doc_id))
}

/// Pages to export for one item, checked against the files in `scans`.
///
/// # Errors
///
/// No local pages at all, an empty custom selection, or custom pages that
/// are not on disk.
pub fn resolve_selected_pages(
    doc_id: &str,
    scans: &Path,
    mode: SelectionMode,
    requested: &[u32],
) -> Result<Vec<u32>> {
    let available = scan_page_numbers(scans);
    if available.is_empty() {
        return Err(ExportError::NoLocalPages {
            doc_id: doc_id.to_string(),
        });
    }
    match mode {
        SelectionMode::All => Ok(available.into_iter().collect()),
        SelectionMode::Custom => {
            if requested.is_empty() {
                return Err(ExportError::EmptySelection);
            }
            let missing: Vec<u32> = requested
                .iter()
                .copied()
                .filter(|page| !available.contains(page))
                .collect();
            if !missing.is_empty() {
                return Err(ExportError::PagesMissing {
                    doc_id: doc_id.to_string(),
                    pages: missing,
                });
            }
            let mut pages = requested.to_vec();
            pages.sort_unstable();
            pages.dedup();
            Ok(pages)
        }
    }
}

/// `{doc}_export_images_{stamp}.zip`
#[must_use]
pub fn single_zip_name(doc_id: &str, stamp: &str) -> String {
    format!("{}_images_{stamp}.zip", export_prefix(doc_id))
}

/// `{doc}_export_full_{stamp}.pdf`, or `{doc}_export_p{a}-{b}[_n{k}]_{stamp}.pdf`
/// for a custom selection (`_n{k}` when the range has gaps).
#[must_use]
pub fn single_pdf_name(doc_id: &str, mode: SelectionMode, pages: &[u32], stamp: &str) -> String {
    let prefix = export_prefix(doc_id);
    match (mode, pages.first(), pages.last()) {
        (SelectionMode::Custom, Some(&first), Some(&last)) => {
            let contiguous = pages.len() as u64 == u64::from(last - first) + 1;
            if contiguous {
                format!("{prefix}_p{first}-{last}_{stamp}.pdf")
            } else {
                format!("{prefix}_p{first}-{last}_n{}_{stamp}.pdf", pages.len())
            }
        }
        _ => format!("{prefix}_full_{stamp}.pdf"),
    }
}

/// Per-item artifact name inside a batch folder.
#[must_use]
pub fn batch_item_name(doc_id: &str, zip: bool, stamp: &str) -> String {
    let doc = sanitize_filename(doc_id);
    if zip {
        format!("{doc}_images_{stamp}.zip")
    } else {
        format!("{doc}_export_{stamp}.pdf")
    }
}

/// `export_batch_{job_id}_{stamp}.zip`
#[must_use]
pub fn batch_bundle_name(job_id: &str, stamp: &str) -> String {
    format!("export_batch_{}_{stamp}.zip", sanitize_filename(job_id))
}

fn deflated() -> FileOptions {
    FileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Writes the selected page files into a zip; entries keep their page names.
///
/// # Errors
///
/// IO or archive errors; the partial archive is removed.
pub fn zip_pages(scans: &Path, pages: &[u32], output: &Path) -> Result<PathBuf> {
    let entries: Vec<PathBuf> = pages
        .iter()
        .map(|&page| scans.join(page_file_name(page)))
        .filter(|path| {
            let exists = path.is_file();
            if !exists {
                debug!(path = %path.display(), "skipping missing scan");
            }
            exists
        })
        .collect();
    write_zip(&entries, output)
}

/// Bundles finished artifacts into one archive.
///
/// # Errors
///
/// IO or archive errors; the partial archive is removed.
pub fn bundle(artifacts: &[PathBuf], output: &Path) -> Result<PathBuf> {
    write_zip(artifacts, output)
}

fn write_zip(files: &[PathBuf], output: &Path) -> Result<PathBuf> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ExportError::io(parent, e))?;
    }
    let result = (|| -> Result<()> {
        let file = File::create(output).map_err(|e| ExportError::io(output, e))?;
        let mut archive = zip::ZipWriter::new(file);
        for path in files {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let data = std::fs::read(path).map_err(|e| ExportError::io(path, e))?;
            archive.start_file(name, deflated())?;
            archive.write_all(&data).map_err(|e| ExportError::io(output, e))?;
        }
        archive.finish()?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(output.to_path_buf()),
        Err(e) => {
            let _ = std::fs::remove_file(output);
            Err(e)
        }
    }
}

/// Writes the selected pages as an images-only PDF.
///
/// # Errors
///
/// Returns [`ExportError::Pdf`] when a page cannot be embedded.
pub fn pdf_pages(scans: &Path, pages: &[u32], output: &Path) -> Result<PathBuf> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ExportError::io(parent, e))?;
    }
    let files: Vec<PathBuf> = pages.iter().map(|&page| scans.join(page_file_name(page))).collect();
    pdf::write_images_pdf(&files, output)?;
    Ok(output.to_path_buf())
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Keeps the newest `keep` `*_export_*.pdf` files in an item's `pdf/` folder.
///
/// Returns how many were removed.
pub fn prune_item_exports(pdf_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = std::fs::read_dir(pdf_dir) else {
        return 0;
    };
    let mut exports: Vec<(SystemTime, PathBuf)> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path.extension().is_some_and(|ext| ext == "pdf")
                && path
                    .file_stem()
                    .is_some_and(|stem| stem.to_string_lossy().contains("_export_"))
        })
        .map(|path| (modified(&path), path))
        .collect();
    exports.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, stale) in exports.into_iter().skip(keep.max(1)) {
        match std::fs::remove_file(&stale) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %stale.display(), error = %e, "failed to prune old export"),
        }
    }
    removed
}

/// Removes files under `exports_dir` older than `retention_days`.
///
/// Returns how many were removed.
pub fn prune_exports_dir(exports_dir: &Path, retention_days: u32) -> usize {
    let keep = Duration::from_secs(u64::from(retention_days.max(1)) * 86_400);
    let Some(cutoff) = SystemTime::now().checked_sub(keep) else {
        return 0;
    };
    prune_older_than(exports_dir, cutoff)
}

fn prune_older_than(dir: &Path, cutoff: SystemTime) -> usize {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut removed = 0;
    for path in entries.flatten().map(|entry| entry.path()) {
        if path.is_dir() {
            removed += prune_older_than(&path, cutoff);
        } else if modified(&path) < cutoff && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    removed
}

/// Classification of a PDF found in an item's `pdf/` folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PdfKind {
    /// The library's own rendering, `{doc_id}.pdf`.
    Native,
    /// Assembled after download, `{doc_id}_compiled.pdf`.
    Compiled,
    /// Produced by an export job.
    StudioExport,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct PdfFileEntry {
    pub name: String,
    pub path: PathBuf,
    pub kind: PdfKind,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

/// PDFs stored for one item, newest first.
#[must_use]
pub fn list_item_pdf_files(paths: &DocumentPaths, doc_id: &str) -> Vec<PdfFileEntry> {
    let Ok(entries) = std::fs::read_dir(&paths.pdf) else {
        return Vec::new();
    };
    let native = paths.native_pdf(doc_id);
    let compiled = paths.compiled_pdf(doc_id);

    let mut files: Vec<PdfFileEntry> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "pdf"))
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let kind = if path == native {
                PdfKind::Native
            } else if path == compiled {
                PdfKind::Compiled
            } else if name.contains("_export_") {
                PdfKind::StudioExport
            } else {
                PdfKind::Other
            };
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            PdfFileEntry {
                modified: modified(&path),
                name,
                path,
                kind,
                size_bytes,
            }
        })
        .collect();
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    files
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::validate::tests::sample_jpeg;
    use crate::storage::StorageLayout;
    use std::io::Read;

    fn scans_with(dir: &Path, pages: &[u32]) -> PathBuf {
        let scans = dir.join("scans");
        std::fs::create_dir_all(&scans).unwrap();
        for &page in pages {
            std::fs::write(scans.join(page_file_name(page)), sample_jpeg(40, 60)).unwrap();
        }
        scans
    }

    #[test]
    fn test_resolve_selected_pages_modes() {
        let dir = tempfile::TempDir::new().unwrap();
        let scans = scans_with(dir.path(), &[1, 2, 4]);

        assert_eq!(
            resolve_selected_pages("ms", &scans, SelectionMode::All, &[]).unwrap(),
            vec![1, 2, 4]
        );
        assert_eq!(
            resolve_selected_pages("ms", &scans, SelectionMode::Custom, &[4, 1]).unwrap(),
            vec![1, 4]
        );
        assert!(matches!(
            resolve_selected_pages("ms", &scans, SelectionMode::Custom, &[]),
            Err(ExportError::EmptySelection)
        ));
        match resolve_selected_pages("ms", &scans, SelectionMode::Custom, &[2, 3, 5]) {
            Err(ExportError::PagesMissing { pages, .. }) => assert_eq!(pages, vec![3, 5]),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_resolve_selected_pages_without_scans() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            resolve_selected_pages("ms", &dir.path().join("scans"), SelectionMode::All, &[]),
            Err(ExportError::NoLocalPages { .. })
        ));
    }

    #[test]
    fn test_single_pdf_name_variants() {
        let stamp = "20260101_120000";
        assert_eq!(
            single_pdf_name("ms 1", SelectionMode::All, &[1, 2], stamp),
            "ms_1_export_full_20260101_120000.pdf"
        );
        assert_eq!(
            single_pdf_name("ms", SelectionMode::Custom, &[3, 4, 5], stamp),
            "ms_export_p3-5_20260101_120000.pdf"
        );
        assert_eq!(
            single_pdf_name("ms", SelectionMode::Custom, &[1, 3, 9], stamp),
            "ms_export_p1-9_n3_20260101_120000.pdf"
        );
        assert_eq!(single_zip_name("ms", stamp), "ms_export_images_20260101_120000.zip");
        assert_eq!(batch_bundle_name("ab12cd34", stamp), "export_batch_ab12cd34_20260101_120000.zip");
    }

    #[test]
    fn test_zip_pages_keeps_page_names() {
        let dir = tempfile::TempDir::new().unwrap();
        let scans = scans_with(dir.path(), &[1, 3]);
        let output = dir.path().join("out/images.zip");

        zip_pages(&scans, &[1, 3], &output).unwrap();

        let mut archive = zip::ZipArchive::new(File::open(&output).unwrap()).unwrap();
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["pag_0000.jpg", "pag_0002.jpg"]);

        let mut data = Vec::new();
        archive.by_name("pag_0002.jpg").unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, std::fs::read(scans.join("pag_0002.jpg")).unwrap());
    }

    #[test]
    fn test_pdf_pages_writes_document() {
        let dir = tempfile::TempDir::new().unwrap();
        let scans = scans_with(dir.path(), &[1, 2]);
        let output = dir.path().join("pdf/ms_export_full.pdf");

        pdf_pages(&scans, &[1, 2], &output).unwrap();
        let bytes = std::fs::read(&output).unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
    }

    #[test]
    fn test_prune_item_exports_keeps_newest() {
        let dir = tempfile::TempDir::new().unwrap();
        for i in 0..4 {
            std::fs::write(dir.path().join(format!("ms_export_full_{i}.pdf")), b"x").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        std::fs::write(dir.path().join("ms.pdf"), b"native").unwrap();

        assert_eq!(prune_item_exports(dir.path(), 2), 2);
        assert!(dir.path().join("ms_export_full_3.pdf").exists());
        assert!(dir.path().join("ms_export_full_2.pdf").exists());
        assert!(!dir.path().join("ms_export_full_0.pdf").exists());
        assert!(dir.path().join("ms.pdf").exists());
    }

    #[test]
    fn test_prune_exports_dir_keeps_recent_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("job1")).unwrap();
        std::fs::write(dir.path().join("job1/bundle.zip"), b"x").unwrap();
        assert_eq!(prune_exports_dir(dir.path(), 30), 0);
        assert_eq!(prune_older_than(dir.path(), SystemTime::now() + Duration::from_secs(60)), 1);
    }

    #[test]
    fn test_list_item_pdf_files_classifies() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = StorageLayout::under(dir.path()).document("ms1", "Gallica");
        std::fs::create_dir_all(&paths.pdf).unwrap();
        std::fs::write(paths.native_pdf("ms1"), b"a").unwrap();
        std::fs::write(paths.compiled_pdf("ms1"), b"b").unwrap();
        std::fs::write(paths.pdf.join("ms1_export_full_x.pdf"), b"c").unwrap();
        std::fs::write(paths.pdf.join("notes.pdf"), b"d").unwrap();
        std::fs::write(paths.pdf.join("readme.txt"), b"e").unwrap();

        let mut kinds: Vec<(String, PdfKind)> = list_item_pdf_files(&paths, "ms1")
            .into_iter()
            .map(|f| (f.name, f.kind))
            .collect();
        kinds.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            kinds,
            vec![
                ("ms1.pdf".to_string(), PdfKind::Native),
                ("ms1_compiled.pdf".to_string(), PdfKind::Compiled),
                ("ms1_export_full_x.pdf".to_string(), PdfKind::StudioExport),
                ("notes.pdf".to_string(), PdfKind::Other),
            ]
        );
    }
}

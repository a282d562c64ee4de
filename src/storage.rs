//! On-disk layout for manuscripts, staging folders and exports.
//!
//! Every manuscript owns `{downloads}/{library}/{doc_id}/` with `scans/`,
//! `pdf/`, `data/` and `exports/` below it. Page `N` (1-based) is always
//! stored as `pag_{N-1:04}.jpg`; acquisition, normalization and export all
//! rely on that mapping.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

/// Prefix shared by all page image files.
pub const PAGE_FILE_PREFIX: &str = "pag_";

/// Extension of page image files.
pub const PAGE_FILE_EXTENSION: &str = "jpg";

/// Identifier used when nothing usable can be derived from a manifest.
const UNKNOWN_IDENTIFIER: &str = "unknown_manuscript";

#[allow(clippy::expect_used)]
static ARK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ark[:/]+\d+/([a-zA-Z0-9]+)").expect("ARK regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})",
    )
    .expect("UUID regex is valid") // Static pattern, safe to panic
});

#[allow(clippy::expect_used)]
static SHELFMARK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(MSS_[A-Za-z0-9._-]+)").expect("shelfmark regex is valid") // Static pattern, safe to panic
});

/// Root directories used by the vault, the acquisition pipeline and exports.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    downloads_dir: PathBuf,
    temp_dir: PathBuf,
    exports_dir: PathBuf,
}

impl StorageLayout {
    /// Creates a layout from its three root directories.
    #[must_use]
    pub fn new(
        downloads_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        exports_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            temp_dir: temp_dir.into(),
            exports_dir: exports_dir.into(),
        }
    }

    /// Layout rooted in a single directory (`downloads/`, `temp/`, `exports/`).
    #[must_use]
    pub fn under(base: &Path) -> Self {
        Self::new(
            base.join("downloads"),
            base.join("temp"),
            base.join("exports"),
        )
    }

    #[must_use]
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    #[must_use]
    pub fn exports_dir(&self) -> &Path {
        &self.exports_dir
    }

    /// Returns the folder set of one manuscript.
    #[must_use]
    pub fn document(&self, doc_id: &str, library: &str) -> DocumentPaths {
        let root = self
            .downloads_dir
            .join(sanitize_filename(library))
            .join(sanitize_filename(doc_id));
        DocumentPaths::new(root)
    }

    /// Returns the scratch folder used while a manuscript is being acquired.
    ///
    /// Keyed like [`Self::document`], so the same `doc_id` held by two
    /// libraries never shares staged pages.
    #[must_use]
    pub fn staging_dir(&self, doc_id: &str, library: &str) -> PathBuf {
        self.temp_dir
            .join(sanitize_filename(library))
            .join(sanitize_filename(doc_id))
    }

    /// Returns true when `path` resolves to a location strictly below the downloads root.
    ///
    /// Paths that cannot be canonicalized (missing, dangling) are never contained.
    #[must_use]
    pub fn contains_download_path(&self, path: &Path) -> bool {
        let (Ok(root), Ok(candidate)) = (
            std::fs::canonicalize(&self.downloads_dir),
            std::fs::canonicalize(path),
        ) else {
            return false;
        };
        candidate != root && candidate.starts_with(&root)
    }
}

/// Folder set owned by one manuscript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPaths {
    pub root: PathBuf,
    pub scans: PathBuf,
    pub pdf: PathBuf,
    pub data: PathBuf,
    pub exports: PathBuf,
}

impl DocumentPaths {
    fn new(root: PathBuf) -> Self {
        Self {
            scans: root.join("scans"),
            pdf: root.join("pdf"),
            data: root.join("data"),
            exports: root.join("exports"),
            root,
        }
    }

    /// Path of page `page` (1-based) inside `scans/`.
    #[must_use]
    pub fn page_path(&self, page: u32) -> PathBuf {
        self.scans.join(page_file_name(page))
    }

    #[must_use]
    pub fn manifest_file(&self) -> PathBuf {
        self.data.join("manifest.json")
    }

    #[must_use]
    pub fn metadata_file(&self) -> PathBuf {
        self.data.join("metadata.json")
    }

    /// Publisher-rendered PDF stored as `pdf/{doc_id}.pdf`.
    #[must_use]
    pub fn native_pdf(&self, doc_id: &str) -> PathBuf {
        self.pdf.join(format!("{}.pdf", sanitize_filename(doc_id)))
    }

    /// PDF assembled locally from page images.
    #[must_use]
    pub fn compiled_pdf(&self, doc_id: &str) -> PathBuf {
        self.pdf
            .join(format!("{}_compiled.pdf", sanitize_filename(doc_id)))
    }

    /// Creates every folder of the set.
    ///
    /// # Errors
    ///
    /// Returns the underlying IO error when a folder cannot be created.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for dir in [&self.scans, &self.pdf, &self.data, &self.exports] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

/// File name for page `page` (1-based): page 1 is `pag_0000.jpg`.
#[must_use]
pub fn page_file_name(page: u32) -> String {
    format!(
        "{PAGE_FILE_PREFIX}{:04}.{PAGE_FILE_EXTENSION}",
        page.saturating_sub(1)
    )
}

/// Parses a page file name back to its 1-based page number.
#[must_use]
pub fn page_number_from_file_name(name: &str) -> Option<u32> {
    let index = name
        .strip_prefix(PAGE_FILE_PREFIX)?
        .strip_suffix(PAGE_FILE_EXTENSION)?
        .strip_suffix('.')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    index.parse::<u32>().ok()?.checked_add(1)
}

/// Lists the 1-based page numbers present in `dir`.
///
/// A missing directory yields an empty set; malformed names are skipped.
#[must_use]
pub fn scan_page_numbers(dir: &Path) -> BTreeSet<u32> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return BTreeSet::new();
    };
    let mut pages = BTreeSet::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        match page_number_from_file_name(name) {
            Some(page) => {
                pages.insert(page);
            }
            None => {
                debug!(dir = %dir.display(), file = name, "skipping non-page file");
            }
        }
    }
    pages
}

/// Keeps alphanumerics, space, `.`, `_` and `-`, then maps spaces to `_`.
#[must_use]
pub fn sanitize_filename(label: &str) -> String {
    let kept: String = label
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect();
    kept.trim().replace(' ', "_")
}

/// Canonical library name used as the manuscript key.
#[must_use]
pub fn normalize_library(library: &str) -> String {
    let trimmed = library.trim();
    match trimmed {
        "Vaticana (BAV)" => "Vaticana".to_string(),
        _ => trimmed.to_string(),
    }
}

/// Derives the folder/database identifier for a manuscript.
///
/// Priority: explicit override, ARK token, UUID, `MSS_*` shelfmark, the
/// manifest label, then the last meaningful path segment of the URL.
#[must_use]
pub fn derive_identifier(
    manifest_url: &str,
    folder_override: Option<&str>,
    label: Option<&str>,
) -> String {
    if let Some(clean) = folder_override
        .map(|value| sanitize_filename(value.trim()))
        .filter(|value| !value.is_empty())
    {
        return clean;
    }

    if let Some(caps) = ARK_PATTERN.captures(manifest_url) {
        return sanitize_filename(&caps[1]);
    }

    if let Some(caps) = UUID_PATTERN.captures(manifest_url) {
        return caps[1].to_lowercase();
    }

    if let Some(caps) = SHELFMARK_PATTERN.captures(manifest_url) {
        return sanitize_filename(&caps[1]);
    }

    if let Some(clean) = label
        .map(sanitize_filename)
        .filter(|value| !value.is_empty())
    {
        return clean;
    }

    let parts: Vec<&str> = manifest_url
        .split('/')
        .filter(|part| !part.is_empty())
        .collect();
    let last = match parts.as_slice() {
        [.., parent, last] if last.to_lowercase().ends_with("manifest.json") => Some(*parent),
        [.., last] => Some(*last),
        [] => None,
    };
    last.map(sanitize_filename)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_page_file_name_is_zero_based_and_padded() {
        assert_eq!(page_file_name(1), "pag_0000.jpg");
        assert_eq!(page_file_name(12), "pag_0011.jpg");
        assert_eq!(page_file_name(10_000), "pag_9999.jpg");
    }

    #[test]
    fn test_page_number_from_file_name_round_trips() {
        assert_eq!(page_number_from_file_name("pag_0000.jpg"), Some(1));
        assert_eq!(page_number_from_file_name(&page_file_name(42)), Some(42));
    }

    #[test]
    fn test_page_number_from_file_name_rejects_malformed() {
        assert_eq!(page_number_from_file_name("pag_.jpg"), None);
        assert_eq!(page_number_from_file_name("pag_00x1.jpg"), None);
        assert_eq!(page_number_from_file_name("pag_0001.jpg.part"), None);
        assert_eq!(page_number_from_file_name("cover.jpg"), None);
    }

    #[test]
    fn test_scan_page_numbers_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["pag_0000.jpg", "pag_0004.jpg", "notes.txt", "pag_0002.jpg.part"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pages = scan_page_numbers(dir.path());
        assert_eq!(pages.into_iter().collect::<Vec<_>>(), vec![1, 5]);
    }

    #[test]
    fn test_scan_page_numbers_missing_dir_is_empty() {
        let pages = scan_page_numbers(Path::new("/definitely/not/here"));
        assert!(pages.is_empty());
    }

    #[test]
    fn test_document_paths_layout() {
        let layout = StorageLayout::under(Path::new("/data"));
        let doc = layout.document("MSS_Urb.lat.1779", "Vaticana");
        assert_eq!(
            doc.root,
            PathBuf::from("/data/downloads/Vaticana/MSS_Urb.lat.1779")
        );
        assert_eq!(
            doc.page_path(3),
            PathBuf::from("/data/downloads/Vaticana/MSS_Urb.lat.1779/scans/pag_0002.jpg")
        );
        assert_eq!(
            layout.staging_dir("MSS_Urb.lat.1779", "Vaticana"),
            PathBuf::from("/data/temp/Vaticana/MSS_Urb.lat.1779")
        );
        assert_ne!(
            layout.staging_dir("ms1", "Gallica"),
            layout.staging_dir("ms1", "Vaticana")
        );
    }

    #[test]
    fn test_contains_download_path_rejects_outside_and_root() {
        let base = tempfile::tempdir().unwrap();
        let layout = StorageLayout::under(base.path());
        let inside = layout.document("ms1", "Gallica").root;
        std::fs::create_dir_all(&inside).unwrap();
        let outside = base.path().join("elsewhere");
        std::fs::create_dir_all(&outside).unwrap();

        assert!(layout.contains_download_path(&inside));
        assert!(!layout.contains_download_path(&outside));
        assert!(!layout.contains_download_path(layout.downloads_dir()));
    }

    #[test]
    fn test_sanitize_filename_strips_unsafe_characters() {
        assert_eq!(sanitize_filename(" Codex: Urb/lat 1779 "), "Codex_Urblat_1779");
        assert_eq!(sanitize_filename("a.b_c-d"), "a.b_c-d");
    }

    #[test]
    fn test_normalize_library_aliases() {
        assert_eq!(normalize_library("Vaticana (BAV)"), "Vaticana");
        assert_eq!(normalize_library(" Gallica "), "Gallica");
    }

    #[test]
    fn test_derive_identifier_prefers_override() {
        let id = derive_identifier("https://x.org/ark:/12148/btv1b1", Some("my folder"), None);
        assert_eq!(id, "my_folder");
    }

    #[test]
    fn test_derive_identifier_ark() {
        let id = derive_identifier(
            "https://gallica.bnf.fr/iiif/ark:/12148/btv1b10033406t/manifest.json",
            None,
            Some("ignored"),
        );
        assert_eq!(id, "btv1b10033406t");
    }

    #[test]
    fn test_derive_identifier_uuid_is_lowercased() {
        let id = derive_identifier(
            "https://iiif.bodleian.ox.ac.uk/iiif/manifest/AE9F6CCA-AE5C-4149-8FE4-95E6EDA1F9B0.json",
            None,
            None,
        );
        assert_eq!(id, "ae9f6cca-ae5c-4149-8fe4-95e6eda1f9b0");
    }

    #[test]
    fn test_derive_identifier_vatican_shelfmark() {
        let id = derive_identifier(
            "https://digi.vatlib.it/iiif/MSS_Urb.lat.1779/manifest.json",
            None,
            None,
        );
        assert_eq!(id, "MSS_Urb.lat.1779");
    }

    #[test]
    fn test_derive_identifier_falls_back_to_label_then_path() {
        assert_eq!(
            derive_identifier("https://example.org/iiif/42/manifest.json", None, Some("Book of Hours")),
            "Book_of_Hours"
        );
        assert_eq!(
            derive_identifier("https://example.org/iiif/book42/manifest.json", None, None),
            "book42"
        );
        assert_eq!(derive_identifier("", None, None), UNKNOWN_IDENTIFIER);
    }
}

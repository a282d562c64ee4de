//! Minimal image-only PDF assembly and JPEG extraction.
//!
//! Page PDFs built here hold exactly one DCT-encoded image per page, sized
//! at 72 dpi so one pixel maps to one point. Extraction walks the raw object
//! page tree of a PDF and returns every embedded `/DCTDecode` image in page
//! order, which is how publisher-rendered manuscript PDFs store their scans.

use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;

use image::ImageOutputFormat;
use lopdf::{Dictionary, Document, Object, ObjectId, Stream, dictionary};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::download::inspect_image_bytes;

/// Images narrower or shorter than this are logos or thumbnails, not pages.
const MIN_EXTRACTED_SIDE: u32 = 50;

/// JPEG quality used when a page file has to be re-encoded.
const REENCODE_QUALITY: u8 = 90;

/// Bound on `/Parent` hops while looking for inherited resources.
const MAX_TREE_DEPTH: usize = 32;

/// Errors raised while assembling a PDF.
#[derive(Debug, Error)]
pub enum PdfError {
    #[error("no pages to write")]
    NoPages,

    #[error("page {path} is not a usable image: {reason}")]
    BadPage { path: String, reason: String },

    #[error("PDF encoding failed: {0}")]
    Encode(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PdfError>;

/// One page prepared for embedding.
struct JpegPage {
    data: Vec<u8>,
    width: u32,
    height: u32,
    components: u8,
}

/// Writes `pages` (image files, in order) as a one-image-per-page PDF.
///
/// JPEG files are embedded unchanged; any other image format is re-encoded
/// to JPEG first. Blocking; run inside `spawn_blocking` from async code.
///
/// # Errors
///
/// Returns [`PdfError::NoPages`] for an empty list, [`PdfError::BadPage`]
/// for an unreadable image, [`PdfError::Encode`] when serialization fails
/// and [`PdfError::Io`] on write failure.
#[instrument(skip(pages), fields(pages = pages.len(), output = %output.display()))]
pub fn write_images_pdf<P: AsRef<Path>>(pages: &[P], output: &Path) -> Result<()> {
    if pages.is_empty() {
        return Err(PdfError::NoPages);
    }

    let mut prepared = Vec::with_capacity(pages.len());
    for page in pages {
        prepared.push(load_page(page.as_ref())?);
    }
    let document = render_document(prepared)?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent).map_err(|source| PdfError::Io {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let part = output.with_extension("pdf.part");
    std::fs::write(&part, &document)
        .and_then(|()| std::fs::rename(&part, output))
        .map_err(|source| {
            let _ = std::fs::remove_file(&part);
            PdfError::Io {
                path: output.display().to_string(),
                source,
            }
        })?;

    debug!(bytes = document.len(), "PDF written");
    Ok(())
}

fn load_page(path: &Path) -> Result<JpegPage> {
    let bad = |reason: String| PdfError::BadPage {
        path: path.display().to_string(),
        reason,
    };
    let data = std::fs::read(path).map_err(|source| PdfError::Io {
        path: path.display().to_string(),
        source,
    })?;

    if let Some((width, height, components)) = jpeg_frame_info(&data) {
        return Ok(JpegPage {
            data,
            width,
            height,
            components,
        });
    }

    let decoded = image::load_from_memory(&data).map_err(|e| bad(e.to_string()))?;
    let rgb = decoded.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(rgb)
        .write_to(&mut out, ImageOutputFormat::Jpeg(REENCODE_QUALITY))
        .map_err(|e| bad(e.to_string()))?;
    Ok(JpegPage {
        data: out.into_inner(),
        width,
        height,
        components: 3,
    })
}

/// Reads `(width, height, components)` from a JPEG's start-of-frame segment.
fn jpeg_frame_info(data: &[u8]) -> Option<(u32, u32, u8)> {
    if data.len() < 4 || data[0] != 0xFF || data[1] != 0xD8 {
        return None;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        let length = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        let is_frame = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_frame {
            let segment = data.get(pos + 4..pos + 10)?;
            let height = u32::from(u16::from_be_bytes([segment[1], segment[2]]));
            let width = u32::from(u16::from_be_bytes([segment[3], segment[4]]));
            let components = segment[5];
            if width == 0 || height == 0 {
                return None;
            }
            return Some((width, height, components));
        }
        pos += 2 + length;
    }
    None
}

fn color_space(components: u8) -> &'static str {
    match components {
        1 => "DeviceGray",
        4 => "DeviceCMYK",
        _ => "DeviceRGB",
    }
}

/// Builds the page tree: one page per image, each drawing a single XObject.
fn render_document(pages: Vec<JpegPage>) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let count = pages.len();
    let mut kids: Vec<Object> = Vec::with_capacity(count);

    for page in pages {
        let width = i64::from(page.width);
        let height = i64::from(page.height);
        let image_id = doc.add_object(Object::Stream(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width,
                "Height" => height,
                "ColorSpace" => color_space(page.components),
                "BitsPerComponent" => 8_i64,
                "Filter" => "DCTDecode",
            },
            page.data,
        )));
        let content = format!("q\n{width} 0 0 {height} 0 0 cm\n/Im0 Do\nQ\n");
        let content_id = doc.add_object(Object::Stream(Stream::new(dictionary! {}, content.into_bytes())));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(width), Object::Integer(height)],
            "Resources" => dictionary! {
                "XObject" => dictionary! {
                    "Im0" => image_id,
                },
            },
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => i64::try_from(count).unwrap_or(i64::MAX),
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| PdfError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Extracts the embedded JPEG page images of a PDF, in page order.
///
/// Each page's image XObjects are visited through its (possibly inherited)
/// resources. Images whose filter chain ends in `/DCTDecode` are kept, after
/// undoing any leading filters; small images (logos, thumbnails) and streams
/// that fail validation are skipped. An unparseable PDF yields no pages.
#[must_use]
#[instrument(skip(pdf), fields(bytes = pdf.len()))]
pub fn extract_jpeg_pages(pdf: &[u8]) -> Vec<Vec<u8>> {
    let doc = match Document::load_mem(pdf) {
        Ok(doc) => doc,
        Err(e) => {
            debug!(error = %e, "unreadable PDF");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut pages = Vec::new();
    for page_id in doc.get_pages().into_values() {
        for image_id in page_image_ids(&doc, page_id) {
            if !seen.insert(image_id) {
                continue;
            }
            let Ok(Object::Stream(stream)) = doc.get_object(image_id) else {
                continue;
            };
            let Some(data) = jpeg_payload(stream) else {
                continue;
            };
            match inspect_image_bytes(&data) {
                Ok((width, height)) if width >= MIN_EXTRACTED_SIDE && height >= MIN_EXTRACTED_SIDE => {
                    pages.push(data);
                }
                Ok(_) => debug!("skipping small embedded image"),
                Err(reason) => debug!(reason = %reason, "skipping unreadable embedded image"),
            }
        }
    }

    debug!(pages = pages.len(), "extracted embedded page images");
    pages
}

/// Follows one level of indirection.
fn resolve<'a>(doc: &'a Document, object: &'a Object) -> Option<&'a Object> {
    match object {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

/// Image XObject ids referenced by a page, honoring inherited `/Resources`.
fn page_image_ids(doc: &Document, page_id: ObjectId) -> Vec<ObjectId> {
    let mut node = doc.get_object(page_id).ok().and_then(|o| o.as_dict().ok());
    let mut resources = None;
    for _ in 0..MAX_TREE_DEPTH {
        let Some(dict) = node else { break };
        if let Ok(found) = dict.get(b"Resources") {
            resources = resolve(doc, found).and_then(|o| o.as_dict().ok());
            break;
        }
        node = dict
            .get(b"Parent")
            .ok()
            .and_then(|parent| resolve(doc, parent))
            .and_then(|o| o.as_dict().ok());
    }

    let Some(xobjects) = resources
        .and_then(|r| r.get(b"XObject").ok())
        .and_then(|x| resolve(doc, x))
        .and_then(|x| x.as_dict().ok())
    else {
        return Vec::new();
    };

    xobjects
        .iter()
        .filter_map(|(_, value)| match value {
            Object::Reference(id) => Some(*id),
            _ => None,
        })
        .filter(|id| {
            matches!(
                doc.get_object(*id),
                Ok(Object::Stream(stream))
                    if matches!(stream.dict.get(b"Subtype"), Ok(Object::Name(name)) if name.as_slice() == b"Image")
            )
        })
        .collect()
}

/// Filters applied before `/DCTDecode`, or `None` when the stream is not a JPEG.
fn leading_filters(dict: &Dictionary) -> Option<Vec<Vec<u8>>> {
    let mut filters: Vec<Vec<u8>> = match dict.get(b"Filter").ok()? {
        Object::Name(name) => vec![name.clone()],
        Object::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Object::Name(name) => Some(name.clone()),
                _ => None,
            })
            .collect(),
        _ => return None,
    };
    if filters.pop()?.as_slice() != b"DCTDecode" {
        return None;
    }
    Some(filters)
}

fn jpeg_payload(stream: &Stream) -> Option<Vec<u8>> {
    let leading = leading_filters(&stream.dict)?;
    if leading.is_empty() {
        return Some(stream.content.clone());
    }

    let mut outer = stream.clone();
    let chain = leading.into_iter().map(Object::Name).collect::<Vec<_>>();
    outer.dict.set("Filter", Object::Array(chain));
    match outer.decompressed_content() {
        Ok(data) => Some(data),
        Err(e) => {
            debug!(error = %e, "cannot undo filters ahead of DCTDecode");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::validate::tests::sample_jpeg;
    use tempfile::TempDir;

    fn write_pages(dir: &Path, sizes: &[(u32, u32)]) -> Vec<std::path::PathBuf> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, (w, h))| {
                let path = dir.join(format!("pag_{i:04}.jpg"));
                std::fs::write(&path, sample_jpeg(*w, *h)).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_jpeg_frame_info_reads_dimensions() {
        assert_eq!(jpeg_frame_info(&sample_jpeg(120, 80)), Some((120, 80, 3)));
        assert_eq!(jpeg_frame_info(b"not a jpeg"), None);
    }

    fn media_box(doc: &Document, page_id: ObjectId) -> Vec<i64> {
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        page.get(b"MediaBox")
            .unwrap()
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_i64().unwrap())
            .collect()
    }

    #[test]
    fn test_write_images_pdf_structure() {
        let dir = TempDir::new().unwrap();
        let pages = write_pages(dir.path(), &[(100, 150), (120, 90)]);
        let output = dir.path().join("pdf").join("ms_compiled.pdf");

        write_images_pdf(&pages, &output).unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));
        let doc = Document::load_mem(&bytes).unwrap();
        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        assert_eq!(page_ids.len(), 2);
        assert_eq!(media_box(&doc, page_ids[0]), vec![0, 0, 100, 150]);
        assert_eq!(media_box(&doc, page_ids[1]), vec![0, 0, 120, 90]);
        assert!(!dir.path().join("pdf").join("ms_compiled.pdf.part").exists());
    }

    #[test]
    fn test_write_images_pdf_rejects_empty_and_bad_pages() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out.pdf");
        let none: Vec<std::path::PathBuf> = Vec::new();
        assert!(matches!(write_images_pdf(&none, &output), Err(PdfError::NoPages)));

        let bad = dir.path().join("pag_0000.jpg");
        std::fs::write(&bad, b"<html>oops</html>").unwrap();
        assert!(matches!(
            write_images_pdf(&[bad], &output),
            Err(PdfError::BadPage { .. })
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_extract_jpeg_pages_recovers_embedded_images() {
        let dir = TempDir::new().unwrap();
        let pages = write_pages(dir.path(), &[(100, 150), (120, 90), (80, 60)]);
        let output = dir.path().join("doc.pdf");
        write_images_pdf(&pages, &output).unwrap();

        let extracted = extract_jpeg_pages(&std::fs::read(&output).unwrap());
        assert_eq!(extracted.len(), 3);
        assert_eq!(extracted[0], std::fs::read(&pages[0]).unwrap());
        assert_eq!(inspect_image_bytes(&extracted[1]).unwrap(), (120, 90));
    }

    #[test]
    fn test_extract_jpeg_pages_skips_thumbnails_and_garbage() {
        let dir = TempDir::new().unwrap();
        let pages = write_pages(dir.path(), &[(20, 20), (100, 100)]);
        let output = dir.path().join("doc.pdf");
        write_images_pdf(&pages, &output).unwrap();

        let extracted = extract_jpeg_pages(&std::fs::read(&output).unwrap());
        assert_eq!(extracted.len(), 1);
        assert!(extract_jpeg_pages(b"%PDF-1.4\nnothing here\n%%EOF").is_empty());
    }

    #[test]
    fn test_extract_keeps_jpeg_containing_endstream_bytes() {
        // A comment segment carrying the stream terminator keyword.
        let plain = sample_jpeg(90, 70);
        let payload = b"scanned endstream endobj";
        let len = u16::try_from(payload.len() + 2).unwrap().to_be_bytes();
        let mut jpeg = plain[..2].to_vec();
        jpeg.extend_from_slice(&[0xFF, 0xFE, len[0], len[1]]);
        jpeg.extend_from_slice(payload);
        jpeg.extend_from_slice(&plain[2..]);
        assert_eq!(inspect_image_bytes(&jpeg).unwrap(), (90, 70));

        let dir = TempDir::new().unwrap();
        let page = dir.path().join("pag_0000.jpg");
        std::fs::write(&page, &jpeg).unwrap();
        let output = dir.path().join("doc.pdf");
        write_images_pdf(&[page], &output).unwrap();

        let extracted = extract_jpeg_pages(&std::fs::read(&output).unwrap());
        assert_eq!(extracted, vec![jpeg]);
    }

    #[test]
    fn test_leading_filters_accepts_dct_chains() {
        let plain = dictionary! { "Filter" => "DCTDecode" };
        assert_eq!(leading_filters(&plain), Some(Vec::new()));

        let chained = dictionary! {
            "Filter" => vec![Object::Name(b"FlateDecode".to_vec()), Object::Name(b"DCTDecode".to_vec())],
        };
        assert_eq!(leading_filters(&chained), Some(vec![b"FlateDecode".to_vec()]));

        let flate_only = dictionary! { "Filter" => "FlateDecode" };
        assert_eq!(leading_filters(&flate_only), None);
        assert_eq!(leading_filters(&dictionary! {}), None);
    }
}

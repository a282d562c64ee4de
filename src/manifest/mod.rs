//! IIIF Presentation manifest adapters.
//!
//! Manifests come in two shapes: v2 (`sequences[0].canvases[]` with
//! `images[].resource`) and v3 (`items[]` canvases whose annotation bodies
//! carry the image). [`Manifest::from_json`] sniffs the shape once and every
//! caller then goes through [`Manifest::enumerate_pages`]; manifest order is
//! page order.

mod service;

pub use service::{candidate_urls, locate_service};

use serde_json::Value;
use thiserror::Error;

/// Errors raised while interpreting a manifest document.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The document is not a JSON object.
    #[error("manifest is not a JSON object")]
    NotAnObject,

    /// Neither a v2 nor a v3 structure was recognized.
    #[error("unrecognized manifest structure (no sequences, items or presentation context)")]
    UnrecognizedFormat,
}

/// Image location resolved for one canvas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// The image resource URL as published in the manifest.
    pub resource_url: Option<String>,
    /// Base URL of the IIIF Image API service, without trailing slash.
    pub service_base: Option<String>,
}

/// One page of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    /// 1-based page number (manifest order).
    pub page: u32,
    pub canvas_id: String,
    pub label: Option<String>,
    /// `None` when the canvas exposes no usable image.
    pub image: Option<ImageRef>,
}

/// Presentation API version detected by the sniff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestVersion {
    V2,
    V3,
}

/// A parsed manifest, tagged by shape.
#[derive(Debug, Clone)]
pub enum Manifest {
    V2(V2Manifest),
    V3(V3Manifest),
}

/// v2 adapter: canvases under the first sequence.
#[derive(Debug, Clone)]
pub struct V2Manifest {
    doc: Value,
}

/// v3 adapter: canvases directly under `items`.
#[derive(Debug, Clone)]
pub struct V3Manifest {
    doc: Value,
}

impl Manifest {
    /// Detects the manifest shape.
    ///
    /// `sequences` selects v2, `items` selects v3; otherwise the
    /// `@context` decides.
    ///
    /// # Errors
    ///
    /// Returns [`ManifestError::NotAnObject`] or [`ManifestError::UnrecognizedFormat`].
    pub fn from_json(doc: Value) -> Result<Self, ManifestError> {
        let Some(object) = doc.as_object() else {
            return Err(ManifestError::NotAnObject);
        };
        if object.get("sequences").is_some_and(Value::is_array) {
            return Ok(Self::V2(V2Manifest { doc }));
        }
        if object.get("items").is_some_and(Value::is_array) {
            return Ok(Self::V3(V3Manifest { doc }));
        }
        let context = match object.get("@context") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        };
        if context.contains("presentation/3") {
            Ok(Self::V3(V3Manifest { doc }))
        } else if context.contains("presentation/2") {
            Ok(Self::V2(V2Manifest { doc }))
        } else {
            Err(ManifestError::UnrecognizedFormat)
        }
    }

    #[must_use]
    pub fn version(&self) -> ManifestVersion {
        match self {
            Self::V2(_) => ManifestVersion::V2,
            Self::V3(_) => ManifestVersion::V3,
        }
    }

    /// The underlying JSON document.
    #[must_use]
    pub fn raw(&self) -> &Value {
        match self {
            Self::V2(m) => &m.doc,
            Self::V3(m) => &m.doc,
        }
    }

    /// Pages in manifest order.
    #[must_use]
    pub fn enumerate_pages(&self) -> Vec<PageRef> {
        match self {
            Self::V2(m) => m.enumerate_pages(),
            Self::V3(m) => m.enumerate_pages(),
        }
    }

    /// Human-readable title, if any.
    #[must_use]
    pub fn label(&self) -> Option<String> {
        self.raw().get("label").and_then(text_value)
    }

    /// A field such as `attribution` or `summary` rendered as plain text.
    #[must_use]
    pub fn text_field(&self, key: &str) -> Option<String> {
        self.raw().get(key).and_then(text_value)
    }

    /// URL of a PDF rendering advertised by the manifest.
    ///
    /// Looks at the root `rendering` and, for v2, at the first sequence's.
    #[must_use]
    pub fn native_pdf_url(&self) -> Option<String> {
        let root = self.raw();
        let mut renderings = vec![root.get("rendering")];
        if let Self::V2(_) = self {
            renderings.push(
                root.get("sequences")
                    .and_then(|s| s.get(0))
                    .and_then(|s| s.get("rendering")),
            );
        }
        renderings
            .into_iter()
            .flatten()
            .flat_map(as_list)
            .find_map(pdf_rendering_url)
    }
}

impl V2Manifest {
    fn canvases(&self) -> &[Value] {
        self.doc
            .get("sequences")
            .and_then(|s| s.get(0))
            .and_then(|s| s.get("canvases"))
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }

    fn enumerate_pages(&self) -> Vec<PageRef> {
        numbered(self.canvases(), |canvas| {
            canvas
                .get("images")
                .and_then(|images| images.get(0))
                .and_then(|annotation| annotation.get("resource"))
        })
    }
}

impl V3Manifest {
    fn canvases(&self) -> &[Value] {
        self.doc
            .get("items")
            .and_then(Value::as_array)
            .map_or(&[], Vec::as_slice)
    }

    fn enumerate_pages(&self) -> Vec<PageRef> {
        numbered(self.canvases(), |canvas| {
            let body = canvas
                .get("items")
                .and_then(|pages| pages.get(0))
                .and_then(|page| page.get("items"))
                .and_then(|annotations| annotations.get(0))
                .and_then(|annotation| annotation.get("body"))?;
            let body = match body {
                Value::Array(list) => list.first()?,
                other => other,
            };
            // Choice bodies list alternatives; the first is the preferred one.
            if type_of(body) == Some("Choice") {
                return body.get("items").and_then(|items| items.get(0));
            }
            Some(body)
        })
    }
}

fn numbered<'a>(canvases: &'a [Value], resource: impl Fn(&'a Value) -> Option<&'a Value>) -> Vec<PageRef> {
    canvases
        .iter()
        .enumerate()
        .map(|(index, canvas)| {
            let resource_url = resource(canvas).and_then(id_of).map(str::to_string);
            let service_base = locate_service(canvas);
            let image = (resource_url.is_some() || service_base.is_some()).then(|| ImageRef {
                resource_url,
                service_base,
            });
            PageRef {
                page: u32::try_from(index + 1).unwrap_or(u32::MAX),
                canvas_id: id_of(canvas).unwrap_or_default().to_string(),
                label: canvas.get("label").and_then(text_value),
                image,
            }
        })
        .collect()
}

/// `@id` (v2) or `id` (v3).
pub(crate) fn id_of(node: &Value) -> Option<&str> {
    node.get("@id")
        .or_else(|| node.get("id"))
        .and_then(Value::as_str)
}

fn type_of(node: &Value) -> Option<&str> {
    node.get("type")
        .or_else(|| node.get("@type"))
        .and_then(Value::as_str)
}

fn as_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(list) => list.iter().collect(),
        other => vec![other],
    }
}

fn pdf_rendering_url(entry: &Value) -> Option<String> {
    let url = id_of(entry)?;
    let is_pdf = entry.get("format").and_then(Value::as_str) == Some("application/pdf")
        || url.to_ascii_lowercase().ends_with(".pdf");
    is_pdf.then(|| url.to_string())
}

/// Renders a IIIF text value: plain string, `@value` object, language map,
/// or a list of any of those (first entry wins).
fn text_value(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Array(list) => list.iter().find_map(text_value),
        Value::Object(map) => {
            if let Some(inner) = map.get("@value") {
                text_value(inner)
            } else {
                ["none", "en"]
                    .iter()
                    .find_map(|lang| map.get(*lang).and_then(text_value))
                    .or_else(|| map.values().find_map(text_value))
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    };
    text.filter(|t| !t.is_empty())
}

//! Image-service location and candidate URL construction.

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use super::{ImageRef, id_of};

/// Keys walked, in order, when searching a canvas for its image service.
const SEARCH_KEYS: [&str; 7] = [
    "body",
    "resource",
    "resources",
    "items",
    "images",
    "annotations",
    "target",
];

/// Finds the IIIF Image API base URL nested anywhere inside a canvas.
///
/// Breadth-first: a node's explicit `service` wins, then its children are
/// queued, then the node's own id is used if it looks like an image request
/// (`.../full/...`), truncated before `/full/`.
#[must_use]
pub fn locate_service(canvas: &Value) -> Option<String> {
    let mut queue: VecDeque<&Value> = VecDeque::from([canvas]);
    let mut seen: HashSet<*const Value> = HashSet::new();

    while let Some(node) = queue.pop_front() {
        if !node.is_object() || !seen.insert(std::ptr::from_ref(node)) {
            continue;
        }
        if let Some(base) = node.get("service").and_then(service_id) {
            return Some(normalize_base(base));
        }
        for key in SEARCH_KEYS {
            match node.get(key) {
                Some(Value::Array(children)) => queue.extend(children.iter()),
                Some(child) if !child.is_null() => queue.push_back(child),
                _ => {}
            }
        }
        if let Some(id) = id_of(node)
            && let Some((base, _)) = id.split_once("/full/")
        {
            return Some(normalize_base(base));
        }
    }
    None
}

fn service_id(service: &Value) -> Option<&str> {
    let first = match service {
        Value::Array(list) => list.first()?,
        other => other,
    };
    match first {
        Value::String(s) => Some(s.as_str()),
        other => id_of(other),
    }
}

fn normalize_base(raw: &str) -> String {
    raw.trim()
        .trim_end_matches("/info.json")
        .trim_end_matches('/')
        .to_string()
}

/// Builds the ordered, de-duplicated list of URLs to try for one page.
///
/// Strategy tokens: `max`/`full` request the largest size, a number `N`
/// requests width `N`, `default`/`native` use the resource URL as
/// published, anything else is passed through as a IIIF size parameter.
/// Without an image service the resource URL is the only candidate.
#[must_use]
pub fn candidate_urls(image: &ImageRef, strategy: &[String], quality: &str) -> Vec<String> {
    let quality = if quality.trim().is_empty() {
        "default"
    } else {
        quality.trim()
    };

    let Some(base) = image.service_base.as_deref() else {
        return image.resource_url.iter().cloned().collect();
    };

    let mut urls: Vec<String> = Vec::new();
    let mut push = |url: String| {
        if !urls.contains(&url) {
            urls.push(url);
        }
    };
    for token in strategy {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let lowered = token.to_ascii_lowercase();
        match lowered.as_str() {
            "max" | "full" => push(format!("{base}/full/max/0/{quality}.jpg")),
            "default" | "native" => {
                if let Some(resource) = &image.resource_url {
                    push(resource.clone());
                }
            }
            _ => {
                let width = token.trim_end_matches(',');
                let size = if !width.is_empty() && width.chars().all(|c| c.is_ascii_digit()) {
                    format!("{width},")
                } else {
                    token.to_string()
                };
                push(format!("{base}/full/{size}/0/{quality}.jpg"));
            }
        }
    }
    if urls.is_empty() {
        urls.push(format!("{base}/full/max/0/{quality}.jpg"));
    }
    urls
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strategy(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| (*t).to_string()).collect()
    }

    fn image(service: Option<&str>, resource: Option<&str>) -> ImageRef {
        ImageRef {
            resource_url: resource.map(str::to_string),
            service_base: service.map(str::to_string),
        }
    }

    #[test]
    fn test_locate_service_prefers_explicit_service() {
        let canvas = json!({
            "@id": "https://example.org/c1",
            "images": [{"resource": {
                "@id": "https://img.example.org/a/full/full/0/default.jpg",
                "service": [{"@id": "https://img.example.org/svc/a/info.json"}]
            }}]
        });
        assert_eq!(
            locate_service(&canvas).as_deref(),
            Some("https://img.example.org/svc/a")
        );
    }

    #[test]
    fn test_locate_service_accepts_string_service() {
        let canvas = json!({"items": [{"items": [{"body": {"service": "https://img.example.org/s/"}}]}]});
        assert_eq!(locate_service(&canvas).as_deref(), Some("https://img.example.org/s"));
    }

    #[test]
    fn test_locate_service_none_without_image() {
        assert!(locate_service(&json!({"id": "https://example.org/c"})).is_none());
        assert!(locate_service(&json!("not a canvas")).is_none());
    }

    #[test]
    fn test_candidate_urls_maps_tokens() {
        let img = image(Some("https://i.org/p1"), Some("https://i.org/p1/full/1000,/0/default.jpg"));
        let urls = candidate_urls(&img, &strategy(&["3000", "max", "pct:50", "default", "full"]), "default");
        assert_eq!(
            urls,
            vec![
                "https://i.org/p1/full/3000,/0/default.jpg",
                "https://i.org/p1/full/max/0/default.jpg",
                "https://i.org/p1/full/pct:50/0/default.jpg",
                "https://i.org/p1/full/1000,/0/default.jpg",
            ]
        );
    }

    #[test]
    fn test_candidate_urls_without_service_uses_resource_only() {
        let img = image(None, Some("https://i.org/direct.jpg"));
        assert_eq!(
            candidate_urls(&img, &strategy(&["max", "1740"]), "default"),
            vec!["https://i.org/direct.jpg"]
        );
    }

    #[test]
    fn test_candidate_urls_empty_strategy_falls_back_to_max() {
        let img = image(Some("https://i.org/p1"), None);
        assert_eq!(
            candidate_urls(&img, &strategy(&["", "default"]), "gray"),
            vec!["https://i.org/p1/full/max/0/gray.jpg"]
        );
    }
}

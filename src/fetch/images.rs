//! Candidate image extraction from raw article HTML.
//!
//! Tag-level regex extraction, no DOM pass needed: pull `<img>` tags,
//! drop tracking pixels / icons / social widgets / tiny assets, score the
//! survivors by how likely the filename is to carry financial data
//! (charts, tables, statements), and return the top URLs.

use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};
use url::Url;

/// Below this pixel dimension an image is assumed to be an icon or spacer.
const MIN_DIMENSION: u32 = 100;

/// Default cap on returned candidate URLs.
pub const MAX_IMAGES: usize = 5;

/// Cap on images actually downloaded and inlined for the multimodal call.
pub const MAX_INLINE_IMAGES: usize = 3;

lazy_static! {
    static ref EXCLUDE_PATTERNS: Vec<Regex> = [
        r"pixel",
        r"tracker",
        r"beacon",
        r"analytics",
        r"facebook\.com",
        r"twitter\.com",
        r"linkedin\.com",
        r"gravatar\.com",
        r"\.gif(\?|$)",
        r"\blogo\b",
        r"\bicon\b",
        r"\bavatar\b",
        r"\bbadge\b",
        r"\bbutton\b",
        r"\bbanner\b",
        r"advertisement",
        r"sponsor",
        r"\bpromo\b",
        r"spacer",
        r"blank\.(png|jpg|gif)",
        r"1x1\.",
        r"transparent\.",
        r"share[-_]?icon",
        r"social[-_]?(icon|button|share)",
        r"emoji",
        r"widget",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("static pattern"))
    .collect();

    static ref PRIORITY_PATTERNS: Vec<(Regex, i32)> = [
        (r"chart", 3),
        (r"graph", 3),
        (r"candlestick", 3),
        (r"balance[-_]?sheet", 3),
        (r"income[-_]?statement", 3),
        (r"cash[-_]?flow", 3),
        (r"figure", 2),
        (r"table", 2),
        (r"financial", 2),
        (r"earnings", 2),
        (r"revenue", 2),
        (r"screenshot", 2),
        (r"quarterly", 2),
        (r"infographic", 2),
        (r"forecast", 2),
        (r"valuation", 2),
        (r"stock", 1),
        (r"market", 1),
        (r"report", 1),
        (r"\bdata\b", 1),
        (r"performance", 1),
        (r"comparison", 1),
    ]
    .iter()
    .map(|(p, s)| (Regex::new(&format!("(?i){}", p)).expect("static pattern"), *s))
    .collect();

    static ref IMG_TAG_RE: Regex = Regex::new(r"(?is)<img\s[^>]*?>").expect("static pattern");
    static ref SRC_RE: Regex =
        Regex::new(r#"(?i)\bsrc\s*=\s*(?:"([^"]*?)"|'([^']*?)')"#).expect("static pattern");
    static ref WIDTH_RE: Regex =
        Regex::new(r#"(?i)\bwidth\s*=\s*(?:"(\d+)"|'(\d+)'|(\d+))"#).expect("static pattern");
    static ref HEIGHT_RE: Regex =
        Regex::new(r#"(?i)\bheight\s*=\s*(?:"(\d+)"|'(\d+)'|(\d+))"#).expect("static pattern");
}

const EXCLUDE_DOMAINS: &[&str] = &[
    "ad.doubleclick.net",
    "pagead2.googlesyndication.com",
    "pixel.quantserve.com",
    "b.scorecardresearch.com",
    "sb.scorecardresearch.com",
    "pixel.wp.com",
    "stats.wp.com",
    "www.google-analytics.com",
    "www.facebook.com",
    "connect.facebook.net",
    "platform.twitter.com",
];

const VALID_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png", ".webp", ".bmp", ".tiff"];

fn capture_number(re: &Regex, tag: &str) -> Option<u32> {
    re.captures(tag).and_then(|c| {
        c.iter()
            .skip(1)
            .flatten()
            .next()
            .and_then(|m| m.as_str().parse().ok())
    })
}

/// Extract and prioritise candidate image URLs from raw HTML.
pub fn extract_image_urls(html: &str, base_url: &str, max_images: usize) -> Vec<String> {
    if html.is_empty() || base_url.is_empty() {
        return Vec::new();
    }
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };

    let mut seen: HashSet<String> = HashSet::new();
    let mut candidates: Vec<(String, i32)> = Vec::new();

    for tag_match in IMG_TAG_RE.find_iter(html) {
        let tag = tag_match.as_str();

        let Some(src) = SRC_RE.captures(tag).and_then(|c| {
            c.get(1).or_else(|| c.get(2)).map(|m| m.as_str().trim().to_string())
        }) else {
            continue;
        };
        if src.is_empty() || src.starts_with("data:") {
            continue;
        }

        let Ok(absolute) = base.join(&src) else { continue };
        if absolute.scheme() != "http" && absolute.scheme() != "https" {
            continue;
        }
        let url_str = absolute.to_string();

        if seen.contains(&url_str) {
            continue;
        }

        if let Some(host) = absolute.host_str() {
            if EXCLUDE_DOMAINS.contains(&host) {
                continue;
            }
        }

        if EXCLUDE_PATTERNS.iter().any(|re| re.is_match(&url_str)) {
            continue;
        }

        // Extension filter: unknown extensions pass (CDN URLs often carry
        // no extension), known non-image extensions were excluded above.
        let path_lower = absolute.path().to_ascii_lowercase();
        let has_extension = path_lower.rfind('.').is_some_and(|dot| {
            path_lower.len() - dot <= 6
        });
        if has_extension && !VALID_EXTENSIONS.iter().any(|ext| path_lower.ends_with(ext)) {
            continue;
        }

        // Dimension filter: declared tiny images are icons or spacers.
        let width = capture_number(&WIDTH_RE, tag);
        let height = capture_number(&HEIGHT_RE, tag);
        if width.is_some_and(|w| w < MIN_DIMENSION) || height.is_some_and(|h| h < MIN_DIMENSION) {
            continue;
        }

        let score: i32 = PRIORITY_PATTERNS
            .iter()
            .filter(|(re, _)| re.is_match(&url_str))
            .map(|(_, s)| *s)
            .sum();

        seen.insert(url_str.clone());
        candidates.push((url_str, score));
    }

    // Stable sort keeps document order among equal scores.
    candidates.sort_by(|a, b| b.1.cmp(&a.1));
    debug!(total = candidates.len(), "image candidates extracted");

    candidates
        .into_iter()
        .take(max_images)
        .map(|(url, _)| url)
        .collect()
}

/// A downloaded image ready for a multimodal request.
#[derive(Debug, Clone)]
pub struct ImageData {
    pub url: String,
    pub base64: String,
    pub mime: String,
}

impl ImageData {
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// Download up to `max` images and base64-encode them. Failures are
/// skipped; oversized bodies (> 4 MB) are dropped.
pub async fn fetch_images_base64(
    client: &reqwest::Client,
    urls: &[String],
    max: usize,
) -> Vec<ImageData> {
    const MAX_BYTES: usize = 4 * 1024 * 1024;
    let mut out = Vec::new();

    for url in urls.iter().take(max) {
        let resp = match client.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                warn!(url, status = %r.status(), "image download rejected");
                continue;
            }
            Err(e) => {
                warn!(url, error = %e, "image download failed");
                continue;
            }
        };

        let mime = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .split(';')
            .next()
            .unwrap_or("image/jpeg")
            .to_string();

        match resp.bytes().await {
            Ok(bytes) if bytes.len() <= MAX_BYTES => {
                out.push(ImageData {
                    url: url.clone(),
                    base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                    mime,
                });
            }
            Ok(bytes) => {
                warn!(url, size = bytes.len(), "image too large, skipping");
            }
            Err(e) => {
                warn!(url, error = %e, "image body read failed");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_chart_named_images() {
        let html = r#"
            <img src="/images/author-avatar.png" width="48" height="48">
            <img src="/images/q3-revenue-chart.png" width="800" height="600">
            <img src="/images/office-photo.jpg" width="800" height="600">
        "#;
        let urls = extract_image_urls(html, "https://news.example.com/story", MAX_IMAGES);
        assert_eq!(urls.len(), 2);
        assert!(urls[0].contains("q3-revenue-chart"));
        assert!(urls[1].contains("office-photo"));
    }

    #[test]
    fn test_excludes_tracking_and_social() {
        let html = r#"
            <img src="https://www.google-analytics.com/collect.png" width="400" height="400">
            <img src="https://cdn.example.com/tracking-pixel.png" width="400" height="400">
            <img src="https://cdn.example.com/share-icon.png" width="400" height="400">
            <img src="https://cdn.example.com/1x1.png" width="400" height="400">
        "#;
        let urls = extract_image_urls(html, "https://news.example.com/story", MAX_IMAGES);
        assert!(urls.is_empty());
    }

    #[test]
    fn test_excludes_tiny_declared_dimensions() {
        let html = r#"<img src="/img/figure-one.png" width="32" height="32">"#;
        assert!(extract_image_urls(html, "https://ex.com/a", MAX_IMAGES).is_empty());
    }

    #[test]
    fn test_resolves_relative_urls() {
        let html = r#"<img src="../assets/earnings-table.png" width="640">"#;
        let urls = extract_image_urls(html, "https://ex.com/news/2026/story.html", MAX_IMAGES);
        assert_eq!(urls, vec!["https://ex.com/news/assets/earnings-table.png"]);
    }

    #[test]
    fn test_skips_data_uris_and_dedups() {
        let html = r#"
            <img src="data:image/png;base64,AAAA" width="640">
            <img src="/fig.png" width="640">
            <img src="/fig.png" width="640">
        "#;
        let urls = extract_image_urls(html, "https://ex.com/a", MAX_IMAGES);
        assert_eq!(urls.len(), 1);
    }

    #[test]
    fn test_caps_at_max_images() {
        let html: String = (0..10)
            .map(|i| format!(r#"<img src="/photo-{}.png" width="640">"#, i))
            .collect();
        let urls = extract_image_urls(&html, "https://ex.com/a", 3);
        assert_eq!(urls.len(), 3);
    }

    #[test]
    fn test_rejects_non_image_extensions() {
        let html = r#"<img src="/clip.mp4" width="640">"#;
        assert!(extract_image_urls(html, "https://ex.com/a", MAX_IMAGES).is_empty());
    }
}

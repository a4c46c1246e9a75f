//! In-process HTML fetch and article extraction. Handles the common case
//! without any out-of-process rendering.

use crate::error::{AppError, AppResult};
use crate::fetch::{FetchStrategy, FetchedContent, StrategyKind};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::time::Duration;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub struct HtmlParseStrategy {
    client: reqwest::Client,
}

impl HtmlParseStrategy {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build fetch client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Extracted article fields from one HTML document.
pub struct ExtractedArticle {
    pub text: String,
    pub language: Option<String>,
    pub authors: Vec<String>,
    pub keywords: Vec<String>,
    pub top_image: Option<String>,
}

/// Pull the article body out of an HTML document.
///
/// Container preference: `<article>`, then `<main>`, then the whole body.
/// Within the container, paragraph-level elements are joined with blank
/// lines; script/style/nav chrome never contributes text.
pub fn extract_article(html: &str) -> ExtractedArticle {
    let document = Html::parse_document(html);

    let language = Selector::parse("html")
        .ok()
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("lang"))
        .map(|l| l.split('-').next().unwrap_or(l).to_string());

    let meta_content = |selector: &str| -> Option<String> {
        let sel = Selector::parse(selector).ok()?;
        document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr("content"))
            .map(str::to_string)
    };

    let authors = meta_content(r#"meta[name="author"]"#)
        .map(|a| {
            a.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let keywords = meta_content(r#"meta[name="keywords"]"#)
        .map(|k| {
            k.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let top_image = meta_content(r#"meta[property="og:image"]"#);

    let text = extract_body_text(&document);

    ExtractedArticle {
        text,
        language,
        authors,
        keywords,
        top_image,
    }
}

fn extract_body_text(document: &Html) -> String {
    let paragraph_sel =
        Selector::parse("p, h1, h2, h3, h4, li, blockquote, td").expect("static selector");

    for container in ["article", "main", "body"] {
        let Ok(container_sel) = Selector::parse(container) else { continue };
        let Some(root) = document.select(&container_sel).next() else { continue };

        let mut paragraphs: Vec<String> = Vec::new();
        for el in root.select(&paragraph_sel) {
            let text = el
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            if text.chars().count() >= 20 {
                paragraphs.push(text);
            }
        }
        if !paragraphs.is_empty() {
            paragraphs.dedup();
            return paragraphs.join("\n\n");
        }
    }

    String::new()
}

#[async_trait]
impl FetchStrategy for HtmlParseStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HtmlParse
    }

    async fn fetch(&self, url: &str) -> AppResult<FetchedContent> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "GET {} returned {}",
                url,
                resp.status()
            )));
        }
        let html = resp.text().await?;
        let extracted = extract_article(&html);

        Ok(FetchedContent {
            word_count: extracted.text.split_whitespace().count(),
            language: extracted.language,
            authors: extracted.authors,
            keywords: extracted.keywords,
            top_image: extracted.top_image,
            is_partial: false,
            source_tag: StrategyKind::HtmlParse.as_str().to_string(),
            full_text: extracted.text,
            raw_html: Some(html),
        })
    }
}

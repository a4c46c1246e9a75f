//! Client for the out-of-process headless renderer service.
//!
//! The service renders JS-heavy pages and returns extracted text. A
//! timeout here is a strategy failure, not a fatal error: the fetcher
//! moves on to the next strategy.

use crate::error::{AppError, AppResult};
use crate::fetch::{FetchStrategy, FetchedContent, StrategyKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const OVERALL_TIMEOUT: Duration = Duration::from_secs(60);

pub struct BrowserStrategy {
    client: reqwest::Client,
    base_url: String,
}

impl BrowserStrategy {
    pub fn new(base_url: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(OVERALL_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build browser client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    success: bool,
    #[serde(default)]
    full_text: Option<String>,
    #[serde(default)]
    word_count: Option<usize>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    authors: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl FetchStrategy for BrowserStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Browser
    }

    async fn fetch(&self, url: &str) -> AppResult<FetchedContent> {
        let resp = self
            .client
            .post(format!("{}/extract", self.base_url))
            .json(&json!({ "url": url }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "browser service returned {}",
                resp.status()
            )));
        }

        let body: ExtractResponse = resp.json().await?;
        if !body.success {
            return Err(AppError::Provider(format!(
                "browser extraction failed: {}",
                body.error.unwrap_or_else(|| "unknown error".into())
            )));
        }

        let full_text = body.full_text.unwrap_or_default();
        Ok(FetchedContent {
            word_count: body
                .word_count
                .unwrap_or_else(|| full_text.split_whitespace().count()),
            language: body.language,
            authors: body.authors.unwrap_or_default(),
            keywords: Vec::new(),
            top_image: None,
            is_partial: false,
            source_tag: StrategyKind::Browser.as_str().to_string(),
            full_text,
            raw_html: None,
        })
    }
}

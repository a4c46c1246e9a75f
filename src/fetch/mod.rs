//! Full-text content fetching with strategy fallback.
//!
//! Given a URL and a preferred primary strategy, the fetcher walks the
//! chain (html-parse -> browser service -> external extract API) until one
//! produces enough text. A strategy that raised is not retried within the
//! same fetch; the pipeline decides whether to retry the whole fetch on a
//! later tick.

pub mod browser;
pub mod extract_api;
pub mod html;
pub mod images;

pub use browser::BrowserStrategy;
pub use extract_api::ExtractApiStrategy;
pub use html::HtmlParseStrategy;
pub use images::{extract_image_urls, fetch_images_base64, ImageData};

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Below this many characters a result is treated as truncated: the
/// fetcher keeps trying later strategies and only falls back to the short
/// text (marked partial) when nothing better turns up.
const MIN_FULL_TEXT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    HtmlParse,
    Browser,
    ExtractApi,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::HtmlParse => "html_parse",
            StrategyKind::Browser => "browser",
            StrategyKind::ExtractApi => "extract_api",
        }
    }
}

/// What one strategy produced for a URL.
#[derive(Debug, Clone, Default)]
pub struct FetchedContent {
    pub full_text: String,
    pub word_count: usize,
    pub language: Option<String>,
    pub authors: Vec<String>,
    pub keywords: Vec<String>,
    pub top_image: Option<String>,
    pub is_partial: bool,
    pub source_tag: String,
    /// Raw page HTML when the strategy saw it (used for image candidates).
    pub raw_html: Option<String>,
}

#[async_trait]
pub trait FetchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;
    async fn fetch(&self, url: &str) -> AppResult<FetchedContent>;
}

pub struct ContentFetcher {
    strategies: Vec<Arc<dyn FetchStrategy>>,
}

impl ContentFetcher {
    /// Build the default chain. Browser and extract strategies join only
    /// when configured.
    pub fn new(
        browser_service_url: Option<String>,
        extract_api_key: Option<String>,
    ) -> AppResult<Self> {
        let mut strategies: Vec<Arc<dyn FetchStrategy>> =
            vec![Arc::new(HtmlParseStrategy::new()?)];
        if let Some(base_url) = browser_service_url {
            strategies.push(Arc::new(BrowserStrategy::new(base_url)?));
        }
        if let Some(api_key) = extract_api_key {
            strategies.push(Arc::new(ExtractApiStrategy::new(api_key)?));
        }
        Ok(Self { strategies })
    }

    /// Explicit strategy list, used by tests and custom deployments.
    pub fn with_strategies(strategies: Vec<Arc<dyn FetchStrategy>>) -> Self {
        Self { strategies }
    }

    /// Try strategies starting from `primary`, then the rest of the chain
    /// in order. Each strategy runs at most once.
    pub async fn fetch(&self, url: &str, primary: StrategyKind) -> AppResult<FetchedContent> {
        if self.strategies.is_empty() {
            return Err(AppError::Provider("no fetch strategies configured".into()));
        }

        let mut ordered: Vec<Arc<dyn FetchStrategy>> = Vec::with_capacity(self.strategies.len());
        ordered.extend(self.strategies.iter().filter(|s| s.kind() == primary).cloned());
        ordered.extend(self.strategies.iter().filter(|s| s.kind() != primary).cloned());

        let mut best_short: Option<FetchedContent> = None;
        let mut last_error: Option<AppError> = None;

        for strategy in ordered {
            let tag = strategy.kind().as_str();
            match strategy.fetch(url).await {
                Ok(mut content) if !content.full_text.trim().is_empty() => {
                    content.source_tag = tag.to_string();
                    content.word_count = content.full_text.split_whitespace().count();
                    if content.full_text.chars().count() >= MIN_FULL_TEXT_CHARS {
                        info!(url, strategy = tag, chars = content.full_text.len(), "content fetched");
                        return Ok(content);
                    }
                    warn!(url, strategy = tag, chars = content.full_text.len(), "short extraction, trying next strategy");
                    content.is_partial = true;
                    let keep = match &best_short {
                        Some(existing) => content.full_text.len() > existing.full_text.len(),
                        None => true,
                    };
                    if keep {
                        best_short = Some(content);
                    }
                }
                Ok(_) => {
                    warn!(url, strategy = tag, "strategy returned empty text");
                }
                Err(e) => {
                    warn!(url, strategy = tag, error = %e, "strategy failed");
                    last_error = Some(e);
                }
            }
        }

        if let Some(short) = best_short {
            return Ok(short);
        }
        Err(last_error
            .unwrap_or_else(|| AppError::Provider(format!("no content fetched for {}", url))))
    }
}

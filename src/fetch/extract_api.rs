//! Commercial extraction API client. Last strategy in the chain.

use crate::error::{AppError, AppResult};
use crate::fetch::{FetchStrategy, FetchedContent, StrategyKind};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

const API_URL: &str = "https://api.tavily.com/extract";

pub struct ExtractApiStrategy {
    client: reqwest::Client,
    api_key: String,
}

impl ExtractApiStrategy {
    pub fn new(api_key: String) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Provider(format!("failed to build extract client: {}", e)))?;
        Ok(Self { client, api_key })
    }
}

#[derive(Debug, Deserialize)]
struct ExtractResult {
    #[serde(default)]
    raw_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    results: Vec<ExtractResult>,
}

#[async_trait]
impl FetchStrategy for ExtractApiStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ExtractApi
    }

    async fn fetch(&self, url: &str) -> AppResult<FetchedContent> {
        let resp = self
            .client
            .post(API_URL)
            .bearer_auth(&self.api_key)
            .json(&json!({ "urls": [url] }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(AppError::Provider(format!(
                "extract API returned {}",
                resp.status()
            )));
        }

        let body: ExtractResponse = resp.json().await?;
        let full_text = body
            .results
            .into_iter()
            .next()
            .and_then(|r| r.raw_content)
            .unwrap_or_default();

        Ok(FetchedContent {
            word_count: full_text.split_whitespace().count(),
            language: None,
            authors: Vec::new(),
            keywords: Vec::new(),
            top_image: None,
            is_partial: false,
            source_tag: StrategyKind::ExtractApi.as_str().to_string(),
            full_text,
            raw_html: None,
        })
    }
}

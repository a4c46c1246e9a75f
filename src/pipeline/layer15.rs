//! Layer 1.5: conservative junk removal plus image data extraction.
//!
//! Runs for every article that survives fetch, on both processing paths.
//! The cleaner only strips content that is certainly not article body
//! (navigation, ads, cookie banners, share buttons); images are described
//! as data, never judged editorially. Fail-open: any failure returns the
//! original text untouched.

use crate::fetch::images::ImageData;
use crate::llm::{
    CallOptions, ChatRequest, ContentPart, ImageUrl, LlmGateway, Message, ProviderCredentials,
};
use crate::models::SystemSettings;
use crate::pipeline::{extract_json, purpose};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

const CLEANING_TIMEOUT: Duration = Duration::from_secs(45);

/// Input text cap (chars) for one cleaning request.
const MAX_TEXT_CHARS: usize = 12000;

/// Images inlined per request.
const MAX_IMAGES: usize = 3;

/// A cleaned text shorter than this fraction of the input means the model
/// over-cleaned; the original is kept.
const MIN_KEEP_RATIO: f64 = 0.5;

const CLEANING_SYSTEM_PROMPT: &str = r#"You are a news content preprocessor with two tasks.

Task 1 - conservative text cleaning. Remove ONLY content that is 100% certainly not article body:
- site navigation, headers, footers, breadcrumbs
- ads, promotions, sponsored blocks
- cookie and privacy banners
- social share button text
- "related articles" / "you may also like" lists
- comment sections
- boilerplate copyright notices

Rules: when in doubt, keep the text. Never rewrite, summarize, or reorder body content. Never drop author lines, publication dates, data sources, quotes, or figures. The cleaned text should be close to the original length, just without the obvious junk.

Task 2 - image data extraction. If images are attached, describe the concrete data they contain: numbers and trends in charts, key rows of tables, price ranges of candlestick charts, ranked values. If there are no images or they carry no usable data, set image_insights to an empty string.

Return JSON only:
{"cleaned_text": "...", "image_insights": "...", "has_critical_visual_data": false}"#;

#[derive(Debug, Clone)]
pub struct CleaningOutcome {
    pub cleaned_text: String,
    pub image_insights: String,
    pub has_visual_data: bool,
}

impl CleaningOutcome {
    fn passthrough(full_text: &str) -> Self {
        Self {
            cleaned_text: full_text.to_string(),
            image_insights: String::new(),
            has_visual_data: false,
        }
    }
}

pub async fn clean_and_extract(
    gateway: &LlmGateway,
    settings: &SystemSettings,
    full_text: &str,
    images: &[ImageData],
    url: &str,
) -> CleaningOutcome {
    if full_text.trim().is_empty() {
        return CleaningOutcome::passthrough(full_text);
    }

    let truncated: String = if full_text.chars().count() > MAX_TEXT_CHARS {
        let mut t: String = full_text.chars().take(MAX_TEXT_CHARS).collect();
        t.push_str("\n\n[... text truncated ...]");
        t
    } else {
        full_text.to_string()
    };

    let mut parts = vec![ContentPart::Text { text: truncated }];
    for image in images.iter().take(MAX_IMAGES) {
        parts.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: image.data_uri(),
            },
        });
    }

    let mut request = ChatRequest::new(
        settings.cleaning_model.clone(),
        vec![
            Message::system(CLEANING_SYSTEM_PROMPT),
            Message::user_parts(parts),
        ],
    );
    request.temperature = Some(0.1);
    request.json_response = true;
    request.timeout = CLEANING_TIMEOUT;

    let opts = CallOptions::for_purpose(purpose::CONTENT_CLEANING)
        .with_system(ProviderCredentials::from_settings(settings))
        .with_metadata(json!({"url": url.chars().take(80).collect::<String>(), "images": images.len().min(MAX_IMAGES)}));

    let response = match gateway.chat(&request, &opts).await {
        Ok(r) => r,
        Err(e) => {
            warn!(url, error = %e, "cleaning call failed, keeping original text");
            return CleaningOutcome::passthrough(full_text);
        }
    };

    let content = response.content.unwrap_or_default();
    let Some(parsed) = extract_json(&content) else {
        warn!(url, chars = content.len(), "cleaning response had no JSON, keeping original text");
        return CleaningOutcome::passthrough(full_text);
    };

    let mut cleaned_text = parsed["cleaned_text"].as_str().unwrap_or("").to_string();
    let image_insights = parsed["image_insights"].as_str().unwrap_or("").to_string();
    let has_visual_data = parsed["has_critical_visual_data"].as_bool().unwrap_or(false)
        || !image_insights.trim().is_empty();

    // Safety clamp: losing more than half the input means over-cleaning.
    let input_len = full_text.chars().count() as f64;
    let cleaned_len = cleaned_text.chars().count() as f64;
    if !cleaned_text.is_empty() && cleaned_len < input_len * MIN_KEEP_RATIO {
        warn!(
            url,
            cleaned = cleaned_len as usize,
            original = input_len as usize,
            "cleaned text lost >50%, using original"
        );
        cleaned_text = full_text.to_string();
    }
    if cleaned_text.trim().is_empty() {
        cleaned_text = full_text.to_string();
    }

    info!(
        url,
        cleaned_len = cleaned_text.len(),
        insights_len = image_insights.len(),
        has_visual_data,
        "layer 1.5 cleaning done"
    );

    CleaningOutcome {
        cleaned_text,
        image_insights,
        has_visual_data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerRegistry;
    use crate::error::AppResult;
    use crate::llm::providers::EventStream;
    use crate::llm::{ChatResponse, EmbeddingRequest, EmbeddingResponse, LlmProvider, TokenUsage};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct FixedResponse(String);

    #[async_trait]
    impl LlmProvider for FixedResponse {
        fn provider_name(&self) -> &'static str {
            "stub"
        }

        async fn chat(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
            Ok(ChatResponse {
                content: Some(self.0.clone()),
                tool_calls: Vec::new(),
                finish_reason: Some("stop".into()),
                model: request.model.clone(),
                usage: TokenUsage::default(),
            })
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> AppResult<EventStream> {
            unimplemented!()
        }

        async fn embed(&self, _request: &EmbeddingRequest) -> AppResult<EmbeddingResponse> {
            unimplemented!()
        }
    }

    fn gateway_returning(json_text: &str) -> LlmGateway {
        let gateway = LlmGateway::new(
            ProviderCredentials::default(),
            Arc::new(CircuitBreakerRegistry::new()),
        );
        gateway.set_provider_override(Arc::new(FixedResponse(json_text.to_string())));
        gateway
    }

    #[tokio::test]
    async fn test_over_cleaned_text_is_discarded() {
        let original = "real article body ".repeat(100);
        let response = json!({
            "cleaned_text": "tiny",
            "image_insights": "",
            "has_critical_visual_data": false
        })
        .to_string();
        let gateway = gateway_returning(&response);

        let outcome = clean_and_extract(
            &gateway,
            &SystemSettings::default(),
            &original,
            &[],
            "http://ex/a",
        )
        .await;
        assert_eq!(outcome.cleaned_text, original);
    }

    #[tokio::test]
    async fn test_moderate_cleaning_is_kept() {
        let original = format!("{}{}", "body ".repeat(200), "SHARE ON X ");
        let cleaned = "body ".repeat(190);
        let response = json!({
            "cleaned_text": cleaned,
            "image_insights": "Chart shows Q3 rev $4.2B vs $3.6B Q2",
            "has_critical_visual_data": true
        })
        .to_string();
        let gateway = gateway_returning(&response);

        let outcome = clean_and_extract(
            &gateway,
            &SystemSettings::default(),
            &original,
            &[],
            "http://ex/a",
        )
        .await;
        assert_eq!(outcome.cleaned_text, cleaned);
        assert!(outcome.has_visual_data);
        assert!(outcome.image_insights.contains("$4.2B"));
    }

    #[tokio::test]
    async fn test_unparseable_response_fails_open() {
        let gateway = gateway_returning("sorry, I cannot do that");
        let outcome = clean_and_extract(
            &gateway,
            &SystemSettings::default(),
            "original text stays",
            &[],
            "http://ex/a",
        )
        .await;
        assert_eq!(outcome.cleaned_text, "original text stays");
        assert!(!outcome.has_visual_data);
    }
}

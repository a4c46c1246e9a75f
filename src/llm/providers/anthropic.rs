//! Anthropic Messages API wire client.

use crate::error::{AppError, AppResult};
use crate::llm::providers::{
    build_http_client, error_for_response, sse_event_stream, EventStream, LlmProvider,
};
use crate::llm::types::{
    ChatRequest, ChatResponse, ContentPart, EmbeddingRequest, EmbeddingResponse, MessageContent,
    Role, StreamEvent, TokenUsage,
};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// The Messages API requires max_tokens. Surfacing the default here keeps
/// the requirement visible at the request layer instead of failing inside
/// serialization.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> AppResult<Self> {
        Ok(Self {
            client: build_http_client(Duration::from_secs(180))?,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Translate gateway messages to Messages API shape: system messages
    /// collapse into the top-level `system` string; multimodal parts map to
    /// Anthropic content blocks (data-URI images become base64 sources).
    fn request_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<serde_json::Value> = Vec::new();

        for message in &request.messages {
            match message.role {
                Role::System => system_parts.push(message.content.text()),
                Role::User | Role::Assistant | Role::Tool => {
                    let role = if message.role == Role::Assistant {
                        "assistant"
                    } else {
                        "user"
                    };
                    messages.push(json!({
                        "role": role,
                        "content": content_blocks(&message.content),
                    }));
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }
}

fn content_blocks(content: &MessageContent) -> serde_json::Value {
    match content {
        MessageContent::Text(text) => json!([{"type": "text", "text": text}]),
        MessageContent::Parts(parts) => {
            let blocks: Vec<serde_json::Value> = parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ImageUrl { image_url } => match parse_data_uri(&image_url.url) {
                        Some((media_type, data)) => json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": media_type,
                                "data": data,
                            }
                        }),
                        None => json!({
                            "type": "image",
                            "source": {"type": "url", "url": image_url.url}
                        }),
                    },
                })
                .collect();
            json!(blocks)
        }
    }
}

/// Split a `data:<media>;base64,<payload>` URI into its parts.
fn parse_data_uri(uri: &str) -> Option<(String, String)> {
    let rest = uri.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(",")?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_string(), payload.to_string()))
}

fn usage_from_value(v: &serde_json::Value) -> TokenUsage {
    let prompt = v["input_tokens"].as_i64().unwrap_or(0);
    let completion = v["output_tokens"].as_i64().unwrap_or(0);
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
        cached_tokens: v["cache_read_input_tokens"].as_i64().unwrap_or(0),
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn provider_name(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let resp = self
            .client
            .post(self.url("/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(request.timeout)
            .json(&self.request_body(request, false))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp, "POST /v1/messages").await);
        }

        let wire: serde_json::Value = resp.json().await?;
        let content = wire["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|s| !s.is_empty());

        Ok(ChatResponse {
            content,
            tool_calls: Vec::new(),
            finish_reason: wire["stop_reason"].as_str().map(str::to_string),
            model: wire["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            usage: usage_from_value(&wire["usage"]),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> AppResult<EventStream> {
        let resp = self
            .client
            .post(self.url("/v1/messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .timeout(request.timeout)
            .json(&self.request_body(request, true))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp, "POST /v1/messages (stream)").await);
        }

        let mut input_tokens = 0i64;
        let mut cached_tokens = 0i64;

        Ok(sse_event_stream(resp, move |payload, pending| {
            let Ok(event) = serde_json::from_str::<serde_json::Value>(payload) else {
                return false;
            };
            match event["type"].as_str() {
                Some("message_start") => {
                    let usage = &event["message"]["usage"];
                    input_tokens = usage["input_tokens"].as_i64().unwrap_or(0);
                    cached_tokens = usage["cache_read_input_tokens"].as_i64().unwrap_or(0);
                    false
                }
                Some("content_block_delta") => {
                    if let Some(text) = event["delta"]["text"].as_str() {
                        pending.push_back(StreamEvent::ContentDelta(text.to_string()));
                    }
                    false
                }
                Some("message_delta") => {
                    let output = event["usage"]["output_tokens"].as_i64().unwrap_or(0);
                    pending.push_back(StreamEvent::UsageInfo(TokenUsage {
                        prompt_tokens: input_tokens,
                        completion_tokens: output,
                        total_tokens: input_tokens + output,
                        cached_tokens,
                    }));
                    if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                        pending.push_back(StreamEvent::Finish {
                            reason: reason.to_string(),
                        });
                    }
                    false
                }
                Some("message_stop") => true,
                _ => false,
            }
        }))
    }

    async fn embed(&self, _request: &EmbeddingRequest) -> AppResult<EmbeddingResponse> {
        Err(AppError::Validation(
            "anthropic provider does not support embeddings; use an OpenAI-compatible model".into(),
        ))
    }
}

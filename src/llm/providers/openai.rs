//! OpenAI-compatible chat/embedding wire client.
//!
//! Also serves DeepSeek, local vLLM/Ollama endpoints, and other
//! OpenAI-compatible APIs via a custom base URL.

use crate::error::{AppError, AppResult};
use crate::llm::providers::{
    build_http_client, error_for_response, sse_event_stream, EventStream, LlmProvider,
};
use crate::llm::types::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamEvent, TokenUsage,
    ToolCall,
};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> AppResult<Self> {
        Ok(Self {
            // Per-request timeouts override this outer bound.
            client: build_http_client(Duration::from_secs(180))?,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = json!(m);
        }
        if request.json_response {
            body["response_format"] = json!({"type": "json_object"});
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
    #[serde(default)]
    total_tokens: i64,
    #[serde(default)]
    prompt_tokens_details: Option<WirePromptDetails>,
}

#[derive(Debug, Deserialize)]
struct WirePromptDetails {
    #[serde(default)]
    cached_tokens: i64,
}

impl From<WireUsage> for TokenUsage {
    fn from(w: WireUsage) -> Self {
        TokenUsage {
            prompt_tokens: w.prompt_tokens,
            completion_tokens: w.completion_tokens,
            total_tokens: w.total_tokens,
            cached_tokens: w.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    model: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &'static str {
        "openai"
    }

    fn supports_embeddings(&self) -> bool {
        true
    }

    async fn chat(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let resp = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&self.chat_body(request, false))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp, "POST /chat/completions").await);
        }

        let wire: WireChatResponse = resp.json().await?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Provider("chat response had no choices".into()))?;

        debug!(model = ?wire.model, finish = ?choice.finish_reason, "chat completion");

        Ok(ChatResponse {
            content: choice.message.content,
            tool_calls: choice
                .message
                .tool_calls
                .into_iter()
                .map(|t| ToolCall {
                    id: t.id,
                    name: t.function.name,
                    arguments: t.function.arguments,
                })
                .collect(),
            finish_reason: choice.finish_reason,
            model: wire.model.unwrap_or_else(|| request.model.clone()),
            usage: wire.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> AppResult<EventStream> {
        let resp = self
            .client
            .post(self.url("/chat/completions"))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&self.chat_body(request, true))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp, "POST /chat/completions (stream)").await);
        }

        // Partial tool calls accumulate by index until finish.
        let mut tool_acc: BTreeMap<u32, (String, String, String)> = BTreeMap::new();

        Ok(sse_event_stream(resp, move |payload, pending| {
            if payload == "[DONE]" {
                return true;
            }
            let Ok(chunk) = serde_json::from_str::<serde_json::Value>(payload) else {
                return false;
            };

            if let Some(usage) = chunk.get("usage").filter(|u| !u.is_null()) {
                if let Ok(wire) = serde_json::from_value::<WireUsage>(usage.clone()) {
                    pending.push_back(StreamEvent::UsageInfo(wire.into()));
                }
            }

            let Some(choice) = chunk["choices"].get(0) else {
                return false;
            };

            if let Some(text) = choice["delta"]["content"].as_str() {
                if !text.is_empty() {
                    pending.push_back(StreamEvent::ContentDelta(text.to_string()));
                }
            }

            if let Some(calls) = choice["delta"]["tool_calls"].as_array() {
                for call in calls {
                    let index = call["index"].as_u64().unwrap_or(0) as u32;
                    let entry = tool_acc.entry(index).or_default();
                    if let Some(id) = call["id"].as_str() {
                        entry.0 = id.to_string();
                    }
                    if let Some(name) = call["function"]["name"].as_str() {
                        entry.1.push_str(name);
                    }
                    if let Some(args) = call["function"]["arguments"].as_str() {
                        entry.2.push_str(args);
                    }
                }
            }

            if let Some(reason) = choice["finish_reason"].as_str() {
                for (_, (id, name, arguments)) in std::mem::take(&mut tool_acc) {
                    pending.push_back(StreamEvent::ToolCallDelta(ToolCall {
                        id,
                        name,
                        arguments,
                    }));
                }
                pending.push_back(StreamEvent::Finish {
                    reason: reason.to_string(),
                });
            }
            false
        }))
    }

    async fn embed(&self, request: &EmbeddingRequest) -> AppResult<EmbeddingResponse> {
        let mut body = json!({
            "model": request.model,
            "input": request.input,
        });
        if let Some(d) = request.dimensions {
            body["dimensions"] = json!(d);
        }

        let resp = self
            .client
            .post(self.url("/embeddings"))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(error_for_response(resp, "POST /embeddings").await);
        }

        #[derive(Deserialize)]
        struct WireEmbedding {
            index: usize,
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct WireEmbedResponse {
            data: Vec<WireEmbedding>,
            model: Option<String>,
            usage: Option<WireUsage>,
        }

        let wire: WireEmbedResponse = resp.json().await?;
        let mut data = wire.data;
        data.sort_by_key(|d| d.index);

        Ok(EmbeddingResponse {
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            model: wire.model.unwrap_or_else(|| request.model.clone()),
            usage: wire.usage.map(TokenUsage::from).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{Message, MessageContent};

    #[test]
    fn test_chat_body_shape() {
        let provider = OpenAiProvider::new("sk-test".into(), None).unwrap();
        let mut request = ChatRequest::new(
            "gpt-4o-mini",
            vec![Message::system("be terse"), Message::user("score this")],
        );
        request.temperature = Some(0.2);
        request.max_tokens = Some(500);
        request.json_response = true;

        let body = provider.chat_body(&request, false);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert!(body.get("stream").is_none());

        let streaming = provider.chat_body(&request, true);
        assert_eq!(streaming["stream"], true);
        assert_eq!(streaming["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_wire_usage_maps_cached_tokens() {
        let wire: WireUsage = serde_json::from_value(serde_json::json!({
            "prompt_tokens": 100,
            "completion_tokens": 20,
            "total_tokens": 120,
            "prompt_tokens_details": {"cached_tokens": 60}
        }))
        .unwrap();
        let usage = TokenUsage::from(wire);
        assert_eq!(usage.cached_tokens, 60);
        assert_eq!(usage.prompt_tokens, 100);
    }

    #[test]
    fn test_custom_base_url_is_trimmed() {
        let provider =
            OpenAiProvider::new("k".into(), Some("https://llm.internal/v1/".into())).unwrap();
        assert_eq!(provider.url("/embeddings"), "https://llm.internal/v1/embeddings");
    }

    #[test]
    fn test_multimodal_message_wire_shape() {
        let m = Message {
            role: crate::llm::types::Role::User,
            content: MessageContent::Parts(vec![crate::llm::types::ContentPart::Text {
                text: "hi".into(),
            }]),
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["content"][0]["type"], "text");
    }
}

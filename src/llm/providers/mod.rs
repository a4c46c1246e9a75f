//! Provider wire clients for the LLM gateway.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;

use crate::error::{AppError, AppResult};
use crate::llm::types::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamEvent,
};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

/// Boxed stream of gateway events.
pub type EventStream = Pin<Box<dyn Stream<Item = AppResult<StreamEvent>> + Send>>;

/// Uniform surface over provider SDK wire formats.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn provider_name(&self) -> &'static str;

    fn supports_embeddings(&self) -> bool {
        false
    }

    async fn chat(&self, request: &ChatRequest) -> AppResult<ChatResponse>;

    /// Streaming chat. Dropping the returned stream abandons the
    /// provider-side request.
    async fn chat_stream(&self, request: &ChatRequest) -> AppResult<EventStream>;

    async fn embed(&self, request: &EmbeddingRequest) -> AppResult<EmbeddingResponse>;
}

/// Build a reqwest client with the pool settings we use for every
/// outbound LLM service.
pub(crate) fn build_http_client(overall_timeout: Duration) -> AppResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(overall_timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .map_err(|e| AppError::Provider(format!("failed to build HTTP client: {}", e)))
}

/// Map a non-success response into the right error kind, consuming the body
/// for the message. 429s surface as `rate_limited` with the Retry-After.
pub(crate) async fn error_for_response(resp: reqwest::Response, what: &str) -> AppError {
    let status = resp.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        return AppError::RateLimited {
            retry_after: Duration::from_secs(retry_after),
        };
    }
    let body = resp.text().await.unwrap_or_default();
    AppError::Provider(format!("{} {}: {}", what, status, truncate(&body, 400)))
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Buffering line splitter for `text/event-stream` bodies. Returns the
/// payloads of complete `data:` lines.
#[derive(Default)]
pub(crate) struct SseParser {
    buf: String,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end();
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Shared driver: turn an SSE response into an `EventStream` using a
/// per-provider payload handler. The handler pushes events for one `data:`
/// payload and returns true when the stream is finished.
pub(crate) fn sse_event_stream<H>(resp: reqwest::Response, handler: H) -> EventStream
where
    H: FnMut(&str, &mut VecDeque<StreamEvent>) -> bool + Send + 'static,
{
    struct State<H> {
        bytes: Pin<Box<dyn Stream<Item = reqwest::Result<bytes::Bytes>> + Send>>,
        parser: SseParser,
        pending: VecDeque<StreamEvent>,
        handler: H,
        done: bool,
    }

    let state = State {
        bytes: Box::pin(resp.bytes_stream()),
        parser: SseParser::default(),
        pending: VecDeque::new(),
        handler,
        done: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                return Some((Ok(event), st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    for payload in st.parser.push(&chunk) {
                        if (st.handler)(&payload, &mut st.pending) {
                            st.done = true;
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(AppError::from(e)), st));
                }
                None => {
                    st.done = true;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_parser_splits_data_lines() {
        let mut parser = SseParser::default();
        let payloads = parser.push(b"data: {\"a\":1}\n\ndata: {\"b\":2}\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "{\"b\":2}".to_string()]);
    }

    #[test]
    fn test_sse_parser_buffers_partial_lines() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"data: {\"par").is_empty());
        let payloads = parser.push(b"tial\":true}\n");
        assert_eq!(payloads, vec!["{\"partial\":true}".to_string()]);
    }

    #[test]
    fn test_sse_parser_ignores_comments_and_events() {
        let mut parser = SseParser::default();
        let payloads = parser.push(b": keepalive\nevent: message_start\ndata: x\n");
        assert_eq!(payloads, vec!["x".to_string()]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 3), "hel");
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}

//! LLM gateway — the single entry point for all LLM API calls.
//!
//! Services call this instead of constructing provider clients. The
//! gateway resolves credentials per call (user override -> admin settings
//! -> environment), routes to the right wire client, wraps every call in
//! the provider's circuit breaker, and reports completed calls to the
//! usage observer.
//!
//! Provider caching policy: instances resolved purely from environment
//! credentials are cached for connection reuse; anything touched by admin
//! or per-user credentials is constructed per call, because those keys may
//! rotate at any time.

pub mod config;
pub mod pricing;
pub mod providers;
pub mod types;

pub use config::{detect_provider, ProviderCredentials, ProviderType};
pub use pricing::{compute_cost, DbUsageRecorder, UsageEvent, UsageObserver};
pub use providers::{AnthropicProvider, EventStream, LlmProvider, OpenAiProvider};
pub use types::{
    ChatRequest, ChatResponse, ContentPart, EmbeddingRequest, EmbeddingResponse, ImageUrl,
    Message, MessageContent, Role, StreamEvent, TokenUsage, ToolCall,
};

use crate::core::circuit_breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::error::{AppError, AppResult};
use config::{resolve_provider, ResolvedProvider};
use futures_util::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Per-call options: purpose tag for cost attribution plus optional
/// credential layers. User-scoped config is an explicit parameter, never
/// ambient state.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub purpose: String,
    pub user_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    /// Admin settings credentials (re-read from the DB by the caller).
    pub system: Option<ProviderCredentials>,
    /// Per-request user override.
    pub user: Option<ProviderCredentials>,
}

impl CallOptions {
    pub fn for_purpose(purpose: impl Into<String>) -> Self {
        Self {
            purpose: purpose.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, creds: ProviderCredentials) -> Self {
        if !creds.is_empty() {
            self.system = Some(creds);
        }
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub struct LlmGateway {
    env_creds: ProviderCredentials,
    breakers: Arc<CircuitBreakerRegistry>,
    breaker_config: BreakerConfig,
    env_providers: Mutex<HashMap<String, Arc<dyn LlmProvider>>>,
    observer: Mutex<Option<Arc<dyn UsageObserver>>>,
    provider_override: Mutex<Option<Arc<dyn LlmProvider>>>,
}

impl LlmGateway {
    pub fn new(env_creds: ProviderCredentials, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            env_creds,
            breakers,
            breaker_config: BreakerConfig::default(),
            env_providers: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            provider_override: Mutex::new(None),
        }
    }

    pub fn with_breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Install the usage observer. Called once at startup.
    pub fn set_usage_observer(&self, observer: Arc<dyn UsageObserver>) {
        *self.observer.lock() = Some(observer);
    }

    /// Route every call through a fixed provider instance. Used by tests
    /// and local single-endpoint deployments.
    pub fn set_provider_override(&self, provider: Arc<dyn LlmProvider>) {
        *self.provider_override.lock() = Some(provider);
    }

    fn create_provider(resolved: &ResolvedProvider) -> AppResult<Arc<dyn LlmProvider>> {
        match resolved.provider_type {
            ProviderType::OpenAi => Ok(Arc::new(OpenAiProvider::new(
                resolved.api_key.clone(),
                resolved.base_url.clone(),
            )?)),
            ProviderType::Anthropic => Ok(Arc::new(AnthropicProvider::new(
                resolved.api_key.clone(),
                resolved.base_url.clone(),
            )?)),
        }
    }

    fn resolve(&self, model: &str, opts: &CallOptions) -> AppResult<Arc<dyn LlmProvider>> {
        if let Some(fixed) = self.provider_override.lock().clone() {
            return Ok(fixed);
        }

        let resolved = resolve_provider(
            model,
            opts.user.as_ref(),
            opts.system.as_ref(),
            &self.env_creds,
        )?;

        if resolved.env_sourced {
            let key = resolved.cache_key();
            let mut cache = self.env_providers.lock();
            if let Some(provider) = cache.get(&key) {
                return Ok(provider.clone());
            }
            let provider = Self::create_provider(&resolved)?;
            cache.insert(key, provider.clone());
            Ok(provider)
        } else {
            debug!(model, "constructing uncached provider (rotatable credentials)");
            Self::create_provider(&resolved)
        }
    }

    async fn report_usage(&self, model: &str, usage: TokenUsage, opts: &CallOptions) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer
                .record(UsageEvent {
                    model: model.to_string(),
                    purpose: opts.purpose.clone(),
                    usage,
                    user_id: opts.user_id.clone(),
                    metadata: opts.metadata.clone(),
                })
                .await;
        }
    }

    /// Non-streaming chat completion.
    pub async fn chat(&self, request: &ChatRequest, opts: &CallOptions) -> AppResult<ChatResponse> {
        let provider = self.resolve(&request.model, opts)?;
        let breaker = self
            .breakers
            .get_or_create(provider.provider_name(), self.breaker_config);

        let started = Instant::now();
        let response = breaker.call(|| provider.chat(request)).await?;
        metrics::histogram!(
            "llm_chat_seconds",
            started.elapsed().as_secs_f64(),
            "purpose" => opts.purpose.clone()
        );

        self.report_usage(&response.model, response.usage, opts).await;
        Ok(response)
    }

    /// Streaming chat. Usage is reported when the provider emits its
    /// usage event; dropping the stream abandons the request both
    /// gateway-side and provider-side.
    pub async fn chat_stream(
        &self,
        request: &ChatRequest,
        opts: &CallOptions,
    ) -> AppResult<EventStream> {
        let provider = self.resolve(&request.model, opts)?;
        let breaker = self
            .breakers
            .get_or_create(provider.provider_name(), self.breaker_config);

        let inner = breaker.call(|| provider.chat_stream(request)).await?;

        let observer = self.observer.lock().clone();
        let model = request.model.clone();
        let purpose = opts.purpose.clone();
        let user_id = opts.user_id.clone();
        let metadata = opts.metadata.clone();

        let stream = inner.then(move |item| {
            let observer = observer.clone();
            let model = model.clone();
            let purpose = purpose.clone();
            let user_id = user_id.clone();
            let metadata = metadata.clone();
            async move {
                if let (Some(observer), Ok(StreamEvent::UsageInfo(usage))) = (&observer, &item) {
                    observer
                        .record(UsageEvent {
                            model,
                            purpose,
                            usage: *usage,
                            user_id,
                            metadata,
                        })
                        .await;
                }
                item
            }
        });
        Ok(Box::pin(stream))
    }

    /// Batch embedding generation.
    pub async fn embed(
        &self,
        request: &EmbeddingRequest,
        opts: &CallOptions,
    ) -> AppResult<EmbeddingResponse> {
        let provider = self.resolve(&request.model, opts)?;
        if !provider.supports_embeddings() {
            return Err(AppError::Validation(format!(
                "provider {} does not support embeddings (model={})",
                provider.provider_name(),
                request.model
            )));
        }
        let breaker = self
            .breakers
            .get_or_create(provider.provider_name(), self.breaker_config);

        let response = breaker.call(|| provider.embed(request)).await?;
        self.report_usage(&response.model, response.usage, opts).await;
        Ok(response)
    }

    /// Graceful shutdown: drop cached providers so connections close.
    pub fn close(&self) {
        let count = {
            let mut cache = self.env_providers.lock();
            let count = cache.len();
            cache.clear();
            count
        };
        if count > 0 {
            info!(discarded = count, "LLM gateway closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn provider_name(&self) -> &'static str {
            "stub"
        }

        fn supports_embeddings(&self) -> bool {
            true
        }

        async fn chat(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: Some("{}".into()),
                tool_calls: Vec::new(),
                finish_reason: Some("stop".into()),
                model: request.model.clone(),
                usage: TokenUsage {
                    prompt_tokens: 10,
                    completion_tokens: 5,
                    total_tokens: 15,
                    cached_tokens: 0,
                },
            })
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> AppResult<EventStream> {
            let events = vec![
                Ok(StreamEvent::ContentDelta("hi".into())),
                Ok(StreamEvent::UsageInfo(TokenUsage::default())),
                Ok(StreamEvent::Finish { reason: "stop".into() }),
            ];
            Ok(Box::pin(futures_util::stream::iter(events)))
        }

        async fn embed(&self, request: &EmbeddingRequest) -> AppResult<EmbeddingResponse> {
            Ok(EmbeddingResponse {
                embeddings: request.input.iter().map(|_| vec![0.0; 4]).collect(),
                model: request.model.clone(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct CountingObserver {
        events: Mutex<Vec<UsageEvent>>,
    }

    #[async_trait]
    impl UsageObserver for CountingObserver {
        async fn record(&self, event: UsageEvent) {
            self.events.lock().push(event);
        }
    }

    fn gateway_with_stub() -> (LlmGateway, Arc<StubProvider>, Arc<CountingObserver>) {
        let gateway = LlmGateway::new(
            ProviderCredentials::default(),
            Arc::new(CircuitBreakerRegistry::new()),
        );
        let stub = Arc::new(StubProvider { calls: AtomicUsize::new(0) });
        let observer = Arc::new(CountingObserver { events: Mutex::new(Vec::new()) });
        gateway.set_provider_override(stub.clone());
        gateway.set_usage_observer(observer.clone());
        (gateway, stub, observer)
    }

    #[tokio::test]
    async fn test_chat_reports_usage_with_purpose() {
        let (gateway, stub, observer) = gateway_with_stub();
        let request = ChatRequest::new("gpt-4o-mini", vec![Message::user("x")]);
        let opts = CallOptions::for_purpose("layer1_scoring");

        let response = gateway.chat(&request, &opts).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("{}"));
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);

        let events = observer.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].purpose, "layer1_scoring");
        assert_eq!(events[0].usage.prompt_tokens, 10);
    }

    #[tokio::test]
    async fn test_stream_reports_usage_on_usage_event() {
        let (gateway, _stub, observer) = gateway_with_stub();
        let request = ChatRequest::new("gpt-4o-mini", vec![Message::user("x")]);
        let opts = CallOptions::for_purpose("chat");

        let mut stream = gateway.chat_stream(&request, &opts).await.unwrap();
        let mut saw_finish = false;
        while let Some(event) = stream.next().await {
            if let Ok(StreamEvent::Finish { .. }) = event {
                saw_finish = true;
            }
        }
        assert!(saw_finish);
        assert_eq!(observer.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_credentials_without_override() {
        let gateway = LlmGateway::new(
            ProviderCredentials::default(),
            Arc::new(CircuitBreakerRegistry::new()),
        );
        let request = ChatRequest::new("gpt-4o-mini", vec![Message::user("x")]);
        let err = gateway
            .chat(&request, &CallOptions::for_purpose("chat"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}

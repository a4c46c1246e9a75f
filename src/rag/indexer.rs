//! Embedding indexer: chunk, batch-embed, and atomically replace the
//! stored vectors for a source.
//!
//! Replacement is delete-then-insert under the advisory lock derived from
//! `(source_type, source_id)`, so concurrent re-embeds of the same source
//! serialise while different sources proceed in parallel. Calling twice
//! with identical content leaves the store in the same state.

use crate::core::rate_limit::TokenBucket;
use crate::error::{AppError, AppResult};
use crate::llm::{CallOptions, EmbeddingRequest, LlmGateway, ProviderCredentials};
use crate::models::SystemSettings;
use crate::rag::chunking::chunk_text;
use crate::storage::db::{Database, EmbeddingInsert, EMBEDDING_DIMENSIONS};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Embedding inputs are truncated to this many characters.
const MAX_EMBED_CHARS: usize = 8000;

/// Derive the advisory lock key for a source. Stable across processes and
/// releases: first 8 bytes of SHA-256 over `"{source_type}:{source_id}"`.
pub fn advisory_key(source_type: &str, source_id: &str) -> i64 {
    let digest = Sha256::digest(format!("{}:{}", source_type, source_id).as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Cheap token estimate for accounting: ~4 chars per token for Latin text,
/// ~2 for CJK.
fn estimate_tokens(text: &str) -> i64 {
    let cjk = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count();
    let other = text.chars().count() - cjk;
    (cjk as i64 / 2) + (other as i64 / 4)
}

#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub chunks_stored: usize,
    pub model: String,
}

pub struct EmbeddingIndexer {
    db: Database,
    gateway: Arc<LlmGateway>,
    bucket: Arc<TokenBucket>,
}

impl EmbeddingIndexer {
    pub fn new(db: Database, gateway: Arc<LlmGateway>, bucket: Arc<TokenBucket>) -> Self {
        Self { db, gateway, bucket }
    }

    /// Chunk `content`, embed all chunks in one batch call, and replace
    /// the stored rows for `(source_type, source_id)`.
    pub async fn store(
        &self,
        source_type: &str,
        source_id: &str,
        content: &str,
        symbol: Option<&str>,
        settings: &SystemSettings,
    ) -> AppResult<StoreOutcome> {
        let model = settings.embedding_model.clone();
        if content.trim().is_empty() {
            debug!(source_type, source_id, "empty content, nothing to embed");
            return Ok(StoreOutcome { chunks_stored: 0, model });
        }

        let chunks = chunk_text(content);
        if chunks.is_empty() {
            return Ok(StoreOutcome { chunks_stored: 0, model });
        }

        if !self.bucket.acquire() {
            return Err(AppError::RateLimited {
                retry_after: Duration::from_secs(1),
            });
        }

        let inputs: Vec<String> = chunks
            .iter()
            .map(|c| c.chars().take(MAX_EMBED_CHARS).collect())
            .collect();

        let mut request = EmbeddingRequest::new(model.clone(), inputs);
        request.dimensions = Some(EMBEDDING_DIMENSIONS);

        let opts = CallOptions::for_purpose("embedding")
            .with_system(ProviderCredentials::from_settings(settings))
            .with_metadata(serde_json::json!({
                "source_type": source_type,
                "source_id": source_id,
                "batch_size": chunks.len(),
            }));

        let response = self.gateway.embed(&request, &opts).await?;
        if response.embeddings.len() != chunks.len() {
            return Err(AppError::Provider(format!(
                "embedding batch returned {} vectors for {} chunks",
                response.embeddings.len(),
                chunks.len()
            )));
        }

        let rows: Vec<EmbeddingInsert> = chunks
            .iter()
            .zip(response.embeddings)
            .enumerate()
            .map(|(i, (chunk, embedding))| EmbeddingInsert {
                chunk_index: i as i64,
                chunk_text: chunk.clone(),
                embedding,
                token_count: Some(estimate_tokens(chunk)),
            })
            .collect();

        // Lock, then replace. The database write is itself transactional;
        // the advisory lock keeps a concurrent writer from interleaving
        // its delete with our insert.
        let _guard = self.db.advisory_lock(advisory_key(source_type, source_id)).await;
        let stored = self.db.replace_embeddings(source_type, source_id, symbol, &response.model, &rows)?;

        info!(source_type, source_id, chunks = stored, model = %response.model, "embeddings replaced");
        Ok(StoreOutcome {
            chunks_stored: stored,
            model: response.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit_breaker::CircuitBreakerRegistry;
    use crate::error::AppResult;
    use crate::llm::providers::EventStream;
    use crate::llm::{
        ChatRequest, ChatResponse, EmbeddingResponse, LlmProvider, TokenUsage,
    };
    use async_trait::async_trait;

    struct StubEmbedder;

    #[async_trait]
    impl LlmProvider for StubEmbedder {
        fn provider_name(&self) -> &'static str {
            "stub"
        }

        fn supports_embeddings(&self) -> bool {
            true
        }

        async fn chat(&self, _request: &ChatRequest) -> AppResult<ChatResponse> {
            unimplemented!("indexer never chats")
        }

        async fn chat_stream(&self, _request: &ChatRequest) -> AppResult<EventStream> {
            unimplemented!("indexer never streams")
        }

        async fn embed(&self, request: &EmbeddingRequest) -> AppResult<EmbeddingResponse> {
            // Deterministic vector per input so replacement tests can
            // compare content.
            let embeddings = request
                .input
                .iter()
                .enumerate()
                .map(|(i, _)| {
                    let mut v = vec![0.0f32; EMBEDDING_DIMENSIONS];
                    v[i % EMBEDDING_DIMENSIONS] = 1.0;
                    v
                })
                .collect();
            Ok(EmbeddingResponse {
                embeddings,
                model: request.model.clone(),
                usage: TokenUsage::default(),
            })
        }
    }

    fn indexer() -> (Database, EmbeddingIndexer) {
        let db = Database::in_memory().unwrap();
        let gateway = Arc::new(LlmGateway::new(
            ProviderCredentials::default(),
            Arc::new(CircuitBreakerRegistry::new()),
        ));
        gateway.set_provider_override(Arc::new(StubEmbedder));
        let indexer = EmbeddingIndexer::new(
            db.clone(),
            gateway,
            Arc::new(TokenBucket::new(100, 10.0)),
        );
        (db, indexer)
    }

    #[tokio::test]
    async fn test_store_is_idempotent() {
        let (db, indexer) = indexer();
        let settings = SystemSettings::default();
        let content = "A paragraph of text.\n\nAnother paragraph follows here.";

        let first = indexer
            .store("news", "n1", content, Some("AAPL"), &settings)
            .await
            .unwrap();
        let second = indexer
            .store("news", "n1", content, Some("AAPL"), &settings)
            .await
            .unwrap();
        assert_eq!(first.chunks_stored, second.chunks_stored);

        let rows = db.embeddings_for_source("news", "n1").unwrap();
        assert_eq!(rows.len(), first.chunks_stored);
        let texts: Vec<&str> = rows.iter().map(|r| r.chunk_text.as_str()).collect();
        assert!(texts.iter().all(|t| content.contains(*t) || t.contains("paragraph")));
        assert!(rows.iter().all(|r| r.model == settings.embedding_model));
    }

    #[tokio::test]
    async fn test_regrowth_replaces_old_chunks() {
        let (db, indexer) = indexer();
        let settings = SystemSettings::default();

        indexer.store("news", "n1", "A", None, &settings).await.unwrap();
        assert_eq!(db.embeddings_for_source("news", "n1").unwrap().len(), 1);

        let longer = (0..30)
            .map(|i| format!("Paragraph {} with more words to force multiple chunks out.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let outcome = indexer.store("news", "n1", &longer, None, &settings).await.unwrap();
        assert!(outcome.chunks_stored > 1);

        let rows = db.embeddings_for_source("news", "n1").unwrap();
        assert_eq!(rows.len(), outcome.chunks_stored);
        assert!(rows.iter().all(|r| r.chunk_text != "A"));
    }

    #[tokio::test]
    async fn test_empty_content_stores_nothing() {
        let (db, indexer) = indexer();
        let outcome = indexer
            .store("news", "n1", "   ", None, &SystemSettings::default())
            .await
            .unwrap();
        assert_eq!(outcome.chunks_stored, 0);
        assert!(db.embeddings_for_source("news", "n1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_as_rate_limited() {
        let db = Database::in_memory().unwrap();
        let gateway = Arc::new(LlmGateway::new(
            ProviderCredentials::default(),
            Arc::new(CircuitBreakerRegistry::new()),
        ));
        gateway.set_provider_override(Arc::new(StubEmbedder));
        let indexer = EmbeddingIndexer::new(db, gateway, Arc::new(TokenBucket::new(1, 0.0)));
        let settings = SystemSettings::default();

        indexer.store("news", "a", "text", None, &settings).await.unwrap();
        let err = indexer
            .store("news", "b", "text", None, &settings)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn test_advisory_key_is_stable_and_distinct() {
        assert_eq!(advisory_key("news", "n1"), advisory_key("news", "n1"));
        assert_ne!(advisory_key("news", "n1"), advisory_key("news", "n2"));
        assert_ne!(advisory_key("news", "n1"), advisory_key("report", "n1"));
    }
}

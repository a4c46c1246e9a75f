//! End-to-end pipeline tests.
//!
//! The LLM gateway runs against a scripted provider and the content
//! fetcher against scripted strategies, so every scenario drives the real
//! orchestrator, storage, cost accounting, and embedding paths without
//! network access.

use async_trait::async_trait;
use newswire_backend::core::circuit_breaker::{BreakerConfig, BreakerState, CircuitBreakerRegistry};
use newswire_backend::core::rate_limit::TokenBucket;
use newswire_backend::error::{AppError, AppResult};
use newswire_backend::fetch::{ContentFetcher, FetchStrategy, FetchedContent, StrategyKind};
use newswire_backend::llm::providers::EventStream;
use newswire_backend::llm::{
    ChatRequest, ChatResponse, DbUsageRecorder, EmbeddingRequest, EmbeddingResponse, LlmGateway,
    LlmProvider, ProviderCredentials, TokenUsage,
};
use newswire_backend::models::{
    ArticleRef, ContentStatus, EntityType, FilterStatus, Market, ProcessingPath,
};
use newswire_backend::pipeline::NewsPipeline;
use newswire_backend::rag::indexer::EmbeddingIndexer;
use newswire_backend::storage::blob::BlobStore;
use newswire_backend::storage::db::{Database, EMBEDDING_DIMENSIONS};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ---------------------------------------------------------------------
// Scripted LLM provider
// ---------------------------------------------------------------------

/// Routes chat calls by prompt markers so each pipeline layer can be
/// scripted independently.
#[derive(Default)]
struct ScriptedLlm {
    responses: Mutex<HashMap<&'static str, String>>,
    /// Remaining forced failures per marker.
    failures: Mutex<HashMap<&'static str, usize>>,
    calls: Mutex<Vec<&'static str>>,
}

fn marker(request: &ChatRequest) -> &'static str {
    let text: String = request
        .messages
        .iter()
        .map(|m| m.content.text())
        .collect::<Vec<_>>()
        .join("\n");
    if text.contains("triage scorer") {
        "layer1"
    } else if text.contains("content preprocessor") {
        "layer15"
    } else if text.contains("financial news analyst") {
        "deep"
    } else if text.contains("Quickly extract") {
        "lightweight"
    } else {
        "other"
    }
}

impl ScriptedLlm {
    fn set(&self, key: &'static str, response: serde_json::Value) {
        self.responses.lock().insert(key, response.to_string());
    }

    fn fail_next(&self, key: &'static str, times: usize) {
        self.failures.lock().insert(key, times);
    }

    fn calls_for(&self, key: &'static str) -> usize {
        self.calls.lock().iter().filter(|c| **c == key).count()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn provider_name(&self) -> &'static str {
        "scripted"
    }

    fn supports_embeddings(&self) -> bool {
        true
    }

    async fn chat(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let key = marker(request);
        self.calls.lock().push(key);

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(AppError::Provider("scripted failure".into()));
                }
            }
        }

        let content = self
            .responses
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| AppError::Provider(format!("no scripted response for {}", key)))?;

        Ok(ChatResponse {
            content: Some(content),
            tool_calls: Vec::new(),
            finish_reason: Some("stop".into()),
            model: request.model.clone(),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
                total_tokens: 150,
                cached_tokens: 0,
            },
        })
    }

    async fn chat_stream(&self, _request: &ChatRequest) -> AppResult<EventStream> {
        unimplemented!("pipeline does not stream")
    }

    async fn embed(&self, request: &EmbeddingRequest) -> AppResult<EmbeddingResponse> {
        self.calls.lock().push("embed");
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
            usage: TokenUsage {
                prompt_tokens: 40,
                completion_tokens: 0,
                total_tokens: 40,
                cached_tokens: 0,
            },
        })
    }
}

// ---------------------------------------------------------------------
// Scripted fetch strategies
// ---------------------------------------------------------------------

struct ScriptedFetch {
    kind: StrategyKind,
    content: Mutex<AppResult<FetchedContent>>,
}

impl ScriptedFetch {
    fn text(kind: StrategyKind, full_text: String) -> Arc<Self> {
        Arc::new(Self {
            kind,
            content: Mutex::new(Ok(FetchedContent {
                full_text,
                ..Default::default()
            })),
        })
    }

    fn with_html(kind: StrategyKind, full_text: String, raw_html: String) -> Arc<Self> {
        Arc::new(Self {
            kind,
            content: Mutex::new(Ok(FetchedContent {
                full_text,
                raw_html: Some(raw_html),
                ..Default::default()
            })),
        })
    }

    fn failing(kind: StrategyKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            content: Mutex::new(Err(AppError::Provider("fetch down".into()))),
        })
    }
}

#[async_trait]
impl FetchStrategy for ScriptedFetch {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn fetch(&self, _url: &str) -> AppResult<FetchedContent> {
        match &*self.content.lock() {
            Ok(content) => Ok(content.clone()),
            Err(e) => Err(AppError::Provider(e.to_string())),
        }
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

struct Harness {
    _dir: TempDir,
    db: Database,
    blob: Arc<BlobStore>,
    llm: Arc<ScriptedLlm>,
    breakers: Arc<CircuitBreakerRegistry>,
    pipeline: NewsPipeline,
}

fn build_harness(strategies: Vec<Arc<dyn FetchStrategy>>) -> Harness {
    build_harness_with_breaker(strategies, BreakerConfig::default())
}

fn build_harness_with_breaker(
    strategies: Vec<Arc<dyn FetchStrategy>>,
    breaker_config: BreakerConfig,
) -> Harness {
    let dir = TempDir::new().unwrap();
    let db = Database::in_memory().unwrap();
    let blob = Arc::new(BlobStore::new(dir.path()).unwrap());

    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let gateway = Arc::new(
        LlmGateway::new(ProviderCredentials::default(), breakers.clone())
            .with_breaker_config(breaker_config),
    );
    let llm = Arc::new(ScriptedLlm::default());
    gateway.set_provider_override(llm.clone());
    gateway.set_usage_observer(Arc::new(DbUsageRecorder::new(db.clone())));

    let fetcher = Arc::new(ContentFetcher::with_strategies(strategies));
    let indexer = Arc::new(EmbeddingIndexer::new(
        db.clone(),
        gateway.clone(),
        Arc::new(TokenBucket::new(1000, 100.0)),
    ));

    let pipeline = NewsPipeline::new(
        db.clone(),
        blob.clone(),
        gateway,
        fetcher,
        indexer,
    )
    .unwrap();

    Harness {
        _dir: dir,
        db,
        blob,
        llm,
        breakers,
        pipeline,
    }
}

fn task(url: &str, title: &str, summary: Option<&str>) -> ArticleRef {
    ArticleRef {
        url: url.to_string(),
        symbol: Some("ACME".to_string()),
        market: Market::Us,
        title: title.to_string(),
        summary: summary.map(str::to_string),
        source: "reuters".to_string(),
        published_at: chrono::Utc::now(),
    }
}

fn scoring_response(per_dimension: i64, critical: bool) -> serde_json::Value {
    serde_json::json!({
        "dimension_scores": {
            "relevance": per_dimension,
            "market_impact": per_dimension,
            "actionability": per_dimension,
        },
        "is_critical": critical,
        "reasoning": "scripted",
    })
}

fn cleaning_response(cleaned_text: &str, insights: &str, visual: bool) -> serde_json::Value {
    serde_json::json!({
        "cleaned_text": cleaned_text,
        "image_insights": insights,
        "has_critical_visual_data": visual,
    })
}

fn purposes(db: &Database) -> Vec<String> {
    let mut purposes: Vec<String> = db
        .usage_records(None, 100)
        .unwrap()
        .into_iter()
        .map(|r| r.purpose)
        .collect();
    purposes.sort();
    purposes
}

// ---------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------

#[tokio::test]
async fn discard_path_stops_after_scoring() {
    let harness = build_harness(vec![ScriptedFetch::text(
        StrategyKind::HtmlParse,
        "never fetched".into(),
    )]);
    harness.llm.set("layer1", scoring_response(10, false)); // total 30

    let job = task("http://ex/ad1", "Click here for cheap watches", Some("SPONSORED"));
    harness.pipeline.process(&job).await.unwrap();

    let article = harness.db.get_article_by_url("http://ex/ad1").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Delete);
    assert_eq!(article.content_status, ContentStatus::Pending);
    assert_eq!(article.content_score, Some(30));
    assert!(article.content_file_path.is_none());
    assert!(harness
        .db
        .embeddings_for_source("news", &article.id.to_string())
        .unwrap()
        .is_empty());

    let purposes = purposes(&harness.db);
    assert_eq!(purposes, vec!["layer1_scoring".to_string()]);
}

#[tokio::test]
async fn lightweight_path_reaches_embedded() {
    let body = "word ".repeat(1200);
    let harness = build_harness(vec![ScriptedFetch::text(StrategyKind::HtmlParse, body.clone())]);
    harness.llm.set("layer1", scoring_response(50, false)); // total 150
    harness.llm.set("layer15", cleaning_response(&body, "", false));
    harness.llm.set(
        "lightweight",
        serde_json::json!({
            "decision": "keep",
            "entities": [{"entity": "ACME", "type": "stock", "score": 0.6}],
            "sentiment": "neutral",
            "industry_tags": ["industrials"],
            "event_tags": ["meeting"],
            "investment_summary": "Annual meeting rescheduled; limited impact."
        }),
    );

    let job = task("http://ex/acme", "Acme Corp reschedules annual meeting", None);
    harness.pipeline.process(&job).await.unwrap();

    let article = harness.db.get_article_by_url("http://ex/acme").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Keep);
    assert_eq!(article.processing_path, Some(ProcessingPath::Lightweight));
    assert_eq!(article.primary_entity.as_deref(), Some("ACME"));
    assert_eq!(article.primary_entity_type, Some(EntityType::Stock));
    assert_eq!(article.max_entity_score, Some(0.6));
    assert!(article.has_stock_entities);
    assert_eq!(article.content_status, ContentStatus::Embedded);
    // keep implies non-empty entities and summary
    assert!(!article.related_entities.is_empty());
    assert!(!article.investment_summary.unwrap().is_empty());
    // lightweight never produces the expensive fields
    assert_eq!(article.analysis_report.as_deref(), Some(""));

    let rows = harness
        .db
        .embeddings_for_source("news", &article.id.to_string())
        .unwrap();
    assert!(!rows.is_empty());

    let purposes = purposes(&harness.db);
    assert_eq!(
        purposes,
        vec![
            "content_cleaning".to_string(),
            "embedding".to_string(),
            "layer1_scoring".to_string(),
            "lightweight_filter".to_string(),
        ]
    );
}

#[tokio::test]
async fn full_analysis_path_with_images() {
    let body = "word ".repeat(8000);
    // Chart URLs point at a closed local port so download attempts fail
    // fast; image insights still come from the scripted cleaning call.
    let raw_html = r#"
        <img src="http://127.0.0.1:9/q3-revenue-chart.png" width="800">
        <img src="http://127.0.0.1:9/margin-graph.png" width="800">
        <img src="http://127.0.0.1:9/segment-table.png" width="800">
    "#;
    let harness = build_harness(vec![ScriptedFetch::with_html(
        StrategyKind::HtmlParse,
        body.clone(),
        raw_html.to_string(),
    )]);

    harness.llm.set("layer1", scoring_response(77, false)); // total 231
    let cleaned: String = "word ".repeat(7900);
    harness.llm.set(
        "layer15",
        cleaning_response(&cleaned, "Chart shows Q3 rev $4.2B vs $3.6B Q2", true),
    );
    harness.llm.set(
        "deep",
        serde_json::json!({
            "decision": "keep",
            "entities": [
                {"entity": "ACME", "type": "stock", "score": 0.9},
                {"entity": "BETA", "type": "stock", "score": 0.5},
                {"entity": "SPX", "type": "index", "score": 0.4},
                {"entity": "cloud demand", "type": "macro", "score": 0.6},
                {"entity": "rates", "type": "macro", "score": 0.2}
            ],
            "sentiment": "bullish",
            "industry_tags": ["tech"],
            "event_tags": ["earnings"],
            "investment_summary": "Revenue up 18%, margins widening.",
            "detailed_summary": "Acme reported a strong third quarter.",
            "analysis_report": "## Q3 analysis\n".repeat(40),
        }),
    );

    let job = task("http://ex/q3", "Q3 earnings: revenue up 18%", Some("Record quarter"));
    harness.pipeline.process(&job).await.unwrap();

    let article = harness.db.get_article_by_url("http://ex/q3").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Keep);
    assert_eq!(article.processing_path, Some(ProcessingPath::FullAnalysis));
    assert_eq!(article.sentiment_tag, Some(newswire_backend::models::Sentiment::Bullish));
    assert_eq!(article.industry_tags, vec!["tech"]);
    assert_eq!(article.event_tags, vec!["earnings"]);
    assert!(article.has_visual_data);
    assert_eq!(
        article.image_insights.as_deref(),
        Some("Chart shows Q3 rev $4.2B vs $3.6B Q2")
    );
    assert_eq!(article.related_entities.len(), 5);
    assert!(article.analysis_report.unwrap().len() >= 500);

    let rows = harness
        .db
        .embeddings_for_source("news", &article.id.to_string())
        .unwrap();
    assert!(rows.len() >= 5, "expected >=5 chunks, got {}", rows.len());
}

#[tokio::test]
async fn browser_fallback_fetch_is_tagged() {
    let short = "x".repeat(120);
    let long = "y".repeat(4000);
    let harness = build_harness(vec![
        ScriptedFetch::text(StrategyKind::HtmlParse, short),
        ScriptedFetch::text(StrategyKind::Browser, long.clone()),
    ]);
    harness.llm.set("layer1", scoring_response(50, false));
    harness.llm.set("layer15", cleaning_response(&long, "", false));
    harness.llm.set(
        "lightweight",
        serde_json::json!({
            "decision": "keep",
            "entities": [{"entity": "ACME", "type": "stock", "score": 0.5}],
            "sentiment": "neutral",
            "investment_summary": "ok"
        }),
    );

    let job = task("http://ex/js-page", "JS-rendered story", None);
    harness.pipeline.process(&job).await.unwrap();

    let article = harness.db.get_article_by_url("http://ex/js-page").unwrap().unwrap();
    assert_eq!(article.content_status, ContentStatus::Embedded); // fetched, then embedded
    let blob = harness
        .blob
        .read(article.content_file_path.as_deref().unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(blob.full_text.len(), 4000);
    assert_eq!(blob.metadata["source_tag"], "browser");
}

#[tokio::test]
async fn circuit_breaker_rejects_then_recovers() {
    let body = "word ".repeat(600);
    let harness = build_harness_with_breaker(
        vec![ScriptedFetch::text(StrategyKind::HtmlParse, body.clone())],
        BreakerConfig {
            failure_threshold: 5,
            recovery_timeout: Duration::from_millis(200),
            half_open_max_concurrent: 1,
        },
    );
    harness.llm.fail_next("layer1", 5);
    harness.llm.set("layer1", scoring_response(50, false));
    harness.llm.set("layer15", cleaning_response(&body, "", false));
    harness.llm.set(
        "lightweight",
        serde_json::json!({
            "decision": "keep",
            "entities": [{"entity": "ACME", "type": "stock", "score": 0.5}],
            "sentiment": "neutral",
            "investment_summary": "ok"
        }),
    );

    let job = task("http://ex/flaky", "Flaky provider story", None);

    // Five provider failures open the breaker.
    for _ in 0..5 {
        let err = harness.pipeline.process(&job).await.unwrap_err();
        assert_eq!(err.kind(), "provider_error");
    }
    let breaker = harness.breakers.get_or_create("scripted", BreakerConfig::default());
    assert_eq!(breaker.state(), BreakerState::Open);

    // Sixth call: rejected without reaching the provider, stage failed.
    let before = harness.llm.calls_for("layer1");
    let err = harness.pipeline.process(&job).await.unwrap_err();
    assert_eq!(err.kind(), "circuit_open");
    assert_eq!(harness.llm.calls_for("layer1"), before);
    let article = harness.db.get_article_by_url("http://ex/flaky").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Failed);

    // After recovery the single probe proceeds, succeeds, and closes the
    // breaker; the pipeline then completes.
    tokio::time::sleep(Duration::from_millis(250)).await;
    harness.pipeline.process(&job).await.unwrap();
    assert_eq!(breaker.state(), BreakerState::Closed);
    let article = harness.db.get_article_by_url("http://ex/flaky").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Keep);
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_terminal_state() {
    let body = "word ".repeat(600);
    let harness = build_harness(vec![ScriptedFetch::text(StrategyKind::HtmlParse, body.clone())]);
    harness.llm.set("layer1", scoring_response(50, false));
    harness.llm.set("layer15", cleaning_response(&body, "", false));
    // Layer 2 fails on the first attempt: the "crash" point.
    harness.llm.fail_next("lightweight", 1);
    harness.llm.set(
        "lightweight",
        serde_json::json!({
            "decision": "keep",
            "entities": [{"entity": "ACME", "type": "stock", "score": 0.6}],
            "sentiment": "neutral",
            "investment_summary": "resumed fine"
        }),
    );

    let job = task("http://ex/resume", "Resumable story", None);

    let err = harness.pipeline.process(&job).await.unwrap_err();
    assert_eq!(err.kind(), "provider_error");
    let article = harness.db.get_article_by_url("http://ex/resume").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Failed);
    assert_eq!(article.content_score, Some(150));
    assert!(article.content_status.has_content_file());

    // Replay: scoring and fetch are NOT redone; the run completes.
    harness.pipeline.process(&job).await.unwrap();
    let article = harness.db.get_article_by_url("http://ex/resume").unwrap().unwrap();
    assert_eq!(article.filter_status, FilterStatus::Keep);
    assert_eq!(article.content_status, ContentStatus::Embedded);
    assert_eq!(harness.llm.calls_for("layer1"), 1);

    // Replaying the finished task is a no-op.
    let cleaning_calls = harness.llm.calls_for("layer15");
    harness.pipeline.process(&job).await.unwrap();
    assert_eq!(harness.llm.calls_for("layer15"), cleaning_calls);
}

#[tokio::test]
async fn fetch_failure_commits_failed_content_state() {
    let harness = build_harness(vec![ScriptedFetch::failing(StrategyKind::HtmlParse)]);
    harness.llm.set("layer1", scoring_response(50, false));

    let job = task("http://ex/gone", "Dead link story", None);
    let err = harness.pipeline.process(&job).await.unwrap_err();
    assert_eq!(err.kind(), "provider_error");

    let article = harness.db.get_article_by_url("http://ex/gone").unwrap().unwrap();
    assert_eq!(article.content_status, ContentStatus::Failed);
    assert!(article.content_error.is_some());
    // Scoring already committed, so a later pass would skip it.
    assert_eq!(article.content_score, Some(150));
}

#[tokio::test]
async fn usage_costs_are_priced_at_insert_time() {
    let harness = build_harness(vec![ScriptedFetch::text(
        StrategyKind::HtmlParse,
        "never used".into(),
    )]);
    harness
        .db
        .insert_pricing(
            "gpt-4o-mini",
            2.0,
            None,
            4.0,
            chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        )
        .unwrap();
    harness.llm.set("layer1", scoring_response(10, false));

    let job = task("http://ex/cost", "Cost check", None);
    harness.pipeline.process(&job).await.unwrap();

    let records = harness.db.usage_records(Some("layer1_scoring"), 10).unwrap();
    assert_eq!(records.len(), 1);
    // 100 prompt * $2/1M + 50 completion * $4/1M
    let expected = 100.0 / 1e6 * 2.0 + 50.0 / 1e6 * 4.0;
    assert!((records[0].cost_usd - expected).abs() < 1e-6);

    let summary = harness.db.costs_summary(Some("layer1_scoring"), None).unwrap();
    assert!((summary.total_cost_usd - expected).abs() < 1e-6);
    assert_eq!(summary.total_calls, 1);
}

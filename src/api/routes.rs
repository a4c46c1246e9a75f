//! Read-side HTTP endpoints: news listing, full content, hybrid search,
//! market data reads, ingestion, and admin settings.

use crate::api::AppState;
use crate::error::AppError;
use crate::llm::{CallOptions, EmbeddingRequest, ProviderCredentials};
use crate::models::{detect_market, ArticleRef, ContentStatus, Market, SystemSettings};
use crate::rag::search::SearchResult;
use crate::storage::db::EMBEDDING_DIMENSIONS;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/api/news", get(list_news))
        .route("/api/news/ingest", post(ingest))
        .route("/api/news/:id/content", get(get_content))
        .route("/api/search", get(hybrid_search))
        .route("/api/stocks/quote", get(stock_quote))
        .route("/api/stocks/search", get(stock_search))
        .route("/api/admin/settings", get(get_settings).put(update_settings))
        .merge(crate::api::costs::costs_router())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct NewsQuery {
    pub symbol: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct NewsResponse {
    pub articles: Vec<crate::models::NewsArticle>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub timestamp: String,
}

async fn list_news(
    Query(params): Query<NewsQuery>,
    State(state): State<AppState>,
) -> Result<Json<NewsResponse>, AppError> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params.page_size.unwrap_or(20).clamp(1, 100);

    let (articles, total) = state
        .db
        .list_news(params.symbol.as_deref(), page, page_size)?;

    Ok(Json(NewsResponse {
        articles,
        total,
        page,
        page_size,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

/// Full article content. When the blob is missing but the article exists,
/// a fetch task is enqueued and 202 is returned.
async fn get_content(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let article = state
        .db
        .get_article(id)?
        .ok_or_else(|| AppError::NotFound(format!("news article {}", id)))?;

    if let Some(path) = &article.content_file_path {
        if let Some(blob) = state.blob.read(path)? {
            return Ok((StatusCode::OK, Json(serde_json::to_value(blob)?)));
        }
    }

    if article.content_status == ContentStatus::Pending
        || article.content_status == ContentStatus::Failed
    {
        let queued = state.queue.enqueue(ArticleRef {
            url: article.url.clone(),
            symbol: article.symbol.clone(),
            market: article.market,
            title: article.title.clone(),
            summary: article.summary.clone(),
            source: article.source.clone(),
            published_at: article.published_at,
        });
        return Ok((
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "status": "fetch_queued",
                "queued": queued,
                "content_status": article.content_status.as_str(),
            })),
        ));
    }

    Err(AppError::NotFound(format!("content for article {}", id)))
}

/// Scheduler surface: enqueue one article reference. Replay-safe.
async fn ingest(
    State(state): State<AppState>,
    Json(task): Json<ArticleRef>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if task.url.trim().is_empty() {
        return Err(AppError::Validation("url must not be empty".into()));
    }
    if task.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".into()));
    }

    let queued = state.queue.enqueue(task);
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "queued": queued })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub symbol: Option<String>,
    pub source_type: Option<String>,
    pub k: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub count: usize,
    pub degraded: bool,
    pub timestamp: String,
}

/// Hybrid search over the knowledge base. If the query embedding cannot
/// be produced, degrades to keyword-only results instead of failing.
async fn hybrid_search(
    Query(params): Query<SearchQuery>,
    State(state): State<AppState>,
) -> Result<Json<SearchResponse>, AppError> {
    if params.q.trim().is_empty() {
        return Err(AppError::Validation("q must not be empty".into()));
    }
    let top_k = params.k.unwrap_or(5).clamp(1, 50);
    let settings = state.db.get_settings()?;

    let mut request = EmbeddingRequest::new(settings.embedding_model.clone(), vec![params.q.clone()]);
    request.dimensions = Some(EMBEDDING_DIMENSIONS);
    let opts = CallOptions::for_purpose("embedding")
        .with_system(ProviderCredentials::from_settings(&settings));

    let (results, degraded) = match state.gateway.embed(&request, &opts).await {
        Ok(response) if !response.embeddings.is_empty() => {
            let results = state.search.search(
                &params.q,
                &response.embeddings[0],
                params.symbol.as_deref(),
                params.source_type.as_deref(),
                top_k,
                0.7,
            )?;
            (results, false)
        }
        Ok(_) | Err(_) => {
            warn!(q = %params.q, "query embedding unavailable, keyword-only search");
            let results = state.search.keyword_search(
                &params.q,
                params.symbol.as_deref(),
                params.source_type.as_deref(),
                top_k,
            )?;
            (results, true)
        }
    };

    Ok(Json(SearchResponse {
        count: results.len(),
        results,
        degraded,
        timestamp: Utc::now().to_rfc3339(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct QuoteQuery {
    pub symbol: String,
    pub market: Option<String>,
}

async fn stock_quote(
    Query(params): Query<QuoteQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let market = params
        .market
        .as_deref()
        .and_then(Market::parse)
        .unwrap_or_else(|| detect_market(&params.symbol));

    let quote = state
        .markets
        .quote(&params.symbol, market)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("quote for {}", params.symbol)))?;

    Ok(Json(serde_json::json!({
        "quote": quote,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct StockSearchQuery {
    pub q: String,
    pub markets: Option<String>,
}

async fn stock_search(
    Query(params): Query<StockSearchQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    if params.q.trim().is_empty() {
        return Err(AppError::Validation("q must not be empty".into()));
    }
    let markets: Vec<Market> = params
        .markets
        .as_deref()
        .map(|raw| raw.split(',').filter_map(Market::parse).collect())
        .unwrap_or_default();

    let results = state.markets.search(&params.q, &markets).await?;
    let count = results.len();
    Ok(Json(serde_json::json!({
        "results": results,
        "count": count,
    })))
}

async fn get_settings(State(state): State<AppState>) -> Result<Json<SystemSettings>, AppError> {
    let mut settings = state.db.get_settings()?;
    // Keys never leave the admin store in responses.
    settings.openai_api_key = settings.openai_api_key.map(|_| "***".to_string());
    settings.anthropic_api_key = settings.anthropic_api_key.map(|_| "***".to_string());
    Ok(Json(settings))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<SystemSettings>,
) -> Result<Json<serde_json::Value>, AppError> {
    if settings.layer1_discard_threshold < 0
        || settings.layer1_full_analysis_threshold > 300
        || settings.layer1_discard_threshold > settings.layer1_full_analysis_threshold
    {
        return Err(AppError::Validation(
            "thresholds must satisfy 0 <= discard <= full_analysis <= 300".into(),
        ));
    }
    state.db.update_settings(&settings)?;
    state.cache.invalidate_prefix("stock:");
    Ok(Json(serde_json::json!({ "updated": true })))
}

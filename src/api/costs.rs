//! Cost metric endpoints over the usage log.
//!
//! Aggregates always use the cost computed at insert time; pricing
//! changes never reprice history.

use crate::api::AppState;
use crate::error::AppError;
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;

pub fn costs_router() -> Router<AppState> {
    Router::new()
        .route("/api/costs/summary", get(summary))
        .route("/api/costs/daily", get(daily))
        .route("/api/costs/by-purpose", get(by_purpose))
}

#[derive(Debug, Deserialize)]
pub struct CostQuery {
    pub purpose: Option<String>,
    pub model: Option<String>,
    pub days: Option<u32>,
}

async fn summary(
    Query(params): Query<CostQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = state
        .db
        .costs_summary(params.purpose.as_deref(), params.model.as_deref())?;
    Ok(Json(serde_json::json!({
        "total_cost_usd": summary.total_cost_usd,
        "total_calls": summary.total_calls,
        "total_tokens": summary.total_tokens,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

async fn daily(
    Query(params): Query<CostQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let days = params.days.unwrap_or(30).clamp(1, 365);
    let series = state.db.costs_daily(
        params.purpose.as_deref(),
        params.model.as_deref(),
        days,
    )?;
    Ok(Json(serde_json::json!({
        "days": days,
        "series": series,
    })))
}

async fn by_purpose(
    Query(params): Query<CostQuery>,
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let breakdown = state.db.costs_by_purpose(params.model.as_deref())?;
    Ok(Json(serde_json::json!({
        "breakdown": breakdown,
    })))
}

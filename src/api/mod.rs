pub mod costs;
pub mod routes;

use crate::core::cache::CacheService;
use crate::error::AppError;
use crate::llm::LlmGateway;
use crate::markets::router::ProviderRouter;
use crate::pipeline::queue::PipelineQueue;
use crate::rag::search::HybridSearch;
use crate::storage::blob::BlobStore;
use crate::storage::db::Database;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;

/// Shared state for every HTTP handler.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub blob: Arc<BlobStore>,
    pub queue: PipelineQueue,
    pub search: Arc<HybridSearch>,
    pub gateway: Arc<LlmGateway>,
    pub markets: Arc<ProviderRouter>,
    pub cache: CacheService,
}

/// Map an application error to an HTTP response with a stable error kind.
pub fn error_response(error: AppError) -> Response {
    let status = match &error {
        AppError::Validation(_) => StatusCode::BAD_REQUEST,
        AppError::NotFound(_) => StatusCode::NOT_FOUND,
        AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        AppError::CircuitOpen(_) | AppError::ProviderTimeout(_) | AppError::Provider(_) => {
            StatusCode::BAD_GATEWAY
        }
        AppError::Storage(_) | AppError::Invariant(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({
        "error": error.kind(),
        "message": error.to_string(),
    });
    (status, Json(body)).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error_response(self)
    }
}

//! Per-client HTTP rate limiting middleware.
//!
//! Sliding window keyed by `{ip}:{route}` so each endpoint has its own
//! counter. Proxy headers are honoured for the client IP. Rejections
//! carry a Retry-After derived from the oldest surviving request.

use crate::core::rate_limit::{SlidingWindowLimiter, WindowDecision};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<SlidingWindowLimiter>,
}

fn client_ip(request: &Request<Body>, addr: &SocketAddr) -> String {
    // X-Forwarded-For first (original client in a proxy chain), then
    // X-Real-IP, then the socket peer.
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
    {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    addr.ip().to_string()
}

pub async fn rate_limit_middleware(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identifier = format!("{}:{}", client_ip(&request, &addr), request.uri().path());

    match state.limiter.check(&identifier) {
        WindowDecision::Allowed { .. } => next.run(request).await,
        WindowDecision::Rejected { retry_after } => {
            let retry_secs = retry_after.as_secs().max(1);
            warn!(identifier, retry_after_secs = retry_secs, "rate limit exceeded");

            let body = serde_json::json!({
                "error": "rate_limited",
                "message": "Too many requests. Please slow down.",
                "retry_after_seconds": retry_secs,
            });
            (
                StatusCode::TOO_MANY_REQUESTS,
                [("Retry-After", retry_secs.to_string())],
                axum::Json(body),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn request_with_header(name: &str, value: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/news")
            .header(name, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let request = request_with_header("x-forwarded-for", "203.0.113.7, 10.0.0.2");
        assert_eq!(client_ip(&request, &addr), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        let request = Request::builder()
            .uri("/api/news")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, &addr), "10.0.0.1");
    }
}

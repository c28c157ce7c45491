//! Guard middleware run in front of protected handlers.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::ratelimit::{ClientIdentity, Decision, RateLimiter};

/// Middleware state binding a limiter to one endpoint category.
#[derive(Clone)]
pub struct RateLimitGuard {
    limiter: Arc<RateLimiter>,
    category: Arc<str>,
}

impl RateLimitGuard {
    pub fn new(limiter: Arc<RateLimiter>, category: impl Into<Arc<str>>) -> Self {
        Self {
            limiter,
            category: category.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

/// Reject the request with `429` before the handler runs when the client is
/// over its quota.
///
/// Use with `axum::middleware::from_fn_with_state`.
pub async fn enforce(
    State(guard): State<RateLimitGuard>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let identity = ClientIdentity::from_request(req.headers(), peer);

    match guard.limiter.check(&identity, &guard.category).await {
        Decision::Allow => next.run(req).await,
        Decision::Deny { retry_after_secs } => too_many_requests(retry_after_secs),
    }
}

/// The `429 Too Many Requests` response with its retry hint.
pub fn too_many_requests(retry_after_secs: u64) -> Response {
    let body = Json(json!({
        "allowed": false,
        "error": "too many requests",
        "retry_after_secs": retry_after_secs,
    }));

    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

//! Decision service for handlers that run outside this process.

use axum::extract::{ConnectInfo, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::guard::too_many_requests;
use crate::ratelimit::{ClientIdentity, Decision, RateLimiter};

/// Body of `POST /v1/evaluate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateRequest {
    /// Endpoint category to evaluate against
    pub category: String,
    /// Client identity; derived from the request itself when absent
    #[serde(default)]
    pub client: Option<String>,
}

/// Body returned when the request is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluateResponse {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

/// Build the service router.
pub fn router(limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/v1/evaluate", post(evaluate))
        .route("/healthz", get(healthz))
        .with_state(limiter)
}

/// Decide whether a client may make another request to a category.
///
/// `200` on allow, `429` with `Retry-After` on deny, `400` when the category
/// is empty.
#[instrument(skip_all, fields(category = %request.category))]
async fn evaluate(
    limiter: State<Arc<RateLimiter>>,
    headers: HeaderMap,
    extensions: Extensions,
    request: Json<EvaluateRequest>,
) -> Response {
    if request.category.trim().is_empty() {
        warn!("Received evaluate request with empty category");
        return (StatusCode::BAD_REQUEST, "category is required").into_response();
    }

    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());
    let identity = match request.client.as_deref().map(str::trim) {
        Some(client) if !client.is_empty() => ClientIdentity::new(client),
        _ => ClientIdentity::from_request(&headers, peer),
    };

    let decision = limiter.check(&identity, &request.category).await;

    debug!(
        client = %identity,
        decision = ?decision,
        "Rate limit decision made"
    );

    match decision {
        Decision::Allow => Json(EvaluateResponse {
            allowed: true,
            retry_after_secs: None,
        })
        .into_response(),
        Decision::Deny { retry_after_secs } => too_many_requests(retry_after_secs),
    }
}

async fn healthz() -> &'static str {
    "ok"
}

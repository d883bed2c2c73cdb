//! Rate limit middleware for the HTTP surface.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use super::client_key::client_key;
use crate::ratelimit::{Decision, Gate};

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_BURST: HeaderName = HeaderName::from_static("x-ratelimit-burst");

/// State shared by every invocation of [`rate_limit`].
#[derive(Debug, Clone)]
pub struct GateState {
    gate: Arc<Gate>,
    trust_forwarded_headers: bool,
}

impl GateState {
    pub fn new(gate: Arc<Gate>, trust_forwarded_headers: bool) -> Self {
        Self {
            gate,
            trust_forwarded_headers,
        }
    }

    pub fn gate(&self) -> &Arc<Gate> {
        &self.gate
    }
}

/// Check the caller against the gate before running the rest of the stack.
///
/// Rejected requests get `429 Too Many Requests` with a `Retry-After`
/// header and a JSON body describing the limit.
pub async fn rate_limit(State(state): State<GateState>, request: Request, next: Next) -> Response {
    if !state.gate.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_key(request.headers(), peer, state.trust_forwarded_headers);

    let decision = state.gate.check(&client, Instant::now());
    if decision.allowed {
        return next.run(request).await;
    }

    warn!(
        client = %client,
        method = %request.method(),
        path = %request.uri().path(),
        rps_limit = decision.limit,
        burst_limit = decision.burst,
        "Rate limit exceeded"
    );

    rejection(&decision)
}

fn rejection(decision: &Decision) -> Response {
    let body = json!({
        "error": "Rate limit exceeded",
        "retry_after": decision.retry_after_secs,
        "limit": limit_value(decision.limit),
        "burst": decision.burst,
    });

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    headers.insert(X_RATELIMIT_BURST, HeaderValue::from(decision.burst));
    if let Ok(limit) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(X_RATELIMIT_LIMIT, limit);
    }

    response
}

/// Whole rates go out as JSON integers, fractional ones as floats.
fn limit_value(limit: f64) -> serde_json::Value {
    if limit.fract() == 0.0 && (0.0..=u64::MAX as f64).contains(&limit) {
        json!(limit as u64)
    } else {
        json!(limit)
    }
}

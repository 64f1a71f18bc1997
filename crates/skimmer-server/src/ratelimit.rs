//! API-surface rate limiting: the hierarchical cascade in front of every
//! `/v1` route, and the 429 response shared with the submission window.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use skimmer_core::ratelimit::{
    ClientIdentity, HierarchicalOutcome, LimitLevel, RateLimitDecision, api_key_fingerprint,
};

use crate::auth::bearer_token;
use crate::dto::RateLimitedResponse;
use crate::state::AppState;

/// Build the caller's identity. The address is the peer's unless
/// `trust_forwarded_for` is set, in which case the first `X-Forwarded-For`
/// hop wins. Only enable that behind a proxy that overwrites the header.
pub fn client_identity(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded_for: bool,
) -> ClientIdentity {
    let forwarded = trust_forwarded_for
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(String::from);

    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(String::from);

    ClientIdentity {
        ip: forwarded.or_else(|| peer.map(|addr| addr.ip().to_string())),
        user_id,
        api_key_hash: bearer_token(headers).map(api_key_fingerprint),
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_millis().div_ceil(1000) as u64
}

/// `429 Too Many Requests` with `Retry-After` and `X-RateLimit-*` headers.
pub fn rate_limited_response(decision: &RateLimitDecision, level: Option<LimitLevel>) -> Response {
    let retry_after = ceil_secs(decision.wait()).max(1);
    let message = match level {
        Some(level) => format!("Rate limit exceeded at {level} level"),
        None => "Too many job submissions".to_string(),
    };
    let body = RateLimitedResponse {
        error: "rate_limited".to_string(),
        message,
        level: level.map(|l| l.as_str().to_string()),
        retry_after_secs: retry_after,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert("retry-after", HeaderValue::from(retry_after));
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(ceil_secs(decision.reset_after)),
    );
    response
}

/// Middleware running the ip → user → api key cascade. On admission the
/// identity is stored in request extensions for handlers.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let identity = client_identity(request.headers(), peer, state.trust_forwarded_for);

    if let HierarchicalOutcome::Denied { level, decision } =
        state.limiter.check_hierarchical(&identity).await
    {
        tracing::debug!(
            level = level.as_str(),
            retry_after_ms = decision.wait().as_millis() as u64,
            "Request denied by rate limit"
        );
        return rate_limited_response(&decision, Some(level));
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}

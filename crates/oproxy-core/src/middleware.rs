use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::access::normalize_ip;
use crate::auth::AuthContext;
use crate::error::ApiError;
use crate::services::RequestRecord;
use crate::state::AppState;

/// Request-scoped id, also returned as `X-Request-ID`.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Normalized client IPv4, after any trusted `X-Forwarded-For`.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Outermost layer: assign the request id, resolve the client IP, track
/// the active-connection gauge, and emit per-request metrics and the
/// structured request log entry.
pub async fn request_context(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let request_id = short_id();
    let client_ip = resolve_client_ip(&state, req.headers(), &addr);
    let method = req.method().to_string();
    let path = req.uri().path().to_string();

    req.extensions_mut().insert(RequestId(request_id.clone()));
    req.extensions_mut().insert(ClientIp(client_ip.clone()));

    state.active_connections.fetch_add(1, Ordering::Relaxed);
    state.metrics.gauge_add("active_connections", 1);

    let mut response = next.run(req).await;

    let status = response.status().as_u16();
    let elapsed = started.elapsed();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    state.metrics.incr_counter(
        "http_request",
        &[
            ("path", path.as_str()),
            ("method", method.as_str()),
            ("status", &status.to_string()),
        ],
        1,
    );
    state
        .metrics
        .observe_seconds("http_request_duration", &[("path", path.as_str())], elapsed.as_secs_f64());
    state.request_log.log_request(&RequestRecord {
        request_id,
        method,
        path,
        status,
        client_ip,
        token_id: None,
        model: None,
        elapsed_ms: elapsed.as_millis(),
        stream: response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream")),
    });

    state.active_connections.fetch_sub(1, Ordering::Relaxed);
    state.metrics.gauge_add("active_connections", -1);

    response
}

/// IP allow/deny gate.
pub async fn access_gate(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip_of(&req);
    if !state.access.is_allowed(&ip) {
        return ApiError::access_denied("access denied by IP policy").into_response();
    }
    next.run(req).await
}

/// Sliding-window gate, checked global -> ip -> token. The token window is
/// keyed by a registry peek so it binds before full validation runs.
pub async fn rate_gate(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let ip = client_ip_of(&req);
    let token = extract_bearer(req.headers()).and_then(|plain| state.tokens.peek(&plain));
    let token_id = token.as_ref().map(|t| t.id.clone());
    let token_override = token.as_ref().and_then(|t| t.rate_limit);

    if let Err(denial) = state.limiter.check(&ip, token_id.as_deref(), token_override) {
        state
            .metrics
            .incr_counter("rate_limit_hit", &[("scope", denial.scope.as_str())], 1);
        return ApiError::rate_limited(
            format!("rate limit exceeded ({})", denial.scope.as_str()),
            denial.retry_after_secs,
            denial.scope.as_str(),
        )
        .into_response();
    }
    next.run(req).await
}

/// Bearer auth against the token registry, or the legacy shared secret
/// when no tokens exist. Attaches the `AuthContext` either way.
pub async fn auth_gate(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let bearer = extract_bearer(req.headers());

    if !state.tokens.is_empty() {
        let Some(plain) = bearer else {
            return ApiError::auth("missing bearer token").into_response();
        };
        let token = match state.tokens.validate(&plain) {
            Ok(token) => token,
            Err(reason) => return ApiError::auth(reason).into_response(),
        };
        let ip = client_ip_of(&req);
        if !crate::auth::TokenRegistry::check_ip_access(&token, &ip) {
            return ApiError::access_denied("token not allowed from this source IP")
                .into_response();
        }
        req.extensions_mut().insert(AuthContext { token: Some(token) });
        return next.run(req).await;
    }

    if let Some(secret) = state.config.api_token.as_deref() {
        if bearer.as_deref() != Some(secret) {
            return ApiError::auth("invalid api token").into_response();
        }
    }
    req.extensions_mut().insert(AuthContext::default());
    next.run(req).await
}

fn short_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..12].to_string()
}

fn resolve_client_ip(state: &AppState, headers: &HeaderMap, addr: &SocketAddr) -> String {
    if state.config.trust_proxy {
        if let Some(forwarded) = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            return normalize_ip(forwarded);
        }
    }
    normalize_ip(&addr.ip().to_string())
}

fn client_ip_of(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `Authorization: Bearer <token>` (scheme case-insensitive), or the raw
/// header value when no scheme is present.
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("authorization")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.len() > 7 && raw[..7].eq_ignore_ascii_case("bearer ") {
        let token = raw[7..].trim();
        return (!token.is_empty()).then(|| token.to_string());
    }
    Some(raw.to_string())
}

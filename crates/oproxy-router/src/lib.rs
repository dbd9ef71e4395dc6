use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;

use oproxy_core::{handlers, middleware, ApiError, AppState};

/// The OpenAI-compatible surface: `/v1/*` plus the bare aliases some
/// clients use. Middleware runs request-context -> access -> rate -> auth;
/// handlers only see admitted, authenticated requests.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/models", get(handlers::models_list))
        .route("/v1/models/{*id}", get(handlers::models_get))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/models", get(handlers::models_list))
        .route("/models/{*id}", get(handlers::models_get))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/embeddings", post(handlers::embeddings))
        // Layer order is inside-out: the last layer runs first.
        .layer(from_fn_with_state(state.clone(), middleware::auth_gate))
        .layer(from_fn_with_state(state.clone(), middleware::rate_gate))
        .layer(from_fn_with_state(state.clone(), middleware::access_gate))
        .layer(from_fn_with_state(state.clone(), middleware::request_context))
        .fallback(unknown_endpoint)
        .with_state(state)
}

async fn unknown_endpoint() -> impl IntoResponse {
    ApiError::not_found("unknown endpoint")
}

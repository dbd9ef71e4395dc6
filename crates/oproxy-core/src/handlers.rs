use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use oproxy_protocol::ollama::chat::OllamaChatResponse;
use oproxy_protocol::ollama::embed::OllamaEmbedResponse;
use oproxy_protocol::ollama::generate::OllamaGenerateResponse;
use oproxy_protocol::ollama::tags::OllamaTagsResponse;
use oproxy_protocol::openai::chat::request::ChatCompletionRequest;
use oproxy_protocol::openai::completions::CompletionRequest;
use oproxy_protocol::openai::embeddings::EmbeddingsRequest;
use oproxy_protocol::openai::models::{Model, ModelList, ModelObjectType};
use oproxy_protocol::openai::types::{CompletionUsage, ListObjectType};
use oproxy_transform::ids::unix_now;
use oproxy_transform::request::{
    transform_chat_request, transform_completion_request, transform_embeddings_request,
    user_prompt_text,
};
use oproxy_transform::response::{
    transform_chat_response, transform_embeddings_response, transform_generate_response,
};
use oproxy_transform::stream::{ChatStreamState, GenerateStreamState};

use crate::auth::{AuthContext, TokenRegistry};
use crate::error::ApiError;
use crate::proxy::ProxySuccess;
use crate::relay::{spawn_relay, StreamTranslator};
use crate::services::cache_key;
use crate::state::AppState;
use crate::upstream::UpstreamBody;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: ChatCompletionRequest = parse_body(&body)?;
    check_model_scope(&auth, &request.model)?;

    let is_stream = request.stream.unwrap_or(false);
    let upstream_request = transform_chat_request(&request);
    let body_value = to_value(&upstream_request)?;
    let success = state
        .engine
        .dispatch("/chat", Some(body_value), &request.model, is_stream)
        .await?;

    if is_stream {
        let translator = StreamTranslator::Chat(ChatStreamState::new(&request.model));
        return Ok(stream_response(&state, success, translator, &auth));
    }

    let bytes = expect_bytes(success.body)?;
    let upstream: OllamaChatResponse = parse_upstream(&state, &success.backend, &bytes)?;
    let response = transform_chat_response(&upstream, &request.model, &user_prompt_text(&request));
    state.engine.record_success(&success.backend);
    record_token_usage(&state, &auth, response.usage);
    Ok(Json(response).into_response())
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: CompletionRequest = parse_body(&body)?;
    check_model_scope(&auth, &request.model)?;

    let is_stream = request.stream.unwrap_or(false);
    let upstream_request = transform_completion_request(&request);
    let prompt_text = upstream_request.prompt.clone();
    let body_value = to_value(&upstream_request)?;
    let success = state
        .engine
        .dispatch("/generate", Some(body_value), &request.model, is_stream)
        .await?;

    if is_stream {
        let translator = StreamTranslator::Generate(GenerateStreamState::new(&request.model));
        return Ok(stream_response(&state, success, translator, &auth));
    }

    let bytes = expect_bytes(success.body)?;
    let upstream: OllamaGenerateResponse = parse_upstream(&state, &success.backend, &bytes)?;
    let response = transform_generate_response(&upstream, &request.model, &prompt_text);
    state.engine.record_success(&success.backend);
    if let Some(usage) = response.usage {
        record_token_usage(&state, &auth, usage);
    }
    Ok(Json(response).into_response())
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let request: EmbeddingsRequest = parse_body(&body)?;
    check_model_scope(&auth, &request.model)?;

    let key = cache_key(&request.model, &request.input);
    if let Some(cached) = state.cache.get(&key) {
        state.metrics.incr_counter("cache_hit", &[("endpoint", "embeddings")], 1);
        return Ok(Json(cached).into_response());
    }
    state.metrics.incr_counter("cache_miss", &[("endpoint", "embeddings")], 1);

    let upstream_request = transform_embeddings_request(&request);
    let body_value = to_value(&upstream_request)?;
    let success = state
        .engine
        .dispatch("/embed", Some(body_value), &request.model, false)
        .await?;

    let bytes = expect_bytes(success.body)?;
    let upstream: OllamaEmbedResponse = parse_upstream(&state, &success.backend, &bytes)?;
    let response = transform_embeddings_response(&upstream, &request.model);
    state.engine.record_success(&success.backend);
    record_token_usage(&state, &auth, response.usage);

    if let Ok(value) = serde_json::to_value(&response) {
        state.cache.put(&key, value);
    }
    Ok(Json(response).into_response())
}

pub async fn models_list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ModelList>, ApiError> {
    let data = collect_models(&state).await?;
    Ok(Json(ModelList {
        object: ListObjectType::List,
        data,
    }))
}

pub async fn models_get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Model>, ApiError> {
    let id = id.trim_start_matches('/').to_string();
    let data = collect_models(&state).await?;
    data.into_iter()
        .find(|model| model.id == id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("model '{id}' not found")))
}

/// Upstream tags from one selected backend, plus every model the channels
/// advertise (allow-list literals and remap keys).
async fn collect_models(state: &Arc<AppState>) -> Result<Vec<Model>, ApiError> {
    let mut models: Vec<Model> = Vec::new();

    let upstream = state.engine.dispatch("/tags", None, "", false).await;
    match upstream {
        Ok(success) => {
            let bytes = expect_bytes(success.body)?;
            let tags: OllamaTagsResponse = parse_upstream(state, &success.backend, &bytes)?;
            state.engine.record_success(&success.backend);
            for tag in tags.models {
                let created = tag
                    .modified_at
                    .as_deref()
                    .and_then(|raw| time::OffsetDateTime::parse(raw, &Rfc3339).ok())
                    .map(|at| at.unix_timestamp())
                    .unwrap_or_else(unix_now);
                push_model(&mut models, tag.name, created);
            }
        }
        Err(err) => {
            // Channel-advertised models can still answer the listing.
            if state.channels.all().iter().all(|c| {
                c.models.iter().all(|m| m.contains('*')) && c.model_mapping.is_empty()
            }) {
                return Err(err);
            }
        }
    }

    let now = unix_now();
    for channel in state.channels.all() {
        if !channel.enabled {
            continue;
        }
        for name in &channel.models {
            if !name.contains('*') {
                push_model(&mut models, name.clone(), now);
            }
        }
        for requested in channel.model_mapping.keys() {
            push_model(&mut models, requested.clone(), now);
        }
    }

    Ok(models)
}

fn push_model(models: &mut Vec<Model>, id: String, created: i64) {
    if models.iter().any(|m| m.id == id) {
        return;
    }
    models.push(Model {
        id,
        object: ModelObjectType::Model,
        created,
        owned_by: "ollama".to_string(),
    });
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    let value: JsonValue = serde_json::from_slice(body)
        .map_err(|err| ApiError::invalid_request(format!("invalid JSON body: {err}")))?;
    let model_ok = value
        .get("model")
        .and_then(|m| m.as_str())
        .is_some_and(|m| !m.trim().is_empty());
    if !model_ok {
        return Err(ApiError::invalid_request("model is required"));
    }
    serde_json::from_value(value)
        .map_err(|err| ApiError::invalid_request(format!("malformed request: {err}")))
}

fn check_model_scope(auth: &AuthContext, model: &str) -> Result<(), ApiError> {
    if let Some(token) = &auth.token {
        if !TokenRegistry::check_model_access(token, model) {
            return Err(ApiError::permission(format!(
                "token is not allowed to use model '{model}'"
            )));
        }
    }
    Ok(())
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<JsonValue, ApiError> {
    serde_json::to_value(value).map_err(|err| ApiError::server(err.to_string()))
}

fn expect_bytes(body: UpstreamBody) -> Result<Bytes, ApiError> {
    match body {
        UpstreamBody::Bytes(bytes) => Ok(bytes),
        UpstreamBody::Stream(_) => Err(ApiError::server("unexpected streaming upstream body")),
    }
}

fn parse_upstream<T: DeserializeOwned>(
    state: &Arc<AppState>,
    backend: &crate::proxy::BackendRef,
    bytes: &Bytes,
) -> Result<T, ApiError> {
    serde_json::from_slice(bytes).map_err(|err| {
        state
            .engine
            .record_failure(backend, &format!("undecodable upstream body: {err}"));
        ApiError::upstream(
            StatusCode::BAD_GATEWAY,
            format!("undecodable upstream response: {err}"),
        )
    })
}

fn record_token_usage(state: &Arc<AppState>, auth: &AuthContext, usage: CompletionUsage) {
    state
        .metrics
        .incr_counter("tokens_prompt", &[], usage.prompt_tokens);
    state
        .metrics
        .incr_counter("tokens_completion", &[], usage.completion_tokens);
    if let Some(token_id) = auth.token_id() {
        state
            .tokens
            .record_usage(token_id, usage.prompt_tokens, usage.completion_tokens);
    }
}

/// Hand the upstream body to the relay and wrap its output channel as an
/// SSE response. Headers go out immediately; clients treat them as the
/// liveness signal.
fn stream_response(
    state: &Arc<AppState>,
    success: ProxySuccess,
    translator: StreamTranslator,
    auth: &AuthContext,
) -> Response {
    let upstream_rx = match success.body {
        UpstreamBody::Stream(rx) => rx,
        // A buffered 2xx body still relays; the parser treats it as one
        // burst of lines.
        UpstreamBody::Bytes(bytes) => {
            let (tx, rx) = mpsc::channel(1);
            let _ = tx.try_send(Ok(bytes));
            rx
        }
    };

    let rx = spawn_relay(
        Arc::clone(state),
        success.backend,
        upstream_rx,
        translator,
        auth.token_id().map(str::to_string),
    );

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Response::new(Body::from_stream(stream));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

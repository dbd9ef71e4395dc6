use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use oproxy_pool::{
    api_url, ChannelRegistry, ConcurrencyGuard, KeyRegistry, Selector, StatsRegistry,
};

use crate::error::ApiError;
use crate::services::MetricsSink;
use crate::upstream::{UpstreamBody, UpstreamClient, UpstreamRequest};

const ERROR_SNIPPET_BYTES: usize = 200;

/// The backend a request was routed to, carried through response handling
/// so success/failure lands on the right counters. For channel-routed
/// requests the held concurrency slot rides along and frees on drop.
#[derive(Debug)]
pub struct BackendRef {
    pub id: String,
    pub from_channel: bool,
    _guard: Option<ConcurrencyGuard>,
}

#[derive(Debug)]
pub struct ProxySuccess {
    pub backend: BackendRef,
    pub status: u16,
    pub body: UpstreamBody,
}

/// Owns backend resolution, the retry envelope, and failure bookkeeping.
pub struct ProxyEngine {
    selector: Selector,
    keys: Arc<KeyRegistry>,
    channels: Arc<ChannelRegistry>,
    stats: Arc<StatsRegistry>,
    client: Arc<dyn UpstreamClient>,
    metrics: Arc<dyn MetricsSink>,
    max_retries: u32,
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl ProxyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: Arc<KeyRegistry>,
        channels: Arc<ChannelRegistry>,
        stats: Arc<StatsRegistry>,
        client: Arc<dyn UpstreamClient>,
        metrics: Arc<dyn MetricsSink>,
        max_retries: u32,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            selector: Selector::new(Arc::clone(&keys), Arc::clone(&channels)),
            keys,
            channels,
            stats,
            client,
            metrics,
            max_retries,
            connect_timeout,
            request_timeout,
        }
    }

    /// Forward an Ollama-dialect call, rotating backends on failure.
    ///
    /// At most `max_retries + 1` upstream attempts. Upstream 401/403 rotate
    /// to another backend (operator keys expire independently); other HTTP
    /// errors surface immediately; transport errors retry until the budget
    /// runs out and then map to 504.
    pub async fn dispatch(
        &self,
        path: &str,
        body: Option<JsonValue>,
        model: &str,
        is_stream: bool,
    ) -> Result<ProxySuccess, ApiError> {
        let mut attempt = 0;
        loop {
            let Some(selection) = self.selector.select(model) else {
                return Err(ApiError::no_backends());
            };

            let mut body_value = body.clone();
            if let Some(JsonValue::Object(map)) = body_value.as_mut() {
                if map.contains_key("model") && selection.model != model {
                    map.insert(
                        "model".to_string(),
                        JsonValue::String(selection.model.clone()),
                    );
                }
            }
            let body_bytes = match body_value {
                Some(value) => match serde_json::to_vec(&value) {
                    Ok(bytes) => Some(Bytes::from(bytes)),
                    Err(err) => return Err(ApiError::server(err.to_string())),
                },
                None => None,
            };

            let backend = BackendRef {
                id: selection.backend_id.clone(),
                from_channel: selection.from_channel,
                _guard: selection.guard,
            };
            let request = UpstreamRequest {
                url: api_url(&selection.base_url, path),
                bearer: selection.key.clone(),
                body: body_bytes,
                is_stream,
                timeout: if is_stream {
                    self.connect_timeout
                } else {
                    self.request_timeout
                },
            };

            debug!(
                backend = %backend.id,
                url = %request.url,
                attempt,
                is_stream,
                "forwarding upstream"
            );

            match self.client.send(request).await {
                Err(failure) => {
                    self.record_failure(&backend, &failure.message);
                    self.metrics
                        .incr_counter("upstream_error", &[("class", "transport")], 1);
                    warn!(
                        backend = %backend.id,
                        attempt,
                        error = %failure.message,
                        "upstream transport failure"
                    );
                    if attempt < self.max_retries {
                        attempt += 1;
                        continue;
                    }
                    return Err(ApiError::gateway_timeout(format!(
                        "upstream unreachable after {} attempts: {}",
                        attempt + 1,
                        failure.message
                    )));
                }
                Ok(response) if (200..300).contains(&response.status) => {
                    return Ok(ProxySuccess {
                        backend,
                        status: response.status,
                        body: response.body,
                    });
                }
                Ok(response) => {
                    let snippet = error_snippet(&response.body);
                    let message = format!("HTTP {}: {}", response.status, snippet);
                    self.record_failure(&backend, &message);
                    self.metrics.incr_counter(
                        "upstream_error",
                        &[("class", status_class(response.status))],
                        1,
                    );
                    let rotate = matches!(response.status, 401 | 403);
                    if rotate && attempt < self.max_retries {
                        warn!(
                            backend = %backend.id,
                            attempt,
                            status = response.status,
                            "upstream auth rejection; rotating backend"
                        );
                        attempt += 1;
                        continue;
                    }
                    let status = StatusCode::from_u16(response.status)
                        .unwrap_or(StatusCode::BAD_GATEWAY);
                    return Err(ApiError::upstream(status, message));
                }
            }
        }
    }

    pub fn record_success(&self, backend: &BackendRef) {
        if backend.from_channel {
            self.channels.record_success(&backend.id);
        } else {
            self.keys.record_success(&backend.id);
        }
        self.stats.record(&backend.id, true);
    }

    pub fn record_failure(&self, backend: &BackendRef, error: &str) {
        if backend.from_channel {
            self.channels.record_failure(&backend.id, error);
        } else {
            self.keys.record_failure(&backend.id, error);
        }
        self.stats.record(&backend.id, false);
    }
}

fn error_snippet(body: &UpstreamBody) -> String {
    match body {
        UpstreamBody::Bytes(bytes) => {
            let cut = bytes.len().min(ERROR_SNIPPET_BYTES);
            String::from_utf8_lossy(&bytes[..cut]).into_owned()
        }
        UpstreamBody::Stream(_) => String::new(),
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "other",
    }
}

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::debug;

use oproxy_protocol::error::{ErrorBody, ErrorKind};
use oproxy_protocol::ndjson::LineParser;
use oproxy_protocol::ollama::chat::OllamaChatResponse;
use oproxy_protocol::ollama::generate::OllamaGenerateResponse;
use oproxy_protocol::openai::types::CompletionUsage;
use oproxy_transform::stream::{ChatStreamState, GenerateStreamState};

use crate::proxy::BackendRef;
use crate::state::AppState;

const DONE_FRAME: &str = "data: [DONE]\n\n";

pub enum StreamTranslator {
    Chat(ChatStreamState),
    Generate(GenerateStreamState),
}

impl StreamTranslator {
    /// Translate one upstream NDJSON line into an SSE data frame.
    /// Malformed lines yield `None` and are skipped.
    fn translate_line(&mut self, line: &str) -> Option<String> {
        match self {
            StreamTranslator::Chat(state) => {
                let upstream: OllamaChatResponse = serde_json::from_str(line).ok()?;
                let chunk = state.transform_chunk(&upstream);
                serde_json::to_string(&chunk).ok()
            }
            StreamTranslator::Generate(state) => {
                let upstream: OllamaGenerateResponse = serde_json::from_str(line).ok()?;
                let chunk = state.transform_chunk(&upstream);
                serde_json::to_string(&chunk).ok()
            }
        }
    }

    fn completed(&self) -> bool {
        match self {
            StreamTranslator::Chat(state) => state.completed(),
            StreamTranslator::Generate(state) => state.completed(),
        }
    }

    fn final_usage(&self) -> Option<CompletionUsage> {
        match self {
            StreamTranslator::Chat(state) => state.final_usage(),
            StreamTranslator::Generate(state) => state.final_usage(),
        }
    }
}

/// Relay the upstream NDJSON body to the client as `text/event-stream`.
///
/// Guarantees, in order of precedence:
/// - exactly one `[DONE]` per successful stream;
/// - a client disconnect stops the upstream read within one cycle and
///   suppresses both `[DONE]` and success bookkeeping;
/// - mid-stream upstream errors surface as one in-band error frame
///   followed by the terminator, and count as a backend failure.
pub fn spawn_relay(
    state: Arc<AppState>,
    backend: BackendRef,
    mut upstream: mpsc::Receiver<Result<Bytes, String>>,
    mut translator: StreamTranslator,
    token_id: Option<String>,
) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        state.metrics.gauge_add("active_streams", 1);
        let mut parser = LineParser::new();
        let mut aborted = false;
        let mut failed: Option<String> = None;

        'read: while let Some(item) = upstream.recv().await {
            match item {
                Ok(chunk) => {
                    for line in parser.push_bytes(&chunk) {
                        if let Some(error) = upstream_error_line(&line) {
                            failed = Some(error);
                            break 'read;
                        }
                        match translator.translate_line(&line) {
                            Some(frame) => {
                                if send_frame(&tx, &frame).await.is_err() {
                                    aborted = true;
                                    break 'read;
                                }
                            }
                            None => debug!(line = %line, "skipping malformed stream line"),
                        }
                    }
                }
                Err(error) => {
                    failed = Some(error);
                    break 'read;
                }
            }
        }
        // Dropping the receiver stops the upstream reader task.
        drop(upstream);

        if let Some(error) = failed {
            let body = ErrorBody::new(ErrorKind::StreamError, error.clone());
            if let Ok(frame) = serde_json::to_string(&body) {
                let _ = send_frame(&tx, &frame).await;
            }
            let _ = tx.send(Bytes::from_static(DONE_FRAME.as_bytes())).await;
            state.engine.record_failure(&backend, &error);
            state.metrics.gauge_add("active_streams", -1);
            return;
        }

        if !aborted {
            if let Some(line) = parser.finish() {
                if let Some(frame) = translator.translate_line(&line) {
                    if send_frame(&tx, &frame).await.is_err() {
                        aborted = true;
                    }
                }
            }
        }
        if !aborted {
            let _ = tx.send(Bytes::from_static(DONE_FRAME.as_bytes())).await;
        }

        if translator.completed() || !aborted {
            state.engine.record_success(&backend);
            let usage = translator.final_usage().unwrap_or_default();
            state.metrics.incr_counter("tokens_prompt", &[], usage.prompt_tokens);
            state
                .metrics
                .incr_counter("tokens_completion", &[], usage.completion_tokens);
            if let Some(token_id) = token_id {
                state
                    .tokens
                    .record_usage(&token_id, usage.prompt_tokens, usage.completion_tokens);
            }
        }
        state.metrics.gauge_add("active_streams", -1);
    });

    rx
}

async fn send_frame(tx: &mpsc::Sender<Bytes>, payload: &str) -> Result<(), ()> {
    let frame = format!("data: {payload}\n\n");
    tx.send(Bytes::from(frame)).await.map_err(|_| ())
}

/// Ollama reports mid-stream failures as `{"error": "..."}` lines.
fn upstream_error_line(line: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(line).ok()?;
    value
        .get("error")
        .and_then(|e| e.as_str())
        .map(|e| e.to_string())
}

use serde_json::Value as JsonValue;

use oproxy_protocol::ollama::chat::{OllamaChatResponse, OllamaToolCall};
use oproxy_protocol::ollama::embed::OllamaEmbedResponse;
use oproxy_protocol::ollama::generate::OllamaGenerateResponse;
use oproxy_protocol::openai::chat::response::{
    AssistantMessage, ChatCompletionChoice, ChatCompletionObjectType, ChatCompletionResponse,
};
use oproxy_protocol::openai::completions::{
    CompletionChoice, CompletionResponse, TextCompletionObjectType,
};
use oproxy_protocol::openai::embeddings::{
    EmbeddingObject, EmbeddingObjectType, EmbeddingsResponse,
};
use oproxy_protocol::openai::types::{
    CompletionUsage, FinishReason, ListObjectType, ToolCall, ToolCallFunction, ToolCallType,
};

use crate::ids::{new_call_id, new_chat_id, system_fingerprint, unix_now};
use crate::tokens::estimate_tokens;

/// Convert a non-streaming Ollama chat reply into an OpenAI chat completion.
///
/// `prompt_fallback_text` is the concatenated user-message text, consulted
/// only when the upstream omits `prompt_eval_count`.
pub fn transform_chat_response(
    upstream: &OllamaChatResponse,
    requested_model: &str,
    prompt_fallback_text: &str,
) -> ChatCompletionResponse {
    let model = upstream
        .model
        .clone()
        .unwrap_or_else(|| requested_model.to_string());

    let message = upstream.message.as_ref();
    let content = message.map(|m| m.content.clone()).unwrap_or_default();
    let reasoning_content = message.and_then(|m| m.thinking.clone());
    let tool_calls = message
        .and_then(|m| m.tool_calls.as_ref())
        .map(|calls| map_tool_calls(calls));
    let has_tool_calls = tool_calls.as_ref().is_some_and(|calls| !calls.is_empty());

    let prompt_tokens = upstream
        .prompt_eval_count
        .unwrap_or_else(|| estimate_tokens(prompt_fallback_text));
    let completion_tokens = upstream
        .eval_count
        .unwrap_or_else(|| estimate_tokens(&content));

    ChatCompletionResponse {
        id: new_chat_id(),
        object: ChatCompletionObjectType::ChatCompletion,
        created: unix_now(),
        model: model.clone(),
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: AssistantMessage {
                role: "assistant".to_string(),
                content,
                tool_calls,
                reasoning_content,
            },
            finish_reason: map_finish_reason(upstream.done_reason.as_deref(), has_tool_calls),
        }],
        usage: CompletionUsage::new(prompt_tokens, completion_tokens),
        system_fingerprint: system_fingerprint(&model),
    }
}

pub fn map_tool_calls(calls: &[OllamaToolCall]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .map(|(index, call)| ToolCall {
            id: new_call_id(),
            index: index as i64,
            kind: ToolCallType::Function,
            function: ToolCallFunction {
                name: call.function.name.clone(),
                arguments: arguments_to_string(&call.function.arguments),
            },
        })
        .collect()
}

fn arguments_to_string(arguments: &JsonValue) -> String {
    match arguments {
        JsonValue::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "{}".to_string()),
    }
}

/// Tool calls override everything else; `length` is the only reason Ollama
/// reports that OpenAI distinguishes from a normal stop.
pub fn map_finish_reason(done_reason: Option<&str>, has_tool_calls: bool) -> FinishReason {
    if has_tool_calls {
        return FinishReason::ToolCalls;
    }
    match done_reason {
        Some("length") => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

/// Convert an Ollama generate reply into an OpenAI text completion.
pub fn transform_generate_response(
    upstream: &OllamaGenerateResponse,
    requested_model: &str,
    prompt_fallback_text: &str,
) -> CompletionResponse {
    let model = upstream
        .model
        .clone()
        .unwrap_or_else(|| requested_model.to_string());
    let text = upstream.response.clone().unwrap_or_default();

    let prompt_tokens = upstream
        .prompt_eval_count
        .unwrap_or_else(|| estimate_tokens(prompt_fallback_text));
    let completion_tokens = upstream.eval_count.unwrap_or_else(|| estimate_tokens(&text));

    CompletionResponse {
        id: new_chat_id(),
        object: TextCompletionObjectType::TextCompletion,
        created: unix_now(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text,
            finish_reason: Some(if upstream.done { "stop" } else { "length" }.to_string()),
        }],
        usage: Some(CompletionUsage::new(prompt_tokens, completion_tokens)),
    }
}

/// Convert an Ollama embed reply. Both the modern `embeddings` array and the
/// legacy scalar `embedding` are accepted; neither yields an empty list.
pub fn transform_embeddings_response(
    upstream: &OllamaEmbedResponse,
    requested_model: &str,
) -> EmbeddingsResponse {
    let vectors: Vec<JsonValue> = match (&upstream.embeddings, &upstream.embedding) {
        (Some(embeddings), _) if !embeddings.is_empty() => embeddings.clone(),
        (_, Some(embedding)) => vec![embedding.clone()],
        _ => Vec::new(),
    };

    let data = vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| EmbeddingObject {
            object: EmbeddingObjectType::Embedding,
            index: index as i64,
            embedding,
        })
        .collect();

    EmbeddingsResponse {
        object: ListObjectType::List,
        data,
        model: upstream
            .model
            .clone()
            .unwrap_or_else(|| requested_model.to_string()),
        usage: CompletionUsage::new(upstream.prompt_eval_count.unwrap_or(0), 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oproxy_protocol::ollama::chat::{OllamaChatMessage, OllamaToolCallFunction};
    use serde_json::json;

    fn assistant_reply(content: &str) -> OllamaChatResponse {
        OllamaChatResponse {
            model: Some("llama3".to_string()),
            message: Some(OllamaChatMessage {
                role: "assistant".to_string(),
                content: content.to_string(),
                images: None,
                thinking: None,
                tool_calls: None,
                tool_call_id: None,
            }),
            done: true,
            done_reason: Some("stop".to_string()),
            prompt_eval_count: Some(12),
            eval_count: Some(34),
            ..Default::default()
        }
    }

    #[test]
    fn response_uses_upstream_counts_when_present() {
        let out = transform_chat_response(&assistant_reply("hello"), "fallback", "");
        assert_eq!(out.usage.prompt_tokens, 12);
        assert_eq!(out.usage.completion_tokens, 34);
        assert_eq!(out.usage.total_tokens, 46);
        assert_eq!(out.model, "llama3");
        assert_eq!(out.system_fingerprint, "fp_ollama_llama3");
        assert!(out.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn missing_counts_fall_back_to_estimates() {
        let mut reply = assistant_reply("four char quad");
        reply.prompt_eval_count = None;
        reply.eval_count = None;
        let out = transform_chat_response(&reply, "llama3", "user said this");
        assert_eq!(out.usage.prompt_tokens, estimate_tokens("user said this"));
        assert_eq!(out.usage.completion_tokens, estimate_tokens("four char quad"));
    }

    #[test]
    fn tool_calls_override_finish_reason() {
        let mut reply = assistant_reply("");
        reply.done_reason = Some("length".to_string());
        reply.message.as_mut().unwrap().tool_calls = Some(vec![OllamaToolCall {
            function: OllamaToolCallFunction {
                name: "lookup".to_string(),
                arguments: json!({"q": "rust"}),
            },
        }]);
        let out = transform_chat_response(&reply, "llama3", "");
        assert_eq!(out.choices[0].finish_reason, FinishReason::ToolCalls);
        let calls = out.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "lookup");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"rust\"}");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[test]
    fn finish_reason_table() {
        assert_eq!(map_finish_reason(Some("stop"), false), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("load"), false), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("unload"), false), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length"), false), FinishReason::Length);
        assert_eq!(map_finish_reason(None, false), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("other"), false), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length"), true), FinishReason::ToolCalls);
    }

    #[test]
    fn thinking_surfaces_as_reasoning_content() {
        let mut reply = assistant_reply("answer");
        reply.message.as_mut().unwrap().thinking = Some("chain".to_string());
        let out = transform_chat_response(&reply, "llama3", "");
        assert_eq!(
            out.choices[0].message.reasoning_content.as_deref(),
            Some("chain")
        );
    }

    #[test]
    fn embeddings_empty_upstream_yields_empty_data() {
        let out = transform_embeddings_response(&OllamaEmbedResponse::default(), "m");
        assert!(out.data.is_empty());
    }

    #[test]
    fn embeddings_scalar_is_wrapped() {
        let upstream = OllamaEmbedResponse {
            embedding: Some(json!([0.1, 0.2])),
            ..Default::default()
        };
        let out = transform_embeddings_response(&upstream, "m");
        assert_eq!(out.data.len(), 1);
        assert_eq!(out.data[0].embedding, json!([0.1, 0.2]));
        assert_eq!(out.data[0].index, 0);
    }

    #[test]
    fn embeddings_array_is_enumerated() {
        let upstream = OllamaEmbedResponse {
            embeddings: Some(vec![json!([0.1]), json!([0.2])]),
            ..Default::default()
        };
        let out = transform_embeddings_response(&upstream, "m");
        assert_eq!(out.data.len(), 2);
        assert_eq!(out.data[1].index, 1);
    }

    #[test]
    fn generate_response_maps_done_to_stop() {
        let upstream = OllamaGenerateResponse {
            response: Some("text".to_string()),
            done: true,
            ..Default::default()
        };
        let out = transform_generate_response(&upstream, "llama3", "");
        assert_eq!(out.choices[0].text, "text");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("stop"));
    }
}

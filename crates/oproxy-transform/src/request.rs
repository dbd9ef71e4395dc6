use serde_json::{json, Map, Value as JsonValue};

use oproxy_protocol::ollama::chat::{
    OllamaChatMessage, OllamaChatRequest, OllamaTool, OllamaToolCall, OllamaToolCallFunction,
};
use oproxy_protocol::ollama::embed::OllamaEmbedRequest;
use oproxy_protocol::ollama::generate::OllamaGenerateRequest;
use oproxy_protocol::openai::chat::request::{ChatCompletionRequest, ChatMessage, MessageContent};
use oproxy_protocol::openai::completions::CompletionRequest;
use oproxy_protocol::openai::embeddings::EmbeddingsRequest;

/// Convert an OpenAI chat-completions request into an Ollama chat request.
pub fn transform_chat_request(request: &ChatCompletionRequest) -> OllamaChatRequest {
    let messages = request.messages.iter().map(map_message).collect();

    let options = chat_options(request);
    let format = map_response_format(request);
    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| OllamaTool {
                kind: tool.kind.clone().unwrap_or_else(|| "function".to_string()),
                function: tool.function.clone().unwrap_or(JsonValue::Null),
            })
            .collect()
    });

    OllamaChatRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream.unwrap_or(false),
        tools,
        options: if options.is_empty() { None } else { Some(options) },
        format,
        think: request.think.clone(),
        keep_alive: request.keep_alive.clone(),
    }
}

fn map_message(message: &ChatMessage) -> OllamaChatMessage {
    let (content, images) = match message.role.as_str() {
        // Tool replies carry results; objects are serialized, not flattened.
        "tool" => (tool_reply_content(message.content.as_ref()), None),
        _ => flatten_content(message.content.as_ref()),
    };

    let tool_calls = message.tool_calls.as_ref().map(|calls| {
        calls
            .iter()
            .map(|call| OllamaToolCall {
                function: OllamaToolCallFunction {
                    name: call.function.name.clone(),
                    arguments: canonical_arguments(call.function.arguments.as_ref()),
                },
            })
            .collect()
    });

    OllamaChatMessage {
        role: message.role.clone(),
        content,
        images,
        thinking: None,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

/// Text parts joined with newlines; image parts collected separately.
/// Data-URL images are reduced to their base64 payload.
fn flatten_content(content: Option<&MessageContent>) -> (String, Option<Vec<String>>) {
    match content {
        None => (String::new(), None),
        Some(MessageContent::Text(text)) => (text.clone(), None),
        Some(MessageContent::Parts(parts)) => {
            let mut texts = Vec::new();
            let mut images = Vec::new();
            for part in parts {
                if let Some(text) = &part.text {
                    texts.push(text.clone());
                }
                if let Some(image) = &part.image_url {
                    images.push(extract_image_payload(image.url()));
                }
            }
            let images = if images.is_empty() { None } else { Some(images) };
            (texts.join("\n"), images)
        }
        Some(MessageContent::Other(value)) => (stringify_scalar(value), None),
    }
}

fn tool_reply_content(content: Option<&MessageContent>) -> String {
    match content {
        None => String::new(),
        Some(MessageContent::Text(text)) => text.clone(),
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| part.text.clone())
            .collect::<Vec<_>>()
            .join("\n"),
        Some(MessageContent::Other(value)) => match value {
            JsonValue::Null => String::new(),
            JsonValue::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        },
    }
}

fn stringify_scalar(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn extract_image_payload(url: &str) -> String {
    if url.starts_with("data:image/") {
        if let Some(pos) = url.find(";base64,") {
            return url[pos + ";base64,".len()..].to_string();
        }
    }
    url.to_string()
}

/// Tool-call arguments are canonicalized to an object: strings are parsed
/// as JSON (empty object on failure), objects pass through.
fn canonical_arguments(arguments: Option<&JsonValue>) -> JsonValue {
    match arguments {
        Some(JsonValue::String(raw)) => {
            serde_json::from_str(raw).unwrap_or_else(|_| json!({}))
        }
        Some(JsonValue::Object(map)) => JsonValue::Object(map.clone()),
        _ => json!({}),
    }
}

fn chat_options(request: &ChatCompletionRequest) -> Map<String, JsonValue> {
    let mut options = Map::new();
    insert_f64(&mut options, "temperature", request.temperature);
    insert_f64(&mut options, "top_p", request.top_p);
    insert_i64(&mut options, "top_k", request.top_k);
    insert_i64(&mut options, "seed", request.seed);
    if let Some(stop) = &request.stop {
        options.insert("stop".to_string(), stop.clone());
    }
    insert_f64(&mut options, "frequency_penalty", request.frequency_penalty);
    insert_f64(&mut options, "presence_penalty", request.presence_penalty);
    insert_i64(&mut options, "num_ctx", request.num_ctx);
    insert_f64(&mut options, "repeat_penalty", request.repeat_penalty);
    // max_completion_tokens supersedes the deprecated max_tokens.
    if let Some(limit) = request.max_completion_tokens.or(request.max_tokens) {
        options.insert("num_predict".to_string(), json!(limit));
    }
    options
}

fn map_response_format(request: &ChatCompletionRequest) -> Option<JsonValue> {
    let format = request.response_format.as_ref()?;
    match format.kind.as_str() {
        "json_object" => Some(JsonValue::String("json".to_string())),
        "json_schema" => format
            .json_schema
            .as_ref()
            .and_then(|js| js.schema.clone())
            .filter(JsonValue::is_object),
        _ => None,
    }
}

/// Convert an OpenAI completions request into an Ollama generate request.
pub fn transform_completion_request(request: &CompletionRequest) -> OllamaGenerateRequest {
    let prompt = match &request.prompt {
        None => String::new(),
        Some(JsonValue::String(text)) => text.clone(),
        Some(JsonValue::Null) => String::new(),
        Some(other) => other.to_string(),
    };

    let mut options = Map::new();
    insert_f64(&mut options, "temperature", request.temperature);
    insert_f64(&mut options, "top_p", request.top_p);
    insert_i64(&mut options, "seed", request.seed);
    if let Some(stop) = &request.stop {
        options.insert("stop".to_string(), stop.clone());
    }
    insert_f64(&mut options, "frequency_penalty", request.frequency_penalty);
    insert_f64(&mut options, "presence_penalty", request.presence_penalty);
    if let Some(limit) = request.max_tokens {
        options.insert("num_predict".to_string(), json!(limit));
    }

    OllamaGenerateRequest {
        model: request.model.clone(),
        prompt,
        stream: request.stream.unwrap_or(false),
        suffix: request.suffix.clone(),
        options: if options.is_empty() { None } else { Some(options) },
    }
}

/// Convert an OpenAI embeddings request; a bare string becomes a
/// single-element input sequence.
pub fn transform_embeddings_request(request: &EmbeddingsRequest) -> OllamaEmbedRequest {
    let input = match &request.input {
        JsonValue::Array(items) => items.clone(),
        other => vec![other.clone()],
    };
    OllamaEmbedRequest {
        model: request.model.clone(),
        input,
    }
}

/// Concatenation of user-message texts, the estimator input for prompt
/// tokens when the upstream omits `prompt_eval_count`.
pub fn user_prompt_text(request: &ChatCompletionRequest) -> String {
    let mut out = String::new();
    for message in &request.messages {
        if message.role != "user" {
            continue;
        }
        let (text, _) = flatten_content(message.content.as_ref());
        out.push_str(&text);
    }
    out
}

fn insert_f64(options: &mut Map<String, JsonValue>, key: &str, value: Option<f64>) {
    if let Some(v) = value {
        options.insert(key.to_string(), json!(v));
    }
}

fn insert_i64(options: &mut Map<String, JsonValue>, key: &str, value: Option<i64>) {
    if let Some(v) = value {
        options.insert(key.to_string(), json!(v));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oproxy_protocol::openai::chat::request::{ContentPart, ImageUrl};
    use oproxy_protocol::openai::types::{
        JsonSchemaFormat, RequestToolCall, RequestToolCallFunction, ResponseFormat,
    };

    fn user_text(text: &str) -> ChatMessage {
        ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Text(text.to_string())),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn base_request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "llama3".to_string(),
            messages,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            seed: None,
            stop: None,
            frequency_penalty: None,
            presence_penalty: None,
            num_ctx: None,
            repeat_penalty: None,
            max_tokens: None,
            max_completion_tokens: None,
            response_format: None,
            tools: None,
            think: None,
            keep_alive: None,
        }
    }

    #[test]
    fn stream_defaults_to_false() {
        let out = transform_chat_request(&base_request(vec![user_text("hi")]));
        assert!(!out.stream);
    }

    #[test]
    fn multimodal_parts_concatenate_and_extract_base64() {
        let message = ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(vec![
                ContentPart {
                    kind: "text".to_string(),
                    text: Some("A".to_string()),
                    image_url: None,
                },
                ContentPart {
                    kind: "image_url".to_string(),
                    text: None,
                    image_url: Some(ImageUrl::Detailed(
                        oproxy_protocol::openai::chat::request::ImageUrlObject {
                            url: "data:image/png;base64,iVBORw0".to_string(),
                            detail: None,
                        },
                    )),
                },
                ContentPart {
                    kind: "text".to_string(),
                    text: Some("B".to_string()),
                    image_url: None,
                },
            ])),
            tool_calls: None,
            tool_call_id: None,
        };
        let out = transform_chat_request(&base_request(vec![message]));
        let msg = &out.messages[0];
        assert_eq!(msg.content, "A\nB");
        assert_eq!(msg.images.as_deref(), Some(&["iVBORw0".to_string()][..]));
    }

    #[test]
    fn plain_http_image_url_is_kept_verbatim() {
        let message = ChatMessage {
            role: "user".to_string(),
            content: Some(MessageContent::Parts(vec![ContentPart {
                kind: "image_url".to_string(),
                text: None,
                image_url: Some(ImageUrl::Plain("https://example.com/cat.png".to_string())),
            }])),
            tool_calls: None,
            tool_call_id: None,
        };
        let out = transform_chat_request(&base_request(vec![message]));
        assert_eq!(
            out.messages[0].images.as_deref(),
            Some(&["https://example.com/cat.png".to_string()][..])
        );
    }

    #[test]
    fn null_content_becomes_empty_string() {
        let message = ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: None,
            tool_call_id: None,
        };
        let out = transform_chat_request(&base_request(vec![message]));
        assert_eq!(out.messages[0].content, "");
    }

    #[test]
    fn string_tool_arguments_are_parsed_to_objects() {
        let message = ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![RequestToolCall {
                id: Some("call_x".to_string()),
                kind: Some("function".to_string()),
                function: RequestToolCallFunction {
                    name: "get_weather".to_string(),
                    arguments: Some(json!("{\"city\":\"Tokyo\"}")),
                },
            }]),
            tool_call_id: None,
        };
        let out = transform_chat_request(&base_request(vec![message]));
        let call = &out.messages[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.name, "get_weather");
        assert_eq!(call.function.arguments, json!({"city": "Tokyo"}));
    }

    #[test]
    fn malformed_tool_arguments_fall_back_to_empty_object() {
        let message = ChatMessage {
            role: "assistant".to_string(),
            content: None,
            tool_calls: Some(vec![RequestToolCall {
                id: None,
                kind: None,
                function: RequestToolCallFunction {
                    name: "f".to_string(),
                    arguments: Some(json!("{not json")),
                },
            }]),
            tool_call_id: None,
        };
        let out = transform_chat_request(&base_request(vec![message]));
        let call = &out.messages[0].tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.function.arguments, json!({}));
    }

    #[test]
    fn tool_reply_objects_are_serialized() {
        let message = ChatMessage {
            role: "tool".to_string(),
            content: Some(MessageContent::Other(json!({"ok": true}))),
            tool_calls: None,
            tool_call_id: Some("call_1".to_string()),
        };
        let out = transform_chat_request(&base_request(vec![message]));
        assert_eq!(out.messages[0].content, "{\"ok\":true}");
        assert_eq!(out.messages[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn max_completion_tokens_wins_over_max_tokens() {
        let mut request = base_request(vec![user_text("hi")]);
        request.max_tokens = Some(10);
        request.max_completion_tokens = Some(20);
        let out = transform_chat_request(&request);
        assert_eq!(out.options.unwrap()["num_predict"], json!(20));
    }

    #[test]
    fn options_copied_only_when_present() {
        let mut request = base_request(vec![user_text("hi")]);
        request.temperature = Some(0.7);
        request.seed = Some(42);
        let out = transform_chat_request(&request);
        let options = out.options.unwrap();
        assert_eq!(options["temperature"], json!(0.7));
        assert_eq!(options["seed"], json!(42));
        assert!(!options.contains_key("top_p"));
        assert!(!options.contains_key("num_predict"));
    }

    #[test]
    fn json_object_format_maps_to_json_string() {
        let mut request = base_request(vec![user_text("hi")]);
        request.response_format = Some(ResponseFormat {
            kind: "json_object".to_string(),
            json_schema: None,
        });
        let out = transform_chat_request(&request);
        assert_eq!(out.format, Some(json!("json")));
    }

    #[test]
    fn json_schema_format_passes_schema_through() {
        let schema = json!({"type": "object", "properties": {"a": {"type": "string"}}});
        let mut request = base_request(vec![user_text("hi")]);
        request.response_format = Some(ResponseFormat {
            kind: "json_schema".to_string(),
            json_schema: Some(JsonSchemaFormat {
                name: None,
                schema: Some(schema.clone()),
                strict: None,
            }),
        });
        let out = transform_chat_request(&request);
        assert_eq!(out.format, Some(schema));
    }

    #[test]
    fn unknown_response_format_is_omitted() {
        let mut request = base_request(vec![user_text("hi")]);
        request.response_format = Some(ResponseFormat {
            kind: "text".to_string(),
            json_schema: None,
        });
        let out = transform_chat_request(&request);
        assert_eq!(out.format, None);
    }

    #[test]
    fn tool_type_defaults_to_function() {
        let mut request = base_request(vec![user_text("hi")]);
        request.tools = Some(vec![oproxy_protocol::openai::types::ToolDefinition {
            kind: None,
            function: Some(json!({"name": "f"})),
        }]);
        let out = transform_chat_request(&request);
        assert_eq!(out.tools.unwrap()[0].kind, "function");
    }

    #[test]
    fn completion_prompt_defaults_to_empty() {
        let request = CompletionRequest {
            model: "llama3".to_string(),
            prompt: None,
            suffix: None,
            stream: None,
            temperature: None,
            top_p: None,
            seed: None,
            stop: None,
            frequency_penalty: None,
            presence_penalty: None,
            max_tokens: None,
        };
        let out = transform_completion_request(&request);
        assert_eq!(out.prompt, "");
        assert!(!out.stream);
    }

    #[test]
    fn embeddings_string_input_is_wrapped() {
        let request = EmbeddingsRequest {
            model: "nomic-embed-text".to_string(),
            input: json!("hello"),
        };
        let out = transform_embeddings_request(&request);
        assert_eq!(out.input, vec![json!("hello")]);
    }

    #[test]
    fn embeddings_array_input_is_preserved() {
        let request = EmbeddingsRequest {
            model: "nomic-embed-text".to_string(),
            input: json!(["a", "b"]),
        };
        let out = transform_embeddings_request(&request);
        assert_eq!(out.input, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn user_prompt_text_skips_other_roles() {
        let mut messages = vec![user_text("one")];
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Some(MessageContent::Text("ignored".to_string())),
            tool_calls: None,
            tool_call_id: None,
        });
        messages.push(user_text("two"));
        let request = base_request(messages);
        assert_eq!(user_prompt_text(&request), "onetwo");
    }
}

use oproxy_protocol::ollama::chat::OllamaChatResponse;
use oproxy_protocol::ollama::generate::OllamaGenerateResponse;
use oproxy_protocol::openai::chat::stream::{
    ChatCompletionChunk, ChatCompletionChunkChoice, ChatCompletionChunkObjectType,
    ChatCompletionDelta,
};
use oproxy_protocol::openai::completions::{
    CompletionChoice, CompletionResponse, TextCompletionObjectType,
};
use oproxy_protocol::openai::types::CompletionUsage;

use crate::ids::{new_chat_id, unix_now};
use crate::response::{map_finish_reason, map_tool_calls};

/// Per-stream translator for chat completions.
///
/// The identity triple is fixed at stream start so every chunk shares one
/// `id`/`created`/`model`. `content_chunks` counts non-empty content deltas
/// (one per chunk, not per token) and stands in for `eval_count` when the
/// terminal line omits it. It is never a substitute for `prompt_eval_count`.
#[derive(Debug, Clone)]
pub struct ChatStreamState {
    chat_id: String,
    created: i64,
    model: String,
    first_chunk: bool,
    content_chunks: u64,
    usage: Option<CompletionUsage>,
    completed: bool,
}

impl ChatStreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            chat_id: new_chat_id(),
            created: unix_now(),
            model: model.into(),
            first_chunk: true,
            content_chunks: 0,
            usage: None,
            completed: false,
        }
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Usage captured from the terminal chunk, if one was seen.
    pub fn final_usage(&self) -> Option<CompletionUsage> {
        self.usage
    }

    pub fn transform_chunk(&mut self, upstream: &OllamaChatResponse) -> ChatCompletionChunk {
        if let Some(model) = &upstream.model {
            self.model = model.clone();
        }

        let mut delta = ChatCompletionDelta::default();
        if self.first_chunk {
            delta.role = Some("assistant".to_string());
            self.first_chunk = false;
        }

        let message = upstream.message.as_ref();
        if let Some(content) = message.map(|m| m.content.as_str()) {
            if !content.is_empty() {
                delta.content = Some(content.to_string());
                self.content_chunks += 1;
            }
        }
        if let Some(thinking) = message.and_then(|m| m.thinking.clone()) {
            delta.reasoning_content = Some(thinking);
        }
        let has_tool_calls = if let Some(calls) = message.and_then(|m| m.tool_calls.as_ref()) {
            delta.tool_calls = Some(map_tool_calls(calls));
            !calls.is_empty()
        } else {
            false
        };

        let (finish_reason, usage) = if upstream.done {
            self.completed = true;
            let usage = CompletionUsage::new(
                upstream.prompt_eval_count.unwrap_or(0),
                upstream.eval_count.unwrap_or(self.content_chunks),
            );
            self.usage = Some(usage);
            (
                Some(map_finish_reason(upstream.done_reason.as_deref(), has_tool_calls)),
                Some(usage),
            )
        } else {
            (None, None)
        };

        ChatCompletionChunk {
            id: self.chat_id.clone(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatCompletionChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

/// Per-stream translator for text completions.
#[derive(Debug, Clone)]
pub struct GenerateStreamState {
    id: String,
    created: i64,
    model: String,
    content_chunks: u64,
    usage: Option<CompletionUsage>,
    completed: bool,
}

impl GenerateStreamState {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: new_chat_id(),
            created: unix_now(),
            model: model.into(),
            content_chunks: 0,
            usage: None,
            completed: false,
        }
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    pub fn final_usage(&self) -> Option<CompletionUsage> {
        self.usage
    }

    pub fn transform_chunk(&mut self, upstream: &OllamaGenerateResponse) -> CompletionResponse {
        if let Some(model) = &upstream.model {
            self.model = model.clone();
        }
        let text = upstream.response.clone().unwrap_or_default();
        if !text.is_empty() {
            self.content_chunks += 1;
        }

        let (finish_reason, usage) = if upstream.done {
            self.completed = true;
            let usage = CompletionUsage::new(
                upstream.prompt_eval_count.unwrap_or(0),
                upstream.eval_count.unwrap_or(self.content_chunks),
            );
            self.usage = Some(usage);
            (Some("stop".to_string()), Some(usage))
        } else {
            (None, None)
        };

        CompletionResponse {
            id: self.id.clone(),
            object: TextCompletionObjectType::TextCompletion,
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                text,
                finish_reason,
            }],
            usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oproxy_protocol::ollama::chat::{
        OllamaChatMessage, OllamaToolCall, OllamaToolCallFunction,
    };
    use oproxy_protocol::openai::types::FinishReason;
    use serde_json::json;

    fn content_chunk(content: &str) -> OllamaChatResponse {
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
            done: false,
            ..Default::default()
        }
    }

    fn done_chunk() -> OllamaChatResponse {
        OllamaChatResponse {
            done: true,
            done_reason: Some("stop".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn first_chunk_carries_assistant_role() {
        let mut state = ChatStreamState::new("llama3");
        let first = state.transform_chunk(&content_chunk("h"));
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));
        let second = state.transform_chunk(&content_chunk("i"));
        assert_eq!(second.choices[0].delta.role, None);
    }

    #[test]
    fn identity_triple_is_stable_across_chunks() {
        let mut state = ChatStreamState::new("llama3");
        let a = state.transform_chunk(&content_chunk("h"));
        let b = state.transform_chunk(&content_chunk("i"));
        assert_eq!(a.id, b.id);
        assert_eq!(a.created, b.created);
        assert_eq!(a.model, b.model);
    }

    #[test]
    fn missing_eval_counts_fall_back_to_chunk_counter() {
        let mut state = ChatStreamState::new("llama3");
        for _ in 0..3 {
            state.transform_chunk(&content_chunk("h"));
        }
        let last = state.transform_chunk(&done_chunk());
        let usage = last.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 0);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 3);
        assert!(state.completed());
        assert_eq!(state.final_usage(), Some(usage));
    }

    #[test]
    fn empty_content_chunks_do_not_count() {
        let mut state = ChatStreamState::new("llama3");
        state.transform_chunk(&content_chunk("hello"));
        state.transform_chunk(&content_chunk(""));
        let last = state.transform_chunk(&done_chunk());
        assert_eq!(last.usage.unwrap().completion_tokens, 1);
    }

    #[test]
    fn upstream_counts_win_on_terminal_chunk() {
        let mut state = ChatStreamState::new("llama3");
        state.transform_chunk(&content_chunk("h"));
        let mut done = done_chunk();
        done.prompt_eval_count = Some(7);
        done.eval_count = Some(9);
        let last = state.transform_chunk(&done);
        let usage = last.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 9);
        assert_eq!(usage.total_tokens, 16);
    }

    #[test]
    fn non_terminal_chunks_have_no_finish_reason_or_usage() {
        let mut state = ChatStreamState::new("llama3");
        let chunk = state.transform_chunk(&content_chunk("h"));
        assert_eq!(chunk.choices[0].finish_reason, None);
        assert_eq!(chunk.usage, None);
    }

    #[test]
    fn tool_calls_in_terminal_chunk_set_finish_reason() {
        let mut state = ChatStreamState::new("llama3");
        let mut done = done_chunk();
        done.done_reason = Some("length".to_string());
        done.message = Some(OllamaChatMessage {
            role: "assistant".to_string(),
            content: String::new(),
            images: None,
            thinking: None,
            tool_calls: Some(vec![OllamaToolCall {
                function: OllamaToolCallFunction {
                    name: "f".to_string(),
                    arguments: json!({}),
                },
            }]),
            tool_call_id: None,
        });
        let last = state.transform_chunk(&done);
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::ToolCalls));
        assert!(last.choices[0].delta.tool_calls.is_some());
    }

    #[test]
    fn thinking_deltas_pass_through() {
        let mut state = ChatStreamState::new("llama3");
        let mut chunk = content_chunk("");
        chunk.message.as_mut().unwrap().thinking = Some("mull".to_string());
        let out = state.transform_chunk(&chunk);
        assert_eq!(out.choices[0].delta.reasoning_content.as_deref(), Some("mull"));
        assert_eq!(out.choices[0].delta.content, None);
    }

    #[test]
    fn generate_stream_terminal_chunk_attaches_usage() {
        let mut state = GenerateStreamState::new("llama3");
        state.transform_chunk(&OllamaGenerateResponse {
            response: Some("a".to_string()),
            ..Default::default()
        });
        let last = state.transform_chunk(&OllamaGenerateResponse {
            done: true,
            ..Default::default()
        });
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(last.usage.unwrap().completion_tokens, 1);
    }
}

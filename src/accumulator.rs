//! Delta accumulation logic for streaming responses.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::Stream;

use crate::stream::CompletionStream;
use crate::types::{
    ChatCompletionResponse, ChatCompletionStreamResponse, ChatMessage, Choice, FimChoice,
    FimCompletionResponse, FimCompletionStreamResponse, FinishReason, Role, ToolCall, Usage,
};
use crate::Error;

/// Accumulates streamed chat chunks into a complete response.
#[derive(Debug, Default)]
pub struct ChatStreamAccumulator {
    id: String,
    created: u64,
    model: String,
    system_fingerprint: Option<String>,
    /// Per-choice state, keyed by choice index.
    choices: BTreeMap<u32, ChatChoiceState>,
    /// Final usage statistics (if received).
    usage: Option<Usage>,
}

#[derive(Debug, Default)]
struct ChatChoiceState {
    role: Option<Role>,
    content: String,
    reasoning_content: String,
    tool_calls: BTreeMap<u32, ToolCall>,
    finish_reason: Option<FinishReason>,
}

impl ChatStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one streamed chunk into the accumulated response.
    pub fn process_chunk(&mut self, chunk: ChatCompletionStreamResponse) {
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id;
            self.created = chunk.created;
            self.model = chunk.model;
        }
        if chunk.system_fingerprint.is_some() {
            self.system_fingerprint = chunk.system_fingerprint;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            let delta = choice.delta;

            if delta.role.is_some() {
                state.role = delta.role;
            }
            if let Some(content) = delta.content {
                state.content.push_str(&content);
            }
            if let Some(reasoning) = delta.reasoning_content {
                state.reasoning_content.push_str(&reasoning);
            }
            // Fragments of one call share an index; only the first carries the id.
            for fragment in delta.tool_calls.unwrap_or_default() {
                let call = state.tool_calls.entry(fragment.index).or_default();
                if let Some(id) = fragment.id {
                    call.id = id;
                }
                if let Some(kind) = fragment.r#type {
                    call.r#type = kind;
                }
                if let Some(function) = fragment.function {
                    if let Some(name) = function.name {
                        call.function.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        call.function.arguments.push_str(&arguments);
                    }
                }
            }
            if choice.finish_reason.is_some() {
                state.finish_reason = choice.finish_reason;
            }
        }
    }

    /// Content accumulated so far for the first choice.
    pub fn current_content(&self) -> &str {
        self.choices
            .first_key_value()
            .map(|(_, c)| c.content.as_str())
            .unwrap_or_default()
    }

    /// Reasoning content accumulated so far for the first choice.
    pub fn current_reasoning_content(&self) -> &str {
        self.choices
            .first_key_value()
            .map(|(_, c)| c.reasoning_content.as_str())
            .unwrap_or_default()
    }

    /// Finalize and return the complete response.
    pub fn finalize(self) -> ChatCompletionResponse {
        let choices = self
            .choices
            .into_iter()
            .map(|(index, state)| {
                let tool_calls: Vec<ToolCall> = state
                    .tool_calls
                    .into_values()
                    .map(|mut call| {
                        if call.r#type.is_empty() {
                            call.r#type = "function".to_string();
                        }
                        call
                    })
                    .collect();
                Choice {
                    index,
                    message: ChatMessage {
                        role: state.role.unwrap_or(Role::Assistant),
                        content: state.content,
                        reasoning_content: non_empty(state.reasoning_content),
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                        ..Default::default()
                    },
                    finish_reason: state.finish_reason,
                    logprobs: None,
                }
            })
            .collect();

        ChatCompletionResponse {
            id: self.id,
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model,
            choices,
            usage: self.usage,
            system_fingerprint: self.system_fingerprint,
        }
    }
}

/// Accumulates streamed fill-in-middle chunks into a complete response.
#[derive(Debug, Default)]
pub struct FimStreamAccumulator {
    id: String,
    created: u64,
    model: String,
    system_fingerprint: Option<String>,
    choices: BTreeMap<u32, FimChoice>,
    usage: Option<Usage>,
}

impl FimStreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_chunk(&mut self, chunk: FimCompletionStreamResponse) {
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id;
            self.created = chunk.created;
            self.model = chunk.model;
        }
        if chunk.system_fingerprint.is_some() {
            self.system_fingerprint = chunk.system_fingerprint;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let state = self.choices.entry(choice.index).or_default();
            state.index = choice.index;
            state.text.push_str(&choice.text);
            if choice.finish_reason.is_some() {
                state.finish_reason = choice.finish_reason;
            }
        }
    }

    /// Text accumulated so far for the first choice.
    pub fn current_text(&self) -> &str {
        self.choices
            .first_key_value()
            .map(|(_, c)| c.text.as_str())
            .unwrap_or_default()
    }

    pub fn finalize(self) -> FimCompletionResponse {
        FimCompletionResponse {
            id: self.id,
            object: "text_completion".to_string(),
            created: self.created,
            model: self.model,
            choices: self.choices.into_values().collect(),
            usage: self.usage,
            system_fingerprint: self.system_fingerprint,
        }
    }
}

impl<S, E> CompletionStream<ChatCompletionStreamResponse, S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Error>,
{
    /// Drive the session to the end and return the assembled response.
    pub async fn collect_response(mut self) -> Result<ChatCompletionResponse, Error> {
        let mut accumulator = ChatStreamAccumulator::new();
        while let Some(chunk) = self.recv().await? {
            accumulator.process_chunk(chunk);
        }
        Ok(accumulator.finalize())
    }
}

impl<S, E> CompletionStream<FimCompletionStreamResponse, S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<Error>,
{
    /// Drive the session to the end and return the assembled response.
    pub async fn collect_response(mut self) -> Result<FimCompletionResponse, Error> {
        let mut accumulator = FimStreamAccumulator::new();
        while let Some(chunk) = self.recv().await? {
            accumulator.process_chunk(chunk);
        }
        Ok(accumulator.finalize())
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

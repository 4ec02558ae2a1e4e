use crate::streaming::state::{StreamDelta, StreamState};
use serde_json::{json, Value};

/// Which dialect the client is listening in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDialect {
    OpenAiChat,
    OpenAiResponses,
    Claude,
    Gemini,
}

/// Stream encoder: turns dialect-neutral deltas into `data:` payloads in the
/// client's dialect. One per request; holds the client-facing identity and
/// whatever per-dialect bookkeeping the wire format needs.
pub struct Encoder {
    dialect: ClientDialect,
    /// Client-facing ids, minted before the first byte arrives
    chat_id: String,
    response_id: String,
    model: String,
    created: u64,
    started: bool,
    /// Claude bookkeeping: next block index and the currently open block
    next_block: u64,
    open_block: Option<OpenBlock>,
    /// Tool slots already announced to the client
    announced: std::collections::HashSet<usize>,
}

#[derive(PartialEq, Clone, Copy)]
enum OpenBlock {
    Text,
    Thinking,
    Tool(usize),
}

impl Encoder {
    pub fn new(dialect: ClientDialect, model: &str) -> Self {
        Self {
            dialect,
            chat_id: crate::converters::fresh_chat_id(),
            response_id: crate::converters::fresh_response_id(),
            model: model.to_string(),
            created: crate::converters::unix_now(),
            started: false,
            next_block: 0,
            open_block: None,
            announced: std::collections::HashSet::new(),
        }
    }

    /// Frames that must precede the first content, if the dialect has any.
    pub fn start(&mut self, state: &StreamState) -> Vec<String> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        if let Some(id) = &state.response_id {
            // keep upstream linkage when the upstream already speaks ids
            self.response_id = crate::converters::response_id_from_chat_id(id);
        }
        match self.dialect {
            ClientDialect::OpenAiResponses => {
                vec![json!({
                    "type": "response.created",
                    "response": {
                        "id": self.response_id,
                        "object": "response",
                        "created_at": self.created,
                        "status": "in_progress",
                        "model": self.model,
                        "output": [],
                    }
                })
                .to_string()]
            }
            ClientDialect::Claude => {
                vec![json!({
                    "type": "message_start",
                    "message": {
                        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                        "type": "message",
                        "role": "assistant",
                        "model": self.model,
                        "content": [],
                        "stop_reason": null,
                        "usage": {"input_tokens": 0, "output_tokens": 0}
                    }
                })
                .to_string()]
            }
            _ => Vec::new(),
        }
    }

    pub fn encode(&mut self, state: &StreamState, delta: &StreamDelta) -> Vec<String> {
        match self.dialect {
            ClientDialect::OpenAiChat => self.encode_chat(state, delta),
            ClientDialect::OpenAiResponses => self.encode_responses(state, delta),
            ClientDialect::Claude => self.encode_claude(state, delta),
            ClientDialect::Gemini => self.encode_gemini(state, delta),
        }
    }

    fn chat_chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        json!({
            "id": self.chat_id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }]
        })
        .to_string()
    }

    fn encode_chat(&mut self, _state: &StreamState, delta: &StreamDelta) -> Vec<String> {
        match delta {
            StreamDelta::Role => vec![self.chat_chunk(json!({"role": "assistant"}), None)],
            StreamDelta::Content(text) => {
                vec![self.chat_chunk(json!({"content": text}), None)]
            }
            StreamDelta::Reasoning(text) => {
                vec![self.chat_chunk(json!({"reasoning_content": text}), None)]
            }
            StreamDelta::ToolCall {
                index,
                call_id,
                name,
                arguments,
            } => {
                let mut call = serde_json::Map::new();
                call.insert("index".to_string(), json!(index));
                if let Some(id) = call_id {
                    call.insert("id".to_string(), json!(id));
                    call.insert("type".to_string(), json!("function"));
                }
                let mut function = serde_json::Map::new();
                if let Some(name) = name {
                    function.insert("name".to_string(), json!(name));
                }
                function.insert("arguments".to_string(), json!(arguments));
                call.insert("function".to_string(), Value::Object(function));
                vec![self.chat_chunk(json!({"tool_calls": [Value::Object(call)]}), None)]
            }
            StreamDelta::Finish { reason } => {
                vec![self.chat_chunk(json!({}), Some(reason))]
            }
            StreamDelta::Usage(usage) => {
                vec![json!({
                    "id": self.chat_id,
                    "object": "chat.completion.chunk",
                    "created": self.created,
                    "model": self.model,
                    "choices": [],
                    "usage": usage,
                })
                .to_string()]
            }
        }
    }

    fn encode_responses(&mut self, state: &StreamState, delta: &StreamDelta) -> Vec<String> {
        match delta {
            StreamDelta::Role => Vec::new(),
            StreamDelta::Content(text) => vec![json!({
                "type": "response.output_text.delta",
                "delta": text,
            })
            .to_string()],
            StreamDelta::Reasoning(text) => vec![json!({
                "type": "response.reasoning_summary_text.delta",
                "delta": text,
            })
            .to_string()],
            StreamDelta::ToolCall {
                index,
                call_id: _,
                name: _,
                arguments,
            } => {
                let call = &state.tool_calls[*index];
                let mut out = Vec::new();
                if self.announced.insert(*index) {
                    out.push(
                        json!({
                            "type": "response.output_item.added",
                            "output_index": index,
                            "item": {
                                "type": "function_call",
                                "id": format!("fc_{}", call.call_id.trim_start_matches("call_")),
                                "call_id": call.call_id,
                                "name": call.name,
                                "arguments": "",
                            }
                        })
                        .to_string(),
                    );
                }
                out.push(
                    json!({
                        "type": "response.function_call_arguments.delta",
                        "output_index": index,
                        "call_id": call.call_id,
                        "delta": arguments,
                    })
                    .to_string(),
                );
                out
            }
            StreamDelta::Finish { reason: _ } => {
                vec![json!({
                    "type": "response.completed",
                    "response": self.final_response(state),
                })
                .to_string()]
            }
            StreamDelta::Usage(_) => Vec::new(),
        }
    }

    /// The completed Responses envelope assembled from the accumulated state.
    fn final_response(&self, state: &StreamState) -> Value {
        let mut output = Vec::new();
        if !state.reasoning.is_empty() {
            output.push(json!({
                "type": "reasoning",
                "summary": [{"type": "summary_text", "text": state.reasoning}],
            }));
        }
        if !state.text.is_empty() {
            output.push(json!({
                "type": "message",
                "role": "assistant",
                "status": "completed",
                "content": [{"type": "output_text", "annotations": [], "text": state.text}],
            }));
        }
        for call in &state.tool_calls {
            output.push(json!({
                "type": "function_call",
                "call_id": call.call_id,
                "name": call.name,
                "arguments": call.arguments,
                "status": "completed",
            }));
        }
        json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created,
            "status": "completed",
            "model": self.model,
            "output": output,
            "usage": state.usage.as_ref().map(|u| json!({
                "input_tokens": u.prompt_tokens,
                "output_tokens": u.completion_tokens,
                "total_tokens": u.total_tokens,
            })),
        })
    }

    fn encode_claude(&mut self, state: &StreamState, delta: &StreamDelta) -> Vec<String> {
        match delta {
            StreamDelta::Role => Vec::new(),
            StreamDelta::Content(text) => {
                let mut out = self.open_claude_block(OpenBlock::Text, json!({"type": "text", "text": ""}));
                out.push(
                    json!({
                        "type": "content_block_delta",
                        "index": self.next_block - 1,
                        "delta": {"type": "text_delta", "text": text},
                    })
                    .to_string(),
                );
                out
            }
            StreamDelta::Reasoning(text) => {
                let mut out = self.open_claude_block(
                    OpenBlock::Thinking,
                    json!({"type": "thinking", "thinking": ""}),
                );
                out.push(
                    json!({
                        "type": "content_block_delta",
                        "index": self.next_block - 1,
                        "delta": {"type": "thinking_delta", "thinking": text},
                    })
                    .to_string(),
                );
                out
            }
            StreamDelta::ToolCall {
                index, arguments, ..
            } => {
                let call = &state.tool_calls[*index];
                let start = json!({
                    "type": "tool_use",
                    "id": call.call_id,
                    "name": call.name,
                    "input": {},
                });
                let mut out = self.open_claude_block(OpenBlock::Tool(*index), start);
                out.push(
                    json!({
                        "type": "content_block_delta",
                        "index": self.next_block - 1,
                        "delta": {"type": "input_json_delta", "partial_json": arguments},
                    })
                    .to_string(),
                );
                out
            }
            StreamDelta::Finish { reason } => {
                let mut out = self.close_claude_block();
                let stop_reason = match reason.as_str() {
                    "length" => "max_tokens",
                    "tool_calls" => "tool_use",
                    _ => "end_turn",
                };
                out.push(
                    json!({
                        "type": "message_delta",
                        "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                        "usage": {
                            "output_tokens": state
                                .usage
                                .as_ref()
                                .map(|u| u.completion_tokens)
                                .unwrap_or(0)
                        },
                    })
                    .to_string(),
                );
                out.push(json!({"type": "message_stop"}).to_string());
                out
            }
            StreamDelta::Usage(_) => Vec::new(),
        }
    }

    /// Open a block of the given kind, closing whatever block was open.
    /// Returns the framing events; the caller appends its delta.
    fn open_claude_block(&mut self, kind: OpenBlock, content_block: Value) -> Vec<String> {
        if self.open_block == Some(kind) {
            return Vec::new();
        }
        let mut out = self.close_claude_block();
        out.push(
            json!({
                "type": "content_block_start",
                "index": self.next_block,
                "content_block": content_block,
            })
            .to_string(),
        );
        self.open_block = Some(kind);
        self.next_block += 1;
        out
    }

    fn close_claude_block(&mut self) -> Vec<String> {
        if self.open_block.take().is_none() {
            return Vec::new();
        }
        vec![json!({
            "type": "content_block_stop",
            "index": self.next_block - 1,
        })
        .to_string()]
    }

    fn encode_gemini(&mut self, state: &StreamState, delta: &StreamDelta) -> Vec<String> {
        let chunk = |parts: Vec<Value>, finish: Option<&str>, usage: Option<Value>| {
            json!({
                "candidates": [{
                    "content": {"role": "model", "parts": parts},
                    "finishReason": finish,
                    "index": 0,
                }],
                "usageMetadata": usage,
                "modelVersion": self.model,
            })
            .to_string()
        };

        match delta {
            StreamDelta::Role => Vec::new(),
            StreamDelta::Content(text) => vec![chunk(vec![json!({"text": text})], None, None)],
            StreamDelta::Reasoning(text) => {
                vec![chunk(vec![json!({"text": text, "thought": true})], None, None)]
            }
            // function calls are not streamable in this dialect; they ride
            // complete on the terminal chunk
            StreamDelta::ToolCall { .. } => Vec::new(),
            StreamDelta::Finish { reason } => {
                let parts: Vec<Value> = state
                    .tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "functionCall": {
                                "name": call.name,
                                "args": serde_json::from_str::<Value>(&call.arguments)
                                    .unwrap_or_else(|_| json!({})),
                            }
                        })
                    })
                    .collect();
                let finish = match reason.as_str() {
                    "length" => "MAX_TOKENS",
                    "content_filter" => "SAFETY",
                    _ => "STOP",
                };
                let usage = state.usage.as_ref().map(|u| {
                    json!({
                        "promptTokenCount": u.prompt_tokens,
                        "candidatesTokenCount": u.completion_tokens,
                        "totalTokenCount": u.total_tokens,
                    })
                });
                vec![chunk(parts, Some(finish), usage)]
            }
            StreamDelta::Usage(_) => Vec::new(),
        }
    }
}

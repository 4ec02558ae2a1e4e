use crate::{
    converters::{self, content},
    error::AppError,
    models::{
        anthropic::{
            ContentBlock, ImageSource, Message, MessageContent, MessagesRequest, MessagesResponse,
            TokenUsage, Tool,
        },
        canonical::{
            fresh_call_id, CanonicalMessage, CanonicalRequest, CanonicalToolCall, ContentPart,
            FunctionSpec, Role,
        },
        openai::{
            ChatCompletionResponse, Choice, FunctionCall, ResponseMessage, ToolCall, Usage,
        },
    },
};
use serde_json::{json, Value};

/// Decode a Claude Messages request into the canonical pivot.
pub async fn to_canonical(
    client: &reqwest::Client,
    req: &MessagesRequest,
) -> Result<CanonicalRequest, AppError> {
    let mut messages = Vec::new();

    if let Some(system) = &req.system {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(CanonicalMessage::text(Role::System, text));
        }
    }

    for msg in &req.messages {
        decode_message(client, msg, &mut messages).await;
    }

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|tool| FunctionSpec {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: Some(tool.input_schema.clone()),
        })
        .collect();

    Ok(CanonicalRequest {
        model: req.model.clone(),
        messages,
        tools,
        tool_choice: req.tool_choice.clone(),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop_sequences.clone(),
        stream: req.stream.unwrap_or(false),
        max_output_tokens: Some(req.max_tokens),
        reasoning_effort: None,
        user: None,
        previous_response_id: None,
        conversation: None,
    })
}

fn system_text(system: &MessageContent) -> String {
    match system {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

/// One Claude turn can mix text, images, tool_use and tool_result blocks.
/// tool_result blocks split out into canonical tool messages; the remainder
/// stays one message in the original role.
async fn decode_message(
    client: &reqwest::Client,
    msg: &Message,
    out: &mut Vec<CanonicalMessage>,
) {
    let role = Role::parse(&msg.role).unwrap_or(Role::User);

    let blocks = match &msg.content {
        MessageContent::Text(text) => {
            out.push(CanonicalMessage::text(role, text.clone()));
            return;
        }
        MessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();
    let mut reasoning = String::new();

    for block in blocks {
        match block.block_type.as_str() {
            "text" => {
                if let Some(text) = &block.text {
                    parts.push(ContentPart::Text(text.clone()));
                }
            }
            "image" => {
                if let Some(source) = &block.source {
                    if source.source_type == "base64" {
                        parts.push(ContentPart::Image {
                            mime_type: source.media_type.clone(),
                            data: source.data.clone(),
                        });
                    } else if let Some(part) = content::image_part(client, &source.data).await {
                        parts.push(part);
                    }
                }
            }
            "tool_use" => {
                tool_calls.push(CanonicalToolCall {
                    call_id: block.id.clone().unwrap_or_else(fresh_call_id),
                    name: block.name.clone().unwrap_or_default(),
                    arguments: content::arguments_to_string(
                        block.input.as_ref().unwrap_or(&Value::Null),
                    ),
                    thought: None,
                    thought_signature: None,
                });
            }
            "tool_result" => {
                let text = block
                    .content
                    .as_ref()
                    .map(content::text_from_value)
                    .unwrap_or_default();
                out.push(CanonicalMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::Text(text)],
                    tool_calls: Vec::new(),
                    tool_call_id: block.tool_use_id.clone(),
                    reasoning: None,
                });
            }
            "thinking" => {
                if let Some(thinking) = &block.thinking {
                    reasoning.push_str(thinking);
                }
            }
            _ => {}
        }
    }

    if !parts.is_empty() || !tool_calls.is_empty() || !reasoning.is_empty() {
        out.push(CanonicalMessage {
            role,
            parts,
            tool_calls,
            tool_call_id: None,
            reasoning: if reasoning.is_empty() {
                None
            } else {
                Some(reasoning)
            },
        });
    }
}

/// Encode the canonical pivot as a Claude Messages request.
pub fn from_canonical(req: &CanonicalRequest) -> MessagesRequest {
    // leading system prefix becomes the dedicated system field
    let mut system_texts = Vec::new();
    let mut rest = req.messages.as_slice();
    while let Some((first, tail)) = rest.split_first() {
        if first.role != Role::System {
            break;
        }
        system_texts.push(first.joined_text());
        rest = tail;
    }
    let system = if system_texts.is_empty() {
        None
    } else {
        Some(MessageContent::Blocks(vec![ContentBlock::text(
            system_texts.join("\n\n"),
        )]))
    };

    let mut messages: Vec<Message> = Vec::new();
    let mut pending_results: Vec<ContentBlock> = Vec::new();

    for msg in rest {
        if msg.role == Role::Tool {
            // consecutive tool outputs group into a single user turn
            pending_results.push(ContentBlock {
                block_type: "tool_result".to_string(),
                tool_use_id: msg.tool_call_id.clone(),
                content: Some(Value::String(msg.joined_text())),
                ..Default::default()
            });
            continue;
        }
        flush_tool_results(&mut messages, &mut pending_results);

        match msg.role {
            Role::User | Role::System => {
                let blocks = encode_parts(&msg.parts);
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: "user".to_string(),
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
            Role::Assistant => {
                let mut blocks = encode_parts(&msg.parts);
                for call in &msg.tool_calls {
                    blocks.push(ContentBlock {
                        block_type: "tool_use".to_string(),
                        id: Some(call.call_id.clone()),
                        name: Some(call.name.clone()),
                        input: Some(
                            serde_json::from_str(&call.arguments).unwrap_or_else(|_| json!({})),
                        ),
                        ..Default::default()
                    });
                }
                if !blocks.is_empty() {
                    messages.push(Message {
                        role: "assistant".to_string(),
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
            Role::Tool => unreachable!(),
        }
    }
    flush_tool_results(&mut messages, &mut pending_results);

    let tools: Vec<Tool> = req
        .tools
        .iter()
        .map(|spec| Tool {
            name: spec.name.clone(),
            description: spec.description.clone(),
            input_schema: spec
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect();

    // the Messages API caps temperature at 1.0
    let temperature = req.temperature.map(|t| if t > 1.0 { 1.0 } else { t });

    MessagesRequest {
        model: req.model.clone(),
        system,
        messages,
        max_tokens: req.max_output_tokens.unwrap_or(4096),
        temperature,
        top_p: req.top_p,
        top_k: None,
        stream: if req.stream { Some(true) } else { None },
        stop_sequences: req.stop.clone(),
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: req.tool_choice.clone(),
        thinking: None,
        metadata: None,
    }
}

fn flush_tool_results(messages: &mut Vec<Message>, pending: &mut Vec<ContentBlock>) {
    if !pending.is_empty() {
        messages.push(Message {
            role: "user".to_string(),
            content: MessageContent::Blocks(std::mem::take(pending)),
        });
    }
}

fn encode_parts(parts: &[ContentPart]) -> Vec<ContentBlock> {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => ContentBlock::text(text.clone()),
            ContentPart::Image { mime_type, data } => ContentBlock {
                block_type: "image".to_string(),
                source: Some(ImageSource {
                    source_type: "base64".to_string(),
                    media_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            },
        })
        .collect()
}

/// Translate a non-stream Claude reply into the Chat Completions pivot.
pub fn chat_response_from_messages(resp: &MessagesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in &resp.content {
        match block.block_type.as_str() {
            "text" => text.push_str(block.text.as_deref().unwrap_or_default()),
            "thinking" => reasoning.push_str(block.thinking.as_deref().unwrap_or_default()),
            "tool_use" => tool_calls.push(ToolCall {
                id: block.id.clone().unwrap_or_else(fresh_call_id),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: block.name.clone().unwrap_or_default(),
                    arguments: content::arguments_to_string(
                        block.input.as_ref().unwrap_or(&Value::Null),
                    ),
                },
            }),
            _ => {}
        }
    }

    let finish_reason = converters::map_finish_reason(
        resp.stop_reason.as_deref().unwrap_or("stop"),
        !tool_calls.is_empty(),
    );

    ChatCompletionResponse {
        id: converters::fresh_chat_id(),
        object: "chat.completion".to_string(),
        created: converters::unix_now(),
        model: resp.model.clone(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() { None } else { Some(text) },
                reasoning_content: if reasoning.is_empty() {
                    None
                } else {
                    Some(reasoning)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason: Some(finish_reason),
        }],
        usage: Some(Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        }),
    }
}

/// Rebuild a Claude Messages reply from the Chat Completions pivot.
pub fn messages_response_from_chat(resp: &ChatCompletionResponse) -> MessagesResponse {
    let choice = resp.choices.first();
    let mut blocks = Vec::new();
    let mut has_tool_use = false;

    if let Some(choice) = choice {
        if let Some(reasoning) = &choice.message.reasoning_content {
            blocks.push(ContentBlock {
                block_type: "thinking".to_string(),
                thinking: Some(reasoning.clone()),
                ..Default::default()
            });
        }
        if let Some(text) = &choice.message.content {
            blocks.push(ContentBlock::text(text.clone()));
        }
        for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
            has_tool_use = true;
            blocks.push(ContentBlock {
                block_type: "tool_use".to_string(),
                id: Some(call.id.clone()),
                name: Some(call.function.name.clone()),
                input: Some(
                    serde_json::from_str(&call.function.arguments).unwrap_or_else(|_| json!({})),
                ),
                ..Default::default()
            });
        }
    }

    let stop_reason = match choice.and_then(|c| c.finish_reason.as_deref()) {
        _ if has_tool_use => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };

    MessagesResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        content: blocks,
        model: resp.model.clone(),
        stop_reason: Some(stop_reason.to_string()),
        stop_sequence: None,
        usage: resp
            .usage
            .as_ref()
            .map(|u| TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::CanonicalRequest;

    #[test]
    fn test_from_canonical_groups_tool_results() {
        let req = CanonicalRequest {
            model: "claude-3-5-sonnet".to_string(),
            messages: vec![
                CanonicalMessage::text(Role::System, "be brief"),
                CanonicalMessage::text(Role::User, "hi"),
                CanonicalMessage {
                    role: Role::Assistant,
                    parts: Vec::new(),
                    tool_calls: vec![
                        CanonicalToolCall::new("c1", "ping", "{\"x\":1}"),
                        CanonicalToolCall::new("c2", "pong", "{}"),
                    ],
                    tool_call_id: None,
                    reasoning: None,
                },
                CanonicalMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::Text("r1".into())],
                    tool_calls: Vec::new(),
                    tool_call_id: Some("c1".into()),
                    reasoning: None,
                },
                CanonicalMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::Text("r2".into())],
                    tool_calls: Vec::new(),
                    tool_call_id: Some("c2".into()),
                    reasoning: None,
                },
            ],
            ..Default::default()
        };

        let claude = from_canonical(&req);
        assert!(claude.system.is_some());
        // user, assistant(tool_use x2), single user turn with both results
        assert_eq!(claude.messages.len(), 3);
        let results = match &claude.messages[2].content {
            MessageContent::Blocks(blocks) => blocks,
            _ => panic!("expected blocks"),
        };
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|b| b.block_type == "tool_result"));
        assert_eq!(results[0].tool_use_id.as_deref(), Some("c1"));
    }

    #[test]
    fn test_temperature_clipped() {
        let req = CanonicalRequest {
            model: "m".into(),
            temperature: Some(1.7),
            ..Default::default()
        };
        assert_eq!(from_canonical(&req).temperature, Some(1.0));
    }

    #[tokio::test]
    async fn test_to_canonical_splits_tool_results() {
        let client = reqwest::Client::new();
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "c1", "content": "out"},
                    {"type": "text", "text": "next question"}
                ]}
            ]
        }))
        .unwrap();
        let canonical = to_canonical(&client, &req).await.unwrap();
        assert_eq!(canonical.messages.len(), 2);
        assert_eq!(canonical.messages[0].role, Role::Tool);
        assert_eq!(canonical.messages[0].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(canonical.messages[1].role, Role::User);
    }

    #[test]
    fn test_chat_response_from_messages_tool_use() {
        let resp: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet",
            "content": [
                {"type": "text", "text": "calling"},
                {"type": "tool_use", "id": "toolu_1", "name": "ping", "input": {"x": 1}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 7, "output_tokens": 3}
        }))
        .unwrap();

        let chat = chat_response_from_messages(&resp);
        let choice = &chat.choices[0];
        assert_eq!(choice.finish_reason.as_deref(), Some("tool_calls"));
        let calls = choice.message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.arguments, "{\"x\":1}");
        assert_eq!(chat.usage.as_ref().unwrap().total_tokens, 10);
    }
}

use crate::{
    config::Quirks,
    converters::{self, content},
    error::AppError,
    models::{
        canonical::{
            fresh_call_id, CanonicalMessage, CanonicalRequest, CanonicalToolCall, ContentPart,
            FunctionSpec, Role,
        },
        openai::{
            ChatCompletionResponse, Choice, FunctionCall, ResponseMessage, ToolCall, Usage,
        },
        responses::{ResponsesRequest, ResponsesResponse, ResponsesUsage},
    },
};
use serde_json::{json, Value};

/// Strip the item-id prefix some clients duplicate onto call ids
/// ("fc_call_abc" and "call_abc" refer to the same call).
pub fn normalize_call_id(call_id: &str) -> String {
    match call_id.strip_prefix("fc_") {
        Some(rest) if rest.starts_with("call_") => rest.to_string(),
        _ => call_id.to_string(),
    }
}

/// Decode a Responses request into the canonical pivot.
pub async fn to_canonical(
    client: &reqwest::Client,
    req: &ResponsesRequest,
) -> Result<CanonicalRequest, AppError> {
    let mut messages = Vec::new();

    if let Some(instructions) = &req.instructions {
        if !instructions.is_empty() {
            messages.push(CanonicalMessage::text(Role::System, instructions.clone()));
        }
    }

    match &req.input {
        None => {}
        Some(Value::String(text)) => {
            messages.push(CanonicalMessage::text(Role::User, text.clone()));
        }
        Some(Value::Array(items)) => {
            for item in items {
                decode_input_item(client, item, &mut messages).await;
            }
        }
        Some(other) => {
            return Err(AppError::InvalidRequest(format!(
                "Unsupported input shape: {}",
                other
            )));
        }
    }

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .filter_map(decode_tool)
        .collect();

    let reasoning_effort = req
        .reasoning
        .as_ref()
        .and_then(|r| r.get("effort"))
        .and_then(|e| e.as_str())
        .map(String::from);

    let conversation = match &req.conversation {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Object(obj)) => obj
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from),
        _ => None,
    };

    Ok(CanonicalRequest {
        model: req.model.clone(),
        messages,
        tools,
        tool_choice: req.tool_choice.clone(),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: None,
        stream: req.stream.unwrap_or(false),
        max_output_tokens: req.max_output_tokens,
        reasoning_effort,
        user: req.user.clone(),
        previous_response_id: req.previous_response_id.clone(),
        conversation,
    })
}

async fn decode_input_item(
    client: &reqwest::Client,
    item: &Value,
    messages: &mut Vec<CanonicalMessage>,
) {
    let item_type = item.get("type").and_then(|t| t.as_str()).unwrap_or("message");

    match item_type {
        "function_call" => {
            let call_id = item
                .get("call_id")
                .or_else(|| item.get("id"))
                .and_then(|v| v.as_str())
                .map(normalize_call_id)
                .unwrap_or_else(fresh_call_id);
            let call = CanonicalToolCall {
                call_id,
                name: item
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                arguments: content::arguments_to_string(
                    item.get("arguments").unwrap_or(&Value::Null),
                ),
                thought: None,
                thought_signature: None,
            };
            // fold into a preceding assistant message when one is open
            match messages.last_mut() {
                Some(last) if last.role == Role::Assistant && last.tool_call_id.is_none() => {
                    last.tool_calls.push(call);
                }
                _ => messages.push(CanonicalMessage {
                    role: Role::Assistant,
                    parts: Vec::new(),
                    tool_calls: vec![call],
                    tool_call_id: None,
                    reasoning: None,
                }),
            }
        }
        "function_call_output" => {
            let output = item
                .get("output")
                .map(content::text_from_value)
                .unwrap_or_default();
            messages.push(CanonicalMessage {
                role: Role::Tool,
                parts: vec![ContentPart::Text(output)],
                tool_calls: Vec::new(),
                tool_call_id: item
                    .get("call_id")
                    .and_then(|v| v.as_str())
                    .map(normalize_call_id),
                reasoning: None,
            });
        }
        "reasoning" | "item_reference" => {}
        _ => {
            // plain message item
            let role = item
                .get("role")
                .and_then(|r| r.as_str())
                .and_then(Role::parse)
                .unwrap_or(Role::User);
            let parts = match item.get("content") {
                Some(content_value) => {
                    content::normalize_value_parts(client, content_value).await
                }
                None => Vec::new(),
            };
            if !parts.is_empty() {
                messages.push(CanonicalMessage {
                    role,
                    parts,
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    reasoning: None,
                });
            }
        }
    }
}

fn decode_tool(tool: &Value) -> Option<FunctionSpec> {
    // flat Responses form first, nested Chat form as fallback
    let (name, holder) = if let Some(name) = tool.get("name").and_then(|n| n.as_str()) {
        (name, tool)
    } else {
        let function = tool.get("function")?;
        (function.get("name")?.as_str()?, function)
    };
    Some(FunctionSpec {
        name: name.to_string(),
        description: holder
            .get("description")
            .and_then(|d| d.as_str())
            .map(String::from),
        parameters: holder.get("parameters").cloned(),
    })
}

/// Encode the canonical pivot as a Responses request body.
///
/// Returns a loose Value so the variant builder can permute it without
/// round-tripping through typed structs.
pub fn from_canonical(req: &CanonicalRequest, quirks: &Quirks) -> Value {
    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(req.model));

    let mut rest = req.messages.as_slice();
    let mut system_texts = Vec::new();
    while let Some((first, tail)) = rest.split_first() {
        if first.role != Role::System {
            break;
        }
        system_texts.push(first.joined_text());
        rest = tail;
    }

    let mut input = Vec::new();
    if !system_texts.is_empty() {
        let instructions = system_texts.join("\n\n");
        if quirks.no_instructions {
            input.push(json!({
                "role": "system",
                "content": [{"type": "input_text", "text": instructions}]
            }));
        } else {
            body.insert("instructions".to_string(), json!(instructions));
        }
    }

    for msg in rest {
        match msg.role {
            Role::Assistant => {
                if !msg.parts.is_empty() {
                    input.push(json!({
                        "role": "assistant",
                        "content": [{"type": "output_text", "text": msg.joined_text()}]
                    }));
                }
                for call in &msg.tool_calls {
                    input.push(json!({
                        "type": "function_call",
                        "call_id": call.call_id,
                        "name": call.name,
                        "arguments": call.arguments,
                    }));
                }
            }
            Role::Tool => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "output": msg.joined_text(),
                }));
            }
            _ => {
                let parts: Vec<Value> = msg
                    .parts
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text(text) => json!({"type": "input_text", "text": text}),
                        ContentPart::Image { mime_type, data } => json!({
                            "type": "input_image",
                            "image_url": format!("data:{};base64,{}", mime_type, data)
                        }),
                    })
                    .collect();
                input.push(json!({"role": msg.role.as_str(), "content": parts}));
            }
        }
    }
    body.insert("input".to_string(), Value::Array(input));

    if !req.tools.is_empty() {
        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|spec| {
                json!({
                    "type": "function",
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tools));
        if let Some(choice) = &req.tool_choice {
            body.insert("tool_choice".to_string(), choice.clone());
        }
    }

    if let Some(max) = req.max_output_tokens {
        body.insert("max_output_tokens".to_string(), json!(max));
    }
    if let Some(t) = req.temperature {
        body.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        body.insert("top_p".to_string(), json!(p));
    }
    if let Some(effort) = &req.reasoning_effort {
        body.insert("reasoning".to_string(), json!({"effort": effort}));
    }
    if req.stream {
        body.insert("stream".to_string(), json!(true));
    }
    if !quirks.no_previous_response_id {
        if let Some(prev) = &req.previous_response_id {
            body.insert("previous_response_id".to_string(), json!(prev));
        }
    }
    if let Some(conversation) = &req.conversation {
        body.insert("conversation".to_string(), json!(conversation));
    }
    if let Some(user) = &req.user {
        body.insert("user".to_string(), json!(user));
    }

    Value::Object(body)
}

/// Translate a non-stream Responses reply into the Chat Completions pivot.
/// Also returns the upstream response id for session linkage.
pub fn chat_response_from_responses(
    value: &Value,
) -> Result<(ChatCompletionResponse, Option<String>), AppError> {
    let response_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from);

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for item in value
        .get("output")
        .and_then(|o| o.as_array())
        .map(|a| a.as_slice())
        .unwrap_or_default()
    {
        match item.get("type").and_then(|t| t.as_str()).unwrap_or("message") {
            "message" => {
                text.push_str(&content::text_from_value(
                    item.get("content").unwrap_or(&Value::Null),
                ));
            }
            "reasoning" => {
                reasoning.push_str(&content::text_from_value(
                    item.get("summary").unwrap_or(&Value::Null),
                ));
            }
            "function_call" => {
                tool_calls.push(ToolCall {
                    id: item
                        .get("call_id")
                        .or_else(|| item.get("id"))
                        .and_then(|v| v.as_str())
                        .map(normalize_call_id)
                        .unwrap_or_else(fresh_call_id),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: item
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: content::arguments_to_string(
                            item.get("arguments").unwrap_or(&Value::Null),
                        ),
                    },
                });
            }
            _ => {}
        }
    }

    // some relays put the final text at output_text instead of output
    if text.is_empty() {
        if let Some(flat) = value.get("output_text").and_then(|v| v.as_str()) {
            text.push_str(flat);
        }
    }

    let status = value
        .get("status")
        .and_then(|s| s.as_str())
        .unwrap_or("completed");
    let finish_reason = if !tool_calls.is_empty() {
        "tool_calls".to_string()
    } else if status == "incomplete" {
        let reason = value
            .pointer("/incomplete_details/reason")
            .and_then(|r| r.as_str())
            .unwrap_or("");
        converters::map_finish_reason(if reason.is_empty() { "length" } else { reason }, false)
    } else {
        "stop".to_string()
    };

    let usage = value.get("usage").map(|u| Usage {
        prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
        total_tokens: u
            .get("total_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| {
                u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
                    + u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0)
            }),
    });

    let chat = ChatCompletionResponse {
        id: converters::fresh_chat_id(),
        object: "chat.completion".to_string(),
        created: value
            .get("created_at")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(converters::unix_now),
        model: value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
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
        usage,
    };

    Ok((chat, response_id))
}

/// Rebuild a Responses reply from the Chat Completions pivot.
pub fn responses_response_from_chat(chat: &ChatCompletionResponse) -> ResponsesResponse {
    let mut output = Vec::new();
    let choice = chat.choices.first();

    if let Some(choice) = choice {
        if let Some(reasoning) = &choice.message.reasoning_content {
            output.push(json!({
                "type": "reasoning",
                "id": format!("rs_{}", uuid::Uuid::new_v4().simple()),
                "summary": [{"type": "summary_text", "text": reasoning}],
            }));
        }
        if let Some(text) = &choice.message.content {
            output.push(json!({
                "type": "message",
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "role": "assistant",
                "status": "completed",
                "content": [{"type": "output_text", "annotations": [], "text": text}],
            }));
        }
        for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
            output.push(json!({
                "type": "function_call",
                "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
                "call_id": call.id,
                "name": call.function.name,
                "arguments": call.function.arguments,
                "status": "completed",
            }));
        }
    }

    ResponsesResponse {
        id: converters::response_id_from_chat_id(&chat.id),
        object: "response".to_string(),
        created_at: chat.created,
        status: "completed".to_string(),
        model: chat.model.clone(),
        output,
        usage: chat.usage.as_ref().map(|u| ResponsesUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
        previous_response_id: None,
    }
}

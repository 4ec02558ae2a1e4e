use crate::{
    converters::{self, content, gemini_schema},
    error::AppError,
    models::{
        canonical::{
            fresh_call_id, CanonicalMessage, CanonicalRequest, CanonicalToolCall, ContentPart,
            FunctionSpec, Role,
        },
        gemini::{
            Candidate, Content, FunctionCall, FunctionDeclaration, FunctionResponse,
            GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, Part,
            ThinkingConfig, Tool,
        },
        openai::{
            ChatCompletionResponse, Choice, FunctionCall as OpenAiFunctionCall, ResponseMessage,
            ToolCall,
        },
    },
};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Some relays treat an absent maxOutputTokens as zero; always send one.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 65536;

/// Decode a Gemini generateContent request into the canonical pivot.
///
/// Gemini function calls carry no ids; fresh ids are minted for the model
/// turn and the following functionResponse turn is paired back by name, in
/// order.
pub fn to_canonical(req: &GenerateContentRequest) -> Result<CanonicalRequest, AppError> {
    let mut messages = Vec::new();

    if let Some(system) = &req.system_instruction {
        let text: String = system
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        if !text.is_empty() {
            messages.push(CanonicalMessage::text(Role::System, text));
        }
    }

    // (name, call_id) of the most recent model turn, consumed by responses
    let mut open_calls: Vec<(String, String)> = Vec::new();

    for turn in &req.contents {
        let role = Role::parse(turn.role.as_deref().unwrap_or("user")).unwrap_or(Role::User);
        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut reasoning = String::new();

        for part in &turn.parts {
            if let Some(call) = &part.function_call {
                let call_id = fresh_call_id();
                open_calls.push((call.name.clone(), call_id.clone()));
                tool_calls.push(CanonicalToolCall {
                    call_id,
                    name: call.name.clone(),
                    arguments: content::arguments_to_string(&call.args),
                    thought: part.thought.and_then(|t| {
                        if t {
                            part.text.clone()
                        } else {
                            None
                        }
                    }),
                    thought_signature: part.thought_signature.clone(),
                });
            } else if let Some(resp) = &part.function_response {
                let call_id = take_open_call(&mut open_calls, &resp.name);
                messages.push(CanonicalMessage {
                    role: Role::Tool,
                    parts: vec![ContentPart::Text(function_response_text(&resp.response))],
                    tool_calls: Vec::new(),
                    tool_call_id: call_id,
                    reasoning: None,
                });
            } else if let Some(data) = &part.inline_data {
                parts.push(ContentPart::Image {
                    mime_type: data.mime_type.clone(),
                    data: data.data.clone(),
                });
            } else if let Some(text) = &part.text {
                if part.thought == Some(true) {
                    reasoning.push_str(text);
                } else {
                    parts.push(ContentPart::Text(text.clone()));
                }
            }
        }

        if !parts.is_empty() || !tool_calls.is_empty() || !reasoning.is_empty() {
            if !tool_calls.is_empty() {
                // a turn that calls functions is a model turn regardless of
                // what the role field claims
                messages.push(CanonicalMessage {
                    role: Role::Assistant,
                    parts,
                    tool_calls,
                    tool_call_id: None,
                    reasoning: if reasoning.is_empty() {
                        None
                    } else {
                        Some(reasoning)
                    },
                });
            } else {
                messages.push(CanonicalMessage {
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
    }

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .flat_map(|t| &t.function_declarations)
        .map(|decl| FunctionSpec {
            name: decl.name.clone(),
            description: decl.description.clone(),
            parameters: decl.parameters.clone(),
        })
        .collect();

    let config = req.generation_config.as_ref();

    Ok(CanonicalRequest {
        model: String::new(), // filled by the handler from the URL path
        messages,
        tools,
        tool_choice: None,
        temperature: config.and_then(|c| c.temperature),
        top_p: config.and_then(|c| c.top_p),
        stop: config.and_then(|c| c.stop_sequences.clone()),
        stream: false,
        max_output_tokens: config.and_then(|c| c.max_output_tokens),
        reasoning_effort: None,
        user: None,
        previous_response_id: None,
        conversation: None,
    })
}

fn take_open_call(open_calls: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let position = open_calls
        .iter()
        .position(|(n, _)| n == name)
        .or(if open_calls.is_empty() { None } else { Some(0) })?;
    Some(open_calls.remove(position).1)
}

fn function_response_text(response: &Value) -> String {
    match response {
        Value::String(s) => s.clone(),
        Value::Object(obj) => {
            if let Some(output) = obj.get("output").and_then(|v| v.as_str()) {
                output.to_string()
            } else {
                serde_json::to_string(response).unwrap_or_default()
            }
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Encode the canonical pivot as a Gemini generateContent request.
///
/// `signatures` carries cached thought signatures by call id; they attach as
/// siblings of the functionCall part, never inside it.
pub fn from_canonical(
    req: &CanonicalRequest,
    signatures: &HashMap<String, String>,
    default_max_tokens: Option<u64>,
) -> GenerateContentRequest {
    let mut system_texts = Vec::new();
    let mut rest = req.messages.as_slice();
    while let Some((first, tail)) = rest.split_first() {
        if first.role != Role::System {
            break;
        }
        system_texts.push(first.joined_text());
        rest = tail;
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: Some("user".to_string()),
            parts: vec![Part::text(system_texts.join("\n\n"))],
        })
    };

    let mut contents: Vec<Content> = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let msg = &rest[i];
        match msg.role {
            Role::Assistant if !msg.tool_calls.is_empty() => {
                let mut parts = encode_parts(&msg.parts);
                for call in &msg.tool_calls {
                    let signature = call
                        .thought_signature
                        .clone()
                        .or_else(|| signatures.get(&call.call_id).cloned());
                    parts.push(Part {
                        function_call: Some(FunctionCall {
                            name: call.name.clone(),
                            args: serde_json::from_str(&call.arguments)
                                .unwrap_or_else(|_| json!({})),
                        }),
                        thought_signature: signature,
                        ..Default::default()
                    });
                }
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts,
                });

                // greedily consume the contiguous tool outputs that answer
                // this turn, one functionResponse per call, in call order
                let mut outputs: HashMap<&str, String> = HashMap::new();
                while i + 1 < rest.len() && rest[i + 1].role == Role::Tool {
                    i += 1;
                    if let Some(id) = rest[i].tool_call_id.as_deref() {
                        outputs.insert(
                            msg.tool_calls
                                .iter()
                                .find(|c| c.call_id == id)
                                .map(|c| c.call_id.as_str())
                                .unwrap_or(id),
                            rest[i].joined_text(),
                        );
                    }
                }
                let response_parts: Vec<Part> = msg
                    .tool_calls
                    .iter()
                    .map(|call| Part {
                        function_response: Some(FunctionResponse {
                            name: call.name.clone(),
                            response: json!({
                                "output": outputs
                                    .get(call.call_id.as_str())
                                    .cloned()
                                    .unwrap_or_default()
                            }),
                        }),
                        ..Default::default()
                    })
                    .collect();
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: response_parts,
                });
            }
            Role::Assistant => {
                let parts = encode_parts(&msg.parts);
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
            }
            _ => {
                // user, stray system, and orphan tool outputs all travel as
                // user turns
                let parts = encode_parts(&msg.parts);
                if !parts.is_empty() {
                    contents.push(Content {
                        role: Some("user".to_string()),
                        parts,
                    });
                }
            }
        }
        i += 1;
    }

    let tools = if req.tools.is_empty() {
        None
    } else {
        Some(vec![Tool {
            function_declarations: req
                .tools
                .iter()
                .map(|spec| FunctionDeclaration {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters: spec
                        .parameters
                        .as_ref()
                        .map(gemini_schema::to_gemini_schema),
                })
                .collect(),
        }])
    };

    let generation_config = GenerationConfig {
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_output_tokens: Some(
            req.max_output_tokens
                .or(default_max_tokens)
                .unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS),
        ),
        stop_sequences: req.stop.clone(),
        response_mime_type: None,
        response_schema: None,
        thinking_config: Some(ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: None,
        }),
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: Some(generation_config),
        safety_settings: None,
        tools,
        tool_config: tool_config_from_choice(req.tool_choice.as_ref()),
    }
}

fn tool_config_from_choice(choice: Option<&Value>) -> Option<Value> {
    let mode = match choice? {
        Value::String(s) => match s.as_str() {
            "none" => "NONE",
            "required" | "any" => "ANY",
            _ => "AUTO",
        },
        Value::Object(obj) => {
            if let Some(name) = obj
                .get("function")
                .and_then(|f| f.get("name"))
                .and_then(|n| n.as_str())
            {
                return Some(json!({
                    "functionCallingConfig": {
                        "mode": "ANY",
                        "allowedFunctionNames": [name]
                    }
                }));
            }
            "AUTO"
        }
        _ => "AUTO",
    };
    Some(json!({"functionCallingConfig": {"mode": mode}}))
}

fn encode_parts(parts: &[ContentPart]) -> Vec<Part> {
    parts
        .iter()
        .map(|part| match part {
            ContentPart::Text(text) => Part::text(text.clone()),
            ContentPart::Image { mime_type, data } => Part {
                inline_data: Some(InlineData {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            },
        })
        .collect()
}

/// A thought signature captured from an upstream reply, to be cached for the
/// next turn.
#[derive(Debug, Clone)]
pub struct CapturedSignature {
    pub call_id: String,
    pub name: String,
    pub thought: Option<String>,
    pub signature: String,
}

/// Translate a non-stream Gemini reply into the Chat Completions pivot,
/// returning any thought signatures found along the way.
pub fn chat_response_from_gemini(
    resp: &GenerateContentResponse,
) -> (ChatCompletionResponse, Vec<CapturedSignature>) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    let mut captured = Vec::new();

    let candidate = resp.candidates.first();
    if let Some(content) = candidate.and_then(|c| c.content.as_ref()) {
        for part in &content.parts {
            if let Some(call) = &part.function_call {
                let call_id = fresh_call_id();
                if let Some(signature) = &part.thought_signature {
                    captured.push(CapturedSignature {
                        call_id: call_id.clone(),
                        name: call.name.clone(),
                        thought: part.text.clone(),
                        signature: signature.clone(),
                    });
                }
                tool_calls.push(ToolCall {
                    id: call_id,
                    call_type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: call.name.clone(),
                        arguments: content::arguments_to_string(&call.args),
                    },
                });
            } else if let Some(part_text) = &part.text {
                if part.thought == Some(true) {
                    reasoning.push_str(part_text);
                } else {
                    text.push_str(part_text);
                }
            }
        }
    }

    let finish_reason = converters::map_finish_reason(
        candidate
            .and_then(|c| c.finish_reason.as_deref())
            .unwrap_or("stop"),
        !tool_calls.is_empty(),
    );

    let usage = resp.usage_metadata.as_ref().map(|u| {
        converters::usage_from_counts(
            u.prompt_token_count,
            u.candidates_token_count,
            Some(u.total_token_count).filter(|t| *t > 0),
        )
    });

    let chat = ChatCompletionResponse {
        id: converters::fresh_chat_id(),
        object: "chat.completion".to_string(),
        created: converters::unix_now(),
        model: resp
            .model_version
            .clone()
            .unwrap_or_else(|| "gemini".to_string()),
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

    (chat, captured)
}

/// Rebuild a Gemini reply from the Chat Completions pivot.
pub fn gemini_response_from_chat(resp: &ChatCompletionResponse) -> GenerateContentResponse {
    let choice = resp.choices.first();
    let mut parts = Vec::new();

    if let Some(choice) = choice {
        if let Some(reasoning) = &choice.message.reasoning_content {
            parts.push(Part {
                text: Some(reasoning.clone()),
                thought: Some(true),
                ..Default::default()
            });
        }
        if let Some(text) = &choice.message.content {
            parts.push(Part::text(text.clone()));
        }
        for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
            parts.push(Part {
                function_call: Some(FunctionCall {
                    name: call.function.name.clone(),
                    args: serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({})),
                }),
                ..Default::default()
            });
        }
    }

    let finish_reason = match choice.and_then(|c| c.finish_reason.as_deref()) {
        Some("length") => "MAX_TOKENS",
        Some("content_filter") => "SAFETY",
        _ => "STOP",
    };

    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content {
                role: Some("model".to_string()),
                parts,
            }),
            finish_reason: Some(finish_reason.to_string()),
            index: Some(0),
        }],
        usage_metadata: resp.usage.as_ref().map(|u| crate::models::gemini::UsageMetadata {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens,
            total_token_count: u.total_tokens,
        }),
        model_version: Some(resp.model.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical_with_tool_round() -> CanonicalRequest {
        CanonicalRequest {
            model: "gemini-1.5-pro".to_string(),
            messages: vec![
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
                    parts: vec![ContentPart::Text("res1".into())],
                    tool_calls: Vec::new(),
                    tool_call_id: Some("c1".into()),
                    reasoning: None,
                },
                // c2's output never arrived; its slot must be backfilled
                CanonicalMessage::text(Role::User, "and?"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_function_response_turn_assembly() {
        let req = canonical_with_tool_round();
        let gemini = from_canonical(&req, &HashMap::new(), None);

        // user, model(functionCalls), user(functionResponses), user("and?")
        assert_eq!(gemini.contents.len(), 4);
        let responses = &gemini.contents[2];
        assert_eq!(responses.role.as_deref(), Some("user"));
        assert_eq!(responses.parts.len(), 2);
        let first = responses.parts[0].function_response.as_ref().unwrap();
        assert_eq!(first.name, "ping");
        assert_eq!(first.response["output"], "res1");
        let second = responses.parts[1].function_response.as_ref().unwrap();
        assert_eq!(second.name, "pong");
        assert_eq!(second.response["output"], "");
    }

    #[test]
    fn test_signature_rides_as_sibling() {
        let req = canonical_with_tool_round();
        let mut sigs = HashMap::new();
        sigs.insert("c1".to_string(), "sig-1".to_string());
        let gemini = from_canonical(&req, &sigs, None);

        let model_turn = &gemini.contents[1];
        let call_part = &model_turn.parts[0];
        assert!(call_part.function_call.is_some());
        assert_eq!(call_part.thought_signature.as_deref(), Some("sig-1"));
        assert!(model_turn.parts[1].thought_signature.is_none());
    }

    #[test]
    fn test_default_max_output_tokens() {
        let req = CanonicalRequest::default();
        let gemini = from_canonical(&req, &HashMap::new(), None);
        let config = gemini.generation_config.unwrap();
        assert_eq!(config.max_output_tokens, Some(DEFAULT_MAX_OUTPUT_TOKENS));
        assert_eq!(
            config.thinking_config.unwrap().include_thoughts,
            Some(true)
        );
    }

    #[test]
    fn test_to_canonical_pairs_responses_by_name() {
        let req: GenerateContentRequest = serde_json::from_value(json!({
            "contents": [
                {"role": "user", "parts": [{"text": "go"}]},
                {"role": "model", "parts": [
                    {"functionCall": {"name": "ping", "args": {"x": 1}}},
                    {"functionCall": {"name": "pong", "args": {}}}
                ]},
                {"role": "user", "parts": [
                    {"functionResponse": {"name": "pong", "response": {"output": "p2"}}},
                    {"functionResponse": {"name": "ping", "response": {"output": "p1"}}}
                ]}
            ]
        }))
        .unwrap();

        let canonical = to_canonical(&req).unwrap();
        let assistant = canonical
            .messages
            .iter()
            .find(|m| m.role == Role::Assistant)
            .unwrap();
        let pong_id = &assistant.tool_calls[1].call_id;
        let tool_msgs: Vec<_> = canonical
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs[0].tool_call_id.as_ref(), Some(pong_id));
        assert_eq!(tool_msgs[0].joined_text(), "p2");
    }

    #[test]
    fn test_chat_response_from_gemini_thoughts() {
        let resp: GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "let me think", "thought": true},
                    {"text": "answer"},
                    {"functionCall": {"name": "ping", "args": {}}, "thoughtSignature": "sig-9"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2, "totalTokenCount": 6}
        }))
        .unwrap();

        let (chat, captured) = chat_response_from_gemini(&resp);
        assert!(chat.id.starts_with("chatcmpl_"));
        let message = &chat.choices[0].message;
        assert_eq!(message.content.as_deref(), Some("answer"));
        assert_eq!(message.reasoning_content.as_deref(), Some("let me think"));
        assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].signature, "sig-9");
        assert_eq!(captured[0].call_id, message.tool_calls.as_ref().unwrap()[0].id);
    }
}

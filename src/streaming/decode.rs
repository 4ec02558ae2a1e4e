use crate::{
    converters,
    models::canonical::fresh_call_id,
    models::openai::Usage,
    streaming::state::{ClaudeBlockKind, StreamDelta, StreamState},
};
use serde_json::Value;

/// Decode one OpenAI Responses SSE payload into dialect-neutral deltas.
pub fn decode_responses_event(state: &mut StreamState, payload: &Value) -> Vec<StreamDelta> {
    let mut out = Vec::new();
    let event_type = payload.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "response.created" | "response.in_progress" => {
            capture_response_identity(state, payload.get("response"));
        }
        "response.output_text.delta" | "response.refusal.delta" => {
            if let Some(delta) = payload.get("delta").and_then(|d| d.as_str()) {
                out.extend(state.push_text(delta));
            }
        }
        "response.output_text.done" | "response.refusal.done" => {
            let full = payload
                .get("text")
                .or_else(|| payload.get("refusal"))
                .and_then(|t| t.as_str())
                .unwrap_or("");
            out.extend(state.reconcile_text(full));
        }
        "response.reasoning.delta"
        | "response.reasoning_text.delta"
        | "response.reasoning_summary.delta"
        | "response.reasoning_summary_text.delta" => {
            let delta = match payload.get("delta") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Object(obj)) => obj
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
                _ => String::new(),
            };
            out.extend(state.push_reasoning(&delta));
        }
        "response.function_call_arguments.delta" => {
            if let Some(call_id) = event_call_id(payload) {
                let name = payload.get("name").and_then(|n| n.as_str());
                let slot = state.slot_for_call(&call_id, name);
                if let Some(delta) = payload.get("delta").and_then(|d| d.as_str()) {
                    out.extend(state.push_arguments(slot, delta));
                }
            }
        }
        "response.function_call_arguments.done" => {
            if let Some(call_id) = event_call_id(payload) {
                let name = payload.get("name").and_then(|n| n.as_str());
                let slot = state.slot_for_call(&call_id, name);
                if let Some(full) = payload.get("arguments").and_then(|a| a.as_str()) {
                    out.extend(state.reconcile_arguments(slot, full));
                }
            }
        }
        "response.output_item.added" | "response.output_item.done" => {
            let item = payload.get("item").cloned().unwrap_or(Value::Null);
            if item.get("type").and_then(|t| t.as_str()) == Some("function_call") {
                out.extend(reconcile_function_call_item(state, &item));
            }
        }
        "response.completed" | "response.incomplete" | "response.failed" => {
            out.extend(finish_from_response(state, payload.get("response")));
        }
        _ => {}
    }

    out
}

fn capture_response_identity(state: &mut StreamState, response: Option<&Value>) {
    let Some(response) = response else { return };
    if state.response_id.is_none() {
        state.response_id = response
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from);
    }
    if state.model.is_none() {
        state.model = response
            .get("model")
            .and_then(|v| v.as_str())
            .map(String::from);
    }
    if state.created.is_none() {
        state.created = response.get("created_at").and_then(|v| v.as_u64());
    }
}

fn event_call_id(payload: &Value) -> Option<String> {
    payload
        .get("call_id")
        .or_else(|| payload.get("item_id"))
        .and_then(|v| v.as_str())
        .map(String::from)
}

fn reconcile_function_call_item(state: &mut StreamState, item: &Value) -> Vec<StreamDelta> {
    let call_id = item
        .get("call_id")
        .or_else(|| item.get("id"))
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(fresh_call_id);
    let name = item.get("name").and_then(|n| n.as_str());
    let slot = state.slot_for_call(&call_id, name);
    match item.get("arguments").and_then(|a| a.as_str()) {
        Some(full) if !full.is_empty() => state
            .reconcile_arguments(slot, full)
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

/// Terminal handling: reconcile anything the final response carries that the
/// deltas missed, then emit the one Finish (+Usage) pair.
fn finish_from_response(state: &mut StreamState, response: Option<&Value>) -> Vec<StreamDelta> {
    let mut out = Vec::new();

    if let Some(response) = response {
        capture_response_identity(state, Some(response));

        for item in response
            .get("output")
            .and_then(|o| o.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default()
        {
            match item.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "message" => {
                    let text = crate::converters::content::text_from_value(
                        item.get("content").unwrap_or(&Value::Null),
                    );
                    out.extend(state.reconcile_text(&text));
                }
                "function_call" => {
                    out.extend(reconcile_function_call_item(state, item));
                }
                _ => {}
            }
        }

        if state.finish_reason.is_none() {
            let status = response.get("status").and_then(|s| s.as_str());
            if status == Some("incomplete") {
                let reason = response
                    .pointer("/incomplete_details/reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("length");
                state.finish_reason = Some(converters::map_finish_reason(reason, false));
            }
        }

        if let Some(usage) = response.get("usage") {
            let prompt = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let completion = usage
                .get("output_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let total = usage.get("total_tokens").and_then(|v| v.as_u64());
            state.usage = Some(converters::usage_from_counts(prompt, completion, total));
        }
    }

    out.extend(emit_finish(state));
    out
}

/// Emit Finish (and Usage, when known) exactly once per stream.
pub fn emit_finish(state: &mut StreamState) -> Vec<StreamDelta> {
    if state.finished {
        return Vec::new();
    }
    state.finished = true;
    let mut out = vec![StreamDelta::Finish {
        reason: state.computed_finish_reason(),
    }];
    if let Some(usage) = state.usage.clone() {
        out.push(StreamDelta::Usage(usage));
    }
    out
}

/// Decode one Chat Completions chunk payload.
pub fn decode_chat_event(state: &mut StreamState, payload: &Value) -> Vec<StreamDelta> {
    let mut out = Vec::new();

    if state.response_id.is_none() {
        state.response_id = payload.get("id").and_then(|v| v.as_str()).map(String::from);
    }
    if state.model.is_none() {
        state.model = payload
            .get("model")
            .and_then(|v| v.as_str())
            .map(String::from);
    }
    if state.created.is_none() {
        state.created = payload.get("created").and_then(|v| v.as_u64());
    }
    if let Some(usage) = payload.get("usage").filter(|u| !u.is_null()) {
        if let Ok(parsed) = serde_json::from_value::<Usage>(usage.clone()) {
            state.usage = Some(parsed);
        }
    }

    let Some(choice) = payload
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        return out;
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
            out.extend(state.push_text(content));
        }
        let reasoning = delta
            .get("reasoning_content")
            .or_else(|| delta.get("reasoning"))
            .and_then(|r| r.as_str());
        if let Some(reasoning) = reasoning {
            out.extend(state.push_reasoning(reasoning));
        }
        for call in delta
            .get("tool_calls")
            .and_then(|t| t.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default()
        {
            let upstream_index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let name = call
                .pointer("/function/name")
                .and_then(|n| n.as_str());
            let slot = match state.index_map.get(&upstream_index).copied() {
                Some(slot) => slot,
                None => {
                    let call_id = call
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or_else(fresh_call_id);
                    let slot = state.slot_for_call(&call_id, name);
                    state.index_map.insert(upstream_index, slot);
                    slot
                }
            };
            if let Some(arguments) = call
                .pointer("/function/arguments")
                .and_then(|a| a.as_str())
            {
                out.extend(state.push_arguments(slot, arguments));
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        if state.finish_reason.is_none() {
            state.finish_reason = Some(converters::map_finish_reason(reason, false));
        }
        out.extend(emit_finish(state));
    }

    out
}

/// Decode one Claude Messages stream event payload.
pub fn decode_claude_event(state: &mut StreamState, payload: &Value) -> Vec<StreamDelta> {
    let mut out = Vec::new();
    let event_type = payload.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            let message = payload.get("message").cloned().unwrap_or(Value::Null);
            if state.response_id.is_none() {
                state.response_id = message
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            if state.model.is_none() {
                state.model = message
                    .get("model")
                    .and_then(|v| v.as_str())
                    .map(String::from);
            }
            if let Some(input) = message
                .pointer("/usage/input_tokens")
                .and_then(|v| v.as_u64())
            {
                state.usage = Some(Usage {
                    prompt_tokens: input,
                    completion_tokens: 0,
                    total_tokens: input,
                });
            }
        }
        "content_block_start" => {
            let index = payload.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let block = payload.get("content_block").cloned().unwrap_or(Value::Null);
            let kind = match block.get("type").and_then(|t| t.as_str()).unwrap_or("text") {
                "tool_use" => {
                    let call_id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or_else(fresh_call_id);
                    let name = block.get("name").and_then(|n| n.as_str());
                    ClaudeBlockKind::Tool(state.slot_for_call(&call_id, name))
                }
                "thinking" => ClaudeBlockKind::Thinking,
                _ => ClaudeBlockKind::Text,
            };
            state.claude_blocks.insert(index, kind);
        }
        "content_block_delta" => {
            let index = payload.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
            let kind = state
                .claude_blocks
                .get(&index)
                .copied()
                .unwrap_or(ClaudeBlockKind::Text);
            let delta = payload.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(|t| t.as_str()).unwrap_or("") {
                "text_delta" => {
                    if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                        out.extend(state.push_text(text));
                    }
                }
                "input_json_delta" => {
                    if let ClaudeBlockKind::Tool(slot) = kind {
                        if let Some(json) = delta.get("partial_json").and_then(|p| p.as_str()) {
                            out.extend(state.push_arguments(slot, json));
                        }
                    }
                }
                "thinking_delta" => {
                    if let Some(thinking) = delta.get("thinking").and_then(|t| t.as_str()) {
                        out.extend(state.push_reasoning(thinking));
                    }
                }
                _ => {}
            }
        }
        "message_delta" => {
            if let Some(reason) = payload
                .pointer("/delta/stop_reason")
                .and_then(|r| r.as_str())
            {
                if state.finish_reason.is_none() {
                    state.finish_reason = Some(converters::map_finish_reason(reason, false));
                }
            }
            if let Some(output) = payload
                .pointer("/usage/output_tokens")
                .and_then(|v| v.as_u64())
            {
                let prompt = state.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0);
                state.usage = Some(converters::usage_from_counts(prompt, output, None));
            }
            out.extend(emit_finish(state));
        }
        _ => {}
    }

    out
}

/// Decode one Gemini streamGenerateContent chunk payload.
pub fn decode_gemini_event(state: &mut StreamState, payload: &Value) -> Vec<StreamDelta> {
    let mut out = Vec::new();

    if state.model.is_none() {
        state.model = payload
            .get("modelVersion")
            .and_then(|v| v.as_str())
            .map(String::from);
    }

    let candidate = payload
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    if let Some(parts) = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(|p| p.as_array())
    {
        for part in parts {
            if let Some(call) = part.get("functionCall") {
                let call_id = fresh_call_id();
                let name = call.get("name").and_then(|n| n.as_str()).unwrap_or("");
                let slot = state.slot_for_call(&call_id, Some(name));
                state.tool_calls[slot].thought_signature = part
                    .get("thoughtSignature")
                    .and_then(|s| s.as_str())
                    .map(String::from);
                let arguments = crate::converters::content::arguments_to_string(
                    call.get("args").unwrap_or(&Value::Null),
                );
                out.extend(state.push_arguments(slot, &arguments));
            } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                    out.extend(state.push_reasoning(text));
                } else {
                    out.extend(state.push_text(text));
                }
            }
        }
    }

    if let Some(usage) = payload.get("usageMetadata") {
        let prompt = usage
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let completion = usage
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        let total = usage.get("totalTokenCount").and_then(|v| v.as_u64());
        state.usage = Some(converters::usage_from_counts(prompt, completion, total));
    }

    if let Some(reason) = candidate
        .and_then(|c| c.get("finishReason"))
        .and_then(|r| r.as_str())
    {
        if state.finish_reason.is_none() {
            state.finish_reason = Some(converters::map_finish_reason(reason, false));
        }
        out.extend(emit_finish(state));
    }

    out
}

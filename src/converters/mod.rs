pub mod anthropic;
pub mod content;
pub mod gemini;
pub mod gemini_schema;
pub mod openai_chat;
pub mod openai_responses;

use crate::models::openai::Usage;

/// Map an upstream finish/stop reason onto the OpenAI vocabulary.
/// The presence of tool calls overrides whatever the upstream said.
pub fn map_finish_reason(upstream: &str, has_tool_calls: bool) -> String {
    if has_tool_calls {
        return "tool_calls".to_string();
    }
    match upstream.to_ascii_lowercase().as_str() {
        "stop" | "end_turn" | "completed" => "stop".to_string(),
        "length" | "max_tokens" | "max_tokens_reached" | "max_output_tokens" => {
            "length".to_string()
        }
        "safety" | "recitation" | "content_filter" => "content_filter".to_string(),
        "tool_use" | "tool_calls" | "function_call" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

/// Build OpenAI usage from the upstream's (prompt, completion, total) counts,
/// summing when the upstream omits the total.
pub fn usage_from_counts(prompt: u64, completion: u64, total: Option<u64>) -> Usage {
    Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total.unwrap_or(prompt + completion),
    }
}

/// Prefer `resp_<suffix>` when the upstream id is `chatcmpl_<suffix>`,
/// otherwise mint a fresh one.
pub fn response_id_from_chat_id(chat_id: &str) -> String {
    if let Some(suffix) = chat_id
        .strip_prefix("chatcmpl_")
        .or_else(|| chat_id.strip_prefix("chatcmpl-"))
    {
        format!("resp_{}", suffix)
    } else if chat_id.starts_with("resp_") {
        chat_id.to_string()
    } else {
        fresh_response_id()
    }
}

pub fn fresh_response_id() -> String {
    format!("resp_{}", uuid::Uuid::new_v4().simple())
}

pub fn fresh_chat_id() -> String {
    format!("chatcmpl_{}", uuid::Uuid::new_v4().simple())
}

pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

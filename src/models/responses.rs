use serde::{Deserialize, Serialize};
use serde_json::Value;

/// OpenAI Responses API request
///
/// `input` stays a raw Value: items arrive in many shapes (plain strings,
/// role messages, function_call / function_call_output items, typed parts)
/// and are normalized by the converter, not the deserializer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Conversation anchor - string id or `{id}` object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    /// Responses-style flat function tools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// `{effort: "low"|"medium"|"high"}`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_retention: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// OpenAI Responses API response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesResponse {
    pub id: String,
    pub object: String,
    pub created_at: u64,
    pub status: String,
    pub model: String,
    /// Output items (message / function_call / reasoning), loosely typed
    pub output: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_accepts_string_and_array() {
        let req: ResponsesRequest =
            serde_json::from_str(r#"{"model":"m","input":"hello"}"#).unwrap();
        assert_eq!(req.input, Some(Value::String("hello".into())));

        let req: ResponsesRequest = serde_json::from_str(
            r#"{"model":"m","input":[{"role":"user","content":"hello"}]}"#,
        )
        .unwrap();
        assert!(req.input.unwrap().is_array());
    }

    #[test]
    fn test_conversation_shapes() {
        let req: ResponsesRequest =
            serde_json::from_str(r#"{"model":"m","conversation":"conv_1"}"#).unwrap();
        assert_eq!(req.conversation, Some(Value::String("conv_1".into())));

        let req: ResponsesRequest =
            serde_json::from_str(r#"{"model":"m","conversation":{"id":"conv_1"}}"#).unwrap();
        assert_eq!(req.conversation.unwrap()["id"], "conv_1");
    }
}

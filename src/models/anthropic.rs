use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Anthropic Messages API Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    /// System prompt - string or content blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<MessageContent>,
    pub messages: Vec<Message>,
    /// Required by the Messages API
    pub max_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Extended thinking configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Message content - string or content blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Message in conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// "user" or "assistant"
    pub role: String,
    pub content: MessageContent,
}

/// Content block
///
/// One struct for every block type ("text", "image", "tool_use",
/// "tool_result", "thinking"); unused fields stay None and are skipped
/// during serialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ImageSource>,
    /// tool_use id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// tool_use name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// tool_use input
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// tool_result reference
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    /// tool_result payload - string or nested blocks
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// thinking text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// thinking signature, echoed back on later turns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

/// Image source for image blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    /// base64 payload
    pub data: String,
}

/// Tool definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

/// Extended thinking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub thinking_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

/// Anthropic Messages API Response (non-streaming)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// count_tokens reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountTokensResponse {
    pub input_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_skips_unused_fields() {
        let block = ContentBlock::text("hi");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hi"}));
    }

    #[test]
    fn test_tool_use_round_trip() {
        let raw = r#"{"type":"tool_use","id":"toolu_1","name":"ping","input":{"x":1}}"#;
        let block: ContentBlock = serde_json::from_str(raw).unwrap();
        assert_eq!(block.block_type, "tool_use");
        assert_eq!(block.id.as_deref(), Some("toolu_1"));
        assert_eq!(block.input, Some(serde_json::json!({"x":1})));
    }

    #[test]
    fn test_system_accepts_blocks() {
        let raw = r#"{"model":"m","max_tokens":10,"system":[{"type":"text","text":"be brief"}],"messages":[]}"#;
        let req: MessagesRequest = serde_json::from_str(raw).unwrap();
        match req.system.unwrap() {
            MessageContent::Blocks(blocks) => assert_eq!(blocks[0].text.as_deref(), Some("be brief")),
            MessageContent::Text(_) => panic!("expected blocks"),
        }
    }
}

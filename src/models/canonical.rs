use serde_json::Value;

/// The pivot representation every translator decodes into and re-encodes
/// from. Created per request, owned by the dispatcher, dropped when the
/// response is sent.
#[derive(Debug, Clone, Default)]
pub struct CanonicalRequest {
    /// Upstream model name (already resolved)
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    pub tools: Vec<FunctionSpec>,
    pub tool_choice: Option<Value>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub stream: bool,
    pub max_output_tokens: Option<u64>,
    pub reasoning_effort: Option<String>,
    pub user: Option<String>,
    /// OpenAI Responses multi-turn anchors, forwarded when the upstream
    /// speaks that dialect
    pub previous_response_id: Option<String>,
    pub conversation: Option<String>,
}

impl CanonicalRequest {
    /// Index of the last user message, if any
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::User)
    }

    /// Total characters across all string payloads, the trimmer's budget unit
    pub fn char_count(&self) -> usize {
        self.messages.iter().map(|m| m.char_count()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" | "developer" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" | "model" => Some(Self::Assistant),
            "tool" | "function" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    /// Assistant-only
    pub tool_calls: Vec<CanonicalToolCall>,
    /// Tool-role only: which call this message answers
    pub tool_call_id: Option<String>,
    /// Reasoning text surfaced by the upstream
    pub reasoning: Option<String>,
}

impl CanonicalMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(text.into())],
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
        }
    }

    /// All text parts concatenated in order
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                ContentPart::Image { .. } => None,
            })
            .collect()
    }

    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ContentPart::Image { .. }))
    }

    pub fn char_count(&self) -> usize {
        let parts: usize = self
            .parts
            .iter()
            .map(|p| match p {
                ContentPart::Text(t) => t.chars().count(),
                ContentPart::Image { data, .. } => data.len(),
            })
            .sum();
        let calls: usize = self
            .tool_calls
            .iter()
            .map(|c| c.arguments.chars().count())
            .sum();
        parts + calls
    }
}

/// Canonical content part
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Inline image, always base64 by the time it reaches the pivot
    Image {
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalToolCall {
    pub call_id: String,
    pub name: String,
    /// Always a JSON string
    pub arguments: String,
    /// Gemini thinking text attached to this call
    pub thought: Option<String>,
    pub thought_signature: Option<String>,
}

impl CanonicalToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
            thought: None,
            thought_signature: None,
        }
    }
}

/// Function schema offered to the model
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

/// Mint a tool-call id in the shape upstreams expect
pub fn fresh_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

use crate::{
    converters::content,
    error::AppError,
    models::{
        canonical::{
            fresh_call_id, CanonicalMessage, CanonicalRequest, CanonicalToolCall, ContentPart,
            FunctionSpec, Role,
        },
        openai::{
            ChatCompletionRequest, ChatMessage, ContentBlock, FunctionCall, ImageUrl,
            MessageContent, Tool, ToolCall,
        },
    },
};

/// Decode a Chat Completions request into the canonical pivot.
pub async fn to_canonical(
    client: &reqwest::Client,
    req: &ChatCompletionRequest,
) -> Result<CanonicalRequest, AppError> {
    let mut messages = Vec::with_capacity(req.messages.len());

    for msg in &req.messages {
        let role = Role::parse(&msg.role).unwrap_or(Role::User);
        let parts = match &msg.content {
            Some(content) => content::normalize_openai_content(client, content).await,
            None => Vec::new(),
        };

        let tool_calls = msg
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|call| CanonicalToolCall {
                call_id: if call.id.is_empty() {
                    fresh_call_id()
                } else {
                    call.id.clone()
                },
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
                thought: None,
                thought_signature: None,
            })
            .collect();

        messages.push(CanonicalMessage {
            role,
            parts,
            tool_calls,
            tool_call_id: msg.tool_call_id.clone(),
            reasoning: msg.reasoning_content.clone(),
        });
    }

    let tools = req
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|tool| FunctionSpec {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            parameters: tool.function.parameters.clone(),
        })
        .collect();

    Ok(CanonicalRequest {
        model: req.model.clone(),
        messages,
        tools,
        tool_choice: req.tool_choice.clone(),
        temperature: req.temperature,
        top_p: req.top_p,
        stop: req.stop.clone().map(|s| s.into_vec()),
        stream: req.stream.unwrap_or(false),
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        reasoning_effort: req.reasoning_effort.clone(),
        user: req.user.clone(),
        previous_response_id: None,
        conversation: None,
    })
}

/// Encode the canonical pivot as a Chat Completions request body.
pub fn from_canonical(req: &CanonicalRequest) -> ChatCompletionRequest {
    let messages = req.messages.iter().map(encode_message).collect();

    let tools: Vec<Tool> = req
        .tools
        .iter()
        .map(|spec| Tool {
            tool_type: "function".to_string(),
            function: crate::models::openai::FunctionDefinition {
                name: spec.name.clone(),
                description: spec.description.clone(),
                parameters: spec.parameters.clone(),
            },
        })
        .collect();

    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.max_output_tokens,
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stream: if req.stream { Some(true) } else { None },
        stop: req
            .stop
            .clone()
            .map(crate::models::openai::StopSequences::Many),
        presence_penalty: None,
        frequency_penalty: None,
        user: req.user.clone(),
        tools: if tools.is_empty() { None } else { Some(tools) },
        tool_choice: req.tool_choice.clone(),
        reasoning_effort: req.reasoning_effort.clone(),
        response_format: None,
    }
}

fn encode_message(msg: &CanonicalMessage) -> ChatMessage {
    let content = if msg.has_images() {
        let blocks = msg
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => ContentBlock::Text { text: text.clone() },
                ContentPart::Image { mime_type, data } => ContentBlock::ImageUrl {
                    image_url: ImageUrl::Object {
                        url: format!("data:{};base64,{}", mime_type, data),
                        detail: None,
                    },
                },
            })
            .collect();
        Some(MessageContent::Blocks(blocks))
    } else if msg.parts.is_empty() {
        None
    } else {
        Some(MessageContent::Text(msg.joined_text()))
    };

    let tool_calls = if msg.tool_calls.is_empty() {
        None
    } else {
        Some(
            msg.tool_calls
                .iter()
                .map(|call| ToolCall {
                    id: call.call_id.clone(),
                    call_type: "function".to_string(),
                    function: FunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect(),
        )
    };

    ChatMessage {
        role: msg.role.as_str().to_string(),
        content,
        name: None,
        tool_calls,
        tool_call_id: msg.tool_call_id.clone(),
        reasoning_content: msg.reasoning.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::StopSequences;

    fn sample_request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "echo".to_string(),
            messages: vec![
                ChatMessage::text("system", "be brief"),
                ChatMessage::text("user", "hi"),
                ChatMessage {
                    role: "assistant".to_string(),
                    content: None,
                    name: None,
                    tool_calls: Some(vec![ToolCall {
                        id: "call_1".to_string(),
                        call_type: "function".to_string(),
                        function: FunctionCall {
                            name: "ping".to_string(),
                            arguments: "{\"x\":1}".to_string(),
                        },
                    }]),
                    tool_call_id: None,
                    reasoning_content: None,
                },
                ChatMessage {
                    role: "tool".to_string(),
                    content: Some(MessageContent::Text("pong".to_string())),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some("call_1".to_string()),
                    reasoning_content: None,
                },
            ],
            max_tokens: Some(128),
            max_completion_tokens: None,
            temperature: Some(0.2),
            top_p: None,
            n: None,
            stream: Some(false),
            stop: Some(StopSequences::One("END".to_string())),
            presence_penalty: None,
            frequency_penalty: None,
            user: Some("u1".to_string()),
            tools: None,
            tool_choice: None,
            reasoning_effort: None,
            response_format: None,
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_roles_and_tool_calls() {
        let client = reqwest::Client::new();
        let original = sample_request();
        let canonical = to_canonical(&client, &original).await.unwrap();
        let rebuilt = from_canonical(&canonical);

        assert_eq!(rebuilt.model, original.model);
        assert_eq!(rebuilt.messages.len(), original.messages.len());
        for (a, b) in rebuilt.messages.iter().zip(original.messages.iter()) {
            assert_eq!(a.role, b.role);
            assert_eq!(a.tool_call_id, b.tool_call_id);
            assert_eq!(a.tool_calls, b.tool_calls);
            let a_text = a.content.as_ref().map(|c| c.joined_text());
            let b_text = b.content.as_ref().map(|c| c.joined_text());
            assert_eq!(a_text, b_text);
        }
        assert_eq!(rebuilt.max_tokens, original.max_tokens);
        assert_eq!(rebuilt.stop, Some(StopSequences::Many(vec!["END".into()])));
    }

    #[tokio::test]
    async fn test_missing_tool_call_id_is_minted() {
        let client = reqwest::Client::new();
        let mut req = sample_request();
        req.messages[2].tool_calls.as_mut().unwrap()[0].id = String::new();
        let canonical = to_canonical(&client, &req).await.unwrap();
        let call = &canonical.messages[2].tool_calls[0];
        assert!(call.call_id.starts_with("call_"));
        assert!(call.call_id.len() > "call_".len());
    }

    #[tokio::test]
    async fn test_blocks_text_concatenation() {
        let client = reqwest::Client::new();
        let mut req = sample_request();
        req.messages[1].content = Some(MessageContent::Blocks(vec![
            ContentBlock::Text { text: "a".into() },
            ContentBlock::InputText { text: "b".into() },
        ]));
        let canonical = to_canonical(&client, &req).await.unwrap();
        assert_eq!(canonical.messages[1].joined_text(), "ab");
    }
}

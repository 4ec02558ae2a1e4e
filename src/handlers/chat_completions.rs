use crate::{
    auth::AuthInfo,
    converters::openai_chat,
    error::AppError,
    handlers::common::{self, AppState, RequestContext},
    models::openai::ChatCompletionRequest,
    router, session,
    streaming::ClientDialect,
};
use axum::{body::Bytes, extract::State, http::HeaderMap, response::Response, Extension};
use serde_json::Value;

/// Handle POST /v1/chat/completions (and /chat/completions)
pub async fn handle(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let request: ChatCompletionRequest = parse_request(common::parse_body(&body)?)?;

    let config = state.config.load();
    let resolved = router::resolve(&config, &request.model, None)?;
    let provider = resolved.provider.clone();
    let model = resolved.model.clone();
    drop(config);

    let canonical = openai_chat::to_canonical(&state.http_client(), &request).await?;

    let session_key = session::derive_session_key(
        headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        request.user.as_deref(),
        &request.model,
        &common::first_user_text(&canonical),
        Some(&auth.token),
    );

    let ctx = RequestContext {
        session_key,
        client_dialect: ClientDialect::OpenAiChat,
        client_model: request.model.clone(),
    };
    common::run(&state, ctx, canonical, provider, model).await
}

fn parse_request(body: Value) -> Result<ChatCompletionRequest, AppError> {
    if body.get("model").and_then(|m| m.as_str()).unwrap_or("").is_empty() {
        return Err(AppError::InvalidRequest("Missing model".to_string()));
    }
    if body
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|m| m.is_empty())
        .unwrap_or(true)
    {
        return Err(AppError::InvalidRequest("Missing messages".to_string()));
    }
    serde_json::from_value(body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid request: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_missing_model() {
        let err = parse_request(json!({"messages": [{"role": "user", "content": "hi"}]}))
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing model");
    }

    #[test]
    fn test_parse_rejects_empty_messages() {
        let err = parse_request(json!({"model": "m", "messages": []})).unwrap_err();
        assert_eq!(err.to_string(), "Missing messages");
    }

    #[test]
    fn test_parse_accepts_minimal() {
        let request = parse_request(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(request.model, "m");
    }
}

use crate::{
    auth::AuthInfo,
    converters::openai_responses,
    error::AppError,
    handlers::common::{self, AppState, RequestContext},
    models::responses::ResponsesRequest,
    router, session,
    streaming::ClientDialect,
};
use axum::{body::Bytes, extract::State, http::HeaderMap, response::Response, Extension};

/// Handle POST /v1/responses (and /responses, /openai/v1/responses)
pub async fn handle(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = common::parse_body(&body)?;
    if body.get("model").and_then(|m| m.as_str()).unwrap_or("").is_empty() {
        return Err(AppError::InvalidRequest("Missing model".to_string()));
    }
    let request: ResponsesRequest = serde_json::from_value(body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid request: {}", e)))?;

    let config = state.config.load();
    let resolved = router::resolve(&config, &request.model, None)?;
    let provider = resolved.provider.clone();
    let model = resolved.model.clone();
    drop(config);

    let canonical = openai_responses::to_canonical(&state.http_client(), &request).await?;

    let session_key = session::derive_session_key(
        headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        request.user.as_deref(),
        &request.model,
        &common::first_user_text(&canonical),
        Some(&auth.token),
    );

    let ctx = RequestContext {
        session_key,
        client_dialect: ClientDialect::OpenAiResponses,
        client_model: request.model.clone(),
    };
    common::run(&state, ctx, canonical, provider, model).await
}

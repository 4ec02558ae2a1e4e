use crate::{
    auth::AuthInfo,
    config::ApiMode,
    converters,
    dispatch::build_upstream_headers,
    error::AppError,
    handlers::common::{self, AppState, RequestContext},
    models::canonical::{CanonicalMessage, CanonicalRequest, Role},
    models::openai::{CompletionChoice, CompletionRequest, CompletionResponse},
    router, session,
    streaming::ClientDialect,
    urls,
};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
    Extension, Json,
};

/// Handle POST /v1/completions - legacy text completions, served by
/// forwarding the prompt as a single user message to a Responses upstream.
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
    let request: CompletionRequest = serde_json::from_value(body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid request: {}", e)))?;

    let config = state.config.load();
    let resolved = router::resolve(&config, &request.model, None)?;
    if resolved.provider.api_mode != ApiMode::OpenAiResponses {
        return Err(AppError::Unsupported(format!(
            "Legacy completions require an openai-responses provider; '{}' is {}",
            resolved.provider.id,
            resolved.provider.api_mode.as_str()
        )));
    }
    let provider = resolved.provider.clone();
    let model = resolved.model.clone();
    drop(config);

    let prompt = request.prompt.joined();
    let mut canonical = CanonicalRequest {
        model: model.upstream_model.clone(),
        messages: vec![CanonicalMessage::text(Role::User, prompt.clone())],
        temperature: request.temperature,
        top_p: request.top_p,
        max_output_tokens: request.max_tokens,
        stream: false,
        user: request.user.clone(),
        ..Default::default()
    };
    crate::trimmer::trim(&mut canonical, &state.options.trim_limits());

    let session_key = session::derive_session_key(
        headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        request.user.as_deref(),
        &request.model,
        &prompt,
        Some(&auth.token),
    );
    let ctx = RequestContext {
        session_key,
        client_dialect: ClientDialect::OpenAiChat,
        client_model: request.model.clone(),
    };

    let request_body =
        converters::openai_responses::from_canonical(&canonical, &provider.quirks);
    let request_variants = crate::variants::build_variants(&request_body);
    let candidate_urls = urls::synthesize(
        provider.api_mode,
        &provider.base_urls,
        &provider.endpoints,
        &canonical.model,
        false,
    );
    let upstream_headers = build_upstream_headers(&provider)?;

    let (chat, _) = common::non_stream_pivot(
        &state,
        &ctx,
        &canonical,
        &provider,
        &candidate_urls,
        &upstream_headers,
        &request_variants,
    )
    .await?;

    let choice = chat.choices.first();
    let completion = CompletionResponse {
        id: format!("cmpl_{}", uuid::Uuid::new_v4().simple()),
        object: "text_completion".to_string(),
        created: chat.created,
        model: request.model,
        choices: vec![CompletionChoice {
            index: 0,
            text: choice
                .and_then(|c| c.message.content.clone())
                .unwrap_or_default(),
            finish_reason: choice.and_then(|c| c.finish_reason.clone()),
        }],
        usage: chat.usage,
    };
    Ok(Json(completion).into_response())
}

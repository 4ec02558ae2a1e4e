use crate::{
    auth::AuthInfo,
    config::ApiMode,
    converters::anthropic,
    dispatch::build_upstream_headers,
    error::AppError,
    handlers::common::{self, AppState, RequestContext},
    models::anthropic::MessagesRequest,
    router, session,
    streaming::ClientDialect,
    urls,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::Value;

/// Handle POST /claude/v1/messages
pub async fn handle(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = common::parse_body(&body)?;
    let model_name = requested_model(&state, &body)?;

    let mut request: MessagesRequest = serde_json::from_value(body)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid request: {}", e)))?;
    request.model = model_name.clone();

    let config = state.config.load();
    let resolved = router::resolve(&config, &model_name, None)?;
    let provider = resolved.provider.clone();
    let model = resolved.model.clone();
    drop(config);

    let canonical = anthropic::to_canonical(&state.http_client(), &request).await?;

    let user_field = request
        .metadata
        .as_ref()
        .and_then(|m| m.get("user_id"))
        .and_then(|u| u.as_str())
        .map(String::from);
    let session_key = session::derive_session_key(
        headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        user_field.as_deref(),
        &model_name,
        &common::first_user_text(&canonical),
        Some(&auth.token),
    );

    let ctx = RequestContext {
        session_key,
        client_dialect: ClientDialect::Claude,
        client_model: model_name,
    };
    common::run(&state, ctx, canonical, provider, model).await
}

/// Handle POST /claude/v1/messages/count_tokens
///
/// Forwarded verbatim to the resolved provider; only a Claude upstream can
/// answer this.
pub async fn count_tokens(
    State(state): State<AppState>,
    Extension(_auth): Extension<AuthInfo>,
    body: Bytes,
) -> Result<Response, AppError> {
    let body = common::parse_body(&body)?;
    let model_name = requested_model(&state, &body)?;

    let config = state.config.load();
    let resolved = router::resolve(&config, &model_name, None)?;
    if resolved.provider.api_mode != ApiMode::Claude {
        return Err(AppError::Unsupported(format!(
            "count_tokens requires a claude provider; '{}' is {}",
            resolved.provider.id,
            resolved.provider.api_mode.as_str()
        )));
    }
    let provider = resolved.provider.clone();
    let upstream_model = resolved.model.upstream_model.clone();
    drop(config);

    let mut forwarded = body;
    if let Some(obj) = forwarded.as_object_mut() {
        obj.insert("model".to_string(), Value::String(upstream_model.clone()));
    }

    let headers = build_upstream_headers(&provider)?;
    let messages_urls = urls::synthesize(
        ApiMode::Claude,
        &provider.base_urls,
        &provider.endpoints,
        &upstream_model,
        false,
    );

    let client = state.http_client();
    let mut last_error = None;
    for url in &messages_urls {
        let count_url = format!("{}/count_tokens", url.trim_end_matches('/'));
        let mut request = client.post(&count_url).json(&forwarded);
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let bytes = response.bytes().await.unwrap_or_default();
                if status.is_success() {
                    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                        return Ok(Json(value).into_response());
                    }
                }
                last_error = Some(AppError::Upstream {
                    status: if status.is_success() {
                        StatusCode::BAD_GATEWAY
                    } else {
                        status
                    },
                    message: String::from_utf8_lossy(&bytes).to_string(),
                });
            }
            Err(e) => last_error = Some(e.into()),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        AppError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: "no upstream URL answered count_tokens".to_string(),
        }
    }))
}

fn requested_model(state: &AppState, body: &Value) -> Result<String, AppError> {
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default();
    if !model.is_empty() {
        return Ok(model.to_string());
    }
    state
        .options
        .claude_default_model
        .clone()
        .ok_or_else(|| AppError::InvalidRequest("Missing model".to_string()))
}

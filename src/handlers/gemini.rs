use crate::{
    auth::AuthInfo,
    converters::gemini,
    error::AppError,
    handlers::common::{self, AppState, RequestContext},
    models::gemini::GenerateContentRequest,
    router, session,
    streaming::ClientDialect,
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    Extension,
};

/// Handle POST /gemini/v1beta/models/<model>:{generateContent|streamGenerateContent}
///
/// The model and method travel in one path segment ("echo:generateContent").
pub async fn handle(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthInfo>,
    Path(model_and_method): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let (model_name, method) = model_and_method
        .split_once(':')
        .ok_or_else(|| AppError::NotFound(format!("Unknown method: {}", model_and_method)))?;
    let stream = match method {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return Err(AppError::NotFound(format!("Unknown method: {}", other)));
        }
    };

    let request: GenerateContentRequest = serde_json::from_value(common::parse_body(&body)?)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid request: {}", e)))?;
    if request.contents.is_empty() {
        return Err(AppError::InvalidRequest("Missing contents".to_string()));
    }

    let config = state.config.load();
    let resolved = match router::resolve(&config, model_name, None) {
        Ok(resolved) => Ok(resolved),
        Err(original) => match &state.options.gemini_default_model {
            Some(fallback) => router::resolve(&config, fallback, None).map_err(|_| original),
            None => Err(original),
        },
    }?;
    let provider = resolved.provider.clone();
    let model = resolved.model.clone();
    drop(config);

    let mut canonical = gemini::to_canonical(&request)?;
    canonical.model = model.upstream_model.clone();
    canonical.stream = stream;

    let session_key = session::derive_session_key(
        headers.get("x-session-id").and_then(|v| v.to_str().ok()),
        None,
        model_name,
        &common::first_user_text(&canonical),
        Some(&auth.token),
    );

    let ctx = RequestContext {
        session_key,
        client_dialect: ClientDialect::Gemini,
        client_model: model_name.to_string(),
    };
    common::run(&state, ctx, canonical, provider, model).await
}

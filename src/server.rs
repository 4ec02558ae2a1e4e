use crate::{
    auth,
    error::AppError,
    handlers::{
        chat_completions, common::AppState, completions, gemini, health, messages, models,
        responses,
    },
};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

const ALLOWED_HEADERS: &str = "authorization,content-type,x-session-id,x-api-key,x-goog-api-key,anthropic-api-key,x-anthropic-api-key,anthropic-version,anthropic-beta";

/// Assemble the full route table.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions::handle))
        .route("/chat/completions", post(chat_completions::handle))
        .route("/v1/completions", post(completions::handle))
        .route("/completions", post(completions::handle))
        .route("/v1/responses", post(responses::handle))
        .route("/responses", post(responses::handle))
        .route("/openai/v1/responses", post(responses::handle))
        .route("/claude/v1/messages", post(messages::handle))
        .route(
            "/claude/v1/messages/count_tokens",
            post(messages::count_tokens),
        )
        .route(
            "/gemini/v1beta/models/:model_and_method",
            post(gemini::handle),
        )
        .route("/v1/models", get(models::openai_list))
        .route("/models", get(models::openai_list))
        .route("/openai/v1/models", get(models::openai_list))
        .route("/claude/v1/models", get(models::openai_list))
        .route("/gemini/v1beta/models", get(models::gemini_list))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), loop_guard));

    Router::new()
        .route("/health", get(health::handle))
        .route("/v1/health", get(health::handle))
        .merge(protected)
        .fallback(fallback)
        .layer(middleware::from_fn(preflight_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let router = build_router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}

async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let info = auth::authenticate(&state.options, req.headers(), req.uri())?;
    req.extensions_mut().insert(info);
    Ok(next.run(req).await)
}

/// Refuse requests that would route back into this gateway: any provider
/// base URL on the same host whose path prefixes the request path.
async fn loop_guard(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let request_host = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(|h| h.to_ascii_lowercase());

    if let Some(request_host) = request_host {
        let request_path = req.uri().path();
        let config = state.config.load();
        for provider in &config.providers {
            for base in &provider.base_urls {
                if let Ok(url) = url::Url::parse(base) {
                    if host_matches(&url, &request_host)
                        && request_path.starts_with(url.path().trim_end_matches('/'))
                    {
                        return Err(AppError::RoutingLoop(provider.id.clone()));
                    }
                }
            }
        }
    }

    Ok(next.run(req).await)
}

fn host_matches(url: &url::Url, request_host: &str) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    match url.port() {
        Some(port) => format!("{}:{}", host, port) == request_host,
        None => host == request_host || request_host == format!("{}:80", host) || request_host == format!("{}:443", host),
    }
}

/// OPTIONS on ANY path answers the preflight before routing happens.
async fn preflight_middleware(req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS {
        return preflight(req.headers());
    }
    next.run(req).await
}

async fn fallback(method: Method, req: Request) -> Response {
    AppError::NotFound(format!("No route for {} {}", method, req.uri().path())).into_response()
}

fn preflight(headers: &HeaderMap) -> Response {
    let origin = headers
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("*")
        .to_string();
    (
        StatusCode::NO_CONTENT,
        [
            ("access-control-allow-origin", origin),
            (
                "access-control-allow-methods",
                "GET,POST,OPTIONS".to_string(),
            ),
            ("access-control-allow-headers", ALLOWED_HEADERS.to_string()),
            ("access-control-max-age", "86400".to_string()),
        ],
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matches() {
        let url = url::Url::parse("https://example.com/v1").unwrap();
        assert!(host_matches(&url, "example.com"));
        assert!(host_matches(&url, "example.com:443"));
        assert!(!host_matches(&url, "other.com"));

        let url = url::Url::parse("http://localhost:8787").unwrap();
        assert!(host_matches(&url, "localhost:8787"));
        assert!(!host_matches(&url, "localhost:9999"));
    }
}

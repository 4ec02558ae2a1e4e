//! End-to-end tests through the assembled router with mocked upstreams.

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use llm_relay::{
    config::{parse_config, RuntimeOptions},
    dispatch::Dispatcher,
    handlers::common::AppState,
    server::build_router,
    session::SessionCache,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEST_KEY: &str = "test-key";

fn state_with_config(config_json: &str) -> AppState {
    let config = parse_config(config_json).expect("test config parses");
    let options = RuntimeOptions::from_lookup(|name| match name {
        "WORKER_AUTH_KEY" => Some(TEST_KEY.to_string()),
        _ => None,
    });
    AppState {
        config: Arc::new(ArcSwap::from_pointee(config)),
        options: Arc::new(options),
        dispatcher: Arc::new(Dispatcher::new(reqwest::Client::new(), None)),
        session_cache: SessionCache::in_memory(),
    }
}

fn responses_provider_config(base_url: &str) -> String {
    format!(
        r#"{{"providers": {{"p1": {{
            "type": "openai-responses",
            "baseURL": "{}",
            "apiKey": "sk-up1",
            "models": {{"echo": {{"upstreamModel": "echo-upstream"}}}}
        }}}}}}"#,
        base_url
    )
}

fn post(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn sse_frames(response: axum::response::Response) -> Vec<String> {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes)
        .split("\n\n")
        .filter_map(|frame| frame.trim().strip_prefix("data: ").map(String::from))
        .collect()
}

#[tokio::test]
async fn test_health_is_open() {
    let app = build_router(state_with_config(&responses_provider_config("https://up1")));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert!(body["time"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_missing_auth_gets_401_with_challenge() {
    let app = build_router(state_with_config(&responses_provider_config("https://up1")));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"model": "echo", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer"
    );
}

#[tokio::test]
async fn test_wrong_key_gets_401() {
    let app = build_router(state_with_config(&responses_provider_config("https://up1")));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::AUTHORIZATION, "Bearer nope")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"model": "echo", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_ambiguous_model_is_400() {
    let config = r#"{"providers": {
        "a": {"type": "openai-responses", "baseURL": "https://a", "apiKey": "k", "models": {"m": {}}},
        "b": {"type": "claude", "baseURL": "https://b", "apiKey": "k", "models": {"m": {}}}
    }}"#;
    let app = build_router(state_with_config(config));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["message"], "Ambiguous model: m");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_loop_guard_refuses_self_forward() {
    let app = build_router(state_with_config(&responses_provider_config(
        "https://example.com/v1",
    )));
    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/chat/completions")
        .header(header::HOST, "example.com")
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_KEY))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"model": "echo", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("infinite routing loop"));
}

#[tokio::test]
async fn test_cors_preflight() {
    let app = build_router(state_with_config(&responses_provider_config("https://up1")));
    let request = Request::builder()
        .method(Method::OPTIONS)
        .uri("/v1/chat/completions")
        .header("origin", "https://client.example")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap(),
        "https://client.example"
    );
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap(),
        "GET,POST,OPTIONS"
    );
    assert!(headers
        .get("access-control-allow-headers")
        .unwrap()
        .to_str()
        .unwrap()
        .contains("x-session-id"));
}

#[tokio::test]
async fn test_model_list_dedupes_and_sorts() {
    let config = r#"{"providers": {
        "a": {"type": "openai-responses", "baseURL": "https://a", "apiKey": "k",
              "models": {"zeta": {}, "shared": {}}},
        "b": {"type": "claude", "baseURL": "https://b", "apiKey": "k",
              "models": {"alpha": {}, "shared": {}}}
    }}"#;
    let app = build_router(state_with_config(config));
    let request = Request::builder()
        .uri("/v1/models")
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_KEY))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["a.shared", "alpha", "b.shared", "zeta"]);
}

#[tokio::test]
async fn test_gemini_model_list_format() {
    let app = build_router(state_with_config(&responses_provider_config("https://up1")));
    let request = Request::builder()
        .uri("/gemini/v1beta/models")
        .header(header::AUTHORIZATION, format!("Bearer {}", TEST_KEY))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let body = body_json(response).await;
    let model = &body["models"][0];
    assert_eq!(model["name"], "models/echo");
    assert_eq!(
        model["supportedGenerationMethods"],
        json!(["generateContent", "streamGenerateContent"])
    );
}

/// Chat streaming against a Responses upstream that emits a tool call:
/// role chunk, two argument deltas on a stable slot, terminal chunk,
/// [DONE] - in that order.
#[tokio::test]
async fn test_chat_stream_with_tool_call_over_responses_upstream() {
    let upstream = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"type\":\"response.created\",\"response\":{\"id\":\"r1\",\"model\":\"echo-upstream\",\"created_at\":1}}\n\n",
        "data: {\"type\":\"response.function_call_arguments.delta\",\"call_id\":\"c1\",\"name\":\"ping\",\"delta\":\"{\\\"x\\\"\"}\n\n",
        "data: {\"type\":\"response.function_call_arguments.delta\",\"call_id\":\"c1\",\"delta\":\":1}\"}\n\n",
        "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"r1\",\"status\":\"completed\"}}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let app = build_router(state_with_config(&responses_provider_config(
        &upstream.uri(),
    )));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({
                "model": "echo",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}],
                "tools": [{"type": "function", "function": {"name": "ping", "parameters": {"type": "object"}}}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream; charset=utf-8"
    );
    assert!(response.headers().contains_key("x-request-id"));

    let frames = sse_frames(response).await;

    let role: Value = serde_json::from_str(&frames[0]).unwrap();
    assert_eq!(role["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(role["model"], "echo");

    let first: Value = serde_json::from_str(&frames[1]).unwrap();
    let call = &first["choices"][0]["delta"]["tool_calls"][0];
    assert_eq!(call["index"], 0);
    assert_eq!(call["id"], "c1");
    assert_eq!(call["function"]["name"], "ping");
    assert_eq!(call["function"]["arguments"], "{\"x\"");

    let second: Value = serde_json::from_str(&frames[2]).unwrap();
    assert_eq!(
        second["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        ":1}"
    );

    let terminal: Value = serde_json::from_str(&frames[3]).unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "tool_calls");

    assert_eq!(frames.last().unwrap(), "[DONE]");
    assert_eq!(frames.iter().filter(|f| *f == "[DONE]").count(), 1);
}

/// Gemini inbound, non-stream, against a Gemini upstream.
#[tokio::test]
async fn test_gemini_inbound_non_stream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/models/gemini-1.5-pro:generateContent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "hello from upstream"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 4, "totalTokenCount": 6}
        })))
        .mount(&upstream)
        .await;

    let config = format!(
        r#"{{"providers": {{"g": {{
            "type": "gemini",
            "baseURL": "{}",
            "apiKey": "g-key",
            "models": {{"echo": {{"upstreamModel": "gemini-1.5-pro"}}}}
        }}}}}}"#,
        upstream.uri()
    );
    let app = build_router(state_with_config(&config));
    let response = app
        .oneshot(post(
            "/gemini/v1beta/models/echo:generateContent",
            json!({"contents": [{"role": "user", "parts": [{"text": "hi"}]}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body["candidates"][0]["content"]["parts"][0]["text"],
        "hello from upstream"
    );
    assert_eq!(body["usageMetadata"]["totalTokenCount"], 6);
}

/// Claude inbound translated onto a Responses upstream.
#[tokio::test]
async fn test_claude_inbound_over_responses_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_abc",
            "status": "completed",
            "model": "echo-upstream",
            "output": [{
                "type": "message", "role": "assistant",
                "content": [{"type": "output_text", "text": "hi there"}]
            }],
            "usage": {"input_tokens": 3, "output_tokens": 5}
        })))
        .mount(&upstream)
        .await;

    let app = build_router(state_with_config(&responses_provider_config(
        &upstream.uri(),
    )));
    let response = app
        .oneshot(post(
            "/claude/v1/messages",
            json!({
                "model": "echo",
                "max_tokens": 64,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["text"], "hi there");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 3);
}

/// count_tokens needs a Claude provider behind it.
#[tokio::test]
async fn test_count_tokens_requires_claude_provider() {
    let app = build_router(state_with_config(&responses_provider_config("https://up1")));
    let response = app
        .oneshot(post(
            "/claude/v1/messages/count_tokens",
            json!({"model": "echo", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("count_tokens"));
}

/// Upstream 404s on the inferred path; the alternate spelling answers.
#[tokio::test]
async fn test_url_failover_across_candidates() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/responses"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_alt",
            "status": "completed",
            "model": "echo-upstream",
            "output": [{
                "type": "message", "role": "assistant",
                "content": [{"type": "output_text", "text": "via alternate"}]
            }]
        })))
        .mount(&upstream)
        .await;

    let app = build_router(state_with_config(&responses_provider_config(
        &upstream.uri(),
    )));
    let response = app
        .oneshot(post(
            "/v1/chat/completions",
            json!({"model": "echo", "messages": [{"role": "user", "content": "hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["choices"][0]["message"]["content"], "via alternate");
    assert_eq!(body["model"], "echo");
}

/// Responses inbound: the second turn picks up previous_response_id from the
/// session cache.
#[tokio::test]
async fn test_previous_response_id_round_trip() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/responses"))
        .respond_with(|req: &wiremock::Request| {
            let body: Value = serde_json::from_slice(&req.body).unwrap_or_default();
            match body.get("previous_response_id").and_then(|v| v.as_str()) {
                Some("resp_turn1") => ResponseTemplate::new(200).set_body_json(json!({
                    "id": "resp_turn2",
                    "status": "completed",
                    "model": "echo-upstream",
                    "output": [{"type": "message", "role": "assistant",
                                "content": [{"type": "output_text", "text": "turn two"}]}]
                })),
                None => ResponseTemplate::new(200).set_body_json(json!({
                    "id": "resp_turn1",
                    "status": "completed",
                    "model": "echo-upstream",
                    "output": [{"type": "message", "role": "assistant",
                                "content": [{"type": "output_text", "text": "turn one"}]}]
                })),
                Some(other) => ResponseTemplate::new(400)
                    .set_body_string(format!("unexpected previous_response_id {}", other)),
            }
        })
        .expect(2)
        .mount(&upstream)
        .await;

    let state = state_with_config(&responses_provider_config(&upstream.uri()));
    let app = build_router(state);

    let first = app
        .clone()
        .oneshot({
            let mut req = post("/v1/responses", json!({"model": "echo", "input": "hello"}));
            req.headers_mut()
                .insert("x-session-id", "sess-1".parse().unwrap());
            req
        })
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_json(first).await;
    assert_eq!(first_body["id"], "resp_turn1");

    let second = app
        .oneshot({
            let mut req = post("/v1/responses", json!({"model": "echo", "input": "again"}));
            req.headers_mut()
                .insert("x-session-id", "sess-1".parse().unwrap());
            req
        })
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(second_body["id"], "resp_turn2");
}

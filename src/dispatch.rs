use crate::{
    config::{ApiMode, BreakerConfig, ProviderConfig},
    error::AppError,
};
use axum::http::StatusCode;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use regex::RegexSet;
use serde_json::Value;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

/// How long a 200 event-stream response may stay silent before it is
/// classified as empty.
const EMPTY_SSE_DEADLINE: Duration = Duration::from_millis(150);

/// Gemini retry ladder for relays that return empty candidates on large caps
const GEMINI_SHRINK_STEPS: [u64; 3] = [8192, 4096, 2048];

/// Error bodies that indicate a path/auth/model problem; retrying another
/// variant of the same request cannot fix these.
static FATAL_BODY_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)not\s+found",
        r"(?i)unauthorized",
        r"(?i)invalid\s+api\s+key",
        r"(?i)model_not_found",
        r"(?i)does\s+not\s+exist",
        r"(?i)unknown\s+model",
        r"(?i)no\s+such\s+model",
    ])
    .expect("fatal body patterns compile")
});

/// What came back from the upstream, already classified.
pub enum UpstreamReply {
    /// A live SSE body (its first peeked chunk re-chained on front)
    Stream(BoxStream<'static, Result<Bytes, reqwest::Error>>),
    /// A complete JSON body
    Json(Value),
}

impl std::fmt::Debug for UpstreamReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpstreamReply::Stream(_) => f.write_str("UpstreamReply::Stream(..)"),
            UpstreamReply::Json(v) => f.debug_tuple("UpstreamReply::Json").field(v).finish(),
        }
    }
}

/// One (status, body) pair; the FIRST error observed is what callers see
/// after exhaustion, later variants tend to produce more confusing ones.
#[derive(Debug, Clone)]
struct UpstreamError {
    status: StatusCode,
    body: String,
}

enum Classified {
    /// Try the next variant against the same URL
    NextVariant,
    /// Skip to the next URL
    NextUrl,
    /// Stop immediately and echo this upstream error
    Fatal,
}

#[derive(Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Upstream dispatch engine: iterates candidate URLs and request variants,
/// detects empty event streams, and remembers per-URL failure streaks.
pub struct Dispatcher {
    client: reqwest::Client,
    breaker: Option<BreakerConfig>,
    breaker_state: DashMap<String, BreakerState>,
}

impl Dispatcher {
    pub fn new(client: reqwest::Client, breaker: Option<BreakerConfig>) -> Self {
        Self {
            client,
            breaker,
            breaker_state: DashMap::new(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// POST each variant against each URL until one sticks.
    pub async fn dispatch(
        &self,
        urls: &[String],
        headers: &[(String, String)],
        variants: &[Value],
        stream: bool,
    ) -> Result<UpstreamReply, AppError> {
        let mut first_error: Option<UpstreamError> = None;

        for url in urls {
            if self.breaker_open(url) {
                tracing::debug!(url = %url, "Skipping URL, circuit breaker open");
                continue;
            }
            'variants: for variant in variants {
                match self.try_once(url, headers, variant, stream).await {
                    Ok(reply) => {
                        self.breaker_record(url, true);
                        return Ok(reply);
                    }
                    Err(error) => {
                        tracing::debug!(
                            url = %url,
                            status = %error.status,
                            "Upstream attempt failed"
                        );
                        let classified = classify(&error);
                        if error.status.is_server_error() || error.status == StatusCode::BAD_GATEWAY
                        {
                            self.breaker_record(url, false);
                        }
                        if first_error.is_none() {
                            first_error = Some(error.clone());
                        }
                        match classified {
                            Classified::NextVariant => continue 'variants,
                            Classified::NextUrl => break 'variants,
                            Classified::Fatal => {
                                return Err(AppError::Upstream {
                                    status: error.status,
                                    message: error.body,
                                })
                            }
                        }
                    }
                }
            }
        }

        let error = first_error.unwrap_or(UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            body: "No upstream URL produced a response".to_string(),
        });
        Err(AppError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: error.body,
        })
    }

    /// One POST. A 200 event-stream that stays silent is retried as JSON
    /// (`stream:false`, then with `stream` absent) before giving up.
    async fn try_once(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        stream: bool,
    ) -> Result<UpstreamReply, UpstreamError> {
        let response = self.post(url, headers, body, stream).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError { status, body });
        }

        let is_sse = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/event-stream"))
            .unwrap_or(false);

        if is_sse {
            let mut body_stream = response.bytes_stream();
            match tokio::time::timeout(EMPTY_SSE_DEADLINE, body_stream.next()).await {
                Ok(Some(Ok(first))) => {
                    let chained = futures::stream::iter(vec![Ok(first)])
                        .chain(body_stream)
                        .boxed();
                    return Ok(UpstreamReply::Stream(chained));
                }
                Ok(Some(Err(e))) => {
                    return Err(UpstreamError {
                        status: StatusCode::BAD_GATEWAY,
                        body: format!("upstream stream error: {}", e),
                    });
                }
                Ok(None) | Err(_) => {
                    tracing::debug!(url = %url, "Empty event stream, retrying as JSON");
                    return self.retry_empty_sse(url, headers, body).await;
                }
            }
        }

        let bytes = response.bytes().await.map_err(|e| UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            body: format!("upstream body read failed: {}", e),
        })?;
        let value = serde_json::from_slice(&bytes).map_err(|_| UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            body: format!(
                "upstream returned non-JSON body: {}",
                String::from_utf8_lossy(&bytes[..bytes.len().min(512)])
            ),
        })?;
        Ok(UpstreamReply::Json(value))
    }

    /// Empty-SSE recovery: same body with `stream:false` and a JSON accept,
    /// then once more with `stream` absent.
    async fn retry_empty_sse(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
    ) -> Result<UpstreamReply, UpstreamError> {
        let mut without_stream = body.clone();
        if let Some(obj) = without_stream.as_object_mut() {
            obj.insert("stream".to_string(), Value::Bool(false));
        }
        let mut last = None;
        for attempt in [Some(without_stream), strip_stream_field(body)] {
            let Some(attempt) = attempt else { continue };
            match self.post(url, headers, &attempt, false).await {
                Ok(response) if response.status().is_success() => {
                    let bytes = response.bytes().await.map_err(|e| UpstreamError {
                        status: StatusCode::BAD_GATEWAY,
                        body: format!("upstream body read failed: {}", e),
                    })?;
                    if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                        return Ok(UpstreamReply::Json(value));
                    }
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    last = Some(UpstreamError { status, body });
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream produced an empty event stream".to_string(),
        }))
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &Value,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        request = request.header(
            "accept",
            if stream {
                "text/event-stream"
            } else {
                "application/json"
            },
        );
        request.send().await.map_err(|e| UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            body: format!("upstream request failed: {}", e),
        })
    }

    /// Gemini JSON path: some relays answer 200 with empty candidates when
    /// maxOutputTokens is large. Shrink the cap stepwise, drop the thinking
    /// config, and finally assemble a reply from the SSE endpoint.
    pub async fn dispatch_gemini_json(
        &self,
        json_urls: &[String],
        sse_urls: &[String],
        headers: &[(String, String)],
        body: &Value,
    ) -> Result<Value, AppError> {
        let mut attempts: Vec<Value> = vec![body.clone()];
        for cap in GEMINI_SHRINK_STEPS {
            let mut variant = body.clone();
            if let Some(config) = variant
                .pointer_mut("/generationConfig")
                .and_then(|c| c.as_object_mut())
            {
                config.insert("maxOutputTokens".to_string(), Value::from(cap));
            }
            attempts.push(variant);
        }
        let mut no_thinking = body.clone();
        if let Some(config) = no_thinking
            .pointer_mut("/generationConfig")
            .and_then(|c| c.as_object_mut())
        {
            config.remove("thinkingConfig");
        }
        attempts.push(no_thinking);

        let mut first_error: Option<AppError> = None;
        for attempt in &attempts {
            match self.dispatch(json_urls, headers, &[attempt.clone()], false).await {
                Ok(UpstreamReply::Json(value)) => {
                    if gemini_has_candidates(&value) {
                        return Ok(value);
                    }
                    tracing::debug!("Gemini returned empty candidates, shrinking caps");
                }
                Ok(UpstreamReply::Stream(_)) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        // last resort: read the stream endpoint and fold it into one reply
        match self.dispatch(sse_urls, headers, &[body.clone()], true).await {
            Ok(UpstreamReply::Stream(stream)) => {
                let merged = assemble_gemini_stream(stream).await;
                if gemini_has_candidates(&merged) {
                    return Ok(merged);
                }
            }
            Ok(UpstreamReply::Json(value)) => {
                if gemini_has_candidates(&value) {
                    return Ok(value);
                }
            }
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        Err(first_error.unwrap_or_else(|| AppError::Upstream {
            status: StatusCode::BAD_GATEWAY,
            message: "Gemini returned no candidates".to_string(),
        }))
    }

    fn breaker_open(&self, url: &str) -> bool {
        let Some(config) = &self.breaker else {
            return false;
        };
        let Some(state) = self.breaker_state.get(url) else {
            return false;
        };
        if state.consecutive_failures < config.threshold {
            return false;
        }
        state
            .last_failure
            .map(|at| at.elapsed() < Duration::from_secs(config.cooldown_secs))
            .unwrap_or(false)
    }

    fn breaker_record(&self, url: &str, success: bool) {
        if self.breaker.is_none() {
            return;
        }
        let mut state = self.breaker_state.entry(url.to_string()).or_default();
        if success {
            state.consecutive_failures = 0;
            state.last_failure = None;
        } else {
            state.consecutive_failures += 1;
            state.last_failure = Some(Instant::now());
        }
    }
}

fn strip_stream_field(body: &Value) -> Option<Value> {
    let mut out = body.clone();
    out.as_object_mut()?.remove("stream")?;
    Some(out)
}

fn classify(error: &UpstreamError) -> Classified {
    match error.status.as_u16() {
        400 | 422 => {
            if FATAL_BODY_PATTERNS.is_match(&error.body) {
                Classified::NextUrl
            } else {
                Classified::NextVariant
            }
        }
        403 | 404 | 405 | 500 | 502 | 503 => Classified::NextUrl,
        _ => Classified::Fatal,
    }
}

fn gemini_has_candidates(value: &Value) -> bool {
    value
        .get("candidates")
        .and_then(|c| c.as_array())
        .map(|c| {
            c.iter().any(|candidate| {
                candidate
                    .pointer("/content/parts")
                    .and_then(|p| p.as_array())
                    .map(|p| !p.is_empty())
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

/// Fold a Gemini SSE stream into a single non-stream reply.
async fn assemble_gemini_stream(
    mut stream: BoxStream<'static, Result<Bytes, reqwest::Error>>,
) -> Value {
    use crate::streaming::sse::{SseEvent, SseParser};

    let mut parser = SseParser::new();
    let mut text = String::new();
    let mut extra_parts: Vec<Value> = Vec::new();
    let mut finish_reason = None;
    let mut usage = None;
    let mut model_version = None;

    let mut handle = |payload: &str| {
        let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        if model_version.is_none() {
            model_version = chunk.get("modelVersion").cloned();
        }
        if let Some(u) = chunk.get("usageMetadata") {
            usage = Some(u.clone());
        }
        if let Some(candidate) = chunk
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        {
            if let Some(reason) = candidate.get("finishReason") {
                if !reason.is_null() {
                    finish_reason = Some(reason.clone());
                }
            }
            for part in candidate
                .pointer("/content/parts")
                .and_then(|p| p.as_array())
                .map(|p| p.as_slice())
                .unwrap_or_default()
            {
                if let Some(t) = part.get("text").and_then(|t| t.as_str()) {
                    if part.get("thought").and_then(|v| v.as_bool()) != Some(true) {
                        text.push_str(t);
                        continue;
                    }
                }
                extra_parts.push(part.clone());
            }
        }
    };

    while let Some(Ok(bytes)) = stream.next().await {
        for event in parser.push(&bytes) {
            if let SseEvent::Data(payload) = event {
                handle(&payload);
            }
        }
    }
    if let Some(SseEvent::Data(payload)) = parser.finish() {
        handle(&payload);
    }

    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(serde_json::json!({"text": text}));
    }
    parts.extend(extra_parts);

    serde_json::json!({
        "candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": finish_reason.unwrap_or(Value::String("STOP".to_string())),
            "index": 0,
        }],
        "usageMetadata": usage,
        "modelVersion": model_version,
    })
}

/// Auth and version headers for one upstream dialect.
pub fn build_upstream_headers(provider: &ProviderConfig) -> Result<Vec<(String, String)>, AppError> {
    let api_key = provider.resolve_api_key().ok_or_else(|| {
        AppError::ConfigError(format!("provider '{}' has no usable API key", provider.id))
    })?;
    let headers = match provider.api_mode {
        ApiMode::OpenAiResponses | ApiMode::OpenAiChatCompletions => {
            vec![("authorization".to_string(), format!("Bearer {}", api_key))]
        }
        ApiMode::Claude => vec![
            ("x-api-key".to_string(), api_key),
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
        ],
        ApiMode::Gemini => vec![("x-goog-api-key".to_string(), api_key)],
    };
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(status: u16, body: &str) -> UpstreamError {
        UpstreamError {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_classification() {
        assert!(matches!(
            classify(&error(400, "temperature not supported")),
            Classified::NextVariant
        ));
        assert!(matches!(
            classify(&error(400, "Model_Not_Found: echo")),
            Classified::NextUrl
        ));
        assert!(matches!(
            classify(&error(422, "model does not exist")),
            Classified::NextUrl
        ));
        assert!(matches!(classify(&error(404, "")), Classified::NextUrl));
        assert!(matches!(classify(&error(503, "")), Classified::NextUrl));
        assert!(matches!(classify(&error(401, "")), Classified::Fatal));
        assert!(matches!(classify(&error(429, "")), Classified::Fatal));
    }

    #[test]
    fn test_gemini_has_candidates() {
        assert!(!gemini_has_candidates(&serde_json::json!({})));
        assert!(!gemini_has_candidates(
            &serde_json::json!({"candidates": [{"content": {"parts": []}}]})
        ));
        assert!(gemini_has_candidates(
            &serde_json::json!({"candidates": [{"content": {"parts": [{"text": "hi"}]}}]})
        ));
    }

    #[tokio::test]
    async fn test_assemble_gemini_stream() {
        let frames = vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"he\"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"llo\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"totalTokenCount\":3}}\n\n",
        ];
        let stream = futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok(Bytes::from(f.as_bytes().to_vec()))),
        )
        .boxed();
        let merged = assemble_gemini_stream(stream).await;
        assert_eq!(
            merged["candidates"][0]["content"]["parts"][0]["text"],
            "hello"
        );
        assert_eq!(merged["candidates"][0]["finishReason"], "STOP");
        assert_eq!(merged["usageMetadata"]["totalTokenCount"], 3);
    }

    #[tokio::test]
    async fn test_dispatch_empty_sse_falls_back_to_json() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        // streaming endpoint answers 200 event-stream with an empty body
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("accept", "text/event-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("", "text/event-stream"))
            .expect(1)
            .mount(&server)
            .await;
        // the JSON retry succeeds
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"id": "resp_1", "status": "completed", "output": []}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), None);
        let urls = vec![format!("{}/v1/responses", server.uri())];
        let variants = vec![serde_json::json!({"model": "m", "stream": true})];
        let reply = dispatcher
            .dispatch(&urls, &[], &variants, true)
            .await
            .unwrap();

        match reply {
            UpstreamReply::Json(value) => assert_eq!(value["id"], "resp_1"),
            UpstreamReply::Stream(_) => panic!("expected JSON fallback"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_first_error_preserved() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/responses"))
            .respond_with(ResponseTemplate::new(400).set_body_string("first failure body"))
            .expect(2)
            .mount(&server)
            .await;

        let dispatcher = Dispatcher::new(reqwest::Client::new(), None);
        let urls = vec![format!("{}/v1/responses", server.uri())];
        let variants = vec![
            serde_json::json!({"model": "m", "max_output_tokens": 5}),
            serde_json::json!({"model": "m", "max_tokens": 5}),
        ];
        let err = dispatcher
            .dispatch(&urls, &[], &variants, false)
            .await
            .unwrap_err();
        match err {
            AppError::Upstream { status, message } => {
                assert_eq!(status, StatusCode::BAD_GATEWAY);
                assert!(message.contains("first failure body"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_breaker_skips_after_threshold() {
        let dispatcher = Dispatcher::new(
            reqwest::Client::new(),
            Some(BreakerConfig {
                threshold: 2,
                cooldown_secs: 60,
            }),
        );
        dispatcher.breaker_record("https://u", false);
        assert!(!dispatcher.breaker_open("https://u"));
        dispatcher.breaker_record("https://u", false);
        assert!(dispatcher.breaker_open("https://u"));
        dispatcher.breaker_record("https://u", true);
        assert!(!dispatcher.breaker_open("https://u"));
    }
}

use crate::{
    config::{ApiMode, GatewayConfig, ModelConfig, ProviderConfig, RuntimeOptions},
    converters,
    dispatch::{build_upstream_headers, Dispatcher, UpstreamReply},
    error::AppError,
    models::canonical::{CanonicalRequest, Role},
    models::openai::ChatCompletionResponse,
    session::{SessionCache, ThoughtSignatureEntry},
    streaming::{self, ClientDialect, PumpConfig},
    trimmer, urls, variants,
};
use arc_swap::ArcSwap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Application state shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub options: Arc<RuntimeOptions>,
    pub dispatcher: Arc<Dispatcher>,
    pub session_cache: SessionCache,
}

impl AppState {
    pub fn http_client(&self) -> reqwest::Client {
        self.dispatcher.client().clone()
    }
}

/// Per-request routing context assembled by the inbound handler
pub struct RequestContext {
    pub session_key: String,
    pub client_dialect: ClientDialect,
    /// The model name the client asked for (echoed back in responses)
    pub client_model: String,
}

/// Parse a request body, mapping empty and malformed payloads onto the
/// error envelope instead of the framework's rejection.
pub fn parse_body(bytes: &[u8]) -> Result<Value, AppError> {
    if bytes.is_empty() {
        return Err(AppError::InvalidRequest("Empty request body".to_string()));
    }
    serde_json::from_slice(bytes)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}

/// Text of the first user message, the session-key fallback ingredient
pub fn first_user_text(canonical: &CanonicalRequest) -> String {
    canonical
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(|m| m.joined_text())
        .unwrap_or_default()
}

/// The full proxying flow shared by all inbound dialects: option overlay,
/// trimming, session-cache reads, dispatch, translation back, cache writes.
pub async fn run(
    state: &AppState,
    ctx: RequestContext,
    mut canonical: CanonicalRequest,
    provider: ProviderConfig,
    model: ModelConfig,
) -> Result<Response, AppError> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let stream = canonical.stream;

    tracing::info!(
        request_id = %request_id,
        model = %ctx.client_model,
        provider = %provider.id,
        upstream_model = %model.upstream_model,
        stream = stream,
        "Proxying request"
    );

    canonical.model = model.upstream_model.clone();
    apply_model_options(&mut canonical, &model, &state.options);

    trimmer::trim(&mut canonical, &state.options.trim_limits());

    // session-cache reads happen before dispatch
    let mut signatures: HashMap<String, String> = HashMap::new();
    match provider.api_mode {
        ApiMode::OpenAiResponses => {
            if canonical.previous_response_id.is_none()
                && canonical.conversation.is_none()
                && !provider.quirks.no_previous_response_id
            {
                canonical.previous_response_id = state
                    .session_cache
                    .get_previous_response_id(&ctx.session_key)
                    .await;
            }
            let anchored =
                canonical.previous_response_id.is_some() || canonical.conversation.is_some();
            trimmer::sanitize_tool_pairs(&mut canonical, anchored);
        }
        ApiMode::Gemini => {
            signatures = state
                .session_cache
                .get_thought_signatures(&ctx.session_key)
                .await
                .into_iter()
                .map(|(id, entry)| (id, entry.thought_signature))
                .collect();
        }
        _ => {}
    }

    let request_variants = build_bodies(&canonical, &provider, &signatures, &state.options);
    let candidate_urls = urls::synthesize(
        provider.api_mode,
        &provider.base_urls,
        &provider.endpoints,
        &canonical.model,
        stream,
    );
    let headers = build_upstream_headers(&provider)?;

    let mut response = if stream {
        run_stream(state, &ctx, &provider, &candidate_urls, &headers, &request_variants).await?
    } else {
        run_non_stream(
            state,
            &ctx,
            &canonical,
            &provider,
            &candidate_urls,
            &headers,
            &request_variants,
        )
        .await?
    };

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    Ok(response)
}

fn apply_model_options(
    canonical: &mut CanonicalRequest,
    model: &ModelConfig,
    options: &RuntimeOptions,
) {
    if canonical.reasoning_effort.is_none() {
        canonical.reasoning_effort = model
            .options
            .reasoning_effort
            .clone()
            .or_else(|| options.reasoning_effort.clone());
    }
    if let Some(cap) = model.options.max_tokens {
        canonical.max_output_tokens = Some(canonical.max_output_tokens.unwrap_or(cap).min(cap));
    }
    if let Some(max_chars) = model.options.max_instructions_chars {
        if let Some(first) = canonical.messages.first_mut() {
            if first.role == Role::System {
                let text = first.joined_text();
                let len = text.chars().count();
                if len > max_chars {
                    let tail: String = text.chars().skip(len - max_chars).collect();
                    first.parts = vec![crate::models::canonical::ContentPart::Text(tail)];
                }
            }
        }
    }
}

/// Encode the canonical request for the provider's dialect. Only the
/// Responses dialect gets shape variants; the others have a single stable
/// wire form.
fn build_bodies(
    canonical: &CanonicalRequest,
    provider: &ProviderConfig,
    signatures: &HashMap<String, String>,
    options: &RuntimeOptions,
) -> Vec<Value> {
    match provider.api_mode {
        ApiMode::OpenAiResponses => {
            let body = converters::openai_responses::from_canonical(canonical, &provider.quirks);
            variants::build_variants(&body)
        }
        ApiMode::OpenAiChatCompletions => {
            let body = converters::openai_chat::from_canonical(canonical);
            vec![serde_json::to_value(body).unwrap_or_default()]
        }
        ApiMode::Claude => {
            let body = converters::anthropic::from_canonical(canonical);
            vec![serde_json::to_value(body).unwrap_or_default()]
        }
        ApiMode::Gemini => {
            let body = converters::gemini::from_canonical(
                canonical,
                signatures,
                options.gemini_max_output_tokens,
            );
            vec![serde_json::to_value(body).unwrap_or_default()]
        }
    }
}

async fn run_stream(
    state: &AppState,
    ctx: &RequestContext,
    provider: &ProviderConfig,
    candidate_urls: &[String],
    headers: &[(String, String)],
    request_variants: &[Value],
) -> Result<Response, AppError> {
    let reply = state
        .dispatcher
        .dispatch(candidate_urls, headers, request_variants, true)
        .await?;

    let pump_config = PumpConfig {
        upstream_mode: provider.api_mode,
        client_dialect: ctx.client_dialect,
        model: ctx.client_model.clone(),
    };
    let hook = completion_hook(state, ctx, provider.api_mode);

    Ok(match reply {
        UpstreamReply::Stream(upstream) => {
            streaming::sse_response(upstream, pump_config, Some(hook))
        }
        // empty-SSE fallback succeeded with JSON: synthesize equivalent chunks
        UpstreamReply::Json(value) => {
            streaming::sse_response_from_json(value, pump_config, Some(hook))
        }
    })
}

/// Session-cache writes at stream completion.
fn completion_hook(
    state: &AppState,
    ctx: &RequestContext,
    upstream_mode: ApiMode,
) -> streaming::pump::CompletionHook {
    let cache = state.session_cache.clone();
    let session_key = ctx.session_key.clone();
    Box::new(move |final_state| {
        tokio::spawn(async move {
            match upstream_mode {
                ApiMode::OpenAiResponses => {
                    if let Some(id) = &final_state.response_id {
                        cache.put_previous_response_id(&session_key, id).await;
                    }
                }
                ApiMode::Gemini => {
                    let now = chrono::Utc::now().timestamp_millis();
                    let entries: Vec<(String, ThoughtSignatureEntry)> = final_state
                        .tool_calls
                        .iter()
                        .filter_map(|call| {
                            call.thought_signature.as_ref().map(|sig| {
                                (
                                    call.call_id.clone(),
                                    ThoughtSignatureEntry {
                                        thought_signature: sig.clone(),
                                        thought: call.thought.clone(),
                                        name: call.name.clone(),
                                        updated_at: now,
                                    },
                                )
                            })
                        })
                        .collect();
                    if !entries.is_empty() {
                        cache.put_thought_signatures(&session_key, entries).await;
                    }
                }
                _ => {}
            }
        });
    })
}

async fn run_non_stream(
    state: &AppState,
    ctx: &RequestContext,
    canonical: &CanonicalRequest,
    provider: &ProviderConfig,
    candidate_urls: &[String],
    headers: &[(String, String)],
    request_variants: &[Value],
) -> Result<Response, AppError> {
    let (chat, upstream_response_id) = non_stream_pivot(
        state,
        ctx,
        canonical,
        provider,
        candidate_urls,
        headers,
        request_variants,
    )
    .await?;
    Ok(encode_client_response(ctx, chat, upstream_response_id))
}

/// Dispatch without streaming and translate the reply into the chat pivot,
/// performing the session-cache writes on the way. Also returns the upstream
/// response id (Responses upstreams only) so the client keeps its linkage.
pub async fn non_stream_pivot(
    state: &AppState,
    ctx: &RequestContext,
    canonical: &CanonicalRequest,
    provider: &ProviderConfig,
    candidate_urls: &[String],
    headers: &[(String, String)],
    request_variants: &[Value],
) -> Result<(ChatCompletionResponse, Option<String>), AppError> {
    if provider.api_mode == ApiMode::Gemini {
        let sse_urls = urls::synthesize(
            provider.api_mode,
            &provider.base_urls,
            &provider.endpoints,
            &canonical.model,
            true,
        );
        let body = request_variants
            .first()
            .cloned()
            .unwrap_or(Value::Null);
        let value = state
            .dispatcher
            .dispatch_gemini_json(candidate_urls, &sse_urls, headers, &body)
            .await?;
        let resp = serde_json::from_value(value)
            .map_err(|e| AppError::Internal(format!("bad Gemini reply: {}", e)))?;
        let (mut chat, captured) = converters::gemini::chat_response_from_gemini(&resp);
        chat.model = ctx.client_model.clone();

        if !captured.is_empty() {
            let now = chrono::Utc::now().timestamp_millis();
            let entries = captured.into_iter().map(|sig| {
                (
                    sig.call_id,
                    ThoughtSignatureEntry {
                        thought_signature: sig.signature,
                        thought: sig.thought,
                        name: sig.name,
                        updated_at: now,
                    },
                )
            });
            state
                .session_cache
                .put_thought_signatures(&ctx.session_key, entries)
                .await;
        }
        return Ok((chat, None));
    }

    let reply = state
        .dispatcher
        .dispatch(candidate_urls, headers, request_variants, false)
        .await?;
    let value = match reply {
        UpstreamReply::Json(value) => value,
        UpstreamReply::Stream(_) => {
            return Err(AppError::Upstream {
                status: axum::http::StatusCode::BAD_GATEWAY,
                message: "upstream streamed an unrequested response".to_string(),
            })
        }
    };

    let mut upstream_response_id = None;
    let mut chat = match provider.api_mode {
        ApiMode::OpenAiResponses => {
            let (chat, response_id) =
                converters::openai_responses::chat_response_from_responses(&value)?;
            if let Some(id) = &response_id {
                state
                    .session_cache
                    .put_previous_response_id(&ctx.session_key, id)
                    .await;
            }
            upstream_response_id = response_id;
            chat
        }
        ApiMode::OpenAiChatCompletions => serde_json::from_value(value)
            .map_err(|e| AppError::Internal(format!("bad chat reply: {}", e)))?,
        ApiMode::Claude => {
            let resp = serde_json::from_value(value)
                .map_err(|e| AppError::Internal(format!("bad Claude reply: {}", e)))?;
            converters::anthropic::chat_response_from_messages(&resp)
        }
        ApiMode::Gemini => unreachable!("handled above"),
    };
    chat.model = ctx.client_model.clone();
    Ok((chat, upstream_response_id))
}

fn encode_client_response(
    ctx: &RequestContext,
    chat: ChatCompletionResponse,
    upstream_response_id: Option<String>,
) -> Response {
    match ctx.client_dialect {
        ClientDialect::OpenAiChat => Json(chat).into_response(),
        ClientDialect::OpenAiResponses => {
            let mut resp = converters::openai_responses::responses_response_from_chat(&chat);
            if let Some(id) = upstream_response_id {
                resp.id = id;
            }
            Json(resp).into_response()
        }
        ClientDialect::Claude => {
            Json(converters::anthropic::messages_response_from_chat(&chat)).into_response()
        }
        ClientDialect::Gemini => {
            Json(converters::gemini::gemini_response_from_chat(&chat)).into_response()
        }
    }
}

use crate::{
    config::ApiMode,
    converters,
    models::openai::ChatCompletionResponse,
    streaming::{
        decode,
        encode::{ClientDialect, Encoder},
        sse::{SseEvent, SseParser},
        state::{StreamDelta, StreamState},
    },
};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::convert::Infallible;
use tokio::sync::mpsc;

/// Cap on the raw-body buffer kept for the non-SSE fallback
const FALLBACK_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct PumpConfig {
    pub upstream_mode: ApiMode,
    pub client_dialect: ClientDialect,
    /// Client-facing model name (what the caller asked for)
    pub model: String,
}

/// Called with the final state once the stream ends, so handlers can persist
/// `previous_response_id` and thought signatures.
pub type CompletionHook = Box<dyn FnOnce(StreamState) + Send>;

/// Bridge an upstream SSE body to a client SSE response, translating
/// dialects on the fly.
///
/// A reader task decodes upstream events through the state machine and
/// pushes encoded frames into a bounded channel; the response body drains
/// it. Client disconnect drops the receiver, the next send fails, and the
/// reader (with the upstream body) is cancelled.
pub fn sse_response<S>(upstream: S, config: PumpConfig, on_complete: Option<CompletionHook>) -> Response
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        let mut state = StreamState::default();
        let mut encoder = Encoder::new(config.client_dialect, &config.model);
        let mut parser = SseParser::new();
        let mut raw = Vec::new();
        let mut client_gone = false;

        tokio::pin!(upstream);
        'read: while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream stream error, flushing terminal chunk");
                    break;
                }
            };
            if !parser.saw_data() && raw.len() < FALLBACK_BUFFER_LIMIT {
                raw.extend_from_slice(&bytes);
            }
            for event in parser.push(&bytes) {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(payload) => {
                        if !forward_payload(
                            &mut state,
                            &mut encoder,
                            &config,
                            &tx,
                            &payload,
                        )
                        .await
                        {
                            client_gone = true;
                            break 'read;
                        }
                    }
                }
            }
        }

        if !client_gone {
            if let Some(SseEvent::Data(payload)) = parser.finish() {
                if !forward_payload(&mut state, &mut encoder, &config, &tx, &payload).await {
                    client_gone = true;
                }
            }
        }

        // Non-SSE fallback: nothing ever looked like SSE but the body holds
        // JSON - reuse the non-stream translation and replay it as chunks.
        if !client_gone && !parser.saw_data() && !raw.is_empty() {
            if let Ok(value) = serde_json::from_slice::<Value>(&raw) {
                let deltas = synthesize_from_json(&mut state, config.upstream_mode, &value);
                if !send_deltas(&mut state, &mut encoder, &tx, deltas).await {
                    client_gone = true;
                }
            }
        }

        if !client_gone {
            // upstream closed early: flush a synthetic terminal chunk
            let terminal = decode::emit_finish(&mut state);
            let _ = send_deltas(&mut state, &mut encoder, &tx, terminal).await;
            let _ = tx.send("[DONE]".to_string()).await;
        }

        if let Some(hook) = on_complete {
            hook(state);
        }
    });

    stream_body(rx)
}

/// Serve a non-stream upstream JSON reply as a client-side stream (used when
/// the stream endpoint came up empty but the JSON fallback succeeded).
pub fn sse_response_from_json(
    value: Value,
    config: PumpConfig,
    on_complete: Option<CompletionHook>,
) -> Response {
    let (tx, rx) = mpsc::channel::<String>(32);

    tokio::spawn(async move {
        let mut state = StreamState::default();
        let mut encoder = Encoder::new(config.client_dialect, &config.model);
        let deltas = synthesize_from_json(&mut state, config.upstream_mode, &value);
        if send_deltas(&mut state, &mut encoder, &tx, deltas).await {
            let terminal = decode::emit_finish(&mut state);
            let _ = send_deltas(&mut state, &mut encoder, &tx, terminal).await;
            let _ = tx.send("[DONE]".to_string()).await;
        }
        if let Some(hook) = on_complete {
            hook(state);
        }
    });

    stream_body(rx)
}

fn stream_body(rx: mpsc::Receiver<String>) -> Response {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, Infallible>(Event::default().data(frame)), rx))
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        "content-type",
        "text/event-stream; charset=utf-8".parse().unwrap(),
    );
    headers.insert("cache-control", "no-cache".parse().unwrap());
    headers.insert("x-accel-buffering", "no".parse().unwrap());
    response
}

async fn forward_payload(
    state: &mut StreamState,
    encoder: &mut Encoder,
    config: &PumpConfig,
    tx: &mpsc::Sender<String>,
    payload: &str,
) -> bool {
    // malformed payloads are skipped silently
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return true;
    };
    let deltas = match config.upstream_mode {
        ApiMode::OpenAiResponses => decode::decode_responses_event(state, &value),
        ApiMode::OpenAiChatCompletions => decode::decode_chat_event(state, &value),
        ApiMode::Claude => decode::decode_claude_event(state, &value),
        ApiMode::Gemini => decode::decode_gemini_event(state, &value),
    };
    send_deltas(state, encoder, tx, deltas).await
}

/// Encode and send a batch of deltas. Returns false when the client is gone.
async fn send_deltas(
    state: &mut StreamState,
    encoder: &mut Encoder,
    tx: &mpsc::Sender<String>,
    deltas: Vec<StreamDelta>,
) -> bool {
    for delta in deltas {
        // the leading role chunk precedes the first visible content
        if !state.role_sent
            && matches!(
                delta,
                StreamDelta::Content(_) | StreamDelta::Reasoning(_) | StreamDelta::ToolCall { .. }
            )
        {
            state.role_sent = true;
            for frame in encoder.start(state) {
                if tx.send(frame).await.is_err() {
                    return false;
                }
            }
            for frame in encoder.encode(state, &StreamDelta::Role) {
                if tx.send(frame).await.is_err() {
                    return false;
                }
            }
        }
        if matches!(delta, StreamDelta::Finish { .. }) {
            for frame in encoder.start(state) {
                if tx.send(frame).await.is_err() {
                    return false;
                }
            }
        }
        for frame in encoder.encode(state, &delta) {
            if tx.send(frame).await.is_err() {
                return false;
            }
        }
    }
    true
}

/// Replay a non-stream upstream reply through the delta machinery so the
/// accumulators (and invariants) match a genuinely streamed response.
pub fn synthesize_from_json(
    state: &mut StreamState,
    upstream_mode: ApiMode,
    value: &Value,
) -> Vec<StreamDelta> {
    let chat: Option<ChatCompletionResponse> = match upstream_mode {
        ApiMode::OpenAiResponses => {
            match converters::openai_responses::chat_response_from_responses(value) {
                Ok((chat, response_id)) => {
                    state.response_id = response_id;
                    Some(chat)
                }
                Err(_) => None,
            }
        }
        ApiMode::OpenAiChatCompletions => serde_json::from_value(value.clone()).ok(),
        ApiMode::Claude => serde_json::from_value(value.clone())
            .ok()
            .map(|resp| converters::anthropic::chat_response_from_messages(&resp)),
        ApiMode::Gemini => serde_json::from_value(value.clone()).ok().map(|resp| {
            let (chat, captured) = converters::gemini::chat_response_from_gemini(&resp);
            // slots do not exist yet on this path; attach once they do
            state.pending_signatures = captured
                .into_iter()
                .map(|s| (s.call_id, s.signature))
                .collect();
            chat
        }),
    };

    let Some(chat) = chat else {
        return Vec::new();
    };

    let mut out = Vec::new();
    if state.model.is_none() && !chat.model.is_empty() {
        state.model = Some(chat.model.clone());
    }
    let Some(choice) = chat.choices.first() else {
        return out;
    };

    if let Some(reasoning) = &choice.message.reasoning_content {
        out.extend(state.push_reasoning(reasoning));
    }
    if let Some(content) = &choice.message.content {
        out.extend(state.push_text(content));
    }
    for call in choice.message.tool_calls.as_deref().unwrap_or_default() {
        let slot = state.slot_for_call(&call.id, Some(&call.function.name));
        if let Some(sig) = state.pending_signatures.iter().find(|(id, _)| id == &call.id) {
            state.tool_calls[slot].thought_signature = Some(sig.1.clone());
        }
        out.extend(state.push_arguments(slot, &call.function.arguments));
    }

    if let Some(reason) = &choice.finish_reason {
        if state.finish_reason.is_none() {
            state.finish_reason = Some(converters::map_finish_reason(reason, false));
        }
    }
    state.usage = chat.usage.clone();
    out.extend(decode::emit_finish(state));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn collect_frames(response: Response) -> Vec<String> {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        text.split("\n\n")
            .filter_map(|frame| frame.trim().strip_prefix("data: ").map(String::from))
            .collect()
    }

    fn byte_stream(frames: Vec<&'static str>) -> impl Stream<Item = Result<Bytes, reqwest::Error>> {
        futures::stream::iter(
            frames
                .into_iter()
                .map(|f| Ok(Bytes::from(f.as_bytes().to_vec()))),
        )
    }

    #[tokio::test]
    async fn test_responses_to_chat_tool_call_scenario() {
        let upstream = byte_stream(vec![
            "data: {\"type\":\"response.created\",\"response\":{\"id\":\"r1\",\"model\":\"echo-upstream\",\"created_at\":1}}\n\n",
            "data: {\"type\":\"response.function_call_arguments.delta\",\"call_id\":\"c1\",\"name\":\"ping\",\"delta\":\"{\\\"x\\\"\"}\n\n",
            "data: {\"type\":\"response.function_call_arguments.delta\",\"call_id\":\"c1\",\"delta\":\":1}\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"r1\",\"status\":\"completed\"}}\n\n",
            "data: [DONE]\n\n",
        ]);

        let response = sse_response(
            upstream,
            PumpConfig {
                upstream_mode: ApiMode::OpenAiResponses,
                client_dialect: ClientDialect::OpenAiChat,
                model: "echo".to_string(),
            },
            None,
        );
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream; charset=utf-8"
        );
        let frames = collect_frames(response).await;

        // role chunk first
        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");

        // first tool delta announces id and name with the first suffix
        let second: Value = serde_json::from_str(&frames[1]).unwrap();
        let call = &second["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["index"], 0);
        assert_eq!(call["id"], "c1");
        assert_eq!(call["function"]["name"], "ping");
        assert_eq!(call["function"]["arguments"], "{\"x\"");

        // second carries only the remaining suffix
        let third: Value = serde_json::from_str(&frames[2]).unwrap();
        assert_eq!(
            third["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            ":1}"
        );

        // terminal chunk then [DONE], each exactly once, in order
        let finish: Value = serde_json::from_str(&frames[3]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(frames.last().unwrap(), "[DONE]");
        let done_count = frames.iter().filter(|f| *f == "[DONE]").count();
        assert_eq!(done_count, 1);
        let finish_count = frames
            .iter()
            .filter_map(|f| serde_json::from_str::<Value>(f).ok())
            .filter(|v| !v["choices"][0]["finish_reason"].is_null())
            .count();
        assert_eq!(finish_count, 1);
    }

    #[tokio::test]
    async fn test_early_close_flushes_terminal() {
        let upstream = byte_stream(vec![
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"partial\"}\n\n",
            // upstream dies here: no completed event, no [DONE]
        ]);
        let response = sse_response(
            upstream,
            PumpConfig {
                upstream_mode: ApiMode::OpenAiResponses,
                client_dialect: ClientDialect::OpenAiChat,
                model: "echo".to_string(),
            },
            None,
        );
        let frames = collect_frames(response).await;
        assert_eq!(frames.last().unwrap(), "[DONE]");
        let finish: Value = serde_json::from_str(&frames[frames.len() - 2]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_non_sse_fallback_parses_whole_body() {
        let upstream = byte_stream(vec![
            "{\"id\":\"resp_9\",\"status\":\"completed\",\"model\":\"m\",",
            "\"output\":[{\"type\":\"message\",\"content\":[{\"type\":\"output_text\",\"text\":\"whole\"}]}]}",
        ]);
        let response = sse_response(
            upstream,
            PumpConfig {
                upstream_mode: ApiMode::OpenAiResponses,
                client_dialect: ClientDialect::OpenAiChat,
                model: "echo".to_string(),
            },
            None,
        );
        let frames = collect_frames(response).await;
        let content: Vec<&String> = frames
            .iter()
            .filter(|f| f.contains("\"content\":\"whole\""))
            .collect();
        assert_eq!(content.len(), 1);
        assert_eq!(frames.last().unwrap(), "[DONE]");
    }

    #[tokio::test]
    async fn test_completion_hook_sees_final_state() {
        let (state_tx, state_rx) = tokio::sync::oneshot::channel();
        let upstream = byte_stream(vec![
            "data: {\"type\":\"response.created\",\"response\":{\"id\":\"r42\"}}\n\n",
            "data: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n\n",
            "data: {\"type\":\"response.completed\",\"response\":{\"status\":\"completed\"}}\n\n",
            "data: [DONE]\n\n",
        ]);
        let response = sse_response(
            upstream,
            PumpConfig {
                upstream_mode: ApiMode::OpenAiResponses,
                client_dialect: ClientDialect::OpenAiResponses,
                model: "echo".to_string(),
            },
            Some(Box::new(move |state| {
                let _ = state_tx.send(state);
            })),
        );
        let _ = collect_frames(response).await;
        let state = state_rx.await.unwrap();
        assert_eq!(state.response_id.as_deref(), Some("r42"));
        assert_eq!(state.text, "hi");
    }
}

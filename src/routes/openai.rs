//! OpenAI-compatible chat completions adapter
//!
//! POST /v1/chat/completions. The OpenAI message list is reshaped into a
//! single composite prompt for the agent engine: system and developer
//! messages become an extra system prompt, everything else becomes tagged
//! conversation entries. Streaming responses bridge the agent-event bus to
//! SSE; a client disconnect stops forwarding but never cancels the run.

use bytes::Bytes;
use chrono::Utc;
use futures_util::stream;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::{Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::agent::{AgentEvent, EventStream, RunOutcome, RunPhase, RunRequest};
use crate::auth::{IdentityClaims, TenantContext};
use crate::billing::UsageRecord;
use crate::server::http::{json_response, AppState, BoxBody};

/// Handle an authorized chat-completions request
pub async fn handle_chat_completions(
    state: Arc<AppState>,
    body: Bytes,
    identity: Option<IdentityClaims>,
    tenant: Option<TenantContext>,
    bearer: Option<String>,
) -> Response<BoxBody> {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            return openai_error(
                StatusCode::BAD_REQUEST,
                &format!("invalid JSON body: {}", e),
                "invalid_request_error",
            )
        }
    };

    let Some(messages) = payload.get("messages").and_then(Value::as_array) else {
        return openai_error(
            StatusCode::BAD_REQUEST,
            "messages must be an array",
            "invalid_request_error",
        );
    };

    let stream_requested = coerce_bool(payload.get("stream"));
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .map(String::from);
    let user = payload.get("user").and_then(Value::as_str).map(String::from);

    let (extra_system_prompt, prompt) = build_prompt(messages);
    if prompt.is_empty() {
        return openai_error(
            StatusCode::BAD_REQUEST,
            "messages produced an empty prompt",
            "invalid_request_error",
        );
    }

    let agent_id = resolve_agent_id(&state, model.as_deref());
    let caller = user
        .clone()
        .or_else(|| identity.as_ref().map(|i| i.user_id.clone()))
        .unwrap_or_else(|| format!("conn-{}", Uuid::new_v4()));
    let session_key = format!("openai:{}:{}", agent_id, caller);

    let decision = state.gate.check(tenant.as_ref(), bearer.as_deref()).await;
    if let crate::billing::GateDecision::Denied { reason, .. } = decision {
        return openai_error(StatusCode::PAYMENT_REQUIRED, &reason, "billing_error");
    }

    let run_id = format!("chatcmpl_{}", Uuid::new_v4());
    let display_model = model.clone().unwrap_or_else(|| agent_id.clone());
    let request = RunRequest {
        run_id: run_id.clone(),
        session_key,
        agent_id,
        extra_system_prompt,
        prompt,
        model: model.clone(),
        user,
    };

    debug!(run = %run_id, model = %display_model, stream = stream_requested, "chat run dispatched");

    if stream_requested {
        stream_chat(state, request, tenant, display_model).await
    } else {
        await_chat(state, request, tenant, display_model).await
    }
}

// ---------------------------------------------------------------------------
// Non-streaming path
// ---------------------------------------------------------------------------

async fn await_chat(
    state: Arc<AppState>,
    request: RunRequest,
    tenant: Option<TenantContext>,
    display_model: String,
) -> Response<BoxBody> {
    let run_id = request.run_id.clone();
    let model = request.model.clone();
    let started = Instant::now();

    let outcome = match state.engine.run(request, &state.bus).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(run = %run_id, error = %e, "agent run failed");
            return openai_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
                "api_error",
            );
        }
    };

    let content = join_payloads(&outcome.payloads)
        .unwrap_or_else(|| fallback_text(&state.args.bot_name));
    enqueue_usage(
        &state,
        tenant.as_ref(),
        model.as_deref(),
        &outcome,
        started.elapsed().as_millis() as u64,
    );

    let meta = &outcome.metadata;
    let body = json!({
        "id": run_id,
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": display_model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": meta.input_tokens,
            "completion_tokens": meta.output_tokens,
            "total_tokens": effective_total(meta),
        },
    });
    json_response(StatusCode::OK, &body)
}

// ---------------------------------------------------------------------------
// Streaming path
// ---------------------------------------------------------------------------

async fn stream_chat(
    state: Arc<AppState>,
    request: RunRequest,
    tenant: Option<TenantContext>,
    display_model: String,
) -> Response<BoxBody> {
    let run_id = request.run_id.clone();
    let created = Utc::now().timestamp();
    let (subscriber_id, mut events) = state.bus.subscribe(&run_id);
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();

    // The run outlives the response: a client disconnect only stops event
    // forwarding.
    let run_state = Arc::clone(&state);
    let run_tenant = tenant.clone();
    let run_model = request.model.clone();
    let started = Instant::now();
    let mut run_handle = tokio::spawn(async move {
        let run_id = request.run_id.clone();
        match run_state.engine.run(request, &run_state.bus).await {
            Ok(outcome) => {
                enqueue_usage(
                    &run_state,
                    run_tenant.as_ref(),
                    run_model.as_deref(),
                    &outcome,
                    started.elapsed().as_millis() as u64,
                );
                // Engines publish the terminal event themselves; this one is
                // a no-op then, and closes the stream for engines that don't
                run_state
                    .bus
                    .publish(&AgentEvent::lifecycle(&run_id, RunPhase::End));
                Some(outcome)
            }
            Err(e) => {
                warn!(run = %run_id, error = %e, "agent run failed mid-stream");
                run_state
                    .bus
                    .publish(&AgentEvent::assistant_delta(&run_id, "Error: internal error"));
                run_state
                    .bus
                    .publish(&AgentEvent::lifecycle_error(&run_id, "internal error"));
                None
            }
        }
    });

    let fwd_state = Arc::clone(&state);
    let fwd_run_id = run_id.clone();
    let bot_name = state.args.bot_name.clone();
    tokio::spawn(async move {
        let mut saw_delta = false;
        while let Some(event) = events.recv().await {
            match event.stream {
                EventStream::Assistant => {
                    let Some(text) = event.delta else { continue };
                    if text.is_empty() {
                        continue;
                    }
                    if !saw_delta {
                        saw_delta = true;
                        let role = role_chunk(&fwd_run_id, created, &display_model);
                        if tx.send(sse_data(&role)).is_err() {
                            // Client went away: stop forwarding, let the run finish
                            fwd_state.bus.unsubscribe(&fwd_run_id, subscriber_id);
                            return;
                        }
                    }
                    let chunk = content_chunk(&fwd_run_id, created, &display_model, &text);
                    if tx.send(sse_data(&chunk)).is_err() {
                        fwd_state.bus.unsubscribe(&fwd_run_id, subscriber_id);
                        return;
                    }
                }
                EventStream::Lifecycle if event.is_terminal() => {
                    if !saw_delta {
                        // Engine produced no deltas: synthesize one chunk
                        // from the awaited payloads
                        let outcome = (&mut run_handle).await.ok().flatten();
                        let text = outcome
                            .as_ref()
                            .and_then(|o| join_payloads(&o.payloads))
                            .unwrap_or_else(|| fallback_text(&bot_name));
                        let role = role_chunk(&fwd_run_id, created, &display_model);
                        let chunk = content_chunk(&fwd_run_id, created, &display_model, &text);
                        if tx.send(sse_data(&role)).is_err()
                            || tx.send(sse_data(&chunk)).is_err()
                        {
                            return;
                        }
                    }
                    let _ = tx.send(Bytes::from_static(b"data: [DONE]\n\n"));
                    return;
                }
                EventStream::Lifecycle => {}
            }
        }
    });

    sse_response(rx)
}

fn sse_response(rx: mpsc::UnboundedReceiver<Bytes>) -> Response<BoxBody> {
    let body_stream = stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, hyper::Error>(Frame::data(chunk)), rx))
    });

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(StreamBody::new(body_stream).boxed())
        .unwrap()
}

fn sse_data(value: &Value) -> Bytes {
    Bytes::from(format!("data: {}\n\n", value))
}

fn role_chunk(run_id: &str, created: i64, model: &str) -> Value {
    json!({
        "id": run_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant"},
            "finish_reason": null,
        }],
    })
}

fn content_chunk(run_id: &str, created: i64, model: &str, text: &str) -> Value {
    json!({
        "id": run_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {"content": text},
            "finish_reason": null,
        }],
    })
}

// ---------------------------------------------------------------------------
// Request reshaping
// ---------------------------------------------------------------------------

/// Reshape the OpenAI message list into (extra system prompt, conversation).
///
/// `system`/`developer` messages concatenate into the extra system prompt
/// with blank-line separators; `user`/`assistant`/`tool`/`function` become
/// tagged conversation entries. Unknown roles are skipped.
fn build_prompt(messages: &[Value]) -> (Option<String>, String) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut entries: Vec<String> = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let text = content_text(message.get("content"));

        match role {
            "system" | "developer" => {
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "user" | "assistant" | "tool" | "function" => {
                if text.is_empty() {
                    continue;
                }
                let tag = match role {
                    "user" => "User".to_string(),
                    "assistant" => "Assistant".to_string(),
                    // `function` is the legacy spelling of `tool`
                    _ => match message.get("name").and_then(Value::as_str) {
                        Some(name) => format!("Tool:{}", name),
                        None => "Tool".to_string(),
                    },
                };
                entries.push(format!("{}: {}", tag, text));
            }
            other => {
                debug!(role = other, "skipping message with unknown role");
            }
        }
    }

    let extra = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (extra, entries.join("\n"))
}

/// Extract plain text from an OpenAI message content value
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.trim().to_string(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.trim().to_string()),
                Value::Object(obj) => obj
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|t| t.trim().to_string()),
                _ => None,
            })
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// OpenAI clients send `stream` as a bool, but strings and numbers appear in
/// the wild; coerce rather than reject.
fn coerce_bool(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    }
}

fn resolve_agent_id(state: &AppState, model: Option<&str>) -> String {
    if let Some(model) = model {
        if state.known_agents.iter().any(|a| a == model) {
            return model.to_string();
        }
    }
    state.args.default_agent.clone()
}

fn join_payloads(payloads: &[String]) -> Option<String> {
    let parts: Vec<&str> = payloads
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn fallback_text(bot_name: &str) -> String {
    format!("No response from {}.", bot_name)
}

fn effective_total(meta: &crate::agent::RunMetadata) -> u64 {
    if meta.total_tokens > 0 {
        meta.total_tokens
    } else {
        meta.input_tokens + meta.output_tokens
    }
}

fn enqueue_usage(
    state: &AppState,
    tenant: Option<&TenantContext>,
    model: Option<&str>,
    outcome: &RunOutcome,
    duration_ms: u64,
) {
    let meta = &outcome.metadata;
    if meta.input_tokens + meta.output_tokens == 0 {
        return;
    }
    state.usage.report(UsageRecord {
        tenant: tenant.map(|t| t.org_id.clone()),
        model: meta.model.clone().or_else(|| model.map(String::from)),
        provider: meta.provider.clone(),
        input_tokens: meta.input_tokens,
        output_tokens: meta.output_tokens,
        cache_read_tokens: None,
        cache_write_tokens: None,
        total_tokens: effective_total(meta),
        duration_ms: meta.duration_ms.or(Some(duration_ms)),
        timestamp: Utc::now(),
    });
}

fn openai_error(status: StatusCode, message: &str, error_type: &str) -> Response<BoxBody> {
    json_response(
        status,
        &json!({"error": {"message": message, "type": error_type}}),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedEngine;
    use crate::agent::RunMetadata;
    use crate::billing::client::SubscriptionStatus;
    use crate::billing::{BillingGate, BillingLookup};
    use async_trait::async_trait;

    struct DeniedCommerce;

    #[async_trait]
    impl BillingLookup for DeniedCommerce {
        async fn subscription_status(
            &self,
            _org_id: &str,
            _token: Option<&str>,
        ) -> crate::types::Result<SubscriptionStatus> {
            Ok(SubscriptionStatus::default())
        }

        async fn balance(&self, _user_id: &str, _token: Option<&str>) -> crate::types::Result<i64> {
            Ok(0)
        }
    }

    fn tenant() -> TenantContext {
        TenantContext {
            org_id: "acme".into(),
            project_id: None,
            user_id: "user-1".into(),
            user_name: None,
            env: None,
        }
    }

    async fn body_string(response: Response<BoxBody>) -> String {
        let collected = response.into_body().collect().await.unwrap();
        String::from_utf8(collected.to_bytes().to_vec()).unwrap()
    }

    fn chat_body(stream: bool) -> Bytes {
        Bytes::from(
            json!({
                "model": "bot",
                "stream": stream,
                "messages": [{"role": "user", "content": "hi"}],
            })
            .to_string(),
        )
    }

    #[test]
    fn test_build_prompt_reshaping() {
        let messages = vec![
            json!({"role": "system", "content": "Be terse."}),
            json!({"role": "developer", "content": "Prefer lists."}),
            json!({"role": "user", "content": "hi"}),
            json!({"role": "assistant", "content": "hello"}),
            json!({"role": "tool", "name": "search", "content": "result"}),
            json!({"role": "function", "content": "legacy"}),
        ];
        let (extra, prompt) = build_prompt(&messages);
        assert_eq!(extra.as_deref(), Some("Be terse.\n\nPrefer lists."));
        assert_eq!(
            prompt,
            "User: hi\nAssistant: hello\nTool:search: result\nTool: legacy"
        );
    }

    #[test]
    fn test_build_prompt_content_parts() {
        let messages = vec![json!({
            "role": "user",
            "content": [{"type": "text", "text": "part one"}, {"type": "text", "text": "part two"}],
        })];
        let (_, prompt) = build_prompt(&messages);
        assert_eq!(prompt, "User: part one\npart two");
    }

    #[test]
    fn test_build_prompt_empty() {
        let (extra, prompt) = build_prompt(&[json!({"role": "system", "content": "only system"})]);
        assert!(extra.is_some());
        assert!(prompt.is_empty());
    }

    #[test]
    fn test_coerce_bool() {
        assert!(coerce_bool(Some(&json!(true))));
        assert!(!coerce_bool(Some(&json!(false))));
        assert!(coerce_bool(Some(&json!("true"))));
        assert!(!coerce_bool(Some(&json!("no"))));
        assert!(coerce_bool(Some(&json!(1))));
        assert!(!coerce_bool(Some(&json!(0))));
        assert!(!coerce_bool(None));
    }

    #[test]
    fn test_join_payloads() {
        assert_eq!(
            join_payloads(&["a".into(), "".into(), " b ".into()]).unwrap(),
            "a\n\nb"
        );
        assert_eq!(join_payloads(&["".into(), "  ".into()]), None);
        assert_eq!(join_payloads(&[]), None);
    }

    #[tokio::test]
    async fn test_non_streaming_completion() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine {
            payloads: vec!["Hello there".into()],
            ..Default::default()
        }));

        let response =
            handle_chat_completions(state, chat_body(false), None, None, None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert!(body["id"].as_str().unwrap().starts_with("chatcmpl_"));
        assert_eq!(body["choices"][0]["message"]["role"], "assistant");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["total_tokens"], 19);
    }

    #[tokio::test]
    async fn test_non_streaming_empty_payloads_fall_back() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine {
            payloads: vec![],
            metadata: RunMetadata::default(),
            ..Default::default()
        }));

        let response =
            handle_chat_completions(state, chat_body(false), None, None, None).await;
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "No response from Hanzo Bot."
        );
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn test_invalid_messages_rejected() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine::default()));
        let body = Bytes::from(json!({"messages": "nope"}).to_string());
        let response = handle_chat_completions(state, body, None, None, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn test_empty_prompt_rejected() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine::default()));
        let body = Bytes::from(
            json!({"messages": [{"role": "system", "content": "only system"}]}).to_string(),
        );
        let response = handle_chat_completions(state, body, None, None, None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_billing_denial_maps_to_402() {
        let mut state = AppState::for_tests_inner(Arc::new(ScriptedEngine::default()));
        state.gate = BillingGate::new(Arc::new(DeniedCommerce), true);
        let state = Arc::new(state);

        let response =
            handle_chat_completions(state, chat_body(false), None, Some(tenant()), None).await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["type"], "billing_error");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Insufficient funds"));
        assert!(body["error"]["message"].as_str().unwrap().contains("$0.00"));
    }

    #[tokio::test]
    async fn test_engine_failure_maps_to_500() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine {
            fail: true,
            ..Default::default()
        }));
        let response =
            handle_chat_completions(state, chat_body(false), None, None, None).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"]["type"], "api_error");
    }

    #[tokio::test]
    async fn test_streaming_frames_in_order() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine {
            deltas: vec!["Hel".into(), "lo".into()],
            payloads: vec!["Hello".into()],
            ..Default::default()
        }));

        let response =
            handle_chat_completions(state, chat_body(true), None, None, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/event-stream"
        );

        let body = body_string(response).await;
        let frames: Vec<&str> = body
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .collect();

        // role chunk, two content chunks, exactly one terminal DONE
        assert_eq!(frames.len(), 4);
        assert!(frames[0].contains(r#""role":"assistant""#));
        assert!(frames[1].contains(r#""content":"Hel""#));
        assert!(frames[2].contains(r#""content":"lo""#));
        assert_eq!(frames[3], "data: [DONE]");
        assert_eq!(body.matches("[DONE]").count(), 1);
    }

    #[tokio::test]
    async fn test_streaming_without_deltas_synthesizes_chunk() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine {
            deltas: vec![],
            payloads: vec!["Complete answer".into()],
            ..Default::default()
        }));

        let body = body_string(
            handle_chat_completions(state, chat_body(true), None, None, None).await,
        )
        .await;
        assert!(body.contains(r#""role":"assistant""#));
        assert!(body.contains("Complete answer"));
        assert!(body.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test]
    async fn test_streaming_engine_failure_emits_error_chunk() {
        let state = AppState::for_tests(Arc::new(ScriptedEngine {
            fail: true,
            ..Default::default()
        }));

        let body = body_string(
            handle_chat_completions(state, chat_body(true), None, None, None).await,
        )
        .await;
        assert!(body.contains("Error: internal error"));
        assert!(body.trim_end().ends_with("data: [DONE]"));
    }
}

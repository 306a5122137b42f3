//! Request-lifecycle engine.
//!
//! ```text
//! Handler -> Selector -> Shaper -> Translator -> Failover -> Upstream
//!                                                   |
//!                                         SSE / JSON parsing
//! ```
//!
//! Two endpoint handlers share one skeleton: authenticate, parse, select
//! a backend, shape the payload, translate where the dialects differ,
//! dispatch through the failover orchestrator, and log completion. The
//! shared catalog is never mutated; every request carries its own plan.

pub mod client;
pub mod context;
pub mod error;
pub mod failover;
pub mod middleware;
pub mod routing;
pub mod shape;
pub mod tokens;
pub mod translate;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logger;

pub use context::{AppState, Dialect};
use client::SseFrameFilter;
use context::{BackendRef, DispatchPlan, TokenUsage};
use error::{ProxyError, ProxyResult};

/// JSON response with the charset and CORS headers all endpoints carry.
pub fn json_response(status: StatusCode, value: &Value) -> Response {
    Response::builder()
        .status(status)
        .header("content-type", "application/json; charset=utf-8")
        .header("access-control-allow-origin", "*")
        .body(Body::from(serde_json::to_vec(value).unwrap_or_default()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream; charset=utf-8")
        .header("cache-control", "no-cache")
        .header("connection", "keep-alive")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Turns an abandoned request future into a fired cancellation token.
///
/// hyper stops polling the future serving a request the moment the peer
/// goes away; that drop is the disconnect signal. While the guard is
/// armed, dropping it relays the signal to the registry, which cancels
/// the token the dispatch task is watching and so tears down the
/// upstream socket. `complete` disarms once the outcome was decided on a
/// live connection. The registration is removed on every exit path.
struct DisconnectGuard {
    state: Arc<AppState>,
    request_id: Uuid,
    armed: bool,
}

impl DisconnectGuard {
    fn new(state: Arc<AppState>, request_id: Uuid) -> Self {
        Self { state, request_id, armed: true }
    }

    fn complete(&mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.armed {
            self.state.cancels.cancel(&self.request_id);
            logger::warn(
                "handler",
                &format!("request {} abandoned: client disconnected", self.request_id),
            );
        }
        self.state.cancels.unregister(&self.request_id);
    }
}

/// Run the buffered dispatch on its own task and race it against the
/// request's token. The task survives a dropped handler future, so a
/// disconnect relayed by the guard reaches it through the token and the
/// upstream connection is wound down instead of leaking. A token fired
/// while the caller is still connected surfaces as 499.
async fn watch_dispatch_buffered(
    state: &Arc<AppState>,
    plan: &DispatchPlan,
    internal: &Value,
    cancel: &CancellationToken,
) -> ProxyResult<(Value, BackendRef)> {
    let task = {
        let state = Arc::clone(state);
        let plan = plan.clone();
        let internal = internal.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { failover::dispatch_buffered(&state, &plan, &internal, &cancel).await },
        )
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::ClientDisconnected),
        joined = task => {
            joined.map_err(|e| ProxyError::Internal(format!("dispatch task failed: {}", e)))?
        }
    }
}

async fn watch_dispatch_streaming(
    state: &Arc<AppState>,
    plan: &DispatchPlan,
    internal: &Value,
    cancel: &CancellationToken,
) -> ProxyResult<(reqwest::Response, BackendRef)> {
    let task = {
        let state = Arc::clone(state);
        let plan = plan.clone();
        let internal = internal.clone();
        let cancel = cancel.clone();
        tokio::spawn(
            async move { failover::dispatch_streaming(&state, &plan, &internal, &cancel).await },
        )
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::ClientDisconnected),
        joined = task => {
            joined.map_err(|e| ProxyError::Internal(format!("dispatch task failed: {}", e)))?
        }
    }
}

/// Read usage out of an upstream body in either naming convention.
fn usage_from_value(value: &Value) -> TokenUsage {
    let usage = value.get("usage");
    let read = |keys: [&str; 2]| {
        usage
            .and_then(|u| keys.iter().find_map(|k| u.get(*k)))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    };
    TokenUsage::new(
        read(["prompt_tokens", "input_tokens"]),
        read(["completion_tokens", "output_tokens"]),
    )
}

fn log_completion(request_id: Uuid, backend: &str, usage: TokenUsage, started: Instant) {
    logger::info(
        "handler",
        &format!(
            "request {} completed: backend={}, latency_ms={}, tokens={}/{}",
            request_id,
            backend,
            started.elapsed().as_millis(),
            usage.prompt_tokens,
            usage.completion_tokens,
        ),
    );
}

/// Inspect one filtered SSE frame and fold its usage into the tracker.
/// Frames without a usage object contribute a heuristic count of their
/// delta text, which the real figures overwrite when they arrive.
fn observe_frame(frame: &[u8], usage: &Mutex<TokenUsage>) {
    let text = String::from_utf8_lossy(frame);
    let Some(data) = text.strip_prefix("data:").map(str::trim) else {
        return;
    };
    if data == "[DONE]" {
        return;
    }
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return;
    };
    if event.get("usage").map(|u| !u.is_null()).unwrap_or(false) {
        let captured = usage_from_value(&event);
        if let Ok(mut tracker) = usage.lock() {
            if captured.prompt_tokens > 0 {
                tracker.prompt_tokens = captured.prompt_tokens;
            }
            if captured.completion_tokens > 0 {
                tracker.completion_tokens = captured.completion_tokens;
            }
        }
        return;
    }
    if let Some(choices) = event.get("choices").and_then(|c| c.as_array()) {
        for choice in choices {
            if let Some(delta_text) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
            {
                if let Ok(mut tracker) = usage.lock() {
                    tracker.completion_tokens += tokens::approx_tokens(delta_text);
                }
            }
        }
    }
}

/// Splice the usage-observing wrapper over an upstream SSE body. All
/// `data:` frames are forwarded unchanged and in order; the residual tail
/// is flushed at EOF, then the completion line is logged exactly once.
///
/// The wrapper owns the request's disconnect guard for as long as the
/// stream lives. A fired token ends forwarding without a trailer; a
/// dropped body (the caller vanished mid-stream) drops the guard armed,
/// which fires the token and releases the registration.
fn instrument_stream(
    response: reqwest::Response,
    request_id: Uuid,
    backend_model: String,
    estimated_prompt: u64,
    started: Instant,
    cancel: CancellationToken,
    guard: DisconnectGuard,
) -> Body {
    let filter = Arc::new(Mutex::new(SseFrameFilter::new()));
    let usage = Arc::new(Mutex::new(TokenUsage::new(estimated_prompt, 0)));

    let filter_tail = Arc::clone(&filter);
    let usage_tail = Arc::clone(&usage);

    let forwarded = response.bytes_stream().map(move |result| {
        if cancel.is_cancelled() {
            return Err(std::io::Error::other("client disconnected"));
        }
        match result {
            Ok(bytes) => {
                let frames = match filter.lock() {
                    Ok(mut filter) => filter.push(&bytes),
                    Err(_) => Vec::new(),
                };
                let mut out = Vec::new();
                for frame in frames {
                    observe_frame(&frame, &usage);
                    out.extend_from_slice(&frame);
                }
                Ok(Bytes::from(out))
            }
            Err(e) => {
                logger::error("stream", &format!("upstream stream error: {}", e));
                Err(std::io::Error::other(e.to_string()))
            }
        }
    });

    let tail = futures_util::stream::once(async move {
        let mut guard = guard;
        let mut out = Vec::new();
        let frames = match filter_tail.lock() {
            Ok(mut filter) => filter.flush(),
            Err(_) => Vec::new(),
        };
        for frame in frames {
            observe_frame(&frame, &usage_tail);
            out.extend_from_slice(&frame);
        }
        let final_usage = usage_tail.lock().map(|u| *u).unwrap_or_default();
        log_completion(request_id, &backend_model, final_usage, started);
        guard.complete();
        Ok::<Bytes, std::io::Error>(Bytes::from(out))
    });

    Body::from_stream(forwarded.chain(tail))
}

// ---------------------------------------------------------------------------
// POST /v1/messages
// ---------------------------------------------------------------------------

pub async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_messages(state, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_dialect_response(Dialect::Anthropic),
    }
}

async fn handle_messages(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyResult<Response> {
    middleware::authenticate(&headers, &state)?;
    let mut payload = middleware::parse_body(&body)?;
    let streaming = middleware::normalize_stream_flag(&mut payload);
    let plan = middleware::build_plan(&state, &payload)?;

    let started = Instant::now();
    let cancel = state.cancels.register(plan.request_id);
    let mut guard = DisconnectGuard::new(Arc::clone(&state), plan.request_id);

    let shaped = shape::apply_transforms(&payload, &plan.primary.backend);
    let requested_max = shaped.get("max_tokens").and_then(|v| v.as_u64());
    let mut internal = translate::anthropic_to_openai(&shaped);
    translate::apply_max_tokens_policy(&mut internal, requested_max, &state.settings);

    if streaming {
        let (response, used) = match watch_dispatch_streaming(&state, &plan, &internal, &cancel)
            .await
        {
            Ok(pair) => pair,
            Err(err) => {
                guard.complete();
                return Err(err);
            }
        };
        // Upstream SSE is forwarded in its own dialect; see DESIGN.md.
        let body = instrument_stream(
            response,
            plan.request_id,
            used.backend.model.clone(),
            plan.estimated_tokens,
            started,
            cancel.clone(),
            guard,
        );
        return Ok(sse_response(body));
    }

    let outcome = watch_dispatch_buffered(&state, &plan, &internal, &cancel).await;
    guard.complete();
    let (upstream, used) = outcome?;
    let tool_names = translate::declared_tool_names(&shaped);
    let translated = translate::response_to_anthropic(&upstream, &tool_names);
    log_completion(plan.request_id, used.model(), usage_from_value(&translated), started);
    Ok(json_response(StatusCode::OK, &translated))
}

// ---------------------------------------------------------------------------
// POST /v1/chat/completions
// ---------------------------------------------------------------------------

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle_chat(state, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_dialect_response(Dialect::OpenAi),
    }
}

async fn handle_chat(
    state: Arc<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyResult<Response> {
    middleware::authenticate(&headers, &state)?;
    let mut payload = middleware::parse_body(&body)?;
    let streaming = middleware::normalize_stream_flag(&mut payload);
    let plan = middleware::build_plan(&state, &payload)?;

    let started = Instant::now();
    let cancel = state.cancels.register(plan.request_id);
    let mut guard = DisconnectGuard::new(Arc::clone(&state), plan.request_id);

    // The body is already in the internal shape; only shaping and the
    // per-attempt model override apply.
    let internal = shape::apply_transforms(&payload, &plan.primary.backend);

    if streaming {
        let (response, used) = match watch_dispatch_streaming(&state, &plan, &internal, &cancel)
            .await
        {
            Ok(pair) => pair,
            Err(err) => {
                guard.complete();
                return Err(err);
            }
        };
        let body = instrument_stream(
            response,
            plan.request_id,
            used.backend.model.clone(),
            plan.estimated_tokens,
            started,
            cancel.clone(),
            guard,
        );
        return Ok(sse_response(body));
    }

    let outcome = watch_dispatch_buffered(&state, &plan, &internal, &cancel).await;
    guard.complete();
    let (upstream, used) = outcome?;
    log_completion(plan.request_id, used.model(), usage_from_value(&upstream), started);
    Ok(json_response(StatusCode::OK, &upstream))
}

// ---------------------------------------------------------------------------
// POST /v1/messages/count_tokens
// ---------------------------------------------------------------------------

pub async fn count_tokens(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = (|| -> ProxyResult<Response> {
        middleware::authenticate(&headers, &state)?;
        let payload = middleware::parse_body(&body)?;
        let input_tokens = tokens::estimate_request(&payload);
        Ok(json_response(StatusCode::OK, &json!({ "input_tokens": input_tokens })))
    })();
    result.unwrap_or_else(|err| err.into_dialect_response(Dialect::Anthropic))
}

// ---------------------------------------------------------------------------
// GET /v1/models
// ---------------------------------------------------------------------------

pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(err) = middleware::authenticate(&headers, &state) {
        return err.into_dialect_response(Dialect::OpenAi);
    }
    let data: Vec<Value> = state
        .settings
        .backend
        .iter()
        .map(|backend| {
            json!({
                "id": backend.model,
                "object": "model",
                "created": 1_700_000_000,
                "owned_by": backend.provider(),
            })
        })
        .collect();
    json_response(StatusCode::OK, &json!({ "object": "list", "data": data }))
}

// ---------------------------------------------------------------------------
// GET /test-connection
// ---------------------------------------------------------------------------

/// Round-trips a trivial completion through the configured catalog.
pub async fn test_connection(State(state): State<Arc<AppState>>) -> Response {
    let probe = json!({
        "model": "",
        "messages": [ { "role": "user", "content": "ping" } ]
    });
    let result = async {
        let plan = middleware::build_plan(&state, &probe)?;
        let internal = json!({
            "messages": [ { "role": "user", "content": "ping" } ],
            "max_tokens": 16
        });
        let cancel = state.cancels.register(plan.request_id);
        let mut guard = DisconnectGuard::new(Arc::clone(&state), plan.request_id);
        let started = Instant::now();
        let outcome = watch_dispatch_buffered(&state, &plan, &internal, &cancel).await;
        guard.complete();
        let (_, used) = outcome?;
        Ok::<Value, ProxyError>(json!({
            "status": "ok",
            "backend": used.model(),
            "latency_ms": started.elapsed().as_millis() as u64,
        }))
    }
    .await;

    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(err) => err.into_dialect_response(Dialect::OpenAi),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_reads_both_naming_conventions() {
        let openai = json!({ "usage": { "prompt_tokens": 3, "completion_tokens": 4 } });
        assert_eq!(usage_from_value(&openai), TokenUsage::new(3, 4));
        let anthropic = json!({ "usage": { "input_tokens": 5, "output_tokens": 6 } });
        assert_eq!(usage_from_value(&anthropic), TokenUsage::new(5, 6));
        assert_eq!(usage_from_value(&json!({})), TokenUsage::default());
    }

    #[test]
    fn observe_frame_captures_usage_and_ignores_done() {
        let usage = Mutex::new(TokenUsage::new(10, 0));
        observe_frame(
            b"data: {\"usage\":{\"prompt_tokens\":20,\"completion_tokens\":7}}\n\n",
            &usage,
        );
        assert_eq!(*usage.lock().unwrap(), TokenUsage::new(20, 7));
        observe_frame(b"data: [DONE]\n\n", &usage);
        assert_eq!(*usage.lock().unwrap(), TokenUsage::new(20, 7));
    }

    #[test]
    fn observe_frame_estimates_from_deltas_until_usage_arrives() {
        let usage = Mutex::new(TokenUsage::new(10, 0));
        observe_frame(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"twelve chars\"}}]}\n\n",
            &usage,
        );
        let after_delta = *usage.lock().unwrap();
        assert!(after_delta.completion_tokens > 0);
        observe_frame(
            b"data: {\"usage\":{\"prompt_tokens\":20,\"completion_tokens\":2}}\n\n",
            &usage,
        );
        assert_eq!(*usage.lock().unwrap(), TokenUsage::new(20, 2));
    }

    #[test]
    fn observe_frame_tolerates_garbage() {
        let usage = Mutex::new(TokenUsage::default());
        observe_frame(b"data: not json\n\n", &usage);
        observe_frame(b"event: ping\n\n", &usage);
        assert_eq!(*usage.lock().unwrap(), TokenUsage::default());
    }

    use crate::config::{BackendCfg, ProviderCfg, Settings};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::time::Duration;

    /// Upstream that takes long enough for a cancellation to land first.
    async fn spawn_slow_upstream() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Json(json!({ "id": "late" }))
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn state_for(base_url: &str) -> Arc<AppState> {
        let mut settings = Settings::default();
        settings.provider.insert(
            "p".to_string(),
            ProviderCfg {
                api_key: "k".to_string(),
                base_url: base_url.to_string(),
                api_version: None,
            },
        );
        settings.backend.push(BackendCfg { model: "p:m".to_string(), ..Default::default() });
        Arc::new(AppState::new(settings).unwrap())
    }

    #[tokio::test]
    async fn cancelling_a_buffered_request_returns_499() {
        let upstream = spawn_slow_upstream().await;
        let state = state_for(&upstream);
        let body = Bytes::from(
            serde_json::to_vec(&json!({
                "model": "m",
                "messages": [ { "role": "user", "content": "hi" } ]
            }))
            .unwrap(),
        );

        let handler = tokio::spawn(chat_completions(
            State(Arc::clone(&state)),
            HeaderMap::new(),
            body,
        ));

        // wait for the request to register, then abort it in flight
        let mut request_id = None;
        for _ in 0..200 {
            if let Some(id) = state.cancels.ids().first().copied() {
                request_id = Some(id);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let request_id = request_id.expect("request never registered");
        assert!(state.cancels.cancel(&request_id));

        let response = handler.await.unwrap();
        assert_eq!(response.status().as_u16(), 499);
        assert_eq!(state.cancels.len(), 0);
    }

    #[tokio::test]
    async fn completed_request_does_not_fire_its_token() {
        // dropping a disarmed guard must neither cancel nor leave state
        let state = state_for("http://127.0.0.1:1");
        let id = Uuid::new_v4();
        let token = state.cancels.register(id);
        let mut guard = DisconnectGuard::new(Arc::clone(&state), id);
        guard.complete();
        drop(guard);
        assert!(!token.is_cancelled());
        assert_eq!(state.cancels.len(), 0);
    }

    #[tokio::test]
    async fn abandoned_request_fires_its_token() {
        let state = state_for("http://127.0.0.1:1");
        let id = Uuid::new_v4();
        let token = state.cancels.register(id);
        let guard = DisconnectGuard::new(Arc::clone(&state), id);
        drop(guard);
        assert!(token.is_cancelled());
        assert_eq!(state.cancels.len(), 0);
    }
}

//! Failover orchestration: ordered attempts over the dispatch plan,
//! day-limit cooldown on the primary, cyclic retry with a fixed backoff
//! schedule.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::logger;

use super::client;
use super::context::{AppState, BackendRef, DispatchPlan};
use super::error::{ProxyError, ProxyResult};

/// Seconds slept between retry cycles, saturating at the last entry.
pub const BACKOFF_SECS: [u64; 8] = [2, 4, 8, 15, 15, 30, 30, 60];

/// Primary cooldown window armed by a daily-limit error.
pub const COOLDOWN_SECS: u64 = 300;

/// Case-insensitive marker in upstream error text.
const DAY_LIMIT_MARKER: &str = "day limit exceeded";

pub fn is_day_limit(err: &ProxyError) -> bool {
    err.to_string().to_lowercase().contains(DAY_LIMIT_MARKER)
}

/// The primary-backend cooldown deadline. The only cross-request mutable
/// state in the engine; arming is monotonic, the deadline never moves
/// backwards.
pub struct CooldownGate {
    until: Mutex<Option<Instant>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self { until: Mutex::new(None) }
    }

    pub fn arm(&self, secs: u64) {
        let deadline = Instant::now() + Duration::from_secs(secs);
        if let Ok(mut until) = self.until.lock() {
            match *until {
                Some(current) if current >= deadline => {}
                _ => *until = Some(deadline),
            }
        }
    }

    pub fn active(&self) -> bool {
        self.until
            .lock()
            .map(|until| matches!(*until, Some(deadline) if deadline > Instant::now()))
            .unwrap_or(false)
    }
}

impl Default for CooldownGate {
    fn default() -> Self {
        Self::new()
    }
}

fn log_failover(plan: &DispatchPlan, candidate: &BackendRef, err: &ProxyError) {
    logger::warn(
        "failover",
        &format!(
            "backend attempt failed: error_code={}, original_model={}, candidate={}, token_count={}",
            client::error_code(err),
            plan.original_model,
            candidate.model(),
            plan.estimated_tokens,
        ),
    );
}

fn exhausted(max_cycles: u32) -> ProxyError {
    ProxyError::AllBackendsFailed(format!(
        "All backends failed after {} retry cycles",
        max_cycles
    ))
}

async fn backoff_sleep(cycle: u32, cancel: &CancellationToken) -> ProxyResult<()> {
    let idx = (cycle as usize).min(BACKOFF_SECS.len() - 1);
    let sleep = tokio::time::sleep(Duration::from_secs(BACKOFF_SECS[idx]));
    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::ClientDisconnected),
        _ = sleep => Ok(()),
    }
}

/// Buffered dispatch. Returns the upstream JSON body and the backend
/// that produced it.
pub async fn dispatch_buffered(
    state: &AppState,
    plan: &DispatchPlan,
    internal: &Value,
    cancel: &CancellationToken,
) -> ProxyResult<(Value, BackendRef)> {
    let timeout = state.request_timeout();

    if !plan.failover_active() {
        let (wire, flavor) = client::wire_body(&plan.primary, internal);
        let value =
            client::send_buffered(&state.http, &plan.primary, &wire, flavor, timeout, cancel)
                .await?;
        return Ok((value, plan.primary.clone()));
    }

    let max_cycles = state.settings.max_retries.max(1);
    let mut cycle = 0u32;
    loop {
        let include_primary = !state.cooldown.active();
        let mut cooldown_armed = false;

        for (idx, backend) in plan.attempt_list(include_primary).into_iter().enumerate() {
            let (wire, flavor) = client::wire_body(backend, internal);
            match client::send_buffered(&state.http, backend, &wire, flavor, timeout, cancel).await
            {
                Ok(value) => return Ok((value, backend.clone())),
                Err(ProxyError::ClientDisconnected) => return Err(ProxyError::ClientDisconnected),
                Err(err) => {
                    let is_primary = include_primary && idx == 0;
                    if is_primary && is_day_limit(&err) {
                        state.cooldown.arm(COOLDOWN_SECS);
                        logger::warn(
                            "failover",
                            &format!(
                                "primary {} hit its daily limit, cooling down for {}s",
                                backend.model(),
                                COOLDOWN_SECS
                            ),
                        );
                        cooldown_armed = true;
                        break;
                    }
                    log_failover(plan, backend, &err);
                }
            }
        }

        // A freshly armed cooldown restarts the pass over the failover
        // list; the untried candidates do not cost a cycle.
        if cooldown_armed {
            continue;
        }

        cycle += 1;
        if cycle >= max_cycles {
            return Err(exhausted(max_cycles));
        }
        backoff_sleep(cycle, cancel).await?;
    }
}

/// Streaming dispatch. Success means the status line and headers are in;
/// once bytes have been yielded downstream a failure terminates the
/// stream and is not retried here.
pub async fn dispatch_streaming(
    state: &AppState,
    plan: &DispatchPlan,
    internal: &Value,
    cancel: &CancellationToken,
) -> ProxyResult<(reqwest::Response, BackendRef)> {
    let timeout = state.request_timeout();

    if !plan.failover_active() {
        let (wire, flavor) = client::wire_body(&plan.primary, internal);
        let response =
            client::send_streaming(&state.http, &plan.primary, &wire, flavor, timeout, cancel)
                .await?;
        return Ok((response, plan.primary.clone()));
    }

    let max_cycles = state.settings.max_retries.max(1);
    let mut cycle = 0u32;
    loop {
        let include_primary = !state.cooldown.active();
        let mut cooldown_armed = false;

        for (idx, backend) in plan.attempt_list(include_primary).into_iter().enumerate() {
            let (wire, flavor) = client::wire_body(backend, internal);
            match client::send_streaming(&state.http, backend, &wire, flavor, timeout, cancel)
                .await
            {
                Ok(response) => return Ok((response, backend.clone())),
                Err(ProxyError::ClientDisconnected) => return Err(ProxyError::ClientDisconnected),
                Err(err) => {
                    let is_primary = include_primary && idx == 0;
                    if is_primary && is_day_limit(&err) {
                        state.cooldown.arm(COOLDOWN_SECS);
                        logger::warn(
                            "failover",
                            &format!(
                                "primary {} hit its daily limit, cooling down for {}s",
                                backend.model(),
                                COOLDOWN_SECS
                            ),
                        );
                        cooldown_armed = true;
                        break;
                    }
                    log_failover(plan, backend, &err);
                }
            }
        }

        if cooldown_armed {
            continue;
        }

        cycle += 1;
        if cycle >= max_cycles {
            return Err(exhausted(max_cycles));
        }
        backoff_sleep(cycle, cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendCfg, ProviderCfg, Settings};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn cooldown_gate_is_monotonic() {
        let gate = CooldownGate::new();
        assert!(!gate.active());
        gate.arm(300);
        assert!(gate.active());
        // a shorter re-arm must not pull the deadline backwards
        gate.arm(0);
        assert!(gate.active());
    }

    #[test]
    fn cooldown_gate_expires() {
        let gate = CooldownGate::new();
        gate.arm(0);
        std::thread::sleep(Duration::from_millis(5));
        assert!(!gate.active());
    }

    #[test]
    fn day_limit_detection_is_case_insensitive() {
        let err = ProxyError::UpstreamHttp {
            status: 429,
            body: "Tokens per DAY LIMIT exceeded for this key".to_string(),
        };
        assert!(is_day_limit(&err));
        let err = ProxyError::UpstreamHttp { status: 429, body: "rate limited".to_string() };
        assert!(!is_day_limit(&err));
    }

    #[test]
    fn backoff_schedule_saturates() {
        assert_eq!(BACKOFF_SECS[(1usize).min(BACKOFF_SECS.len() - 1)], 4);
        assert_eq!(BACKOFF_SECS[(20usize).min(BACKOFF_SECS.len() - 1)], 60);
    }

    async fn spawn_stub(status: StatusCode, body: serde_json::Value) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let body = body.clone();
                async move { (status, Json(body)) }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn backend_ref(model: &str, base_url: &str) -> BackendRef {
        BackendRef {
            backend: BackendCfg { model: model.to_string(), ..Default::default() },
            provider: ProviderCfg {
                api_key: "k".to_string(),
                base_url: base_url.to_string(),
                api_version: None,
            },
        }
    }

    fn state(max_retries: u32) -> AppState {
        let settings = Settings { max_retries, request_timeout: 5, ..Default::default() };
        AppState::new(settings).unwrap()
    }

    fn plan(primary: BackendRef, failover: Vec<BackendRef>) -> DispatchPlan {
        DispatchPlan {
            request_id: Uuid::new_v4(),
            original_model: "claude-3-haiku".to_string(),
            estimated_tokens: 42,
            primary,
            failover,
        }
    }

    fn chat_body() -> serde_json::Value {
        json!({ "messages": [ { "role": "user", "content": "hi" } ] })
    }

    #[tokio::test]
    async fn failed_primary_falls_over_to_next_backend() {
        let bad = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })).await;
        let good = spawn_stub(StatusCode::OK, json!({ "id": "ok", "choices": [] })).await;
        let state = state(1);
        let plan = plan(
            backend_ref("a:primary", &bad),
            vec![backend_ref("b:fallback", &good)],
        );
        let cancel = CancellationToken::new();
        let (value, used) = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap();
        assert_eq!(value["id"], "ok");
        assert_eq!(used.model(), "b:fallback");
    }

    #[tokio::test]
    async fn day_limit_arms_cooldown_and_completes_via_failover() {
        let limited = spawn_stub(
            StatusCode::TOO_MANY_REQUESTS,
            json!({ "error": { "message": "tokens per day limit exceeded" } }),
        )
        .await;
        let good = spawn_stub(StatusCode::OK, json!({ "id": "ok" })).await;
        let state = state(3);
        let plan = plan(
            backend_ref("a:primary", &limited),
            vec![backend_ref("b:fallback", &good)],
        );
        let cancel = CancellationToken::new();
        let (value, used) = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap();
        assert_eq!(value["id"], "ok");
        assert_eq!(used.model(), "b:fallback");
        assert!(state.cooldown.active());

        // While cooling down the attempt set excludes the primary; the
        // request still succeeds without touching it.
        let (value, used) = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap();
        assert_eq!(value["id"], "ok");
        assert_eq!(used.model(), "b:fallback");
    }

    #[tokio::test]
    async fn single_backend_errors_propagate_without_retry() {
        let bad = spawn_stub(StatusCode::BAD_GATEWAY, json!({ "error": "down" })).await;
        let state = state(5);
        let plan = plan(backend_ref("a:only", &bad), Vec::new());
        let cancel = CancellationToken::new();
        let err = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap_err();
        match err {
            ProxyError::UpstreamHttp { status, .. } => assert_eq!(status, 502),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn exhausted_cycles_fail_with_503() {
        let bad = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })).await;
        let state = state(1);
        let plan = plan(
            backend_ref("a:primary", &bad),
            vec![backend_ref("b:fallback", &bad)],
        );
        let cancel = CancellationToken::new();
        let err = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap_err();
        match err {
            ProxyError::AllBackendsFailed(message) => {
                assert!(message.contains("1 retry cycles"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    async fn spawn_counting_stub(
        hits: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        status: StatusCode,
        body: serde_json::Value,
    ) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let body = body.clone();
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async move { (status, Json(body)) }
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn active_cooldown_excludes_primary_from_every_cycle() {
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let primary = spawn_counting_stub(
            std::sync::Arc::clone(&hits),
            StatusCode::OK,
            json!({ "id": "primary" }),
        )
        .await;
        let good = spawn_stub(StatusCode::OK, json!({ "id": "fallback" })).await;
        let state = state(3);
        state.cooldown.arm(300);
        let plan = plan(
            backend_ref("a:primary", &primary),
            vec![backend_ref("b:fallback", &good)],
        );
        let cancel = CancellationToken::new();
        let (value, used) = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap();
        assert_eq!(value["id"], "fallback");
        assert_eq!(used.model(), "b:fallback");
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    async fn spawn_sse_stub() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                axum::response::Response::builder()
                    .status(StatusCode::OK)
                    .header("content-type", "text/event-stream")
                    .body(axum::body::Body::from("data: {\"ok\":true}\n\ndata: [DONE]\n\n"))
                    .unwrap()
            }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn streaming_dispatch_falls_over_before_first_byte() {
        let bad = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })).await;
        let sse = spawn_sse_stub().await;
        let state = state(2);
        let plan = plan(
            backend_ref("a:primary", &bad),
            vec![backend_ref("b:fallback", &sse)],
        );
        let cancel = CancellationToken::new();
        let (response, used) = dispatch_streaming(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap();
        assert_eq!(used.model(), "b:fallback");
        let text = response.text().await.unwrap();
        assert!(text.contains("data: {\"ok\":true}"));
        assert!(text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn cancelled_caller_stops_dispatch() {
        let bad = spawn_stub(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "boom" })).await;
        let state = state(10);
        let plan = plan(
            backend_ref("a:primary", &bad),
            vec![backend_ref("b:fallback", &bad)],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatch_buffered(&state, &plan, &chat_body(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::ClientDisconnected));
    }
}

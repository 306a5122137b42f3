//! Upstream HTTP client: endpoint construction, buffered and streaming
//! POSTs with timeout and cancellation, and SSE frame filtering.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::Bytes;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProviderCfg;
use crate::logger;

use super::context::BackendRef;
use super::error::{ProxyError, ProxyResult};
use super::translate;

/// Which upstream API a request speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    ChatCompletions,
    Responses,
}

impl ApiFlavor {
    pub fn for_model(model_id: &str) -> Self {
        if translate::uses_responses_api(model_id) {
            ApiFlavor::Responses
        } else {
            ApiFlavor::ChatCompletions
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            ApiFlavor::ChatCompletions => "chat/completions",
            ApiFlavor::Responses => "responses",
        }
    }
}

/// Build the provider endpoint URL. Providers with an `api_version` use
/// the Azure deployment pattern; everything else appends the API path to
/// the base URL.
pub fn build_endpoint(provider: &ProviderCfg, model_id: &str, flavor: ApiFlavor) -> String {
    let base = provider.base_url.trim_end_matches('/');
    match &provider.api_version {
        Some(version) => format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            base,
            urlencoding::encode(model_id),
            flavor.path(),
            urlencoding::encode(version),
        ),
        None => format!("{}/{}", base, flavor.path()),
    }
}

/// Azure-style providers authenticate with `api-key`, standard ones with
/// a bearer token.
pub fn build_headers(provider: &ProviderCfg) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    if provider.api_version.is_some() {
        if let Ok(value) = HeaderValue::from_str(&provider.api_key) {
            headers.insert("api-key", value);
        }
    } else if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", provider.api_key)) {
        headers.insert("authorization", value);
    }
    headers
}

/// Derive the wire body for one attempt: the model is overridden with the
/// backend's model id and Responses-flavored backends get the re-encoded
/// request shape.
pub fn wire_body(backend: &BackendRef, internal: &Value) -> (Value, ApiFlavor) {
    let flavor = ApiFlavor::for_model(backend.model_id());
    let mut body = internal.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(backend.model_id().to_string()));
    }
    if flavor == ApiFlavor::Responses {
        body = translate::to_responses_request(&body);
    }
    (body, flavor)
}

fn map_send_error(err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout
    } else {
        ProxyError::Internal(format!("upstream request error: {}", err))
    }
}

/// Buffered POST. The future is abandoned when the caller's token fires
/// or the deadline expires; the connection is torn down with it.
pub async fn send_buffered(
    http: &reqwest::Client,
    backend: &BackendRef,
    wire: &Value,
    flavor: ApiFlavor,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProxyResult<Value> {
    let url = build_endpoint(&backend.provider, backend.model_id(), flavor);
    let headers = build_headers(&backend.provider);
    logger::debug("client", &format!("POST {}", url));

    let send = http.post(&url).headers(headers).json(wire).send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::ClientDisconnected),
        outcome = tokio::time::timeout(timeout, send) => match outcome {
            Err(_) => return Err(ProxyError::UpstreamTimeout),
            Ok(Err(e)) => return Err(map_send_error(e)),
            Ok(Ok(response)) => response,
        },
    };

    let status = response.status();
    let text = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::ClientDisconnected),
        outcome = tokio::time::timeout(timeout, response.text()) => match outcome {
            Err(_) => return Err(ProxyError::UpstreamTimeout),
            Ok(Err(e)) => return Err(map_send_error(e)),
            Ok(Ok(text)) => text,
        },
    };

    if !status.is_success() {
        logger::warn(
            "client",
            &format!(
                "upstream {} returned {} ({})",
                backend.model(),
                status.as_u16(),
                classify_error_cause(&text)
            ),
        );
        return Err(ProxyError::UpstreamHttp { status: status.as_u16(), body: text });
    }

    serde_json::from_str(&text)
        .map_err(|e| ProxyError::Internal(format!("failed to parse upstream response: {}", e)))
}

/// Open a streaming POST. Success means status-line and headers are in;
/// the returned response's byte stream is consumed by the caller. The
/// wire body is sent with `stream: true` and, for chat completions,
/// `stream_options.include_usage` so usage arrives in-band.
pub async fn send_streaming(
    http: &reqwest::Client,
    backend: &BackendRef,
    wire: &Value,
    flavor: ApiFlavor,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ProxyResult<reqwest::Response> {
    let url = build_endpoint(&backend.provider, backend.model_id(), flavor);
    let mut headers = build_headers(&backend.provider);
    headers.insert("accept", HeaderValue::from_static("text/event-stream"));

    let mut body = wire.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("stream".to_string(), Value::Bool(true));
        if flavor == ApiFlavor::ChatCompletions {
            // Responses upstreams reject stream_options.
            obj.insert(
                "stream_options".to_string(),
                serde_json::json!({ "include_usage": true }),
            );
        }
    }

    logger::debug("client", &format!("POST {} (stream)", url));
    let send = http.post(&url).headers(headers).json(&body).send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ProxyError::ClientDisconnected),
        outcome = tokio::time::timeout(timeout, send) => match outcome {
            Err(_) => return Err(ProxyError::UpstreamTimeout),
            Ok(Err(e)) => return Err(map_send_error(e)),
            Ok(Ok(response)) => response,
        },
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        logger::warn(
            "client",
            &format!(
                "upstream {} stream returned {} ({})",
                backend.model(),
                status.as_u16(),
                classify_error_cause(&text)
            ),
        );
        return Err(ProxyError::UpstreamHttp { status: status.as_u16(), body: text });
    }
    Ok(response)
}

// ---------------------------------------------------------------------------
// SSE framing
// ---------------------------------------------------------------------------

/// Incremental SSE filter. Bytes accumulate until a blank-line frame
/// boundary; within each frame only `data:` lines are forwarded, each
/// re-terminated with one blank line. `[DONE]` is an ordinary data line.
#[derive(Default)]
pub struct SseFrameFilter {
    buffer: Vec<u8>,
}

fn frame_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some((a, al)), Some((b, bl))) => Some(if a < b { (a, al) } else { (b, bl) }),
        (Some(found), None) | (None, Some(found)) => Some(found),
        (None, None) => None,
    }
}

fn filter_frame(frame: &[u8], out: &mut Vec<Bytes>) {
    let text = String::from_utf8_lossy(frame);
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with("data:") {
            out.push(Bytes::from(format!("{}\n\n", line)));
        }
    }
}

impl SseFrameFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every completed frame's filtered lines.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some((pos, delim)) = frame_boundary(&self.buffer) {
            let frame: Vec<u8> = self.buffer.drain(..pos + delim).collect();
            filter_frame(&frame[..pos], &mut out);
        }
        out
    }

    /// Flush the residual tail at EOF using the same rule.
    pub fn flush(&mut self) -> Vec<Bytes> {
        let mut out = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            filter_frame(&rest, &mut out);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Map lower-cased upstream error text to a human-readable cause for logs.
pub fn classify_error_cause(text: &str) -> &'static str {
    let text = text.to_lowercase();
    if text.contains("unsupported_country_region_territory")
        || text.contains("country, region, or territory")
    {
        "unsupported region"
    } else if text.contains("invalid api key")
        || text.contains("incorrect api key")
        || text.contains("invalid x-api-key")
        || text.contains("authentication_error")
    {
        "invalid key"
    } else if text.contains("rate limit") || text.contains("rate_limit") || text.contains("too many requests")
    {
        "rate limit"
    } else if text.contains("model_not_found")
        || text.contains("does not exist")
        || text.contains("unknown model")
    {
        "model not found"
    } else if text.contains("billing")
        || text.contains("insufficient_quota")
        || text.contains("exceeded your current quota")
    {
        "billing"
    } else {
        "unknown"
    }
}

/// Code used in failover logs: the HTTP status when present, else a
/// leading 3-digit run in the message, else the error kind name.
pub fn error_code(err: &ProxyError) -> String {
    if let ProxyError::UpstreamHttp { status, .. } = err {
        return status.to_string();
    }
    let message = err.to_string();
    let digits: String = message.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.len() == 3 {
        digits
    } else {
        err.kind_name().to_string()
    }
}

// ---------------------------------------------------------------------------
// In-flight cancellation registry
// ---------------------------------------------------------------------------

/// Tracks the cancellation token of every in-flight request so a request
/// can be aborted by id.
pub struct CancelRegistry {
    inner: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self { inner: Mutex::new(HashMap::new()) }
    }

    /// Register a request, returning its token. The token is dropped from
    /// the registry by `unregister`, on all handler exit paths.
    pub fn register(&self, request_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut map) = self.inner.lock() {
            map.insert(request_id, token.clone());
        }
        token
    }

    pub fn unregister(&self, request_id: &Uuid) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(request_id);
        }
    }

    /// Abort a request in flight.
    pub fn cancel(&self, request_id: &Uuid) -> bool {
        let token = self
            .inner
            .lock()
            .ok()
            .and_then(|map| map.get(request_id).cloned());
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<Uuid> {
        self.inner
            .lock()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for CancelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendCfg;

    fn provider(api_version: Option<&str>) -> ProviderCfg {
        ProviderCfg {
            api_key: "sk-test".to_string(),
            base_url: "https://api.example.com/v1".to_string(),
            api_version: api_version.map(|s| s.to_string()),
        }
    }

    #[test]
    fn standard_endpoint_paths() {
        let p = provider(None);
        assert_eq!(
            build_endpoint(&p, "gpt-4o", ApiFlavor::ChatCompletions),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            build_endpoint(&p, "gpt-5-mini", ApiFlavor::Responses),
            "https://api.example.com/v1/responses"
        );
    }

    #[test]
    fn azure_endpoint_encodes_model_and_version() {
        let p = ProviderCfg {
            api_key: "k".to_string(),
            base_url: "https://example.openai.azure.com".to_string(),
            api_version: Some("2024-02-01".to_string()),
        };
        assert_eq!(
            build_endpoint(&p, "gpt 4o/custom", ApiFlavor::ChatCompletions),
            "https://example.openai.azure.com/openai/deployments/gpt%204o%2Fcustom/chat/completions?api-version=2024-02-01"
        );
    }

    #[test]
    fn headers_switch_on_api_version() {
        let standard = build_headers(&provider(None));
        assert_eq!(standard.get("authorization").unwrap(), "Bearer sk-test");
        assert!(standard.get("api-key").is_none());

        let azure = build_headers(&provider(Some("2024-02-01")));
        assert_eq!(azure.get("api-key").unwrap(), "sk-test");
        assert!(azure.get("authorization").is_none());
    }

    #[test]
    fn wire_body_overrides_model_and_reencodes_gpt5() {
        let backend = BackendRef {
            backend: BackendCfg { model: "az:gpt-5-mini".to_string(), ..Default::default() },
            provider: provider(None),
        };
        let internal = serde_json::json!({
            "model": "claude-3-haiku",
            "messages": [ { "role": "user", "content": "hi" } ],
            "temperature": 0.3
        });
        let (body, flavor) = wire_body(&backend, &internal);
        assert_eq!(flavor, ApiFlavor::Responses);
        assert_eq!(body["model"], "gpt-5-mini");
        assert_eq!(body["input"], "user: hi");
        assert!(body.get("temperature").is_none());

        let backend = BackendRef {
            backend: BackendCfg { model: "oa:gpt-4o".to_string(), ..Default::default() },
            provider: provider(None),
        };
        let (body, flavor) = wire_body(&backend, &internal);
        assert_eq!(flavor, ApiFlavor::ChatCompletions);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.3);
    }

    #[test]
    fn sse_filter_forwards_data_lines_in_order() {
        let mut filter = SseFrameFilter::new();
        let chunks = filter.push(b"event: ping\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n");
        let text: Vec<String> = chunks.iter().map(|b| String::from_utf8_lossy(b).to_string()).collect();
        assert_eq!(text, vec!["data: {\"a\":1}\n\n", "data: {\"b\":2}\n\n"]);
    }

    #[test]
    fn sse_filter_buffers_partial_frames() {
        let mut filter = SseFrameFilter::new();
        assert!(filter.push(b"data: {\"partial\":").is_empty());
        let chunks = filter.push(b"true}\n\n");
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], b"data: {\"partial\":true}\n\n");
    }

    #[test]
    fn sse_filter_handles_crlf_and_done_sentinel() {
        let mut filter = SseFrameFilter::new();
        let chunks = filter.push(b"data: x\r\n\r\ndata: [DONE]\r\n\r\n");
        assert_eq!(&chunks[0][..], b"data: x\n\n");
        assert_eq!(&chunks[1][..], b"data: [DONE]\n\n");
    }

    #[test]
    fn sse_filter_flushes_residual_tail() {
        let mut filter = SseFrameFilter::new();
        assert!(filter.push(b"data: tail-no-frame-end").is_empty());
        let flushed = filter.flush();
        assert_eq!(&flushed[0][..], b"data: tail-no-frame-end\n\n");
        assert!(filter.flush().is_empty());
    }

    #[test]
    fn non_data_lines_never_appear() {
        let mut filter = SseFrameFilter::new();
        let mut all = filter.push(b"event: message\nid: 7\ndata: keep\nretry: 100\n\n");
        all.extend(filter.flush());
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"data: keep\n\n");
    }

    #[test]
    fn error_cause_classification() {
        assert_eq!(classify_error_cause("Country, region, or territory not supported"), "unsupported region");
        assert_eq!(classify_error_cause("Incorrect API key provided"), "invalid key");
        assert_eq!(classify_error_cause("Rate limit reached for requests"), "rate limit");
        assert_eq!(classify_error_cause("The model `x` does not exist"), "model not found");
        assert_eq!(classify_error_cause("You exceeded your current quota"), "billing");
        assert_eq!(classify_error_cause("???"), "unknown");
    }

    #[test]
    fn error_code_extraction() {
        let http = ProxyError::UpstreamHttp { status: 429, body: "x".to_string() };
        assert_eq!(error_code(&http), "429");
        assert_eq!(error_code(&ProxyError::UpstreamTimeout), "UpstreamTimeout");
        assert_eq!(
            error_code(&ProxyError::Internal("503 service broke".to_string())),
            "Internal"
        );
    }

    #[test]
    fn cancel_registry_lifecycle() {
        let registry = CancelRegistry::new();
        let id = Uuid::new_v4();
        let token = registry.register(id);
        assert!(!token.is_cancelled());
        assert!(registry.cancel(&id));
        assert!(token.is_cancelled());
        registry.unregister(&id);
        assert!(!registry.cancel(&id));
        assert_eq!(registry.len(), 0);
    }
}

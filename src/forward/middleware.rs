//! Request admission: authentication, body parsing, and dispatch-plan
//! building.

use axum::http::HeaderMap;
use serde_json::Value;
use uuid::Uuid;

use crate::logger;

use super::context::{AppState, BackendRef, DispatchPlan};
use super::error::{ProxyError, ProxyResult};
use super::{routing, tokens};

/// Pull the client token from `x-api-key` or `Authorization: Bearer`.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(token) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(token);
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// An empty token table disables authentication. Otherwise the presented
/// token must appear among the configured values.
pub fn authenticate(headers: &HeaderMap, state: &AppState) -> ProxyResult<()> {
    if state.settings.tokens.is_empty() {
        return Ok(());
    }
    match extract_token(headers) {
        Some(token) if state.settings.tokens.values().any(|t| t == &token) => Ok(()),
        Some(_) => Err(ProxyError::AuthFailed("invalid API key".to_string())),
        None => Err(ProxyError::AuthFailed("missing API key".to_string())),
    }
}

pub fn parse_body(body: &[u8]) -> ProxyResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("invalid JSON body: {}", e)))
}

/// Clients send `stream` as bool, number, or string; coerce to a strict
/// bool and report it.
pub fn normalize_stream_flag(payload: &mut Value) -> bool {
    let Some(obj) = payload.as_object_mut() else {
        return false;
    };
    let is_streaming = match obj.get("stream") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    };
    if obj.contains_key("stream") {
        obj.insert("stream".to_string(), Value::Bool(is_streaming));
    }
    is_streaming
}

/// Estimate, select, and assemble the per-request dispatch plan. The
/// selected backend becomes the primary; the rest of the catalog, in
/// configured order, is the effective failover list.
pub fn build_plan(state: &AppState, payload: &Value) -> ProxyResult<DispatchPlan> {
    let estimated_tokens = tokens::estimate_request(payload);
    let selected = routing::select(&state.settings.backend, payload, estimated_tokens, &[])
        .map_err(|miss| ProxyError::BadRequest(miss.message().to_string()))?;

    let resolve = |backend: &crate::config::BackendCfg| -> ProxyResult<BackendRef> {
        let provider = state
            .settings
            .provider_for(backend)
            .cloned()
            .ok_or_else(|| {
                ProxyError::Internal(format!(
                    "backend '{}' references unknown provider",
                    backend.model
                ))
            })?;
        Ok(BackendRef { backend: backend.clone(), provider })
    };

    let primary = resolve(selected)?;
    let failover = state
        .settings
        .backend
        .iter()
        .filter(|b| b.model != selected.model)
        .map(resolve)
        .collect::<ProxyResult<Vec<_>>>()?;

    let request_id = Uuid::new_v4();
    let original_model = payload
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or("")
        .to_string();

    logger::info(
        "middleware",
        &format!(
            "request {}: model={} -> {}, tokens~{}, failover_candidates={}",
            request_id,
            original_model,
            primary.model(),
            estimated_tokens,
            failover.len(),
        ),
    );

    Ok(DispatchPlan {
        request_id,
        original_model,
        estimated_tokens,
        primary,
        failover,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendCfg, ProviderCfg, Settings};
    use axum::http::HeaderValue;
    use serde_json::json;

    fn state_with_tokens(tokens: &[(&str, &str)]) -> AppState {
        let mut settings = Settings::default();
        for (name, token) in tokens {
            settings.tokens.insert(name.to_string(), token.to_string());
        }
        AppState::new(settings).unwrap()
    }

    fn catalog_state(models: &[&str]) -> AppState {
        let mut settings = Settings::default();
        settings.provider.insert(
            "p".to_string(),
            ProviderCfg {
                api_key: "k".to_string(),
                base_url: "http://127.0.0.1:1".to_string(),
                api_version: None,
            },
        );
        for model in models {
            settings.backend.push(BackendCfg {
                model: model.to_string(),
                ..Default::default()
            });
        }
        AppState::new(settings).unwrap()
    }

    #[test]
    fn auth_disabled_with_empty_table() {
        let state = state_with_tokens(&[]);
        assert!(authenticate(&HeaderMap::new(), &state).is_ok());
    }

    #[test]
    fn auth_accepts_x_api_key_and_bearer() {
        let state = state_with_tokens(&[("alice", "tok-1")]);

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("tok-1"));
        assert!(authenticate(&headers, &state).is_ok());

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-1"));
        assert!(authenticate(&headers, &state).is_ok());
    }

    #[test]
    fn auth_rejects_missing_and_unknown_tokens() {
        let state = state_with_tokens(&[("alice", "tok-1")]);
        assert!(matches!(
            authenticate(&HeaderMap::new(), &state),
            Err(ProxyError::AuthFailed(_))
        ));

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("wrong"));
        assert!(matches!(
            authenticate(&headers, &state),
            Err(ProxyError::AuthFailed(_))
        ));
    }

    #[test]
    fn parse_body_rejects_invalid_json() {
        assert!(parse_body(b"{\"ok\":true}").is_ok());
        assert!(matches!(parse_body(b"nope"), Err(ProxyError::BadRequest(_))));
    }

    #[test]
    fn stream_flag_coercion() {
        let mut payload = json!({ "stream": "true" });
        assert!(normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], true);

        let mut payload = json!({ "stream": 0 });
        assert!(!normalize_stream_flag(&mut payload));
        assert_eq!(payload["stream"], false);

        let mut payload = json!({});
        assert!(!normalize_stream_flag(&mut payload));
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn plan_puts_selected_backend_first_and_rest_in_order() {
        let state = catalog_state(&["p:a", "p:b", "p:c"]);
        let payload = json!({
            "model": "m",
            "messages": [ { "role": "user", "content": "hi" } ]
        });
        let plan = build_plan(&state, &payload).unwrap();
        assert_eq!(plan.primary.model(), "p:a");
        let failover: Vec<_> = plan.failover.iter().map(|b| b.model().to_string()).collect();
        assert_eq!(failover, vec!["p:b", "p:c"]);
        assert_eq!(plan.original_model, "m");
    }

    #[test]
    fn plan_reports_capability_misses_as_bad_request() {
        let state = catalog_state(&["p:a"]);
        let payload = json!({
            "model": "m",
            "messages": [{
                "role": "user",
                "content": [ { "type": "image_url", "image_url": { "url": "x" } } ]
            }]
        });
        match build_plan(&state, &payload).unwrap_err() {
            ProxyError::BadRequest(message) => {
                assert_eq!(message, "no model supports vision");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn two_plans_from_one_catalog_are_disjoint_state() {
        let state = catalog_state(&["p:a", "p:b"]);
        let text = json!({ "model": "m", "messages": [ { "role": "user", "content": "x" } ] });
        let plan_a = build_plan(&state, &text).unwrap();
        // a request whose size rules out the first backend
        let mut small = state.settings.backend[0].clone();
        small.context = Some(1);
        let mut settings = state.settings.clone();
        settings.backend[0] = small;
        let state_b = AppState::new(settings).unwrap();
        let plan_b = build_plan(&state_b, &text).unwrap();

        assert_eq!(plan_a.primary.model(), "p:a");
        assert_eq!(plan_b.primary.model(), "p:b");
        assert_eq!(plan_a.failover[0].model(), "p:b");
        assert_eq!(plan_b.failover[0].model(), "p:a");
    }
}

//! HTTP surface: route table, CORS, and the serve loop.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::forward::{self, json_response, AppState};
use crate::logger;

async fn root(State(state): State<Arc<AppState>>) -> Response {
    json_response(
        StatusCode::OK,
        &json!({
            "name": "llmux",
            "version": env!("CARGO_PKG_VERSION"),
            "config_digest": state.settings.digest(),
        }),
    )
}

async fn health() -> Response {
    json_response(StatusCode::OK, &json!({ "status": "ok" }))
}

async fn not_found() -> Response {
    json_response(StatusCode::NOT_FOUND, &json!({ "error": "Not Found" }))
}

/// Answer any OPTIONS request with 204 and permissive CORS headers before
/// routing can 405 it.
async fn options_shortcut(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("access-control-allow-origin", "*")
            .header("access-control-allow-methods", "*")
            .header("access-control-allow-headers", "*")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response());
    }
    next.run(request).await
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/test-connection", get(forward::test_connection))
        .route("/v1/messages", post(forward::anthropic_messages))
        .route("/v1/messages/count_tokens", post(forward::count_tokens))
        .route("/v1/chat/completions", post(forward::chat_completions))
        .route("/v1/models", get(forward::list_models))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(options_shortcut))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> Result<(), String> {
    let addr = format!("{}:{}", state.settings.host, state.settings.port);
    if state.settings.https_enabled {
        logger::warn(
            "server",
            "https_enabled is set; TLS termination is expected in front of this process",
        );
    }
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", addr, e))?;
    logger::info("server", &format!("listening on {}", addr));
    axum::serve(listener, app(state))
        .await
        .map_err(|e| format!("server error: {}", e))
}

//! HTTP surface: `/v1/messages`, `/v1/messages/count_tokens`, `/healthz`.
//!
//! This is the only layer that maps [`ProxyError`] onto HTTP status codes.
//! Client-visible error messages stay short and never echo upstream
//! payloads or credentials.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::context::{self, RequestContext};
use crate::error::ProxyError;
use crate::forward;
use crate::inject;
use crate::ratelimit::RateLimiter;
use crate::tokens;
use crate::types::MessagesRequest;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub client: reqwest::Client,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.max_requests_per_minute));
        Self {
            config: Arc::new(config),
            client: reqwest::Client::new(),
            limiter,
        }
    }
}

/// Build the full application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handle_messages))
        .route("/v1/messages/count_tokens", post(handle_count_tokens))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn handle_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Response {
    let client_key = extract_client_key(&headers);
    if let Some(expected) = &state.config.client_api_key {
        if client_key.as_deref() != Some(expected.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "authentication_error", "invalid api key");
        }
    }

    if !state.limiter.try_acquire() {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "request budget exhausted, retry later",
        );
    }

    let request: MessagesRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("request schema invalid: {err}"),
            )
        }
    };

    let ctx = match RequestContext::build(&state.config, request, client_key.as_deref()) {
        Ok(ctx) => ctx,
        Err(err) => return proxy_error_response(&err),
    };

    info!(
        request_id = %ctx.request_id,
        upstream = ctx.upstream.protocol.name(),
        upstream_model = %ctx.upstream.upstream_model,
        tools = ctx.original.tools.as_ref().map(|t| t.len()).unwrap_or(0),
        trigger = ctx
            .delimiter
            .as_ref()
            .map(|d| &d.tc_start()[..d.tc_start().len().min(9)])
            .unwrap_or(""),
        "forwarding request"
    );

    if ctx.original.is_streaming() {
        forward::forward_streaming(state.client.clone(), state.config.clone(), ctx).await
    } else {
        match forward::forward_non_streaming(&state.client, &state.config, &ctx).await {
            Ok(body) => Json(body).into_response(),
            Err(err) => proxy_error_response(&err),
        }
    }
}

/// Token counting over the enrichment of the exact request payload. Never
/// touches upstream.
pub async fn handle_count_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Response {
    let client_key = extract_client_key(&headers);
    if let Some(expected) = &state.config.client_api_key {
        if client_key.as_deref() != Some(expected.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "authentication_error", "invalid api key");
        }
    }

    let request: MessagesRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("request schema invalid: {err}"),
            )
        }
    };

    let (enriched, _) = inject::enrich(&request);
    let count = tokens::count(&context::prompt_text(&enriched), &request.model) as u64;

    // Three aliases for the same number, kept for client back-compat.
    Json(json!({
        "input_tokens": count,
        "token_count": count,
        "tokens": count,
    }))
    .into_response()
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

fn extract_client_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn proxy_error_response(err: &ProxyError) -> Response {
    warn!(error = %err, "request failed");
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    // Client sees the taxonomy label and a short message, never the
    // upstream payload.
    let message = match err {
        ProxyError::UpstreamHttp { status, .. } => format!("upstream returned {status}"),
        other => other.to_string(),
    };
    error_response(status, err.error_type(), &message)
}

fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "type": "error",
            "error": {"type": error_type, "message": message}
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_client_key_prefers_x_api_key() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "sk-a".parse().unwrap());
        headers.insert("authorization", "Bearer sk-b".parse().unwrap());
        assert_eq!(extract_client_key(&headers).as_deref(), Some("sk-a"));
    }

    #[test]
    fn test_extract_client_key_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer sk-client".parse().unwrap());
        assert_eq!(extract_client_key(&headers).as_deref(), Some("sk-client"));
    }

    #[test]
    fn test_extract_client_key_absent() {
        assert_eq!(extract_client_key(&HeaderMap::new()), None);
    }
}

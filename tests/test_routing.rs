//! Channel routing, key passthrough (S6), auth, and the token-count and
//! health endpoints.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use claude_bridge::config::{Channel, Config};
use claude_bridge::protocol::Protocol;
use claude_bridge::router::{app, AppState};

async fn send(
    router: Router,
    uri: &str,
    body: Value,
    auth: Option<(&str, &str)>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some((name, value)) = auth {
        builder = builder.header(name, value);
    }
    let response = router
        .oneshot(builder.body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, parsed)
}

// ---------------------------------------------------------------------------
// S6: channel routing + key passthrough
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_channel_routing_with_passthrough_key() {
    let server = MockServer::start().await;
    // The mock only answers when the client's key and the stripped model
    // name both arrive upstream; anything else fails the test with a 404.
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-client"))
        .and(body_partial_json(json!({"model": "foo/bar"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "routed"}}]
        })))
        .mount(&server)
        .await;

    let mut config = Config::for_upstream("https://unused.example");
    config.passthrough_api_key = true;
    config.channels.push(Channel {
        name: "openrouter".to_string(),
        base_url: format!("{}/api/v1", server.uri()),
        api_key: Some("sk-channel".to_string()),
        protocol: Protocol::OpenAi,
    });

    let (status, body) = send(
        app(AppState::new(config)),
        "/v1/messages",
        json!({
            "model": "openrouter+foo/bar",
            "max_tokens": 50,
            "messages": [{"role": "user", "content": "hi"}]
        }),
        Some(("authorization", "Bearer sk-client")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content"][0]["text"], "routed");
    assert_eq!(body["model"], "openrouter+foo/bar");
}

#[tokio::test]
async fn test_channel_key_used_without_passthrough() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-channel"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(&server)
        .await;

    let mut config = Config::for_upstream("https://unused.example");
    config.channels.push(Channel {
        name: "openrouter".to_string(),
        base_url: format!("{}/api/v1", server.uri()),
        api_key: Some("sk-channel".to_string()),
        protocol: Protocol::OpenAi,
    });

    let (status, _) = send(
        app(AppState::new(config)),
        "/v1/messages",
        json!({
            "model": "openrouter+foo/bar",
            "max_tokens": 50,
            "messages": [{"role": "user", "content": "hi"}]
        }),
        Some(("authorization", "Bearer sk-client")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Client auth
// ---------------------------------------------------------------------------

fn guarded_config() -> Config {
    let mut config = Config::for_upstream("https://unused.example");
    config.client_api_key = Some("sk-secret".to_string());
    config
}

#[tokio::test]
async fn test_auth_mismatch_is_401() {
    let (status, body) = send(
        app(AppState::new(guarded_config())),
        "/v1/messages",
        json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
        Some(("x-api-key", "sk-wrong")),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn test_auth_missing_is_401() {
    let (status, _) = send(
        app(AppState::new(guarded_config())),
        "/v1/messages",
        json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_accepts_bearer_form() {
    // Correct key via Authorization passes auth and reaches counting.
    let (status, body) = send(
        app(AppState::new(guarded_config())),
        "/v1/messages/count_tokens",
        json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}),
        Some(("authorization", "Bearer sk-secret")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["input_tokens"].as_u64().unwrap() > 0);
}

// ---------------------------------------------------------------------------
// count_tokens and healthz
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_count_tokens_aliases_match() {
    let (status, body) = send(
        app(AppState::new(Config::for_upstream("https://unused.example"))),
        "/v1/messages/count_tokens",
        json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "count these tokens please"}]
        }),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let count = body["input_tokens"].as_u64().unwrap();
    assert!(count > 0);
    assert_eq!(body["token_count"].as_u64().unwrap(), count);
    assert_eq!(body["tokens"].as_u64().unwrap(), count);
}

#[tokio::test]
async fn test_count_tokens_grows_with_tools() {
    let router = app(AppState::new(Config::for_upstream("https://unused.example")));

    let plain = json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "hello"}]
    });
    let mut with_tools = plain.clone();
    with_tools["tools"] = json!([{
        "name": "get_weather",
        "description": "Look up the weather",
        "input_schema": {"properties": {"city": {"type": "string"}}, "required": ["city"]}
    }]);

    let (_, plain_body) = send(router.clone(), "/v1/messages/count_tokens", plain, None).await;
    let (_, tools_body) = send(router, "/v1/messages/count_tokens", with_tools, None).await;

    // Enrichment injects the catalog and instructions, so the count rises.
    assert!(
        tools_body["input_tokens"].as_u64().unwrap()
            > plain_body["input_tokens"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn test_healthz() {
    let router = app(AppState::new(Config::for_upstream("https://unused.example")));
    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_rate_limit_budget_returns_429() {
    let mut config = Config::for_upstream("https://unused.example");
    config.max_requests_per_minute = Some(1);
    let router = app(AppState::new(config));

    let request = json!({
        "model": "m",
        "max_tokens": 10,
        "messages": [{"role": "user", "content": "hi"}]
    });

    // First request is admitted (and fails upstream, which is fine here);
    // the second is rejected at the door.
    let (first, _) = send(router.clone(), "/v1/messages", request.clone(), None).await;
    assert_ne!(first, StatusCode::TOO_MANY_REQUESTS);

    let (second, body) = send(router, "/v1/messages", request, None).await;
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

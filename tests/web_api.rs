//! Integration tests for `src/web_api.rs`
//!
//! Drives the axum router in-process with `tower::ServiceExt::oneshot`, so
//! no socket is bound. The facade is wired with the echo provider, a canned
//! search backend and an in-memory session store.
//!
//! All tests require the `web-api` Cargo feature.

#![cfg(feature = "web-api")]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use prompt_gateway::config::{RoutingConfig, RuleDefinition, ServerConfig};
use prompt_gateway::health::{HealthSnapshot, ProviderHealth};
use prompt_gateway::provider::{
    EchoProvider, ProviderRegistry, SearchError, SearchProvider, SearchQuery, SearchResult,
};
use prompt_gateway::store::{MemoryStore, SessionStore};
use prompt_gateway::web_api::{build_router, AppState, SESSION_HEADER};
use prompt_gateway::{DispatchFacade, ProviderId, RuleTable, RuleTableHandle};

// ============================================================================
// Test Infrastructure
// ============================================================================

struct FixedSearch;

#[async_trait]
impl SearchProvider for FixedSearch {
    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchResult>, SearchError> {
        if query.query == "nothing" {
            return Ok(Vec::new());
        }
        Ok((1..=10)
            .map(|n| SearchResult {
                title: format!("{} {n}", query.query),
                snippet: format!("snippet {n}"),
                url: format!("https://example.org/{n}"),
            })
            .take(query.limit)
            .collect())
    }
}

struct Options {
    healthy: bool,
    sessions: bool,
    max_request_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            healthy: true,
            sessions: true,
            max_request_size: 64 * 1024,
        }
    }
}

fn app_with(options: Options) -> Router {
    let table = RuleTable::load(&RoutingConfig {
        default_provider: ProviderId::Echo,
        models: BTreeMap::from([(ProviderId::Echo, "echo-default".to_string())]),
        rules: vec![RuleDefinition {
            keywords: vec!["code".into()],
            pattern: None,
            provider: ProviderId::Echo,
            model: "echo-code".into(),
            priority: 1,
        }],
    })
    .expect("test: table");

    let health: HealthSnapshot = if options.healthy {
        [(ProviderId::Echo, ProviderHealth::available())]
            .into_iter()
            .collect()
    } else {
        [(ProviderId::Echo, ProviderHealth::unavailable("maintenance"))]
            .into_iter()
            .collect()
    };

    let providers = ProviderRegistry::new().with(Arc::new(EchoProvider::new()));
    let mut facade = DispatchFacade::new(
        Arc::new(RuleTableHandle::new(table)),
        Arc::new(health),
        Arc::new(providers),
    )
    .with_search(Arc::new(FixedSearch));
    if options.sessions {
        facade = facade.with_sessions(SessionStore::new(Arc::new(MemoryStore::new(100)), None));
    }

    let server = ServerConfig {
        max_request_size: options.max_request_size,
        ..ServerConfig::default()
    };
    build_router(Arc::new(AppState::new(Arc::new(facade), server)))
}

fn app() -> Router {
    app_with(Options::default())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("test: request")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("test: request")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("test: body");
    serde_json::from_slice(&bytes).expect("test: json body")
}

// ============================================================================
// POST /v1/generate
// ============================================================================

#[tokio::test]
async fn test_generate_routes_by_keyword() {
    let response = app()
        .oneshot(post_json("/v1/generate", json!({"prompt": "write code"})))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let body = json_body(response).await;
    assert_eq!(body["kind"], "text");
    assert_eq!(body["payload"], "[echo-code] write code");
    assert_eq!(body["providerUsed"], "echo");
    assert_eq!(body["modelUsed"], "echo-code");
}

#[tokio::test]
async fn test_generate_override_object_and_image_params() {
    let response = app()
        .oneshot(post_json(
            "/v1/generate",
            json!({
                "prompt": "a lighthouse",
                "override": {"provider": "echo", "model": "pixels"},
                "params": {"image": true, "width": 256, "height": 256}
            }),
        ))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["kind"], "image");
    assert_eq!(body["modelUsed"], "pixels");
    assert!(body["payload"]
        .as_str()
        .is_some_and(|p| p.starts_with("echo://image/")));
}

#[tokio::test]
async fn test_generate_blank_prompt_is_400() {
    let response = app()
        .oneshot(post_json("/v1/generate", json!({"prompt": "  "})))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error_kind"], "invalid_request");
    assert!(body.get("message").is_some());
    assert!(body.get("detail").is_some());
}

#[tokio::test]
async fn test_generate_malformed_json_is_400() {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/generate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("test: request");
    let response = app().oneshot(request).await.expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error_kind"], "invalid_request");
}

#[tokio::test]
async fn test_generate_unknown_override_is_400() {
    let response = app()
        .oneshot(post_json(
            "/v1/generate",
            json!({"prompt": "hi", "override": "openai"}),
        ))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_generate_no_provider_is_503_with_attempts() {
    let response = app_with(Options {
        healthy: false,
        ..Options::default()
    })
    .oneshot(post_json("/v1/generate", json!({"prompt": "hello"})))
    .await
    .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let body = json_body(response).await;
    assert_eq!(body["error_kind"], "no_provider_available");
    assert_eq!(body["detail"]["attempted"][0]["provider"], "echo");
    assert_eq!(body["detail"]["attempted"][0]["reason"], "maintenance");
}

#[tokio::test]
async fn test_generate_oversized_body_is_413() {
    let response = app_with(Options {
        max_request_size: 32,
        ..Options::default()
    })
    .oneshot(post_json(
        "/v1/generate",
        json!({"prompt": "x".repeat(100)}),
    ))
    .await
    .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json_body(response).await["error_kind"], "payload_too_large");
}

// ============================================================================
// Sessions
// ============================================================================

#[tokio::test]
async fn test_session_header_round_trip() {
    let app = app();

    let mut request = post_json("/v1/generate", json!({"prompt": "hello"}));
    request
        .headers_mut()
        .insert(SESSION_HEADER, "abc-123".parse().expect("test: header"));
    let response = app.clone().oneshot(request).await.expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("abc-123")
    );

    let response = app
        .oneshot(get("/v1/sessions/abc-123"))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["session_id"], "abc-123");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "hello");
    assert_eq!(body["messages"][1]["role"], "assistant");
}

#[tokio::test]
async fn test_session_id_generated_when_absent() {
    let response = app()
        .oneshot(post_json("/v1/generate", json!({"prompt": "hello"})))
        .await
        .expect("test: oneshot");
    let id = response
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    assert!(!id.is_empty());
}

fn with_session(mut request: Request<Body>, id: &str) -> Request<Body> {
    request
        .headers_mut()
        .insert(SESSION_HEADER, id.parse().expect("test: header"));
    request
}

#[tokio::test]
async fn test_edit_index_regenerates_from_position() {
    let app = app();
    for prompt in ["hello", "goodbye"] {
        let request = with_session(post_json("/v1/generate", json!({ "prompt": prompt })), "s-9");
        let response = app.clone().oneshot(request).await.expect("test: oneshot");
        assert_eq!(response.status(), StatusCode::OK);
    }

    let request = with_session(
        post_json("/v1/generate", json!({"prompt": "write code", "edit_index": 2})),
        "s-9",
    );
    let response = app.clone().oneshot(request).await.expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(
        app.oneshot(get("/v1/sessions/s-9"))
            .await
            .expect("test: oneshot"),
    )
    .await;
    let contents: Vec<&str> = body["messages"]
        .as_array()
        .expect("test: messages")
        .iter()
        .filter_map(|m| m["content"].as_str())
        .collect();
    assert_eq!(
        contents,
        vec![
            "hello",
            "[echo-default] hello",
            "write code",
            "[echo-code] write code"
        ]
    );
}

#[tokio::test]
async fn test_edit_index_out_of_range_is_400() {
    let app = app();
    let request = with_session(post_json("/v1/generate", json!({"prompt": "hello"})), "s-10");
    app.clone().oneshot(request).await.expect("test: oneshot");

    let request = with_session(
        post_json("/v1/generate", json!({"prompt": "again", "edit_index": 3})),
        "s-10",
    );
    let response = app.clone().oneshot(request).await.expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error_kind"], "invalid_request");
    assert!(body["message"]
        .as_str()
        .unwrap_or_default()
        .contains("edit_index 3"));

    let body = json_body(
        app.oneshot(get("/v1/sessions/s-10"))
            .await
            .expect("test: oneshot"),
    )
    .await;
    assert_eq!(body["messages"].as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let response = app()
        .oneshot(get("/v1/sessions/missing"))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error_kind"], "not_found");
}

#[tokio::test]
async fn test_sessions_disabled_omits_header() {
    let response = app_with(Options {
        sessions: false,
        ..Options::default()
    })
    .oneshot(post_json("/v1/generate", json!({"prompt": "hello"})))
    .await
    .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!response.headers().contains_key(SESSION_HEADER));
}

// ============================================================================
// GET /v1/search
// ============================================================================

#[tokio::test]
async fn test_search_default_limit() {
    let response = app()
        .oneshot(get("/v1/search?q=rust"))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let results = body.as_array().expect("test: array");
    assert_eq!(results.len(), 5);
    assert_eq!(results[0]["title"], "rust 1");
    assert!(results[0].get("snippet").is_some());
    assert!(results[0].get("url").is_some());
}

#[tokio::test]
async fn test_search_limit_bounds() {
    for (uri, status) in [
        ("/v1/search?q=rust&limit=20", StatusCode::OK),
        ("/v1/search?q=rust&limit=21", StatusCode::BAD_REQUEST),
        ("/v1/search?q=rust&limit=0", StatusCode::BAD_REQUEST),
        ("/v1/search", StatusCode::BAD_REQUEST),
        ("/v1/search?q=", StatusCode::BAD_REQUEST),
    ] {
        let response = app().oneshot(get(uri)).await.expect("test: oneshot");
        assert_eq!(response.status(), status, "{uri}");
    }
}

#[tokio::test]
async fn test_search_empty_result_is_404() {
    let response = app()
        .oneshot(get("/v1/search?q=nothing&safe=false&region=us-en"))
        .await
        .expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ============================================================================
// Health, metrics, request id
// ============================================================================

#[tokio::test]
async fn test_health_reports_version() {
    let response = app().oneshot(get("/health")).await.expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_metrics_endpoint_serves_text() {
    prompt_gateway::metrics::init_metrics().expect("test: metrics");
    let _ = app()
        .oneshot(post_json("/v1/generate", json!({"prompt": "code"})))
        .await
        .expect("test: oneshot");
    let response = app().oneshot(get("/metrics")).await.expect("test: oneshot");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("test: body");
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("gateway_requests_total"));
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "req-42")
        .body(Body::empty())
        .expect("test: request");
    let response = app().oneshot(request).await.expect("test: oneshot");
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-42")
    );
}

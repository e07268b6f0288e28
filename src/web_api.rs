//! Web API Server
//!
//! Thin HTTP surface over the [`DispatchFacade`]. Handlers parse and validate
//! requests, call the facade, and translate every error kind to a fixed
//! status code with a `{error_kind, message, detail}` JSON body.
//!
//! ## Endpoints
//!
//! - `POST /v1/generate` — Route and dispatch one prompt
//! - `GET  /v1/search` — Search passthrough
//! - `GET  /v1/sessions/{session_id}` — Stored transcript
//! - `GET  /health` — Liveness
//! - `GET  /metrics` — Prometheus metrics

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::dispatch::{DispatchError, DispatchFacade, DispatchResult};
use crate::provider::{GenerationParams, SearchError, SearchQuery, SearchResult};
use crate::routing::ProviderId;
use crate::store::{Message, SessionStore, StoreError};
use crate::{GatewayError, Prompt, PromptOverride};

/// Header carrying the session id on `POST /v1/generate`.
pub const SESSION_HEADER: &str = "session-id";

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_SEARCH_LIMIT: usize = 20;
const DEFAULT_SEARCH_LIMIT: usize = 5;

// ============================================================================
// Types
// ============================================================================

/// Shared application state available to all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    facade: Arc<DispatchFacade>,
    server: ServerConfig,
}

impl AppState {
    /// State serving `facade` with the `[server]` settings.
    pub fn new(facade: Arc<DispatchFacade>, server: ServerConfig) -> Self {
        Self { facade, server }
    }

    /// The dispatch facade.
    pub fn facade(&self) -> &Arc<DispatchFacade> {
        &self.facade
    }
}

/// Provider selection in a generate request.
///
/// Accepts `"auto"`, a bare provider name, or `{provider, model?}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OverrideChoice {
    /// `"auto"` or a provider name.
    Name(String),
    /// Explicit provider with an optional model.
    Target {
        /// Provider name.
        provider: String,
        /// Model; the provider default when absent.
        #[serde(default)]
        model: Option<String>,
    },
}

impl OverrideChoice {
    /// Resolve to a [`PromptOverride`]; `None` means automatic routing.
    fn resolve(&self) -> Result<Option<PromptOverride>, AppError> {
        let (name, model) = match self {
            Self::Name(name) if name.trim().eq_ignore_ascii_case("auto") => return Ok(None),
            Self::Name(name) => (name.as_str(), None),
            Self::Target { provider, model } => (provider.as_str(), model.clone()),
        };
        let provider: ProviderId = name
            .parse()
            .map_err(|e| AppError::InvalidRequest(format!("override: {e}")))?;
        let model = model.filter(|m| !m.trim().is_empty());
        Ok(Some(PromptOverride { provider, model }))
    }
}

/// JSON body for `POST /v1/generate`.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateRequest {
    /// Prompt text; must not be blank.
    pub prompt: String,
    /// Explicit provider selection.
    #[serde(default, rename = "override")]
    pub override_target: Option<OverrideChoice>,
    /// Generation parameters.
    #[serde(default)]
    pub params: GenerationParams,
    /// Session id; the `session-id` header takes precedence.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Regenerate from this transcript position; later messages are dropped.
    #[serde(default)]
    pub edit_index: Option<usize>,
}

impl GenerateRequest {
    fn into_prompt(self, session_id: Option<String>) -> Result<Prompt, AppError> {
        if self.prompt.trim().is_empty() {
            return Err(AppError::InvalidRequest("prompt must not be empty".into()));
        }
        if let Some(t) = self.params.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(AppError::InvalidRequest(format!(
                    "params.temperature must be within 0..=2, got {t}"
                )));
            }
        }
        if self.params.max_tokens == Some(0) {
            return Err(AppError::InvalidRequest(
                "params.max_tokens must be positive".into(),
            ));
        }

        let mut prompt = Prompt::new(self.prompt).with_params(self.params);
        if let Some(target) = self
            .override_target
            .as_ref()
            .map(OverrideChoice::resolve)
            .transpose()?
            .flatten()
        {
            prompt = prompt.with_override(target);
        }
        if let Some(id) = session_id {
            prompt = prompt.with_session(id);
        }
        if let Some(index) = self.edit_index {
            prompt = prompt.with_edit_index(index);
        }
        Ok(prompt)
    }
}

/// Query string of `GET /v1/search`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchParams {
    /// Query text; required.
    #[serde(default)]
    pub q: Option<String>,
    /// 1..=20, default 5.
    #[serde(default)]
    pub limit: Option<usize>,
    /// Safe search, default on.
    #[serde(default)]
    pub safe: Option<bool>,
    /// Region code.
    #[serde(default)]
    pub region: Option<String>,
}

impl SearchParams {
    fn into_query(self) -> Result<SearchQuery, AppError> {
        let q = self
            .q
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .ok_or_else(|| AppError::InvalidRequest("query parameter `q` is required".into()))?;
        let limit = self.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);
        if !(1..=MAX_SEARCH_LIMIT).contains(&limit) {
            return Err(AppError::InvalidRequest(format!(
                "limit must be within 1..={MAX_SEARCH_LIMIT}, got {limit}"
            )));
        }
        let mut query = SearchQuery::new(q).with_limit(limit);
        query.safe = self.safe.unwrap_or(true);
        query.region = self.region.filter(|r| !r.trim().is_empty());
        Ok(query)
    }
}

/// Body of `GET /v1/sessions/{session_id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Session id.
    pub session_id: String,
    /// Transcript in order.
    pub messages: Vec<Message>,
}

// ============================================================================
// Server
// ============================================================================

/// Build the router with all routes and middleware.
///
/// # Panics
///
/// This function never panics.
pub fn build_router(state: Arc<AppState>) -> Router {
    let max_request_size = state.server.max_request_size;
    let cors = cors_layer(&state.server.cors_allow_origins);

    Router::new()
        .route("/v1/generate", post(generate_handler))
        .route("/v1/search", get(search_handler))
        .route("/v1/sessions/:session_id", get(session_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            max_request_size,
            body_size_middleware,
        ))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(SESSION_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

/// Start the web API server.
///
/// Binds to `server.host:server.port` and serves until `shutdown` fires.
///
/// # Errors
///
/// Returns [`GatewayError::Server`] if the address cannot be bound or the
/// server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), GatewayError> {
    let addr = state.server.bind_addr();
    info!("Starting web API server on http://{}", addr);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Web API ready on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Web API stopped");
    Ok(())
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds a unique `X-Request-ID` header to every response.
///
/// If the client sends an `X-Request-ID` header, it is preserved; otherwise
/// a new UUID v4 is generated.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return AppError::PayloadTooLarge(max_size).into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /v1/generate` — Route and dispatch one prompt.
async fn generate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = body.map_err(AppError::from_json_rejection)?;

    let sessions = state.facade.sessions();
    let session_id = sessions.map(|_| {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| req.session_id.clone().filter(|s| !s.trim().is_empty()))
            .unwrap_or_else(SessionStore::new_session_id)
    });

    let prompt = req.into_prompt(session_id.clone())?;

    // The facade observes client disconnects through this token.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result: DispatchResult = state.facade.dispatch_with_cancel(&prompt, &cancel).await?;

    let mut response = Json(result).into_response();
    if let Some(value) = session_id.and_then(|id| HeaderValue::from_str(&id).ok()) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

/// `GET /v1/search` — Search passthrough.
async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> Result<Json<Vec<SearchResult>>, AppError> {
    let query = params.into_query()?;
    let search = state
        .facade
        .search()
        .ok_or(AppError::Unavailable("search is not configured"))?;

    let results = search.search(&query).await?;
    if results.is_empty() {
        return Err(AppError::NotFound(format!(
            "no results for \"{}\"",
            query.query
        )));
    }
    Ok(Json(results))
}

/// `GET /v1/sessions/{session_id}` — Stored transcript.
async fn session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, AppError> {
    let sessions = state
        .facade
        .sessions()
        .ok_or_else(|| AppError::NotFound("sessions are disabled".into()))?;
    let messages = sessions.load(&session_id).await?;
    if messages.is_empty() {
        return Err(AppError::NotFound(format!("session {session_id} not found")));
    }
    Ok(Json(SessionResponse {
        session_id,
        messages,
    }))
}

/// `GET /health` — Liveness check.
async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /metrics` — Prometheus metrics endpoint.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Error Type
// ============================================================================

/// Application-level errors returned by API handlers.
///
/// Each variant maps to an HTTP status code and a JSON error body.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug)]
pub enum AppError {
    /// Malformed or out-of-range input.
    InvalidRequest(String),
    /// The requested resource does not exist.
    NotFound(String),
    /// Request body over the configured limit.
    PayloadTooLarge(usize),
    /// A backing capability is not configured.
    Unavailable(&'static str),
    /// Dispatch failed.
    Dispatch(DispatchError),
    /// The search backend failed.
    Search(SearchError),
    /// The session store failed.
    Store(StoreError),
}

impl AppError {
    fn from_json_rejection(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return Self::PayloadTooLarge(0);
        }
        Self::InvalidRequest(rejection.body_text())
    }

    /// HTTP status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Dispatch(e) => match e {
                DispatchError::InvalidPrompt(_) => StatusCode::BAD_REQUEST,
                DispatchError::NoProviderAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                DispatchError::Provider(_) => StatusCode::BAD_GATEWAY,
                DispatchError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            },
            Self::Search(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable `error_kind` label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NotFound(_) => "not_found",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Unavailable(_) => "no_provider_available",
            Self::Dispatch(DispatchError::Cancelled) => "timeout",
            Self::Dispatch(e) => e.kind(),
            Self::Search(_) => "provider_error",
            Self::Store(_) => "store_error",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidRequest(m) | Self::NotFound(m) => m.clone(),
            Self::PayloadTooLarge(0) => "request body too large".to_string(),
            Self::PayloadTooLarge(max) => format!("request body exceeds {max} bytes"),
            Self::Unavailable(m) => (*m).to_string(),
            Self::Dispatch(e) => e.to_string(),
            Self::Search(e) => e.to_string(),
            // Backend messages may carry connection details.
            Self::Store(_) => "session store unavailable".to_string(),
        }
    }

    fn detail(&self) -> serde_json::Value {
        match self {
            Self::Dispatch(DispatchError::NoProviderAvailable(e)) => {
                serde_json::json!({ "attempted": e.attempted })
            }
            Self::Dispatch(DispatchError::Provider(e)) => serde_json::json!({
                "provider": e.provider,
                "provider_error": e.kind.as_str(),
            }),
            _ => serde_json::Value::Null,
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        Self::Dispatch(e)
    }
}

impl From<SearchError> for AppError {
    fn from(e: SearchError) -> Self {
        Self::Search(e)
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        warn!(error = %e, "session store failure");
        Self::Store(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error_kind": self.kind(),
            "message": self.message(),
            "detail": self.detail(),
        });
        (self.status(), Json(body)).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderErrorKind};
    use crate::routing::{AttemptedProvider, NoProviderAvailable};

    fn body(json: &str) -> GenerateRequest {
        serde_json::from_str(json).expect("test: request json")
    }

    #[test]
    fn test_generate_request_minimal_deserializes() {
        let req = body(r#"{"prompt": "hello"}"#);
        assert_eq!(req.prompt, "hello");
        assert!(req.override_target.is_none());
        assert_eq!(req.params, GenerationParams::default());
    }

    #[test]
    fn test_override_forms() {
        let auto = body(r#"{"prompt": "p", "override": "auto"}"#)
            .into_prompt(None)
            .expect("test: auto");
        assert!(auto.override_target.is_none());

        let named = body(r#"{"prompt": "p", "override": "hugging_face"}"#)
            .into_prompt(None)
            .expect("test: name");
        assert_eq!(
            named.override_target,
            Some(PromptOverride::provider(ProviderId::HuggingFace))
        );

        let target = body(r#"{"prompt": "p", "override": {"provider": "groq", "model": "m1"}}"#)
            .into_prompt(None)
            .expect("test: target");
        assert_eq!(
            target.override_target,
            Some(PromptOverride::target(ProviderId::Groq, "m1"))
        );
    }

    #[test]
    fn test_edit_index_is_carried_to_prompt() {
        let prompt = body(r#"{"prompt": "p", "edit_index": 4}"#)
            .into_prompt(Some("s-1".into()))
            .expect("test: prompt");
        assert_eq!(prompt.edit_index, Some(4));
        assert_eq!(prompt.session_id.as_deref(), Some("s-1"));
        let negative = r#"{"prompt": "p", "edit_index": -1}"#;
        assert!(serde_json::from_str::<GenerateRequest>(negative).is_err());
    }

    #[test]
    fn test_unknown_override_is_invalid_request() {
        let err = body(r#"{"prompt": "p", "override": "openai"}"#)
            .into_prompt(None)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_temperature_out_of_range_rejected() {
        let err = body(r#"{"prompt": "p", "params": {"temperature": 2.5}}"#)
            .into_prompt(None)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
        assert!(body(r#"{"prompt": "p", "params": {"temperature": 2.0}}"#)
            .into_prompt(None)
            .is_ok());
    }

    #[test]
    fn test_blank_prompt_rejected() {
        let err = body(r#"{"prompt": "   "}"#).into_prompt(None).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_search_params_validation() {
        let q = SearchParams {
            q: Some(" rust ".into()),
            ..Default::default()
        }
        .into_query()
        .expect("test: query");
        assert_eq!(q.query, "rust");
        assert_eq!(q.limit, 5);
        assert!(q.safe);

        assert!(SearchParams::default().into_query().is_err());
        for limit in [0, 21] {
            let err = SearchParams {
                q: Some("rust".into()),
                limit: Some(limit),
                ..Default::default()
            }
            .into_query()
            .unwrap_err();
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_error_status_mapping() {
        let provider = AppError::from(DispatchError::Provider(ProviderError::new(
            ProviderId::Groq,
            ProviderErrorKind::RateLimited,
            "slow down",
        )));
        assert_eq!(provider.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(provider.kind(), "provider_error");

        let none = AppError::from(DispatchError::NoProviderAvailable(NoProviderAvailable {
            attempted: vec![AttemptedProvider {
                provider: ProviderId::Gemini,
                reason: "down".into(),
            }],
        }));
        assert_eq!(none.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(none.detail()["attempted"][0]["provider"], "gemini");

        let cancelled = AppError::from(DispatchError::Cancelled);
        assert_eq!(cancelled.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(cancelled.kind(), "timeout");

        let store = AppError::Store(StoreError::Backend("redis://:hunter2@db".into()));
        assert_eq!(store.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!store.message().contains("hunter2"));

        assert_eq!(
            AppError::PayloadTooLarge(10).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    async fn preflight_origin(origins: &[&str], origin: &str) -> Option<HeaderValue> {
        use tower::ServiceExt;

        let origins: Vec<String> = origins.iter().map(|o| o.to_string()).collect();
        let app = Router::new()
            .route("/v1/generate", post(|| async { "ok" }))
            .layer(cors_layer(&origins));
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/v1/generate")
            .header(header::ORIGIN, origin)
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .expect("test: request");
        let response = app.oneshot(request).await.expect("test: response");
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .cloned()
    }

    #[tokio::test]
    async fn test_cors_preflight_allows_listed_origin_only() {
        let listed = ["https://app.example", "bad\nvalue"];
        assert_eq!(
            preflight_origin(&listed, "https://app.example").await,
            Some(HeaderValue::from_static("https://app.example"))
        );
        assert_eq!(preflight_origin(&listed, "https://evil.example").await, None);
    }

    #[tokio::test]
    async fn test_cors_wildcard_allows_any_origin() {
        assert_eq!(
            preflight_origin(&["*"], "https://anywhere.example").await,
            Some(HeaderValue::from_static("*"))
        );
    }
}

//! HTTP gateway for askdb.
//!
//! Exposes `POST /agent/talk`, the authenticated entry point used by the
//! product backend, and `GET /health`. Every response of the talk endpoint
//! uses the same envelope:
//!
//! ```json
//! {"status": "success" | "error", "message": "...", "data": ..., "errors": ...}
//! ```
//!
//! Requests are rate limited per `X-Session-ID`, falling back to the client
//! address.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use askdb_config::GatewayConfig;
use askdb_core::{Error, History};
use askdb_pipeline::ResolutionPipeline;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{Instrument, error, info, info_span, warn};

pub const SESSION_HEADER: &str = "X-Session-ID";
pub const API_KEY_HEADER: &str = "X-Internal-API-Key";

const RATE_WINDOW: Duration = Duration::from_secs(60);
const BODY_LIMIT: usize = 1024 * 1024;

/// Shared state of the gateway.
pub struct GatewayState {
    pipeline: Arc<ResolutionPipeline>,
    api_key: Option<String>,
    limiter: RateLimiter,
}

impl GatewayState {
    pub fn new(pipeline: Arc<ResolutionPipeline>, config: &GatewayConfig) -> Self {
        if config.internal_api_key.is_none() {
            warn!("No internal API key configured, every talk request will be rejected");
        }
        Self {
            pipeline,
            api_key: config.internal_api_key.clone(),
            limiter: RateLimiter::new(config.requests_per_minute as usize, RATE_WINDOW),
        }
    }
}

type SharedState = Arc<GatewayState>;

/// Response envelope of the talk endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub status: String,
    pub message: String,
    pub data: Option<Value>,
    pub errors: Option<Value>,
}

impl Envelope {
    pub fn success(message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            status: "success".into(),
            message: message.into(),
            data,
            errors: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            message: message.into(),
            data: None,
            errors: None,
        }
    }

    fn into_response_with(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Build the router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/agent/talk", post(talk_handler))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the gateway until `shutdown` resolves.
pub async fn serve<F>(
    config: &GatewayConfig,
    pipeline: Arc<ResolutionPipeline>,
    shutdown: F,
) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let state = Arc::new(GatewayState::new(pipeline, config));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Gateway listening");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
}

// --- Rate Limiter ---

/// In-memory sliding-window rate limiter keyed by client.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request for `key`. Returns `false` when over the limit.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        if clients.len() > 10_000 {
            clients.retain(|_, stamps| {
                stamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let stamps = clients.entry(key.to_string()).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);

        if stamps.len() >= self.max_requests {
            return false;
        }
        stamps.push(now);
        true
    }
}

/// Session header, else client address, else a shared bucket.
fn client_key(req: &Request) -> String {
    if let Some(session) = header(req.headers(), SESSION_HEADER).filter(|s| !s.trim().is_empty()) {
        return format!("session:{session}");
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| format!("ip:{}", addr.ip()))
        .unwrap_or_else(|| "anonymous".to_string())
}

async fn rate_limit_middleware(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let key = client_key(&req);
    if !state.limiter.check(&key) {
        warn!(client = %key.chars().take(48).collect::<String>(), "Rate limit exceeded");
        return Envelope::error("Too many requests, try again later.")
            .into_response_with(StatusCode::TOO_MANY_REQUESTS);
    }
    next.run(req).await
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Body of `POST /agent/talk`.
#[derive(Debug, Deserialize)]
pub struct TalkRequest {
    pub message: String,
    #[serde(default)]
    pub history: Option<Value>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn talk_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Result<Json<TalkRequest>, JsonRejection>,
) -> Response {
    let session = header(&headers, SESSION_HEADER).unwrap_or_default().trim().to_string();
    let span = info_span!("talk", session_id = %session);

    async move {
        let provided = header(&headers, API_KEY_HEADER);
        if state.api_key.is_none() || provided != state.api_key.as_deref() {
            warn!("Rejected request with invalid API key");
            return Envelope::error("Invalid API key.").into_response_with(StatusCode::FORBIDDEN);
        }

        if session.is_empty() {
            warn!("Rejected request without session id");
            return Envelope::error("Invalid session id.").into_response_with(StatusCode::BAD_REQUEST);
        }

        let Json(request) = match body {
            Ok(body) => body,
            Err(rejection) => {
                warn!(error = %rejection, "Rejected malformed body");
                return Envelope::error("Malformed request body.")
                    .into_response_with(StatusCode::BAD_REQUEST);
            }
        };

        let history = request
            .history
            .as_ref()
            .map(History::from_value)
            .unwrap_or_default();
        info!(message_chars = request.message.chars().count(), history = history.len(), "Talk request");

        match state.pipeline.resolve(&request.message, history).await {
            Ok(answer) if answer.trim().is_empty() => {
                info!("Resolution produced no answer");
                Envelope::success("No results were found for the request.", None)
                    .into_response_with(StatusCode::OK)
            }
            Ok(answer) => {
                info!("Answer sent");
                Envelope::success("The agent answered.", Some(Value::String(answer)))
                    .into_response_with(StatusCode::OK)
            }
            Err(Error::InvalidInput(reason)) => {
                warn!(reason = %reason, "Rejected invalid input");
                Envelope::error("Message must not be empty.").into_response_with(StatusCode::BAD_REQUEST)
            }
            Err(e) => {
                error!(error = %e, "Resolution failed");
                Envelope::error("An unexpected error occurred.")
                    .into_response_with(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }
    .instrument(span)
    .await
}

//! Axum HTTP channel serving the agent API.
//!
//! ```text
//! GET  /health     upstream connectivity report
//! POST /query      run the agent on one question
//! GET  /tools      tool descriptions
//! GET  /history    conversation history
//! POST /clear      forget the conversation
//! POST /settings   agent, tool and api settings
//! ```
//!
//! The channel implements [`Component`]; its [`CancellationToken`] drives
//! axum's graceful shutdown.

mod api;

use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Method},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowHeaders, AllowMethods, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::ApiHandler;
use crate::error::AppError;
use crate::subsystems::agents::Web3Agent;
use crate::subsystems::runtime::{Component, ComponentFuture};

// ── Shared request state ──────────────────────────────────────────────────────

/// Router state handed to every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Web3Agent>,
    pub api: ApiHandler,
    pub version: Arc<str>,
}

impl AppState {
    pub fn new(agent: Arc<Web3Agent>, api: ApiHandler, version: impl Into<Arc<str>>) -> Self {
        Self { agent, api, version: version.into() }
    }
}

// ── AxumChannel ───────────────────────────────────────────────────────────────

pub struct AxumChannel {
    channel_id: String,
    bind_addr: String,
    cors_origins: Vec<String>,
    state: AppState,
}

impl AxumChannel {
    pub fn new(
        channel_id: impl Into<String>,
        bind_addr: impl Into<String>,
        cors_origins: Vec<String>,
        state: AppState,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            bind_addr: bind_addr.into(),
            cors_origins,
            state,
        }
    }
}

impl Component for AxumChannel {
    fn id(&self) -> &str {
        &self.channel_id
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        let this = *self;
        Box::pin(run_axum(this.channel_id, this.bind_addr, this.cors_origins, this.state, shutdown))
    }
}

async fn run_axum(
    channel_id: String,
    bind_addr: String,
    cors_origins: Vec<String>,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let router = build_router(state, &cors_origins);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::Server(format!("bind failed on {bind_addr}: {e}")))?;
    let local = listener.local_addr().map(|a| a.to_string()).unwrap_or(bind_addr);

    info!(%channel_id, addr = %local, "http api listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Server(format!("axum server error: {e}")))?;

    info!(%channel_id, "http api shut down");
    Ok(())
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health",   get(api::health))
        .route("/query",    post(api::query))
        .route("/tools",    get(api::tools))
        .route("/history",  get(api::history))
        .route("/clear",    post(api::clear))
        .route("/settings", post(api::settings))
        .fallback(api::not_found)
        .with_state(state)
        .layer(cors_layer(cors_origins))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// `"*"` allows any origin without credentials; an explicit list allows
/// credentials and mirrors requested methods and headers.
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(origin = %o, error = %e, "ignoring invalid cors origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(AllowMethods::list([Method::GET, Method::POST, Method::OPTIONS]))
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

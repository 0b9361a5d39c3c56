//! Handlers for the agent API.
//!
//! Every failure is a JSON body `{"status": "error", "error", "detail"?}`
//! with a matching status code.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::AppState;
use crate::api::{ApiError, ServiceHealth, format_response};

// ── Request types ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct QueryRequest {
    query: String,
    #[serde(default)]
    context: Option<BTreeMap<String, Value>>,
}

// ── Errors ────────────────────────────────────────────────────────────────────

pub(super) struct ApiFailure {
    status: StatusCode,
    error: String,
    detail: Option<String>,
}

impl ApiFailure {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self { status, error: error.into(), detail: None }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let mut body = json!({ "status": "error", "error": self.error });
        if let Some(detail) = self.detail {
            body["detail"] = json!(detail);
        }
        (self.status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiFailure {
    fn from(e: JsonRejection) -> Self {
        ApiFailure::new(e.status(), "Invalid request body").with_detail(e.body_text())
    }
}

impl From<ApiError> for ApiFailure {
    fn from(e: ApiError) -> Self {
        let status = match e {
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiFailure::new(status, e.to_string())
    }
}

fn context_strings(context: BTreeMap<String, Value>) -> BTreeMap<String, String> {
    context
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, v)
        })
        .collect()
}

fn service_entry(health: Option<&ServiceHealth>) -> Value {
    let status = if health.is_some_and(|h| h.healthy) { "healthy" } else { "degraded" };
    json!({ "status": status, "details": health })
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /health
pub(super) async fn health(State(state): State<AppState>) -> Json<Value> {
    let report = state.api.check_connections().await;
    let services = json!({
        "server": { "status": "healthy" },
        "web3": service_entry(report.services.get("web3")),
        "etherscan": service_entry(report.services.get("etherscan")),
        "defillama": service_entry(report.services.get("defillama")),
    });
    Json(json!({
        "status": if report.all_healthy { "healthy" } else { "degraded" },
        "version": &*state.version,
        "timestamp": report.timestamp,
        "api_status": report.services,
        "services": services,
    }))
}

/// POST /query
pub(super) async fn query(
    State(state): State<AppState>,
    body: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiFailure> {
    let Json(req) = body?;
    if let Err(e) = state.api.check_rate_limits() {
        warn!(error = %e, "query rejected by rate limiter");
        return Err(e.into());
    }
    let query = req.query.trim();
    if query.is_empty() {
        return Err(ApiFailure::new(StatusCode::UNPROCESSABLE_ENTITY, "Query must not be empty"));
    }

    let context = req.context.map(context_strings);
    let started = Instant::now();
    let reply = state.agent.process_query(query, context.as_ref()).await;
    let elapsed = started.elapsed();
    let execution_time = elapsed.as_secs_f64();
    info!(elapsed_ms = elapsed.as_millis() as u64, "query processed");

    Ok(Json(json!({
        "status": "success",
        "response": format_response(reply),
        "execution_time": execution_time,
    })))
}

/// GET /tools
pub(super) async fn tools(State(state): State<AppState>) -> Json<Vec<Value>> {
    Json(state.agent.tool_descriptions())
}

/// GET /history
pub(super) async fn history(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.agent.conversation_history().await))
}

/// POST /clear
pub(super) async fn clear(State(state): State<AppState>) -> Json<Value> {
    state.agent.clear_memory().await;
    Json(json!({ "status": "success", "message": "Conversation cleared" }))
}

/// POST /settings
pub(super) async fn settings(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, ApiFailure> {
    let Json(update) = body?;
    let rejected =
        |e: String| ApiFailure::new(StatusCode::BAD_REQUEST, "Failed to update settings").with_detail(e);
    state.agent.validate_settings(&update).map_err(|e| rejected(e.to_string()))?;
    let api_settings = update.get("api_settings");
    if let Some(api_settings) = api_settings {
        state.api.validate_settings(api_settings)?;
    }

    state.agent.update_settings(&update).await.map_err(|e| rejected(e.to_string()))?;
    if let Some(api_settings) = api_settings {
        state.api.update_settings(api_settings)?;
    }
    Ok(Json(json!({ "status": "success", "message": "Settings updated" })))
}

pub(super) async fn not_found(uri: Uri) -> ApiFailure {
    ApiFailure::new(StatusCode::NOT_FOUND, "Not found").with_detail(uri.path().to_string())
}

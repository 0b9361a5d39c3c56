//! Agent tools.
//!
//! Each tool takes a [`ToolInput`] (a JSON object or a bare string), does its
//! work through the shared [`ApiHandler`] / [`RpcClient`] / knowledge store,
//! and returns a [`ToolOutput`]. Failures are reported in the output rather
//! than raised, so the agent can read them as observations and recover.

pub mod cache;
pub mod defi;
pub mod knowledge;
pub mod nft;
pub mod token;
pub mod wallet;

pub use cache::TtlCache;

use std::sync::RwLock;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{ApiError, ApiHandler};
use crate::chain::{ChainError, RpcClient};
use crate::config::Config;
use crate::error::AppError;
use crate::subsystems::memory::KnowledgeStore;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("knowledge base error: {0}")]
    Knowledge(String),
}

impl From<ApiError> for ToolError {
    fn from(e: ApiError) -> Self {
        ToolError::Upstream(e.to_string())
    }
}

// ── Input / output ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ToolInput {
    Json(Map<String, Value>),
    Text(String),
}

impl ToolInput {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => ToolInput::Json(map),
            Value::String(text) => ToolInput::Text(text),
            other => ToolInput::Text(other.to_string()),
        }
    }

    /// Deserialize into a tool's parameter struct. A string that holds a JSON
    /// object is treated as that object; any other string goes to `from_text`.
    pub fn parse<T: DeserializeOwned>(self, from_text: impl FnOnce(String) -> T) -> Result<T, ToolError> {
        match self {
            ToolInput::Json(map) => serde_json::from_value(Value::Object(map))
                .map_err(|e| ToolError::InvalidInput(format!("invalid parameters: {e}"))),
            ToolInput::Text(text) => {
                let trimmed = text.trim();
                if trimmed.starts_with('{') {
                    if let Ok(Value::Object(map)) = serde_json::from_str(trimmed) {
                        return ToolInput::Json(map).parse(from_text);
                    }
                }
                Ok(from_text(trimmed.trim_matches(|c| c == '"' || c == '\'').to_string()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutput {
    Success { tool: String, result: Value },
    Error { tool: String, error: String },
}

impl ToolOutput {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| json!({ "status": "error", "error": e.to_string() }))
    }
}

// ── Shared dependencies ───────────────────────────────────────────────────────

/// Capabilities handed to every tool at construction.
#[derive(Debug, Clone)]
pub struct ToolDeps {
    pub api: ApiHandler,
    pub rpc: RpcClient,
    pub knowledge: KnowledgeStore,
}

/// Settings that would result from applying a partial JSON patch.
///
/// The settings type should use `deny_unknown_fields` so misspelled keys are
/// reported instead of silently dropped.
fn patched_settings<T>(current: &T, patch: &Value) -> Result<T, ToolError>
where
    T: Serialize + DeserializeOwned,
{
    let Value::Object(patch) = patch else {
        return Err(ToolError::InvalidInput("tool settings must be a JSON object".into()));
    };
    let mut merged = serde_json::to_value(current)
        .map_err(|e| ToolError::InvalidInput(format!("serialize settings: {e}")))?;
    if let Value::Object(map) = &mut merged {
        for (k, v) in patch {
            map.insert(k.clone(), v.clone());
        }
    }
    serde_json::from_value(merged).map_err(|e| ToolError::InvalidInput(format!("invalid tool settings: {e}")))
}

/// Validate `patch` against the current settings without storing it.
pub(crate) fn check_settings<T>(current: &RwLock<T>, patch: &Value) -> Result<(), ToolError>
where
    T: Serialize + DeserializeOwned,
{
    let guard = current
        .read()
        .map_err(|_| ToolError::InvalidInput("settings lock poisoned".into()))?;
    patched_settings(&*guard, patch).map(drop)
}

/// Apply a partial JSON patch to a tool's settings struct.
pub(crate) fn merge_settings<T>(current: &RwLock<T>, patch: &Value) -> Result<(), ToolError>
where
    T: Serialize + DeserializeOwned,
{
    let mut guard = current
        .write()
        .map_err(|_| ToolError::InvalidInput("settings lock poisoned".into()))?;
    *guard = patched_settings(&*guard, patch)?;
    Ok(())
}

pub(crate) fn read_settings<T: Clone>(settings: &RwLock<T>) -> Result<T, ToolError> {
    settings
        .read()
        .map(|s| s.clone())
        .map_err(|_| ToolError::InvalidInput("settings lock poisoned".into()))
}

/// `1234567.891` → `"1,234,567.89"` with `decimals` fraction digits.
pub(crate) fn format_thousands(value: f64, decimals: usize) -> String {
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    let sign = if value < 0.0 && formatted.chars().any(|c| c != '0' && c != '.') { "-" } else { "" };
    match frac_part {
        Some(f) => format!("{sign}{grouped}.{f}"),
        None => format!("{sign}{grouped}"),
    }
}

// ── Tool enum ─────────────────────────────────────────────────────────────────

/// All tools the agent can call. Enum dispatch keeps the set closed and
/// avoids boxed futures.
#[derive(Debug)]
pub enum Tool {
    Wallet(wallet::WalletTool),
    Token(token::TokenTool),
    Nft(nft::NftTool),
    Defi(defi::DefiTool),
    Knowledge(knowledge::KnowledgeTool),
}

impl Tool {
    /// Build the tool registered under `name`.
    pub fn build(name: &str, config: &Config, deps: &ToolDeps) -> Option<Self> {
        match name {
            wallet::NAME => Some(Tool::Wallet(wallet::WalletTool::new(config, deps))),
            token::NAME => Some(Tool::Token(token::TokenTool::new(config, deps))),
            nft::NAME => Some(Tool::Nft(nft::NftTool::new(config, deps))),
            defi::NAME => Some(Tool::Defi(defi::DefiTool::new(config, deps))),
            knowledge::NAME => Some(Tool::Knowledge(knowledge::KnowledgeTool::new(config, deps))),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Wallet(_) => wallet::NAME,
            Tool::Token(_) => token::NAME,
            Tool::Nft(_) => nft::NAME,
            Tool::Defi(_) => defi::NAME,
            Tool::Knowledge(_) => knowledge::NAME,
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Tool::Wallet(_) => wallet::DESCRIPTION,
            Tool::Token(_) => token::DESCRIPTION,
            Tool::Nft(_) => nft::DESCRIPTION,
            Tool::Defi(_) => defi::DESCRIPTION,
            Tool::Knowledge(_) => knowledge::DESCRIPTION,
        }
    }

    pub fn parameters(&self) -> Value {
        match self {
            Tool::Wallet(_) => wallet::parameters(),
            Tool::Token(_) => token::parameters(),
            Tool::Nft(_) => nft::parameters(),
            Tool::Defi(_) => defi::parameters(),
            Tool::Knowledge(_) => knowledge::parameters(),
        }
    }

    /// `{"name", "description", "parameters"}`.
    pub fn description(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.summary(),
            "parameters": self.parameters(),
        })
    }

    pub async fn execute(&self, input: ToolInput) -> ToolOutput {
        let result = match self {
            Tool::Wallet(t) => t.execute(input).await,
            Tool::Token(t) => t.execute(input).await,
            Tool::Nft(t) => t.execute(input).await,
            Tool::Defi(t) => t.execute(input).await,
            Tool::Knowledge(t) => t.execute(input).await,
        };
        let tool = self.name().to_string();
        match result {
            Ok(result) => ToolOutput::Success { tool, result },
            Err(e) => {
                warn!(tool = %tool, error = %e, "tool failed");
                ToolOutput::Error { tool, error: e.to_string() }
            }
        }
    }

    pub fn validate_settings(&self, settings: &Value) -> Result<(), ToolError> {
        match self {
            Tool::Wallet(t) => t.validate_settings(settings),
            Tool::Token(t) => t.validate_settings(settings),
            Tool::Nft(t) => t.validate_settings(settings),
            Tool::Defi(t) => t.validate_settings(settings),
            Tool::Knowledge(t) => t.validate_settings(settings),
        }
    }

    pub fn update_settings(&self, settings: &Value) -> Result<(), ToolError> {
        match self {
            Tool::Wallet(t) => t.update_settings(settings),
            Tool::Token(t) => t.update_settings(settings),
            Tool::Nft(t) => t.update_settings(settings),
            Tool::Defi(t) => t.update_settings(settings),
            Tool::Knowledge(t) => t.update_settings(settings),
        }
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Enabled tools in configuration order.
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Tool>) -> Self {
        Self { tools }
    }

    /// Build every tool listed in `tools.enabled`. Unknown names are a
    /// configuration error.
    pub fn from_config(config: &Config, deps: &ToolDeps) -> Result<Self, AppError> {
        let mut tools = Vec::with_capacity(config.tools.enabled.len());
        for name in &config.tools.enabled {
            let tool = Tool::build(name, config, deps)
                .ok_or_else(|| AppError::Config(format!("tools.enabled: unknown tool {name:?}")))?;
            tools.push(tool);
        }
        if tools.is_empty() {
            return Err(AppError::Config("tools.enabled must name at least one tool".into()));
        }
        info!(tools = ?config.tools.enabled, "tools initialised");
        Ok(Self { tools })
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Tool> {
        let name = name.trim();
        self.tools.iter().find(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(Tool::name).collect()
    }

    pub fn descriptions(&self) -> Vec<Value> {
        self.tools.iter().map(Tool::description).collect()
    }

    /// `- Name: description` per line, for the system prompt.
    pub fn render_descriptions(&self) -> String {
        self.tools
            .iter()
            .map(|t| format!("- {}: {}", t.name(), t.summary()))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for tool tests: a mock upstream server and wired dependencies.

    use std::time::Duration;

    use axum::Router;

    use super::*;
    use crate::api::Endpoints;

    pub const ADDRESS: &str = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed";

    pub async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    pub fn deps(work_dir: &std::path::Path, rpc_url: &str) -> ToolDeps {
        ToolDeps {
            api: ApiHandler::new(1000, Endpoints::default(), None).unwrap(),
            rpc: RpcClient::new(rpc_url, &[], Duration::from_secs(2)).unwrap(),
            knowledge: KnowledgeStore::open(&work_dir.join("store")).unwrap(),
        }
    }
}

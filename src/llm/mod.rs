//! LLM provider abstraction.
//!
//! `LlmProvider` is an enum over concrete provider implementations.
//! Add a new variant + module in `providers/` for each additional backend.
//!
//! Provider instances are shared immutable capabilities: clone them freely.
//! Per-call knobs (temperature, token cap) travel in [`CompletionOptions`] so
//! runtime setting changes never rebuild the provider.

pub mod providers;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("provider misconfigured: {0}")]
    Config(String),
    #[error("provider request failed: {0}")]
    Request(String),
}

impl ProviderError {
    /// Short machine-readable kind, surfaced as `error_type` in API replies.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::UnknownProvider(_) => "UnknownProvider",
            ProviderError::Config(_) => "ProviderConfig",
            ProviderError::Request(_) => "ProviderRequest",
        }
    }
}

// ── Messages ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One chat turn sent to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// Sampling parameters for a single completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self { temperature: 0.0, max_tokens: Some(2000) }
    }
}

/// Token usage reported by the provider, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Option<LlmUsage>,
}

// ── Provider enum ─────────────────────────────────────────────────────────────

/// All available provider backends.
///
/// Enum dispatch avoids `dyn` trait objects and the `async-trait` dependency.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    Dummy(providers::dummy::DummyProvider),
    Scripted(providers::scripted::ScriptedProvider),
    OpenAiCompatible(providers::openai_compatible::OpenAiCompatibleProvider),
    Azure(providers::azure::AzureProvider),
}

impl LlmProvider {
    /// Send the conversation to the provider and return its reply.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<LlmResponse, ProviderError> {
        match self {
            LlmProvider::Dummy(p) => p.chat(messages).await,
            LlmProvider::Scripted(p) => p.chat(messages).await,
            LlmProvider::OpenAiCompatible(p) => p.chat(messages, options).await,
            LlmProvider::Azure(p) => p.chat(messages, options).await,
        }
    }

    /// Lightweight reachability probe. Offline providers are always reachable.
    pub async fn ping(&self) -> Result<(), ProviderError> {
        match self {
            LlmProvider::Dummy(_) | LlmProvider::Scripted(_) => Ok(()),
            LlmProvider::OpenAiCompatible(p) => p.ping().await,
            LlmProvider::Azure(p) => p.ping().await,
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            LlmProvider::Dummy(_) => "dummy",
            LlmProvider::Scripted(_) => "scripted",
            LlmProvider::OpenAiCompatible(p) => p.model(),
            LlmProvider::Azure(p) => p.model(),
        }
    }
}

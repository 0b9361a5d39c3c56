//! OpenAI-compatible chat completion provider (`/v1/chat/completions`).
//!
//! Stateless: the agent owns history and the tool loop, this adapter does one
//! round-trip per call.

use reqwest::Client;

use super::wire::{self, ChatCompletionRequest};
use crate::llm::{ChatMessage, CompletionOptions, LlmResponse, ProviderError};

/// Adapter for any HTTP endpoint implementing `/v1/chat/completions`.
///
/// Covers OpenAI, OpenAI-compatible local servers (Ollama, LM Studio…),
/// and hosted alternatives. Cheap to clone because `reqwest::Client` is an
/// `Arc` internally.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleProvider {
    client: Client,
    api_base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    /// `api_key` is `None` for keyless local models. When present it is sent
    /// as `Authorization: Bearer <key>` on every request.
    pub fn new(
        api_base_url: String,
        model: String,
        timeout_seconds: u64,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, api_base_url, model, api_key })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn ping(&self) -> Result<(), ProviderError> {
        let mut req = self.client.head(&self.api_base_url);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        wire::ping(req).await
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let payload = ChatCompletionRequest::new(Some(&self.model), messages, options, &self.model);
        payload.log();

        let mut req = self.client.post(&self.api_base_url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        wire::send(req, &self.api_base_url).await
    }
}

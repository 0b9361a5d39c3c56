//! Azure OpenAI deployment provider.
//!
//! Same chat-completions body as OpenAI, but the URL names the deployment and
//! authentication goes through the `api-key` header.

use reqwest::Client;

use super::wire::{self, ChatCompletionRequest};
use crate::llm::{ChatMessage, CompletionOptions, LlmResponse, ProviderError};

#[derive(Debug, Clone)]
pub struct AzureProvider {
    client: Client,
    url: String,
    model: String,
    api_key: String,
}

impl AzureProvider {
    pub fn new(
        endpoint: &str,
        deployment: &str,
        api_version: &str,
        model: String,
        timeout_seconds: u64,
        api_key: String,
    ) -> Result<Self, ProviderError> {
        if endpoint.is_empty() || deployment.is_empty() {
            return Err(ProviderError::Config(
                "azure provider requires llm.azure.endpoint and llm.azure.deployment".into(),
            ));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: deployment_url(endpoint, deployment, api_version),
            model,
            api_key,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn ping(&self) -> Result<(), ProviderError> {
        wire::ping(self.client.head(&self.url).header("api-key", &self.api_key)).await
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<LlmResponse, ProviderError> {
        let payload = ChatCompletionRequest::new(None, messages, options, &self.model);
        payload.log();

        let req = self.client.post(&self.url).header("api-key", &self.api_key).json(&payload);
        wire::send(req, &self.url).await
    }
}

fn deployment_url(endpoint: &str, deployment: &str, api_version: &str) -> String {
    format!(
        "{}/openai/deployments/{deployment}/chat/completions?api-version={api_version}",
        endpoint.trim_end_matches('/')
    )
}

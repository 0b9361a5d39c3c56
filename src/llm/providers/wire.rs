//! Chat-completions wire types shared by the OpenAI and Azure adapters.
//! Private to `providers`: callers only ever see `LlmResponse`.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::llm::{ChatMessage, CompletionOptions, LlmResponse, LlmUsage, ProviderError};

#[derive(Debug, Serialize)]
pub(super) struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
pub(super) struct ChatCompletionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

impl<'a> ChatCompletionRequest<'a> {
    /// `model` is `None` for Azure, which routes by deployment name.
    pub(super) fn new(
        model: Option<&'a str>,
        messages: &'a [ChatMessage],
        options: &CompletionOptions,
        reported_model: &str,
    ) -> Self {
        // Some models (gpt-5 family) do not accept a temperature parameter.
        let temperature = if reported_model.starts_with("gpt-5") {
            None
        } else {
            Some(options.temperature)
        };
        Self {
            model,
            messages: messages
                .iter()
                .map(|m| Message { role: m.role.as_str(), content: &m.content })
                .collect(),
            temperature,
            max_tokens: options.max_tokens,
        }
    }

    pub(super) fn log(&self) {
        debug!(
            model = ?self.model,
            temperature = ?self.temperature,
            max_tokens = ?self.max_tokens,
            messages = self.messages.len(),
            "sending LLM request"
        );
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string_pretty(self)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(payload = %json, "full LLM request payload");
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Send a prepared request and decode the first choice.
pub(super) async fn send(req: reqwest::RequestBuilder, url: &str) -> Result<LlmResponse, ProviderError> {
    let response = req.send().await.map_err(|e| {
        error!(%url, error = %e, timeout = e.is_timeout(), "LLM HTTP request failed (transport)");
        ProviderError::Request(e.to_string())
    })?;

    let response = check_status(response).await?;

    let parsed = response.json::<ChatCompletionResponse>().await.map_err(|e| {
        error!(error = %e, "failed to deserialize LLM response");
        ProviderError::Request(format!("failed to parse response body: {e}"))
    })?;

    debug!(choices = parsed.choices.len(), "received LLM response");

    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProviderError::Request("empty or missing content in response".into()))?;

    let usage = parsed.usage.map(|u| LlmUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    Ok(LlmResponse { text, usage })
}

/// Consume the response and return it if successful, or a structured error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = if let Ok(env) = serde_json::from_str::<ErrorEnvelope>(&body) {
        let code = env
            .error
            .code
            .map(|v| match v {
                serde_json::Value::String(s) => format!(" [code={s}]"),
                other => format!(" [code={other}]"),
            })
            .unwrap_or_default();
        format!("HTTP {status}{code}: {}", env.error.message)
    } else {
        format!("HTTP {status}: {body}")
    };

    error!(%status, %message, "LLM request returned HTTP error");
    Err(ProviderError::Request(message))
}

/// HEAD probe with a hard 5-second timeout. Any HTTP response counts as
/// reachable; only transport failures are errors.
pub(super) async fn ping(req: reqwest::RequestBuilder) -> Result<(), ProviderError> {
    req.timeout(std::time::Duration::from_secs(5))
        .send()
        .await
        .map(|_| ())
        .map_err(|e| ProviderError::Request(format!("unreachable: {e}")))
}

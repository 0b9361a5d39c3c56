//! LLM provider implementations.
//!
//! `build(config, api_key)` is the factory: called at startup.
//! Adding a new backend = new module + new match arm.

pub mod azure;
pub mod dummy;
pub mod openai_compatible;
pub mod scripted;

mod wire;

use crate::config::LlmConfig;
use crate::llm::{LlmProvider, ProviderError};

/// Construct a `LlmProvider` from config and an optional API key.
///
/// `api_key` is sourced from `LLM_API_KEY` env (never TOML) and is `None`
/// for keyless local models.
pub fn build(config: &LlmConfig, api_key: Option<String>) -> Result<LlmProvider, ProviderError> {
    match config.provider.as_str() {
        "dummy" => Ok(LlmProvider::Dummy(dummy::DummyProvider)),
        "openai" | "openai-compatible" => {
            let oai = &config.openai;
            let p = openai_compatible::OpenAiCompatibleProvider::new(
                oai.api_base_url.clone(),
                oai.model.clone(),
                oai.timeout_seconds,
                api_key,
            )?;
            Ok(LlmProvider::OpenAiCompatible(p))
        }
        "azure" => {
            let az = &config.azure;
            let key = api_key.ok_or_else(|| {
                ProviderError::Config("azure provider requires LLM_API_KEY".into())
            })?;
            let p = azure::AzureProvider::new(
                &az.endpoint,
                &az.deployment,
                &az.api_version,
                az.model.clone(),
                az.timeout_seconds,
                key,
            )?;
            Ok(LlmProvider::Azure(p))
        }
        _ => Err(ProviderError::UnknownProvider(config.provider.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_dummy_by_default() {
        let provider = build(&LlmConfig::default(), None).unwrap();
        assert!(matches!(provider, LlmProvider::Dummy(_)));
    }

    #[test]
    fn unknown_provider_errors() {
        let config = LlmConfig { provider: "palm".into(), ..LlmConfig::default() };
        let err = build(&config, None).unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider(name) if name == "palm"));
    }

    #[test]
    fn azure_without_key_errors() {
        let mut config = LlmConfig { provider: "azure".into(), ..LlmConfig::default() };
        config.azure.endpoint = "https://res.openai.azure.com".into();
        config.azure.deployment = "gpt4".into();
        assert!(matches!(build(&config, None), Err(ProviderError::Config(_))));
        assert!(matches!(build(&config, Some("k".into())), Ok(LlmProvider::Azure(_))));
    }

    #[test]
    fn openai_reports_model_name() {
        let config = LlmConfig { provider: "openai".into(), ..LlmConfig::default() };
        let provider = build(&config, None).unwrap();
        assert_eq!(provider.model_name(), "gpt-4");
    }
}

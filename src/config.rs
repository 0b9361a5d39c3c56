//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory
//! (or the file named by `BLOCKSEEK_CONFIG`), then applies env overrides.
//! API keys are only ever sourced from the environment, never from TOML.

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::AppError;

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Tool names in the order they are offered to the LLM.
pub const DEFAULT_TOOLS: [&str; 5] = ["WalletTool", "TokenTool", "NFTTool", "DeFiTool", "KnowledgeTool"];

// ── Resolved config ───────────────────────────────────────────────────────────

/// `[app]`: identity and logging.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub api_version: String,
    pub log_level: String,
    /// Verbose agent tracing (logs every prompt and observation).
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "Block Seek".into(),
            api_version: "v1".into(),
            log_level: "info".into(),
            debug: false,
        }
    }
}

/// `[server]`: HTTP listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Allowed CORS origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
    /// Inbound `/query` rate and the default outbound rate for unnamed APIs.
    pub rate_limit_per_second: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".into(),
            cors_origins: vec!["*".into()],
            rate_limit_per_second: 10,
        }
    }
}

/// OpenAI / OpenAI-compatible provider configuration (`[llm.openai]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// Full chat completions endpoint URL.
    pub api_base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4".into(),
            temperature: 0.0,
            max_tokens: Some(2000),
            timeout_seconds: 60,
        }
    }
}

/// Azure OpenAI deployment configuration (`[llm.azure]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub deployment: String,
    pub api_version: String,
    /// Reported model name; Azure routes by deployment.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub timeout_seconds: u64,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            deployment: String::new(),
            api_version: "2024-02-01".into(),
            model: "gpt-4".into(),
            temperature: 0.0,
            max_tokens: Some(2000),
            timeout_seconds: 60,
        }
    }
}

/// `[llm]`: which provider is active and its settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// `default = "..."` in TOML: `dummy`, `openai`, or `azure`.
    #[serde(rename = "default")]
    pub provider: String,
    pub openai: OpenAiConfig,
    pub azure: AzureConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "dummy".into(),
            openai: OpenAiConfig::default(),
            azure: AzureConfig::default(),
        }
    }
}

impl LlmConfig {
    /// Sampling temperature of the active provider.
    pub fn temperature(&self) -> f32 {
        match self.provider.as_str() {
            "azure" => self.azure.temperature,
            _ => self.openai.temperature,
        }
    }

    /// Completion token cap of the active provider.
    pub fn max_tokens(&self) -> Option<u32> {
        match self.provider.as_str() {
            "azure" => self.azure.max_tokens,
            _ => self.openai.max_tokens,
        }
    }
}

/// `[agent]`: reasoning loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    /// Number of past exchanges replayed to the LLM.
    pub memory_k: usize,
    pub prompts_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            memory_k: 5,
            prompts_dir: PathBuf::from("config/prompts"),
        }
    }
}

/// `[chain]`: Ethereum JSON-RPC and block explorer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub provider_uri: String,
    pub fallback_providers: Vec<String>,
    pub chain_id: u64,
    pub explorer_api: String,
    /// Network name → chain id.
    pub networks: HashMap<String, u64>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            provider_uri: String::new(),
            fallback_providers: Vec::new(),
            chain_id: 1,
            explorer_api: "https://api.etherscan.io/api".into(),
            networks: HashMap::from([("mainnet".to_string(), 1)]),
        }
    }
}

/// `[apis]`: market data endpoints and their outbound rate limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApisConfig {
    pub defillama_base_url: String,
    pub opensea_base_url: String,
    pub coinmarketcap_base_url: String,
    /// API name → requests per second.
    pub rate_limits: HashMap<String, u32>,
}

impl Default for ApisConfig {
    fn default() -> Self {
        Self {
            defillama_base_url: "https://api.llama.fi".into(),
            opensea_base_url: "https://api.opensea.io/api/v1".into(),
            coinmarketcap_base_url: "https://pro-api.coinmarketcap.com/v1".into(),
            rate_limits: HashMap::from([
                ("opensea".to_string(), 2),
                ("etherscan".to_string(), 5),
                ("defillama".to_string(), 10),
                ("coinmarketcap".to_string(), 5),
            ]),
        }
    }
}

/// `[analysis]`: tool depth limits and cache lifetimes (seconds).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub wallet_depth: usize,
    pub token_price_cache_ttl: u64,
    pub nft_limit: usize,
    pub cache_ttl: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            wallet_depth: 100,
            token_price_cache_ttl: 30,
            nft_limit: 1000,
            cache_ttl: 300,
        }
    }
}

/// `[knowledge]`: markdown corpus and its full-text index.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub path: PathBuf,
    pub store_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("knowledge_base"),
            store_dir: PathBuf::from("vector_store"),
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: 5,
        }
    }
}

/// `[tools]`: which tools the agent may call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub enabled: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self { enabled: DEFAULT_TOOLS.iter().map(|s| s.to_string()).collect() }
    }
}

/// API keys. Populated from env only.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub llm_api_key: Option<String>,
    pub etherscan_api_key: Option<String>,
    pub opensea_api_key: Option<String>,
    pub cmc_api_key: Option<String>,
}

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub chain: ChainConfig,
    pub apis: ApisConfig,
    pub analysis: AnalysisConfig,
    pub knowledge: KnowledgeConfig,
    pub tools: ToolsConfig,
    pub secrets: Secrets,
}

/// Static per-network facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub name: &'static str,
    pub explorer_url: &'static str,
    /// Average block time in seconds.
    pub block_time: u64,
}

// ── Raw TOML shape ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    app: AppConfig,
    server: ServerConfig,
    llm: LlmConfig,
    agent: AgentConfig,
    chain: ChainConfig,
    apis: ApisConfig,
    analysis: AnalysisConfig,
    knowledge: KnowledgeConfig,
    tools: ToolsConfig,
}

/// Values that take precedence over the TOML file.
///
/// [`load`] fills this from the process environment; tests build it directly
/// instead of mutating env vars.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub bind: Option<String>,
    pub provider_uri: Option<String>,
    pub secrets: Secrets,
}

impl Overrides {
    pub fn from_env() -> Self {
        let var = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            log_level: var("BLOCKSEEK_LOG_LEVEL"),
            bind: var("BLOCKSEEK_BIND"),
            provider_uri: var("WEB3_PROVIDER_URI"),
            secrets: Secrets {
                llm_api_key: var("LLM_API_KEY"),
                etherscan_api_key: var("ETHERSCAN_API_KEY"),
                opensea_api_key: var("OPENSEA_API_KEY"),
                cmc_api_key: var("CMC_API_KEY"),
            },
        }
    }
}

/// Load config from `BLOCKSEEK_CONFIG` or `config/default.toml`, then apply
/// env-var overrides.
pub fn load() -> Result<Config, AppError> {
    let path = env::var("BLOCKSEEK_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(Path::new(&path), Overrides::from_env())
}

/// Internal loader: accepts an explicit path and overrides.
pub fn load_from(path: &Path, overrides: Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse(&raw, overrides).map_err(|e| match e {
        AppError::Config(msg) => AppError::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Parse TOML text and resolve it into a [`Config`].
pub fn parse(raw: &str, overrides: Overrides) -> Result<Config, AppError> {
    let mut parsed: RawConfig =
        toml::from_str(raw).map_err(|e| AppError::Config(format!("parse error: {e}")))?;

    if let Some(level) = overrides.log_level {
        parsed.app.log_level = level;
    }
    if let Some(bind) = overrides.bind {
        parsed.server.bind = bind;
    }
    if let Some(uri) = overrides.provider_uri {
        parsed.chain.provider_uri = uri;
    }

    if parsed.knowledge.chunk_size == 0 {
        return Err(AppError::Config("knowledge.chunk_size must be > 0".into()));
    }
    if parsed.knowledge.chunk_overlap >= parsed.knowledge.chunk_size {
        return Err(AppError::Config(format!(
            "knowledge.chunk_overlap ({}) must be smaller than chunk_size ({})",
            parsed.knowledge.chunk_overlap, parsed.knowledge.chunk_size
        )));
    }
    if parsed.agent.max_iterations == 0 {
        return Err(AppError::Config("agent.max_iterations must be > 0".into()));
    }

    parsed.knowledge.path = expand_home(&parsed.knowledge.path.to_string_lossy());
    parsed.knowledge.store_dir = expand_home(&parsed.knowledge.store_dir.to_string_lossy());

    Ok(Config {
        app: parsed.app,
        server: parsed.server,
        llm: parsed.llm,
        agent: parsed.agent,
        chain: parsed.chain,
        apis: parsed.apis,
        analysis: parsed.analysis,
        knowledge: parsed.knowledge,
        tools: parsed.tools,
        secrets: overrides.secrets,
    })
}

/// `true` if `provider_uri` names an HTTP(S) or WebSocket endpoint.
pub fn validate_provider_uri(provider_uri: &str) -> bool {
    !provider_uri.is_empty() && (provider_uri.starts_with("http") || provider_uri.starts_with("ws"))
}

/// Names of required API keys that are not set.
pub fn missing_api_keys(config: &Config) -> Vec<&'static str> {
    let required = [("ETHERSCAN_API_KEY", &config.secrets.etherscan_api_key)];
    required
        .into_iter()
        .filter(|(_, value)| value.as_deref().map(str::is_empty).unwrap_or(true))
        .map(|(name, _)| name)
        .collect()
}

/// Network facts for a chain id, if it is a supported network.
pub fn network_config(chain_id: u64) -> Option<NetworkConfig> {
    match chain_id {
        1 => Some(NetworkConfig {
            name: "mainnet",
            explorer_url: "https://etherscan.io",
            block_time: 12,
        }),
        _ => None,
    }
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Safe `Config` for tests: dummy LLM, no API keys, store under `work_dir`.
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            app: AppConfig::default(),
            server: ServerConfig { bind: "127.0.0.1:0".into(), ..ServerConfig::default() },
            llm: LlmConfig {
                openai: OpenAiConfig {
                    api_base_url: "http://localhost:0/v1/chat/completions".into(),
                    model: "test-model".into(),
                    timeout_seconds: 1,
                    ..OpenAiConfig::default()
                },
                ..LlmConfig::default()
            },
            agent: AgentConfig::default(),
            chain: ChainConfig { provider_uri: "http://localhost:0".into(), ..ChainConfig::default() },
            apis: ApisConfig::default(),
            analysis: AnalysisConfig::default(),
            knowledge: KnowledgeConfig {
                path: work_dir.join("knowledge_base"),
                store_dir: work_dir.join("vector_store"),
                ..KnowledgeConfig::default()
            },
            tools: ToolsConfig::default(),
            secrets: Secrets::default(),
        }
    }
}

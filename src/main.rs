//! Block Seek: service entry point.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Init logger once at the configured level
//!   4. Warn about missing API keys or a bad provider URI
//!   5. Build api handler and outbound rate limiters
//!   6. Open and refresh the knowledge store
//!   7. Build LLM provider, tools and agent
//!   8. Spawn Ctrl-C → shutdown signal watcher
//!   9. Run comms subsystem (HTTP API) until shutdown
//!  10. Cancel token, join, clean up

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use block_seek::api::ApiHandler;
use block_seek::chain::RpcClient;
use block_seek::config;
use block_seek::error::AppError;
use block_seek::llm::providers;
use block_seek::logger;
use block_seek::subsystems::agents::Web3Agent;
use block_seek::subsystems::comms::{self, AppState};
use block_seek::subsystems::memory::KnowledgeStore;
use block_seek::subsystems::tools::{ToolDeps, ToolRegistry};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    // Optional file.
    let _ = dotenvy::dotenv();

    let config = config::load()?;
    logger::init(&config.app.log_level)?;

    info!(
        name = %config.app.name,
        version = %config.app.api_version,
        bind = %config.server.bind,
        llm = %config.llm.provider,
        "config loaded"
    );

    let missing = config::missing_api_keys(&config);
    if !missing.is_empty() {
        warn!(keys = ?missing, "missing API keys; related tools will fail");
    }
    if !config::validate_provider_uri(&config.chain.provider_uri) {
        warn!(uri = %config.chain.provider_uri, "invalid web3 provider uri");
    }
    if config::network_config(config.chain.chain_id).is_none() {
        warn!(chain_id = config.chain.chain_id, "unsupported chain id");
    }

    let api = ApiHandler::from_config(&config).map_err(|e| AppError::Server(e.to_string()))?;
    let mut limits = config.apis.rate_limits.clone();
    limits.entry("default".to_string()).or_insert(config.server.rate_limit_per_second);
    api.initialize_rate_limiters(&limits).map_err(|e| AppError::Server(e.to_string()))?;

    let knowledge = KnowledgeStore::open(&config.knowledge.store_dir)?;
    match knowledge.build_from_dir(
        &config.knowledge.path,
        config.knowledge.chunk_size,
        config.knowledge.chunk_overlap,
    ) {
        Ok(report) => info!(added = report.documents_added, skipped = report.documents_skipped, "knowledge store ready"),
        Err(e) => warn!(error = %e, "knowledge base not loaded; search will return nothing"),
    }

    let rpc = RpcClient::new(&config.chain.provider_uri, &config.chain.fallback_providers, RPC_TIMEOUT)
        .map_err(|e| AppError::Config(e.to_string()))?;
    let deps = ToolDeps { api: api.clone(), rpc, knowledge };
    let tools = ToolRegistry::from_config(&config, &deps)?;

    let llm = providers::build(&config.llm, config.secrets.llm_api_key.clone())
        .map_err(|e| AppError::Config(e.to_string()))?;
    if let Err(e) = llm.ping().await {
        warn!(error = %e, "llm provider did not answer ping");
    }
    let agent = Arc::new(Web3Agent::from_config(&config, llm, tools));
    info!(tools = agent.tools().len(), model = %agent.llm().model_name(), "agent ready");

    let report = api.check_connections().await;
    if !report.all_healthy {
        for (name, health) in report.services.iter().filter(|(_, h)| !h.healthy) {
            warn!(service = %name, error = ?health.error, "upstream unreachable at startup");
        }
    }

    // Shared shutdown token: Ctrl-C cancels it, all tasks watch it.
    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, initiating shutdown");
            ctrlc_token.cancel();
        }
    });

    let state = AppState::new(agent, api.clone(), config.app.api_version.clone());
    let result = comms::start(&config, state, shutdown.clone()).join().await;

    shutdown.cancel();
    api.cleanup();
    info!("shutdown complete");
    result
}

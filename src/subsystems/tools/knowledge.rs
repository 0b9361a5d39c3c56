//! Knowledge base lookup over the local full-text index.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ToolDeps, ToolError, ToolInput, check_settings, merge_settings, read_settings};
use crate::config::Config;
use crate::subsystems::memory::KnowledgeStore;

pub const NAME: &str = "KnowledgeTool";
pub const DESCRIPTION: &str = "Searches the Web3 knowledge base for explanations of blockchain, DeFi, NFT and token concepts. Input: a question or {\"query\": \"...\", \"k\": 5}";

pub fn parameters() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": "The query to search in the knowledge base" },
            "k": { "type": "integer", "description": "Number of results to return" }
        },
        "required": ["query"]
    })
}

#[derive(Debug, Deserialize)]
struct KnowledgeParams {
    #[serde(default)]
    query: String,
    #[serde(default)]
    k: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeSettings {
    pub top_k: usize,
}

#[derive(Debug)]
pub struct KnowledgeTool {
    store: KnowledgeStore,
    settings: RwLock<KnowledgeSettings>,
}

impl KnowledgeTool {
    pub fn new(config: &Config, deps: &ToolDeps) -> Self {
        Self {
            store: deps.knowledge.clone(),
            settings: RwLock::new(KnowledgeSettings { top_k: config.knowledge.top_k }),
        }
    }

    pub fn validate_settings(&self, patch: &Value) -> Result<(), ToolError> {
        check_settings(&self.settings, patch)
    }

    pub fn update_settings(&self, patch: &Value) -> Result<(), ToolError> {
        merge_settings(&self.settings, patch)
    }

    pub async fn execute(&self, input: ToolInput) -> Result<Value, ToolError> {
        let params: KnowledgeParams = input.parse(|query| KnowledgeParams { query, k: None })?;
        let query = params.query.trim().to_string();
        if query.is_empty() {
            return Err(ToolError::InvalidInput("Query must be a non-empty string".into()));
        }
        let k = params.k.unwrap_or(read_settings(&self.settings)?.top_k);

        let store = self.store.clone();
        let search_query = query.clone();
        let hits = tokio::task::spawn_blocking(move || store.search(&search_query, k))
            .await
            .map_err(|e| ToolError::Knowledge(format!("search task failed: {e}")))?
            .map_err(|e| ToolError::Knowledge(e.to_string()))?;

        let results: Vec<Value> = hits
            .into_iter()
            .map(|hit| {
                json!({
                    "content": hit.chunk.text,
                    "source": hit.doc.source,
                    "relevance_score": hit.score,
                })
            })
            .collect();
        Ok(json!({ "query": query, "results": results }))
    }
}

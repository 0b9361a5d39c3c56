//! Web3 agent: a ReAct loop over the LLM provider and the tool registry.
//!
//! Each query runs as a sequence of model turns. A turn either calls a tool
//! (`Action:` / `Action Input:`) whose output is fed back as an
//! `Observation:`, or ends the run with `Final Answer:`.

pub mod parser;
pub mod prompt;

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::llm::{ChatMessage, CompletionOptions, LlmProvider, ProviderError};
use crate::subsystems::memory::{ConversationMemory, HistoryEntry};
use crate::subsystems::tools::{ToolError, ToolRegistry};

pub use parser::{AgentStep, ParseError};
pub use prompt::PromptBuilder;

pub const ITERATION_LIMIT_MESSAGE: &str = "Agent stopped due to iteration limit.";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Llm(#[from] ProviderError),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("tool {tool}: {source}")]
    Tool { tool: String, source: ToolError },
}

/// Runtime-adjustable knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub max_iterations: usize,
    pub completion: CompletionOptions,
}

/// Accepted keys of a settings update; anything else is ignored.
#[derive(Debug, Default, Deserialize)]
struct SettingsPatch {
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    memory_k: Option<usize>,
    max_iterations: Option<usize>,
    #[serde(default)]
    tool_settings: BTreeMap<String, Value>,
}

/// One tool call made during a run.
#[derive(Debug, Clone)]
pub struct AgentAction {
    pub tool: String,
    pub log: String,
    pub observation: String,
}

#[derive(Debug, Clone)]
pub struct AgentRun {
    pub output: String,
    pub steps: Vec<AgentAction>,
}

#[derive(Debug)]
pub struct Web3Agent {
    llm: LlmProvider,
    tools: ToolRegistry,
    system_prompt: String,
    memory: Mutex<ConversationMemory>,
    settings: RwLock<AgentSettings>,
}

impl Web3Agent {
    pub fn new(llm: LlmProvider, tools: ToolRegistry, prompt: &PromptBuilder, memory_k: usize, settings: AgentSettings) -> Self {
        let system_prompt = prompt.render(&tools);
        info!(model = %llm.model_name(), tools = tools.len(), "agent initialised");
        Self {
            llm,
            tools,
            system_prompt,
            memory: Mutex::new(ConversationMemory::new(memory_k)),
            settings: RwLock::new(settings),
        }
    }

    pub fn from_config(config: &Config, llm: LlmProvider, tools: ToolRegistry) -> Self {
        let prompt = PromptBuilder::load(&config.agent.prompts_dir);
        let settings = AgentSettings {
            max_iterations: config.agent.max_iterations,
            completion: CompletionOptions {
                temperature: config.llm.temperature(),
                max_tokens: config.llm.max_tokens(),
            },
        };
        Self::new(llm, tools, &prompt, config.agent.memory_k, settings)
    }

    pub fn llm(&self) -> &LlmProvider {
        &self.llm
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub async fn settings(&self) -> AgentSettings {
        self.settings.read().await.clone()
    }

    /// Run the ReAct loop for `input` with `history` as prior turns.
    pub async fn run(&self, input: &str, history: Vec<ChatMessage>) -> Result<AgentRun, AgentError> {
        let settings = self.settings().await;
        let mut messages = Vec::with_capacity(history.len() + 2 + settings.max_iterations * 2);
        messages.push(ChatMessage::system(&self.system_prompt));
        messages.extend(history);
        messages.push(ChatMessage::user(input));

        let mut steps = Vec::new();
        for iteration in 0..settings.max_iterations {
            let reply = self.llm.chat(&messages, &settings.completion).await?;
            debug!(iteration, reply = %reply.text, "llm reply");

            let observation = match parser::parse(&reply.text) {
                Ok(AgentStep::Finish { output }) => {
                    info!(iterations = iteration + 1, tool_calls = steps.len(), "agent finished");
                    return Ok(AgentRun { output, steps });
                }
                Ok(AgentStep::Action { tool, input, .. }) => {
                    let observation = match self.tools.get(&tool) {
                        Some(t) => {
                            info!(tool = %t.name(), "calling tool");
                            t.execute(input).await.to_json().to_string()
                        }
                        None => {
                            warn!(%tool, "model requested unknown tool");
                            format!("{tool} is not a valid tool, try one of [{}].", self.tools.names().join(", "))
                        }
                    };
                    steps.push(AgentAction { tool, log: reply.text.clone(), observation: observation.clone() });
                    observation
                }
                Err(e) => {
                    warn!(error = %e, "unparseable llm reply");
                    format!("Invalid format: {e}")
                }
            };
            messages.push(ChatMessage::assistant(reply.text));
            messages.push(ChatMessage::user(format!("Observation: {observation}")));
        }

        warn!(max_iterations = settings.max_iterations, "agent hit iteration limit");
        Ok(AgentRun { output: ITERATION_LIMIT_MESSAGE.to_string(), steps })
    }

    /// Answer one user query and remember the exchange.
    ///
    /// Never fails: model errors come back as an error-shaped JSON body.
    pub async fn process_query(&self, query: &str, context: Option<&BTreeMap<String, String>>) -> Value {
        let (input, history) = {
            let memory = self.memory.lock().await;
            (memory.contextualize(query, context), memory.window())
        };

        match self.run(&input, history).await {
            Ok(run) => {
                let response = format_response(&run.output);
                let remembered = match response.get("response").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => run.output.clone(),
                };
                self.memory.lock().await.save_context(query, &remembered);
                response
            }
            Err(e) => {
                error!(error = %e, "query failed");
                format_error(&e)
            }
        }
    }

    pub fn tool_descriptions(&self) -> Vec<Value> {
        self.tools.descriptions()
    }

    pub async fn conversation_history(&self) -> Vec<HistoryEntry> {
        self.memory.lock().await.history().to_vec()
    }

    pub async fn clear_memory(&self) {
        self.memory.lock().await.clear();
        info!("conversation memory cleared");
    }

    /// Check a settings patch without applying any of it.
    pub fn validate_settings(&self, patch: &Value) -> Result<(), AgentError> {
        self.parse_settings(patch).map(drop)
    }

    fn parse_settings(&self, patch: &Value) -> Result<SettingsPatch, AgentError> {
        if !patch.is_object() {
            return Err(AgentError::Settings("settings must be a JSON object".into()));
        }
        let patch: SettingsPatch =
            serde_json::from_value(patch.clone()).map_err(|e| AgentError::Settings(e.to_string()))?;
        if patch.max_iterations == Some(0) {
            return Err(AgentError::Settings("max_iterations must be > 0".into()));
        }
        for (name, settings) in &patch.tool_settings {
            let tool = self
                .tools
                .get(name)
                .ok_or_else(|| AgentError::Settings(format!("unknown tool {name:?} in tool_settings")))?;
            tool.validate_settings(settings)
                .map_err(|source| AgentError::Tool { tool: tool.name().to_string(), source })?;
        }
        Ok(patch)
    }

    /// Apply `temperature`, `max_tokens`, `memory_k`, `max_iterations` and
    /// per-tool `tool_settings`. Nothing is applied unless the whole patch
    /// validates.
    pub async fn update_settings(&self, patch: &Value) -> Result<(), AgentError> {
        let patch = self.parse_settings(patch)?;
        for (name, settings) in &patch.tool_settings {
            if let Some(tool) = self.tools.get(name) {
                tool.update_settings(settings)
                    .map_err(|source| AgentError::Tool { tool: tool.name().to_string(), source })?;
            }
        }

        {
            let mut current = self.settings.write().await;
            if let Some(t) = patch.temperature {
                current.completion.temperature = t;
            }
            if let Some(m) = patch.max_tokens {
                current.completion.max_tokens = Some(m);
            }
            if let Some(n) = patch.max_iterations {
                current.max_iterations = n;
            }
        }
        if let Some(k) = patch.memory_k {
            self.memory.lock().await.set_k(k);
        }
        info!("agent settings updated");
        Ok(())
    }
}

/// A final answer that is a JSON object is returned as-is; anything else is
/// wrapped as a text response.
pub fn format_response(output: &str) -> Value {
    let trimmed = output.trim();
    if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            return value;
        }
    }
    json!({ "status": "success", "response": output, "type": "text" })
}

pub fn format_error(e: &AgentError) -> Value {
    let error_type = match e {
        AgentError::Llm(p) => p.kind(),
        AgentError::Settings(_) => "Settings",
        AgentError::Tool { .. } => "Tool",
    };
    json!({ "status": "error", "error": e.to_string(), "error_type": error_type })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::llm::providers::scripted::ScriptedProvider;
    use crate::subsystems::tools::testing;
    use tempfile::TempDir;

    const ADDR: &str = "0x5aaeb6053f3e94c9b9a09f33669435e7ef1beaed";

    fn agent(temp: &TempDir, script: &ScriptedProvider) -> Web3Agent {
        let mut config = Config::test_default(temp.path());
        config.tools.enabled = vec!["KnowledgeTool".into(), "TokenTool".into()];
        let deps = testing::deps(temp.path(), "http://127.0.0.1:1");
        let tools = ToolRegistry::from_config(&config, &deps).unwrap();
        let prompt = PromptBuilder::from_template("Tools:\n{{tool_descriptions}}");
        let settings = AgentSettings {
            max_iterations: 3,
            completion: CompletionOptions::default(),
        };
        Web3Agent::new(LlmProvider::Scripted(script.clone()), tools, &prompt, 5, settings)
    }

    #[test]
    fn response_formatting() {
        assert_eq!(format_response("hi"), json!({ "status": "success", "response": "hi", "type": "text" }));
        assert_eq!(format_response(" {\"a\": 1} "), json!({ "a": 1 }));
        assert_eq!(format_response("{not json")["type"], "text");
        assert_eq!(format_response("[1, 2]")["type"], "text");
    }

    #[tokio::test]
    async fn final_answer_on_first_turn() {
        let temp = TempDir::new().unwrap();
        let script = ScriptedProvider::new(["Final Answer: hello there"]);
        let agent = agent(&temp, &script);

        let out = agent.process_query("hi", None).await;
        assert_eq!(out, json!({ "status": "success", "response": "hello there", "type": "text" }));

        let sent = &script.requests()[0];
        assert_eq!(sent[0].role, Role::System);
        assert!(sent[0].content.contains("- KnowledgeTool: "));
        assert_eq!(sent.last().unwrap().content, "hi");

        let history = agent.conversation_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hello there");
    }

    #[tokio::test]
    async fn tool_errors_and_bad_formats_become_observations() {
        let temp = TempDir::new().unwrap();
        let script = ScriptedProvider::new([
            "I should look this up",
            "Action: GasTool\nAction Input: now",
            "Action: KnowledgeTool\nAction Input: {\"query\": \"\"}",
            "Final Answer: unreachable",
        ]);
        let agent = agent(&temp, &script);

        let run = agent.run("question", Vec::new()).await.unwrap();
        assert_eq!(run.output, ITERATION_LIMIT_MESSAGE);
        assert_eq!(run.steps.len(), 2);
        assert_eq!(run.steps[0].observation, "GasTool is not a valid tool, try one of [KnowledgeTool, TokenTool].");
        let observed: Value = serde_json::from_str(&run.steps[1].observation).unwrap();
        assert_eq!(observed["status"], "error");
        assert_eq!(observed["error"], "Query must be a non-empty string");

        let last = script.requests().pop().unwrap();
        let tail: Vec<&str> = last.iter().rev().take(4).map(|m| m.content.as_str()).collect();
        assert!(tail[0].starts_with("Observation: GasTool is not a valid tool"));
        assert!(tail[2].starts_with("Observation: Invalid format: Could not parse LLM output"));
        assert_eq!(script.remaining(), 1);
    }

    #[tokio::test]
    async fn llm_failure_is_reported_in_body() {
        let temp = TempDir::new().unwrap();
        let script = ScriptedProvider::new(Vec::<String>::new());
        let agent = agent(&temp, &script);
        let out = agent.process_query("hi", None).await;
        assert_eq!(out["status"], "error");
        assert_eq!(out["error_type"], "ProviderRequest");
        assert!(agent.conversation_history().await.is_empty());
    }

    #[tokio::test]
    async fn follow_up_questions_reuse_the_last_address() {
        let temp = TempDir::new().unwrap();
        let script = ScriptedProvider::new(["Final Answer: looks active", "Final Answer: mostly ETH"]);
        let agent = agent(&temp, &script);

        agent.process_query(&format!("Analyze {ADDR}"), None).await;
        agent.process_query("What does it hold?", None).await;

        let second = &script.requests()[1];
        assert_eq!(second.last().unwrap().content, format!("What does it hold? for address {ADDR}"));
        // system + one remembered exchange + the new question
        assert_eq!(second.len(), 4);
    }

    #[tokio::test]
    async fn settings_updates_validate_before_applying() {
        let temp = TempDir::new().unwrap();
        let script = ScriptedProvider::new(Vec::<String>::new());
        let agent = agent(&temp, &script);

        agent
            .update_settings(&json!({ "temperature": 0.7, "max_tokens": 512, "memory_k": 1,
                                      "tool_settings": { "TokenTool": { "cache_ttl": 5 } } }))
            .await
            .unwrap();
        let s = agent.settings().await;
        assert_eq!(s.completion.temperature, 0.7);
        assert_eq!(s.completion.max_tokens, Some(512));

        assert!(agent.update_settings(&json!({ "temperature": "hot" })).await.is_err());
        assert!(agent.update_settings(&json!({ "tool_settings": { "GasTool": {} } })).await.is_err());
        assert!(agent.update_settings(&json!({ "tool_settings": { "TokenTool": { "nope": 1 } } })).await.is_err());
        assert_eq!(agent.settings().await.completion.temperature, 0.7);
    }
}

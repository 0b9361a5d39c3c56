//! System prompt template.
//!
//! The template lives in `{prompts_dir}/system.md` so operators can tune the
//! wording without a rebuild. A missing file falls back to the built-in text.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::subsystems::tools::ToolRegistry;

pub const SYSTEM_PROMPT_FILE: &str = "system.md";
pub const TOOL_DESCRIPTIONS_VAR: &str = "{{tool_descriptions}}";
pub const TOOL_NAMES_VAR: &str = "{{tool_names}}";

const FALLBACK_TEMPLATE: &str = r#"You are a Web3 intelligence agent with access to specialized tools for blockchain and cryptocurrency analysis. Here are your available tools:

{{tool_descriptions}}

IMPORTANT: You MUST use the following format for ALL responses:

To use a tool:
Action: <tool_name>
Action Input: {"command": "<command>", "other_params": "value"}

For final answers:
Final Answer: <your detailed response>

For example, when asked about crypto prices:
Action: TokenTool
Action Input: {"command": "price", "symbol": "BTC"}

Never explain your reasoning before using a tool - use the exact format above."#;

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
}

impl PromptBuilder {
    /// Read `system.md` from `prompts_dir`, or use the built-in template.
    pub fn load(prompts_dir: &Path) -> Self {
        let path = prompts_dir.join(SYSTEM_PROMPT_FILE);
        match fs::read_to_string(&path) {
            Ok(template) if template.contains(TOOL_DESCRIPTIONS_VAR) => {
                debug!(path = %path.display(), "system prompt loaded");
                Self { template }
            }
            Ok(_) => {
                warn!(path = %path.display(), "system prompt has no tool_descriptions slot, using built-in");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "system prompt unreadable, using built-in");
                Self::default()
            }
        }
    }

    pub fn from_template(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn render(&self, tools: &ToolRegistry) -> String {
        self.template
            .replace(TOOL_DESCRIPTIONS_VAR, &tools.render_descriptions())
            .replace(TOOL_NAMES_VAR, &tools.names().join(", "))
    }
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self { template: FALLBACK_TEMPLATE.to_string() }
    }
}

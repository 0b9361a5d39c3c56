//! Conversation memory with light entity tracking.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::chain::extract_addresses;
use crate::llm::{ChatMessage, Role};

const REFERENCE_WORDS: [&str; 4] = ["it", "that", "the", "this"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
}

/// Entities remembered across turns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EntityContext {
    pub last_address: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationMemory {
    messages: Vec<HistoryEntry>,
    entity: EntityContext,
    k: usize,
}

impl ConversationMemory {
    /// `k` is the number of past exchanges replayed to the model.
    pub fn new(k: usize) -> Self {
        Self { messages: Vec::new(), entity: EntityContext::default(), k }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn set_k(&mut self, k: usize) {
        self.k = k;
    }

    pub fn entity(&self) -> &EntityContext {
        &self.entity
    }

    /// Record one exchange and remember the first address the user mentioned.
    pub fn save_context(&mut self, input: &str, output: &str) {
        self.messages.push(HistoryEntry { role: Role::User, content: input.to_string() });
        self.messages.push(HistoryEntry { role: Role::Assistant, content: output.to_string() });
        if let Some(address) = extract_addresses(&input.to_lowercase()).into_iter().next() {
            self.entity.last_address = Some(address);
        }
    }

    /// The last `k` exchanges as chat messages.
    pub fn window(&self) -> Vec<ChatMessage> {
        let keep = self.k.saturating_mul(2).min(self.messages.len());
        self.messages[self.messages.len() - keep..]
            .iter()
            .map(|m| ChatMessage { role: m.role, content: m.content.clone() })
            .collect()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.entity = EntityContext::default();
    }

    /// Resolve pronoun references to the last address and append any
    /// caller-supplied context.
    pub fn contextualize(&self, query: &str, context: Option<&BTreeMap<String, String>>) -> String {
        let mut out = query.to_string();
        let lower = query.to_lowercase();
        if let Some(address) = &self.entity.last_address {
            let refers_back = lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| REFERENCE_WORDS.contains(&word));
            if !lower.contains("address") && refers_back {
                out.push_str(" for address ");
                out.push_str(address);
            }
        }
        if let Some(context) = context.filter(|c| !c.is_empty()) {
            let lines: Vec<String> = context.iter().map(|(k, v)| format!("{k}: {v}")).collect();
            out.push_str("\nContext:\n");
            out.push_str(&lines.join("\n"));
        }
        out
    }
}

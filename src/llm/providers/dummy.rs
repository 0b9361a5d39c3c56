//! Dummy LLM provider: answers immediately by echoing the last user message.
//! Used to exercise the full query path without a real API key.

use crate::llm::{ChatMessage, LlmResponse, ProviderError, Role};

#[derive(Debug, Clone)]
pub struct DummyProvider;

impl DummyProvider {
    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<LlmResponse, ProviderError> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(LlmResponse { text: format!("Final Answer: [echo] {last}"), usage: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_last_user_message_as_final_answer() {
        let p = DummyProvider;
        let messages = [
            ChatMessage::system("rules"),
            ChatMessage::user("first"),
            ChatMessage::assistant("reply"),
            ChatMessage::user("hello"),
        ];
        assert_eq!(p.chat(&messages).await.unwrap().text, "Final Answer: [echo] hello");
    }

    #[tokio::test]
    async fn empty_conversation() {
        let p = DummyProvider;
        assert_eq!(p.chat(&[]).await.unwrap().text, "Final Answer: [echo] ");
    }
}

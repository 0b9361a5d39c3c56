//! Scripted provider: replays a fixed queue of replies, one per call.
//!
//! Lets integration tests and offline demos drive the agent through a known
//! sequence of tool calls. Every request is recorded so callers can inspect
//! what the agent actually sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::llm::{ChatMessage, LlmResponse, ProviderError};

#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    replies: Arc<Mutex<VecDeque<String>>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedProvider {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Arc::new(Mutex::new(replies.into_iter().map(Into::into).collect())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn chat(&self, messages: &[ChatMessage]) -> Result<LlmResponse, ProviderError> {
        self.requests
            .lock()
            .map_err(|_| ProviderError::Request("scripted provider lock poisoned".into()))?
            .push(messages.to_vec());
        let next = self
            .replies
            .lock()
            .map_err(|_| ProviderError::Request("scripted provider lock poisoned".into()))?
            .pop_front();
        next.map(|text| LlmResponse { text, usage: None })
            .ok_or_else(|| ProviderError::Request("script exhausted".into()))
    }

    /// Every conversation sent so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Replies not yet consumed.
    pub fn remaining(&self) -> usize {
        self.replies.lock().map(|r| r.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let p = ScriptedProvider::new(["one", "two"]);
        assert_eq!(p.chat(&[]).await.unwrap().text, "one");
        assert_eq!(p.chat(&[ChatMessage::user("q")]).await.unwrap().text, "two");
        assert!(p.chat(&[]).await.is_err());
        assert_eq!(p.requests().len(), 3);
        assert_eq!(p.requests()[1][0].content, "q");
    }

    #[tokio::test]
    async fn clones_share_the_script() {
        let p = ScriptedProvider::new(["only"]);
        let clone = p.clone();
        clone.chat(&[]).await.unwrap();
        assert_eq!(p.remaining(), 0);
    }
}

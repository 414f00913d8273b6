use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::drivers::{estimate_tokens_by_chars, ChatDriver};
use crate::error::DriftError;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, TokenUsage};

#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond { content: String, tokens: u32 },
    RateLimited,
    Fail(String),
}

impl ScriptedReply {
    pub fn respond(content: impl Into<String>) -> Self {
        Self::Respond {
            content: content.into(),
            tokens: 16,
        }
    }
}

/// Deterministic offline driver: pops canned replies in order, falling back
/// to a repeating reply once the queue is drained (if one is configured).
/// Used by tests and `--dry-run`.
pub struct ScriptedDriver {
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: Option<ScriptedReply>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            latency: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            responses
                .into_iter()
                .map(|content| ScriptedReply::respond(content))
                .collect(),
        )
    }

    /// A driver that answers every call with the same content.
    pub fn repeating(content: impl Into<String>) -> Self {
        let mut driver = Self::new(Vec::new());
        driver.fallback = Some(ScriptedReply::respond(content));
        driver
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Total chat calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Option<ScriptedReply> {
        let mut replies = self.replies.lock().unwrap();
        replies.pop_front().or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ChatDriver for ScriptedDriver {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<ChatResponse, DriftError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.next_reply() {
            Some(ScriptedReply::Respond { content, tokens }) => {
                let prompt_tokens = estimate_tokens_by_chars(messages);
                Ok(ChatResponse {
                    message: ChatMessage::assistant(content),
                    usage: Some(TokenUsage {
                        prompt_tokens,
                        completion_tokens: tokens,
                        total_tokens: prompt_tokens + tokens,
                    }),
                    logprobs: None,
                    model: "scripted".to_string(),
                })
            }
            Some(ScriptedReply::RateLimited) => Err(DriftError::RateLimited { retry_after: None }),
            Some(ScriptedReply::Fail(message)) => Err(DriftError::Provider(message)),
            None => Err(DriftError::Provider(
                "scripted driver ran out of replies".to_string(),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

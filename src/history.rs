use serde::Serialize;

use crate::types::{ChatMessage, TokenUsage};

/// The live history of one branch. Owned exclusively by the executor driving
/// that branch; append-only for the duration of a run.
///
/// Anchor probes never see this struct mutably: they dispatch on the derived
/// copy returned by [`ConversationState::probe_history`], so probe content
/// cannot leak into the live history except through the explicit
/// append-anchor path.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationState {
    branch_id: String,
    model: String,
    messages: Vec<ChatMessage>,
    turn_index: usize,
    usage: TokenUsage,
    cost_usd: f64,
}

impl ConversationState {
    pub fn new(branch_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            model: model.into(),
            messages: Vec::new(),
            turn_index: 0,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_system(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::system(content));
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Disposable snapshot for one anchor probe: the live history plus the
    /// probe question as a trailing user message.
    pub fn probe_history(&self, question: &str) -> Vec<ChatMessage> {
        let mut derived = self.messages.clone();
        derived.push(ChatMessage::user(question));
        derived
    }

    pub fn record_usage(&mut self, usage: Option<&TokenUsage>, cost_usd: f64) {
        if let Some(usage) = usage {
            self.usage.add(usage);
        }
        self.cost_usd += cost_usd;
    }

    pub fn advance_turn(&mut self) -> usize {
        self.turn_index += 1;
        self.turn_index
    }

    pub fn turn_index(&self) -> usize {
        self.turn_index
    }

    pub fn branch_id(&self) -> &str {
        &self.branch_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn total_tokens(&self) -> u32 {
        self.usage.total_tokens
    }

    pub fn usage(&self) -> &TokenUsage {
        &self.usage
    }

    pub fn cost_usd(&self) -> f64 {
        self.cost_usd
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.messages.iter().any(|m| m.content.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_history_leaves_live_history_untouched() {
        let mut state = ConversationState::new("baseline", "test-model");
        state.push_system("Be helpful.");
        state.push_user("Hello");
        state.push_assistant("Hi there");

        let derived = state.probe_history("Is this okay?");
        assert_eq!(derived.len(), 4);
        assert_eq!(state.len(), 3);
        assert!(!state.contains_text("Is this okay?"));
    }

    #[test]
    fn usage_accumulates() {
        let mut state = ConversationState::new("baseline", "test-model");
        let usage = TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        };
        state.record_usage(Some(&usage), 0.01);
        state.record_usage(Some(&usage), 0.01);
        state.record_usage(None, 0.0);
        assert_eq!(state.total_tokens(), 30);
        assert!((state.cost_usd() - 0.02).abs() < 1e-9);
    }
}

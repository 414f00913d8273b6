use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::error::DriftError;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, TokenUsage};

pub mod anthropic;
pub mod openai;
pub mod scripted;

/// One hosted model endpoint. Implementations are swappable behind the
/// trait; the orchestration core never sees provider specifics.
#[async_trait]
pub trait ChatDriver: Send + Sync {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, DriftError>;

    /// Token estimate used for budget pre-checks. The default leans on the
    /// rough 1-token-per-4-characters heuristic.
    fn estimate_tokens(&self, messages: &[ChatMessage]) -> u32 {
        estimate_tokens_by_chars(messages)
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct EmbeddingResponse {
    pub vector: Vec<f32>,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

#[async_trait]
pub trait EmbeddingDriver: Send + Sync {
    async fn embed(&self, text: &str) -> Result<EmbeddingResponse, DriftError>;

    /// Model identifier used for pricing lookups.
    fn model(&self) -> &str;

    fn name(&self) -> &'static str;
}

pub(crate) fn estimate_tokens_by_chars(messages: &[ChatMessage]) -> u32 {
    let chars: usize = messages
        .iter()
        .map(|message| message.role.as_str().len() + message.content.len())
        .sum();
    (chars / 4) as u32
}

/// Maps a non-success HTTP response onto the error taxonomy: 429 is rate
/// limiting (honoring `retry-after`), 5xx/408 are transient provider faults,
/// anything else 4xx is a malformed request and never retried.
pub(crate) async fn classify_http_failure(response: reqwest::Response) -> DriftError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let detail = truncate(&body, 200);

    if status == StatusCode::TOO_MANY_REQUESTS {
        DriftError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        DriftError::Provider(format!("{status}: {detail}"))
    } else {
        DriftError::InvalidRequest(format!("{status}: {detail}"))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::drivers::{classify_http_failure, ChatDriver};
use crate::error::DriftError;
use crate::types::{ChatMessage, ChatOptions, ChatResponse, MessageRole, TokenUsage};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

// The messages endpoint requires an explicit output cap.
const FALLBACK_MAX_TOKENS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicDriver {
    client: Client,
    config: AnthropicConfig,
}

impl AnthropicDriver {
    pub fn new(api_key: impl Into<String>) -> Result<Self, DriftError> {
        Self::from_config(AnthropicConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, DriftError> {
        let api_key = env::var("ANTHROPIC_API_KEY")
            .map_err(|_| DriftError::MissingApiKey("ANTHROPIC_API_KEY"))?;
        let mut config = AnthropicConfig::new(api_key);
        if let Ok(base_url) = env::var("ANTHROPIC_BASE_URL") {
            config.base_url = base_url;
        }
        Self::from_config(config)
    }

    pub fn from_config(config: AnthropicConfig) -> Result<Self, DriftError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    model: String,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait]
impl ChatDriver for AnthropicDriver {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatResponse, DriftError> {
        // System content travels in its own field, not the message list.
        let mut system = None;
        let mut wire = Vec::with_capacity(messages.len());
        for message in messages {
            match message.role {
                MessageRole::System => system = Some(message.content.as_str()),
                MessageRole::User => wire.push(WireMessage {
                    role: "user",
                    content: &message.content,
                }),
                MessageRole::Assistant => wire.push(WireMessage {
                    role: "assistant",
                    content: &message.content,
                }),
            }
        }

        let body = MessagesBody {
            model: &options.model,
            messages: wire,
            max_tokens: options.max_tokens.unwrap_or(FALLBACK_MAX_TOKENS),
            system,
            temperature: options.temperature,
        };

        let response = self
            .client
            .post(self.endpoint("v1/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(classify_http_failure(response).await);
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or(DriftError::InvalidResponse("response carried no text block"))?;

        Ok(ChatResponse {
            message: ChatMessage::assistant(text),
            usage: parsed.usage.map(|usage| TokenUsage {
                prompt_tokens: usage.input_tokens,
                completion_tokens: usage.output_tokens,
                total_tokens: usage.input_tokens + usage.output_tokens,
            }),
            logprobs: None,
            model: parsed.model,
        })
    }

    fn name(&self) -> &'static str {
        "anthropic"
    }
}

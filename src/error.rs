use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("request rejected by provider: {0}")]
    InvalidRequest(String),

    #[error("budget exceeded: spent ${spent:.4} of ${ceiling:.4}")]
    BudgetExceeded { spent: f64, ceiling: f64 },

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("malformed scenario: {0}")]
    MalformedScenario(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("evaluator {name} failed: {message}")]
    Evaluator { name: String, message: String },
}

impl DriftError {
    /// Transient failures worth another attempt. Budget exhaustion and
    /// malformed requests are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriftError::RateLimited { .. }
                | DriftError::Timeout(_)
                | DriftError::Provider(_)
                | DriftError::Http(_)
        )
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, DriftError::BudgetExceeded { .. })
    }
}

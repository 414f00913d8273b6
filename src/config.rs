use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::RetryPolicy;
use crate::error::DriftError;
use crate::scenario::Scenario;
use crate::types::{ChatOptions, ModelPricing, PricingTable};

/// Immutable run configuration, constructed once and handed to the
/// orchestrator.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Max simultaneous in-flight provider calls across all branches.
    pub max_in_flight: usize,
    /// Hard monetary ceiling for the whole process, in USD.
    pub budget_usd: f64,
    pub pricing: PricingTable,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_logprobs: Option<u8>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 4,
            budget_usd: 5.0,
            pricing: PricingTable::new(),
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            temperature: Some(0.7),
            max_tokens: Some(1000),
            top_logprobs: None,
        }
    }
}

impl RunConfig {
    pub fn with_max_in_flight(mut self, value: usize) -> Self {
        self.max_in_flight = value;
        self
    }

    pub fn with_budget_usd(mut self, value: f64) -> Self {
        self.budget_usd = value;
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, value: Duration) -> Self {
        self.request_timeout = value;
        self
    }

    pub fn chat_options(&self, model: &str) -> ChatOptions {
        ChatOptions {
            model: model.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_logprobs: self.top_logprobs,
        }
    }

    /// Overlays a YAML settings file onto the defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, DriftError> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, DriftError> {
        let raw: RawSettings = serde_yaml::from_str(content)
            .map_err(|err| DriftError::Config(err.to_string()))?;

        let mut config = Self::default();
        if let Some(value) = raw.max_in_flight {
            config.max_in_flight = value;
        }
        if let Some(value) = raw.budget_usd {
            config.budget_usd = value;
        }
        if let Some(value) = raw.temperature {
            config.temperature = Some(value);
        }
        if let Some(value) = raw.max_tokens {
            config.max_tokens = Some(value);
        }
        if let Some(value) = raw.top_logprobs {
            config.top_logprobs = Some(value);
        }
        if let Some(value) = raw.request_timeout_secs {
            config.request_timeout = Duration::from_secs(value);
        }
        if let Some(value) = raw.retry_max_attempts {
            config.retry.max_attempts = value;
        }
        if let Some(value) = raw.retry_base_delay_ms {
            config.retry.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = raw.retry_jitter {
            config.retry.jitter = value;
        }
        if let Some(table) = raw.cost_per_1k_tokens {
            let mut pricing = PricingTable::new();
            for (model, rates) in table {
                pricing.insert(model, ModelPricing::new(rates.input, rates.output));
            }
            config.pricing = pricing;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct RawSettings {
    max_in_flight: Option<usize>,
    budget_usd: Option<f64>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_logprobs: Option<u8>,
    request_timeout_secs: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    retry_jitter: Option<bool>,
    cost_per_1k_tokens: Option<HashMap<String, RawRates>>,
}

#[derive(Debug, Deserialize)]
struct RawRates {
    #[serde(default)]
    input: f64,
    #[serde(default)]
    output: f64,
}

/// Rough pre-run planning estimate: assumes ~500 tokens per dispatch with a
/// 70/30 input/output split, counting primary turns plus every probe
/// repetition per branch.
pub fn estimate_scenario_cost(scenario: &Scenario, models: &[String], pricing: &PricingTable) -> f64 {
    const AVG_TOKENS_PER_CALL: f64 = 500.0;

    let points = scenario.dispatch_points() as f64;
    let probes_per_turn = (scenario.anchor_questions.len() * scenario.probes_per_point) as f64;
    let calls_per_branch = points * (1.0 + probes_per_turn);
    let calls = calls_per_branch * scenario.branches.len() as f64;

    let input_tokens = (calls * AVG_TOKENS_PER_CALL * 0.7) as u32;
    let output_tokens = (calls * AVG_TOKENS_PER_CALL * 0.3) as u32;

    models
        .iter()
        .map(|model| pricing.estimate(model, input_tokens, output_tokens))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overlays_defaults() {
        let yaml = "\
max_in_flight: 8
budget_usd: 2.5
retry_max_attempts: 5
retry_jitter: false
cost_per_1k_tokens:
  gpt-4:
    input: 0.03
    output: 0.06
";
        let config = RunConfig::from_yaml_str(yaml).expect("parse");
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.budget_usd, 2.5);
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.retry.jitter);
        assert!(config.pricing.get("gpt-4").is_some());
        // untouched defaults survive
        assert_eq!(config.max_tokens, Some(1000));
    }

    #[test]
    fn bad_yaml_is_a_config_error() {
        let err = RunConfig::from_yaml_str("max_in_flight: [not a number").unwrap_err();
        assert!(matches!(err, DriftError::Config(_)));
    }

    #[test]
    fn cost_estimate_scales_with_probes_and_branches() {
        use crate::scenario::{Branch, Turn};

        let scenario = Scenario {
            name: "estimate".to_string(),
            behavior_tested: "drift".to_string(),
            anchor_questions: vec!["q".to_string()],
            max_user_turns: 10,
            probes_per_point: 2,
            branches: vec![Branch::new("baseline", false), Branch::new("anchor_guard", true)],
            turns: vec![
                Turn::user("hi"),
                Turn::assistant_expected(),
                Turn::user("again"),
                Turn::assistant_expected(),
            ],
        };
        let pricing = PricingTable::new().with_model("m", ModelPricing::new(0.01, 0.03));
        let cost = estimate_scenario_cost(&scenario, &["m".to_string()], &pricing);
        // 2 points * (1 + 2 probes) * 2 branches = 12 calls of ~500 tokens
        let expected = (12.0 * 500.0 * 0.7 / 1000.0) * 0.01 + (12.0 * 500.0 * 0.3 / 1000.0) * 0.03;
        assert!((cost - expected).abs() < 1e-9);
    }
}

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Text(String),
    Null,
}

impl MetricValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Float(value) => Some(*value),
            MetricValue::Int(value) => Some(*value as f64),
            _ => None,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Float(value) => write!(f, "{value}"),
            MetricValue::Int(value) => write!(f, "{value}"),
            MetricValue::Text(value) => write!(f, "{value}"),
            MetricValue::Null => Ok(()),
        }
    }
}

pub type MetricMap = BTreeMap<String, MetricValue>;

/// One row per (scenario, model, branch, turn). Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub run_id: String,
    pub scenario: String,
    pub model: String,
    pub branch: String,
    pub turn: usize,
    pub recorded_at: DateTime<Utc>,
    pub tokens_primary: u32,
    pub tokens_probes: u32,
    pub cost_usd: f64,
    /// Set on the terminal record of a failed or budget-halted branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub values: MetricMap,
}

/// Result of one anchor probe repetition. Transient: probes never touch the
/// live branch history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorProbeResult {
    pub scenario: String,
    pub model: String,
    pub branch: String,
    pub question: String,
    pub question_index: usize,
    pub probe_index: usize,
    pub turn: usize,
    pub response: Option<String>,
    pub tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnchorProbeResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

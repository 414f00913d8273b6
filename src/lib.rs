pub mod branch;
pub mod budget;
pub mod config;
pub mod dispatch;
pub mod drivers;
pub mod error;
pub mod evaluators;
pub mod history;
pub mod metrics;
pub mod orchestrator;
pub mod persist;
pub mod scenario;
pub mod types;

pub use error::DriftError;
pub use types::{
    ChatMessage, ChatOptions, ChatResponse, LogprobEntry, MessageRole, ModelPricing, PricingTable,
    TokenLogprob, TokenUsage,
};
pub use drivers::{ChatDriver, EmbeddingDriver, EmbeddingResponse};
pub use budget::{AdmitPermit, RateBudgetController};
pub use dispatch::{DispatchGate, RetryPolicy};
pub use scenario::{Branch, Scenario, Turn, TurnRole};
pub use history::ConversationState;
pub use metrics::{AnchorProbeResult, MetricMap, MetricRecord, MetricValue};
pub use branch::{BranchOutcome, BranchReport};
pub use orchestrator::{
    ModelTarget, RunCollection, RunEvent, ScenarioOrchestrator, ScenarioRun,
};
pub use evaluators::{AnchorDriftEvaluator, EvalInput, Evaluator, PushbackEvaluator};
pub use config::{estimate_scenario_cost, RunConfig};

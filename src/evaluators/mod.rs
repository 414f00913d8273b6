use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::DriftError;
use crate::metrics::MetricMap;
use crate::scenario::{Branch, Scenario};
use crate::types::ChatResponse;

pub mod anchor_drift;
pub mod pushback;

pub use anchor_drift::AnchorDriftEvaluator;
pub use pushback::PushbackEvaluator;

/// Read-only context handed to each evaluator after a turn.
pub struct EvalInput<'a> {
    pub primary: &'a ChatResponse,
    /// First successful anchor probe of the turn, when probes ran.
    pub anchor: Option<&'a ChatResponse>,
    pub scenario: &'a Scenario,
    pub branch: &'a Branch,
    pub turn: usize,
}

/// Scores one turn. Pure with respect to conversation state; may call an
/// embedding provider through the dispatch gate.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn evaluate(&self, input: &EvalInput<'_>) -> Result<MetricMap, DriftError>;
}

/// Runs the configured pipeline in order, merging each evaluator's output
/// into one map. Key collisions keep the first value and are reported;
/// evaluator failures are reported and skipped. Neither aborts the turn.
pub async fn run_pipeline(
    evaluators: &[Arc<dyn Evaluator>],
    input: &EvalInput<'_>,
) -> (MetricMap, Vec<String>) {
    let mut merged = MetricMap::new();
    let mut annotations = Vec::new();

    for evaluator in evaluators {
        match evaluator.evaluate(input).await {
            Ok(values) => {
                for (key, value) in values {
                    if merged.contains_key(&key) {
                        warn!(
                            evaluator = evaluator.name(),
                            key = %key,
                            "metric key collision, keeping first value"
                        );
                        annotations.push(format!(
                            "{}: key collision on `{key}`",
                            evaluator.name()
                        ));
                    } else {
                        merged.insert(key, value);
                    }
                }
            }
            Err(err) => {
                warn!(evaluator = evaluator.name(), error = %err, "evaluator failed");
                annotations.push(format!("{}: {err}", evaluator.name()));
            }
        }
    }

    (merged, annotations)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::metrics::MetricValue;
    use crate::scenario::{Branch, Scenario, Turn};
    use crate::types::{ChatMessage, ChatResponse};

    struct FixedEvaluator {
        name: &'static str,
        key: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Evaluator for FixedEvaluator {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn evaluate(&self, _input: &EvalInput<'_>) -> Result<MetricMap, DriftError> {
            if self.fail {
                return Err(DriftError::Evaluator {
                    name: self.name.to_string(),
                    message: "boom".to_string(),
                });
            }
            let mut values = BTreeMap::new();
            values.insert(self.key.to_string(), MetricValue::Int(1));
            Ok(values)
        }
    }

    fn scenario() -> Scenario {
        Scenario {
            name: "test".to_string(),
            behavior_tested: "drift".to_string(),
            anchor_questions: vec!["Is this okay?".to_string()],
            max_user_turns: 5,
            probes_per_point: 1,
            branches: vec![Branch::new("baseline", false)],
            turns: vec![Turn::user("hi"), Turn::assistant_expected()],
        }
    }

    fn response(text: &str) -> ChatResponse {
        ChatResponse {
            message: ChatMessage::assistant(text),
            usage: None,
            logprobs: None,
            model: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn collisions_keep_first_value_and_annotate() {
        let scenario = scenario();
        let primary = response("sure");
        let input = EvalInput {
            primary: &primary,
            anchor: None,
            scenario: &scenario,
            branch: &scenario.branches[0],
            turn: 0,
        };
        let evaluators: Vec<Arc<dyn Evaluator>> = vec![
            Arc::new(FixedEvaluator {
                name: "a",
                key: "score",
                fail: false,
            }),
            Arc::new(FixedEvaluator {
                name: "b",
                key: "score",
                fail: false,
            }),
        ];

        let (values, annotations) = run_pipeline(&evaluators, &input).await;
        assert_eq!(values.len(), 1);
        assert_eq!(annotations.len(), 1);
        assert!(annotations[0].contains("collision"));
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_pipeline() {
        let scenario = scenario();
        let primary = response("sure");
        let input = EvalInput {
            primary: &primary,
            anchor: None,
            scenario: &scenario,
            branch: &scenario.branches[0],
            turn: 0,
        };
        let evaluators: Vec<Arc<dyn Evaluator>> = vec![
            Arc::new(FixedEvaluator {
                name: "broken",
                key: "x",
                fail: true,
            }),
            Arc::new(FixedEvaluator {
                name: "fine",
                key: "y",
                fail: false,
            }),
        ];

        let (values, annotations) = run_pipeline(&evaluators, &input).await;
        assert!(values.contains_key("y"));
        assert_eq!(annotations.len(), 1);
        assert!(annotations[0].starts_with("broken:"));
    }
}

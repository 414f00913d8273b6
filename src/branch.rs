use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::dispatch::DispatchGate;
use crate::drivers::ChatDriver;
use crate::error::DriftError;
use crate::evaluators::{run_pipeline, EvalInput, Evaluator};
use crate::history::ConversationState;
use crate::metrics::{AnchorProbeResult, MetricMap, MetricRecord, MetricValue};
use crate::orchestrator::RunEvent;
use crate::scenario::{Branch, Scenario, TurnRole};
use crate::types::{ChatOptions, ChatResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchOutcome {
    Completed,
    /// Primary dispatch failed after retries.
    Failed,
    /// A dispatch hit the budget ceiling. Distinct from `Failed` so
    /// consumers can tell "ran out of money" from "provider error".
    BudgetHalted,
}

/// Terminal summary of one (model, branch) run, including the final
/// conversation snapshot for the persistence sink.
#[derive(Debug, Clone, Serialize)]
pub struct BranchReport {
    pub scenario: String,
    pub model: String,
    pub branch: String,
    pub outcome: BranchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: ConversationState,
}

struct Halt {
    outcome: BranchOutcome,
    message: String,
}

/// Drives one branch of one scenario against one model, turn by turn. Owns
/// its ConversationState exclusively; the only cross-branch state it touches
/// is the budget controller behind the dispatch gate.
pub(crate) struct BranchExecutor {
    pub(crate) run_id: String,
    pub(crate) scenario: Arc<Scenario>,
    pub(crate) branch: Branch,
    pub(crate) driver: Arc<dyn ChatDriver>,
    pub(crate) options: ChatOptions,
    pub(crate) gate: Arc<DispatchGate>,
    pub(crate) evaluators: Arc<Vec<Arc<dyn Evaluator>>>,
    pub(crate) events: mpsc::Sender<RunEvent>,
}

impl BranchExecutor {
    pub(crate) async fn run(self) -> BranchReport {
        let mut state = ConversationState::new(&self.branch.id, &self.options.model);
        let mut user_turns = 0usize;
        let mut halted: Option<Halt> = None;

        'turns: for turn in &self.scenario.turns {
            match turn.role {
                TurnRole::System => {
                    state.push_system(turn.content.clone().unwrap_or_default());
                }
                TurnRole::User => {
                    if user_turns >= self.scenario.max_user_turns {
                        info!(
                            scenario = %self.scenario.name,
                            branch = %self.branch.id,
                            max = self.scenario.max_user_turns,
                            "reached max user turns"
                        );
                        break 'turns;
                    }
                    user_turns += 1;
                    state.push_user(turn.content.clone().unwrap_or_default());
                }
                TurnRole::AssistantExpected => {
                    if let Err(halt) = self.execute_point(&mut state).await {
                        halted = Some(halt);
                        break 'turns;
                    }
                }
            }
        }

        let (outcome, error) = match halted {
            Some(halt) => (halt.outcome, Some(halt.message)),
            None => (BranchOutcome::Completed, None),
        };
        info!(
            scenario = %self.scenario.name,
            model = %self.options.model,
            branch = %self.branch.id,
            ?outcome,
            turns = state.turn_index(),
            "branch finished"
        );

        BranchReport {
            scenario: self.scenario.name.clone(),
            model: self.options.model.clone(),
            branch: self.branch.id.clone(),
            outcome,
            error,
            state,
        }
    }

    /// One expected-assistant point: primary dispatch, anchor probes on
    /// derived histories, evaluation, and the optional anchor append.
    async fn execute_point(&self, state: &mut ConversationState) -> Result<(), Halt> {
        let turn = state.turn_index();

        let primary = match self
            .gate
            .send(self.driver.as_ref(), state.messages(), &self.options)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.emit_terminal(turn, &err).await;
                return Err(self.halt_for(&err));
            }
        };
        let primary_cost = self
            .gate
            .cost_of(&self.options.model, primary.usage.as_ref());
        let primary_tokens = primary.total_tokens();
        state.push_assistant(primary.text());
        state.record_usage(primary.usage.as_ref(), primary_cost);

        let probes = match self.run_probes(state, turn).await {
            Ok(probes) => probes,
            Err(err) => {
                self.emit_terminal(turn, &err).await;
                return Err(self.halt_for(&err));
            }
        };

        let mut probe_tokens = 0u32;
        let mut probe_cost = 0.0;
        for outcomes in &probes {
            for response in outcomes.iter().flatten() {
                let cost = self.gate.cost_of(&self.options.model, response.usage.as_ref());
                probe_tokens += response.total_tokens();
                probe_cost += cost;
                state.record_usage(response.usage.as_ref(), cost);
            }
        }

        let first_anchor = probes.first().and_then(|q| q.iter().flatten().next());
        let input = EvalInput {
            primary: &primary,
            anchor: first_anchor,
            scenario: &self.scenario,
            branch: &self.branch,
            turn,
        };
        let (mut values, annotations) = run_pipeline(&self.evaluators, &input).await;
        if !annotations.is_empty() {
            values.insert(
                "eval_errors".to_string(),
                MetricValue::Text(annotations.join("; ")),
            );
        }

        self.emit(RunEvent::Metric(MetricRecord {
            run_id: self.run_id.clone(),
            scenario: self.scenario.name.clone(),
            model: self.options.model.clone(),
            branch: self.branch.id.clone(),
            turn,
            recorded_at: chrono::Utc::now(),
            tokens_primary: primary_tokens,
            tokens_probes: probe_tokens,
            cost_usd: primary_cost + probe_cost,
            error: None,
            values,
        }))
        .await;

        if self.branch.appends_anchor_to_history {
            for (question, outcomes) in self.scenario.anchor_questions.iter().zip(&probes) {
                // First-probe-wins; fall back to the first probe that
                // succeeded so the history shape stays deterministic.
                let answer = outcomes
                    .first()
                    .and_then(|outcome| outcome.as_ref())
                    .or_else(|| outcomes.iter().flatten().next())
                    .map(|response| response.text().to_string())
                    .unwrap_or_default();
                state.push_user(question.clone());
                state.push_assistant(answer);
            }
        }

        state.advance_turn();
        Ok(())
    }

    /// Dispatches every probe repetition for this point on derived history
    /// snapshots. Probe failures are best-effort and recorded in place; only
    /// budget exhaustion propagates.
    async fn run_probes(
        &self,
        state: &ConversationState,
        turn: usize,
    ) -> Result<Vec<Vec<Option<ChatResponse>>>, DriftError> {
        let mut all = Vec::with_capacity(self.scenario.anchor_questions.len());
        let mut budget_hit: Option<DriftError> = None;

        for (question_index, question) in self.scenario.anchor_questions.iter().enumerate() {
            let probe_history = state.probe_history(question);
            let dispatches = (0..self.scenario.probes_per_point).map(|_| {
                let history = probe_history.clone();
                async move {
                    self.gate
                        .send(self.driver.as_ref(), &history, &self.options)
                        .await
                }
            });
            // Probes of one point run concurrently; join_all keeps outcomes
            // in probe-index order.
            let outcomes = join_all(dispatches).await;

            let mut responses = Vec::with_capacity(outcomes.len());
            for (probe_index, outcome) in outcomes.into_iter().enumerate() {
                match outcome {
                    Ok(response) => {
                        self.emit(RunEvent::Probe(AnchorProbeResult {
                            scenario: self.scenario.name.clone(),
                            model: self.options.model.clone(),
                            branch: self.branch.id.clone(),
                            question: question.clone(),
                            question_index,
                            probe_index,
                            turn,
                            response: Some(response.text().to_string()),
                            tokens: response.total_tokens(),
                            error: None,
                        }))
                        .await;
                        responses.push(Some(response));
                    }
                    Err(err) => {
                        warn!(
                            scenario = %self.scenario.name,
                            branch = %self.branch.id,
                            probe_index,
                            error = %err,
                            "anchor probe failed"
                        );
                        self.emit(RunEvent::Probe(AnchorProbeResult {
                            scenario: self.scenario.name.clone(),
                            model: self.options.model.clone(),
                            branch: self.branch.id.clone(),
                            question: question.clone(),
                            question_index,
                            probe_index,
                            turn,
                            response: None,
                            tokens: 0,
                            error: Some(err.to_string()),
                        }))
                        .await;
                        if err.is_budget_exceeded() && budget_hit.is_none() {
                            budget_hit = Some(err);
                        }
                        responses.push(None);
                    }
                }
            }
            all.push(responses);
        }

        match budget_hit {
            Some(err) => Err(err),
            None => Ok(all),
        }
    }

    fn halt_for(&self, err: &DriftError) -> Halt {
        Halt {
            outcome: if err.is_budget_exceeded() {
                BranchOutcome::BudgetHalted
            } else {
                BranchOutcome::Failed
            },
            message: err.to_string(),
        }
    }

    async fn emit(&self, event: RunEvent) {
        // The consumer may have walked away; dropping events is fine then.
        let _ = self.events.send(event).await;
    }

    async fn emit_terminal(&self, turn: usize, err: &DriftError) {
        self.emit(RunEvent::Metric(MetricRecord {
            run_id: self.run_id.clone(),
            scenario: self.scenario.name.clone(),
            model: self.options.model.clone(),
            branch: self.branch.id.clone(),
            turn,
            recorded_at: chrono::Utc::now(),
            tokens_primary: 0,
            tokens_probes: 0,
            cost_usd: 0.0,
            error: Some(err.to_string()),
            values: MetricMap::new(),
        }))
        .await;
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use async_stream::stream;
use futures_core::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::branch::{BranchExecutor, BranchReport};
use crate::budget::RateBudgetController;
use crate::config::RunConfig;
use crate::dispatch::DispatchGate;
use crate::drivers::ChatDriver;
use crate::error::DriftError;
use crate::evaluators::Evaluator;
use crate::metrics::{AnchorProbeResult, MetricRecord};
use crate::scenario::Scenario;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One model endpoint to run the scenario against.
#[derive(Clone)]
pub struct ModelTarget {
    pub model: String,
    pub driver: Arc<dyn ChatDriver>,
}

impl ModelTarget {
    pub fn new(model: impl Into<String>, driver: Arc<dyn ChatDriver>) -> Self {
        Self {
            model: model.into(),
            driver,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RunEvent {
    Metric(MetricRecord),
    Probe(AnchorProbeResult),
    BranchFinished(BranchReport),
}

/// Schedules one executor per deduplicated (model, branch) pair and merges
/// their events into a single incrementally consumed stream. The only
/// concurrency bound is the budget controller's slot pool.
pub struct ScenarioOrchestrator {
    config: RunConfig,
    budget: Arc<RateBudgetController>,
    gate: Arc<DispatchGate>,
    evaluators: Arc<Vec<Arc<dyn Evaluator>>>,
}

impl ScenarioOrchestrator {
    pub fn new(config: RunConfig) -> Self {
        let budget = Arc::new(RateBudgetController::new(
            config.max_in_flight,
            config.budget_usd,
        ));
        let gate = Arc::new(DispatchGate::new(
            Arc::clone(&budget),
            config.pricing.clone(),
            config.retry.clone(),
            config.request_timeout,
        ));
        Self {
            config,
            budget,
            gate,
            evaluators: Arc::new(Vec::new()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        Arc::make_mut(&mut self.evaluators).push(evaluator);
        self
    }

    pub fn with_evaluators<I>(mut self, evaluators: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Evaluator>>,
    {
        Arc::make_mut(&mut self.evaluators).extend(evaluators);
        self
    }

    /// Shared by evaluators that need the same dispatch discipline for their
    /// own outbound calls (embeddings).
    pub fn gate(&self) -> Arc<DispatchGate> {
        Arc::clone(&self.gate)
    }

    pub fn budget(&self) -> Arc<RateBudgetController> {
        Arc::clone(&self.budget)
    }

    /// Validates the scenario, then launches every (model, branch) executor.
    /// Returns before any of them finishes; consume events via the returned
    /// [`ScenarioRun`].
    pub fn run(
        &self,
        scenario: Arc<Scenario>,
        models: &[ModelTarget],
    ) -> Result<ScenarioRun, DriftError> {
        scenario.validate()?;
        if models.is_empty() {
            return Err(DriftError::Config("no model targets".to_string()));
        }

        let run_id = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let mut seen = HashSet::new();
        let mut tasks = Vec::new();
        for target in models {
            for branch in &scenario.branches {
                if !seen.insert((target.model.clone(), branch.id.clone())) {
                    continue;
                }
                let executor = BranchExecutor {
                    run_id: run_id.clone(),
                    scenario: Arc::clone(&scenario),
                    branch: branch.clone(),
                    driver: Arc::clone(&target.driver),
                    options: self.config.chat_options(&target.model),
                    gate: Arc::clone(&self.gate),
                    evaluators: Arc::clone(&self.evaluators),
                    events: events.clone(),
                };
                let done = events.clone();
                tasks.push(tokio::spawn(async move {
                    let report = executor.run().await;
                    let _ = done.send(RunEvent::BranchFinished(report)).await;
                }));
            }
        }
        drop(events);

        info!(
            scenario = %scenario.name,
            run_id = %run_id,
            executors = tasks.len(),
            "scenario launched"
        );

        Ok(ScenarioRun {
            run_id,
            receiver,
            tasks,
        })
    }
}

/// Handle on a launched scenario: an event stream plus cancellation. The
/// stream ends when every executor has finished (or been aborted).
pub struct ScenarioRun {
    run_id: String,
    receiver: mpsc::Receiver<RunEvent>,
    tasks: Vec<JoinHandle<()>>,
}

impl ScenarioRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.receiver.recv().await
    }

    /// Abandons all outstanding dispatches at their next suspension point.
    /// Events already emitted stay readable from the stream.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Surrenders cancellation: executors run detached until the stream ends.
    pub fn into_stream(self) -> impl Stream<Item = RunEvent> + Send {
        let mut receiver = self.receiver;
        stream! {
            while let Some(event) = receiver.recv().await {
                yield event;
            }
        }
    }

    /// Drains the run to completion. Convenient for batch callers and tests;
    /// incremental consumers should use `next_event` or `into_stream`.
    pub async fn collect(mut self) -> RunCollection {
        let mut collection = RunCollection {
            run_id: self.run_id.clone(),
            metrics: Vec::new(),
            probes: Vec::new(),
            reports: Vec::new(),
        };
        while let Some(event) = self.receiver.recv().await {
            match event {
                RunEvent::Metric(record) => collection.metrics.push(record),
                RunEvent::Probe(probe) => collection.probes.push(probe),
                RunEvent::BranchFinished(report) => collection.reports.push(report),
            }
        }
        for task in self.tasks {
            // Executors are done once all senders dropped; reap the handles.
            let _ = task.await;
        }
        collection
    }
}

#[derive(Debug)]
pub struct RunCollection {
    pub run_id: String,
    pub metrics: Vec<MetricRecord>,
    pub probes: Vec<AnchorProbeResult>,
    pub reports: Vec<BranchReport>,
}

impl RunCollection {
    pub fn report_for(&self, model: &str, branch: &str) -> Option<&BranchReport> {
        self.reports
            .iter()
            .find(|report| report.model == model && report.branch == branch)
    }

    pub fn metrics_for(&self, model: &str, branch: &str) -> Vec<&MetricRecord> {
        self.metrics
            .iter()
            .filter(|record| record.model == model && record.branch == branch)
            .collect()
    }
}

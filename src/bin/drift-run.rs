use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use driftwerk::drivers::anthropic::AnthropicDriver;
use driftwerk::drivers::openai::OpenAIDriver;
use driftwerk::drivers::scripted::ScriptedDriver;
use driftwerk::persist::{write_metrics_csv, TranscriptWriter};
use driftwerk::{
    estimate_scenario_cost, AnchorDriftEvaluator, DriftError, Evaluator, MetricRecord, ModelTarget,
    PushbackEvaluator, RunConfig, RunEvent, Scenario, ScenarioOrchestrator,
};

#[derive(Parser)]
#[command(name = "drift-run")]
#[command(about = "Run conversation drift scenarios across models and branches")]
struct Args {
    /// Directory of scenario markdown files
    #[arg(long, default_value = "scenarios")]
    scenarios: PathBuf,

    /// Models to run, as provider/model (e.g. openai/gpt-4o anthropic/claude-3-5-sonnet-latest)
    #[arg(long, required = true, num_args = 1..)]
    models: Vec<String>,

    /// YAML settings file (budget, pricing, retry, sampling)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Output directory for transcripts and metrics
    #[arg(long, default_value = "outputs")]
    out: PathBuf,

    /// Override the budget ceiling in USD
    #[arg(long)]
    budget: Option<f64>,

    /// Override the max in-flight dispatch count
    #[arg(long)]
    concurrency: Option<usize>,

    /// Answer every dispatch from a canned offline driver
    #[arg(long)]
    dry_run: bool,

    /// Start even if the pre-run cost estimate exceeds the budget
    #[arg(long)]
    force: bool,
}

fn build_target(spec: &str, dry_run: bool) -> Result<ModelTarget, DriftError> {
    let (provider, model) = spec
        .split_once('/')
        .ok_or_else(|| DriftError::Config(format!("invalid model spec `{spec}` (use provider/model)")))?;

    if dry_run {
        return Ok(ModelTarget::new(
            model,
            Arc::new(ScriptedDriver::repeating(
                "I understand. Could you tell me more about what happened?",
            )),
        ));
    }

    match provider {
        "openai" => Ok(ModelTarget::new(model, Arc::new(OpenAIDriver::from_env()?))),
        "anthropic" => Ok(ModelTarget::new(
            model,
            Arc::new(AnthropicDriver::from_env()?),
        )),
        other => Err(DriftError::Config(format!("unknown provider `{other}`"))),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = match &args.settings {
        Some(path) => RunConfig::from_yaml_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(budget) = args.budget {
        config.budget_usd = budget;
    }
    if let Some(concurrency) = args.concurrency {
        config.max_in_flight = concurrency;
    }

    let scenarios = Scenario::load_dir(&args.scenarios)?;
    if scenarios.is_empty() {
        eprintln!("No scenarios found in {}", args.scenarios.display());
        std::process::exit(2);
    }
    tracing::info!(count = scenarios.len(), "loaded scenarios");

    let targets: Vec<ModelTarget> = args
        .models
        .iter()
        .map(|spec| build_target(spec, args.dry_run))
        .collect::<Result<_, _>>()?;

    let model_names: Vec<String> = targets.iter().map(|t| t.model.clone()).collect();
    let estimate: f64 = scenarios
        .iter()
        .map(|scenario| estimate_scenario_cost(scenario, &model_names, &config.pricing))
        .sum();
    tracing::info!(
        estimate_usd = estimate,
        budget_usd = config.budget_usd,
        "pre-run cost estimate"
    );
    if estimate > config.budget_usd && !args.force {
        eprintln!(
            "Estimated cost ${estimate:.2} exceeds budget ${:.2}; re-run with --force to proceed",
            config.budget_usd
        );
        std::process::exit(1);
    }

    let out_dir = args
        .out
        .join(chrono::Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string());
    std::fs::create_dir_all(&out_dir)?;
    let transcripts = TranscriptWriter::new(&out_dir)?;

    let mut orchestrator = ScenarioOrchestrator::new(config);
    let mut evaluators: Vec<Arc<dyn Evaluator>> = vec![Arc::new(PushbackEvaluator::new())];
    let embeddings_available = !args.dry_run && std::env::var("OPENAI_API_KEY").is_ok();
    if embeddings_available {
        let embedder = Arc::new(OpenAIDriver::from_env()?);
        evaluators.push(Arc::new(AnchorDriftEvaluator::with_embeddings(
            orchestrator.gate(),
            embedder,
        )));
    } else {
        evaluators.push(Arc::new(AnchorDriftEvaluator::new()));
    }
    orchestrator = orchestrator.with_evaluators(evaluators);

    let mut all_metrics: Vec<MetricRecord> = Vec::new();
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut budget_halted = 0usize;

    for scenario in scenarios {
        let scenario = Arc::new(scenario);
        tracing::info!(scenario = %scenario.name, "running scenario");

        let mut run = orchestrator.run(Arc::clone(&scenario), &targets)?;
        let run_id = run.run_id().to_string();
        while let Some(event) = run.next_event().await {
            match event {
                RunEvent::Metric(record) => all_metrics.push(record),
                RunEvent::Probe(_) => {}
                RunEvent::BranchFinished(report) => {
                    match report.outcome {
                        driftwerk::BranchOutcome::Completed => completed += 1,
                        driftwerk::BranchOutcome::Failed => failed += 1,
                        driftwerk::BranchOutcome::BudgetHalted => budget_halted += 1,
                    }
                    transcripts.write(&run_id, &report)?;
                }
            }
        }
    }

    let metrics_path = out_dir.join("metrics.csv");
    write_metrics_csv(&metrics_path, &all_metrics)?;

    println!("\n=== Summary ===");
    println!("Turns evaluated: {}", all_metrics.len());
    println!(
        "Branch runs: {} completed, {} failed, {} budget-halted",
        completed, failed, budget_halted
    );
    println!(
        "Spend: ${:.4}",
        orchestrator.budget().current_spend()
    );
    println!("Output saved to: {}", out_dir.display());

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runweave_core::config::AppConfig;
use runweave_core::error::RunweaveError;
use runweave_core::event::EventBus;
use runweave_core::graph::{GraphNode, StaticGraph};
use runweave_core::traits::{CostEstimator, GraphSource, RunRequest, RunSubmitter};
use runweave_core::types::{BatchId, CostWarning, NodeId, ResultItem, RunEvent, RunStatus};

use runweave_memory::SqliteKvStore;
use runweave_orchestrator::{
    has_enough_credits, plan_recipe_runs, ButtonStatus, CostGate, GateOutcome, GateRequest,
    NodeRunView, PlannedRecipeRun, RunLogger, RunOrchestrator,
};

#[derive(Parser)]
#[command(name = "runweave", version, about = "Run orchestration for generation-node graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "runweave.toml")]
    config: PathBuf,

    /// Session ID used for run logs (auto-generated if not provided)
    #[arg(short, long)]
    session: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the iterators feeding a node's inputs
    Resolve {
        /// Graph JSON with `nodes` and `edges`
        graph: PathBuf,
        node: String,
    },
    /// Show the run request and the recipe runs it expands to
    Plan { graph: PathBuf, node: String },
    /// Feed recorded run events (JSONL) through a node view
    Replay {
        graph: PathBuf,
        node: String,
        events: PathBuf,
    },
    /// Evaluate cost warnings for running a node
    Check {
        graph: PathBuf,
        node: String,
        /// Available credits; checked against the projected cost
        #[arg(long)]
        credits: Option<f64>,
        /// Report warnings without asking for confirmation
        #[arg(long)]
        no_prompt: bool,
    },
    /// Inspect or reset remembered warning choices
    Prefs {
        #[command(subcommand)]
        action: PrefsAction,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum PrefsAction {
    /// Print stored preferences
    Show,
    /// Forget every remembered choice
    Reset,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("runweave=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "runweave", &mut std::io::stdout());
        return Ok(());
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "No config file, using defaults");
        AppConfig::default()
    };

    let session = cli
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    match cli.command {
        None | Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Resolve { graph, node }) => {
            let orch = offline_orchestrator(&config, &graph)?;
            match orch.preceding_iterators(&NodeId::from(node.as_str())) {
                Some(bindings) => println!("{}", serde_json::to_string_pretty(&bindings)?),
                None => println!("No iterators feed {}", node),
            }
        }
        Some(Commands::Plan { graph, node }) => {
            let orch = offline_orchestrator(&config, &graph)?;
            let node_id = NodeId::from(node.as_str());
            let request = orch.plan(&node_id)?;
            let bindings = orch.preceding_iterators(&node_id).unwrap_or_default();
            let plan = PlanOutput {
                request,
                recipe_runs: plan_recipe_runs(&bindings)?,
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Some(Commands::Replay {
            graph,
            node,
            events,
        }) => {
            replay(&config, &session, &graph, &node, &events).await?;
        }
        Some(Commands::Check {
            graph,
            node,
            credits,
            no_prompt,
        }) => {
            check(&config, &graph, &node, credits, no_prompt).await?;
        }
        Some(Commands::Prefs { action }) => {
            let store = SqliteKvStore::open(&config.preferences_path())?;
            let gate = CostGate::new(
                config.cost.warning_threshold,
                Arc::new(store),
                Arc::new(FlatCostEstimator::from_config(&config)),
            );
            match action {
                PrefsAction::Show => {
                    println!("{}", serde_json::to_string_pretty(&gate.preferences().snapshot()?)?);
                }
                PrefsAction::Reset => {
                    gate.preferences().reset()?;
                    println!("Warning preferences reset.");
                }
            }
        }
        Some(Commands::Completions { .. }) => {}
    }

    Ok(())
}

#[derive(Serialize)]
struct PlanOutput {
    request: RunRequest,
    recipe_runs: Vec<PlannedRecipeRun>,
}

#[derive(Serialize)]
struct ReplaySummary {
    node_id: NodeId,
    status: Option<RunStatus>,
    button: ButtonStatus,
    progress: Option<String>,
    error: Option<String>,
    results: Vec<ResultItem>,
}

/// Submitter for commands that never reach an execution service.
struct OfflineSubmitter;

impl RunSubmitter for OfflineSubmitter {
    fn submit_run(&self, _request: RunRequest) -> BoxFuture<'_, runweave_core::Result<Option<BatchId>>> {
        Box::pin(async {
            Err(RunweaveError::Submission(
                "no execution service is configured".into(),
            ))
        })
    }

    fn cancel_batch(&self, batch_id: &BatchId) -> BoxFuture<'_, runweave_core::Result<()>> {
        let batch_id = batch_id.to_string();
        Box::pin(async move {
            Err(RunweaveError::Cancel {
                batch_id,
                message: "no execution service is configured".into(),
            })
        })
    }
}

/// Projects `per_run_estimate` for every model node over every combination.
struct FlatCostEstimator {
    per_run: Option<f64>,
}

impl FlatCostEstimator {
    fn from_config(config: &AppConfig) -> Self {
        Self {
            per_run: config.cost.per_run_estimate,
        }
    }
}

impl CostEstimator for FlatCostEstimator {
    fn estimate_cost(
        &self,
        nodes: &[GraphNode],
        combinations: u64,
    ) -> BoxFuture<'_, runweave_core::Result<f64>> {
        let count = nodes.iter().filter(|n| n.is_model()).count() as f64;
        Box::pin(async move {
            let per_run = self.per_run.ok_or_else(|| {
                RunweaveError::CostEstimate("cost.per_run_estimate is not set".into())
            })?;
            Ok(per_run * count * combinations as f64)
        })
    }
}

fn offline_orchestrator(config: &AppConfig, graph: &Path) -> anyhow::Result<RunOrchestrator> {
    let graph = StaticGraph::load(graph)?;
    let event_bus = Arc::new(EventBus::new(config.orchestrator.event_bus_capacity));
    Ok(RunOrchestrator::new(
        Arc::new(OfflineSubmitter),
        Arc::new(FlatCostEstimator::from_config(config)),
        Arc::new(graph),
    )
    .with_event_bus(event_bus))
}

fn read_events(path: &Path) -> anyhow::Result<Vec<RunEvent>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open events file {}", path.display()))?;
    let mut events = Vec::new();
    for (index, line) in io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: RunEvent = serde_json::from_str(&line)
            .with_context(|| format!("Invalid run event on line {}", index + 1))?;
        events.push(event);
    }
    Ok(events)
}

async fn replay(
    config: &AppConfig,
    session: &str,
    graph: &Path,
    node: &str,
    events: &Path,
) -> anyhow::Result<()> {
    let events = read_events(events)?;
    let orch = Arc::new(offline_orchestrator(config, graph)?);
    let node_id = NodeId::from(node);
    if orch.graph().node(&node_id).is_none() {
        return Err(RunweaveError::NodeNotFound(node.to_string()).into());
    }

    let cancel = CancellationToken::new();
    let logger = match &config.log {
        Some(log) if log.enabled => {
            let logger = RunLogger::new(config.log_dir(), log.level);
            let rx = orch.event_bus().subscribe();
            Some(tokio::spawn(logger.run(rx, session.to_string(), cancel.clone())))
        }
        _ => None,
    };

    let view = NodeRunView::mount(orch.clone(), node_id.clone());
    let mut applied = 0usize;
    for event in &events {
        if orch.apply_event(event).is_some() {
            applied += 1;
        }
    }
    info!(total = events.len(), applied, "Replay finished");

    cancel.cancel();
    if let Some(handle) = logger {
        if let Err(e) = handle.await {
            warn!(error = %e, "Run logger task failed");
        }
    }

    let summary = ReplaySummary {
        node_id,
        status: view.status(),
        button: view.button_status(),
        progress: view.progress(),
        error: view.error(),
        results: view.results(),
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn check(
    config: &AppConfig,
    graph: &Path,
    node: &str,
    credits: Option<f64>,
    no_prompt: bool,
) -> anyhow::Result<()> {
    let orch = offline_orchestrator(config, graph)?;
    let node_id = NodeId::from(node);
    let graph_node = orch
        .graph()
        .node(&node_id)
        .ok_or_else(|| RunweaveError::NodeNotFound(node.to_string()))?;
    let bindings = orch.preceding_iterators(&node_id);
    let request = GateRequest::for_node(&graph_node, bindings.as_deref());

    let store = SqliteKvStore::open(&config.preferences_path())?;
    let gate = CostGate::new(
        config.cost.warning_threshold,
        Arc::new(store),
        Arc::new(FlatCostEstimator::from_config(config)),
    )
    .with_event_bus(orch.event_bus().clone());

    let cost = orch
        .batch_cost(std::slice::from_ref(&graph_node), request.combinations)
        .await
        .ok();
    if !has_enough_credits(credits, cost, request.model_price) {
        println!(
            "Not enough credits: {:.2} available, {:.2} needed.",
            credits.unwrap_or_default(),
            cost.or(request.model_price).unwrap_or_default()
        );
        return Ok(());
    }

    let warning = match gate.evaluate(&request).await {
        GateOutcome::Proceed => {
            println!("{} can run ({} combinations).", node, request.combinations);
            return Ok(());
        }
        GateOutcome::Blocked(warning) => warning,
    };

    match &warning {
        CostWarning::PricyModel { model_name, price } => {
            println!("{} costs {:.2} per run.", model_name, price);
        }
        CostWarning::ExpensiveRun {
            model_name,
            cost,
            combinations,
            iterator_values,
        } => {
            println!(
                "{} over {} combinations ({} iterator values) is projected at {:.2}.",
                model_name, combinations, iterator_values, cost
            );
        }
    }
    if no_prompt {
        return Ok(());
    }

    let proceed = tokio::task::spawn_blocking(|| {
        let proceed = dialoguer::Confirm::new()
            .with_prompt("Run anyway?")
            .default(false)
            .interact()
            .unwrap_or(false);
        let remember = proceed
            && dialoguer::Confirm::new()
                .with_prompt("Don't warn again?")
                .default(false)
                .interact()
                .unwrap_or(false);
        (proceed, remember)
    })
    .await?;

    match (proceed, &warning) {
        ((true, true), CostWarning::PricyModel { model_name, .. }) => {
            gate.remember_model_choice(model_name, true)?;
            println!("Won't warn about {} again.", model_name);
        }
        ((true, true), CostWarning::ExpensiveRun { .. }) => {
            gate.remember_expensive_runs(true)?;
            println!("Won't warn about expensive runs again.");
        }
        ((true, false), _) => println!("Proceeding once."),
        ((false, _), _) => println!("Run skipped."),
    }
    Ok(())
}

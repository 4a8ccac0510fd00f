//! CLI binary for validating, planning and simulating Phaseflow pipelines.

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use phaseflow_pipeline::{validate, PipelineDefinition, Severity};

#[derive(Parser)]
#[command(name = "phaseflow", version, about = "Phase-ordered interceptor chain planner and simulator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Print the execution plan grouped by phase
    Plan {
        /// Path to the pipeline .json file
        pipeline: PathBuf,
    },

    /// Run the declared steps with their scripted behaviour
    Simulate {
        /// Path to the pipeline .json file
        pipeline: PathBuf,

        /// Longest a suspended chain may wait for its resume before it is aborted.
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG wins over -v.
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { pipeline } => {
            cmd_validate(&pipeline)?;
        }
        Commands::Plan { pipeline } => {
            cmd_plan(&pipeline)?;
        }
        Commands::Simulate {
            pipeline,
            timeout_ms,
            json,
        } => {
            cmd_simulate(&pipeline, Duration::from_millis(timeout_ms), json).await?;
        }
    }

    Ok(())
}

fn load_pipeline(path: &Path) -> anyhow::Result<PipelineDefinition> {
    Ok(PipelineDefinition::load(path)?)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let definition = load_pipeline(path)?;
    let diagnostics = validate(&definition);

    if diagnostics.is_empty() {
        println!("Pipeline is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        match &diag.step_id {
            Some(step) => println!("[{}] {} ({}): {}", severity, diag.rule, step, diag.message),
            None => println!("[{}] {}: {}", severity, diag.rule, diag.message),
        }
        if let Some(fix) = &diag.fix {
            println!("        fix: {fix}");
        }
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_plan(path: &Path) -> anyhow::Result<()> {
    let definition = Arc::new(load_pipeline(path)?);
    let trace: simulate::Trace = Arc::default();
    let sink = Arc::new(simulate::CollectingSink::default());
    let chain = simulate::build_chain(&definition, &trace, sink)?;

    println!("Pipeline: {}", definition.name);
    let registry = chain.registry();
    println!("Phases: {}", registry.len());
    if let Some(fault_phase) = registry.fault_phase() {
        println!("Fault phase: {fault_phase}");
    }

    let plan = chain.plan_ids();
    println!("Steps: {}", plan.len());
    println!("\n{}", chain.describe());

    let conflicts = chain.ordering_conflicts();
    if !conflicts.is_empty() {
        println!("\nOrdering conflicts:");
        for conflict in &conflicts {
            println!("  {conflict}");
        }
    }

    let deferred: Vec<_> = definition
        .steps
        .iter()
        .filter(|s| s.deferred)
        .map(|s| s.id.as_str())
        .collect();
    if !deferred.is_empty() {
        println!("\nDeferred (added at run time): {}", deferred.join(", "));
    }
    Ok(())
}

async fn cmd_simulate(path: &Path, timeout: Duration, json: bool) -> anyhow::Result<()> {
    let definition = Arc::new(load_pipeline(path)?);
    let report = simulate::simulate(definition, timeout).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Pipeline: {}", report.pipeline);
    println!("Plan: {}", report.plan.join(" -> "));
    println!("\nTrace:");
    for event in &report.trace {
        println!("  {event}");
    }
    println!("\nState: {}", report.state);
    if report.resumes > 0 {
        println!("Resumes: {}", report.resumes);
    }
    if let Some(fault) = &report.fault {
        println!("Fault: {fault}");
    }
    if !report.sink_deliveries.is_empty() {
        println!("Fault sink deliveries: {}", report.sink_deliveries.len());
    }
    Ok(())
}

//! ScriptBench entry point.
//!
//! Loads the task corpus, builds the selected inference backend, runs every
//! task sequentially, and prints a summary. Tracing goes to stderr and to
//! the run directory's log file; per-task records land beside it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use scriptbench::agent::{AgentBackend, AgentConfig};
use scriptbench::backend::{BackendKind, InferenceBackend, SingleShotBackend};
use scriptbench::exec::ProcessExecutor;
use scriptbench::model::OpenAiChatModel;
use scriptbench::orchestrator::Orchestrator;
use scriptbench::runlog::{resolve_logs_root, RunLogger};
use scriptbench::schema::RunSummary;
use scriptbench::task::TaskLoader;

#[derive(Debug, Parser)]
#[command(name = "scriptbench")]
#[command(about = "Benchmark harness for code-generating agents", long_about = None)]
struct Cli {
    /// Directory containing task spec files (YAML or JSON).
    #[arg(long, default_value = "tasks")]
    tasks_dir: PathBuf,

    /// Directory containing task asset files.
    #[arg(long, default_value = "files")]
    files_dir: PathBuf,

    /// Directory containing agent-seeded assets (defaults to --files-dir).
    #[arg(long)]
    agent_files_dir: Option<PathBuf>,

    /// Directory for run logs (default: SCRIPTBENCH_LOGS_DIR chain).
    #[arg(long)]
    logs_dir: Option<String>,

    /// Run a single task by name (spec-file stem).
    #[arg(long)]
    task: Option<String>,

    /// Inference backend: single-shot | agent | agent-iter
    /// (default: env SCRIPTBENCH_INFERENCE_BACKEND or single-shot).
    #[arg(long)]
    backend: Option<String>,

    /// YAML config file for the agent backends.
    #[arg(long)]
    agent_config: Option<PathBuf>,

    /// Write the full results array to this JSON file as well.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("scriptbench failed: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let logs_root = resolve_logs_root(cli.logs_dir.as_deref());
    std::fs::create_dir_all(&logs_root)
        .with_context(|| format!("create logs root {}", logs_root.display()))?;
    let run_logger = RunLogger::create(&logs_root)?;

    init_tracing(cli.verbose, &run_logger)?;

    if !cli.tasks_dir.is_dir() {
        anyhow::bail!("tasks directory not found: {}", cli.tasks_dir.display());
    }
    if !cli.files_dir.is_dir() {
        anyhow::bail!("files directory not found: {}", cli.files_dir.display());
    }

    let mut tasks = TaskLoader::load_tasks(&cli.tasks_dir)?;
    tracing::info!(count = tasks.len(), dir = %cli.tasks_dir.display(), "tasks loaded");
    if let Some(name) = &cli.task {
        tasks.retain(|t| &t.id == name);
        if tasks.is_empty() {
            anyhow::bail!("task '{name}' not found in {}", cli.tasks_dir.display());
        }
        tracing::info!(task = %name, "running single task");
    }

    let backend_name = cli
        .backend
        .clone()
        .or_else(|| std::env::var("SCRIPTBENCH_INFERENCE_BACKEND").ok())
        .unwrap_or_else(|| "single-shot".to_string());
    let kind = BackendKind::parse(&backend_name)?;
    let mut backend = build_backend(&cli, kind)?;

    let orchestrator = Orchestrator::new(cli.files_dir.clone(), run_logger);
    let results = orchestrator.run_all(&tasks, backend.as_mut());

    let model_name = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4".to_string());
    let summary = RunSummary::from_results(&results, &model_name, kind.as_str());
    orchestrator.run_logger.save_summary(&summary)?;

    if let Some(output) = &cli.output {
        let contents = serde_json::to_string_pretty(&results)?;
        std::fs::write(output, contents)
            .with_context(|| format!("write results to {}", output.display()))?;
    }

    print_summary(&results, &summary, &orchestrator.run_logger.run_dir);
    Ok(())
}

fn build_backend(cli: &Cli, kind: BackendKind) -> Result<Box<dyn InferenceBackend>> {
    let model = Box::new(OpenAiChatModel::from_env()?);
    match kind {
        BackendKind::SingleShot => Ok(Box::new(SingleShotBackend::new(model))),
        BackendKind::Agent | BackendKind::AgentIterative => {
            let config = match &cli.agent_config {
                Some(path) => AgentConfig::load(path)?,
                None => AgentConfig::default(),
            };
            let agent_assets = cli
                .agent_files_dir
                .clone()
                .unwrap_or_else(|| cli.files_dir.clone());
            Ok(Box::new(AgentBackend::new(
                model,
                config,
                kind == BackendKind::AgentIterative,
                agent_assets,
                ProcessExecutor::new(),
            )))
        }
    }
}

/// Logs go to stderr and to the run directory's log file.
fn init_tracing(verbose: u8, run_logger: &RunLogger) -> Result<()> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_file = std::fs::File::create(run_logger.log_file_path())
        .with_context(|| format!("create log file {}", run_logger.log_file_path().display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(log_file)),
        )
        .init();
    Ok(())
}

fn print_summary(
    results: &[scriptbench::schema::TaskResult],
    summary: &RunSummary,
    run_dir: &std::path::Path,
) {
    println!("\n=== Benchmark Results ===");
    println!("Tasks completed: {}", summary.total_tasks);
    println!("Tasks passed: {}", summary.passed);
    println!("Tasks failed: {}", summary.failed);
    println!("Success rate: {:.1}%", summary.pass_percentage);
    println!("Detailed logs saved to: {}", run_dir.display());

    println!("\nTask Results:");
    for result in results {
        let status = if result.passed { "PASSED" } else { "FAILED" };
        println!("  {}: {status}", result.task_id);
        if let Some(error) = &result.error {
            println!("    Error: {error}");
        }
    }
}

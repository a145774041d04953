//! # boxrun-cli
//!
//! Binary entry point for boxrun.
//!
//! This crate provides:
//! - `boxrun run`, the controlling side: starts one container for a prompt or
//!   a pipeline plan, renders its output stream and reports the outcome
//! - `boxrun pipeline`, the container side: executes the plan shipped in
//!   `$BOXRUN_PLAN` against `/workspace`
//!
//! Logs always go to stderr; inside the container stdout carries the event
//! stream.

use anyhow::{Context, Result, bail};
use boxrun_adapters::{
    ConsoleStreamHandler, DockerCli, FanOut, MetricsCollector, PLAN_ENV, QuietStreamHandler,
    RunSpec, Supervisor,
};
use boxrun_core::{
    AgentConfig, AgentTaskRunner, CleanupPolicy, Error, PipelineEngine, PipelinePlan, RunConfig,
    WorkspaceManager,
};
use boxrun_proto::{EventEmitter, Status};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// boxrun - run an autonomous coding agent in an ephemeral container
#[derive(Parser, Debug)]
#[command(name = "boxrun", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a prompt or a pipeline plan in a fresh container
    Run(RunArgs),

    /// Execute a pipeline plan in this environment (used inside the container)
    Pipeline(PipelineArgs),
}

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "boxrun.yml")]
    config: PathBuf,

    /// Inline prompt text
    #[arg(short = 'p', long = "prompt-text", conflicts_with_all = ["prompt_file", "plan"])]
    prompt_text: Option<String>,

    /// Prompt file path
    #[arg(short = 'P', long = "prompt-file", conflicts_with_all = ["prompt_text", "plan"])]
    prompt_file: Option<PathBuf>,

    /// Pipeline plan file (YAML)
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Override the container image
    #[arg(long)]
    image: Option<String>,

    /// Override the workspace directory
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Override the idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Suppress progress output
    #[arg(short, long)]
    quiet: bool,

    /// Write the run record and metrics to this file as JSON
    #[arg(long)]
    record: Option<PathBuf>,
}

/// Arguments for the pipeline subcommand.
#[derive(Parser, Debug)]
struct PipelineArgs {
    /// Plan file (defaults to the JSON plan in $BOXRUN_PLAN)
    #[arg(long)]
    plan: Option<PathBuf>,

    /// Workspace root
    #[arg(long, default_value = "/workspace")]
    workspace: PathBuf,

    /// Where private task copies are made
    #[arg(long, default_value = "/tmp/boxrun-worktrees")]
    scratch: PathBuf,

    /// When to delete worktree copies
    #[arg(long, value_enum, default_value_t = CleanupArg::Never)]
    cleanup: CleanupArg,

    /// Agent CLI command
    #[arg(long)]
    agent: Option<String>,

    /// Agent CLI argument, repeatable
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    agent_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CleanupArg {
    Always,
    OnSuccess,
    Never,
}

impl From<CleanupArg> for CleanupPolicy {
    fn from(arg: CleanupArg) -> Self {
        match arg {
            CleanupArg::Always => CleanupPolicy::Always,
            CleanupArg::OnSuccess => CleanupPolicy::OnSuccess,
            CleanupArg::Never => CleanupPolicy::Never,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run_command(args, cli.verbose).await,
        Commands::Pipeline(args) => pipeline_command(args).await,
    };

    match result {
        Ok(status) => std::process::exit(exit_code(status)),
        Err(e) => {
            eprintln!("boxrun: {} error: {e:#}", error_category(&e));
            std::process::exit(1);
        }
    }
}

async fn run_command(args: RunArgs, verbose: bool) -> Result<Status> {
    let mut config = if args.config.exists() {
        RunConfig::from_file(&args.config)
            .map_err(Error::from)
            .with_context(|| format!("Failed to load config from {}", args.config.display()))?
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
        RunConfig::default()
    };

    // CLI overrides take final precedence
    if let Some(image) = args.image {
        config.image = image;
    }
    if let Some(workspace) = args.workspace {
        config.workspace = workspace;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = secs;
    }
    config.verbose |= verbose;

    let warnings = config
        .validate()
        .map_err(Error::from)
        .context("Configuration validation failed")?;
    for warning in &warnings {
        warn!("{warning}");
    }

    let spec = if let Some(plan_path) = &args.plan {
        let plan = PipelinePlan::from_file(plan_path)
            .map_err(Error::from)
            .with_context(|| format!("Failed to load plan from {}", plan_path.display()))?;
        info!(
            stages = plan.stages.len(),
            tasks = plan.task_count(),
            "Loaded pipeline plan"
        );
        RunSpec::pipeline(&config, &plan).map_err(Error::from)?
    } else {
        let prompt = match (args.prompt_text, args.prompt_file) {
            (Some(text), _) => text,
            (None, Some(path)) => std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file {}", path.display()))?,
            (None, None) => bail!("Nothing to run: pass --prompt-text, --prompt-file or --plan"),
        };
        RunSpec::single_prompt(&config, &prompt)
    };
    debug!(command = ?spec.command.first(), policy = ?spec.policy, "Prepared run");

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let supervisor = Supervisor::new(Arc::new(DockerCli::default()));
    let (mut lines, handle) = supervisor.start_run(spec, cancel).await?;
    info!(run_id = %handle.run_id(), image = %config.image, "Run started");

    let metrics = MetricsCollector::new();
    let mut fan_out = FanOut::new().with(metrics.clone());
    fan_out = if args.quiet {
        fan_out.with(QuietStreamHandler)
    } else {
        fan_out.with(ConsoleStreamHandler::stdout(config.verbose))
    };
    let renderer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            fan_out.handle(&line);
        }
    });

    let outcome = handle.wait().await?;
    if let Err(e) = renderer.await {
        warn!(error = %e, "Progress renderer failed");
    }

    let status = outcome.status();
    let run_metrics = metrics.snapshot();
    info!(
        run_id = %outcome.run.id,
        status = %status,
        exit_code = ?outcome.exit_code,
        tokens = run_metrics.usage.total_tokens(),
        cost_usd = run_metrics.cost_usd,
        tool_calls = run_metrics.tool_calls,
        "Run complete"
    );

    if let Some(path) = &args.record {
        let record = serde_json::json!({
            "run": outcome.run,
            "exit_code": outcome.exit_code,
            "metrics": run_metrics,
        });
        std::fs::write(path, serde_json::to_string_pretty(&record)?)
            .with_context(|| format!("Failed to write run record to {}", path.display()))?;
    }

    if let Some(e) = &outcome.error {
        eprintln!("boxrun: {} error: {e}", e.category());
    }
    Ok(status)
}

async fn pipeline_command(args: PipelineArgs) -> Result<Status> {
    let plan = match &args.plan {
        Some(path) => PipelinePlan::from_file(path)
            .map_err(Error::from)
            .with_context(|| format!("Failed to load plan from {}", path.display()))?,
        None => {
            let json = std::env::var(PLAN_ENV)
                .with_context(|| format!("No --plan given and ${PLAN_ENV} is not set"))?;
            PipelinePlan::from_json(&json)
                .map_err(Error::from)
                .context("Invalid plan")?
        }
    };

    let workspaces =
        WorkspaceManager::new(args.workspace, args.scratch).with_cleanup(args.cleanup.into());
    let runner = AgentTaskRunner::new(agent_config(args.agent, args.agent_args));
    let engine = PipelineEngine::new(plan, Arc::new(runner), workspaces, EventEmitter::stdout())
        .map_err(Error::from)?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let report = engine.run(cancel).await;
    info!(
        status = %report.status,
        tokens = report.usage.total_tokens(),
        "Pipeline finished"
    );
    Ok(report.status)
}

/// Cancels `cancel` on SIGINT, and on SIGTERM where supported.
fn spawn_interrupt_handler(cancel: CancellationToken) {
    let on_sigint = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received (SIGINT), cancelling run...");
            on_sigint.cancel();
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                warn!("SIGTERM received, cancelling run...");
                cancel.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to register SIGTERM handler"),
        }
    });
}

fn agent_config(command: Option<String>, args: Vec<String>) -> AgentConfig {
    let defaults = AgentConfig::default();
    AgentConfig {
        command: command.unwrap_or(defaults.command),
        args: if args.is_empty() { defaults.args } else { args },
    }
}

fn exit_code(status: Status) -> i32 {
    match status {
        Status::Succeeded => 0,
        Status::TimedOut => 2,
        Status::Cancelled => 130,
        _ => 1,
    }
}

fn error_category(error: &anyhow::Error) -> &'static str {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<Error>())
        .map_or("fatal", Error::category)
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxrun_core::ConfigError;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(Status::Succeeded), 0);
        assert_eq!(exit_code(Status::Failed), 1);
        assert_eq!(exit_code(Status::TimedOut), 2);
        assert_eq!(exit_code(Status::Cancelled), 130);
    }

    #[test]
    fn test_pipeline_args_accept_hyphenated_agent_args() {
        let cli = Cli::try_parse_from([
            "boxrun",
            "pipeline",
            "--agent=claude",
            "--agent-arg=--output-format",
            "--agent-arg=stream-json",
            "--verbose",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Pipeline(args) = cli.command else {
            panic!("expected pipeline subcommand");
        };
        let agent = agent_config(args.agent, args.agent_args);
        assert_eq!(agent.command, "claude");
        assert_eq!(agent.args, vec!["--output-format", "stream-json"]);
        assert_eq!(args.workspace, PathBuf::from("/workspace"));
    }

    #[test]
    fn test_agent_config_defaults() {
        let agent = agent_config(None, Vec::new());
        assert_eq!(agent.command, AgentConfig::default().command);
        assert_eq!(agent.args, AgentConfig::default().args);
    }

    #[test]
    fn test_prompt_and_plan_conflict() {
        let result = Cli::try_parse_from(["boxrun", "run", "-p", "hi", "--plan", "plan.yml"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_category_through_context() {
        let err = anyhow::Error::new(Error::from(ConfigError::MissingField("image".to_string())))
            .context("Configuration validation failed");
        assert_eq!(error_category(&err), "configuration");
        assert_eq!(error_category(&anyhow::anyhow!("boom")), "fatal");
    }
}

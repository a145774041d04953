//! Task execution.
//!
//! The engine hands each admitted task to a [`TaskRunner`]. The production
//! runner spawns the agent CLI in the task's workspace and forwards its output
//! line by line onto the shared event stream.

use crate::cascade::ResolvedAttributes;
use crate::config::AgentConfig;
use crate::idle::ActivityMonitor;
use crate::plan::Verbosity;
use async_trait::async_trait;
use boxrun_proto::{
    Decoded, EventCodec, EventEmitter, ExtractionPolicy, FinalResult, FinalResultTracker, Status,
    Usage,
};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Time the agent gets to exit after SIGTERM before it is killed.
const AGENT_STOP_GRACE: Duration = Duration::from_secs(3);

/// Everything a runner needs to execute one task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub stage_id: String,
    pub task_id: String,
    pub prompt: String,
    pub attributes: ResolvedAttributes,
    /// Directory the task operates in.
    pub workspace: PathBuf,
    /// Must be touched on every unit of output.
    pub activity: ActivityMonitor,
    pub emitter: EventEmitter,
    /// Cancelled when the engine gives up on the task (idle timeout, fail-fast
    /// sibling failure, or user interrupt).
    pub cancel: CancellationToken,
}

/// What a runner reports back. The engine owns timeout and cancellation
/// verdicts, so runners only ever report success or failure.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub status: Status,
    pub usage: Option<Usage>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(usage: Option<Usage>) -> Self {
        Self {
            status: Status::Succeeded,
            usage,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Status::Failed,
            usage: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn with_usage(mut self, usage: Option<Usage>) -> Self {
        self.usage = usage;
        self
    }
}

/// Executes one task to completion.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome;
}

/// Runs each task as an agent CLI subprocess.
#[derive(Debug, Clone)]
pub struct AgentTaskRunner {
    agent: AgentConfig,
}

impl AgentTaskRunner {
    pub fn new(agent: AgentConfig) -> Self {
        Self { agent }
    }

    fn build_command(&self, ctx: &TaskContext) -> Command {
        let mut command = Command::new(&self.agent.command);
        command
            .args(&self.agent.args)
            .arg("--model")
            .arg(&ctx.attributes.model)
            .arg("-p")
            .arg(&ctx.prompt)
            .current_dir(&ctx.workspace)
            .env("BOXRUN_STAGE", &ctx.stage_id)
            .env("BOXRUN_TASK", &ctx.task_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Forwards both output pipes until they close, feeding the tracker.
    async fn forward_output<O, E>(
        ctx: &TaskContext,
        stdout: Option<O>,
        stderr: Option<E>,
        tracker: &mut FinalResultTracker,
    ) where
        O: AsyncRead + Unpin,
        E: AsyncRead + Unpin,
    {
        let mut out = stdout.map(|s| BufReader::new(s).lines());
        let mut err = stderr.map(|s| BufReader::new(s).lines());
        let forward_stderr = ctx.attributes.verbosity != Verbosity::Quiet;
        let trace_lines = ctx.attributes.verbosity == Verbosity::Verbose;

        while out.is_some() || err.is_some() {
            tokio::select! {
                line = next_line(&mut out) => match line {
                    Some(line) => {
                        ctx.activity.touch();
                        if trace_lines {
                            debug!(stage = %ctx.stage_id, task = %ctx.task_id, "agent: {}", line);
                        }
                        if let Decoded::Event(event) = EventCodec::classify(&line) {
                            tracker.observe(&event);
                        }
                        if let Err(e) = ctx.emitter.emit_raw(&line) {
                            warn!(error = %e, "Failed to forward agent output");
                        }
                    }
                    None => out = None,
                },
                line = next_line(&mut err) => match line {
                    Some(line) => {
                        ctx.activity.touch();
                        if forward_stderr && let Err(e) = ctx.emitter.emit_raw(&line) {
                            warn!(error = %e, "Failed to forward agent stderr");
                        }
                    }
                    None => err = None,
                },
            }
        }
    }

    /// SIGTERM, then SIGKILL once the grace period runs out.
    async fn terminate_child(child: &mut Child) {
        if let Some(pid) = child.id() {
            let pid = Pid::from_raw(pid as i32);
            debug!(%pid, "Sending SIGTERM to agent process");
            let _ = kill(pid, Signal::SIGTERM);
        }
        if tokio::time::timeout(AGENT_STOP_GRACE, child.wait())
            .await
            .is_err()
        {
            warn!(
                grace_secs = AGENT_STOP_GRACE.as_secs(),
                "Agent ignored SIGTERM, killing"
            );
            let _ = child.kill().await;
        }
    }
}

/// Next line from an optional reader; pending forever once the reader is gone.
async fn next_line<R>(reader: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(lines) => match lines.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Error reading agent output");
                None
            }
        },
        None => std::future::pending().await,
    }
}

#[async_trait]
impl TaskRunner for AgentTaskRunner {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        let mut command = self.build_command(&ctx);
        debug!(
            stage = %ctx.stage_id,
            task = %ctx.task_id,
            command = %self.agent.command,
            model = %ctx.attributes.model,
            workspace = %ctx.workspace.display(),
            "Spawning agent"
        );

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return TaskOutcome::failed(format!(
                    "failed to spawn '{}': {e}",
                    self.agent.command
                ));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut tracker = FinalResultTracker::new();

        let exit = tokio::select! {
            exit = async {
                Self::forward_output(&ctx, stdout, stderr, &mut tracker).await;
                child.wait().await
            } => exit,
            () = ctx.cancel.cancelled() => {
                Self::terminate_child(&mut child).await;
                return TaskOutcome::failed("agent terminated");
            }
        };

        let result = match tracker.final_result(ExtractionPolicy::SinglePrompt) {
            Some(FinalResult::Agent(result)) => Some(result),
            _ => None,
        };
        let usage = result.as_ref().map(|r| r.usage);

        match exit {
            Ok(status) if !status.success() => {
                TaskOutcome::failed(format!("agent exited with {status}")).with_usage(usage)
            }
            Err(e) => TaskOutcome::failed(format!("failed to wait for agent: {e}")),
            Ok(_) => match result {
                Some(result) if result.is_error() => {
                    TaskOutcome::failed("agent reported an error result").with_usage(usage)
                }
                Some(_) => TaskOutcome::succeeded(usage),
                None => {
                    warn!(
                        stage = %ctx.stage_id,
                        task = %ctx.task_id,
                        "Agent exited cleanly without a result"
                    );
                    TaskOutcome::succeeded(None)
                }
            },
        }
    }
}

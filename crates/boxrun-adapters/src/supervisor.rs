//! Container supervisor.
//!
//! Owns one container's lifecycle on the controlling side:
//! orphan cleanup → create → start → stream → idle watch → teardown.
//!
//! Three things race while a run is live: the next output line, idle
//! expiry, and external cancellation. Whichever fires first drives the next
//! transition. Idle expiry and cancellation share one teardown path that
//! always ends by removing the container.

use crate::run::{Run, short_id, workspace_label};
use crate::runtime::{
    ContainerError, ContainerId, ContainerRuntime, ContainerSpec, RUN_LABEL, RuntimeEvent,
    WORKSPACE_LABEL,
};
use boxrun_core::{Error, ExecutionMode, PipelinePlan, PlanError, RunConfig, idle_watchdog};
use boxrun_proto::{DecodedLine, EventCodec, ExtractionPolicy, FinalResult, FinalResultTracker, Status};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Environment variable carrying the serialized plan into the container.
pub const PLAN_ENV: &str = "BOXRUN_PLAN";

/// Binary invoked inside the container for pipeline runs.
pub const CONTAINER_BINARY: &str = "boxrun";

/// Decoded lines buffered for the caller before output reading pauses.
const LINE_BUFFER: usize = 1024;

/// Extra time a runtime stop call gets beyond its own grace period.
const STOP_CALL_SLACK: Duration = Duration::from_secs(5);

/// What to run and how to supervise it.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub workspace: PathBuf,
    pub mode: ExecutionMode,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub idle_timeout: Duration,
    pub stop_grace: Duration,
    pub policy: ExtractionPolicy,
}

impl RunSpec {
    /// A single agent invocation with `prompt`.
    pub fn single_prompt(config: &RunConfig, prompt: &str) -> Self {
        let mut command = vec![config.agent.command.clone()];
        command.extend(config.agent.args.iter().cloned());
        if let Some(model) = &config.model {
            command.push("--model".to_string());
            command.push(model.clone());
        }
        command.push("-p".to_string());
        command.push(prompt.to_string());
        Self::from_config(config, command, ExtractionPolicy::SinglePrompt)
    }

    /// A pipeline run. The plan is validated and shipped as JSON in
    /// [`PLAN_ENV`]; the agent CLI travels as arguments.
    pub fn pipeline(config: &RunConfig, plan: &PipelinePlan) -> Result<Self, PlanError> {
        plan.validate()?;
        let mut command = vec![
            CONTAINER_BINARY.to_string(),
            "pipeline".to_string(),
            format!("--agent={}", config.agent.command),
        ];
        command.extend(config.agent.args.iter().map(|arg| format!("--agent-arg={arg}")));
        if config.verbose {
            command.push("--verbose".to_string());
        }
        let mut spec = Self::from_config(config, command, ExtractionPolicy::Pipeline);
        spec.env.insert(PLAN_ENV.to_string(), plan.to_json()?);
        Ok(spec)
    }

    fn from_config(config: &RunConfig, command: Vec<String>, policy: ExtractionPolicy) -> Self {
        Self {
            image: config.image.clone(),
            workspace: config.workspace.clone(),
            mode: config.mode,
            env: config.env.clone(),
            command,
            idle_timeout: config.idle_timeout(),
            stop_grace: config.stop_grace(),
            policy,
        }
    }
}

/// How the container output stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited(i64),
    IdleTimeout,
    Cancelled,
    Disconnected(String),
}

/// Final outcome of a run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: Run,
    pub exit_code: Option<i64>,
    pub final_result: Option<FinalResult>,
    /// Set for idle timeouts and infrastructure failures; agent-reported
    /// failures are carried by `final_result` instead.
    pub error: Option<Error>,
}

impl RunOutcome {
    pub fn status(&self) -> Status {
        self.run.status
    }
}

/// Reconciles how the stream ended with the extracted final result.
///
/// A zero exit code without a result is an anomalous success. A non-zero exit
/// code always fails, whatever partial result was seen.
pub fn reconcile(
    termination: &Termination,
    final_result: Option<&FinalResult>,
    idle_timeout: Duration,
) -> (Status, Option<Error>) {
    match termination {
        Termination::Exited(0) => match final_result {
            Some(result) if result.succeeded() => (Status::Succeeded, None),
            Some(_) => (Status::Failed, None),
            None => {
                warn!("Container exited 0 without a final result; treating as success");
                (Status::Succeeded, None)
            }
        },
        Termination::Exited(_) => (Status::Failed, None),
        Termination::IdleTimeout => (
            Status::TimedOut,
            Some(Error::IdleTimeout {
                secs: idle_timeout.as_secs(),
            }),
        ),
        Termination::Cancelled => (Status::Cancelled, None),
        Termination::Disconnected(reason) => {
            (Status::Failed, Some(Error::Infrastructure(reason.clone())))
        }
    }
}

/// Handle to a live run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Requests cancellation; teardown runs on the supervising task.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the container to exit or for teardown to finish.
    pub async fn wait(self) -> Result<RunOutcome, Error> {
        self.join
            .await
            .map_err(|e| Error::Infrastructure(format!("supervisor task failed: {e}")))
    }
}

/// Starts and supervises runs against a container runtime.
#[derive(Clone)]
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    /// Starts a run, returning its decoded output and a wait handle.
    ///
    /// Containers left behind for the same workspace by a crashed run are
    /// removed first. Creation and start failures are fatal and surface
    /// before any run record exists. `cancel` is the external interrupt.
    pub async fn start_run(
        &self,
        spec: RunSpec,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Receiver<DecodedLine>, RunHandle), Error> {
        let label = workspace_label(&spec.workspace);
        self.remove_orphans(&label).await?;

        let run_id = Uuid::new_v4();
        let container_spec = ContainerSpec {
            name: format!("boxrun-{}", short_id(&run_id)),
            image: spec.image.clone(),
            workspace: spec
                .workspace
                .canonicalize()
                .unwrap_or_else(|_| spec.workspace.clone()),
            mode: spec.mode,
            env: spec.env.clone(),
            labels: BTreeMap::from([
                (WORKSPACE_LABEL.to_string(), label.clone()),
                (RUN_LABEL.to_string(), run_id.to_string()),
            ]),
            command: spec.command.clone(),
        };

        let container = self
            .runtime
            .create(&container_spec)
            .await
            .map_err(lifecycle_error)?;
        info!(run_id = %run_id, container = %container.short(), image = %spec.image, "Container created");

        let guard = Arc::new(ContainerGuard {
            runtime: Arc::clone(&self.runtime),
            id: container.clone(),
            grace: spec.stop_grace,
            done: AtomicBool::new(false),
        });

        let events = match self.runtime.start(&container).await {
            Ok(events) => events,
            Err(e) => {
                guard.teardown().await;
                return Err(lifecycle_error(e));
            }
        };
        info!(run_id = %run_id, container = %container.short(), "Container started");

        let run = Run::start(run_id, label, spec.idle_timeout, container.to_string());
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let cancel = cancel.child_token();
        let join = tokio::spawn(supervise(run, spec, events, tx, guard, cancel.clone()));

        Ok((rx, RunHandle {
            run_id,
            cancel,
            join,
        }))
    }

    async fn remove_orphans(&self, label: &str) -> Result<(), Error> {
        let orphans = self
            .runtime
            .list_by_label(WORKSPACE_LABEL, label)
            .await
            .map_err(lifecycle_error)?;
        for orphan in orphans {
            info!(container = %orphan.short(), workspace = %label, "Removing orphaned container");
            self.runtime
                .remove(&orphan)
                .await
                .map_err(lifecycle_error)?;
        }
        Ok(())
    }
}

fn lifecycle_error(err: ContainerError) -> Error {
    Error::ContainerLifecycle(err.to_string())
}

/// Ensures the container is stopped and removed exactly once.
struct ContainerGuard {
    runtime: Arc<dyn ContainerRuntime>,
    id: ContainerId,
    grace: Duration,
    done: AtomicBool,
}

impl ContainerGuard {
    /// Graceful stop, then kill if that fails or hangs, then remove no
    /// matter what. Later calls are no-ops.
    async fn teardown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let id = &self.id;

        let stopped = tokio::time::timeout(
            self.grace + STOP_CALL_SLACK,
            self.runtime.stop(id, self.grace),
        )
        .await;
        match stopped {
            Ok(Ok(())) => debug!(container = %id.short(), "Container stopped"),
            Ok(Err(e)) => {
                warn!(container = %id.short(), error = %e, "Graceful stop failed, killing");
                self.kill().await;
            }
            Err(_) => {
                warn!(
                    container = %id.short(),
                    grace_secs = self.grace.as_secs(),
                    "Graceful stop timed out, killing"
                );
                self.kill().await;
            }
        }

        match self.runtime.remove(id).await {
            Ok(()) => debug!(container = %id.short(), "Container removed"),
            Err(e) => error!(container = %id.short(), error = %e, "Failed to remove container"),
        }
    }

    async fn kill(&self) {
        if let Err(e) = self.runtime.kill(&self.id).await {
            warn!(container = %self.id.short(), error = %e, "Kill failed");
        }
    }
}

async fn supervise(
    mut run: Run,
    spec: RunSpec,
    mut events: mpsc::Receiver<RuntimeEvent>,
    tx: mpsc::Sender<DecodedLine>,
    guard: Arc<ContainerGuard>,
    cancel: CancellationToken,
) -> RunOutcome {
    let (activity, mut idle) = idle_watchdog();
    let mut codec = EventCodec::new();
    let mut tracker = FinalResultTracker::new();

    let termination = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RuntimeEvent::Output(line)) => {
                    activity.touch();
                    let decoded = codec.decode(&line);
                    tracker.observe_line(&decoded);
                    // A slow reader holds back output; it may also stop
                    // listening altogether and the run still completes.
                    tokio::select! {
                        _ = tx.send(decoded) => {}
                        () = cancel.cancelled() => {
                            info!(run_id = %run.id, "Run cancelled");
                            break Termination::Cancelled;
                        }
                    }
                }
                Some(RuntimeEvent::Activity) => activity.touch(),
                Some(RuntimeEvent::Exited(code)) => break Termination::Exited(code),
                Some(RuntimeEvent::Disconnected(reason)) => break Termination::Disconnected(reason),
                None => break Termination::Disconnected("output stream closed without exit status".to_string()),
            },
            () = idle.expired(spec.idle_timeout) => {
                warn!(
                    run_id = %run.id,
                    timeout_secs = spec.idle_timeout.as_secs(),
                    "No output within idle timeout, cancelling run"
                );
                break Termination::IdleTimeout;
            }
            () = cancel.cancelled() => {
                info!(run_id = %run.id, "Run cancelled");
                break Termination::Cancelled;
            }
        }
    };

    guard.teardown().await;
    drop(tx);

    let final_result = tracker.final_result(spec.policy);
    let (status, error) = reconcile(&termination, final_result.as_ref(), spec.idle_timeout);
    if let Some(e) = &error {
        warn!(run_id = %run.id, category = e.category(), error = %e, "Run failed");
    }
    run.finish(status);
    info!(
        run_id = %run.id,
        status = %status,
        results_seen = tracker.results_seen(),
        "Run finished"
    );

    RunOutcome {
        run,
        exit_code: match termination {
            Termination::Exited(code) => Some(code),
            _ => None,
        },
        final_result,
        error,
    }
}

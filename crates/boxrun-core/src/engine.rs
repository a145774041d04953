//! Pipeline execution engine.
//!
//! Runs inside the container. Stages execute strictly in declaration order;
//! within a stage a bounded worker pool admits tasks in declaration order, at
//! most `max_parallel` at a time. Every stage and task transition is emitted
//! as a `pipeline` event, and the run ends with a single plan-result marker.

use crate::cascade::ResolvedAttributes;
use crate::idle::idle_watchdog;
use crate::plan::{OnError, PipelinePlan, PlanError, StageSpec, TaskSpec};
use crate::report::{PlanReport, StageReport, TaskReport, aggregate_plan, aggregate_stage};
use crate::runner::{TaskContext, TaskOutcome, TaskRunner};
use crate::workspace::{TaskWorkspace, WorkspaceManager};
use boxrun_proto::{EventEmitter, PipelineEvent, PipelinePhase, Status, StreamEvent, Usage};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long an abandoned agent gets to stop before its workspace is released anyway.
const TASK_STOP_GRACE: Duration = Duration::from_secs(5);

/// Drives one validated plan to completion.
pub struct PipelineEngine {
    plan: Arc<PipelinePlan>,
    runner: Arc<dyn TaskRunner>,
    workspaces: Arc<WorkspaceManager>,
    emitter: EventEmitter,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("stages", &self.plan.stages.len())
            .field("workspace_root", &self.workspaces.root())
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Creates an engine, re-validating the plan before anything can start.
    pub fn new(
        plan: PipelinePlan,
        runner: Arc<dyn TaskRunner>,
        workspaces: WorkspaceManager,
        emitter: EventEmitter,
    ) -> Result<Self, PlanError> {
        plan.validate()?;
        Ok(Self {
            plan: Arc::new(plan),
            runner,
            workspaces: Arc::new(workspaces),
            emitter,
        })
    }

    /// Runs every stage and emits the plan-result marker.
    ///
    /// Cancelling `cancel` stops admitting work, cancels running tasks and
    /// skips everything not yet started.
    pub async fn run(&self, cancel: CancellationToken) -> PlanReport {
        let plan_policy = ResolvedAttributes::for_plan(&self.plan).on_error;
        info!(
            stages = self.plan.stages.len(),
            tasks = self.plan.task_count(),
            on_error = ?plan_policy,
            "Starting pipeline"
        );

        let mut stages = Vec::with_capacity(self.plan.stages.len());
        let mut halted = false;

        for stage in &self.plan.stages {
            if halted || cancel.is_cancelled() {
                stages.push(self.skip_stage(stage));
                continue;
            }

            let report = self.run_stage(stage, &cancel).await;
            if report.status != Status::Succeeded {
                if cancel.is_cancelled() {
                    halted = true;
                } else if plan_policy == OnError::FailFast {
                    info!(stage = %stage.id, "Stage did not succeed, skipping remaining stages");
                    halted = true;
                }
            }
            stages.push(report);
        }

        let statuses: Vec<Status> = stages.iter().map(|s| s.status).collect();
        let status = aggregate_plan(&statuses);
        let mut usage = Usage::default();
        for task in stages.iter().flat_map(|s| &s.tasks) {
            if let Some(task_usage) = task.usage {
                usage += task_usage;
            }
        }

        self.emit(PipelineEvent::plan_result(status, usage));
        info!(status = %status, total_tokens = usage.total_tokens(), "Pipeline finished");

        PlanReport {
            status,
            stages,
            usage,
        }
    }

    async fn run_stage(&self, stage: &StageSpec, cancel: &CancellationToken) -> StageReport {
        let policy = ResolvedAttributes::for_stage(&self.plan, stage).on_error;
        let limit = stage.parallelism();
        info!(stage = %stage.id, tasks = stage.tasks.len(), max_parallel = limit, "Stage started");
        self.emit(PipelineEvent::stage(&stage.id, PipelinePhase::Start));
        let started = Instant::now();

        let stage_cancel = cancel.child_token();
        let mut pending: VecDeque<(usize, &TaskSpec)> = stage.tasks.iter().enumerate().collect();
        let mut reports: Vec<Option<TaskReport>> = vec![None; stage.tasks.len()];
        let mut running = JoinSet::new();
        let mut slots = HashMap::new();
        let mut tripped = false;

        loop {
            while !tripped && !stage_cancel.is_cancelled() && running.len() < limit {
                let Some((index, task)) = pending.pop_front() else {
                    break;
                };
                debug!(stage = %stage.id, task = %task.id, "Admitting task");
                let execution = TaskExecution {
                    stage_id: stage.id.clone(),
                    task: task.clone(),
                    attributes: ResolvedAttributes::for_task(&self.plan, stage, task),
                    runner: Arc::clone(&self.runner),
                    workspaces: Arc::clone(&self.workspaces),
                    emitter: self.emitter.clone(),
                    cancel: stage_cancel.clone(),
                };
                let handle = running.spawn(execution.execute());
                slots.insert(handle.id(), index);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let (index, report) = match joined {
                Ok((id, report)) => (slots.remove(&id), report),
                Err(e) => {
                    let index = slots.remove(&e.id());
                    error!(stage = %stage.id, error = %e, "Task panicked");
                    let task_id = index.map_or("?", |i| stage.tasks[i].id.as_str());
                    let report = TaskReport {
                        error: Some(format!("task panicked: {e}")),
                        status: Status::Failed,
                        ..TaskReport::skipped(&stage.id, task_id)
                    };
                    self.emit(
                        PipelineEvent::task(&stage.id, task_id, PipelinePhase::Failed)
                            .with_error(format!("task panicked: {e}")),
                    );
                    (index, report)
                }
            };

            if report.status.is_failure() && policy == OnError::FailFast && !tripped {
                warn!(
                    stage = %stage.id,
                    task = %report.task_id,
                    status = %report.status,
                    "Task failed under fail-fast, cancelling siblings"
                );
                tripped = true;
                stage_cancel.cancel();
            }
            if let Some(index) = index {
                reports[index] = Some(report);
            }
        }

        // Anything still queued was never admitted.
        for (index, task) in pending {
            self.emit(PipelineEvent::task(&stage.id, &task.id, PipelinePhase::Skipped));
            reports[index] = Some(TaskReport::skipped(&stage.id, &task.id));
        }

        let tasks: Vec<TaskReport> = reports
            .into_iter()
            .zip(&stage.tasks)
            .map(|(report, task)| report.unwrap_or_else(|| TaskReport::skipped(&stage.id, &task.id)))
            .collect();
        let statuses: Vec<Status> = tasks.iter().map(|t| t.status).collect();
        let status = aggregate_stage(&statuses);

        let mut event = stage_event(&stage.id, status)
            .with_duration_ms(u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX));
        if status.is_failure() {
            let failed = tasks.iter().filter(|t| t.status.is_failure()).count();
            event = event.with_error(format!("{failed} task(s) failed"));
        }
        self.emit(event);
        info!(stage = %stage.id, status = %status, "Stage finished");

        StageReport {
            stage_id: stage.id.clone(),
            status,
            tasks,
        }
    }

    fn skip_stage(&self, stage: &StageSpec) -> StageReport {
        debug!(stage = %stage.id, "Skipping stage");
        self.emit(PipelineEvent::stage(&stage.id, PipelinePhase::Skipped));
        let tasks = stage
            .tasks
            .iter()
            .map(|task| {
                self.emit(PipelineEvent::task(&stage.id, &task.id, PipelinePhase::Skipped));
                TaskReport::skipped(&stage.id, &task.id)
            })
            .collect();
        StageReport {
            stage_id: stage.id.clone(),
            status: Status::Skipped,
            tasks,
        }
    }

    fn emit(&self, event: PipelineEvent) {
        emit(&self.emitter, event);
    }
}

fn emit(emitter: &EventEmitter, event: PipelineEvent) {
    if let Err(e) = emitter.emit(&StreamEvent::Pipeline(event)) {
        warn!(error = %e, "Failed to emit pipeline event");
    }
}

fn stage_event(stage_id: &str, status: Status) -> PipelineEvent {
    let phase = PipelinePhase::from_status(status).unwrap_or(PipelinePhase::Failed);
    let mut event = PipelineEvent::stage(stage_id, phase);
    event.status = Some(status);
    event
}

/// A runner future the engine has stopped waiting on.
type AbandonedRun = Pin<Box<dyn Future<Output = TaskOutcome> + Send>>;

async fn release_workspace(
    workspaces: &Arc<WorkspaceManager>,
    workspace: TaskWorkspace,
    succeeded: bool,
) {
    if !workspace.is_private() {
        return;
    }
    let workspaces = Arc::clone(workspaces);
    let released =
        tokio::task::spawn_blocking(move || workspaces.release(&workspace, succeeded)).await;
    if let Err(e) = released {
        warn!(error = %e, "Workspace release task failed");
    }
}

async fn drain_abandoned(
    run: AbandonedRun,
    workspaces: Arc<WorkspaceManager>,
    workspace: TaskWorkspace,
    task: String,
) {
    if tokio::time::timeout(TASK_STOP_GRACE, run).await.is_err() {
        warn!(
            task = %task,
            grace_secs = TASK_STOP_GRACE.as_secs(),
            "Abandoned task did not stop in time"
        );
    }
    release_workspace(&workspaces, workspace, false).await;
}

/// One admitted task, owned by its pool slot.
struct TaskExecution {
    stage_id: String,
    task: TaskSpec,
    attributes: ResolvedAttributes,
    runner: Arc<dyn TaskRunner>,
    workspaces: Arc<WorkspaceManager>,
    emitter: EventEmitter,
    cancel: CancellationToken,
}

impl TaskExecution {
    async fn execute(self) -> TaskReport {
        let stage_id = self.stage_id.as_str();
        let task_id = self.task.id.as_str();
        let started = Instant::now();
        emit(
            &self.emitter,
            PipelineEvent::task(stage_id, task_id, PipelinePhase::Start),
        );

        let workspace = match self.prepare_workspace().await {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(stage = %stage_id, task = %task_id, error = %e, "Workspace preparation failed");
                return self.finish(
                    started,
                    Status::Failed,
                    None,
                    Some(format!("workspace preparation failed: {e}")),
                    None,
                );
            }
        };

        let (activity, mut idle) = idle_watchdog();
        let task_cancel = self.cancel.child_token();
        let ctx = TaskContext {
            stage_id: self.stage_id.clone(),
            task_id: self.task.id.clone(),
            prompt: self.task.prompt.clone(),
            attributes: self.attributes.clone(),
            workspace: workspace.path().to_path_buf(),
            activity,
            emitter: self.emitter.clone(),
            cancel: task_cancel.clone(),
        };

        let timeout = self.attributes.idle_timeout();
        let runner = Arc::clone(&self.runner);
        let mut run: AbandonedRun = Box::pin(async move { runner.run(ctx).await });

        let finished = tokio::select! {
            outcome = &mut run => {
                let status = if outcome.status.is_terminal() {
                    outcome.status
                } else {
                    Status::Failed
                };
                Ok((status, outcome.usage, outcome.error))
            }
            () = idle.expired(timeout) => {
                warn!(
                    stage = %stage_id,
                    task = %task_id,
                    timeout_secs = timeout.as_secs(),
                    "Task idle timeout, cancelling"
                );
                Err((
                    Status::TimedOut,
                    Some(format!("no output for {}s", timeout.as_secs())),
                ))
            }
            () = self.cancel.cancelled() => {
                debug!(stage = %stage_id, task = %task_id, "Task cancelled");
                Err((Status::Cancelled, None))
            }
        };

        let kept = self
            .workspaces
            .retains(&workspace, matches!(finished, Ok((Status::Succeeded, _, _))))
            .then(|| workspace.path().to_path_buf());

        match finished {
            Ok((status, usage, error)) => {
                release_workspace(&self.workspaces, workspace, status == Status::Succeeded).await;
                self.finish(started, status, usage, error, kept)
            }
            Err((status, error)) => {
                // The stage does not wait for an abandoned agent. Its workspace
                // is released once the agent has stopped or the grace ran out.
                task_cancel.cancel();
                tokio::spawn(drain_abandoned(
                    run,
                    Arc::clone(&self.workspaces),
                    workspace,
                    format!("{stage_id}/{task_id}"),
                ));
                self.finish(started, status, None, error, kept)
            }
        }
    }

    async fn prepare_workspace(&self) -> Result<TaskWorkspace, String> {
        let workspaces = Arc::clone(&self.workspaces);
        let stage_id = self.stage_id.clone();
        let task_id = self.task.id.clone();
        let mode = self.attributes.workspace;
        tokio::task::spawn_blocking(move || workspaces.prepare(&stage_id, &task_id, mode))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    fn finish(
        &self,
        started: Instant,
        status: Status,
        usage: Option<Usage>,
        error: Option<String>,
        workspace: Option<std::path::PathBuf>,
    ) -> TaskReport {
        let duration = started.elapsed();
        let phase = PipelinePhase::from_status(status).unwrap_or(PipelinePhase::Failed);
        let mut event = PipelineEvent::task(&self.stage_id, &self.task.id, phase)
            .with_duration_ms(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
        event.status = Some(status);
        if let Some(usage) = usage {
            event = event.with_usage(usage);
        }
        if let Some(error) = &error {
            event = event.with_error(error.clone());
        }
        emit(&self.emitter, event);

        info!(
            stage = %self.stage_id,
            task = %self.task.id,
            status = %status,
            duration_ms = duration.as_millis() as u64,
            "Task finished"
        );

        TaskReport {
            stage_id: self.stage_id.clone(),
            task_id: self.task.id.clone(),
            status,
            usage,
            error,
            duration,
            workspace,
        }
    }
}

//! Attribute resolution: task, then stage, then plan defaults, then built-ins.

use crate::plan::{OnError, PipelinePlan, StageSpec, TaskSpec, Verbosity, WorkspaceMode};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "sonnet";
pub const DEFAULT_VERBOSITY: Verbosity = Verbosity::Normal;
pub const DEFAULT_ON_ERROR: OnError = OnError::FailFast;
pub const DEFAULT_WORKSPACE: WorkspaceMode = WorkspaceMode::Shared;
pub const DEFAULT_TASK_IDLE_TIMEOUT_SECS: u64 = 600;

/// Returns the first value present, innermost scope first.
pub fn cascade<T>(task: Option<T>, stage: Option<T>, plan: Option<T>) -> Option<T> {
    task.or(stage).or(plan)
}

/// Fully resolved attributes for one stage or task.
///
/// Computed once at scheduling time and never re-evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttributes {
    pub model: String,
    pub verbosity: Verbosity,
    pub on_error: OnError,
    pub workspace: WorkspaceMode,
    pub idle_timeout_secs: u64,
}

impl ResolvedAttributes {
    /// Plan-level attributes: plan defaults over built-ins.
    pub fn for_plan(plan: &PipelinePlan) -> Self {
        Self::resolve(None, None, plan)
    }

    /// Stage-level attributes: stage, plan, built-ins.
    pub fn for_stage(plan: &PipelinePlan, stage: &StageSpec) -> Self {
        Self::resolve(None, Some(stage), plan)
    }

    /// Task-level attributes: task, stage, plan, built-ins.
    pub fn for_task(plan: &PipelinePlan, stage: &StageSpec, task: &TaskSpec) -> Self {
        Self::resolve(Some(task), Some(stage), plan)
    }

    fn resolve(task: Option<&TaskSpec>, stage: Option<&StageSpec>, plan: &PipelinePlan) -> Self {
        let task = task.map(|t| &t.attributes);
        let stage = stage.map(|s| &s.attributes);
        let plan = &plan.defaults;

        Self {
            model: cascade(
                task.and_then(|a| a.model.clone()),
                stage.and_then(|a| a.model.clone()),
                plan.model.clone(),
            )
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            verbosity: cascade(
                task.and_then(|a| a.verbosity),
                stage.and_then(|a| a.verbosity),
                plan.verbosity,
            )
            .unwrap_or(DEFAULT_VERBOSITY),
            on_error: cascade(
                task.and_then(|a| a.on_error),
                stage.and_then(|a| a.on_error),
                plan.on_error,
            )
            .unwrap_or(DEFAULT_ON_ERROR),
            workspace: cascade(
                task.and_then(|a| a.workspace),
                stage.and_then(|a| a.workspace),
                plan.workspace,
            )
            .unwrap_or(DEFAULT_WORKSPACE),
            idle_timeout_secs: cascade(
                task.and_then(|a| a.idle_timeout_secs),
                stage.and_then(|a| a.idle_timeout_secs),
                plan.idle_timeout_secs,
            )
            .unwrap_or(DEFAULT_TASK_IDLE_TIMEOUT_SECS),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

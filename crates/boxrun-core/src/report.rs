//! Structured outcome of a pipeline run, plus the pure aggregation rules.

use boxrun_proto::{Status, Usage};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Terminal state of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskReport {
    pub stage_id: String,
    pub task_id: String,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    /// Private copy the task ran in, when one was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<PathBuf>,
}

impl TaskReport {
    pub(crate) fn skipped(stage_id: &str, task_id: &str) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            task_id: task_id.to_string(),
            status: Status::Skipped,
            usage: None,
            error: None,
            duration: Duration::ZERO,
            workspace: None,
        }
    }
}

/// Terminal state of one stage and its tasks, in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage_id: String,
    pub status: Status,
    pub tasks: Vec<TaskReport>,
}

impl StageReport {
    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn count(&self, status: Status) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }
}

/// Terminal state of the whole plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub status: Status,
    pub stages: Vec<StageReport>,
    /// Usage summed over every finished task.
    pub usage: Usage,
}

impl PlanReport {
    pub fn stage(&self, stage_id: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage_id == stage_id)
    }

    pub fn task(&self, stage_id: &str, task_id: &str) -> Option<&TaskReport> {
        self.stage(stage_id).and_then(|s| s.task(task_id))
    }

    pub fn succeeded(&self) -> bool {
        self.status == Status::Succeeded
    }
}

/// A stage's status from its tasks' terminal statuses.
///
/// Any failure or timeout fails the stage; otherwise any cancellation cancels
/// it. Skipped tasks only appear next to a failure or a cancellation.
pub fn aggregate_stage(tasks: &[Status]) -> Status {
    if tasks.iter().any(|s| s.is_failure()) {
        Status::Failed
    } else if tasks
        .iter()
        .any(|s| matches!(s, Status::Cancelled | Status::Skipped))
    {
        Status::Cancelled
    } else {
        Status::Succeeded
    }
}

/// The plan's status from its stages' statuses, read in declaration order.
///
/// The first stage that did not succeed decides: a failed stage fails the
/// plan, a cancelled or skipped one cancels it.
pub fn aggregate_plan(stages: &[Status]) -> Status {
    for status in stages {
        match status {
            Status::Succeeded => {}
            Status::Failed | Status::TimedOut => return Status::Failed,
            _ => return Status::Cancelled,
        }
    }
    Status::Succeeded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_stage() {
        use Status::{Cancelled, Failed, Skipped, Succeeded, TimedOut};
        assert_eq!(aggregate_stage(&[Succeeded, Succeeded]), Succeeded);
        assert_eq!(aggregate_stage(&[Succeeded, TimedOut]), Failed);
        assert_eq!(aggregate_stage(&[Failed, Cancelled, Skipped]), Failed);
        assert_eq!(aggregate_stage(&[Succeeded, Cancelled]), Cancelled);
        assert_eq!(aggregate_stage(&[Skipped]), Cancelled);
    }

    #[test]
    fn test_aggregate_plan_in_declaration_order() {
        use Status::{Cancelled, Failed, Skipped, Succeeded};
        assert_eq!(aggregate_plan(&[Succeeded, Succeeded]), Succeeded);
        assert_eq!(aggregate_plan(&[Failed, Skipped, Skipped]), Failed);
        // Continue policy: a later success does not mask an earlier failure.
        assert_eq!(aggregate_plan(&[Failed, Succeeded]), Failed);
        assert_eq!(aggregate_plan(&[Succeeded, Cancelled, Skipped]), Cancelled);
        assert_eq!(aggregate_plan(&[Skipped, Skipped]), Cancelled);
    }
}

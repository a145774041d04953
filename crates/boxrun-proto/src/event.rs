//! Typed stream events carried on a run's combined output.
//!
//! Every line of container output is either one of these events serialized as
//! a JSON object, or arbitrary text. Native events are discriminated by a
//! `kind` field; see [`crate::EventCodec`] for how the agent CLI's own
//! `type`-tagged lines are mapped onto the same set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

/// A decoded lifecycle or result notification.
///
/// Ordering in arrival sequence is significant: consumers must not reorder
/// or batch these across tasks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Agent session initialization.
    System(SystemEvent),
    /// Tool invocation start or completion.
    Tool(ToolEvent),
    /// Todo list status transition.
    Todo(TodoEvent),
    /// Stage/task/plan lifecycle transition emitted by the pipeline engine.
    Pipeline(PipelineEvent),
    /// Terminal outcome of one agent invocation, with usage.
    Result(ResultEvent),
}

impl StreamEvent {
    /// Returns the discriminator value this event serializes with.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::System(_) => "system",
            StreamEvent::Tool(_) => "tool",
            StreamEvent::Todo(_) => "todo",
            StreamEvent::Pipeline(_) => "pipeline",
            StreamEvent::Result(_) => "result",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemEvent {
    pub session_id: String,
    pub model: String,
}

/// Lifecycle phase of a tool invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolPhase {
    Start,
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolEvent {
    pub tool_use_id: String,
    /// Tool name. Completion lines from the agent CLI do not repeat it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub phase: ToolPhase,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TodoEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub content: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<TodoStatus>,
}

/// Execution state of a task, stage or plan.
///
/// `Pending` and `Running` are transient; every other state is terminal and
/// admits no further transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
    Skipped,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Status::Pending | Status::Running)
    }

    /// Failed or timed out. Both trip the `on_error` policy identically.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::TimedOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Succeeded => "succeeded",
            Status::Failed => "failed",
            Status::TimedOut => "timed_out",
            Status::Cancelled => "cancelled",
            Status::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which level of the plan a pipeline event describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineScope {
    Plan,
    Stage,
    Task,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Start,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
    Cancelled,
    /// Terminal marker carrying the whole plan's outcome.
    PlanResult,
}

impl PipelinePhase {
    /// Maps a terminal status onto the phase announcing it.
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Succeeded => Some(PipelinePhase::Succeeded),
            Status::Failed => Some(PipelinePhase::Failed),
            Status::TimedOut => Some(PipelinePhase::TimedOut),
            Status::Cancelled => Some(PipelinePhase::Cancelled),
            Status::Skipped => Some(PipelinePhase::Skipped),
            Status::Pending | Status::Running => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineEvent {
    pub scope: PipelineScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub phase: PipelinePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl PipelineEvent {
    fn new(scope: PipelineScope, phase: PipelinePhase) -> Self {
        Self {
            scope,
            stage_id: None,
            task_id: None,
            phase,
            status: None,
            error: None,
            usage: None,
            duration_ms: None,
        }
    }

    pub fn stage(stage_id: impl Into<String>, phase: PipelinePhase) -> Self {
        Self {
            stage_id: Some(stage_id.into()),
            ..Self::new(PipelineScope::Stage, phase)
        }
    }

    pub fn task(
        stage_id: impl Into<String>,
        task_id: impl Into<String>,
        phase: PipelinePhase,
    ) -> Self {
        Self {
            stage_id: Some(stage_id.into()),
            task_id: Some(task_id.into()),
            ..Self::new(PipelineScope::Task, phase)
        }
    }

    /// The terminal plan outcome marker.
    pub fn plan_result(status: Status, usage: Usage) -> Self {
        Self {
            status: Some(status),
            usage: Some(usage),
            ..Self::new(PipelineScope::Plan, PipelinePhase::PlanResult)
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn is_plan_result(&self) -> bool {
        self.phase == PipelinePhase::PlanResult
    }
}

/// Token usage breakdown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_read_input_tokens
            + self.cache_creation_input_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
    }
}

/// Usage attributed to a single model within one invocation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelUsage {
    #[serde(flatten)]
    pub usage: Usage,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultEvent {
    pub status: ResultStatus,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_usage: BTreeMap<String, ModelUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ResultEvent {
    pub fn is_error(&self) -> bool {
        self.status == ResultStatus::Error
    }
}

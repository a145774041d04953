//! Pipeline plan model and validation.
//!
//! A plan is a versioned, two-level document: an ordered list of stages, each
//! holding an ordered list of tasks. Attributes may be set on the plan
//! (`defaults`), on a stage, or on a task; see [`crate::cascade`] for how they
//! resolve.
//!
//! Validation runs before anything executes. Besides structural checks it is
//! where workspace isolation is enforced: a `shared` task that would run
//! concurrently with siblings must opt in with `read_only` or `shared_write`.

use crate::cascade::ResolvedAttributes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Plan document version understood by this engine.
pub const SUPPORTED_PLAN_VERSION: u32 = 1;

/// Verbosity of a task's agent output on the combined stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Only protocol lines are forwarded.
    Quiet,
    Normal,
    /// Agent stderr is forwarded and every line is traced.
    Verbose,
}

/// What a failure does to the rest of its scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Stop admitting work and skip what remains.
    FailFast,
    /// Record the failure and keep going.
    Continue,
}

/// Filesystem view a task operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceMode {
    /// The single shared workspace tree.
    Shared,
    /// A private writable copy.
    Worktree,
    /// A private copy with write permission removed.
    SnapshotRo,
}

impl WorkspaceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceMode::Shared => "shared",
            WorkspaceMode::Worktree => "worktree",
            WorkspaceMode::SnapshotRo => "snapshot_ro",
        }
    }
}

/// Overridable attributes. Unset fields defer to the enclosing scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<OnError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceMode>,

    /// Per-task liveness window in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

/// The full plan document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelinePlan {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Plan-level attribute defaults.
    #[serde(default)]
    pub defaults: Attributes,

    pub stages: Vec<StageSpec>,
}

fn default_version() -> u32 {
    SUPPORTED_PLAN_VERSION
}

/// One stage of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: String,

    /// Maximum number of tasks running at once. Unset means sequential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,

    #[serde(flatten)]
    pub attributes: Attributes,

    pub tasks: Vec<TaskSpec>,
}

/// One unit of agent work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,

    pub prompt: String,

    #[serde(flatten)]
    pub attributes: Attributes,

    /// Declares that the task never writes to its workspace.
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,

    /// Explicit opt-in to concurrent writes on the shared tree.
    #[serde(default, skip_serializing_if = "is_false")]
    pub shared_write: bool,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

impl PipelinePlan {
    pub fn new(stages: Vec<StageSpec>) -> Self {
        Self {
            version: SUPPORTED_PLAN_VERSION,
            defaults: Attributes::default(),
            stages,
        }
    }

    /// Sets plan-level defaults.
    #[must_use]
    pub fn with_defaults(mut self, defaults: Attributes) -> Self {
        self.defaults = defaults;
        self
    }

    /// Loads and validates a plan from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading pipeline plan");
        let content = std::fs::read_to_string(path_ref)?;
        let plan: Self = serde_yaml::from_str(&content)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Parses and validates a plan from JSON.
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        let plan: Self = serde_json::from_str(json)?;
        plan.validate()?;
        Ok(plan)
    }

    /// Serializes the plan for transport into the container.
    pub fn to_json(&self) -> Result<String, PlanError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn stage(&self, id: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|stage| stage.tasks.len()).sum()
    }

    /// Validates structure and workspace isolation.
    ///
    /// Fails on the first problem found, scanning stages and tasks in
    /// declaration order.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.version != SUPPORTED_PLAN_VERSION {
            return Err(PlanError::UnsupportedVersion(self.version));
        }
        if self.stages.is_empty() {
            return Err(PlanError::EmptyPlan);
        }
        validate_idle_timeout(&self.defaults, "defaults")?;

        let mut stage_ids = HashSet::new();
        for stage in &self.stages {
            validate_id(&stage.id, "stage")?;
            if !stage_ids.insert(stage.id.as_str()) {
                return Err(PlanError::DuplicateId {
                    scope: "stage",
                    id: stage.id.clone(),
                });
            }
            stage.validate(self)?;
        }
        Ok(())
    }
}

impl StageSpec {
    pub fn new(id: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: id.into(),
            max_parallel: None,
            attributes: Attributes::default(),
            tasks,
        }
    }

    #[must_use]
    pub fn max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    #[must_use]
    pub fn on_error(mut self, policy: OnError) -> Self {
        self.attributes.on_error = Some(policy);
        self
    }

    #[must_use]
    pub fn workspace(mut self, mode: WorkspaceMode) -> Self {
        self.attributes.workspace = Some(mode);
        self
    }

    /// Number of tasks allowed to run at once.
    pub fn parallelism(&self) -> usize {
        self.max_parallel.unwrap_or(1).max(1)
    }

    /// Whether any two of this stage's tasks can be running at the same time.
    pub fn is_concurrent(&self) -> bool {
        self.parallelism() > 1 && self.tasks.len() > 1
    }

    fn validate(&self, plan: &PipelinePlan) -> Result<(), PlanError> {
        if self.tasks.is_empty() {
            return Err(PlanError::EmptyStage(self.id.clone()));
        }
        if self.max_parallel == Some(0) {
            return Err(PlanError::InvalidParallelism {
                stage: self.id.clone(),
            });
        }
        validate_idle_timeout(&self.attributes, &self.id)?;

        let concurrent = self.is_concurrent();
        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            validate_id(&task.id, "task")?;
            if !task_ids.insert(task.id.as_str()) {
                return Err(PlanError::DuplicateId {
                    scope: "task",
                    id: format!("{}/{}", self.id, task.id),
                });
            }
            if task.prompt.trim().is_empty() {
                return Err(PlanError::MissingField {
                    field: "prompt",
                    id: format!("{}/{}", self.id, task.id),
                });
            }
            validate_idle_timeout(&task.attributes, &task.id)?;

            let resolved = ResolvedAttributes::for_task(plan, self, task);
            if concurrent
                && resolved.workspace == WorkspaceMode::Shared
                && !task.read_only
                && !task.shared_write
            {
                return Err(PlanError::WorkspaceIsolation {
                    stage: self.id.clone(),
                    task: task.id.clone(),
                });
            }
        }
        Ok(())
    }
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            attributes: Attributes::default(),
            read_only: false,
            shared_write: false,
        }
    }

    #[must_use]
    pub fn workspace(mut self, mode: WorkspaceMode) -> Self {
        self.attributes.workspace = Some(mode);
        self
    }

    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.attributes.model = Some(model.into());
        self
    }

    #[must_use]
    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.attributes.idle_timeout_secs = Some(secs);
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[must_use]
    pub fn shared_write(mut self) -> Self {
        self.shared_write = true;
        self
    }
}

/// Ids become path components and event fields, so keep them plain.
fn validate_id(id: &str, scope: &'static str) -> Result<(), PlanError> {
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && id != "."
        && id != "..";
    if valid {
        Ok(())
    } else {
        Err(PlanError::InvalidId {
            scope,
            id: id.to_string(),
        })
    }
}

fn validate_idle_timeout(attributes: &Attributes, owner: &str) -> Result<(), PlanError> {
    if attributes.idle_timeout_secs == Some(0) {
        return Err(PlanError::InvalidIdleTimeout {
            owner: owner.to_string(),
        });
    }
    Ok(())
}

/// Plan loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported plan version {0} (expected {SUPPORTED_PLAN_VERSION})")]
    UnsupportedVersion(u32),

    #[error("Plan has no stages")]
    EmptyPlan,

    #[error("Stage '{0}' has no tasks")]
    EmptyStage(String),

    #[error("Invalid {scope} id '{id}': use letters, digits, '-', '_' or '.'")]
    InvalidId { scope: &'static str, id: String },

    #[error("Duplicate {scope} id '{id}'")]
    DuplicateId { scope: &'static str, id: String },

    #[error("Missing required field '{field}' on '{id}'")]
    MissingField { field: &'static str, id: String },

    #[error("Stage '{stage}' has max_parallel 0")]
    InvalidParallelism { stage: String },

    #[error("idle_timeout_secs on '{owner}' must be greater than zero")]
    InvalidIdleTimeout { owner: String },

    #[error(
        "Task '{stage}/{task}' uses the shared workspace concurrently with its siblings; \
         set read_only or shared_write, or use worktree/snapshot_ro"
    )]
    WorkspaceIsolation { stage: String, task: String },
}

impl PlanError {
    /// Whether this is a workspace isolation violation rather than a
    /// structural problem.
    pub fn is_isolation_violation(&self) -> bool {
        matches!(self, PlanError::WorkspaceIsolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> TaskSpec {
        TaskSpec::new(id, format!("do {id}"))
    }

    #[test]
    fn test_parse_yaml_plan() {
        let yaml = r"
version: 1
defaults:
  model: opus
  on_error: continue
stages:
  - id: analyze
    max_parallel: 2
    workspace: snapshot_ro
    tasks:
      - id: lint
        prompt: Run the linter
      - id: audit
        prompt: Audit dependencies
        idle_timeout_secs: 120
  - id: fix
    tasks:
      - id: apply
        prompt: Apply the fixes
        workspace: shared
";
        let plan: PipelinePlan = serde_yaml::from_str(yaml).unwrap();
        plan.validate().unwrap();

        assert_eq!(plan.defaults.model.as_deref(), Some("opus"));
        assert_eq!(plan.defaults.on_error, Some(OnError::Continue));
        assert_eq!(plan.stages.len(), 2);
        assert_eq!(plan.stages[0].parallelism(), 2);
        assert_eq!(
            plan.stages[0].attributes.workspace,
            Some(WorkspaceMode::SnapshotRo)
        );
        assert_eq!(plan.stages[0].tasks[1].attributes.idle_timeout_secs, Some(120));
        assert_eq!(plan.stages[1].parallelism(), 1);
        assert_eq!(plan.task_count(), 3);
    }

    #[test]
    fn test_json_transport_preserves_plan() {
        let plan = PipelinePlan::new(vec![
            StageSpec::new("build", vec![task("compile").model("haiku")])
                .on_error(OnError::Continue),
        ]);
        let json = plan.to_json().unwrap();
        assert!(!json.contains("read_only"));
        assert_eq!(PipelinePlan::from_json(&json).unwrap(), plan);
    }

    #[test]
    fn test_rejects_empty_plan_and_stage() {
        assert!(matches!(
            PipelinePlan::new(vec![]).validate(),
            Err(PlanError::EmptyPlan)
        ));
        assert!(matches!(
            PipelinePlan::new(vec![StageSpec::new("a", vec![])]).validate(),
            Err(PlanError::EmptyStage(ref id)) if id == "a"
        ));
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let mut plan = PipelinePlan::new(vec![StageSpec::new("a", vec![task("t")])]);
        plan.version = 2;
        assert!(matches!(
            plan.validate(),
            Err(PlanError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let plan = PipelinePlan::new(vec![
            StageSpec::new("a", vec![task("t")]),
            StageSpec::new("a", vec![task("u")]),
        ]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::DuplicateId { scope: "stage", .. })
        ));

        let plan = PipelinePlan::new(vec![StageSpec::new("a", vec![task("t"), task("t")])]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::DuplicateId { scope: "task", .. })
        ));
    }

    #[test]
    fn test_rejects_path_like_ids() {
        let plan = PipelinePlan::new(vec![StageSpec::new("../escape", vec![task("t")])]);
        assert!(matches!(plan.validate(), Err(PlanError::InvalidId { .. })));
    }

    #[test]
    fn test_rejects_blank_prompt_and_zero_limits() {
        let plan = PipelinePlan::new(vec![StageSpec::new("a", vec![TaskSpec::new("t", "  ")])]);
        assert!(matches!(plan.validate(), Err(PlanError::MissingField { .. })));

        let plan = PipelinePlan::new(vec![StageSpec::new("a", vec![task("t")]).max_parallel(0)]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::InvalidParallelism { .. })
        ));

        let plan = PipelinePlan::new(vec![StageSpec::new(
            "a",
            vec![task("t").idle_timeout_secs(0)],
        )]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::InvalidIdleTimeout { .. })
        ));
    }

    #[test]
    fn test_concurrent_shared_tasks_rejected() {
        let plan = PipelinePlan::new(vec![
            StageSpec::new("edit", vec![task("a"), task("b")]).max_parallel(2),
        ]);
        let err = plan.validate().unwrap_err();
        assert!(err.is_isolation_violation());
        assert!(matches!(
            err,
            PlanError::WorkspaceIsolation { ref stage, ref task } if stage == "edit" && task == "a"
        ));
    }

    #[test]
    fn test_concurrent_shared_tasks_allowed_with_opt_in() {
        let plan = PipelinePlan::new(vec![
            StageSpec::new("edit", vec![task("a").read_only(), task("b").shared_write()])
                .max_parallel(2),
        ]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_sequential_shared_tasks_allowed() {
        let plan = PipelinePlan::new(vec![StageSpec::new("edit", vec![task("a"), task("b")])]);
        assert!(plan.validate().is_ok());

        // A single task cannot race itself, whatever the limit.
        let plan = PipelinePlan::new(vec![StageSpec::new("edit", vec![task("a")]).max_parallel(4)]);
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_isolation_uses_cascaded_workspace() {
        // Stage-level worktree makes concurrent tasks safe.
        let plan = PipelinePlan::new(vec![
            StageSpec::new("edit", vec![task("a"), task("b")])
                .max_parallel(2)
                .workspace(WorkspaceMode::Worktree),
        ]);
        assert!(plan.validate().is_ok());

        // A task overriding back to shared is caught.
        let plan = PipelinePlan::new(vec![
            StageSpec::new(
                "edit",
                vec![task("a"), task("b").workspace(WorkspaceMode::Shared)],
            )
            .max_parallel(2)
            .workspace(WorkspaceMode::Worktree),
        ]);
        assert!(matches!(
            plan.validate(),
            Err(PlanError::WorkspaceIsolation { ref task, .. }) if task == "b"
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yml");
        std::fs::write(
            &path,
            "stages:\n  - id: only\n    tasks:\n      - id: t\n        prompt: hi\n",
        )
        .unwrap();
        let plan = PipelinePlan::from_file(&path).unwrap();
        assert_eq!(plan.version, SUPPORTED_PLAN_VERSION);
        assert!(plan.stage("only").is_some());
    }
}

//! # boxrun-core
//!
//! Configuration and the in-container pipeline engine for boxrun.
//!
//! This crate provides:
//! - `RunConfig`, the explicit run configuration value
//! - `PipelinePlan` with validation, including workspace isolation checks
//! - Attribute cascading (task, stage, plan, built-in defaults)
//! - Per-task workspace isolation (`shared`, `worktree`, `snapshot_ro`)
//! - The idle watchdog shared by the supervisor and the engine
//! - `PipelineEngine`, which schedules stages and bounded-parallel tasks
//! - The run-level error taxonomy

pub mod cascade;
mod config;
mod engine;
mod error;
mod idle;
mod plan;
mod report;
mod runner;
pub mod testing;
pub mod workspace;

pub use cascade::{ResolvedAttributes, cascade};
pub use config::{AgentConfig, ConfigError, ConfigWarning, ExecutionMode, RunConfig};
pub use engine::PipelineEngine;
pub use error::{Error, Result};
pub use idle::{ActivityMonitor, IdleTimer, idle_watchdog};
pub use plan::{
    Attributes, OnError, PipelinePlan, PlanError, SUPPORTED_PLAN_VERSION, StageSpec, TaskSpec,
    Verbosity, WorkspaceMode,
};
pub use report::{PlanReport, StageReport, TaskReport, aggregate_plan, aggregate_stage};
pub use runner::{AgentTaskRunner, TaskContext, TaskOutcome, TaskRunner};
pub use workspace::{CleanupPolicy, TaskWorkspace, WorkspaceError, WorkspaceManager};

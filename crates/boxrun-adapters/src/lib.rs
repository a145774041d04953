//! # boxrun-adapters
//!
//! The controlling side of a boxrun run.
//!
//! This crate provides:
//! - `ContainerRuntime`, the container capability the supervisor drives, and
//!   `DockerCli`, its implementation over the `docker` command line
//! - `Supervisor`, which owns one container's lifecycle: orphan cleanup,
//!   create, start, idle watch, teardown and exit reconciliation
//! - Stream handlers consuming decoded output: console progress, quiet mode
//!   and run metrics
//!
//! ## Testing
//!
//! `testing::MockRuntime` plays a scripted container and records every call,
//! so supervisor behaviour can be exercised without a daemon.

mod docker;
mod run;
mod runtime;
mod stream_handler;
mod supervisor;
pub mod testing;

pub use docker::DockerCli;
pub use run::{Run, workspace_label};
pub use runtime::{
    CONTAINER_WORKSPACE, ContainerError, ContainerId, ContainerRuntime, ContainerSpec,
    LineSplitter, MAX_LINE_BYTES, RUN_LABEL, RuntimeEvent, WORKSPACE_LABEL,
};
pub use stream_handler::{
    ConsoleStreamHandler, FanOut, MetricsCollector, QuietStreamHandler, RunMetrics, StreamHandler,
};
pub use supervisor::{
    CONTAINER_BINARY, PLAN_ENV, RunHandle, RunOutcome, RunSpec, Supervisor, Termination,
    reconcile,
};

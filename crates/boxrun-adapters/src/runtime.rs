//! Container runtime capability.
//!
//! The supervisor only ever talks to a [`ContainerRuntime`]: create, start
//! (with followed output), stop, kill, remove and list-by-label. Credentials
//! travel inside [`ContainerSpec::env`] and are never inspected.

use async_trait::async_trait;
use boxrun_core::ExecutionMode;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Label carrying the workspace hash, used to find orphans.
pub const WORKSPACE_LABEL: &str = "boxrun.workspace";
/// Label carrying the run id.
pub const RUN_LABEL: &str = "boxrun.run";
/// Mount point of the workspace inside the container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// Opaque reference to a container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerId(String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host directory mounted at [`CONTAINER_WORKSPACE`].
    pub workspace: PathBuf,
    pub mode: ExecutionMode,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub command: Vec<String>,
}

/// Something observed on a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// One complete line of combined output.
    Output(String),
    /// Bytes arrived without completing a line.
    Activity,
    /// The container process exited.
    Exited(i64),
    /// The connection to the runtime was lost mid-run.
    Disconnected(String),
}

/// Container runtime errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("{op} failed: {message}")]
    Command { op: &'static str, message: String },

    #[error("lost connection to container runtime: {0}")]
    Disconnected(String),
}

/// The container operations the supervisor depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, ContainerError>;

    /// Starts the container and follows its combined output.
    ///
    /// A container that fails to start is an error, not an `Exited` event.
    /// The receiver yields output in production order and ends with exactly
    /// one `Exited` or `Disconnected`.
    async fn start(&self, id: &ContainerId)
    -> Result<mpsc::Receiver<RuntimeEvent>, ContainerError>;

    /// Graceful stop, escalating inside the runtime after `grace`.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), ContainerError>;

    async fn kill(&self, id: &ContainerId) -> Result<(), ContainerError>;

    /// Removes the container. Removing a missing container succeeds.
    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError>;

    async fn list_by_label(&self, key: &str, value: &str)
    -> Result<Vec<ContainerId>, ContainerError>;
}

/// Longest line handed on in one piece; longer output is split at this size.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Splits a byte stream into lines without losing partial input.
///
/// A line that outgrows the limit is emitted in pieces, so a container that
/// never writes a newline cannot grow the buffer without bound.
#[derive(Debug)]
pub struct LineSplitter {
    pending: Vec<u8>,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line: max_line.max(1),
        }
    }

    /// Feeds a chunk, returning every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for segment in chunk.split_inclusive(|byte| *byte == b'\n') {
            match segment.split_last() {
                Some((b'\n', body)) => {
                    self.append(body, &mut lines);
                    lines.push(take_line(&mut self.pending));
                }
                _ => self.append(segment, &mut lines),
            }
        }
        lines
    }

    /// The unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(take_line(&mut self.pending))
        }
    }

    fn append(&mut self, mut bytes: &[u8], lines: &mut Vec<String>) {
        while self.pending.len() + bytes.len() > self.max_line {
            let room = self.max_line - self.pending.len();
            self.pending.extend_from_slice(&bytes[..room]);
            bytes = &bytes[room..];
            lines.push(String::from_utf8_lossy(&self.pending).into_owned());
            self.pending.clear();
        }
        self.pending.extend_from_slice(bytes);
    }
}

fn take_line(buffer: &mut Vec<u8>) -> String {
    if buffer.last() == Some(&b'\r') {
        buffer.pop();
    }
    let line = String::from_utf8_lossy(buffer).into_owned();
    buffer.clear();
    line
}

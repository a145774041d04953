//! Docker CLI implementation of [`ContainerRuntime`].
//!
//! Shells out to the `docker` binary. The container command is wrapped so the
//! agent's stderr is merged into stdout inside the container, which keeps the
//! two streams in production order on the single followed log stream.

use crate::runtime::{
    CONTAINER_WORKSPACE, ContainerError, ContainerId, ContainerRuntime, ContainerSpec,
    LineSplitter, RuntimeEvent,
};
use async_trait::async_trait;
use boxrun_core::ExecutionMode;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Channel depth between the log follower and the supervisor.
const EVENT_BUFFER: usize = 256;

/// Wrapper that merges stderr into stdout before exec'ing the real command.
const MERGE_STDERR: &str = r#"exec "$@" 2>&1"#;

/// Fragments of docker CLI output that mean the daemon is unreachable.
const DAEMON_UNREACHABLE: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
    "connection refused",
];

const IMAGE_MISSING: &[&str] = &[
    "Unable to find image",
    "No such image",
    "pull access denied",
    "manifest unknown",
    "repository does not exist",
];

/// Runtime backed by the `docker` command-line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// Uses `binary` as the client (e.g. `podman` for a compatible CLI).
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Arguments for `docker create`.
    ///
    /// Environment values are passed by name only (`-e KEY`) and supplied
    /// through the client's own environment, so they never show up in the
    /// process list.
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for key in spec.env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push("-v".to_string());
        args.push(format!("{}:{CONTAINER_WORKSPACE}", spec.workspace.display()));
        args.push("-w".to_string());
        args.push(CONTAINER_WORKSPACE.to_string());
        if spec.mode == ExecutionMode::Privileged {
            args.push("--privileged".to_string());
        }
        args.push(spec.image.clone());
        args.extend(
            ["sh", "-c", MERGE_STDERR, "sh"]
                .iter()
                .map(|s| (*s).to_string()),
        );
        args.extend(spec.command.iter().cloned());
        args
    }

    async fn docker(
        &self,
        op: &'static str,
        args: &[String],
        env: Option<&ContainerSpec>,
    ) -> Result<String, ContainerError> {
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(spec) = env {
            command.envs(&spec.env);
        }
        debug!(op, args = ?redact(args), "Running container command");

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ContainerError::Unavailable(format!("'{}' not found on PATH", self.binary))
            } else {
                ContainerError::Command {
                    op,
                    message: e.to_string(),
                }
            }
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(op, stderr))
        }
    }
}

impl DockerCli {
    /// Blocks until the container exits and returns its exit code.
    async fn wait_exit(&self, id: &ContainerId) -> Result<i64, ContainerError> {
        let out = self
            .docker("wait", &["wait".to_string(), id.to_string()], None)
            .await?;
        out.lines()
            .last()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| ContainerError::Command {
                op: "wait",
                message: format!("unexpected exit status output: {out:?}"),
            })
    }
}

/// Only the subcommand and flags are worth logging.
fn redact(args: &[String]) -> Vec<&str> {
    args.iter().take(8).map(String::as_str).collect()
}

fn classify_failure(op: &'static str, stderr: String) -> ContainerError {
    if DAEMON_UNREACHABLE.iter().any(|p| stderr.contains(p)) {
        ContainerError::Unavailable(stderr)
    } else if IMAGE_MISSING.iter().any(|p| stderr.contains(p)) {
        ContainerError::ImageNotFound(stderr)
    } else {
        ContainerError::Command {
            op,
            message: stderr,
        }
    }
}

fn is_missing_container(err: &ContainerError) -> bool {
    matches!(err, ContainerError::Command { message, .. } if message.contains("No such container"))
}

/// Pumps followed output into events until the pipe closes.
async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, tx: &mpsc::Sender<RuntimeEvent>) {
    let mut splitter = LineSplitter::new();
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let lines = splitter.push(&buf[..n]);
                if lines.is_empty() {
                    let _ = tx.send(RuntimeEvent::Activity).await;
                }
                for line in lines {
                    let _ = tx.send(RuntimeEvent::Output(line)).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading container output");
                break;
            }
        }
    }
    if let Some(tail) = splitter.finish() {
        let _ = tx.send(RuntimeEvent::Output(tail)).await;
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, ContainerError> {
        let id = self
            .docker("create", &Self::create_args(spec), Some(spec))
            .await?;
        let id = id.lines().last().unwrap_or_default().trim().to_string();
        if id.is_empty() {
            return Err(ContainerError::Command {
                op: "create",
                message: "runtime returned no container id".to_string(),
            });
        }
        Ok(ContainerId::new(id))
    }

    async fn start(
        &self,
        id: &ContainerId,
    ) -> Result<mpsc::Receiver<RuntimeEvent>, ContainerError> {
        // Start detached first so a runtime failure is reported as an error
        // rather than as the exit status of an attach client.
        self.docker("start", &["start".to_string(), id.to_string()], None)
            .await?;

        // `logs -f` replays from the beginning, so nothing written between
        // start and follow is lost.
        let mut follower = Command::new(&self.binary)
            .args(["logs", "-f", id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::Unavailable(e.to_string()))?;

        let stdout = follower.stdout.take().ok_or_else(|| ContainerError::Command {
            op: "logs",
            message: "missing stdout pipe".to_string(),
        })?;
        let stderr = follower.stderr.take();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.clone();
        let id = id.clone();

        tokio::spawn(async move {
            // The container's stderr is merged into stdout, so the client's
            // own stderr only carries runtime errors.
            let stderr_task = tokio::spawn(async move {
                let mut text = String::new();
                if let Some(mut stderr) = stderr {
                    let _ = stderr.read_to_string(&mut text).await;
                }
                text
            });

            pump_output(stdout, &tx).await;

            let _ = follower.wait().await;
            let client_errors = stderr_task.await.unwrap_or_default();
            let event = if DAEMON_UNREACHABLE.iter().any(|p| client_errors.contains(p)) {
                RuntimeEvent::Disconnected(client_errors.trim().to_string())
            } else {
                match client.wait_exit(&id).await {
                    Ok(code) => RuntimeEvent::Exited(code),
                    Err(e) => RuntimeEvent::Disconnected(e.to_string()),
                }
            };
            let _ = tx.send(event).await;
        });

        Ok(rx)
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), ContainerError> {
        let args = vec![
            "stop".to_string(),
            "-t".to_string(),
            grace.as_secs().to_string(),
            id.to_string(),
        ];
        match self.docker("stop", &args, None).await {
            Err(e) if is_missing_container(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn kill(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let args = vec!["kill".to_string(), id.to_string()];
        match self.docker("kill", &args, None).await {
            Err(e) if is_missing_container(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let args = vec!["rm".to_string(), "-f".to_string(), id.to_string()];
        match self.docker("rm", &args, None).await {
            Err(e) if is_missing_container(&e) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerId>, ContainerError> {
        let args = vec![
            "ps".to_string(),
            "-aq".to_string(),
            "--filter".to_string(),
            format!("label={key}={value}"),
        ];
        let out = self.docker("ps", &args, None).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ContainerId::new)
            .collect())
    }
}

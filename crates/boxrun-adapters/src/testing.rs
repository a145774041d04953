//! Test doubles for the container runtime.
//!
//! `MockRuntime` plays a scripted container: lines of output, pauses, then an
//! exit, a disconnect or a hang. Every call is recorded so tests can assert
//! on teardown order.

use crate::runtime::{ContainerError, ContainerId, ContainerRuntime, ContainerSpec, RuntimeEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One step of a scripted container.
#[derive(Debug, Clone)]
pub enum Step {
    Line(String),
    Wait(Duration),
    Exit(i64),
    Disconnect(String),
    /// Produces nothing until stopped or killed.
    Hang,
}

/// A recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    List { key: String, value: String },
    Create(Box<ContainerSpec>),
    Start(ContainerId),
    Stop(ContainerId, Duration),
    Kill(ContainerId),
    Remove(ContainerId),
}

impl RuntimeCall {
    /// Short name of the call, for order assertions.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeCall::List { .. } => "list",
            RuntimeCall::Create(_) => "create",
            RuntimeCall::Start(_) => "start",
            RuntimeCall::Stop(..) => "stop",
            RuntimeCall::Kill(_) => "kill",
            RuntimeCall::Remove(_) => "remove",
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    script: Vec<Step>,
    orphans: Vec<ContainerId>,
    create_error: Option<ContainerError>,
    start_error: Option<ContainerError>,
    stop_fails: bool,
    stop_hangs: bool,
    calls: Vec<RuntimeCall>,
    created: u32,
    halt: CancellationToken,
}

/// Scripted [`ContainerRuntime`].
///
/// Clones share state, so a test can keep one handle for assertions while
/// the supervisor owns another.
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(self, line: impl Into<String>) -> Self {
        self.step(Step::Line(line.into()))
    }

    pub fn wait(self, duration: Duration) -> Self {
        self.step(Step::Wait(duration))
    }

    pub fn exit(self, code: i64) -> Self {
        self.step(Step::Exit(code))
    }

    pub fn disconnect(self, reason: impl Into<String>) -> Self {
        self.step(Step::Disconnect(reason.into()))
    }

    pub fn hang(self) -> Self {
        self.step(Step::Hang)
    }

    pub fn step(self, step: Step) -> Self {
        self.lock().script.push(step);
        self
    }

    /// Containers reported by `list_by_label`, as left by a crashed run.
    pub fn with_orphans(self, ids: &[&str]) -> Self {
        self.lock().orphans = ids.iter().map(|id| ContainerId::new(*id)).collect();
        self
    }

    pub fn fail_create(self, error: ContainerError) -> Self {
        self.lock().create_error = Some(error);
        self
    }

    pub fn fail_start(self, error: ContainerError) -> Self {
        self.lock().start_error = Some(error);
        self
    }

    /// Graceful stop returns an error.
    pub fn fail_stop(self) -> Self {
        self.lock().stop_fails = true;
        self
    }

    /// Graceful stop never returns.
    pub fn stop_hangs(self) -> Self {
        self.lock().stop_hangs = true;
        self
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.lock().calls.iter().map(RuntimeCall::name).collect()
    }

    /// The spec passed to the last `create` call.
    pub fn created_spec(&self) -> Option<ContainerSpec> {
        self.lock().calls.iter().rev().find_map(|call| match call {
            RuntimeCall::Create(spec) => Some((**spec).clone()),
            _ => None,
        })
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: RuntimeCall) {
        self.lock().calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, ContainerError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Create(Box::new(spec.clone())));
        if let Some(error) = state.create_error.clone() {
            return Err(error);
        }
        state.created += 1;
        Ok(ContainerId::new(format!("mock-{}", state.created)))
    }

    async fn start(
        &self,
        id: &ContainerId,
    ) -> Result<mpsc::Receiver<RuntimeEvent>, ContainerError> {
        let (script, halt) = {
            let mut state = self.lock();
            state.calls.push(RuntimeCall::Start(id.clone()));
            if let Some(error) = state.start_error.clone() {
                return Err(error);
            }
            (state.script.clone(), state.halt.clone())
        };
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(play(script, tx, halt));
        Ok(rx)
    }

    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), ContainerError> {
        let (fails, hangs, halt) = {
            let mut state = self.lock();
            state.calls.push(RuntimeCall::Stop(id.clone(), grace));
            (state.stop_fails, state.stop_hangs, state.halt.clone())
        };
        if hangs {
            std::future::pending::<()>().await;
        }
        if fails {
            return Err(ContainerError::Command {
                op: "stop",
                message: "stop refused".to_string(),
            });
        }
        halt.cancel();
        Ok(())
    }

    async fn kill(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let halt = {
            let mut state = self.lock();
            state.calls.push(RuntimeCall::Kill(id.clone()));
            state.halt.clone()
        };
        halt.cancel();
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), ContainerError> {
        let mut state = self.lock();
        state.calls.push(RuntimeCall::Remove(id.clone()));
        state.orphans.retain(|orphan| orphan != id);
        Ok(())
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerId>, ContainerError> {
        self.record(RuntimeCall::List {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(self.lock().orphans.clone())
    }
}

async fn play(script: Vec<Step>, tx: mpsc::Sender<RuntimeEvent>, halt: CancellationToken) {
    for step in script {
        let event = match step {
            Step::Line(line) => RuntimeEvent::Output(line),
            Step::Wait(duration) => {
                tokio::select! {
                    () = tokio::time::sleep(duration) => continue,
                    () = halt.cancelled() => return,
                }
            }
            Step::Exit(code) => {
                let _ = tx.send(RuntimeEvent::Exited(code)).await;
                return;
            }
            Step::Disconnect(reason) => {
                let _ = tx.send(RuntimeEvent::Disconnected(reason)).await;
                return;
            }
            Step::Hang => {
                halt.cancelled().await;
                return;
            }
        };
        if tx.send(event).await.is_err() || halt.is_cancelled() {
            return;
        }
    }
    let _ = tx.send(RuntimeEvent::Exited(0)).await;
}

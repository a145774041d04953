//! Scripted task runner.
//!
//! Stands in for the agent CLI so engine behaviour can be exercised under
//! paused tokio time: each task follows a [`TaskScript`], and the runner
//! records admission order and peak concurrency.

use crate::runner::{TaskContext, TaskOutcome, TaskRunner};
use async_trait::async_trait;
use boxrun_proto::Usage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Scripted behaviour for one task.
#[derive(Debug, Clone)]
pub enum TaskScript {
    /// Print one line, stay silent for `after`, then succeed.
    Succeed { after: Duration, usage: Option<Usage> },
    /// Print one line, stay silent for `after`, then fail.
    Fail { after: Duration, message: String },
    /// Never print and never finish.
    Hang,
    /// Print a line every `interval`, `beats` times, then succeed.
    Heartbeat { interval: Duration, beats: u32 },
}

impl TaskScript {
    pub fn succeed(after: Duration) -> Self {
        TaskScript::Succeed { after, usage: None }
    }

    pub fn succeed_with_tokens(after: Duration, input_tokens: u64) -> Self {
        TaskScript::Succeed {
            after,
            usage: Some(Usage {
                input_tokens,
                ..Usage::default()
            }),
        }
    }

    pub fn fail(after: Duration, message: impl Into<String>) -> Self {
        TaskScript::Fail {
            after,
            message: message.into(),
        }
    }
}

impl Default for TaskScript {
    fn default() -> Self {
        TaskScript::succeed(Duration::from_secs(1))
    }
}

/// A [`TaskRunner`] whose tasks follow scripts.
///
/// Clones share their recordings, so keep one clone for assertions and hand
/// another to the engine.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRunner {
    scripts: HashMap<String, TaskScript>,
    started: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedRunner {
    /// Runner where every task succeeds after one second.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a task, keyed by `task` id or `stage/task`.
    #[must_use]
    pub fn with_task(mut self, key: impl Into<String>, script: TaskScript) -> Self {
        self.scripts.insert(key.into(), script);
        self
    }

    /// Tasks in the order they started, as `stage/task`.
    pub fn started(&self) -> Vec<String> {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn was_started(&self, stage_id: &str, task_id: &str) -> bool {
        let key = format!("{stage_id}/{task_id}");
        self.started().contains(&key)
    }

    /// Highest number of tasks observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn script_for(&self, stage_id: &str, task_id: &str) -> TaskScript {
        self.scripts
            .get(&format!("{stage_id}/{task_id}"))
            .or_else(|| self.scripts.get(task_id))
            .cloned()
            .unwrap_or_default()
    }
}

/// Tracks the running count; decrements even when the run future is dropped.
struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn play(script: TaskScript, ctx: &TaskContext) -> TaskOutcome {
    let say = |line: String| {
        ctx.activity.touch();
        let _ = ctx.emitter.emit_raw(&line);
    };

    match script {
        TaskScript::Succeed { after, usage } => {
            say(format!("{}: working", ctx.task_id));
            tokio::time::sleep(after).await;
            if let Some(usage) = usage {
                say(format!(
                    r#"{{"type":"result","subtype":"success","is_error":false,"usage":{{"input_tokens":{}}}}}"#,
                    usage.input_tokens
                ));
            }
            TaskOutcome::succeeded(usage)
        }
        TaskScript::Fail { after, message } => {
            say(format!("{}: working", ctx.task_id));
            tokio::time::sleep(after).await;
            TaskOutcome::failed(message)
        }
        TaskScript::Hang => std::future::pending().await,
        TaskScript::Heartbeat { interval, beats } => {
            for beat in 1..=beats {
                tokio::time::sleep(interval).await;
                say(format!("{}: heartbeat {beat}", ctx.task_id));
            }
            TaskOutcome::succeeded(None)
        }
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        self.started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(format!("{}/{}", ctx.stage_id, ctx.task_id));
        let _active = ActiveGuard::enter(&self.active, &self.peak);

        let script = self.script_for(&ctx.stage_id, &ctx.task_id);
        tokio::select! {
            outcome = play(script, &ctx) => outcome,
            () = ctx.cancel.cancelled() => TaskOutcome::failed("cancelled"),
        }
    }
}

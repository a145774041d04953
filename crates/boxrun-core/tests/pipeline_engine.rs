//! Engine scheduling, policy and isolation behaviour under paused time.

use async_trait::async_trait;
use boxrun_core::testing::{ScriptedRunner, TaskScript};
use boxrun_core::{
    Attributes, OnError, PipelineEngine, PipelinePlan, StageSpec, TaskContext, TaskOutcome,
    TaskRunner, TaskSpec, WorkspaceManager, WorkspaceMode,
};
use boxrun_proto::{
    Decoded, EventCodec, EventEmitter, MemorySink, PipelineEvent, PipelinePhase, Status,
    StreamEvent,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn task(id: &str) -> TaskSpec {
    TaskSpec::new(id, format!("please {id}"))
}

struct Harness {
    engine: PipelineEngine,
    sink: MemorySink,
    root: TempDir,
    _scratch: TempDir,
}

fn harness(plan: PipelinePlan, runner: Arc<dyn TaskRunner>) -> Harness {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("README.md"), "shared").unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let (emitter, sink) = EventEmitter::memory();
    let engine = PipelineEngine::new(
        plan,
        runner,
        WorkspaceManager::new(root.path(), scratch.path()),
        emitter,
    )
    .unwrap();
    Harness {
        engine,
        sink,
        root,
        _scratch: scratch,
    }
}

fn pipeline_events(sink: &MemorySink) -> Vec<PipelineEvent> {
    sink.lines()
        .iter()
        .filter_map(|line| match EventCodec::classify(line) {
            Decoded::Event(StreamEvent::Pipeline(event)) => Some(event),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_skips_later_stages() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new("a", vec![task("build")]),
        StageSpec::new("b", vec![task("test")]),
        StageSpec::new("c", vec![task("ship")]),
    ]);
    let runner = ScriptedRunner::new().with_task("build", TaskScript::fail(secs(1), "boom"));
    let h = harness(plan, Arc::new(runner.clone()));

    let report = h.engine.run(CancellationToken::new()).await;

    assert_eq!(report.status, Status::Failed);
    assert_eq!(report.stage("a").unwrap().status, Status::Failed);
    assert_eq!(report.stage("b").unwrap().status, Status::Skipped);
    assert_eq!(report.stage("c").unwrap().status, Status::Skipped);
    assert_eq!(runner.started(), vec!["a/build"]);

    let events = pipeline_events(&h.sink);
    let skipped: Vec<_> = events
        .iter()
        .filter(|e| e.phase == PipelinePhase::Skipped && e.task_id.is_none())
        .filter_map(|e| e.stage_id.as_deref())
        .collect();
    assert_eq!(skipped, vec!["b", "c"]);
    let last = events.last().unwrap();
    assert!(last.is_plan_result());
    assert_eq!(last.status, Some(Status::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_continue_policy_runs_next_stage() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new("a", vec![task("build")]),
        StageSpec::new("b", vec![task("report")]),
    ])
    .with_defaults(Attributes {
        on_error: Some(OnError::Continue),
        ..Attributes::default()
    });
    let runner = ScriptedRunner::new().with_task("build", TaskScript::fail(secs(1), "boom"));
    let h = harness(plan, Arc::new(runner.clone()));

    let report = h.engine.run(CancellationToken::new()).await;

    assert_eq!(report.stage("a").unwrap().status, Status::Failed);
    assert_eq!(report.stage("b").unwrap().status, Status::Succeeded);
    assert!(runner.was_started("b", "report"));
    assert_eq!(report.status, Status::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_steady_output_never_times_out() {
    let plan = PipelinePlan::new(vec![StageSpec::new(
        "s",
        vec![task("chatty").idle_timeout_secs(10)],
    )]);
    // 30 beats at 9s is 270s of wall time, far beyond the 10s window.
    let runner = ScriptedRunner::new().with_task(
        "chatty",
        TaskScript::Heartbeat {
            interval: secs(9),
            beats: 30,
        },
    );
    let h = harness(plan, Arc::new(runner));

    let report = h.engine.run(CancellationToken::new()).await;

    let chatty = report.task("s", "chatty").unwrap();
    assert_eq!(chatty.status, Status::Succeeded);
    assert!(chatty.duration >= secs(270));
}

#[tokio::test(start_paused = true)]
async fn test_silent_task_times_out() {
    let plan = PipelinePlan::new(vec![StageSpec::new(
        "s",
        vec![task("stuck").idle_timeout_secs(10)],
    )]);
    let runner = ScriptedRunner::new().with_task("stuck", TaskScript::Hang);
    let h = harness(plan, Arc::new(runner));

    let report = h.engine.run(CancellationToken::new()).await;

    let stuck = report.task("s", "stuck").unwrap();
    assert_eq!(stuck.status, Status::TimedOut);
    assert!(stuck.error.as_deref().unwrap().contains("10s"));
    assert_eq!(report.status, Status::Failed);

    let timed_out = pipeline_events(&h.sink)
        .into_iter()
        .find(|e| e.phase == PipelinePhase::TimedOut)
        .unwrap();
    assert_eq!(timed_out.task_id.as_deref(), Some("stuck"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_under_continue_spares_siblings() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new(
            "s",
            vec![
                task("stuck").idle_timeout_secs(5).read_only(),
                task("slow").read_only(),
            ],
        )
        .max_parallel(2)
        .on_error(OnError::Continue),
    ]);
    let runner = ScriptedRunner::new()
        .with_task("stuck", TaskScript::Hang)
        .with_task("slow", TaskScript::succeed(secs(30)));
    let h = harness(plan, Arc::new(runner));

    let report = h.engine.run(CancellationToken::new()).await;

    assert_eq!(report.task("s", "stuck").unwrap().status, Status::TimedOut);
    assert_eq!(report.task("s", "slow").unwrap().status, Status::Succeeded);
    assert_eq!(report.stage("s").unwrap().status, Status::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_cancels_running_and_skips_unadmitted() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new("s", vec![task("a"), task("b"), task("c")])
            .max_parallel(2)
            .workspace(WorkspaceMode::Worktree),
    ]);
    let runner = ScriptedRunner::new()
        .with_task("a", TaskScript::fail(secs(1), "broken"))
        .with_task("b", TaskScript::Hang);
    let h = harness(plan, Arc::new(runner.clone()));

    let report = h.engine.run(CancellationToken::new()).await;

    let stage = report.stage("s").unwrap();
    assert_eq!(stage.status, Status::Failed);
    assert_eq!(stage.task("a").unwrap().status, Status::Failed);
    assert_eq!(stage.task("b").unwrap().status, Status::Cancelled);
    assert_eq!(stage.task("c").unwrap().status, Status::Skipped);
    assert!(!runner.was_started("s", "c"));
}

/// Fails `a` after a second; every other task never returns, even when cancelled.
struct IgnoresCancel;

#[async_trait]
impl TaskRunner for IgnoresCancel {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        if ctx.task_id == "a" {
            tokio::time::sleep(secs(1)).await;
            return TaskOutcome::failed("broken");
        }
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_does_not_wait_on_cancelled_sibling() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new("s", vec![task("a"), task("b")])
            .max_parallel(2)
            .workspace(WorkspaceMode::Worktree),
    ]);
    let h = harness(plan, Arc::new(IgnoresCancel));

    let start = Instant::now();
    let report = h.engine.run(CancellationToken::new()).await;
    let elapsed = start.elapsed();

    let stage = report.stage("s").unwrap();
    assert_eq!(stage.status, Status::Failed);
    assert_eq!(stage.task("b").unwrap().status, Status::Cancelled);
    assert!(elapsed < secs(2), "stage held for {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_does_not_wait_on_stuck_agent() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new("s", vec![task("stuck").idle_timeout_secs(10)]),
        StageSpec::new("next", vec![task("a")]),
    ])
    .with_defaults(Attributes {
        on_error: Some(OnError::Continue),
        ..Attributes::default()
    });
    let h = harness(plan, Arc::new(IgnoresCancel));

    let start = Instant::now();
    let report = h.engine.run(CancellationToken::new()).await;
    let elapsed = start.elapsed();

    assert_eq!(report.task("s", "stuck").unwrap().status, Status::TimedOut);
    assert_eq!(report.task("next", "a").unwrap().status, Status::Failed);
    // Ten idle seconds plus the one second `a` takes, with no stop grace in between.
    assert!(elapsed >= secs(11));
    assert!(elapsed < secs(12), "stage held for {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_worker_pool_bounds_parallelism_in_order() {
    let tasks: Vec<TaskSpec> = (1..=5).map(|i| task(&format!("t{i}")).read_only()).collect();
    let plan = PipelinePlan::new(vec![StageSpec::new("s", tasks).max_parallel(2)]);
    let runner = ScriptedRunner::new()
        .with_task("t1", TaskScript::succeed(secs(5)))
        .with_task("t2", TaskScript::succeed(secs(1)))
        .with_task("t3", TaskScript::succeed(secs(1)))
        .with_task("t4", TaskScript::succeed(secs(1)))
        .with_task("t5", TaskScript::succeed(secs(1)));
    let h = harness(plan, Arc::new(runner.clone()));

    let report = h.engine.run(CancellationToken::new()).await;

    assert!(report.succeeded());
    assert_eq!(runner.peak_concurrency(), 2);
    assert_eq!(runner.started(), vec!["s/t1", "s/t2", "s/t3", "s/t4", "s/t5"]);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_stage_runs_one_at_a_time() {
    let plan = PipelinePlan::new(vec![StageSpec::new(
        "s",
        vec![task("a"), task("b"), task("c")],
    )]);
    let runner = ScriptedRunner::new();
    let h = harness(plan, Arc::new(runner.clone()));

    h.engine.run(CancellationToken::new()).await;

    assert_eq!(runner.peak_concurrency(), 1);
    assert_eq!(runner.started(), vec!["s/a", "s/b", "s/c"]);
}

#[test]
fn test_concurrent_shared_tasks_rejected_before_start() {
    let plan = PipelinePlan::new(vec![
        StageSpec::new("edit", vec![task("left"), task("right")]).max_parallel(2),
    ]);
    let runner = ScriptedRunner::new();
    let (emitter, sink) = EventEmitter::memory();

    let err = PipelineEngine::new(
        plan,
        Arc::new(runner.clone()),
        WorkspaceManager::new(".", std::env::temp_dir()),
        emitter,
    )
    .unwrap_err();

    assert!(err.is_isolation_violation());
    assert!(runner.started().is_empty());
    assert!(sink.lines().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_task_events_are_causally_ordered() {
    let tasks: Vec<TaskSpec> = (1..=4).map(|i| task(&format!("t{i}")).read_only()).collect();
    let plan = PipelinePlan::new(vec![StageSpec::new("s", tasks).max_parallel(4)]);
    let h = harness(plan, Arc::new(ScriptedRunner::new()));

    h.engine.run(CancellationToken::new()).await;

    let events = pipeline_events(&h.sink);
    for i in 1..=4 {
        let id = format!("t{i}");
        let positions: Vec<(usize, PipelinePhase)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.task_id.as_deref() == Some(id.as_str()))
            .map(|(pos, e)| (pos, e.phase))
            .collect();
        assert_eq!(positions.len(), 2, "task {id}");
        assert_eq!(positions[0].1, PipelinePhase::Start);
        assert_eq!(positions[1].1, PipelinePhase::Succeeded);
        assert!(positions[0].0 < positions[1].0);
    }
}

/// Records the directory each task ran in.
#[derive(Default)]
struct WorkspaceRecorder {
    seen: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl TaskRunner for WorkspaceRecorder {
    async fn run(&self, ctx: TaskContext) -> TaskOutcome {
        if ctx.task_id == "writer" {
            std::fs::write(ctx.workspace.join("README.md"), "mutated").unwrap();
        }
        self.seen
            .lock()
            .unwrap()
            .push((ctx.task_id.clone(), ctx.workspace.clone()));
        TaskOutcome::succeeded(None)
    }
}

#[tokio::test]
async fn test_workspace_modes_route_tasks() {
    let plan = PipelinePlan::new(vec![StageSpec::new(
        "s",
        vec![
            task("direct"),
            task("writer").workspace(WorkspaceMode::Worktree),
            task("reader").workspace(WorkspaceMode::SnapshotRo),
        ],
    )]);
    let recorder = Arc::new(WorkspaceRecorder::default());
    let h = harness(plan, recorder.clone());

    let report = h.engine.run(CancellationToken::new()).await;
    assert!(report.succeeded());

    let seen = recorder.seen.lock().unwrap().clone();
    assert_eq!(seen[0].1, h.root.path());
    assert_ne!(seen[1].1, h.root.path());
    assert_ne!(seen[2].1, h.root.path());

    // The worktree write stayed private and the copy is kept for inspection.
    assert_eq!(
        std::fs::read_to_string(h.root.path().join("README.md")).unwrap(),
        "shared"
    );
    let writer = report.task("s", "writer").unwrap();
    assert_eq!(writer.workspace.as_deref(), Some(seen[1].1.as_path()));
    // Snapshots are always discarded.
    assert!(!seen[2].1.exists());
    assert!(report.task("s", "reader").unwrap().workspace.is_none());
}

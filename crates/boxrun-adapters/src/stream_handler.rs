//! Stream handler trait and implementations for consuming decoded run output.
//!
//! The `StreamHandler` trait abstracts over what happens to each decoded line
//! (console progress, metrics, silence). [`FanOut`] feeds one line to several
//! handlers in arrival order.

use boxrun_proto::{
    Decoded, DecodedLine, ModelUsage, PipelineEvent, PipelinePhase, PipelineScope, ResultEvent,
    StreamEvent, SystemEvent, TodoEvent, TodoStatus, ToolEvent, ToolPhase, Usage, truncate,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Handler for decoded output lines.
///
/// Only `on_text` is required; every other hook defaults to a no-op so
/// handlers implement just what they care about.
pub trait StreamHandler: Send {
    /// Called for lines that are not protocol events.
    fn on_text(&mut self, text: &str);

    fn on_system(&mut self, _event: &SystemEvent) {}

    fn on_tool(&mut self, _event: &ToolEvent) {}

    fn on_todo(&mut self, _event: &TodoEvent) {}

    fn on_pipeline(&mut self, _event: &PipelineEvent) {}

    /// Called for each agent invocation's terminal `result` event.
    fn on_result(&mut self, _event: &ResultEvent) {}

    /// Routes one decoded line to the matching hook.
    fn handle(&mut self, line: &DecodedLine) {
        match &line.decoded {
            Decoded::Text(text) => self.on_text(text),
            Decoded::Event(StreamEvent::System(event)) => self.on_system(event),
            Decoded::Event(StreamEvent::Tool(event)) => self.on_tool(event),
            Decoded::Event(StreamEvent::Todo(event)) => self.on_todo(event),
            Decoded::Event(StreamEvent::Pipeline(event)) => self.on_pipeline(event),
            Decoded::Event(StreamEvent::Result(event)) => self.on_result(event),
        }
    }
}

/// Delivers every line to each registered handler, in registration order.
#[derive(Default)]
pub struct FanOut {
    handlers: Vec<Box<dyn StreamHandler>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl StreamHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn handle(&mut self, line: &DecodedLine) {
        for handler in &mut self.handlers {
            handler.handle(line);
        }
    }
}

/// Writes human progress lines.
///
/// In normal mode, displays text, tool invocations and pipeline transitions.
/// In verbose mode, also displays tool results, todo updates and invocation
/// summaries.
pub struct ConsoleStreamHandler<W: Write + Send = io::Stdout> {
    verbose: bool,
    out: W,
}

impl ConsoleStreamHandler<io::Stdout> {
    /// Console handler writing to stdout.
    pub fn stdout(verbose: bool) -> Self {
        Self::new(io::stdout(), verbose)
    }
}

impl<W: Write + Send> ConsoleStreamHandler<W> {
    pub fn new(out: W, verbose: bool) -> Self {
        Self { verbose, out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> StreamHandler for ConsoleStreamHandler<W> {
    fn on_text(&mut self, text: &str) {
        let _ = writeln!(self.out, "{text}");
    }

    fn on_system(&mut self, event: &SystemEvent) {
        if self.verbose {
            let _ = writeln!(self.out, "[Session] {} ({})", event.session_id, event.model);
        }
    }

    fn on_tool(&mut self, event: &ToolEvent) {
        match event.phase {
            ToolPhase::Start => {
                let name = event.name.as_deref().unwrap_or("tool");
                match format_tool_summary(name, &event.payload) {
                    Some(summary) => {
                        let _ = writeln!(self.out, "[Tool] {name}: {summary}");
                    }
                    None => {
                        let _ = writeln!(self.out, "[Tool] {name}");
                    }
                }
            }
            ToolPhase::Done if event.is_error => {
                let _ = writeln!(self.out, "[Error] {}", truncate(&payload_text(&event.payload), 200));
            }
            ToolPhase::Done => {
                if self.verbose {
                    let _ = writeln!(self.out, "[Result] {}", truncate(&payload_text(&event.payload), 200));
                }
            }
        }
    }

    fn on_todo(&mut self, event: &TodoEvent) {
        if self.verbose {
            let mark = match event.status {
                TodoStatus::Pending => " ",
                TodoStatus::InProgress => "~",
                TodoStatus::Completed => "x",
            };
            let _ = writeln!(self.out, "[Todo] [{mark}] {}", event.content);
        }
    }

    fn on_pipeline(&mut self, event: &PipelineEvent) {
        let _ = writeln!(self.out, "{}", format_pipeline(event));
    }

    fn on_result(&mut self, event: &ResultEvent) {
        if self.verbose {
            let _ = writeln!(
                self.out,
                "--- Invocation {} ---\nDuration: {}ms | Cost: ${:.4} | Turns: {} | Tokens: {}",
                if event.is_error() { "failed" } else { "complete" },
                event.duration_ms,
                event.cost_usd,
                event.num_turns,
                event.usage.total_tokens()
            );
        }
    }
}

/// Suppresses all output (for CI/silent mode).
pub struct QuietStreamHandler;

impl StreamHandler for QuietStreamHandler {
    fn on_text(&mut self, _: &str) {}
}

/// Totals accumulated over one run's stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunMetrics {
    pub usage: Usage,
    pub cost_usd: f64,
    pub model_usage: BTreeMap<String, ModelUsage>,
    pub tool_calls: u64,
    pub tasks_succeeded: u64,
    /// Failed and timed-out tasks.
    pub tasks_failed: u64,
    pub tasks_skipped: u64,
    pub tasks_cancelled: u64,
    pub results: u64,
}

/// Accumulates [`RunMetrics`] from the stream.
///
/// Tokens and cost come only from `result` events. Task terminal events and
/// the plan result repeat the same usage and are only counted for task
/// statuses.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<RunMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> RunMetrics {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamHandler for MetricsCollector {
    fn on_text(&mut self, _: &str) {}

    fn on_tool(&mut self, event: &ToolEvent) {
        if event.phase == ToolPhase::Start {
            self.lock().tool_calls += 1;
        }
    }

    fn on_pipeline(&mut self, event: &PipelineEvent) {
        if event.scope != PipelineScope::Task {
            return;
        }
        let mut metrics = self.lock();
        match event.phase {
            PipelinePhase::Succeeded => metrics.tasks_succeeded += 1,
            PipelinePhase::Failed | PipelinePhase::TimedOut => metrics.tasks_failed += 1,
            PipelinePhase::Skipped => metrics.tasks_skipped += 1,
            PipelinePhase::Cancelled => metrics.tasks_cancelled += 1,
            PipelinePhase::Start | PipelinePhase::PlanResult => {}
        }
    }

    fn on_result(&mut self, event: &ResultEvent) {
        let mut metrics = self.lock();
        metrics.results += 1;
        metrics.usage += event.usage;
        metrics.cost_usd += event.cost_usd;
        for (model, usage) in &event.model_usage {
            let entry = metrics.model_usage.entry(model.clone()).or_default();
            entry.usage += usage.usage;
            entry.cost_usd += usage.cost_usd;
        }
    }
}

fn format_pipeline(event: &PipelineEvent) -> String {
    let label = match event.scope {
        PipelineScope::Plan => "[plan]".to_string(),
        PipelineScope::Stage => format!("[stage {}]", event.stage_id.as_deref().unwrap_or("?")),
        PipelineScope::Task => format!(
            "[task {}/{}]",
            event.stage_id.as_deref().unwrap_or("?"),
            event.task_id.as_deref().unwrap_or("?")
        ),
    };
    let verb = match event.phase {
        PipelinePhase::Start => "started",
        PipelinePhase::Succeeded => "succeeded",
        PipelinePhase::Failed => "failed",
        PipelinePhase::Skipped => "skipped",
        PipelinePhase::TimedOut => "timed out",
        PipelinePhase::Cancelled => "cancelled",
        PipelinePhase::PlanResult => event.status.map_or("finished", |s| s.as_str()),
    };
    let mut line = format!("{label} {verb}");
    if let Some(ms) = event.duration_ms
        && event.phase != PipelinePhase::Start
    {
        line.push_str(&format!(" ({:.1}s)", ms as f64 / 1000.0));
    }
    if let Some(error) = &event.error {
        line.push_str(": ");
        line.push_str(&truncate(error, 200));
    }
    line
}

fn payload_text(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extracts the most relevant field from tool input for display.
///
/// Returns `None` for unknown tools or if the expected field is missing.
fn format_tool_summary(name: &str, input: &serde_json::Value) -> Option<String> {
    match name {
        "Read" | "Edit" | "Write" => input.get("file_path")?.as_str().map(|s| s.to_string()),
        "Bash" => {
            let cmd = input.get("command")?.as_str()?;
            Some(truncate(cmd, 60))
        }
        "Grep" | "Glob" => input.get("pattern")?.as_str().map(|s| s.to_string()),
        "Task" => input.get("description")?.as_str().map(|s| s.to_string()),
        "WebFetch" => input.get("url")?.as_str().map(|s| s.to_string()),
        "WebSearch" => input.get("query")?.as_str().map(|s| s.to_string()),
        "TodoWrite" => Some("updating todo list".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxrun_proto::{EventCodec, Status};
    use serde_json::json;

    fn render(verbose: bool, lines: &[&str]) -> String {
        let mut codec = EventCodec::new();
        let mut handler = ConsoleStreamHandler::new(Vec::new(), verbose);
        for line in lines {
            handler.handle(&codec.decode(line));
        }
        String::from_utf8(handler.into_inner()).unwrap()
    }

    #[test]
    fn test_console_renders_progress_lines() {
        let out = render(false, &[
            r#"{"kind":"tool","tool_use_id":"t1","name":"Bash","phase":"start","payload":{"command":"ls"}}"#,
            r#"{"kind":"pipeline","scope":"task","stage_id":"build","task_id":"lint","phase":"start"}"#,
            r#"{"kind":"pipeline","scope":"stage","stage_id":"build","phase":"failed"}"#,
            "plain text",
        ]);
        assert_eq!(
            out,
            "[Tool] Bash: ls\n[task build/lint] started\n[stage build] failed\nplain text\n"
        );
    }

    #[test]
    fn test_console_normal_skips_verbose_detail() {
        let out = render(false, &[
            r#"{"kind":"tool","tool_use_id":"t1","phase":"done","payload":"file contents"}"#,
            r#"{"kind":"todo","content":"write tests","status":"in_progress"}"#,
            r#"{"kind":"result","status":"success","num_turns":2}"#,
        ]);
        assert!(out.is_empty(), "unexpected output: {out}");

        let out = render(true, &[
            r#"{"kind":"tool","tool_use_id":"t1","phase":"done","payload":"file contents"}"#,
            r#"{"kind":"todo","content":"write tests","status":"in_progress"}"#,
        ]);
        assert_eq!(out, "[Result] file contents\n[Todo] [~] write tests\n");
    }

    #[test]
    fn test_console_tool_errors_always_shown() {
        let out = render(false, &[
            r#"{"kind":"tool","tool_use_id":"t1","phase":"done","payload":"permission denied","is_error":true}"#,
        ]);
        assert_eq!(out, "[Error] permission denied\n");
    }

    #[test]
    fn test_format_pipeline_with_error_and_duration() {
        let event = PipelineEvent::task("build", "test", PipelinePhase::TimedOut)
            .with_duration_ms(1500)
            .with_error("no output for 60s");
        assert_eq!(
            format_pipeline(&event),
            "[task build/test] timed out (1.5s): no output for 60s"
        );

        let plan = PipelineEvent::plan_result(Status::Failed, Usage::default());
        assert_eq!(format_pipeline(&plan), "[plan] failed");
    }

    #[test]
    fn test_metrics_count_results_not_task_usage() {
        let mut codec = EventCodec::new();
        let mut collector = MetricsCollector::new();
        let reader = collector.clone();
        for line in [
            r#"{"kind":"tool","tool_use_id":"t1","name":"Read","phase":"start"}"#,
            r#"{"kind":"tool","tool_use_id":"t1","phase":"done"}"#,
            r#"{"kind":"result","status":"success","usage":{"input_tokens":10,"output_tokens":5},"cost_usd":0.5,"model_usage":{"m1":{"input_tokens":10,"output_tokens":5,"cost_usd":0.5}}}"#,
            r#"{"kind":"pipeline","scope":"task","stage_id":"s","task_id":"a","phase":"succeeded","usage":{"input_tokens":10,"output_tokens":5}}"#,
            r#"{"kind":"result","status":"error","usage":{"input_tokens":1},"cost_usd":0.25,"model_usage":{"m1":{"input_tokens":1,"cost_usd":0.25}}}"#,
            r#"{"kind":"pipeline","scope":"task","stage_id":"s","task_id":"b","phase":"timed_out"}"#,
            r#"{"kind":"pipeline","scope":"task","stage_id":"s","task_id":"c","phase":"skipped"}"#,
            r#"{"kind":"pipeline","scope":"stage","stage_id":"s","phase":"failed"}"#,
            r#"{"kind":"pipeline","scope":"plan","phase":"plan_result","status":"failed","usage":{"input_tokens":11,"output_tokens":5}}"#,
        ] {
            collector.handle(&codec.decode(line));
        }

        let metrics = reader.snapshot();
        assert_eq!(metrics.results, 2);
        assert_eq!(metrics.usage.input_tokens, 11);
        assert_eq!(metrics.usage.output_tokens, 5);
        assert!((metrics.cost_usd - 0.75).abs() < f64::EPSILON);
        assert_eq!(metrics.model_usage["m1"].usage.input_tokens, 11);
        assert_eq!(metrics.tool_calls, 1);
        assert_eq!(metrics.tasks_succeeded, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.tasks_skipped, 1);
    }

    #[test]
    fn test_fan_out_reaches_every_handler() {
        let collector = MetricsCollector::new();
        let mut fan_out = FanOut::new()
            .with(QuietStreamHandler)
            .with(collector.clone());
        let mut codec = EventCodec::new();
        fan_out.handle(&codec.decode(r#"{"kind":"result","status":"success"}"#));
        assert_eq!(collector.snapshot().results, 1);
    }

    #[test]
    fn test_format_tool_summary() {
        assert_eq!(
            format_tool_summary("Read", &json!({"file_path": "src/main.rs"})),
            Some("src/main.rs".to_string())
        );
        assert_eq!(
            format_tool_summary("Grep", &json!({"pattern": "TODO"})),
            Some("TODO".to_string())
        );
        assert_eq!(format_tool_summary("Unknown", &json!({})), None);
        assert_eq!(format_tool_summary("Read", &json!({})), None);
    }

    #[test]
    fn test_bash_summary_truncated() {
        let long = "a".repeat(100);
        let summary = format_tool_summary("Bash", &json!({ "command": long })).unwrap();
        assert_eq!(summary.len(), 63);
        assert!(summary.ends_with("..."));
    }
}

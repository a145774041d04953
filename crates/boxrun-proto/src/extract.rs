//! Final-result extraction over a decoded event sequence.
//!
//! Single-prompt runs take the last `result` event as authoritative. Pipeline
//! runs take the last `pipeline` plan-result marker; the per-invocation
//! `result` events a pipeline stream also carries only feed metrics.

use crate::codec::DecodedLine;
use crate::event::{PipelineEvent, ResultEvent, Status, StreamEvent, Usage};

/// Which terminal marker is authoritative for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionPolicy {
    SinglePrompt,
    Pipeline,
}

/// The authoritative outcome extracted from a run's stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalResult {
    Agent(ResultEvent),
    Plan(PipelineEvent),
}

impl FinalResult {
    /// Whether the extracted outcome reports success.
    pub fn succeeded(&self) -> bool {
        match self {
            FinalResult::Agent(result) => !result.is_error(),
            FinalResult::Plan(plan) => plan.status == Some(Status::Succeeded),
        }
    }

    pub fn usage(&self) -> Usage {
        match self {
            FinalResult::Agent(result) => result.usage,
            FinalResult::Plan(plan) => plan.usage.unwrap_or_default(),
        }
    }
}

/// Incrementally tracks final-result candidates while a stream is consumed.
///
/// Holds only the latest candidate per policy, so it can sit behind an
/// arbitrarily long stream.
#[derive(Debug, Default, Clone)]
pub struct FinalResultTracker {
    last_result: Option<ResultEvent>,
    last_plan_result: Option<PipelineEvent>,
    results_seen: usize,
}

impl FinalResultTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Result(result) => {
                self.results_seen += 1;
                self.last_result = Some(result.clone());
            }
            StreamEvent::Pipeline(pipeline) if pipeline.is_plan_result() => {
                self.last_plan_result = Some(pipeline.clone());
            }
            _ => {}
        }
    }

    pub fn observe_line(&mut self, line: &DecodedLine) {
        if let Some(event) = line.event() {
            self.observe(event);
        }
    }

    /// Number of `result` events observed so far.
    pub fn results_seen(&self) -> usize {
        self.results_seen
    }

    /// Returns the authoritative result under `policy`, if any was seen.
    pub fn final_result(&self, policy: ExtractionPolicy) -> Option<FinalResult> {
        match policy {
            ExtractionPolicy::SinglePrompt => self.last_result.clone().map(FinalResult::Agent),
            ExtractionPolicy::Pipeline => self.last_plan_result.clone().map(FinalResult::Plan),
        }
    }
}

/// Last `result` event in a fully collected sequence.
pub fn extract_single_result(lines: &[DecodedLine]) -> Option<ResultEvent> {
    lines.iter().rev().find_map(|line| match line.event() {
        Some(StreamEvent::Result(result)) => Some(result.clone()),
        _ => None,
    })
}

/// Last plan-result marker in a fully collected sequence.
pub fn extract_pipeline_result(lines: &[DecodedLine]) -> Option<PipelineEvent> {
    lines.iter().rev().find_map(|line| match line.event() {
        Some(StreamEvent::Pipeline(pipeline)) if pipeline.is_plan_result() => {
            Some(pipeline.clone())
        }
        _ => None,
    })
}

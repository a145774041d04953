//! # boxrun-proto
//!
//! Wire types and codec for the boxrun output stream.
//!
//! This crate provides:
//! - `StreamEvent`, the tagged union carried one-per-line on a run's combined output
//! - `EventCodec`, which classifies each raw line into an event or text passthrough
//! - Final-result extraction for single-prompt and pipeline runs
//! - `EventEmitter`, the flush-per-line writer the pipeline engine reports through

mod codec;
mod emitter;
mod event;
mod extract;

pub use codec::{Decoded, DecodedLine, EventCodec, truncate};
pub use emitter::{EventEmitter, MemorySink};
pub use event::{
    ModelUsage, PipelineEvent, PipelinePhase, PipelineScope, ResultEvent, ResultStatus, Status,
    StreamEvent, SystemEvent, TodoEvent, TodoStatus, ToolEvent, ToolPhase, Usage,
};
pub use extract::{
    ExtractionPolicy, FinalResult, FinalResultTracker, extract_pipeline_result,
    extract_single_result,
};

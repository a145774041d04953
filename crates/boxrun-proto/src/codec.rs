//! Line codec for the combined container output stream.
//!
//! Each line is classified independently into either a [`StreamEvent`] or a
//! plain-text passthrough. Decoding never fails: malformed JSON, JSON without
//! a recognized discriminator, and JSON whose variant body does not match are
//! all returned as text, and the next line decodes as if nothing happened.
//!
//! Two discriminators are understood:
//! - `kind`: boxrun's native events (system, tool, todo, pipeline, result).
//! - `type`: the agent CLI's `--output-format stream-json` lines, mapped onto
//!   the native set.

use crate::event::{
    ModelUsage, PipelineEvent, ResultEvent, ResultStatus, StreamEvent, SystemEvent, TodoEvent,
    ToolEvent, ToolPhase, Usage,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Outcome of classifying one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(StreamEvent),
    /// Text to display. For agent text messages this is the message text,
    /// otherwise the raw line unchanged.
    Text(String),
}

/// One line of output together with its classification.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLine {
    /// The line as received, without its line terminator.
    pub raw: String,
    pub decoded: Decoded,
}

impl DecodedLine {
    pub fn event(&self) -> Option<&StreamEvent> {
        match &self.decoded {
            Decoded::Event(event) => Some(event),
            Decoded::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.decoded {
            Decoded::Text(text) => Some(text),
            Decoded::Event(_) => None,
        }
    }
}

/// Decodes output lines one at a time.
///
/// The only state carried between lines is the last session seen, which
/// callers may use to attribute later text output.
#[derive(Debug, Default)]
pub struct EventCodec {
    session: Option<SystemEvent>,
}

impl EventCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes the next line of output.
    pub fn decode(&mut self, line: &str) -> DecodedLine {
        let raw = line.trim_end_matches(['\r', '\n']).to_string();
        let decoded = Self::classify(&raw);
        if let Decoded::Event(StreamEvent::System(system)) = &decoded {
            self.session = Some(system.clone());
        }
        DecodedLine { raw, decoded }
    }

    /// The most recent session/model announced on the stream.
    pub fn session(&self) -> Option<&SystemEvent> {
        self.session.as_ref()
    }

    /// Stateless classification of a single line.
    pub fn classify(line: &str) -> Decoded {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return Decoded::Text(line.to_string());
        }

        let value = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) => value,
            Err(e) => {
                debug!(
                    "Passing through malformed JSON line: {} (error: {})",
                    truncate(trimmed, 100),
                    e
                );
                return Decoded::Text(line.to_string());
            }
        };

        match decode_value(&value) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => Decoded::Text(line.to_string()),
            Err(e) => {
                debug!(
                    "Passing through undecodable event: {} (error: {})",
                    truncate(trimmed, 100),
                    e
                );
                Decoded::Text(line.to_string())
            }
        }
    }
}

/// Single dispatch point over both discriminators.
fn decode_value(value: &Value) -> Result<Option<Decoded>, serde_json::Error> {
    if let Some(kind) = value.get("kind").and_then(Value::as_str) {
        let event = match kind {
            "system" => StreamEvent::System(decode_variant::<SystemEvent>(value)?),
            "tool" => StreamEvent::Tool(decode_variant::<ToolEvent>(value)?),
            "todo" => StreamEvent::Todo(decode_variant::<TodoEvent>(value)?),
            "pipeline" => StreamEvent::Pipeline(decode_variant::<PipelineEvent>(value)?),
            "result" => StreamEvent::Result(decode_variant::<ResultEvent>(value)?),
            _ => return Ok(None),
        };
        return Ok(Some(Decoded::Event(event)));
    }

    match value.get("type").and_then(Value::as_str) {
        Some("system") => decode_agent_system(value),
        Some("assistant") => decode_agent_assistant(value),
        Some("user") => decode_agent_user(value),
        Some("result") => decode_agent_result(value).map(Some),
        _ => Ok(None),
    }
}

fn decode_variant<T: DeserializeOwned>(value: &Value) -> Result<T, serde_json::Error> {
    T::deserialize(value)
}

// ─────────────────────────────────────────────────────────────────────────────
// Agent CLI stream-json mapping
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AgentSystem {
    session_id: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct AgentMessage<B> {
    message: AgentContent<B>,
}

#[derive(Deserialize)]
struct AgentContent<B> {
    #[serde(default = "Vec::new")]
    content: Vec<B>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AssistantBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum UserBlock {
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct AgentResult {
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    num_turns: u32,
    #[serde(default)]
    usage: Usage,
    #[serde(default, rename = "modelUsage")]
    model_usage: BTreeMap<String, AgentModelUsage>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentModelUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default, rename = "costUSD")]
    cost_usd: f64,
}

fn decode_agent_system(value: &Value) -> Result<Option<Decoded>, serde_json::Error> {
    let system = AgentSystem::deserialize(value)?;
    // Only the init line carries a session id; other system lines are notices.
    Ok(system.session_id.map(|session_id| {
        Decoded::Event(StreamEvent::System(SystemEvent {
            session_id,
            model: system.model.unwrap_or_default(),
        }))
    }))
}

fn decode_agent_assistant(value: &Value) -> Result<Option<Decoded>, serde_json::Error> {
    let message = AgentMessage::<AssistantBlock>::deserialize(value)?;
    let mut texts = Vec::new();
    for block in message.message.content {
        match block {
            AssistantBlock::ToolUse { id, name, input } => {
                return Ok(Some(Decoded::Event(StreamEvent::Tool(ToolEvent {
                    tool_use_id: id,
                    name: Some(name),
                    phase: ToolPhase::Start,
                    payload: input,
                    is_error: false,
                }))));
            }
            AssistantBlock::Text { text } => texts.push(text),
            AssistantBlock::Other => {}
        }
    }
    if texts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Decoded::Text(texts.join("\n"))))
    }
}

fn decode_agent_user(value: &Value) -> Result<Option<Decoded>, serde_json::Error> {
    let message = AgentMessage::<UserBlock>::deserialize(value)?;
    Ok(message.message.content.into_iter().find_map(|block| match block {
        UserBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(Decoded::Event(StreamEvent::Tool(ToolEvent {
            tool_use_id,
            name: None,
            phase: ToolPhase::Done,
            payload: content,
            is_error,
        }))),
        UserBlock::Other => None,
    }))
}

fn decode_agent_result(value: &Value) -> Result<Decoded, serde_json::Error> {
    let result = AgentResult::deserialize(value)?;
    let errored = result.is_error
        || result
            .subtype
            .as_deref()
            .is_some_and(|subtype| subtype.starts_with("error"));
    let model_usage = result
        .model_usage
        .into_iter()
        .map(|(model, usage)| {
            (
                model,
                ModelUsage {
                    usage: Usage {
                        input_tokens: usage.input_tokens,
                        output_tokens: usage.output_tokens,
                        cache_read_input_tokens: usage.cache_read_input_tokens,
                        cache_creation_input_tokens: usage.cache_creation_input_tokens,
                    },
                    cost_usd: usage.cost_usd,
                },
            )
        })
        .collect();

    Ok(Decoded::Event(StreamEvent::Result(ResultEvent {
        status: if errored {
            ResultStatus::Error
        } else {
            ResultStatus::Success
        },
        usage: result.usage,
        cost_usd: result.total_cost_usd,
        duration_ms: result.duration_ms,
        num_turns: result.num_turns,
        model_usage,
        session_id: result.session_id,
    })))
}

/// Truncates a string to at most `max_len` characters, adding "..." if truncated.
///
/// Cuts on a char boundary so multi-byte characters are never split.
pub fn truncate(s: &str, max_len: usize) -> String {
    match s.char_indices().nth(max_len) {
        Some((byte_idx, _)) => format!("{}...", &s[..byte_idx]),
        None => s.to_string(),
    }
}

//! Upstream Event Decoding
//!
//! Decodes the NDJSON lines of an Ollama-compatible `/api/chat` stream and
//! tracks the in-band reasoning protocol some models use.
//!
//! # Wire Shape
//!
//! ```text
//! {"model":"qwen3","message":{"role":"assistant","content":"Hi"},"done":false}   ← Delta
//! {"model":"qwen3","message":{...},"done":true,"done_reason":"stop",...}        ← Final
//! ```
//!
//! The `done` flag is the only discriminant. Fields this module does not model
//! are carried through untouched so re-serialized lines stay faithful to the
//! backend's output.
//!
//! # Reasoning Sentinels
//!
//! Models without native reasoning output wrap their chain of thought in
//! `<think>` / `</think>` tokens, each delivered as its own delta. The
//! [`EventParser`] detects this on the first delta, moves the enclosed content
//! into the `thinking` field, and blanks the sentinel deltas themselves.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Content of the delta that opens a reasoning segment
pub const REASONING_OPEN: &str = "<think>";

/// Content of the delta that closes a reasoning segment
pub const REASONING_CLOSE: &str = "</think>";

/// Longest slice of an offending line quoted in a [`MalformedEvent`]
const EXCERPT_LIMIT: usize = 120;

// ============================================================================
// Phase
// ============================================================================

/// Coarse lifecycle state of a streamed response
///
/// Serialized with the names monitor clients already understand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// The model is producing reasoning text
    #[serde(rename = "thinking")]
    Reasoning,
    /// The model is producing answer text
    #[serde(rename = "responding")]
    Answering,
    /// The terminal event has been processed
    #[serde(rename = "done")]
    Finished,
}

impl Phase {
    /// Check if the terminal event has been processed
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Wire name of this phase
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reasoning => "thinking",
            Self::Answering => "responding",
            Self::Finished => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Wire Types
// ============================================================================

/// Function half of a tool invocation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolFunction {
    /// Name of the function the model wants called
    #[serde(default)]
    pub name: String,
    /// Arguments as produced by the model
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A tool invocation requested by the model
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// The function to invoke
    pub function: ToolFunction,
    /// Fields not modelled here (ids, indices)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A chat message, used both in requests and in streamed deltas
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role ("system", "user", "assistant", "tool")
    #[serde(default)]
    pub role: String,
    /// Message text (incremental when carried by a delta)
    #[serde(default)]
    pub content: String,
    /// Reasoning text (incremental when carried by a delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Tool invocations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Fields not modelled here (images, tool names)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    /// Create a message with a role and content
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Default::default()
        }
    }
}

/// Inbound chat request, as accepted from clients and forwarded upstream
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Requested model
    #[serde(default)]
    pub model: String,
    /// Conversation history
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Whether the client wants a streamed response (defaults to true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Backend sampling options
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// Tool definitions offered to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    /// Fields not modelled here (format, keep_alive, think)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatRequest {
    /// Create a request for a model with the given messages
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Default::default()
        }
    }

    /// Whether the client asked for a streamed response
    #[must_use]
    pub fn wants_stream(&self) -> bool {
        self.stream.unwrap_or(true)
    }
}

/// Non-terminal event carrying a message fragment
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaEvent {
    /// Model that produced the fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Backend timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// The fragment itself
    pub message: ChatMessage,
    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Terminal event carrying completion metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalEvent {
    /// Model that produced the response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Backend timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Trailing message (empty for streamed responses)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    /// Why generation stopped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_reason: Option<String>,
    /// Wall time of the whole request in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<u64>,
    /// Model load time in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_duration: Option<u64>,
    /// Prompt tokens evaluated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_count: Option<u64>,
    /// Prompt evaluation time in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_eval_duration: Option<u64>,
    /// Tokens generated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_count: Option<u64>,
    /// Generation time in nanoseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eval_duration: Option<u64>,
    /// Fields not modelled here
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Serializes `body` with the `done` discriminant appended
#[derive(Serialize)]
pub(crate) struct WithDone<'a, T> {
    #[serde(flatten)]
    pub(crate) body: &'a T,
    pub(crate) done: bool,
}

// ============================================================================
// RawEvent
// ============================================================================

/// One decoded line of the upstream stream
#[derive(Clone, Debug, PartialEq)]
pub enum RawEvent {
    /// Partial message fragment
    Delta(DeltaEvent),
    /// Completion metadata, always the last event
    Final(FinalEvent),
}

impl RawEvent {
    /// Decode one NDJSON line
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEvent`] if the line is not a JSON object matching
    /// either variant.
    pub fn decode(line: &[u8]) -> Result<Self, MalformedEvent> {
        let value: Value =
            serde_json::from_slice(line).map_err(|e| MalformedEvent::new(line, e))?;
        Self::from_value(value).map_err(|reason| MalformedEvent::new(line, reason))
    }

    fn from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut fields) = value else {
            return Err("expected a JSON object".to_string());
        };

        let done = match fields.remove("done") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(done)) => done,
            Some(other) => return Err(format!("`done` must be a boolean, got {other}")),
        };

        let fields = Value::Object(fields);
        if done {
            serde_json::from_value(fields)
                .map(Self::Final)
                .map_err(|e| e.to_string())
        } else {
            serde_json::from_value(fields)
                .map(Self::Delta)
                .map_err(|e| e.to_string())
        }
    }

    /// Check if this is the terminal event
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Final(_))
    }

    /// Model named by the event, if any
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::Delta(delta) => delta.model.as_deref(),
            Self::Final(fin) => fin.model.as_deref(),
        }
    }

    /// The message carried by the event, if any
    #[must_use]
    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            Self::Delta(delta) => Some(&delta.message),
            Self::Final(fin) => fin.message.as_ref(),
        }
    }

    /// Copy of this event with its message replaced
    #[must_use]
    pub fn with_message(&self, message: ChatMessage) -> Self {
        match self {
            Self::Delta(delta) => Self::Delta(DeltaEvent {
                message,
                ..delta.clone()
            }),
            Self::Final(fin) => Self::Final(FinalEvent {
                message: Some(message),
                ..fin.clone()
            }),
        }
    }
}

impl Serialize for RawEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Delta(delta) => WithDone {
                body: delta,
                done: false,
            }
            .serialize(serializer),
            Self::Final(fin) => WithDone {
                body: fin,
                done: true,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RawEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}

/// A line that is not a valid Delta or Final event
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed event: {reason} (line: {excerpt})")]
pub struct MalformedEvent {
    /// What was wrong with the line
    pub reason: String,
    /// Leading slice of the offending line
    pub excerpt: String,
}

impl MalformedEvent {
    fn new(line: &[u8], reason: impl ToString) -> Self {
        let text = String::from_utf8_lossy(line);
        let excerpt = match text.char_indices().nth(EXCERPT_LIMIT) {
            Some((end, _)) => format!("{}...", &text[..end]),
            None => text.into_owned(),
        };
        Self {
            reason: reason.to_string(),
            excerpt,
        }
    }
}

// ============================================================================
// EventParser
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SentinelMode {
    /// No delta seen yet
    Undetermined,
    /// Between the open and close sentinels
    Active,
    /// Closed, or never opened
    Inactive,
}

/// Decodes lines of one response and classifies its phase
///
/// One parser belongs to exactly one response stream; the sentinel protocol
/// is only recognised if the very first delta opens it.
#[derive(Clone, Debug)]
pub struct EventParser {
    phase: Phase,
    sentinel: SentinelMode,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    /// Create a parser for a fresh response
    ///
    /// The phase starts as [`Phase::Reasoning`] until the first delta shows
    /// whether the sentinel protocol is in use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            phase: Phase::Reasoning,
            sentinel: SentinelMode::Undetermined,
        }
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether delta content is currently being reclassified as reasoning
    #[must_use]
    pub fn in_reasoning_segment(&self) -> bool {
        self.sentinel == SentinelMode::Active
    }

    /// Decode a line and apply the sentinel rewrite to it
    ///
    /// # Errors
    ///
    /// Returns [`MalformedEvent`] if the line cannot be decoded. Parser state
    /// is left untouched in that case.
    pub fn process(&mut self, line: &[u8]) -> Result<RawEvent, MalformedEvent> {
        let mut event = RawEvent::decode(line)?;
        self.classify(&mut event);
        Ok(event)
    }

    /// Apply the sentinel rewrite to an already decoded event
    pub fn classify(&mut self, event: &mut RawEvent) {
        match event {
            RawEvent::Delta(delta) => self.classify_delta(&mut delta.message),
            RawEvent::Final(_) => self.phase = Phase::Finished,
        }
    }

    fn classify_delta(&mut self, message: &mut ChatMessage) {
        if self.sentinel == SentinelMode::Undetermined {
            if message.content == REASONING_OPEN {
                self.sentinel = SentinelMode::Active;
                self.phase = Phase::Reasoning;
                message.content.clear();
                return;
            }
            self.sentinel = SentinelMode::Inactive;
            self.phase = Phase::Answering;
        }

        if self.sentinel == SentinelMode::Active {
            if message.content == REASONING_CLOSE {
                self.sentinel = SentinelMode::Inactive;
                self.phase = Phase::Answering;
                message.content.clear();
                return;
            }
            message.thinking = Some(std::mem::take(&mut message.content));
        }
    }
}

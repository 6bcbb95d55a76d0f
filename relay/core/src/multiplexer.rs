//! Response Multiplexer
//!
//! A [`Multiplexer`] owns one upstream NDJSON byte stream. A single ingest task
//! reads it, decodes each line with an [`EventParser`], folds the result into a
//! [`ChatTurn`], and fans the event out to every attached subscriber.
//!
//! # Architecture
//!
//! ```text
//!   upstream bytes ──► ingest task ──► EventParser ──► MuxState
//!                                                     │  turn, phase, last event
//!                                                     │
//!                                  ┌──────────────────┼──────────────────┐
//!                                  ▼                  ▼                  ▼
//!                             Subscription       Subscription      await_completion()
//!                               (raw)             (annotated)
//! ```
//!
//! # Ordering
//!
//! State update and fan-out for one event happen under the same lock that
//! [`Multiplexer::subscribe`] takes, so a subscriber attaches strictly between
//! two events. It receives one replay of the accumulated state, then every
//! later event in arrival order.
//!
//! Subscribers never slow the ingest loop down; see [`crate::subscription`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{IngestError, MuxError, SinkError, SubscriptionError};
use crate::events::{ChatMessage, ChatRequest, EventParser, FinalEvent, Phase, RawEvent, WithDone};
use crate::registry::ResponseRegistry;
use crate::subscription::{
    encode_for, EventFrames, Subscriber, Subscription, SubscriptionMode, MIN_QUEUE_CAPACITY,
};
use crate::turn::ChatTurn;

// ============================================================================
// Identifiers and configuration
// ============================================================================

/// Unique identifier for a multiplexed response
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseId(Uuid);

impl ResponseId {
    /// Create a new random identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ResponseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResponseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResponseId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Configuration for multiplexers
#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Queue capacity of each subscription (one slot is reserved)
    pub subscriber_queue_capacity: usize,
    /// Longest partial line accepted without a newline
    pub max_line_bytes: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
            max_line_bytes: 1024 * 1024,
        }
    }
}

impl MultiplexerConfig {
    /// Set the subscription queue capacity (at least 2)
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity.max(MIN_QUEUE_CAPACITY);
        self
    }

    /// Set the maximum partial line length
    #[must_use]
    pub fn with_max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// The complete response: final metadata merged with the rebuilt turn
#[derive(Clone, Debug, PartialEq)]
pub struct MaterializedResponse {
    /// The final event, with `message` set to the rebuilt turn
    pub event: FinalEvent,
    /// The rebuilt turn
    pub turn: ChatTurn,
}

impl MaterializedResponse {
    /// Encode as a JSON document (no trailing newline)
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }
}

impl Serialize for MaterializedResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WithDone {
            body: &self.event,
            done: true,
        }
        .serialize(serializer)
    }
}

/// What registry inspection tools see of a response
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponseSummary {
    /// Response identifier
    pub id: ResponseId,
    /// Backend model, empty until the first event names it
    pub model: String,
    /// Current phase
    pub status: Phase,
    /// Messages of the original request
    pub messages: Vec<ChatMessage>,
    /// Options of the original request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// When the response was created
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
enum Completion {
    Pending,
    Finished,
    Failed(IngestError),
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug)]
struct MuxState {
    model: Option<String>,
    parser: EventParser,
    turn: ChatTurn,
    last_event: Option<RawEvent>,
    subscribers: Vec<Subscriber>,
    failure: Option<IngestError>,
    lines: u64,
}

impl MuxState {
    fn new() -> Self {
        Self {
            model: None,
            parser: EventParser::new(),
            turn: ChatTurn::new(),
            last_event: None,
            subscribers: Vec::new(),
            failure: None,
            lines: 0,
        }
    }

    fn absorb(&mut self, event: &RawEvent) {
        if self.model.is_none() {
            self.model = event.model().map(str::to_string);
        }
        if let RawEvent::Delta(delta) = event {
            self.turn.absorb(&delta.message);
        }
    }

    /// The last event with its message replaced by the turn so far
    fn snapshot_event(&self) -> Option<RawEvent> {
        self.last_event
            .as_ref()
            .map(|event| event.with_message(self.turn.to_message()))
    }
}

struct Shared {
    id: ResponseId,
    request: ChatRequest,
    created_at: DateTime<Utc>,
    started: Instant,
    config: MultiplexerConfig,
    state: Mutex<MuxState>,
    completion: watch::Sender<Completion>,
}

impl Shared {
    /// Decode one line, update state and fan it out
    ///
    /// Returns the phase after the line was applied.
    fn apply_line(&self, line: &[u8]) -> Result<Phase, IngestError> {
        let mut state = self.state.lock();
        if line.iter().all(u8::is_ascii_whitespace) {
            return Ok(state.parser.phase());
        }

        state.lines += 1;
        let line_no = state.lines;
        let event = state
            .parser
            .process(line)
            .map_err(|source| IngestError::MalformedEvent {
                line: line_no,
                source,
            })?;

        state.absorb(&event);
        let phase = state.parser.phase();

        let frames = EventFrames::encode(&event, phase, &self.request, &state.subscribers)
            .map_err(|e| IngestError::encode(&e))?;
        self.fan_out(&mut state, &frames);
        state.last_event = Some(event);

        if phase.is_finished() {
            let closed = state.subscribers.len();
            state.subscribers.clear();
            drop(state);
            self.completion.send_replace(Completion::Finished);
            info!(
                response_id = %self.id,
                lines = line_no,
                closed_subscribers = closed,
                "Response finished"
            );
        }
        Ok(phase)
    }

    fn fan_out(&self, state: &mut MuxState, frames: &EventFrames) {
        let subscribers = std::mem::take(&mut state.subscribers);
        for mut subscriber in subscribers {
            let Some(frame) = frames.frame_for(&subscriber) else {
                state.subscribers.push(subscriber);
                continue;
            };
            match subscriber.offer(frame) {
                Ok(()) => state.subscribers.push(subscriber),
                Err(SinkError::Closed) => {
                    debug!(
                        response_id = %self.id,
                        subscriber = %subscriber.id(),
                        "Subscriber closed, removing"
                    );
                }
                Err(SinkError::Faulted(error)) => {
                    warn!(
                        response_id = %self.id,
                        subscriber = %subscriber.id(),
                        error = %error,
                        "Subscriber faulted, removing"
                    );
                    subscriber.terminate(error);
                }
            }
        }
    }

    /// Stop ingest: tell every subscriber and waiter why
    fn fail(&self, error: IngestError) {
        let mut state = self.state.lock();
        warn!(
            response_id = %self.id,
            error = %error,
            phase = %state.parser.phase(),
            subscribers = state.subscribers.len(),
            "Ingest failed"
        );
        for subscriber in state.subscribers.drain(..) {
            subscriber.terminate(SubscriptionError::Ingest(error.clone()));
        }
        state.failure = Some(error.clone());
        drop(state);
        self.completion.send_replace(Completion::Failed(error));
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

/// One upstream response stream shared by any number of subscribers
///
/// Cheap to clone; all clones refer to the same response.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

impl Multiplexer {
    /// Create a multiplexer, register it, and start its ingest task
    ///
    /// Returns immediately; the upstream is read in the background. Must be
    /// called from within a Tokio runtime.
    pub fn spawn<S, E>(
        registry: &ResponseRegistry,
        config: MultiplexerConfig,
        request: ChatRequest,
        upstream: S,
    ) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let multiplexer = Self::new(config, request);
        multiplexer.start(registry, upstream);
        multiplexer
    }

    /// Like [`Self::spawn`], with one subscriber attached before ingest begins
    ///
    /// The returned subscription sees every event exactly as it arrives,
    /// with no replay line. This is what the requesting client gets.
    pub fn spawn_subscribed<S, E>(
        registry: &ResponseRegistry,
        config: MultiplexerConfig,
        request: ChatRequest,
        upstream: S,
        mode: SubscriptionMode,
    ) -> (Self, Subscription)
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let multiplexer = Self::new(config, request);
        let subscription = multiplexer.subscribe(mode);
        multiplexer.start(registry, upstream);
        (multiplexer, subscription)
    }

    fn new(config: MultiplexerConfig, request: ChatRequest) -> Self {
        let (completion, _) = watch::channel(Completion::Pending);
        let shared = Arc::new(Shared {
            id: ResponseId::new(),
            request,
            created_at: Utc::now(),
            started: Instant::now(),
            config,
            state: Mutex::new(MuxState::new()),
            completion,
        });
        Self { shared }
    }

    fn start<S, E>(&self, registry: &ResponseRegistry, upstream: S)
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        registry.put(self.clone());
        info!(
            response_id = %self.id(),
            model = %self.shared.request.model,
            "Response stream started"
        );
        tokio::spawn(ingest(Arc::clone(&self.shared), upstream));
    }

    /// Response identifier
    #[must_use]
    pub fn id(&self) -> ResponseId {
        self.shared.id
    }

    /// The original request
    #[must_use]
    pub fn request(&self) -> &ChatRequest {
        &self.shared.request
    }

    /// When the response was created
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.shared.created_at
    }

    /// Time elapsed between creation and `now`
    #[must_use]
    pub fn age_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.shared.started)
    }

    /// Backend model name, once an event has named it
    #[must_use]
    pub fn model(&self) -> Option<String> {
        self.shared.state.lock().model.clone()
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.state.lock().parser.phase()
    }

    /// Snapshot of the turn accumulated so far
    #[must_use]
    pub fn turn(&self) -> ChatTurn {
        self.shared.state.lock().turn.clone()
    }

    /// The ingest failure, if ingest failed
    #[must_use]
    pub fn failure(&self) -> Option<IngestError> {
        self.shared.state.lock().failure.clone()
    }

    /// Whether ingest has ended, either finished or failed
    #[must_use]
    pub fn is_settled(&self) -> bool {
        let state = self.shared.state.lock();
        state.parser.phase().is_finished() || state.failure.is_some()
    }

    /// Number of attached subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.state.lock().subscribers.len()
    }

    /// Attach a new subscriber
    ///
    /// - Finished: the subscription yields the materialized result once, then ends.
    /// - In flight: it yields a replay of the accumulated state (if any event
    ///   was processed), then every later event.
    /// - Failed: it yields the replay (if any), then the ingest failure.
    #[must_use]
    pub fn subscribe(&self, mode: SubscriptionMode) -> Subscription {
        let (mut subscriber, subscription) =
            Subscription::channel(mode, self.shared.config.subscriber_queue_capacity);

        let mut state = self.shared.state.lock();
        let phase = state.parser.phase();

        if let Some(snapshot) = state.snapshot_event() {
            let frame = encode_for(&snapshot, phase, &self.shared.request, mode, false);
            let delivered = match frame {
                Ok(frame) => subscriber.offer(frame).is_ok(),
                Err(e) => {
                    subscriber.terminate(IngestError::encode(&e).into());
                    return subscription;
                }
            };
            if !delivered {
                return subscription;
            }
        }

        if phase.is_finished() {
            debug!(
                response_id = %self.shared.id,
                subscriber = %subscriber.id(),
                "Served materialized response to late subscriber"
            );
            return subscription;
        }

        if let Some(ref error) = state.failure {
            subscriber.terminate(SubscriptionError::Ingest(error.clone()));
            return subscription;
        }

        debug!(
            response_id = %self.shared.id,
            subscriber = %subscriber.id(),
            mode = ?mode,
            replayed = subscriber.is_initialized(),
            "Subscriber attached"
        );
        state.subscribers.push(subscriber);
        subscription
    }

    /// Wait until the response finishes
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Ingest`] if the ingest loop failed.
    pub async fn await_completion(&self) -> Result<MaterializedResponse, MuxError> {
        let mut completion = self.shared.completion.subscribe();
        let outcome = completion
            .wait_for(|c| !matches!(c, Completion::Pending))
            .await
            .map(|c| Completion::clone(&c))
            .map_err(|_| MuxError::NoFinalState(self.shared.id))?;

        match outcome {
            Completion::Failed(error) => Err(error.into()),
            Completion::Finished | Completion::Pending => self.materialize(),
        }
    }

    /// The complete response, without waiting
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::NoFinalState`] if the response has not finished.
    /// Callers that need the result should use [`Self::await_completion`].
    pub fn materialize(&self) -> Result<MaterializedResponse, MuxError> {
        let state = self.shared.state.lock();
        match state.last_event {
            Some(RawEvent::Final(ref last)) if state.parser.phase().is_finished() => {
                Ok(MaterializedResponse {
                    event: FinalEvent {
                        message: Some(state.turn.to_message()),
                        ..last.clone()
                    },
                    turn: state.turn.clone(),
                })
            }
            _ => Err(MuxError::NoFinalState(self.shared.id)),
        }
    }

    /// Registry view of this response
    #[must_use]
    pub fn summary(&self) -> ResponseSummary {
        let state = self.shared.state.lock();
        ResponseSummary {
            id: self.shared.id,
            model: state.model.clone().unwrap_or_default(),
            status: state.parser.phase(),
            messages: self.shared.request.messages.clone(),
            options: self.shared.request.options.clone(),
            created_at: self.shared.created_at,
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Multiplexer")
            .field("id", &self.shared.id)
            .field("phase", &state.parser.phase())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

// ============================================================================
// Ingest loop
// ============================================================================

/// Splits a byte stream into lines, keeping any partial line for later
///
/// `scanned` marks how much of `pending` is known to hold no delimiter, so a
/// long line arriving in small chunks is searched once.
struct LineBuffer {
    pending: BytesMut,
    scanned: usize,
    max_line_bytes: usize,
}

impl LineBuffer {
    fn new(max_line_bytes: usize) -> Self {
        Self {
            pending: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        let Some(offset) = self.pending[self.scanned..].iter().position(|byte| *byte == b'\n') else {
            self.scanned = self.pending.len();
            return None;
        };
        let mut line = self.pending.split_to(self.scanned + offset + 1);
        self.scanned = 0;
        line.truncate(line.len() - 1);
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(line)
    }

    fn check_limit(&self) -> Result<(), IngestError> {
        if self.pending.len() > self.max_line_bytes {
            return Err(IngestError::LineTooLong {
                limit: self.max_line_bytes,
            });
        }
        Ok(())
    }

    fn take_remainder(&mut self) -> Option<BytesMut> {
        self.scanned = 0;
        let rest = self.pending.split();
        (!rest.iter().all(u8::is_ascii_whitespace)).then_some(rest)
    }
}

async fn ingest<S, E>(shared: Arc<Shared>, upstream: S)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    match read_upstream(&shared, upstream).await {
        Ok(()) => debug!(response_id = %shared.id, "Ingest loop done"),
        Err(error) => shared.fail(error),
    }
}

async fn read_upstream<S, E>(shared: &Shared, upstream: S) -> Result<(), IngestError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut upstream = std::pin::pin!(upstream);
    let mut buffer = LineBuffer::new(shared.config.max_line_bytes);

    while let Some(chunk) = upstream.next().await {
        let chunk = chunk.map_err(|e| IngestError::Upstream(e.to_string()))?;
        buffer.push(&chunk);
        while let Some(line) = buffer.next_line() {
            if shared.apply_line(&line)?.is_finished() {
                return Ok(());
            }
        }
        buffer.check_limit()?;
    }

    if let Some(line) = buffer.take_remainder() {
        if shared.apply_line(&line)?.is_finished() {
            return Ok(());
        }
    }
    Err(IngestError::Truncated)
}

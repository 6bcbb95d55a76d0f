//! Subscriber Channels
//!
//! Each subscriber owns a bounded queue of encoded NDJSON lines. The ingest
//! loop never waits on a queue: one slot is always kept free for a terminal
//! error, and a subscriber whose next frame would take that slot is faulted
//! with [`SubscriptionError::Lagged`] and dropped.
//!
//! ```text
//!   ingest loop ──try_send──► [frame][frame][ ][ ][reserved] ──► Subscription (Stream)
//! ```

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{SinkError, SubscriptionError};
use crate::events::{ChatRequest, Phase};

/// Smallest usable queue: one frame plus the reserved terminal slot
pub const MIN_QUEUE_CAPACITY: usize = 2;

/// Item yielded by a [`Subscription`]
pub type SubscriptionItem = Result<Bytes, SubscriptionError>;

/// Representation a subscriber wants
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Lines mirror the upstream events
    #[default]
    Raw,
    /// Lines also carry the phase, and the first line echoes the request
    Annotated,
}

/// Unique identifier for a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ============================================================================
// Producer side
// ============================================================================

/// The multiplexer's handle on one subscriber
pub(crate) struct Subscriber {
    id: SubscriberId,
    mode: SubscriptionMode,
    initialized: bool,
    capacity: usize,
    tx: mpsc::Sender<SubscriptionItem>,
}

impl Subscriber {
    pub(crate) fn id(&self) -> SubscriberId {
        self.id
    }

    pub(crate) fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Whether this subscriber has been sent its first line
    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Queue a frame without waiting
    pub(crate) fn offer(&mut self, frame: Bytes) -> Result<(), SinkError> {
        if self.tx.is_closed() {
            return Err(SinkError::Closed);
        }
        if self.tx.capacity() <= 1 {
            return Err(SinkError::Faulted(SubscriptionError::Lagged {
                capacity: self.capacity,
            }));
        }
        match self.tx.try_send(Ok(frame)) {
            Ok(()) => {
                self.initialized = true;
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(SinkError::Closed),
            Err(TrySendError::Full(_)) => Err(SinkError::Faulted(SubscriptionError::Lagged {
                capacity: self.capacity,
            })),
        }
    }

    /// Deliver a terminal error and drop the sender
    ///
    /// Uses the reserved slot, so it only fails if the receiver is gone.
    pub(crate) fn terminate(self, error: SubscriptionError) {
        let _ = self.tx.try_send(Err(error));
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("initialized", &self.initialized)
            .finish()
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// A live view of one response stream
///
/// Yields encoded NDJSON lines (each ending in `\n`). The stream ends after
/// the final event, or after a terminal [`SubscriptionError`].
pub struct Subscription {
    id: SubscriberId,
    mode: SubscriptionMode,
    inner: ReceiverStream<SubscriptionItem>,
}

impl Subscription {
    /// Create a connected subscriber/subscription pair
    pub(crate) fn channel(mode: SubscriptionMode, capacity: usize) -> (Subscriber, Self) {
        let capacity = capacity.max(MIN_QUEUE_CAPACITY);
        let (tx, rx) = mpsc::channel(capacity);
        let id = SubscriberId::next();
        let subscriber = Subscriber {
            id,
            mode,
            initialized: false,
            capacity,
            tx,
        };
        let subscription = Self {
            id,
            mode,
            inner: ReceiverStream::new(rx),
        };
        (subscriber, subscription)
    }

    /// Identifier of this subscription
    #[must_use]
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Representation this subscription receives
    #[must_use]
    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    /// Stop receiving
    ///
    /// Frames already queued can still be drained; the multiplexer drops this
    /// subscriber on its next fan-out.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Stream for Subscription {
    type Item = SubscriptionItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish()
    }
}

// ============================================================================
// Frame encoding
// ============================================================================

/// An event line with the phase attached, and the request on first delivery
#[derive(Serialize)]
struct AnnotatedLine<'a, T> {
    #[serde(flatten)]
    event: &'a T,
    status: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    request: Option<&'a ChatRequest>,
}

fn to_line<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(Bytes::from(buf))
}

/// Encode `event` for a single subscriber
pub(crate) fn encode_for<T: Serialize>(
    event: &T,
    phase: Phase,
    request: &ChatRequest,
    mode: SubscriptionMode,
    initialized: bool,
) -> Result<Bytes, serde_json::Error> {
    match mode {
        SubscriptionMode::Raw => to_line(event),
        SubscriptionMode::Annotated => to_line(&AnnotatedLine {
            event,
            status: phase,
            request: (!initialized).then_some(request),
        }),
    }
}

/// Encoded variants of one event, each built at most once
#[derive(Debug, Default)]
pub(crate) struct EventFrames {
    raw: Option<Bytes>,
    annotated: Option<Bytes>,
    annotated_with_request: Option<Bytes>,
}

impl EventFrames {
    /// Encode only the variants the given subscribers need
    pub(crate) fn encode<T: Serialize>(
        event: &T,
        phase: Phase,
        request: &ChatRequest,
        subscribers: &[Subscriber],
    ) -> Result<Self, serde_json::Error> {
        let needs = |mode: SubscriptionMode, initialized: bool| {
            subscribers.iter().any(|s| {
                s.mode() == mode && (mode == SubscriptionMode::Raw || s.is_initialized() == initialized)
            })
        };

        let mut frames = Self::default();
        if needs(SubscriptionMode::Raw, true) {
            frames.raw = Some(encode_for(event, phase, request, SubscriptionMode::Raw, true)?);
        }
        if needs(SubscriptionMode::Annotated, true) {
            frames.annotated =
                Some(encode_for(event, phase, request, SubscriptionMode::Annotated, true)?);
        }
        if needs(SubscriptionMode::Annotated, false) {
            frames.annotated_with_request =
                Some(encode_for(event, phase, request, SubscriptionMode::Annotated, false)?);
        }
        Ok(frames)
    }

    /// The frame a given subscriber should receive
    pub(crate) fn frame_for(&self, subscriber: &Subscriber) -> Option<Bytes> {
        let frame = match (subscriber.mode(), subscriber.is_initialized()) {
            (SubscriptionMode::Raw, _) => &self.raw,
            (SubscriptionMode::Annotated, true) => &self.annotated,
            (SubscriptionMode::Annotated, false) => &self.annotated_with_request,
        };
        frame.clone()
    }
}

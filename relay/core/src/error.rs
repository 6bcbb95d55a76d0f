//! Error Types
//!
//! Ingest failures are global to one multiplexer and are cloned out to every
//! subscriber and waiter, so they carry rendered messages rather than source
//! errors that cannot be cloned.

use thiserror::Error;

use crate::events::MalformedEvent;
use crate::multiplexer::ResponseId;

/// Failure that aborts a multiplexer's ingest loop
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IngestError {
    /// A line could not be decoded
    #[error("line {line}: {source}")]
    MalformedEvent {
        /// 1-based index of the offending non-blank line
        line: u64,
        /// Decode failure
        source: MalformedEvent,
    },

    /// Reading from the upstream source failed
    #[error("upstream read failed: {0}")]
    Upstream(String),

    /// A line grew past the configured limit without a delimiter
    #[error("line exceeds {limit} bytes without a newline")]
    LineTooLong {
        /// Configured limit in bytes
        limit: usize,
    },

    /// Upstream ended before the final event
    #[error("upstream closed before the final event")]
    Truncated,

    /// An outgoing line could not be serialized
    #[error("failed to encode event: {0}")]
    Encode(String),
}

impl IngestError {
    pub(crate) fn encode(error: &serde_json::Error) -> Self {
        Self::Encode(error.to_string())
    }
}

/// Errors returned by multiplexer operations
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MuxError {
    /// The ingest loop failed
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// A materialized result was requested before the response finished
    #[error("response {0} has no final state")]
    NoFinalState(ResponseId),
}

/// Terminal error delivered as the last item of a subscription
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The response's ingest loop failed
    #[error(transparent)]
    Ingest(#[from] IngestError),

    /// The subscriber fell behind and its queue filled up
    #[error("subscriber fell behind (queue capacity {capacity})")]
    Lagged {
        /// Queue capacity of the subscription
        capacity: usize,
    },
}

/// Outcome of offering a frame to one subscriber
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub(crate) enum SinkError {
    /// The subscriber went away; it is dropped silently
    #[error("subscriber closed")]
    Closed,

    /// The subscriber cannot take more frames; it is told why and dropped
    #[error("subscriber faulted: {0}")]
    Faulted(SubscriptionError),
}

/// Registry lookup failure
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    /// The caller did not supply an identifier
    #[error("no id provided")]
    MissingIdentifier,

    /// No response is indexed under the identifier
    #[error("response {0} not found")]
    NotFound(String),
}

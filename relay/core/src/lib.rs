//! Relay Core - Streaming Response Multiplexer
//!
//! This crate turns one upstream chat-completion stream (newline-delimited
//! JSON, Ollama `/api/chat` format) into any number of independent live views.
//! It never talks to a backend itself: callers hand it a byte stream and get
//! back a [`Multiplexer`] they can subscribe to, await, or look up later.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         HTTP passthrough                          │
//! │   POST /api/chat            GET /api/monitor/chat?id=             │
//! └────────┬──────────────────────────────────┬──────────────────────┘
//!          │ upstream bytes                   │ lookup(id)
//! ┌────────▼──────────────────────────────────▼──────────────────────┐
//! │                          RELAY CORE                               │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌────────────────────┐  │
//! │  │ EventParser │──►│   Multiplexer    │◄──│ ResponseRegistry   │  │
//! │  │ (sentinels) │   │ turn + fan-out   │   │ bounded + swept    │  │
//! │  └─────────────┘   └───────┬──────────┘   └────────────────────┘  │
//! │                    ┌───────┴───────┐                              │
//! │              Subscription    Subscription                         │
//! │                 (raw)         (annotated)                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`EventParser`]: Decodes lines and splits `<think>` reasoning out of content
//! - [`Multiplexer`]: Owns one upstream stream and its reconstructed [`ChatTurn`]
//! - [`Subscription`]: A live, bounded view of one response
//! - [`ResponseRegistry`]: Index of recent responses with count and age limits
//! - [`RelayConfig`]: Layered configuration (file, environment, CLI)
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::{Multiplexer, MultiplexerConfig, RegistryConfig, ResponseRegistry};
//! use relay_core::{ChatRequest, SubscriptionMode};
//! use futures::StreamExt;
//!
//! let registry = ResponseRegistry::new(RegistryConfig::default());
//! let sweeper = registry.start_sweeper();
//!
//! let mux = Multiplexer::spawn(&registry, MultiplexerConfig::default(), request, upstream);
//! let mut lines = mux.subscribe(SubscriptionMode::Raw);
//! while let Some(line) = lines.next().await {
//!     // forward line to the client
//! }
//!
//! sweeper.stop().await;
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod registry;
pub mod subscription;
pub mod turn;

// Re-exports for convenience
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig,
};
pub use error::{IngestError, LookupError, MuxError, SubscriptionError};
pub use events::{
    ChatMessage, ChatRequest, DeltaEvent, EventParser, FinalEvent, MalformedEvent, Phase,
    RawEvent, ToolCall, ToolFunction, REASONING_CLOSE, REASONING_OPEN,
};
pub use multiplexer::{
    MaterializedResponse, Multiplexer, MultiplexerConfig, ResponseId, ResponseSummary,
};
pub use registry::{RegistryConfig, ResponseRegistry, SweeperHandle};
pub use subscription::{SubscriberId, Subscription, SubscriptionItem, SubscriptionMode};
pub use turn::ChatTurn;

//! Ollama Backend Client
//!
//! Opens `/api/chat` streams against an Ollama-compatible server. The response
//! body is handed to the core untouched; decoding happens in the multiplexer.

use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use relay_core::{ChatRequest, RelayConfig};
use thiserror::Error;

/// Errors opening a backend stream
#[derive(Debug, Error)]
pub enum BackendError {
    /// The HTTP client could not be built
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// The request could not be sent
    #[error("backend request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend answered with a non-success status
    #[error("backend returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, as text
        body: String,
    },
}

/// Ollama backend client
#[derive(Clone, Debug)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// No overall request timeout is set: a generation may stream for as long
    /// as the backend keeps sending, and only a silent connection times out.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(BackendError::Client)?;
        Ok(Self {
            host: host.into(),
            port,
            http_client,
        })
    }

    /// Create from the relay configuration
    pub fn from_config(config: &RelayConfig) -> Result<Self, BackendError> {
        Self::new(
            config.backend_host.clone(),
            config.backend_port,
            config.connect_timeout,
            config.read_timeout,
        )
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Start a streamed chat completion
    ///
    /// The request is forwarded as given, except that `stream` is always
    /// `true`: the relay needs the incremental stream even when the client
    /// asked for a single document.
    pub async fn open_chat_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static, BackendError> {
        let mut upstream = request.clone();
        upstream.stream = Some(true);

        let response = self
            .http_client
            .post(self.chat_url())
            .json(&upstream)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status { status, body });
        }

        tracing::debug!(
            model = %request.model,
            url = %self.chat_url(),
            "Backend stream opened"
        );
        Ok(response.bytes_stream())
    }
}

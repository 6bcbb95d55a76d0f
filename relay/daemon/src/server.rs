//! HTTP Server
//!
//! Routes:
//!
//! | Method | Path                     | Response                                   |
//! |--------|--------------------------|--------------------------------------------|
//! | POST   | `/api/chat`              | raw NDJSON stream, or one JSON document    |
//! | GET    | `/api/monitor/chat`      | annotated NDJSON stream for `?id=`         |
//! | GET    | `/api/monitor/request`   | registry summary for `?id=`                |
//! | GET    | `/api/monitor/recent`    | response ids, most recent first            |
//!
//! Every chat request becomes a [`Multiplexer`] in the shared registry, so a
//! monitor can attach to it by id while the requesting client is still reading.

use std::convert::Infallible;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use futures::StreamExt;
use relay_core::{
    ChatRequest, LookupError, MuxError, Multiplexer, MultiplexerConfig, ResponseId,
    ResponseRegistry, ResponseSummary, Subscription, SubscriptionMode,
};
use serde::Deserialize;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::backend::{BackendError, OllamaBackend};

const NDJSON: &str = "application/x-ndjson";

/// Shared handler state
#[derive(Clone, Debug)]
pub struct AppState {
    /// Index of live and recent responses
    pub registry: ResponseRegistry,
    /// Backend the chat requests are forwarded to
    pub backend: OllamaBackend,
    /// Settings for every new multiplexer
    pub mux_config: MultiplexerConfig,
}

/// Build the relay router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat))
        .route("/api/monitor/chat", get(monitor_chat))
        .route("/api/monitor/request", get(monitor_request))
        .route("/api/monitor/recent", get(monitor_recent))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// Handler failure, rendered as `{"error": ...}`
#[derive(Debug, Error)]
pub enum ApiError {
    /// The chat request body is not a valid request
    #[error("invalid request body: {0}")]
    InvalidRequest(#[source] serde_json::Error),

    /// The `id` query parameter did not resolve
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The backend could not be reached or refused the request
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The response stream failed before it finished
    #[error(transparent)]
    Response(#[from] MuxError),

    /// The result could not be encoded
    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            Self::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            Self::Lookup(LookupError::MissingIdentifier) => {
                (StatusCode::BAD_REQUEST, "No id provided".to_string())
            }
            Self::Lookup(LookupError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "Response not found".to_string())
            }
            Self::Backend(_) | Self::Response(_) => (StatusCode::BAD_GATEWAY, self.to_string()),
            Self::Encode(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
struct IdQuery {
    id: Option<String>,
}

/// Forward a chat request
///
/// The body is decoded whatever its declared content type, since Ollama
/// clients commonly post JSON as a form (`curl -d`).
async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request: ChatRequest = serde_json::from_slice(&body).map_err(ApiError::InvalidRequest)?;
    let wants_stream = request.wants_stream();
    let upstream = state.backend.open_chat_stream(&request).await?;

    let (mux, subscription) = Multiplexer::spawn_subscribed(
        &state.registry,
        state.mux_config.clone(),
        request,
        upstream,
        SubscriptionMode::Raw,
    );
    info!(
        response_id = %mux.id(),
        stream = wants_stream,
        "Chat request accepted"
    );

    if wants_stream {
        return Ok(ndjson_response(subscription));
    }

    drop(subscription);
    let result = mux.await_completion().await?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        result.to_json()?,
    )
        .into_response())
}

async fn monitor_chat(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Response, ApiError> {
    let mux = state.registry.lookup(query.id.as_deref())?;
    Ok(ndjson_response(mux.subscribe(SubscriptionMode::Annotated)))
}

async fn monitor_request(
    State(state): State<AppState>,
    Query(query): Query<IdQuery>,
) -> Result<Json<ResponseSummary>, ApiError> {
    let mux = state.registry.lookup(query.id.as_deref())?;
    Ok(Json(mux.summary()))
}

async fn monitor_recent(State(state): State<AppState>) -> Json<Vec<ResponseId>> {
    Json(state.registry.list_recent())
}

/// Stream a subscription as NDJSON
///
/// A terminal subscription error becomes a final `{"error": ...}` line.
fn ndjson_response(subscription: Subscription) -> Response {
    let subscriber = subscription.id();
    let body = subscription.map(move |item| {
        Ok::<_, Infallible>(match item {
            Ok(line) => line,
            Err(e) => {
                warn!(subscriber = %subscriber, error = %e, "Stream ended with error");
                error_line(&e.to_string())
            }
        })
    });

    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(body)).into_response()
}

fn error_line(message: &str) -> Bytes {
    let mut line = serde_json::json!({ "error": message }).to_string();
    line.push('\n');
    Bytes::from(line)
}

//! Integration tests for the relay core
//!
//! These tests drive the public API the way the daemon does: a byte stream goes
//! in through `Multiplexer::spawn`, views come out through the registry.
//! Tests cover:
//! - Reconstruction independent of how the upstream is chunked
//! - Many concurrent subscribers agreeing on the result
//! - Late monitor subscribers resolved through the registry
//! - Native reasoning and tool calls
//! - TOML configuration driving multiplexer and registry limits

use std::io::{self, Write};
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tempfile::NamedTempFile;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use relay_core::config::load_config_from_path;
use relay_core::{
    ChatMessage, ChatRequest, LookupError, MuxError, Multiplexer, MultiplexerConfig, Phase,
    RegistryConfig, ResponseRegistry, Subscription, SubscriptionError, SubscriptionMode,
    REASONING_CLOSE, REASONING_OPEN,
};

// =============================================================================
// Helpers
// =============================================================================

fn request() -> ChatRequest {
    let mut request = ChatRequest::new("qwen3", vec![ChatMessage::new("user", "why is the sky blue")]);
    request.options = Some(json!({"temperature": 0.2}));
    request
}

fn delta(content: &str) -> String {
    format!(
        "{}\n",
        json!({
            "model": "qwen3",
            "created_at": "2025-05-01T10:00:00Z",
            "message": {"role": "assistant", "content": content},
            "done": false,
        })
    )
}

fn final_line() -> String {
    format!(
        "{}\n",
        json!({
            "model": "qwen3",
            "created_at": "2025-05-01T10:00:05Z",
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": "stop",
            "total_duration": 5_000_000_000_u64,
            "eval_count": 9,
        })
    )
}

fn reasoning_transcript() -> String {
    [
        delta(REASONING_OPEN),
        delta("Rayleigh "),
        delta("scattering"),
        delta(REASONING_CLOSE),
        delta("Short "),
        delta("wavelengths "),
        delta("scatter more."),
        final_line(),
    ]
    .concat()
}

/// Split `text` into chunks of the given sizes, cycling through them
fn chunked(text: &str, sizes: &[usize]) -> Vec<Result<Bytes, io::Error>> {
    let bytes = text.as_bytes();
    let mut chunks = Vec::new();
    let mut offset = 0;
    for size in sizes.iter().cycle() {
        if offset >= bytes.len() {
            break;
        }
        let end = (offset + size).min(bytes.len());
        chunks.push(Ok(Bytes::copy_from_slice(&bytes[offset..end])));
        offset = end;
    }
    chunks
}

async fn lines(subscription: Subscription) -> Vec<Value> {
    subscription
        .map(|item| serde_json::from_slice::<Value>(&item.unwrap()).unwrap())
        .collect()
        .await
}

// =============================================================================
// Test 1: Chunking Does Not Matter
// =============================================================================

#[tokio::test]
async fn test_reconstruction_is_independent_of_chunking() {
    let transcript = reasoning_transcript();
    let registry = ResponseRegistry::new(RegistryConfig::default());

    for sizes in [vec![1], vec![3, 7], vec![64], vec![transcript.len()]] {
        let mux = Multiplexer::spawn(
            &registry,
            MultiplexerConfig::default(),
            request(),
            stream::iter(chunked(&transcript, &sizes)),
        );
        let result = mux.await_completion().await.unwrap();

        assert_eq!(result.turn.reasoning(), Some("Rayleigh scattering"), "{sizes:?}");
        assert_eq!(result.turn.content(), "Short wavelengths scatter more.", "{sizes:?}");
        assert_eq!(result.event.eval_count, Some(9));
    }
}

// =============================================================================
// Test 2: Concurrent Subscribers Agree
// =============================================================================

#[tokio::test]
async fn test_many_subscribers_agree_on_the_result() {
    let registry = ResponseRegistry::new(RegistryConfig::default());
    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
    let mux = Multiplexer::spawn(
        &registry,
        MultiplexerConfig::default(),
        request(),
        UnboundedReceiverStream::new(rx),
    );

    let readers: Vec<_> = (0..16)
        .map(|i| {
            let mode = if i % 2 == 0 {
                SubscriptionMode::Raw
            } else {
                SubscriptionMode::Annotated
            };
            tokio::spawn(lines(mux.subscribe(mode)))
        })
        .collect();

    for chunk in chunked(&reasoning_transcript(), &[5, 11]) {
        tx.send(chunk).unwrap();
        tokio::task::yield_now().await;
    }

    let expected = mux.await_completion().await.unwrap();
    for reader in readers {
        let received = reader.await.unwrap();
        assert_eq!(received.len(), 8);

        let reasoning: String = received
            .iter()
            .filter_map(|line| line["message"]["thinking"].as_str())
            .collect();
        let content: String = received
            .iter()
            .filter(|line| line["done"] == false)
            .filter_map(|line| line["message"]["content"].as_str())
            .collect();

        assert_eq!(Some(reasoning.as_str()), expected.turn.reasoning());
        assert_eq!(content, expected.turn.content());
        assert_eq!(received.last().unwrap()["done"], true);
    }
    assert_eq!(mux.subscriber_count(), 0);
}

// =============================================================================
// Test 3: Monitor Attaches Through The Registry
// =============================================================================

#[tokio::test]
async fn test_monitor_attaches_mid_stream_by_id() {
    let registry = ResponseRegistry::new(RegistryConfig::default());
    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
    let mux = Multiplexer::spawn(
        &registry,
        MultiplexerConfig::default(),
        request(),
        UnboundedReceiverStream::new(rx),
    );

    // A client is reading the raw stream
    let mut client = mux.subscribe(SubscriptionMode::Raw);
    for piece in [REASONING_OPEN, "step one", REASONING_CLOSE, "Answer"] {
        tx.send(Ok(Bytes::from(delta(piece)))).unwrap();
        client.next().await.unwrap().unwrap();
    }

    // A monitor finds it by id
    assert_eq!(registry.list_recent(), vec![mux.id()]);
    let found = registry.lookup(Some(&mux.id().to_string())).unwrap();
    let mut monitor = found.subscribe(SubscriptionMode::Annotated);

    let replay: Value = serde_json::from_slice(&monitor.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(replay["status"], "responding");
    assert_eq!(replay["message"]["thinking"], "step one");
    assert_eq!(replay["message"]["content"], "Answer");
    assert_eq!(replay["request"]["options"]["temperature"], 0.2);

    tx.send(Ok(Bytes::from(final_line()))).unwrap();
    let rest = lines(monitor).await;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0]["status"], "done");
    assert!(rest[0].get("request").is_none());

    let summary = found.summary();
    assert_eq!(summary.status, Phase::Finished);
    assert_eq!(summary.model, "qwen3");
    assert_eq!(summary.options, Some(json!({"temperature": 0.2})));
    let summary = serde_json::to_value(&summary).unwrap();
    assert_eq!(summary["status"], "done");
    assert_eq!(summary["messages"][0]["role"], "user");
}

#[tokio::test]
async fn test_monitor_after_finish_gets_materialized_result() {
    let registry = ResponseRegistry::new(RegistryConfig::default());
    let mux = Multiplexer::spawn(
        &registry,
        MultiplexerConfig::default(),
        request(),
        stream::iter(chunked(&reasoning_transcript(), &[32])),
    );
    mux.await_completion().await.unwrap();

    let found = registry.lookup(Some(&mux.id().to_string())).unwrap();
    let received = lines(found.subscribe(SubscriptionMode::Annotated)).await;

    assert_eq!(received.len(), 1);
    let only = &received[0];
    assert_eq!(only["done"], true);
    assert_eq!(only["status"], "done");
    assert_eq!(only["request"]["model"], "qwen3");
    assert_eq!(only["message"]["role"], "assistant");
    assert_eq!(only["message"]["thinking"], "Rayleigh scattering");
    assert_eq!(only["message"]["content"], "Short wavelengths scatter more.");
    assert_eq!(only["done_reason"], "stop");
}

#[tokio::test]
async fn test_lookup_failures() {
    let registry = ResponseRegistry::new(RegistryConfig::default());
    assert_eq!(registry.lookup(None).unwrap_err(), LookupError::MissingIdentifier);
    assert!(matches!(
        registry.lookup(Some("0f8e5a8c-0000-4000-8000-000000000000")),
        Err(LookupError::NotFound(_))
    ));
}

// =============================================================================
// Test 4: Native Reasoning And Tool Calls
// =============================================================================

#[tokio::test]
async fn test_native_thinking_and_tool_calls_accumulate() {
    let transcript = [
        r#"{"model":"gpt-oss","message":{"role":"assistant","content":"","thinking":"need weather"},"done":false}"#,
        r#"{"model":"gpt-oss","message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"get_weather","arguments":{"city":"Lima"}}}]},"done":false}"#,
        r#"{"model":"gpt-oss","message":{"role":"assistant","content":"Checking."},"done":false}"#,
        r#"{"model":"gpt-oss","done":true,"done_reason":"stop","x_backend_stat":3}"#,
    ]
    .join("\n");

    let registry = ResponseRegistry::new(RegistryConfig::default());
    let mux = Multiplexer::spawn(
        &registry,
        MultiplexerConfig::default(),
        request(),
        stream::iter(chunked(&transcript, &[17])),
    );

    let result = mux.await_completion().await.unwrap();
    assert_eq!(result.turn.reasoning(), Some("need weather"));
    assert_eq!(result.turn.content(), "Checking.");
    assert_eq!(result.turn.tool_calls().len(), 1);
    assert_eq!(result.turn.tool_calls()[0].function.name, "get_weather");

    let json: Value = serde_json::from_slice(&result.to_json().unwrap()).unwrap();
    assert_eq!(json["model"], "gpt-oss");
    assert_eq!(json["x_backend_stat"], 3);
    assert_eq!(json["message"]["tool_calls"][0]["function"]["arguments"]["city"], "Lima");
}

// =============================================================================
// Test 5: Failures Reach Everyone
// =============================================================================

#[tokio::test]
async fn test_truncated_upstream_reaches_subscribers_and_waiters() {
    let registry = ResponseRegistry::new(RegistryConfig::default());
    let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
    let mux = Multiplexer::spawn(
        &registry,
        MultiplexerConfig::default(),
        request(),
        UnboundedReceiverStream::new(rx),
    );
    let subscription = mux.subscribe(SubscriptionMode::Annotated);

    tx.send(Ok(Bytes::from(delta("partial")))).unwrap();
    drop(tx);

    let items: Vec<_> = subscription.collect().await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert_eq!(
        items[1].as_ref().unwrap_err(),
        &SubscriptionError::Ingest(relay_core::IngestError::Truncated)
    );

    assert_eq!(
        mux.await_completion().await.unwrap_err(),
        MuxError::Ingest(relay_core::IngestError::Truncated)
    );
    assert!(mux.materialize().is_err());
}

// =============================================================================
// Test 6: Configuration Drives Limits
// =============================================================================

#[tokio::test]
async fn test_toml_config_drives_limits() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        "[registry]\nmax_entries = 2\n\n[stream]\nsubscriber_queue_capacity = 2\nmax_line_bytes = 32"
    )
    .unwrap();

    let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
    let registry = ResponseRegistry::new(config.registry.clone());

    // Registry bound
    let ids: Vec<_> = (0..3)
        .map(|_| {
            Multiplexer::spawn(
                &registry,
                config.multiplexer.clone(),
                request(),
                stream::pending::<Result<Bytes, io::Error>>(),
            )
            .id()
        })
        .collect();
    assert_eq!(registry.list_recent(), vec![ids[2], ids[1]]);

    // Line limit
    let overlong = Multiplexer::spawn(
        &registry,
        config.multiplexer.clone(),
        request(),
        stream::iter(vec![Ok::<_, io::Error>(Bytes::from("y".repeat(40)))]),
    );
    let err = tokio::time::timeout(Duration::from_secs(5), overlong.await_completion())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(
        err,
        MuxError::Ingest(relay_core::IngestError::LineTooLong { limit: 32 })
    );
}

//! Response Registry
//!
//! Indexes live and recently finished responses by [`ResponseId`] so monitor
//! clients can attach to them after the fact.
//!
//! # Retention
//!
//! - **Count bound**: entries are kept most-recent-first; inserting past
//!   `max_entries` evicts the oldest entries immediately.
//! - **Age sweep**: a periodic task evicts settled entries older than the
//!   retention window. Entries still streaming are never swept.
//!
//! Eviction only removes bookkeeping. Subscriptions already attached to an
//! evicted [`Multiplexer`] keep running until the response ends.
//!
//! # Thread Safety
//!
//! The index and recency list live behind one `Arc<RwLock<>>`. Lookups take the
//! read lock; inserts and sweeps take the write lock for a few map operations.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::LookupError;
use crate::multiplexer::{Multiplexer, ResponseId};

/// Configuration for the response registry
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Most entries kept at once (default: 100)
    pub max_entries: usize,
    /// How long a settled entry is kept (default: 24 hours)
    pub retention: Duration,
    /// Interval between sweeps (default: 1 hour)
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: 100,
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RegistryConfig {
    /// Set the entry bound
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the retention window
    #[must_use]
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Set the sweep interval
    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: HashMap<ResponseId, Multiplexer>,
    /// Most recent first
    recent: VecDeque<ResponseId>,
}

/// Index of multiplexed responses
///
/// Cheap to clone; clones share the same index.
#[derive(Clone)]
pub struct ResponseRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    config: RegistryConfig,
}

impl ResponseRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
            config,
        }
    }

    /// Index a multiplexer as the most recent entry
    pub fn put(&self, multiplexer: Multiplexer) {
        let id = multiplexer.id();
        let mut inner = self.inner.write();

        if inner.entries.insert(id, multiplexer).is_some() {
            inner.recent.retain(|existing| *existing != id);
        }
        inner.recent.push_front(id);

        while inner.recent.len() > self.config.max_entries {
            let Some(evicted) = inner.recent.pop_back() else {
                break;
            };
            inner.entries.remove(&evicted);
            info!(
                response_id = %evicted,
                max_entries = self.config.max_entries,
                "Evicted oldest response"
            );
        }

        debug!(response_id = %id, entries = inner.entries.len(), "Response registered");
    }

    /// Get a multiplexer by identifier
    #[must_use]
    pub fn get(&self, id: &ResponseId) -> Option<Multiplexer> {
        self.inner.read().entries.get(id).cloned()
    }

    /// Resolve a caller-supplied identifier
    ///
    /// # Errors
    ///
    /// - [`LookupError::MissingIdentifier`] if no (or a blank) identifier was given
    /// - [`LookupError::NotFound`] if it does not name an indexed response
    pub fn lookup(&self, id: Option<&str>) -> Result<Multiplexer, LookupError> {
        let raw = id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(LookupError::MissingIdentifier)?;

        raw.parse::<ResponseId>()
            .ok()
            .and_then(|id| self.get(&id))
            .ok_or_else(|| LookupError::NotFound(raw.to_string()))
    }

    /// Identifiers of indexed responses, most recent first
    #[must_use]
    pub fn list_recent(&self) -> Vec<ResponseId> {
        self.inner.read().recent.iter().copied().collect()
    }

    /// Number of indexed responses
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Check if the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict settled entries older than the retention window
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweep as if the current time were `now`
    pub fn sweep_at(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let mut inner = self.inner.write();

        let expired: Vec<ResponseId> = inner
            .entries
            .iter()
            .filter(|(_, mux)| mux.is_settled() && mux.age_at(now) > retention)
            .map(|(id, _)| *id)
            .collect();

        if expired.is_empty() {
            return 0;
        }

        for id in &expired {
            inner.entries.remove(id);
        }
        inner.recent.retain(|id| !expired.contains(id));

        info!(
            removed = expired.len(),
            remaining = inner.entries.len(),
            "Swept expired responses"
        );
        expired.len()
    }

    /// Spawn the periodic sweep task
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start_sweeper(&self) -> SweeperHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(run_sweeper(self.clone(), stop_rx));
        SweeperHandle { stop_tx, task }
    }
}

impl std::fmt::Debug for ResponseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseRegistry")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

async fn run_sweeper(registry: ResponseRegistry, mut stop_rx: watch::Receiver<bool>) {
    let period = registry.config.sweep_interval;
    info!(
        interval_secs = period.as_secs(),
        retention_secs = registry.config.retention.as_secs(),
        "Starting registry sweeper"
    );

    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let removed = registry.sweep();
                debug!(removed, "Registry sweep tick");
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("Registry sweeper stopped");
}

/// Handle on a running sweep task
#[derive(Debug)]
pub struct SweeperHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep task and wait for it to exit
    pub async fn stop(self) {
        self.stop_tx.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Registry sweeper ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChatMessage, ChatRequest};
    use crate::multiplexer::MultiplexerConfig;
    use bytes::Bytes;
    use futures::stream;
    use pretty_assertions::assert_eq;
    use std::io;

    const FINISHED: &str = concat!(
        "{\"model\":\"m\",\"message\":{\"role\":\"assistant\",\"content\":\"hi\"},\"done\":false}\n",
        "{\"model\":\"m\",\"done\":true,\"done_reason\":\"stop\"}\n",
    );

    fn request() -> ChatRequest {
        ChatRequest::new("m", vec![ChatMessage::new("user", "hello")])
    }

    fn spawn_finished(registry: &ResponseRegistry) -> Multiplexer {
        let upstream = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(
            FINISHED.as_bytes(),
        ))]);
        Multiplexer::spawn(registry, MultiplexerConfig::default(), request(), upstream)
    }

    fn spawn_pending(registry: &ResponseRegistry) -> Multiplexer {
        let upstream = stream::pending::<Result<Bytes, io::Error>>();
        Multiplexer::spawn(registry, MultiplexerConfig::default(), request(), upstream)
    }

    #[tokio::test]
    async fn test_put_and_lookup() {
        let registry = ResponseRegistry::new(RegistryConfig::default());
        let mux = spawn_pending(&registry);
        let id = mux.id().to_string();

        let found = registry.lookup(Some(&id)).unwrap();
        assert_eq!(found.id(), mux.id());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lookup_errors() {
        let registry = ResponseRegistry::new(RegistryConfig::default());
        spawn_pending(&registry);

        assert_eq!(
            registry.lookup(None).unwrap_err(),
            LookupError::MissingIdentifier
        );
        assert_eq!(
            registry.lookup(Some("  ")).unwrap_err(),
            LookupError::MissingIdentifier
        );
        assert_eq!(
            registry.lookup(Some("not-a-uuid")).unwrap_err(),
            LookupError::NotFound("not-a-uuid".to_string())
        );

        let unknown = ResponseId::new().to_string();
        assert_eq!(
            registry.lookup(Some(&unknown)).unwrap_err(),
            LookupError::NotFound(unknown.clone())
        );
    }

    #[tokio::test]
    async fn test_count_bound_evicts_oldest() {
        let registry = ResponseRegistry::new(RegistryConfig::default());
        let ids: Vec<ResponseId> = (0..101).map(|_| spawn_pending(&registry).id()).collect();

        assert_eq!(registry.len(), 100);
        let recent = registry.list_recent();
        assert_eq!(recent.len(), 100);
        assert_eq!(recent[0], ids[100]);
        assert_eq!(recent[99], ids[1]);

        assert!(registry.get(&ids[0]).is_none());
        assert_eq!(
            registry.lookup(Some(&ids[0].to_string())).unwrap_err(),
            LookupError::NotFound(ids[0].to_string())
        );
        assert!(registry.get(&ids[1]).is_some());
    }

    #[tokio::test]
    async fn test_eviction_does_not_stop_attached_subscribers() {
        use crate::subscription::SubscriptionMode;
        use futures::StreamExt;
        use tokio::sync::mpsc;
        use tokio_stream::wrappers::UnboundedReceiverStream;

        let registry = ResponseRegistry::new(RegistryConfig::default().with_max_entries(1));
        let (tx, rx) = mpsc::unbounded_channel::<Result<Bytes, io::Error>>();
        let mux = Multiplexer::spawn(
            &registry,
            MultiplexerConfig::default(),
            request(),
            UnboundedReceiverStream::new(rx),
        );
        let subscription = mux.subscribe(SubscriptionMode::Raw);

        spawn_pending(&registry);
        assert!(registry.get(&mux.id()).is_none());

        tx.send(Ok(Bytes::from_static(FINISHED.as_bytes()))).unwrap();
        let items: Vec<_> = subscription.collect().await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn test_sweep_removes_only_settled_entries() {
        let registry = ResponseRegistry::new(RegistryConfig::default());
        let finished = spawn_finished(&registry);
        let pending = spawn_pending(&registry);
        finished.await_completion().await.unwrap();

        // Nothing is old enough yet
        assert_eq!(registry.sweep(), 0);

        let later = Instant::now() + Duration::from_secs(25 * 60 * 60);
        assert_eq!(registry.sweep_at(later), 1);

        assert!(registry.get(&finished.id()).is_none());
        assert!(registry.get(&pending.id()).is_some());
        assert_eq!(registry.list_recent(), vec![pending.id()]);
    }

    #[tokio::test]
    async fn test_sweep_removes_failed_entries() {
        let registry = ResponseRegistry::new(RegistryConfig::default());
        let upstream = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(b"{oops\n"))]);
        let failed = Multiplexer::spawn(&registry, MultiplexerConfig::default(), request(), upstream);
        assert!(failed.await_completion().await.is_err());

        let later = Instant::now() + Duration::from_secs(25 * 60 * 60);
        assert_eq!(registry.sweep_at(later), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sweeper_runs_and_stops() {
        let config = RegistryConfig::default()
            .with_retention(Duration::ZERO)
            .with_sweep_interval(Duration::from_millis(20));
        let registry = ResponseRegistry::new(config);
        let finished = spawn_finished(&registry);
        finished.await_completion().await.unwrap();

        let sweeper = registry.start_sweeper();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(5), sweeper.stop())
            .await
            .unwrap();
    }
}

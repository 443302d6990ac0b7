//! Remote backend capability contract
//!
//! The reflex layer is a protocol *consumer*: it never owns a wire format.
//! Everything it needs from the remote store is expressed by the
//! [`RemoteBackend`] trait — open a session, probe it, subscribe to a
//! change feed, read and write documents. Vendor SDKs implement this trait
//! in the embedding application; [`MemoryBackend`] implements it in-process
//! for tests and local development.

use async_trait::async_trait;
use parking_lot::RwLock;
use reflex_core::{ConnectionError, RawNotification};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// A document stored in the remote backend.
pub type Document = Value;

/// Opaque handle for one live backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    /// Raw session id, for logging.
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Outcome of a single health probe.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// The session answered.
    Healthy,
    /// The session is broken; carries the backend's reason.
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

/// Capability contract the connection manager consumes.
///
/// Per-path delivery order of `subscribe_changes` is the backend's; the
/// reflex layer preserves it end to end but adds no cross-path guarantee.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Establish a session. `credential_ref` is a path or secret name, never
    /// credential material.
    async fn open(
        &self,
        credential_ref: &str,
        target: &str,
    ) -> Result<SessionHandle, ConnectionError>;

    /// Probe a session's health.
    async fn probe(&self, session: SessionHandle) -> ProbeOutcome;

    /// Subscribe to the change feed for a source path. The feed is infinite
    /// and restartable only by re-subscribing.
    async fn subscribe_changes(
        &self,
        session: SessionHandle,
        path: &str,
    ) -> Result<mpsc::Receiver<RawNotification>, ConnectionError>;

    /// Read a document; `None` means not found.
    async fn read_document(
        &self,
        session: SessionHandle,
        path: &str,
    ) -> Result<Option<Document>, ConnectionError>;

    /// Write a document.
    async fn write_document(
        &self,
        session: SessionHandle,
        path: &str,
        value: Document,
    ) -> Result<(), ConnectionError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Capacity of each in-memory change feed.
const FEED_CAPACITY: usize = 256;

/// In-memory [`RemoteBackend`] with scriptable failures.
///
/// Used by the test suites and handy for local development: documents live
/// in a map, change feeds are bounded channels, and both `open` and `probe`
/// outcomes can be scripted to simulate an unreliable store.
///
/// # Example
///
/// ```rust,ignore
/// use reflex::backend::{MemoryBackend, ProbeOutcome, RemoteBackend};
///
/// let backend = MemoryBackend::new();
/// backend.fail_next_opens(2);                  // first two opens refused
/// backend.script_probe(ProbeOutcome::Unhealthy("gone".into()));
/// ```
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_session: AtomicU64,
    opens: AtomicU64,
    probes: AtomicU64,
    fail_opens: AtomicU64,
    probe_script: RwLock<VecDeque<ProbeOutcome>>,
    documents: RwLock<HashMap<String, Document>>,
    feeds: Mutex<HashMap<String, Vec<mpsc::Sender<RawNotification>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` calls to `open`.
    pub fn fail_next_opens(&self, n: u64) {
        self.inner.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Queue a probe outcome; scripted outcomes are consumed in order, and
    /// once the script is empty probes report healthy again.
    pub fn script_probe(&self, outcome: ProbeOutcome) {
        self.inner.probe_script.write().push_back(outcome);
    }

    /// Queue `n` unhealthy probe outcomes.
    pub fn script_unhealthy_probes(&self, n: usize) {
        let mut script = self.inner.probe_script.write();
        for _ in 0..n {
            script.push_back(ProbeOutcome::Unhealthy("scripted failure".into()));
        }
    }

    /// Store a document directly, bypassing any session.
    pub fn put_document(&self, path: impl Into<String>, value: Document) {
        self.inner.documents.write().insert(path.into(), value);
    }

    /// Push a notification into every live feed for `path`.
    pub async fn publish(&self, path: &str, notification: RawNotification) {
        let mut feeds = self.inner.feeds.lock().await;
        if let Some(senders) = feeds.get_mut(path) {
            let mut alive = Vec::with_capacity(senders.len());
            for sender in senders.drain(..) {
                if sender.send(notification.clone()).await.is_ok() {
                    alive.push(sender);
                }
            }
            *senders = alive;
        }
    }

    /// Number of `open` calls so far (including refused ones).
    pub fn opens(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Number of `probe` calls so far.
    pub fn probes(&self) -> u64 {
        self.inner.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn open(
        &self,
        _credential_ref: &str,
        target: &str,
    ) -> Result<SessionHandle, ConnectionError> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let remaining = self.inner.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectionError::backend(format!(
                "open refused for '{}'",
                target
            )));
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(session = id, target, "memory backend session opened");
        Ok(SessionHandle(id))
    }

    async fn probe(&self, _session: SessionHandle) -> ProbeOutcome {
        self.inner.probes.fetch_add(1, Ordering::SeqCst);
        self.inner
            .probe_script
            .write()
            .pop_front()
            .unwrap_or(ProbeOutcome::Healthy)
    }

    async fn subscribe_changes(
        &self,
        _session: SessionHandle,
        path: &str,
    ) -> Result<mpsc::Receiver<RawNotification>, ConnectionError> {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        self.inner
            .feeds
            .lock()
            .await
            .entry(path.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn read_document(
        &self,
        _session: SessionHandle,
        path: &str,
    ) -> Result<Option<Document>, ConnectionError> {
        Ok(self.inner.documents.read().get(path).cloned())
    }

    async fn write_document(
        &self,
        _session: SessionHandle,
        path: &str,
        value: Document,
    ) -> Result<(), ConnectionError> {
        self.inner.documents.write().insert(path.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_open_and_probe() {
        let backend = MemoryBackend::new();
        let session = backend.open("cred", "target").await.unwrap();
        assert!(backend.probe(session).await.is_healthy());
        assert_eq!(backend.opens(), 1);
        assert_eq!(backend.probes(), 1);
    }

    #[tokio::test]
    async fn test_scripted_open_failures() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens(2);

        assert!(backend.open("cred", "t").await.is_err());
        assert!(backend.open("cred", "t").await.is_err());
        assert!(backend.open("cred", "t").await.is_ok());
        assert_eq!(backend.opens(), 3);
    }

    #[tokio::test]
    async fn test_scripted_probes_then_recover() {
        let backend = MemoryBackend::new();
        backend.script_unhealthy_probes(2);

        let session = backend.open("cred", "t").await.unwrap();
        assert!(!backend.probe(session).await.is_healthy());
        assert!(!backend.probe(session).await.is_healthy());
        // Script exhausted: healthy again
        assert!(backend.probe(session).await.is_healthy());
    }

    #[tokio::test]
    async fn test_documents_round_trip() {
        let backend = MemoryBackend::new();
        let session = backend.open("cred", "t").await.unwrap();

        assert_eq!(backend.read_document(session, "views/x").await.unwrap(), None);

        backend
            .write_document(session, "views/x", json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(
            backend.read_document(session, "views/x").await.unwrap(),
            Some(json!({"n": 1}))
        );
    }

    #[tokio::test]
    async fn test_change_feed_delivery_order() {
        let backend = MemoryBackend::new();
        let session = backend.open("cred", "t").await.unwrap();
        let mut rx = backend.subscribe_changes(session, "orders").await.unwrap();

        for seq in 1..=3u64 {
            backend
                .publish(
                    "orders",
                    RawNotification::new("orders", json!({"type": "t", "payload": {}}))
                        .with_sequence(seq),
                )
                .await;
        }

        for expected in 1..=3u64 {
            let raw = rx.recv().await.unwrap();
            assert_eq!(raw.sequence, Some(expected));
        }
    }
}

//! Connection management with health monitoring and bounded reconnection
//!
//! # Features
//!
//! - **Single logical session**: exactly one live backend session per
//!   manager; all components share the manager instead of opening their own
//! - **Background health monitor**: periodic probes with a per-probe timeout
//!   shorter than the probe interval, so a hung probe never starves the next
//! - **Bounded exponential reconnection**: attempt *n* waits
//!   `base * 2^(n-1)`; past the attempt cap the state is `Failed` and the
//!   monitor keeps probing at the capped delay until shutdown
//! - **Non-blocking callers**: `ensure_connected` only enqueues a reconnect;
//!   `await_healthy` waits on a watch channel with a caller-chosen timeout
//!
//! # Example
//!
//! ```rust,ignore
//! use reflex::{ConnectionManager, MemoryBackend};
//! use reflex_core::ReflexConfig;
//! use std::sync::Arc;
//!
//! let config = ReflexConfig::builder()
//!     .credential_ref("/etc/reflex/cred.json")
//!     .target("projects/acme")
//!     .build();
//!
//! let manager = ConnectionManager::connect(config, Arc::new(MemoryBackend::new())).await?;
//! let mut changes = manager.changes("orders/incoming").await?;
//! ```
//!
//! The manager is constructed once at process start and passed explicitly
//! (`Arc<ConnectionManager>`) to every consumer. Duplicate managers against
//! the same target waste backend session quota and make health state
//! inconsistent, so nothing in this crate constructs one implicitly.

use crate::backend::{Document, ProbeOutcome, RemoteBackend, SessionHandle};
use crate::backoff::{BackoffPolicy, ExponentialBackoff};
use parking_lot::{Mutex, RwLock};
use reflex_core::{ConnectionError, RawNotification, ReflexConfig};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant as TokioInstant, MissedTickBehavior};
use tracing::{debug, info, warn};

// ============================================================================
// State
// ============================================================================

/// Connection lifecycle state. Owned exclusively by the manager; the health
/// monitor is the only writer after startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and none being established.
    Disconnected,
    /// Initial session establishment in progress.
    Connecting,
    /// Last probe answered.
    Healthy,
    /// Probes failing, reconnection in progress, cap not yet reached.
    Degraded,
    /// Reconnect attempt cap exceeded; probing continues at the capped
    /// delay.
    Failed,
}

impl ConnectionState {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ConnectionState::Healthy)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Healthy => "healthy",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Point-in-time health snapshot, published on a watch channel so readers
/// never contend with the monitor.
#[derive(Debug, Clone)]
pub struct ConnectionHealth {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// When the last successful probe answered.
    pub last_healthy: Option<Instant>,
    /// Consecutive failed probes/reconnect attempts.
    pub consecutive_failures: u32,
    /// Delay of the most recently scheduled reconnect attempt.
    pub current_backoff: Duration,
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConnectionStats {
    pub probes: u64,
    pub probe_failures: u64,
    pub reconnect_attempts: u64,
    pub reconnects_succeeded: u64,
}

#[derive(Default)]
struct Counters {
    probes: AtomicU64,
    probe_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects_succeeded: AtomicU64,
}

// ============================================================================
// Manager
// ============================================================================

struct Shared {
    config: ReflexConfig,
    backend: Arc<dyn RemoteBackend>,
    session: RwLock<Option<SessionHandle>>,
    health: watch::Sender<ConnectionHealth>,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        self.health.borrow().state
    }

    fn publish<F: FnOnce(&mut ConnectionHealth)>(&self, update: F) {
        self.health.send_modify(update);
    }

    fn current_session(&self) -> Result<SessionHandle, ConnectionError> {
        (*self.session.read()).ok_or_else(|| ConnectionError::NotConnected {
            target: self.config.target.clone(),
        })
    }
}

/// Owns the single logical connection to the remote backend for the process
/// lifetime: connect, health-check, reconnect-with-backoff. No other
/// component talks to the backend directly.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    reconnect_tx: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Validate the configuration, open the session, and start the health
    /// monitor.
    ///
    /// Configuration problems (missing credential reference, malformed
    /// target, probe timeout not shorter than the interval) are reported
    /// synchronously, before any network attempt.
    pub async fn connect(
        config: ReflexConfig,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<Arc<Self>, ConnectionError> {
        config.validate()?;

        let initial = ConnectionHealth {
            state: ConnectionState::Connecting,
            last_healthy: None,
            consecutive_failures: 0,
            current_backoff: config.reconnect_base_delay,
        };
        let (health_tx, _) = watch::channel(initial);

        let shared = Arc::new(Shared {
            config,
            backend,
            session: RwLock::new(None),
            health: health_tx,
            counters: Counters::default(),
        });

        let session = open_session(&shared).await?;
        *shared.session.write() = Some(session);
        shared.publish(|h| {
            h.state = ConnectionState::Healthy;
            h.last_healthy = Some(Instant::now());
        });
        info!(
            target_id = %shared.config.target,
            session = session.id(),
            "connected to remote backend"
        );

        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(monitor_loop(shared.clone(), reconnect_rx, shutdown_rx));

        Ok(Arc::new(Self {
            shared,
            reconnect_tx,
            shutdown: shutdown_tx,
            monitor: Mutex::new(Some(monitor)),
        }))
    }

    /// Current lifecycle state (lock-free snapshot read).
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Current health snapshot (lock-free snapshot read).
    pub fn health(&self) -> ConnectionHealth {
        self.shared.health.borrow().clone()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> ConnectionStats {
        let c = &self.shared.counters;
        ConnectionStats {
            probes: c.probes.load(Ordering::Relaxed),
            probe_failures: c.probe_failures.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            reconnects_succeeded: c.reconnects_succeeded.load(Ordering::Relaxed),
        }
    }

    /// Return immediately if healthy; otherwise enqueue a reconnect attempt
    /// (fire-and-forget, never waits for the attempt itself) and return the
    /// current state.
    pub fn ensure_connected(&self) -> ConnectionState {
        let state = self.state();
        if !state.is_healthy() {
            // Capacity-1 queue: a pending request already covers us.
            let _ = self.reconnect_tx.try_send(());
        }
        state
    }

    /// Wait until the connection is healthy, up to `wait`.
    ///
    /// On timeout, returns the current (possibly degraded) state — unless
    /// the state is `Failed`, in which case the caller explicitly demanded
    /// connectivity that cannot be granted and gets a [`ConnectionError`].
    pub async fn await_healthy(
        &self,
        wait: Duration,
    ) -> Result<ConnectionState, ConnectionError> {
        if self.state().is_healthy() {
            return Ok(ConnectionState::Healthy);
        }
        let _ = self.reconnect_tx.try_send(());

        let mut rx = self.shared.health.subscribe();
        let deadline = TokioInstant::now() + wait;
        loop {
            {
                let health = rx.borrow_and_update();
                if health.state.is_healthy() {
                    return Ok(ConnectionState::Healthy);
                }
            }
            if tokio::time::timeout_at(deadline, rx.changed())
                .await
                .is_err()
            {
                let health = self.health();
                return match health.state {
                    ConnectionState::Failed => Err(ConnectionError::AttemptsExhausted {
                        target: self.shared.config.target.clone(),
                        attempts: health.consecutive_failures,
                    }),
                    state => Ok(state),
                };
            }
        }
    }

    /// Subscribe to the backend change feed for a source path. Per-path
    /// delivery order is preserved; nothing is guaranteed across paths.
    pub async fn changes(
        &self,
        path: &str,
    ) -> Result<mpsc::Receiver<RawNotification>, ConnectionError> {
        let session = self.shared.current_session()?;
        self.shared.backend.subscribe_changes(session, path).await
    }

    /// Read a document through the current session.
    pub async fn read_document(
        &self,
        path: &str,
    ) -> Result<Option<Document>, ConnectionError> {
        let session = self.shared.current_session()?;
        self.shared.backend.read_document(session, path).await
    }

    /// Write a document through the current session.
    pub async fn write_document(
        &self,
        path: &str,
        value: Document,
    ) -> Result<(), ConnectionError> {
        let session = self.shared.current_session()?;
        self.shared.backend.write_document(session, path, value).await
    }

    /// Stop the health monitor and wait for it to exit. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            let _ = handle.await;
            info!(target_id = %self.shared.config.target, "connection manager shut down");
        }
    }
}

// ============================================================================
// Health monitor
// ============================================================================

/// Open a session, bounded by the probe timeout.
async fn open_session(shared: &Shared) -> Result<SessionHandle, ConnectionError> {
    let config = &shared.config;
    match timeout(
        config.probe_timeout,
        shared.backend.open(&config.credential_ref, &config.target),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::OpenFailed {
            target: config.target.clone(),
            credential_ref: config.credential_ref.clone(),
            reason: format!("open timed out after {:?}", config.probe_timeout),
        }),
    }
}

async fn monitor_loop(
    shared: Arc<Shared>,
    mut reconnect_rx: mpsc::Receiver<()>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let policy = BackoffPolicy::new(
        shared.config.reconnect_base_delay,
        shared.config.max_reconnect_attempts,
    );
    let period = shared.config.probe_interval;
    let mut ticker = interval_at(TokioInstant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let probe_needed = tokio::select! {
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                false
            }
            _ = ticker.tick() => true,
            Some(()) = reconnect_rx.recv() => true,
        };

        if probe_needed && !probe_once(&shared).await {
            recover(&shared, policy, &mut shutdown_rx).await;
            if *shutdown_rx.borrow() {
                break;
            }
            ticker.reset();
        }
    }
    debug!("health monitor stopped");
}

/// Run one probe. Returns false when the connection needs recovery.
async fn probe_once(shared: &Shared) -> bool {
    shared.counters.probes.fetch_add(1, Ordering::Relaxed);

    let session = *shared.session.read();
    let outcome = match session {
        Some(session) => {
            match timeout(shared.config.probe_timeout, shared.backend.probe(session)).await {
                Ok(outcome) => outcome,
                Err(_) => ProbeOutcome::Unhealthy(format!(
                    "probe timed out after {:?}",
                    shared.config.probe_timeout
                )),
            }
        }
        None => ProbeOutcome::Unhealthy("no live session".into()),
    };

    match outcome {
        ProbeOutcome::Healthy => {
            let was = shared.state();
            shared.publish(|h| {
                h.state = ConnectionState::Healthy;
                h.last_healthy = Some(Instant::now());
                h.consecutive_failures = 0;
                h.current_backoff = shared.config.reconnect_base_delay;
            });
            if !was.is_healthy() {
                info!(previous = %was, "connection recovered");
            }
            true
        }
        ProbeOutcome::Unhealthy(reason) => {
            shared.counters.probe_failures.fetch_add(1, Ordering::Relaxed);
            warn!(%reason, "health probe failed");
            false
        }
    }
}

/// Reconnect with exponential backoff until healthy or shut down.
///
/// Retry *n* is scheduled `base * 2^(n-1)` after failure *n*; once the
/// failure count reaches the attempt cap the state becomes `Failed` and the
/// delay stops growing, but attempts continue until shutdown.
async fn recover(
    shared: &Shared,
    policy: BackoffPolicy,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut backoff = ExponentialBackoff::new(policy);

    loop {
        let delay = backoff.next_delay();
        let failures = backoff.attempt();
        let exhausted = failures >= policy.max_attempts();
        shared.publish(|h| {
            h.consecutive_failures = failures;
            h.current_backoff = delay;
            h.state = if exhausted {
                ConnectionState::Failed
            } else {
                ConnectionState::Degraded
            };
        });
        warn!(
            failures,
            state = %shared.state(),
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    return;
                }
            }
        }

        shared
            .counters
            .reconnect_attempts
            .fetch_add(1, Ordering::Relaxed);

        match reopen(shared).await {
            Ok(session) => {
                *shared.session.write() = Some(session);
                shared
                    .counters
                    .reconnects_succeeded
                    .fetch_add(1, Ordering::Relaxed);
                shared.publish(|h| {
                    h.state = ConnectionState::Healthy;
                    h.last_healthy = Some(Instant::now());
                    h.consecutive_failures = 0;
                    h.current_backoff = shared.config.reconnect_base_delay;
                });
                info!(
                    attempts = backoff.attempt(),
                    session = session.id(),
                    "reconnected to remote backend"
                );
                return;
            }
            Err(err) => {
                warn!(error = %err, attempt = backoff.attempt(), "reconnect attempt failed");
            }
        }
    }
}

/// One reconnect attempt: reopen the session and verify it answers a probe.
async fn reopen(shared: &Shared) -> Result<SessionHandle, ConnectionError> {
    let session = open_session(shared).await?;

    let outcome = timeout(shared.config.probe_timeout, shared.backend.probe(session))
        .await
        .map_err(|_| ConnectionError::ProbeTimeout {
            timeout: shared.config.probe_timeout,
        })?;

    match outcome {
        ProbeOutcome::Healthy => Ok(session),
        ProbeOutcome::Unhealthy(reason) => Err(ConnectionError::backend(reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn fast_config() -> ReflexConfig {
        ReflexConfig::builder()
            .credential_ref("/etc/reflex/cred.json")
            .target("projects/test")
            .reconnect_base_delay(Duration::from_millis(2))
            .max_reconnect_attempts(5)
            .probe_interval(Duration::from_millis(50))
            .probe_timeout(Duration::from_millis(20))
            .build()
    }

    #[tokio::test]
    async fn test_connect_validates_before_network() {
        let backend = MemoryBackend::new();
        let config = ReflexConfig::builder().target("projects/test").build();

        let err = ConnectionManager::connect(config, Arc::new(backend.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "config_invalid");
        // No network attempt was made.
        assert_eq!(backend.opens(), 0);
    }

    #[tokio::test]
    async fn test_connect_then_healthy() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend.clone())
            .await
            .unwrap();

        assert_eq!(manager.state(), ConnectionState::Healthy);
        assert_eq!(manager.ensure_connected(), ConnectionState::Healthy);
        assert_eq!(backend.opens(), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_failure_surfaces_to_connect_caller() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens(1);

        let err = ConnectionManager::connect(fast_config(), Arc::new(backend))
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_ensure_connected_enqueues_without_blocking() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend.clone())
            .await
            .unwrap();

        // Break the next probe and the first reopen so the manager spends a
        // little while degraded.
        backend.script_unhealthy_probes(1);
        backend.fail_next_opens(1);

        // Returns immediately even though the connection is (about to be)
        // degraded; enqueueing must not wait for the attempt.
        let state = manager.ensure_connected();
        assert!(matches!(
            state,
            ConnectionState::Healthy | ConnectionState::Degraded
        ));

        let state = manager
            .await_healthy(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Healthy);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_degraded_then_recovers() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend.clone())
            .await
            .unwrap();

        backend.script_unhealthy_probes(1);
        backend.fail_next_opens(2);

        // Let the scheduled probe fail so recovery actually runs.
        tokio::time::sleep(Duration::from_millis(70)).await;

        let state = manager
            .await_healthy(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Healthy);

        let stats = manager.stats();
        assert!(stats.reconnect_attempts >= 3);
        assert!(stats.reconnects_succeeded >= 1);
        assert_eq!(manager.health().consecutive_failures, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_after_attempt_cap_and_keeps_probing() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend.clone())
            .await
            .unwrap();

        // One bad probe plus a long run of refused reopens.
        backend.script_unhealthy_probes(1);
        backend.fail_next_opens(1_000);

        // Let the scheduled probe fail so recovery starts.
        tokio::time::sleep(Duration::from_millis(70)).await;

        // Cap is 5 with base 2ms: well within the deadline.
        let err = manager
            .await_healthy(Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "attempts_exhausted");

        let health = manager.health();
        assert_eq!(health.state, ConnectionState::Failed);
        assert!(health.consecutive_failures >= 5);
        // Escalation halted at base * 2^(cap-1) = 32ms.
        assert_eq!(health.current_backoff, Duration::from_millis(32));

        // The monitor never gives up on its own: attempts keep growing.
        let before = manager.stats().reconnect_attempts;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(manager.stats().reconnect_attempts > before);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovery_after_failed_state() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend.clone())
            .await
            .unwrap();

        backend.script_unhealthy_probes(1);
        backend.fail_next_opens(7); // past the cap of 5

        tokio::time::sleep(Duration::from_millis(70)).await;

        let state = manager
            .await_healthy(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Healthy);
        assert_eq!(manager.health().consecutive_failures, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_await_healthy_timeout_returns_degraded_state() {
        let backend = Arc::new(MemoryBackend::new());
        let config = ReflexConfig::builder()
            .credential_ref("/etc/reflex/cred.json")
            .target("projects/test")
            .reconnect_base_delay(Duration::from_millis(200))
            .max_reconnect_attempts(5)
            .probe_interval(Duration::from_millis(100))
            .probe_timeout(Duration::from_millis(50))
            .build();
        let manager = ConnectionManager::connect(config, backend.clone())
            .await
            .unwrap();

        backend.script_unhealthy_probes(1);
        backend.fail_next_opens(10);

        // First probe (at ~100ms) fails and recovery enters its first 200ms
        // backoff wait.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(manager.state(), ConnectionState::Degraded);

        // Deadline expires during that backoff wait, before the cap is
        // anywhere near exceeded: degraded, not an error.
        let state = manager
            .await_healthy(Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(state, ConnectionState::Degraded);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_document_passthroughs() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend.clone())
            .await
            .unwrap();

        manager
            .write_document("views/orders", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let doc = manager.read_document("views/orders").await.unwrap();
        assert_eq!(doc, Some(serde_json::json!({"n": 1})));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let manager = ConnectionManager::connect(fast_config(), backend)
            .await
            .unwrap();

        manager.shutdown().await;
        manager.shutdown().await;
    }
}

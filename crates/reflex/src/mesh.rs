//! Event mesh: validation and routing
//!
//! Turns raw, possibly malformed backend notifications into validated
//! [`Event`]s and delivers them to every matching subscription exactly once
//! per subscription.
//!
//! # Features
//!
//! - **Schema registry**: one [`SchemaRule`] per event type, newest wins;
//!   types without a rule pass through unvalidated (never silently dropped)
//! - **Complete violation reporting**: a rejected event carries every
//!   missing/mismatched field, not just the first
//! - **Deterministic fan-out**: exact-type and wildcard (`"*"`)
//!   subscriptions dispatched in registration order
//! - **Handler isolation**: one failing handler is reported but never
//!   prevents delivery to the rest
//!
//! # Example
//!
//! ```rust,ignore
//! use reflex::EventMesh;
//! use reflex_core::{RawNotification, SchemaRule};
//!
//! let mesh = EventMesh::new();
//! mesh.register_schema("order.created", SchemaRule::new().require("order_id"));
//!
//! mesh.subscribe("order.created", |event| async move {
//!     println!("order {:?}", event.field("order_id"));
//!     Ok(())
//! });
//!
//! let report = mesh.ingest(raw_notification).await?;
//! assert_eq!(report.delivered, 1);
//! ```
//!
//! Ordering: `ingest` runs on the calling context, so events from one
//! source path ingested in order are dispatched in order. Nothing is
//! guaranteed across source paths.

use crate::connection::ConnectionManager;
use parking_lot::RwLock;
use reflex_core::{Event, RawNotification, ReflexError, SchemaRule, ValidationError};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wildcard pattern matching every event type.
pub const WILDCARD: &str = "*";

/// Boxed future returned by a subscriber.
pub type SubscriberFuture = Pin<Box<dyn Future<Output = Result<(), ReflexError>> + Send>>;

/// Async subscriber callback. Events are shared (`Arc`) across handlers and
/// must not be mutated — which the type already guarantees.
pub type SubscriberFn = Arc<dyn Fn(Arc<Event>) -> SubscriberFuture + Send + Sync>;

/// Handle identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: SubscriberFn,
}

impl Subscription {
    fn matches(&self, event_type: &str) -> bool {
        self.pattern == WILDCARD || self.pattern == event_type
    }
}

/// Outcome of one successful `ingest`: the routed event plus which handlers
/// failed (failures are isolated, never fatal).
#[derive(Debug)]
pub struct Dispatch {
    /// The validated, routed event.
    pub event: Arc<Event>,
    /// Handlers that completed successfully.
    pub delivered: usize,
    /// Handlers that failed, in dispatch order.
    pub handler_errors: Vec<(SubscriptionId, ReflexError)>,
}

/// Counter snapshot for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct MeshStats {
    /// Notifications handed to `ingest`.
    pub ingested: u64,
    /// Notifications rejected by structural or schema validation.
    pub rejected: u64,
    /// Successful handler deliveries.
    pub delivered: u64,
    /// Isolated handler failures.
    pub handler_errors: u64,
}

#[derive(Default)]
struct Counters {
    ingested: AtomicU64,
    rejected: AtomicU64,
    delivered: AtomicU64,
    handler_errors: AtomicU64,
}

/// The validation-and-routing component.
#[derive(Default)]
pub struct EventMesh {
    schemas: RwLock<HashMap<String, SchemaRule>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
    arrival: AtomicU64,
    counters: Counters,
}

impl EventMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the validation rule for an event type. Later
    /// events of that type are validated against the newest rule only.
    pub fn register_schema(&self, event_type: impl Into<String>, rule: SchemaRule) {
        let event_type = event_type.into();
        debug!(%event_type, "schema registered");
        self.schemas.write().insert(event_type, rule);
    }

    /// Current rule for an event type, if any.
    pub fn schema(&self, event_type: &str) -> Option<SchemaRule> {
        self.schemas.read().get(event_type).cloned()
    }

    /// Register a subscriber for an event type, or for every type with
    /// [`WILDCARD`]. Duplicate registrations are permitted and each is
    /// dispatched independently.
    pub fn subscribe<F, Fut>(&self, pattern: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ReflexError>> + Send + 'static,
    {
        let handler: SubscriberFn = Arc::new(move |event| Box::pin(handler(event)));
        self.subscribe_boxed(pattern, handler)
    }

    /// Register a pre-boxed subscriber (used by the materialized view
    /// manager).
    pub fn subscribe_boxed(
        &self,
        pattern: impl Into<String>,
        handler: SubscriberFn,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.into(),
            handler,
        });
        id
    }

    /// Remove a subscription. Returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Validate and route one raw notification.
    ///
    /// 1. Parse into an [`Event`]; malformed input fails with
    ///    [`ValidationError`] before any schema is consulted.
    /// 2. No registered rule → schema-free pass-through.
    /// 3. Rule present → the complete violation set is collected; any
    ///    violation rejects the event.
    /// 4. Dispatch to every matching subscription in registration order;
    ///    handler failures are isolated and reported in the [`Dispatch`].
    pub async fn ingest(&self, raw: RawNotification) -> Result<Dispatch, ValidationError> {
        self.counters.ingested.fetch_add(1, Ordering::Relaxed);

        let event = raw
            .parse(|| self.arrival.fetch_add(1, Ordering::Relaxed) + 1)
            .map_err(|err| {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "malformed notification rejected");
                err
            })?;

        if let Some(rule) = self.schema(&event.event_type) {
            let violations = rule.check(&event.payload);
            if !violations.is_empty() {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    event_type = %event.event_type,
                    violation_count = violations.len(),
                    "event rejected by schema"
                );
                return Err(ValidationError::SchemaViolations {
                    event_type: event.event_type,
                    violations,
                    rule,
                    payload: event.payload,
                });
            }
        }

        Ok(self.dispatch(Arc::new(event)).await)
    }

    /// Deliver a validated event to every matching subscription.
    async fn dispatch(&self, event: Arc<Event>) -> Dispatch {
        // Snapshot matching handlers so dispatch never holds the registry
        // lock across handler awaits.
        let matching: Vec<(SubscriptionId, SubscriberFn)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.matches(&event.event_type))
            .map(|s| (s.id, s.handler.clone()))
            .collect();

        let mut delivered = 0;
        let mut handler_errors = Vec::new();
        for (id, handler) in matching {
            match handler(event.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    self.counters.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscription = id.0,
                        event_type = %event.event_type,
                        sequence = event.sequence,
                        error = %err,
                        "subscriber failed; continuing dispatch"
                    );
                    handler_errors.push((id, err));
                }
            }
        }

        Dispatch {
            event,
            delivered,
            handler_errors,
        }
    }

    /// Drain the change feed for one source path into `ingest`.
    ///
    /// Per-event rejections are logged and skipped; the loop only ends when
    /// the feed closes (re-subscribe to restart it).
    pub async fn run(
        &self,
        connection: &ConnectionManager,
        path: &str,
    ) -> Result<(), ReflexError> {
        let mut feed = connection.changes(path).await?;
        debug!(%path, "event mesh attached to change feed");
        while let Some(raw) = feed.recv().await {
            if let Err(err) = self.ingest(raw).await {
                debug!(%path, error = %err, "notification rejected");
            }
        }
        debug!(%path, "change feed closed");
        Ok(())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MeshStats {
        MeshStats {
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            handler_errors: self.counters.handler_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reflex_core::MISSING_REQUIRED_FIELD;
    use serde_json::json;
    use std::sync::Mutex;

    fn raw(body: serde_json::Value) -> RawNotification {
        RawNotification::new("orders/incoming", body)
    }

    fn recording_handler(
        log: Arc<Mutex<Vec<String>>>,
        tag: &str,
    ) -> impl Fn(Arc<Event>) -> SubscriberFuture + Send + Sync + 'static {
        let tag = tag.to_string();
        move |event: Arc<Event>| {
            let log = log.clone();
            let tag = tag.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("{}:{}", tag, event.event_type));
                Ok(())
            }) as SubscriberFuture
        }
    }

    #[tokio::test]
    async fn test_malformed_rejected_before_schema() {
        let mesh = EventMesh::new();
        // Register a rule that would also fail, to prove it is never reached.
        mesh.register_schema("order.created", SchemaRule::new().require("order_id"));

        let err = mesh.ingest(raw(json!({"payload": {}}))).await.unwrap_err();
        assert!(matches!(err, ValidationError::Malformed { .. }));
        assert!(err.violations().is_none());
        assert_eq!(mesh.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_passes_through() {
        let mesh = EventMesh::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        mesh.subscribe_boxed(WILDCARD, Arc::new(recording_handler(log.clone(), "w")));

        let report = mesh
            .ingest(raw(json!({"type": "unknown.type", "payload": {"x": 1}})))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.event.field("x"), Some(&json!(1)));
        assert_eq!(log.lock().unwrap().as_slice(), ["w:unknown.type"]);
    }

    #[tokio::test]
    async fn test_violation_set_is_complete() {
        let mesh = EventMesh::new();
        mesh.register_schema(
            "order.created",
            SchemaRule::new().require_all(["order_id", "amount"]),
        );

        let err = mesh
            .ingest(raw(json!({"type": "order.created", "payload": {}})))
            .await
            .unwrap_err();
        let violations = err.violations().unwrap();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations["order_id"], MISSING_REQUIRED_FIELD);
        assert_eq!(violations["amount"], MISSING_REQUIRED_FIELD);
    }

    #[tokio::test]
    async fn test_newest_rule_wins() {
        let mesh = EventMesh::new();
        mesh.register_schema("t", SchemaRule::new().require("a"));
        mesh.register_schema("t", SchemaRule::new().require("b"));

        let err = mesh
            .ingest(raw(json!({"type": "t", "payload": {"a": 1}})))
            .await
            .unwrap_err();
        let violations = err.violations().unwrap();
        assert_eq!(violations.len(), 1);
        assert!(violations.contains_key("b"));
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let mesh = EventMesh::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        mesh.subscribe_boxed("t", Arc::new(recording_handler(log.clone(), "first")));
        mesh.subscribe_boxed(WILDCARD, Arc::new(recording_handler(log.clone(), "wild")));
        mesh.subscribe_boxed("t", Arc::new(recording_handler(log.clone(), "second")));
        mesh.subscribe_boxed("other", Arc::new(recording_handler(log.clone(), "never")));

        let report = mesh
            .ingest(raw(json!({"type": "t", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["first:t", "wild:t", "second:t"]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_is_isolated() {
        let mesh = EventMesh::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        mesh.subscribe("t", |_event| async {
            Err(reflex_core::ConnectionError::backend("handler exploded").into())
        });
        mesh.subscribe_boxed("t", Arc::new(recording_handler(log.clone(), "survivor")));

        let report = mesh
            .ingest(raw(json!({"type": "t", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.handler_errors.len(), 1);
        assert_eq!(log.lock().unwrap().as_slice(), ["survivor:t"]);
        assert_eq!(mesh.stats().handler_errors, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let mesh = EventMesh::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let id = mesh.subscribe_boxed("t", Arc::new(recording_handler(log.clone(), "gone")));
        assert!(mesh.unsubscribe(id));
        assert!(!mesh.unsubscribe(id));

        let report = mesh
            .ingest(raw(json!({"type": "t", "payload": {}})))
            .await
            .unwrap();
        assert_eq!(report.delivered, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_arrival_sequence_is_monotone() {
        let mesh = EventMesh::new();

        let first = mesh
            .ingest(raw(json!({"type": "t", "payload": {}})))
            .await
            .unwrap();
        let second = mesh
            .ingest(raw(json!({"type": "t", "payload": {}})))
            .await
            .unwrap();
        assert!(second.event.sequence > first.event.sequence);

        // Backend-assigned markers are kept as-is.
        let backed = mesh
            .ingest(raw(json!({"type": "t", "payload": {}})).with_sequence(99))
            .await
            .unwrap();
        assert_eq!(backed.event.sequence, 99);
    }
}

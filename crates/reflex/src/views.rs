//! Materialized views: incremental projections of the event stream
//!
//! Each view is a named fold over the events bound to it: `value =
//! apply(value, event)`, one event at a time, exactly once, in marker
//! order. Downstream readers never observe a view older than an event the
//! manager has already accepted.
//!
//! # Features
//!
//! - **Single writer per view**: application to one view is serialized by a
//!   per-view async mutex; different views apply fully in parallel (no
//!   global lock)
//! - **Stale/duplicate rejection**: an event whose marker is not greater
//!   than the view's last-applied marker is rejected with a typed error and
//!   the view left untouched — expected, non-fatal, counted
//! - **Retryable apply failures**: a failing fold leaves the marker
//!   unadvanced, so the same event can be retried once the defect is fixed
//! - **Rebuild**: replay the fold from the initial value, either from an
//!   in-memory event slice or by re-reading the backing document through
//!   the connection manager (slow path, never hot)
//!
//! # Example
//!
//! ```rust,ignore
//! use reflex::MaterializedViewManager;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! let views = Arc::new(MaterializedViewManager::new());
//! views.bind_view("orders.by_id", ["order.created"], Arc::new(|value, event| {
//!     let mut map = value.as_object().cloned().unwrap_or_default();
//!     if let Some(id) = event.field("order_id").and_then(Value::as_str) {
//!         map.insert(id.to_string(), Value::Object(event.payload.clone()));
//!     }
//!     Ok(Value::Object(map))
//! }));
//!
//! mesh.subscribe_boxed("order.created", views.clone().subscriber());
//! ```

use crate::connection::ConnectionManager;
use crate::mesh::SubscriberFn;
use parking_lot::RwLock;
use reflex_core::{
    Event, MaterializedViewError, RawNotification, ReadMode, ReflexError,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One fold step: `apply(current_value, event) -> next_value`. Must be pure
/// with respect to the view (all state lives in the value).
pub type ApplyFn = Arc<dyn Fn(Value, &Event) -> Result<Value, String> + Send + Sync>;

/// Declaration of how a view is derived from the event stream.
struct ViewBinding {
    view_id: String,
    event_types: HashSet<String>,
    apply: ApplyFn,
    initial: Value,
}

impl ViewBinding {
    fn matches(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type)
    }
}

/// Mutable view state, guarded by the per-view mutex.
struct ViewState {
    value: Value,
    last_applied: Option<u64>,
    consistent: bool,
}

struct ViewSlot {
    state: Mutex<ViewState>,
    applied: AtomicU64,
    stale_rejected: AtomicU64,
    apply_failures: AtomicU64,
}

impl ViewSlot {
    fn new(initial: Value) -> Self {
        Self {
            state: Mutex::new(ViewState {
                value: initial,
                last_applied: None,
                consistent: true,
            }),
            applied: AtomicU64::new(0),
            stale_rejected: AtomicU64::new(0),
            apply_failures: AtomicU64::new(0),
        }
    }
}

/// A point-in-time read of a view.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ViewSnapshot {
    pub value: Value,
    pub last_applied: Option<u64>,
    pub consistent: bool,
}

/// Per-view counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ViewStats {
    pub applied: u64,
    pub stale_rejected: u64,
    pub apply_failures: u64,
}

/// Maintains named views as a fold over the event stream.
pub struct MaterializedViewManager {
    read_mode: ReadMode,
    bindings: RwLock<Vec<Arc<ViewBinding>>>,
    views: RwLock<HashMap<String, Arc<ViewSlot>>>,
}

impl Default for MaterializedViewManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MaterializedViewManager {
    /// Create a manager with blocking reads (the default).
    pub fn new() -> Self {
        Self::with_read_mode(ReadMode::Block)
    }

    /// Create a manager with the given read-contention policy.
    pub fn with_read_mode(read_mode: ReadMode) -> Self {
        Self {
            read_mode,
            bindings: RwLock::new(Vec::new()),
            views: RwLock::new(HashMap::new()),
        }
    }

    /// Declare a view updated by `apply` for every event of the given
    /// types, starting from `Value::Null`. Re-binding an existing view id
    /// replaces the binding; the materialized state, if any, is kept.
    pub fn bind_view<I, S>(&self, view_id: impl Into<String>, event_types: I, apply: ApplyFn)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bind_view_with_initial(view_id, event_types, apply, Value::Null)
    }

    /// Declare a view with an explicit initial value.
    pub fn bind_view_with_initial<I, S>(
        &self,
        view_id: impl Into<String>,
        event_types: I,
        apply: ApplyFn,
        initial: Value,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let binding = Arc::new(ViewBinding {
            view_id: view_id.into(),
            event_types: event_types.into_iter().map(Into::into).collect(),
            apply,
            initial,
        });
        debug!(view = %binding.view_id, "view bound");

        let mut bindings = self.bindings.write();
        if let Some(existing) = bindings
            .iter_mut()
            .find(|b| b.view_id == binding.view_id)
        {
            *existing = binding;
        } else {
            bindings.push(binding);
        }
    }

    /// Remove a binding and its materialized state. Administrative.
    pub fn remove_view(&self, view_id: &str) -> bool {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|b| b.view_id != view_id);
        let removed = bindings.len() != before;
        drop(bindings);

        self.views.write().remove(view_id);
        if removed {
            info!(view = %view_id, "view removed");
        }
        removed
    }

    /// Ids of all bound views, in binding order.
    pub fn view_ids(&self) -> Vec<String> {
        self.bindings.read().iter().map(|b| b.view_id.clone()).collect()
    }

    /// Apply one event to every view bound to its type.
    ///
    /// Stale/duplicate markers and failing folds are reported per view; the
    /// first error is returned after **all** matching views were attempted,
    /// so one bad view never starves another.
    pub async fn on_event(&self, event: &Event) -> Result<(), MaterializedViewError> {
        let matching: Vec<Arc<ViewBinding>> = self
            .bindings
            .read()
            .iter()
            .filter(|b| b.matches(&event.event_type))
            .cloned()
            .collect();

        let mut first_error = None;
        for binding in matching {
            if let Err(err) = self.apply_to_view(&binding, event).await {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// An event-mesh subscriber that feeds this manager. Bind it with the
    /// event types used in `bind_view` (or the wildcard).
    pub fn subscriber(self: Arc<Self>) -> SubscriberFn {
        Arc::new(move |event| {
            let manager = Arc::clone(&self);
            Box::pin(async move {
                manager
                    .on_event(&event)
                    .await
                    .map_err(ReflexError::from)
            })
        })
    }

    async fn apply_to_view(
        &self,
        binding: &ViewBinding,
        event: &Event,
    ) -> Result<(), MaterializedViewError> {
        let slot = self.slot(binding);
        let mut state = slot.state.lock().await;

        if let Some(last) = state.last_applied {
            if event.sequence <= last {
                slot.stale_rejected.fetch_add(1, Ordering::Relaxed);
                debug!(
                    view = %binding.view_id,
                    sequence = event.sequence,
                    last_applied = last,
                    "rejected duplicate or out-of-order event"
                );
                return Err(MaterializedViewError::Stale {
                    view: binding.view_id.clone(),
                    sequence: event.sequence,
                    last_applied: last,
                });
            }
        }

        match (binding.apply)(state.value.clone(), event) {
            Ok(next) => {
                state.value = next;
                state.last_applied = Some(event.sequence);
                state.consistent = true;
                slot.applied.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(reason) => {
                // Marker not advanced: the event stays retryable and the
                // view keeps its prior consistent value.
                slot.apply_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    view = %binding.view_id,
                    sequence = event.sequence,
                    %reason,
                    "apply failed; view left at prior state"
                );
                Err(MaterializedViewError::ApplyFailed {
                    view: binding.view_id.clone(),
                    sequence: event.sequence,
                    reason,
                })
            }
        }
    }

    /// Read a view's current value and last-applied marker.
    ///
    /// Never blocks on writes to *other* views. A write in flight on *this*
    /// view either blocks (`ReadMode::Block`) or fails fast
    /// (`ReadMode::FailFast`), so a partially-applied value is never
    /// observable.
    pub async fn read(&self, view_id: &str) -> Result<ViewSnapshot, MaterializedViewError> {
        let slot = self
            .views
            .read()
            .get(view_id)
            .cloned()
            .ok_or_else(|| MaterializedViewError::unbound(view_id))?;

        let state = match self.read_mode {
            ReadMode::Block => slot.state.lock().await,
            ReadMode::FailFast => slot.state.try_lock().map_err(|_| {
                MaterializedViewError::ReadContended {
                    view: view_id.to_string(),
                }
            })?,
        };

        Ok(ViewSnapshot {
            value: state.value.clone(),
            last_applied: state.last_applied,
            consistent: state.consistent,
        })
    }

    /// Flag a view as inconsistent (e.g. after a detected delivery gap) so
    /// operators know a rebuild is due.
    pub async fn mark_dirty(&self, view_id: &str) -> Result<(), MaterializedViewError> {
        let slot = self
            .views
            .read()
            .get(view_id)
            .cloned()
            .ok_or_else(|| MaterializedViewError::unbound(view_id))?;
        slot.state.lock().await.consistent = false;
        warn!(view = %view_id, "view marked dirty");
        Ok(())
    }

    /// Whether a view is currently consistent. Views that have not
    /// materialized yet read as consistent.
    pub async fn is_consistent(&self, view_id: &str) -> bool {
        let slot = self.views.read().get(view_id).cloned();
        match slot {
            Some(slot) => slot.state.lock().await.consistent,
            None => true,
        }
    }

    /// Rebuild a view by replaying the fold from the initial value over an
    /// ordered event slice. Events of unbound types are skipped. The view's
    /// marker ends at the highest replayed sequence.
    pub async fn rebuild_from(
        &self,
        view_id: &str,
        events: &[Event],
    ) -> Result<ViewSnapshot, MaterializedViewError> {
        let binding = self
            .bindings
            .read()
            .iter()
            .find(|b| b.view_id == view_id)
            .cloned()
            .ok_or_else(|| MaterializedViewError::unbound(view_id))?;

        let slot = self.slot(&binding);
        let mut state = slot.state.lock().await;

        let mut value = binding.initial.clone();
        let mut last_applied = None;
        for event in events.iter().filter(|e| binding.matches(&e.event_type)) {
            value = (binding.apply)(value, event).map_err(|reason| {
                MaterializedViewError::rebuild(view_id, reason)
            })?;
            last_applied = last_applied.max(Some(event.sequence));
        }

        state.value = value;
        state.last_applied = last_applied;
        state.consistent = true;
        info!(
            view = %view_id,
            events = events.len(),
            last_applied = ?last_applied,
            "view rebuilt"
        );

        Ok(ViewSnapshot {
            value: state.value.clone(),
            last_applied: state.last_applied,
            consistent: true,
        })
    }

    /// Rebuild a view by re-reading its backing document (a JSON array of
    /// raw notification bodies) through the connection manager. Slow path.
    pub async fn rebuild_via(
        &self,
        view_id: &str,
        connection: &ConnectionManager,
        path: &str,
    ) -> Result<ViewSnapshot, ReflexError> {
        let document = connection
            .read_document(path)
            .await?
            .ok_or_else(|| MaterializedViewError::rebuild(view_id, format!("no document at '{}'", path)))?;

        let items = document.as_array().ok_or_else(|| {
            MaterializedViewError::rebuild(view_id, format!("document at '{}' is not an array", path))
        })?;

        let mut events = Vec::with_capacity(items.len());
        for (index, body) in items.iter().enumerate() {
            let sequence = body.get("seq").and_then(Value::as_u64);
            let mut raw = RawNotification::new(path, body.clone());
            raw.sequence = sequence;
            let event = raw.parse(|| index as u64 + 1).map_err(|err| {
                MaterializedViewError::rebuild(view_id, err.to_string())
            })?;
            events.push(event);
        }

        Ok(self.rebuild_from(view_id, &events).await?)
    }

    /// Persist a view's current value and marker through the connection
    /// manager as a durability backstop. The in-memory view stays the
    /// authoritative fast-path copy.
    pub async fn persist(
        &self,
        view_id: &str,
        connection: &ConnectionManager,
        path: &str,
    ) -> Result<(), ReflexError> {
        let snapshot = self.read(view_id).await?;
        connection
            .write_document(
                path,
                json!({
                    "view": view_id,
                    "value": snapshot.value,
                    "last_applied": snapshot.last_applied,
                }),
            )
            .await?;
        debug!(view = %view_id, %path, "view persisted");
        Ok(())
    }

    /// Per-view counter snapshots.
    pub fn stats(&self) -> HashMap<String, ViewStats> {
        self.views
            .read()
            .iter()
            .map(|(id, slot)| {
                (
                    id.clone(),
                    ViewStats {
                        applied: slot.applied.load(Ordering::Relaxed),
                        stale_rejected: slot.stale_rejected.load(Ordering::Relaxed),
                        apply_failures: slot.apply_failures.load(Ordering::Relaxed),
                    },
                )
            })
            .collect()
    }

    /// Get or lazily create the slot for a binding's view.
    fn slot(&self, binding: &ViewBinding) -> Arc<ViewSlot> {
        if let Some(slot) = self.views.read().get(&binding.view_id) {
            return slot.clone();
        }
        let mut views = self.views.write();
        views
            .entry(binding.view_id.clone())
            .or_insert_with(|| Arc::new(ViewSlot::new(binding.initial.clone())))
            .clone()
    }
}

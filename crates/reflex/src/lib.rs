//! # Reflex
//!
//! Reactive middleware between application code and a remote,
//! eventually-consistent document/real-time store: raw change events become
//! validated, routed events, and derived ("materialized") views stay
//! consistent with the event stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Remote backend                         │
//! │        (abstract: open / probe / changes / documents)        │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ raw change notifications
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionManager   ←─ single session, health monitor,      │
//! │                         bounded exponential reconnection     │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  EventMesh           ←─ schema validation + routing to       │
//! │                         subscribers (insertion order)        │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  MaterializedViewManager ←─ per-view single-writer fold,     │
//! │                             stale rejection, rebuild path    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`backend`]: the capability contract the remote store must satisfy,
//!   plus an in-memory implementation for tests and local development
//! - [`backoff`]: the `base * 2^(n-1)` reconnect schedule
//! - [`connection`]: the connection manager and its health monitor
//! - [`mesh`]: event validation and routing
//! - [`views`]: materialized view maintenance
//!
//! Core types (events, schema rules, errors, configuration) live in
//! [`reflex_core`] and are re-exported here.
//!
//! ## Lifecycle
//!
//! Construct one [`ConnectionManager`] per target backend at process start
//! and pass it (`Arc`) to everything that needs the store; attach an
//! [`EventMesh`] to one or more change feeds; register a
//! [`MaterializedViewManager`] as a mesh subscriber; call
//! [`ConnectionManager::shutdown`] during teardown.

pub mod backend;
pub mod backoff;
pub mod connection;
pub mod mesh;
pub mod views;

pub use backend::{Document, MemoryBackend, ProbeOutcome, RemoteBackend, SessionHandle};
pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use connection::{
    ConnectionHealth, ConnectionManager, ConnectionState, ConnectionStats,
};
pub use mesh::{
    Dispatch, EventMesh, MeshStats, SubscriberFn, SubscriberFuture, SubscriptionId, WILDCARD,
};
pub use views::{ApplyFn, MaterializedViewManager, ViewSnapshot, ViewStats};

// Re-export the core types alongside the runtime.
pub use reflex_core::{
    ConnectionError, Event, FieldKind, MaterializedViewError, RawNotification, ReadMode,
    ReflexConfig, ReflexError, Result, SchemaRule, ValidationError, Violations,
};

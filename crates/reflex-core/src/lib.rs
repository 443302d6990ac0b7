//! # Reflex Core
//!
//! Core types for the Reflex reactive middleware:
//!
//! - [`event`]: raw change notifications and the immutable [`Event`] record
//! - [`schema`]: per-event-type validation rules with complete violation
//!   reporting
//! - [`error`]: the component-tagged error taxonomy
//! - [`config`]: startup configuration with synchronous validation
//!
//! This crate is runtime-agnostic: no async executor, no I/O. The runtime
//! half of the system (connection management, event mesh, materialized
//! views) lives in the `reflex` crate.

pub mod config;
pub mod error;
pub mod event;
pub mod schema;

pub use config::{ReadMode, ReflexConfig, ReflexConfigBuilder};
pub use error::{
    ConnectionError, MaterializedViewError, ReflexError, Result, ValidationError,
};
pub use event::{Event, RawNotification};
pub use schema::{FieldKind, SchemaRule, Violations, MISSING_REQUIRED_FIELD};

//! Error taxonomy for the reflex layer
//!
//! One typed error per component, plus the [`ReflexError`] umbrella. Every
//! kind exposes three structured accessors so downstream handlers can log
//! and route on fields instead of parsing message text:
//!
//! - [`component()`](ReflexError::component) — which component produced it
//! - [`error_code()`](ReflexError::error_code) — metric-safe static string
//! - [`context()`](ReflexError::context) — structured JSON context
//!
//! Connection errors are process-wide and automatically recovered by the
//! health monitor; validation and view errors are local to a single event
//! and never abort processing of subsequent events. Credential *material*
//! never appears in an error — only the credential reference (a path or
//! name) does.

use crate::schema::{SchemaRule, Violations};
use serde_json::{json, Map, Value};
use std::time::Duration;
use thiserror::Error;

/// Result alias for reflex operations.
pub type Result<T, E = ReflexError> = std::result::Result<T, E>;

// ============================================================================
// Connection errors
// ============================================================================

/// Backend unreachable or misconfigured.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    /// Configuration rejected before any network attempt.
    #[error("invalid configuration: {reason}")]
    Config { reason: String },

    /// Opening a session failed.
    #[error("failed to open session to '{target}' with credentials at '{credential_ref}': {reason}")]
    OpenFailed {
        target: String,
        credential_ref: String,
        reason: String,
    },

    /// A health probe did not answer within its timeout.
    #[error("health probe timed out after {timeout:?}")]
    ProbeTimeout { timeout: Duration },

    /// The reconnect attempt cap was exceeded.
    #[error("connection to '{target}' failed after {attempts} reconnect attempts")]
    AttemptsExhausted { target: String, attempts: u32 },

    /// An operation required a live session and none exists.
    #[error("not connected to '{target}'")]
    NotConnected { target: String },

    /// Fault reported by the backend itself.
    #[error("backend fault: {reason}")]
    Backend { reason: String },
}

impl ConnectionError {
    /// Create a configuration error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a backend fault error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Check if this error is transient and worth retrying.
    ///
    /// Misconfiguration is permanent; everything else recovers once the
    /// backend comes back.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_invalid",
            Self::OpenFailed { .. } => "open_failed",
            Self::ProbeTimeout { .. } => "probe_timeout",
            Self::AttemptsExhausted { .. } => "attempts_exhausted",
            Self::NotConnected { .. } => "not_connected",
            Self::Backend { .. } => "backend_fault",
        }
    }

    /// Structured context for logging and routing.
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        match self {
            Self::Config { reason } => {
                ctx.insert("reason".into(), json!(reason));
            }
            Self::OpenFailed {
                target,
                credential_ref,
                reason,
            } => {
                ctx.insert("target".into(), json!(target));
                ctx.insert("credential_ref".into(), json!(credential_ref));
                ctx.insert("reason".into(), json!(reason));
            }
            Self::ProbeTimeout { timeout } => {
                ctx.insert("timeout_ms".into(), json!(timeout.as_millis() as u64));
            }
            Self::AttemptsExhausted { target, attempts } => {
                ctx.insert("target".into(), json!(target));
                ctx.insert("attempts".into(), json!(attempts));
            }
            Self::NotConnected { target } => {
                ctx.insert("target".into(), json!(target));
            }
            Self::Backend { reason } => {
                ctx.insert("reason".into(), json!(reason));
            }
        }
        ctx
    }
}

// ============================================================================
// Validation errors
// ============================================================================

/// An event failed structural or schema checks. Never retried: the event is
/// permanently rejected and what to do with it is the caller's decision.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    /// The raw notification is structurally malformed (no schema consulted).
    #[error("malformed notification from '{source_path}': missing or invalid '{field}'")]
    Malformed {
        source_path: String,
        field: &'static str,
    },

    /// The payload violates the registered rule for its type. Carries the
    /// complete violation set, the rule evaluated, and the offending
    /// payload, so callers get the whole picture at once.
    #[error("event '{event_type}' failed schema validation ({} violation(s))", .violations.len())]
    SchemaViolations {
        event_type: String,
        violations: Violations,
        rule: SchemaRule,
        payload: Map<String, Value>,
    },
}

impl ValidationError {
    /// Create a malformed-notification error.
    pub fn malformed(source_path: impl Into<String>, field: &'static str) -> Self {
        Self::Malformed {
            source_path: source_path.into(),
            field,
        }
    }

    /// The violation set, if this is a schema failure.
    pub fn violations(&self) -> Option<&Violations> {
        match self {
            Self::SchemaViolations { violations, .. } => Some(violations),
            Self::Malformed { .. } => None,
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "malformed_notification",
            Self::SchemaViolations { .. } => "schema_violations",
        }
    }

    /// Structured context for logging and routing.
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        match self {
            Self::Malformed { source_path, field } => {
                ctx.insert("source_path".into(), json!(source_path));
                ctx.insert("field".into(), json!(field));
            }
            Self::SchemaViolations {
                event_type,
                violations,
                rule,
                payload,
            } => {
                ctx.insert("event_type".into(), json!(event_type));
                ctx.insert("violations".into(), json!(violations));
                ctx.insert(
                    "rule".into(),
                    serde_json::to_value(rule).unwrap_or(Value::Null),
                );
                ctx.insert("payload".into(), Value::Object(payload.clone()));
            }
        }
        ctx
    }
}

// ============================================================================
// Materialized view errors
// ============================================================================

/// A view operation failed.
///
/// `Stale` is an expected, non-fatal condition (duplicate or out-of-order
/// delivery caught by the marker check); `ApplyFailed` leaves the view at
/// its prior consistent state with the marker unadvanced so the event stays
/// retryable.
#[derive(Debug, Clone, Error)]
pub enum MaterializedViewError {
    /// Event marker is not greater than the view's last-applied marker.
    #[error("stale or duplicate event for view '{view}': sequence {sequence} <= last applied {last_applied}")]
    Stale {
        view: String,
        sequence: u64,
        last_applied: u64,
    },

    /// The apply function rejected the event.
    #[error("apply failed for view '{view}' at sequence {sequence}: {reason}")]
    ApplyFailed {
        view: String,
        sequence: u64,
        reason: String,
    },

    /// A fail-fast read found a write in flight on this view.
    #[error("read of view '{view}' contended: write in flight")]
    ReadContended { view: String },

    /// No binding/view exists under this id.
    #[error("unknown view '{view}'")]
    Unbound { view: String },

    /// A rebuild could not complete; the view keeps its prior state.
    #[error("rebuild of view '{view}' failed: {reason}")]
    Rebuild { view: String, reason: String },
}

impl MaterializedViewError {
    /// Create an unbound-view error.
    pub fn unbound(view: impl Into<String>) -> Self {
        Self::Unbound { view: view.into() }
    }

    /// Create a rebuild error.
    pub fn rebuild(view: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rebuild {
            view: view.into(),
            reason: reason.into(),
        }
    }

    /// True for the expected stale/duplicate rejection.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }

    /// The view operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Stale { .. } | Self::ApplyFailed { .. } => "apply",
            Self::ReadContended { .. } | Self::Unbound { .. } => "read",
            Self::Rebuild { .. } => "rebuild",
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Stale { .. } => "stale_or_duplicate",
            Self::ApplyFailed { .. } => "apply_failed",
            Self::ReadContended { .. } => "read_contended",
            Self::Unbound { .. } => "view_unbound",
            Self::Rebuild { .. } => "rebuild_failed",
        }
    }

    /// Structured context for logging and routing.
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = Map::new();
        match self {
            Self::Stale {
                view,
                sequence,
                last_applied,
            } => {
                ctx.insert("view".into(), json!(view));
                ctx.insert("sequence".into(), json!(sequence));
                ctx.insert("last_applied".into(), json!(last_applied));
            }
            Self::ApplyFailed {
                view,
                sequence,
                reason,
            } => {
                ctx.insert("view".into(), json!(view));
                ctx.insert("sequence".into(), json!(sequence));
                ctx.insert("reason".into(), json!(reason));
            }
            Self::ReadContended { view } | Self::Unbound { view } => {
                ctx.insert("view".into(), json!(view));
            }
            Self::Rebuild { view, reason } => {
                ctx.insert("view".into(), json!(view));
                ctx.insert("reason".into(), json!(reason));
            }
        }
        ctx
    }
}

// ============================================================================
// Umbrella
// ============================================================================

/// Any reflex-layer failure, tagged by originating component.
#[derive(Debug, Clone, Error)]
pub enum ReflexError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    View(#[from] MaterializedViewError),
}

impl ReflexError {
    /// The component that produced this error.
    pub fn component(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection_manager",
            Self::Validation(_) => "event_mesh",
            Self::View(_) => "materialized_views",
        }
    }

    /// Metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(e) => e.error_code(),
            Self::Validation(e) => e.error_code(),
            Self::View(e) => e.error_code(),
        }
    }

    /// Structured context for logging and routing, including the component
    /// tag.
    pub fn context(&self) -> Map<String, Value> {
        let mut ctx = match self {
            Self::Connection(e) => e.context(),
            Self::Validation(e) => e.context(),
            Self::View(e) => e.context(),
        };
        ctx.insert("component".into(), json!(self.component()));
        ctx
    }

    /// Check if this error is transient and worth retrying. Validation
    /// rejections are permanent; view staleness is final for that event.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connection(e) => e.is_retriable(),
            Self::Validation(_) => false,
            Self::View(e) => matches!(e, MaterializedViewError::ApplyFailed { .. }),
        }
    }
}

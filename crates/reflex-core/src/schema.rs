//! Schema rules for event validation
//!
//! A [`SchemaRule`] describes what a payload of a given event type must look
//! like: which fields are required, and optionally what kind of JSON value a
//! field must hold. Rules are plain data (serializable, comparable) so they
//! can be carried inside validation errors for debugging.
//!
//! # Example
//!
//! ```rust
//! use reflex_core::schema::{FieldKind, SchemaRule};
//! use serde_json::{json, Map};
//!
//! let rule = SchemaRule::new()
//!     .require("order_id")
//!     .require("amount")
//!     .kind("amount", FieldKind::Number);
//!
//! let mut payload = Map::new();
//! payload.insert("order_id".into(), json!("A1"));
//! payload.insert("amount".into(), json!("not a number"));
//!
//! let violations = rule.check(&payload);
//! assert_eq!(violations.len(), 1);
//! assert!(violations["amount"].contains("number"));
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// The JSON value kind a payload field must hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl FieldKind {
    /// Check whether a value is of this kind.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    /// Human-readable kind name, used in violation messages.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }

    /// Kind name of an arbitrary JSON value, used in violation messages.
    pub fn of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

/// Violation set produced by [`SchemaRule::check`]: field name → reason.
pub type Violations = BTreeMap<String, String>;

/// Message recorded for a required field absent from the payload.
pub const MISSING_REQUIRED_FIELD: &str = "Missing required field";

/// Validation rule for a single event type.
///
/// Installed into the event mesh via `register_schema`; the newest rule for
/// a type wins wholesale. Events of types with no rule pass through
/// unvalidated (permissive default).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaRule {
    /// Fields that must be present in the payload
    required: Vec<String>,
    /// Kind constraints, checked only for fields that are present
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    kinds: BTreeMap<String, FieldKind>,
}

impl SchemaRule {
    /// Create an empty rule (accepts any payload).
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a field to be present.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !self.required.contains(&field) {
            self.required.push(field);
        }
        self
    }

    /// Require several fields to be present.
    pub fn require_all<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            self = self.require(field);
        }
        self
    }

    /// Constrain the kind of a field. The constraint is only evaluated when
    /// the field is present; combine with [`require`](Self::require) to make
    /// presence mandatory too.
    pub fn kind(mut self, field: impl Into<String>, kind: FieldKind) -> Self {
        self.kinds.insert(field.into(), kind);
        self
    }

    /// The required field names, in declaration order.
    pub fn required_fields(&self) -> &[String] {
        &self.required
    }

    /// Check a payload against this rule, returning the **complete** set of
    /// violations. An empty map means the payload passes.
    pub fn check(&self, payload: &Map<String, Value>) -> Violations {
        let mut violations = Violations::new();

        for field in &self.required {
            if !payload.contains_key(field) {
                violations.insert(field.clone(), MISSING_REQUIRED_FIELD.to_string());
            }
        }

        for (field, kind) in &self.kinds {
            if let Some(value) = payload.get(field) {
                if !kind.matches(value) {
                    violations.insert(
                        field.clone(),
                        format!("Expected {}, got {}", kind.name(), FieldKind::of(value)),
                    );
                }
            }
        }

        if !violations.is_empty() {
            debug!(
                violation_count = violations.len(),
                "payload failed schema check"
            );
        }

        violations
    }
}

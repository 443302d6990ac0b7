//! Reflex layer configuration
//!
//! All knobs the runtime needs at startup: where the backend lives, how to
//! authenticate against it, and how aggressively to probe and reconnect.
//! Validation is synchronous and runs before any network attempt, so a
//! misconfigured process fails fast and cheap.
//!
//! # Example
//!
//! ```rust
//! use reflex_core::config::ReflexConfig;
//! use std::time::Duration;
//!
//! let config = ReflexConfig::builder()
//!     .credential_ref("/etc/reflex/service-account.json")
//!     .target("projects/acme-prod")
//!     .reconnect_base_delay(Duration::from_secs(2))
//!     .max_reconnect_attempts(5)
//!     .build();
//!
//! assert!(config.validate().is_ok());
//! ```

use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a materialized-view read behaves when a write to the same view is in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    /// Wait for the in-flight write to finish (default).
    #[default]
    Block,
    /// Return a read-contended error immediately.
    FailFast,
}

/// Configuration for the reflex layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflexConfig {
    /// Reference to the credential (a path or secret name) — never the
    /// credential material itself.
    pub credential_ref: String,
    /// Target backend identifier (project, database, or cluster id).
    pub target: String,
    /// Base delay before the first reconnect attempt; attempt *n* waits
    /// `base * 2^(n-1)`.
    pub reconnect_base_delay: Duration,
    /// Reconnect attempt cap; past it the delay stops growing and the
    /// connection is reported failed.
    pub max_reconnect_attempts: u32,
    /// Interval between background health probes.
    pub probe_interval: Duration,
    /// Timeout for a single probe or reconnect attempt. Must be shorter
    /// than `probe_interval` so a hung probe cannot starve the next one.
    pub probe_timeout: Duration,
    /// Read behavior for materialized views under write contention.
    pub read_mode: ReadMode,
}

impl Default for ReflexConfig {
    fn default() -> Self {
        Self {
            credential_ref: String::new(),
            target: String::new(),
            reconnect_base_delay: Duration::from_secs(2),
            max_reconnect_attempts: 5,
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            read_mode: ReadMode::Block,
        }
    }
}

impl ReflexConfig {
    /// Create a builder.
    pub fn builder() -> ReflexConfigBuilder {
        ReflexConfigBuilder::default()
    }

    /// Validate the configuration. Runs before any network attempt.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.credential_ref.trim().is_empty() {
            return Err(ConnectionError::config(
                "credential reference must not be empty",
            ));
        }
        if self.target.trim().is_empty() {
            return Err(ConnectionError::config(
                "target identifier must not be empty",
            ));
        }
        if self.target.chars().any(char::is_whitespace) {
            return Err(ConnectionError::config(format!(
                "target identifier '{}' must not contain whitespace",
                self.target
            )));
        }
        if self.reconnect_base_delay.is_zero() {
            return Err(ConnectionError::config(
                "reconnect base delay must be greater than zero",
            ));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ConnectionError::config(
                "max reconnect attempts must be greater than zero",
            ));
        }
        if self.probe_timeout >= self.probe_interval {
            return Err(ConnectionError::config(format!(
                "probe timeout ({:?}) must be shorter than the probe interval ({:?})",
                self.probe_timeout, self.probe_interval
            )));
        }
        Ok(())
    }
}

/// Builder for [`ReflexConfig`].
#[derive(Debug, Clone, Default)]
pub struct ReflexConfigBuilder {
    credential_ref: Option<String>,
    target: Option<String>,
    reconnect_base_delay: Option<Duration>,
    max_reconnect_attempts: Option<u32>,
    probe_interval: Option<Duration>,
    probe_timeout: Option<Duration>,
    read_mode: Option<ReadMode>,
}

impl ReflexConfigBuilder {
    /// Set the credential reference (path or secret name).
    pub fn credential_ref(mut self, value: impl Into<String>) -> Self {
        self.credential_ref = Some(value.into());
        self
    }

    /// Set the target backend identifier.
    pub fn target(mut self, value: impl Into<String>) -> Self {
        self.target = Some(value.into());
        self
    }

    /// Set the reconnect base delay.
    pub fn reconnect_base_delay(mut self, value: Duration) -> Self {
        self.reconnect_base_delay = Some(value);
        self
    }

    /// Set the reconnect attempt cap.
    pub fn max_reconnect_attempts(mut self, value: u32) -> Self {
        self.max_reconnect_attempts = Some(value);
        self
    }

    /// Set the health probe interval.
    pub fn probe_interval(mut self, value: Duration) -> Self {
        self.probe_interval = Some(value);
        self
    }

    /// Set the per-probe timeout.
    pub fn probe_timeout(mut self, value: Duration) -> Self {
        self.probe_timeout = Some(value);
        self
    }

    /// Set the view read mode.
    pub fn read_mode(mut self, value: ReadMode) -> Self {
        self.read_mode = Some(value);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ReflexConfig {
        let defaults = ReflexConfig::default();
        ReflexConfig {
            credential_ref: self.credential_ref.unwrap_or(defaults.credential_ref),
            target: self.target.unwrap_or(defaults.target),
            reconnect_base_delay: self
                .reconnect_base_delay
                .unwrap_or(defaults.reconnect_base_delay),
            max_reconnect_attempts: self
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            probe_interval: self.probe_interval.unwrap_or(defaults.probe_interval),
            probe_timeout: self.probe_timeout.unwrap_or(defaults.probe_timeout),
            read_mode: self.read_mode.unwrap_or(defaults.read_mode),
        }
    }
}

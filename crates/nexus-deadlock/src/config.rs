//! Detector configuration.
//!
//! All durations are stored as integer milliseconds or seconds so the
//! configuration round-trips through TOML without custom serializers.

use std::path::Path;
use std::time::Duration;

use nexus_common::constants::{
    DEFAULT_DEDUP_WINDOW_SECS, DEFAULT_REORDER_CAPACITY, DEFAULT_REORDER_WINDOW_MS,
    DEFAULT_STORE_TIMEOUT_MS, DEFAULT_TICK_INTERVAL_MS, DEFAULT_WAIT_THRESHOLD_SECS,
};
use serde::{Deserialize, Serialize};

use crate::error::{DetectError, DetectResult};

/// Configuration for the deadlock detection engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Wait time (seconds) after which a blocked transaction counts as
    /// deadlocked.
    #[serde(default = "default_wait_threshold")]
    pub wait_threshold_secs: f64,

    /// Window (seconds) in which repeat detections of the same vertex set
    /// are suppressed.
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,

    /// How far (milliseconds) an event may arrive behind later events and
    /// still be applied in timestamp order.
    #[serde(default = "default_reorder_window")]
    pub reorder_window_ms: u64,

    /// Maximum number of events held back for reordering.
    #[serde(default = "default_reorder_capacity")]
    pub reorder_capacity: usize,

    /// Bound (milliseconds) on each record store call.
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Interval (milliseconds) between detection ticks when run by a
    /// scheduler.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Whether the classifier signal takes part in the decision.
    #[serde(default = "default_classifier_enabled")]
    pub classifier_enabled: bool,
}

fn default_wait_threshold() -> f64 {
    DEFAULT_WAIT_THRESHOLD_SECS
}

fn default_dedup_window() -> u64 {
    DEFAULT_DEDUP_WINDOW_SECS
}

fn default_reorder_window() -> u64 {
    DEFAULT_REORDER_WINDOW_MS
}

fn default_reorder_capacity() -> usize {
    DEFAULT_REORDER_CAPACITY
}

fn default_store_timeout() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_tick_interval() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}

fn default_classifier_enabled() -> bool {
    true
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            wait_threshold_secs: default_wait_threshold(),
            dedup_window_secs: default_dedup_window(),
            reorder_window_ms: default_reorder_window(),
            reorder_capacity: default_reorder_capacity(),
            store_timeout_ms: default_store_timeout(),
            tick_interval_ms: default_tick_interval(),
            classifier_enabled: default_classifier_enabled(),
        }
    }
}

impl DetectorConfig {
    /// Creates a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> DetectResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DetectError::config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(content: &str) -> DetectResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| DetectError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> DetectResult<String> {
        toml::to_string_pretty(self).map_err(|e| DetectError::config(e.to_string()))
    }

    /// Sets the wait-time threshold.
    #[must_use]
    pub fn with_wait_threshold(mut self, threshold: Duration) -> Self {
        self.wait_threshold_secs = threshold.as_secs_f64();
        self
    }

    /// Sets the de-duplication window.
    #[must_use]
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window_secs = window.as_secs();
        self
    }

    /// Sets the out-of-order window.
    #[must_use]
    pub fn with_reorder_window(mut self, window: Duration) -> Self {
        self.reorder_window_ms = window.as_millis() as u64;
        self
    }

    /// Sets the reorder buffer capacity.
    #[must_use]
    pub fn with_reorder_capacity(mut self, capacity: usize) -> Self {
        self.reorder_capacity = capacity;
        self
    }

    /// Sets the store call timeout.
    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the tick interval.
    #[must_use]
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enables or disables the classifier signal.
    #[must_use]
    pub fn with_classifier_enabled(mut self, enabled: bool) -> Self {
        self.classifier_enabled = enabled;
        self
    }

    /// Returns the wait-time threshold. Values too large for a `Duration`
    /// saturate; [`validate`](Self::validate) rejects them.
    pub fn wait_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.wait_threshold_secs).unwrap_or(Duration::MAX)
    }

    /// Returns the de-duplication window.
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }

    /// Returns the out-of-order window.
    pub fn reorder_window(&self) -> Duration {
        Duration::from_millis(self.reorder_window_ms)
    }

    /// Returns the store call timeout.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Returns the tick interval.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> DetectResult<()> {
        if Duration::try_from_secs_f64(self.wait_threshold_secs).is_err() {
            return Err(DetectError::config(
                "wait threshold must be a non-negative number of seconds",
            ));
        }

        if self.reorder_capacity == 0 {
            return Err(DetectError::config("reorder capacity must be positive"));
        }

        if self.store_timeout_ms == 0 {
            return Err(DetectError::config("store timeout must be positive"));
        }

        if self.tick_interval_ms == 0 {
            return Err(DetectError::config("tick interval must be positive"));
        }

        Ok(())
    }
}

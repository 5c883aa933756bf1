//! Error types for the deadlock detector.
//!
//! Each capability has its own error enum so callers can tell a dropped
//! event apart from an unavailable classifier or a failed store call.
//! None of them is fatal: the wait-for graph is a projection of the event
//! log and can always be rebuilt.

use std::io;

use nexus_common::types::DeadlockId;
use thiserror::Error;

/// Result type for event parsing.
pub type EventResult<T> = Result<T, EventError>;

/// Result type for classifier calls.
pub type ClassifierResult<T> = Result<T, ClassifierError>;

/// Result type for record store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for engine operations.
pub type DetectResult<T> = Result<T, DetectError>;

/// Errors raised while turning a raw lock event into a [`LockEvent`].
///
/// [`LockEvent`]: crate::event::LockEvent
#[derive(Debug, Error)]
pub enum EventError {
    /// The event carried an unparseable identifier or kind.
    #[error("malformed lock event: {reason}")]
    MalformedEvent {
        /// What was wrong with the event.
        reason: String,
    },

    /// A JSON-encoded event could not be decoded.
    #[error("failed to decode lock event: {source}")]
    Decode {
        /// The underlying decoder error.
        #[from]
        source: serde_json::Error,
    },
}

impl EventError {
    /// Creates a malformed event error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent {
            reason: reason.into(),
        }
    }
}

/// Errors raised by an anomaly classifier.
///
/// The engine treats every variant as "no positive signal".
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// The classifier could not produce a prediction.
    #[error("classifier unavailable: {reason}")]
    Unavailable {
        /// Why the classifier is unavailable.
        reason: String,
    },

    /// A serialized model failed validation.
    #[error("invalid classifier model: {reason}")]
    InvalidModel {
        /// What was wrong with the model.
        reason: String,
    },

    /// The model file could not be read.
    #[error("failed to read classifier model: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// The model file could not be decoded.
    #[error("failed to decode classifier model: {source}")]
    Decode {
        /// The underlying decoder error.
        #[from]
        source: serde_json::Error,
    },
}

impl ClassifierError {
    /// Creates an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Creates an invalid model error.
    pub fn invalid_model(reason: impl Into<String>) -> Self {
        Self::InvalidModel {
            reason: reason.into(),
        }
    }
}

/// Errors raised by a deadlock record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store call did not finish within the caller's bound.
    #[error("record store call timed out after {timeout_ms}ms")]
    Timeout {
        /// The bound that was exceeded, in milliseconds.
        timeout_ms: u64,
    },

    /// The store backend rejected or could not serve the call.
    #[error("record store unavailable: {reason}")]
    Unavailable {
        /// Why the store is unavailable.
        reason: String,
    },

    /// The referenced record does not exist.
    #[error("deadlock record not found: {deadlock_id}")]
    NotFound {
        /// The missing record ID.
        deadlock_id: DeadlockId,
    },

    /// The store's backing file failed.
    #[error("record store I/O error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: io::Error,
    },

    /// A record could not be encoded or decoded.
    #[error("record store serialization error: {source}")]
    Serialization {
        /// The underlying serializer error.
        #[from]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Creates an unavailable error.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the same call may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Unavailable { .. } | Self::Io { .. }
        )
    }
}

/// Errors surfaced by the detection engine.
#[derive(Debug, Error)]
pub enum DetectError {
    /// A lock event was rejected.
    #[error(transparent)]
    Event(#[from] EventError),

    /// Emitting a deadlock record failed. The record stays pending and is
    /// re-emitted on the next tick.
    #[error("failed to emit deadlock record {deadlock_id}: {source}")]
    Emission {
        /// The record that could not be emitted.
        deadlock_id: DeadlockId,
        /// The store failure.
        #[source]
        source: StoreError,
    },

    /// The configuration is invalid.
    #[error("invalid detector configuration: {reason}")]
    Config {
        /// What was wrong with the configuration.
        reason: String,
    },
}

impl DetectError {
    /// Creates a config error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Returns true if the next tick may succeed without intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Emission { source, .. } => source.is_recoverable(),
            Self::Event(_) => true,
            Self::Config { .. } => false,
        }
    }
}

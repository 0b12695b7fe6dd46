//! Error taxonomy for the publishing pipeline.
//!
//! Two families live here:
//! - [`ConfigurationError`]: no usable route for an event. Fatal for that
//!   event and never retried.
//! - [`DeliveryError`]: one publish to one broker failed. Each variant is
//!   either transient (retried per policy) or permanent (terminal for that
//!   target).

use std::fmt;

use thiserror::Error;

use crate::broker::BrokerKind;

/// Routing could not produce a usable set of targets for an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    /// The routing table has no entry for this event type.
    #[error("no route configured for event type '{event_type}'")]
    NoRoute {
        /// Event type that failed to resolve
        event_type: String,
    },

    /// Routes exist but feature flags removed every target.
    #[error("all targets for event type '{event_type}' are disabled by feature flags")]
    AllTargetsDisabled {
        /// Event type that failed to resolve
        event_type: String,
    },

    /// A route points at a broker this process has no publisher for.
    #[error("no {kind} broker is configured")]
    BrokerNotConfigured {
        /// Broker kind missing a publisher
        kind: BrokerKind,
    },
}

/// A single publish attempt to a single broker failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Could not reach the broker or the connection dropped mid-publish.
    #[error("broker connection failed: {message}")]
    Connection {
        /// Error message from the broker client
        message: String,
    },

    /// The broker did not acknowledge within the publish timeout.
    #[error("publish timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The broker pushed back (nack, full producer queue).
    #[error("broker applied backpressure: {message}")]
    Backpressure {
        /// Backpressure signal description
        message: String,
    },

    /// No pooled connection became available in time.
    #[error("no broker channel available after {waited_ms}ms")]
    PoolExhausted {
        /// How long acquisition waited
        waited_ms: u64,
    },

    /// The queue, exchange or topic does not exist.
    #[error("unknown destination '{destination}'")]
    UnknownDestination {
        /// Queue or topic name
        destination: String,
    },

    /// The broker refused the credentials for this destination.
    #[error("not authorized to publish: {message}")]
    Unauthorized {
        /// Authorization failure detail
        message: String,
    },

    /// The broker rejected the message itself (malformed, oversized, ...).
    #[error("broker rejected message: {message}")]
    Rejected {
        /// Rejection detail
        message: String,
    },

    /// The per-event deadline elapsed before this target finished.
    #[error("event deadline of {deadline_ms}ms exceeded")]
    DeadlineExceeded {
        /// Configured per-event deadline
        deadline_ms: u64,
    },
}

impl DeliveryError {
    /// Creates a connection error from a message.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a publish timeout error.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Creates a backpressure error.
    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::Backpressure { message: message.into() }
    }

    /// Creates an unknown-destination rejection.
    pub fn unknown_destination(destination: impl Into<String>) -> Self {
        Self::UnknownDestination { destination: destination.into() }
    }

    /// Creates an authorization rejection.
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized { message: message.into() }
    }

    /// Creates a generic broker rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected { message: message.into() }
    }

    /// Whether another attempt could succeed.
    ///
    /// Timeouts, connection failures, backpressure and pool exhaustion are
    /// transient. Broker-side rejections and the event deadline are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. }
            | Self::Timeout { .. }
            | Self::Backpressure { .. }
            | Self::PoolExhausted { .. } => true,

            Self::UnknownDestination { .. }
            | Self::Unauthorized { .. }
            | Self::Rejected { .. }
            | Self::DeadlineExceeded { .. } => false,
        }
    }

    /// Whether this error says the broker itself could not be reached.
    ///
    /// Used by the health check to track unreachable brokers separately
    /// from brokers that answer but refuse messages.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }

    /// Error category for log fields.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

/// Coarse error class attached to log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retryable broker failure.
    Transient,
    /// Broker refused the message.
    Permanent,
    /// Per-event deadline elapsed.
    Deadline,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::DeadlineExceeded { .. } => Self::Deadline,
            e if e.is_retryable() => Self::Transient,
            _ => Self::Permanent,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
            Self::Deadline => write!(f, "deadline"),
        }
    }
}

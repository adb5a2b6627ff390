//! Runtime error types

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Error from a transport operation, with classification
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Io, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Closed, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Rejected, message)
    }

    pub fn not_connected() -> Self {
        Self::new(TransportErrorKind::NotConnected, "transport is not connected")
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Socket or OS-level failure
    Io,
    /// Remote end went away
    Closed,
    /// Remote end refused the session (e.g. credentials)
    Rejected,
    /// Operation issued before connect or after teardown
    NotConnected,
    /// Malformed frame
    Protocol,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Io => "io",
            Self::Closed => "closed",
            Self::Rejected => "rejected",
            Self::NotConnected => "not connected",
            Self::Protocol => "protocol",
        })
    }
}

/// Session lifecycle failures. Always recovered locally by retry or abandonment.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("connect failed: {0}")]
    ConnectFailure(#[source] TransportError),
    #[error("teardown timed out after {0:?}")]
    TeardownTimeout(Duration),
    #[error("teardown failed: {0}")]
    TeardownFailure(#[source] TransportError),
}

/// Outbound delivery failures. Logged, never shown to the correspondent.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("notification delivery failed: {0}")]
    NotificationDeliveryFailure(String),
    #[error("reply delivery failed: {0}")]
    ReplyDeliveryFailure(String),
}

impl DeliveryError {
    pub fn notification(message: impl Into<String>) -> Self {
        Self::NotificationDeliveryFailure(message.into())
    }

    pub fn reply(message: impl Into<String>) -> Self {
        Self::ReplyDeliveryFailure(message.into())
    }
}

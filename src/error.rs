//! Error types for the session client and the transport it drives
//!
//! `SessionError` is what callers of the public API see. `TransportError` is
//! what an [`MqttTransportClient`](crate::transport::MqttTransportClient)
//! reports; the connection supervisor and the request dispatcher classify it
//! as fatal or retryable with [`TransportError::is_fatal`].
//!
//! Both types are `Clone`: a single terminal error settles every pending
//! completion handle.

use crate::transport::reason::{ConnectReasonCode, DisconnectReasonCode};
use thiserror::Error;

/// Failures reported by the underlying MQTT transport
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connection refused by broker: {0}")]
    ConnectRefused(ConnectReasonCode),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection lost before the operation completed")]
    ConnectionLost,

    #[error("Operation timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport is not connected")]
    NotConnected,

    /// Cancellation raised inside the transport itself (not requested by the
    /// session client), e.g. the network layer giving up on a socket.
    #[error("Operation cancelled by the transport")]
    Cancelled,
}

impl TransportError {
    /// Whether retrying the same operation can never succeed.
    ///
    /// Network failures, timeouts and transport-internal cancellations are
    /// transient; argument, feature and protocol errors are not, and neither
    /// are CONNACK refusals with a fatal reason code.
    pub fn is_fatal(&self) -> bool {
        match self {
            TransportError::ConnectRefused(code) => code.is_fatal(),
            TransportError::InvalidArgument(_)
            | TransportError::UnsupportedFeature(_)
            | TransportError::ProtocolViolation(_) => true,
            TransportError::Network(_)
            | TransportError::ConnectionLost
            | TransportError::Timeout { .. }
            | TransportError::NotConnected
            | TransportError::Cancelled => false,
        }
    }

    pub fn network<E: std::fmt::Display>(error: E) -> Self {
        TransportError::Network(error.to_string())
    }
}

/// Errors surfaced by [`SessionClient`](crate::session::SessionClient)
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Request purged from the pending queue: {0}")]
    Purged(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Connection retries exhausted after {attempts} attempt(s): {reason}")]
    RetryExhausted { attempts: u32, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Session client has been disposed")]
    Disposed,
}

impl SessionError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration(message.into())
    }

    pub fn purged<S: Into<String>>(message: S) -> Self {
        Self::Purged(message.into())
    }

    pub fn session_expired<S: Into<String>>(message: S) -> Self {
        Self::SessionExpired(message.into())
    }

    /// Error settled on every pending request when the user closes the session.
    pub fn closed_by_user() -> Self {
        Self::SessionExpired("session closed by user".to_string())
    }

    /// Error for a server DISCONNECT whose reason forbids resuming the session.
    pub fn fatal_disconnect(reason: DisconnectReasonCode) -> Self {
        Self::RetryExhausted {
            attempts: 0,
            reason: format!("fatal disconnect reason {reason}"),
        }
    }

    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether this error ends the session (as opposed to a single request).
    pub fn is_session_terminal(&self) -> bool {
        matches!(
            self,
            SessionError::SessionExpired(_) | SessionError::RetryExhausted { .. }
        )
    }
}

impl From<crate::config::ConfigError> for SessionError {
    fn from(error: crate::config::ConfigError) -> Self {
        SessionError::Configuration(error.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

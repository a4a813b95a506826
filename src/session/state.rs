//! Connection state machine values and health bookkeeping

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Observable state of the session client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, and the state after an explicit disconnect
    Disconnected,
    /// First connection attempt in progress
    Connecting,
    /// Connected; the dispatcher is running
    Connected,
    /// Connection lost; recovering the broker session (attempt count)
    Reconnecting(u32),
    /// Explicit disconnect in progress
    Closing,
    /// Terminal failure; every operation fails until the next connect
    SessionLost(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_session_lost(&self) -> bool {
        matches!(self, ConnectionState::SessionLost(_))
    }
}

/// Events driving [`ConnectionState`] transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnectStarted,
    ConnAckReceived,
    ConnectFailed,
    ConnectionLost(String),
    ReconnectionStarted(u32),
    CloseRequested,
    Closed,
    SessionLost(String),
}

/// Notification raised once per terminal session failure
#[derive(Debug, Clone, PartialEq)]
pub struct SessionLostEvent {
    pub reason: SessionError,
    pub timestamp: DateTime<Utc>,
}

impl SessionLostEvent {
    pub fn new(reason: SessionError) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
        }
    }
}

/// Health snapshot of a session client
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    /// Time since the current connection was established
    pub uptime: Option<Duration>,
    /// Successful connections, initial and recovered
    pub connection_count: u32,
    /// Reconnection cycles started after a connection loss
    pub reconnect_count: u32,
    /// Requests waiting for acknowledgement
    pub pending_requests: usize,
    pub is_healthy: bool,
}

/// Pure state and health decisions
pub struct HealthMonitor;

impl HealthMonitor {
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnectStarted => ConnectionState::Connecting,
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::ConnectFailed
            | ConnectionEvent::Closed => ConnectionState::Disconnected,
            ConnectionEvent::ConnectionLost(_) => ConnectionState::Reconnecting(0),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::CloseRequested => ConnectionState::Closing,
            ConnectionEvent::SessionLost(reason) => ConnectionState::SessionLost(reason),
        }
    }

    pub fn log_state_transition(client_id: &str, from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(client_id, "MQTT session established");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!(client_id, "MQTT session resumed");
            }
            (ConnectionState::Connected, ConnectionState::Reconnecting(_)) => {
                warn!(client_id, "MQTT connection lost, recovering session");
            }
            (_, ConnectionState::SessionLost(reason)) => {
                error!(client_id, %reason, "MQTT session lost");
            }
            _ => {
                info!(client_id, "MQTT session state: {:?} -> {:?}", from, to);
            }
        }
    }

    pub fn calculate_health_metrics(
        connect_time: Option<Instant>,
        connection_count: u32,
        reconnect_count: u32,
        pending_requests: usize,
        max_pending: usize,
    ) -> HealthMetrics {
        let uptime = connect_time.map(|t| t.elapsed());
        HealthMetrics {
            uptime,
            connection_count,
            reconnect_count,
            pending_requests,
            is_healthy: Self::determine_health_status(uptime, pending_requests, max_pending),
        }
    }

    /// Healthy means connected with room left in the pending store.
    fn determine_health_status(
        uptime: Option<Duration>,
        pending_requests: usize,
        max_pending: usize,
    ) -> bool {
        uptime.is_some() && pending_requests < max_pending
    }
}

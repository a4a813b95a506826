//! MQTT Session - resilient MQTT v5 session client
//!
//! A session layer over an MQTT v5 transport that keeps publish, subscribe
//! and unsubscribe requests alive across transient disconnects.
//!
//! # Overview
//!
//! This crate provides:
//! - A bounded, ordered pending-request store with overflow strategies
//! - A single dispatcher that sends stored requests while connected
//! - A connection supervisor that resumes the broker session with retry policies
//! - Observable connection state, health metrics and session-lost notifications
//! - A rumqttc-backed transport and an in-memory mock for tests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_session::config::SessionConfig;
//! use mqtt_session::session::SessionClient;
//! use mqtt_session::transport::{MqttTransport, PublishMessage};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::local("mqtt://localhost:1883");
//! let transport = Arc::new(MqttTransport::from_config(&config.broker)?);
//! let client = SessionClient::new(transport, config.session_options())?;
//!
//! client.connect(config.connect_options()).await?;
//! client
//!     .publish(PublishMessage::new("sensors/1/temp", "21.5"))
//!     .await?;
//! client.disconnect(None).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod error;
pub mod observability;
pub mod retry;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, SessionConfig};
pub use error::{SessionError, SessionResult, TransportError};
pub use retry::{ExponentialBackoff, NoRetry, PatternBackoff, RetryDecision, RetryPolicy};
pub use session::{
    CancelSignal, ConnectionState, HealthMetrics, MessageReceiver, OverflowStrategy,
    SessionClient, SessionClientOptions, SessionLostEvent,
};
pub use transport::{MqttTransport, MqttTransportClient};

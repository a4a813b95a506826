//! MQTT v5 transport built on rumqttc
//!
//! The module separates pure functions from I/O for testability:
//!
//! - [`connection`] - Pure connection configuration
//! - [`message_handler`] - Pure event routing and acknowledgement bookkeeping
//! - [`client`] - The [`RumqttTransport`] that owns the network connection
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_session::config::SessionConfig;
//! use mqtt_session::transport::mqtt::RumqttTransport;
//! use mqtt_session::transport::MqttTransportClient;
//!
//! # tokio_test::block_on(async {
//! let config = SessionConfig::local("mqtt://localhost:1883");
//! let transport = RumqttTransport::from_config(&config.broker)?;
//! transport.connect(&config.connect_options()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::RumqttTransport;
pub use connection::{configure_mqtt_options, BrokerEndpoint};
pub use message_handler::{Ack, AckKind, AckTracker, EventRoute, MessageHandler};

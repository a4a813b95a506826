//! Transport layer consumed by the session client
//!
//! The session client never speaks the MQTT wire protocol itself. It drives
//! an [`MqttTransportClient`], which owns framing, TLS and packet ids, and
//! receives out-of-band [`TransportEvent`]s (disconnects, incoming messages)
//! through a channel registered with [`MqttTransportClient::set_event_sender`].

pub mod mqtt;
pub mod reason;
pub mod topic;
pub mod types;

pub use reason::{ConnectReasonCode, DisconnectReasonCode};
pub use topic::{topic_matches, validate_topic_filter};
pub use types::{
    ConnectOptions, ConnectResult, DisconnectOptions, IncomingMessage, PublishMessage,
    PublishResult, QoS, SubscribeOptions, SubscribeResult, TopicFilter, TransportEvent,
    UnsubscribeOptions, UnsubscribeResult,
};

use crate::error::TransportError;
use tokio::sync::mpsc;

/// MQTT v5 client capability used by the session client
///
/// Cancellation is expressed by dropping the returned future: the session
/// client races every call against its cancellation signals and abandons the
/// loser. Implementations must therefore leave no half-registered state
/// behind when a call is dropped mid-flight.
#[async_trait::async_trait]
pub trait MqttTransportClient: Send + Sync {
    /// Open a connection and wait for the CONNACK.
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectResult, TransportError>;

    /// Send DISCONNECT and close the connection.
    async fn disconnect(&self, options: &DisconnectOptions) -> Result<(), TransportError>;

    /// Publish and wait for the broker acknowledgement required by the QoS.
    async fn publish(&self, message: &PublishMessage) -> Result<PublishResult, TransportError>;

    /// Subscribe and wait for the SUBACK.
    async fn subscribe(&self, options: &SubscribeOptions)
        -> Result<SubscribeResult, TransportError>;

    /// Unsubscribe and wait for the UNSUBACK.
    async fn unsubscribe(
        &self,
        options: &UnsubscribeOptions,
    ) -> Result<UnsubscribeResult, TransportError>;

    /// Whether the transport currently holds an established connection.
    fn is_connected(&self) -> bool;

    /// Register the channel that receives disconnect and message events.
    fn set_event_sender(&self, sender: mpsc::UnboundedSender<TransportEvent>);
}

/// Type alias for the rumqttc-backed transport
pub type MqttTransport = mqtt::RumqttTransport;

//! rumqttc-backed [`MqttTransportClient`]
//!
//! Every `connect` builds a fresh rumqttc client and event loop, polls until
//! the CONNACK arrives and then hands the event loop to a background task.
//! rumqttc's own reconnection is never used: when the event loop fails the
//! task reports a single [`TransportEvent::Disconnected`] and exits, and
//! recovery is left to the session client.

use super::connection::{configure_mqtt_options, to_rumqttc_qos, BrokerEndpoint};
use super::message_handler::{Ack, AckKind, AckResult, AckTracker, EventRoute, MessageHandler};
use crate::config::{BrokerSection, ConfigError};
use crate::error::TransportError;
use crate::transport::{
    ConnectOptions, ConnectResult, DisconnectOptions, MqttTransportClient, PublishMessage,
    PublishResult, SubscribeOptions, SubscribeResult, TransportEvent, UnsubscribeOptions,
    UnsubscribeResult,
};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{Filter, Packet, PublishProperties};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `disconnect` waits for the DISCONNECT to be flushed
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

type EventSender = Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>;
type SharedTracker = Arc<Mutex<AckTracker>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One established connection
struct ActiveConnection {
    client: AsyncClient,
    acks: SharedTracker,
    event_loop_handle: JoinHandle<()>,
}

pub struct RumqttTransport {
    endpoint: BrokerEndpoint,
    active: Mutex<Option<ActiveConnection>>,
    connected: Arc<AtomicBool>,
    event_sender: EventSender,
}

impl RumqttTransport {
    pub fn new(endpoint: BrokerEndpoint) -> Self {
        Self {
            endpoint,
            active: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            event_sender: Arc::new(Mutex::new(None)),
        }
    }

    pub fn from_config(broker: &BrokerSection) -> Result<Self, ConfigError> {
        Ok(Self::new(BrokerEndpoint::from_config(broker)?))
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Drop the current connection without sending DISCONNECT.
    fn teardown(&self) {
        if let Some(active) = lock(&self.active).take() {
            active.event_loop_handle.abort();
            lock(&active.acks).fail_all(&TransportError::ConnectionLost);
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Client and tracker of the live connection
    fn live(&self) -> Result<(AsyncClient, SharedTracker), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        lock(&self.active)
            .as_ref()
            .map(|active| (active.client.clone(), active.acks.clone()))
            .ok_or(TransportError::NotConnected)
    }

    /// Poll a fresh event loop until the broker answers the CONNECT.
    async fn await_connack(event_loop: &mut EventLoop) -> Result<ConnectResult, TransportError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                    return MessageHandler::connack_result(&connack);
                }
                Ok(other) => debug!("Event before CONNACK: {:?}", other),
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(TransportError::ConnectRefused(code.into()));
                }
                Err(e) => return Err(TransportError::network(e)),
            }
        }
    }

    /// Hand a request to rumqttc and wait for its acknowledgement.
    async fn tracked<F, Fut>(&self, kind: AckKind, send: F) -> Result<Ack, TransportError>
    where
        F: FnOnce(AsyncClient) -> Fut,
        Fut: std::future::Future<Output = Result<(), rumqttc::v5::ClientError>>,
    {
        let (client, acks) = self.live()?;
        let (token, receiver) = lock(&acks).register(kind);
        let mut registration = Registration {
            acks: &acks,
            token,
            armed: true,
        };

        send(client).await.map_err(TransportError::network)?;
        registration.armed = false;

        wait_for_ack(receiver).await
    }
}

async fn wait_for_ack(receiver: oneshot::Receiver<AckResult>) -> Result<Ack, TransportError> {
    receiver.await.map_err(|_| TransportError::ConnectionLost)?
}

/// Removes a tracker slot if the request never reached rumqttc
struct Registration<'a> {
    acks: &'a SharedTracker,
    token: u64,
    armed: bool,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.acks).unregister(self.token);
        }
    }
}

fn unexpected_ack(expected: AckKind, ack: &Ack) -> TransportError {
    TransportError::ProtocolViolation(format!("expected {expected:?} acknowledgement, got {ack:?}"))
}

/// Drive the event loop of an established connection until it ends
async fn run_event_loop(
    mut event_loop: EventLoop,
    acks: SharedTracker,
    connected: Arc<AtomicBool>,
    event_sender: EventSender,
    client_id: String,
) {
    info!("Starting MQTT event loop for client: {}", client_id);

    let lost = loop {
        match event_loop.poll().await {
            Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                EventRoute::RequestSent { kind, packet_id } => {
                    lock(&acks).on_sent(kind, packet_id);
                }
                EventRoute::Acknowledged {
                    kind,
                    packet_id,
                    reason_codes,
                } => {
                    lock(&acks).on_ack(kind, packet_id, reason_codes);
                }
                EventRoute::MessageReceived(message) => {
                    debug!(topic = %message.topic, "Message received");
                    emit(&event_sender, TransportEvent::MessageReceived(message));
                }
                EventRoute::Disconnected(reason) => {
                    warn!("Broker disconnected client {}: {}", client_id, reason);
                    break Some(TransportEvent::Disconnected {
                        reason: Some(reason),
                        error: None,
                    });
                }
                EventRoute::DisconnectSent => {
                    debug!("DISCONNECT sent for client {}", client_id);
                    break None;
                }
                EventRoute::ConnectionAcknowledged => {
                    warn!("Unexpected CONNACK on established connection");
                }
                EventRoute::InfrastructureEvent(description) => {
                    debug!("Infrastructure event: {}", description);
                }
                EventRoute::OutgoingEvent => {}
            },
            Err(e) => {
                error!("MQTT event loop error for client {}: {}", client_id, e);
                break Some(TransportEvent::Disconnected {
                    reason: None,
                    error: Some(TransportError::network(e)),
                });
            }
        }
    };

    connected.store(false, Ordering::SeqCst);
    let failed = lock(&acks).fail_all(&TransportError::ConnectionLost);
    if failed > 0 {
        debug!("Failed {} unacknowledged request(s)", failed);
    }
    if let Some(event) = lost {
        emit(&event_sender, event);
    }

    info!("MQTT event loop stopped for client: {}", client_id);
}

fn emit(event_sender: &EventSender, event: TransportEvent) {
    if let Some(sender) = lock(event_sender).as_ref() {
        if sender.send(event).is_err() {
            debug!("Transport event receiver dropped");
        }
    }
}

#[async_trait]
impl MqttTransportClient for RumqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectResult, TransportError> {
        self.teardown();

        let mqtt_options = configure_mqtt_options(&self.endpoint, options)?;
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        info!(
            "Connecting to {}:{} as {} (clean_start={})",
            self.endpoint.host, self.endpoint.port, options.client_id, options.clean_start
        );
        let result = Self::await_connack(&mut event_loop).await?;

        let acks: SharedTracker = Arc::new(Mutex::new(AckTracker::new()));
        self.connected.store(true, Ordering::SeqCst);
        let event_loop_handle = tokio::spawn(run_event_loop(
            event_loop,
            acks.clone(),
            self.connected.clone(),
            self.event_sender.clone(),
            options.client_id.clone(),
        ));

        *lock(&self.active) = Some(ActiveConnection {
            client,
            acks,
            event_loop_handle,
        });

        info!(
            "Connected to {}:{} (session_present={})",
            self.endpoint.host, self.endpoint.port, result.session_present
        );
        Ok(result)
    }

    async fn disconnect(&self, options: &DisconnectOptions) -> Result<(), TransportError> {
        let Some(active) = lock(&self.active).take() else {
            self.connected.store(false, Ordering::SeqCst);
            return Ok(());
        };

        if options.session_expiry_interval.is_some_and(|expiry| expiry != 0) {
            // rumqttc sends DISCONNECT without properties, so the expiry
            // negotiated at CONNECT stays in effect.
            debug!(
                "Session expiry {:?} on DISCONNECT is not forwarded",
                options.session_expiry_interval
            );
        }

        let sent = active.client.disconnect().await;
        let mut handle = active.event_loop_handle;
        if sent.is_ok() {
            match tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, &mut handle).await {
                Ok(Ok(())) => debug!("Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Event loop task ended with error: {}", e),
                Err(_) => warn!("Event loop task didn't shut down gracefully, forcing abort"),
                _ => {}
            }
        }
        handle.abort();

        self.connected.store(false, Ordering::SeqCst);
        lock(&active.acks).fail_all(&TransportError::ConnectionLost);

        info!("MQTT client disconnected");
        sent.map_err(TransportError::network)
    }

    async fn publish(&self, message: &PublishMessage) -> Result<PublishResult, TransportError> {
        message.validate()?;
        let qos = to_rumqttc_qos(message.qos)?;

        let properties = PublishProperties {
            message_expiry_interval: message.message_expiry_interval,
            response_topic: message.response_topic.clone(),
            correlation_data: message.correlation_data.clone(),
            user_properties: message.user_properties.clone(),
            content_type: message.content_type.clone(),
            ..Default::default()
        };
        let topic = message.topic.clone();
        let payload = message.payload.clone();
        let retain = message.retain;

        let ack = self
            .tracked(AckKind::Publish, |client| async move {
                client
                    .publish_with_properties(topic, qos, retain, payload, properties)
                    .await
            })
            .await?;
        match ack {
            Ack::Publish(result) => Ok(result),
            other => Err(unexpected_ack(AckKind::Publish, &other)),
        }
    }

    async fn subscribe(
        &self,
        options: &SubscribeOptions,
    ) -> Result<SubscribeResult, TransportError> {
        options.validate()?;
        let filters = options
            .filters
            .iter()
            .map(|f| Ok(Filter::new(f.filter.clone(), to_rumqttc_qos(f.qos)?)))
            .collect::<Result<Vec<_>, TransportError>>()?;

        let ack = self
            .tracked(AckKind::Subscribe, |client| async move {
                client.subscribe_many(filters).await
            })
            .await?;
        match ack {
            Ack::Subscribe(result) => Ok(result),
            other => Err(unexpected_ack(AckKind::Subscribe, &other)),
        }
    }

    async fn unsubscribe(
        &self,
        options: &UnsubscribeOptions,
    ) -> Result<UnsubscribeResult, TransportError> {
        // rumqttc sends one UNSUBSCRIBE per topic
        let [filter] = options.filters.as_slice() else {
            return Err(TransportError::UnsupportedFeature(format!(
                "unsubscribe takes exactly one topic filter, got {}",
                options.filters.len()
            )));
        };
        if filter.is_empty() {
            return Err(TransportError::InvalidArgument(
                "unsubscribe topic filter must not be empty".to_string(),
            ));
        }
        let filter = filter.clone();

        let ack = self
            .tracked(AckKind::Unsubscribe, |client| async move {
                client.unsubscribe(filter).await
            })
            .await?;
        match ack {
            Ack::Unsubscribe(result) => Ok(result),
            other => Err(unexpected_ack(AckKind::Unsubscribe, &other)),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_event_sender(&self, sender: mpsc::UnboundedSender<TransportEvent>) {
        *lock(&self.event_sender) = Some(sender);
    }
}

impl Drop for RumqttTransport {
    fn drop(&mut self) {
        // No async in Drop: abort the event loop without a DISCONNECT
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::QoS;

    fn transport() -> RumqttTransport {
        RumqttTransport::new(BrokerEndpoint {
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
        })
    }

    #[test]
    fn test_from_config() {
        let config = crate::config::SessionConfig::local("mqtt://broker.example:1884");
        let transport = RumqttTransport::from_config(&config.broker).unwrap();
        assert_eq!(transport.endpoint().host, "broker.example");
        assert_eq!(transport.endpoint().port, 1884);
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_from_config_rejects_bad_url() {
        let config = crate::config::SessionConfig::local("http://broker.example");
        assert!(RumqttTransport::from_config(&config.broker).is_err());
    }

    #[tokio::test]
    async fn test_operations_fail_without_connection() {
        let transport = transport();

        let publish = transport
            .publish(&PublishMessage::new("a/b", "payload"))
            .await;
        assert_eq!(publish, Err(TransportError::NotConnected));

        let subscribe = transport
            .subscribe(&SubscribeOptions::single("a/#", QoS::AtLeastOnce))
            .await;
        assert_eq!(subscribe, Err(TransportError::NotConnected));

        let unsubscribe = transport
            .unsubscribe(&UnsubscribeOptions::single("a/#"))
            .await;
        assert_eq!(unsubscribe, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_validation_precedes_connection_check() {
        let transport = transport();

        let wildcard = transport.publish(&PublishMessage::new("a/+", "x")).await;
        assert!(matches!(wildcard, Err(TransportError::InvalidArgument(_))));

        let qos2 = transport
            .publish(&PublishMessage::new("a/b", "x").with_qos(QoS::ExactlyOnce))
            .await;
        assert!(matches!(qos2, Err(TransportError::UnsupportedFeature(_))));

        let many = transport
            .unsubscribe(&UnsubscribeOptions {
                filters: vec!["a".to_string(), "b".to_string()],
            })
            .await;
        assert!(matches!(many, Err(TransportError::UnsupportedFeature(_))));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let transport = transport();
        assert!(transport
            .disconnect(&DisconnectOptions::default())
            .await
            .is_ok());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_is_retryable() {
        // Port 1 on loopback refuses connections
        let transport = RumqttTransport::new(BrokerEndpoint {
            host: "127.0.0.1".to_string(),
            port: 1,
            tls: false,
        });
        let result = tokio::time::timeout(
            Duration::from_secs(10),
            transport.connect(&ConnectOptions::new("unreachable")),
        )
        .await
        .expect("connect attempt should fail quickly");

        let error = result.unwrap_err();
        assert!(matches!(error, TransportError::Network(_)));
        assert!(!error.is_fatal());
        assert!(!transport.is_connected());
    }
}

//! Mock transport for testing
//!
//! `MockTransport` implements [`MqttTransportClient`] in memory. Tests script
//! CONNACK outcomes and request failures, raise disconnect events, and
//! inspect every call the session client made.

use crate::error::TransportError;
use crate::transport::{
    ConnectOptions, ConnectResult, DisconnectOptions, DisconnectReasonCode, IncomingMessage,
    MqttTransportClient, PublishMessage, PublishResult, SubscribeOptions, SubscribeResult,
    TransportEvent, UnsubscribeOptions, UnsubscribeResult,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Mock transport for testing
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    next_packet_id: AtomicU16,
    connect_script: Mutex<VecDeque<Result<ConnectResult, TransportError>>>,
    connect_delay: Mutex<Option<Duration>>,
    publish_failures: Mutex<VecDeque<TransportError>>,
    hold_tx: watch::Sender<bool>,
    pub connect_calls: Arc<Mutex<Vec<ConnectOptions>>>,
    pub disconnect_calls: Arc<Mutex<Vec<DisconnectOptions>>>,
    pub published: Arc<Mutex<Vec<PublishMessage>>>,
    pub subscribed: Arc<Mutex<Vec<SubscribeOptions>>>,
    pub unsubscribed: Arc<Mutex<Vec<UnsubscribeOptions>>>,
    event_sender: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (hold_tx, _) = watch::channel(false);
        Self {
            connected: AtomicBool::new(false),
            next_packet_id: AtomicU16::new(1),
            connect_script: Mutex::new(VecDeque::new()),
            connect_delay: Mutex::new(None),
            publish_failures: Mutex::new(VecDeque::new()),
            hold_tx,
            connect_calls: Arc::default(),
            disconnect_calls: Arc::default(),
            published: Arc::default(),
            subscribed: Arc::default(),
            unsubscribed: Arc::default(),
            event_sender: Mutex::new(None),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Queue the outcome of the next connect call. Unscripted connects
    /// succeed with `session_present = !clean_start`.
    pub fn script_connect(&self, result: Result<ConnectResult, TransportError>) {
        lock(&self.connect_script).push_back(result);
    }

    /// Make every connect call sleep before answering.
    pub fn delay_connects(&self, delay: Duration) {
        *lock(&self.connect_delay) = Some(delay);
    }

    pub fn fail_next_publish(&self, error: TransportError) {
        lock(&self.publish_failures).push_back(error);
    }

    /// While held, publish calls block until released or dropped.
    pub fn hold_publishes(&self, hold: bool) {
        self.hold_tx.send_replace(hold);
    }

    /// Simulate the connection dropping, as reported by the network layer or
    /// a server DISCONNECT.
    pub fn emit_disconnect(&self, reason: Option<DisconnectReasonCode>) {
        self.set_connected(false);
        self.emit(TransportEvent::Disconnected {
            reason,
            error: reason
                .is_none()
                .then(|| TransportError::network("connection reset by peer")),
        });
    }

    pub fn emit_message(&self, message: IncomingMessage) {
        self.emit(TransportEvent::MessageReceived(message));
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(sender) = lock(&self.event_sender).as_ref() {
            let _ = sender.send(event);
        }
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.connect_calls).len()
    }

    pub fn disconnect_count(&self) -> usize {
        lock(&self.disconnect_calls).len()
    }

    pub fn published_topics(&self) -> Vec<String> {
        lock(&self.published).iter().map(|m| m.topic.clone()).collect()
    }

    pub fn total_calls(&self) -> usize {
        self.connect_count()
            + self.disconnect_count()
            + lock(&self.published).len()
            + lock(&self.subscribed).len()
            + lock(&self.unsubscribed).len()
    }

    fn packet_id(&self) -> u16 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn wait_while_held(&self) {
        let mut hold_rx = self.hold_tx.subscribe();
        let _ = hold_rx.wait_for(|held| !*held).await;
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl MqttTransportClient for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<ConnectResult, TransportError> {
        lock(&self.connect_calls).push(options.clone());
        let delay = *lock(&self.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = lock(&self.connect_script).pop_front();
        let result = scripted.unwrap_or_else(|| Ok(ConnectResult::success(!options.clean_start)));
        if matches!(&result, Ok(connack) if connack.reason_code.is_success()) {
            self.set_connected(true);
        }
        result
    }

    async fn disconnect(&self, options: &DisconnectOptions) -> Result<(), TransportError> {
        lock(&self.disconnect_calls).push(options.clone());
        self.set_connected(false);
        Ok(())
    }

    async fn publish(&self, message: &PublishMessage) -> Result<PublishResult, TransportError> {
        self.ensure_connected()?;
        lock(&self.published).push(message.clone());
        self.wait_while_held().await;

        if let Some(error) = lock(&self.publish_failures).pop_front() {
            return Err(error);
        }
        Ok(PublishResult {
            packet_id: Some(self.packet_id()),
            reason_code: 0,
            reason_string: None,
        })
    }

    async fn subscribe(
        &self,
        options: &SubscribeOptions,
    ) -> Result<SubscribeResult, TransportError> {
        self.ensure_connected()?;
        lock(&self.subscribed).push(options.clone());
        Ok(SubscribeResult {
            packet_id: Some(self.packet_id()),
            reason_codes: options.filters.iter().map(|f| f.qos as u8).collect(),
        })
    }

    async fn unsubscribe(
        &self,
        options: &UnsubscribeOptions,
    ) -> Result<UnsubscribeResult, TransportError> {
        self.ensure_connected()?;
        lock(&self.unsubscribed).push(options.clone());
        Ok(UnsubscribeResult {
            packet_id: Some(self.packet_id()),
            reason_codes: vec![0; options.filters.len()],
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_event_sender(&self, sender: mpsc::UnboundedSender<TransportEvent>) {
        *lock(&self.event_sender) = Some(sender);
    }
}

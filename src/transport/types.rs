//! Value types exchanged with an MQTT transport

use super::reason::{ConnectReasonCode, DisconnectReasonCode};
use crate::error::TransportError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

/// Options for a single CONNECT attempt
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_start: bool,
    pub keep_alive: Duration,
    /// Seconds the broker keeps the session after the network drops.
    pub session_expiry_interval: u32,
    pub username: Option<String>,
    pub password: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl ConnectOptions {
    pub fn new<S: Into<String>>(client_id: S) -> Self {
        Self {
            client_id: client_id.into(),
            clean_start: true,
            keep_alive: Duration::from_secs(60),
            session_expiry_interval: 3600,
            username: None,
            password: None,
            user_properties: Vec::new(),
        }
    }

    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = seconds;
        self
    }

    pub fn with_clean_start(mut self, clean_start: bool) -> Self {
        self.clean_start = clean_start;
        self
    }

    pub fn with_credentials<U: Into<String>, P: Into<String>>(
        mut self,
        username: U,
        password: P,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Outcome of a successful CONNECT (the CONNACK)
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectResult {
    pub reason_code: ConnectReasonCode,
    pub session_present: bool,
    pub assigned_client_id: Option<String>,
}

impl ConnectResult {
    pub fn success(session_present: bool) -> Self {
        Self {
            reason_code: ConnectReasonCode::Success,
            session_present,
            assigned_client_id: None,
        }
    }
}

/// Options for DISCONNECT
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectOptions {
    pub reason_code: DisconnectReasonCode,
    /// Session expiry to announce with the DISCONNECT. `Some(0)` ends the
    /// broker-side session immediately.
    pub session_expiry_interval: Option<u32>,
}

impl Default for DisconnectOptions {
    fn default() -> Self {
        Self {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            session_expiry_interval: Some(0),
        }
    }
}

/// An outgoing application message
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    pub message_expiry_interval: Option<u32>,
    pub user_properties: Vec<(String, String)>,
}

impl PublishMessage {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
            content_type: None,
            response_topic: None,
            correlation_data: None,
            message_expiry_interval: None,
            user_properties: Vec::new(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_user_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }

    /// Topic names must be non-empty and free of wildcards.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.topic.is_empty() {
            return Err(TransportError::InvalidArgument(
                "publish topic must not be empty".to_string(),
            ));
        }
        if self.topic.contains(['+', '#']) {
            return Err(TransportError::InvalidArgument(format!(
                "publish topic '{}' must not contain wildcards",
                self.topic
            )));
        }
        Ok(())
    }
}

/// Broker acknowledgement of a publish
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PublishResult {
    pub packet_id: Option<u16>,
    /// PUBACK reason code (0 for QoS 0 publishes).
    pub reason_code: u8,
    pub reason_string: Option<String>,
}

impl PublishResult {
    pub fn is_success(&self) -> bool {
        self.reason_code < 0x80
    }
}

/// One topic filter of a SUBSCRIBE
#[derive(Debug, Clone, PartialEq)]
pub struct TopicFilter {
    pub filter: String,
    pub qos: QoS,
}

impl TopicFilter {
    pub fn new<S: Into<String>>(filter: S, qos: QoS) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    pub filters: Vec<TopicFilter>,
}

impl SubscribeOptions {
    pub fn single<S: Into<String>>(filter: S, qos: QoS) -> Self {
        Self {
            filters: vec![TopicFilter::new(filter, qos)],
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.filters.is_empty() {
            return Err(TransportError::InvalidArgument(
                "subscribe requires at least one topic filter".to_string(),
            ));
        }
        self.filters
            .iter()
            .try_for_each(|f| super::topic::validate_topic_filter(&f.filter))
    }
}

/// SUBACK reason codes, one per requested filter. Values below 0x80 are the
/// granted QoS.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubscribeResult {
    pub packet_id: Option<u16>,
    pub reason_codes: Vec<u8>,
}

impl SubscribeResult {
    pub fn is_success(&self) -> bool {
        self.reason_codes.iter().all(|&code| code < 0x80)
    }

    pub fn granted_qos(&self) -> Vec<Option<QoS>> {
        self.reason_codes.iter().map(|&c| QoS::from_u8(c)).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeOptions {
    pub filters: Vec<String>,
}

impl UnsubscribeOptions {
    pub fn single<S: Into<String>>(filter: S) -> Self {
        Self {
            filters: vec![filter.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnsubscribeResult {
    pub packet_id: Option<u16>,
    pub reason_codes: Vec<u8>,
}

impl UnsubscribeResult {
    pub fn is_success(&self) -> bool {
        self.reason_codes.iter().all(|&code| code < 0x80)
    }
}

/// An application message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Events raised by a transport outside of any request
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection went down. `reason` is set when the server sent a
    /// DISCONNECT; `error` when the network or protocol layer failed.
    Disconnected {
        reason: Option<DisconnectReasonCode>,
        error: Option<TransportError>,
    },
    MessageReceived(IncomingMessage),
}

//! Pure routing of rumqttc events and acknowledgement bookkeeping
//!
//! [`MessageHandler::route_mqtt_event`] classifies every event the rumqttc
//! event loop yields. [`AckTracker`] pairs outgoing packets with the broker
//! acknowledgements that complete them: rumqttc reports packet ids only on
//! the `Outgoing` event, so requests are queued FIFO until their id is known.

use super::connection::from_rumqttc_qos;
use crate::error::TransportError;
use crate::transport::{
    ConnectReasonCode, ConnectResult, DisconnectReasonCode, IncomingMessage, PublishResult,
    SubscribeResult, UnsubscribeResult,
};
use rumqttc::v5::mqttbytes::v5::{
    ConnAck, ConnectReturnCode, Packet, PubAckReason, SubscribeReasonCode, UnsubAckReason,
};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(IncomingMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    qos: from_rumqttc_qos(publish.qos),
                    retain: publish.retain,
                }),
                Packet::Disconnect(disconnect) => EventRoute::Disconnected(
                    DisconnectReasonCode::from_u8(disconnect.reason_code as u8),
                ),
                Packet::PubAck(puback) => EventRoute::Acknowledged {
                    kind: AckKind::Publish,
                    packet_id: puback.pkid,
                    reason_codes: vec![puback_reason_code(puback.reason)],
                },
                Packet::SubAck(suback) => EventRoute::Acknowledged {
                    kind: AckKind::Subscribe,
                    packet_id: suback.pkid,
                    reason_codes: suback
                        .return_codes
                        .iter()
                        .map(suback_reason_code)
                        .collect(),
                },
                Packet::UnsubAck(unsuback) => EventRoute::Acknowledged {
                    kind: AckKind::Unsubscribe,
                    packet_id: unsuback.pkid,
                    reason_codes: unsuback
                        .reasons
                        .iter()
                        .map(|reason| unsuback_reason_code(*reason))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Publish(pkid) => EventRoute::RequestSent {
                    kind: AckKind::Publish,
                    packet_id: *pkid,
                },
                Outgoing::Subscribe(pkid) => EventRoute::RequestSent {
                    kind: AckKind::Subscribe,
                    packet_id: *pkid,
                },
                Outgoing::Unsubscribe(pkid) => EventRoute::RequestSent {
                    kind: AckKind::Unsubscribe,
                    packet_id: *pkid,
                },
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Outcome of a CONNECT as reported by its CONNACK
    pub fn connack_result(connack: &ConnAck) -> Result<ConnectResult, TransportError> {
        let reason_code = ConnectReasonCode::from(connack.code);
        if !reason_code.is_success() {
            return Err(TransportError::ConnectRefused(reason_code));
        }
        Ok(ConnectResult {
            reason_code,
            session_present: connack.session_present,
            assigned_client_id: connack
                .properties
                .as_ref()
                .and_then(|properties| properties.assigned_client_identifier.clone()),
        })
    }
}

impl From<ConnectReturnCode> for ConnectReasonCode {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => Self::Success,
            ConnectReturnCode::UnspecifiedError => Self::UnspecifiedError,
            ConnectReturnCode::MalformedPacket => Self::MalformedPacket,
            ConnectReturnCode::ProtocolError => Self::ProtocolError,
            ConnectReturnCode::ImplementationSpecificError => Self::ImplementationSpecificError,
            // MQTT 3.1.1 names kept by rumqttc
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::UnsupportedProtocolVersion => Self::UnsupportedProtocolVersion,
            ConnectReturnCode::BadClientId | ConnectReturnCode::ClientIdentifierNotValid => {
                Self::ClientIdentifierNotValid
            }
            ConnectReturnCode::BadUserNamePassword => Self::BadUserNameOrPassword,
            ConnectReturnCode::NotAuthorized => Self::NotAuthorized,
            ConnectReturnCode::ServiceUnavailable | ConnectReturnCode::ServerUnavailable => {
                Self::ServerUnavailable
            }
            ConnectReturnCode::ServerBusy => Self::ServerBusy,
            ConnectReturnCode::Banned => Self::Banned,
            ConnectReturnCode::BadAuthenticationMethod => Self::BadAuthenticationMethod,
            ConnectReturnCode::TopicNameInvalid => Self::TopicNameInvalid,
            ConnectReturnCode::PacketTooLarge => Self::PacketTooLarge,
            ConnectReturnCode::QuotaExceeded => Self::QuotaExceeded,
            ConnectReturnCode::PayloadFormatInvalid => Self::PayloadFormatInvalid,
            ConnectReturnCode::RetainNotSupported => Self::RetainNotSupported,
            ConnectReturnCode::QoSNotSupported => Self::QoSNotSupported,
            ConnectReturnCode::UseAnotherServer => Self::UseAnotherServer,
            ConnectReturnCode::ServerMoved => Self::ServerMoved,
            ConnectReturnCode::ConnectionRateExceeded => Self::ConnectionRateExceeded,
        }
    }
}

/// PUBACK reason byte (MQTT v5 section 3.4.2.1)
pub fn puback_reason_code(reason: PubAckReason) -> u8 {
    match reason {
        PubAckReason::Success => 0x00,
        PubAckReason::NoMatchingSubscribers => 0x10,
        PubAckReason::UnspecifiedError => 0x80,
        PubAckReason::ImplementationSpecificError => 0x83,
        PubAckReason::NotAuthorized => 0x87,
        PubAckReason::TopicNameInvalid => 0x90,
        PubAckReason::PacketIdentifierInUse => 0x91,
        PubAckReason::QuotaExceeded => 0x97,
        PubAckReason::PayloadFormatInvalid => 0x99,
    }
}

/// SUBACK reason byte. A granted subscription reports its QoS.
pub fn suback_reason_code(code: &SubscribeReasonCode) -> u8 {
    match code {
        SubscribeReasonCode::Success(qos) => *qos as u8,
        SubscribeReasonCode::Failure | SubscribeReasonCode::Unspecified => 0x80,
        SubscribeReasonCode::ImplementationSpecific => 0x83,
        SubscribeReasonCode::NotAuthorized => 0x87,
        SubscribeReasonCode::TopicFilterInvalid => 0x8F,
        SubscribeReasonCode::PkidInUse => 0x91,
        SubscribeReasonCode::QuotaExceeded => 0x97,
        SubscribeReasonCode::SharedSubscriptionsNotSupported => 0x9E,
        SubscribeReasonCode::SubscriptionIdNotSupported => 0xA1,
        SubscribeReasonCode::WildcardSubscriptionsNotSupported => 0xA2,
    }
}

/// UNSUBACK reason byte (MQTT v5 section 3.11.2.1)
pub fn unsuback_reason_code(reason: UnsubAckReason) -> u8 {
    match reason {
        UnsubAckReason::Success => 0x00,
        UnsubAckReason::NoSubscriptionExisted => 0x11,
        UnsubAckReason::UnspecifiedError => 0x80,
        UnsubAckReason::ImplementationSpecificError => 0x83,
        UnsubAckReason::NotAuthorized => 0x87,
        UnsubAckReason::TopicFilterInvalid => 0x8F,
        UnsubAckReason::PacketIdentifierInUse => 0x91,
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived(IncomingMessage),
    /// Server-initiated DISCONNECT
    Disconnected(DisconnectReasonCode),
    /// A request left the client with the given packet id
    RequestSent { kind: AckKind, packet_id: u16 },
    Acknowledged {
        kind: AckKind,
        packet_id: u16,
        reason_codes: Vec<u8>,
    },
    /// Our own DISCONNECT was written
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckKind {
    Publish,
    Subscribe,
    Unsubscribe,
}

/// A completed acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub enum Ack {
    Publish(PublishResult),
    Subscribe(SubscribeResult),
    Unsubscribe(UnsubscribeResult),
}

impl Ack {
    fn from_codes(kind: AckKind, packet_id: Option<u16>, reason_codes: Vec<u8>) -> Self {
        match kind {
            AckKind::Publish => Ack::Publish(PublishResult {
                packet_id,
                reason_code: reason_codes.first().copied().unwrap_or(0),
                reason_string: None,
            }),
            AckKind::Subscribe => Ack::Subscribe(SubscribeResult {
                packet_id,
                reason_codes,
            }),
            AckKind::Unsubscribe => Ack::Unsubscribe(UnsubscribeResult {
                packet_id,
                reason_codes,
            }),
        }
    }
}

pub type AckResult = Result<Ack, TransportError>;

struct QueuedAck {
    token: u64,
    kind: AckKind,
    sender: oneshot::Sender<AckResult>,
}

/// Correlates requests with broker acknowledgements for one connection
#[derive(Default)]
pub struct AckTracker {
    next_token: u64,
    /// Handed to rumqttc, packet id not yet known
    queued: VecDeque<QueuedAck>,
    /// Written to the wire, waiting for the broker
    awaiting: HashMap<(AckKind, u16), oneshot::Sender<AckResult>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot before handing the request to rumqttc. The token
    /// identifies the slot if the hand-off fails.
    pub fn register(&mut self, kind: AckKind) -> (u64, oneshot::Receiver<AckResult>) {
        let (sender, receiver) = oneshot::channel();
        self.next_token += 1;
        let token = self.next_token;
        self.queued.push_back(QueuedAck {
            token,
            kind,
            sender,
        });
        (token, receiver)
    }

    /// Drop a slot whose request never reached rumqttc.
    pub fn unregister(&mut self, token: u64) {
        self.queued.retain(|queued| queued.token != token);
    }

    pub fn on_sent(&mut self, kind: AckKind, packet_id: u16) {
        let Some(queued) = self.queued.pop_front() else {
            debug!(?kind, packet_id, "Outgoing packet without a registered request");
            return;
        };

        if queued.kind != kind {
            warn!(
                expected = ?queued.kind,
                actual = ?kind,
                packet_id,
                "Outgoing packet order does not match registered requests"
            );
            let _ = queued.sender.send(Err(TransportError::ProtocolViolation(format!(
                "expected outgoing {:?}, saw {kind:?}",
                queued.kind
            ))));
            return;
        }

        // QoS 0 publishes carry packet id 0 and are complete once written
        if kind == AckKind::Publish && packet_id == 0 {
            let _ = queued
                .sender
                .send(Ok(Ack::from_codes(kind, None, vec![0])));
            return;
        }

        if let Some(stale) = self.awaiting.insert((kind, packet_id), queued.sender) {
            let _ = stale.send(Err(TransportError::ProtocolViolation(format!(
                "packet id {packet_id} reused before acknowledgement"
            ))));
        }
    }

    pub fn on_ack(&mut self, kind: AckKind, packet_id: u16, reason_codes: Vec<u8>) {
        match self.awaiting.remove(&(kind, packet_id)) {
            Some(sender) => {
                let _ = sender.send(Ok(Ack::from_codes(kind, Some(packet_id), reason_codes)));
            }
            None => debug!(?kind, packet_id, "Acknowledgement for unknown packet id"),
        }
    }

    /// Fail every outstanding request. Returns how many were failed.
    pub fn fail_all(&mut self, error: &TransportError) -> usize {
        let mut failed = 0;
        for queued in self.queued.drain(..) {
            let _ = queued.sender.send(Err(error.clone()));
            failed += 1;
        }
        for (_, sender) in self.awaiting.drain() {
            let _ = sender.send(Err(error.clone()));
            failed += 1;
        }
        failed
    }

    pub fn outstanding(&self) -> usize {
        self.queued.len() + self.awaiting.len()
    }
}

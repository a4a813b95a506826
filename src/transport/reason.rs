//! MQTT v5 reason codes relevant to session recovery
//!
//! Only CONNACK and DISCONNECT reason codes are modelled here, together with
//! the fatal-vs-retryable classification the connection supervisor relies on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// CONNACK reason codes (MQTT v5 section 3.2.2.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectReasonCode {
    Success = 0x00,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    UnsupportedProtocolVersion = 0x84,
    ClientIdentifierNotValid = 0x85,
    BadUserNameOrPassword = 0x86,
    NotAuthorized = 0x87,
    ServerUnavailable = 0x88,
    ServerBusy = 0x89,
    Banned = 0x8A,
    BadAuthenticationMethod = 0x8C,
    TopicNameInvalid = 0x90,
    PacketTooLarge = 0x95,
    QuotaExceeded = 0x97,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    ConnectionRateExceeded = 0x9F,
}

impl ConnectReasonCode {
    /// Map a raw CONNACK reason byte. Unknown failure codes collapse to
    /// `UnspecifiedError`.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => Self::Success,
            0x81 => Self::MalformedPacket,
            0x82 => Self::ProtocolError,
            0x83 => Self::ImplementationSpecificError,
            0x84 => Self::UnsupportedProtocolVersion,
            0x85 => Self::ClientIdentifierNotValid,
            0x86 => Self::BadUserNameOrPassword,
            0x87 => Self::NotAuthorized,
            0x88 => Self::ServerUnavailable,
            0x89 => Self::ServerBusy,
            0x8A => Self::Banned,
            0x8C => Self::BadAuthenticationMethod,
            0x90 => Self::TopicNameInvalid,
            0x95 => Self::PacketTooLarge,
            0x97 => Self::QuotaExceeded,
            0x99 => Self::PayloadFormatInvalid,
            0x9A => Self::RetainNotSupported,
            0x9B => Self::QoSNotSupported,
            0x9C => Self::UseAnotherServer,
            0x9D => Self::ServerMoved,
            0x9F => Self::ConnectionRateExceeded,
            _ => Self::UnspecifiedError,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }

    /// Refusals that reflect a configuration or protocol incompatibility.
    /// Retrying the same CONNECT against the same broker will not help.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::MalformedPacket
                | Self::ProtocolError
                | Self::ImplementationSpecificError
                | Self::UnsupportedProtocolVersion
                | Self::ClientIdentifierNotValid
                | Self::BadUserNameOrPassword
                | Self::NotAuthorized
                | Self::Banned
                | Self::BadAuthenticationMethod
                | Self::TopicNameInvalid
                | Self::PacketTooLarge
                | Self::PayloadFormatInvalid
                | Self::RetainNotSupported
                | Self::QoSNotSupported
                | Self::UseAnotherServer
                | Self::ServerMoved
        )
    }
}

impl fmt::Display for ConnectReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.as_u8())
    }
}

/// DISCONNECT reason codes (MQTT v5 section 3.14.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DisconnectReasonCode {
    NormalDisconnection = 0x00,
    DisconnectWithWillMessage = 0x04,
    UnspecifiedError = 0x80,
    MalformedPacket = 0x81,
    ProtocolError = 0x82,
    ImplementationSpecificError = 0x83,
    NotAuthorized = 0x87,
    ServerBusy = 0x89,
    ServerShuttingDown = 0x8B,
    KeepAliveTimeout = 0x8D,
    SessionTakenOver = 0x8E,
    TopicFilterInvalid = 0x8F,
    TopicNameInvalid = 0x90,
    ReceiveMaximumExceeded = 0x93,
    TopicAliasInvalid = 0x94,
    PacketTooLarge = 0x95,
    MessageRateTooHigh = 0x96,
    QuotaExceeded = 0x97,
    AdministrativeAction = 0x98,
    PayloadFormatInvalid = 0x99,
    RetainNotSupported = 0x9A,
    QoSNotSupported = 0x9B,
    UseAnotherServer = 0x9C,
    ServerMoved = 0x9D,
    SharedSubscriptionsNotSupported = 0x9E,
    ConnectionRateExceeded = 0x9F,
    MaximumConnectTime = 0xA0,
    SubscriptionIdentifiersNotSupported = 0xA1,
    WildcardSubscriptionsNotSupported = 0xA2,
}

impl DisconnectReasonCode {
    /// Map a raw DISCONNECT reason byte. Unknown codes collapse to
    /// `UnspecifiedError`.
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => Self::NormalDisconnection,
            0x04 => Self::DisconnectWithWillMessage,
            0x81 => Self::MalformedPacket,
            0x82 => Self::ProtocolError,
            0x83 => Self::ImplementationSpecificError,
            0x87 => Self::NotAuthorized,
            0x89 => Self::ServerBusy,
            0x8B => Self::ServerShuttingDown,
            0x8D => Self::KeepAliveTimeout,
            0x8E => Self::SessionTakenOver,
            0x8F => Self::TopicFilterInvalid,
            0x90 => Self::TopicNameInvalid,
            0x93 => Self::ReceiveMaximumExceeded,
            0x94 => Self::TopicAliasInvalid,
            0x95 => Self::PacketTooLarge,
            0x96 => Self::MessageRateTooHigh,
            0x97 => Self::QuotaExceeded,
            0x98 => Self::AdministrativeAction,
            0x99 => Self::PayloadFormatInvalid,
            0x9A => Self::RetainNotSupported,
            0x9B => Self::QoSNotSupported,
            0x9C => Self::UseAnotherServer,
            0x9D => Self::ServerMoved,
            0x9E => Self::SharedSubscriptionsNotSupported,
            0x9F => Self::ConnectionRateExceeded,
            0xA0 => Self::MaximumConnectTime,
            0xA1 => Self::SubscriptionIdentifiersNotSupported,
            0xA2 => Self::WildcardSubscriptionsNotSupported,
            _ => Self::UnspecifiedError,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Server-initiated disconnects after which the session must not be
    /// resumed automatically.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::MalformedPacket
                | Self::ProtocolError
                | Self::NotAuthorized
                | Self::SessionTakenOver
                | Self::TopicFilterInvalid
                | Self::TopicNameInvalid
                | Self::TopicAliasInvalid
                | Self::PacketTooLarge
                | Self::PayloadFormatInvalid
                | Self::RetainNotSupported
                | Self::QoSNotSupported
                | Self::QuotaExceeded
                | Self::ServerMoved
                | Self::SharedSubscriptionsNotSupported
                | Self::SubscriptionIdentifiersNotSupported
                | Self::WildcardSubscriptionsNotSupported
        )
    }
}

impl fmt::Display for DisconnectReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02X})", self, self.as_u8())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_reason_round_trips_known_codes() {
        for code in [0x00u8, 0x81, 0x87, 0x88, 0x8A, 0x9D, 0x9F] {
            assert_eq!(ConnectReasonCode::from_u8(code).as_u8(), code);
        }
    }

    #[test]
    fn test_unknown_connect_code_is_unspecified() {
        assert_eq!(
            ConnectReasonCode::from_u8(0xEE),
            ConnectReasonCode::UnspecifiedError
        );
    }

    #[test]
    fn test_connect_fatal_classification() {
        assert!(ConnectReasonCode::NotAuthorized.is_fatal());
        assert!(ConnectReasonCode::BadUserNameOrPassword.is_fatal());
        assert!(ConnectReasonCode::UseAnotherServer.is_fatal());
        assert!(ConnectReasonCode::ImplementationSpecificError.is_fatal());

        assert!(!ConnectReasonCode::ServerUnavailable.is_fatal());
        assert!(!ConnectReasonCode::ServerBusy.is_fatal());
        assert!(!ConnectReasonCode::QuotaExceeded.is_fatal());
        assert!(!ConnectReasonCode::ConnectionRateExceeded.is_fatal());
        assert!(!ConnectReasonCode::UnspecifiedError.is_fatal());
        assert!(!ConnectReasonCode::Success.is_fatal());
    }

    #[test]
    fn test_disconnect_fatal_classification() {
        let fatal = [
            DisconnectReasonCode::MalformedPacket,
            DisconnectReasonCode::ProtocolError,
            DisconnectReasonCode::NotAuthorized,
            DisconnectReasonCode::SessionTakenOver,
            DisconnectReasonCode::TopicAliasInvalid,
            DisconnectReasonCode::QuotaExceeded,
            DisconnectReasonCode::ServerMoved,
            DisconnectReasonCode::WildcardSubscriptionsNotSupported,
        ];
        for code in fatal {
            assert!(code.is_fatal(), "{code} should be fatal");
        }

        let retryable = [
            DisconnectReasonCode::NormalDisconnection,
            DisconnectReasonCode::ServerBusy,
            DisconnectReasonCode::ServerShuttingDown,
            DisconnectReasonCode::KeepAliveTimeout,
            DisconnectReasonCode::AdministrativeAction,
            DisconnectReasonCode::UseAnotherServer,
            DisconnectReasonCode::MaximumConnectTime,
        ];
        for code in retryable {
            assert!(!code.is_fatal(), "{code} should be retryable");
        }
    }

    #[test]
    fn test_reason_display_includes_hex() {
        assert_eq!(
            DisconnectReasonCode::SessionTakenOver.to_string(),
            "SessionTakenOver (0x8E)"
        );
    }
}

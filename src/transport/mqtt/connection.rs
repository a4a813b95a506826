//! Pure connection configuration for the rumqttc transport
//!
//! Turns a broker endpoint plus per-attempt [`ConnectOptions`] into rumqttc
//! `MqttOptions`, and maps session-level QoS onto rumqttc's.

use crate::config::{BrokerSection, ConfigError};
use crate::error::TransportError;
use crate::transport::{ConnectOptions, QoS};
use rumqttc::v5::{mqttbytes::QoS as RumqttQoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// rumqttc rejects keep-alive intervals below this
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Maximum packet size announced to the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Where the broker lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    pub fn from_config(broker: &BrokerSection) -> Result<Self, ConfigError> {
        let (host, port, tls) = broker.endpoint()?;
        Ok(Self { host, port, tls })
    }
}

/// Build rumqttc options for a single connection attempt
pub fn configure_mqtt_options(
    endpoint: &BrokerEndpoint,
    options: &ConnectOptions,
) -> Result<MqttOptions, TransportError> {
    if options.client_id.is_empty() {
        return Err(TransportError::InvalidArgument(
            "client id must not be empty".to_string(),
        ));
    }

    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), endpoint.host.clone(), endpoint.port);

    // Enable TLS for mqtts:// URLs
    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(username) = &options.username {
        let password = options.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username.clone(), password);
    }

    mqtt_options.set_keep_alive(options.keep_alive.max(MIN_KEEP_ALIVE));
    mqtt_options.set_clean_start(options.clean_start);

    // Both values travel in the CONNECT properties.
    let mut properties = mqtt_options.connect_properties().unwrap_or_default();
    properties.session_expiry_interval = Some(options.session_expiry_interval);
    properties.max_packet_size = Some(MAX_PACKET_SIZE);
    mqtt_options.set_connect_properties(properties);

    Ok(mqtt_options)
}

/// Map session QoS onto rumqttc. QoS 2 is not supported by this transport.
pub fn to_rumqttc_qos(qos: QoS) -> Result<RumqttQoS, TransportError> {
    match qos {
        QoS::AtMostOnce => Ok(RumqttQoS::AtMostOnce),
        QoS::AtLeastOnce => Ok(RumqttQoS::AtLeastOnce),
        QoS::ExactlyOnce => Err(TransportError::UnsupportedFeature(
            "QoS 2 (exactly once) is not supported".to_string(),
        )),
    }
}

pub fn from_rumqttc_qos(qos: RumqttQoS) -> QoS {
    match qos {
        RumqttQoS::AtMostOnce => QoS::AtMostOnce,
        RumqttQoS::AtLeastOnce => QoS::AtLeastOnce,
        RumqttQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> BrokerEndpoint {
        BrokerEndpoint {
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
        }
    }

    #[test]
    fn test_endpoint_from_config() {
        let config = crate::config::SessionConfig::local("mqtts://broker.local:9999");
        let endpoint = BrokerEndpoint::from_config(&config.broker).unwrap();
        assert_eq!(
            endpoint,
            BrokerEndpoint {
                host: "broker.local".to_string(),
                port: 9999,
                tls: true,
            }
        );
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = ConnectOptions::new("client-1")
            .with_clean_start(false)
            .with_session_expiry(120)
            .with_credentials("user", "pass");
        let mqtt_options = configure_mqtt_options(&endpoint(), &options).unwrap();
        assert_eq!(mqtt_options.client_id(), "client-1");
        assert!(!mqtt_options.clean_start());
        assert_eq!(mqtt_options.broker_address(), ("localhost".to_string(), 1883));

        let properties = mqtt_options.connect_properties().unwrap();
        assert_eq!(properties.session_expiry_interval, Some(120));
        assert_eq!(properties.max_packet_size, Some(MAX_PACKET_SIZE));
        assert_eq!(mqtt_options.max_packet_size(), Some(MAX_PACKET_SIZE));
    }

    #[test]
    fn test_default_session_expiry_reaches_connect_properties() {
        let options = ConnectOptions::new("client-2");
        let mqtt_options = configure_mqtt_options(&endpoint(), &options).unwrap();
        let expiry = mqtt_options
            .connect_properties()
            .and_then(|properties| properties.session_expiry_interval);
        assert_eq!(expiry, Some(options.session_expiry_interval));
        assert_ne!(expiry, Some(0));
    }

    #[test]
    fn test_short_keep_alive_is_raised() {
        let mut options = ConnectOptions::new("client-1");
        options.keep_alive = Duration::from_secs(1);
        let mqtt_options = configure_mqtt_options(&endpoint(), &options).unwrap();
        assert_eq!(mqtt_options.keep_alive(), MIN_KEEP_ALIVE);
    }

    #[test]
    fn test_empty_client_id_rejected() {
        let result = configure_mqtt_options(&endpoint(), &ConnectOptions::new(""));
        assert!(matches!(result, Err(TransportError::InvalidArgument(_))));
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(to_rumqttc_qos(QoS::AtLeastOnce).unwrap(), RumqttQoS::AtLeastOnce);
        assert!(matches!(
            to_rumqttc_qos(QoS::ExactlyOnce),
            Err(TransportError::UnsupportedFeature(_))
        ));
        assert_eq!(from_rumqttc_qos(RumqttQoS::AtMostOnce), QoS::AtMostOnce);
    }
}

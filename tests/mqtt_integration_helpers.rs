//! MQTT Integration Test Helpers
//!
//! Broker tests expect an MQTT v5 broker at localhost:1883 and are ignored by
//! default. Run them with `cargo test -- --ignored`.

use mqtt_session::config::SessionConfig;
use mqtt_session::transport::ConnectOptions;

/// MQTT broker URL used by broker tests
pub const MQTT_BROKER_URL: &str = "mqtt://localhost:1883";

/// Create a configuration pointing at the local broker
pub fn mqtt_config() -> SessionConfig {
    SessionConfig::local(MQTT_BROKER_URL)
}

/// CONNECT options with a unique client id so parallel tests do not take
/// over each other's sessions
#[allow(dead_code)]
pub fn unique_connect_options(prefix: &str) -> ConnectOptions {
    ConnectOptions::new(format!("{prefix}-{}", uuid::Uuid::new_v4().simple()))
        .with_session_expiry(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mqtt_config_uses_localhost() {
        let config = mqtt_config();
        assert_eq!(config.broker.url, "mqtt://localhost:1883");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unique_connect_options() {
        let a = unique_connect_options("test");
        let b = unique_connect_options("test");
        assert_ne!(a.client_id, b.client_id);
        assert!(a.client_id.starts_with("test-"));
    }
}

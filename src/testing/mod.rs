//! Testing utilities
//!
//! An in-memory transport for exercising the session client without an MQTT
//! broker.

pub mod mocks;

pub use mocks::*;

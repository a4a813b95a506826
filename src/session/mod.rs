//! Resilient MQTT session
//!
//! - [`store`] - bounded, ordered pending-request store
//! - [`dispatcher`] - single worker sending stored requests over the transport
//! - [`client`] - public API and connection supervisor
//! - [`state`] - observable connection state and health metrics
//! - [`cancel`] - cancellation signals for requests and reconnection cycles
//! - [`receiver`] - delivery of incoming messages to filtered and unfiltered receivers

pub mod cancel;
pub mod client;
pub(crate) mod dispatcher;
pub mod options;
pub mod receiver;
pub mod request;
pub mod state;
pub mod store;

pub use cancel::CancelSignal;
pub use client::SessionClient;
pub use options::SessionClientOptions;
pub use receiver::MessageReceiver;
pub use request::{QueuedRequest, RequestKind, RequestOutcome, RequestPayload};
pub use state::{ConnectionState, HealthMetrics, SessionLostEvent};
pub use store::{OverflowStrategy, PendingRequestStore};

//! Observability for the session client: structured logging and span macros

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};

// Span macros for structured logging
pub use logging::{dispatch_span, reconnect_span, session_span};

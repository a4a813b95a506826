//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format parsing and configuration from environment variables.

use mqtt_session::observability::logging::{parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_json() {
    assert!(matches!(LogFormat::parse("json"), LogFormat::Json));
    assert!(matches!(LogFormat::parse("JSON"), LogFormat::Json));
}

#[test]
fn test_log_format_parse_pretty_and_compact() {
    assert!(matches!(LogFormat::parse("pretty"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("Pretty"), LogFormat::Pretty));
    assert!(matches!(LogFormat::parse("compact"), LogFormat::Compact));
    assert!(matches!(LogFormat::parse("COMPACT"), LogFormat::Compact));
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats should default to JSON for production safety
    assert!(matches!(LogFormat::parse("invalid"), LogFormat::Json));
    assert!(matches!(LogFormat::parse(""), LogFormat::Json));
    assert!(matches!(LogFormat::parse("xml"), LogFormat::Json));
}

#[test]
fn test_log_format_parse_whitespace() {
    assert!(matches!(LogFormat::parse("  json  "), LogFormat::Json));
    assert!(matches!(LogFormat::parse("\tcompact\n"), LogFormat::Compact));
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("ERROR"), Level::ERROR);
    assert_eq!(parse_level("warn"), Level::WARN);
    assert_eq!(parse_level("Debug"), Level::DEBUG);
    assert_eq!(parse_level("TRACE"), Level::TRACE);
    assert_eq!(parse_level("verbose"), Level::INFO);
}

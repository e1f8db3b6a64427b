//! Error presentation contract
//!
//! Errors raised by the storage core describe how they should be surfaced to
//! callers (HTTP handlers, CLI) through the `ErrorMetadata` trait. The trait lives
//! here so that front ends can depend on it without pulling in any backend.

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues like a degraded backend
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Stable, machine-readable taxonomy string (e.g. "NotFound")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (the caller may retry later)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message. Never contains backend-specific text.
    fn client_message(&self) -> String;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

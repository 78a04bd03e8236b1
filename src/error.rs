//! Transport error classification for the connector.
//!
//! Connection attempts fail in two interesting ways: a refused connection
//! means no relay is listening yet and the connector may self-host one,
//! while everything else is terminal for the attempt chain.

use std::io;

use tokio_tungstenite::tungstenite;

/// Categorized connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Nothing is listening on the target port (retryable via self-hosting).
    ConnectionRefused,
    /// Any other transport failure (DNS, reset, TLS, protocol).
    Transport,
}

impl ErrorClass {
    /// Whether the connector's failover path applies to this failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorClass::ConnectionRefused)
    }
}

/// Categorize a WebSocket connect error.
pub fn classify(err: &tungstenite::Error) -> ErrorClass {
    match err {
        tungstenite::Error::Io(io_err) if io_err.kind() == io::ErrorKind::ConnectionRefused => {
            ErrorClass::ConnectionRefused
        }
        _ => ErrorClass::Transport,
    }
}

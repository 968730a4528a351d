//! Error types for the gateway.

use std::fmt;

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Connection phase a bounded wait belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// SOCKS5 greeting, request and reply exchange
    Handshake,
    /// Opening the destination connection
    Connect,
    /// Reading the HTTP request line
    HttpRequest,
    /// Writing the HTTP response
    HttpResponse,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Handshake => "handshake",
            Stage::Connect => "connect",
            Stage::HttpRequest => "http request line",
            Stage::HttpResponse => "http response",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while serving a connection.
#[derive(Error, Debug)]
pub enum Error {
    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// A bounded wait expired
    #[error("{stage} timed out after {after_ms}ms")]
    Timeout {
        /// Phase that was waiting
        stage: Stage,
        /// Configured bound in milliseconds
        after_ms: u64,
    },

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        /// Version this gateway speaks
        expected: u8,
        /// Version the peer sent
        actual: u8,
    },

    /// SOCKS5 command other than CONNECT
    #[error("unsupported SOCKS5 command: 0x{0:02x}")]
    UnsupportedCommand(u8),

    /// SOCKS5 address type other than IPv4 or domain name
    #[error("unsupported SOCKS5 address type: 0x{0:02x}")]
    UnsupportedAddressType(u8),

    /// Invalid message format
    #[error("invalid message format: {0}")]
    InvalidMessage(String),

    /// Destination host name could not be resolved
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Host name as requested
        host: String,
        /// Resolver error
        #[source]
        source: std::io::Error,
    },

    /// Destination refused or was unreachable
    #[error("failed to connect to {target}: {source}")]
    Connect {
        /// Destination as `host:port`
        target: String,
        /// Last connect error
        #[source]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new timeout error for `stage` bounded by `limit`.
    pub fn timeout(stage: Stage, limit: std::time::Duration) -> Self {
        Error::Timeout {
            stage,
            after_ms: limit.as_millis() as u64,
        }
    }

    /// Create a new invalid message error
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check if this error is an expired bounded wait
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if the peer violated the protocol
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::VersionMismatch { .. }
                | Error::UnsupportedCommand(_)
                | Error::UnsupportedAddressType(_)
                | Error::InvalidMessage(_)
        )
    }

    /// Check if this error came from opening the destination connection
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, Error::Resolve { .. } | Error::Connect { .. })
            || matches!(
                self,
                Error::Timeout {
                    stage: Stage::Connect,
                    ..
                }
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = Error::timeout(Stage::Handshake, Duration::from_secs(5));
        assert_eq!(err.to_string(), "handshake timed out after 5000ms");

        let err = Error::timeout(Stage::HttpRequest, Duration::from_millis(250));
        assert_eq!(err.to_string(), "http request line timed out after 250ms");

        let err = Error::UnsupportedCommand(0x02);
        assert_eq!(err.to_string(), "unsupported SOCKS5 command: 0x02");

        let err = Error::VersionMismatch {
            expected: 5,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "protocol version mismatch: expected 5, got 4"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::timeout(Stage::Handshake, Duration::from_secs(1)).is_timeout());
        assert!(Error::UnsupportedAddressType(4).is_protocol_violation());
        assert!(!Error::timeout(Stage::HttpResponse, Duration::from_secs(1)).is_protocol_violation());

        let refused = Error::Connect {
            target: "127.0.0.1:1".into(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        };
        assert!(refused.is_connect_failure());
        assert!(Error::timeout(Stage::Connect, Duration::from_secs(10)).is_connect_failure());
        assert!(!Error::timeout(Stage::Handshake, Duration::from_secs(10)).is_connect_failure());
    }
}

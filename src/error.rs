//! Error types for the local relay.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed (tag mismatch, oversized chunk, short packet)
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Cipher method name is not supported
    #[error("unsupported cipher method: {0}")]
    UnsupportedMethod(String),

    /// Malformed SOCKS5 or relay framing
    #[error("protocol error: {0}")]
    Protocol(String),

    /// SOCKS5 command other than CONNECT / UDP ASSOCIATE
    #[error("unsupported SOCKS5 command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS5 address type other than IPv4 / domain / IPv6
    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Forward proxy refused or answered unexpectedly
    #[error("proxy handshake failed: {0}")]
    ProxyHandshake(String),

    /// Connect timeout
    #[error("connection timeout after {0}ms")]
    Timeout(u64),

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Listening port already bound by another process
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// Buffer overflow/underflow
    #[error("buffer error: expected {expected} bytes, got {actual}")]
    Buffer { expected: usize, actual: usize },

    /// Protocol version mismatch
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// Operation on an object in the wrong lifecycle state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The handler or socket was already closed
    #[error("connection closed")]
    Closed,
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new proxy handshake error
    pub fn proxy(msg: impl Into<String>) -> Self {
        Error::ProxyHandshake(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Check whether this is the benign race of touching an already-closed handler.
    ///
    /// These are logged at trace level and otherwise swallowed.
    pub fn is_disposed(&self) -> bool {
        match self {
            Error::Closed | Error::InvalidState(_) => true,
            Error::Network(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Check if this error came from the cipher layer
    pub fn is_crypto(&self) -> bool {
        matches!(self, Error::Crypto(_) | Error::UnsupportedMethod(_))
    }

    /// Check if this error is a connect timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

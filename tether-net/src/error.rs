// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! Error types for the network layer
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.
//! Non-error outcomes ("need more data", "peer closed gracefully") are never errors;
//! they are variants of each operation's own status type.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for network operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The peer closed the stream before the expected bytes arrived
    #[error("Connection closed by peer")]
    Closed,

    /// TLS/DTLS provider or state machine failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Peer certificate fingerprint did not match the pinned value
    #[error("Peer fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// Output buffer cannot hold the sealed record
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Malformed HTTP message
    #[error("HTTP error: {0}")]
    Http(String),

    /// Header block exceeded the configured maximum
    #[error("HTTP header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    /// Proxy answered CONNECT with something other than 200
    #[error("Proxy CONNECT rejected with status {0}")]
    ProxyRejected(u16),

    /// URL could not be parsed
    #[error("Invalid URL: {0}")]
    Url(String),

    /// WebSocket protocol violation
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Server did not answer the upgrade with 101
    #[error("WebSocket upgrade rejected with status {0}")]
    UpgradeRejected(u16),

    /// Server refused a client because of its Origin header
    #[error("Origin rejected: {0}")]
    OriginRejected(String),

    /// No pong seen within the dead-peer window
    #[error("Peer stopped answering pings")]
    PeerTimeout,

    /// Every task pool slot is busy
    #[error("Task pool at capacity")]
    Capacity,

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Data validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is transient and retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout | Error::Capacity)
    }

    /// Check if error terminated a TLS/DTLS handshake
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Error::Tls(_) | Error::FingerprintMismatch { .. })
    }
}

impl From<envy::Error> for Error {
    fn from(e: envy::Error) -> Self {
        Error::Config(format!("Failed to parse environment variables: {}", e))
    }
}

impl From<chacha20poly1305::Error> for Error {
    fn from(_: chacha20poly1305::Error) -> Self {
        Error::Crypto("AEAD operation failed".to_string())
    }
}

#[cfg(feature = "rustls")]
impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::Capacity.is_retryable());
        assert!(!Error::Closed.is_retryable());
        assert!(!Error::UpgradeRejected(403).is_retryable());
    }

    #[test]
    fn test_handshake_failure_classification() {
        let mismatch = Error::FingerprintMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(mismatch.is_handshake_failure());
        assert!(Error::Tls("bad".into()).is_handshake_failure());
        assert!(!Error::Timeout.is_handshake_failure());
    }
}

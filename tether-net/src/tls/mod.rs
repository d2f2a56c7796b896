// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! TLS/DTLS session engine
//!
//! [`SecureSession`] is a push-bytes-in, pull-bytes-out state machine: the
//! caller owns the socket, feeds whatever arrived into
//! [`SecureSession::handshake`], and sends whatever the write callback hands
//! back. Cryptography is delegated to a [`CryptoProvider`], so the engine
//! itself has no provider-specific code.
//!
//! Providers:
//! - [`peer::PeerProvider`]: fingerprint-pinned peer-to-peer sessions over
//!   TLS-stream or DTLS-datagram record framing
//! - [`rustls_provider::RustlsProvider`] (feature `rustls`): TLS client for ordinary
//!   HTTPS/WSS servers

pub mod cert;
pub mod peer;
#[cfg(feature = "rustls")]
pub mod rustls_provider;
pub mod session;
pub mod stream;

use crate::Result;
use std::sync::Arc;

pub use cert::Certificate;
pub use session::{SecureSession, SessionState};
pub use stream::SecureStream;

/// Record content types
pub const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
pub const CONTENT_ALERT: u8 = 0x15;
pub const CONTENT_HANDSHAKE: u8 = 0x16;
pub const CONTENT_APPLICATION_DATA: u8 = 0x17;

/// Record-layer version bytes
pub const TLS12_VERSION: [u8; 2] = [0x03, 0x03];
pub const DTLS12_VERSION: [u8; 2] = [0xFE, 0xFD];

/// Record header lengths
pub const TLS_HEADER_LEN: usize = 5;
pub const DTLS_HEADER_LEN: usize = 13;

/// Largest plaintext carried by one TLS record
pub const MAX_RECORD_PLAINTEXT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream framing with 5-byte record headers
    Tls,
    /// Datagram framing with 13-byte record headers and an MTU
    Dtls,
}

impl Protocol {
    pub fn version(&self) -> [u8; 2] {
        match self {
            Protocol::Tls => TLS12_VERSION,
            Protocol::Dtls => DTLS12_VERSION,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            Protocol::Tls => TLS_HEADER_LEN,
            Protocol::Dtls => DTLS_HEADER_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Everything a session is created with
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub role: Role,
    /// Local identity; peer sessions generate one when absent
    pub certificate: Option<Arc<Certificate>>,
    /// Target host for SNI and name validation
    pub hostname: Option<String>,
    /// Expected peer fingerprint in `sha-256 AA:BB:...` form
    pub peer_fingerprint: Option<String>,
    /// Datagram size limit, DTLS only
    pub mtu: usize,
}

impl SessionOptions {
    pub fn client() -> Self {
        Self {
            role: Role::Client,
            certificate: None,
            hostname: None,
            peer_fingerprint: None,
            mtu: 1200,
        }
    }

    pub fn server() -> Self {
        Self {
            role: Role::Server,
            ..Self::client()
        }
    }

    pub fn with_certificate(mut self, cert: Arc<Certificate>) -> Self {
        self.certificate = Some(cert);
        self
    }

    pub fn with_hostname(mut self, host: impl Into<String>) -> Self {
        self.hostname = Some(host.into());
        self
    }

    pub fn with_peer_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.peer_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
}

/// Outcome of [`SecureSession::handshake`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More round-trips are needed
    Continue,
    /// Session is established and pinned fingerprints verified
    Complete,
}

/// One step of a provider's handshake
#[derive(Debug, Default)]
pub struct HandshakeStep {
    /// Bytes of the input the provider took; the engine keeps the rest
    pub consumed: usize,
    /// Flight to send to the peer, if any
    pub flight: Option<Vec<u8>>,
    /// Provider considers the handshake finished
    pub complete: bool,
}

/// Capability interface implemented by each crypto backend
pub trait CryptoProvider: Send {
    /// Produce the first flight (client) or prepare to receive one (server)
    fn begin_handshake(&mut self) -> Result<HandshakeStep>;

    /// Feed buffered peer bytes; may consume none if a record is incomplete
    fn step_handshake(&mut self, inbound: &[u8]) -> Result<HandshakeStep>;

    /// Seal `plaintext` as exactly one record appended to `out`
    fn encrypt_record(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()>;

    /// Open every complete record in `ciphertext`, appending plaintext to `out`
    ///
    /// Returns how many ciphertext bytes were consumed.
    fn decrypt_records(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<usize>;

    /// Fingerprint of the peer's certificate, once known
    fn peer_fingerprint(&self) -> Option<String>;

    /// Header + trailer bytes added to each record
    fn max_overhead(&self) -> usize;

    /// Largest plaintext accepted by [`CryptoProvider::encrypt_record`]
    fn max_plaintext(&self) -> usize;
}

/// Builds a provider for each new session
pub trait ProviderFactory: Send + Sync {
    fn create(&self, protocol: Protocol, options: &SessionOptions) -> Result<Box<dyn CryptoProvider>>;
}

/// Routes public-server TLS to rustls and everything else to the peer provider
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultProviders;

impl ProviderFactory for DefaultProviders {
    fn create(&self, protocol: Protocol, options: &SessionOptions) -> Result<Box<dyn CryptoProvider>> {
        #[cfg(feature = "rustls")]
        {
            if protocol == Protocol::Tls
                && options.role == Role::Client
                && options.hostname.is_some()
                && options.certificate.is_none()
            {
                return Ok(Box::new(rustls_provider::RustlsProvider::new(options)?));
            }
        }

        Ok(Box::new(peer::PeerProvider::new(protocol, options)?))
    }
}

/// Factory that always builds [`peer::PeerProvider`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct PeerProviders;

impl ProviderFactory for PeerProviders {
    fn create(&self, protocol: Protocol, options: &SessionOptions) -> Result<Box<dyn CryptoProvider>> {
        Ok(Box::new(peer::PeerProvider::new(protocol, options)?))
    }
}

fn known_version(buf: &[u8]) -> bool {
    buf.len() > 2 && (buf[1..3] == TLS12_VERSION || buf[1..3] == DTLS12_VERSION)
}

fn dtls_version(buf: &[u8]) -> bool {
    buf.len() > 2 && buf[1..3] == DTLS12_VERSION
}

/// ChangeCipherSpec or Handshake record from TLS 1.2 or DTLS 1.2
pub fn is_handshake_record(buf: &[u8]) -> bool {
    known_version(buf) && (buf[0] == CONTENT_CHANGE_CIPHER_SPEC || buf[0] == CONTENT_HANDSHAKE)
}

/// ApplicationData record from TLS 1.2 or DTLS 1.2
pub fn is_application_data_record(buf: &[u8]) -> bool {
    known_version(buf) && buf[0] == CONTENT_APPLICATION_DATA
}

/// Same as [`is_handshake_record`] but only for DTLS 1.2 datagrams
pub fn is_dtls_handshake_record(buf: &[u8]) -> bool {
    dtls_version(buf) && (buf[0] == CONTENT_CHANGE_CIPHER_SPEC || buf[0] == CONTENT_HANDSHAKE)
}

/// Same as [`is_application_data_record`] but only for DTLS 1.2 datagrams
pub fn is_dtls_application_data_record(buf: &[u8]) -> bool {
    dtls_version(buf) && buf[0] == CONTENT_APPLICATION_DATA
}

//! Session state machine over a [`CryptoProvider`]

use super::{CryptoProvider, HandshakeStatus, Protocol, ProviderFactory, SessionOptions};
use crate::buffer::ByteBuffer;
use crate::metrics::Metrics;
use crate::{Error, Result};
use tracing::{debug, warn};

// Bytes a peer may leave unprocessed while the handshake is incomplete
const MAX_HANDSHAKE_BACKLOG: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Handshaking,
    Established,
    /// Terminal; every further call fails
    Failed,
}

/// One TLS or DTLS session wrapping exactly one logical connection
///
/// The session never touches a socket. Feed it the bytes received from the
/// peer and send whatever it hands to the write callback.
pub struct SecureSession {
    protocol: Protocol,
    state: SessionState,
    provider: Box<dyn CryptoProvider>,
    inbound: ByteBuffer,
    peer_fingerprint: Option<String>,
    scratch: Vec<u8>,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for SecureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSession")
            .field("protocol", &self.protocol)
            .field("state", &self.state)
            .field("buffered", &self.inbound.len())
            .finish_non_exhaustive()
    }
}

impl SecureSession {
    /// Allocate a session; no bytes are produced until [`SecureSession::handshake`]
    pub fn new(protocol: Protocol, options: SessionOptions, factory: &dyn ProviderFactory) -> Result<Self> {
        let provider = factory.create(protocol, &options)?;
        Ok(Self::with_provider(protocol, provider, options.peer_fingerprint))
    }

    /// Wrap an already-built provider
    pub fn with_provider(
        protocol: Protocol,
        provider: Box<dyn CryptoProvider>,
        peer_fingerprint: Option<String>,
    ) -> Self {
        Self {
            protocol,
            state: SessionState::Uninitialized,
            provider,
            inbound: ByteBuffer::with_capacity(4096),
            peer_fingerprint,
            scratch: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Established
    }

    /// Header plus trailer added to each record
    pub fn max_overhead(&self) -> usize {
        self.provider.max_overhead()
    }

    /// Largest plaintext one call to [`SecureSession::encrypt`] accepts
    pub fn max_plaintext(&self) -> usize {
        self.provider.max_plaintext()
    }

    pub fn peer_fingerprint(&self) -> Option<String> {
        self.provider.peer_fingerprint()
    }

    /// Ciphertext received but not yet turned into plaintext
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Advance the handshake
    ///
    /// Pass `None` on the very first client call to produce the opening
    /// flight. Afterwards pass whatever arrived from the peer, in any
    /// fragmentation. `write` is invoked once per outgoing flight.
    ///
    /// When a peer fingerprint was configured it is compared once, right
    /// after the provider reports completion; a mismatch fails the session
    /// exactly like any other handshake error.
    pub fn handshake<W>(&mut self, inbound: Option<&[u8]>, mut write: W) -> Result<HandshakeStatus>
    where
        W: FnMut(&[u8]) -> Result<()>,
    {
        match self.state {
            SessionState::Failed => {
                return Err(Error::Tls("session has already failed".to_string()));
            }
            SessionState::Established => {
                if let Some(bytes) = inbound {
                    self.inbound.extend(bytes)?;
                }
                return Ok(HandshakeStatus::Complete);
            }
            SessionState::Uninitialized | SessionState::Handshaking => {}
        }

        match self.drive_handshake(inbound, &mut write) {
            Ok(status) => Ok(status),
            Err(e) => {
                warn!("{:?} handshake failed: {}", self.protocol, e);
                self.state = SessionState::Failed;
                if let Some(metrics) = &self.metrics {
                    metrics.record_handshake(false);
                }
                Err(e)
            }
        }
    }

    fn drive_handshake<W>(&mut self, inbound: Option<&[u8]>, write: &mut W) -> Result<HandshakeStatus>
    where
        W: FnMut(&[u8]) -> Result<()>,
    {
        if self.state == SessionState::Uninitialized {
            let step = self.provider.begin_handshake()?;
            self.state = SessionState::Handshaking;
            if let Some(flight) = step.flight {
                write(&flight)?;
            }
        }

        if let Some(bytes) = inbound {
            if self.inbound.len() + bytes.len() > MAX_HANDSHAKE_BACKLOG {
                return Err(Error::Tls("handshake backlog exceeded".to_string()));
            }
            self.inbound.extend(bytes)?;
        }

        if self.inbound.is_empty() {
            return Ok(HandshakeStatus::Continue);
        }

        let step = self.provider.step_handshake(self.inbound.as_slice())?;
        self.inbound.consume(step.consumed);

        if step.complete {
            self.verify_peer()?;
        }

        if let Some(flight) = step.flight {
            write(&flight)?;
        }

        if !step.complete {
            return Ok(HandshakeStatus::Continue);
        }

        self.state = SessionState::Established;
        if let Some(metrics) = &self.metrics {
            metrics.record_handshake(true);
        }
        debug!("{:?} session established", self.protocol);
        Ok(HandshakeStatus::Complete)
    }

    fn verify_peer(&self) -> Result<()> {
        let Some(expected) = &self.peer_fingerprint else {
            return Ok(());
        };

        let actual = self.provider.peer_fingerprint().unwrap_or_default();
        if actual != *expected {
            return Err(Error::FingerprintMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn ensure_established(&self) -> Result<()> {
        match self.state {
            SessionState::Established => Ok(()),
            other => Err(Error::Tls(format!("session is {:?}, not established", other))),
        }
    }

    /// Seal `plaintext` as one record into `out`, returning the record length
    ///
    /// `out` must hold at least `plaintext.len() + max_overhead()` bytes;
    /// otherwise nothing is written and the session is unaffected.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize> {
        self.ensure_established()?;

        if plaintext.len() > self.provider.max_plaintext() {
            return Err(Error::Tls(format!(
                "plaintext of {} bytes exceeds the {} byte record limit",
                plaintext.len(),
                self.provider.max_plaintext()
            )));
        }

        let needed = plaintext.len() + self.provider.max_overhead();
        if out.len() < needed {
            return Err(Error::BufferTooSmall {
                needed,
                available: out.len(),
            });
        }

        self.scratch.clear();
        if let Err(e) = self.provider.encrypt_record(plaintext, &mut self.scratch) {
            self.state = SessionState::Failed;
            return Err(e);
        }

        let len = self.scratch.len();
        if len > out.len() {
            return Err(Error::BufferTooSmall {
                needed: len,
                available: out.len(),
            });
        }

        out[..len].copy_from_slice(&self.scratch);
        Ok(len)
    }

    /// Open as many complete records as are buffered, appending plaintext to `out`
    ///
    /// Returns the number of plaintext bytes appended; 0 means a whole
    /// record has not arrived yet.
    pub fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        self.ensure_established()?;
        self.inbound.extend(ciphertext)?;

        let before = out.len();
        match self.provider.decrypt_records(self.inbound.as_slice(), out) {
            Ok(consumed) => {
                self.inbound.consume(consumed);
                Ok(out.len() - before)
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }
}

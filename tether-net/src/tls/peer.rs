//! Fingerprint-pinned peer-to-peer provider
//!
//! Handshake (three flights, each one handshake record):
//!
//! ```text
//! client                                       server
//!   Hello(random, ephemeral, cert)  ------->
//!                                   <-------   Hello(random, ephemeral, cert, finished)
//!   Finished                        ------->
//! ```
//!
//! Keys come from three X25519 agreements (ephemeral/ephemeral,
//! client ephemeral/server static, client static/server ephemeral) run
//! through an HMAC-SHA256 schedule bound to the transcript. Records are
//! sealed with ChaCha20-Poly1305 using the record header as associated data.
//! DTLS records carry an explicit epoch and sequence number and are dropped,
//! not rejected, when they fail to open, replay a sequence already opened or
//! fall behind the 64-record replay window.

use super::cert::{Certificate, PeerCertificate};
use super::{
    HandshakeStep, Protocol, Role, SessionOptions, CONTENT_ALERT, CONTENT_APPLICATION_DATA,
    CONTENT_HANDSHAKE, MAX_RECORD_PLAINTEXT,
};
use crate::crypto;
use crate::{Error, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use std::sync::Arc;
use tracing::{debug, warn};
use x25519_dalek::{PublicKey, StaticSecret};

const TAG_LEN: usize = 16;
const RANDOM_LEN: usize = 32;
const KEY_LEN: usize = 32;
const MAC_LEN: usize = 32;

const MSG_CLIENT_HELLO: u8 = 0x01;
const MSG_SERVER_HELLO: u8 = 0x02;
const MSG_FINISHED: u8 = 0x14;

const SCHEDULE_SALT: &[u8] = b"tether peer handshake v1";
const LABEL_CLIENT_KEY: &[u8] = b"client write key";
const LABEL_SERVER_KEY: &[u8] = b"server write key";
const LABEL_CLIENT_FINISHED: &[u8] = b"client finished";
const LABEL_SERVER_FINISHED: &[u8] = b"server finished";

// Largest record body accepted from the wire
const MAX_RECORD_BODY: usize = MAX_RECORD_PLAINTEXT + 256;

enum HandshakeState {
    Start,
    AwaitClientHello,
    AwaitServerHello {
        ephemeral: StaticSecret,
        client_hello: Vec<u8>,
    },
    AwaitClientFinished {
        master: [u8; 32],
        transcript: [u8; 32],
    },
    Established,
}

struct RecordHeader {
    content_type: u8,
    epoch: u16,
    seq: u64,
    header_len: usize,
    body_len: usize,
}

const REPLAY_WINDOW: u64 = 64;

struct Direction {
    cipher: ChaCha20Poly1305,
    seq: u64,
    // Highest sequence opened, DTLS only
    highest: Option<u64>,
    // Bit n set when `highest - n` has been opened
    window: u64,
}

impl Direction {
    fn new(key: &[u8; KEY_LEN]) -> Result<Self> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|e| Error::Crypto(format!("Invalid record key: {}", e)))?;
        Ok(Self {
            cipher,
            seq: 0,
            highest: None,
            window: 0,
        })
    }

    fn is_replay(&self, seq: u64) -> bool {
        match self.highest {
            None => false,
            Some(highest) if seq > highest => false,
            Some(highest) => {
                let age = highest - seq;
                age >= REPLAY_WINDOW || self.window & (1 << age) != 0
            }
        }
    }

    fn mark_opened(&mut self, seq: u64) {
        match self.highest {
            Some(highest) if seq <= highest => {
                self.window |= 1 << (highest - seq);
            }
            Some(highest) => {
                let shift = seq - highest;
                self.window = if shift >= REPLAY_WINDOW { 0 } else { self.window << shift };
                self.window |= 1;
                self.highest = Some(seq);
            }
            None => {
                self.window = 1;
                self.highest = Some(seq);
            }
        }
    }
}

pub struct PeerProvider {
    protocol: Protocol,
    role: Role,
    mtu: usize,
    identity: Arc<Certificate>,
    state: HandshakeState,
    peer: Option<PeerCertificate>,
    send: Option<Direction>,
    recv: Option<Direction>,
    handshake_seq: u64,
}

impl PeerProvider {
    pub fn new(protocol: Protocol, options: &SessionOptions) -> Result<Self> {
        if protocol == Protocol::Dtls && options.mtu <= protocol.header_len() + TAG_LEN {
            return Err(Error::Tls(format!("DTLS MTU {} is too small", options.mtu)));
        }

        let identity = options
            .certificate
            .clone()
            .unwrap_or_else(|| Arc::new(Certificate::generate()));

        Ok(Self {
            protocol,
            role: options.role,
            mtu: options.mtu,
            identity,
            state: HandshakeState::Start,
            peer: None,
            send: None,
            recv: None,
            handshake_seq: 0,
        })
    }

    /// Local identity presented to the peer
    pub fn identity(&self) -> &Arc<Certificate> {
        &self.identity
    }

    fn header(&self, content_type: u8, epoch: u16, seq: u64, body_len: usize) -> Vec<u8> {
        let mut header = Vec::with_capacity(self.protocol.header_len());
        header.push(content_type);
        header.extend_from_slice(&self.protocol.version());
        if self.protocol == Protocol::Dtls {
            header.extend_from_slice(&epoch.to_be_bytes());
            header.extend_from_slice(&seq.to_be_bytes()[2..]);
        }
        header.extend_from_slice(&(body_len as u16).to_be_bytes());
        header
    }

    fn handshake_record(&mut self, message: &[u8]) -> Vec<u8> {
        let seq = self.handshake_seq;
        self.handshake_seq += 1;
        let mut record = self.header(CONTENT_HANDSHAKE, 0, seq, message.len());
        record.extend_from_slice(message);
        record
    }

    fn parse_header(&self, buf: &[u8]) -> Result<Option<RecordHeader>> {
        let header_len = self.protocol.header_len();
        if buf.len() < header_len {
            return Ok(None);
        }

        if buf[1..3] != self.protocol.version() {
            return Err(Error::Tls(format!(
                "unexpected record version {:02X}{:02X}",
                buf[1], buf[2]
            )));
        }

        let (epoch, seq) = match self.protocol {
            Protocol::Tls => (0, 0),
            Protocol::Dtls => {
                let epoch = u16::from_be_bytes([buf[3], buf[4]]);
                let mut seq = [0u8; 8];
                seq[2..].copy_from_slice(&buf[5..11]);
                (epoch, u64::from_be_bytes(seq))
            }
        };

        let body_len = u16::from_be_bytes([buf[header_len - 2], buf[header_len - 1]]) as usize;
        if body_len > MAX_RECORD_BODY {
            return Err(Error::Tls(format!("record of {} bytes is too large", body_len)));
        }

        if buf.len() < header_len + body_len {
            return Ok(None);
        }

        Ok(Some(RecordHeader {
            content_type: buf[0],
            epoch,
            seq,
            header_len,
            body_len,
        }))
    }

    fn nonce(&self, epoch: u16, seq: u64) -> [u8; 12] {
        let counter = match self.protocol {
            Protocol::Tls => seq,
            Protocol::Dtls => (u64::from(epoch) << 48) | seq,
        };
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    fn client_hello(&mut self) -> Vec<u8> {
        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let random: [u8; RANDOM_LEN] = crypto::random_array();

        let mut message = vec![MSG_CLIENT_HELLO];
        message.extend_from_slice(&random);
        message.extend_from_slice(PublicKey::from(&ephemeral).as_bytes());
        push_certificate(&mut message, &self.identity);

        let record = self.handshake_record(&message);
        self.state = HandshakeState::AwaitServerHello {
            ephemeral,
            client_hello: message,
        };
        record
    }

    fn on_client_hello(&mut self, message: &[u8]) -> Result<Vec<u8>> {
        let (peer_ephemeral, peer_cert, _) = parse_hello(message, MSG_CLIENT_HELLO)?;

        let ephemeral = StaticSecret::random_from_rng(OsRng);
        let random: [u8; RANDOM_LEN] = crypto::random_array();

        let mut reply = vec![MSG_SERVER_HELLO];
        reply.extend_from_slice(&random);
        reply.extend_from_slice(PublicKey::from(&ephemeral).as_bytes());
        push_certificate(&mut reply, &self.identity);

        let transcript = transcript_hash(message, &reply);
        let ee = ephemeral.diffie_hellman(&peer_ephemeral).to_bytes();
        let es = self.identity.diffie_hellman(&peer_ephemeral);
        let se = ephemeral.diffie_hellman(peer_cert.public_key()).to_bytes();
        let master = derive_master(&ee, &es, &se, &transcript)?;

        let finished = crypto::hmac_sha256(&master, &[LABEL_SERVER_FINISHED, &transcript])?;
        reply.extend_from_slice(&finished);

        self.send = Some(Direction::new(&crypto::hmac_sha256(&master, &[LABEL_SERVER_KEY])?)?);
        self.recv = Some(Direction::new(&crypto::hmac_sha256(&master, &[LABEL_CLIENT_KEY])?)?);
        self.peer = Some(peer_cert);
        self.state = HandshakeState::AwaitClientFinished { master, transcript };

        Ok(self.handshake_record(&reply))
    }

    fn on_server_hello(
        &mut self,
        message: &[u8],
        ephemeral: StaticSecret,
        client_hello: &[u8],
    ) -> Result<Vec<u8>> {
        let (peer_ephemeral, peer_cert, rest) = parse_hello(message, MSG_SERVER_HELLO)?;
        if rest.len() != MAC_LEN {
            return Err(Error::Tls("server hello is missing its finished MAC".to_string()));
        }

        let signed = &message[..message.len() - MAC_LEN];
        let transcript = transcript_hash(client_hello, signed);
        let ee = ephemeral.diffie_hellman(&peer_ephemeral).to_bytes();
        let es = ephemeral.diffie_hellman(peer_cert.public_key()).to_bytes();
        let se = self.identity.diffie_hellman(&peer_ephemeral);
        let master = derive_master(&ee, &es, &se, &transcript)?;

        if !crypto::verify_hmac_sha256(&master, &[LABEL_SERVER_FINISHED, &transcript], rest)? {
            return Err(Error::Tls("server finished verification failed".to_string()));
        }

        let mut finished = vec![MSG_FINISHED];
        finished.extend_from_slice(&crypto::hmac_sha256(
            &master,
            &[LABEL_CLIENT_FINISHED, &transcript],
        )?);

        self.send = Some(Direction::new(&crypto::hmac_sha256(&master, &[LABEL_CLIENT_KEY])?)?);
        self.recv = Some(Direction::new(&crypto::hmac_sha256(&master, &[LABEL_SERVER_KEY])?)?);
        self.peer = Some(peer_cert);
        self.state = HandshakeState::Established;

        Ok(self.handshake_record(&finished))
    }

    fn on_client_finished(&mut self, message: &[u8], master: &[u8; 32], transcript: &[u8; 32]) -> Result<()> {
        if message.len() != 1 + MAC_LEN || message[0] != MSG_FINISHED {
            return Err(Error::Tls("malformed finished message".to_string()));
        }

        if !crypto::verify_hmac_sha256(master, &[LABEL_CLIENT_FINISHED, transcript], &message[1..])? {
            return Err(Error::Tls("client finished verification failed".to_string()));
        }

        self.state = HandshakeState::Established;
        Ok(())
    }

    fn handle_message(&mut self, message: &[u8]) -> Result<Option<Vec<u8>>> {
        match std::mem::replace(&mut self.state, HandshakeState::Start) {
            HandshakeState::AwaitClientHello => self.on_client_hello(message).map(Some),
            HandshakeState::AwaitServerHello {
                ephemeral,
                client_hello,
            } => self.on_server_hello(message, ephemeral, &client_hello).map(Some),
            HandshakeState::AwaitClientFinished { master, transcript } => {
                self.on_client_finished(message, &master, &transcript)?;
                Ok(None)
            }
            HandshakeState::Start | HandshakeState::Established => {
                Err(Error::Tls("unexpected handshake message".to_string()))
            }
        }
    }

    fn is_established(&self) -> bool {
        matches!(self.state, HandshakeState::Established)
    }
}

impl super::CryptoProvider for PeerProvider {
    fn begin_handshake(&mut self) -> Result<HandshakeStep> {
        if !matches!(self.state, HandshakeState::Start) {
            return Err(Error::Tls("handshake already started".to_string()));
        }

        match self.role {
            Role::Client => Ok(HandshakeStep {
                flight: Some(self.client_hello()),
                ..HandshakeStep::default()
            }),
            Role::Server => {
                self.state = HandshakeState::AwaitClientHello;
                Ok(HandshakeStep::default())
            }
        }
    }

    fn step_handshake(&mut self, inbound: &[u8]) -> Result<HandshakeStep> {
        let mut step = HandshakeStep::default();
        let mut flight: Vec<u8> = Vec::new();

        while !self.is_established() {
            let Some(header) = self.parse_header(&inbound[step.consumed..])? else {
                break;
            };

            let start = step.consumed + header.header_len;
            let body = &inbound[start..start + header.body_len];

            match header.content_type {
                CONTENT_HANDSHAKE => {
                    if let Some(reply) = self.handle_message(body)? {
                        flight.extend_from_slice(&reply);
                    }
                }
                CONTENT_ALERT => return Err(Error::Tls("peer aborted the handshake".to_string())),
                other => {
                    return Err(Error::Tls(format!(
                        "unexpected record type {:#04x} during handshake",
                        other
                    )))
                }
            }

            step.consumed = start + header.body_len;
        }

        if !flight.is_empty() {
            step.flight = Some(flight);
        }
        step.complete = self.is_established();
        Ok(step)
    }

    fn encrypt_record(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        if plaintext.len() > self.max_plaintext() {
            return Err(Error::Tls(format!(
                "plaintext of {} bytes exceeds one record",
                plaintext.len()
            )));
        }

        let epoch = 1;
        let seq = self
            .send
            .as_ref()
            .map(|dir| dir.seq)
            .ok_or_else(|| Error::Tls("session not established".to_string()))?;

        let header = self.header(CONTENT_APPLICATION_DATA, epoch, seq, plaintext.len() + TAG_LEN);
        let nonce = self.nonce(epoch, seq);

        let send = self
            .send
            .as_mut()
            .ok_or_else(|| Error::Tls("session not established".to_string()))?;
        let sealed = send.cipher.encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &header,
            },
        )?;
        send.seq += 1;

        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed);
        Ok(())
    }

    fn decrypt_records(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        if self.recv.is_none() || !self.is_established() {
            return Err(Error::Tls("session not established".to_string()));
        }

        let mut consumed = 0;
        while let Some(header) = self.parse_header(&ciphertext[consumed..])? {
            let start = consumed + header.header_len;
            let end = start + header.body_len;
            let aad = &ciphertext[consumed..start];
            let body = &ciphertext[start..end];
            consumed = end;

            match header.content_type {
                CONTENT_APPLICATION_DATA => {}
                CONTENT_HANDSHAKE if self.protocol == Protocol::Dtls => {
                    debug!("Dropping retransmitted DTLS handshake record");
                    continue;
                }
                CONTENT_ALERT => return Err(Error::Tls("peer sent an alert".to_string())),
                other => {
                    return Err(Error::Tls(format!("unexpected record type {:#04x}", other)))
                }
            }

            let dtls = self.protocol == Protocol::Dtls;
            let nonce = self.nonce(header.epoch, header.seq);
            let recv = self
                .recv
                .as_mut()
                .ok_or_else(|| Error::Tls("session not established".to_string()))?;

            if dtls && recv.is_replay(header.seq) {
                debug!("Dropping replayed DTLS record {}", header.seq);
                continue;
            }

            let nonce = if dtls { nonce } else { tls_nonce(recv.seq) };
            let opened = recv.cipher.decrypt(
                Nonce::from_slice(&nonce),
                Payload { msg: body, aad },
            );

            match opened {
                Ok(plaintext) => {
                    if dtls {
                        recv.mark_opened(header.seq);
                    } else {
                        recv.seq += 1;
                    }
                    out.extend_from_slice(&plaintext);
                }
                Err(_) if dtls => {
                    warn!("Dropping DTLS record {} that failed authentication", header.seq);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(consumed)
    }

    fn peer_fingerprint(&self) -> Option<String> {
        self.peer.as_ref().map(PeerCertificate::fingerprint)
    }

    fn max_overhead(&self) -> usize {
        self.protocol.header_len() + TAG_LEN
    }

    fn max_plaintext(&self) -> usize {
        match self.protocol {
            Protocol::Tls => MAX_RECORD_PLAINTEXT,
            Protocol::Dtls => (self.mtu - self.max_overhead()).min(MAX_RECORD_PLAINTEXT),
        }
    }
}

fn tls_nonce(seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn push_certificate(message: &mut Vec<u8>, cert: &Certificate) {
    let encoded = cert.to_bytes();
    message.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
    message.extend_from_slice(&encoded);
}

/// Split a hello into (ephemeral key, certificate, trailing bytes)
fn parse_hello(message: &[u8], kind: u8) -> Result<(PublicKey, PeerCertificate, &[u8])> {
    const FIXED: usize = 1 + RANDOM_LEN + KEY_LEN + 2;

    if message.len() < FIXED || message[0] != kind {
        return Err(Error::Tls("malformed hello message".to_string()));
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&message[1 + RANDOM_LEN..1 + RANDOM_LEN + KEY_LEN]);

    let cert_len = u16::from_be_bytes([message[FIXED - 2], message[FIXED - 1]]) as usize;
    let cert_bytes = message
        .get(FIXED..FIXED + cert_len)
        .ok_or_else(|| Error::Tls("truncated hello certificate".to_string()))?;
    let cert = PeerCertificate::parse(cert_bytes)?;
    if cert.encoded_len() != cert_len {
        return Err(Error::Tls("hello certificate length mismatch".to_string()));
    }

    Ok((PublicKey::from(key), cert, &message[FIXED + cert_len..]))
}

fn transcript_hash(client_hello: &[u8], server_hello: &[u8]) -> [u8; 32] {
    let mut transcript = Vec::with_capacity(client_hello.len() + server_hello.len());
    transcript.extend_from_slice(client_hello);
    transcript.extend_from_slice(server_hello);
    crypto::sha256(&transcript)
}

fn derive_master(ee: &[u8; 32], es: &[u8; 32], se: &[u8; 32], transcript: &[u8; 32]) -> Result<[u8; 32]> {
    crypto::hmac_sha256(
        SCHEDULE_SALT,
        &[ee.as_slice(), es.as_slice(), se.as_slice(), transcript.as_slice()],
    )
}

#[cfg(test)]
mod tests {
    use super::super::CryptoProvider;
    use super::*;

    fn handshake_pair(protocol: Protocol) -> (PeerProvider, PeerProvider) {
        let mut client = PeerProvider::new(protocol, &SessionOptions::client()).unwrap();
        let mut server = PeerProvider::new(protocol, &SessionOptions::server()).unwrap();

        let hello = client.begin_handshake().unwrap().flight.unwrap();
        assert!(server.begin_handshake().unwrap().flight.is_none());

        let step = server.step_handshake(&hello).unwrap();
        assert_eq!(step.consumed, hello.len());
        assert!(!step.complete);
        let reply = step.flight.unwrap();

        let step = client.step_handshake(&reply).unwrap();
        assert!(step.complete);
        let finished = step.flight.unwrap();

        let step = server.step_handshake(&finished).unwrap();
        assert!(step.complete);
        assert!(step.flight.is_none());

        (client, server)
    }

    #[test]
    fn test_tls_handshake_and_records() {
        let (mut client, mut server) = handshake_pair(Protocol::Tls);

        let mut wire = Vec::new();
        client.encrypt_record(b"first", &mut wire).unwrap();
        client.encrypt_record(b"second", &mut wire).unwrap();
        assert_eq!(wire.len(), 11 + 2 * client.max_overhead());

        let mut plain = Vec::new();
        assert_eq!(server.decrypt_records(&wire, &mut plain).unwrap(), wire.len());
        assert_eq!(plain, b"firstsecond");

        let mut back = Vec::new();
        server.encrypt_record(b"reply", &mut back).unwrap();
        let mut plain = Vec::new();
        client.decrypt_records(&back, &mut plain).unwrap();
        assert_eq!(plain, b"reply");
    }

    #[test]
    fn test_fingerprints_match_identities() {
        let (client, server) = handshake_pair(Protocol::Tls);
        assert_eq!(client.peer_fingerprint().unwrap(), server.identity().fingerprint());
        assert_eq!(server.peer_fingerprint().unwrap(), client.identity().fingerprint());
    }

    #[test]
    fn test_partial_record_not_consumed() {
        let (mut client, mut server) = handshake_pair(Protocol::Tls);
        let mut wire = Vec::new();
        client.encrypt_record(b"payload", &mut wire).unwrap();

        let mut plain = Vec::new();
        assert_eq!(server.decrypt_records(&wire[..4], &mut plain).unwrap(), 0);
        assert_eq!(server.decrypt_records(&wire[..wire.len() - 1], &mut plain).unwrap(), 0);
        assert!(plain.is_empty());
        assert_eq!(server.decrypt_records(&wire, &mut plain).unwrap(), wire.len());
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn test_tampered_tls_record_rejected() {
        let (mut client, mut server) = handshake_pair(Protocol::Tls);
        let mut wire = Vec::new();
        client.encrypt_record(b"payload", &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        let mut plain = Vec::new();
        assert!(server.decrypt_records(&wire, &mut plain).is_err());
    }

    #[test]
    fn test_dtls_replay_dropped() {
        let (mut client, mut server) = handshake_pair(Protocol::Dtls);
        let mut datagram = Vec::new();
        client.encrypt_record(b"once", &mut datagram).unwrap();
        assert_eq!(datagram.len(), 13 + 4 + 16);

        let mut plain = Vec::new();
        server.decrypt_records(&datagram, &mut plain).unwrap();
        server.decrypt_records(&datagram, &mut plain).unwrap();
        assert_eq!(plain, b"once");
    }

    #[test]
    fn test_dtls_reordered_records_accepted() {
        let (mut client, mut server) = handshake_pair(Protocol::Dtls);
        let mut first = Vec::new();
        client.encrypt_record(b"first", &mut first).unwrap();
        let mut second = Vec::new();
        client.encrypt_record(b"second", &mut second).unwrap();

        let mut plain = Vec::new();
        server.decrypt_records(&second, &mut plain).unwrap();
        server.decrypt_records(&first, &mut plain).unwrap();
        assert_eq!(plain, b"secondfirst");

        // Both are now in the window
        server.decrypt_records(&first, &mut plain).unwrap();
        server.decrypt_records(&second, &mut plain).unwrap();
        assert_eq!(plain, b"secondfirst");
    }

    #[test]
    fn test_dtls_record_behind_window_dropped() {
        let (mut client, mut server) = handshake_pair(Protocol::Dtls);
        let mut stale = Vec::new();
        client.encrypt_record(b"stale", &mut stale).unwrap();

        let mut latest = Vec::new();
        for _ in 0..REPLAY_WINDOW {
            latest.clear();
            client.encrypt_record(b"x", &mut latest).unwrap();
        }

        let mut plain = Vec::new();
        server.decrypt_records(&latest, &mut plain).unwrap();
        server.decrypt_records(&stale, &mut plain).unwrap();
        assert_eq!(plain, b"x");
    }

    #[test]
    fn test_replay_window_tracking() {
        let mut dir = Direction::new(&[7u8; KEY_LEN]).unwrap();
        assert!(!dir.is_replay(5));
        dir.mark_opened(5);
        assert!(dir.is_replay(5));
        assert!(!dir.is_replay(3));
        dir.mark_opened(3);
        assert!(dir.is_replay(3));
        assert!(!dir.is_replay(4));

        dir.mark_opened(5 + REPLAY_WINDOW);
        assert!(dir.is_replay(5));
        assert!(dir.is_replay(4));
        assert!(!dir.is_replay(6));
    }

    #[test]
    fn test_dtls_mtu_enforced() {
        let options = SessionOptions::client().with_mtu(100);
        let provider = PeerProvider::new(Protocol::Dtls, &options).unwrap();
        assert_eq!(provider.max_plaintext(), 100 - 29);

        assert!(PeerProvider::new(Protocol::Dtls, &SessionOptions::client().with_mtu(20)).is_err());
    }

    #[test]
    fn test_encrypt_before_handshake_fails() {
        let mut provider = PeerProvider::new(Protocol::Tls, &SessionOptions::client()).unwrap();
        let mut out = Vec::new();
        assert!(provider.encrypt_record(b"x", &mut out).is_err());
    }

    #[test]
    fn test_corrupted_server_hello_fails() {
        let mut client = PeerProvider::new(Protocol::Tls, &SessionOptions::client()).unwrap();
        let mut server = PeerProvider::new(Protocol::Tls, &SessionOptions::server()).unwrap();

        let hello = client.begin_handshake().unwrap().flight.unwrap();
        server.begin_handshake().unwrap();
        let mut reply = server.step_handshake(&hello).unwrap().flight.unwrap();
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;

        assert!(client.step_handshake(&reply).is_err());
    }

    #[test]
    fn test_wrong_version_rejected() {
        let mut server = PeerProvider::new(Protocol::Dtls, &SessionOptions::server()).unwrap();
        server.begin_handshake().unwrap();
        let tls_record = [0x16, 0x03, 0x03, 0x00, 0x01, 0x01, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(server.step_handshake(&tls_record).is_err());
    }
}

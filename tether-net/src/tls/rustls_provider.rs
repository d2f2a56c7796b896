//! TLS client provider backed by rustls
//!
//! Used for HTTPS and WSS against ordinary servers. Chain validation uses the
//! bundled webpki roots unless a peer fingerprint is pinned, in which case the
//! SHA-256 of the server's end-entity certificate is the only thing checked.

use super::{HandshakeStep, Role, SessionOptions, MAX_RECORD_PLAINTEXT};
use crate::crypto;
use crate::{Error, Result};
use ::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use ::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider as RustlsCrypto};
use ::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use ::rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use tracing::debug;

// Header, explicit nonce, tag and inner content type
const RECORD_OVERHEAD: usize = 5 + 8 + 16 + 1;

pub struct RustlsProvider {
    conn: ClientConnection,
}

impl RustlsProvider {
    pub fn new(options: &SessionOptions) -> Result<Self> {
        if options.role != Role::Client {
            return Err(Error::Tls("rustls provider only supports the client role".to_string()));
        }

        let hostname = options
            .hostname
            .clone()
            .ok_or_else(|| Error::Tls("rustls provider requires a hostname".to_string()))?;
        let server_name = ServerName::try_from(hostname.clone())
            .map_err(|e| Error::Tls(format!("invalid server name '{}': {}", hostname, e)))?;

        let provider = Arc::new(::rustls::crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let config = match &options.peer_fingerprint {
            Some(fingerprint) => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
                    fingerprint: fingerprint.clone(),
                    provider,
                }))
                .with_no_client_auth(),
            None => {
                let roots = RootCertStore {
                    roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
                };
                builder.with_root_certificates(roots).with_no_client_auth()
            }
        };

        let conn = ClientConnection::new(Arc::new(config), server_name)?;
        Ok(Self { conn })
    }

    fn pending_flight(&mut self) -> Result<Option<Vec<u8>>> {
        let mut flight = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut flight)?;
        }
        Ok(if flight.is_empty() { None } else { Some(flight) })
    }

    fn feed(&mut self, mut inbound: &[u8]) -> Result<usize> {
        let total = inbound.len();
        while !inbound.is_empty() {
            if self.conn.read_tls(&mut inbound)? == 0 {
                break;
            }
            self.conn.process_new_packets()?;
        }
        Ok(total - inbound.len())
    }
}

impl super::CryptoProvider for RustlsProvider {
    fn begin_handshake(&mut self) -> Result<HandshakeStep> {
        Ok(HandshakeStep {
            flight: self.pending_flight()?,
            ..HandshakeStep::default()
        })
    }

    fn step_handshake(&mut self, inbound: &[u8]) -> Result<HandshakeStep> {
        let consumed = self.feed(inbound)?;
        let flight = self.pending_flight()?;
        let complete = !self.conn.is_handshaking();
        if complete {
            debug!(
                "rustls negotiated {:?}",
                self.conn.protocol_version()
            );
        }
        Ok(HandshakeStep {
            consumed,
            flight,
            complete,
        })
    }

    fn encrypt_record(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        self.conn.writer().write_all(plaintext)?;
        while self.conn.wants_write() {
            self.conn.write_tls(out)?;
        }
        Ok(())
    }

    fn decrypt_records(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let consumed = self.feed(ciphertext)?;

        let mut chunk = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }

        Ok(consumed)
    }

    fn peer_fingerprint(&self) -> Option<String> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| crypto::fingerprint(cert.as_ref()))
    }

    fn max_overhead(&self) -> usize {
        RECORD_OVERHEAD
    }

    fn max_plaintext(&self) -> usize {
        MAX_RECORD_PLAINTEXT
    }
}

/// Accepts exactly the server certificate whose fingerprint is pinned
#[derive(Debug)]
struct PinnedVerifier {
    fingerprint: String,
    provider: Arc<RustlsCrypto>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, ::rustls::Error> {
        let actual = crypto::fingerprint(end_entity.as_ref());
        if actual == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(::rustls::Error::General(format!(
                "certificate fingerprint {} does not match pinned value",
                actual
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, ::rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, ::rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::super::CryptoProvider;
    use super::*;

    #[test]
    fn test_client_hello_is_handshake_record() {
        let options = SessionOptions::client().with_hostname("example.com");
        let mut provider = RustlsProvider::new(&options).unwrap();
        let flight = provider.begin_handshake().unwrap().flight.unwrap();
        assert_eq!(flight[0], crate::tls::CONTENT_HANDSHAKE);
        assert_eq!(flight[1], 0x03);
        assert!(provider.peer_fingerprint().is_none());
    }

    #[test]
    fn test_requires_hostname_and_client_role() {
        assert!(RustlsProvider::new(&SessionOptions::client()).is_err());
        let server = SessionOptions::server().with_hostname("example.com");
        assert!(RustlsProvider::new(&server).is_err());
    }

    #[test]
    fn test_garbage_from_server_fails() {
        let options = SessionOptions::client().with_hostname("example.com");
        let mut provider = RustlsProvider::new(&options).unwrap();
        provider.begin_handshake().unwrap();
        assert!(provider.step_handshake(b"HTTP/1.1 400 Bad Request\r\n\r\n").is_err());
    }
}

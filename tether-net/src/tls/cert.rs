//! Self-signed identities for fingerprint-pinned sessions
//!
//! A certificate here is an X25519 static key plus a common name. Peers do not
//! validate it against any authority; they compare its SHA-256 fingerprint
//! with a value exchanged out of band.

use crate::crypto;
use crate::{Error, Result};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

const CERT_VERSION: u8 = 1;
const KEY_LEN: usize = 32;

/// Local identity with its private key
pub struct Certificate {
    secret: StaticSecret,
    public: PublicKey,
    common_name: String,
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name)
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl Certificate {
    /// Create a fresh identity with a random hex common name
    pub fn generate() -> Self {
        let name = crypto::encode_hex(&crypto::random_bytes(16));
        Self::from_secret(StaticSecret::random_from_rng(OsRng), name)
    }

    pub fn from_secret(secret: StaticSecret, common_name: impl Into<String>) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            common_name: common_name.into(),
        }
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Wire encoding sent to the peer during the handshake
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(&self.public, &self.common_name)
    }

    /// `sha-256 AA:BB:...` over [`Certificate::to_bytes`]
    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.to_bytes())
    }

    pub(crate) fn diffie_hellman(&self, peer: &PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(peer).to_bytes()
    }
}

/// Certificate received from the peer
#[derive(Debug, Clone)]
pub struct PeerCertificate {
    public: PublicKey,
    common_name: String,
    raw: Vec<u8>,
}

impl PeerCertificate {
    /// Decode the wire form produced by [`Certificate::to_bytes`]
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 1 + KEY_LEN + 2 || raw[0] != CERT_VERSION {
            return Err(Error::Tls("malformed peer certificate".to_string()));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&raw[1..1 + KEY_LEN]);

        let name_len = u16::from_be_bytes([raw[1 + KEY_LEN], raw[2 + KEY_LEN]]) as usize;
        let name = raw
            .get(3 + KEY_LEN..3 + KEY_LEN + name_len)
            .ok_or_else(|| Error::Tls("truncated peer certificate".to_string()))?;
        let common_name = String::from_utf8(name.to_vec())
            .map_err(|_| Error::Tls("peer certificate name is not UTF-8".to_string()))?;

        Ok(Self {
            public: PublicKey::from(key),
            common_name,
            raw: raw[..3 + KEY_LEN + name_len].to_vec(),
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn encoded_len(&self) -> usize {
        self.raw.len()
    }

    pub fn fingerprint(&self) -> String {
        crypto::fingerprint(&self.raw)
    }
}

fn encode(public: &PublicKey, common_name: &str) -> Vec<u8> {
    let name = common_name.as_bytes();
    let name_len = name.len().min(u16::MAX as usize);
    let mut out = Vec::with_capacity(3 + KEY_LEN + name_len);
    out.push(CERT_VERSION);
    out.extend_from_slice(public.as_bytes());
    out.extend_from_slice(&(name_len as u16).to_be_bytes());
    out.extend_from_slice(&name[..name_len]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_has_hex_name() {
        let cert = Certificate::generate();
        assert_eq!(cert.common_name().len(), 32);
        assert!(cert.common_name().chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(cert.fingerprint(), Certificate::generate().fingerprint());
    }

    #[test]
    fn test_peer_parse_matches_fingerprint() {
        let cert = Certificate::generate();
        let peer = PeerCertificate::parse(&cert.to_bytes()).unwrap();
        assert_eq!(peer.fingerprint(), cert.fingerprint());
        assert_eq!(peer.common_name(), cert.common_name());
        assert_eq!(peer.public_key().as_bytes(), cert.public_key().as_bytes());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PeerCertificate::parse(&[]).is_err());
        assert!(PeerCertificate::parse(&[9u8; 40]).is_err());

        let mut truncated = Certificate::generate().to_bytes();
        truncated.truncate(truncated.len() - 1);
        assert!(PeerCertificate::parse(&truncated).is_err());
    }

    #[test]
    fn test_shared_secret_agrees() {
        let a = Certificate::generate();
        let b = Certificate::generate();
        assert_eq!(a.diffie_hellman(b.public_key()), b.diffie_hellman(a.public_key()));
    }
}

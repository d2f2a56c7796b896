//! TLS session layered over a byte-stream [`Transport`]

use super::{HandshakeStatus, Protocol, SecureSession, TLS_HEADER_LEN};
use crate::buffer::ByteBuffer;
use crate::transport::{PollStatus, Transport};
use crate::{Error, Result};
use std::time::{Duration, Instant};
use tracing::debug;

/// Encrypting [`Transport`] adapter
///
/// Reads one record at a time from the inner transport (5-byte header, then
/// the declared body) and keeps decrypted bytes the caller has not asked for
/// yet.
pub struct SecureStream<T: Transport> {
    inner: T,
    session: SecureSession,
    plaintext: ByteBuffer,
    scratch: Vec<u8>,
    decrypted: Vec<u8>,
    eof: bool,
}

impl<T: Transport> std::fmt::Debug for SecureStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureStream")
            .field("session", &self.session)
            .field("pending", &self.plaintext.len())
            .finish_non_exhaustive()
    }
}

impl<T: Transport> SecureStream<T> {
    /// Run the client side of the handshake over `inner`
    pub fn connect(inner: T, session: SecureSession, timeout: Duration) -> Result<Self> {
        Self::establish(inner, session, true, timeout)
    }

    /// Run the server side of the handshake over `inner`
    pub fn accept(inner: T, session: SecureSession, timeout: Duration) -> Result<Self> {
        Self::establish(inner, session, false, timeout)
    }

    fn establish(mut inner: T, mut session: SecureSession, initiate: bool, timeout: Duration) -> Result<Self> {
        if session.protocol() != Protocol::Tls {
            return Err(Error::Tls("stream transport requires TLS framing".to_string()));
        }

        let deadline = Instant::now() + timeout;

        let mut status = HandshakeStatus::Continue;
        if initiate {
            status = session.handshake(None, |flight| inner.write_all(flight))?;
        }

        while status == HandshakeStatus::Continue {
            let remaining = remaining(deadline)?;
            let record = match read_record(&mut inner, remaining)? {
                Some(record) => record,
                None => return Err(Error::Closed),
            };
            status = session.handshake(Some(&record), |flight| inner.write_all(flight))?;
        }

        debug!("Secure stream established");
        Ok(Self {
            inner,
            session,
            plaintext: ByteBuffer::new(),
            scratch: Vec::new(),
            decrypted: Vec::new(),
            eof: false,
        })
    }

    pub fn session(&self) -> &SecureSession {
        &self.session
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Pull records until some plaintext is available; `false` on EOF
    fn fill(&mut self, deadline: Instant) -> Result<bool> {
        while self.plaintext.is_empty() {
            // Records already handed to the session may hold more plaintext
            self.decrypted.clear();
            if self.session.buffered() > 0 {
                self.session.decrypt(&[], &mut self.decrypted)?;
            }

            if self.decrypted.is_empty() {
                if self.eof {
                    return Ok(false);
                }
                match read_record(&mut self.inner, remaining(deadline)?)? {
                    Some(record) => {
                        self.session.decrypt(&record, &mut self.decrypted)?;
                    }
                    None => {
                        self.eof = true;
                        return Ok(false);
                    }
                }
            }

            self.plaintext.extend(&self.decrypted)?;
        }
        Ok(true)
    }
}

impl<T: Transport> Transport for SecureStream<T> {
    fn read_partial(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.fill(Instant::now() + timeout)? {
            return Ok(0);
        }
        Ok(self.plaintext.read_into(buf))
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let max = self.session.max_plaintext();
        for chunk in buf.chunks(max.max(1)) {
            self.scratch.resize(chunk.len() + self.session.max_overhead(), 0);
            let n = self.session.encrypt(chunk, &mut self.scratch)?;
            self.inner.write_all(&self.scratch[..n])?;
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        if !self.plaintext.is_empty() || self.eof {
            return Ok(PollStatus::Ready);
        }
        self.inner.poll(timeout)
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(Error::Timeout)
}

/// Read one whole TLS record; `None` on EOF at a record boundary
pub(crate) fn read_record<T: Transport + ?Sized>(inner: &mut T, timeout: Duration) -> Result<Option<Vec<u8>>> {
    let deadline = Instant::now() + timeout;

    let mut header = [0u8; TLS_HEADER_LEN];
    match inner.read_partial(&mut header[..1], timeout)? {
        0 => return Ok(None),
        _ => inner.read_exact(&mut header[1..], remaining(deadline)?)?,
    }

    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut record = vec![0u8; TLS_HEADER_LEN + len];
    record[..TLS_HEADER_LEN].copy_from_slice(&header);
    inner.read_exact(&mut record[TLS_HEADER_LEN..], remaining(deadline)?)?;
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::{Certificate, PeerProviders, SessionOptions};
    use crate::transport::pipe;
    use std::sync::Arc;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn session(options: SessionOptions) -> SecureSession {
        SecureSession::new(Protocol::Tls, options, &PeerProviders).unwrap()
    }

    #[test]
    fn test_stream_echo() {
        let (a, b) = pipe();

        let server = std::thread::spawn(move || {
            let mut stream = SecureStream::accept(b, session(SessionOptions::server()), TIMEOUT).unwrap();
            let mut buf = vec![0u8; 40_000];
            stream.read_exact(&mut buf, TIMEOUT).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut client = SecureStream::connect(a, session(SessionOptions::client()), TIMEOUT).unwrap();
        assert!(client.session().is_established());

        // Larger than one record
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        client.write_all(&data).unwrap();

        let mut echo = vec![0u8; data.len()];
        client.read_exact(&mut echo, TIMEOUT).unwrap();
        assert_eq!(echo, data);

        server.join().unwrap();

        let mut buf = [0u8; 1];
        assert_eq!(client.read_partial(&mut buf, TIMEOUT).unwrap(), 0);
    }

    #[test]
    fn test_stream_pinned_mismatch() {
        let (a, b) = pipe();
        let server_cert = Arc::new(Certificate::generate());

        let server = std::thread::spawn(move || {
            let options = SessionOptions::server().with_certificate(server_cert);
            let _ = SecureStream::accept(b, session(options), TIMEOUT);
        });

        let options = SessionOptions::client().with_peer_fingerprint(Certificate::generate().fingerprint());
        let err = SecureStream::connect(a, session(options), TIMEOUT).unwrap_err();
        assert!(err.is_handshake_failure());
        server.join().unwrap();
    }

    #[test]
    fn test_handshake_times_out() {
        let (a, _b) = pipe();
        let err = SecureStream::connect(a, session(SessionOptions::client()), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }
}

//! TCP transport over `std::net`

use super::{PollStatus, Transport};
use crate::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

// Zero timeouts are rejected by the socket API
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Resolve `host` and connect to the first address that answers within `timeout`
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no addresses for {}", host),
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout.max(MIN_TIMEOUT)) {
                Ok(stream) => {
                    debug!("Connected to {} ({})", host, addr);
                    return Self::from_stream(stream);
                }
                Err(e) => {
                    debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }

        Err(match last_err {
            Some(e) if is_timeout(&e) => Error::Timeout,
            Some(e) => Error::Io(e),
            None => Error::Timeout,
        })
    }

    /// Wrap an already-connected stream (e.g. from a listener)
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr().ok();
        Ok(Self { stream, peer })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn read_partial(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if is_timeout(&e) => Err(Error::Timeout),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        self.stream.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        let mut probe = [0u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(_) => Ok(PollStatus::Ready),
            Err(e) if is_timeout(&e) => Ok(PollStatus::Pending),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

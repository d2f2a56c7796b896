//! TCP listener that upgrades incoming connections

use super::{AcceptPolicy, WebSocket, WsOptions};
use crate::transport::TcpTransport;
use crate::{Error, Result};
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
pub struct WsListener {
    listener: TcpListener,
    policy: AcceptPolicy,
    options: WsOptions,
}

impl WsListener {
    pub fn bind(addr: impl ToSocketAddrs, policy: AcceptPolicy, options: WsOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("WebSocket listener on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            policy,
            options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait up to `timeout` for a client and complete its upgrade
    ///
    /// `Ok(None)` means no client connected in time. A client that connects
    /// but fails the upgrade is reported as an error.
    pub fn accept(&self, timeout: Duration) -> Result<Option<WebSocket<TcpTransport>>> {
        let deadline = Instant::now() + timeout;

        let (stream, addr) = loop {
            match self.listener.accept() {
                Ok(accepted) => break accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(ACCEPT_POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => return Err(Error::Io(e)),
            }
        };

        debug!("Accepted TCP connection from {}", addr);
        stream.set_nonblocking(false)?;
        let transport = TcpTransport::from_stream(stream)?;

        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or(Duration::from_millis(1));
        match WebSocket::accept(transport, &self.policy, self.options.clone(), remaining) {
            Ok(ws) => Ok(Some(ws)),
            Err(e) => {
                warn!("WebSocket upgrade from {} failed: {}", addr, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::WsRead;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn test_accept_times_out() {
        let listener = WsListener::bind("127.0.0.1:0", AcceptPolicy::allow_any(), WsOptions::default()).unwrap();
        assert!(listener.accept(Duration::from_millis(30)).unwrap().is_none());
    }

    #[test]
    fn test_listener_round_trip() {
        let listener = WsListener::bind("127.0.0.1:0", AcceptPolicy::allow_any(), WsOptions::default()).unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = std::thread::spawn(move || {
            let tcp = TcpTransport::connect("127.0.0.1", port, TIMEOUT).unwrap();
            let mut ws = WebSocket::client_handshake(tcp, "127.0.0.1", "/", None, WsOptions::default(), TIMEOUT).unwrap();
            ws.write("over tcp").unwrap();
            ws.read(TIMEOUT).unwrap()
        });

        let mut server = listener.accept(TIMEOUT).unwrap().unwrap();
        assert_eq!(server.read(TIMEOUT).unwrap(), WsRead::Message("over tcp".to_string()));
        server.close(1001).unwrap();

        assert_eq!(client.join().unwrap(), WsRead::Closed(1001));
    }
}

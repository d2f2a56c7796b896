//! WebSocket client and server
//!
//! # Keep-alive contract
//!
//! Pings, pong bookkeeping and dead-peer detection run only inside
//! [`WebSocket::read`]. A session that is only written to never pings and
//! never notices a dead peer, so callers must call `read` at least once per
//! ping interval.

pub mod frame;
pub mod listener;

pub use frame::{apply_mask, create_accept_key, decode_frame, encode_frame, read_frame, Frame, Opcode};
pub use listener::WsListener;

use crate::config::NetConfig;
use crate::crypto::{encode_base64, random_array};
use crate::http::{build_request_header, build_response_header, parse_header_lines, parse_url, read_header, HeaderLines};
use crate::metrics::Metrics;
use crate::net::{ConnectContext, Connection};
use crate::transport::{PollStatus, Transport};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Close code sent when a session is dropped while still open
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code reported when the peer's close frame carries no code
pub const CLOSE_NO_STATUS: u16 = 1005;

// Once a frame has started arriving, the rest must follow within this window
const FRAME_TIMEOUT: Duration = Duration::from_secs(1);

const PING_PAYLOAD: &[u8] = b"ping";

/// Monotonic time source for keep-alive bookkeeping
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock()
    }
}

/// Per-session settings
#[derive(Clone)]
pub struct WsOptions {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub message_max: usize,
    pub header_max: usize,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WsOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsOptions")
            .field("ping_interval", &self.ping_interval)
            .field("pong_timeout", &self.pong_timeout)
            .field("message_max", &self.message_max)
            .field("header_max", &self.header_max)
            .finish_non_exhaustive()
    }
}

impl Default for WsOptions {
    fn default() -> Self {
        Self::from_config(&NetConfig::default())
    }
}

impl WsOptions {
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            ping_interval: config.ws_ping_interval(),
            pong_timeout: config.ws_pong_timeout(),
            message_max: config.ws_message_max,
            header_max: config.header_max,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Which upgrade requests a server accepts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptPolicy {
    /// Allowed origins, either full (`https://app.example`) or bare hosts;
    /// empty allows any
    pub origins: Vec<String>,
    /// Reject origins that are not `https://`
    pub require_https: bool,
}

impl AcceptPolicy {
    pub fn allow_any() -> Self {
        Self::default()
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origins.push(origin.into());
        self
    }

    pub fn with_require_https(mut self, require: bool) -> Self {
        self.require_https = require;
        self
    }

    /// Check an `Origin` header value against the policy
    pub fn allows(&self, origin: Option<&str>) -> bool {
        if self.origins.is_empty() && !self.require_https {
            return true;
        }

        let Some(origin) = origin else {
            return false;
        };

        if self.require_https && !origin.starts_with("https://") {
            return false;
        }

        if self.origins.is_empty() {
            return true;
        }

        let host = parse_url(origin).ok().map(|u| u.host);
        self.origins
            .iter()
            .any(|allowed| allowed == origin || host.as_deref() == Some(allowed.as_str()))
    }
}

/// Outcome of [`WebSocket::read`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsRead {
    /// A complete text message
    Message(String),
    /// Nothing for the caller yet (timeout, control frame, keep-alive)
    Continue,
    /// Peer closed the session with this code
    Closed(u16),
}

/// An open WebSocket session
///
/// Client sessions mask every frame they send; server sessions never do.
pub struct WebSocket<T: Transport> {
    transport: T,
    options: WsOptions,
    client: bool,
    connected: bool,
    close_code: u16,
    last_ping: Instant,
    last_pong: Instant,
    scratch: Vec<u8>,
    metrics: Option<Metrics>,
}

impl<T: Transport> std::fmt::Debug for WebSocket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("client", &self.client)
            .field("connected", &self.connected)
            .field("close_code", &self.close_code)
            .finish_non_exhaustive()
    }
}

impl WebSocket<Connection> {
    /// Open a connection and perform the client upgrade
    #[instrument(skip(ctx, headers, timeout))]
    pub fn connect(
        ctx: &ConnectContext,
        host: &str,
        port: u16,
        secure: bool,
        path: &str,
        headers: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let conn = Connection::connect(ctx, host, port, secure, timeout)?;
        let options = WsOptions::from_config(&ctx.config);

        let ws = Self::client_handshake(conn, host, path, headers, options, remaining(deadline)?)?;
        Ok(ws.with_metrics(ctx.metrics.clone()))
    }
}

impl<T: Transport> WebSocket<T> {
    fn new(transport: T, client: bool, options: WsOptions) -> Self {
        let now = options.clock.now();
        Self {
            transport,
            options,
            client,
            connected: true,
            close_code: 0,
            last_ping: now,
            last_pong: now,
            scratch: Vec::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Send the upgrade request over `transport` and verify the answer
    pub fn client_handshake(
        mut transport: T,
        host: &str,
        path: &str,
        headers: Option<&str>,
        options: WsOptions,
        timeout: Duration,
    ) -> Result<Self> {
        let key = encode_base64(&random_array::<16>());

        let mut lines = HeaderLines::new();
        for (name, value) in parse_header_lines(headers.unwrap_or("")) {
            lines.set(&name, &value);
        }
        lines
            .set("Upgrade", "websocket")
            .set("Connection", "Upgrade")
            .set("Sec-WebSocket-Key", &key)
            .set("Sec-WebSocket-Version", "13");

        let request = build_request_header("GET", host, path, Some(lines.as_str()));
        transport.write_all(request.as_bytes())?;

        let response = read_header(&mut transport, options.header_max, timeout)?;
        let status = response.status_code()?;
        if status != 101 {
            warn!("WebSocket upgrade to {}{} answered {}", host, path, status);
            return Err(Error::UpgradeRejected(status));
        }

        let expected = create_accept_key(&key);
        match response.value("Sec-WebSocket-Accept") {
            Some(accept) if accept == expected => {}
            other => {
                return Err(Error::WebSocket(format!(
                    "accept key mismatch: expected {}, got {:?}",
                    expected, other
                )))
            }
        }

        debug!("WebSocket client connected to {}{}", host, path);
        Ok(Self::new(transport, true, options))
    }

    /// Read an upgrade request from `transport` and answer it
    ///
    /// Rejected origins get a 403, malformed requests a 400.
    pub fn accept(mut transport: T, policy: &AcceptPolicy, options: WsOptions, timeout: Duration) -> Result<Self> {
        let request = read_header(&mut transport, options.header_max, timeout)?;

        let is_upgrade = request.method().map_or(false, |m| m.eq_ignore_ascii_case("GET"))
            && request
                .value("Upgrade")
                .map_or(false, |v| v.to_ascii_lowercase().contains("websocket"));
        let key = match request.value("Sec-WebSocket-Key") {
            Some(key) if is_upgrade && !key.is_empty() => key.to_string(),
            _ => {
                let _ = transport.write_all(build_response_header(400, "Bad Request", None).as_bytes());
                return Err(Error::WebSocket(format!(
                    "not a WebSocket upgrade: '{}'",
                    request.first_line()
                )));
            }
        };

        let origin = request.value("Origin");
        if !policy.allows(origin) {
            let origin = origin.unwrap_or_default().to_string();
            warn!("Rejecting WebSocket upgrade from origin '{}'", origin);
            let _ = transport.write_all(build_response_header(403, "Forbidden", None).as_bytes());
            return Err(Error::OriginRejected(origin));
        }

        let mut lines = HeaderLines::new();
        lines
            .set("Upgrade", "websocket")
            .set("Connection", "Upgrade")
            .set("Sec-WebSocket-Accept", &create_accept_key(&key));
        let response = build_response_header(101, "Switching Protocols", Some(lines.as_str()));
        transport.write_all(response.as_bytes())?;

        debug!("WebSocket upgrade accepted for {}", request.path().unwrap_or("/"));
        Ok(Self::new(transport, false, options))
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Code from the peer's close frame, 0 while open
    pub fn close_code(&self) -> u16 {
        self.close_code
    }

    pub fn get_ref(&self) -> &T {
        &self.transport
    }

    /// Wait up to `timeout` for the next frame and handle it
    ///
    /// Also sends a ping when the interval has elapsed and fails with
    /// [`Error::PeerTimeout`] once no pong has been seen for the pong timeout.
    pub fn read(&mut self, timeout: Duration) -> Result<WsRead> {
        if !self.connected {
            return Err(Error::Closed);
        }

        let now = self.options.clock.now();
        if now.saturating_duration_since(self.last_ping) > self.options.ping_interval {
            self.send(frame::Opcode::Ping, PING_PAYLOAD)?;
            self.last_ping = now;
        }

        let outcome = match self.transport.poll(timeout)? {
            PollStatus::Pending => WsRead::Continue,
            PollStatus::Ready => match read_frame(&mut self.transport, self.options.message_max, FRAME_TIMEOUT)? {
                Some(frame) => self.handle(frame)?,
                None => WsRead::Continue,
            },
        };

        let silence = self.options.clock.now().saturating_duration_since(self.last_pong);
        if silence > self.options.pong_timeout {
            warn!("No pong for {:?}, giving up on peer", silence);
            self.connected = false;
            return Err(Error::PeerTimeout);
        }

        Ok(outcome)
    }

    fn handle(&mut self, frame: Frame) -> Result<WsRead> {
        if let Some(metrics) = &self.metrics {
            metrics.record_frame_received();
        }

        Ok(match frame.opcode {
            Opcode::Ping => {
                self.send(Opcode::Pong, &frame.payload)?;
                WsRead::Continue
            }
            Opcode::Pong => {
                self.last_pong = self.options.clock.now();
                WsRead::Continue
            }
            Opcode::Text if frame.payload.is_empty() => WsRead::Continue,
            Opcode::Text => {
                let text = String::from_utf8(frame.payload)
                    .map_err(|_| Error::WebSocket("text frame is not UTF-8".to_string()))?;
                WsRead::Message(text)
            }
            Opcode::Close => {
                let code = match frame.payload.as_slice() {
                    [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
                    _ => CLOSE_NO_STATUS,
                };
                info!("WebSocket closed by peer with code {}", code);
                self.close_code = code;
                // Echo the close; the peer may already be gone. 1005 is
                // reserved and never goes on the wire.
                let echo = if code == CLOSE_NO_STATUS { Vec::new() } else { code.to_be_bytes().to_vec() };
                let _ = self.send(Opcode::Close, &echo);
                self.connected = false;
                WsRead::Closed(code)
            }
            _ => WsRead::Continue,
        })
    }

    /// Send `msg` as a single text frame
    pub fn write(&mut self, msg: &str) -> Result<()> {
        if !self.connected {
            return Err(Error::Closed);
        }
        self.send(Opcode::Text, msg.as_bytes())
    }

    /// Send a close frame with `code` and stop using the session
    pub fn close(&mut self, code: u16) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.send(Opcode::Close, &code.to_be_bytes())
    }

    fn send(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mask = self.client.then(random_array::<4>);
        self.scratch.clear();
        encode_frame(opcode, payload, mask, &mut self.scratch);
        self.transport.write_all(&self.scratch)?;

        if let Some(metrics) = &self.metrics {
            metrics.record_frame_sent();
        }
        Ok(())
    }
}

impl<T: Transport> Drop for WebSocket<T> {
    fn drop(&mut self) {
        if self.connected {
            if let Err(e) = self.close(CLOSE_NORMAL) {
                debug!("Close on drop failed: {}", e);
            }
        }
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(Error::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpHeader;
    use crate::transport::{pipe, MemoryTransport};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const SHORT: Duration = Duration::from_millis(20);

    fn manual_options() -> (WsOptions, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (WsOptions::default().with_clock(clock.clone()), clock)
    }

    fn connected_pair(policy: AcceptPolicy, headers: Option<&'static str>) -> (Result<WebSocket<MemoryTransport>>, Result<WebSocket<MemoryTransport>>) {
        let (a, b) = pipe();
        let server = std::thread::spawn(move || WebSocket::accept(b, &policy, WsOptions::default(), TIMEOUT));
        let client = WebSocket::client_handshake(a, "chat.local", "/ws", headers, WsOptions::default(), TIMEOUT);
        (client, server.join().unwrap())
    }

    #[test]
    fn test_handshake_and_messages() {
        let (client, server) = connected_pair(AcceptPolicy::allow_any(), None);
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.write("hello server").unwrap();
        assert_eq!(server.read(TIMEOUT).unwrap(), WsRead::Message("hello server".to_string()));

        server.write("hello client").unwrap();
        assert_eq!(client.read(TIMEOUT).unwrap(), WsRead::Message("hello client".to_string()));

        assert_eq!(client.read(SHORT).unwrap(), WsRead::Continue);
    }

    #[test]
    fn test_client_frames_masked_server_frames_not() {
        let (a, mut peer) = pipe();
        let mut ws = WebSocket::new(a, true, WsOptions::default());
        ws.write("x").unwrap();
        let mut raw = [0u8; 2];
        peer.read_exact(&mut raw, TIMEOUT).unwrap();
        assert_eq!(raw[1] & 0x80, 0x80);

        let (b, mut peer) = pipe();
        let mut ws = WebSocket::new(b, false, WsOptions::default());
        ws.write("x").unwrap();
        peer.read_exact(&mut raw, TIMEOUT).unwrap();
        assert_eq!(raw, [0x81, 0x01]);
    }

    #[test]
    fn test_origin_policy() {
        let policy = AcceptPolicy::default().with_origin("app.example").with_require_https(true);
        assert!(policy.allows(Some("https://app.example")));
        assert!(policy.allows(Some("https://app.example:8443")));
        assert!(!policy.allows(Some("http://app.example")));
        assert!(!policy.allows(Some("https://evil.example")));
        assert!(!policy.allows(None));

        let full = AcceptPolicy::default().with_origin("http://localhost:3000");
        assert!(full.allows(Some("http://localhost:3000")));
        assert!(AcceptPolicy::allow_any().allows(None));
    }

    #[test]
    fn test_origin_rejected_with_403() {
        let (client, server) = connected_pair(
            AcceptPolicy::default().with_origin("good.example"),
            Some("Origin: https://bad.example"),
        );
        assert!(matches!(client, Err(Error::UpgradeRejected(403))));
        assert!(matches!(server, Err(Error::OriginRejected(o)) if o == "https://bad.example"));
    }

    #[test]
    fn test_caller_headers_forwarded() {
        let (a, mut b) = pipe();
        let server = std::thread::spawn(move || {
            let request = read_header(&mut b, 4096, TIMEOUT).unwrap();
            let key = request.value("Sec-WebSocket-Key").unwrap().to_string();
            let mut lines = HeaderLines::new();
            lines.set("Sec-WebSocket-Accept", &create_accept_key(&key));
            b.write_all(build_response_header(101, "Switching Protocols", Some(lines.as_str())).as_bytes())
                .unwrap();
            (request, b)
        });

        let ws = WebSocket::client_handshake(a, "h", "/feed", Some("Authorization: Bearer abc"), WsOptions::default(), TIMEOUT)
            .unwrap();
        let (request, _b): (HttpHeader, MemoryTransport) = server.join().unwrap();
        assert_eq!(request.first_line(), "GET /feed HTTP/1.1");
        assert_eq!(request.value("authorization"), Some("Bearer abc"));
        assert_eq!(request.value("Sec-WebSocket-Version"), Some("13"));
        assert!(ws.is_connected());
    }

    #[test]
    fn test_bad_accept_key() {
        let (a, mut b) = pipe();
        let server = std::thread::spawn(move || {
            read_header(&mut b, 4096, TIMEOUT).unwrap();
            let mut lines = HeaderLines::new();
            lines.set("Sec-WebSocket-Accept", "bm9wZQ==");
            b.write_all(build_response_header(101, "Switching Protocols", Some(lines.as_str())).as_bytes())
                .unwrap();
            b
        });

        let result = WebSocket::client_handshake(a, "h", "/", None, WsOptions::default(), TIMEOUT);
        assert!(matches!(result, Err(Error::WebSocket(_))));
        server.join().unwrap();
    }

    #[test]
    fn test_non_upgrade_gets_400() {
        let (a, mut b) = pipe();
        let server = std::thread::spawn(move || WebSocket::accept(a, &AcceptPolicy::allow_any(), WsOptions::default(), TIMEOUT));
        b.write_all(build_request_header("GET", "h", "/", None).as_bytes()).unwrap();

        let response = read_header(&mut b, 4096, TIMEOUT).unwrap();
        assert_eq!(response.status_code().unwrap(), 400);
        assert!(matches!(server.join().unwrap(), Err(Error::WebSocket(_))));
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let (a, b) = pipe();
        let (options, clock) = manual_options();
        let mut client = WebSocket::new(a, true, options);
        let mut server = WebSocket::new(b, false, WsOptions::default());

        clock.advance(Duration::from_secs(61));
        assert_eq!(client.read(SHORT).unwrap(), WsRead::Continue);

        // Server sees the ping and answers
        assert_eq!(server.read(TIMEOUT).unwrap(), WsRead::Continue);

        clock.advance(Duration::from_secs(100));
        assert_eq!(client.read(TIMEOUT).unwrap(), WsRead::Continue);

        // The pong reset the timer, so 100 more seconds are still fine
        clock.advance(Duration::from_secs(100));
        assert!(client.read(SHORT).is_ok());
    }

    #[test]
    fn test_keepalive_ping_payload() {
        let (a, mut b) = pipe();
        let (options, clock) = manual_options();
        let mut client = WebSocket::new(a, true, options);

        clock.advance(Duration::from_secs(61));
        assert_eq!(client.read(SHORT).unwrap(), WsRead::Continue);

        let ping = read_frame(&mut b, 1024, TIMEOUT).unwrap().unwrap();
        assert_eq!(ping.opcode, Opcode::Ping);
        assert_eq!(ping.payload, b"ping".to_vec());
    }

    #[test]
    fn test_dead_peer_detected() {
        let (a, _b) = pipe();
        let (options, clock) = manual_options();
        let mut client = WebSocket::new(a, true, options);

        clock.advance(Duration::from_secs(179));
        assert!(client.read(SHORT).is_ok());

        clock.advance(Duration::from_secs(2));
        assert!(matches!(client.read(SHORT), Err(Error::PeerTimeout)));
        assert!(!client.is_connected());
    }

    #[test]
    fn test_dead_peer_despite_traffic() {
        let (a, b) = pipe();
        let (options, clock) = manual_options();
        let mut client = WebSocket::new(a, true, options);
        let mut server = WebSocket::new(b, false, WsOptions::default());

        server.write("still here").unwrap();
        clock.advance(Duration::from_secs(181));
        assert!(matches!(client.read(TIMEOUT), Err(Error::PeerTimeout)));
    }

    #[test]
    fn test_close_code_and_drop() {
        let (a, b) = pipe();
        let mut client = WebSocket::new(a, true, WsOptions::default());
        let mut server = WebSocket::new(b, false, WsOptions::default());

        server.close(4001).unwrap();
        assert_eq!(client.read(TIMEOUT).unwrap(), WsRead::Closed(4001));
        assert_eq!(client.close_code(), 4001);
        assert!(client.write("late").is_err());

        // Client echoed the close
        drop(client);
        let frame = read_frame(&mut server.transport, 1024, TIMEOUT).unwrap().unwrap();
        assert_eq!(frame.opcode, Opcode::Close);
        assert_eq!(frame.payload, 4001u16.to_be_bytes().to_vec());
    }

    #[test]
    fn test_drop_sends_normal_close() {
        let (a, b) = pipe();
        let client = WebSocket::new(a, true, WsOptions::default());
        let mut server = WebSocket::new(b, false, WsOptions::default());

        drop(client);
        assert_eq!(server.read(TIMEOUT).unwrap(), WsRead::Closed(CLOSE_NORMAL));
    }

    #[test]
    fn test_close_without_code() {
        let (mut a, b) = pipe();
        let mut server = WebSocket::new(b, false, WsOptions::default());
        let mut wire = Vec::new();
        encode_frame(Opcode::Close, &[], Some([1, 2, 3, 4]), &mut wire);
        a.write_all(&wire).unwrap();

        assert_eq!(server.read(TIMEOUT).unwrap(), WsRead::Closed(CLOSE_NO_STATUS));
        assert_eq!(server.close_code(), CLOSE_NO_STATUS);

        let echoed = read_frame(&mut a, 1024, TIMEOUT).unwrap().unwrap();
        assert_eq!(echoed.opcode, Opcode::Close);
        assert!(echoed.payload.is_empty());
    }

    #[test]
    fn test_empty_text_is_keepalive() {
        let (a, b) = pipe();
        let mut client = WebSocket::new(a, true, WsOptions::default());
        let mut server = WebSocket::new(b, false, WsOptions::default());
        client.write("").unwrap();
        assert_eq!(server.read(TIMEOUT).unwrap(), WsRead::Continue);
    }
}

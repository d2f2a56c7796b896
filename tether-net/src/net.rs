//! Connection establishment
//!
//! DNS resolution, TCP connect, optional proxy tunnel, optional TLS. Every
//! attempt reads the proxy setting afresh.

use crate::config::NetConfig;
use crate::http::{proxy_connect, ProxySettings};
use crate::metrics::Metrics;
use crate::tls::{DefaultProviders, Protocol, ProviderFactory, SecureSession, SecureStream, SessionOptions};
use crate::transport::{PollStatus, TcpTransport, Transport};
use crate::{Result, HTTPS_PORT, HTTP_PORT};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// What a connection attempt needs from the runtime
#[derive(Clone)]
pub struct ConnectContext {
    pub config: Arc<NetConfig>,
    pub proxy: ProxySettings,
    pub providers: Arc<dyn ProviderFactory>,
    pub metrics: Metrics,
}

impl std::fmt::Debug for ConnectContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectContext")
            .field("config", &self.config)
            .field("proxy", &self.proxy)
            .finish_non_exhaustive()
    }
}

impl ConnectContext {
    /// Context with default providers and the proxy taken from `config`
    pub fn new(config: NetConfig) -> Result<Self> {
        let proxy = ProxySettings::new(config.proxy.as_deref())?;
        Ok(Self {
            config: Arc::new(config),
            proxy,
            providers: Arc::new(DefaultProviders),
            metrics: Metrics::new(),
        })
    }

    pub fn with_providers(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = providers;
        self
    }
}

enum Link {
    Plain(TcpTransport),
    Secure(Box<SecureStream<TcpTransport>>),
}

/// An open client connection, plain or TLS
pub struct Connection {
    host: String,
    port: u16,
    link: Link,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secure", &self.is_secure())
            .finish()
    }
}

impl Connection {
    /// Connect to `host:port`, tunneling through the proxy when one is set
    ///
    /// Port 0 selects 80 or 443 depending on `secure`.
    pub fn connect(ctx: &ConnectContext, host: &str, port: u16, secure: bool, timeout: Duration) -> Result<Self> {
        let options = SessionOptions::client().with_hostname(host);
        Self::open(ctx, host, port, secure.then_some(options), timeout)
    }

    /// Connect over TLS with explicit session options (pinning, identity)
    pub fn connect_secure(
        ctx: &ConnectContext,
        host: &str,
        port: u16,
        options: SessionOptions,
        timeout: Duration,
    ) -> Result<Self> {
        Self::open(ctx, host, port, Some(options), timeout)
    }

    #[instrument(skip(ctx, options, timeout), fields(secure = options.is_some()))]
    fn open(
        ctx: &ConnectContext,
        host: &str,
        port: u16,
        options: Option<SessionOptions>,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        let port = match port {
            0 if options.is_some() => HTTPS_PORT,
            0 => HTTP_PORT,
            p => p,
        };

        let connect_timeout = timeout.min(ctx.config.connect_timeout());
        let tcp = match ctx.proxy.target() {
            Some((proxy_host, proxy_port)) => {
                debug!("Tunneling to {}:{} via {}:{}", host, port, proxy_host, proxy_port);
                let mut tcp = TcpTransport::connect(&proxy_host, proxy_port, connect_timeout)?;
                proxy_connect(&mut tcp, host, port, ctx.config.header_max, remaining(deadline)?)?;
                tcp
            }
            None => TcpTransport::connect(host, port, connect_timeout)?,
        };

        let link = match options {
            Some(options) => {
                let session = SecureSession::new(Protocol::Tls, options, ctx.providers.as_ref())?
                    .with_metrics(ctx.metrics.clone());
                Link::Secure(Box::new(SecureStream::connect(tcp, session, remaining(deadline)?)?))
            }
            None => Link::Plain(tcp),
        };

        Ok(Self {
            host: host.to_string(),
            port,
            link,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.link, Link::Secure(_))
    }

    /// Fingerprint of the TLS peer, for secure connections
    pub fn peer_fingerprint(&self) -> Option<String> {
        match &self.link {
            Link::Secure(stream) => stream.session().peer_fingerprint(),
            Link::Plain(_) => None,
        }
    }
}

impl Transport for Connection {
    fn read_partial(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        match &mut self.link {
            Link::Plain(tcp) => tcp.read_partial(buf, timeout),
            Link::Secure(stream) => stream.read_partial(buf, timeout),
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.link {
            Link::Plain(tcp) => tcp.write_all(buf),
            Link::Secure(stream) => stream.write_all(buf),
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        match &mut self.link {
            Link::Plain(tcp) => tcp.poll(timeout),
            Link::Secure(stream) => stream.poll(timeout),
        }
    }
}

fn remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(crate::Error::Timeout)
}

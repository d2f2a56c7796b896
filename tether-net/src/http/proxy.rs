//! Proxy configuration and CONNECT tunneling

use super::header::{build_connect_header, read_header};
use super::url::parse_url;
use crate::transport::Transport;
use crate::{Error, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Shared, mutable proxy URL
///
/// Clones share the same setting. Connections read it once per attempt, so a
/// change applies to the next connection, never to one already open.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    url: Arc<RwLock<Option<String>>>,
}

impl ProxySettings {
    pub fn new(url: Option<&str>) -> Result<Self> {
        let settings = Self::default();
        settings.set(url)?;
        Ok(settings)
    }

    /// Replace the proxy URL; `None` or an empty string disables proxying
    pub fn set(&self, url: Option<&str>) -> Result<()> {
        let url = url.filter(|u| !u.is_empty());
        if let Some(url) = url {
            parse_url(url)?;
        }
        *self.url.write() = url.map(str::to_string);
        Ok(())
    }

    pub fn get(&self) -> Option<String> {
        self.url.read().clone()
    }

    /// Host and port to dial instead of the origin server
    pub fn target(&self) -> Option<(String, u16)> {
        let url = self.get()?;
        match parse_url(&url) {
            Ok(parsed) => Some((parsed.host, parsed.port)),
            Err(e) => {
                warn!("Ignoring unusable proxy '{}': {}", url, e);
                None
            }
        }
    }
}

/// Ask the proxy on `transport` to open a tunnel to `host:port`
///
/// Only a 200 answer succeeds. On failure the caller should drop the transport.
pub fn proxy_connect<T: Transport + ?Sized>(
    transport: &mut T,
    host: &str,
    port: u16,
    header_max: usize,
    timeout: Duration,
) -> Result<()> {
    let request = build_connect_header(host, port, None);
    transport.write_all(request.as_bytes())?;

    let response = read_header(transport, header_max, timeout)?;
    let status = response.status_code()?;
    if status != 200 {
        warn!("Proxy refused tunnel to {}:{} with {}", host, port, status);
        return Err(Error::ProxyRejected(status));
    }

    debug!("Proxy tunnel to {}:{} open", host, port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpHeader;
    use crate::transport::pipe;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fake_proxy(status_line: &'static str) -> (crate::transport::MemoryTransport, std::thread::JoinHandle<HttpHeader>) {
        let (client, mut proxy) = pipe();
        let handle = std::thread::spawn(move || {
            let request = read_header(&mut proxy, 1024, TIMEOUT).unwrap();
            proxy
                .write_all(format!("{}\r\nProxy-Agent: test\r\n\r\n", status_line).as_bytes())
                .unwrap();
            request
        });
        (client, handle)
    }

    #[test]
    fn test_connect_success() {
        let (mut client, proxy) = fake_proxy("HTTP/1.1 200 Connection established");
        proxy_connect(&mut client, "example.com", 443, 1024, TIMEOUT).unwrap();

        let request = proxy.join().unwrap();
        assert_eq!(request.first_line(), "CONNECT example.com:443 HTTP/1.1");
    }

    #[test]
    fn test_connect_rejected() {
        let (mut client, proxy) = fake_proxy("HTTP/1.1 407 Proxy Authentication Required");
        let err = proxy_connect(&mut client, "example.com", 443, 1024, TIMEOUT).unwrap_err();
        assert!(matches!(err, Error::ProxyRejected(407)));
        proxy.join().unwrap();
    }

    #[test]
    fn test_settings_shared_between_clones() {
        let settings = ProxySettings::default();
        let clone = settings.clone();
        assert!(settings.target().is_none());

        clone.set(Some("http://proxy.local:3128")).unwrap();
        assert_eq!(settings.target(), Some(("proxy.local".to_string(), 3128)));

        settings.set(Some("")).unwrap();
        assert!(clone.get().is_none());

        assert!(settings.set(Some("gopher://nope")).is_err());
    }
}

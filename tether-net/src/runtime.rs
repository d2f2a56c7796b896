// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! Process-wide network state
//!
//! [`NetworkRuntime`] owns everything that would otherwise be a global: the
//! proxy setting, metrics, provider selection and the async HTTP pool. The
//! application creates one at startup, passes it by reference, and shuts it
//! down on exit.

use crate::async_http::{AsyncHttp, ResponseHook};
use crate::config::NetConfig;
use crate::http::{self, HttpRequest, HttpResponse};
use crate::image::ImageDecoder;
use crate::metrics::Metrics;
use crate::net::{ConnectContext, Connection};
use crate::tls::{DefaultProviders, Protocol, ProviderFactory, SecureSession, SessionOptions};
use crate::ws::WebSocket;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Optional collaborators for [`NetworkRuntime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    providers: Option<Arc<dyn ProviderFactory>>,
    decoder: Option<Arc<dyn ImageDecoder>>,
    hook: Option<Arc<ResponseHook>>,
}

impl RuntimeBuilder {
    pub fn providers(mut self, providers: Arc<dyn ProviderFactory>) -> Self {
        self.providers = Some(providers);
        self
    }

    pub fn image_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn response_hook(mut self, hook: Arc<ResponseHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn init(self, config: NetConfig) -> Result<NetworkRuntime> {
        config.validate()?;

        let providers = self.providers.unwrap_or_else(|| Arc::new(DefaultProviders));
        let ctx = ConnectContext::new(config)?.with_providers(providers);

        let mut http = AsyncHttp::new(ctx.clone());
        if let Some(decoder) = self.decoder {
            http = http.with_decoder(decoder);
        }
        if let Some(hook) = self.hook {
            http = http.with_hook(hook);
        }

        info!("Network runtime initialized (tether {})", crate::VERSION);
        Ok(NetworkRuntime { ctx, http })
    }
}

#[derive(Debug)]
pub struct NetworkRuntime {
    ctx: ConnectContext,
    http: AsyncHttp,
}

impl NetworkRuntime {
    /// Validate `config` and build a runtime with default providers
    pub fn init(config: NetConfig) -> Result<Self> {
        Self::builder().init(config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &NetConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.ctx.metrics
    }

    /// Current proxy URL, if any
    pub fn proxy(&self) -> Option<String> {
        self.ctx.proxy.get()
    }

    /// Change the proxy for subsequent connections
    pub fn set_proxy(&self, url: Option<&str>) -> Result<()> {
        self.ctx.proxy.set(url)?;
        info!("Proxy {}", if url.map_or(false, |u| !u.is_empty()) { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn connect_context(&self) -> &ConnectContext {
        &self.ctx
    }

    /// Async HTTP façade; call [`NetworkRuntime::start_async`] before use
    pub fn http(&self) -> &AsyncHttp {
        &self.http
    }

    /// Create the async HTTP pool sized by `async_max_threads`
    pub fn start_async(&self) {
        self.http.create(self.ctx.config.async_max_threads);
    }

    /// Blocking request on the calling thread
    pub fn request(&self, req: &HttpRequest, timeout: Duration) -> Result<HttpResponse> {
        http::request(&self.ctx, req, timeout)
    }

    pub fn connect(&self, host: &str, port: u16, secure: bool, timeout: Duration) -> Result<Connection> {
        Connection::connect(&self.ctx, host, port, secure, timeout)
    }

    /// Session built by the runtime's providers, for callers that move the
    /// records themselves (datagram sockets, custom transports)
    ///
    /// DTLS sessions take their MTU from the configuration.
    pub fn secure_session(&self, protocol: Protocol, options: SessionOptions) -> Result<SecureSession> {
        let options = match protocol {
            Protocol::Dtls => options.with_mtu(self.ctx.config.dtls_mtu),
            Protocol::Tls => options,
        };
        Ok(SecureSession::new(protocol, options, self.ctx.providers.as_ref())?.with_metrics(self.ctx.metrics.clone()))
    }

    pub fn websocket(
        &self,
        host: &str,
        port: u16,
        secure: bool,
        path: &str,
        headers: Option<&str>,
        timeout: Duration,
    ) -> Result<WebSocket<Connection>> {
        WebSocket::connect(&self.ctx, host, port, secure, path, headers, timeout)
    }

    /// Stop the async pool, waiting for in-flight requests
    pub fn shutdown(self) {
        self.http.destroy();
        info!("Network runtime shut down");
    }
}

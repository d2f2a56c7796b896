//! Blocking HTTP/1.1 request over a fresh connection

use super::header::{build_request_header, parse_header_lines, read_header, HeaderLines, HttpHeader};
use super::url::parse_url;
use crate::buffer::ByteBuffer;
use crate::image::ImageSize;
use crate::net::{ConnectContext, Connection};
use crate::transport::Transport;
use crate::{Error, Result};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

/// Request inputs
///
/// Host, path, headers and body are wiped from memory when the request is
/// dropped, since they routinely carry credentials.
#[derive(Clone)]
pub struct HttpRequest {
    method: String,
    host: Zeroizing<String>,
    port: u16,
    secure: bool,
    path: Zeroizing<String>,
    headers: Zeroizing<String>,
    body: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("host", &self.host.as_str())
            .field("port", &self.port)
            .field("secure", &self.secure)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

impl HttpRequest {
    /// Port 0 picks 80 or 443 when connecting
    pub fn new(method: impl Into<String>, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            host: Zeroizing::new(host.into()),
            port: 0,
            secure: false,
            path: Zeroizing::new(path.into()),
            headers: Zeroizing::new(String::new()),
            body: Zeroizing::new(Vec::new()),
        }
    }

    pub fn from_url(method: impl Into<String>, url: &str) -> Result<Self> {
        let parsed = parse_url(url)?;
        Ok(Self::new(method, parsed.host, parsed.path)
            .with_port(parsed.port)
            .with_secure(parsed.secure))
    }

    pub fn get(url: &str) -> Result<Self> {
        Self::from_url("GET", url)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Extra headers as newline-separated `Key: Value` lines
    pub fn with_headers(mut self, headers: impl Into<String>) -> Self {
        self.headers = Zeroizing::new(headers.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Zeroizing::new(body.into());
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &str {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Full request header including the generated fields
    fn compose(&self, user_agent: &str) -> Zeroizing<String> {
        let mut lines = HeaderLines::new();
        for (key, value) in parse_header_lines(&self.headers) {
            lines.set(&key, &value);
        }
        if !lines.contains("User-Agent") {
            lines.set("User-Agent", user_agent);
        }
        lines.set("Connection", "close");
        if !self.body.is_empty() {
            lines.set_int("Content-Length", self.body.len() as i64);
        }

        let lines = Zeroizing::new(lines.into_string());
        Zeroizing::new(build_request_header(&self.method, &self.host, &self.path, Some(lines.as_str())))
    }
}

/// Status and buffered body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    /// Set when the body was replaced by decoded image pixels
    pub image: Option<ImageSize>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body length, or `width | height << 16` for decoded images
    pub fn packed_size(&self) -> usize {
        match self.image {
            Some(size) => size.packed() as usize,
            None => self.body.len(),
        }
    }

    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(&self.body).map_err(|e| Error::Http(format!("body is not UTF-8: {}", e)))
    }
}

/// Connect, send `req`, and read the whole response within `timeout`
#[instrument(skip(ctx, req), fields(host = %req.host(), method = %req.method()))]
pub fn request(ctx: &ConnectContext, req: &HttpRequest, timeout: Duration) -> Result<HttpResponse> {
    let deadline = Instant::now() + timeout;

    let result = Connection::connect(ctx, req.host(), req.port(), req.is_secure(), timeout).and_then(|mut conn| {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Timeout)?;
        send_request(
            &mut conn,
            req,
            &ctx.config.user_agent,
            ctx.config.header_max,
            ctx.config.response_max,
            remaining,
        )
    });

    match &result {
        Ok(response) => {
            ctx.metrics.record_request(response.body.len());
            debug!("{} {} -> {}", req.method(), req.path(), response.status);
        }
        Err(e) => {
            ctx.metrics.record_request_failure();
            warn!("Request to {} failed: {}", req.host(), e);
        }
    }

    result
}

/// Run one request/response exchange over an existing transport
pub fn send_request<T: Transport + ?Sized>(
    transport: &mut T,
    req: &HttpRequest,
    user_agent: &str,
    header_max: usize,
    response_max: usize,
    timeout: Duration,
) -> Result<HttpResponse> {
    let deadline = Instant::now() + timeout;

    let header = req.compose(user_agent);
    transport.write_all(header.as_bytes())?;
    if !req.body().is_empty() {
        transport.write_all(req.body())?;
    }

    let response = read_header(transport, header_max, timeout)?;
    let status = response.status_code()?;

    let body = if has_no_body(req.method(), status) {
        Bytes::new()
    } else {
        read_body(transport, &response, response_max, deadline)?
    };

    Ok(HttpResponse {
        status,
        body,
        image: None,
    })
}

fn has_no_body(method: &str, status: u16) -> bool {
    method.eq_ignore_ascii_case("HEAD") || (100..200).contains(&status) || status == 204 || status == 304
}

fn remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(Error::Timeout)
}

fn read_body<T: Transport + ?Sized>(
    transport: &mut T,
    header: &HttpHeader,
    max: usize,
    deadline: Instant,
) -> Result<Bytes> {
    if let Some(len) = header.value_int("Content-Length") {
        let len = usize::try_from(len).map_err(|_| Error::Http(format!("invalid Content-Length {}", len)))?;
        if len > max {
            return Err(Error::Http(format!("response of {} bytes exceeds limit of {}", len, max)));
        }
        let mut body = vec![0u8; len];
        transport.read_exact(&mut body, remaining(deadline)?)?;
        return Ok(Bytes::from(body));
    }

    let chunked = header
        .value("Transfer-Encoding")
        .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"));

    if chunked {
        read_chunked(transport, max, deadline)
    } else {
        read_to_eof(transport, max, deadline)
    }
}

fn read_chunked<T: Transport + ?Sized>(transport: &mut T, max: usize, deadline: Instant) -> Result<Bytes> {
    let mut body = ByteBuffer::with_limit(max);

    loop {
        let line = read_line(transport, deadline)?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| Error::Http(format!("invalid chunk size '{}'", size_field)))?;

        if size == 0 {
            // Trailers end with an empty line
            while !read_line(transport, deadline)?.is_empty() {}
            break;
        }

        if body.len() + size > max {
            return Err(Error::Http(format!("chunked response exceeds limit of {}", max)));
        }

        let mut chunk = vec![0u8; size];
        transport.read_exact(&mut chunk, remaining(deadline)?)?;
        body.extend(&chunk)?;

        let mut crlf = [0u8; 2];
        transport.read_exact(&mut crlf, remaining(deadline)?)?;
        if &crlf != b"\r\n" {
            return Err(Error::Http("chunk not terminated by CRLF".to_string()));
        }
    }

    Ok(body.take())
}

fn read_to_eof<T: Transport + ?Sized>(transport: &mut T, max: usize, deadline: Instant) -> Result<Bytes> {
    let mut body = ByteBuffer::with_limit(max);
    let mut chunk = [0u8; 8192];

    loop {
        match transport.read_partial(&mut chunk, remaining(deadline)?)? {
            0 => break,
            n => body
                .extend(&chunk[..n])
                .map_err(|_| Error::Http(format!("response exceeds limit of {}", max)))?,
        }
    }

    Ok(body.take())
}

/// CRLF-terminated line without the terminator
fn read_line<T: Transport + ?Sized>(transport: &mut T, deadline: Instant) -> Result<String> {
    const MAX_LINE: usize = 4096;
    let mut line = ByteBuffer::with_limit(MAX_LINE);
    let mut byte = [0u8; 1];

    while !line.ends_with(b"\r\n") {
        transport.read_exact(&mut byte, remaining(deadline)?)?;
        line.push(byte[0])
            .map_err(|_| Error::Http("chunk header line too long".to_string()))?;
    }

    let text = &line.as_slice()[..line.len() - 2];
    Ok(String::from_utf8_lossy(text).into_owned())
}

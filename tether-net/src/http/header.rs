// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! Header block composition and parsing
//!
//! # Wire format
//!
//! ```text
//! METHOD path HTTP/1.1\r\n        (or "HTTP/1.1 code reason\r\n", or "CONNECT host:port HTTP/1.1\r\n")
//! Host: host\r\n                  (requests only)
//! Name: value\r\n                 (zero or more)
//! \r\n
//! ```

use crate::buffer::ByteBuffer;
use crate::transport::Transport;
use crate::{Error, Result};
use std::time::{Duration, Instant};

const TERMINATOR: &[u8] = b"\r\n\r\n";

/// `METHOD path HTTP/1.1`, `Host`, caller lines, blank line
pub fn build_request_header(method: &str, host: &str, path: &str, extra: Option<&str>) -> String {
    format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n{}\r\n",
        method,
        path,
        host,
        extra.unwrap_or("")
    )
}

/// Proxy tunnel request for `host:port`
pub fn build_connect_header(host: &str, port: u16, extra: Option<&str>) -> String {
    format!("CONNECT {}:{} HTTP/1.1\r\n{}\r\n", host, port, extra.unwrap_or(""))
}

pub fn build_response_header(code: u16, reason: &str, extra: Option<&str>) -> String {
    format!("HTTP/1.1 {} {}\r\n{}\r\n", code, reason, extra.unwrap_or(""))
}

/// Accumulates `Name: value\r\n` lines for the builders above
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderLines {
    lines: String,
}

impl HeaderLines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) -> &mut Self {
        self.lines.push_str(name);
        self.lines.push_str(": ");
        self.lines.push_str(value);
        self.lines.push_str("\r\n");
        self
    }

    pub fn set_int(&mut self, name: &str, value: i64) -> &mut Self {
        self.set(name, &value.to_string())
    }

    /// Case-insensitive check for a header already set
    pub fn contains(&self, name: &str) -> bool {
        self.lines.split("\r\n").any(|line| {
            line.split(':')
                .next()
                .map_or(false, |key| key.trim().eq_ignore_ascii_case(name))
        })
    }

    pub fn as_str(&self) -> &str {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn into_string(self) -> String {
        self.lines
    }
}

/// Split caller-supplied `Key: Value` lines (newline separated)
///
/// Parsing stops at the first line without a value.
pub fn parse_header_lines(all: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();

    for line in all.split('\n').map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty()) {
        let line = line.trim_start_matches([' ', ':']);
        let Some(split) = line.find([' ', ':']) else {
            break;
        };

        let key = &line[..split];
        let value = line[split + 1..].trim_start_matches([' ', '\t', ':']);
        if key.is_empty() || value.is_empty() {
            break;
        }

        pairs.push((key.to_string(), value.to_string()));
    }

    pairs
}

/// Parsed header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeader {
    first_line: String,
    pairs: Vec<(String, String)>,
}

impl HttpHeader {
    /// Parse a header block; the first line is kept verbatim
    pub fn parse(text: &str) -> Self {
        let mut lines = text.split(['\r', '\n']).filter(|l| !l.is_empty());
        let first_line = lines.next().unwrap_or_default().to_string();

        let pairs = lines
            .filter_map(|line| {
                let delim = line.find([':', ' '])?;
                let value = line[delim..].trim_start_matches([':', ' ', '\t']);
                Some((line[..delim].to_string(), value.to_string()))
            })
            .collect();

        Self { first_line, pairs }
    }

    pub fn first_line(&self) -> &str {
        &self.first_line
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Second whitespace-delimited token of the first line
    pub fn status_code(&self) -> Result<u16> {
        let token = self
            .first_line
            .split(' ')
            .filter(|t| !t.is_empty())
            .nth(1)
            .ok_or_else(|| Error::Http(format!("no status in '{}'", self.first_line)))?;

        token
            .parse()
            .map_err(|_| Error::Http(format!("invalid status code '{}'", token)))
    }

    /// Request method (first token)
    pub fn method(&self) -> Option<&str> {
        self.first_line.split(' ').find(|t| !t.is_empty())
    }

    /// Request target (second token)
    pub fn path(&self) -> Option<&str> {
        self.first_line.split(' ').filter(|t| !t.is_empty()).nth(1)
    }

    /// Case-insensitive lookup of the first matching header
    pub fn value(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Leading decimal integer of a header value
    pub fn value_int(&self, key: &str) -> Option<i64> {
        let value = self.value(key)?.trim();
        let end = value
            .char_indices()
            .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
            .map_or(value.len(), |(i, _)| i);
        value[..end].parse().ok()
    }
}

/// Read a header block one byte at a time until CRLFCRLF
///
/// Fails on timeout, on EOF before the terminator, or when `max` bytes
/// arrive without one.
pub fn read_header<T: Transport + ?Sized>(transport: &mut T, max: usize, timeout: Duration) -> Result<HttpHeader> {
    let deadline = Instant::now() + timeout;
    let mut buf = ByteBuffer::with_limit(max);
    let mut byte = [0u8; 1];

    while !buf.ends_with(TERMINATOR) {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(Error::Timeout)?;
        transport.read_exact(&mut byte, remaining)?;
        buf.push(byte[0]).map_err(|_| Error::HeaderTooLarge(max))?;
    }

    Ok(HttpHeader::parse(&String::from_utf8_lossy(buf.as_slice())))
}

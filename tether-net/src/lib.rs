// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! Tether Network Library
//!
//! This crate provides the secure transport and protocol layer used by applications that
//! need blocking HTTP, WebSocket and peer-to-peer TLS/DTLS traffic without an async runtime.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `pool`: fixed-capacity task pool with a poll-based completion protocol
//! - `transport`: byte-stream transport trait plus TCP and in-memory implementations
//! - `tls`: incremental TLS/DTLS handshake engine over pluggable crypto providers
//! - `http`: HTTP/1.1 header codec, URL helpers, proxy tunneling and blocking requests
//! - `net`: connection establishment (DNS, TCP, proxy CONNECT, TLS)
//! - `ws`: WebSocket client and server
//! - `async_http`: fire-and-forget HTTP requests dispatched onto the task pool
//! - `runtime`: the context object owning all process-wide state
//! - `image`: collaborator interface for decoding image responses
//! - `metrics`: request, handshake and frame counters
//! - `error`: Unified error types
//!
//! # Design Principles
//!
//! 1. **Transport agnostic**: protocol engines push bytes in and pull bytes out
//! 2. **No hidden globals**: shared state lives in [`NetworkRuntime`]
//! 3. **Timeouts everywhere**: every blocking call takes a deadline
//! 4. **Testability**: every layer runs over in-memory pipes

pub mod async_http;
pub mod buffer;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod image;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod runtime;
pub mod tls;
pub mod transport;
pub mod ws;

pub use error::{Error, Result};
pub use async_http::{AsyncHttp, AsyncPoll};
pub use http::{HttpRequest, HttpResponse};
pub use pool::{TaskId, TaskPool, TaskPoll};
pub use runtime::NetworkRuntime;
pub use transport::{PollStatus, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of an HTTP header block (16 KiB)
pub const MAX_HEADER_SIZE: usize = 16 * 1024;

/// Default cap on a buffered HTTP response body (128 MiB)
pub const MAX_RESPONSE_SIZE: usize = 128 * 1024 * 1024;

/// Default HTTP port
pub const HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const HTTPS_PORT: u16 = 443;

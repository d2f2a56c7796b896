//! Byte-stream transports
//!
//! Every protocol engine in this crate talks to the network through
//! [`Transport`], so the same HTTP, WebSocket and TLS code runs over a TCP
//! socket, a TLS stream layered on TCP, or an in-memory pipe in tests.

pub mod memory;
pub mod tcp;

use crate::{Error, Result};
use std::time::{Duration, Instant};

pub use memory::{pipe, MemoryTransport};
pub use tcp::TcpTransport;

/// Readiness reported by [`Transport::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// A read will not block (data or EOF is pending)
    Ready,
    /// Nothing arrived within the timeout
    Pending,
}

pub trait Transport: Send {
    /// Read whatever is available, up to `buf.len()` bytes
    ///
    /// Returns `Ok(0)` on orderly EOF and [`Error::Timeout`] if nothing
    /// arrived within `timeout`.
    fn read_partial(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write the entire buffer
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for readable data
    fn poll(&mut self, timeout: Duration) -> Result<PollStatus>;

    /// Fill `buf` completely within `timeout`, failing with [`Error::Closed`] on EOF
    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Error::Timeout)?;

            match self.read_partial(&mut buf[filled..], remaining)? {
                0 => return Err(Error::Closed),
                n => filled += n,
            }
        }

        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn read_partial(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read_partial(buf, timeout)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write_all(buf)
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        (**self).poll(timeout)
    }

    fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        (**self).read_exact(buf, timeout)
    }
}

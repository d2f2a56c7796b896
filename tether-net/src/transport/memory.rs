//! In-process duplex byte pipe
//!
//! Both ends are [`Transport`]s. Writes are delivered as whole chunks over a
//! crossbeam channel, and reads drain the current chunk before taking the next.
//! Dropping one end makes the other observe EOF.

use super::{PollStatus, Transport};
use crate::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

pub struct MemoryTransport {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    offset: usize,
    eof: bool,
}

/// Create a connected pair of in-memory transports
pub fn pipe() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = channel::unbounded();
    let (b_tx, a_rx) = channel::unbounded();
    (MemoryTransport::new(a_tx, a_rx), MemoryTransport::new(b_tx, b_rx))
}

impl MemoryTransport {
    fn new(tx: Sender<Vec<u8>>, rx: Receiver<Vec<u8>>) -> Self {
        Self {
            tx,
            rx,
            pending: Vec::new(),
            offset: 0,
            eof: false,
        }
    }

    fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }

    /// Wait for the next chunk; `Ok(false)` means the timeout expired
    fn fill(&mut self, timeout: Duration) -> Result<bool> {
        if self.has_pending() || self.eof {
            return Ok(true);
        }

        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.pending = chunk;
                self.offset = 0;
                Ok(true)
            }
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                self.eof = true;
                Ok(true)
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn read_partial(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        // Empty writes arrive as empty chunks; skip them
        loop {
            if !self.fill(timeout)? {
                return Err(Error::Timeout);
            }
            if self.has_pending() || self.eof {
                break;
            }
        }

        if !self.has_pending() {
            return Ok(0);
        }

        let available = &self.pending[self.offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.tx.send(buf.to_vec()).map_err(|_| Error::Closed)
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollStatus> {
        if self.fill(timeout)? {
            Ok(PollStatus::Ready)
        } else {
            Ok(PollStatus::Pending)
        }
    }
}

// SPDX-License-Identifier: MIT
//
// Tether: Secure Network Transport and Protocol Layer
// Copyright (c) 2025 Tether Contributors
//
// https://github.com/yourusername/tether

//! RFC 6455 framing
//!
//! # Frame layout
//!
//! ```text
//! [FIN|RSV|opcode:1][MASK|len7:1][len16:2 | len64:8]?[mask key:4]?[payload]
//! ```
//!
//! `len7` of 126 selects the 16-bit extended length, 127 the 64-bit one.
//! Both are big-endian.

use crate::crypto::{encode_base64, sha1};
use crate::transport::Transport;
use crate::{Error, Result};
use std::time::{Duration, Instant};

/// Appended to the client key before hashing
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest possible frame header (2 + 8 + 4)
pub const MAX_HEADER_LEN: usize = 14;

const FIN: u8 = 0x80;
const MASK: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => Opcode::Continuation,
            0x1 => Opcode::Text,
            0x2 => Opcode::Binary,
            0x8 => Opcode::Close,
            0x9 => Opcode::Ping,
            0xA => Opcode::Pong,
            other => Opcode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(v) => v & 0x0F,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

/// One decoded frame, payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

/// XOR `data` in place with the repeating 4-byte key
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Append one final frame to `out`, masked when `mask` is given
pub fn encode_frame(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
    out.reserve(MAX_HEADER_LEN + payload.len());
    out.push(FIN | opcode.as_u8());

    let mask_bit = if mask.is_some() { MASK } else { 0 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    let start = match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            out.len()
        }
        None => out.len(),
    };
    out.extend_from_slice(payload);
    if let Some(key) = mask {
        apply_mask(&mut out[start..], key);
    }
}

/// Header fields needed before the payload can be read
struct FrameHead {
    fin: bool,
    opcode: Opcode,
    mask: Option<[u8; 4]>,
    payload_len: usize,
    header_len: usize,
}

/// Parse a header from `buf`; `None` if more bytes are needed
fn parse_head(buf: &[u8], max: usize) -> Result<Option<FrameHead>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN != 0;
    let opcode = Opcode::from_u8(buf[0]);
    let masked = buf[1] & MASK != 0;

    let (len, mut pos) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        n => (u64::from(n), 2),
    };

    if len > max as u64 {
        return Err(Error::WebSocket(format!("frame of {} bytes exceeds limit of {}", len, max)));
    }

    let mask = if masked {
        if buf.len() < pos + 4 {
            return Ok(None);
        }
        let key = [buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHead {
        fin,
        opcode,
        mask,
        payload_len: len as usize,
        header_len: pos,
    }))
}

/// Decode one frame from the front of `buf`
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// `buf` holds only part of a frame. Payloads over `max` are an error.
pub fn decode_frame(buf: &[u8], max: usize) -> Result<Option<(Frame, usize)>> {
    let Some(head) = parse_head(buf, max)? else {
        return Ok(None);
    };

    let total = head.header_len + head.payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut payload = buf[head.header_len..total].to_vec();
    if let Some(key) = head.mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some((
        Frame {
            fin: head.fin,
            opcode: head.opcode,
            payload,
        },
        total,
    )))
}

/// Read exactly one frame from `transport` within `timeout`
///
/// `Ok(None)` means nothing arrived before the timeout; a frame that has
/// started arriving is read to completion under the same deadline.
pub fn read_frame<T: Transport + ?Sized>(transport: &mut T, max: usize, timeout: Duration) -> Result<Option<Frame>> {
    let deadline = Instant::now() + timeout;
    let mut header = [0u8; MAX_HEADER_LEN];

    match transport.read_partial(&mut header[..1], timeout) {
        Ok(0) => return Err(Error::Closed),
        Ok(_) => {}
        Err(Error::Timeout) => return Ok(None),
        Err(e) => return Err(e),
    }
    transport.read_exact(&mut header[1..2], remaining(deadline)?)?;

    let extra = match header[1] & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    } + if header[1] & MASK != 0 { 4 } else { 0 };
    let header_len = 2 + extra;
    transport.read_exact(&mut header[2..header_len], remaining(deadline)?)?;

    let head = parse_head(&header[..header_len], max)?
        .ok_or_else(|| Error::WebSocket("truncated frame header".to_string()))?;

    let mut payload = vec![0u8; head.payload_len];
    transport.read_exact(&mut payload, remaining(deadline)?)?;
    if let Some(key) = head.mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin: head.fin,
        opcode: head.opcode,
        payload,
    }))
}

/// `Sec-WebSocket-Accept` for a given `Sec-WebSocket-Key`
pub fn create_accept_key(key: &str) -> String {
    let mut input = String::with_capacity(key.len() + GUID.len());
    input.push_str(key);
    input.push_str(GUID);
    encode_base64(&sha1(input.as_bytes()))
}

fn remaining(deadline: Instant) -> Result<Duration> {
    deadline
        .checked_duration_since(Instant::now())
        .ok_or(Error::Timeout)
}

//! Low-level frame primitives shared by all three planes.
//!
//! Every frame on every plane is `uint16 length` (little-endian, inclusive
//! of the length field itself), `uint8 type`, then type-specific payload.
//! Strings are null-terminated, integers are little-endian, `bytes(n)` is a
//! fixed-width field. This module only knows about that shape; it has no
//! idea what a REGISTER or a STUN_RESULT is.

use crate::error::DecodeError;
use bytes::{BufMut, BytesMut};

/// A cursor over a single, already-length-delimited frame body (the bytes
/// after the `type` byte).
pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    /// Fails unless every byte of the frame has been consumed.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.data.len()))
        }
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        if self.data.is_empty() {
            return Err(DecodeError::Truncated);
        }
        let v = self.data[0];
        self.data = &self.data[1..];
        Ok(v)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        if self.data.len() < 2 {
            return Err(DecodeError::Truncated);
        }
        let v = u16::from_le_bytes([self.data[0], self.data[1]]);
        self.data = &self.data[2..];
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        if self.data.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let v = u32::from_le_bytes(self.data[0..4].try_into().unwrap());
        self.data = &self.data[4..];
        Ok(v)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() < n {
            return Err(DecodeError::Truncated);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    /// Reads a null-terminated, UTF-8 string.
    pub fn string(&mut self) -> Result<String, DecodeError> {
        let end = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::InvalidString)?;
        let s = std::str::from_utf8(&self.data[..end]).map_err(|_| DecodeError::InvalidString)?;
        let s = s.to_string();
        self.data = &self.data[end + 1..];
        Ok(s)
    }
}

/// Accumulates a single frame's payload (type byte + fields) and then
/// prefixes it with the 2-byte inclusive length when `finish` is called.
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    /// Starts a new frame with the given type byte.
    pub fn new(packet_type: u8) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        // Placeholder for the length field, backpatched in `finish`.
        buf.put_u16_le(0);
        buf.put_u8(packet_type);
        Self { buf }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16_le(v);
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.put_slice(v);
        self
    }

    pub fn string(&mut self, v: &str) -> &mut Self {
        self.buf.put_slice(v.as_bytes());
        self.buf.put_u8(0);
        self
    }

    /// Backpatches the length prefix and returns the finished frame.
    pub fn finish(mut self) -> BytesMut {
        let len = self.buf.len() as u16;
        self.buf[0..2].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

/// Splits complete, length-prefixed frames off the front of `buf`, leaving
/// any partial trailing frame in place for the next read.
///
/// Returns the bodies (type byte onward, length prefix stripped) of every
/// complete frame found.
pub fn split_frames(buf: &mut BytesMut) -> Vec<BytesMut> {
    let mut frames = Vec::new();

    loop {
        if buf.len() < 2 {
            break;
        }

        let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
        if len < 2 || buf.len() < len {
            break;
        }

        let frame = buf.split_to(len);
        frames.push(frame.split_off(2));
    }

    frames
}

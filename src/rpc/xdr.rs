//! XDR primitive encoding and decoding (RFC 4506).
//!
//! Only the handful of primitives the NFSv3 and MOUNT3 programs need:
//! big-endian 32/64-bit integers, booleans, and opaque byte strings with
//! 4-byte padding.

use thiserror::Error;

/// Error raised while decoding a wire message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The buffer ended before the field could be read.
    #[error("truncated message: needed {need} more bytes, had {have}")]
    Truncated {
        /// Bytes the field required.
        need: usize,
        /// Bytes left in the buffer.
        have: usize,
    },

    /// A union discriminant or enum value outside the defined set.
    #[error("invalid discriminant {0}")]
    BadDiscriminant(u32),

    /// An opaque field longer than the protocol allows.
    #[error("opaque field of {len} bytes exceeds limit {limit}")]
    OpaqueTooLong {
        /// Declared length.
        len: usize,
        /// Protocol limit.
        limit: usize,
    },
}

fn pad_len(len: usize) -> usize {
    (4 - len % 4) % 4
}

/// Append-only XDR encoder.
#[derive(Default)]
pub struct XdrEncoder {
    buf: Vec<u8>,
}

impl XdrEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u32(u32::from(v));
    }

    /// Variable-length opaque: length prefix, bytes, zero padding to 4.
    pub fn put_opaque(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self.buf.extend(std::iter::repeat_n(0u8, pad_len(bytes.len())));
    }

    /// Fixed-length opaque: bytes with zero padding, no length prefix.
    pub fn put_opaque_fixed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.buf.extend(std::iter::repeat_n(0u8, pad_len(bytes.len())));
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_opaque(s.as_bytes());
    }
}

/// Cursor-style XDR decoder over a borrowed buffer.
pub struct XdrDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < n {
            return Err(WireError::Truncated {
                need: n,
                have: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        let hi = u64::from(self.get_u32()?);
        let lo = u64::from(self.get_u32()?);
        Ok(hi << 32 | lo)
    }

    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            d => Err(WireError::BadDiscriminant(d)),
        }
    }

    /// Variable-length opaque bounded by `limit`.
    pub fn get_opaque(&mut self, limit: usize) -> Result<Vec<u8>, WireError> {
        let len = self.get_u32()? as usize;
        if len > limit {
            return Err(WireError::OpaqueTooLong { len, limit });
        }
        let bytes = self.take(len)?.to_vec();
        self.take(pad_len(len))?;
        Ok(bytes)
    }

    /// Fixed-length opaque (no length prefix on the wire).
    pub fn get_opaque_fixed(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let bytes = self.take(len)?;
        self.take(pad_len(len))?;
        Ok(bytes)
    }

    /// Skip a variable-length opaque without copying it.
    pub fn skip_opaque(&mut self) -> Result<(), WireError> {
        let len = self.get_u32()? as usize;
        self.take(len)?;
        self.take(pad_len(len))?;
        Ok(())
    }
}

//! Fixed-width big-endian codecs for the storage rows.
//!
//! Every persisted scalar is a 32-byte big-endian word; keys sort
//! lexicographically in numeric order as a consequence. Rows are plain
//! concatenations of words followed by an optional variable-length tail.

use bytes::Bytes;
use ethereum_types::{H256, U256};

/// Width of a serialized scalar.
pub const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of input at offset {offset} (wanted {wanted} more bytes)")]
    UnexpectedEnd { offset: usize, wanted: usize },

    #[error("invalid discriminator byte {0:#04x}")]
    InvalidDiscriminator(u8),

    #[error("trailing bytes after row")]
    TrailingBytes,
}

/// Serializes a scalar as a 32-byte big-endian word.
pub fn u256_bytes(value: U256) -> [u8; WORD] {
    value.to_big_endian()
}

pub fn append_u256(out: &mut Vec<u8>, value: U256) {
    out.extend_from_slice(&value.to_big_endian());
}

pub fn append_h256(out: &mut Vec<u8>, value: H256) {
    out.extend_from_slice(value.as_bytes());
}

pub fn append_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_be_bytes());
}

/// Sequential reader over a serialized row.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() - self.pos < len {
            return Err(WireError::UnexpectedEnd {
                offset: self.pos,
                wanted: len - (self.buf.len() - self.pos),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u256(&mut self) -> Result<U256, WireError> {
        Ok(U256::from_big_endian(self.take(WORD)?))
    }

    pub fn read_h256(&mut self) -> Result<H256, WireError> {
        Ok(H256::from_slice(self.take(WORD)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(size_of::<u64>())?;
        let mut word = [0u8; size_of::<u64>()];
        word.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(word))
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        self.take(len)
    }

    /// Consumes the rest of the row as a variable-length tail.
    pub fn read_tail(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(&self.buf[self.pos..]);
        self.pos = self.buf.len();
        out
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails unless the whole row was consumed.
    pub fn finish(self) -> Result<(), WireError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_round_trip() {
        let value = U256::from(0xdead_beefu64);
        let mut out = Vec::new();
        append_u256(&mut out, value);
        assert_eq!(out.len(), WORD);
        let mut reader = WireReader::new(&out);
        assert_eq!(reader.read_u256().unwrap(), value);
        assert!(reader.is_empty());
    }

    #[test]
    fn big_endian_keys_sort_numerically() {
        let low = u256_bytes(U256::from(255u64));
        let high = u256_bytes(U256::from(256u64));
        assert!(low < high);
    }

    #[test]
    fn short_input_is_reported() {
        let buf = [0u8; 16];
        let mut reader = WireReader::new(&buf);
        assert!(matches!(
            reader.read_u256(),
            Err(WireError::UnexpectedEnd { .. })
        ));
    }

    #[test]
    fn tail_consumes_remainder() {
        let mut out = Vec::new();
        append_u256(&mut out, U256::one());
        out.extend_from_slice(b"payload");
        let mut reader = WireReader::new(&out);
        reader.read_u256().unwrap();
        assert_eq!(reader.read_tail().as_ref(), b"payload");
        reader.finish().unwrap();
    }
}

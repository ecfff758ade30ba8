//! Little-endian wire framing.
//!
//! Every integer in the persisted and transmitted formats is unsigned,
//! fixed-width, little-endian. Optional fields are length-prefixed
//! blocks: a u16 length followed by that many bytes, with a zero length
//! meaning absent.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unexpected end of input: wanted {wanted} bytes, {have} left")]
    UnexpectedEof { wanted: usize, have: usize },

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Cursor over a byte slice.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                wanted: n,
                have: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        let mut buf = [0u8; 2];
        buf.copy_from_slice(bytes);
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    /// Everything left in the input.
    pub fn read_remaining(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos..];
        self.pos = self.data.len();
        out
    }

    /// A u16-length-prefixed block; zero length reads as `None`.
    pub fn read_block(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.read_u16()? as usize;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(self.read_vec(len)?))
    }

    /// A u16-length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

/// Growable output buffer with the matching primitives.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// A u16-length-prefixed block; `None` writes a zero length.
    /// Every block in this format is structurally far below the u16 limit.
    pub fn put_block(&mut self, block: Option<&[u8]>) {
        match block {
            Some(bytes) => {
                debug_assert!(bytes.len() <= u16::MAX as usize);
                self.put_u16(bytes.len() as u16);
                self.put_bytes(bytes);
            }
            None => self.put_u16(0),
        }
    }

    /// A u16-length-prefixed UTF-8 string.
    pub fn put_string(&mut self, s: &str) {
        self.put_block(Some(s.as_bytes()));
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut w = ByteWriter::new();
        w.put_u16(0xBEEF);
        w.put_u64(0x0123_4567_89AB_CDEF);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 10);
        // little-endian on the wire
        assert_eq!(&bytes[..2], &[0xEF, 0xBE]);

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_u16().unwrap(), 0xBEEF);
        assert_eq!(r.read_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn eof_reports_sizes() {
        let mut r = ByteReader::new(&[1, 2, 3]);
        let err = r.read_u64().unwrap_err();
        assert_eq!(err, CodecError::UnexpectedEof { wanted: 8, have: 3 });
    }

    #[test]
    fn block_roundtrip() {
        let mut w = ByteWriter::new();
        w.put_block(Some(b"hello"));
        w.put_block(None);
        w.put_block(Some(b""));
        let bytes = w.into_bytes();

        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_block().unwrap().as_deref(), Some(&b"hello"[..]));
        assert_eq!(r.read_block().unwrap(), None);
        // an empty block is indistinguishable from an absent one
        assert_eq!(r.read_block().unwrap(), None);
    }

    #[test]
    fn string_roundtrip() {
        let mut w = ByteWriter::new();
        w.put_string("TestUser");
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_string().unwrap(), "TestUser");
    }

    #[test]
    fn string_rejects_bad_utf8() {
        let mut w = ByteWriter::new();
        w.put_block(Some(&[0xFF, 0xFE]));
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes);
        assert_eq!(r.read_string().unwrap_err(), CodecError::InvalidUtf8);
    }

    #[test]
    fn read_remaining_consumes_tail() {
        let mut r = ByteReader::new(&[1, 2, 3, 4]);
        r.read_u16().unwrap();
        assert_eq!(r.read_remaining(), &[3, 4]);
        assert_eq!(r.remaining(), 0);
    }
}

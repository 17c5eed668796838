use std::fmt::Write;

use binrw::BinResult;

use crate::error::{Error, Result};

const PREVIEW_BYTES: usize = 5;

/// A fixed-size little-endian record that can be decoded from exactly
/// `SIZE` bytes.
pub trait Record: Sized {
    const SIZE: usize;

    fn parse(bytes: &[u8]) -> BinResult<Self>;
}

/// Bounds-checked sequential reader over an immutable byte span.
///
/// Offsets in diagnostics are reported relative to the start of the whole
/// parse: a reader created with [`Reader::sub_reader`] carries the absolute
/// offset of its first byte.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::with_base(bytes, 0)
    }

    pub fn with_base(bytes: &'a [u8], base: usize) -> Self {
        Self { bytes, pos: 0, base }
    }

    /// Absolute offset of the next byte to be read.
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    /// Offset of the next byte to be read, relative to this reader's span.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::TruncatedInput {
                offset: self.offset(),
                needed: n,
                available: self.remaining(),
            });
        }

        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Read `literal.len()` bytes and check they match `literal`. The cursor
    /// does not move on failure.
    pub fn expect(&mut self, literal: &[u8]) -> Result<()> {
        let offset = self.offset();
        let mut probe = self.clone();
        let actual = probe.read(literal.len())?;

        if actual != literal {
            return Err(Error::MagicMismatch {
                offset,
                expected: bytes_description(literal),
                actual: bytes_description(actual),
            });
        }

        self.pos = probe.pos;
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.read(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn read_record<R: Record>(&mut self) -> Result<R> {
        let bytes = self.read(R::SIZE)?;
        Ok(R::parse(bytes)?)
    }

    /// Split off the next `n` bytes as an independent reader.
    pub fn sub_reader(&mut self, n: usize) -> Result<Reader<'a>> {
        let base = self.offset();
        let bytes = self.read(n)?;
        Ok(Reader::with_base(bytes, base))
    }
}

/// Short hex preview of a byte string: the first five bytes, then `...` and
/// the last byte when there are more.
pub fn bytes_description(bytes: &[u8]) -> String {
    let head = &bytes[..bytes.len().min(PREVIEW_BYTES)];
    let mut out = head
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");

    if bytes.len() > PREVIEW_BYTES {
        // Writing to a String cannot fail.
        let _ = write!(out, "...{:02x}", bytes[bytes.len() - 1]);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_advances() {
        let data = [1u8, 2, 3, 4, 5, 6];
        let mut r = Reader::new(&data);
        assert_eq!(r.read(2).unwrap(), &[1, 2]);
        assert_eq!(r.offset(), 2);
        assert_eq!(r.read_u32().unwrap(), 0x06050403);
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_read_reports_offset() {
        let data = [0u8; 10];
        let mut r = Reader::with_base(&data, 0x20);
        r.read(4).unwrap();
        match r.read(100).unwrap_err() {
            Error::TruncatedInput {
                offset,
                needed,
                available,
            } => {
                assert_eq!(offset, 0x24);
                assert_eq!(needed, 100);
                assert_eq!(available, 6);
            }
            e => panic!("unexpected error {:?}", e),
        }
        // A failed read consumes nothing.
        assert_eq!(r.remaining(), 6);
    }

    #[test]
    fn expect_mismatch() {
        let data = b"VMWNVRAX";
        let mut r = Reader::with_base(data, 16);
        let err = r.expect(b"VMWNVRAM").unwrap_err();
        match err {
            Error::MagicMismatch {
                offset,
                ref expected,
                ref actual,
            } => {
                assert_eq!(offset, 16);
                assert_eq!(expected, "56 4d 57 4e 56...4d");
                assert_eq!(actual, "56 4d 57 4e 56...58");
            }
            ref e => panic!("unexpected error {:?}", e),
        }
        assert_eq!(err.offset(), Some(16));
        assert_eq!(r.position(), 0);
    }

    #[test]
    fn expect_match() {
        let mut r = Reader::new(b"MRVN\x01\x00\x00\x00");
        r.expect(b"MRVN").unwrap();
        assert_eq!(r.read_u32().unwrap(), 1);
    }

    #[test]
    fn sub_reader_offsets() {
        let data = [0u8; 32];
        let mut r = Reader::new(&data);
        r.read(12).unwrap();
        let mut sub = r.sub_reader(8).unwrap();
        assert_eq!(r.offset(), 20);
        assert_eq!(sub.offset(), 12);
        let err = sub.read(9).unwrap_err();
        assert_eq!(err.offset(), Some(12));
    }

    #[test]
    fn description() {
        assert_eq!(bytes_description(&[]), "");
        assert_eq!(bytes_description(&[0xaa, 0xbb]), "aa bb");
        assert_eq!(bytes_description(&[0, 1, 2, 3, 4]), "00 01 02 03 04");
        assert_eq!(bytes_description(&[0, 1, 2, 3, 4, 5, 0xff]), "00 01 02 03 04...ff");
    }
}

use crate::error::{BinaryError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Checks that the reader has enough remaining bytes before a read.
macro_rules! check_remaining {
    ($buf:expr, $len:expr) => {
        let needed = $len;
        let remaining = $buf.buffer.remaining();
        if remaining < needed {
            return Err(BinaryError::UnexpectedEof { needed, remaining });
        }
    };
}

/// Cursor over an immutable byte buffer. All multi-byte reads are network
/// byte order (big-endian).
#[derive(Debug, Clone)]
pub struct BinaryReader {
    buffer: Bytes,
}

impl BinaryReader {
    pub fn new(buffer: Bytes) -> Self {
        Self { buffer }
    }

    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buffer.has_remaining()
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        check_remaining!(self, 1);
        Ok(self.buffer.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        check_remaining!(self, 2);
        Ok(self.buffer.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        check_remaining!(self, 4);
        Ok(self.buffer.get_u32())
    }

    /// Reads a fixed-length run of bytes without copying when possible.
    pub fn read_bytes(&mut self, len: usize) -> Result<Bytes> {
        check_remaining!(self, len);
        Ok(self.buffer.copy_to_bytes(len))
    }

    /// Consumes and returns whatever is left in the buffer.
    pub fn read_remaining(&mut self) -> Bytes {
        self.buffer.copy_to_bytes(self.buffer.remaining())
    }
}

/// Growable output buffer. All multi-byte writes are network byte order.
#[derive(Debug, Clone, Default)]
pub struct BinaryWriter {
    buffer: BytesMut,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.put_slice(bytes);
    }

    /// Finalizes the buffer into an immutable `Bytes`.
    pub fn freeze(self) -> Bytes {
        self.buffer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_integers() {
        let mut writer = BinaryWriter::new();
        writer.write_u8(0xAB);
        writer.write_u16(0x1234);
        writer.write_u32(0xDEAD_BEEF);

        let mut reader = BinaryReader::new(writer.freeze());
        assert_eq!(reader.read_u8().unwrap(), 0xAB);
        assert_eq!(reader.read_u16().unwrap(), 0x1234);
        assert_eq!(reader.read_u32().unwrap(), 0xDEAD_BEEF);
        assert!(reader.is_empty());
    }

    #[test]
    fn network_byte_order() {
        let mut writer = BinaryWriter::new();
        writer.write_u16(0xABCD);
        let bytes = writer.freeze();
        assert_eq!(bytes.as_ref(), &[0xAB, 0xCD]);

        let mut writer = BinaryWriter::new();
        writer.write_u32(0x0102_0304);
        let bytes = writer.freeze();
        assert_eq!(bytes.as_ref(), &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn eof_reports_needed_and_remaining() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[0x01]));
        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert!(matches!(
            reader.read_u32(),
            Err(BinaryError::UnexpectedEof {
                needed: 4,
                remaining: 0
            })
        ));
    }

    #[test]
    fn eof_does_not_advance() {
        let mut reader = BinaryReader::new(Bytes::from_static(&[0x01, 0x02]));
        assert!(reader.read_u32().is_err());
        // Failed read left the cursor untouched.
        assert_eq!(reader.read_u16().unwrap(), 0x0102);
    }

    #[test]
    fn byte_runs() {
        let mut writer = BinaryWriter::new();
        writer.write_bytes(&[0xCA, 0xFE, 0xBA, 0xBE]);

        let mut reader = BinaryReader::new(writer.freeze());
        assert_eq!(reader.read_bytes(2).unwrap().as_ref(), &[0xCA, 0xFE]);
        assert_eq!(reader.read_remaining().as_ref(), &[0xBA, 0xBE]);
        assert!(reader.is_empty());
        assert!(reader.read_bytes(1).is_err());
    }
}

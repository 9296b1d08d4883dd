//! Polymorphic byte streams. The `Stream` trait is the seek/read/write/
//! flush surface shared by in-memory streams and sockets; the primitive
//! extension traits layer endian-aware integer and floating point access
//! on top of any stream, honoring the stream's byte order state.

use crate::error::{Error, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ByteOrder {
    Big,
    Little,
}

/// Byte-oriented I/O with a position, a known size and a byte order.
/// Short reads at end of stream are legal; partial writes leave the
/// position reflecting the bytes actually written.
pub trait Stream: io::Read + io::Write {
    /// Moves the read/write position. Not every stream supports this;
    /// sockets report `Unsupported`.
    fn seek(&mut self, pos: u64) -> Result<u64>;

    fn pos(&self) -> u64;

    fn size(&self) -> u64;

    fn byte_order(&self) -> ByteOrder;

    fn set_byte_order(&mut self, order: ByteOrder);

    /// Ensures everything written so far has been handed to the
    /// underlying sink. Sockets block here until the output buffer has
    /// drained to the network.
    fn flush_stream(&mut self) -> Result<()> {
        self.flush()?;
        Ok(())
    }
}

macro_rules! read_primitive {
    ($name:ident, $ty:ty, $method:ident) => {
        fn $name(&mut self) -> Result<$ty> {
            Ok(match self.byte_order() {
                ByteOrder::Big => ReadBytesExt::$method::<BigEndian>(self)?,
                ByteOrder::Little => ReadBytesExt::$method::<LittleEndian>(self)?,
            })
        }
    };
}

macro_rules! write_primitive {
    ($name:ident, $ty:ty, $method:ident) => {
        fn $name(&mut self, value: $ty) -> Result<()> {
            match self.byte_order() {
                ByteOrder::Big => WriteBytesExt::$method::<BigEndian>(self, value)?,
                ByteOrder::Little => WriteBytesExt::$method::<LittleEndian>(self, value)?,
            }
            Ok(())
        }
    };
}

/// Endian-aware readers provided for every stream.
pub trait ReadPrimitives: Stream {
    fn read_u8(&mut self) -> Result<u8> {
        Ok(ReadBytesExt::read_u8(self)?)
    }

    fn read_i8(&mut self) -> Result<i8> {
        Ok(ReadBytesExt::read_i8(self)?)
    }

    read_primitive!(read_u16, u16, read_u16);
    read_primitive!(read_i16, i16, read_i16);
    read_primitive!(read_u32, u32, read_u32);
    read_primitive!(read_i32, i32, read_i32);
    read_primitive!(read_u64, u64, read_u64);
    read_primitive!(read_i64, i64, read_i64);
    read_primitive!(read_f64, f64, read_f64);

    /// Reads up to `count` bytes; a short result means end of stream.
    fn read_block(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; count];
        let mut filled = 0;
        while filled < count {
            match self.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Reads one line, splitting on LF or CRLF. The terminator is not
    /// included. Returns `None` at end of stream when no bytes remain.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(0) => {
                    if line.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    line.push(byte[0]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

impl<S: Stream + ?Sized> ReadPrimitives for S {}

/// Endian-aware writers provided for every stream.
pub trait WritePrimitives: Stream {
    fn write_u8(&mut self, value: u8) -> Result<()> {
        WriteBytesExt::write_u8(self, value)?;
        Ok(())
    }

    fn write_i8(&mut self, value: i8) -> Result<()> {
        WriteBytesExt::write_i8(self, value)?;
        Ok(())
    }

    write_primitive!(write_u16, u16, write_u16);
    write_primitive!(write_i16, i16, write_i16);
    write_primitive!(write_u32, u32, write_u32);
    write_primitive!(write_i32, i32, write_i32);
    write_primitive!(write_u64, u64, write_u64);
    write_primitive!(write_i64, i64, write_i64);
    write_primitive!(write_f64, f64, write_f64);

    fn write_block(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }
}

impl<S: Stream + ?Sized> WritePrimitives for S {}

/// Seekable in-memory stream. Writes overwrite at the current position and
/// extend the stream when they run past the end.
pub struct MemoryStream {
    data: Vec<u8>,
    pos: usize,
    order: ByteOrder,
}

impl MemoryStream {
    pub fn new() -> MemoryStream {
        MemoryStream {
            data: Vec::new(),
            pos: 0,
            order: ByteOrder::Big,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> MemoryStream {
        MemoryStream {
            data,
            pos: 0,
            order: ByteOrder::Big,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl io::Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.data.len() - self.pos;
        let count = remaining.min(buf.len());
        buf[..count].copy_from_slice(&self.data[self.pos..self.pos + count]);
        self.pos += count;
        Ok(count)
    }
}

impl io::Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let overlap = (self.data.len() - self.pos).min(buf.len());
        self.data[self.pos..self.pos + overlap].copy_from_slice(&buf[..overlap]);
        self.data.extend_from_slice(&buf[overlap..]);
        self.pos += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Stream for MemoryStream {
    fn seek(&mut self, pos: u64) -> Result<u64> {
        if pos > self.data.len() as u64 {
            return Err(Error::Io(io::ErrorKind::InvalidInput));
        }
        self.pos = pos as usize;
        Ok(pos)
    }

    fn pos(&self) -> u64 {
        self.pos as u64
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn byte_order(&self) -> ByteOrder {
        self.order
    }

    fn set_byte_order(&mut self, order: ByteOrder) {
        self.order = order;
    }
}

#[cfg(test)]
mod tests {
    use super::{ByteOrder, MemoryStream, ReadPrimitives, Stream, WritePrimitives};
    use std::io;

    #[test]
    fn test_primitive_roundtrip_big_endian() {
        let mut stream = MemoryStream::new();
        stream.write_u16(0xBEEF).unwrap();
        stream.write_u32(0xCAFE_F00D).unwrap();
        stream.write_u64(42).unwrap();
        stream.write_f64(0.5).unwrap();

        assert_eq!(stream.size(), 2 + 4 + 8 + 8);
        assert_eq!(&stream.data()[..2], &[0xBE, 0xEF]);

        stream.seek(0).unwrap();
        assert_eq!(stream.read_u16().unwrap(), 0xBEEF);
        assert_eq!(stream.read_u32().unwrap(), 0xCAFE_F00D);
        assert_eq!(stream.read_u64().unwrap(), 42);
        assert_eq!(stream.read_f64().unwrap(), 0.5);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut stream = MemoryStream::new();
        stream.set_byte_order(ByteOrder::Little);
        stream.write_u32(1).unwrap();
        assert_eq!(stream.data(), &[1, 0, 0, 0]);

        stream.seek(0).unwrap();
        assert_eq!(stream.read_u32().unwrap(), 1);
    }

    #[test]
    fn test_short_read_at_end_is_legal() {
        let mut stream = MemoryStream::from_vec(vec![1, 2, 3]);
        let block = stream.read_block(8).unwrap();
        assert_eq!(block, vec![1, 2, 3]);
        assert_eq!(stream.pos(), 3);
    }

    #[test]
    fn test_overwrite_in_the_middle() {
        let mut stream = MemoryStream::from_vec(b"abcdef".to_vec());
        stream.seek(2).unwrap();
        io::Write::write(&mut stream, b"XYZW").unwrap();
        assert_eq!(stream.data(), b"abXYZW");
        assert_eq!(stream.pos(), 6);
    }

    #[test]
    fn test_seek_past_end_fails() {
        let mut stream = MemoryStream::from_vec(vec![0; 4]);
        assert!(stream.seek(5).is_err());
        assert_eq!(stream.pos(), 0);
    }

    #[test]
    fn test_read_line_lf_and_crlf() {
        let mut stream = MemoryStream::from_vec(b"one\r\ntwo\nthree".to_vec());
        assert_eq!(stream.read_line().unwrap().unwrap(), "one");
        assert_eq!(stream.read_line().unwrap().unwrap(), "two");
        assert_eq!(stream.read_line().unwrap().unwrap(), "three");
        assert_eq!(stream.read_line().unwrap(), None);
    }
}

use std::io;

// Consumed space at the front is reclaimed once it crosses this mark and
// dominates the live data.
const COMPACT_THRESHOLD: usize = 4096;

const INGRESS_CHUNK: usize = 4096;

/// A dynamically sized FIFO byte queue. Data is appended at the tail and
/// read from the head; the head space is compacted lazily.
pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    #[inline]
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
        }
    }

    /// The number of bytes in the buffer.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// Returns true in case the buffer is empty, false otherwise.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.data.len()
    }

    /// Slice containing the buffered data.
    #[inline]
    pub fn read_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Append bytes at the tail.
    #[inline]
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Advance the head past `count` consumed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.len());
        self.head += count;
        if self.head >= COMPACT_THRESHOLD && self.head * 2 >= self.data.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    /// Move up to `out.len()` bytes from the head into `out`, returning the
    /// number of bytes moved.
    #[inline]
    pub fn consume_into(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len());
        out[..count].copy_from_slice(&self.read_slice()[..count]);
        self.consume(count);
        count
    }

    /// Take the entire contents, leaving the buffer empty.
    pub fn take_all(&mut self) -> Vec<u8> {
        let all = self.data.split_off(self.head);
        self.data.clear();
        self.head = 0;
        all
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Read from the supplied reader until end of stream or `WouldBlock`,
    /// appending everything to the tail. Returns the number of bytes read;
    /// `WouldBlock` is not an error, the data read so far is kept.
    pub fn ingress<R: io::Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut scratch = [0u8; INGRESS_CHUNK];
        let mut total = 0;
        loop {
            match reader.read(&mut scratch) {
                Ok(0) => return Ok(total),
                Ok(count) => {
                    self.append(&scratch[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write up to `limit` bytes from the head to the supplied writer,
    /// advancing the head past everything written. Stops early on
    /// `WouldBlock`; a zero-length write is reported as `WriteZero`.
    pub fn egress<W: io::Write>(&mut self, writer: &mut W, limit: usize) -> io::Result<usize> {
        let mut written = 0;
        while !self.is_empty() && written < limit {
            let chunk = self.len().min(limit - written);
            match writer.write(&self.read_slice()[..chunk]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    written += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }
}

impl io::Read for Buffer {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.consume_into(buf))
    }
}

impl io::Write for Buffer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    struct MockChannel {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        max_size: usize,
    }

    impl MockChannel {
        fn new(data: Vec<u8>, chunk: usize, max_size: usize) -> MockChannel {
            MockChannel {
                data,
                cursor: 0,
                chunk,
                max_size,
            }
        }
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let offset = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..offset].copy_from_slice(&self.data[self.cursor..(self.cursor + offset)]);
            self.cursor += offset;
            Ok(offset)
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() == self.max_size {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let count = min(min(self.chunk, buf.len()), self.max_size - self.data.len());
            self.data.extend(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_roundtrip() {
        let mock_data: Vec<_> = (0..10_000).map(|item| item as u8).collect();
        let mut channel = MockChannel::new(mock_data.clone(), 500, mock_data.len());

        let mut buffer = Buffer::new();
        let count = buffer.ingress(&mut channel).unwrap();

        assert_eq!(count, mock_data.len());
        assert_eq!(buffer.read_slice(), &mock_data[..]);

        let mut sink = MockChannel::new(Vec::new(), 500, mock_data.len());
        let count = buffer.egress(&mut sink, usize::MAX).unwrap();

        assert_eq!(count, mock_data.len());
        assert!(buffer.is_empty());
        assert_eq!(sink.data[..], mock_data[..]);
    }

    #[test]
    fn test_egress_respects_limit() {
        let mut buffer = Buffer::new();
        buffer.append(&[7u8; 1000]);

        let mut sink = MockChannel::new(Vec::new(), 100, 10_000);
        let count = buffer.egress(&mut sink, 250).unwrap();

        assert_eq!(count, 250);
        assert_eq!(buffer.len(), 750);
    }

    #[test]
    fn test_egress_stops_on_would_block() {
        let mut buffer = Buffer::new();
        buffer.append(&[1u8; 64]);

        let mut sink = MockChannel::new(Vec::new(), 16, 32);
        let count = buffer.egress(&mut sink, usize::MAX).unwrap();

        assert_eq!(count, 32);
        assert_eq!(buffer.len(), 32);
    }

    #[test]
    fn test_egress_error_on_zero_write() {
        struct ZeroSink;
        impl io::Write for ZeroSink {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut buffer = Buffer::new();
        buffer.append(&[1]);

        let result = buffer.egress(&mut ZeroSink, usize::MAX);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_consume_into_short_read() {
        let mut buffer = Buffer::new();
        buffer.append(b"abc");

        let mut out = [0u8; 8];
        assert_eq!(buffer.consume_into(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_all_resets() {
        let mut buffer = Buffer::new();
        buffer.append(b"hello");
        buffer.consume(2);

        assert_eq!(buffer.take_all(), b"llo");
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_compaction_preserves_content() {
        let mut buffer = Buffer::new();
        let payload: Vec<_> = (0..20_000).map(|i| (i % 251) as u8).collect();
        buffer.append(&payload);
        buffer.consume(15_000);
        buffer.append(b"tail");

        let mut expected = payload[15_000..].to_vec();
        expected.extend_from_slice(b"tail");
        assert_eq!(buffer.read_slice(), &expected[..]);
    }
}

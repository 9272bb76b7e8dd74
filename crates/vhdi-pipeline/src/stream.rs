//! Byte source over a caller-supplied stream

use std::io::{self, Read, Seek, SeekFrom};
use vhdi_core::ByteSource;

/// Adapts any `Read + Seek` stream into a [`ByteSource`]
///
/// The stream length is taken by seeking to its end once, at construction.
pub struct StreamSource<S> {
    inner: S,
    size: u64,
}

impl<S: Read + Seek + Send> StreamSource<S> {
    /// Wrap `inner`
    pub fn new(mut inner: S) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, size })
    }

    /// Unwrap and return the inner stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Seek + Send> ByteSource for StreamSource<S> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use vhdi_core::ReadSeek;

    #[test]
    fn test_stream_source_cursor() {
        let data: Vec<u8> = (0..100).collect();
        let mut source = StreamSource::new(Cursor::new(data)).unwrap();

        assert_eq!(source.size().unwrap(), 100);

        let mut buf = [0u8; 3];
        source.read_exact_at(10, &mut buf).unwrap();
        assert_eq!(buf, [10, 11, 12]);
        assert_eq!(source.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stream_source_boxed() {
        let boxed: Box<dyn ReadSeek> = Box::new(Cursor::new(vec![7u8; 32]));
        let mut source = StreamSource::new(boxed).unwrap();

        let mut buf = [0u8; 32];
        source.read_exact_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_stream_source_into_inner() {
        let source = StreamSource::new(Cursor::new(vec![1u8, 2, 3])).unwrap();
        let cursor = source.into_inner();
        assert_eq!(cursor.into_inner(), vec![1, 2, 3]);
    }
}

//! Core traits for image I/O

use std::io::{self, Read, Seek};

/// Random-access supplier of container bytes
///
/// Implemented by the file, memory-mapped and caller-supplied stream
/// providers in `vhdi-pipeline`. `read_at` may return fewer bytes than
/// requested once the source is exhausted.
pub trait ByteSource: Send {
    /// Read bytes starting at `offset` into `buf`, returning the count read
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Total length of the source in bytes
    fn size(&mut self) -> io::Result<u64>;

    /// Fill `buf` completely from `offset` or fail with `UnexpectedEof`
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let count = match self.read_at(offset + filled as u64, &mut buf[filled..]) {
                Ok(count) => count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if count == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "byte source truncated at offset {} ({} of {} bytes read)",
                        offset + filled as u64,
                        filled,
                        buf.len()
                    ),
                ));
            }
            filled += count;
        }
        Ok(())
    }
}

/// Combined trait for Read + Seek
pub trait ReadSeek: Read + Seek + Send {}

/// Blanket implementation for any type that implements Read + Seek
impl<T: Read + Seek + Send> ReadSeek for T {}

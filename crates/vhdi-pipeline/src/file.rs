//! File-backed byte source

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use vhdi_core::ByteSource;

/// Read-only byte source over an owned file handle
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Open `path` for reading
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file)
    }

    /// Wrap an already opened file
    pub fn from_file(file: File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        if metadata.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot read an image from a directory",
            ));
        }
        Ok(Self {
            size: metadata.len(),
            file,
        })
    }
}

impl ByteSource for FileSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(buf)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.size)
    }
}

//! Memory-mapped byte source for direct access

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;
use vhdi_core::{ByteSource, MAX_MMAP_SIZE};

/// A byte source backed by a read-only memory map of an image file.
///
/// Reads are plain slice copies, with no system call per read.
///
/// # Example
///
/// ```rust,no_run
/// use vhdi_pipeline::MmapSource;
/// use vhdi_core::ByteSource;
/// use std::path::Path;
///
/// let mut source = MmapSource::open(Path::new("disk.vhd")).unwrap();
/// let mut cookie = [0u8; 8];
/// source.read_at(0, &mut cookie).unwrap();
/// ```
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    /// Open a file with memory mapping
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped
    ///
    /// # Safety
    ///
    /// Uses `unsafe` for memory mapping because:
    /// - We validate the file is a regular file before mapping
    /// - The mapping is read-only
    /// - File must not be truncated during access (caller responsibility)
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file)
    }

    /// Create a memory-mapped source from an already opened file
    ///
    /// # Safety
    ///
    /// See `open()` for safety documentation
    pub fn from_file(file: &File) -> io::Result<Self> {
        let metadata = file.metadata()?;

        // Validate file is a regular file (not device, pipe, directory, etc.)
        if !metadata.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Only regular files can be memory-mapped",
            ));
        }

        if metadata.len() > MAX_MMAP_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "File size {} exceeds memory mapping limit {} (16 GiB)",
                    metadata.len(),
                    MAX_MMAP_SIZE
                ),
            ));
        }

        // SAFETY: the file is a regular file of bounded size and the map is
        // read-only; concurrent truncation by another process is the caller's
        // responsibility.
        let mmap = unsafe { Mmap::map(file)? };
        tracing::debug!("memory-mapped {} bytes", mmap.len());

        Ok(Self { mmap })
    }

    /// Get the length of the mapped region
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Check if the mapped region is empty
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Get a slice of the entire mapped data
    pub fn as_slice(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteSource for MmapSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.len() {
            return Ok(0);
        }

        let start = offset as usize;
        let to_read = buf.len().min(self.mmap.len() - start);
        buf[..to_read].copy_from_slice(&self.mmap[start..start + to_read]);

        Ok(to_read)
    }

    fn size(&mut self) -> io::Result<u64> {
        Ok(self.len())
    }
}

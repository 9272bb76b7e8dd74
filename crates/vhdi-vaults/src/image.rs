//! Random-access reader over one VHD or VHDX image
//!
//! An [`Image`] is created closed, becomes active on `open` and returns to the
//! closed state on `close`. Reads walk the block allocation map range by
//! range and defer unallocated ranges of a differencing image to its parent.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use vhdi_core::{
    AccessMode, ByteSource, DiskType, Error, FileType, ReadSeek, Result, Whence,
    MAX_PARENT_CHAIN_DEPTH, MAX_READ_SIZE,
};
use vhdi_pipeline::{FileSource, MmapSource, StreamSource};

use crate::bat::{BlockAllocationMap, RangeState};
use crate::chain::{self, ParentLink, SharedImage};
use crate::config::VaultConfig;
use crate::metadata::{FormatDetails, ImageMetadata};
use crate::signature::detect_file_type;
use crate::{vhd, vhdx};

/// Where the container bytes come from
enum ImageSource {
    /// Opened by the image from a path
    Owned(Box<dyn ByteSource>),
    /// Supplied by the caller, handed back by `close_stream`
    Stream(StreamSource<Box<dyn ReadSeek>>),
}

impl ImageSource {
    fn bytes(&mut self) -> &mut dyn ByteSource {
        match self {
            ImageSource::Owned(source) => &mut **source,
            ImageSource::Stream(source) => source,
        }
    }
}

/// State held while an image is open
struct OpenImage {
    source: ImageSource,
    metadata: ImageMetadata,
    map: BlockAllocationMap,
    cursor: i64,
    parent: Option<ParentLink>,
}

/// A VHD or VHDX image opened for random-access reading
///
/// # Example
///
/// ```rust,no_run
/// use vhdi_vaults::{Image, Whence};
/// use std::path::Path;
///
/// let mut image = Image::new();
/// image.open(Path::new("disk.vhdx")).unwrap();
///
/// println!("Size: {} bytes", image.media_size().unwrap());
/// image.seek(-512, Whence::End).unwrap();
/// let last_sector = image.read_buffer(Some(512)).unwrap();
/// assert_eq!(last_sector.len(), 512);
/// ```
#[derive(Default)]
pub struct Image {
    state: Option<OpenImage>,
}

impl Image {
    /// Create a closed image
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap this image so differencing images can link to it
    pub fn into_shared(self) -> SharedImage {
        Arc::new(Mutex::new(self))
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Open the image at `path` for reading
    pub fn open(&mut self, path: &Path) -> Result<()> {
        self.open_with_options(path, "r", &VaultConfig::default())
    }

    /// Open the image at `path` with an access mode such as `"r"`
    pub fn open_with_mode(&mut self, path: &Path, mode: &str) -> Result<()> {
        self.open_with_options(path, mode, &VaultConfig::default())
    }

    /// Open the image at `path`
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if the image is already open
    /// - `InvalidArgument` for an empty path or a mode other than read-only
    /// - `Io` if the file cannot be opened or read
    /// - a format error if the file is not a valid VHD or VHDX image
    pub fn open_with_options(&mut self, path: &Path, mode: &str, config: &VaultConfig) -> Result<()> {
        self.ensure_closed()?;
        AccessMode::parse(mode)?.require_read_only()?;
        if path.as_os_str().is_empty() {
            return Err(Error::invalid_argument("empty image path"));
        }

        let source: Box<dyn ByteSource> = if config.use_mmap {
            Box::new(MmapSource::open(path)?)
        } else {
            Box::new(FileSource::open(path)?)
        };

        tracing::debug!(
            "opening {} ({})",
            path.display(),
            if config.use_mmap { "memory-mapped" } else { "file" }
        );
        self.open_source(ImageSource::Owned(source))
    }

    /// Open an image from a caller-supplied stream
    ///
    /// The image holds the stream until it is closed; [`Image::close_stream`]
    /// hands it back to the caller.
    pub fn open_stream<S: Read + Seek + Send + 'static>(&mut self, stream: S) -> Result<()> {
        self.open_stream_with_mode(stream, "r")
    }

    /// Open an image from a caller-supplied stream with an access mode
    pub fn open_stream_with_mode<S: Read + Seek + Send + 'static>(
        &mut self,
        stream: S,
        mode: &str,
    ) -> Result<()> {
        self.ensure_closed()?;
        AccessMode::parse(mode)?.require_read_only()?;
        let stream: Box<dyn ReadSeek> = Box::new(stream);
        self.open_source(ImageSource::Stream(StreamSource::new(stream)?))
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.is_open() {
            return Err(Error::invalid_operation("image is already open"));
        }
        Ok(())
    }

    fn open_source(&mut self, mut source: ImageSource) -> Result<()> {
        let bytes = source.bytes();
        let decoded = match detect_file_type(bytes)? {
            Some(FileType::Vhd) => vhd::decode(bytes)?,
            Some(FileType::Vhdx) => vhdx::decode(bytes)?,
            None => return Err(Error::invalid_format("no VHD or VHDX signature found")),
        };

        if i64::try_from(decoded.metadata.media_size).is_err() {
            return Err(Error::invalid_format(format!(
                "media size {} exceeds the addressable range",
                decoded.metadata.media_size
            )));
        }

        tracing::debug!(
            "opened {} {} image of {} bytes",
            decoded.metadata.disk_type,
            decoded.metadata.file_type,
            decoded.metadata.media_size
        );

        self.state = Some(OpenImage {
            source,
            metadata: decoded.metadata,
            map: decoded.map,
            cursor: 0,
            parent: None,
        });
        Ok(())
    }

    /// Close the image, releasing its byte source and parent link
    pub fn close(&mut self) -> Result<()> {
        self.close_stream().map(drop)
    }

    /// Close the image and return the stream it was opened from
    ///
    /// Returns `None` when the image was opened from a path.
    pub fn close_stream(&mut self) -> Result<Option<Box<dyn ReadSeek>>> {
        let state = self.state.take().ok_or_else(Error::not_open)?;
        Ok(match state.source {
            ImageSource::Owned(_) => None,
            ImageSource::Stream(source) => Some(source.into_inner()),
        })
    }

    fn open_state(&self) -> Result<&OpenImage> {
        self.state.as_ref().ok_or_else(Error::not_open)
    }

    fn open_state_mut(&mut self) -> Result<&mut OpenImage> {
        self.state.as_mut().ok_or_else(Error::not_open)
    }

    /// Link the parent of this differencing image
    ///
    /// The parent must be open and its identifier must match the parent
    /// identifier recorded in this image.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if this image is not open, is not a differencing
    ///   image, already has a parent, or the parent is not open
    /// - `ParentMismatch` if the identifiers differ
    /// - `InvalidArgument` if the parent is locked, which is the case when it
    ///   is this image or its chain leads back to this image
    pub fn set_parent(&mut self, parent: &SharedImage) -> Result<()> {
        let state = self.open_state()?;
        if state.metadata.disk_type != DiskType::Differencing {
            return Err(Error::invalid_operation(format!(
                "{} image has no parent",
                state.metadata.disk_type
            )));
        }
        if state.parent.is_some() {
            return Err(Error::invalid_operation("parent image already set"));
        }
        let expected = state.metadata.parent_identifier;

        {
            let candidate = chain::try_lock_candidate(parent)?;
            let actual = candidate
                .identifier()
                .map_err(|_| Error::invalid_operation("parent image is not open"))?;

            if expected != Some(actual) {
                return Err(Error::ParentMismatch {
                    expected: expected.map(|id| id.to_string()).unwrap_or_default(),
                    actual: actual.to_string(),
                });
            }

            chain::check_candidate_chain(&candidate)?;
            tracing::debug!("linked parent image {}", actual);
        }

        self.open_state_mut()?.parent = Some(ParentLink::new(parent));
        Ok(())
    }

    pub(crate) fn parent_link(&self) -> Option<ParentLink> {
        self.state.as_ref().and_then(|state| state.parent.clone())
    }

    /// Whether a parent has been linked
    pub fn has_parent(&self) -> Result<bool> {
        Ok(self.open_state()?.parent.is_some())
    }

    /// Move the cursor
    ///
    /// The cursor may be placed past the end of the media. A negative
    /// result fails with `InvalidArgument` and leaves the cursor unchanged.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<i64> {
        let state = self.open_state_mut()?;

        let base = match whence {
            Whence::Set => 0,
            Whence::Current => state.cursor,
            Whence::End => state.metadata.media_size as i64,
        };
        let target = base.checked_add(offset).ok_or_else(|| {
            Error::invalid_argument(format!("seek offset {} from {} overflows", offset, base))
        })?;
        if target < 0 {
            return Err(Error::invalid_argument(format!(
                "seek to negative offset {}",
                target
            )));
        }

        state.cursor = target;
        Ok(target)
    }

    /// Current cursor position
    pub fn offset(&self) -> Result<i64> {
        Ok(self.open_state()?.cursor)
    }

    /// Read up to `size` bytes at the cursor and advance it
    ///
    /// `None` reads to the end of the media. The result is clipped to the
    /// media; at or past the end it is empty.
    pub fn read_buffer(&mut self, size: Option<i64>) -> Result<Vec<u8>> {
        let size = match size {
            Some(size) if size < 0 => {
                return Err(Error::invalid_argument(format!("negative read size {}", size)));
            }
            Some(size) => size as u64,
            None => u64::MAX,
        };

        let cursor = self.open_state()?.cursor;
        let data = self.read_vec(size, cursor as u64)?;
        self.open_state_mut()?.cursor = cursor + data.len() as i64;
        Ok(data)
    }

    /// Read up to `size` bytes at `offset` without moving the cursor
    pub fn read_buffer_at_offset(&mut self, size: i64, offset: i64) -> Result<Vec<u8>> {
        if size < 0 {
            return Err(Error::invalid_argument(format!("negative read size {}", size)));
        }
        if offset < 0 {
            return Err(Error::invalid_argument(format!("negative read offset {}", offset)));
        }
        self.open_state()?;
        self.read_vec(size as u64, offset as u64)
    }

    /// Read into `buf` at the cursor and advance it by the bytes read
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let cursor = self.open_state()?.cursor;
        let count = self.read_at_depth(buf, cursor as u64, 0)?;
        self.open_state_mut()?.cursor = cursor + count as i64;
        Ok(count)
    }

    /// Read into `buf` at `offset` without moving the cursor
    pub fn read_into_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.read_at_depth(buf, offset, 0)
    }

    fn read_vec(&mut self, size: u64, offset: u64) -> Result<Vec<u8>> {
        let media_size = self.open_state()?.metadata.media_size;
        let length = size.min(media_size.saturating_sub(offset));
        if length > MAX_READ_SIZE as u64 {
            return Err(Error::invalid_argument(format!(
                "read of {} bytes exceeds limit {}",
                length, MAX_READ_SIZE
            )));
        }

        let mut data = vec![0u8; length as usize];
        let count = self.read_at_depth(&mut data, offset, 0)?;
        data.truncate(count);
        Ok(data)
    }

    /// Resolve `buf.len()` bytes at `offset`, clipped to the media
    fn read_at_depth(&mut self, buf: &mut [u8], offset: u64, depth: usize) -> Result<usize> {
        let state = self.open_state_mut()?;
        let media_size = state.metadata.media_size;
        if offset >= media_size {
            return Ok(0);
        }

        let length = usize::try_from(media_size - offset)
            .map_or(buf.len(), |remaining| remaining.min(buf.len()));
        let mut done = 0;

        while done < length {
            let position = offset + done as u64;
            let range = state.map.lookup(state.source.bytes(), position)?;
            let count = usize::try_from(range.length)
                .map_or(length - done, |run| run.min(length - done));
            let chunk = &mut buf[done..done + count];

            match range.state {
                RangeState::Allocated => {
                    state.source.bytes().read_exact_at(range.file_offset, chunk)?
                }
                RangeState::Zero => chunk.fill(0),
                RangeState::Parent => {
                    read_from_parent(state.parent.as_ref(), chunk, position, depth)?
                }
            }
            done += count;
        }

        Ok(length)
    }

    /// Decoded metadata
    pub fn metadata(&self) -> Result<&ImageMetadata> {
        Ok(&self.open_state()?.metadata)
    }

    /// Format-specific metadata
    pub fn format_details(&self) -> Result<&FormatDetails> {
        Ok(&self.metadata()?.details)
    }

    pub fn media_size(&self) -> Result<u64> {
        Ok(self.metadata()?.media_size)
    }

    pub fn file_type(&self) -> Result<FileType> {
        Ok(self.metadata()?.file_type)
    }

    /// (major, minor) format version
    pub fn format_version(&self) -> Result<(u16, u16)> {
        Ok(self.metadata()?.format_version)
    }

    pub fn disk_type(&self) -> Result<DiskType> {
        Ok(self.metadata()?.disk_type)
    }

    pub fn bytes_per_sector(&self) -> Result<u32> {
        Ok(self.metadata()?.bytes_per_sector)
    }

    /// Block size; 0 for a fixed VHD
    pub fn block_size(&self) -> Result<u32> {
        Ok(self.metadata()?.block_size)
    }

    pub fn identifier(&self) -> Result<Uuid> {
        Ok(self.metadata()?.identifier)
    }

    /// Identifier of the parent image, for differencing images
    pub fn parent_identifier(&self) -> Result<Option<Uuid>> {
        Ok(self.metadata()?.parent_identifier)
    }

    /// Parent filename hint as stored in the image
    pub fn parent_filename(&self) -> Result<Option<&str>> {
        Ok(self.metadata()?.parent_filename.as_deref())
    }
}

fn read_from_parent(
    link: Option<&ParentLink>,
    buf: &mut [u8],
    offset: u64,
    depth: usize,
) -> Result<()> {
    let link = link.ok_or_else(|| {
        Error::invalid_operation(format!(
            "data at offset {} is stored in the parent image, which is not set",
            offset
        ))
    })?;
    if depth + 1 >= MAX_PARENT_CHAIN_DEPTH {
        return Err(Error::invalid_format(format!(
            "parent chain deeper than {} images",
            MAX_PARENT_CHAIN_DEPTH
        )));
    }

    link.with(|parent| {
        // A smaller parent reads as zeros past its end
        let count = parent.read_at_depth(buf, offset, depth + 1)?;
        buf[count..].fill(0);
        Ok(())
    })
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Some(state) => f
                .debug_struct("Image")
                .field("metadata", &state.metadata)
                .field("cursor", &state.cursor)
                .field("has_parent", &state.parent.is_some())
                .finish(),
            None => f.debug_struct("Image").field("open", &false).finish(),
        }
    }
}

impl Read for Image {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf)?)
    }
}

impl Seek for Image {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek offset out of range")
                })?;
                (offset, Whence::Set)
            }
            SeekFrom::Current(offset) => (offset, Whence::Current),
            SeekFrom::End(offset) => (offset, Whence::End),
        };
        let target = Image::seek(self, offset, whence)?;
        Ok(target as u64)
    }
}

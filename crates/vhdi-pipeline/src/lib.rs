//! # vhdi pipeline
//!
//! Byte-source providers the image readers decode from.
//!
//! - **FileSource**: positioned reads from an owned file handle
//! - **MmapSource**: memory-mapped file access
//! - **StreamSource**: adapter over any caller-supplied `Read + Seek` stream
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdi_pipeline::{FileSource, MmapSource};
//! use vhdi_core::ByteSource;
//! use std::path::Path;
//!
//! let mut file = FileSource::open(Path::new("disk.vhd")).unwrap();
//! let mut mmap = MmapSource::open(Path::new("disk.vhd")).unwrap();
//! assert_eq!(file.size().unwrap(), mmap.size().unwrap());
//! ```

pub mod file;
pub mod mmap;
pub mod stream;

pub use file::FileSource;
pub use mmap::MmapSource;
pub use stream::StreamSource;

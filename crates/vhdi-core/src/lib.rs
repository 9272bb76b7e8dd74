//! # vhdi core
//!
//! Core traits, types, and error handling for reading virtual hard disk
//! images.
//!
//! This crate provides the foundational abstractions shared by the image
//! crates:
//! - **ByteSource**: random-access supplier of container bytes
//! - **Error / ErrorKind**: the invalid-argument, invalid-operation, format
//!   and I/O error taxonomy
//! - **FileType / DiskType / Whence / AccessMode**: shared enums
//! - **security**: decoding limits and checked arithmetic
//!
//! ## Example
//!
//! ```rust
//! use vhdi_core::{Whence, ErrorKind};
//!
//! assert_eq!(Whence::try_from(2).unwrap(), Whence::End);
//! assert_eq!(Whence::try_from(7).unwrap_err().kind(), ErrorKind::InvalidArgument);
//! ```

pub mod error;
pub mod security;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{Error, ErrorKind, Result};
pub use security::*;
pub use traits::{ByteSource, ReadSeek};
pub use types::{format_size, AccessMode, DiskType, FileType, Whence};

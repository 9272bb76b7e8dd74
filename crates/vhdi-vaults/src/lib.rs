//! # vhdi vaults
//!
//! Readers for Microsoft virtual hard disk containers.
//!
//! - **vhd**: VHD version 1 (fixed, dynamic and differencing disks)
//! - **vhdx**: VHDX version 2 (fixed, dynamic and differencing disks)
//! - **Image**: random-access reader presenting one linear media address
//!   space, resolving unallocated ranges of differencing images through a
//!   caller-supplied parent
//!
//! ## Example
//!
//! ```rust,no_run
//! use vhdi_vaults::{check_file_signature, Image};
//! use std::path::Path;
//!
//! let path = Path::new("child.vhdx");
//! assert!(check_file_signature(path));
//!
//! let mut child = Image::new();
//! child.open(path).unwrap();
//!
//! if let Some(hint) = child.parent_filename().unwrap() {
//!     let mut parent = Image::new();
//!     parent.open(Path::new(hint)).unwrap();
//!     child.set_parent(&parent.into_shared()).unwrap();
//! }
//!
//! let first_sector = child.read_buffer_at_offset(512, 0).unwrap();
//! assert_eq!(first_sector.len(), 512);
//! ```

pub mod bat;
pub mod chain;
pub mod config;
pub mod image;
pub mod metadata;
pub mod signature;
mod text;
pub mod vhd;
pub mod vhdx;

#[cfg(test)]
mod testutil;

pub use chain::SharedImage;
pub use config::VaultConfig;
pub use image::Image;
pub use metadata::{FormatDetails, ImageMetadata, VhdDetails, VhdxDetails};
pub use signature::{check_file_signature, check_file_signature_stream};
pub use vhdi_core::{AccessMode, DiskType, Error, ErrorKind, FileType, Result, Whence};

/// Version of this library
pub fn get_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_version() {
        assert_eq!(get_version(), env!("CARGO_PKG_VERSION"));
        assert!(!get_version().is_empty());
    }
}

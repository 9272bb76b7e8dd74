//! Core types shared by the image crates

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Container file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    /// Virtual Hard Disk version 1
    Vhd,
    /// Virtual Hard Disk version 2
    Vhdx,
}

impl FileType {
    /// Human-readable format name
    pub fn name(&self) -> &'static str {
        match self {
            FileType::Vhd => "VHD (version 1)",
            FileType::Vhdx => "VHDX (version 2)",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Disk type of an image
///
/// The discriminants are the VHD footer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum DiskType {
    Fixed = 2,
    Dynamic = 3,
    Differencing = 4,
}

impl DiskType {
    /// Parse a VHD footer disk type value
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            2 => Some(DiskType::Fixed),
            3 => Some(DiskType::Dynamic),
            4 => Some(DiskType::Differencing),
            _ => None,
        }
    }

    /// Human-readable disk type name
    pub fn name(&self) -> &'static str {
        match self {
            DiskType::Fixed => "Fixed",
            DiskType::Dynamic => "Dynamic",
            DiskType::Differencing => "Differential",
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Origin of a seek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the media (SEEK_SET)
    Set,
    /// From the current cursor (SEEK_CUR)
    Current,
    /// From the end of the media (SEEK_END)
    End,
}

impl TryFrom<i32> for Whence {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Current),
            2 => Ok(Whence::End),
            _ => Err(Error::invalid_argument(format!(
                "unsupported seek origin: {}",
                value
            ))),
        }
    }
}

/// Access mode requested when opening an image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

impl AccessMode {
    /// Parse a mode string such as `"r"`
    pub fn parse(mode: &str) -> Result<Self> {
        mode.parse()
    }

    /// Fail unless this mode is read-only
    pub fn require_read_only(&self) -> Result<()> {
        match self {
            AccessMode::Read => Ok(()),
            _ => Err(Error::invalid_argument(format!(
                "unsupported access mode: {:?} (only read access is supported)",
                self
            ))),
        }
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(mode: &str) -> Result<Self> {
        match mode {
            "r" | "rb" => Ok(AccessMode::Read),
            "w" | "wb" => Ok(AccessMode::Write),
            "r+" | "rb+" | "w+" | "wb+" => Ok(AccessMode::ReadWrite),
            _ => Err(Error::invalid_argument(format!("unsupported mode: {}", mode))),
        }
    }
}

/// Format size in human-readable format
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut size = size as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.1} {}", size, UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_disk_type_from_u32() {
        assert_eq!(DiskType::from_u32(2), Some(DiskType::Fixed));
        assert_eq!(DiskType::from_u32(3), Some(DiskType::Dynamic));
        assert_eq!(DiskType::from_u32(4), Some(DiskType::Differencing));
        assert_eq!(DiskType::from_u32(0), None);
        assert_eq!(DiskType::from_u32(99), None);
    }

    #[test]
    fn test_whence_try_from() {
        assert_eq!(Whence::try_from(0).unwrap(), Whence::Set);
        assert_eq!(Whence::try_from(1).unwrap(), Whence::Current);
        assert_eq!(Whence::try_from(2).unwrap(), Whence::End);

        let err = Whence::try_from(-1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(Whence::try_from(3).is_err());
    }

    #[test]
    fn test_access_mode_parse() {
        assert_eq!(AccessMode::parse("r").unwrap(), AccessMode::Read);
        assert_eq!(AccessMode::parse("rb").unwrap(), AccessMode::Read);
        assert_eq!(AccessMode::parse("w").unwrap(), AccessMode::Write);
        assert!(AccessMode::parse("x").is_err());
        assert!(AccessMode::parse("").is_err());
    }

    #[test]
    fn test_access_mode_read_only() {
        assert!(AccessMode::Read.require_read_only().is_ok());

        let err = AccessMode::Write.require_read_only().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(AccessMode::ReadWrite.require_read_only().is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.0 KiB");
        assert_eq!(format_size(1024 * 1024), "1.0 MiB");
        assert_eq!(format_size(1536 * 1024), "1.5 MiB");
    }

    #[test]
    fn test_display_names() {
        assert_eq!(FileType::Vhdx.to_string(), "VHDX (version 2)");
        assert_eq!(DiskType::Differencing.to_string(), "Differential");
    }
}

//! VHDX on-disk structures
//!
//! All multi-byte fields are little-endian. GUIDs are stored in the mixed
//! endian Windows layout.

use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;
use vhdi_core::{Error, Result, MAX_TABLE_ENTRIES};

use crate::text;

fn le_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn le_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn le_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

fn guid_at(bytes: &[u8], at: usize) -> [u8; 16] {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[at..at + 16]);
    raw
}

/// Well-known region and metadata item GUIDs, as stored on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatGuid(pub [u8; 16]);

impl FormatGuid {
    /// Block allocation table region
    pub const BAT_REGION: Self = Self([
        0x66, 0x77, 0xc2, 0x2d, 0x23, 0xf6, 0x00, 0x42,
        0x9d, 0x64, 0x11, 0x5e, 0x9b, 0xfd, 0x4a, 0x08,
    ]);

    /// Metadata region
    pub const METADATA_REGION: Self = Self([
        0x06, 0xa2, 0x7c, 0x8b, 0x90, 0x47, 0x9a, 0x4b,
        0xb8, 0xfe, 0x57, 0x5f, 0x05, 0x0f, 0x88, 0x6e,
    ]);

    /// File parameters item (block size and flags)
    pub const FILE_PARAMETERS: Self = Self([
        0x37, 0x67, 0xa1, 0xca, 0x36, 0xfa, 0x43, 0x4d,
        0xb3, 0xb6, 0x33, 0xf0, 0xaa, 0x44, 0xe7, 0x6b,
    ]);

    /// Logical sector size item
    pub const LOGICAL_SECTOR_SIZE: Self = Self([
        0x1d, 0xbf, 0x41, 0x81, 0x6f, 0xa9, 0x09, 0x47,
        0xba, 0x47, 0xf2, 0x33, 0xa8, 0xfa, 0xab, 0x5f,
    ]);

    /// Parent locator item
    pub const PARENT_LOCATOR: Self = Self([
        0x2d, 0x5f, 0xd3, 0xa8, 0x0b, 0xb3, 0x4d, 0x45,
        0xab, 0xf7, 0xd3, 0xd8, 0x48, 0x34, 0xab, 0x0c,
    ]);

    /// Physical sector size item
    pub const PHYSICAL_SECTOR_SIZE: Self = Self([
        0xc7, 0x48, 0xa3, 0xcd, 0x5d, 0x44, 0x71, 0x44,
        0x9c, 0xc9, 0xe9, 0x88, 0x52, 0x51, 0xc5, 0x56,
    ]);

    /// Virtual disk identifier item
    pub const VIRTUAL_DISK_ID: Self = Self([
        0xab, 0x12, 0xca, 0xbe, 0xe6, 0xb2, 0x23, 0x45,
        0x93, 0xef, 0xc3, 0x09, 0xe0, 0x00, 0xc7, 0x46,
    ]);

    /// Virtual disk size item
    pub const VIRTUAL_DISK_SIZE: Self = Self([
        0x24, 0x42, 0xa5, 0x2f, 0x1b, 0xcd, 0x76, 0x48,
        0xb2, 0x11, 0x5d, 0xbe, 0xd8, 0x3b, 0xf4, 0xb8,
    ]);

    /// Locator type of a VHDX parent
    pub const PARENT_LOCATOR_TYPE_VHDX: Self = Self([
        0xb7, 0xef, 0x4a, 0xb0, 0x9e, 0xd1, 0x81, 0x4a,
        0xb7, 0x89, 0x25, 0xb8, 0xe9, 0x44, 0x59, 0x13,
    ]);

    /// Get a human-readable name for this GUID
    pub fn name(&self) -> &str {
        match *self {
            Self::BAT_REGION => "Block allocation table",
            Self::METADATA_REGION => "Metadata",
            Self::FILE_PARAMETERS => "File parameters",
            Self::LOGICAL_SECTOR_SIZE => "Logical sector size",
            Self::PARENT_LOCATOR => "Parent locator",
            Self::PHYSICAL_SECTOR_SIZE => "Physical sector size",
            Self::VIRTUAL_DISK_ID => "Virtual disk identifier",
            Self::VIRTUAL_DISK_SIZE => "Virtual disk size",
            Self::PARENT_LOCATOR_TYPE_VHDX => "VHDX parent locator",
            _ => "Unknown",
        }
    }

    pub fn to_uuid(&self) -> Uuid {
        Uuid::from_bytes_le(self.0)
    }
}

impl fmt::Display for FormatGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.to_uuid())
    }
}

/// File type identifier at offset 0
#[derive(Debug, Clone)]
pub struct FileIdentifier {
    pub creator: String,
}

impl FileIdentifier {
    pub const SIGNATURE: &'static [u8; 8] = b"vhdxfile";
    /// Signature plus the 512-byte creator field
    pub const SIZE: usize = 8 + 512;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE || &bytes[0..8] != Self::SIGNATURE {
            return Err(Error::invalid_format("Invalid VHDX file identifier"));
        }
        Ok(Self {
            creator: text::utf16le_until_nul(&bytes[8..Self::SIZE]),
        })
    }
}

/// Image header ("head"), kept twice at 64 KiB and 128 KiB
#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub checksum: u32,
    pub sequence_number: u64,
    pub file_write_identifier: Uuid,
    pub data_write_identifier: Uuid,
    pub log_identifier: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl ImageHeader {
    pub const SIGNATURE: &'static [u8; 4] = b"head";
    pub const SIZE: usize = 80;
    pub const OFFSETS: [u64; 2] = [64 * 1024, 128 * 1024];

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE || &bytes[0..4] != Self::SIGNATURE {
            return Err(Error::invalid_format("Invalid VHDX image header signature"));
        }
        Ok(Self {
            checksum: le_u32(bytes, 4),
            sequence_number: le_u64(bytes, 8),
            file_write_identifier: Uuid::from_bytes_le(guid_at(bytes, 16)),
            data_write_identifier: Uuid::from_bytes_le(guid_at(bytes, 32)),
            log_identifier: Uuid::from_bytes_le(guid_at(bytes, 48)),
            log_version: le_u16(bytes, 64),
            version: le_u16(bytes, 66),
            log_length: le_u32(bytes, 68),
            log_offset: le_u64(bytes, 72),
        })
    }
}

/// Region table entry
#[derive(Debug, Clone, Copy)]
pub struct RegionEntry {
    pub guid: FormatGuid,
    pub offset: u64,
    pub length: u32,
    pub required: bool,
}

/// Region table ("regi"), kept at 192 KiB with a backup at 256 KiB
#[derive(Debug, Clone)]
pub struct RegionTable {
    pub checksum: u32,
    pub entries: Vec<RegionEntry>,
}

impl RegionTable {
    pub const SIGNATURE: &'static [u8; 4] = b"regi";
    pub const HEADER_SIZE: usize = 16;
    pub const ENTRY_SIZE: usize = 32;
    pub const OFFSETS: [u64; 2] = [192 * 1024, 256 * 1024];

    /// Entry count from a table header
    pub fn entry_count(header: &[u8]) -> Result<usize> {
        if header.len() < Self::HEADER_SIZE || &header[0..4] != Self::SIGNATURE {
            return Err(Error::invalid_format("Invalid VHDX region table signature"));
        }
        let count = le_u32(header, 8) as usize;
        if count > MAX_TABLE_ENTRIES {
            return Err(Error::invalid_format(format!(
                "VHDX region table has {} entries (limit {})",
                count, MAX_TABLE_ENTRIES
            )));
        }
        Ok(count)
    }

    /// Parse a table from its header and entries
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let count = Self::entry_count(bytes)?;
        if bytes.len() < Self::HEADER_SIZE + count * Self::ENTRY_SIZE {
            return Err(Error::invalid_format("VHDX region table truncated"));
        }

        let entries = bytes[Self::HEADER_SIZE..Self::HEADER_SIZE + count * Self::ENTRY_SIZE]
            .chunks_exact(Self::ENTRY_SIZE)
            .map(|raw| RegionEntry {
                guid: FormatGuid(guid_at(raw, 0)),
                offset: le_u64(raw, 16),
                length: le_u32(raw, 24),
                required: le_u32(raw, 28) & 1 != 0,
            })
            .collect();

        Ok(Self {
            checksum: le_u32(bytes, 4),
            entries,
        })
    }

    pub fn find(&self, guid: FormatGuid) -> Option<&RegionEntry> {
        self.entries.iter().find(|entry| entry.guid == guid)
    }
}

/// Metadata table entry; `offset` is relative to the metadata region
#[derive(Debug, Clone, Copy)]
pub struct MetadataEntry {
    pub item: FormatGuid,
    pub offset: u32,
    pub length: u32,
    pub flags: u32,
}

impl MetadataEntry {
    pub fn is_required(&self) -> bool {
        self.flags & 0b100 != 0
    }
}

/// Metadata table ("metadata") at the start of the metadata region
#[derive(Debug, Clone)]
pub struct MetadataTable {
    pub entries: Vec<MetadataEntry>,
}

impl MetadataTable {
    pub const SIGNATURE: &'static [u8; 8] = b"metadata";
    pub const HEADER_SIZE: usize = 32;
    pub const ENTRY_SIZE: usize = 32;

    /// Entry count from a table header
    pub fn entry_count(header: &[u8]) -> Result<usize> {
        if header.len() < Self::HEADER_SIZE || &header[0..8] != Self::SIGNATURE {
            return Err(Error::invalid_format("Invalid VHDX metadata table signature"));
        }
        let count = le_u16(header, 10) as usize;
        if count > MAX_TABLE_ENTRIES {
            return Err(Error::invalid_format(format!(
                "VHDX metadata table has {} entries (limit {})",
                count, MAX_TABLE_ENTRIES
            )));
        }
        Ok(count)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let count = Self::entry_count(bytes)?;
        if bytes.len() < Self::HEADER_SIZE + count * Self::ENTRY_SIZE {
            return Err(Error::invalid_format("VHDX metadata table truncated"));
        }

        let entries = bytes[Self::HEADER_SIZE..Self::HEADER_SIZE + count * Self::ENTRY_SIZE]
            .chunks_exact(Self::ENTRY_SIZE)
            .map(|raw| MetadataEntry {
                item: FormatGuid(guid_at(raw, 0)),
                offset: le_u32(raw, 16),
                length: le_u32(raw, 20),
                flags: le_u32(raw, 24),
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn find(&self, item: FormatGuid) -> Option<&MetadataEntry> {
        self.entries.iter().find(|entry| entry.item == item)
    }
}

/// File parameters metadata item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileParameters {
    pub block_size: u32,
    pub leave_blocks_allocated: bool,
    pub has_parent: bool,
}

impl FileParameters {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::invalid_format("VHDX file parameters too small"));
        }
        let flags = le_u32(bytes, 4);
        Ok(Self {
            block_size: le_u32(bytes, 0),
            leave_blocks_allocated: flags & 0b01 != 0,
            has_parent: flags & 0b10 != 0,
        })
    }
}

/// Parse a fixed-size little-endian u32 item
pub fn parse_u32_item(bytes: &[u8], what: &str) -> Result<u32> {
    if bytes.len() < 4 {
        return Err(Error::invalid_format(format!("VHDX {} item too small", what)));
    }
    Ok(le_u32(bytes, 0))
}

/// Parse a fixed-size little-endian u64 item
pub fn parse_u64_item(bytes: &[u8], what: &str) -> Result<u64> {
    if bytes.len() < 8 {
        return Err(Error::invalid_format(format!("VHDX {} item too small", what)));
    }
    Ok(le_u64(bytes, 0))
}

/// Parse a GUID item
pub fn parse_guid_item(bytes: &[u8], what: &str) -> Result<Uuid> {
    if bytes.len() < 16 {
        return Err(Error::invalid_format(format!("VHDX {} item too small", what)));
    }
    Ok(Uuid::from_bytes_le(guid_at(bytes, 0)))
}

/// Parent locator metadata item: a locator type and UTF-16LE key/value pairs
#[derive(Debug, Clone)]
pub struct ParentLocator {
    pub locator_type: FormatGuid,
    pub entries: BTreeMap<String, String>,
}

impl ParentLocator {
    pub const HEADER_SIZE: usize = 20;
    pub const ENTRY_SIZE: usize = 12;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(Error::invalid_format("VHDX parent locator too small"));
        }
        let count = le_u16(bytes, 18) as usize;
        if bytes.len() < Self::HEADER_SIZE + count * Self::ENTRY_SIZE {
            return Err(Error::invalid_format("VHDX parent locator entries truncated"));
        }

        let field = |offset: u32, length: u16| -> Result<String> {
            let start = offset as usize;
            let end = start + length as usize;
            bytes
                .get(start..end)
                .map(text::utf16le_until_nul)
                .ok_or_else(|| {
                    Error::invalid_format(format!(
                        "VHDX parent locator field {}..{} out of bounds",
                        start, end
                    ))
                })
        };

        let mut entries = BTreeMap::new();
        for i in 0..count {
            let at = Self::HEADER_SIZE + i * Self::ENTRY_SIZE;
            let key = field(le_u32(bytes, at), le_u16(bytes, at + 8))?;
            let value = field(le_u32(bytes, at + 4), le_u16(bytes, at + 10))?;
            entries.insert(key, value);
        }

        Ok(Self {
            locator_type: FormatGuid(guid_at(bytes, 0)),
            entries,
        })
    }

    /// Identifier of the parent's data, from `parent_linkage`
    pub fn parent_linkage(&self) -> Result<Option<Uuid>> {
        match self.entries.get("parent_linkage") {
            None => Ok(None),
            Some(value) => {
                let trimmed = value.trim_start_matches('{').trim_end_matches('}');
                Uuid::parse_str(trimmed).map(Some).map_err(|e| {
                    Error::invalid_format(format!("invalid parent_linkage '{}': {}", value, e))
                })
            }
        }
    }

    /// Best parent path hint: absolute, then volume, then relative path
    pub fn parent_path(&self) -> Option<&str> {
        ["absolute_win32_path", "volume_path", "relative_path"]
            .iter()
            .find_map(|key| self.entries.get(*key))
            .map(String::as_str)
    }
}

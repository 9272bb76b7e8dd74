//! VHD (Virtual Hard Disk) type definitions
//!
//! This module contains the core data structures for parsing Microsoft VHD files.
//! All multi-byte fields are big-endian.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ops::Range;
use uuid::Uuid;
use vhdi_core::{DiskType, Error, Result};

use crate::text;

/// Seconds between the Unix epoch and the VHD epoch (2000-01-01 00:00:00 UTC)
const VHD_EPOCH_OFFSET: i64 = 946_684_800;

/// One's complement of the byte sum, skipping the checksum field
pub fn vhd_checksum(bytes: &[u8], checksum_field: Range<usize>) -> u32 {
    let sum = bytes
        .iter()
        .enumerate()
        .filter(|(i, _)| !checksum_field.contains(i))
        .fold(0u32, |sum, (_, &byte)| sum.wrapping_add(byte as u32));
    !sum
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Disk geometry (CHS addressing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskGeometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors: u8,
}

impl DiskGeometry {
    /// Parse disk geometry from bytes
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            cylinders: u16::from_be_bytes([bytes[0], bytes[1]]),
            heads: bytes[2],
            sectors: bytes[3],
        }
    }

    /// Convert geometry to bytes
    pub fn to_bytes(&self) -> [u8; 4] {
        let cyl_bytes = self.cylinders.to_be_bytes();
        [cyl_bytes[0], cyl_bytes[1], self.heads, self.sectors]
    }
}

/// VHD Footer structure (512 bytes)
///
/// The footer appears at the end of all VHD files. Dynamic and differencing
/// VHDs also keep a copy at the beginning.
#[derive(Debug, Clone)]
pub struct VhdFooter {
    pub cookie: [u8; 8], // "conectix"
    pub features: u32,
    pub version: u32,
    pub data_offset: u64,
    pub timestamp: u32,
    pub creator_app: [u8; 4],
    pub creator_version: u32,
    pub creator_os: u32,
    pub original_size: u64,
    pub current_size: u64,
    pub geometry: DiskGeometry,
    /// Raw disk type value; see [`VhdFooter::disk_type`]
    pub disk_type: u32,
    pub checksum: u32,
    pub identifier: Uuid,
    pub saved_state: u8,
    pub reserved: [u8; 427],
}

impl VhdFooter {
    /// VHD footer cookie value "conectix"
    pub const COOKIE: &'static [u8; 8] = b"conectix";

    /// Size of the VHD footer in bytes
    pub const SIZE: usize = 512;

    /// The only format version this reader accepts (1.0)
    pub const VERSION: u32 = 0x0001_0000;

    /// `data_offset` value of a fixed disk
    pub const NO_DATA_OFFSET: u64 = u64::MAX;

    const CHECKSUM_FIELD: Range<usize> = 64..68;

    /// Parse VHD footer from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::invalid_format("VHD footer too small"));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);

        if &cookie != Self::COOKIE {
            return Err(Error::invalid_format(format!(
                "Invalid VHD footer cookie: expected 'conectix', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let mut creator_app = [0u8; 4];
        creator_app.copy_from_slice(&bytes[28..32]);

        let mut identifier = [0u8; 16];
        identifier.copy_from_slice(&bytes[68..84]);

        let mut reserved = [0u8; 427];
        reserved.copy_from_slice(&bytes[85..512]);

        Ok(Self {
            cookie,
            features: be_u32(bytes, 8),
            version: be_u32(bytes, 12),
            data_offset: be_u64(bytes, 16),
            timestamp: be_u32(bytes, 24),
            creator_app,
            creator_version: be_u32(bytes, 32),
            creator_os: be_u32(bytes, 36),
            original_size: be_u64(bytes, 40),
            current_size: be_u64(bytes, 48),
            geometry: DiskGeometry::parse(&bytes[56..60]),
            disk_type: be_u32(bytes, 60),
            checksum: be_u32(bytes, 64),
            identifier: Uuid::from_bytes(identifier),
            saved_state: bytes[84],
            reserved,
        })
    }

    /// Verify the footer checksum
    ///
    /// The checksum is the one's complement of the sum of all bytes in the
    /// footer, with the checksum field itself excluded.
    pub fn verify_checksum(&self) -> bool {
        self.calculate_checksum() == self.checksum
    }

    /// Checksum of the serialized footer
    pub fn calculate_checksum(&self) -> u32 {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        vhd_checksum(&bytes, Self::CHECKSUM_FIELD)
    }

    /// Decoded disk type, `None` for reserved values
    pub fn disk_type(&self) -> Option<DiskType> {
        DiskType::from_u32(self.disk_type)
    }

    /// Footer modification time
    pub fn modification_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(VHD_EPOCH_OFFSET + self.timestamp as i64, 0)
    }

    /// Creator application as text, e.g. `"vpc "`
    pub fn creator_application(&self) -> String {
        String::from_utf8_lossy(&self.creator_app).into_owned()
    }

    /// Serialize footer to bytes
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..12].copy_from_slice(&self.features.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.version.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.timestamp.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.creator_app);
        bytes[32..36].copy_from_slice(&self.creator_version.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.creator_os.to_be_bytes());
        bytes[40..48].copy_from_slice(&self.original_size.to_be_bytes());
        bytes[48..56].copy_from_slice(&self.current_size.to_be_bytes());
        bytes[56..60].copy_from_slice(&self.geometry.to_bytes());
        bytes[60..64].copy_from_slice(&self.disk_type.to_be_bytes());
        bytes[64..68].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[68..84].copy_from_slice(self.identifier.as_bytes());
        bytes[84] = self.saved_state;
        bytes[85..512].copy_from_slice(&self.reserved);
    }
}

/// Parent locator entry of a differencing VHD (24 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParentLocatorEntry {
    pub platform_code: [u8; 4],
    /// Sectors reserved for the locator data
    pub data_space: u32,
    /// Bytes of locator data
    pub data_length: u32,
    pub reserved: u32,
    pub data_offset: u64,
}

impl ParentLocatorEntry {
    pub const SIZE: usize = 24;

    pub fn parse(bytes: &[u8]) -> Self {
        let mut platform_code = [0u8; 4];
        platform_code.copy_from_slice(&bytes[0..4]);
        Self {
            platform_code,
            data_space: be_u32(bytes, 4),
            data_length: be_u32(bytes, 8),
            reserved: be_u32(bytes, 12),
            data_offset: be_u64(bytes, 16),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.platform_code);
        bytes[4..8].copy_from_slice(&self.data_space.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.data_length.to_be_bytes());
        bytes[12..16].copy_from_slice(&self.reserved.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes
    }

    /// An all-zero platform code marks an unused slot
    pub fn is_unused(&self) -> bool {
        self.platform_code == [0u8; 4]
    }

    /// Decode locator data according to the platform code
    ///
    /// `W2ku`/`W2ru` hold UTF-16LE Windows paths, `Mac `/`MacX` hold UTF-8.
    pub fn decode_path(&self, data: &[u8]) -> Option<String> {
        match &self.platform_code {
            b"W2ku" | b"W2ru" => Some(text::utf16le_until_nul(data)),
            b"Mac " | b"MacX" => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                Some(String::from_utf8_lossy(&data[..end]).into_owned())
            }
            _ => None,
        }
    }
}

/// Decoded parent locator, as exposed by an opened image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParentLocator {
    pub platform_code: String,
    pub data_offset: u64,
    pub data_length: u32,
    pub path: Option<String>,
}

/// VHD Dynamic Header structure (1024 bytes)
///
/// This header appears only in dynamic and differencing VHDs, located at the
/// offset specified in the footer's data_offset field.
#[derive(Debug, Clone)]
pub struct VhdDynamicHeader {
    pub cookie: [u8; 8], // "cxsparse"
    pub data_offset: u64,
    pub table_offset: u64,
    pub header_version: u32,
    pub max_table_entries: u32,
    pub block_size: u32,
    pub checksum: u32,
    pub parent_identifier: Uuid,
    pub parent_timestamp: u32,
    pub reserved1: u32,
    /// Parent file name, UTF-16BE
    pub parent_unicode_name: [u8; 512],
    pub parent_locator_entries: [ParentLocatorEntry; 8],
    pub reserved2: [u8; 256],
}

impl VhdDynamicHeader {
    /// VHD dynamic header cookie value "cxsparse"
    pub const COOKIE: &'static [u8; 8] = b"cxsparse";

    /// Size of the VHD dynamic header in bytes
    pub const SIZE: usize = 1024;

    const CHECKSUM_FIELD: Range<usize> = 36..40;

    /// Parse VHD dynamic header from raw bytes
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::invalid_format("VHD dynamic header too small"));
        }

        let mut cookie = [0u8; 8];
        cookie.copy_from_slice(&bytes[0..8]);

        if &cookie != Self::COOKIE {
            return Err(Error::invalid_format(format!(
                "Invalid VHD dynamic header cookie: expected 'cxsparse', got '{}'",
                String::from_utf8_lossy(&cookie)
            )));
        }

        let mut parent_identifier = [0u8; 16];
        parent_identifier.copy_from_slice(&bytes[40..56]);

        let mut parent_unicode_name = [0u8; 512];
        parent_unicode_name.copy_from_slice(&bytes[64..576]);

        let mut parent_locator_entries = [ParentLocatorEntry::default(); 8];
        for (i, entry) in parent_locator_entries.iter_mut().enumerate() {
            let offset = 576 + i * ParentLocatorEntry::SIZE;
            *entry = ParentLocatorEntry::parse(&bytes[offset..offset + ParentLocatorEntry::SIZE]);
        }

        let mut reserved2 = [0u8; 256];
        reserved2.copy_from_slice(&bytes[768..1024]);

        Ok(Self {
            cookie,
            data_offset: be_u64(bytes, 8),
            table_offset: be_u64(bytes, 16),
            header_version: be_u32(bytes, 24),
            max_table_entries: be_u32(bytes, 28),
            block_size: be_u32(bytes, 32),
            checksum: be_u32(bytes, 36),
            parent_identifier: Uuid::from_bytes(parent_identifier),
            parent_timestamp: be_u32(bytes, 56),
            reserved1: be_u32(bytes, 60),
            parent_unicode_name,
            parent_locator_entries,
            reserved2,
        })
    }

    /// Verify the dynamic header checksum
    pub fn verify_checksum(&self) -> bool {
        self.calculate_checksum() == self.checksum
    }

    /// Checksum of the serialized header
    pub fn calculate_checksum(&self) -> u32 {
        let mut bytes = [0u8; Self::SIZE];
        self.serialize(&mut bytes);
        vhd_checksum(&bytes, Self::CHECKSUM_FIELD)
    }

    /// Parent file name, empty when unset
    pub fn parent_name(&self) -> String {
        text::utf16be_until_nul(&self.parent_unicode_name)
    }

    /// Size of the sector bitmap preceding each data block
    ///
    /// One bit per 512-byte sector, rounded up to a whole sector.
    pub fn sector_bitmap_size(&self) -> u32 {
        let bytes = self.block_size.div_ceil(512 * 8);
        bytes.div_ceil(512) * 512
    }

    /// Serialize dynamic header to bytes
    pub fn serialize(&self, bytes: &mut [u8; Self::SIZE]) {
        bytes[0..8].copy_from_slice(&self.cookie);
        bytes[8..16].copy_from_slice(&self.data_offset.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.table_offset.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.header_version.to_be_bytes());
        bytes[28..32].copy_from_slice(&self.max_table_entries.to_be_bytes());
        bytes[32..36].copy_from_slice(&self.block_size.to_be_bytes());
        bytes[36..40].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[40..56].copy_from_slice(self.parent_identifier.as_bytes());
        bytes[56..60].copy_from_slice(&self.parent_timestamp.to_be_bytes());
        bytes[60..64].copy_from_slice(&self.reserved1.to_be_bytes());
        bytes[64..576].copy_from_slice(&self.parent_unicode_name);

        for (i, entry) in self.parent_locator_entries.iter().enumerate() {
            let offset = 576 + i * ParentLocatorEntry::SIZE;
            bytes[offset..offset + ParentLocatorEntry::SIZE].copy_from_slice(&entry.to_bytes());
        }

        bytes[768..1024].copy_from_slice(&self.reserved2);
    }
}

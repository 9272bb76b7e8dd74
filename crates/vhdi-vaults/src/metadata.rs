//! Image metadata decoded at open time

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;
use vhdi_core::{DiskType, FileType};

use crate::vhd::types::{DiskGeometry, ParentLocator};

/// Format-independent metadata of an opened image
#[derive(Debug, Clone, Serialize)]
pub struct ImageMetadata {
    pub file_type: FileType,
    /// (major, minor) format version
    pub format_version: (u16, u16),
    pub disk_type: DiskType,
    pub media_size: u64,
    /// Block size, 0 for a fixed VHD
    pub block_size: u32,
    pub bytes_per_sector: u32,
    pub identifier: Uuid,
    pub parent_identifier: Option<Uuid>,
    pub parent_filename: Option<String>,
    pub details: FormatDetails,
}

/// Metadata only one of the formats carries
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum FormatDetails {
    Vhd(VhdDetails),
    Vhdx(VhdxDetails),
}

#[derive(Debug, Clone, Serialize)]
pub struct VhdDetails {
    pub creator_application: String,
    pub creator_version: u32,
    pub creator_os: String,
    pub modification_time: Option<DateTime<Utc>>,
    pub geometry: DiskGeometry,
    pub saved_state: bool,
    pub parent_locators: Vec<ParentLocator>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VhdxDetails {
    pub creator: String,
    pub sequence_number: u64,
    pub virtual_disk_identifier: Uuid,
    pub physical_sector_size: u32,
    pub parent_locator: BTreeMap<String, String>,
}

/// Result of decoding a container: its metadata and allocation map
#[derive(Debug)]
pub struct DecodedImage {
    pub metadata: ImageMetadata,
    pub map: crate::bat::BlockAllocationMap,
}

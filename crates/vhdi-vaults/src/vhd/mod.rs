//! VHD (Virtual Hard Disk) decoder
//!
//! This module implements support for the Microsoft VHD disk image format.
//!
//! ## Supported Formats
//!
//! - **Fixed VHD**: data stored contiguously with a footer at the end
//! - **Dynamic VHD**: sparse format using a Block Allocation Table (BAT)
//! - **Differencing VHD**: dynamic layout whose unallocated sectors come from
//!   a parent image
//!
//! ## Format Overview
//!
//! VHD files have a 512-byte footer at the end containing metadata.
//! - Fixed VHDs: Data from byte 0 to (file_size - 512)
//! - Dynamic VHDs: Data stored in blocks referenced by BAT, each block
//!   preceded by a sector bitmap

pub mod types;

use vhdi_core::{
    security::{validate_allocation_size, MAX_TABLE_SIZE},
    ByteSource, DiskType, Error, FileType, Result,
};

use crate::bat::{BitOrder, BlockAllocationMap, BlockEntry};
use crate::metadata::{DecodedImage, FormatDetails, ImageMetadata, VhdDetails};
use types::{ParentLocator, VhdDynamicHeader, VhdFooter};

/// Sector size of every VHD
pub const VHD_SECTOR_SIZE: u32 = 512;

/// Largest parent locator payload decoded
const MAX_LOCATOR_DATA: usize = 64 * 1024;

/// Unallocated BAT entry
const BAT_UNUSED: u32 = 0xFFFF_FFFF;

/// Decode a VHD container
///
/// # Errors
///
/// Returns an error if:
/// - The source is smaller than a footer
/// - The footer or dynamic header is invalid or fails its checksum
/// - The format version or disk type is unsupported
/// - The block allocation table does not cover the media
pub fn decode(source: &mut dyn ByteSource) -> Result<DecodedImage> {
    let file_len = source.size()?;

    if file_len < VhdFooter::SIZE as u64 {
        return Err(Error::invalid_format("File too small to be a VHD"));
    }

    // Read footer from last 512 bytes
    let footer_offset = file_len - VhdFooter::SIZE as u64;
    let mut footer_bytes = [0u8; VhdFooter::SIZE];
    source.read_exact_at(footer_offset, &mut footer_bytes)?;

    let footer = VhdFooter::parse(&footer_bytes)?;

    if !footer.verify_checksum() {
        return Err(Error::checksum("VHD footer checksum verification failed"));
    }

    if footer.version != VhdFooter::VERSION {
        return Err(Error::unsupported(format!(
            "VHD format version {}.{}",
            footer.version >> 16,
            footer.version & 0xFFFF
        )));
    }

    let disk_type = footer.disk_type().ok_or_else(|| {
        Error::unsupported(format!("VHD disk type {}", footer.disk_type))
    })?;

    tracing::debug!(
        "VHD footer: {} disk, {} bytes, identifier {}",
        disk_type,
        footer.current_size,
        footer.identifier
    );

    let mut block_size = 0;
    let mut parent_identifier = None;
    let mut parent_filename = None;
    let mut parent_locators = Vec::new();

    let map = match disk_type {
        DiskType::Fixed => {
            if footer.current_size > footer_offset {
                return Err(Error::invalid_format(format!(
                    "fixed VHD of {} bytes truncated to {} data bytes",
                    footer.current_size, footer_offset
                )));
            }
            BlockAllocationMap::contiguous(footer.current_size)
        }
        DiskType::Dynamic | DiskType::Differencing => {
            check_footer_copy(source, &footer_bytes);

            if footer.data_offset == VhdFooter::NO_DATA_OFFSET {
                return Err(Error::invalid_format("Dynamic VHD has invalid data offset"));
            }

            let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
            source.read_exact_at(footer.data_offset, &mut header_bytes)?;
            let header = VhdDynamicHeader::parse(&header_bytes)?;

            if !header.verify_checksum() {
                return Err(Error::checksum(
                    "VHD dynamic header checksum verification failed",
                ));
            }

            if header.block_size == 0 || header.block_size % VHD_SECTOR_SIZE != 0 {
                return Err(Error::invalid_format(format!(
                    "Invalid VHD block size: {}",
                    header.block_size
                )));
            }
            block_size = header.block_size;

            if disk_type == DiskType::Differencing {
                let name = header.parent_name();
                tracing::debug!("VHD parent {} ({})", header.parent_identifier, name);
                parent_identifier = Some(header.parent_identifier);
                parent_filename = (!name.is_empty()).then_some(name);
                parent_locators = read_parent_locators(source, &header);
            }

            read_block_allocation_table(source, &header, disk_type, footer.current_size)?
        }
    };

    let metadata = ImageMetadata {
        file_type: FileType::Vhd,
        format_version: ((footer.version >> 16) as u16, (footer.version & 0xFFFF) as u16),
        disk_type,
        media_size: footer.current_size,
        block_size,
        bytes_per_sector: VHD_SECTOR_SIZE,
        identifier: footer.identifier,
        parent_identifier,
        parent_filename,
        details: FormatDetails::Vhd(VhdDetails {
            creator_application: footer.creator_application(),
            creator_version: footer.creator_version,
            creator_os: String::from_utf8_lossy(&footer.creator_os.to_be_bytes()).into_owned(),
            modification_time: footer.modification_time(),
            geometry: footer.geometry,
            saved_state: footer.saved_state != 0,
            parent_locators,
        }),
    };

    Ok(DecodedImage { metadata, map })
}

fn read_block_allocation_table(
    source: &mut dyn ByteSource,
    header: &VhdDynamicHeader,
    disk_type: DiskType,
    media_size: u64,
) -> Result<BlockAllocationMap> {
    let table_size = validate_allocation_size(
        header.max_table_entries as u64 * 4,
        MAX_TABLE_SIZE,
        "VHD block allocation table",
    )?;
    let mut table = vec![0u8; table_size];
    source.read_exact_at(header.table_offset, &mut table)?;

    let bitmap_size = header.sector_bitmap_size() as u64;
    let entries = table
        .chunks_exact(4)
        .map(|raw| {
            let sector = u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if sector == BAT_UNUSED {
                BlockEntry::Absent
            } else {
                let bitmap_offset = sector as u64 * VHD_SECTOR_SIZE as u64;
                BlockEntry::Partial {
                    data_offset: bitmap_offset + bitmap_size,
                    bitmap_offset,
                }
            }
        })
        .collect();

    tracing::debug!(
        "VHD BAT: {} entries of {} byte blocks at offset {}",
        header.max_table_entries,
        header.block_size,
        header.table_offset
    );

    BlockAllocationMap::blocks(
        media_size,
        header.block_size,
        VHD_SECTOR_SIZE,
        BitOrder::MsbFirst,
        entries,
        disk_type == DiskType::Differencing,
    )
}

/// Decode the parent locators; unreadable entries keep no path
fn read_parent_locators(
    source: &mut dyn ByteSource,
    header: &VhdDynamicHeader,
) -> Vec<ParentLocator> {
    header
        .parent_locator_entries
        .iter()
        .filter(|entry| !entry.is_unused())
        .map(|entry| {
            let length = (entry.data_length as usize).min(MAX_LOCATOR_DATA);
            let mut data = vec![0u8; length];
            let path = match source.read_exact_at(entry.data_offset, &mut data) {
                Ok(()) => entry.decode_path(&data),
                Err(e) => {
                    tracing::warn!(
                        "unreadable VHD parent locator at {}: {}",
                        entry.data_offset,
                        e
                    );
                    None
                }
            };
            ParentLocator {
                platform_code: String::from_utf8_lossy(&entry.platform_code).into_owned(),
                data_offset: entry.data_offset,
                data_length: entry.data_length,
                path,
            }
        })
        .collect()
}

/// Compare the leading footer copy of a dynamic disk with the trailing one
fn check_footer_copy(source: &mut dyn ByteSource, footer_bytes: &[u8; VhdFooter::SIZE]) {
    let mut copy = [0u8; VhdFooter::SIZE];
    match source.read_exact_at(0, &mut copy) {
        Ok(()) if &copy == footer_bytes => {}
        Ok(()) => tracing::warn!("VHD footer copy at offset 0 differs from the footer"),
        Err(e) => tracing::warn!("VHD footer copy at offset 0 unreadable: {}", e),
    }
}

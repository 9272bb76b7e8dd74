//! VHDX (Virtual Hard Disk v2) decoder
//!
//! ## Format Overview
//!
//! - 64 KiB header section: file identifier, two image headers, two copies
//!   of the region table
//! - Metadata region: block size, virtual disk size, sector sizes and the
//!   parent locator of differencing disks
//! - BAT region: 64-bit entries for payload blocks, with a sector bitmap
//!   entry after every `chunk_ratio` payload entries
//!
//! Log replay is not performed; header and table checksums are not verified.

pub mod types;

use std::collections::BTreeMap;
use vhdi_core::{
    security::{
        checked_add_u64, checked_multiply_u64, u64_to_usize, validate_allocation_size,
        validate_sector_size, MAX_TABLE_SIZE,
    },
    ByteSource, DiskType, Error, FileType, Result,
};

use crate::bat::{BitOrder, BlockAllocationMap, BlockEntry};
use crate::metadata::{DecodedImage, FormatDetails, ImageMetadata, VhdxDetails};
use types::{
    parse_guid_item, parse_u32_item, parse_u64_item, FileIdentifier, FileParameters, FormatGuid,
    ImageHeader, MetadataTable, ParentLocator, RegionEntry, RegionTable,
};

const MIB: u64 = 1024 * 1024;
const MIN_BLOCK_SIZE: u32 = 1024 * 1024;
const MAX_BLOCK_SIZE: u32 = 256 * 1024 * 1024;

/// Sectors described by one sector bitmap block (2^23)
const SECTORS_PER_BITMAP_BLOCK: u64 = 1 << 23;

/// Largest metadata item decoded
const MAX_METADATA_ITEM: u64 = 1024 * 1024;

// Payload block states
const PAYLOAD_BLOCK_NOT_PRESENT: u64 = 0;
const PAYLOAD_BLOCK_UNDEFINED: u64 = 1;
const PAYLOAD_BLOCK_ZERO: u64 = 2;
const PAYLOAD_BLOCK_UNMAPPED: u64 = 3;
const PAYLOAD_BLOCK_FULLY_PRESENT: u64 = 6;
const PAYLOAD_BLOCK_PARTIALLY_PRESENT: u64 = 7;

const SB_BLOCK_PRESENT: u64 = 6;

/// Decode a VHDX container
///
/// # Errors
///
/// Returns an error if the file identifier, image headers, region table or
/// metadata are missing or invalid, or the block allocation table does not
/// cover the media.
pub fn decode(source: &mut dyn ByteSource) -> Result<DecodedImage> {
    let mut identifier_bytes = [0u8; FileIdentifier::SIZE];
    source.read_exact_at(0, &mut identifier_bytes)?;
    let identifier = FileIdentifier::parse(&identifier_bytes)?;

    let header = read_image_header(source)?;
    if header.version != 1 {
        return Err(Error::unsupported(format!(
            "VHDX format version {}",
            header.version
        )));
    }
    if !header.log_identifier.is_nil() {
        tracing::warn!(
            "VHDX log {} is set; pending log entries are not replayed",
            header.log_identifier
        );
    }

    let regions = read_region_table(source)?;
    for entry in &regions.entries {
        let known = entry.guid == FormatGuid::BAT_REGION || entry.guid == FormatGuid::METADATA_REGION;
        if entry.required && !known {
            return Err(Error::unsupported(format!(
                "required VHDX region {}",
                entry.guid.to_uuid()
            )));
        }
    }
    let bat_region = *regions
        .find(FormatGuid::BAT_REGION)
        .ok_or_else(|| Error::invalid_format("VHDX region table lacks a BAT region"))?;
    let metadata_region = *regions
        .find(FormatGuid::METADATA_REGION)
        .ok_or_else(|| Error::invalid_format("VHDX region table lacks a metadata region"))?;

    let items = read_metadata(source, &metadata_region)?;

    let parameters = FileParameters::parse(items.require(FormatGuid::FILE_PARAMETERS)?)?;
    let media_size = parse_u64_item(items.require(FormatGuid::VIRTUAL_DISK_SIZE)?, "virtual disk size")?;
    let logical_sector_size =
        parse_u32_item(items.require(FormatGuid::LOGICAL_SECTOR_SIZE)?, "logical sector size")?;
    let physical_sector_size =
        parse_u32_item(items.require(FormatGuid::PHYSICAL_SECTOR_SIZE)?, "physical sector size")?;
    let virtual_disk_identifier =
        parse_guid_item(items.require(FormatGuid::VIRTUAL_DISK_ID)?, "virtual disk identifier")?;

    validate_sector_size(logical_sector_size)?;
    validate_sector_size(physical_sector_size)?;

    let block_size = parameters.block_size;
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(Error::invalid_format(format!(
            "Invalid VHDX block size: {}",
            block_size
        )));
    }

    let disk_type = if parameters.has_parent {
        DiskType::Differencing
    } else if parameters.leave_blocks_allocated {
        DiskType::Fixed
    } else {
        DiskType::Dynamic
    };

    tracing::debug!(
        "VHDX: {} disk, {} bytes, {} byte blocks, {} byte sectors",
        disk_type,
        media_size,
        block_size,
        logical_sector_size
    );

    let (parent_identifier, parent_filename, parent_locator) = if parameters.has_parent {
        let locator = ParentLocator::parse(items.require(FormatGuid::PARENT_LOCATOR)?)?;
        let linkage = locator.parent_linkage()?.ok_or_else(|| {
            Error::invalid_format("VHDX parent locator lacks parent_linkage")
        })?;
        let path = locator.parent_path().map(str::to_string);
        tracing::debug!("VHDX parent {} ({:?})", linkage, path);
        (Some(linkage), path, locator.entries)
    } else {
        (None, None, BTreeMap::new())
    };

    let map = read_block_allocation_table(
        source,
        &bat_region,
        media_size,
        block_size,
        logical_sector_size,
        parameters.has_parent,
    )?;

    let metadata = ImageMetadata {
        file_type: FileType::Vhdx,
        format_version: (header.version, 0),
        disk_type,
        media_size,
        block_size,
        bytes_per_sector: logical_sector_size,
        identifier: header.data_write_identifier,
        parent_identifier,
        parent_filename,
        details: FormatDetails::Vhdx(VhdxDetails {
            creator: identifier.creator,
            sequence_number: header.sequence_number,
            virtual_disk_identifier,
            physical_sector_size,
            parent_locator,
        }),
    };

    Ok(DecodedImage { metadata, map })
}

/// The valid image header with the highest sequence number
fn read_image_header(source: &mut dyn ByteSource) -> Result<ImageHeader> {
    let mut current: Option<ImageHeader> = None;

    for offset in ImageHeader::OFFSETS {
        let mut bytes = [0u8; ImageHeader::SIZE];
        let parsed = source
            .read_exact_at(offset, &mut bytes)
            .map_err(Error::from)
            .and_then(|()| ImageHeader::parse(&bytes));

        match parsed {
            Ok(header) => {
                if current
                    .as_ref()
                    .map_or(true, |best| header.sequence_number > best.sequence_number)
                {
                    current = Some(header);
                }
            }
            Err(e) => tracing::warn!("VHDX image header at {} unusable: {}", offset, e),
        }
    }

    current.ok_or_else(|| Error::invalid_format("VHDX has no valid image header"))
}

/// The primary region table, or the backup if the primary is damaged
fn read_region_table(source: &mut dyn ByteSource) -> Result<RegionTable> {
    let mut last_error = None;

    for offset in RegionTable::OFFSETS {
        match read_region_table_at(source, offset) {
            Ok(table) => return Ok(table),
            Err(e) => {
                tracing::warn!("VHDX region table at {} unusable: {}", offset, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::invalid_format("VHDX has no region table")))
}

fn read_region_table_at(source: &mut dyn ByteSource, offset: u64) -> Result<RegionTable> {
    let mut header = [0u8; RegionTable::HEADER_SIZE];
    source.read_exact_at(offset, &mut header)?;
    let count = RegionTable::entry_count(&header)?;

    let mut bytes = vec![0u8; RegionTable::HEADER_SIZE + count * RegionTable::ENTRY_SIZE];
    source.read_exact_at(offset, &mut bytes)?;
    RegionTable::parse(&bytes)
}

/// Metadata items keyed by GUID
struct MetadataItems(Vec<(FormatGuid, Vec<u8>)>);

impl MetadataItems {
    fn get(&self, item: FormatGuid) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(guid, _)| *guid == item)
            .map(|(_, data)| data.as_slice())
    }

    fn require(&self, item: FormatGuid) -> Result<&[u8]> {
        self.get(item)
            .ok_or_else(|| Error::invalid_format(format!("VHDX metadata lacks {}", item.name())))
    }
}

fn read_metadata(source: &mut dyn ByteSource, region: &RegionEntry) -> Result<MetadataItems> {
    let mut header = [0u8; MetadataTable::HEADER_SIZE];
    source.read_exact_at(region.offset, &mut header)?;
    let count = MetadataTable::entry_count(&header)?;

    let mut bytes = vec![0u8; MetadataTable::HEADER_SIZE + count * MetadataTable::ENTRY_SIZE];
    source.read_exact_at(region.offset, &mut bytes)?;
    let table = MetadataTable::parse(&bytes)?;

    let known = [
        FormatGuid::FILE_PARAMETERS,
        FormatGuid::VIRTUAL_DISK_SIZE,
        FormatGuid::VIRTUAL_DISK_ID,
        FormatGuid::LOGICAL_SECTOR_SIZE,
        FormatGuid::PHYSICAL_SECTOR_SIZE,
        FormatGuid::PARENT_LOCATOR,
    ];

    let mut items = Vec::new();
    for entry in &table.entries {
        if !known.contains(&entry.item) {
            if entry.is_required() {
                return Err(Error::unsupported(format!(
                    "required VHDX metadata item {}",
                    entry.item.to_uuid()
                )));
            }
            continue;
        }
        if entry.offset as u64 + entry.length as u64 > region.length as u64 {
            return Err(Error::invalid_format(format!(
                "VHDX metadata item {} exceeds its region",
                entry.item.name()
            )));
        }

        let length = validate_allocation_size(
            entry.length as u64,
            MAX_METADATA_ITEM as usize,
            "VHDX metadata item",
        )?;
        let mut data = vec![0u8; length];
        source.read_exact_at(checked_add_u64(region.offset, entry.offset as u64, "metadata item")?, &mut data)?;
        items.push((entry.item, data));
    }

    Ok(MetadataItems(items))
}

/// File offset held in the upper 44 bits of a BAT entry, in MiB units
fn entry_offset(entry: u64) -> Result<u64> {
    checked_multiply_u64(entry >> 20, MIB, "VHDX BAT entry offset")
}

fn read_block_allocation_table(
    source: &mut dyn ByteSource,
    region: &RegionEntry,
    media_size: u64,
    block_size: u32,
    logical_sector_size: u32,
    differencing: bool,
) -> Result<BlockAllocationMap> {
    let table_size = validate_allocation_size(
        region.length as u64,
        MAX_TABLE_SIZE,
        "VHDX block allocation table",
    )?;
    let mut table = vec![0u8; table_size];
    source.read_exact_at(region.offset, &mut table)?;

    let raw: Vec<u64> = table
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            u64::from_le_bytes(bytes)
        })
        .collect();

    let chunk_ratio = SECTORS_PER_BITMAP_BLOCK * logical_sector_size as u64 / block_size as u64;
    let payload_blocks = media_size.div_ceil(block_size as u64);
    let sectors_per_block = block_size as u64 / logical_sector_size as u64;

    let table_entry = |index: u64| -> Result<u64> {
        usize::try_from(index)
            .ok()
            .and_then(|index| raw.get(index).copied())
            .ok_or_else(|| {
                Error::invalid_format(format!(
                    "VHDX BAT entry {} beyond table of {} entries",
                    index,
                    raw.len()
                ))
            })
    };

    // Payload entries interleave with one bitmap entry per chunk
    if let Some(last) = payload_blocks.checked_sub(1) {
        let last_entry = last + last / chunk_ratio;
        if last_entry >= raw.len() as u64 {
            return Err(Error::invalid_format(format!(
                "VHDX BAT of {} entries cannot map {} payload blocks",
                raw.len(),
                payload_blocks
            )));
        }
    }

    let mut entries = Vec::with_capacity(u64_to_usize(payload_blocks, "VHDX payload blocks")?);
    for block in 0..payload_blocks {
        let chunk = block / chunk_ratio;
        let entry = table_entry(block + chunk)?;
        let data_offset = entry_offset(entry)?;

        let decoded = match entry & 0x7 {
            PAYLOAD_BLOCK_NOT_PRESENT | PAYLOAD_BLOCK_UNDEFINED => BlockEntry::Absent,
            PAYLOAD_BLOCK_ZERO | PAYLOAD_BLOCK_UNMAPPED => BlockEntry::Zero,
            PAYLOAD_BLOCK_FULLY_PRESENT if data_offset != 0 => BlockEntry::Present { data_offset },
            PAYLOAD_BLOCK_PARTIALLY_PRESENT if data_offset != 0 => {
                let bitmap_entry = table_entry(chunk * (chunk_ratio + 1) + chunk_ratio)?;
                if bitmap_entry & 0x7 != SB_BLOCK_PRESENT {
                    return Err(Error::invalid_format(format!(
                        "VHDX block {} is partially present without a sector bitmap",
                        block
                    )));
                }
                let bitmap_base = entry_offset(bitmap_entry)?;
                let first_sector = (block % chunk_ratio) * sectors_per_block;
                BlockEntry::Partial {
                    data_offset,
                    bitmap_offset: bitmap_base + first_sector / 8,
                }
            }
            state => {
                return Err(Error::invalid_format(format!(
                    "VHDX block {} has invalid state {} at offset {}",
                    block, state, data_offset
                )));
            }
        };
        entries.push(decoded);
    }

    tracing::debug!(
        "VHDX BAT: {} payload blocks, chunk ratio {}",
        payload_blocks,
        chunk_ratio
    );

    BlockAllocationMap::blocks(
        media_size,
        block_size,
        logical_sector_size,
        BitOrder::LsbFirst,
        entries,
        differencing,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bat::RangeState;
    use crate::testutil::{VhdxBlock, VhdxBuilder};
    use std::io::Cursor;
    use uuid::Uuid;
    use vhdi_core::ErrorKind;
    use vhdi_pipeline::StreamSource;

    const MB: u64 = 1024 * 1024;

    fn decode_bytes(bytes: Vec<u8>) -> Result<DecodedImage> {
        let mut source = StreamSource::new(Cursor::new(bytes)).unwrap();
        decode(&mut source)
    }

    #[test]
    fn test_decode_dynamic() {
        let image = VhdxBuilder::dynamic(3 * MB + 1000, &[0, 2]).build();
        let decoded = decode_bytes(image).unwrap();
        let metadata = &decoded.metadata;

        assert_eq!(metadata.file_type, FileType::Vhdx);
        assert_eq!(metadata.format_version, (1, 0));
        assert_eq!(metadata.disk_type, DiskType::Dynamic);
        assert_eq!(metadata.media_size, 3 * MB + 1000);
        assert_eq!(metadata.block_size, MB as u32);
        assert_eq!(metadata.bytes_per_sector, 512);
        assert_eq!(metadata.identifier, Uuid::from_u128(0x3333));
        assert!(metadata.parent_identifier.is_none());

        match &metadata.details {
            FormatDetails::Vhdx(details) => {
                assert_eq!(details.creator, "vhdi test builder");
                assert_eq!(details.sequence_number, 2);
                assert_eq!(details.virtual_disk_identifier, Uuid::from_u128(0x4444));
                assert_eq!(details.physical_sector_size, 4096);
            }
            other => panic!("unexpected details {:?}", other),
        }

        assert_eq!(decoded.map.block_count(), 4);
        assert!(matches!(decoded.map.entry(0), Some(BlockEntry::Present { .. })));
        assert_eq!(decoded.map.entry(1), Some(BlockEntry::Absent));
    }

    #[test]
    fn test_decode_fixed_flag() {
        let mut builder = VhdxBuilder::dynamic(2 * MB, &[0, 1]);
        builder.leave_blocks_allocated = true;
        let decoded = decode_bytes(builder.build()).unwrap();
        assert_eq!(decoded.metadata.disk_type, DiskType::Fixed);
    }

    #[test]
    fn test_decode_differencing() {
        let parent = Uuid::from_u128(0xABCD);
        let image = VhdxBuilder::differencing(
            2 * MB,
            parent,
            "..\\base.vhdx",
            vec![(0, VhdxBlock::Partial(vec![true, false])), (1, VhdxBlock::State(0))],
        )
        .build();

        let mut decoded = decode_bytes(image.clone()).unwrap();
        assert_eq!(decoded.metadata.disk_type, DiskType::Differencing);
        assert_eq!(decoded.metadata.parent_identifier, Some(parent));
        assert_eq!(decoded.metadata.parent_filename.as_deref(), Some("..\\base.vhdx"));

        let mut source = StreamSource::new(Cursor::new(image)).unwrap();
        let range = decoded.map.lookup(&mut source, 0).unwrap();
        assert_eq!(range.state, RangeState::Allocated);
        assert_eq!(range.length, 512);

        let range = decoded.map.lookup(&mut source, 512).unwrap();
        assert_eq!(range.state, RangeState::Parent);
        assert_eq!(range.length, MB - 512);

        let range = decoded.map.lookup(&mut source, MB).unwrap();
        assert_eq!(range.state, RangeState::Parent);
    }

    #[test]
    fn test_zero_states() {
        let mut builder = VhdxBuilder::dynamic(2 * MB, &[]);
        builder.blocks = vec![(0, VhdxBlock::State(2)), (1, VhdxBlock::State(3))];
        let decoded = decode_bytes(builder.build()).unwrap();
        assert_eq!(decoded.map.entry(0), Some(BlockEntry::Zero));
        assert_eq!(decoded.map.entry(1), Some(BlockEntry::Zero));
    }

    #[test]
    fn test_invalid_block_state() {
        let mut builder = VhdxBuilder::dynamic(MB, &[]);
        builder.blocks = vec![(0, VhdxBlock::State(5))];
        let err = decode_bytes(builder.build()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_backup_region_table() {
        let mut builder = VhdxBuilder::dynamic(MB, &[0]);
        builder.corrupt_primary_region_table = true;
        let decoded = decode_bytes(builder.build()).unwrap();
        assert_eq!(decoded.metadata.media_size, MB);
    }

    #[test]
    fn test_older_header_ignored_when_damaged() {
        let mut image = VhdxBuilder::dynamic(MB, &[0]).build();
        // Damage the higher-sequence header; the first one still decodes
        image[128 * 1024..128 * 1024 + 4].copy_from_slice(b"xxxx");
        let decoded = decode_bytes(image).unwrap();
        match decoded.metadata.details {
            FormatDetails::Vhdx(details) => assert_eq!(details.sequence_number, 1),
            other => panic!("unexpected details {:?}", other),
        }
    }

    #[test]
    fn test_no_valid_header() {
        let mut image = VhdxBuilder::dynamic(MB, &[0]).build();
        image[64 * 1024..64 * 1024 + 4].copy_from_slice(b"xxxx");
        image[128 * 1024..128 * 1024 + 4].copy_from_slice(b"xxxx");
        let err = decode_bytes(image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn test_invalid_block_size() {
        let mut builder = VhdxBuilder::dynamic(MB, &[]);
        builder.block_size = 3 * MB as u32;
        let err = decode_bytes(builder.build()).unwrap_err();
        assert!(err.to_string().contains("block size"));
    }

    #[test]
    fn test_media_size_beyond_allocation_table() {
        let media_size = 3 * MB + 1000;
        let mut image = VhdxBuilder::dynamic(media_size, &[0]).build();
        let field = image
            .windows(8)
            .position(|window| window == media_size.to_le_bytes())
            .unwrap();
        image[field..field + 8].copy_from_slice(&(1u64 << 60).to_le_bytes());

        let err = decode_bytes(image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
        assert!(err.to_string().contains("payload blocks"));
    }

    #[test]
    fn test_bad_signature() {
        let mut image = VhdxBuilder::dynamic(MB, &[0]).build();
        image[0] = b'X';
        assert!(decode_bytes(image).is_err());
    }
}

//! Small VHD images written by the tests

use uuid::Uuid;
use vhdi_vaults::vhd::types::{DiskGeometry, ParentLocatorEntry, VhdDynamicHeader, VhdFooter};

fn footer(media_size: u64, disk_type: u32, identifier: Uuid) -> [u8; VhdFooter::SIZE] {
    let mut footer = VhdFooter {
        cookie: *VhdFooter::COOKIE,
        features: 0x00000002,
        version: VhdFooter::VERSION,
        data_offset: if disk_type == 2 {
            VhdFooter::NO_DATA_OFFSET
        } else {
            512
        },
        timestamp: 0,
        creator_app: *b"vhdi",
        creator_version: 0x00010000,
        creator_os: 0x5769326B,
        original_size: media_size,
        current_size: media_size,
        geometry: DiskGeometry {
            cylinders: 1,
            heads: 1,
            sectors: 8,
        },
        disk_type,
        checksum: 0,
        identifier,
        saved_state: 0,
        reserved: [0u8; 427],
    };
    footer.checksum = footer.calculate_checksum();

    let mut bytes = [0u8; VhdFooter::SIZE];
    footer.serialize(&mut bytes);
    bytes
}

/// Fixed VHD whose media is filled with `fill`
pub fn fixed_vhd(media_size: u64, identifier: Uuid, fill: u8) -> Vec<u8> {
    let mut vhd = vec![fill; media_size as usize];
    vhd.extend_from_slice(&footer(media_size, 2, identifier));
    vhd
}

/// Differencing VHD with a single block of `media_size` bytes, none allocated
pub fn differencing_vhd(
    media_size: u64,
    identifier: Uuid,
    parent_identifier: Uuid,
    parent_name: &str,
) -> Vec<u8> {
    let footer = footer(media_size, 4, identifier);

    let mut header = VhdDynamicHeader {
        cookie: *VhdDynamicHeader::COOKIE,
        data_offset: u64::MAX,
        table_offset: 1536,
        header_version: 0x00010000,
        max_table_entries: 1,
        block_size: media_size as u32,
        checksum: 0,
        parent_identifier,
        parent_timestamp: 0,
        reserved1: 0,
        parent_unicode_name: [0u8; 512],
        parent_locator_entries: [ParentLocatorEntry::default(); 8],
        reserved2: [0u8; 256],
    };
    for (i, unit) in parent_name.encode_utf16().enumerate() {
        header.parent_unicode_name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
    }
    header.checksum = header.calculate_checksum();
    let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
    header.serialize(&mut header_bytes);

    let mut vhd = footer.to_vec();
    vhd.extend_from_slice(&header_bytes);
    let mut table = vec![0u8; 512];
    table[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
    vhd.extend_from_slice(&table);
    vhd.extend_from_slice(&footer);
    vhd
}

//! Synthetic image builders shared by the tests

use std::io::Write;
use tempfile::NamedTempFile;
use uuid::Uuid;
use vhdi_core::DiskType;

use crate::vhd::types::{DiskGeometry, ParentLocatorEntry, VhdDynamicHeader, VhdFooter};
use crate::vhdx::types::FormatGuid;

const MIB: u64 = 1024 * 1024;

/// Byte expected at `offset` of a base image
pub fn pattern(offset: u64) -> u8 {
    (offset % 251) as u8
}

/// Byte expected at `offset` where a child image stores its own data
pub fn child_pattern(offset: u64) -> u8 {
    0x80 | (offset % 97) as u8
}

/// Filler written where a sector is not marked present
const GARBAGE: u8 = 0xEE;

/// Per-block content of a sparse image
#[derive(Debug, Clone)]
pub enum BlockContent {
    /// Every sector stored
    Full,
    /// Only sectors whose flag is set are stored
    Sectors(Vec<bool>),
}

/// Write `data` to a temporary file
pub fn write_temp(data: &[u8]) -> NamedTempFile {
    let mut tmpfile = NamedTempFile::new().unwrap();
    tmpfile.write_all(data).unwrap();
    tmpfile.flush().unwrap();
    tmpfile
}

/// Description of a synthetic VHD
pub struct VhdBuilder {
    pub media_size: u64,
    pub disk_type: DiskType,
    pub block_size: u32,
    pub identifier: Uuid,
    pub parent_identifier: Uuid,
    pub parent_name: String,
    pub blocks: Vec<(usize, BlockContent)>,
    pub locators: Vec<([u8; 4], Vec<u8>)>,
    pub fill: fn(u64) -> u8,
}

impl VhdBuilder {
    pub fn fixed(media_size: u64) -> Self {
        Self {
            media_size,
            disk_type: DiskType::Fixed,
            block_size: 0,
            identifier: Uuid::from_u128(0x1111),
            parent_identifier: Uuid::nil(),
            parent_name: String::new(),
            blocks: Vec::new(),
            locators: Vec::new(),
            fill: pattern,
        }
    }

    pub fn dynamic(media_size: u64, block_size: u32, allocated: &[usize]) -> Self {
        Self {
            disk_type: DiskType::Dynamic,
            block_size,
            blocks: allocated.iter().map(|&b| (b, BlockContent::Full)).collect(),
            ..Self::fixed(media_size)
        }
    }

    pub fn differencing(
        media_size: u64,
        block_size: u32,
        parent_identifier: Uuid,
        parent_name: &str,
        blocks: Vec<(usize, BlockContent)>,
    ) -> Self {
        Self {
            disk_type: DiskType::Differencing,
            block_size,
            identifier: Uuid::from_u128(0x2222),
            parent_identifier,
            parent_name: parent_name.to_string(),
            blocks,
            fill: child_pattern,
            ..Self::fixed(media_size)
        }
    }

    pub fn with_identifier(mut self, identifier: Uuid) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn footer(&self) -> VhdFooter {
        let mut footer = VhdFooter {
            cookie: *VhdFooter::COOKIE,
            features: 0x00000002,
            version: VhdFooter::VERSION,
            data_offset: if self.disk_type == DiskType::Fixed {
                VhdFooter::NO_DATA_OFFSET
            } else {
                512
            },
            timestamp: 0,
            creator_app: *b"test",
            creator_version: 0x00010000,
            creator_os: 0x5769326B, // Wi2k
            original_size: self.media_size,
            current_size: self.media_size,
            geometry: DiskGeometry {
                cylinders: 1024,
                heads: 16,
                sectors: 63,
            },
            disk_type: self.disk_type as u32,
            checksum: 0,
            identifier: self.identifier,
            saved_state: 0,
            reserved: [0u8; 427],
        };
        footer.checksum = footer.calculate_checksum();
        footer
    }

    pub fn build(&self) -> Vec<u8> {
        let footer = self.footer();
        let mut footer_bytes = [0u8; VhdFooter::SIZE];
        footer.serialize(&mut footer_bytes);

        if self.disk_type == DiskType::Fixed {
            let mut vhd: Vec<u8> = (0..self.media_size).map(self.fill).collect();
            vhd.extend_from_slice(&footer_bytes);
            return vhd;
        }

        let block_size = self.block_size as u64;
        let block_count = self.media_size.div_ceil(block_size) as usize;
        let table_offset = (VhdFooter::SIZE + VhdDynamicHeader::SIZE) as u64;

        let mut vhd = footer_bytes.to_vec();
        vhd.resize(table_offset as usize, 0);
        vhd.resize((table_offset as usize + block_count * 4).next_multiple_of(512), 0);

        // Parent locator payloads, one sector-aligned run each
        let mut locator_entries = [ParentLocatorEntry::default(); 8];
        for (slot, (code, data)) in self.locators.iter().enumerate() {
            let offset = vhd.len() as u64;
            vhd.extend_from_slice(data);
            vhd.resize(vhd.len().next_multiple_of(512), 0);
            locator_entries[slot] = ParentLocatorEntry {
                platform_code: *code,
                data_space: (data.len() as u32).div_ceil(512),
                data_length: data.len() as u32,
                reserved: 0,
                data_offset: offset,
            };
        }

        let mut header = VhdDynamicHeader {
            cookie: *VhdDynamicHeader::COOKIE,
            data_offset: u64::MAX,
            table_offset,
            header_version: 0x00010000,
            max_table_entries: block_count as u32,
            block_size: self.block_size,
            checksum: 0,
            parent_identifier: self.parent_identifier,
            parent_timestamp: 0,
            reserved1: 0,
            parent_unicode_name: [0u8; 512],
            parent_locator_entries: locator_entries,
            reserved2: [0u8; 256],
        };
        for (i, unit) in self.parent_name.encode_utf16().take(256).enumerate() {
            header.parent_unicode_name[i * 2..i * 2 + 2].copy_from_slice(&unit.to_be_bytes());
        }
        header.checksum = header.calculate_checksum();
        let mut header_bytes = [0u8; VhdDynamicHeader::SIZE];
        header.serialize(&mut header_bytes);
        vhd[512..1536].copy_from_slice(&header_bytes);

        let bitmap_size = header.sector_bitmap_size() as usize;
        let sectors = (block_size / 512) as usize;
        let mut bat = vec![0xFFFF_FFFFu32; block_count];

        for (block, content) in &self.blocks {
            bat[*block] = (vhd.len() / 512) as u32;

            let present: Vec<bool> = match content {
                BlockContent::Full => vec![true; sectors],
                BlockContent::Sectors(flags) => flags.clone(),
            };

            let mut bitmap = vec![0u8; bitmap_size];
            for (sector, _) in present.iter().enumerate().filter(|&(_, &p)| p) {
                bitmap[sector / 8] |= 0x80 >> (sector % 8);
            }
            vhd.extend_from_slice(&bitmap);

            let base = *block as u64 * block_size;
            for i in 0..block_size {
                let stored = present.get((i / 512) as usize).copied().unwrap_or(false);
                vhd.push(if stored { (self.fill)(base + i) } else { GARBAGE });
            }
        }

        for (i, entry) in bat.iter().enumerate() {
            let at = table_offset as usize + i * 4;
            vhd[at..at + 4].copy_from_slice(&entry.to_be_bytes());
        }

        vhd.extend_from_slice(&footer_bytes);
        vhd
    }
}

/// Payload block state written by [`VhdxBuilder`]
#[derive(Debug, Clone)]
pub enum VhdxBlock {
    /// State 6
    Full,
    /// State 7 with the given sector flags
    Partial(Vec<bool>),
    /// Raw state with no data (0, 1, 2 or 3)
    State(u8),
}

/// Description of a synthetic VHDX
pub struct VhdxBuilder {
    pub media_size: u64,
    pub block_size: u32,
    pub logical_sector_size: u32,
    pub leave_blocks_allocated: bool,
    pub identifier: Uuid,
    pub virtual_disk_identifier: Uuid,
    pub parent: Option<Vec<(String, String)>>,
    pub blocks: Vec<(usize, VhdxBlock)>,
    pub fill: fn(u64) -> u8,
    pub corrupt_primary_region_table: bool,
}

impl VhdxBuilder {
    pub fn dynamic(media_size: u64, allocated: &[usize]) -> Self {
        Self {
            media_size,
            block_size: MIB as u32,
            logical_sector_size: 512,
            leave_blocks_allocated: false,
            identifier: Uuid::from_u128(0x3333),
            virtual_disk_identifier: Uuid::from_u128(0x4444),
            parent: None,
            blocks: allocated.iter().map(|&b| (b, VhdxBlock::Full)).collect(),
            fill: pattern,
            corrupt_primary_region_table: false,
        }
    }

    pub fn differencing(
        media_size: u64,
        parent_identifier: Uuid,
        relative_path: &str,
        blocks: Vec<(usize, VhdxBlock)>,
    ) -> Self {
        Self {
            identifier: Uuid::from_u128(0x5555),
            parent: Some(vec![
                (
                    "parent_linkage".to_string(),
                    format!("{{{}}}", parent_identifier),
                ),
                ("relative_path".to_string(), relative_path.to_string()),
            ]),
            blocks,
            fill: child_pattern,
            ..Self::dynamic(media_size, &[])
        }
    }

    fn put_u16(buf: &mut [u8], at: usize, value: u16) {
        buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], at: usize, value: u32) {
        buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buf: &mut [u8], at: usize, value: u64) {
        buf[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn utf16le(text: &str) -> Vec<u8> {
        text.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    fn parent_locator_item(&self, pairs: &[(String, String)]) -> Vec<u8> {
        let mut item = vec![0u8; 20 + pairs.len() * 12];
        item[0..16].copy_from_slice(&FormatGuid::PARENT_LOCATOR_TYPE_VHDX.0);
        Self::put_u16(&mut item, 18, pairs.len() as u16);
        for (i, (key, value)) in pairs.iter().enumerate() {
            let key = Self::utf16le(key);
            let value = Self::utf16le(value);
            let entry = 20 + i * 12;
            let key_offset = item.len() as u32;
            item.extend_from_slice(&key);
            let value_offset = item.len() as u32;
            item.extend_from_slice(&value);
            Self::put_u32(&mut item, entry, key_offset);
            Self::put_u32(&mut item, entry + 4, value_offset);
            Self::put_u16(&mut item, entry + 8, key.len() as u16);
            Self::put_u16(&mut item, entry + 10, value.len() as u16);
        }
        item
    }

    pub fn build(&self) -> Vec<u8> {
        let block_size = self.block_size as u64;
        let chunk_ratio = ((1u64 << 23) * self.logical_sector_size as u64 / block_size) as usize;
        let payload_blocks = self.media_size.div_ceil(block_size) as usize;
        let chunks = payload_blocks.div_ceil(chunk_ratio);
        let bat_entries = if self.parent.is_some() {
            chunks * (chunk_ratio + 1)
        } else {
            payload_blocks + (payload_blocks - 1) / chunk_ratio
        };

        let metadata_offset = MIB;
        let bat_offset = 2 * MIB;
        let bat_length = ((bat_entries * 8) as u64).next_multiple_of(MIB);

        let mut file = vec![0u8; (bat_offset + bat_length) as usize];

        // File type identifier
        file[0..8].copy_from_slice(b"vhdxfile");
        let creator = Self::utf16le("vhdi test builder");
        file[8..8 + creator.len()].copy_from_slice(&creator);

        // Image headers; the second has the higher sequence number
        for (at, sequence) in [(64 * 1024usize, 1u64), (128 * 1024, 2)] {
            file[at..at + 4].copy_from_slice(b"head");
            Self::put_u64(&mut file, at + 8, sequence);
            file[at + 32..at + 48].copy_from_slice(&self.identifier.to_bytes_le());
            Self::put_u16(&mut file, at + 66, 1);
            Self::put_u32(&mut file, at + 68, MIB as u32);
            Self::put_u64(&mut file, at + 72, MIB);
        }

        // Region table and its backup
        for at in [192 * 1024usize, 256 * 1024] {
            file[at..at + 4].copy_from_slice(b"regi");
            Self::put_u32(&mut file, at + 8, 2);
            let regions = [
                (FormatGuid::BAT_REGION, bat_offset, bat_length),
                (FormatGuid::METADATA_REGION, metadata_offset, MIB),
            ];
            for (i, (guid, offset, length)) in regions.iter().enumerate() {
                let entry = at + 16 + i * 32;
                file[entry..entry + 16].copy_from_slice(&guid.0);
                Self::put_u64(&mut file, entry + 16, *offset);
                Self::put_u32(&mut file, entry + 24, *length as u32);
                Self::put_u32(&mut file, entry + 28, 1);
            }
        }
        if self.corrupt_primary_region_table {
            file[192 * 1024..192 * 1024 + 4].copy_from_slice(b"junk");
        }

        // Metadata table with items from 64 KiB into the region
        let mut file_parameters = [0u8; 8];
        Self::put_u32(&mut file_parameters, 0, self.block_size);
        let flags =
            u32::from(self.leave_blocks_allocated) | (u32::from(self.parent.is_some()) << 1);
        Self::put_u32(&mut file_parameters, 4, flags);

        let mut items: Vec<(FormatGuid, Vec<u8>)> = vec![
            (FormatGuid::FILE_PARAMETERS, file_parameters.to_vec()),
            (
                FormatGuid::VIRTUAL_DISK_SIZE,
                self.media_size.to_le_bytes().to_vec(),
            ),
            (
                FormatGuid::VIRTUAL_DISK_ID,
                self.virtual_disk_identifier.to_bytes_le().to_vec(),
            ),
            (
                FormatGuid::LOGICAL_SECTOR_SIZE,
                self.logical_sector_size.to_le_bytes().to_vec(),
            ),
            (
                FormatGuid::PHYSICAL_SECTOR_SIZE,
                4096u32.to_le_bytes().to_vec(),
            ),
        ];
        if let Some(pairs) = &self.parent {
            items.push((FormatGuid::PARENT_LOCATOR, self.parent_locator_item(pairs)));
        }

        let table = metadata_offset as usize;
        file[table..table + 8].copy_from_slice(b"metadata");
        Self::put_u16(&mut file, table + 10, items.len() as u16);
        let mut item_offset = 64 * 1024usize;
        for (i, (guid, data)) in items.iter().enumerate() {
            let entry = table + 32 + i * 32;
            file[entry..entry + 16].copy_from_slice(&guid.0);
            Self::put_u32(&mut file, entry + 16, item_offset as u32);
            Self::put_u32(&mut file, entry + 20, data.len() as u32);
            Self::put_u32(&mut file, entry + 24, 0b100);
            file[table + item_offset..table + item_offset + data.len()].copy_from_slice(data);
            item_offset += data.len().next_multiple_of(8);
        }

        // Payload blocks, then one sector bitmap block per chunk that needs it
        let sectors_per_block = (block_size / self.logical_sector_size as u64) as usize;
        let mut bat = vec![0u64; bat_entries];
        let mut bitmaps: Vec<Option<Vec<u8>>> = vec![None; chunks];

        for (block, content) in &self.blocks {
            let index = block + block / chunk_ratio;
            let state = match content {
                VhdxBlock::State(state) => {
                    bat[index] = *state as u64;
                    continue;
                }
                VhdxBlock::Full => 6u64,
                VhdxBlock::Partial(_) => 7u64,
            };

            let data_offset = file.len() as u64;
            let base = *block as u64 * block_size;
            let present = |i: u64| match content {
                VhdxBlock::Partial(flags) => flags
                    .get((i / self.logical_sector_size as u64) as usize)
                    .copied()
                    .unwrap_or(false),
                _ => true,
            };
            for i in 0..block_size {
                file.push(if present(i) { (self.fill)(base + i) } else { GARBAGE });
            }
            bat[index] = state | (data_offset / MIB) << 20;

            if let VhdxBlock::Partial(flags) = content {
                let chunk = block / chunk_ratio;
                let bitmap =
                    bitmaps[chunk].get_or_insert_with(|| vec![0u8; MIB as usize]);
                let first = (block % chunk_ratio) * sectors_per_block;
                for (sector, _) in flags.iter().enumerate().filter(|&(_, &p)| p) {
                    let bit = first + sector;
                    bitmap[bit / 8] |= 1 << (bit % 8);
                }
            }
        }

        for (chunk, bitmap) in bitmaps.into_iter().enumerate() {
            if let Some(bitmap) = bitmap {
                let offset = file.len() as u64;
                file.extend_from_slice(&bitmap);
                bat[chunk * (chunk_ratio + 1) + chunk_ratio] = 6 | (offset / MIB) << 20;
            }
        }

        for (i, entry) in bat.iter().enumerate() {
            Self::put_u64(&mut file, bat_offset as usize + i * 8, *entry);
        }

        file
    }
}

/// Deterministic pseudo-random sequence for sampling tests
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 11
    }

    /// Uniform value in `0..bound`
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

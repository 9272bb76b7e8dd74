//! Block allocation map
//!
//! Translates logical media offsets into ranges that are stored in this
//! container, read as zeros, or must be read from the parent image. Built
//! once at open time by the format decoders.

use vhdi_core::{checked_add_u64, ByteSource, Error, Result};

/// Where the bytes of a range come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeState {
    /// Stored in this container at `file_offset`
    Allocated,
    /// Sparse, reads as zeros
    Zero,
    /// Not stored here; read from the parent image at the same offset
    Parent,
}

/// A run of bytes sharing one state, starting at the looked-up offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub state: RangeState,
    /// Container offset of the first byte, meaningful for `Allocated`
    pub file_offset: u64,
    pub length: u64,
}

/// Decoded state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockEntry {
    /// Every sector stored locally
    Present { data_offset: u64 },
    /// A sector bitmap at `bitmap_offset` marks the locally stored sectors
    Partial { data_offset: u64, bitmap_offset: u64 },
    /// Not stored; resolved by the map's fallback state
    Absent,
    /// Explicitly zero
    Zero,
}

/// Bit order of a sector bitmap byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOrder {
    /// Sector 0 is bit 7 (VHD)
    MsbFirst,
    /// Sector 0 is bit 0 (VHDX)
    LsbFirst,
}

#[derive(Debug, Clone)]
enum Layout {
    /// Media bytes stored contiguously from offset 0
    Contiguous,
    Blocks {
        block_size: u64,
        sector_size: u64,
        bit_order: BitOrder,
        entries: Vec<BlockEntry>,
    },
}

/// Block allocation map of one container
#[derive(Debug, Clone)]
pub struct BlockAllocationMap {
    media_size: u64,
    layout: Layout,
    fallback: RangeState,
    /// Last decoded sector bitmap, keyed by block index
    bitmap_cache: Option<(usize, Vec<u8>)>,
}

impl BlockAllocationMap {
    /// Map for a fixed disk whose media starts at container offset 0
    pub fn contiguous(media_size: u64) -> Self {
        Self {
            media_size,
            layout: Layout::Contiguous,
            fallback: RangeState::Zero,
            bitmap_cache: None,
        }
    }

    /// Map over per-block entries
    ///
    /// `differencing` selects what absent blocks and unset bitmap bits
    /// resolve to: the parent image, or zeros.
    pub fn blocks(
        media_size: u64,
        block_size: u32,
        sector_size: u32,
        bit_order: BitOrder,
        entries: Vec<BlockEntry>,
        differencing: bool,
    ) -> Result<Self> {
        if block_size == 0 || sector_size == 0 || block_size % sector_size != 0 {
            return Err(Error::invalid_format(format!(
                "block size {} is not a multiple of sector size {}",
                block_size, sector_size
            )));
        }

        let needed = media_size.div_ceil(block_size as u64);
        if (entries.len() as u64) < needed {
            return Err(Error::invalid_format(format!(
                "allocation table has {} entries, media needs {}",
                entries.len(),
                needed
            )));
        }

        Ok(Self {
            media_size,
            layout: Layout::Blocks {
                block_size: block_size as u64,
                sector_size: sector_size as u64,
                bit_order,
                entries,
            },
            fallback: if differencing {
                RangeState::Parent
            } else {
                RangeState::Zero
            },
            bitmap_cache: None,
        })
    }

    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    /// Number of blocks, or 0 for a contiguous map
    pub fn block_count(&self) -> usize {
        match &self.layout {
            Layout::Contiguous => 0,
            Layout::Blocks { entries, .. } => entries.len(),
        }
    }

    /// Entry for one block
    pub fn entry(&self, block_index: usize) -> Option<BlockEntry> {
        match &self.layout {
            Layout::Contiguous => None,
            Layout::Blocks { entries, .. } => entries.get(block_index).copied(),
        }
    }

    /// Resolve the range starting at `offset`
    ///
    /// The returned length never crosses a block boundary or the media end.
    /// Sector bitmaps are read from `source` on demand.
    pub fn lookup(&mut self, source: &mut dyn ByteSource, offset: u64) -> Result<BlockRange> {
        if offset >= self.media_size {
            return Err(Error::invalid_argument(format!(
                "offset {} beyond media size {}",
                offset, self.media_size
            )));
        }
        let to_media_end = self.media_size - offset;
        let fallback = self.fallback;

        let (block_size, sector_size, bit_order, entry, block_index) = match &self.layout {
            Layout::Contiguous => {
                return Ok(BlockRange {
                    state: RangeState::Allocated,
                    file_offset: offset,
                    length: to_media_end,
                });
            }
            Layout::Blocks {
                block_size,
                sector_size,
                bit_order,
                entries,
            } => {
                let block_index = (offset / block_size) as usize;
                let entry = entries.get(block_index).copied().ok_or_else(|| {
                    Error::invalid_format(format!("missing allocation entry {}", block_index))
                })?;
                (*block_size, *sector_size, *bit_order, entry, block_index)
            }
        };

        let within = offset % block_size;
        let to_block_end = (block_size - within).min(to_media_end);

        let range = match entry {
            BlockEntry::Present { data_offset } => BlockRange {
                state: RangeState::Allocated,
                file_offset: checked_add_u64(data_offset, within, "block data offset")?,
                length: to_block_end,
            },
            BlockEntry::Absent => BlockRange {
                state: fallback,
                file_offset: 0,
                length: to_block_end,
            },
            BlockEntry::Zero => BlockRange {
                state: RangeState::Zero,
                file_offset: 0,
                length: to_block_end,
            },
            BlockEntry::Partial {
                data_offset,
                bitmap_offset,
            } => {
                let sectors = block_size / sector_size;
                let bitmap =
                    self.sector_bitmap(source, block_index, bitmap_offset, sectors)?;

                let first = within / sector_size;
                let present = bit_set(bitmap, bit_order, first);
                let mut run_end = first + 1;
                while run_end < sectors && bit_set(bitmap, bit_order, run_end) == present {
                    run_end += 1;
                }

                BlockRange {
                    state: if present {
                        RangeState::Allocated
                    } else {
                        fallback
                    },
                    file_offset: checked_add_u64(data_offset, within, "block data offset")?,
                    length: (run_end * sector_size - within).min(to_block_end),
                }
            }
        };

        Ok(range)
    }

    fn sector_bitmap(
        &mut self,
        source: &mut dyn ByteSource,
        block_index: usize,
        bitmap_offset: u64,
        sectors: u64,
    ) -> Result<&[u8]> {
        let cached = matches!(&self.bitmap_cache, Some((index, _)) if *index == block_index);
        if !cached {
            let mut bitmap = vec![0u8; sectors.div_ceil(8) as usize];
            source.read_exact_at(bitmap_offset, &mut bitmap)?;
            tracing::trace!("loaded sector bitmap of block {}", block_index);
            self.bitmap_cache = Some((block_index, bitmap));
        }

        match &self.bitmap_cache {
            Some((_, bitmap)) => Ok(bitmap),
            None => Err(Error::invalid_operation("sector bitmap cache is empty")),
        }
    }
}

fn bit_set(bitmap: &[u8], order: BitOrder, sector: u64) -> bool {
    let byte = bitmap[(sector / 8) as usize];
    let bit = (sector % 8) as u8;
    match order {
        BitOrder::MsbFirst => byte & (0x80 >> bit) != 0,
        BitOrder::LsbFirst => byte & (1 << bit) != 0,
    }
}

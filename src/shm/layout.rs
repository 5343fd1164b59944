/// `#[repr(C)]` structures that live in the shared segment.
///
/// All structs use fixed-size fields and explicit padding so the layout is
/// identical across compilations and processes. Links between structures are
/// always indices (`i32`, `NIL` = none), never pointers, so every process can
/// interpret them regardless of where the segment is mapped.
///
/// Data segment:
///   [Header][BlockDesc x slab_count][FileEntry x file_entry_count][pad]
///   [slab 0][slab 1]...[slab slab_count-1]
///
/// A slab is either one cache block of file data or `mtbl_per_block`
/// block tables, each laid out as
///   [TableHeader][bucket: i32 x mem_hash_size][pad][MemEntry x mem_entry_count]
use std::sync::atomic::AtomicU64;

use crate::config::CacheConfig;
use crate::error::{Result, UCacheError};

/// Magic bytes at the start of the header to validate the mapping.
pub const MAGIC: [u8; 8] = *b"UCACHE01";

pub const LAYOUT_VERSION: u32 = 1;

/// Size of the fixed header at the start of the region.
pub const HEADER_SIZE: usize = 256;

/// Sentinel meaning "no entry" in every index link.
pub const NIL: i32 = -1;

/// Slabs start on a page boundary.
pub const SLAB_ALIGN: usize = 4096;

/// Slab 0 is formatted into block tables at bootstrap and never released.
pub const PINNED_TABLE_SLAB: u32 = 0;

/// Header lives at offset 0 of the data segment.
///
/// Fields are ordered u64-first to avoid implicit alignment padding.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    // 8-byte aligned group
    pub magic: [u8; 8],        // 0..8
    pub hits: AtomicU64,       // 8..16
    pub misses: AtomicU64,     // 16..24
    pub evictions: AtomicU64,  // 24..32
    pub writebacks: AtomicU64, // 32..40
    pub fallbacks: AtomicU64,  // 40..48

    // 4-byte aligned group
    pub version: u32,          // 48..52
    pub block_size: u32,       // 52..56
    pub block_count: u32,      // 56..60
    pub slab_count: u32,       // 60..64
    pub file_hash_size: u32,   // 64..68
    pub file_entry_count: u32, // 68..72
    pub mem_hash_size: u32,    // 72..76
    pub mem_entry_count: u32,  // 76..80
    pub mtbl_size: u32,        // 80..84
    pub mtbl_per_block: u32,   // 84..88
    pub free_blk: i32,         // 88..92  (free data-capable slabs)
    pub free_fent: i32,        // 92..96  (overflow file entries)
    pub free_mtbl_blk: i32,    // 96..100 (free block-table slots)
    pub free_mtbl_ent: i32,    // 100..104
    pub resident_blocks: u32,  // 104..108
    pub table_slabs: u32,      // 108..112
    pub open_files: u32,       // 112..116
    pub flags: u32,            // 116..120 (HDR_PROVISIONAL_DIRTY)

    // Explicit padding to 256 bytes: 256 - 120 = 136
    pub _pad: [u8; 136],
}

const _: () = assert!(std::mem::size_of::<Header>() == HEADER_SIZE);

pub const HDR_PROVISIONAL_DIRTY: u32 = 1;

/// Slab states recorded in `BlockDesc::state`.
pub const SLAB_FREE: u32 = 0;
pub const SLAB_DATA: u32 = 1;
pub const SLAB_TABLES: u32 = 2;

/// Per-slab descriptor. Kept outside the slab so a data block's bytes are
/// never reinterpreted as free-list links.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BlockDesc {
    pub state: u32,
    pub next_free: i32,
    pub tables_in_use: u32,
    pub generation: u32,
}

const _: () = assert!(std::mem::size_of::<BlockDesc>() == 16);

/// One entry of the file index.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct FileEntry {
    pub handle: u64,     // 0..8
    pub size: u64,       // 8..16  (highest byte known to exist)
    pub fs_id: u32,      // 16..20
    pub in_use: u32,     // 20..24
    pub mtbl_blk: i32,   // 24..28
    pub mtbl_ent: i32,   // 28..32
    pub next: i32,       // 32..36 (collision chain, or free list)
    pub generation: u32, // 36..40
}

const _: () = assert!(std::mem::size_of::<FileEntry>() == 40);

/// Fixed part of a block table.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct TableHeader {
    pub lru_first: i32,     // most recently used
    pub lru_last: i32,      // least recently used
    pub dirty_list: i32,
    pub free_list: i32,     // free memory entries
    pub num_blocks: u32,
    pub ref_cnt: u32,
    pub free_next_blk: i32, // table-slot free list while unused
    pub free_next_ent: i32,
    pub in_use: u32,
    pub fent: i32,
    pub _pad: [u32; 2],
}

pub const TABLE_HEADER_SIZE: usize = 48;
const _: () = assert!(std::mem::size_of::<TableHeader>() == TABLE_HEADER_SIZE);

pub const MENT_IN_USE: u32 = 1;
pub const MENT_DIRTY: u32 = 2;

/// One resident block of one file.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MemEntry {
    pub tag: u64,        // 0..8   block-aligned file offset
    pub item: i32,       // 8..12  slab index of the data block
    pub next: i32,       // 12..16 hash chain, or free list
    pub dirty_next: i32, // 16..20
    pub lru_prev: i32,   // 20..24
    pub lru_next: i32,   // 24..28
    pub flags: u32,      // 28..32
    pub valid_len: u32,  // 32..36 bytes of the block holding file data
    pub _pad: u32,       // 36..40
}

pub const MEM_ENTRY_SIZE: usize = 40;
const _: () = assert!(std::mem::size_of::<MemEntry>() == MEM_ENTRY_SIZE);

impl MemEntry {
    pub fn is_in_use(&self) -> bool {
        self.flags & MENT_IN_USE != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.flags & MENT_DIRTY != 0
    }
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Offsets and sizes derived from a `CacheConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: usize,
    pub block_count: u32,
    pub slab_count: u32,
    pub file_hash_size: u32,
    pub file_entry_count: u32,
    pub mem_hash_size: u32,
    pub mem_entry_count: u32,
    pub mtbl_size: usize,
    pub mtbl_per_block: u32,
    pub desc_offset: usize,
    pub fent_offset: usize,
    pub slab_offset: usize,
    pub region_size: usize,
}

impl Geometry {
    pub fn for_config(cfg: &CacheConfig) -> Result<Self> {
        cfg.validate()?;
        let mtbl_size = table_size(cfg.mem_hash_size, cfg.mem_entry_count);
        let mtbl_per_block = cfg.block_size / mtbl_size;
        if mtbl_per_block == 0 {
            return Err(UCacheError::Config(format!(
                "a block table of {mtbl_size} bytes does not fit in a {} byte block",
                cfg.block_size
            )));
        }
        // One extra slab is pinned for block tables from the start.
        let slab_count = cfg.block_count + 1;
        let desc_offset = HEADER_SIZE;
        let fent_offset = desc_offset + slab_count as usize * std::mem::size_of::<BlockDesc>();
        let fent_end =
            fent_offset + cfg.file_entry_count as usize * std::mem::size_of::<FileEntry>();
        let slab_offset = align_up(fent_end, SLAB_ALIGN);
        let region_size = slab_offset + slab_count as usize * cfg.block_size;

        Ok(Geometry {
            block_size: cfg.block_size,
            block_count: cfg.block_count,
            slab_count,
            file_hash_size: cfg.file_hash_size,
            file_entry_count: cfg.file_entry_count,
            mem_hash_size: cfg.mem_hash_size,
            mem_entry_count: cfg.mem_entry_count,
            mtbl_size,
            mtbl_per_block: mtbl_per_block.min(i32::MAX as usize) as u32,
            desc_offset,
            fent_offset,
            slab_offset,
            region_size,
        })
    }

    /// Offset of the bucket array inside a block table.
    pub fn bucket_offset(&self) -> usize {
        TABLE_HEADER_SIZE
    }

    /// Offset of the memory-entry array inside a block table.
    pub fn ment_offset(&self) -> usize {
        align_up(TABLE_HEADER_SIZE + self.mem_hash_size as usize * 4, 8)
    }

    /// Confirm that an existing header describes this geometry.
    pub fn check_header(&self, header: &Header) -> Result<()> {
        if header.magic != MAGIC {
            return Err(UCacheError::Layout("bad magic".to_owned()));
        }
        if header.version != LAYOUT_VERSION {
            return Err(UCacheError::Layout(format!(
                "layout version {} != {LAYOUT_VERSION}",
                header.version
            )));
        }
        let matches = header.block_size as usize == self.block_size
            && header.block_count == self.block_count
            && header.slab_count == self.slab_count
            && header.file_hash_size == self.file_hash_size
            && header.file_entry_count == self.file_entry_count
            && header.mem_hash_size == self.mem_hash_size
            && header.mem_entry_count == self.mem_entry_count
            && header.mtbl_size as usize == self.mtbl_size
            && header.mtbl_per_block == self.mtbl_per_block;
        if !matches {
            return Err(UCacheError::Layout(
                "segment was built with a different cache configuration".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Bytes taken by one block table with the given hash and entry counts.
pub fn table_size(mem_hash_size: u32, mem_entry_count: u32) -> usize {
    let ment_offset = align_up(TABLE_HEADER_SIZE + mem_hash_size as usize * 4, 8);
    align_up(ment_offset + mem_entry_count as usize * MEM_ENTRY_SIZE, 8)
}

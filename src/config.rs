//! Cache geometry.
//!
//! The defaults are build-time constants; every process attaching to the same
//! segment must agree on them. The chosen values are recorded in the segment
//! header at bootstrap so a mismatch is detected instead of misread.

use crate::error::{Result, UCacheError};

/// Size of one cached block of file data.
pub const CACHE_BLOCK_SIZE: usize = 256 * 1024;
/// Number of data-capable slabs in the segment.
pub const BLOCKS_IN_CACHE: u32 = 512;
/// Direct-mapped slots in the file index.
pub const FILE_TABLE_HASH_MAX: u32 = 64;
/// Total file entries (direct slots plus overflow pool).
pub const FILE_TABLE_ENTRY_COUNT: u32 = 256;
/// Buckets in each per-file block table.
pub const MEM_TABLE_HASH_MAX: u32 = 32;
/// Memory entries per block table; the most blocks one file can hold.
pub const MEM_TABLE_ENTRY_COUNT: u32 = 128;

/// Smallest block size that still leaves room for a useful block table.
pub const MIN_BLOCK_SIZE: usize = 512;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub block_size: usize,
    pub block_count: u32,
    pub file_hash_size: u32,
    pub file_entry_count: u32,
    pub mem_hash_size: u32,
    pub mem_entry_count: u32,
    /// Link every inserted block onto the dirty list, as older clients did.
    pub provisional_dirty: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            block_size: CACHE_BLOCK_SIZE,
            block_count: BLOCKS_IN_CACHE,
            file_hash_size: FILE_TABLE_HASH_MAX,
            file_entry_count: FILE_TABLE_ENTRY_COUNT,
            mem_hash_size: MEM_TABLE_HASH_MAX,
            mem_entry_count: MEM_TABLE_ENTRY_COUNT,
            provisional_dirty: false,
        }
    }
}

impl CacheConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_block_count(mut self, block_count: u32) -> Self {
        self.block_count = block_count;
        self
    }

    pub fn with_file_table(mut self, hash_size: u32, entry_count: u32) -> Self {
        self.file_hash_size = hash_size;
        self.file_entry_count = entry_count;
        self
    }

    pub fn with_mem_table(mut self, hash_size: u32, entry_count: u32) -> Self {
        self.mem_hash_size = hash_size;
        self.mem_entry_count = entry_count;
        self
    }

    pub fn with_provisional_dirty(mut self, on: bool) -> Self {
        self.provisional_dirty = on;
        self
    }

    /// Check the limits that do not depend on table layout. Whether a block
    /// table fits in one slab is checked by `Geometry::for_config`.
    pub fn validate(&self) -> Result<()> {
        if !self.block_size.is_power_of_two() || self.block_size < MIN_BLOCK_SIZE {
            return Err(UCacheError::Config(format!(
                "block_size={} must be a power of two >= {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if self.block_size > u32::MAX as usize {
            return Err(UCacheError::Config(format!(
                "block_size={} does not fit the segment header",
                self.block_size
            )));
        }
        if self.block_count == 0 || self.block_count >= i32::MAX as u32 {
            return Err(UCacheError::Config(format!(
                "block_count={} out of range",
                self.block_count
            )));
        }
        if self.file_hash_size == 0 || self.file_entry_count < self.file_hash_size {
            return Err(UCacheError::Config(format!(
                "file table needs 0 < hash_size ({}) <= entry_count ({})",
                self.file_hash_size, self.file_entry_count
            )));
        }
        if self.mem_hash_size == 0 || self.mem_entry_count == 0 {
            return Err(UCacheError::Config(
                "memory table hash size and entry count must be non-zero".to_owned(),
            ));
        }
        if self.file_entry_count >= i32::MAX as u32 || self.mem_entry_count >= i32::MAX as u32 {
            return Err(UCacheError::Config("table entry count out of range".to_owned()));
        }
        Ok(())
    }
}

/// Shared-memory segment backing the user-level block cache.
///
/// `ShmRegion` owns the two mappings. `Arena` is an index-addressed view of
/// the data segment: every accessor bounds-checks its index and reports a
/// `Corrupt` error rather than touching memory outside the segment, since
/// other processes depend on the same structures.
///
/// Mutable access to the arena is only handed out through `IndexGuard`, which
/// holds the global lock for its lifetime.
pub mod layout;
pub mod lock;
pub mod region;

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};

use layout::{
    BlockDesc, FileEntry, Geometry, Header, MemEntry, TableHeader, NIL, SLAB_TABLES,
};
use lock::ShmSeqLock;
use region::ShmRegion;

use crate::error::{Result, UCacheError};

/// Location of one block table: slab index plus slot within the slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub blk: u32,
    pub ent: u32,
}

/// Convert a stored link into an index, rejecting `NIL` and out-of-range values.
#[inline]
pub(crate) fn link(value: i32, bound: u32, what: &str) -> Result<u32> {
    if value < 0 || value as u32 >= bound {
        return Err(UCacheError::corrupt(format!(
            "{what} link {value} outside 0..{bound}"
        )));
    }
    Ok(value as u32)
}

/// Like `link`, but `NIL` maps to `None`.
#[inline]
pub(crate) fn opt_link(value: i32, bound: u32, what: &str) -> Result<Option<u32>> {
    if value == NIL {
        return Ok(None);
    }
    link(value, bound, what).map(Some)
}

pub(crate) struct Arena {
    base: *mut u8,
    geo: Geometry,
}

impl Arena {
    /// # Safety
    /// `base` must point to a mapped data segment of `geo.region_size` bytes
    /// that outlives the arena.
    pub(crate) unsafe fn new(base: *mut u8, geo: Geometry) -> Self {
        Arena { base, geo }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    pub fn header_mut(&mut self) -> &mut Header {
        unsafe { &mut *(self.base as *mut Header) }
    }

    fn desc_ptr(&self, blk: u32) -> Result<*mut BlockDesc> {
        if blk >= self.geo.slab_count {
            return Err(UCacheError::corrupt(format!("slab {blk} out of range")));
        }
        let off = self.geo.desc_offset + blk as usize * std::mem::size_of::<BlockDesc>();
        Ok(unsafe { self.base.add(off) as *mut BlockDesc })
    }

    pub fn desc(&self, blk: u32) -> Result<BlockDesc> {
        Ok(unsafe { *self.desc_ptr(blk)? })
    }

    pub fn desc_mut(&mut self, blk: u32) -> Result<&mut BlockDesc> {
        Ok(unsafe { &mut *self.desc_ptr(blk)? })
    }

    fn fent_ptr(&self, idx: u32) -> Result<*mut FileEntry> {
        if idx >= self.geo.file_entry_count {
            return Err(UCacheError::corrupt(format!("file entry {idx} out of range")));
        }
        let off = self.geo.fent_offset + idx as usize * std::mem::size_of::<FileEntry>();
        Ok(unsafe { self.base.add(off) as *mut FileEntry })
    }

    pub fn fent(&self, idx: u32) -> Result<FileEntry> {
        Ok(unsafe { *self.fent_ptr(idx)? })
    }

    pub fn fent_mut(&mut self, idx: u32) -> Result<&mut FileEntry> {
        Ok(unsafe { &mut *self.fent_ptr(idx)? })
    }

    /// Start of a slab, whatever it currently holds.
    pub fn slab_ptr(&self, blk: u32) -> Result<*mut u8> {
        if blk >= self.geo.slab_count {
            return Err(UCacheError::corrupt(format!("slab {blk} out of range")));
        }
        let off = self.geo.slab_offset + blk as usize * self.geo.block_size;
        Ok(unsafe { self.base.add(off) })
    }

    fn table_ptr(&self, t: TableRef) -> Result<*mut u8> {
        if t.ent >= self.geo.mtbl_per_block {
            return Err(UCacheError::corrupt(format!("table slot {} out of range", t.ent)));
        }
        if self.desc(t.blk)?.state != SLAB_TABLES {
            return Err(UCacheError::corrupt(format!(
                "slab {} does not hold block tables",
                t.blk
            )));
        }
        Ok(unsafe { self.slab_ptr(t.blk)?.add(t.ent as usize * self.geo.mtbl_size) })
    }

    pub fn table(&self, t: TableRef) -> Result<TableHeader> {
        Ok(unsafe { *(self.table_ptr(t)? as *const TableHeader) })
    }

    pub fn table_mut(&mut self, t: TableRef) -> Result<&mut TableHeader> {
        Ok(unsafe { &mut *(self.table_ptr(t)? as *mut TableHeader) })
    }

    fn bucket_ptr(&self, t: TableRef, bucket: u32) -> Result<*mut i32> {
        if bucket >= self.geo.mem_hash_size {
            return Err(UCacheError::corrupt(format!("bucket {bucket} out of range")));
        }
        let off = self.geo.bucket_offset() + bucket as usize * 4;
        Ok(unsafe { self.table_ptr(t)?.add(off) as *mut i32 })
    }

    pub fn bucket(&self, t: TableRef, bucket: u32) -> Result<i32> {
        Ok(unsafe { *self.bucket_ptr(t, bucket)? })
    }

    pub fn set_bucket(&mut self, t: TableRef, bucket: u32, head: i32) -> Result<()> {
        unsafe { *self.bucket_ptr(t, bucket)? = head };
        Ok(())
    }

    fn ment_ptr(&self, t: TableRef, idx: u32) -> Result<*mut MemEntry> {
        if idx >= self.geo.mem_entry_count {
            return Err(UCacheError::corrupt(format!("memory entry {idx} out of range")));
        }
        let off = self.geo.ment_offset() + idx as usize * std::mem::size_of::<MemEntry>();
        Ok(unsafe { self.table_ptr(t)?.add(off) as *mut MemEntry })
    }

    pub fn ment(&self, t: TableRef, idx: u32) -> Result<MemEntry> {
        Ok(unsafe { *self.ment_ptr(t, idx)? })
    }

    pub fn ment_mut(&mut self, t: TableRef, idx: u32) -> Result<&mut MemEntry> {
        Ok(unsafe { &mut *self.ment_ptr(t, idx)? })
    }
}

/// Exclusive access to the index structures, held for the guard's lifetime.
pub(crate) struct IndexGuard<'a> {
    lock: ShmSeqLock,
    arena: Arena,
    _region: PhantomData<&'a ShmRegion>,
}

impl Deref for IndexGuard<'_> {
    type Target = Arena;

    fn deref(&self) -> &Arena {
        &self.arena
    }
}

impl DerefMut for IndexGuard<'_> {
    fn deref_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }
}

impl Drop for IndexGuard<'_> {
    fn drop(&mut self) {
        self.lock.write_unlock();
    }
}

impl ShmRegion {
    /// Take the global lock and return the arena it protects.
    pub(crate) fn lock_index(&self) -> IndexGuard<'_> {
        let lock = self.lock();
        lock.write_lock();
        IndexGuard {
            lock,
            arena: unsafe { Arena::new(self.base_ptr(), *self.geometry()) },
            _region: PhantomData,
        }
    }

    /// Unlocked view for optimistic readers; results must be validated with
    /// the seqlock before use.
    pub(crate) fn arena_unlocked(&self) -> Arena {
        unsafe { Arena::new(self.base_ptr(), *self.geometry()) }
    }
}

/// Get current monotonic time in nanoseconds.
pub(crate) fn current_time_nanos() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }

    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static BASE: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let base = BASE.get_or_init(Instant::now);
        base.elapsed().as_nanos() as u64
    }
}

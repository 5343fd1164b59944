//! The cache handle shared by every thread of a process.
//!
//! `UCache` ties the shared segment to a backing store and enforces the
//! locking discipline: every structural change to the file index or a block
//! table happens under the global lock, data copies and write-backs happen
//! under the guard lock of the slab involved, and the global lock is always
//! taken first. A `BlockGuard` therefore holds only a guard lock; calling back
//! into the cache while holding one can deadlock against eviction.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut, Range};
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::{quietly, Result, UCacheError};
use crate::evict::LockMode;
use crate::shm::layout::{Geometry, HDR_PROVISIONAL_DIRTY, SLAB_DATA};
use crate::shm::lock::{process_alive, GuardLock};
use crate::shm::region::ShmRegion;
use crate::shm::{Arena, TableRef};
use crate::store::{BackingStore, ObjectRef};

/// An open file, as returned by `UCache::open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileRef {
    pub(crate) fent: u32,
    pub(crate) generation: u32,
    pub(crate) obj: ObjectRef,
}

impl FileRef {
    pub fn object(&self) -> ObjectRef {
        self.obj
    }
}

/// A resident block. Only valid while the block stays resident; once it is
/// evicted or removed every use reports `UCacheError::Stale`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRef {
    pub(crate) file: FileRef,
    pub(crate) table: TableRef,
    pub(crate) ment: u32,
    pub(crate) slot: u32,
    pub(crate) generation: u32,
    pub(crate) tag: u64,
}

impl BlockRef {
    /// File offset of the first byte of the block.
    pub fn offset(&self) -> u64 {
        self.tag
    }

    /// Slab holding the block's data.
    pub fn slot(&self) -> u32 {
        self.slot
    }
}

/// Snapshot of the cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub fallbacks: u64,
    pub resident_blocks: u32,
    pub capacity: u32,
    pub open_files: u32,
    pub table_slabs: u32,
}

/// A guard lock found held for longer than expected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaleLock {
    pub slot: u32,
    pub owner_pid: u32,
    pub held_for: Duration,
}

pub struct UCache<S> {
    region: ShmRegion,
    store: S,
    provisional_dirty: bool,
}

impl<S: BackingStore> UCache<S> {
    /// Wrap an attached segment. `config` must describe the segment's layout.
    pub fn new(region: ShmRegion, config: &CacheConfig, store: S) -> Result<Self> {
        let expected = Geometry::for_config(config)?;
        if expected != *region.geometry() {
            return Err(UCacheError::Layout(
                "configuration does not match the attached segment".to_owned(),
            ));
        }
        let provisional_dirty = region.header().flags & HDR_PROVISIONAL_DIRTY != 0;
        Ok(UCache {
            region,
            store,
            provisional_dirty,
        })
    }

    /// Cache private to this process, backed by an anonymous mapping.
    pub fn anonymous(config: &CacheConfig, store: S) -> Result<Self> {
        let region = ShmRegion::anonymous(config)?;
        Self::new(region, config, store)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    pub fn block_size(&self) -> usize {
        self.region.geometry().block_size
    }

    // --- Validation (global lock held) ---

    /// Check that `file` still names an open entry and return its table.
    pub(crate) fn file_table(&self, a: &Arena, file: &FileRef) -> Result<TableRef> {
        let f = a.fent(file.fent)?;
        if f.in_use == 0
            || f.generation != file.generation
            || f.fs_id != file.obj.fs_id
            || f.handle != file.obj.handle
        {
            return Err(UCacheError::Stale);
        }
        let t = a.file_table(file.fent)?;
        if a.table(t)?.ref_cnt == 0 {
            return Err(UCacheError::Stale);
        }
        Ok(t)
    }

    fn check_block(&self, a: &Arena, b: &BlockRef) -> Result<()> {
        if self.file_table(a, &b.file)? != b.table {
            return Err(UCacheError::Stale);
        }
        let m = a.ment(b.table, b.ment)?;
        let d = a.desc(b.slot)?;
        if !m.is_in_use()
            || m.tag != b.tag
            || m.item != b.slot as i32
            || d.state != SLAB_DATA
            || d.generation != b.generation
        {
            return Err(UCacheError::Stale);
        }
        Ok(())
    }

    fn block_ref(&self, a: &Arena, file: &FileRef, t: TableRef, ment: u32) -> Result<BlockRef> {
        let slot = a.mem_block(t, ment)?;
        Ok(BlockRef {
            file: *file,
            table: t,
            ment,
            slot,
            generation: a.desc(slot)?.generation,
            tag: a.ment(t, ment)?.tag,
        })
    }

    /// Valid bytes of a block, and the bytes of it that lie inside the file.
    /// The second is never smaller; the gap between them is a hole.
    fn block_extent(&self, a: &Arena, b: &BlockRef) -> Result<(usize, usize)> {
        let valid = a.ment(b.table, b.ment)?.valid_len as usize;
        let in_file = a
            .fent(b.file.fent)?
            .size
            .saturating_sub(b.tag)
            .min(self.block_size() as u64) as usize;
        Ok((valid, valid.max(in_file)))
    }

    pub(crate) fn guard(&self, slot: u32) -> Result<GuardLock> {
        self.region
            .guard_lock(slot)
            .ok_or_else(|| UCacheError::corrupt(format!("no guard lock for slab {slot}")))
    }

    // --- Atomic stat accessors (no lock needed) ---

    pub fn stats(&self) -> CacheStats {
        let h = self.region.header();
        CacheStats {
            hits: h.hits.load(Ordering::Relaxed),
            misses: h.misses.load(Ordering::Relaxed),
            evictions: h.evictions.load(Ordering::Relaxed),
            writebacks: h.writebacks.load(Ordering::Relaxed),
            fallbacks: h.fallbacks.load(Ordering::Relaxed),
            resident_blocks: h.resident_blocks,
            capacity: h.block_count,
            open_files: h.open_files,
            table_slabs: h.table_slabs,
        }
    }

    // --- Files ---

    /// Start caching (fs_id, handle), or take another reference if it is
    /// already cached.
    pub fn open(&self, fs_id: u32, handle: u64) -> Result<FileRef> {
        let mut a = self.region.lock_index();
        let slot = match a.insert_file(fs_id, handle) {
            Err(err) if err.is_exhausted() => {
                if !self.evict_locked(&mut a)? {
                    return Err(err);
                }
                a.insert_file(fs_id, handle)?
            }
            other => other?,
        };
        trace!(
            fs_id,
            handle,
            fent = slot.fent,
            table = ?slot.table,
            existed = slot.existed,
            "open"
        );
        Ok(FileRef {
            fent: slot.fent,
            generation: a.fent(slot.fent)?.generation,
            obj: ObjectRef::new(fs_id, handle),
        })
    }

    /// Drop one reference. The last close writes back dirty blocks and
    /// releases everything the file held. If the write-back fails the error
    /// is returned and the file stays cached, unreferenced, with its dirty
    /// blocks intact for a later flush or eviction.
    pub fn close(&self, file: FileRef) -> Result<()> {
        let mut a = self.region.lock_index();
        self.file_table(&a, &file)?;
        if a.release_file_ref(file.fent)? > 0 {
            return Ok(());
        }
        self.flush_table(&mut a, file.fent)?;
        self.release_file(&mut a, file.fent)?;
        debug!(fs_id = file.obj.fs_id, handle = file.obj.handle, "file released");
        Ok(())
    }

    /// Free every block of an unreferenced file, then the file itself.
    pub(crate) fn release_file(&self, a: &mut Arena, fent: u32) -> Result<()> {
        let t = a.file_table(fent)?;
        for ment in a.lru_order(t)? {
            self.reclaim(a, fent, ment, LockMode::Block)?;
        }
        a.drop_file(fent)
    }

    /// Highest byte offset known to exist in the file.
    pub fn file_size(&self, file: &FileRef) -> Result<u64> {
        let a = self.region.lock_index();
        self.file_table(&a, file)?;
        Ok(a.fent(file.fent)?.size)
    }

    // --- Blocks ---

    /// Find the block holding `offset`, promoting it to most recently used.
    pub fn lookup(&self, file: &FileRef, offset: u64) -> Result<Option<BlockRef>> {
        let mut a = self.region.lock_index();
        let t = self.file_table(&a, file)?;
        match a.lookup_mem(t, offset)? {
            Some(ment) => {
                a.touch(t, ment)?;
                self.region.header().hits.fetch_add(1, Ordering::Relaxed);
                trace!(offset, ment, "lookup hit");
                Ok(Some(self.block_ref(&a, file, t, ment)?))
            }
            None => {
                self.region.header().misses.fetch_add(1, Ordering::Relaxed);
                trace!(offset, "lookup miss");
                Ok(None)
            }
        }
    }

    /// Make the block holding `offset` resident, filled from the backing
    /// store. Returns the existing block if it is already cached.
    pub fn insert(&self, file: &FileRef, offset: u64) -> Result<BlockRef> {
        let mut a = self.region.lock_index();
        let t = self.file_table(&a, file)?;
        if let Some(ment) = a.lookup_mem(t, offset)? {
            a.touch(t, ment)?;
            return self.block_ref(&a, file, t, ment);
        }

        let ment = match a.allocate_mem_entry(t) {
            Err(err) if err.is_exhausted() => {
                // This file's own table is full: give up its oldest block.
                let victim = a.lru_tail(t)?.ok_or(err)?;
                self.reclaim(&mut a, file.fent, victim, LockMode::Block)?;
                self.region.header().evictions.fetch_add(1, Ordering::Relaxed);
                a.allocate_mem_entry(t)?
            }
            other => other?,
        };

        let slot = match self.allocate_slab(&mut a) {
            Ok(slot) => slot,
            Err(err) => {
                a.free_mem_entry(t, ment)?;
                return Err(err);
            }
        };

        a.link_mem(t, ment, offset, slot)?;
        if self.provisional_dirty {
            a.mark_dirty(t, ment)?;
        }
        self.populate(&mut a, file, t, ment, slot)?;
        trace!(offset, ment, slot, "inserted block");
        self.block_ref(&a, file, t, ment)
    }

    fn allocate_slab(&self, a: &mut Arena) -> Result<u32> {
        match a.allocate_block() {
            Err(err) if err.is_exhausted() => {
                if !self.evict_locked(a)? {
                    return Err(err);
                }
                a.allocate_block()
            }
            other => other,
        }
    }

    /// Read a freshly linked block from the store. The slab is unreachable
    /// by anyone else until the global lock is released. On a read failure
    /// the block is taken back out so no unfilled block stays resident.
    fn populate(
        &self,
        a: &mut Arena,
        file: &FileRef,
        t: TableRef,
        ment: u32,
        slot: u32,
    ) -> Result<()> {
        let bs = self.block_size();
        let tag = a.ment(t, ment)?.tag;
        let data = unsafe { std::slice::from_raw_parts_mut(a.slab_ptr(slot)?, bs) };
        match self.store.read_at(file.obj, tag, data) {
            Ok(n) => {
                let n = n.min(bs);
                data[n..].fill(0);
                a.extend_valid(t, ment, n)?;
                let f = a.fent_mut(file.fent)?;
                if n > 0 {
                    f.size = f.size.max(tag + n as u64);
                }
                Ok(())
            }
            Err(err) => {
                a.unlink_mem(t, ment)?;
                a.free_block(slot)?;
                a.free_mem_entry(t, ment)?;
                Err(err.into())
            }
        }
    }

    /// Drop the block holding `offset`, writing it back first if dirty.
    /// Never blocks: returns `false` if the block is not cached or another
    /// operation holds its guard lock.
    pub fn remove(&self, file: &FileRef, offset: u64) -> Result<bool> {
        let mut a = self.region.lock_index();
        let t = self.file_table(&a, file)?;
        let Some(ment) = a.lookup_mem(t, offset)? else {
            return Ok(false);
        };
        match self.reclaim(&mut a, file.fent, ment, LockMode::TryOnce) {
            Ok(()) => Ok(true),
            Err(UCacheError::Busy { slot }) => {
                trace!(offset, slot, "remove skipped, block busy");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop every cached block of `obj` overlapping `offset..offset + len`,
    /// writing dirty ones back first. Unlike `remove` this waits for guard
    /// locks, and it finds the file by object so a stale `FileRef` still
    /// reaches blocks cached through another reference. Returns the blocks
    /// dropped.
    pub(crate) fn discard_range(&self, obj: ObjectRef, offset: u64, len: usize) -> Result<usize> {
        if len == 0 {
            return Ok(0);
        }
        let mut a = self.region.lock_index();
        let Some(fent) = a.lookup_file(obj.fs_id, obj.handle)? else {
            return Ok(0);
        };
        let t = a.file_table(fent)?;
        let end = offset + len as u64;
        let mut pos = a.block_tag(offset);
        let mut dropped = 0;
        while pos < end {
            if let Some(ment) = a.lookup_mem(t, pos)? {
                self.reclaim(&mut a, fent, ment, LockMode::Block)?;
                dropped += 1;
            }
            pos += self.block_size() as u64;
        }
        if dropped > 0 {
            debug!(fs_id = obj.fs_id, handle = obj.handle, dropped, "discarded cached range");
        }
        Ok(dropped)
    }

    /// Lock a block for reading its bytes.
    pub fn lock_block(&self, b: &BlockRef) -> Result<BlockGuard<'_>> {
        let a = self.region.lock_index();
        self.check_block(&a, b)?;
        let (valid, readable) = self.block_extent(&a, b)?;
        let ptr = a.slab_ptr(b.slot)?;
        let lock = self.guard(b.slot)?;
        lock.lock();
        drop(a);
        Ok(BlockGuard {
            lock,
            ptr,
            len: self.block_size(),
            valid,
            readable,
            _cache: PhantomData,
        })
    }

    /// Lock a block for writing `range` of it. The block is marked dirty and
    /// the file size extended before the caller copies any data; a concurrent
    /// flush waits on the guard lock and writes the new bytes.
    pub fn lock_block_for_write(
        &self,
        b: &BlockRef,
        range: Range<usize>,
    ) -> Result<BlockWriteGuard<'_>> {
        let bs = self.block_size();
        if range.start > range.end || range.end > bs {
            return Err(UCacheError::Range {
                start: range.start,
                end: range.end,
                block_size: bs,
            });
        }
        let mut a = self.region.lock_index();
        self.check_block(&a, b)?;
        a.mark_dirty(b.table, b.ment)?;
        a.extend_valid(b.table, b.ment, range.end)?;
        if range.end > 0 {
            let f = a.fent_mut(b.file.fent)?;
            f.size = f.size.max(b.tag + range.end as u64);
        }
        let (valid, readable) = self.block_extent(&a, b)?;
        let ptr = a.slab_ptr(b.slot)?;
        let lock = self.guard(b.slot)?;
        lock.lock();
        drop(a);
        Ok(BlockWriteGuard {
            inner: BlockGuard {
                lock,
                ptr,
                len: bs,
                valid,
                readable,
                _cache: PhantomData,
            },
            range,
        })
    }

    /// Lock-free residency check. Does not count as a use of the block.
    pub fn is_resident(&self, file: &FileRef, offset: u64) -> Result<bool> {
        const OPTIMISTIC_TRIES: u32 = 8;
        let lock = self.region.lock();
        let a = self.region.arena_unlocked();
        for _ in 0..OPTIMISTIC_TRIES {
            let seq = lock.read_begin();
            let seen = quietly(|| {
                self.file_table(&a, file)
                    .and_then(|t| a.lookup_mem(t, offset))
            });
            if lock.read_validate(seq) {
                return seen.map(|m| m.is_some());
            }
        }
        let a = self.region.lock_index();
        let t = self.file_table(&a, file)?;
        Ok(a.lookup_mem(t, offset)?.is_some())
    }

    // --- Hung guard locks ---

    /// Guard locks held for longer than `max_age`.
    pub fn stale_guard_locks(&self, max_age: Duration) -> Vec<StaleLock> {
        let mut out = Vec::new();
        for slot in 0..self.region.geometry().slab_count {
            let Some(lock) = self.region.guard_lock(slot) else {
                continue;
            };
            if let Some(held_for) = lock.held_for() {
                if held_for >= max_age {
                    out.push(StaleLock {
                        slot,
                        owner_pid: lock.owner_pid(),
                        held_for,
                    });
                }
            }
        }
        if !out.is_empty() {
            warn!(count = out.len(), "guard locks held past their expected lifetime");
        }
        out
    }

    /// Release guard locks whose owning process has exited. Returns the
    /// slots released.
    pub fn break_dead_owner_locks(&self) -> Vec<u32> {
        let mut broken = Vec::new();
        for slot in 0..self.region.geometry().slab_count {
            let Some(lock) = self.region.guard_lock(slot) else {
                continue;
            };
            if !lock.is_locked() {
                continue;
            }
            let pid = lock.owner_pid();
            if pid != 0 && !process_alive(pid) {
                warn!(slot, pid, "releasing guard lock of exited process");
                lock.unlock();
                broken.push(slot);
            }
        }
        broken
    }
}

/// Read access to one block, holding its guard lock until dropped.
pub struct BlockGuard<'a> {
    lock: GuardLock,
    ptr: *mut u8,
    len: usize,
    valid: usize,
    readable: usize,
    _cache: PhantomData<&'a ()>,
}

impl BlockGuard<'_> {
    /// Bytes at the start of the block that were loaded or written.
    pub fn valid_len(&self) -> usize {
        self.valid
    }

    /// Bytes at the start of the block that lie before end of file, as of
    /// locking. Anything between `valid_len` and this is a hole and reads as
    /// zeros.
    pub fn readable_len(&self) -> usize {
        self.readable
    }
}

impl Deref for BlockGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for BlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Write access to one block. Only bytes inside the locked range are
/// accounted for in the block's valid length.
pub struct BlockWriteGuard<'a> {
    inner: BlockGuard<'a>,
    range: Range<usize>,
}

impl BlockWriteGuard<'_> {
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn valid_len(&self) -> usize {
        self.inner.valid
    }
}

impl Deref for BlockWriteGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl DerefMut for BlockWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.inner.ptr, self.inner.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    const BS: usize = 4096;

    fn cache(blocks: u32) -> UCache<MemStore> {
        let cfg = CacheConfig::default()
            .with_block_size(BS)
            .with_block_count(blocks)
            .with_file_table(4, 8)
            .with_mem_table(4, 8);
        UCache::anonymous(&cfg, MemStore::new()).unwrap()
    }

    #[test]
    fn insert_then_lookup_returns_same_block() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, 100).unwrap();
        assert_eq!(b.offset(), 0);
        let again = c.lookup(&f, BS as u64 - 1).unwrap().unwrap();
        assert_eq!(again, b);
        assert_eq!(c.insert(&f, 5).unwrap(), b);
        assert_eq!(c.stats().hits, 1);
        assert!(c.lookup(&f, BS as u64).unwrap().is_none());
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn insert_fills_from_store() {
        let c = cache(4);
        let obj = ObjectRef::new(1, 10);
        c.store().put(obj, vec![7u8; BS + 10]);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, BS as u64).unwrap();
        let g = c.lock_block(&b).unwrap();
        assert_eq!(g.valid_len(), 10);
        assert!(g[..10].iter().all(|&x| x == 7));
        assert!(g[10..].iter().all(|&x| x == 0));
        drop(g);
        assert_eq!(c.file_size(&f).unwrap(), BS as u64 + 10);
    }

    #[test]
    fn clean_blocks_are_not_written_back() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        c.insert(&f, 0).unwrap();
        assert!(c.remove(&f, 0).unwrap());
        assert!(!c.remove(&f, 0).unwrap());
        c.close(f).unwrap();
        assert_eq!(c.store().write_count(), 0);
    }

    #[test]
    fn provisional_dirty_writes_back_every_block() {
        let cfg = CacheConfig::default()
            .with_block_size(BS)
            .with_block_count(4)
            .with_file_table(4, 8)
            .with_mem_table(4, 8)
            .with_provisional_dirty(true);
        let c = UCache::anonymous(&cfg, MemStore::new()).unwrap();
        let obj = ObjectRef::new(2, 3);
        c.store().put(obj, vec![1u8; 100]);
        let f = c.open(2, 3).unwrap();
        c.insert(&f, 0).unwrap();
        c.flush_file(&f).unwrap();
        assert_eq!(c.store().write_count(), 1);
        assert_eq!(c.store().writes()[0].len, 100);
    }

    #[test]
    fn write_guard_marks_dirty_and_extends_size() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, 0).unwrap();
        {
            let mut g = c.lock_block_for_write(&b, 4..8).unwrap();
            g[4..8].copy_from_slice(b"data");
            assert_eq!(g.valid_len(), 8);
        }
        assert_eq!(c.file_size(&f).unwrap(), 8);
        c.flush_file(&f).unwrap();
        let obj = f.object();
        assert_eq!(c.store().contents(obj).unwrap(), b"\0\0\0\0data");
    }

    #[test]
    fn write_range_outside_block_is_rejected() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, 0).unwrap();
        assert!(matches!(
            c.lock_block_for_write(&b, 0..BS + 1),
            Err(UCacheError::Range { .. })
        ));
    }

    #[test]
    fn remove_is_non_blocking() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, 0).unwrap();
        let g = c.lock_block(&b).unwrap();
        assert!(!c.remove(&f, 0).unwrap());
        drop(g);
        assert!(c.remove(&f, 0).unwrap());
    }

    #[test]
    fn stale_block_ref_is_rejected() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, 0).unwrap();
        assert!(c.remove(&f, 0).unwrap());
        assert!(matches!(c.lock_block(&b), Err(UCacheError::Stale)));

        c.close(f).unwrap();
        assert!(matches!(c.lookup(&f, 0), Err(UCacheError::Stale)));
    }

    #[test]
    fn own_table_full_evicts_its_lru_tail() {
        let c = cache(16);
        let f = c.open(1, 10).unwrap();
        // Eight memory entries per table.
        for i in 0..8u64 {
            c.insert(&f, i * BS as u64).unwrap();
        }
        c.lookup(&f, 0).unwrap().unwrap();
        c.insert(&f, 8 * BS as u64).unwrap();
        assert!(c.is_resident(&f, 0).unwrap());
        assert!(!c.is_resident(&f, BS as u64).unwrap());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn hole_before_written_bytes_reads_as_zeros() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        let hole = c.insert(&f, 0).unwrap();
        let tail = c.insert(&f, BS as u64).unwrap();
        drop(c.lock_block_for_write(&tail, 0..1).unwrap());

        let g = c.lock_block(&hole).unwrap();
        assert_eq!(g.valid_len(), 0);
        assert_eq!(g.readable_len(), BS);
        assert!(g.iter().all(|&x| x == 0));
        drop(g);
        let g = c.lock_block(&tail).unwrap();
        assert_eq!((g.valid_len(), g.readable_len()), (1, 1));
    }

    #[test]
    fn reopen_after_failed_close_retires_the_old_ref() {
        let c = cache(4);
        let old = c.open(4, 4).unwrap();
        let b = c.insert(&old, 0).unwrap();
        drop(c.lock_block_for_write(&b, 0..1).unwrap());
        c.store().fail_writes(true);
        assert!(c.close(old).is_err());
        c.store().fail_writes(false);

        let newer = c.open(4, 4).unwrap();
        assert_ne!(newer, old);
        assert!(matches!(c.close(old), Err(UCacheError::Stale)));
        assert!(c.lookup(&newer, 0).unwrap().is_some());
        c.close(newer).unwrap();
        assert_eq!(c.stats().open_files, 0);
        assert_eq!(c.store().write_count(), 1);
    }

    #[test]
    fn is_resident_does_not_touch() {
        let c = cache(4);
        let f = c.open(1, 10).unwrap();
        c.insert(&f, 0).unwrap();
        assert!(c.is_resident(&f, 0).unwrap());
        assert!(!c.is_resident(&f, BS as u64).unwrap());
        let s = c.stats();
        assert_eq!((s.hits, s.misses), (0, 0));
    }

    #[test]
    fn failed_populate_leaves_nothing_resident() {
        struct Broken;
        impl BackingStore for Broken {
            fn read_at(
                &self,
                _: ObjectRef,
                _: u64,
                _: &mut [u8],
            ) -> std::result::Result<usize, crate::error::StoreError> {
                Err(crate::error::StoreError::Remote { code: 5 })
            }
            fn write_at(
                &self,
                _: ObjectRef,
                _: u64,
                buf: &[u8],
            ) -> std::result::Result<usize, crate::error::StoreError> {
                Ok(buf.len())
            }
        }
        let cfg = CacheConfig::default()
            .with_block_size(BS)
            .with_block_count(2)
            .with_file_table(4, 8)
            .with_mem_table(4, 8);
        let c = UCache::anonymous(&cfg, Broken).unwrap();
        let f = c.open(1, 1).unwrap();
        assert!(matches!(c.insert(&f, 0), Err(UCacheError::Store(_))));
        assert!(!c.is_resident(&f, 0).unwrap());
        assert_eq!(c.stats().resident_blocks, 0);
    }

    #[test]
    fn held_guard_is_reported_and_dead_owners_broken() {
        let c = cache(2);
        let f = c.open(1, 10).unwrap();
        let b = c.insert(&f, 0).unwrap();
        let g = c.lock_block(&b).unwrap();
        let stale = c.stale_guard_locks(Duration::ZERO);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].slot, b.slot());
        assert_eq!(stale[0].owner_pid, std::process::id());
        // Our own process is alive, so nothing is broken.
        assert!(c.break_dead_owner_locks().is_empty());
        drop(g);
        assert!(c.stale_guard_locks(Duration::ZERO).is_empty());
    }
}

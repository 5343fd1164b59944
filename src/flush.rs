//! Write-back of dirty blocks.
//!
//! Flushes run with the global lock held for the whole walk, and take each
//! block's guard lock only around that block's write. A failed write stops
//! the walk and leaves the dirty list as it was; the list is emptied only
//! after every block on it has been written.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use crate::cache::{FileRef, UCache};
use crate::error::{Result, StoreError};
use crate::shm::{Arena, TableRef};
use crate::store::{BackingStore, ObjectRef};

impl<S: BackingStore> UCache<S> {
    /// Write one resident block to the store. The caller holds the global
    /// lock and the block's guard lock. The write covers the block's valid
    /// bytes, capped at the known file size. Dirty linkage is left alone.
    pub(crate) fn write_back(&self, a: &Arena, fent: u32, t: TableRef, ment: u32) -> Result<()> {
        let f = a.fent(fent)?;
        let m = a.ment(t, ment)?;
        let slot = a.mem_block(t, ment)?;
        let len = (m.valid_len as u64)
            .min(f.size.saturating_sub(m.tag))
            .min(self.block_size() as u64) as usize;
        if len == 0 {
            return Ok(());
        }
        let data = unsafe { std::slice::from_raw_parts(a.slab_ptr(slot)?, len) };
        let obj = ObjectRef::new(f.fs_id, f.handle);
        let written = self.store().write_at(obj, m.tag, data)?;
        if written != len {
            return Err(StoreError::ShortTransfer {
                offset: m.tag,
                expected: len,
                actual: written,
            }
            .into());
        }
        self.region()
            .header()
            .writebacks
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Drain one file's dirty list.
    pub(crate) fn flush_table(&self, a: &mut Arena, fent: u32) -> Result<usize> {
        let t = a.file_table(fent)?;
        let dirty = a.dirty_entries(t)?;
        if dirty.is_empty() {
            return Ok(0);
        }
        for &ment in &dirty {
            let guard = self.guard(a.mem_block(t, ment)?)?;
            guard.lock();
            let result = self.write_back(a, fent, t, ment);
            guard.unlock();
            if let Err(err) = result {
                warn!(fent, ment, %err, "write-back failed, flush aborted");
                return Err(err);
            }
        }
        a.clear_dirty_list(t)?;
        debug!(fent, blocks = dirty.len(), "flushed file");
        Ok(dirty.len())
    }

    /// Write back every dirty block of one file. Returns the blocks written.
    pub fn flush_file(&self, file: &FileRef) -> Result<usize> {
        let mut a = self.region().lock_index();
        self.file_table(&a, file)?;
        self.flush_table(&mut a, file.fent)
    }

    /// Like `flush_file`, but finds the file by object, so it works for a
    /// stale `FileRef` too. A file not in the cache has nothing to flush.
    pub(crate) fn flush_object(&self, obj: ObjectRef) -> Result<usize> {
        let mut a = self.region().lock_index();
        match a.lookup_file(obj.fs_id, obj.handle)? {
            Some(fent) => self.flush_table(&mut a, fent),
            None => Ok(0),
        }
    }

    /// Flush every cached file, including unreferenced ones still holding
    /// dirty blocks. Files after a failing one are still flushed; the first
    /// error is returned.
    pub fn flush_all(&self) -> Result<usize> {
        let mut a = self.region().lock_index();
        let mut written = 0;
        let mut first_err = None;
        for fent in a.live_files()? {
            match self.flush_table(&mut a, fent) {
                Ok(n) => written += n,
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::UCache;
    use crate::config::CacheConfig;
    use crate::error::UCacheError;
    use crate::store::{MemStore, ObjectRef};

    const BS: u64 = 4096;

    fn cache() -> UCache<MemStore> {
        let cfg = CacheConfig::default()
            .with_block_size(BS as usize)
            .with_block_count(8)
            .with_file_table(4, 8)
            .with_mem_table(4, 8);
        UCache::anonymous(&cfg, MemStore::new()).unwrap()
    }

    fn write(c: &UCache<MemStore>, f: &crate::cache::FileRef, offset: u64, bytes: &[u8]) {
        let b = c.insert(f, offset).unwrap();
        let start = (offset % BS) as usize;
        let mut g = c.lock_block_for_write(&b, start..start + bytes.len()).unwrap();
        g[start..start + bytes.len()].copy_from_slice(bytes);
    }

    #[test]
    fn flush_without_dirty_blocks_writes_nothing() {
        let c = cache();
        let f = c.open(1, 1).unwrap();
        c.insert(&f, 0).unwrap();
        assert_eq!(c.flush_file(&f).unwrap(), 0);
        assert_eq!(c.store().write_count(), 0);
    }

    #[test]
    fn flush_caps_tail_block_at_file_size() {
        let c = cache();
        let f = c.open(1, 1).unwrap();
        write(&c, &f, 0, &[1u8; BS as usize]);
        write(&c, &f, BS + 10, b"tail");
        assert_eq!(c.flush_file(&f).unwrap(), 2);

        let mut lens: Vec<(u64, usize)> =
            c.store().writes().iter().map(|w| (w.offset, w.len)).collect();
        lens.sort();
        assert_eq!(lens, vec![(0, BS as usize), (BS, 14)]);
        assert_eq!(c.store().contents(f.object()).unwrap().len(), BS as usize + 14);

        // Nothing left to write.
        assert_eq!(c.flush_file(&f).unwrap(), 0);
        assert_eq!(c.stats().writebacks, 2);
    }

    #[test]
    fn failed_flush_keeps_blocks_dirty() {
        let c = cache();
        let f = c.open(1, 1).unwrap();
        write(&c, &f, 0, b"x");
        write(&c, &f, BS, b"y");
        c.store().fail_writes(true);
        assert!(matches!(c.flush_file(&f), Err(UCacheError::Store(_))));
        c.store().fail_writes(false);
        assert_eq!(c.flush_file(&f).unwrap(), 2);
    }

    #[test]
    fn flush_all_covers_every_file() {
        let c = cache();
        let a = c.open(1, 1).unwrap();
        let b = c.open(1, 2).unwrap();
        write(&c, &a, 0, b"aa");
        write(&c, &b, 0, b"bb");
        assert_eq!(c.flush_all().unwrap(), 2);
        assert_eq!(c.store().contents(ObjectRef::new(1, 1)).unwrap(), b"aa");
        assert_eq!(c.store().contents(ObjectRef::new(1, 2)).unwrap(), b"bb");
    }
}

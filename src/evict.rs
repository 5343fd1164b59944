//! Eviction.
//!
//! The victim is the least recently used block of the file holding the most
//! blocks. There is no LRU order across files, so this approximates global
//! LRU by taking from the biggest table first.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::cache::UCache;
use crate::error::{Result, UCacheError};
use crate::shm::Arena;
use crate::store::BackingStore;

/// How `reclaim` waits for a block's guard lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Give up with `Busy` if the guard is held.
    TryOnce,
    /// Wait for the guard.
    Block,
}

impl<S: BackingStore> UCache<S> {
    /// Take one resident block out of a file's table: write it back if it is
    /// dirty, unlink it, and return its slab and entry to their pools. The
    /// global lock must be held. A failed write-back leaves the block resident.
    pub(crate) fn reclaim(
        &self,
        a: &mut Arena,
        fent: u32,
        ment: u32,
        mode: LockMode,
    ) -> Result<()> {
        let t = a.file_table(fent)?;
        let slot = a.mem_block(t, ment)?;
        let guard = self.guard(slot)?;
        match mode {
            LockMode::TryOnce => {
                if !guard.try_lock() {
                    return Err(UCacheError::Busy { slot });
                }
            }
            LockMode::Block => guard.lock(),
        }

        let result = self.reclaim_locked(a, fent, ment, slot);
        guard.unlock();
        result
    }

    fn reclaim_locked(&self, a: &mut Arena, fent: u32, ment: u32, slot: u32) -> Result<()> {
        let t = a.file_table(fent)?;
        if a.ment(t, ment)?.is_dirty() {
            self.write_back(a, fent, t, ment)?;
        }
        a.unlink_mem(t, ment)?;
        a.free_block(slot)?;
        a.free_mem_entry(t, ment)
    }

    /// Evict one block from the fullest file. Returns `false` when no file
    /// has a block to give.
    pub fn evict_one(&self) -> Result<bool> {
        let mut a = self.region().lock_index();
        self.evict_locked(&mut a)
    }

    pub(crate) fn evict_locked(&self, a: &mut Arena) -> Result<bool> {
        let mut victim: Option<(u32, u32)> = None;
        for fent in a.live_files()? {
            let blocks = a.table(a.file_table(fent)?)?.num_blocks;
            if blocks > 0 && victim.map_or(true, |(_, most)| blocks > most) {
                victim = Some((fent, blocks));
            }
        }
        let Some((fent, blocks)) = victim else {
            return Ok(false);
        };
        let t = a.file_table(fent)?;
        let Some(ment) = a.lru_tail(t)? else {
            return Ok(false);
        };

        let tag = a.ment(t, ment)?.tag;
        self.reclaim(a, fent, ment, LockMode::Block)?;
        self.region()
            .header()
            .evictions
            .fetch_add(1, Ordering::Relaxed);
        debug!(fent, blocks, offset = tag, "evicted block");

        // A file closed while its write-back was failing lingers unreferenced
        // until its last block is gone.
        let th = a.table(t)?;
        if th.ref_cnt == 0 && th.num_blocks == 0 {
            a.drop_file(fent)?;
            debug!(fent, "dropped unreferenced file");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::store::{MemStore, ObjectRef};

    const BS: u64 = 4096;

    fn cache(blocks: u32) -> UCache<MemStore> {
        let cfg = CacheConfig::default()
            .with_block_size(BS as usize)
            .with_block_count(blocks)
            .with_file_table(4, 8)
            .with_mem_table(4, 8);
        UCache::anonymous(&cfg, MemStore::new()).unwrap()
    }

    #[test]
    fn evicts_from_the_fullest_file() {
        let c = cache(4);
        let small = c.open(1, 1).unwrap();
        let big = c.open(1, 2).unwrap();
        c.insert(&small, 0).unwrap();
        c.insert(&big, 0).unwrap();
        c.insert(&big, BS).unwrap();
        c.lookup(&big, 0).unwrap();

        assert!(c.evict_one().unwrap());
        assert!(c.is_resident(&small, 0).unwrap());
        assert!(c.is_resident(&big, 0).unwrap());
        assert!(!c.is_resident(&big, BS).unwrap());
        assert_eq!(c.stats().evictions, 1);
    }

    #[test]
    fn empty_cache_has_nothing_to_evict() {
        let c = cache(2);
        let _f = c.open(1, 1).unwrap();
        assert!(!c.evict_one().unwrap());
    }

    #[test]
    fn dirty_victim_is_written_back() {
        let c = cache(2);
        let f = c.open(9, 5).unwrap();
        let b = c.insert(&f, BS).unwrap();
        {
            let mut g = c.lock_block_for_write(&b, 0..3).unwrap();
            g[..3].copy_from_slice(b"abc");
        }
        assert!(c.evict_one().unwrap());
        let w = c.store().writes();
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].obj, ObjectRef::new(9, 5));
        assert_eq!(w[0].offset, BS);
        assert_eq!(w[0].len, 3);
    }

    #[test]
    fn failed_write_back_keeps_the_victim() {
        let c = cache(2);
        let f = c.open(9, 5).unwrap();
        let b = c.insert(&f, 0).unwrap();
        drop(c.lock_block_for_write(&b, 0..1).unwrap());
        c.store().fail_writes(true);
        assert!(matches!(c.evict_one(), Err(UCacheError::Store(_))));
        assert!(c.is_resident(&f, 0).unwrap());
        c.store().fail_writes(false);
        assert!(c.evict_one().unwrap());
    }

    #[test]
    fn lingering_closed_file_is_dropped_once_drained() {
        let c = cache(2);
        let f = c.open(3, 3).unwrap();
        let b = c.insert(&f, 0).unwrap();
        drop(c.lock_block_for_write(&b, 0..1).unwrap());
        c.store().fail_writes(true);
        assert!(c.close(f).is_err());
        assert_eq!(c.stats().open_files, 1);

        c.store().fail_writes(false);
        assert!(c.evict_one().unwrap());
        assert_eq!(c.stats().open_files, 0);
        assert_eq!(c.store().write_count(), 1);
    }
}

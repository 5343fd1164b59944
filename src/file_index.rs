//! File index: (fs_id, handle) → block table.
//!
//! A closed hash table of `file_hash_size` direct-mapped slots. A slot whose
//! file goes away is cleared in place and keeps heading its collision chain;
//! colliding files take an overflow entry linked right after the direct slot.

use tracing::trace;

use crate::error::{Result, UCacheError};
use crate::shm::{link, opt_link, Arena, TableRef};

/// Outcome of `insert_file`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileSlot {
    pub fent: u32,
    pub table: TableRef,
    /// True if the file was already cached and only its ref count moved.
    pub existed: bool,
}

impl Arena {
    pub(crate) fn file_bucket(&self, handle: u64) -> u32 {
        (handle % self.geometry().file_hash_size as u64) as u32
    }

    /// Find the live entry for (fs_id, handle).
    pub fn lookup_file(&self, fs_id: u32, handle: u64) -> Result<Option<u32>> {
        let count = self.geometry().file_entry_count;
        let mut cur = Some(self.file_bucket(handle));
        let mut steps = 0;
        while let Some(idx) = cur {
            steps += 1;
            if steps > count {
                return Err(UCacheError::corrupt("file chain has a cycle"));
            }
            let f = self.fent(idx)?;
            if f.in_use != 0 && f.fs_id == fs_id && f.handle == handle {
                return Ok(Some(idx));
            }
            cur = opt_link(f.next, count, "file chain")?;
        }
        Ok(None)
    }

    /// The block table owned by a live file entry.
    pub fn file_table(&self, fent: u32) -> Result<TableRef> {
        let f = self.fent(fent)?;
        if f.in_use == 0 {
            return Err(UCacheError::Stale);
        }
        let geo = self.geometry();
        Ok(TableRef {
            blk: link(f.mtbl_blk, geo.slab_count, "file table slab")?,
            ent: link(f.mtbl_ent, geo.mtbl_per_block, "file table slot")?,
        })
    }

    /// Register an open of (fs_id, handle). Opening a cached file again only
    /// bumps its reference count. Allocation failures leave the index as it
    /// was, so the caller can evict and retry.
    pub(crate) fn insert_file(&mut self, fs_id: u32, handle: u64) -> Result<FileSlot> {
        if let Some(fent) = self.lookup_file(fs_id, handle)? {
            let table = self.file_table(fent)?;
            self.table_mut(table)?.ref_cnt += 1;
            return Ok(FileSlot {
                fent,
                table,
                existed: true,
            });
        }

        let table = self.allocate_block_table()?;
        let direct = self.file_bucket(handle);
        let fent = if self.fent(direct)?.in_use == 0 {
            self.claim_file_entry(direct)?;
            direct
        } else {
            let idx = match self.allocate_file_entry() {
                Ok(idx) => idx,
                Err(err) => {
                    self.free_block_table(table)?;
                    return Err(err);
                }
            };
            let after = self.fent(direct)?.next;
            self.fent_mut(idx)?.next = after;
            self.fent_mut(direct)?.next = idx as i32;
            idx
        };

        {
            let f = self.fent_mut(fent)?;
            f.fs_id = fs_id;
            f.handle = handle;
            f.size = 0;
            f.mtbl_blk = table.blk as i32;
            f.mtbl_ent = table.ent as i32;
        }
        {
            let t = self.table_mut(table)?;
            t.ref_cnt = 1;
            t.fent = fent as i32;
        }
        self.header_mut().open_files += 1;
        trace!(fs_id, handle, fent, "file entered cache");
        Ok(FileSlot {
            fent,
            table,
            existed: false,
        })
    }

    /// Drop one reference; returns the references left. Dropping the last one
    /// retires the entry's generation, so a file that stays cached after a
    /// failed close comes back under a new generation when reopened.
    pub(crate) fn release_file_ref(&mut self, fent: u32) -> Result<u32> {
        let table = self.file_table(fent)?;
        let t = self.table_mut(table)?;
        t.ref_cnt = t.ref_cnt.saturating_sub(1);
        let left = t.ref_cnt;
        if left == 0 {
            let f = self.fent_mut(fent)?;
            f.generation = f.generation.wrapping_add(1);
        }
        Ok(left)
    }

    /// Remove an unreferenced file whose block table is already empty.
    pub(crate) fn drop_file(&mut self, fent: u32) -> Result<()> {
        let table = self.file_table(fent)?;
        let th = self.table(table)?;
        if th.ref_cnt != 0 {
            return Err(UCacheError::corrupt(format!(
                "file entry {fent} dropped with {} references",
                th.ref_cnt
            )));
        }
        self.free_block_table(table)?;

        let hash_size = self.geometry().file_hash_size;
        if fent >= hash_size {
            self.unlink_overflow_entry(fent)?;
        }
        self.free_file_entry(fent)?;
        let h = self.header_mut();
        h.open_files = h.open_files.saturating_sub(1);
        Ok(())
    }

    fn unlink_overflow_entry(&mut self, fent: u32) -> Result<()> {
        let count = self.geometry().file_entry_count;
        let handle = self.fent(fent)?.handle;
        let mut prev = self.file_bucket(handle);
        for _ in 0..count {
            let next = opt_link(self.fent(prev)?.next, count, "file chain")?;
            match next {
                Some(n) if n == fent => {
                    let after = self.fent(fent)?.next;
                    self.fent_mut(prev)?.next = after;
                    return Ok(());
                }
                Some(n) => prev = n,
                None => break,
            }
        }
        Err(UCacheError::corrupt(format!(
            "file entry {fent} not reachable from its bucket"
        )))
    }

    /// Every live file entry, in index order.
    pub fn live_files(&self) -> Result<Vec<u32>> {
        let mut out = Vec::new();
        for idx in 0..self.geometry().file_entry_count {
            if self.fent(idx)?.in_use != 0 {
                out.push(idx);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::shm::region::ShmRegion;

    fn region() -> ShmRegion {
        let cfg = CacheConfig::default()
            .with_block_size(4096)
            .with_block_count(8)
            .with_file_table(4, 8)
            .with_mem_table(8, 16);
        ShmRegion::anonymous(&cfg).unwrap()
    }

    #[test]
    fn insert_lookup_drop() {
        let region = region();
        let mut a = region.lock_index();
        let slot = a.insert_file(7, 42).unwrap();
        assert!(!slot.existed);
        assert_eq!(a.lookup_file(7, 42).unwrap(), Some(slot.fent));
        assert_eq!(a.lookup_file(8, 42).unwrap(), None);

        assert_eq!(a.release_file_ref(slot.fent).unwrap(), 0);
        a.drop_file(slot.fent).unwrap();
        assert_eq!(a.lookup_file(7, 42).unwrap(), None);
        assert_eq!(a.header().open_files, 0);
    }

    #[test]
    fn reopen_bumps_ref_count() {
        let region = region();
        let mut a = region.lock_index();
        let first = a.insert_file(1, 9).unwrap();
        let again = a.insert_file(1, 9).unwrap();
        assert!(again.existed);
        assert_eq!(again.table, first.table);
        assert_eq!(a.table(first.table).unwrap().ref_cnt, 2);
        assert_eq!(a.release_file_ref(first.fent).unwrap(), 1);
    }

    #[test]
    fn last_release_retires_generation() {
        let region = region();
        let mut a = region.lock_index();
        let slot = a.insert_file(3, 3).unwrap();
        a.insert_file(3, 3).unwrap();
        let open_gen = a.fent(slot.fent).unwrap().generation;
        a.release_file_ref(slot.fent).unwrap();
        assert_eq!(a.fent(slot.fent).unwrap().generation, open_gen);
        a.release_file_ref(slot.fent).unwrap();
        let closed_gen = a.fent(slot.fent).unwrap().generation;
        assert_ne!(closed_gen, open_gen);

        // Still cached with no references: reopening keeps the new generation.
        let again = a.insert_file(3, 3).unwrap();
        assert!(again.existed);
        assert_eq!(a.fent(again.fent).unwrap().generation, closed_gen);
    }

    #[test]
    fn collisions_chain_from_direct_slot() {
        let region = region();
        let mut a = region.lock_index();
        // Handles 2, 6 and 10 share bucket 2 of 4.
        let h2 = a.insert_file(1, 2).unwrap();
        let h6 = a.insert_file(1, 6).unwrap();
        let h10 = a.insert_file(1, 10).unwrap();
        assert_eq!(h2.fent, 2);
        assert!(h6.fent >= 4 && h10.fent >= 4);

        // Removing the chain head leaves the others reachable.
        a.release_file_ref(h2.fent).unwrap();
        a.drop_file(h2.fent).unwrap();
        assert_eq!(a.lookup_file(1, 6).unwrap(), Some(h6.fent));
        assert_eq!(a.lookup_file(1, 10).unwrap(), Some(h10.fent));

        // The cleared head is reused in place.
        let h14 = a.insert_file(1, 14).unwrap();
        assert_eq!(h14.fent, 2);

        a.release_file_ref(h6.fent).unwrap();
        a.drop_file(h6.fent).unwrap();
        assert_eq!(a.lookup_file(1, 6).unwrap(), None);
        assert_eq!(a.lookup_file(1, 10).unwrap(), Some(h10.fent));
        assert_eq!(a.lookup_file(1, 14).unwrap(), Some(2));
    }

    #[test]
    fn overflow_exhaustion_leaves_no_partial_state() {
        let region = region();
        let mut a = region.lock_index();
        // Fill bucket 0 plus all four overflow entries.
        for i in 0..5u64 {
            a.insert_file(3, i * 4).unwrap();
        }
        assert!(matches!(a.insert_file(3, 20), Err(UCacheError::Exhausted)));
        assert_eq!(a.lookup_file(3, 20).unwrap(), None);
        assert_eq!(a.header().open_files, 5);
        // The table taken for the failed insert went back to the pool.
        let in_use: u32 = (0..a.geometry().slab_count)
            .map(|blk| a.desc(blk).unwrap().tables_in_use)
            .sum();
        assert_eq!(in_use, 5);
    }

    #[test]
    fn live_files_lists_open_entries() {
        let region = region();
        let mut a = region.lock_index();
        let x = a.insert_file(1, 1).unwrap();
        let y = a.insert_file(1, 5).unwrap();
        assert_eq!(a.live_files().unwrap(), vec![x.fent, y.fent]);
    }
}

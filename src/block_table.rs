//! Per-file block table.
//!
//! Memory entries hang off `mem_hash_size` bucket chains keyed by block
//! number. The same entries are threaded on a doubly-linked LRU list
//! (`lru_first` = most recently used) and a singly-linked dirty list. These
//! are the structural primitives; insert/remove with allocation, eviction and
//! write-back are driven from `UCache`.

use crate::error::{Result, UCacheError};
use crate::shm::layout::{MemEntry, MENT_DIRTY, MENT_IN_USE, NIL};
use crate::shm::{link, opt_link, Arena, TableRef};

impl Arena {
    /// Block-aligned tag of the block containing `offset`.
    pub fn block_tag(&self, offset: u64) -> u64 {
        let bs = self.geometry().block_size as u64;
        offset - offset % bs
    }

    pub(crate) fn mem_bucket(&self, offset: u64) -> u32 {
        let geo = self.geometry();
        ((offset / geo.block_size as u64) % geo.mem_hash_size as u64) as u32
    }

    fn ment_link(&self, value: i32, what: &str) -> Result<Option<u32>> {
        opt_link(value, self.geometry().mem_entry_count, what)
    }

    /// Find the entry caching the block that contains `offset`.
    pub fn lookup_mem(&self, t: TableRef, offset: u64) -> Result<Option<u32>> {
        let tag = self.block_tag(offset);
        let count = self.geometry().mem_entry_count;
        let mut cur = self.ment_link(self.bucket(t, self.mem_bucket(offset))?, "bucket")?;
        let mut steps = 0;
        while let Some(idx) = cur {
            steps += 1;
            if steps > count {
                return Err(UCacheError::corrupt("memory chain has a cycle"));
            }
            let m = self.ment(t, idx)?;
            if m.flags & MENT_IN_USE == 0 {
                return Err(UCacheError::corrupt(format!(
                    "free memory entry {idx} on a hash chain"
                )));
            }
            if m.tag == tag {
                return Ok(Some(idx));
            }
            cur = self.ment_link(m.next, "memory chain")?;
        }
        Ok(None)
    }

    /// Slab holding the data of a resident entry.
    pub fn mem_block(&self, t: TableRef, idx: u32) -> Result<u32> {
        let m = self.ment(t, idx)?;
        if m.flags & MENT_IN_USE == 0 {
            return Err(UCacheError::Stale);
        }
        link(m.item, self.geometry().slab_count, "memory entry block")
    }

    /// Make an allocated entry resident for `offset` in slab `blk`: head of
    /// its bucket chain and most recently used.
    pub(crate) fn link_mem(&mut self, t: TableRef, idx: u32, offset: u64, blk: u32) -> Result<()> {
        let tag = self.block_tag(offset);
        let bucket = self.mem_bucket(offset);
        let head = self.bucket(t, bucket)?;
        {
            let m = self.ment_mut(t, idx)?;
            m.tag = tag;
            m.item = blk as i32;
            m.next = head;
            m.dirty_next = NIL;
            m.flags = MENT_IN_USE;
            m.valid_len = 0;
        }
        self.set_bucket(t, bucket, idx as i32)?;
        self.lru_push_front(t, idx)?;
        self.table_mut(t)?.num_blocks += 1;
        Ok(())
    }

    /// Take a resident entry off every list and return its slab. The entry
    /// itself stays allocated; the caller frees it and the slab.
    pub(crate) fn unlink_mem(&mut self, t: TableRef, idx: u32) -> Result<u32> {
        let m = self.ment(t, idx)?;
        let blk = self.mem_block(t, idx)?;

        let bucket = self.mem_bucket(m.tag);
        let mut prev: Option<u32> = None;
        let mut cur = self.ment_link(self.bucket(t, bucket)?, "bucket")?;
        let mut found = false;
        for _ in 0..self.geometry().mem_entry_count {
            let Some(c) = cur else { break };
            let next = self.ment(t, c)?.next;
            if c == idx {
                match prev {
                    None => self.set_bucket(t, bucket, next)?,
                    Some(p) => self.ment_mut(t, p)?.next = next,
                }
                found = true;
                break;
            }
            prev = Some(c);
            cur = self.ment_link(next, "memory chain")?;
        }
        if !found {
            return Err(UCacheError::corrupt(format!(
                "memory entry {idx} not reachable from bucket {bucket}"
            )));
        }

        self.lru_unlink(t, idx)?;
        if m.is_dirty() {
            self.dirty_unlink(t, idx)?;
        }
        let th = self.table_mut(t)?;
        th.num_blocks = th.num_blocks.saturating_sub(1);
        let m = self.ment_mut(t, idx)?;
        m.next = NIL;
        m.item = NIL;
        Ok(blk)
    }

    fn lru_push_front(&mut self, t: TableRef, idx: u32) -> Result<()> {
        let first = self.table(t)?.lru_first;
        {
            let m = self.ment_mut(t, idx)?;
            m.lru_prev = NIL;
            m.lru_next = first;
        }
        match self.ment_link(first, "lru head")? {
            Some(f) => self.ment_mut(t, f)?.lru_prev = idx as i32,
            None => self.table_mut(t)?.lru_last = idx as i32,
        }
        self.table_mut(t)?.lru_first = idx as i32;
        Ok(())
    }

    fn lru_unlink(&mut self, t: TableRef, idx: u32) -> Result<()> {
        let m = self.ment(t, idx)?;
        match self.ment_link(m.lru_prev, "lru prev")? {
            Some(p) => self.ment_mut(t, p)?.lru_next = m.lru_next,
            None => self.table_mut(t)?.lru_first = m.lru_next,
        }
        match self.ment_link(m.lru_next, "lru next")? {
            Some(n) => self.ment_mut(t, n)?.lru_prev = m.lru_prev,
            None => self.table_mut(t)?.lru_last = m.lru_prev,
        }
        let m = self.ment_mut(t, idx)?;
        m.lru_prev = NIL;
        m.lru_next = NIL;
        Ok(())
    }

    /// Promote an entry to most recently used.
    pub fn touch(&mut self, t: TableRef, idx: u32) -> Result<()> {
        if self.table(t)?.lru_first == idx as i32 {
            return Ok(());
        }
        self.lru_unlink(t, idx)?;
        self.lru_push_front(t, idx)
    }

    /// Least recently used entry, the eviction candidate.
    pub fn lru_tail(&self, t: TableRef) -> Result<Option<u32>> {
        self.ment_link(self.table(t)?.lru_last, "lru tail")
    }

    /// Entries from most to least recently used.
    pub fn lru_order(&self, t: TableRef) -> Result<Vec<u32>> {
        let count = self.geometry().mem_entry_count as usize;
        let mut out = Vec::new();
        let mut cur = self.ment_link(self.table(t)?.lru_first, "lru head")?;
        while let Some(idx) = cur {
            if out.len() >= count {
                return Err(UCacheError::corrupt("lru list has a cycle"));
            }
            out.push(idx);
            cur = self.ment_link(self.ment(t, idx)?.lru_next, "lru next")?;
        }
        Ok(out)
    }

    /// Put a resident entry on the dirty list; no-op if it is already there.
    pub(crate) fn mark_dirty(&mut self, t: TableRef, idx: u32) -> Result<()> {
        let m = self.ment(t, idx)?;
        if m.flags & MENT_IN_USE == 0 {
            return Err(UCacheError::Stale);
        }
        if m.is_dirty() {
            return Ok(());
        }
        let head = self.table(t)?.dirty_list;
        let m = self.ment_mut(t, idx)?;
        m.flags |= MENT_DIRTY;
        m.dirty_next = head;
        self.table_mut(t)?.dirty_list = idx as i32;
        Ok(())
    }

    fn dirty_unlink(&mut self, t: TableRef, idx: u32) -> Result<()> {
        let mut prev: Option<u32> = None;
        let mut cur = self.ment_link(self.table(t)?.dirty_list, "dirty head")?;
        for _ in 0..self.geometry().mem_entry_count {
            let Some(c) = cur else { break };
            let next = self.ment(t, c)?.dirty_next;
            if c == idx {
                match prev {
                    None => self.table_mut(t)?.dirty_list = next,
                    Some(p) => self.ment_mut(t, p)?.dirty_next = next,
                }
                let m = self.ment_mut(t, idx)?;
                m.flags &= !MENT_DIRTY;
                m.dirty_next = NIL;
                return Ok(());
            }
            prev = Some(c);
            cur = self.ment_link(next, "dirty next")?;
        }
        Err(UCacheError::corrupt(format!(
            "dirty memory entry {idx} missing from the dirty list"
        )))
    }

    /// Dirty entries, head to tail.
    pub fn dirty_entries(&self, t: TableRef) -> Result<Vec<u32>> {
        let count = self.geometry().mem_entry_count as usize;
        let mut out = Vec::new();
        let mut cur = self.ment_link(self.table(t)?.dirty_list, "dirty head")?;
        while let Some(idx) = cur {
            if out.len() >= count {
                return Err(UCacheError::corrupt("dirty list has a cycle"));
            }
            out.push(idx);
            cur = self.ment_link(self.ment(t, idx)?.dirty_next, "dirty next")?;
        }
        Ok(out)
    }

    /// Empty the dirty list after a successful write-back of all of it.
    pub(crate) fn clear_dirty_list(&mut self, t: TableRef) -> Result<()> {
        for idx in self.dirty_entries(t)? {
            let m = self.ment_mut(t, idx)?;
            m.flags &= !MENT_DIRTY;
            m.dirty_next = NIL;
        }
        self.table_mut(t)?.dirty_list = NIL;
        Ok(())
    }

    /// Record that `len` bytes from the start of a block hold file data.
    pub(crate) fn extend_valid(&mut self, t: TableRef, idx: u32, len: usize) -> Result<()> {
        let m: &mut MemEntry = self.ment_mut(t, idx)?;
        m.valid_len = m.valid_len.max(len as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::shm::region::ShmRegion;

    const BS: u64 = 4096;

    fn region() -> ShmRegion {
        let cfg = CacheConfig::default()
            .with_block_size(BS as usize)
            .with_block_count(8)
            .with_file_table(4, 8)
            .with_mem_table(4, 8);
        ShmRegion::anonymous(&cfg).unwrap()
    }

    fn resident(a: &mut Arena, t: TableRef, offset: u64) -> u32 {
        let idx = a.allocate_mem_entry(t).unwrap();
        let blk = a.allocate_block().unwrap();
        a.link_mem(t, idx, offset, blk).unwrap();
        idx
    }

    #[test]
    fn lookup_matches_block_aligned_offsets() {
        let region = region();
        let mut a = region.lock_index();
        let t = a.allocate_block_table().unwrap();
        let idx = resident(&mut a, t, BS * 3 + 17);
        assert_eq!(a.lookup_mem(t, BS * 3).unwrap(), Some(idx));
        assert_eq!(a.lookup_mem(t, BS * 4 - 1).unwrap(), Some(idx));
        assert_eq!(a.lookup_mem(t, BS * 4).unwrap(), None);
        assert_eq!(a.ment(t, idx).unwrap().tag, BS * 3);
        assert_eq!(a.table(t).unwrap().num_blocks, 1);
    }

    #[test]
    fn colliding_blocks_share_a_chain() {
        let region = region();
        let mut a = region.lock_index();
        let t = a.allocate_block_table().unwrap();
        // Blocks 1, 5 and 9 land in bucket 1 of 4.
        let b1 = resident(&mut a, t, BS);
        let b5 = resident(&mut a, t, BS * 5);
        let b9 = resident(&mut a, t, BS * 9);

        let blk = a.unlink_mem(t, b5).unwrap();
        a.free_block(blk).unwrap();
        a.free_mem_entry(t, b5).unwrap();

        assert_eq!(a.lookup_mem(t, BS).unwrap(), Some(b1));
        assert_eq!(a.lookup_mem(t, BS * 5).unwrap(), None);
        assert_eq!(a.lookup_mem(t, BS * 9).unwrap(), Some(b9));
        assert_eq!(a.table(t).unwrap().num_blocks, 2);
    }

    #[test]
    fn lru_order_follows_touches() {
        let region = region();
        let mut a = region.lock_index();
        let t = a.allocate_block_table().unwrap();
        let x = resident(&mut a, t, 0);
        let y = resident(&mut a, t, BS);
        let z = resident(&mut a, t, BS * 2);
        assert_eq!(a.lru_order(t).unwrap(), vec![z, y, x]);
        assert_eq!(a.lru_tail(t).unwrap(), Some(x));

        a.touch(t, x).unwrap();
        assert_eq!(a.lru_order(t).unwrap(), vec![x, z, y]);
        a.touch(t, x).unwrap();
        assert_eq!(a.lru_tail(t).unwrap(), Some(y));

        a.unlink_mem(t, z).unwrap();
        assert_eq!(a.lru_order(t).unwrap(), vec![x, y]);
    }

    #[test]
    fn dirty_list_tracks_marks_and_unlinks() {
        let region = region();
        let mut a = region.lock_index();
        let t = a.allocate_block_table().unwrap();
        let x = resident(&mut a, t, 0);
        let y = resident(&mut a, t, BS);
        let z = resident(&mut a, t, BS * 2);
        assert!(a.dirty_entries(t).unwrap().is_empty());

        a.mark_dirty(t, x).unwrap();
        a.mark_dirty(t, y).unwrap();
        a.mark_dirty(t, x).unwrap();
        a.mark_dirty(t, z).unwrap();
        assert_eq!(a.dirty_entries(t).unwrap(), vec![z, y, x]);

        a.unlink_mem(t, y).unwrap();
        assert_eq!(a.dirty_entries(t).unwrap(), vec![z, x]);

        a.clear_dirty_list(t).unwrap();
        assert!(a.dirty_entries(t).unwrap().is_empty());
        assert!(!a.ment(t, x).unwrap().is_dirty());
    }
}

//! Slab allocator.
//!
//! Four pools, each an index-linked free list threaded through the shared
//! segment: data-capable slabs, block-table slots (carved out of slabs on
//! demand), overflow file entries, and the memory entries local to each block
//! table. Every pop and push is O(1) apart from returning a vacated table slab,
//! which has to unthread its slots from the table free list.
//!
//! A slab's role is recorded in its `BlockDesc`, outside the slab bytes, and
//! read back as a `SlabSlot`. Freeing something that is already free is
//! reported as `DoubleFree` and leaves the free lists untouched.

use tracing::debug;

use crate::config::CacheConfig;
use crate::error::{Result, UCacheError};
use crate::shm::layout::{
    HDR_PROVISIONAL_DIRTY, LAYOUT_VERSION, MAGIC, MENT_IN_USE, NIL, PINNED_TABLE_SLAB,
    SLAB_DATA, SLAB_FREE, SLAB_TABLES,
};
use crate::shm::{opt_link, Arena, TableRef};

/// What a slab currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabSlot {
    Free { next: Option<u32> },
    CacheBlock { generation: u32 },
    BlockTables { in_use: u32 },
}

impl Arena {
    /// Lay out an all-free cache. The segment must already be zeroed.
    pub(crate) fn format(&mut self, cfg: &CacheConfig) -> Result<()> {
        let geo = *self.geometry();
        {
            let h = self.header_mut();
            h.magic = MAGIC;
            h.version = LAYOUT_VERSION;
            h.block_size = geo.block_size as u32;
            h.block_count = geo.block_count;
            h.slab_count = geo.slab_count;
            h.file_hash_size = geo.file_hash_size;
            h.file_entry_count = geo.file_entry_count;
            h.mem_hash_size = geo.mem_hash_size;
            h.mem_entry_count = geo.mem_entry_count;
            h.mtbl_size = geo.mtbl_size as u32;
            h.mtbl_per_block = geo.mtbl_per_block;
            h.free_blk = NIL;
            h.free_fent = NIL;
            h.free_mtbl_blk = NIL;
            h.free_mtbl_ent = NIL;
            h.resident_blocks = 0;
            h.table_slabs = 0;
            h.open_files = 0;
            h.flags = if cfg.provisional_dirty {
                HDR_PROVISIONAL_DIRTY
            } else {
                0
            };
        }

        // Data-capable slabs, linked in ascending order.
        for blk in (0..geo.slab_count).rev() {
            if blk == PINNED_TABLE_SLAB {
                continue;
            }
            let head = self.header().free_blk;
            let d = self.desc_mut(blk)?;
            d.state = SLAB_FREE;
            d.next_free = head;
            d.tables_in_use = 0;
            d.generation = 0;
            self.header_mut().free_blk = blk as i32;
        }

        self.add_free_tables(PINNED_TABLE_SLAB)?;

        // Direct-mapped file slots are chain heads; the rest form the overflow pool.
        for idx in 0..geo.file_entry_count {
            let f = self.fent_mut(idx)?;
            f.in_use = 0;
            f.mtbl_blk = NIL;
            f.mtbl_ent = NIL;
            f.generation = 0;
            f.next = NIL;
        }
        for idx in (geo.file_hash_size..geo.file_entry_count).rev() {
            let head = self.header().free_fent;
            self.fent_mut(idx)?.next = head;
            self.header_mut().free_fent = idx as i32;
        }

        debug!(
            slabs = geo.slab_count,
            tables_per_slab = geo.mtbl_per_block,
            "formatted ucache arena"
        );
        Ok(())
    }

    pub fn slab_slot(&self, blk: u32) -> Result<SlabSlot> {
        let d = self.desc(blk)?;
        match d.state {
            SLAB_FREE => Ok(SlabSlot::Free {
                next: opt_link(d.next_free, self.geometry().slab_count, "free slab")?,
            }),
            SLAB_DATA => Ok(SlabSlot::CacheBlock {
                generation: d.generation,
            }),
            SLAB_TABLES => Ok(SlabSlot::BlockTables {
                in_use: d.tables_in_use,
            }),
            other => Err(UCacheError::corrupt(format!(
                "slab {blk} has unknown state {other}"
            ))),
        }
    }

    fn pop_free_slab(&mut self) -> Result<Option<u32>> {
        let slab_count = self.geometry().slab_count;
        let Some(blk) = opt_link(self.header().free_blk, slab_count, "free slab")? else {
            return Ok(None);
        };
        let d = self.desc(blk)?;
        if d.state != SLAB_FREE {
            return Err(UCacheError::corrupt(format!(
                "slab {blk} on free list is not free"
            )));
        }
        self.header_mut().free_blk = d.next_free;
        self.desc_mut(blk)?.next_free = NIL;
        Ok(Some(blk))
    }

    /// Pop a slab for use as a cache block.
    pub fn allocate_block(&mut self) -> Result<u32> {
        let blk = match self.pop_free_slab()? {
            Some(blk) => blk,
            None => {
                if self.reclaim_table_slabs()? == 0 {
                    return Err(UCacheError::Exhausted);
                }
                self.pop_free_slab()?.ok_or(UCacheError::Exhausted)?
            }
        };
        let d = self.desc_mut(blk)?;
        d.state = SLAB_DATA;
        d.generation = d.generation.wrapping_add(1);
        self.header_mut().resident_blocks += 1;
        Ok(blk)
    }

    /// Return a data slab, or a fully vacated table slab, to the free list.
    pub fn free_block(&mut self, blk: u32) -> Result<()> {
        match self.slab_slot(blk)? {
            SlabSlot::Free { .. } => {
                return Err(UCacheError::DoubleFree {
                    what: "block",
                    index: blk,
                })
            }
            SlabSlot::CacheBlock { .. } => {
                let h = self.header_mut();
                h.resident_blocks = h.resident_blocks.saturating_sub(1);
            }
            SlabSlot::BlockTables { in_use } => {
                if in_use != 0 || blk == PINNED_TABLE_SLAB {
                    return Err(UCacheError::corrupt(format!(
                        "table slab {blk} released while in use"
                    )));
                }
                self.unthread_table_slots(blk)?;
                let h = self.header_mut();
                h.table_slabs = h.table_slabs.saturating_sub(1);
            }
        }
        let head = self.header().free_blk;
        let d = self.desc_mut(blk)?;
        d.state = SLAB_FREE;
        d.tables_in_use = 0;
        d.next_free = head;
        self.header_mut().free_blk = blk as i32;
        Ok(())
    }

    /// Return every table slab with no live tables to the free-block list.
    pub fn reclaim_table_slabs(&mut self) -> Result<u32> {
        let mut reclaimed = 0;
        for blk in 0..self.geometry().slab_count {
            if blk == PINNED_TABLE_SLAB {
                continue;
            }
            if let SlabSlot::BlockTables { in_use: 0 } = self.slab_slot(blk)? {
                self.free_block(blk)?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "returned vacant table slabs to the block pool");
        }
        Ok(reclaimed)
    }

    /// Thread every table slot of `blk` onto the table free list.
    fn add_free_tables(&mut self, blk: u32) -> Result<()> {
        let per_block = self.geometry().mtbl_per_block;
        {
            let d = self.desc_mut(blk)?;
            d.state = SLAB_TABLES;
            d.tables_in_use = 0;
            d.next_free = NIL;
        }
        for ent in (0..per_block).rev() {
            let (head_blk, head_ent) = {
                let h = self.header();
                (h.free_mtbl_blk, h.free_mtbl_ent)
            };
            let t = self.table_mut(TableRef { blk, ent })?;
            t.in_use = 0;
            t.free_next_blk = head_blk;
            t.free_next_ent = head_ent;
            let h = self.header_mut();
            h.free_mtbl_blk = blk as i32;
            h.free_mtbl_ent = ent as i32;
        }
        self.header_mut().table_slabs += 1;
        Ok(())
    }

    /// Drop the slots belonging to `blk` from the table free list.
    fn unthread_table_slots(&mut self, blk: u32) -> Result<()> {
        let limit = self.geometry().slab_count as u64 * self.geometry().mtbl_per_block as u64;
        let mut prev: Option<TableRef> = None;
        let mut cur = self.free_table_head()?;
        let mut steps = 0u64;
        while let Some(t) = cur {
            steps += 1;
            if steps > limit {
                return Err(UCacheError::corrupt("table free list has a cycle"));
            }
            let th = self.table(t)?;
            let next = self.table_link(th.free_next_blk, th.free_next_ent)?;
            if t.blk == blk {
                let (nb, ne) = next.map_or((NIL, NIL), |n| (n.blk as i32, n.ent as i32));
                match prev {
                    None => {
                        let h = self.header_mut();
                        h.free_mtbl_blk = nb;
                        h.free_mtbl_ent = ne;
                    }
                    Some(p) => {
                        let pt = self.table_mut(p)?;
                        pt.free_next_blk = nb;
                        pt.free_next_ent = ne;
                    }
                }
            } else {
                prev = Some(t);
            }
            cur = next;
        }
        Ok(())
    }

    fn table_link(&self, blk: i32, ent: i32) -> Result<Option<TableRef>> {
        let geo = self.geometry();
        let blk = opt_link(blk, geo.slab_count, "table slab")?;
        let ent = opt_link(ent, geo.mtbl_per_block, "table slot")?;
        match (blk, ent) {
            (Some(blk), Some(ent)) => Ok(Some(TableRef { blk, ent })),
            (None, None) => Ok(None),
            _ => Err(UCacheError::corrupt("half-linked table free list")),
        }
    }

    fn free_table_head(&self) -> Result<Option<TableRef>> {
        let h = self.header();
        self.table_link(h.free_mtbl_blk, h.free_mtbl_ent)
    }

    /// Pop a free block-table slot, converting a free slab into table slots
    /// when none are left. The table comes back initialised and empty.
    pub fn allocate_block_table(&mut self) -> Result<TableRef> {
        let t = match self.free_table_head()? {
            Some(t) => t,
            None => {
                let blk = self.pop_free_slab()?.ok_or(UCacheError::Exhausted)?;
                self.add_free_tables(blk)?;
                debug!(blk, "converted slab into block tables");
                self.free_table_head()?.ok_or(UCacheError::Exhausted)?
            }
        };
        let th = self.table(t)?;
        if th.in_use != 0 {
            return Err(UCacheError::corrupt(format!(
                "table {t:?} on free list is in use"
            )));
        }
        {
            let h = self.header_mut();
            h.free_mtbl_blk = th.free_next_blk;
            h.free_mtbl_ent = th.free_next_ent;
        }
        self.desc_mut(t.blk)?.tables_in_use += 1;
        self.init_block_table(t)?;
        Ok(t)
    }

    fn init_block_table(&mut self, t: TableRef) -> Result<()> {
        let geo = *self.geometry();
        {
            let th = self.table_mut(t)?;
            th.lru_first = NIL;
            th.lru_last = NIL;
            th.dirty_list = NIL;
            th.free_list = NIL;
            th.num_blocks = 0;
            th.ref_cnt = 0;
            th.free_next_blk = NIL;
            th.free_next_ent = NIL;
            th.in_use = 1;
            th.fent = NIL;
        }
        for b in 0..geo.mem_hash_size {
            self.set_bucket(t, b, NIL)?;
        }
        for i in (0..geo.mem_entry_count).rev() {
            let head = self.table(t)?.free_list;
            let m = self.ment_mut(t, i)?;
            m.tag = 0;
            m.item = NIL;
            m.next = head;
            m.dirty_next = NIL;
            m.lru_prev = NIL;
            m.lru_next = NIL;
            m.flags = 0;
            m.valid_len = 0;
            self.table_mut(t)?.free_list = i as i32;
        }
        Ok(())
    }

    /// Return an empty block table to the table free list.
    pub fn free_block_table(&mut self, t: TableRef) -> Result<()> {
        let th = self.table(t)?;
        if th.in_use == 0 {
            return Err(UCacheError::DoubleFree {
                what: "block table",
                index: t.blk * self.geometry().mtbl_per_block + t.ent,
            });
        }
        if th.num_blocks != 0 {
            return Err(UCacheError::corrupt(format!(
                "table {t:?} released with {} resident blocks",
                th.num_blocks
            )));
        }
        let (head_blk, head_ent) = {
            let h = self.header();
            (h.free_mtbl_blk, h.free_mtbl_ent)
        };
        {
            let tm = self.table_mut(t)?;
            tm.in_use = 0;
            tm.fent = NIL;
            tm.free_next_blk = head_blk;
            tm.free_next_ent = head_ent;
        }
        {
            let h = self.header_mut();
            h.free_mtbl_blk = t.blk as i32;
            h.free_mtbl_ent = t.ent as i32;
        }
        let d = self.desc_mut(t.blk)?;
        d.tables_in_use = d.tables_in_use.saturating_sub(1);
        Ok(())
    }

    /// Pop an overflow file entry. The entry comes back marked in use.
    pub fn allocate_file_entry(&mut self) -> Result<u32> {
        let geo = *self.geometry();
        let idx = opt_link(self.header().free_fent, geo.file_entry_count, "free file entry")?
            .ok_or(UCacheError::Exhausted)?;
        if idx < geo.file_hash_size {
            return Err(UCacheError::corrupt(format!(
                "direct file slot {idx} found on the free list"
            )));
        }
        let f = self.fent(idx)?;
        if f.in_use != 0 {
            return Err(UCacheError::corrupt(format!(
                "file entry {idx} on free list is in use"
            )));
        }
        self.header_mut().free_fent = f.next;
        self.claim_file_entry(idx)?;
        self.fent_mut(idx)?.next = NIL;
        Ok(idx)
    }

    /// Mark a file entry in use, keeping its chain link.
    pub(crate) fn claim_file_entry(&mut self, idx: u32) -> Result<()> {
        let f = self.fent_mut(idx)?;
        f.in_use = 1;
        f.generation = f.generation.wrapping_add(1);
        f.handle = 0;
        f.fs_id = 0;
        f.size = 0;
        f.mtbl_blk = NIL;
        f.mtbl_ent = NIL;
        Ok(())
    }

    /// Release a file entry. Direct slots are cleared in place and stay chain
    /// heads; overflow entries (already unlinked by the caller) go back to the
    /// free list.
    pub fn free_file_entry(&mut self, idx: u32) -> Result<()> {
        let hash_size = self.geometry().file_hash_size;
        if self.fent(idx)?.in_use == 0 {
            return Err(UCacheError::DoubleFree {
                what: "file entry",
                index: idx,
            });
        }
        let head = self.header().free_fent;
        let f = self.fent_mut(idx)?;
        f.in_use = 0;
        f.handle = 0;
        f.fs_id = 0;
        f.size = 0;
        f.mtbl_blk = NIL;
        f.mtbl_ent = NIL;
        if idx >= hash_size {
            f.next = head;
            self.header_mut().free_fent = idx as i32;
        }
        Ok(())
    }

    /// Pop a memory entry from a block table's local pool.
    pub fn allocate_mem_entry(&mut self, t: TableRef) -> Result<u32> {
        let count = self.geometry().mem_entry_count;
        let idx = opt_link(self.table(t)?.free_list, count, "free memory entry")?
            .ok_or(UCacheError::Exhausted)?;
        let m = self.ment(t, idx)?;
        if m.flags & MENT_IN_USE != 0 {
            return Err(UCacheError::corrupt(format!(
                "memory entry {idx} on free list is in use"
            )));
        }
        self.table_mut(t)?.free_list = m.next;
        let m = self.ment_mut(t, idx)?;
        m.flags = MENT_IN_USE;
        m.item = NIL;
        m.next = NIL;
        m.dirty_next = NIL;
        m.lru_prev = NIL;
        m.lru_next = NIL;
        m.valid_len = 0;
        Ok(idx)
    }

    pub fn free_mem_entry(&mut self, t: TableRef, idx: u32) -> Result<()> {
        if self.ment(t, idx)?.flags & MENT_IN_USE == 0 {
            return Err(UCacheError::DoubleFree {
                what: "memory entry",
                index: idx,
            });
        }
        let head = self.table(t)?.free_list;
        let m = self.ment_mut(t, idx)?;
        m.flags = 0;
        m.item = NIL;
        m.tag = 0;
        m.next = head;
        m.dirty_next = NIL;
        m.lru_prev = NIL;
        m.lru_next = NIL;
        self.table_mut(t)?.free_list = idx as i32;
        Ok(())
    }
}

//! Byte-range I/O on top of the block cache.
//!
//! `IoSplitter` cuts a request into block-aligned pieces and serves each one
//! through the cache. Only backing-store errors reach the caller: if the
//! cache itself fails a piece (exhausted, busy, stale or corrupt state) the
//! rest of the request goes straight to the store.

use std::sync::atomic::Ordering;

use tracing::warn;

use crate::cache::{BlockRef, FileRef, UCache};
use crate::error::{StoreError, UCacheError};
use crate::store::BackingStore;

pub struct IoSplitter<'a, S> {
    cache: &'a UCache<S>,
}

/// One block-aligned piece of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Piece {
    /// File offset of the piece.
    pos: u64,
    /// Offset of the piece inside its block.
    within: usize,
    len: usize,
}

fn pieces(block_size: usize, offset: u64, len: usize) -> impl Iterator<Item = Piece> {
    let bs = block_size as u64;
    let mut done = 0usize;
    std::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let pos = offset + done as u64;
        let within = (pos % bs) as usize;
        let piece = Piece {
            pos,
            within,
            len: (block_size - within).min(len - done),
        };
        done += piece.len;
        Some(piece)
    })
}

impl<'a, S: BackingStore> IoSplitter<'a, S> {
    pub fn new(cache: &'a UCache<S>) -> Self {
        IoSplitter { cache }
    }

    /// Read into `buf` starting at `offset`. Returns the bytes read, fewer
    /// than requested only at end of file. Holes read as zeros.
    pub fn read(&self, file: &FileRef, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let mut done = 0;
        for p in pieces(self.cache.block_size(), offset, buf.len()) {
            let out = &mut buf[done..done + p.len];
            let n = match self.read_piece(file, p, out) {
                Ok(n) => n,
                Err(UCacheError::Store(err)) => return Err(err),
                Err(err) => {
                    self.fall_back(file, p.pos, &err);
                    // Dirty blocks must reach the store before it is read.
                    match self.cache.flush_object(file.object()) {
                        Ok(_) => {}
                        Err(UCacheError::Store(err)) => return Err(err),
                        Err(err) => warn!(%err, "could not flush before uncached read"),
                    }
                    let rest = read_full(self.cache.store(), file, p.pos, &mut buf[done..])?;
                    return Ok(done + rest);
                }
            };
            done += n;
            if n < p.len {
                break;
            }
        }
        Ok(done)
    }

    /// Write `buf` at `offset` through the cache. Returns the bytes written.
    pub fn write(&self, file: &FileRef, offset: u64, buf: &[u8]) -> Result<usize, StoreError> {
        let mut done = 0;
        for p in pieces(self.cache.block_size(), offset, buf.len()) {
            match self.write_piece(file, p, &buf[done..done + p.len]) {
                Ok(()) => done += p.len,
                Err(UCacheError::Store(err)) => return Err(err),
                Err(err) => {
                    self.fall_back(file, p.pos, &err);
                    // Nothing cached may shadow what goes to the store.
                    match self.cache.discard_range(file.object(), p.pos, buf.len() - done) {
                        Ok(_) => {}
                        Err(UCacheError::Store(err)) => return Err(err),
                        Err(err) => {
                            warn!(%err, "could not drop cached blocks before uncached write")
                        }
                    }
                    write_full(self.cache.store(), file, p.pos, &buf[done..])?;
                    return Ok(buf.len());
                }
            }
        }
        Ok(done)
    }

    fn block_for(&self, file: &FileRef, pos: u64) -> Result<BlockRef, UCacheError> {
        match self.cache.lookup(file, pos)? {
            Some(b) => Ok(b),
            None => self.cache.insert(file, pos),
        }
    }

    fn read_piece(&self, file: &FileRef, p: Piece, out: &mut [u8]) -> Result<usize, UCacheError> {
        let guard = match self.cache.lock_block(&self.block_for(file, p.pos)?) {
            // Evicted between lookup and lock; one more try.
            Err(UCacheError::Stale) => self.cache.lock_block(&self.block_for(file, p.pos)?)?,
            other => other?,
        };
        let readable = guard.readable_len();
        if p.within >= readable {
            return Ok(0);
        }
        let n = p.len.min(readable - p.within);
        out[..n].copy_from_slice(&guard[p.within..p.within + n]);
        Ok(n)
    }

    fn write_piece(&self, file: &FileRef, p: Piece, data: &[u8]) -> Result<(), UCacheError> {
        let range = p.within..p.within + p.len;
        let mut guard = match self
            .cache
            .lock_block_for_write(&self.block_for(file, p.pos)?, range.clone())
        {
            Err(UCacheError::Stale) => self
                .cache
                .lock_block_for_write(&self.block_for(file, p.pos)?, range.clone())?,
            other => other?,
        };
        guard[range].copy_from_slice(data);
        Ok(())
    }

    fn fall_back(&self, file: &FileRef, pos: u64, err: &UCacheError) {
        self.cache
            .region()
            .header()
            .fallbacks
            .fetch_add(1, Ordering::Relaxed);
        warn!(
            fs_id = file.object().fs_id,
            handle = file.object().handle,
            offset = pos,
            %err,
            "cache unavailable, using uncached I/O"
        );
    }
}

fn read_full<S: BackingStore>(
    store: &S,
    file: &FileRef,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize, StoreError> {
    let mut done = 0;
    while done < buf.len() {
        let n = store.read_at(file.object(), offset + done as u64, &mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

fn write_full<S: BackingStore>(
    store: &S,
    file: &FileRef,
    offset: u64,
    buf: &[u8],
) -> Result<(), StoreError> {
    let n = store.write_at(file.object(), offset, buf)?;
    if n != buf.len() {
        return Err(StoreError::ShortTransfer {
            offset,
            expected: buf.len(),
            actual: n,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use crate::config::CacheConfig;
    use crate::store::{MemStore, ObjectRef};

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
    fn pieces_follow_block_boundaries() {
        let got: Vec<(u64, usize, usize)> = pieces(BS, 4000, 5000)
            .map(|p| (p.pos, p.within, p.len))
            .collect();
        assert_eq!(
            got,
            vec![(4000, 4000, 96), (4096, 0, 4096), (8192, 0, 808)]
        );
        assert_eq!(pieces(BS, 0, 0).count(), 0);
    }

    #[test]
    fn write_then_read_spanning_blocks() {
        let c = cache(8);
        let io = IoSplitter::new(&c);
        let f = c.open(1, 1).unwrap();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(io.write(&f, 100, &data).unwrap(), data.len());
        assert_eq!(c.store().write_count(), 0);

        let mut back = vec![0u8; data.len()];
        assert_eq!(io.read(&f, 100, &mut back).unwrap(), data.len());
        assert_eq!(back, data);

        c.flush_file(&f).unwrap();
        let stored = c.store().contents(f.object()).unwrap();
        assert_eq!(&stored[100..], &data[..]);
    }

    #[test]
    fn read_stops_at_end_of_file() {
        let c = cache(8);
        c.store().put(ObjectRef::new(1, 1), vec![9u8; BS + 5]);
        let io = IoSplitter::new(&c);
        let f = c.open(1, 1).unwrap();
        let mut buf = vec![0u8; 3 * BS];
        assert_eq!(io.read(&f, 10, &mut buf).unwrap(), BS - 5);
        assert!(buf[..BS - 5].iter().all(|&b| b == 9));
        assert_eq!(io.read(&f, 2 * BS as u64, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_runs_through_holes_to_end_of_file() {
        let c = cache(8);
        c.store().put(ObjectRef::new(1, 1), vec![4u8; 10]);
        let io = IoSplitter::new(&c);
        let f = c.open(1, 1).unwrap();
        // Block 0 is loaded while the file is still 10 bytes long.
        let mut head = [0u8; 10];
        assert_eq!(io.read(&f, 0, &mut head).unwrap(), 10);
        io.write(&f, 2 * BS as u64, b"b").unwrap();

        let mut buf = vec![1u8; 2 * BS + 1];
        assert_eq!(io.read(&f, 0, &mut buf).unwrap(), 2 * BS + 1);
        assert!(buf[..10].iter().all(|&b| b == 4));
        assert!(buf[10..2 * BS].iter().all(|&b| b == 0));
        assert_eq!(buf[2 * BS], b'b');
    }

    #[test]
    fn read_across_an_unwritten_block() {
        let c = cache(8);
        let io = IoSplitter::new(&c);
        let f = c.open(1, 2).unwrap();
        io.write(&f, BS as u64, b"b").unwrap();
        let mut buf = vec![1u8; BS + 1];
        assert_eq!(io.read(&f, 0, &mut buf).unwrap(), BS + 1);
        assert!(buf[..BS].iter().all(|&b| b == 0));
        assert_eq!(buf[BS], b'b');
    }

    #[test]
    fn reads_are_served_from_cache() {
        let c = cache(8);
        c.store().put(ObjectRef::new(1, 1), vec![3u8; BS]);
        let io = IoSplitter::new(&c);
        let f = c.open(1, 1).unwrap();
        let mut buf = [0u8; 16];
        io.read(&f, 0, &mut buf).unwrap();
        io.read(&f, 16, &mut buf).unwrap();
        assert_eq!(c.store().read_count(), 1);
        assert_eq!(c.stats().hits, 1);
    }

    #[test]
    fn cache_failure_falls_back_to_the_store() {
        let c = cache(2);
        let io = IoSplitter::new(&c);
        // A closed file reference is a cache-side failure, not a store one.
        let closed = c.open(1, 3).unwrap();
        c.close(closed).unwrap();

        assert_eq!(io.write(&closed, 0, b"direct").unwrap(), 6);
        assert_eq!(c.store().contents(ObjectRef::new(1, 3)).unwrap(), b"direct");
        let mut buf = [0u8; 6];
        assert_eq!(io.read(&closed, 0, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"direct");
        assert_eq!(c.stats().fallbacks, 2);
    }

    #[test]
    fn uncached_write_waits_out_a_busy_block() {
        let c = cache(4);
        c.store().put(ObjectRef::new(1, 4), b"old!".to_vec());
        let stale = c.open(1, 4).unwrap();
        c.close(stale).unwrap();
        let live = c.open(1, 4).unwrap();
        let b = c.insert(&live, 0).unwrap();
        let held = c.lock_block(&b).unwrap();

        thread::scope(|s| {
            let writer = s.spawn(|| IoSplitter::new(&c).write(&stale, 0, b"new!"));
            thread::sleep(Duration::from_millis(50));
            assert!(!writer.is_finished());
            drop(held);
            assert_eq!(writer.join().unwrap().unwrap(), 4);
        });

        assert!(!c.is_resident(&live, 0).unwrap());
        let mut buf = [0u8; 4];
        assert_eq!(IoSplitter::new(&c).read(&live, 0, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"new!");
    }

    #[test]
    fn uncached_read_sees_dirty_data_of_other_refs() {
        let c = cache(4);
        let stale = c.open(1, 5).unwrap();
        c.close(stale).unwrap();
        let live = c.open(1, 5).unwrap();
        IoSplitter::new(&c).write(&live, 0, b"dirty").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(IoSplitter::new(&c).read(&stale, 0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"dirty");
        assert_eq!(c.stats().fallbacks, 1);
    }

    #[test]
    fn store_errors_surface() {
        let c = cache(2);
        let io = IoSplitter::new(&c);
        let f = c.open(1, 1).unwrap();
        io.write(&f, 0, b"a").unwrap();
        io.write(&f, BS as u64, b"b").unwrap();
        c.store().fail_writes(true);
        // Inserting a third block must evict a dirty one, whose write fails.
        let err = io.write(&f, 2 * BS as u64, b"c").unwrap_err();
        assert!(matches!(err, StoreError::Remote { .. }));
    }
}

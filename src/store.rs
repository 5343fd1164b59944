//! The backing store behind the cache.
//!
//! `BackingStore` is the synchronous block I/O primitive of the remote
//! filesystem, split into its two directions. Reads past the end of an object
//! (or of an object that does not exist yet) return fewer bytes, never an
//! error; a cache populating the tail block of a growing file relies on that.

use std::fs;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::StoreError;

/// Identity of one remote object: the filesystem it lives on and its handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub fs_id: u32,
    pub handle: u64,
}

impl ObjectRef {
    pub fn new(fs_id: u32, handle: u64) -> Self {
        ObjectRef { fs_id, handle }
    }
}

pub trait BackingStore: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the bytes read.
    fn read_at(&self, obj: ObjectRef, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError>;

    /// Write `buf` at `offset`, extending the object as needed.
    fn write_at(&self, obj: ObjectRef, offset: u64, buf: &[u8]) -> Result<usize, StoreError>;
}

/// One call observed by `MemStore::write_at`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub obj: ObjectRef,
    pub offset: u64,
    pub len: usize,
}

/// In-memory store that records every write. Used as the stub store in tests
/// and for single-host setups.
#[derive(Default)]
pub struct MemStore {
    objects: RwLock<HashMap<ObjectRef, Vec<u8>, ahash::RandomState>>,
    writes: Mutex<Vec<WriteRecord>>,
    reads: AtomicU64,
    fail_writes: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of an object.
    pub fn put(&self, obj: ObjectRef, data: impl Into<Vec<u8>>) {
        self.objects.write().insert(obj, data.into());
    }

    pub fn contents(&self, obj: ObjectRef) -> Option<Vec<u8>> {
        self.objects.read().get(&obj).cloned()
    }

    /// Writes observed so far, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Make every following write fail with a remote error until reset.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

impl BackingStore for MemStore {
    fn read_at(&self, obj: ObjectRef, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.read();
        let Some(data) = objects.get(&obj) else {
            return Ok(0);
        };
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, obj: ObjectRef, offset: u64, buf: &[u8]) -> Result<usize, StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Remote { code: libc::EIO });
        }
        let start = offset as usize;
        {
            let mut objects = self.objects.write();
            let data = objects.entry(obj).or_default();
            if data.len() < start + buf.len() {
                data.resize(start + buf.len(), 0);
            }
            data[start..start + buf.len()].copy_from_slice(buf);
        }
        self.writes.lock().push(WriteRecord {
            obj,
            offset,
            len: buf.len(),
        });
        Ok(buf.len())
    }
}

/// Store keeping each object as a file `<root>/<fs_id>/<handle>`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore { root: root.into() }
    }

    fn path(&self, obj: ObjectRef) -> PathBuf {
        self.root
            .join(obj.fs_id.to_string())
            .join(obj.handle.to_string())
    }
}

impl BackingStore for FileStore {
    fn read_at(&self, obj: ObjectRef, offset: u64, buf: &mut [u8]) -> Result<usize, StoreError> {
        let file = match fs::File::open(self.path(obj)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut done = 0;
        while done < buf.len() {
            match file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(done)
    }

    fn write_at(&self, obj: ObjectRef, offset: u64, buf: &[u8]) -> Result<usize, StoreError> {
        let path = self.path(obj);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.write_all_at(buf, offset)?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_store_reads_back_writes_and_logs_them() {
        let store = MemStore::new();
        let obj = ObjectRef::new(7, 42);
        store.write_at(obj, 4, b"abcd").unwrap();
        assert_eq!(store.contents(obj).unwrap(), b"\0\0\0\0abcd");

        let mut buf = [0u8; 16];
        assert_eq!(store.read_at(obj, 2, &mut buf).unwrap(), 6);
        assert_eq!(&buf[..6], b"\0\0abcd");
        assert_eq!(
            store.writes(),
            vec![WriteRecord {
                obj,
                offset: 4,
                len: 4
            }]
        );
    }

    #[test]
    fn mem_store_missing_object_reads_empty() {
        let store = MemStore::new();
        let mut buf = [1u8; 8];
        assert_eq!(store.read_at(ObjectRef::new(1, 1), 0, &mut buf).unwrap(), 0);
        assert_eq!(store.read_count(), 1);
    }

    #[test]
    fn mem_store_injected_failure() {
        let store = MemStore::new();
        store.fail_writes(true);
        let err = store.write_at(ObjectRef::new(1, 1), 0, b"x").unwrap_err();
        assert!(matches!(err, StoreError::Remote { .. }));
        assert_eq!(store.write_count(), 0);
        store.fail_writes(false);
        assert_eq!(store.write_at(ObjectRef::new(1, 1), 0, b"x").unwrap(), 1);
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let obj = ObjectRef::new(3, 99);

        let mut buf = [0u8; 4];
        assert_eq!(store.read_at(obj, 0, &mut buf).unwrap(), 0);

        store.write_at(obj, 10, b"hello").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(store.read_at(obj, 8, &mut buf).unwrap(), 7);
        assert_eq!(&buf[..7], b"\0\0hello");
        assert!(dir.path().join("3").join("99").exists());
    }
}

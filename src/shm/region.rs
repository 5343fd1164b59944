/// Shared memory segment management using mmap.
///
/// A cache lives in two mappings, as the cache daemon lays it out: the data
/// segment (header, descriptors, file index, slabs) and a separate lock
/// segment (global lock plus one guard lock per slab). Named segments are
/// files under `/dev/shm` (or the temp dir elsewhere) so unrelated processes
/// can attach; anonymous segments serve a single process and its threads.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info};

use super::layout::{Geometry, Header};
use super::lock::{lock_region_size, GuardLock, ShmSeqLock, LOCK_SIZE};
use super::Arena;
use crate::config::CacheConfig;
use crate::error::{Result, UCacheError};

/// Where to store the mmap files.
pub fn shm_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("ucache")
    }
}

/// The data and lock mappings of one cache.
pub struct ShmRegion {
    mmap: MmapMut,
    lock_mmap: MmapMut,
    base: *mut u8,
    lock_base: *mut u8,
    geometry: Geometry,
    paths: Option<(PathBuf, PathBuf)>,
}

// ShmRegion is Send+Sync because all mutations go through the shm locks
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    fn from_maps(
        mut mmap: MmapMut,
        mut lock_mmap: MmapMut,
        geometry: Geometry,
        paths: Option<(PathBuf, PathBuf)>,
    ) -> Self {
        let base = mmap.as_mut_ptr();
        let lock_base = lock_mmap.as_mut_ptr();
        ShmRegion {
            mmap,
            lock_mmap,
            base,
            lock_base,
            geometry,
            paths,
        }
    }

    /// Create a private, process-local cache segment.
    pub fn anonymous(cfg: &CacheConfig) -> Result<Self> {
        let geometry = Geometry::for_config(cfg)?;
        let mmap = MmapOptions::new().len(geometry.region_size).map_anon()?;
        let lock_mmap = MmapOptions::new()
            .len(lock_region_size(geometry.slab_count))
            .map_anon()?;
        let mut region = Self::from_maps(mmap, lock_mmap, geometry, None);
        region.bootstrap(cfg)?;
        Ok(region)
    }

    /// Create (or truncate) a named segment in the default shm directory.
    pub fn create(name: &str, cfg: &CacheConfig) -> Result<Self> {
        Self::create_in(&shm_dir(), name, cfg)
    }

    /// Attach to an existing named segment in the default shm directory.
    pub fn open(name: &str, cfg: &CacheConfig) -> Result<Self> {
        Self::open_in(&shm_dir(), name, cfg)
    }

    /// Attach if a compatible segment exists, otherwise create it.
    pub fn create_or_open(name: &str, cfg: &CacheConfig) -> Result<Self> {
        Self::create_or_open_in(&shm_dir(), name, cfg)
    }

    pub fn create_in(dir: &Path, name: &str, cfg: &CacheConfig) -> Result<Self> {
        let geometry = Geometry::for_config(cfg)?;
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let (data_path, lock_path) = segment_paths(dir, name);

        let data_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&data_path)?;
        data_file.set_len(geometry.region_size as u64)?;

        let lock_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&lock_path)?;
        lock_file.set_len(lock_region_size(geometry.slab_count) as u64)?;

        // Safety: we just created these files and own them exclusively at this point.
        let mmap = unsafe { MmapMut::map_mut(&data_file)? };
        let lock_mmap = unsafe { MmapMut::map_mut(&lock_file)? };

        let mut region =
            Self::from_maps(mmap, lock_mmap, geometry, Some((data_path, lock_path)));
        region.bootstrap(cfg)?;
        region.flush()?;
        info!(name, size = geometry.region_size, "created ucache segment");
        Ok(region)
    }

    pub fn open_in(dir: &Path, name: &str, cfg: &CacheConfig) -> Result<Self> {
        let geometry = Geometry::for_config(cfg)?;
        let (data_path, lock_path) = segment_paths(dir, name);

        let data_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)?;
        let lock_file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if data_file.metadata()?.len() != geometry.region_size as u64
            || lock_file.metadata()?.len() != lock_region_size(geometry.slab_count) as u64
        {
            return Err(UCacheError::Layout("segment size mismatch".to_owned()));
        }

        let mmap = unsafe { MmapMut::map_mut(&data_file)? };
        let lock_mmap = unsafe { MmapMut::map_mut(&lock_file)? };

        let region = Self::from_maps(mmap, lock_mmap, geometry, Some((data_path, lock_path)));
        geometry.check_header(region.header())?;
        debug!(name, "attached to ucache segment");
        Ok(region)
    }

    pub fn create_or_open_in(dir: &Path, name: &str, cfg: &CacheConfig) -> Result<Self> {
        let (data_path, lock_path) = segment_paths(dir, name);
        if data_path.exists() && lock_path.exists() {
            match Self::open_in(dir, name, cfg) {
                Ok(region) => return Ok(region),
                Err(err) => {
                    // Stale or differently configured, recreate it
                    debug!(name, %err, "recreating incompatible ucache segment");
                }
            }
        }
        Self::create_in(dir, name, cfg)
    }

    /// Format both mappings: locks released, every slab free, tables carved
    /// out of the pinned slab.
    fn bootstrap(&mut self, cfg: &CacheConfig) -> Result<()> {
        let base = self.lock_base;
        unsafe {
            std::ptr::write_bytes(self.base, 0, self.geometry.region_size);
            std::ptr::write_bytes(base, 0, lock_region_size(self.geometry.slab_count));
            ShmSeqLock::init(base);
            for slot in 0..self.geometry.slab_count as usize {
                GuardLock::init(base.add(LOCK_SIZE * (1 + slot)));
            }
        }
        let mut arena = unsafe { Arena::new(self.base, self.geometry) };
        arena.format(cfg)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn header(&self) -> &Header {
        unsafe { &*(self.base as *const Header) }
    }

    pub(crate) fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    pub(crate) fn lock_base_ptr(&self) -> *mut u8 {
        self.lock_base
    }

    /// Push dirty pages of a named segment to its backing file.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()?;
        self.lock_mmap.flush()
    }

    /// Global index lock.
    pub fn lock(&self) -> ShmSeqLock {
        unsafe { ShmSeqLock::from_existing(self.lock_base_ptr()) }
    }

    /// Guard lock of one slab; `slot` must be below `slab_count`.
    pub fn guard_lock(&self, slot: u32) -> Option<GuardLock> {
        if slot >= self.geometry.slab_count {
            return None;
        }
        let ptr = unsafe { self.lock_base_ptr().add(LOCK_SIZE * (1 + slot as usize)) };
        Some(unsafe { GuardLock::from_existing(ptr) })
    }

    pub fn is_named(&self) -> bool {
        self.paths.is_some()
    }

    /// Remove the backing files. Attached mappings stay valid until dropped.
    pub fn unlink(&self) -> io::Result<()> {
        if let Some((data, lock)) = &self.paths {
            let _ = fs::remove_file(data);
            let _ = fs::remove_file(lock);
        }
        Ok(())
    }
}

fn segment_paths(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{name}.data")),
        dir.join(format!("{name}.lock")),
    )
}

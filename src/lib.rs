//! User-level block cache shared by every client process of a distributed
//! filesystem.
//!
//! Blocks of remote files are cached in one shared-memory segment: a slab
//! allocator, a file index, a per-file block table with LRU and dirty lists,
//! and a write-back path, all addressed by index so every attached process
//! can use the same structures. `IoSplitter` serves byte-range reads and
//! writes through it.

pub mod config;
pub mod error;

#[cfg(not(target_os = "windows"))]
mod block_table;
#[cfg(not(target_os = "windows"))]
pub mod cache;
#[cfg(not(target_os = "windows"))]
pub mod evict;
#[cfg(not(target_os = "windows"))]
mod file_index;
#[cfg(not(target_os = "windows"))]
mod flush;
#[cfg(not(target_os = "windows"))]
pub mod iocommon;
#[cfg(not(target_os = "windows"))]
pub mod shm;
#[cfg(not(target_os = "windows"))]
pub mod slab;
#[cfg(not(target_os = "windows"))]
pub mod store;

pub use config::CacheConfig;
pub use error::{Result, StoreError, UCacheError};

#[cfg(not(target_os = "windows"))]
pub use cache::{BlockGuard, BlockRef, BlockWriteGuard, CacheStats, FileRef, StaleLock, UCache};
#[cfg(not(target_os = "windows"))]
pub use evict::LockMode;
#[cfg(not(target_os = "windows"))]
pub use iocommon::IoSplitter;
#[cfg(not(target_os = "windows"))]
pub use shm::region::ShmRegion;
#[cfg(not(target_os = "windows"))]
pub use store::{BackingStore, FileStore, MemStore, ObjectRef, WriteRecord};

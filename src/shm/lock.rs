/// Locks living in the lock segment, shared by every attached process.
///
/// Layout (one 64-byte cache line per lock):
///   [global seqlock][guard 0][guard 1]...[guard slab_count-1]
///
/// The global lock is a seqlock: writers take a TTAS spinlock and bump the
/// sequence odd→even, readers that only probe the index validate the sequence
/// instead of locking. Guard locks are plain TTAS spinlocks, one per slab,
/// taken around the data copy or write-back of that slab. Ordering rule:
/// the global lock is always acquired before a guard lock, never after.
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::current_time_nanos;

/// Bytes reserved for each lock: one cache line.
pub const LOCK_SIZE: usize = 64;

/// Total bytes of the lock segment for `slab_count` guard locks.
pub fn lock_region_size(slab_count: u32) -> usize {
    LOCK_SIZE * (1 + slab_count as usize)
}

/// A seqlock stored in shared memory for cross-process use.
pub struct ShmSeqLock {
    seq_ptr: *const AtomicU64,
    write_lock_ptr: *const AtomicU32,
}

unsafe impl Send for ShmSeqLock {}
unsafe impl Sync for ShmSeqLock {}

impl ShmSeqLock {
    /// Initialize a new seqlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to at least `LOCK_SIZE` bytes of shared memory.
    pub unsafe fn init(ptr: *mut u8) -> Self {
        std::ptr::write_bytes(ptr, 0, LOCK_SIZE);
        let lock = Self::from_existing(ptr);
        (*lock.seq_ptr).store(0, Ordering::Relaxed);
        (*lock.write_lock_ptr).store(0, Ordering::Relaxed);
        lock
    }

    /// Attach to an already-initialized seqlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to a previously initialized seqlock in shared memory.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        ShmSeqLock {
            seq_ptr: ptr as *const AtomicU64,
            write_lock_ptr: ptr.add(8) as *const AtomicU32,
        }
    }

    /// Begin an optimistic read. Spins until no writer is active.
    #[inline]
    pub fn read_begin(&self) -> u64 {
        loop {
            let seq = unsafe { &*self.seq_ptr }.load(Ordering::Acquire);
            if seq & 1 == 0 {
                return seq;
            }
            std::hint::spin_loop();
        }
    }

    /// Returns true if no writer modified data since `read_begin()` returned `seq`.
    #[inline]
    pub fn read_validate(&self, seq: u64) -> bool {
        // Data loads must complete before the sequence is re-checked.
        std::sync::atomic::fence(Ordering::Acquire);
        let current = unsafe { &*self.seq_ptr }.load(Ordering::Relaxed);
        current == seq
    }

    /// Acquire the write lock. Blocks (spins) until acquired.
    #[inline]
    pub fn write_lock(&self) {
        let lock = unsafe { &*self.write_lock_ptr };
        let mut spins = 0u32;
        loop {
            while lock.load(Ordering::Relaxed) != 0 {
                backoff(&mut spins);
            }
            if lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.bump_seq();
    }

    /// Release the write lock.
    #[inline]
    pub fn write_unlock(&self) {
        // Even again: readers may trust what they load
        self.bump_seq();
        unsafe { &*self.write_lock_ptr }.store(0, Ordering::Release);
    }

    #[inline]
    fn bump_seq(&self) {
        let seq = unsafe { &*self.seq_ptr };
        let prev = seq.load(Ordering::Relaxed);
        seq.store(prev + 1, Ordering::Release);
    }
}

/// Spin briefly, then yield: guard locks can be held across backing-store I/O.
#[inline]
fn backoff(spins: &mut u32) {
    if *spins < 64 {
        *spins += 1;
        std::hint::spin_loop();
    } else {
        std::thread::yield_now();
    }
}

/// Per-slab guard lock.
///
/// Layout: [locked: u32][owner_pid: u32][acquired_at_nanos: u64][pad to 64]
pub struct GuardLock {
    locked_ptr: *const AtomicU32,
    owner_ptr: *const AtomicU32,
    since_ptr: *const AtomicU64,
}

unsafe impl Send for GuardLock {}
unsafe impl Sync for GuardLock {}

impl GuardLock {
    /// # Safety
    /// `ptr` must point to `LOCK_SIZE` bytes inside the lock segment that
    /// outlive the returned handle.
    pub unsafe fn from_existing(ptr: *mut u8) -> Self {
        GuardLock {
            locked_ptr: ptr as *const AtomicU32,
            owner_ptr: ptr.add(4) as *const AtomicU32,
            since_ptr: ptr.add(8) as *const AtomicU64,
        }
    }

    /// # Safety
    /// Same as `from_existing`; the memory is reset to "unlocked".
    pub unsafe fn init(ptr: *mut u8) -> Self {
        std::ptr::write_bytes(ptr, 0, LOCK_SIZE);
        Self::from_existing(ptr)
    }

    fn locked(&self) -> &AtomicU32 {
        unsafe { &*self.locked_ptr }
    }

    pub fn try_lock(&self) -> bool {
        if self
            .locked()
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.stamp_owner();
            true
        } else {
            false
        }
    }

    pub fn lock(&self) {
        let mut spins = 0u32;
        loop {
            while self.locked().load(Ordering::Relaxed) != 0 {
                backoff(&mut spins);
            }
            if self
                .locked()
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        self.stamp_owner();
    }

    pub fn unlock(&self) {
        unsafe { &*self.owner_ptr }.store(0, Ordering::Relaxed);
        unsafe { &*self.since_ptr }.store(0, Ordering::Relaxed);
        self.locked().store(0, Ordering::Release);
    }

    pub fn is_locked(&self) -> bool {
        self.locked().load(Ordering::Relaxed) != 0
    }

    pub fn owner_pid(&self) -> u32 {
        unsafe { &*self.owner_ptr }.load(Ordering::Relaxed)
    }

    /// How long the current holder has held the lock, if it is held.
    pub fn held_for(&self) -> Option<Duration> {
        if !self.is_locked() {
            return None;
        }
        let since = unsafe { &*self.since_ptr }.load(Ordering::Relaxed);
        if since == 0 {
            return None;
        }
        Some(Duration::from_nanos(
            current_time_nanos().saturating_sub(since),
        ))
    }

    fn stamp_owner(&self) {
        let pid = std::process::id();
        unsafe { &*self.owner_ptr }.store(pid, Ordering::Relaxed);
        unsafe { &*self.since_ptr }.store(current_time_nanos(), Ordering::Relaxed);
    }
}

/// True if a process with this pid still exists.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

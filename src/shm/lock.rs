/// Cross-process readers/writer locks using POSIX pthread_rwlock with
/// PTHREAD_PROCESS_SHARED attribute.
///
/// The locks live in a dedicated mmap'd file next to the data region so
/// they are reachable from every attached process. The file is an array of
/// fixed-size slots: `alloc`, `stats`, `oldest`, then one bucket lock per
/// index cell. On glibc the locks are created writer-preferring so a
/// steady stream of readers cannot starve `flush`.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{CacheError, CacheResult};

/// Size reserved for each lock slot.
/// pthread_rwlock_t is 56 bytes on x86_64 Linux, 200 bytes on macOS arm64.
/// We over-allocate to be safe.
pub const LOCK_SLOT_SIZE: usize = 256;

/// Slots that precede the per-bucket locks.
const SLOT_ALLOC: usize = 0;
const SLOT_STATS: usize = 1;
const SLOT_OLDEST: usize = 2;
const FIXED_SLOTS: usize = 3;

fn lock_err(rc: i32) -> CacheError {
    CacheError::Lock(io::Error::from_raw_os_error(rc))
}

/// A handle to one cross-process rwlock stored in the lock file.
#[derive(Clone, Copy)]
pub struct ShmRwLock {
    lock_ptr: *mut libc::pthread_rwlock_t,
}

unsafe impl Send for ShmRwLock {}
unsafe impl Sync for ShmRwLock {}

impl ShmRwLock {
    /// Initialize a new rwlock at the given memory location.
    ///
    /// # Safety
    /// `ptr` must point to at least `size_of::<pthread_rwlock_t>()` bytes of
    /// shared memory that is zeroed or uninitialized.
    unsafe fn init(ptr: *mut u8) -> CacheResult<()> {
        let lock_ptr = ptr as *mut libc::pthread_rwlock_t;

        let mut attr: libc::pthread_rwlockattr_t = std::mem::zeroed();
        let rc = libc::pthread_rwlockattr_init(&mut attr);
        if rc != 0 {
            return Err(lock_err(rc));
        }

        let rc = libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_rwlockattr_destroy(&mut attr);
            return Err(lock_err(rc));
        }

        #[cfg(all(target_os = "linux", target_env = "gnu"))]
        {
            // Not exposed by the `libc` crate for glibc targets; the value is a
            // stable glibc ABI constant (see bits/pthreadtypes.h).
            const PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP: libc::c_int = 2;

            let rc = libc::pthread_rwlockattr_setkind_np(
                &mut attr,
                PTHREAD_RWLOCK_PREFER_WRITER_NONRECURSIVE_NP,
            );
            if rc != 0 {
                libc::pthread_rwlockattr_destroy(&mut attr);
                return Err(lock_err(rc));
            }
        }

        let rc = libc::pthread_rwlock_init(lock_ptr, &attr);
        libc::pthread_rwlockattr_destroy(&mut attr);
        if rc != 0 {
            return Err(lock_err(rc));
        }

        Ok(())
    }

    /// Acquire in shared mode. Blocks until available.
    pub fn read(self) -> CacheResult<ShmReadGuard> {
        let rc = unsafe { libc::pthread_rwlock_rdlock(self.lock_ptr) };
        if rc != 0 {
            return Err(lock_err(rc));
        }
        Ok(ShmReadGuard { lock: self })
    }

    /// Acquire in exclusive mode. Blocks until available.
    pub fn write(self) -> CacheResult<ShmWriteGuard> {
        let rc = unsafe { libc::pthread_rwlock_wrlock(self.lock_ptr) };
        if rc != 0 {
            return Err(lock_err(rc));
        }
        Ok(ShmWriteGuard { lock: self })
    }

    /// Acquire in exclusive mode without blocking. A held lock surfaces as
    /// `CacheError::Lock` (EBUSY) so the caller aborts instead of waiting
    /// out of hierarchy order.
    pub fn try_write(self) -> CacheResult<ShmWriteGuard> {
        let rc = unsafe { libc::pthread_rwlock_trywrlock(self.lock_ptr) };
        if rc != 0 {
            return Err(lock_err(rc));
        }
        Ok(ShmWriteGuard { lock: self })
    }

    fn unlock(self) {
        let rc = unsafe { libc::pthread_rwlock_unlock(self.lock_ptr) };
        debug_assert_eq!(rc, 0, "pthread_rwlock_unlock failed: {rc}");
    }
}

/// Shared-mode guard; releases on drop.
pub struct ShmReadGuard {
    lock: ShmRwLock,
}

impl Drop for ShmReadGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive-mode guard; releases on drop.
pub struct ShmWriteGuard {
    lock: ShmRwLock,
}

impl Drop for ShmWriteGuard {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// The full set of named locks for one cache region.
pub struct LockSet {
    mmap: MmapMut,
    path: PathBuf,
    buckets: usize,
}

unsafe impl Send for LockSet {}
unsafe impl Sync for LockSet {}

impl LockSet {
    /// Create the lock file and initialize every lock in it.
    pub fn create(path: &Path, buckets: usize) -> CacheResult<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(((FIXED_SLOTS + buckets) * LOCK_SLOT_SIZE) as u64)?;

        // Safety: we just created this file and own it exclusively.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let set = LockSet {
            mmap,
            path: path.to_path_buf(),
            buckets,
        };

        for slot in 0..FIXED_SLOTS + buckets {
            // Safety: each slot is a distinct, zeroed LOCK_SLOT_SIZE span.
            unsafe { ShmRwLock::init(set.slot_ptr(slot))? };
        }

        Ok(set)
    }

    /// Attach to an already-initialized lock file.
    pub fn open(path: &Path, buckets: usize) -> CacheResult<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let expected = ((FIXED_SLOTS + buckets) * LOCK_SLOT_SIZE) as u64;
        if file.metadata()?.len() != expected {
            return Err(CacheError::Corrupted("lock file has unexpected size"));
        }

        // Safety: the creator initialized every slot before publishing the file.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(LockSet {
            mmap,
            path: path.to_path_buf(),
            buckets,
        })
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < FIXED_SLOTS + self.buckets);
        // Safety: slot index bounded by construction.
        unsafe { (self.mmap.as_ptr() as *mut u8).add(slot * LOCK_SLOT_SIZE) }
    }

    fn lock_at(&self, slot: usize) -> ShmRwLock {
        ShmRwLock {
            lock_ptr: self.slot_ptr(slot) as *mut libc::pthread_rwlock_t,
        }
    }

    /// Structural lock: read = layout stable, write = may reformat.
    pub fn alloc(&self) -> ShmRwLock {
        self.lock_at(SLOT_ALLOC)
    }

    /// Guards the in-region hit/miss counters.
    pub fn stats(&self) -> ShmRwLock {
        self.lock_at(SLOT_STATS)
    }

    /// Guards the oldest-chunk cursor and all chunk-boundary changes.
    pub fn oldest(&self) -> ShmRwLock {
        self.lock_at(SLOT_OLDEST)
    }

    /// Guards index cell `bucket` and the chunk its offset points to.
    pub fn bucket(&self, bucket: usize) -> ShmRwLock {
        debug_assert!(bucket < self.buckets);
        self.lock_at(FIXED_SLOTS + bucket)
    }

    /// Remove the backing file. Existing mappings stay valid until drop.
    pub fn unlink(&self) -> CacheResult<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_dir;

    #[test]
    fn guards_release_on_drop() {
        let dir = test_dir("lockset_guards");
        let path = dir.join("l.lock");
        let set = LockSet::create(&path, 4).unwrap();

        {
            let _w = set.alloc().write().unwrap();
            // Exclusive: a second writer must not be grantable now.
            assert!(set.alloc().try_write().is_err());
        }
        // Guard dropped: the lock is free again.
        let _w = set.alloc().try_write().unwrap();

        set.unlink().unwrap();
    }

    #[test]
    fn readers_share_writers_exclude() {
        let dir = test_dir("lockset_shared");
        let path = dir.join("l.lock");
        let set = LockSet::create(&path, 4).unwrap();

        let r1 = set.bucket(1).read().unwrap();
        let r2 = set.bucket(1).read().unwrap();
        assert!(set.bucket(1).try_write().is_err());
        drop(r1);
        drop(r2);
        let _w = set.bucket(1).try_write().unwrap();

        // Distinct buckets never contend.
        let _a = set.bucket(2).write().unwrap();
        let _b = set.bucket(3).write().unwrap();

        set.unlink().unwrap();
    }

    #[test]
    fn open_validates_geometry() {
        let dir = test_dir("lockset_geom");
        let path = dir.join("l.lock");
        let set = LockSet::create(&path, 8).unwrap();
        drop(set);

        assert!(LockSet::open(&path, 8).is_ok());
        assert!(matches!(
            LockSet::open(&path, 9),
            Err(CacheError::Corrupted(_))
        ));

        fs::remove_file(&path).unwrap();
    }
}

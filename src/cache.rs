//! Public cache facade.
//!
//! `SharedCache` wraps the shared-memory engine with key sanitisation,
//! process-local hit/miss buffering, and the destroyed-region guard. It is
//! the only type most callers touch.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::shm::layout::{FLAG_SERIALIZED, MAX_KEY_LENGTH};
use crate::shm::ShmCache;
use crate::stats::{CacheStats, LocalCounters};

/// A cached payload together with the caller's serialised flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    /// The stored bytes, verbatim.
    pub data: Vec<u8>,
    /// Whether the caller marked the payload as serialised on `set`.
    pub serialized: bool,
}

/// Handle to a cross-process shared-memory cache.
///
/// Cheap to construct per process; all coordination happens through the
/// region's lock set, so any number of handles (in any number of
/// processes) may operate on the same named region concurrently.
///
/// Hits and misses are counted locally and folded into the in-region
/// counters when the handle drops or a [`stats`](SharedCache::stats)
/// snapshot is taken.
pub struct SharedCache {
    shm: ShmCache,
    counters: Mutex<LocalCounters>,
    destroyed: AtomicBool,
}

impl SharedCache {
    /// Create or attach to the region named by `config`.
    pub fn open(config: &CacheConfig) -> CacheResult<Self> {
        let size = config.resolved_size()?;
        let shm = ShmCache::open(&config.directory(), config.name(), size)?;
        Ok(SharedCache {
            shm,
            counters: Mutex::new(LocalCounters::default()),
            destroyed: AtomicBool::new(false),
        })
    }

    fn ensure_alive(&self) -> CacheResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(CacheError::UseAfterDestroy);
        }
        Ok(())
    }

    /// Truncate to the maximum key length and reject keys the null-padded
    /// key field cannot represent.
    fn sanitize<'k>(&self, key: &'k [u8]) -> CacheResult<&'k [u8]> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey { reason: "empty" });
        }
        let key = &key[..key.len().min(MAX_KEY_LENGTH)];
        if key.contains(&0) {
            return Err(CacheError::InvalidKey {
                reason: "contains NUL byte",
            });
        }
        Ok(key)
    }

    /// Look up a key. `Ok(None)` is a miss; both outcomes feed the
    /// buffered counters.
    pub fn get(&self, key: &[u8]) -> CacheResult<Option<Value>> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;

        let result = self.shm.get(key)?;
        let mut counters = self.counters.lock();
        match result {
            Some((data, flags)) => {
                counters.hits += 1;
                Ok(Some(Value {
                    data,
                    serialized: flags & FLAG_SERIALIZED != 0,
                }))
            }
            None => {
                counters.misses += 1;
                Ok(None)
            }
        }
    }

    /// Store unconditionally. `Ok(false)` means the value was too large;
    /// any prior entry under the key has been removed.
    pub fn set(&self, key: &[u8], value: &[u8], serialized: bool) -> CacheResult<bool> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;
        match self.shm.set(key, value, serialized) {
            Ok(()) => Ok(true),
            Err(CacheError::ValueTooLarge { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Store only if absent. `Ok(false)` means the key already existed or
    /// the value was too large — the same rejection `set` reports.
    pub fn add(&self, key: &[u8], value: &[u8], serialized: bool) -> CacheResult<bool> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;
        match self.shm.add(key, value, serialized) {
            Ok(stored) => Ok(stored),
            Err(CacheError::ValueTooLarge { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Store only if present. `Ok(false)` means the key was missing or the
    /// value was too large; the oversize case removes the prior entry,
    /// exactly as `set` does.
    pub fn replace(&self, key: &[u8], value: &[u8], serialized: bool) -> CacheResult<bool> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;
        match self.shm.replace(key, value, serialized) {
            Ok(stored) => Ok(stored),
            Err(CacheError::ValueTooLarge { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Remove a key. Absence counts as success (`Ok(false)`); only lock or
    /// region failures produce an error.
    pub fn delete(&self, key: &[u8]) -> CacheResult<bool> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;
        self.shm.delete(key)
    }

    /// Adjust a numeric value. Absent keys start from `initial`; the
    /// result is clamped at zero. Returns the new value.
    pub fn increment(&self, key: &[u8], offset: i64, initial: u64) -> CacheResult<u64> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;
        self.shm.increment(key, offset, initial)
    }

    /// `increment` with the sign flipped.
    pub fn decrement(&self, key: &[u8], offset: i64, initial: u64) -> CacheResult<u64> {
        self.increment(key, offset.saturating_neg(), initial)
    }

    /// Whether the key is present. Does not touch the hit/miss counters.
    pub fn exists(&self, key: &[u8]) -> CacheResult<bool> {
        self.ensure_alive()?;
        let key = self.sanitize(key)?;
        self.shm.exists(key)
    }

    /// Drop every entry. Counters survive.
    pub fn flush(&self) -> CacheResult<()> {
        self.ensure_alive()?;
        self.shm.flush()
    }

    /// Snapshot the region. The handle's buffered counters are folded in
    /// first so the snapshot reflects this process's traffic.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        self.ensure_alive()?;
        self.flush_counters()?;
        self.shm.stats()
    }

    /// Zero the in-region hit/miss counters (buffered ones included).
    pub fn clear_stats(&self) -> CacheResult<()> {
        self.ensure_alive()?;
        self.counters.lock().take();
        self.shm.clear_counters()
    }

    /// Validate the region's structural invariants. Intended for tests
    /// and diagnostics; failure means the region is corrupt.
    pub fn check_integrity(&self) -> CacheResult<()> {
        self.ensure_alive()?;
        self.shm.check_integrity()
    }

    /// Destroy the named region. Other attached processes keep their
    /// mappings until they drop, but the name is gone and this handle
    /// refuses further operations.
    pub fn destroy(&self) -> CacheResult<()> {
        self.ensure_alive()?;
        self.flush_counters()?;
        self.shm.destroy()?;
        self.destroyed.store(true, Ordering::Release);
        Ok(())
    }

    fn flush_counters(&self) -> CacheResult<()> {
        let (hits, misses) = {
            let mut counters = self.counters.lock();
            if counters.is_empty() {
                return Ok(());
            }
            counters.take()
        };
        self.shm.add_counters(hits, misses)
    }
}

impl Drop for SharedCache {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            let _ = self.flush_counters();
        }
    }
}

/// Shared-memory cache engine.
///
/// Provides `ShmCache` — the in-region data engine over one mmap'd file
/// holding `[header][hash index][chunk stream]`, plus a sibling file of
/// process-shared rwlocks. Entries live in variable-size chunks; space is
/// reclaimed by a FIFO ring cursor (the *oldest-chunk* cursor) that
/// swallows whole chunks in allocation order.
///
/// Lock discipline (acquire top-down, release in reverse):
///   1. `alloc`  — read for per-item ops, write for flush/destroy/recreate
///   2. `bucket` — the key's natural bucket; read for lookups, write for
///      mutation
///   3. `oldest` — write wherever chunk boundaries move (allocation walk,
///      delete-coalesce); read for structural walks
///   4. `stats`  — the hit/miss counters
///
/// The one out-of-order acquisition — a swallowed victim's bucket lock —
/// is non-blocking, so a cycle with a writer entering the walk degrades
/// into a retryable lock error instead of a deadlock.
pub mod chunks;
pub mod index;
pub mod layout;
pub mod lock;
pub mod region;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace, warn};

use crate::error::{CacheError, CacheResult};
use crate::numeric;
use crate::stats::CacheStats;
use layout::{
    align_alloc, cell_offset, CHUNK_META_SIZE, DEFAULT_CACHE_SIZE, FLAG_SERIALIZED, KEYS_SLOTS,
    LONG_SIZE, MAX_CHUNK_SIZE, MAX_ITEMS, MIN_VALUE_ALLOC_SIZE, VERSION,
};
use lock::LockSet;
use region::ShmRegion;

/// Where the region files live when the caller does not override it.
pub(crate) fn default_dir() -> PathBuf {
    if cfg!(target_os = "linux") {
        PathBuf::from("/dev/shm")
    } else {
        std::env::temp_dir().join("ringcache")
    }
}

/// Which of the set-family semantics a store call carries.
#[derive(Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Set,
    Add,
    Replace,
}

/// The engine handle. One per attached process (or more — handles to the
/// same region coordinate purely through the lock set).
///
/// Offsets are never cached across operations: another process may split
/// or merge chunks between calls, so every operation starts from the
/// index. Only the static geometry (value area bounds) is kept here.
pub struct ShmCache {
    region: ShmRegion,
    locks: LockSet,
    value_start: usize,
    value_end: usize,
}

unsafe impl Send for ShmCache {}
unsafe impl Sync for ShmCache {}

impl ShmCache {
    /// Create or attach to the named region.
    ///
    /// `desired_size` has already been validated and resolved by the
    /// config layer (0 was replaced with the default). No region: create
    /// at `max(desired, DEFAULT_CACHE_SIZE)`. Existing but smaller than
    /// desired, or with mismatched magic/version/geometry: recreate
    /// (flush-equivalent — the old contents are dropped). Otherwise
    /// attach.
    pub fn open(dir: &Path, name: &str, desired_size: usize) -> CacheResult<Self> {
        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{name}.cache"));
        let lock_path = dir.join(format!("{name}.lock"));

        if data_path.exists() && lock_path.exists() {
            match Self::attach(&data_path, &lock_path, desired_size) {
                Ok(Some(cache)) => return Ok(cache),
                Ok(None) => {
                    debug!(name, "existing region is stale or undersized; recreating");
                }
                Err(err) => {
                    debug!(name, error = %err, "existing region unreadable; recreating");
                }
            }
        }

        Self::create(&data_path, &lock_path, desired_size.max(DEFAULT_CACHE_SIZE))
    }

    fn attach(data_path: &Path, lock_path: &Path, desired: usize) -> CacheResult<Option<Self>> {
        let region = ShmRegion::open(data_path)?;

        let header = region.header();
        if header.version != VERSION
            || header.keys_slots as usize != KEYS_SLOTS
            || header.total_size as usize != region.len()
        {
            return Ok(None);
        }
        if region.len() < desired {
            return Ok(None);
        }

        let locks = LockSet::open(lock_path, KEYS_SLOTS)?;
        debug!(
            path = %data_path.display(),
            size = region.len(),
            "attached to existing cache region"
        );
        Ok(Some(Self::from_parts(region, locks)))
    }

    fn create(data_path: &Path, lock_path: &Path, total_size: usize) -> CacheResult<Self> {
        let region = ShmRegion::create(data_path, total_size)?;
        let locks = LockSet::create(lock_path, KEYS_SLOTS)?;
        let cache = Self::from_parts(region, locks);

        // The file starts zeroed; lay down the single free chunk that
        // spans the whole value area. The header cursor already points at
        // the area start.
        chunks::init_free_area(&cache.region, cache.value_start, cache.value_end)?;

        info!(path = %data_path.display(), size = total_size, "created cache region");
        Ok(cache)
    }

    fn from_parts(region: ShmRegion, locks: LockSet) -> Self {
        let value_start = layout::values_offset();
        let value_end = region.len();
        ShmCache {
            region,
            locks,
            value_start,
            value_end,
        }
    }

    /// Test constructor pinning the value area to an exact size so
    /// eviction and wraparound can be exercised with a handful of chunks.
    #[cfg(test)]
    pub(crate) fn create_sized(dir: &Path, name: &str, value_area: usize) -> CacheResult<Self> {
        fs::create_dir_all(dir)?;
        let data_path = dir.join(format!("{name}.cache"));
        let lock_path = dir.join(format!("{name}.lock"));
        Self::create(&data_path, &lock_path, layout::values_offset() + value_area)
    }

    // --- Lookups ---

    /// Fetch a value. Returns the payload and its flags byte.
    pub fn get(&self, key: &[u8]) -> CacheResult<Option<(Vec<u8>, u8)>> {
        let _alloc = self.locks.alloc().read()?;
        let _bucket = self.locks.bucket(index::natural_bucket(key)).read()?;

        match index::find(&self.region, key)? {
            Some(probe) => {
                let header = chunks::read_header(&self.region, probe.chunk)?;
                let data = chunks::read_payload(&self.region, probe.chunk, header.used)?;
                Ok(Some((data, header.flags)))
            }
            None => Ok(None),
        }
    }

    pub fn exists(&self, key: &[u8]) -> CacheResult<bool> {
        let _alloc = self.locks.alloc().read()?;
        let _bucket = self.locks.bucket(index::natural_bucket(key)).read()?;
        Ok(index::find(&self.region, key)?.is_some())
    }

    // --- Mutations ---

    /// Store unconditionally.
    pub fn set(&self, key: &[u8], value: &[u8], serialized: bool) -> CacheResult<()> {
        self.store(StoreMode::Set, key, value, serialized).map(|_| ())
    }

    /// Store only if the key is absent. `Ok(false)` means it existed.
    pub fn add(&self, key: &[u8], value: &[u8], serialized: bool) -> CacheResult<bool> {
        self.store(StoreMode::Add, key, value, serialized)
    }

    /// Store only if the key is present. `Ok(false)` means it was missing.
    pub fn replace(&self, key: &[u8], value: &[u8], serialized: bool) -> CacheResult<bool> {
        self.store(StoreMode::Replace, key, value, serialized)
    }

    fn store(
        &self,
        mode: StoreMode,
        key: &[u8],
        value: &[u8],
        serialized: bool,
    ) -> CacheResult<bool> {
        let _alloc = self.locks.alloc().read()?;
        let bucket = index::natural_bucket(key);
        let _bucket = self.locks.bucket(bucket).write()?;

        let existing = index::find(&self.region, key)?;
        match mode {
            StoreMode::Add if existing.is_some() => return Ok(false),
            StoreMode::Replace if existing.is_none() => return Ok(false),
            _ => {}
        }

        if value.len() > MAX_CHUNK_SIZE {
            // A failed SET drops the stale entry rather than leaving the
            // old value behind a key the caller believes updated.
            warn!(
                value_len = value.len(),
                max = MAX_CHUNK_SIZE,
                "value exceeds maximum chunk size; removing prior entry"
            );
            if let Some(probe) = existing {
                self.remove_entry(key, probe.chunk)?;
            }
            return Err(CacheError::ValueTooLarge { size: value.len() });
        }

        let flags = if serialized { FLAG_SERIALIZED } else { 0 };
        self.store_locked(bucket, key, value, flags, existing)?;
        Ok(true)
    }

    /// The write path proper. Caller holds `alloc` read and the key's
    /// bucket write lock; `existing` is the probe result obtained under
    /// those locks.
    fn store_locked(
        &self,
        bucket: usize,
        key: &[u8],
        value: &[u8],
        flags: u8,
        existing: Option<index::Probe>,
    ) -> CacheResult<()> {
        if let Some(probe) = existing {
            let header = chunks::read_header(&self.region, probe.chunk)?;
            if header.alloc >= value.len() {
                return chunks::write_value(&self.region, probe.chunk, value, flags);
            }
            // Too small: retire it; the allocation walk reclaims the space.
            self.remove_entry(key, probe.chunk)?;
        }

        let _oldest = self.locks.oldest().write()?;
        let (target, capacity) = self.allocate_locked(bucket, value.len())?;

        let floor = align_alloc(value.len().max(MIN_VALUE_ALLOC_SIZE));
        let alloc = if capacity >= floor + CHUNK_META_SIZE + MIN_VALUE_ALLOC_SIZE {
            // Split: the surplus becomes a free chunk right after the target.
            let rest = capacity - floor - CHUNK_META_SIZE;
            chunks::write_meta(&self.region, target + CHUNK_META_SIZE + floor, b"", rest, 0, 0)?;
            floor
        } else {
            capacity
        };

        chunks::write_meta(&self.region, target, key, alloc, value.len(), flags)?;
        self.region
            .write_bytes(chunks::payload_offset(target), value)?;

        if let Err(err) = index::insert(&self.region, key, target) {
            chunks::set_free(&self.region, target)?;
            return Err(err);
        }

        // Ring head moves to the chunk after the one just written.
        let next = target + CHUNK_META_SIZE + alloc;
        let new_oldest = if next >= self.value_end {
            self.value_start
        } else {
            next
        };
        // Safety: oldest write lock held.
        unsafe {
            self.region.header_mut().oldest_offset = new_oldest as u64;
        }

        Ok(())
    }

    /// Grow a free chunk at the ring head until it holds `need` payload
    /// bytes, evicting occupants in FIFO order. Returns the target offset
    /// and its accumulated capacity.
    ///
    /// Caller holds the `oldest` write lock. Every fallible step leaves
    /// the swallowed extents as consistent free chunks (the target's
    /// recorded capacity is rewritten only by the caller), so an abort
    /// keeps the tiling intact.
    fn allocate_locked(&self, bucket: usize, need: usize) -> CacheResult<(usize, usize)> {
        if CHUNK_META_SIZE + need > self.value_end - self.value_start {
            return Err(CacheError::OutOfMemory);
        }

        let mut target = self.region.header().oldest_offset as usize;
        if target < self.value_start || target >= self.value_end {
            // Stale header from a crashed writer; restart the ring.
            target = self.value_start;
        }

        if chunks::is_occupied(&self.region, target)? {
            self.evict_locked(target, bucket)?;
        }
        let mut capacity = chunks::read_header(&self.region, target)?.alloc;
        let mut wrapped = false;

        while capacity < need {
            match chunks::next_offset(target, capacity, self.value_end) {
                Some(next) => {
                    if chunks::is_occupied(&self.region, next)? {
                        self.evict_locked(next, bucket)?;
                    }
                    capacity += CHUNK_META_SIZE + chunks::read_header(&self.region, next)?.alloc;
                }
                None => {
                    if wrapped {
                        return Err(CacheError::OutOfMemory);
                    }
                    wrapped = true;
                    // Seal the growth so far as one free chunk at the
                    // tail, then restart from the area start. This is the
                    // single point where the cursor jumps discontinuously.
                    chunks::set_free(&self.region, target)?;
                    chunks::set_alloc(&self.region, target, capacity)?;
                    target = self.value_start;
                    if chunks::is_occupied(&self.region, target)? {
                        self.evict_locked(target, bucket)?;
                    }
                    capacity = chunks::read_header(&self.region, target)?.alloc;
                }
            }
        }

        Ok((target, capacity))
    }

    /// Remove the occupant of a chunk the allocator is about to swallow.
    ///
    /// The victim's bucket lock is taken non-blockingly: blocking here
    /// could cycle with a writer that already holds that bucket and wants
    /// `oldest`. EBUSY surfaces as a lock error and the operation aborts.
    fn evict_locked(&self, chunk: usize, own_bucket: usize) -> CacheResult<()> {
        let victim_key = chunks::read_key(&self.region, chunk)?;
        let victim_bucket = index::natural_bucket(&victim_key);

        let _victim_guard = if victim_bucket != own_bucket {
            Some(self.locks.bucket(victim_bucket).try_write()?)
        } else {
            None
        };

        trace!(bucket = victim_bucket, chunk, "evicting oldest entry");
        index::remove(&self.region, &victim_key)?;
        chunks::set_free(&self.region, chunk)
    }

    /// Unlink an entry and free its chunk without coalescing. Used inside
    /// write paths that are about to reallocate anyway.
    fn remove_entry(&self, key: &[u8], chunk: usize) -> CacheResult<()> {
        index::remove(&self.region, key)?;
        chunks::set_free(&self.region, chunk)
    }

    /// Remove a key. `Ok(false)` means it was not present — which still
    /// counts as success for the caller.
    pub fn delete(&self, key: &[u8]) -> CacheResult<bool> {
        let _alloc = self.locks.alloc().read()?;
        let _bucket = self.locks.bucket(index::natural_bucket(key)).write()?;

        let probe = match index::find(&self.region, key)? {
            Some(p) => p,
            None => return Ok(false),
        };

        index::remove(&self.region, key)?;
        chunks::set_free(&self.region, probe.chunk)?;

        // Merge forward over free neighbours. Boundaries only change under
        // the oldest write lock; if the cursor ends up strictly inside the
        // merged extent, pull it back to the merged start.
        let _oldest = self.locks.oldest().write()?;
        let merged = chunks::coalesce_forward(&self.region, probe.chunk, self.value_end)?;

        let cursor = self.region.header().oldest_offset as usize;
        if cursor > probe.chunk && cursor < probe.chunk + CHUNK_META_SIZE + merged {
            // Safety: oldest write lock held.
            unsafe {
                self.region.header_mut().oldest_offset = probe.chunk as u64;
            }
        }

        Ok(true)
    }

    /// Adjust a numeric value by `delta`, creating it from `initial` when
    /// absent. The stored form is ASCII decimal, clamped at zero.
    pub fn increment(&self, key: &[u8], delta: i64, initial: u64) -> CacheResult<u64> {
        let _alloc = self.locks.alloc().read()?;
        let bucket = index::natural_bucket(key);
        let _bucket = self.locks.bucket(bucket).write()?;

        let mut buf = [0u8; 20];
        match index::find(&self.region, key)? {
            Some(probe) => {
                let header = chunks::read_header(&self.region, probe.chunk)?;
                let payload = self
                    .region
                    .read_bytes(chunks::payload_offset(probe.chunk), header.used)?;
                let current = match numeric::parse_ascii_u64(payload) {
                    Some(v) => v,
                    None => {
                        warn!("increment on non-numeric value; leaving it untouched");
                        return Err(CacheError::NotNumeric);
                    }
                };

                let next = numeric::apply_delta(current, delta);
                let len = numeric::format_u64(next, &mut buf);
                // Occupied allocations are at least MIN_VALUE_ALLOC_SIZE,
                // which always covers the 20 digits of u64::MAX.
                chunks::write_value(&self.region, probe.chunk, &buf[..len], 0)?;
                Ok(next)
            }
            None => {
                let next = numeric::apply_delta(initial, delta);
                let len = numeric::format_u64(next, &mut buf);
                self.store_locked(bucket, key, &buf[..len], 0, None)?;
                Ok(next)
            }
        }
    }

    // --- Structural operations ---

    /// Drop every entry: zero the index, reformat the value area as one
    /// free chunk, reset the cursor. Counters are preserved.
    pub fn flush(&self) -> CacheResult<()> {
        let _alloc = self.locks.alloc().write()?;
        self.region
            .zero_bytes(layout::index_offset(), KEYS_SLOTS * LONG_SIZE)?;
        chunks::init_free_area(&self.region, self.value_start, self.value_end)?;
        // Safety: alloc write lock excludes every other operation.
        unsafe {
            self.region.header_mut().oldest_offset = self.value_start as u64;
        }
        Ok(())
    }

    /// Snapshot the region. Best-effort: consistent with a point in time
    /// between lock acquisitions, not with a single global instant.
    pub fn stats(&self) -> CacheResult<CacheStats> {
        let _alloc = self.locks.alloc().read()?;
        let _oldest = self.locks.oldest().read()?;

        let mut stats = CacheStats {
            max_items: MAX_ITEMS,
            available_hash_table_slots: KEYS_SLOTS,
            hash_table_memory_size: KEYS_SLOTS * LONG_SIZE,
            available_value_mem_size: self.value_end - self.value_start,
            item_metadata_size: CHUNK_META_SIZE,
            oldest_chunk_offset: self.region.header().oldest_offset as usize,
            ..CacheStats::default()
        };

        let mut value_bytes = 0usize;
        let mut min = usize::MAX;
        let mut max = 0usize;
        for (_, header) in chunks::walk(&self.region, self.value_start, self.value_end)? {
            if header.is_occupied() {
                stats.items += 1;
                stats.used_value_mem_size += CHUNK_META_SIZE + header.alloc;
                value_bytes += header.used;
                min = min.min(header.used);
                max = max.max(header.used);
            }
        }
        if stats.items > 0 {
            stats.avg_item_value_size = value_bytes / stats.items;
            stats.min_item_value_size = min;
            stats.max_item_value_size = max;
        }

        for slot in 0..KEYS_SLOTS {
            if self.region.read_long(cell_offset(slot))? != 0 {
                stats.used_hash_table_slots += 1;
            }
        }
        stats.hash_table_load_factor =
            stats.used_hash_table_slots as f64 / KEYS_SLOTS as f64;

        let _stats = self.locks.stats().read()?;
        let header = self.region.header();
        stats.get_hit_count = header.hit_count;
        stats.get_miss_count = header.miss_count;

        Ok(stats)
    }

    /// Fold a facade's buffered counters into the region.
    pub fn add_counters(&self, hits: u64, misses: u64) -> CacheResult<()> {
        if hits == 0 && misses == 0 {
            return Ok(());
        }
        let _stats = self.locks.stats().write()?;
        // Safety: stats write lock held.
        let header = unsafe { self.region.header_mut() };
        header.hit_count = header.hit_count.wrapping_add(hits);
        header.miss_count = header.miss_count.wrapping_add(misses);
        Ok(())
    }

    /// Zero the in-region hit/miss counters.
    pub fn clear_counters(&self) -> CacheResult<()> {
        let _stats = self.locks.stats().write()?;
        // Safety: stats write lock held.
        let header = unsafe { self.region.header_mut() };
        header.hit_count = 0;
        header.miss_count = 0;
        Ok(())
    }

    /// Structural walker: verifies the chunk tiling, the size bounds of
    /// occupied chunks, the index↔chunk correspondence (every occupied
    /// chunk referenced by exactly one reachable cell), and the cursor.
    pub fn check_integrity(&self) -> CacheResult<()> {
        let _alloc = self.locks.alloc().read()?;
        let _oldest = self.locks.oldest().read()?;

        let chunk_list = chunks::walk(&self.region, self.value_start, self.value_end)?;

        let mut references: HashMap<usize, usize> = HashMap::new();
        let mut starts = std::collections::HashSet::new();
        for (off, header) in &chunk_list {
            starts.insert(*off);
            if header.is_occupied() {
                if header.alloc < MIN_VALUE_ALLOC_SIZE || header.used > MAX_CHUNK_SIZE {
                    return Err(CacheError::Corrupted("occupied chunk violates size bounds"));
                }
                references.insert(*off, 0);
            }
        }

        let cursor = self.region.header().oldest_offset as usize;
        if !starts.contains(&cursor) {
            return Err(CacheError::Corrupted("oldest cursor is not a chunk start"));
        }

        for slot in 0..KEYS_SLOTS {
            let off = self.region.read_long(cell_offset(slot))?;
            if off == 0 {
                continue;
            }
            let chunk = off as usize;
            let refs = references
                .get_mut(&chunk)
                .ok_or(CacheError::Corrupted("index cell points at a free chunk"))?;
            *refs += 1;

            // The stored key must probe back to this very cell.
            let key = chunks::read_key(&self.region, chunk)?;
            match index::find(&self.region, &key)? {
                Some(probe) if probe.slot == slot && probe.chunk == chunk => {}
                _ => {
                    return Err(CacheError::Corrupted(
                        "index cell unreachable from its key's probe",
                    ))
                }
            }
        }

        if references.values().any(|&refs| refs != 1) {
            return Err(CacheError::Corrupted(
                "occupied chunk not referenced exactly once",
            ));
        }

        Ok(())
    }

    /// Return the region to the OS. Existing mappings (including this
    /// one) stay readable until dropped, but the named region is gone.
    pub fn destroy(&self) -> CacheResult<()> {
        let _alloc = self.locks.alloc().write()?;
        self.region.unlink()?;
        self.locks.unlink()?;
        Ok(())
    }
}

/// Unique scratch directory for a test, under the system temp dir.
#[cfg(test)]
pub(crate) fn test_dir(tag: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("ringcache-{tag}-{}-{nanos}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

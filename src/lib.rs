//! Cross-process shared-memory key/value cache.
//!
//! A single fixed-size region of OS shared memory (a file in `/dev/shm`,
//! mapped with mmap) holds a header, an open-addressed hash index, and a
//! stream of variable-size value chunks. Any number of processes attach
//! to the region by name, operate on it concurrently through a set of
//! process-shared readers/writer locks, and detach; the cache outlives
//! every one of them until explicitly destroyed.
//!
//! Space is reclaimed FIFO: a ring cursor walks the chunk stream in
//! allocation order, and a write that needs room swallows (and evicts)
//! whatever the cursor points at. There is no TTL and no LRU.
//!
//! ```no_run
//! use ringcache::{CacheConfig, SharedCache};
//!
//! # fn main() -> ringcache::CacheResult<()> {
//! let cache = SharedCache::open(&CacheConfig::new("sessions"))?;
//! cache.set(b"user:42", b"logged-in", false)?;
//! if let Some(value) = cache.get(b"user:42")? {
//!     assert_eq!(value.data, b"logged-in");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Values are opaque bytes; callers that store anything richer serialise
//! it themselves and set the `serialized` flag, which `get` hands back.

mod cache;
mod config;
mod error;
mod numeric;
mod shm;
mod stats;

pub use cache::{SharedCache, Value};
pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use stats::CacheStats;

pub use shm::layout::{
    DEFAULT_CACHE_SIZE, FULL_CACHE_REMOVED_ITEMS, MAX_CHUNK_SIZE, MAX_ITEMS, MAX_KEY_LENGTH,
    MIN_REGION_SIZE,
};

//! Error types for cache operations.

use thiserror::Error;

use crate::shm::layout::{MAX_CHUNK_SIZE, MIN_REGION_SIZE};

/// Errors that can occur while opening or operating on the shared cache.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The requested region size is non-zero but below the floor.
    #[error("invalid cache size {size} bytes (must be 0 or at least {MIN_REGION_SIZE})")]
    InvalidSize {
        /// Requested size in bytes.
        size: usize,
    },

    /// The key is empty or contains a NUL byte (the stored key field is
    /// null-padded, so NUL cannot appear inside a key).
    #[error("invalid key: {reason}")]
    InvalidKey {
        /// What made the key unusable.
        reason: &'static str,
    },

    /// The value exceeds the largest storable payload.
    #[error("value too large ({size} bytes, max {MAX_CHUNK_SIZE})")]
    ValueTooLarge {
        /// Value size in bytes.
        size: usize,
    },

    /// `increment`/`decrement` on an existing value that does not parse as
    /// an ASCII decimal integer.
    #[error("existing value is not numeric")]
    NotNumeric,

    /// The value area cannot supply the requested capacity even after a
    /// full eviction sweep.
    #[error("value area exhausted")]
    OutOfMemory,

    /// Every index cell is occupied.
    #[error("hash index is full")]
    IndexFull,

    /// A region access fell outside the mapped range.
    #[error("offset {offset} (+{len}) out of region bounds")]
    OutOfBounds {
        /// Start offset of the access.
        offset: usize,
        /// Length of the access.
        len: usize,
    },

    /// The OS failed to grant or release a lock.
    #[error("lock operation failed")]
    Lock(#[source] std::io::Error),

    /// Creating, mapping, or removing the backing files failed.
    #[error("region I/O failed")]
    Io(#[from] std::io::Error),

    /// The facade's region has been destroyed; construct a new facade.
    #[error("cache has been destroyed")]
    UseAfterDestroy,

    /// A structural walk found the region violating its invariants.
    #[error("region corrupted: {0}")]
    Corrupted(&'static str),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

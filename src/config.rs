//! Construction-time configuration for a shared cache.

use std::path::PathBuf;

use crate::error::{CacheError, CacheResult};
use crate::shm::layout::{DEFAULT_CACHE_SIZE, MIN_REGION_SIZE};

/// Names and sizes the region a [`SharedCache`](crate::SharedCache)
/// attaches to.
///
/// The name identifies the region across processes: every process opening
/// the same name (in the same directory) shares the same bytes. A size of
/// 0 means "use the default"; non-zero sizes below 16 MiB are rejected at
/// construction.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    name: String,
    size: usize,
    dir: Option<PathBuf>,
}

impl CacheConfig {
    pub fn new(name: impl Into<String>) -> Self {
        CacheConfig {
            name: name.into(),
            size: 0,
            dir: None,
        }
    }

    /// Request a region of at least `bytes`. If a smaller region already
    /// exists under this name it is destroyed and recreated.
    pub fn size(mut self, bytes: usize) -> Self {
        self.size = bytes;
        self
    }

    /// Override where the region files live. Defaults to `/dev/shm` on
    /// Linux and the system temp directory elsewhere.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn directory(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(crate::shm::default_dir)
    }

    /// Validate and resolve the requested size.
    pub(crate) fn resolved_size(&self) -> CacheResult<usize> {
        match self.size {
            0 => Ok(DEFAULT_CACHE_SIZE),
            s if s < MIN_REGION_SIZE => Err(CacheError::InvalidSize { size: s }),
            s => Ok(s),
        }
    }
}

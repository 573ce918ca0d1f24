use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use ringcache::{CacheConfig, SharedCache};

/// An isolated cache region in a unique temp directory, destroyed when the
/// test finishes.
pub struct TestCache {
    pub cache: SharedCache,
    name: String,
    dir: PathBuf,
}

impl TestCache {
    pub fn new(tag: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "ringcache-it-{tag}-{}-{nanos}",
            std::process::id()
        ));
        let cache = SharedCache::open(&CacheConfig::new(tag).dir(&dir)).expect("open cache");
        TestCache {
            cache,
            name: tag.to_string(),
            dir,
        }
    }

    /// A second handle onto the same region, as another process would get.
    pub fn attach(&self) -> SharedCache {
        SharedCache::open(&CacheConfig::new(self.name.as_str()).dir(&self.dir))
            .expect("attach to cache")
    }
}

impl Drop for TestCache {
    fn drop(&mut self) {
        let _ = self.cache.destroy();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

//! Statistics snapshot and the facade's process-local counter buffer.

/// Point-in-time view of the region, produced by iterating the index and
/// the chunk stream under the structural read locks. Best-effort: counters
/// and sizes are consistent with some moment during the snapshot, not with
/// a single global instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Occupied chunks (live entries).
    pub items: usize,
    /// Compile-time ceiling on live entries.
    pub max_items: usize,
    /// Total index cells.
    pub available_hash_table_slots: usize,
    /// Index cells currently holding a chunk offset.
    pub used_hash_table_slots: usize,
    /// `used_hash_table_slots / available_hash_table_slots`.
    pub hash_table_load_factor: f64,
    /// Bytes the index occupies.
    pub hash_table_memory_size: usize,
    /// Bytes of the value area.
    pub available_value_mem_size: usize,
    /// Bytes consumed by occupied chunks (metadata + capacity).
    pub used_value_mem_size: usize,
    /// Mean payload size over live entries (0 when empty).
    pub avg_item_value_size: usize,
    /// Current FIFO write head.
    pub oldest_chunk_offset: usize,
    /// Region-wide hit counter.
    pub get_hit_count: u64,
    /// Region-wide miss counter.
    pub get_miss_count: u64,
    /// Fixed per-chunk metadata size.
    pub item_metadata_size: usize,
    /// Smallest live payload (0 when empty).
    pub min_item_value_size: usize,
    /// Largest live payload (0 when empty).
    pub max_item_value_size: usize,
}

/// Hits and misses observed by one facade and not yet pushed to the
/// in-region counters. Flushed under the `stats` write lock on drop and
/// before every snapshot.
#[derive(Debug, Default)]
pub(crate) struct LocalCounters {
    pub hits: u64,
    pub misses: u64,
}

impl LocalCounters {
    pub fn take(&mut self) -> (u64, u64) {
        let out = (self.hits, self.misses);
        self.hits = 0;
        self.misses = 0;
        out
    }

    pub fn is_empty(&self) -> bool {
        self.hits == 0 && self.misses == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drains_the_buffer() {
        let mut counters = LocalCounters::default();
        counters.hits = 3;
        counters.misses = 1;
        assert!(!counters.is_empty());
        assert_eq!(counters.take(), (3, 1));
        assert!(counters.is_empty());
        assert_eq!(counters.take(), (0, 0));
    }
}

/// Open-addressed hash index mapping keys to chunk offsets.
///
/// `KEYS_SLOTS` cells of one signed long each, linear probing, no
/// tombstones: removal backward-shifts the following probe run so an empty
/// cell always terminates a lookup. A cell holding 0 is empty — the value
/// area starts after the index, so 0 is never a valid chunk offset.
///
/// Keys hash with fixed-seed ahash so every attached process computes the
/// same natural bucket, and reduce modulo `KEYS_SLOTS`.
use std::sync::OnceLock;

use ahash::RandomState;

use super::chunks;
use super::layout::{cell_offset, KEYS_SLOTS};
use super::region::ShmRegion;
use crate::error::{CacheError, CacheResult};

fn hasher() -> &'static RandomState {
    static STATE: OnceLock<RandomState> = OnceLock::new();
    // Seeds are fixed: the bucket of a key must be identical in every
    // process that attaches to the region.
    STATE.get_or_init(|| {
        RandomState::with_seeds(
            0x6c62_272e_07bb_0142,
            0x62b8_2175_6295_c58d,
            0x2c62_bb21_1a53_d2f1,
            0x9e37_79b9_7f4a_7c15,
        )
    })
}

/// The index slot a key probes from before any collision handling. This is
/// also the slot whose bucket lock guards every operation on the key.
pub fn natural_bucket(key: &[u8]) -> usize {
    (hasher().hash_one(key) % KEYS_SLOTS as u64) as usize
}

/// A located entry: the cell it landed in and the chunk it points to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub slot: usize,
    pub chunk: usize,
}

/// Probe for `key` starting at its natural bucket. An empty cell ends the
/// probe; a non-empty cell is checked against the chunk's stored key.
pub fn find(region: &ShmRegion, key: &[u8]) -> CacheResult<Option<Probe>> {
    let mut slot = natural_bucket(key);

    for _ in 0..KEYS_SLOTS {
        let off = region.read_long(cell_offset(slot))?;
        if off == 0 {
            return Ok(None);
        }
        let chunk = off as usize;
        if chunks::key_matches(region, chunk, key)? {
            return Ok(Some(Probe { slot, chunk }));
        }
        slot = (slot + 1) % KEYS_SLOTS;
    }

    Ok(None)
}

/// Place `chunk` in the first empty cell of `key`'s probe run.
pub fn insert(region: &ShmRegion, key: &[u8], chunk: usize) -> CacheResult<()> {
    let mut slot = natural_bucket(key);

    for _ in 0..KEYS_SLOTS {
        if region.read_long(cell_offset(slot))? == 0 {
            return region.write_long(cell_offset(slot), chunk as i64);
        }
        slot = (slot + 1) % KEYS_SLOTS;
    }

    Err(CacheError::IndexFull)
}

/// Remove `key`'s cell and backward-shift the probe run after it so the
/// linear-probing invariant survives without tombstones: each following
/// entry whose natural bucket lies at or before the hole (cyclically)
/// moves into the hole.
pub fn remove(region: &ShmRegion, key: &[u8]) -> CacheResult<bool> {
    let probe = match find(region, key)? {
        Some(p) => p,
        None => return Ok(false),
    };

    region.write_long(cell_offset(probe.slot), 0)?;

    let mut empty = probe.slot;
    let mut j = (empty + 1) % KEYS_SLOTS;

    loop {
        let off = region.read_long(cell_offset(j))?;
        if off == 0 {
            break;
        }

        let stored_key = chunks::read_key(region, off as usize)?;
        let ideal = natural_bucket(&stored_key);

        // Move unless ideal lies in the cyclic range (empty, j].
        let should_move = if empty <= j {
            ideal <= empty || ideal > j
        } else {
            ideal <= empty && ideal > j
        };

        if should_move {
            region.write_long(cell_offset(empty), off)?;
            region.write_long(cell_offset(j), 0)?;
            empty = j;
        }

        j = (j + 1) % KEYS_SLOTS;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::layout::{self, CHUNK_META_SIZE, MIN_VALUE_ALLOC_SIZE};
    use crate::shm::test_dir;

    /// Region with `n` minimum-size chunks formatted in the value area,
    /// each keyed and occupied. Returns the chunk offsets.
    fn make_region(tag: &str, keys: &[&[u8]]) -> (ShmRegion, Vec<usize>) {
        let dir = test_dir(tag);
        let area = keys.len() * (CHUNK_META_SIZE + MIN_VALUE_ALLOC_SIZE);
        let total = layout::values_offset() + area;
        let region = ShmRegion::create(&dir.join("i.cache"), total).unwrap();

        let mut offsets = Vec::new();
        let mut off = layout::values_offset();
        for key in keys {
            chunks::write_meta(&region, off, key, MIN_VALUE_ALLOC_SIZE, 1, 0).unwrap();
            offsets.push(off);
            off += CHUNK_META_SIZE + MIN_VALUE_ALLOC_SIZE;
        }
        (region, offsets)
    }

    #[test]
    fn insert_and_find() {
        let (region, offs) = make_region("index_basic", &[b"hello"]);

        insert(&region, b"hello", offs[0]).unwrap();
        let probe = find(&region, b"hello").unwrap().unwrap();
        assert_eq!(probe.chunk, offs[0]);
        assert_eq!(probe.slot, natural_bucket(b"hello"));

        assert!(find(&region, b"world").unwrap().is_none());

        region.unlink().unwrap();
    }

    /// Search for a key with the given natural bucket.
    fn colliding_key(target: usize, prefix: &str) -> Vec<u8> {
        let mut n = 0u64;
        loop {
            let candidate = format!("{prefix}{n}").into_bytes();
            if natural_bucket(&candidate) == target {
                return candidate;
            }
            n += 1;
        }
    }

    #[test]
    fn collisions_probe_linearly() {
        // Three distinct keys sharing a natural bucket.
        let target = natural_bucket(b"seed");
        let colliding = vec![
            b"seed".to_vec(),
            colliding_key(target, "k"),
            colliding_key(target, "m"),
        ];

        let refs: Vec<&[u8]> = colliding.iter().map(|k| k.as_slice()).collect();
        let (region, offs) = make_region("index_collide", &refs);

        for (key, off) in refs.iter().zip(&offs) {
            insert(&region, key, *off).unwrap();
        }

        for (i, key) in refs.iter().enumerate() {
            let probe = find(&region, key).unwrap().unwrap();
            assert_eq!(probe.chunk, offs[i], "key {i} found wrong chunk");
            assert_eq!(probe.slot, (target + i) % KEYS_SLOTS);
        }

        region.unlink().unwrap();
    }

    #[test]
    fn remove_missing_is_noop() {
        let (region, offs) = make_region("index_remove_missing", &[b"present"]);
        insert(&region, b"present", offs[0]).unwrap();

        assert!(!remove(&region, b"absent").unwrap());
        assert!(find(&region, b"present").unwrap().is_some());

        region.unlink().unwrap();
    }

    #[test]
    fn remove_backward_shifts_probe_run() {
        // Two colliding keys: removing the first must keep the second
        // findable (its cell shifts back into the vacated slot).
        let target = natural_bucket(b"first");
        let second = colliding_key(target, "c");

        let refs: Vec<&[u8]> = vec![b"first", &second];
        let (region, offs) = make_region("index_shift", &refs);
        insert(&region, b"first", offs[0]).unwrap();
        insert(&region, &second, offs[1]).unwrap();

        assert!(remove(&region, b"first").unwrap());
        assert!(find(&region, b"first").unwrap().is_none());

        let probe = find(&region, &second).unwrap().unwrap();
        assert_eq!(probe.chunk, offs[1]);
        assert_eq!(probe.slot, target, "survivor should shift into the hole");

        region.unlink().unwrap();
    }

    #[test]
    fn natural_bucket_is_stable() {
        // The same key must land in the same bucket on every call (and, by
        // fixed seeding, in every process).
        for key in [&b"a"[..], b"zebra", b"0123456789"] {
            assert_eq!(natural_bucket(key), natural_bucket(key));
            assert!(natural_bucket(key) < KEYS_SLOTS);
        }
    }
}

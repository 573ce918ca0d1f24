/// Chunk stream primitives for the value area.
///
/// The value area is a contiguous sequence of variable-size chunks, each
/// `[metadata][payload]`. Chunks never cease to exist; they flip between
/// free and occupied, are split when an allocation leaves enough surplus
/// for another chunk, and are merged forward into their neighbour when
/// freed or swallowed. The allocation walk itself lives in the engine
/// (`shm/mod.rs`) because it has to take bucket locks; this module is the
/// mechanical layer underneath it.
use super::layout::{
    CHUNK_ALLOC_OFFSET, CHUNK_FLAGS_OFFSET, CHUNK_KEY_OFFSET, CHUNK_META_SIZE, CHUNK_USED_OFFSET,
    MAX_KEY_LENGTH,
};
use super::region::ShmRegion;
use crate::error::{CacheError, CacheResult};

/// Decoded chunk metadata (copied out of the region).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Payload capacity in bytes.
    pub alloc: usize,
    /// Used payload bytes; 0 means the chunk is free.
    pub used: usize,
    /// Flags byte (bit 0 = serialised by caller).
    pub flags: u8,
}

impl ChunkHeader {
    pub fn is_occupied(&self) -> bool {
        self.used > 0
    }
}

/// Offset of a chunk's payload.
pub const fn payload_offset(chunk: usize) -> usize {
    chunk + CHUNK_META_SIZE
}

/// Offset of the chunk following `chunk`, or `None` at the end of the
/// value area. Callers wrap to the area start explicitly.
pub fn next_offset(chunk: usize, alloc: usize, value_end: usize) -> Option<usize> {
    let next = chunk + CHUNK_META_SIZE + alloc;
    if next >= value_end {
        None
    } else {
        Some(next)
    }
}

pub fn read_header(region: &ShmRegion, chunk: usize) -> CacheResult<ChunkHeader> {
    let alloc = region.read_long(chunk + CHUNK_ALLOC_OFFSET)?;
    let used = region.read_long(chunk + CHUNK_USED_OFFSET)?;
    if alloc < 0 || used < 0 || used > alloc {
        return Err(CacheError::Corrupted("chunk size fields out of range"));
    }
    let flags = region.read_bytes(chunk + CHUNK_FLAGS_OFFSET, 1)?[0];
    Ok(ChunkHeader {
        alloc: alloc as usize,
        used: used as usize,
        flags,
    })
}

/// The stored key with its null padding trimmed.
pub fn read_key(region: &ShmRegion, chunk: usize) -> CacheResult<Vec<u8>> {
    let field = region.read_bytes(chunk + CHUNK_KEY_OFFSET, MAX_KEY_LENGTH)?;
    let len = field.iter().position(|&b| b == 0).unwrap_or(MAX_KEY_LENGTH);
    Ok(field[..len].to_vec())
}

/// Whether the chunk's stored key equals `key` (which is already truncated
/// and NUL-free, so comparing against the null-padded field is exact).
pub fn key_matches(region: &ShmRegion, chunk: usize, key: &[u8]) -> CacheResult<bool> {
    debug_assert!(key.len() <= MAX_KEY_LENGTH);
    let field = region.read_bytes(chunk + CHUNK_KEY_OFFSET, MAX_KEY_LENGTH)?;
    Ok(&field[..key.len()] == key && field[key.len()..].iter().all(|&b| b == 0))
}

pub fn is_occupied(region: &ShmRegion, chunk: usize) -> CacheResult<bool> {
    Ok(region.read_long(chunk + CHUNK_USED_OFFSET)? > 0)
}

/// Write a full metadata block: null-padded key, capacity, used size, flags.
pub fn write_meta(
    region: &ShmRegion,
    chunk: usize,
    key: &[u8],
    alloc: usize,
    used: usize,
    flags: u8,
) -> CacheResult<()> {
    debug_assert!(key.len() <= MAX_KEY_LENGTH);
    debug_assert!(used <= alloc);

    region.write_bytes(chunk + CHUNK_KEY_OFFSET, key)?;
    region.zero_bytes(chunk + CHUNK_KEY_OFFSET + key.len(), MAX_KEY_LENGTH - key.len())?;
    region.write_long(chunk + CHUNK_ALLOC_OFFSET, alloc as i64)?;
    region.write_long(chunk + CHUNK_USED_OFFSET, used as i64)?;
    region.write_bytes(chunk + CHUNK_FLAGS_OFFSET, &[flags])?;
    Ok(())
}

/// Mark a chunk free: clear the key field and the used size, keep the
/// allocation so the tiling (and a later swallow) still sees its extent.
pub fn set_free(region: &ShmRegion, chunk: usize) -> CacheResult<()> {
    region.zero_bytes(chunk + CHUNK_KEY_OFFSET, MAX_KEY_LENGTH)?;
    region.write_long(chunk + CHUNK_USED_OFFSET, 0)?;
    region.write_bytes(chunk + CHUNK_FLAGS_OFFSET, &[0])?;
    Ok(())
}

/// Rewrite only the capacity field (used while sealing a partially grown
/// chunk or extending one over swallowed neighbours).
pub fn set_alloc(region: &ShmRegion, chunk: usize, alloc: usize) -> CacheResult<()> {
    region.write_long(chunk + CHUNK_ALLOC_OFFSET, alloc as i64)
}

/// In-place payload update for an occupied chunk with sufficient capacity.
pub fn write_value(region: &ShmRegion, chunk: usize, value: &[u8], flags: u8) -> CacheResult<()> {
    region.write_bytes(payload_offset(chunk), value)?;
    region.write_long(chunk + CHUNK_USED_OFFSET, value.len() as i64)?;
    region.write_bytes(chunk + CHUNK_FLAGS_OFFSET, &[flags])?;
    Ok(())
}

pub fn read_payload(region: &ShmRegion, chunk: usize, len: usize) -> CacheResult<Vec<u8>> {
    Ok(region.read_bytes(payload_offset(chunk), len)?.to_vec())
}

/// Format `[value_start, value_end)` as one free chunk spanning the area.
pub fn init_free_area(region: &ShmRegion, value_start: usize, value_end: usize) -> CacheResult<()> {
    debug_assert!(value_end > value_start + CHUNK_META_SIZE);
    write_meta(
        region,
        value_start,
        b"",
        value_end - value_start - CHUNK_META_SIZE,
        0,
        0,
    )
}

/// Merge the free chunk at `chunk` forward over any immediately following
/// free chunks. Returns the merged allocation. Caller holds the `oldest`
/// write lock: chunk boundaries only ever change under it.
pub fn coalesce_forward(region: &ShmRegion, chunk: usize, value_end: usize) -> CacheResult<usize> {
    debug_assert!(!is_occupied(region, chunk)?);
    let mut alloc = read_header(region, chunk)?.alloc;

    while let Some(next) = next_offset(chunk, alloc, value_end) {
        let header = read_header(region, next)?;
        if header.is_occupied() {
            break;
        }
        alloc += CHUNK_META_SIZE + header.alloc;
    }

    set_alloc(region, chunk, alloc)?;
    Ok(alloc)
}

/// Walk the chunk stream, validating the tiling as it goes. Returns each
/// chunk's offset and decoded header. Errors if a step overruns the area
/// or fails to land exactly on its end.
pub fn walk(
    region: &ShmRegion,
    value_start: usize,
    value_end: usize,
) -> CacheResult<Vec<(usize, ChunkHeader)>> {
    let mut chunks = Vec::new();
    let mut off = value_start;

    while off < value_end {
        if off + CHUNK_META_SIZE > value_end {
            return Err(CacheError::Corrupted("chunk metadata overruns value area"));
        }
        let header = read_header(region, off)?;
        let end = off + CHUNK_META_SIZE + header.alloc;
        if end > value_end {
            return Err(CacheError::Corrupted("chunk payload overruns value area"));
        }
        chunks.push((off, header));
        off = end;
    }

    if off != value_end {
        return Err(CacheError::Corrupted("chunk stream does not tile value area"));
    }

    Ok(chunks)
}

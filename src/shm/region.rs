/// Shared memory region management using mmap.
///
/// Creates or opens the memory-mapped file that holds the entire cache:
/// header + hash index + chunked value area. A separate mmap file holds
/// the lock set (see `lock.rs`).
use std::fs;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use super::layout::{self, Header, KEYS_SLOTS, LONG_SIZE, MAGIC, VERSION};
use crate::error::{CacheError, CacheResult};

/// The mapped data region, owning the mmap handle and providing
/// offset-addressed accessors to the bytes within.
///
/// All "references" inside the region are byte offsets; the accessors here
/// are the only way the rest of the crate touches the mapping. Writers go
/// through `&self` because concurrent mutation is arbitrated by the
/// cross-process lock set, not by Rust borrows.
pub struct ShmRegion {
    mmap: MmapMut,
    path: PathBuf,
    len: usize,
}

impl ShmRegion {
    /// Create a new region file of `total_size` bytes and write its header.
    ///
    /// The file is created with `truncate`, so index and value area start
    /// zeroed; only the header is written here. The caller formats the
    /// value area afterwards.
    pub fn create(path: &Path, total_size: usize) -> CacheResult<Self> {
        if total_size < layout::min_total_size() || total_size % LONG_SIZE != 0 {
            return Err(CacheError::InvalidSize { size: total_size });
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total_size as u64)?;

        // Safety: we just created and truncated this file; no other mapping
        // of it can exist yet.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let region = ShmRegion {
            mmap,
            path: path.to_path_buf(),
            len: total_size,
        };

        // Safety: exclusive access, nothing else has attached.
        let header = unsafe { region.header_mut() };
        header.magic = MAGIC;
        header.version = VERSION;
        header.total_size = total_size as u64;
        header.keys_slots = KEYS_SLOTS as u32;
        header.oldest_offset = layout::values_offset() as u64;
        header.hit_count = 0;
        header.miss_count = 0;

        Ok(region)
    }

    /// Map an existing region file and validate its magic.
    pub fn open(path: &Path) -> CacheResult<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;

        if len < layout::min_total_size() {
            return Err(CacheError::Corrupted("region file shorter than minimum"));
        }

        // Safety: mapping a file other processes also map is the whole
        // point; consistency is arbitrated by the lock set.
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let region = ShmRegion {
            mmap,
            path: path.to_path_buf(),
            len,
        };

        if region.header().magic != MAGIC {
            return Err(CacheError::Corrupted("bad magic in region header"));
        }

        Ok(region)
    }

    /// Total mapped length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn header(&self) -> &Header {
        // Safety: the mapping is at least HEADER_SIZE bytes and page-aligned.
        unsafe { &*(self.mmap.as_ptr() as *const Header) }
    }

    /// Mutable header access. Caller must hold the lock guarding the fields
    /// it writes (`oldest` for the cursor, `stats` for the counters, `alloc`
    /// write for everything during init/flush).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn header_mut(&self) -> &mut Header {
        &mut *(self.mmap.as_ptr() as *mut Header)
    }

    fn check_span(&self, offset: usize, len: usize) -> CacheResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CacheError::OutOfBounds { offset, len }),
        }
    }

    /// Borrow `len` bytes at `offset`.
    pub fn read_bytes(&self, offset: usize, len: usize) -> CacheResult<&[u8]> {
        self.check_span(offset, len)?;
        // Safety: span checked above.
        Ok(unsafe { std::slice::from_raw_parts(self.mmap.as_ptr().add(offset), len) })
    }

    /// Write `data` at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> CacheResult<()> {
        self.check_span(offset, data.len())?;
        // Safety: span checked; exclusivity comes from the lock set.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                (self.mmap.as_ptr() as *mut u8).add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Zero `len` bytes at `offset`.
    pub fn zero_bytes(&self, offset: usize, len: usize) -> CacheResult<()> {
        self.check_span(offset, len)?;
        // Safety: span checked; exclusivity comes from the lock set.
        unsafe {
            std::ptr::write_bytes((self.mmap.as_ptr() as *mut u8).add(offset), 0, len);
        }
        Ok(())
    }

    /// Read a native-endian i64 at an aligned `offset`.
    pub fn read_long(&self, offset: usize) -> CacheResult<i64> {
        self.check_span(offset, LONG_SIZE)?;
        debug_assert_eq!(offset % LONG_SIZE, 0, "unaligned long read at {offset}");
        // Safety: span checked, offset aligned by layout construction.
        Ok(unsafe { (self.mmap.as_ptr().add(offset) as *const i64).read() })
    }

    /// Write a native-endian i64 at an aligned `offset`.
    pub fn write_long(&self, offset: usize, value: i64) -> CacheResult<()> {
        self.check_span(offset, LONG_SIZE)?;
        debug_assert_eq!(offset % LONG_SIZE, 0, "unaligned long write at {offset}");
        // Safety: span checked, offset aligned by layout construction.
        unsafe {
            (self.mmap.as_ptr().add(offset) as *mut i64).write(value);
        }
        Ok(())
    }

    /// Remove the backing file. The mapping stays valid until drop.
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
    fn create_writes_header_and_zeroes_index() {
        let dir = test_dir("region_create");
        let path = dir.join("r.cache");
        let total = layout::min_total_size() + 4096;

        let region = ShmRegion::create(&path, total).unwrap();
        let header = region.header();
        assert_eq!(header.magic, MAGIC);
        assert_eq!(header.version, VERSION);
        assert_eq!(header.total_size as usize, total);
        assert_eq!(header.keys_slots as usize, KEYS_SLOTS);
        assert_eq!(header.oldest_offset as usize, layout::values_offset());

        // Fresh file: every index cell is empty.
        assert_eq!(region.read_long(layout::cell_offset(0)).unwrap(), 0);
        assert_eq!(
            region.read_long(layout::cell_offset(KEYS_SLOTS - 1)).unwrap(),
            0
        );

        region.unlink().unwrap();
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = test_dir("region_magic");
        let path = dir.join("r.cache");
        let total = layout::min_total_size();

        let region = ShmRegion::create(&path, total).unwrap();
        region.write_bytes(0, b"NOTMAGIC").unwrap();
        drop(region);

        assert!(matches!(
            ShmRegion::open(&path),
            Err(CacheError::Corrupted(_))
        ));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn long_roundtrip_and_bounds() {
        let dir = test_dir("region_longs");
        let path = dir.join("r.cache");
        let total = layout::min_total_size();

        let region = ShmRegion::create(&path, total).unwrap();
        let off = layout::values_offset();
        region.write_long(off, -12345).unwrap();
        assert_eq!(region.read_long(off).unwrap(), -12345);

        assert!(matches!(
            region.read_long(total),
            Err(CacheError::OutOfBounds { .. })
        ));
        assert!(matches!(
            region.write_bytes(total - 4, &[0u8; 8]),
            Err(CacheError::OutOfBounds { .. })
        ));

        region.unlink().unwrap();
    }
}

//! Aligned backing memory for memory maps.
//!
//! Native targets prefer anonymous `mmap` regions (page aligned, zero filled by
//! the kernel). When the mapping is not suitably aligned, or on targets without
//! `mmap`, the region falls back to a zeroed heap allocation with the requested
//! alignment. The region is written through raw pointers by remote one-sided
//! operations, so every accessor works on `&self`.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::{self, NonNull};

use crate::{DriverError, DriverResult};

/// Page alignment used for memory maps.
pub const REGION_ALIGNMENT: usize = 4096;

#[cfg(unix)]
type NativeMap = memmap2::MmapMut;

#[derive(Debug)]
enum Backing {
    #[cfg(unix)]
    Native(NativeMap),
    Owned {
        ptr: NonNull<u8>,
        layout: Layout,
    },
}

impl Backing {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            #[cfg(unix)]
            Backing::Native(map) => map.as_mut_ptr(),
            Backing::Owned { ptr, .. } => ptr.as_ptr(),
        }
    }
}

/// Contiguous, zero-initialised memory owned by one memory map.
#[derive(Debug)]
pub struct Region {
    len: usize,
    base: NonNull<u8>,
    backing: Backing,
}

// SAFETY: the region owns its allocation. Concurrent access goes through the
// raw copy helpers, which have the same semantics as DMA into registered
// memory: the caller orders accesses through task completions.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Allocates `len` zeroed bytes aligned to `alignment`.
    pub fn new_zeroed(len: usize, alignment: usize) -> DriverResult<Self> {
        if len == 0 || alignment == 0 || !alignment.is_power_of_two() {
            return Err(DriverError::InvalidValue);
        }

        #[cfg(unix)]
        {
            if let Some(backing) = Self::mmap_backed(len, alignment)? {
                return Ok(Self::from_backing(len, backing));
            }
        }

        Self::heap_backed(len, alignment)
    }

    fn heap_backed(len: usize, alignment: usize) -> DriverResult<Self> {
        let layout = Layout::from_size_align(len, alignment).map_err(|_| DriverError::InvalidValue)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(DriverError::NoMemory)?;
        Ok(Self::from_backing(len, Backing::Owned { ptr, layout }))
    }

    fn from_backing(len: usize, mut backing: Backing) -> Self {
        let base = NonNull::new(backing.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self { len, base, backing }
    }

    #[cfg(unix)]
    fn mmap_backed(len: usize, alignment: usize) -> DriverResult<Option<Backing>> {
        let mut map = memmap2::MmapOptions::new()
            .len(len)
            .map_anon()
            .map_err(|err| {
                tracing::warn!(len, %err, "anonymous mapping failed");
                DriverError::NoMemory
            })?;

        if map.as_mut_ptr() as usize % alignment != 0 {
            return Ok(None);
        }
        Ok(Some(Backing::Native(map)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the region.
    pub fn addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    fn check(&self, offset: usize, len: usize) -> DriverResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(DriverError::InvalidValue),
        }
    }

    /// Copies `dst.len()` bytes starting at `offset` out of the region.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> DriverResult<()> {
        self.check(offset, dst.len())?;
        // SAFETY: bounds checked above; `dst` is a distinct Rust allocation.
        unsafe { ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copies `src` into the region at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> DriverResult<()> {
        self.check(offset, src.len())?;
        // SAFETY: bounds checked above; `src` is a distinct Rust allocation.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len()) };
        Ok(())
    }

    /// Copies `len` bytes between two regions, which may be the same region.
    pub fn copy_between(
        src: &Region,
        src_offset: usize,
        dst: &Region,
        dst_offset: usize,
        len: usize,
    ) -> DriverResult<()> {
        src.check(src_offset, len)?;
        dst.check(dst_offset, len)?;
        // SAFETY: both ranges are in bounds; `ptr::copy` tolerates overlap.
        unsafe {
            ptr::copy(
                src.base.as_ptr().add(src_offset),
                dst.base.as_ptr().add(dst_offset),
                len,
            )
        };
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Backing::Owned { ptr, layout } = &self.backing {
            // SAFETY: allocated in `heap_backed` with this exact layout.
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_is_zeroed_and_aligned() {
        let region = Region::new_zeroed(8192, REGION_ALIGNMENT).unwrap();
        assert_eq!(region.addr() as usize % REGION_ALIGNMENT, 0);
        let mut out = vec![0xFFu8; 8192];
        region.read_at(0, &mut out).unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let region = Region::new_zeroed(16, 8).unwrap();
        assert_eq!(region.write_at(10, &[0u8; 8]), Err(DriverError::InvalidValue));
        assert_eq!(region.read_at(usize::MAX, &mut [0u8; 2]), Err(DriverError::InvalidValue));
    }

    #[test]
    fn copy_between_regions() {
        let a = Region::new_zeroed(64, 8).unwrap();
        let b = Region::new_zeroed(64, 8).unwrap();
        a.write_at(4, b"payload").unwrap();
        Region::copy_between(&a, 4, &b, 32, 7).unwrap();
        let mut out = [0u8; 7];
        b.read_at(32, &mut out).unwrap();
        assert_eq!(&out, b"payload");
    }

    #[test]
    fn zero_length_is_invalid() {
        assert!(matches!(Region::new_zeroed(0, 8), Err(DriverError::InvalidValue)));
        assert!(matches!(Region::new_zeroed(8, 3), Err(DriverError::InvalidValue)));
    }
}

//! Buffers: reference-counted views into a memory map, handed out by a
//! bounded inventory.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::mmap::{MmapShared, NativeMmap};
use crate::{DriverError, DriverResult};

struct InventoryShared {
    max: u32,
    live: AtomicU32,
    started: AtomicBool,
}

/// Bounded source of buffers.
#[derive(Clone)]
pub struct NativeBufInventory {
    inner: Arc<InventoryShared>,
}

impl NativeBufInventory {
    pub fn create(max: u32) -> DriverResult<Self> {
        if max == 0 {
            return Err(DriverError::InvalidValue);
        }
        Ok(Self {
            inner: Arc::new(InventoryShared {
                max,
                live: AtomicU32::new(0),
                started: AtomicBool::new(false),
            }),
        })
    }

    pub fn start(&self) -> DriverResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(DriverError::BadState);
        }
        Ok(())
    }

    pub fn max(&self) -> u32 {
        self.inner.max
    }

    /// Buffers currently alive.
    pub fn live(&self) -> u32 {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Buffer over `[offset, offset + len)` with no data yet.
    pub fn get_by_addr(&self, map: &NativeMmap, offset: usize, len: usize) -> DriverResult<NativeBuf> {
        self.get(map, offset, len, 0)
    }

    /// Buffer over `[offset, offset + len)` whose whole range holds data.
    pub fn get_by_data(&self, map: &NativeMmap, offset: usize, len: usize) -> DriverResult<NativeBuf> {
        self.get(map, offset, len, len)
    }

    fn get(&self, map: &NativeMmap, offset: usize, len: usize, data_len: usize) -> DriverResult<NativeBuf> {
        if !self.inner.started.load(Ordering::Acquire) || !map.is_started() {
            return Err(DriverError::BadState);
        }
        match offset.checked_add(len) {
            Some(end) if end <= map.len() => {}
            _ => return Err(DriverError::InvalidValue),
        }
        self.inner
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.inner.max).then_some(live + 1)
            })
            .map_err(|_| DriverError::NoMemory)?;

        Ok(NativeBuf {
            inner: Arc::new(BufShared {
                map: map.shared().clone(),
                offset,
                len,
                data_len: AtomicUsize::new(data_len),
                inventory: self.inner.clone(),
            }),
        })
    }
}

struct BufShared {
    map: Arc<MmapShared>,
    offset: usize,
    len: usize,
    data_len: AtomicUsize,
    inventory: Arc<InventoryShared>,
}

impl Drop for BufShared {
    fn drop(&mut self) {
        self.inventory.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// View of `len` bytes at `offset` in a memory map. Clones share one
/// reference count; the slot returns to the inventory when the last clone
/// drops.
#[derive(Clone)]
pub struct NativeBuf {
    inner: Arc<BufShared>,
}

impl NativeBuf {
    pub fn offset(&self) -> usize {
        self.inner.offset
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn data_len(&self) -> usize {
        self.inner.data_len.load(Ordering::Acquire)
    }

    pub fn set_data_len(&self, data_len: usize) -> DriverResult<()> {
        if data_len > self.inner.len {
            return Err(DriverError::InvalidValue);
        }
        self.inner.data_len.store(data_len, Ordering::Release);
        Ok(())
    }

    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_remote(&self) -> bool {
        self.inner.map.remote().is_some()
    }

    pub(crate) fn map(&self) -> &Arc<MmapShared> {
        &self.inner.map
    }
}

impl std::fmt::Debug for NativeBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBuf")
            .field("offset", &self.offset())
            .field("len", &self.len())
            .field("data_len", &self.data_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{devinfo_list, NativeDevice};

    fn started_map(len: usize) -> NativeMmap {
        let dev = NativeDevice::open(&devinfo_list()[0]).unwrap();
        let map = NativeMmap::create(len).unwrap();
        map.add_device(&dev).unwrap();
        map.start().unwrap();
        map
    }

    #[test]
    fn inventory_is_bounded() {
        let map = started_map(64);
        let inv = NativeBufInventory::create(2).unwrap();
        inv.start().unwrap();

        let a = inv.get_by_addr(&map, 0, 16).unwrap();
        let b = inv.get_by_data(&map, 16, 16).unwrap();
        assert_eq!(inv.get_by_addr(&map, 32, 16).unwrap_err(), DriverError::NoMemory);

        let a2 = a.clone();
        assert_eq!(a.refcount(), 2);
        drop(a);
        assert_eq!(inv.live(), 2);
        drop(a2);
        assert_eq!(inv.live(), 1);
        assert!(inv.get_by_addr(&map, 32, 16).is_ok());
        assert_eq!(b.data_len(), 16);
    }

    #[test]
    fn buffers_must_fit_the_map() {
        let map = started_map(64);
        let inv = NativeBufInventory::create(4).unwrap();
        inv.start().unwrap();
        assert_eq!(inv.get_by_addr(&map, 60, 8).unwrap_err(), DriverError::InvalidValue);
    }

    #[test]
    fn inventory_must_be_started() {
        let map = started_map(64);
        let inv = NativeBufInventory::create(4).unwrap();
        assert_eq!(inv.get_by_addr(&map, 0, 8).unwrap_err(), DriverError::BadState);
    }

    #[test]
    fn data_len_is_bounded_by_len() {
        let map = started_map(64);
        let inv = NativeBufInventory::create(1).unwrap();
        inv.start().unwrap();
        let buf = inv.get_by_addr(&map, 0, 8).unwrap();
        assert_eq!(buf.data_len(), 0);
        buf.set_data_len(8).unwrap();
        assert_eq!(buf.set_data_len(9), Err(DriverError::InvalidValue));
    }
}

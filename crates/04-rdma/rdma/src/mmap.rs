//! Memory maps, buffers and the buffer inventory.

use offload_driver::{AccessFlags, DriverResult, NativeBuf, NativeBufInventory, NativeMmap};

use crate::device::Device;

/// Registered memory. Clones share the map.
#[derive(Clone, Debug)]
pub struct MemoryMap {
    native: NativeMmap,
}

impl MemoryMap {
    /// Allocates an unstarted local map of `len` zeroed bytes.
    pub fn new(len: usize) -> DriverResult<Self> {
        Ok(Self {
            native: NativeMmap::create(len)?,
        })
    }

    /// Allocates, registers with `device`, grants `access` and starts.
    pub fn exposed(device: &Device, len: usize, access: AccessFlags) -> DriverResult<Self> {
        let map = Self::new(len)?;
        map.add_device(device)?;
        map.set_permissions(access)?;
        map.start()?;
        Ok(map)
    }

    /// Imports and starts a map a peer exported with [`MemoryMap::export_rdma`].
    pub fn from_export(desc: &[u8], device: &Device) -> DriverResult<Self> {
        let native = NativeMmap::create_from_export(desc, device.native())?;
        native.start()?;
        Ok(Self { native })
    }

    pub fn add_device(&self, device: &Device) -> DriverResult<()> {
        self.native.add_device(device.native())
    }

    pub fn set_permissions(&self, access: AccessFlags) -> DriverResult<()> {
        self.native.set_permissions(access)
    }

    pub fn start(&self) -> DriverResult<()> {
        self.native.start()
    }

    pub fn export_rdma(&self, device: &Device) -> DriverResult<Vec<u8>> {
        self.native.export_rdma(device.native())
    }

    pub fn len(&self) -> usize {
        self.native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_empty()
    }

    pub fn is_remote(&self) -> bool {
        self.native.is_remote()
    }

    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> DriverResult<()> {
        self.native.read_at(offset, dst)
    }

    pub fn write_at(&self, offset: usize, src: &[u8]) -> DriverResult<()> {
        self.native.write_at(offset, src)
    }

    /// Copies the whole local map out.
    pub fn to_vec(&self) -> DriverResult<Vec<u8>> {
        let mut out = vec![0u8; self.len()];
        self.read_at(0, &mut out)?;
        Ok(out)
    }

    pub fn native(&self) -> &NativeMmap {
        &self.native
    }
}

/// Bounded source of [`Buf`]s.
#[derive(Clone)]
pub struct BufInventory {
    native: NativeBufInventory,
}

impl BufInventory {
    /// Creates and starts an inventory of at most `max` live buffers.
    pub fn new(max: u32) -> DriverResult<Self> {
        let native = NativeBufInventory::create(max)?;
        native.start()?;
        Ok(Self { native })
    }

    /// Buffer over `[offset, offset + len)` of `map`, holding no data yet.
    pub fn buf_by_addr(&self, map: &MemoryMap, offset: usize, len: usize) -> DriverResult<Buf> {
        self.native
            .get_by_addr(map.native(), offset, len)
            .map(|native| Buf { native })
    }

    /// Buffer over `[offset, offset + len)` of `map`, all of it data.
    pub fn buf_by_data(&self, map: &MemoryMap, offset: usize, len: usize) -> DriverResult<Buf> {
        self.native
            .get_by_data(map.native(), offset, len)
            .map(|native| Buf { native })
    }

    pub fn live(&self) -> u32 {
        self.native.live()
    }
}

/// Reference-counted view into a memory map.
#[derive(Clone, Debug)]
pub struct Buf {
    native: NativeBuf,
}

impl Buf {
    pub fn offset(&self) -> usize {
        self.native.offset()
    }

    pub fn len(&self) -> usize {
        self.native.len()
    }

    pub fn is_empty(&self) -> bool {
        self.native.is_empty()
    }

    pub fn data_len(&self) -> usize {
        self.native.data_len()
    }

    pub fn set_data_len(&self, data_len: usize) -> DriverResult<()> {
        self.native.set_data_len(data_len)
    }

    pub fn refcount(&self) -> usize {
        self.native.refcount()
    }

    pub fn native(&self) -> &NativeBuf {
        &self.native
    }
}

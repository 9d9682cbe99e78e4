//! Memory maps: local regions registered with devices, and remote regions
//! imported from export descriptors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::MmapDescriptor;
use crate::device::NativeDevice;
use crate::fabric::{self, fabric};
use crate::region::{Region, REGION_ALIGNMENT};
use crate::{AccessFlags, DriverError, DriverResult};

/// Devices a single map may be registered with.
pub const MAX_MMAP_DEVICES: usize = 8;

enum Backing {
    Local(Region),
    Remote(MmapDescriptor),
}

struct MmapConfig {
    devices: Vec<u64>,
    permissions: AccessFlags,
    exported: bool,
}

pub(crate) struct MmapShared {
    id: u64,
    backing: Backing,
    config: Mutex<MmapConfig>,
    started: AtomicBool,
}

impl MmapShared {
    pub(crate) fn len(&self) -> usize {
        match &self.backing {
            Backing::Local(region) => region.len(),
            Backing::Remote(desc) => desc.len as usize,
        }
    }

    pub(crate) fn local_region(&self) -> Option<&Region> {
        match &self.backing {
            Backing::Local(region) => Some(region),
            Backing::Remote(_) => None,
        }
    }

    pub(crate) fn remote(&self) -> Option<&MmapDescriptor> {
        match &self.backing {
            Backing::Local(_) => None,
            Backing::Remote(desc) => Some(desc),
        }
    }

    pub(crate) fn permissions(&self) -> AccessFlags {
        self.config.lock().permissions
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl Drop for MmapShared {
    fn drop(&mut self) {
        if self.config.get_mut().exported {
            fabric().withdraw_region(self.id);
        }
    }
}

/// Resolves the exporting side of an imported map and checks that it grants
/// `needed`.
pub(crate) fn resolve_remote(
    desc: &MmapDescriptor,
    needed: AccessFlags,
) -> DriverResult<Arc<MmapShared>> {
    let target = fabric()
        .region(desc.region_id)
        .ok_or(DriverError::RemoteAccess)?;
    if !target.is_started()
        || target.local_region().is_none()
        || target.len() as u64 != desc.len
        || !target.permissions().contains(needed)
    {
        return Err(DriverError::RemoteAccess);
    }
    Ok(target)
}

/// Handle to a memory map. Clones share the map.
#[derive(Clone)]
pub struct NativeMmap {
    inner: Arc<MmapShared>,
}

impl NativeMmap {
    /// Allocates a zeroed, page-aligned local map of `len` bytes.
    pub fn create(len: usize) -> DriverResult<Self> {
        let region = Region::new_zeroed(len, REGION_ALIGNMENT)?;
        Ok(Self::with_backing(Backing::Local(region), AccessFlags::LOCAL_READ_WRITE))
    }

    /// Imports a map exported by a peer. The result still has to be started.
    pub fn create_from_export(desc: &[u8], device: &NativeDevice) -> DriverResult<Self> {
        let desc = MmapDescriptor::decode(desc)?;
        let access = desc.access;
        let map = Self::with_backing(Backing::Remote(desc), access);
        map.inner.config.lock().devices.push(device.id());
        tracing::debug!(region = desc.region_id, len = desc.len, "imported remote map");
        Ok(map)
    }

    fn with_backing(backing: Backing, permissions: AccessFlags) -> Self {
        Self {
            inner: Arc::new(MmapShared {
                id: fabric::next_id(),
                backing,
                config: Mutex::new(MmapConfig {
                    devices: Vec::new(),
                    permissions,
                    exported: false,
                }),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn add_device(&self, device: &NativeDevice) -> DriverResult<()> {
        self.ensure_stopped()?;
        let mut config = self.inner.config.lock();
        if config.devices.contains(&device.id()) {
            return Ok(());
        }
        if config.devices.len() == MAX_MMAP_DEVICES {
            return Err(DriverError::NoMemory);
        }
        config.devices.push(device.id());
        Ok(())
    }

    pub fn set_permissions(&self, permissions: AccessFlags) -> DriverResult<()> {
        self.ensure_stopped()?;
        if self.is_remote() {
            return Err(DriverError::NotPermitted);
        }
        self.inner.config.lock().permissions = permissions;
        Ok(())
    }

    /// Freezes the configuration. Local maps need at least one device.
    pub fn start(&self) -> DriverResult<()> {
        self.ensure_stopped()?;
        if self.inner.config.lock().devices.is_empty() {
            return Err(DriverError::BadState);
        }
        self.inner.started.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops the map. An exported map stops resolving for peers.
    pub fn stop(&self) -> DriverResult<()> {
        if !self.is_started() {
            return Err(DriverError::BadState);
        }
        self.inner.started.store(false, Ordering::Release);
        let mut config = self.inner.config.lock();
        if config.exported {
            fabric().withdraw_region(self.inner.id);
            config.exported = false;
        }
        Ok(())
    }

    /// Publishes the map for one-sided access by peers and returns the
    /// descriptor they import.
    pub fn export_rdma(&self, device: &NativeDevice) -> DriverResult<Vec<u8>> {
        if !self.is_started() {
            return Err(DriverError::BadState);
        }
        let region = self.inner.local_region().ok_or(DriverError::NotPermitted)?;
        let mut config = self.inner.config.lock();
        if !config.devices.contains(&device.id()) {
            return Err(DriverError::InvalidValue);
        }
        if !config.permissions.allows_remote() {
            return Err(DriverError::NotPermitted);
        }
        let desc = MmapDescriptor {
            region_id: self.inner.id,
            addr: region.addr(),
            len: region.len() as u64,
            access: config.permissions,
        };
        if !config.exported {
            fabric().publish_region(self.inner.id, &self.inner);
            config.exported = true;
        }
        tracing::debug!(region = self.inner.id, len = desc.len, access = ?desc.access, "exported map");
        Ok(desc.encode())
    }

    fn ensure_stopped(&self) -> DriverResult<()> {
        if self.is_started() {
            Err(DriverError::BadState)
        } else {
            Ok(())
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_remote(&self) -> bool {
        self.inner.remote().is_some()
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    pub fn permissions(&self) -> AccessFlags {
        self.inner.permissions()
    }

    /// Reads local memory. Remote maps are reachable only through tasks.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) -> DriverResult<()> {
        self.inner
            .local_region()
            .ok_or(DriverError::NotPermitted)?
            .read_at(offset, dst)
    }

    /// Writes local memory.
    pub fn write_at(&self, offset: usize, src: &[u8]) -> DriverResult<()> {
        self.inner
            .local_region()
            .ok_or(DriverError::NotPermitted)?
            .write_at(offset, src)
    }

    pub(crate) fn shared(&self) -> &Arc<MmapShared> {
        &self.inner
    }
}

impl std::fmt::Debug for NativeMmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeMmap")
            .field("id", &self.inner.id)
            .field("len", &self.len())
            .field("remote", &self.is_remote())
            .field("started", &self.is_started())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::devinfo_list;

    fn device() -> Arc<NativeDevice> {
        NativeDevice::open(&devinfo_list()[0]).unwrap()
    }

    fn started_map(len: usize, access: AccessFlags) -> (NativeMmap, Arc<NativeDevice>) {
        let dev = device();
        let map = NativeMmap::create(len).unwrap();
        map.add_device(&dev).unwrap();
        map.set_permissions(access).unwrap();
        map.start().unwrap();
        (map, dev)
    }

    #[test]
    fn start_requires_a_device() {
        let map = NativeMmap::create(64).unwrap();
        assert_eq!(map.start(), Err(DriverError::BadState));
    }

    #[test]
    fn configuration_is_frozen_after_start() {
        let (map, dev) = started_map(64, AccessFlags::LOCAL_READ_WRITE);
        assert_eq!(map.add_device(&dev), Err(DriverError::BadState));
        assert_eq!(
            map.set_permissions(AccessFlags::RDMA_READ),
            Err(DriverError::BadState)
        );
    }

    #[test]
    fn export_requires_remote_permission() {
        let (map, dev) = started_map(64, AccessFlags::LOCAL_READ_WRITE);
        assert_eq!(map.export_rdma(&dev), Err(DriverError::NotPermitted));
    }

    #[test]
    fn exported_map_resolves_until_dropped() {
        let (map, dev) =
            started_map(128, AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_WRITE);
        let desc = map.export_rdma(&dev).unwrap();

        let remote = NativeMmap::create_from_export(&desc, &dev).unwrap();
        assert!(remote.is_remote());
        assert_eq!(remote.len(), 128);
        let decoded = *remote.shared().remote().unwrap();
        assert!(resolve_remote(&decoded, AccessFlags::RDMA_WRITE).is_ok());
        assert_eq!(
            resolve_remote(&decoded, AccessFlags::RDMA_READ).err(),
            Some(DriverError::RemoteAccess)
        );

        drop(map);
        assert_eq!(
            resolve_remote(&decoded, AccessFlags::RDMA_WRITE).err(),
            Some(DriverError::RemoteAccess)
        );
    }

    #[test]
    fn remote_maps_have_no_local_access() {
        let (map, dev) = started_map(32, AccessFlags::RDMA_READ);
        let remote = NativeMmap::create_from_export(&map.export_rdma(&dev).unwrap(), &dev).unwrap();
        assert_eq!(remote.read_at(0, &mut [0u8; 4]), Err(DriverError::NotPermitted));
    }
}

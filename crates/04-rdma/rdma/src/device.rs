//! Device discovery and opening.

use std::sync::Arc;

use offload_driver::{devinfo_list, DeviceInfo, DriverError, DriverResult, NativeDevice};

/// An opened device.
#[derive(Clone, Debug)]
pub struct Device {
    native: Arc<NativeDevice>,
}

impl Device {
    pub fn list() -> Vec<DeviceInfo> {
        devinfo_list()
    }

    pub fn open(info: &DeviceInfo) -> DriverResult<Self> {
        Ok(Self {
            native: NativeDevice::open(info)?,
        })
    }

    /// Opens the first listed device accepted by `criteria`.
    pub fn open_by_criteria(criteria: impl Fn(&DeviceInfo) -> bool) -> DriverResult<Self> {
        let info = Self::list()
            .into_iter()
            .find(|info| criteria(info))
            .ok_or(DriverError::NotFound)?;
        Self::open(&info)
    }

    pub fn open_by_ibdev_name(name: &str) -> DriverResult<Self> {
        Self::open_by_criteria(|info| info.ibdev_name == name)
    }

    pub fn open_by_pci_addr(pci_addr: &str) -> DriverResult<Self> {
        Self::open_by_criteria(|info| info.pci_addr == pci_addr)
    }

    pub fn info(&self) -> &DeviceInfo {
        self.native.info()
    }

    pub fn native(&self) -> &Arc<NativeDevice> {
        &self.native
    }
}

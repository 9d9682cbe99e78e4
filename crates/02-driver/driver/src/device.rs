//! Device discovery for the software fabric.
//!
//! The fabric always exposes one loopback device, `soft0`. Additional devices
//! are listed in `OFFLOAD_SOFT_DEVICES` as comma-separated names and receive
//! consecutive PCI addresses.

use std::env;
use std::sync::Arc;

use crate::fabric;
use crate::{DriverError, DriverResult};

/// Environment variable naming extra loopback devices.
pub const SOFT_DEVICES_ENV: &str = "OFFLOAD_SOFT_DEVICES";

/// Name of the always-present loopback device.
pub const DEFAULT_DEVICE: &str = "soft0";

/// Description of a device that can be opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ibdev_name: String,
    pub pci_addr: String,
    pub iface_name: String,
}

/// Lists every device visible to the process.
pub fn devinfo_list() -> Vec<DeviceInfo> {
    let extra = env::var(SOFT_DEVICES_ENV).unwrap_or_default();
    let mut names = vec![DEFAULT_DEVICE.to_owned()];
    for name in extra.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if !names.iter().any(|known| known == name) {
            names.push(name.to_owned());
        }
    }

    names
        .into_iter()
        .enumerate()
        .map(|(slot, name)| DeviceInfo {
            pci_addr: format!("0000:00:{slot:02x}.0"),
            iface_name: format!("{name}-if"),
            ibdev_name: name,
        })
        .collect()
}

/// An opened device. Memory maps and contexts hold it by `Arc`.
#[derive(Debug)]
pub struct NativeDevice {
    id: u64,
    info: DeviceInfo,
}

impl NativeDevice {
    /// Opens the device described by `info`. Fails with `NotFound` when the
    /// device is no longer listed.
    pub fn open(info: &DeviceInfo) -> DriverResult<Arc<Self>> {
        if !devinfo_list().iter().any(|known| known == info) {
            return Err(DriverError::NotFound);
        }
        let device = Arc::new(Self {
            id: fabric::next_id(),
            info: info.clone(),
        });
        tracing::debug!(device = %info.ibdev_name, pci = %info.pci_addr, "opened device");
        Ok(device)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_device_is_always_listed() {
        let list = devinfo_list();
        assert_eq!(list[0].ibdev_name, DEFAULT_DEVICE);
        assert_eq!(list[0].pci_addr, "0000:00:00.0");
    }

    #[test]
    fn unknown_device_cannot_be_opened() {
        let info = DeviceInfo {
            ibdev_name: "missing".into(),
            pci_addr: "0000:ff:00.0".into(),
            iface_name: "missing-if".into(),
        };
        assert_eq!(NativeDevice::open(&info).unwrap_err(), DriverError::NotFound);
    }

    #[test]
    fn opened_devices_get_distinct_ids() {
        let info = devinfo_list().remove(0);
        let a = NativeDevice::open(&info).unwrap();
        let b = NativeDevice::open(&info).unwrap();
        assert_ne!(a.id(), b.id());
    }
}

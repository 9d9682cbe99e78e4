//! Small value types shared across the driver surface.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Opaque per-object user data. The driver stores it and hands it back to
/// completion callbacks without interpreting it.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct UserData(usize);

impl UserData {
    pub const NULL: UserData = UserData(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        UserData(ptr as usize)
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub fn from_u64(value: u64) -> Self {
        UserData(value as usize)
    }

    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub(crate) fn raw(self) -> usize {
        self.0
    }

    pub(crate) fn from_raw(raw: usize) -> Self {
        UserData(raw)
    }
}

impl fmt::Debug for UserData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserData({:#x})", self.0)
    }
}

/// Access permissions granted on a memory map.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AccessFlags(u32);

impl AccessFlags {
    pub const LOCAL_READ_ONLY: AccessFlags = AccessFlags(0);
    pub const LOCAL_READ_WRITE: AccessFlags = AccessFlags(1 << 0);
    pub const RDMA_READ: AccessFlags = AccessFlags(1 << 1);
    pub const RDMA_WRITE: AccessFlags = AccessFlags(1 << 2);
    pub const RDMA_ATOMIC: AccessFlags = AccessFlags(1 << 3);

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Rejects unknown bits.
    pub fn from_bits(bits: u32) -> Option<Self> {
        (bits & !0xF == 0).then_some(AccessFlags(bits))
    }

    pub fn contains(self, other: AccessFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn allows_remote(self) -> bool {
        self.0 & (Self::RDMA_READ.0 | Self::RDMA_WRITE.0 | Self::RDMA_ATOMIC.0) != 0
    }
}

impl BitOr for AccessFlags {
    type Output = AccessFlags;

    fn bitor(self, rhs: Self) -> Self {
        AccessFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AccessFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::LOCAL_READ_WRITE, "LOCAL_READ_WRITE"),
            (Self::RDMA_READ, "RDMA_READ"),
            (Self::RDMA_WRITE, "RDMA_WRITE"),
            (Self::RDMA_ATOMIC, "RDMA_ATOMIC"),
        ];
        let mut list = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                list.entry(&format_args!("{name}"));
            }
        }
        list.finish()
    }
}

/// Lifecycle of a capability context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CtxState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl CtxState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CtxState::Starting,
            2 => CtxState::Running,
            3 => CtxState::Stopping,
            _ => CtxState::Idle,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    Pending = 0,
    Connecting = 1,
    Established = 2,
    Failed = 3,
    Disconnected = 4,
}

impl ConnState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnState::Connecting,
            2 => ConnState::Established,
            3 => ConnState::Failed,
            4 => ConnState::Disconnected,
            _ => ConnState::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_flags_compose() {
        let flags = AccessFlags::LOCAL_READ_WRITE | AccessFlags::RDMA_WRITE;
        assert!(flags.contains(AccessFlags::RDMA_WRITE));
        assert!(!flags.contains(AccessFlags::RDMA_READ));
        assert!(flags.allows_remote());
        assert!(!AccessFlags::LOCAL_READ_WRITE.allows_remote());
        assert_eq!(AccessFlags::from_bits(flags.bits()), Some(flags));
        assert_eq!(AccessFlags::from_bits(0x100), None);
    }

    #[test]
    fn user_data_carries_pointers() {
        let value = 17u32;
        let data = UserData::from_ptr(&value);
        assert!(!data.is_null());
        assert_eq!(unsafe { *data.as_ptr::<u32>() }, 17);
        assert!(UserData::NULL.is_null());
    }
}

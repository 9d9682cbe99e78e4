//! Wire formats of exported descriptors.
//!
//! Both descriptors are fixed-size little-endian records opened by a 4-byte
//! magic and a version. They travel only over the out-of-band transport and
//! are opaque to everything above the driver.

use crate::{AccessFlags, DriverError, DriverResult};

pub const DESCRIPTOR_VERSION: u16 = 1;

const CONNECTION_MAGIC: [u8; 4] = *b"OFRC";
const MMAP_MAGIC: [u8; 4] = *b"OFMM";

/// Identity of an exported connection endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub ctx_id: u64,
    pub conn_id: u64,
    pub gid_index: u32,
}

impl ConnectionDescriptor {
    pub const ENCODED_LEN: usize = 28;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&CONNECTION_MAGIC);
        out.extend_from_slice(&DESCRIPTOR_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.ctx_id.to_le_bytes());
        out.extend_from_slice(&self.conn_id.to_le_bytes());
        out.extend_from_slice(&self.gid_index.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> DriverResult<Self> {
        let mut reader = Reader::open(bytes, CONNECTION_MAGIC, Self::ENCODED_LEN)?;
        Ok(Self {
            ctx_id: reader.u64(),
            conn_id: reader.u64(),
            gid_index: reader.u32(),
        })
    }
}

/// Identity and extent of an exported memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmapDescriptor {
    pub region_id: u64,
    pub addr: u64,
    pub len: u64,
    pub access: AccessFlags,
}

impl MmapDescriptor {
    pub const ENCODED_LEN: usize = 36;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&MMAP_MAGIC);
        out.extend_from_slice(&DESCRIPTOR_VERSION.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&self.region_id.to_le_bytes());
        out.extend_from_slice(&self.addr.to_le_bytes());
        out.extend_from_slice(&self.len.to_le_bytes());
        out.extend_from_slice(&self.access.bits().to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> DriverResult<Self> {
        let mut reader = Reader::open(bytes, MMAP_MAGIC, Self::ENCODED_LEN)?;
        let region_id = reader.u64();
        let addr = reader.u64();
        let len = reader.u64();
        let access = AccessFlags::from_bits(reader.u32()).ok_or(DriverError::InvalidValue)?;
        Ok(Self {
            region_id,
            addr,
            len,
            access,
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn open(bytes: &'a [u8], magic: [u8; 4], len: usize) -> DriverResult<Self> {
        if bytes.len() != len || bytes[..4] != magic {
            return Err(DriverError::InvalidValue);
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != DESCRIPTOR_VERSION {
            tracing::warn!(version, "unsupported descriptor version");
            return Err(DriverError::InvalidValue);
        }
        Ok(Self { bytes, pos: 8 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }
}

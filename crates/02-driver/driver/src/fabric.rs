//! Process-wide registry standing in for the physical fabric.
//!
//! Exported regions and connection endpoints are published here by id. The
//! registry holds weak references only: a descriptor for an object that has
//! been dropped simply stops resolving.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::conn::ConnShared;
use crate::mmap::MmapShared;

#[derive(Default)]
pub(crate) struct Fabric {
    regions: Mutex<HashMap<u64, Weak<MmapShared>>>,
    connections: Mutex<HashMap<u64, Weak<ConnShared>>>,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Fresh identifier, unique within the process.
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn fabric() -> &'static Fabric {
    static FABRIC: OnceLock<Fabric> = OnceLock::new();
    FABRIC.get_or_init(Fabric::default)
}

impl Fabric {
    pub(crate) fn publish_region(&self, id: u64, region: &Arc<MmapShared>) {
        self.regions.lock().insert(id, Arc::downgrade(region));
    }

    pub(crate) fn withdraw_region(&self, id: u64) {
        self.regions.lock().remove(&id);
    }

    pub(crate) fn region(&self, id: u64) -> Option<Arc<MmapShared>> {
        self.regions.lock().get(&id).and_then(Weak::upgrade)
    }

    pub(crate) fn publish_connection(&self, id: u64, conn: &Arc<ConnShared>) {
        self.connections.lock().insert(id, Arc::downgrade(conn));
    }

    pub(crate) fn withdraw_connection(&self, id: u64) {
        self.connections.lock().remove(&id);
    }

    pub(crate) fn connection(&self, id: u64) -> Option<Arc<ConnShared>> {
        self.connections.lock().get(&id).and_then(Weak::upgrade)
    }
}

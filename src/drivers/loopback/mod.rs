//! In-process fabric.
//!
//! Listeners, connections and registered memory live in one [`Hub`] shared
//! by every channel the fabric opens, so a client and a server in the same
//! process talk to each other without hardware. Sends are delivered into the
//! peer's posted receives; a send that finds no posted receive waits for one,
//! the way a reliable connection retries on receiver-not-ready.

mod channel;
mod region;

pub use channel::{LoopbackChannel, LoopbackEndpoint};
pub use region::LoopbackRegion;

use crate::error::Result;
use crate::transport::{EqHandle, EventChannel, Fabric, MemoryRegion, Role};
use bytes::BytesMut;
use dashmap::DashMap;
use region::SharedMem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const ADDR_BASE: u64 = 0x1000_0000;
const ADDR_ALIGN: u64 = 4096;

pub(crate) struct Hub {
    listeners: DashMap<SocketAddr, channel::Listener>,
    /// rkey -> (base address, memory)
    regions: DashMap<u32, (u64, SharedMem)>,
    next_key: AtomicU32,
    next_addr: AtomicU64,
    next_handle: AtomicU64,
    next_token: AtomicU64,
}

impl Hub {
    fn new() -> Self {
        Self {
            listeners: DashMap::new(),
            regions: DashMap::new(),
            next_key: AtomicU32::new(1),
            next_addr: AtomicU64::new(ADDR_BASE),
            next_handle: AtomicU64::new(1),
            next_token: AtomicU64::new(1),
        }
    }

    fn next_key(&self) -> u32 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Reserve a page-aligned synthetic address range, leaving a guard page.
    fn reserve_addr(&self, len: usize) -> u64 {
        let span = (len as u64).div_ceil(ADDR_ALIGN) * ADDR_ALIGN + ADDR_ALIGN;
        self.next_addr.fetch_add(span, Ordering::Relaxed)
    }

    fn next_handle(&self) -> EqHandle {
        EqHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn next_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Resolve a remote range to the memory backing it and the offset into it.
    fn resolve(&self, rkey: u32, addr: u64, len: u64) -> Option<(SharedMem, usize)> {
        let entry = self.regions.get(&rkey)?;
        let (base, mem) = entry.value();
        let offset = addr.checked_sub(*base)?;
        let end = offset.checked_add(len)?;
        if end > mem.lock().len() as u64 {
            return None;
        }
        Some((mem.clone(), offset as usize))
    }
}

/// Fabric whose every channel lives in this process.
#[derive(Clone)]
pub struct LoopbackFabric {
    hub: Arc<Hub>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub::new()),
        }
    }

    /// Number of live memory registrations.
    pub fn registered_regions(&self) -> usize {
        self.hub.regions.len()
    }

    pub fn is_listening(&self, addr: &SocketAddr) -> bool {
        self.hub.listeners.contains_key(addr)
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric for LoopbackFabric {
    fn name(&self) -> &str {
        "loopback"
    }

    fn register(&self, buf: BytesMut) -> Result<Box<dyn MemoryRegion>> {
        Ok(Box::new(LoopbackRegion::new(self.hub.clone(), buf)))
    }

    fn open(&self, addr: SocketAddr, role: Role) -> Result<Box<dyn EventChannel>> {
        Ok(Box::new(LoopbackChannel::new(self.hub.clone(), addr, role)))
    }
}

//! rdma-cm / ibverbs fabric.
//!
//! Connection management runs on an rdma-cm event channel whose events are
//! read by a background thread and applied by the owning worker. Every queue
//! pair of one event channel shares that channel's completion queue.

mod channel;
mod context;
mod region;

pub use channel::{RdmaChannel, RdmaEndpoint};
pub use context::RdmaContext;
pub use region::RdmaRegion;

use crate::error::{Error, Result};
use crate::transport::{EventChannel, Fabric, MemoryRegion, Role};
use bytes::BytesMut;
use sideway::ibverbs::device::{DeviceInfo, DeviceList};
use std::net::SocketAddr;
use std::sync::Arc;

/// Work requests each queue pair can hold per direction.
pub const DEFAULT_QUEUE_DEPTH: u32 = 1024;

pub fn get_device_list() -> Vec<String> {
    match DeviceList::new() {
        Ok(list) => list.iter().map(|d| d.name()).collect(),
        Err(_) => Vec::new(),
    }
}

#[derive(Clone)]
pub struct RdmaFabric {
    context: Arc<RdmaContext>,
    queue_depth: u32,
}

impl RdmaFabric {
    pub fn open(dev_name: &str) -> Result<Self> {
        Ok(Self {
            context: RdmaContext::open(dev_name)?,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        })
    }

    /// Open the first device the host reports.
    pub fn first_device() -> Result<Self> {
        let devices = get_device_list();
        let name = devices
            .first()
            .ok_or_else(|| Error::Config("no RDMA devices available".into()))?;
        Self::open(name)
    }

    /// Queue-pair depth; must cover `buffer_num` receives plus in-flight
    /// sends and reads.
    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = depth;
        self
    }

    pub fn context(&self) -> &Arc<RdmaContext> {
        &self.context
    }
}

impl Fabric for RdmaFabric {
    fn name(&self) -> &str {
        "rdma"
    }

    fn register(&self, buf: BytesMut) -> Result<Box<dyn MemoryRegion>> {
        Ok(Box::new(RdmaRegion::register(&self.context, buf)?))
    }

    fn open(&self, addr: SocketAddr, role: Role) -> Result<Box<dyn EventChannel>> {
        Ok(Box::new(RdmaChannel::new(
            self.context.clone(),
            addr,
            role,
            self.queue_depth,
        )?))
    }
}

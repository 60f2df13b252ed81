//! Fabric provider boundary.
//!
//! The connection model talks to the wire only through these traits. A
//! [`Fabric`] registers memory and opens [`EventChannel`]s; a channel yields
//! connection-management events and work completions, and hands out an
//! [`Endpoint`] per connection for posting work requests.

pub mod protocol;

use crate::error::Result;
use crate::memory::RemoteBuf;
use bytes::BytesMut;
use protocol::{Handshake, WrId, WrOp};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Opaque event-queue handle identifying one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EqHandle(pub u64);

impl fmt::Display for EqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eq#{}", self.0)
    }
}

impl From<EqHandle> for u64 {
    fn from(h: EqHandle) -> u64 {
        h.0
    }
}

/// Which side of a connection an event channel serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

/// Connection-management event kinds surfaced by a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmEventKind {
    ConnectRequest,
    Connected,
    Disconnected,
    Rejected,
    Error,
    /// Anything the connection model does not act on.
    Other(u32),
}

/// An inbound connection attempt waiting for [`EventChannel::accept`] or
/// [`EventChannel::reject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    token: u64,
    handshake: Option<Handshake>,
}

impl ConnectRequest {
    pub fn new(token: u64, handshake: Option<Handshake>) -> Self {
        Self { token, handshake }
    }

    /// Fabric-private identifier of the pending attempt.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// The initiator's handshake, when it carried one.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct CmEvent {
    pub handle: EqHandle,
    pub kind: CmEventKind,
    pub request: Option<ConnectRequest>,
    pub peer: Option<Handshake>,
    pub status: i32,
}

impl CmEvent {
    pub fn new(handle: EqHandle, kind: CmEventKind) -> Self {
        Self {
            handle,
            kind,
            request: None,
            peer: None,
            status: 0,
        }
    }

    pub fn with_request(mut self, request: ConnectRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_peer(mut self, peer: Option<Handshake>) -> Self {
        self.peer = peer;
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }
}

/// Completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    pub handle: EqHandle,
    pub wr_id: u64,
    pub opcode: WrOp,
    /// Zero on success, otherwise the fabric's status code.
    pub status: i32,
    pub byte_len: u32,
}

impl WorkCompletion {
    /// Build a completion from a packed work-request id.
    ///
    /// Returns `None` for ids this crate did not post.
    pub fn from_wr_id(wr_id: u64, status: i32, byte_len: u32) -> Option<Self> {
        let id = WrId::decode(wr_id)?;
        Some(Self {
            handle: id.handle,
            wr_id,
            opcode: id.op,
            status,
            byte_len,
        })
    }

    pub fn chunk(&self) -> u32 {
        (self.wr_id & 0xFFFF_FFFF) as u32
    }

    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// A registered memory region. Dropping it deregisters the memory.
pub trait MemoryRegion: Send + Sync {
    fn addr(&self) -> u64;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;

    /// Copy out of the region starting at `offset`; returns the bytes copied.
    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize;

    /// Copy into the region starting at `offset`; returns the bytes copied.
    fn write_at(&self, offset: usize, src: &[u8]) -> usize;

    /// Descriptor a peer needs for one-sided access to this region.
    fn remote(&self) -> RemoteBuf {
        RemoteBuf::new(self.addr(), self.len() as u64, self.rkey())
    }
}

/// Per-connection work-request poster.
pub trait Endpoint: Send {
    fn post_recv(&mut self, wr_id: u64, region: &dyn MemoryRegion) -> Result<()>;

    /// Send the first `len` bytes of `region`.
    fn post_send(&mut self, wr_id: u64, region: &dyn MemoryRegion, len: usize) -> Result<()>;

    /// Read `remote` from the peer into `local` at `offset`.
    fn post_read(
        &mut self,
        wr_id: u64,
        local: &dyn MemoryRegion,
        offset: usize,
        remote: RemoteBuf,
    ) -> Result<()>;

    /// Tear the endpoint down. Calling it twice is harmless.
    fn shutdown(&mut self) -> Result<()>;
}

/// Connection-management and completion source owned by one worker.
pub trait EventChannel: Send {
    fn local_addr(&self) -> SocketAddr;

    fn listen(&mut self, backlog: i32) -> Result<EqHandle>;

    fn connect(&mut self, handshake: &Handshake) -> Result<(EqHandle, Box<dyn Endpoint>)>;

    fn accept(
        &mut self,
        request: &ConnectRequest,
        handshake: &Handshake,
    ) -> Result<(EqHandle, Box<dyn Endpoint>)>;

    fn reject(&mut self, request: &ConnectRequest) -> Result<()>;

    /// Wait up to `timeout` for the next connection-management event.
    fn wait_event(&mut self, timeout: Duration) -> Result<Option<CmEvent>>;

    /// Append ready completions to `out` without blocking; returns how many.
    fn poll_completions(&mut self, out: &mut Vec<WorkCompletion>) -> usize;
}

/// Factory for memory registrations and event channels.
pub trait Fabric: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Register `buf` for local and remote access; the region spans `buf.len()`.
    fn register(&self, buf: BytesMut) -> Result<Box<dyn MemoryRegion>>;

    fn open(&self, addr: SocketAddr, role: Role) -> Result<Box<dyn EventChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eq_handle_display() {
        assert_eq!(EqHandle(3).to_string(), "eq#3");
        assert_eq!(u64::from(EqHandle(9)), 9);
    }

    #[test]
    fn test_work_completion_from_wr_id() {
        let wr_id = WrId::new(EqHandle(5), WrOp::Send, 17).encode();
        let wc = WorkCompletion::from_wr_id(wr_id, 0, 128).unwrap();
        assert_eq!(wc.handle, EqHandle(5));
        assert_eq!(wc.opcode, WrOp::Send);
        assert_eq!(wc.chunk(), 17);
        assert!(wc.is_ok());
        assert!(WorkCompletion::from_wr_id(17, 0, 0).is_none());
    }

    #[test]
    fn test_cm_event_builder() {
        let req = ConnectRequest::new(11, Some(Handshake::new(8, 1, vec![2])));
        let ev = CmEvent::new(EqHandle(1), CmEventKind::ConnectRequest)
            .with_request(req.clone())
            .with_status(-5);
        assert_eq!(ev.request, Some(req));
        assert_eq!(ev.status, -5);
        assert!(ev.peer.is_none());
    }
}

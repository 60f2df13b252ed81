//! Connection objects.
//!
//! A [`Connection`] is owned by the event-queue service that created it and
//! only ever changes status on that service's worker thread. Other threads
//! hold a [`ConnectionRef`]: it reads the status, waits on it, and posts
//! sends and reads directly on the shared endpoint. Shutdown requests are
//! forwarded to the owning worker.

mod status;

pub use status::{ConnStatus, StatusCell};

use crate::eq::Command;
use crate::error::{Error, Result};
use crate::memory::{BufferPool, RemoteBuf};
use crate::transport::protocol::{Handshake, WrId, WrOp};
use crate::transport::{ConnectRequest, EqHandle, Endpoint};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Data-path state shared between the worker and every `ConnectionRef`.
#[derive(Default)]
pub(crate) struct Link {
    endpoint: Option<Box<dyn Endpoint>>,
    free_send: VecDeque<u32>,
    /// Receive slot size the peer advertised.
    peer_slot: Option<usize>,
}

/// Worker-owned connection record.
pub struct Connection {
    handle: EqHandle,
    status: Arc<StatusCell>,
    link: Arc<Mutex<Link>>,
    send_ids: Vec<u32>,
    recv_ids: Vec<u32>,
    peer: Option<Handshake>,
    request: Option<ConnectRequest>,
}

impl Connection {
    pub(crate) fn new(handle: EqHandle, status: ConnStatus) -> Self {
        Self {
            handle,
            status: Arc::new(StatusCell::new(status)),
            link: Arc::new(Mutex::new(Link::default())),
            send_ids: Vec::new(),
            recv_ids: Vec::new(),
            peer: None,
            request: None,
        }
    }

    /// Pending connection for an inbound request.
    pub(crate) fn pending(handle: EqHandle, request: ConnectRequest) -> Self {
        let mut conn = Self::new(handle, ConnStatus::AcceptPending);
        conn.peer = request.handshake().cloned();
        conn.request = Some(request);
        conn
    }

    /// Bind the endpoint and the chunk ids this connection uses.
    pub(crate) fn attach(&mut self, endpoint: Box<dyn Endpoint>, send_ids: Vec<u32>, recv_ids: Vec<u32>) {
        let mut link = self.link.lock();
        link.endpoint = Some(endpoint);
        link.free_send = send_ids.iter().copied().collect();
        drop(link);
        self.send_ids = send_ids;
        self.recv_ids = recv_ids;
    }

    pub fn handle(&self) -> EqHandle {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: EqHandle) {
        self.handle = handle;
    }

    pub fn status(&self) -> ConnStatus {
        self.status.get()
    }

    pub(crate) fn advance(&self, next: ConnStatus) -> bool {
        self.status.advance(next).is_some()
    }

    pub fn send_ids(&self) -> &[u32] {
        &self.send_ids
    }

    pub fn recv_ids(&self) -> &[u32] {
        &self.recv_ids
    }

    /// The peer's handshake, fixed once connected.
    pub fn peer(&self) -> Option<&Handshake> {
        self.peer.as_ref()
    }

    pub(crate) fn set_peer(&mut self, peer: Handshake) {
        if self.peer.is_none() {
            self.peer = Some(peer);
        }
    }

    /// Cap sends at the peer's receive slot size.
    pub(crate) fn limit_payload(&self, peer_slot: usize) {
        self.link.lock().peer_slot = Some(peer_slot);
    }

    pub(crate) fn take_request(&mut self) -> Option<ConnectRequest> {
        self.request.take()
    }

    pub(crate) fn take_chunks(&mut self) -> (Vec<u32>, Vec<u32>) {
        self.link.lock().free_send.clear();
        (
            std::mem::take(&mut self.send_ids),
            std::mem::take(&mut self.recv_ids),
        )
    }

    pub(crate) fn post_recv(&self, pool: &BufferPool, id: u32) -> Result<()> {
        let chunk = pool.index(id)?;
        let region = chunk
            .region()
            .ok_or_else(|| Error::not_found("registration", id))?;
        let mut link = self.link.lock();
        let endpoint = link.endpoint.as_mut().ok_or(Error::InvalidState {
            op: "post_recv",
            status: self.status.get(),
        })?;
        endpoint.post_recv(WrId::new(self.handle, WrOp::Recv, id).encode(), region)
    }

    /// Return a send chunk whose completion arrived.
    pub(crate) fn complete_send(&self, id: u32) {
        let mut link = self.link.lock();
        if self.send_ids.contains(&id) && !link.free_send.contains(&id) {
            link.free_send.push_back(id);
        }
    }

    /// Move to `ShutdownRequested` then `Down`, tearing the endpoint down in
    /// between. Returns `false` if the connection was already down.
    pub(crate) fn teardown(&self) -> bool {
        if !self.status.get().can_advance_to(ConnStatus::Down) {
            return false;
        }
        self.status.advance(ConnStatus::ShutdownRequested);
        let endpoint = self.link.lock().endpoint.take();
        if let Some(mut endpoint) = endpoint {
            if let Err(e) = endpoint.shutdown() {
                tracing::warn!(handle = %self.handle, error = %e, "endpoint shutdown failed");
            }
        }
        self.status.advance(ConnStatus::Down).is_some()
    }

    pub(crate) fn to_ref(&self, ctx: &RefContext) -> ConnectionRef {
        ConnectionRef {
            handle: self.handle,
            slot_size: ctx.slot_size,
            status: self.status.clone(),
            link: self.link.clone(),
            send_pool: ctx.send_pool.clone(),
            rma_pool: ctx.rma_pool.clone(),
            commands: ctx.commands.clone(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("handle", &self.handle)
            .field("status", &self.status.get())
            .field("send_ids", &self.send_ids)
            .field("recv_ids", &self.recv_ids)
            .finish()
    }
}

/// Everything a `ConnectionRef` shares with the owning worker besides the
/// connection itself.
#[derive(Clone)]
pub(crate) struct RefContext {
    pub slot_size: usize,
    pub send_pool: Arc<Mutex<BufferPool>>,
    pub rma_pool: Arc<Mutex<BufferPool>>,
    pub commands: flume::Sender<Command>,
}

/// Cloneable, thread-safe handle to a connection.
#[derive(Clone)]
pub struct ConnectionRef {
    handle: EqHandle,
    slot_size: usize,
    status: Arc<StatusCell>,
    link: Arc<Mutex<Link>>,
    send_pool: Arc<Mutex<BufferPool>>,
    rma_pool: Arc<Mutex<BufferPool>>,
    commands: flume::Sender<Command>,
}

impl ConnectionRef {
    pub fn handle(&self) -> EqHandle {
        self.handle
    }

    pub fn status(&self) -> ConnStatus {
        self.status.get()
    }

    /// Largest payload a single send accepts: the local slot size, or the
    /// peer's if smaller.
    pub fn slot_size(&self) -> usize {
        let peer_slot = self.link.lock().peer_slot;
        peer_slot.map_or(self.slot_size, |peer| peer.min(self.slot_size))
    }

    pub fn free_send_slots(&self) -> usize {
        self.link.lock().free_send.len()
    }

    /// Block until the connection is connected or down.
    ///
    /// Returns `InvalidState` if it went down instead.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        match self.status.wait_settled(Some(timeout))? {
            ConnStatus::Connected => Ok(()),
            status => Err(Error::InvalidState {
                op: "wait_connected",
                status,
            }),
        }
    }

    pub fn wait_down(&self, timeout: Duration) -> Result<()> {
        self.status.wait_down(Some(timeout))
    }

    /// Copy `payload` into a free send chunk and post it. Returns the chunk id.
    pub fn send(&self, payload: impl AsRef<[u8]>) -> Result<u32> {
        let payload = payload.as_ref();
        let status = self.status.get();
        if status != ConnStatus::Connected {
            return Err(Error::InvalidState { op: "send", status });
        }
        let max = self.slot_size();
        if payload.len() > max {
            return Err(Error::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }

        let mut guard = self.link.lock();
        let link = &mut *guard;
        let endpoint = link.endpoint.as_mut().ok_or(Error::InvalidState {
            op: "send",
            status: self.status.get(),
        })?;
        let id = link.free_send.pop_front().ok_or(Error::Empty)?;

        let posted = (|| -> Result<()> {
            let pool = self.send_pool.lock();
            let chunk = pool.index(id)?;
            let region = chunk
                .region()
                .ok_or_else(|| Error::not_found("registration", id))?;
            region.write_at(0, payload);
            endpoint.post_send(
                WrId::new(self.handle, WrOp::Send, id).encode(),
                region,
                payload.len(),
            )
        })();

        match posted {
            Ok(()) => Ok(id),
            Err(e) => {
                link.free_send.push_front(id);
                Err(e)
            }
        }
    }

    /// One-sided read of `remote` into the registered RMA buffer `local_id`
    /// at `offset`. Completion is reported to the read callback.
    pub fn read(&self, local_id: u32, offset: usize, remote: RemoteBuf) -> Result<()> {
        let status = self.status.get();
        if status != ConnStatus::Connected {
            return Err(Error::InvalidState { op: "read", status });
        }

        let mut link = self.link.lock();
        let endpoint = link.endpoint.as_mut().ok_or(Error::InvalidState {
            op: "read",
            status: self.status.get(),
        })?;
        let pool = self.rma_pool.lock();
        let chunk = pool.index(local_id)?;
        let region = chunk
            .region()
            .ok_or_else(|| Error::not_found("registration", local_id))?;
        let room = region.len().saturating_sub(offset);
        if remote.len() > room as u64 {
            return Err(Error::PayloadTooLarge {
                len: remote.len() as usize,
                max: room,
            });
        }
        endpoint.post_read(
            WrId::new(self.handle, WrOp::Read, local_id).encode(),
            region,
            offset,
            remote,
        )
    }

    /// Ask the owning worker to tear the connection down. Does nothing once
    /// shutdown is under way.
    pub fn shutdown(&self) -> Result<()> {
        if self.status.get().can_advance_to(ConnStatus::ShutdownRequested)
            && self.commands.send(Command::Shutdown(self.handle)).is_err()
        {
            tracing::debug!(handle = %self.handle, "worker gone, shutdown skipped");
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRef")
            .field("handle", &self.handle)
            .field("status", &self.status.get())
            .finish()
    }
}

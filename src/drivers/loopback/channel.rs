use super::region::{copy_in, copy_out, SharedMem};
use super::Hub;
use crate::error::{Error, Result};
use crate::memory::RemoteBuf;
use crate::transport::protocol::Handshake;
use crate::transport::{
    CmEvent, CmEventKind, ConnectRequest, Endpoint, EqHandle, EventChannel, MemoryRegion, Role,
    WorkCompletion,
};
use crossbeam::channel as cb;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

// Negative errno values reported as status codes.
const STATUS_REMOTE_ACCESS: i32 = -14;
const STATUS_LENGTH: i32 = -90;
const STATUS_NOT_CONNECTED: i32 = -107;
const STATUS_REFUSED: i32 = -111;

pub(super) enum Signal {
    Event(CmEvent),
    Request(Inbound),
    /// A completion was queued.
    Wake,
}

pub(super) struct Listener {
    handle: EqHandle,
    signals: flume::Sender<Signal>,
}

type PeerSlot = Arc<Mutex<Option<Arc<Side>>>>;

pub(super) struct Inbound {
    client: Arc<Side>,
    peer_slot: PeerSlot,
    private_data: Vec<u8>,
}

struct PostedRecv {
    wr_id: u64,
    mem: SharedMem,
    len: usize,
}

/// A send waiting for the peer to post a receive.
struct InFlight {
    data: Vec<u8>,
    wr_id: u64,
    origin: Arc<Side>,
}

struct SideState {
    open: bool,
    recvs: VecDeque<PostedRecv>,
    backlog: VecDeque<InFlight>,
}

/// One end of a loopback connection.
pub(super) struct Side {
    handle: EqHandle,
    signals: flume::Sender<Signal>,
    cq: cb::Sender<WorkCompletion>,
    state: Mutex<SideState>,
}

impl Side {
    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn complete(&self, wr_id: u64, status: i32, byte_len: usize) {
        let Some(wc) = WorkCompletion::from_wr_id(wr_id, status, byte_len as u32) else {
            tracing::warn!(wr_id, "dropping completion with foreign wr_id");
            return;
        };
        if self.cq.send(wc).is_ok() {
            let _ = self.signals.send(Signal::Wake);
        }
    }

    fn notify(&self, event: CmEvent) {
        let _ = self.signals.send(Signal::Event(event));
    }
}

/// Copy a send into a posted receive and complete both sides.
fn deliver(recv: PostedRecv, msg: InFlight, receiver: &Side) {
    let len = msg.data.len();
    if len > recv.len {
        receiver.complete(recv.wr_id, STATUS_LENGTH, 0);
        msg.origin.complete(msg.wr_id, STATUS_LENGTH, 0);
        return;
    }
    copy_in(&mut recv.mem.lock(), 0, &msg.data);
    receiver.complete(recv.wr_id, 0, len);
    msg.origin.complete(msg.wr_id, 0, len);
}

pub struct LoopbackEndpoint {
    hub: Arc<Hub>,
    local: Arc<Side>,
    peer: PeerSlot,
}

impl LoopbackEndpoint {
    fn peer(&self) -> Option<Arc<Side>> {
        self.peer.lock().clone()
    }
}

impl Endpoint for LoopbackEndpoint {
    fn post_recv(&mut self, wr_id: u64, region: &dyn MemoryRegion) -> Result<()> {
        let mem = self
            .hub
            .regions
            .get(&region.lkey())
            .map(|entry| entry.value().1.clone())
            .ok_or_else(|| Error::not_found("registration", region.lkey()))?;
        let recv = PostedRecv {
            wr_id,
            mem,
            len: region.len(),
        };

        let mut state = self.local.state.lock();
        if !state.open {
            return Err(Error::transport("endpoint closed"));
        }
        match state.backlog.pop_front() {
            Some(msg) => {
                drop(state);
                deliver(recv, msg, &self.local);
            }
            None => state.recvs.push_back(recv),
        }
        Ok(())
    }

    fn post_send(&mut self, wr_id: u64, region: &dyn MemoryRegion, len: usize) -> Result<()> {
        if !self.local.is_open() {
            return Err(Error::transport("endpoint closed"));
        }
        let mut data = vec![0u8; len.min(region.len())];
        region.read_at(0, &mut data);

        let Some(peer) = self.peer() else {
            self.local.complete(wr_id, STATUS_NOT_CONNECTED, 0);
            return Ok(());
        };
        let msg = InFlight {
            data,
            wr_id,
            origin: self.local.clone(),
        };
        let mut state = peer.state.lock();
        if !state.open {
            drop(state);
            self.local.complete(wr_id, STATUS_NOT_CONNECTED, 0);
            return Ok(());
        }
        match state.recvs.pop_front() {
            Some(recv) => {
                drop(state);
                deliver(recv, msg, &peer);
            }
            None => state.backlog.push_back(msg),
        }
        Ok(())
    }

    fn post_read(
        &mut self,
        wr_id: u64,
        local: &dyn MemoryRegion,
        offset: usize,
        remote: RemoteBuf,
    ) -> Result<()> {
        if !self.local.is_open() {
            return Err(Error::transport("endpoint closed"));
        }
        if !self.peer().is_some_and(|p| p.is_open()) {
            self.local.complete(wr_id, STATUS_NOT_CONNECTED, 0);
            return Ok(());
        }
        let Some((src, src_offset)) = self.hub.resolve(remote.rkey(), remote.addr(), remote.len())
        else {
            self.local.complete(wr_id, STATUS_REMOTE_ACCESS, 0);
            return Ok(());
        };

        let mut buf = vec![0u8; remote.len() as usize];
        let n = copy_out(&src.lock(), src_offset, &mut buf);
        let written = local.write_at(offset, &buf[..n]);
        self.local.complete(wr_id, 0, written);
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        let backlog = {
            let mut state = self.local.state.lock();
            if !state.open {
                return Ok(());
            }
            state.open = false;
            state.recvs.clear();
            std::mem::take(&mut state.backlog)
        };
        for msg in backlog {
            msg.origin.complete(msg.wr_id, STATUS_NOT_CONNECTED, 0);
        }
        let peer = self.peer.lock().take();
        if let Some(peer) = peer.filter(|p| p.is_open()) {
            peer.notify(CmEvent::new(peer.handle, CmEventKind::Disconnected));
        }
        tracing::trace!(handle = %self.local.handle, "loopback endpoint closed");
        Ok(())
    }
}

impl Drop for LoopbackEndpoint {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Event channel of the loopback fabric.
pub struct LoopbackChannel {
    hub: Arc<Hub>,
    addr: SocketAddr,
    role: Role,
    signals_tx: flume::Sender<Signal>,
    signals_rx: flume::Receiver<Signal>,
    cq_tx: cb::Sender<WorkCompletion>,
    cq_rx: cb::Receiver<WorkCompletion>,
    pending: FxHashMap<u64, Inbound>,
    listener: Option<EqHandle>,
    backlog: usize,
}

impl LoopbackChannel {
    pub(super) fn new(hub: Arc<Hub>, addr: SocketAddr, role: Role) -> Self {
        let (signals_tx, signals_rx) = flume::unbounded();
        let (cq_tx, cq_rx) = cb::unbounded();
        Self {
            hub,
            addr,
            role,
            signals_tx,
            signals_rx,
            cq_tx,
            cq_rx,
            pending: FxHashMap::default(),
            listener: None,
            backlog: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn side(&self, handle: EqHandle) -> Arc<Side> {
        Arc::new(Side {
            handle,
            signals: self.signals_tx.clone(),
            cq: self.cq_tx.clone(),
            state: Mutex::new(SideState {
                open: true,
                recvs: VecDeque::new(),
                backlog: VecDeque::new(),
            }),
        })
    }

    fn refuse(inbound: &Inbound) {
        inbound.client.notify(
            CmEvent::new(inbound.client.handle, CmEventKind::Rejected).with_status(STATUS_REFUSED),
        );
    }
}

impl EventChannel for LoopbackChannel {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn listen(&mut self, backlog: i32) -> Result<EqHandle> {
        if let Some(handle) = self.listener {
            return Ok(handle);
        }
        let handle = self.hub.next_handle();
        match self.hub.listeners.entry(self.addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::transport(format!("address {} in use", self.addr)));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Listener {
                    handle,
                    signals: self.signals_tx.clone(),
                });
            }
        }
        self.listener = Some(handle);
        self.backlog = backlog.max(1) as usize;
        Ok(handle)
    }

    fn connect(&mut self, handshake: &Handshake) -> Result<(EqHandle, Box<dyn Endpoint>)> {
        let handle = self.hub.next_handle();
        let side = self.side(handle);
        let peer_slot: PeerSlot = Arc::new(Mutex::new(None));
        let inbound = Inbound {
            client: side.clone(),
            peer_slot: peer_slot.clone(),
            private_data: handshake.encode(),
        };

        let target = self
            .hub
            .listeners
            .get(&self.addr)
            .map(|l| l.signals.clone());
        let delivered = match target {
            Some(signals) => signals.send(Signal::Request(inbound)).is_ok(),
            None => false,
        };
        if !delivered {
            tracing::debug!(addr = %self.addr, %handle, "no listener, refusing");
            side.notify(CmEvent::new(handle, CmEventKind::Rejected).with_status(STATUS_REFUSED));
        }

        let endpoint = LoopbackEndpoint {
            hub: self.hub.clone(),
            local: side,
            peer: peer_slot,
        };
        Ok((handle, Box::new(endpoint)))
    }

    fn accept(
        &mut self,
        request: &ConnectRequest,
        handshake: &Handshake,
    ) -> Result<(EqHandle, Box<dyn Endpoint>)> {
        let inbound = self
            .pending
            .remove(&request.token())
            .ok_or_else(|| Error::not_found("request", request.token()))?;
        if !inbound.client.is_open() {
            return Err(Error::transport("initiator closed before accept"));
        }

        let handle = self.hub.next_handle();
        let side = self.side(handle);
        *inbound.peer_slot.lock() = Some(side.clone());

        // Private data travels encoded in both directions.
        inbound.client.notify(
            CmEvent::new(inbound.client.handle, CmEventKind::Connected)
                .with_peer(Handshake::decode(&handshake.encode())),
        );
        side.notify(
            CmEvent::new(handle, CmEventKind::Connected)
                .with_peer(Handshake::decode(&inbound.private_data)),
        );

        let endpoint = LoopbackEndpoint {
            hub: self.hub.clone(),
            local: side,
            peer: Arc::new(Mutex::new(Some(inbound.client))),
        };
        Ok((handle, Box::new(endpoint)))
    }

    fn reject(&mut self, request: &ConnectRequest) -> Result<()> {
        let inbound = self
            .pending
            .remove(&request.token())
            .ok_or_else(|| Error::not_found("request", request.token()))?;
        Self::refuse(&inbound);
        Ok(())
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<CmEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let signal = match self.signals_rx.recv_deadline(deadline) {
                Ok(signal) => signal,
                Err(flume::RecvTimeoutError::Timeout) => return Ok(None),
                Err(flume::RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            };
            match signal {
                Signal::Event(event) => return Ok(Some(event)),
                Signal::Wake => return Ok(None),
                Signal::Request(inbound) => {
                    if self.listener.is_none() || self.pending.len() >= self.backlog {
                        Self::refuse(&inbound);
                        continue;
                    }
                    let token = self.hub.next_token();
                    let handle = self.hub.next_handle();
                    let handshake = Handshake::decode(&inbound.private_data);
                    self.pending.insert(token, inbound);
                    let request = ConnectRequest::new(token, handshake);
                    return Ok(Some(
                        CmEvent::new(handle, CmEventKind::ConnectRequest).with_request(request),
                    ));
                }
            }
        }
    }

    fn poll_completions(&mut self, out: &mut Vec<WorkCompletion>) -> usize {
        let before = out.len();
        out.extend(self.cq_rx.try_iter());
        out.len() - before
    }
}

impl Drop for LoopbackChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.listener {
            self.hub
                .listeners
                .remove_if(&self.addr, |_, l| l.handle == handle);
        }
        for (_, inbound) in self.pending.drain() {
            Self::refuse(&inbound);
        }
    }
}

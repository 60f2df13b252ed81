use super::context::RdmaContext;
use crate::error::{Error, IntoTransportError, Result};
use crate::memory::RemoteBuf;
use crate::transport::protocol::Handshake;
use crate::transport::{
    CmEvent, CmEventKind, ConnectRequest, Endpoint, EqHandle, EventChannel, MemoryRegion, Role,
    WorkCompletion,
};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sideway::ibverbs::completion::{
    GenericCompletionQueue, PollCompletionQueueError, WorkCompletionStatus,
};
use sideway::ibverbs::queue_pair::{
    GenericQueuePair, PostSendGuard as _, QueuePair, QueuePairState, SetScatterGatherEntry,
    WorkRequestFlags,
};
use sideway::rdmacm::communication_manager::{
    ConnectionParameter, Event, EventChannel as CmChannel, EventType, Identifier, PortSpace,
};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Private data limits of the rdma-cm TCP port space.
const CONNECT_PRIVATE_DATA: usize = 56;
const ACCEPT_PRIVATE_DATA: usize = 196;

// Negative errno values reported for failed connection attempts.
const STATUS_REFUSED: i32 = -111;
const STATUS_UNREACHABLE: i32 = -113;
const STATUS_ADDR_NOT_AVAIL: i32 = -99;
const STATUS_ABORTED: i32 = -103;

/// What the CM thread keeps of an event. The event itself is acknowledged
/// on that thread so destroying an identifier never waits on the queue.
struct CmMessage {
    kind: EventType,
    id: Option<Arc<Identifier>>,
    private_data: Vec<u8>,
}

// SAFETY: identifiers are reference-counted rdma-cm objects whose calls are
// thread-safe; the message only moves them between threads.
unsafe impl Send for CmMessage {}

fn private_data(event: &Event) -> Vec<u8> {
    event.private_data().map(<[u8]>::to_vec).unwrap_or_default()
}

fn run_cm_loop(cm: Arc<CmChannel>, tx: flume::Sender<Result<CmMessage>>) {
    loop {
        let event = match cm.get_cm_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "get_cm_event failed");
                let _ = tx.send(Err(Error::transport(e)));
                return;
            }
        };
        let msg = CmMessage {
            kind: event.event_type(),
            id: event.cm_id(),
            private_data: private_data(&event),
        };
        drop(event);
        if tx.send(Ok(msg)).is_err() {
            return;
        }
    }
}

/// Encode `handshake`, dropping trailing send ids that do not fit in `limit`.
fn fit_private_data(handshake: &Handshake, limit: usize) -> Vec<u8> {
    if handshake.encoded_len() <= limit {
        return handshake.encode();
    }
    let fit = (limit - crate::transport::protocol::HANDSHAKE_HEADER_LEN) / 4;
    tracing::debug!(
        ids = handshake.send_ids.len(),
        fit,
        "handshake truncated to private data limit"
    );
    Handshake::new(
        handshake.slot_size,
        handshake.recv_slots,
        handshake.send_ids[..fit].to_vec(),
    )
    .encode()
}

fn key(id: &Arc<Identifier>) -> usize {
    Arc::as_ptr(id) as usize
}

#[derive(Clone, Copy)]
struct Sge {
    wr_id: u64,
    lkey: u32,
    addr: u64,
    len: u32,
}

fn post_recv_wr(qp: &mut GenericQueuePair, sge: Sge) -> Result<()> {
    let mut guard = qp.start_post_recv();
    // SAFETY: the region behind `sge` outlives the posted receive; chunks
    // are only released after their connection is torn down.
    unsafe {
        guard.construct_wr(sge.wr_id).setup_sge(sge.lkey, sge.addr, sge.len);
    }
    guard.post().transport_err()
}

fn modify(qp: &mut GenericQueuePair, id: &Identifier, state: QueuePairState) -> Result<()> {
    let attr = id.get_qp_attr(state).transport_err()?;
    qp.modify(&attr).transport_err()
}

struct LinkState {
    handle: EqHandle,
    id: Option<Arc<Identifier>>,
    qp: Option<GenericQueuePair>,
    /// Receives posted before the queue pair exists.
    deferred: Vec<Sge>,
    private_data: Vec<u8>,
    peer: Option<Handshake>,
    established: bool,
}

// SAFETY: the queue pair and identifier are only touched under the link's
// mutex.
unsafe impl Send for LinkState {}

type SharedLink = Arc<Mutex<LinkState>>;

impl LinkState {
    fn new(handle: EqHandle, id: Arc<Identifier>) -> Self {
        Self {
            handle,
            id: Some(id),
            qp: None,
            deferred: Vec::new(),
            private_data: Vec::new(),
            peer: None,
            established: false,
        }
    }
}

/// One reliable connection. Dropping it destroys the queue pair and the
/// identifier, which disconnects the peer.
pub struct RdmaEndpoint {
    link: SharedLink,
}

impl Endpoint for RdmaEndpoint {
    fn post_recv(&mut self, wr_id: u64, region: &dyn MemoryRegion) -> Result<()> {
        let sge = Sge {
            wr_id,
            lkey: region.lkey(),
            addr: region.addr(),
            len: region.len() as u32,
        };
        let mut link = self.link.lock();
        let link = &mut *link;
        match link.qp.as_mut() {
            Some(qp) => post_recv_wr(qp, sge),
            None if link.id.is_some() => {
                link.deferred.push(sge);
                Ok(())
            }
            None => Err(Error::transport("endpoint closed")),
        }
    }

    fn post_send(&mut self, wr_id: u64, region: &dyn MemoryRegion, len: usize) -> Result<()> {
        let mut link = self.link.lock();
        let qp = link
            .qp
            .as_mut()
            .ok_or_else(|| Error::transport("queue pair not ready"))?;
        let mut guard = qp.start_post_send();
        let wr = guard
            .construct_wr(wr_id, WorkRequestFlags::Signaled)
            .setup_send();
        // SAFETY: the send chunk stays out of the free set until its
        // completion is drained.
        unsafe {
            wr.setup_sge(region.lkey(), region.addr(), len.min(region.len()) as u32);
        }
        guard.post().transport_err()
    }

    fn post_read(
        &mut self,
        wr_id: u64,
        local: &dyn MemoryRegion,
        offset: usize,
        remote: RemoteBuf,
    ) -> Result<()> {
        let mut link = self.link.lock();
        let qp = link
            .qp
            .as_mut()
            .ok_or_else(|| Error::transport("queue pair not ready"))?;
        let mut guard = qp.start_post_send();
        let wr = guard
            .construct_wr(wr_id, WorkRequestFlags::Signaled)
            .setup_read(remote.rkey(), remote.addr());
        // SAFETY: bounds were checked against `local` by the caller.
        unsafe {
            wr.setup_sge(local.lkey(), local.addr() + offset as u64, remote.len() as u32);
        }
        guard.post().transport_err()
    }

    fn shutdown(&mut self) -> Result<()> {
        let (qp, id, handle) = {
            let mut link = self.link.lock();
            link.deferred.clear();
            (link.qp.take(), link.id.take(), link.handle)
        };
        if id.is_none() {
            return Ok(());
        }
        // Queue pair first; the identifier must outlive it.
        drop(qp);
        drop(id);
        tracing::debug!(%handle, "rdma endpoint closed");
        Ok(())
    }
}

impl Drop for RdmaEndpoint {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Accepted request whose queue pair waits for its receives before the
/// accept goes out.
struct AcceptPending {
    id: Arc<Identifier>,
    link: Weak<Mutex<LinkState>>,
    private_data: Vec<u8>,
}

/// Event channel of the rdma fabric: one rdma-cm event channel, served by a
/// background thread, and one completion queue shared by every queue pair
/// created through it.
pub struct RdmaChannel {
    context: Arc<RdmaContext>,
    addr: SocketAddr,
    role: Role,
    cm: Arc<CmChannel>,
    events: flume::Receiver<Result<CmMessage>>,
    cq: GenericCompletionQueue,
    queue_depth: u32,
    listener: Option<(EqHandle, Arc<Identifier>)>,
    backlog: usize,
    links: FxHashMap<usize, Weak<Mutex<LinkState>>>,
    pending: FxHashMap<u64, Arc<Identifier>>,
    accepting: Vec<AcceptPending>,
    next_handle: u64,
    next_token: u64,
}

// SAFETY: the channel is driven by one worker thread at a time; the CM
// thread only shares the event channel, whose calls are thread-safe.
unsafe impl Send for RdmaChannel {}

impl RdmaChannel {
    pub(super) fn new(
        context: Arc<RdmaContext>,
        addr: SocketAddr,
        role: Role,
        queue_depth: u32,
    ) -> Result<Self> {
        let cm = CmChannel::new().transport_err()?;
        let cq = context.create_cq(queue_depth.saturating_mul(4))?;
        let (tx, rx) = flume::unbounded();
        let thread_cm = cm.clone();
        std::thread::Builder::new()
            .name(format!("rdma-cm-{addr}"))
            .spawn(move || run_cm_loop(thread_cm, tx))?;
        Ok(Self {
            context,
            addr,
            role,
            cm,
            events: rx,
            cq,
            queue_depth,
            listener: None,
            backlog: 0,
            links: FxHashMap::default(),
            pending: FxHashMap::default(),
            accepting: Vec::new(),
            next_handle: 1,
            next_token: 1,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn next_handle(&mut self) -> EqHandle {
        let handle = EqHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn link(&mut self, id: &Arc<Identifier>) -> Option<SharedLink> {
        let k = key(id);
        let link = self.links.get(&k).and_then(Weak::upgrade);
        if link.is_none() {
            self.links.remove(&k);
        }
        link
    }

    /// Send the accepts whose receives have been posted by now.
    fn flush_accepts(&mut self) {
        for pending in std::mem::take(&mut self.accepting) {
            let Some(link) = pending.link.upgrade() else {
                continue;
            };
            let mut state = link.lock();
            let handle = state.handle;
            let res = (|| -> Result<()> {
                let qp = state
                    .qp
                    .as_mut()
                    .ok_or_else(|| Error::transport("endpoint closed"))?;
                modify(qp, &pending.id, QueuePairState::ReadyToReceive)?;
                modify(qp, &pending.id, QueuePairState::ReadyToSend)?;
                let mut param = ConnectionParameter::new();
                param.setup_qp_number(qp.qp_number());
                param.setup_private_data(&pending.private_data);
                pending.id.accept(param).transport_err()
            })();
            if let Err(e) = res {
                tracing::warn!(%handle, error = %e, "accept failed");
            }
        }
    }

    fn on_connect_request(&mut self, msg: CmMessage) -> Option<CmEvent> {
        let id = msg.id?;
        if self.listener.is_none() || self.pending.len() >= self.backlog {
            // Destroying the identifier refuses the request.
            tracing::debug!(addr = %self.addr, "refusing connect request");
            return None;
        }
        let token = self.next_token;
        self.next_token += 1;
        let handle = self.next_handle();
        self.pending.insert(token, id);
        let request = ConnectRequest::new(token, Handshake::decode(&msg.private_data));
        Some(CmEvent::new(handle, CmEventKind::ConnectRequest).with_request(request))
    }

    fn on_route_resolved(&self, id: &Identifier, link: &SharedLink) -> Result<()> {
        let mut qp = self
            .context
            .create_qp(&self.cq, self.queue_depth, self.queue_depth)?;
        modify(&mut qp, id, QueuePairState::Init)?;

        let mut state = link.lock();
        for sge in state.deferred.drain(..) {
            post_recv_wr(&mut qp, sge)?;
        }
        let mut param = ConnectionParameter::new();
        param.setup_qp_number(qp.qp_number());
        param.setup_private_data(&state.private_data);
        state.qp = Some(qp);
        id.connect(param).transport_err()
    }

    fn on_connect_response(
        &self,
        id: &Identifier,
        link: &SharedLink,
        private_data: &[u8],
    ) -> Result<CmEvent> {
        let mut state = link.lock();
        let qp = state
            .qp
            .as_mut()
            .ok_or_else(|| Error::transport("connect response before route resolution"))?;
        modify(qp, id, QueuePairState::ReadyToReceive)?;
        modify(qp, id, QueuePairState::ReadyToSend)?;
        id.establish().transport_err()?;
        state.established = true;
        Ok(CmEvent::new(state.handle, CmEventKind::Connected)
            .with_peer(Handshake::decode(private_data)))
    }

    fn on_message(&mut self, msg: CmMessage) -> Option<CmEvent> {
        if matches!(msg.kind, EventType::ConnectRequest) {
            return self.on_connect_request(msg);
        }
        let id = msg.id.clone()?;
        let Some(link) = self.link(&id) else {
            tracing::trace!(kind = ?msg.kind, "event for closed endpoint");
            return None;
        };
        let handle = link.lock().handle;
        let failed =
            |status: i32| Some(CmEvent::new(handle, CmEventKind::Rejected).with_status(status));

        let res = match msg.kind {
            EventType::AddressResolved => id
                .resolve_route(RESOLVE_TIMEOUT)
                .transport_err()
                .map(|_| None),
            EventType::RouteResolved => self.on_route_resolved(&id, &link).map(|_| None),
            EventType::ConnectResponse => self
                .on_connect_response(&id, &link, &msg.private_data)
                .map(Some),
            EventType::Established => {
                let mut state = link.lock();
                if state.established {
                    Ok(None)
                } else {
                    state.established = true;
                    let peer = state.peer.take();
                    Ok(Some(CmEvent::new(handle, CmEventKind::Connected).with_peer(peer)))
                }
            }
            EventType::Rejected => Ok(failed(STATUS_REFUSED)),
            EventType::Unreachable => Ok(failed(STATUS_UNREACHABLE)),
            EventType::AddressError | EventType::RouteError => Ok(failed(STATUS_ADDR_NOT_AVAIL)),
            EventType::ConnectError => Ok(Some(
                CmEvent::new(handle, CmEventKind::Error).with_status(STATUS_ABORTED),
            )),
            EventType::Disconnected => Ok(Some(CmEvent::new(handle, CmEventKind::Disconnected))),
            kind => {
                tracing::trace!(%handle, ?kind, "ignoring cm event");
                Ok(None)
            }
        };
        match res {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%handle, kind = ?msg.kind, error = %e, "cm event handling failed");
                Some(CmEvent::new(handle, CmEventKind::Error).with_status(e.status_code()))
            }
        }
    }
}

impl EventChannel for RdmaChannel {
    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn listen(&mut self, backlog: i32) -> Result<EqHandle> {
        if let Some((handle, _)) = &self.listener {
            return Ok(*handle);
        }
        let id = self.cm.create_id(PortSpace::Tcp).transport_err()?;
        id.bind_addr(self.addr).transport_err()?;
        id.listen(backlog).transport_err()?;
        let handle = self.next_handle();
        self.listener = Some((handle, id));
        self.backlog = backlog.max(1) as usize;
        Ok(handle)
    }

    fn connect(&mut self, handshake: &Handshake) -> Result<(EqHandle, Box<dyn Endpoint>)> {
        let id = self.cm.create_id(PortSpace::Tcp).transport_err()?;
        id.resolve_addr(None, self.addr, RESOLVE_TIMEOUT)
            .transport_err()?;
        let handle = self.next_handle();
        let mut state = LinkState::new(handle, id.clone());
        state.private_data = fit_private_data(handshake, CONNECT_PRIVATE_DATA);
        let link = Arc::new(Mutex::new(state));
        self.links.insert(key(&id), Arc::downgrade(&link));
        tracing::debug!(%handle, addr = %self.addr, "resolving address");
        Ok((handle, Box::new(RdmaEndpoint { link })))
    }

    fn accept(
        &mut self,
        request: &ConnectRequest,
        handshake: &Handshake,
    ) -> Result<(EqHandle, Box<dyn Endpoint>)> {
        let id = self
            .pending
            .remove(&request.token())
            .ok_or_else(|| Error::not_found("request", request.token()))?;
        let mut qp = self
            .context
            .create_qp(&self.cq, self.queue_depth, self.queue_depth)?;
        modify(&mut qp, &id, QueuePairState::Init)?;

        let handle = self.next_handle();
        let mut state = LinkState::new(handle, id.clone());
        state.qp = Some(qp);
        state.peer = request.handshake().cloned();
        let link = Arc::new(Mutex::new(state));
        self.links.insert(key(&id), Arc::downgrade(&link));
        self.accepting.push(AcceptPending {
            id,
            link: Arc::downgrade(&link),
            private_data: fit_private_data(handshake, ACCEPT_PRIVATE_DATA),
        });
        Ok((handle, Box::new(RdmaEndpoint { link })))
    }

    fn reject(&mut self, request: &ConnectRequest) -> Result<()> {
        // Destroying a request's identifier sends the reject.
        self.pending
            .remove(&request.token())
            .map(drop)
            .ok_or_else(|| Error::not_found("request", request.token()))
    }

    fn wait_event(&mut self, timeout: Duration) -> Result<Option<CmEvent>> {
        self.flush_accepts();
        let deadline = Instant::now() + timeout;
        loop {
            let msg = match self.events.recv_deadline(deadline) {
                Ok(msg) => msg?,
                Err(flume::RecvTimeoutError::Timeout) => return Ok(None),
                Err(flume::RecvTimeoutError::Disconnected) => return Err(Error::Closed),
            };
            if let Some(event) = self.on_message(msg) {
                return Ok(Some(event));
            }
        }
    }

    fn poll_completions(&mut self, out: &mut Vec<WorkCompletion>) -> usize {
        let before = out.len();
        match self.cq.start_poll() {
            Ok(poller) => {
                for wc in poller {
                    let raw = wc.status();
                    let status = if raw == WorkCompletionStatus::Success as u32 {
                        0
                    } else {
                        -(raw as i32)
                    };
                    match WorkCompletion::from_wr_id(wc.wr_id(), status, wc.byte_len()) {
                        Some(c) => out.push(c),
                        None => tracing::warn!(wr_id = wc.wr_id(), "completion with foreign wr_id"),
                    }
                }
            }
            Err(PollCompletionQueueError::CompletionQueueEmpty) => {}
            Err(e) => tracing::error!(error = ?e, "failed to start cq poll"),
        }
        out.len() - before
    }
}

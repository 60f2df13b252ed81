//! Event-queue service: one event channel, the connections it owns, and the
//! poll loop that drives their state machines.

mod event;
mod sink;

pub use event::EventKind;
pub use sink::{EventSink, NoopSink};

use crate::config::ServiceConfig;
use crate::connection::{ConnStatus, Connection, ConnectionRef, RefContext};
use crate::error::{Error, Result};
use crate::memory::BufferPool;
use crate::service::callback::{CallbackContext, Callbacks};
use crate::transport::protocol::{Handshake, WrOp};
use crate::transport::{
    CmEvent, CmEventKind, Endpoint, EqHandle, EventChannel, Fabric, Role, WorkCompletion,
};
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Requests forwarded to the worker that owns an event queue.
pub(crate) enum Command {
    Shutdown(EqHandle),
    Connect(flume::Sender<Result<ConnectionRef>>),
    Accept(EqHandle, flume::Sender<Result<ConnectionRef>>),
    Reject(EqHandle, flume::Sender<Result<()>>),
}

/// State shared by every event queue of one service.
#[derive(Clone)]
pub struct EqShared {
    pub callbacks: Arc<RwLock<Callbacks>>,
    pub sink: Arc<dyn EventSink>,
    /// RMA buffers keyed by caller-chosen id.
    pub rma_pool: Arc<Mutex<BufferPool>>,
}

impl EqShared {
    pub fn new() -> Self {
        Self {
            callbacks: Arc::new(RwLock::new(Callbacks::default())),
            sink: Arc::new(NoopSink),
            rma_pool: Arc::new(Mutex::new(BufferPool::new())),
        }
    }

    pub fn with_callbacks(self, callbacks: Callbacks) -> Self {
        *self.callbacks.write() = callbacks;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }
}

impl Default for EqShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns one event channel and every connection created through it.
///
/// All methods run on one thread. Dropping the service forces every owned
/// connection down.
pub struct EqService {
    role: Role,
    fabric: Arc<dyn Fabric>,
    channel: Box<dyn EventChannel>,
    config: ServiceConfig,
    shared: EqShared,
    connections: FxHashMap<EqHandle, Connection>,
    send_pool: Arc<Mutex<BufferPool>>,
    recv_pool: BufferPool,
    ref_ctx: RefContext,
    listener: Option<EqHandle>,
    commands: flume::Receiver<Command>,
    completions: Vec<WorkCompletion>,
    /// Completions that arrived before their connection was connected.
    early: Vec<WorkCompletion>,
    scratch: Vec<u8>,
    closed: bool,
}

impl EqService {
    pub fn new(
        fabric: Arc<dyn Fabric>,
        role: Role,
        config: ServiceConfig,
        shared: EqShared,
    ) -> Result<Self> {
        config.validate()?;
        let channel = fabric.open(config.addr, role)?;
        let send_pool = Arc::new(Mutex::new(BufferPool::with_capacity(config.pool_capacity)));
        let (tx, rx) = flume::unbounded();
        let ref_ctx = RefContext {
            slot_size: config.buffer_size,
            send_pool: send_pool.clone(),
            rma_pool: shared.rma_pool.clone(),
            commands: tx,
        };
        tracing::debug!(
            addr = %config.addr,
            ?role,
            fabric = fabric.name(),
            "event queue opened"
        );
        Ok(Self {
            role,
            fabric,
            channel,
            recv_pool: BufferPool::with_capacity(config.pool_capacity),
            config,
            shared,
            connections: FxHashMap::default(),
            send_pool,
            ref_ctx,
            listener: None,
            commands: rx,
            completions: Vec::with_capacity(64),
            early: Vec::new(),
            scratch: Vec::new(),
            closed: false,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    pub fn listener(&self) -> Option<EqHandle> {
        self.listener
    }

    pub(crate) fn command_sender(&self) -> flume::Sender<Command> {
        self.ref_ctx.commands.clone()
    }

    /// Start accepting inbound connection attempts.
    pub fn listen(&mut self) -> Result<EqHandle> {
        if let Some(handle) = self.listener {
            return Ok(handle);
        }
        let handle = self.channel.listen(self.config.backlog)?;
        self.listener = Some(handle);
        tracing::info!(addr = %self.channel.local_addr(), %handle, "listening");
        Ok(handle)
    }

    /// Initiate an outbound connection. The returned connection is in
    /// `ConnectRequested` until the fabric reports it connected.
    pub fn connect(&mut self) -> Result<ConnectionRef> {
        let (send_ids, recv_ids) = self.acquire_chunks()?;
        let handshake = self.handshake(&send_ids);
        let (handle, endpoint) = match self.channel.connect(&handshake) {
            Ok(pair) => pair,
            Err(e) => {
                self.release_chunks(&send_ids, &recv_ids);
                return Err(e);
            }
        };

        let mut conn = Connection::new(handle, ConnStatus::Init);
        if let Err(e) = self.bind_and_post(&mut conn, endpoint, send_ids, recv_ids) {
            self.discard(conn);
            return Err(e);
        }
        conn.advance(ConnStatus::ConnectRequested);
        tracing::debug!(%handle, addr = %self.config.addr, "connect requested");

        let conn_ref = conn.to_ref(&self.ref_ctx);
        self.connections.insert(handle, conn);
        Ok(conn_ref)
    }

    /// Accept the pending inbound attempt identified by `handle`.
    ///
    /// The connection moves to the new handle the fabric hands out and stays
    /// in `AcceptPending` until the fabric reports it connected.
    pub fn accept(&mut self, handle: EqHandle) -> Result<ConnectionRef> {
        let mut conn = self
            .connections
            .remove(&handle)
            .ok_or_else(|| Error::not_found("connection", handle))?;
        let request = match (conn.status(), conn.take_request()) {
            (ConnStatus::AcceptPending, Some(request)) => request,
            (status, _) => {
                self.connections.insert(handle, conn);
                return Err(Error::InvalidState {
                    op: "accept",
                    status,
                });
            }
        };

        let (send_ids, recv_ids) = match self.acquire_chunks() {
            Ok(ids) => ids,
            Err(e) => {
                if let Err(reject) = self.channel.reject(&request) {
                    tracing::warn!(%handle, error = %reject, "reject failed");
                }
                self.retire(conn, EventKind::Rejected, e.status_code());
                return Err(e);
            }
        };
        let handshake = self.handshake(&send_ids);
        let (new_handle, endpoint) = match self.channel.accept(&request, &handshake) {
            Ok(pair) => pair,
            Err(e) => {
                self.release_chunks(&send_ids, &recv_ids);
                self.retire(conn, EventKind::Error, e.status_code());
                return Err(e);
            }
        };

        conn.set_handle(new_handle);
        if let Err(e) = self.bind_and_post(&mut conn, endpoint, send_ids, recv_ids) {
            self.retire(conn, EventKind::Error, e.status_code());
            return Err(e);
        }
        tracing::debug!(request = %handle, handle = %new_handle, "accepted");

        let conn_ref = conn.to_ref(&self.ref_ctx);
        self.connections.insert(new_handle, conn);
        Ok(conn_ref)
    }

    /// Refuse the pending inbound attempt identified by `handle`.
    pub fn reject(&mut self, handle: EqHandle) -> Result<()> {
        let mut conn = self
            .connections
            .remove(&handle)
            .ok_or_else(|| Error::not_found("connection", handle))?;
        let Some(request) = conn.take_request() else {
            let status = conn.status();
            self.connections.insert(handle, conn);
            return Err(Error::InvalidState {
                op: "reject",
                status,
            });
        };
        let res = self.channel.reject(&request);
        self.retire(conn, EventKind::Rejected, 0);
        res
    }

    pub fn get_connection(&self, handle: EqHandle) -> Result<ConnectionRef> {
        self.connections
            .get(&handle)
            .map(|conn| conn.to_ref(&self.ref_ctx))
            .ok_or_else(|| Error::not_found("connection", handle))
    }

    pub fn connection(&self, handle: EqHandle) -> Option<&Connection> {
        self.connections.get(&handle)
    }

    pub fn handles(&self) -> Vec<EqHandle> {
        self.connections.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Deregister a connection, forcing it down first if needed.
    pub fn reap(&mut self, handle: EqHandle) -> Result<()> {
        let conn = self
            .connections
            .remove(&handle)
            .ok_or_else(|| Error::not_found("connection", handle))?;
        self.retire(conn, EventKind::Shutdown, 0);
        Ok(())
    }

    /// Tear a connection down. Unknown or already reaped handles are a no-op.
    pub fn shutdown(&mut self, handle: EqHandle) -> Result<()> {
        match self.reap(handle) {
            Err(Error::NotFound { .. }) => Ok(()),
            res => res,
        }
    }

    /// Wait up to `timeout` for one connection event, apply it, and drain
    /// ready completions. Returns what the event was.
    pub fn poll(&mut self, timeout: Duration) -> Result<EventKind> {
        self.process_commands();
        let wait = if self.drain_completions() > 0 {
            Duration::ZERO
        } else {
            timeout
        };

        let kind = match self.channel.wait_event(wait) {
            Ok(Some(event)) => self.dispatch(event),
            Ok(None) => EventKind::None,
            Err(e) => {
                tracing::warn!(error = %e, "event channel wait failed");
                self.drain_completions();
                return Err(e);
            }
        };
        self.drain_completions();
        Ok(kind)
    }

    /// Run every queued command.
    pub fn process_commands(&mut self) -> usize {
        let mut n = 0;
        while let Ok(cmd) = self.commands.try_recv() {
            n += 1;
            match cmd {
                Command::Shutdown(handle) => {
                    if let Err(e) = self.shutdown(handle) {
                        tracing::warn!(%handle, error = %e, "shutdown failed");
                    }
                }
                Command::Connect(reply) => {
                    // Nobody holds the connection if the requester gave up.
                    if let Err(flume::SendError(res)) = reply.send(self.connect()) {
                        tracing::debug!("connect requester gone");
                        if let Ok(conn) = res {
                            let _ = self.shutdown(conn.handle());
                        }
                    }
                }
                Command::Accept(handle, reply) => {
                    if reply.send(self.accept(handle)).is_err() {
                        tracing::debug!(request = %handle, "accept requester gone");
                    }
                }
                Command::Reject(handle, reply) => {
                    if reply.send(self.reject(handle)).is_err() {
                        tracing::debug!(request = %handle, "reject requester gone");
                    }
                }
            }
        }
        n
    }

    /// Handle every ready work completion; returns how many there were.
    pub fn drain_completions(&mut self) -> usize {
        let mut completions = std::mem::take(&mut self.completions);
        completions.clear();
        let n = self.channel.poll_completions(&mut completions);
        for wc in completions.drain(..) {
            self.on_completion(wc);
        }
        self.completions = completions;
        n
    }

    /// Force every connection down and deregister it.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let handles: Vec<EqHandle> = self.connections.keys().copied().collect();
        for handle in handles {
            if let Some(conn) = self.connections.remove(&handle) {
                self.retire(conn, EventKind::Shutdown, 0);
            }
        }
        tracing::debug!(addr = %self.config.addr, "event queue closed");
    }

    fn dispatch(&mut self, event: CmEvent) -> EventKind {
        let kind = event.kind;
        match kind {
            CmEventKind::ConnectRequest => self.on_connect_request(event),
            CmEventKind::Connected => self.on_connected(event),
            CmEventKind::Disconnected => {
                if let Some(conn) = self.connections.remove(&event.handle) {
                    tracing::debug!(handle = %event.handle, "peer disconnected");
                    self.retire(conn, EventKind::Shutdown, event.status);
                }
            }
            CmEventKind::Rejected | CmEventKind::Error => {
                if let Some(conn) = self.connections.remove(&event.handle) {
                    tracing::warn!(
                        handle = %event.handle,
                        ?kind,
                        status = event.status,
                        "connection failed"
                    );
                    self.retire(conn, kind.into(), event.status);
                }
            }
            CmEventKind::Other(code) => {
                tracing::trace!(handle = %event.handle, code, "ignoring event");
            }
        }
        kind.into()
    }

    fn on_connect_request(&mut self, event: CmEvent) {
        let handle = event.handle;
        let Some(request) = event.request else {
            tracing::warn!(%handle, "connect request without request info");
            return;
        };
        if self.connections.contains_key(&handle) {
            return;
        }
        tracing::debug!(%handle, "connect request");
        self.connections
            .insert(handle, Connection::pending(handle, request));

        if !self.config.auto_accept {
            // The request handle stays valid until accept or reject.
            self.shared.sink.on_accepted(handle);
            self.shared
                .sink
                .on_event(handle, EventKind::ConnectRequest, 0);
            return;
        }
        match self.accept(handle) {
            Ok(conn) => {
                let accepted = conn.handle();
                self.shared.sink.on_accepted(accepted);
                self.shared
                    .sink
                    .on_event(accepted, EventKind::ConnectRequest, 0);
            }
            Err(e) => {
                tracing::warn!(%handle, error = %e, "accept failed");
                self.shared
                    .sink
                    .on_event(handle, EventKind::Error, e.status_code());
            }
        }
    }

    fn on_connected(&mut self, event: CmEvent) {
        let handle = event.handle;
        let Some(conn) = self.connections.get_mut(&handle) else {
            tracing::debug!(%handle, "connected event for unknown handle");
            return;
        };
        let status = conn.status();
        if !matches!(status, ConnStatus::ConnectRequested | ConnStatus::AcceptPending) {
            tracing::debug!(%handle, ?status, "ignoring connected event");
            return;
        }
        if let Some(peer) = event.peer {
            conn.set_peer(peer);
        }
        if let Some(peer) = conn.peer() {
            conn.limit_payload(peer.slot_size as usize);
        }
        let conn_ref = conn.to_ref(&self.ref_ctx);

        // Buffer ids are published before the status flips.
        self.shared.sink.on_connected(handle, &conn_ref);
        for &id in conn.send_ids() {
            self.shared.sink.on_send_buffer(handle, id);
        }

        let callback = self.shared.callbacks.read().connected.clone();
        if let Some(callback) = callback {
            callback(&CallbackContext {
                handle,
                id: 0,
                len: conn.send_ids().len(),
                status: 0,
                data: &[],
                conn: &conn_ref,
            });
        }

        self.shared.sink.on_event(handle, EventKind::Connected, 0);

        conn.advance(ConnStatus::Connected);
        tracing::debug!(
            %handle,
            send = conn.send_ids().len(),
            recv = conn.recv_ids().len(),
            "connected"
        );

        if self.early.iter().any(|wc| wc.handle == handle) {
            let (ready, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.early)
                .into_iter()
                .partition(|wc| wc.handle == handle);
            self.early = rest;
            for wc in ready {
                self.on_completion(wc);
            }
        }
    }

    fn on_completion(&mut self, wc: WorkCompletion) {
        let handle = wc.handle;
        let Some(conn) = self.connections.get(&handle) else {
            tracing::trace!(%handle, wr_id = wc.wr_id, "completion for reaped connection");
            return;
        };
        if matches!(
            conn.status(),
            ConnStatus::Init | ConnStatus::ConnectRequested | ConnStatus::AcceptPending
        ) {
            // The peer may send as soon as it sees the connection up.
            self.early.push(wc);
            return;
        }
        let id = wc.chunk();
        if !wc.is_ok() {
            tracing::warn!(%handle, id, op = ?wc.opcode, status = wc.status, "work request failed");
            self.shared
                .sink
                .on_event(handle, wc.opcode.into(), wc.status);
            if wc.opcode == WrOp::Recv {
                // A failed receive leaves the queue pair in error.
                if let Some(conn) = self.connections.remove(&handle) {
                    self.retire(conn, EventKind::Error, wc.status);
                }
                return;
            }
        }
        let conn_ref = conn.to_ref(&self.ref_ctx);
        let callbacks = self.shared.callbacks.read().clone();

        match wc.opcode {
            WrOp::Recv => {
                let len = wc.byte_len as usize;
                self.scratch.resize(len, 0);
                let copied = match self.recv_pool.index(id) {
                    Ok(chunk) => chunk.read(0, &mut self.scratch[..len]),
                    Err(e) => {
                        tracing::warn!(%handle, id, error = %e, "recv chunk missing");
                        return;
                    }
                };
                if let Some(callback) = &callbacks.recv {
                    callback(&CallbackContext {
                        handle,
                        id,
                        len: copied,
                        status: 0,
                        data: &self.scratch[..copied],
                        conn: &conn_ref,
                    });
                }
                if conn.status().can_advance_to(ConnStatus::ShutdownRequested) {
                    if let Err(e) = conn.post_recv(&self.recv_pool, id) {
                        tracing::warn!(%handle, id, error = %e, "recv repost failed");
                        self.shared
                            .sink
                            .on_event(handle, EventKind::RecvComplete, e.status_code());
                    }
                }
            }
            WrOp::Send => {
                conn.complete_send(id);
                if let Some(callback) = &callbacks.send {
                    callback(&CallbackContext {
                        handle,
                        id,
                        len: wc.byte_len as usize,
                        status: wc.status,
                        data: &[],
                        conn: &conn_ref,
                    });
                }
            }
            WrOp::Read => {
                if let Some(callback) = &callbacks.read {
                    callback(&CallbackContext {
                        handle,
                        id,
                        len: wc.byte_len as usize,
                        status: wc.status,
                        data: &[],
                        conn: &conn_ref,
                    });
                }
            }
        }
    }

    /// Tear `conn` down if it is not down yet, report it, and return its
    /// chunks to the pools.
    fn retire(&mut self, mut conn: Connection, kind: EventKind, status: i32) {
        let handle = conn.handle();
        if conn.teardown() {
            tracing::debug!(%handle, %kind, status, "connection down");
            let conn_ref = conn.to_ref(&self.ref_ctx);
            self.shared.sink.on_shutdown(handle);
            self.shared.sink.on_event(handle, kind, status);
            let callback = self.shared.callbacks.read().shutdown.clone();
            if let Some(callback) = callback {
                callback(&CallbackContext {
                    handle,
                    id: 0,
                    len: 0,
                    status,
                    data: &[],
                    conn: &conn_ref,
                });
            }
        }
        self.early.retain(|wc| wc.handle != handle);
        let (send_ids, recv_ids) = conn.take_chunks();
        self.release_chunks(&send_ids, &recv_ids);
    }

    /// Drop a connection that never became visible to anyone.
    fn discard(&mut self, mut conn: Connection) {
        conn.teardown();
        let (send_ids, recv_ids) = conn.take_chunks();
        self.release_chunks(&send_ids, &recv_ids);
    }

    fn handshake(&self, send_ids: &[u32]) -> Handshake {
        Handshake::new(
            self.config.buffer_size as u32,
            self.config.buffer_num as u16,
            send_ids.to_vec(),
        )
    }

    fn acquire_chunks(&mut self) -> Result<(Vec<u32>, Vec<u32>)> {
        let n = self.config.buffer_num;
        let mut send_ids = Vec::with_capacity(n);
        let mut recv_ids = Vec::with_capacity(n);
        let res = (|| -> Result<()> {
            let mut send_pool = self.send_pool.lock();
            for _ in 0..n {
                send_ids.push(acquire(&mut send_pool, self.fabric.as_ref(), &self.config)?);
            }
            drop(send_pool);
            for _ in 0..n {
                recv_ids.push(acquire(&mut self.recv_pool, self.fabric.as_ref(), &self.config)?);
            }
            Ok(())
        })();
        match res {
            Ok(()) => Ok((send_ids, recv_ids)),
            Err(e) => {
                self.release_chunks(&send_ids, &recv_ids);
                Err(e)
            }
        }
    }

    fn release_chunks(&mut self, send_ids: &[u32], recv_ids: &[u32]) {
        let mut send_pool = self.send_pool.lock();
        for &id in send_ids {
            let _ = send_pool.recycle(id);
        }
        drop(send_pool);
        for &id in recv_ids {
            let _ = self.recv_pool.recycle(id);
        }
    }

    fn bind_and_post(
        &mut self,
        conn: &mut Connection,
        endpoint: Box<dyn Endpoint>,
        send_ids: Vec<u32>,
        recv_ids: Vec<u32>,
    ) -> Result<()> {
        let handle = conn.handle();
        conn.attach(endpoint, send_ids, recv_ids);
        {
            let mut send_pool = self.send_pool.lock();
            for &id in conn.send_ids() {
                send_pool.index_mut(id)?.bind(handle);
            }
        }
        for &id in conn.recv_ids() {
            self.recv_pool.index_mut(id)?.bind(handle);
        }
        for &id in conn.recv_ids() {
            conn.post_recv(&self.recv_pool, id)?;
        }
        Ok(())
    }
}

/// Take a free chunk from `pool`, registering a new one while the pool is
/// below capacity.
fn acquire(pool: &mut BufferPool, fabric: &dyn Fabric, config: &ServiceConfig) -> Result<u32> {
    match pool.get().map(|chunk| chunk.id()) {
        Ok(id) => Ok(id),
        Err(Error::Empty) if pool.len() < config.pool_capacity => {
            pool.register(fabric, BytesMut::zeroed(config.buffer_size))?;
            Ok(pool.get()?.id())
        }
        Err(e) => Err(e),
    }
}

impl Drop for EqService {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::loopback::LoopbackFabric;
    use crate::transport::protocol::WrId;
    use std::thread;

    const TICK: Duration = Duration::from_millis(200);

    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        accepted: Mutex<Vec<EqHandle>>,
        shutdowns: Mutex<Vec<EqHandle>>,
        conn: Mutex<Option<ConnectionRef>>,
        /// Status of the last connected connection at each generic event.
        statuses: Mutex<Vec<ConnStatus>>,
    }

    impl Recorder {
        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    impl EventSink for Recorder {
        fn on_accepted(&self, handle: EqHandle) {
            self.accepted.lock().push(handle);
        }

        fn on_connected(&self, _handle: EqHandle, conn: &ConnectionRef) {
            *self.conn.lock() = Some(conn.clone());
            self.log.lock().push("connected".into());
        }

        fn on_send_buffer(&self, _handle: EqHandle, id: u32) {
            self.log.lock().push(format!("send_buffer:{id}"));
        }

        fn on_event(&self, _handle: EqHandle, kind: EventKind, status: i32) {
            if let Some(conn) = self.conn.lock().as_ref() {
                self.statuses.lock().push(conn.status());
            }
            self.log.lock().push(format!("event:{kind}:{status}"));
        }

        fn on_shutdown(&self, handle: EqHandle) {
            self.shutdowns.lock().push(handle);
        }
    }

    fn config(port: u16) -> ServiceConfig {
        ServiceConfig::new(SocketAddr::from(([127, 0, 0, 1], port)))
            .with_buffer_num(2)
            .with_buffer_size(64)
            .with_pool_capacity(4)
    }

    fn open(fabric: &Arc<LoopbackFabric>, role: Role, config: ServiceConfig, shared: EqShared) -> EqService {
        EqService::new(fabric.clone(), role, config, shared).unwrap()
    }

    /// Poll every service until `done` holds.
    fn pump(eqs: &mut [&mut EqService], done: impl Fn() -> bool) -> bool {
        for _ in 0..200 {
            for eq in eqs.iter_mut() {
                eq.poll(Duration::from_millis(2)).unwrap();
            }
            if done() {
                return true;
            }
        }
        false
    }

    struct Pair {
        server: EqService,
        client: EqService,
        server_conn: ConnectionRef,
        client_conn: ConnectionRef,
    }

    fn connect_pair(config: ServiceConfig, server_shared: EqShared, client_shared: EqShared) -> Pair {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut server = open(&fabric, Role::Server, config.clone(), server_shared);
        server.listen().unwrap();
        let mut client = open(&fabric, Role::Client, config, client_shared);
        let client_conn = client.connect().unwrap();

        assert_eq!(server.poll(TICK).unwrap(), EventKind::ConnectRequest);
        assert_eq!(server.poll(TICK).unwrap(), EventKind::Connected);
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Connected);
        let server_conn = server.get_connection(server.handles()[0]).unwrap();
        Pair {
            server,
            client,
            server_conn,
            client_conn,
        }
    }

    #[test]
    fn test_accept_flow_wakes_waiter() {
        let fabric = Arc::new(LoopbackFabric::new());
        let recorder = Arc::new(Recorder::default());
        let mut server = open(
            &fabric,
            Role::Server,
            config(7001).with_auto_accept(false),
            EqShared::new().with_sink(recorder.clone()),
        );
        server.listen().unwrap();
        let mut client = open(&fabric, Role::Client, config(7001), EqShared::new());

        let client_conn = client.connect().unwrap();
        assert_eq!(client_conn.status(), ConnStatus::ConnectRequested);

        assert_eq!(server.poll(TICK).unwrap(), EventKind::ConnectRequest);
        let pending = recorder.accepted.lock()[0];
        assert_eq!(
            server.connection(pending).map(Connection::status),
            Some(ConnStatus::AcceptPending)
        );

        let waiter = {
            let conn = client_conn.clone();
            thread::spawn(move || conn.wait_connected(Duration::from_secs(5)))
        };

        let server_conn = server.accept(pending).unwrap();
        assert_ne!(server_conn.handle(), pending);
        assert!(server.connection(pending).is_none());
        assert_eq!(server_conn.status(), ConnStatus::AcceptPending);
        assert!(server.accept(pending).is_err());

        assert_eq!(server.poll(TICK).unwrap(), EventKind::Connected);
        assert_eq!(server_conn.status(), ConnStatus::Connected);
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Connected);
        waiter.join().unwrap().unwrap();

        let server_side = server.connection(server_conn.handle()).unwrap();
        let client_side = client.connection(client_conn.handle()).unwrap();
        assert_eq!(
            server_side.peer().map(|p| p.send_ids.clone()),
            Some(client_side.send_ids().to_vec())
        );
        assert_eq!(
            client_side.peer().map(|p| p.send_ids.clone()),
            Some(server_side.send_ids().to_vec())
        );
        assert_eq!(client_side.peer().map(|p| p.slot_size), Some(64));
    }

    #[test]
    fn test_connected_side_effect_order() {
        let recorder = Arc::new(Recorder::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let seen = seen.clone();
            let recorder = recorder.clone();
            Callbacks::new().on_connected(move |ctx| {
                seen.lock().push(ctx.conn.status());
                recorder.log.lock().push("callback".into());
            })
        };
        let pair = connect_pair(
            config(7002),
            EqShared::new(),
            EqShared::new()
                .with_sink(recorder.clone())
                .with_callbacks(callbacks),
        );

        let ids = pair.client.connection(pair.client_conn.handle()).unwrap().send_ids().to_vec();
        let mut expected = vec!["connected".to_string()];
        expected.extend(ids.iter().map(|id| format!("send_buffer:{id}")));
        expected.push("callback".into());
        expected.push("event:connected:0".into());
        assert_eq!(recorder.log(), expected);
        assert_eq!(*seen.lock(), vec![ConnStatus::ConnectRequested]);
        assert_eq!(*recorder.statuses.lock(), vec![ConnStatus::ConnectRequested]);
        assert_eq!(pair.client_conn.status(), ConnStatus::Connected);
    }

    #[test]
    fn test_accepted_handle_resolves() {
        let fabric = Arc::new(LoopbackFabric::new());
        let recorder = Arc::new(Recorder::default());
        let mut server = open(
            &fabric,
            Role::Server,
            config(7014),
            EqShared::new().with_sink(recorder.clone()),
        );
        server.listen().unwrap();
        let mut client = open(&fabric, Role::Client, config(7014), EqShared::new());
        client.connect().unwrap();

        assert_eq!(server.poll(TICK).unwrap(), EventKind::ConnectRequest);
        let accepted = recorder.accepted.lock().clone();
        assert_eq!(accepted, server.handles());
        let conn = server.get_connection(accepted[0]).unwrap();
        assert_eq!(conn.status(), ConnStatus::AcceptPending);
        assert_eq!(recorder.log(), vec!["event:connect-request:0"]);
    }

    #[test]
    fn test_asymmetric_slot_sizes() {
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let callbacks = {
            let received = received.clone();
            Callbacks::new().on_recv(move |ctx| received.lock().push(ctx.data.to_vec()))
        };
        let fabric = Arc::new(LoopbackFabric::new());
        let mut server = open(
            &fabric,
            Role::Server,
            config(7015),
            EqShared::new().with_callbacks(callbacks),
        );
        server.listen().unwrap();
        let mut client = open(
            &fabric,
            Role::Client,
            config(7015).with_buffer_size(128),
            EqShared::new(),
        );
        let conn = client.connect().unwrap();
        assert_eq!(conn.slot_size(), 128);
        server.poll(TICK).unwrap();
        server.poll(TICK).unwrap();
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Connected);

        assert_eq!(conn.slot_size(), 64);
        for _ in 0..3 {
            assert!(matches!(
                conn.send([1u8; 100]),
                Err(Error::PayloadTooLarge { len: 100, max: 64 })
            ));
        }
        conn.send([3u8; 64]).unwrap();
        let seen = received.clone();
        assert!(pump(&mut [&mut server, &mut client], move || {
            !seen.lock().is_empty()
        }));
        assert_eq!(received.lock()[0], vec![3u8; 64]);

        let server_conn = server.get_connection(server.handles()[0]).unwrap();
        assert_eq!(server_conn.slot_size(), 64);
    }

    #[test]
    fn test_failed_recv_retires_connection() {
        let recorder = Arc::new(Recorder::default());
        let mut pair = connect_pair(
            config(7016),
            EqShared::new().with_sink(recorder.clone()),
            EqShared::new(),
        );
        let handle = pair.server_conn.handle();
        let id = pair.server.connection(handle).unwrap().recv_ids()[0];
        let wr_id = WrId::new(handle, WrOp::Recv, id).encode();

        pair.server
            .on_completion(WorkCompletion::from_wr_id(wr_id, -90, 0).unwrap());
        assert_eq!(pair.server_conn.status(), ConnStatus::Down);
        assert!(pair.server.is_empty());
        assert_eq!(*recorder.shutdowns.lock(), vec![handle]);
        let log = recorder.log();
        assert!(log.contains(&"event:recv-complete:-90".to_string()));
        assert!(log.contains(&"event:error:-90".to_string()));

        // The peer sees the disconnect and the receive chunks are reusable.
        assert_eq!(pair.client.poll(TICK).unwrap(), EventKind::Shutdown);
        assert_eq!(pair.client_conn.status(), ConnStatus::Down);
        assert!(pair.server.recv_pool.available() >= 2);
    }

    #[test]
    fn test_connect_reply_dropped_shuts_connection() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut client = open(&fabric, Role::Client, config(7017), EqShared::new());
        let (tx, rx) = flume::bounded(1);
        drop(rx);
        client.command_sender().send(Command::Connect(tx)).unwrap();

        assert_eq!(client.process_commands(), 1);
        assert!(client.is_empty());
    }

    #[test]
    fn test_peer_shutdown_reaps_connection() {
        let recorder = Arc::new(Recorder::default());
        let mut pair = connect_pair(
            config(7003),
            EqShared::new().with_sink(recorder.clone()),
            EqShared::new(),
        );
        let handle = pair.server_conn.handle();

        pair.client.shutdown(pair.client_conn.handle()).unwrap();
        assert_eq!(pair.client_conn.status(), ConnStatus::Down);
        assert_eq!(pair.server.poll(TICK).unwrap(), EventKind::Shutdown);

        assert_eq!(pair.server_conn.status(), ConnStatus::Down);
        assert!(matches!(
            pair.server.get_connection(handle),
            Err(Error::NotFound { .. })
        ));
        pair.server.shutdown(handle).unwrap();
        pair.server.shutdown(handle).unwrap();
        assert_eq!(*recorder.shutdowns.lock(), vec![handle]);
        assert!(pair.server.reap(handle).is_err());
    }

    #[test]
    fn test_shutdown_command_from_connection_ref() {
        let mut pair = connect_pair(config(7004), EqShared::new(), EqShared::new());
        pair.client_conn.shutdown().unwrap();
        assert_eq!(pair.client_conn.status(), ConnStatus::Connected);

        pair.client.process_commands();
        assert_eq!(pair.client_conn.status(), ConnStatus::Down);
        assert!(pair.client.is_empty());
        pair.client_conn.shutdown().unwrap();
    }

    #[test]
    fn test_connect_refused() {
        let fabric = Arc::new(LoopbackFabric::new());
        let recorder = Arc::new(Recorder::default());
        let mut client = open(
            &fabric,
            Role::Client,
            config(7005),
            EqShared::new().with_sink(recorder.clone()),
        );
        let conn = client.connect().unwrap();
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Rejected);
        assert_eq!(conn.status(), ConnStatus::Down);
        assert!(client.is_empty());
        assert!(recorder.log().contains(&"event:rejected:-111".to_string()));
        assert!(conn.wait_connected(TICK).is_err());
    }

    #[test]
    fn test_reject_pending_request() {
        let fabric = Arc::new(LoopbackFabric::new());
        let recorder = Arc::new(Recorder::default());
        let mut server = open(
            &fabric,
            Role::Server,
            config(7006).with_auto_accept(false),
            EqShared::new().with_sink(recorder.clone()),
        );
        server.listen().unwrap();
        let mut client = open(&fabric, Role::Client, config(7006), EqShared::new());
        let conn = client.connect().unwrap();

        server.poll(TICK).unwrap();
        let pending = recorder.accepted.lock()[0];
        server.reject(pending).unwrap();
        assert!(server.is_empty());
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Rejected);
        assert_eq!(conn.status(), ConnStatus::Down);
    }

    #[test]
    fn test_empty_send_set_is_valid_at_connected() {
        let recorder = Arc::new(Recorder::default());
        let pair = connect_pair(
            config(7007).with_buffer_num(0),
            EqShared::new(),
            EqShared::new().with_sink(recorder.clone()),
        );
        assert_eq!(pair.client_conn.status(), ConnStatus::Connected);
        assert_eq!(recorder.log(), vec!["connected", "event:connected:0"]);
        assert!(matches!(pair.client_conn.send(b"x"), Err(Error::Empty)));
    }

    #[test]
    fn test_send_recv_callbacks() {
        let received = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sent = Arc::new(Mutex::new(Vec::new()));
        let server_callbacks = {
            let received = received.clone();
            Callbacks::new().on_recv(move |ctx| received.lock().push(ctx.data.to_vec()))
        };
        let client_callbacks = {
            let sent = sent.clone();
            Callbacks::new().on_send(move |ctx| sent.lock().push((ctx.id, ctx.status)))
        };
        let mut pair = connect_pair(
            config(7008),
            EqShared::new().with_callbacks(server_callbacks),
            EqShared::new().with_callbacks(client_callbacks),
        );

        // More messages than receive slots: each slot is re-posted after use.
        for i in 0..5u8 {
            pair.client_conn.send([i; 3]).unwrap();
            let received = received.clone();
            let want = i as usize + 1;
            assert!(pump(&mut [&mut pair.server, &mut pair.client], move || {
                received.lock().len() == want
            }));
        }
        assert_eq!(received.lock()[4], vec![4, 4, 4]);

        let sent = sent.clone();
        assert!(pump(&mut [&mut pair.client], move || sent.lock().len() == 5));
        assert_eq!(pair.client_conn.free_send_slots(), 2);
    }

    #[test]
    fn test_recv_before_connected_is_deferred() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let received = received.clone();
            Callbacks::new().on_recv(move |ctx| {
                received.lock().push((ctx.conn.status(), ctx.data.to_vec()));
            })
        };
        let fabric = Arc::new(LoopbackFabric::new());
        let recorder = Arc::new(Recorder::default());
        let mut server = open(
            &fabric,
            Role::Server,
            config(7013).with_auto_accept(false),
            EqShared::new()
                .with_sink(recorder.clone())
                .with_callbacks(callbacks),
        );
        server.listen().unwrap();
        let mut client = open(&fabric, Role::Client, config(7013), EqShared::new());
        let conn = client.connect().unwrap();

        server.poll(TICK).unwrap();
        let pending = recorder.accepted.lock()[0];
        let server_conn = server.accept(pending).unwrap();
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Connected);
        conn.send(b"early").unwrap();

        server.drain_completions();
        assert!(received.lock().is_empty());
        assert_eq!(server_conn.status(), ConnStatus::AcceptPending);

        assert_eq!(server.poll(TICK).unwrap(), EventKind::Connected);
        assert_eq!(
            *received.lock(),
            vec![(ConnStatus::Connected, b"early".to_vec())]
        );
    }

    #[test]
    fn test_read_callback() {
        let reads = Arc::new(Mutex::new(Vec::new()));
        let callbacks = {
            let reads = reads.clone();
            Callbacks::new().on_read(move |ctx| reads.lock().push((ctx.id, ctx.len, ctx.status)))
        };
        let server_shared = EqShared::new();
        let client_shared = EqShared::new().with_callbacks(callbacks);
        let fabric = Arc::new(LoopbackFabric::new());
        let mut server = open(&fabric, Role::Server, config(7009), server_shared.clone());
        server.listen().unwrap();
        let mut client = open(&fabric, Role::Client, config(7009), client_shared.clone());
        let conn = client.connect().unwrap();
        server.poll(TICK).unwrap();
        server.poll(TICK).unwrap();
        client.poll(TICK).unwrap();

        let remote = {
            let mut pool = server_shared.rma_pool.lock();
            pool.register_with_id(fabric.as_ref(), BytesMut::zeroed(16), 1).unwrap();
            pool.index(1).unwrap().write(0, b"remote-bytes");
            pool.index(1).unwrap().remote()
        };
        client_shared
            .rma_pool
            .lock()
            .register_with_id(fabric.as_ref(), BytesMut::zeroed(16), 9)
            .unwrap();

        conn.read(9, 2, remote.subrange(0, 6)).unwrap();
        assert!(matches!(
            conn.read(9, 12, remote),
            Err(Error::PayloadTooLarge { .. })
        ));
        let seen = reads.clone();
        assert!(pump(&mut [&mut client], move || !seen.lock().is_empty()));
        assert_eq!(reads.lock()[0], (9, 6, 0));

        let mut out = [0u8; 6];
        client_shared.rma_pool.lock().index(9).unwrap().read(2, &mut out);
        assert_eq!(&out, b"remote");
    }

    #[test]
    fn test_pool_capacity_exhaustion() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut server = open(&fabric, Role::Server, config(7010), EqShared::new());
        server.listen().unwrap();
        let mut client = open(
            &fabric,
            Role::Client,
            config(7010).with_pool_capacity(3),
            EqShared::new(),
        );

        let first = client.connect().unwrap();
        assert!(matches!(client.connect(), Err(Error::Empty)));
        assert_eq!(client.len(), 1);

        client.shutdown(first.handle()).unwrap();
        assert!(client.connect().is_ok());
    }

    #[test]
    fn test_drop_forces_connections_down() {
        let pair = connect_pair(config(7011), EqShared::new(), EqShared::new());
        let Pair {
            server,
            mut client,
            server_conn,
            client_conn,
        } = pair;
        drop(server);
        assert_eq!(server_conn.status(), ConnStatus::Down);
        assert_eq!(client.poll(TICK).unwrap(), EventKind::Shutdown);
        assert_eq!(client_conn.status(), ConnStatus::Down);
    }

    #[test]
    fn test_unknown_handles() {
        let fabric = Arc::new(LoopbackFabric::new());
        let mut eq = open(&fabric, Role::Client, config(7012), EqShared::new());
        assert!(matches!(
            eq.get_connection(EqHandle(99)),
            Err(Error::NotFound { .. })
        ));
        assert!(eq.reap(EqHandle(99)).is_err());
        assert!(eq.shutdown(EqHandle(99)).is_ok());
        assert!(eq.accept(EqHandle(99)).is_err());
        assert_eq!(eq.poll(Duration::from_millis(5)).unwrap(), EventKind::None);
    }
}

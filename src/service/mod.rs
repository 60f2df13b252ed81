//! Client and server facades.
//!
//! A service starts `worker_num` threads, each owning one
//! [`EqService`](crate::eq::EqService). RMA buffers are registered once per
//! service and shared by every worker; callbacks may be installed before or
//! after `start`.

pub mod callback;
mod client;
mod server;
mod worker;

pub use callback::{Callback, CallbackContext, Callbacks};
pub use client::Client;
pub use server::Server;

use crate::config::ServiceConfig;
use crate::connection::ConnectionRef;
use crate::eq::{EqService, EqShared, EventKind, EventSink};
use crate::error::{Error, Result};
use crate::memory::{BufferPool, Chunk, RemoteBuf};
use crate::transport::{EqHandle, Fabric, Role};
use bytes::BytesMut;
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use worker::Worker;

/// Sink the facade installs on every worker: mirrors live connections and
/// their send-buffer ids, then forwards to the user's sink.
pub(crate) struct Registry {
    connections: DashMap<EqHandle, ConnectionRef>,
    send_buffers: DashMap<EqHandle, Vec<u32>>,
    /// Inbound attempts left for an explicit accept or reject.
    pending: DashSet<EqHandle>,
    track_pending: bool,
    user: RwLock<Option<Arc<dyn EventSink>>>,
}

impl Registry {
    fn new(track_pending: bool) -> Self {
        Self {
            connections: DashMap::new(),
            send_buffers: DashMap::new(),
            pending: DashSet::new(),
            track_pending,
            user: RwLock::new(None),
        }
    }

    fn user(&self) -> Option<Arc<dyn EventSink>> {
        self.user.read().clone()
    }
}

impl EventSink for Registry {
    fn on_accepted(&self, handle: EqHandle) {
        if self.track_pending {
            self.pending.insert(handle);
        }
        if let Some(user) = self.user() {
            user.on_accepted(handle);
        }
    }

    fn on_connected(&self, handle: EqHandle, conn: &ConnectionRef) {
        self.connections.insert(handle, conn.clone());
        self.send_buffers.insert(handle, Vec::new());
        if let Some(user) = self.user() {
            user.on_connected(handle, conn);
        }
    }

    fn on_send_buffer(&self, handle: EqHandle, id: u32) {
        self.send_buffers.entry(handle).or_default().push(id);
        if let Some(user) = self.user() {
            user.on_send_buffer(handle, id);
        }
    }

    fn on_event(&self, handle: EqHandle, kind: EventKind, status: i32) {
        if let Some(user) = self.user() {
            user.on_event(handle, kind, status);
        }
    }

    fn on_shutdown(&self, handle: EqHandle) {
        self.connections.remove(&handle);
        self.send_buffers.remove(&handle);
        self.pending.remove(&handle);
        if let Some(user) = self.user() {
            user.on_shutdown(handle);
        }
    }
}

/// State and operations shared by [`Client`] and [`Server`].
pub struct Service {
    role: Role,
    fabric: Arc<dyn Fabric>,
    config: ServiceConfig,
    shared: EqShared,
    registry: Arc<Registry>,
    workers: Vec<Worker>,
}

impl Service {
    fn new(role: Role, fabric: Arc<dyn Fabric>, config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::new(!config.auto_accept));
        let shared = EqShared {
            callbacks: Arc::new(RwLock::new(Callbacks::default())),
            sink: registry.clone(),
            rma_pool: Arc::new(Mutex::new(BufferPool::new())),
        };
        Ok(Self {
            role,
            fabric,
            config,
            shared,
            registry,
            workers: Vec::new(),
        })
    }

    /// Spawn the workers. The server's listener lives on worker 0.
    fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            return Ok(());
        }
        for index in 0..self.config.worker_num {
            let mut eq = EqService::new(
                self.fabric.clone(),
                self.role,
                self.config.clone(),
                self.shared.clone(),
            )?;
            if self.role == Role::Server && index == 0 {
                eq.listen()?;
            }
            let worker = Worker::spawn(index, eq, self.config.poll_interval())?;
            self.workers.push(worker);
        }
        tracing::info!(
            role = ?self.role,
            addr = %self.config.addr,
            workers = self.workers.len(),
            fabric = self.fabric.name(),
            "service started"
        );
        Ok(())
    }

    fn worker(&self, index: usize) -> Result<&Worker> {
        if self.workers.is_empty() {
            return Err(Error::Closed);
        }
        Ok(&self.workers[index % self.workers.len()])
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty() && self.workers.iter().all(Worker::is_running)
    }

    pub fn worker_num(&self) -> usize {
        self.workers.len()
    }

    /// Register `buf` for RMA under `id`, replacing any buffer already there.
    pub fn reg_rma_buffer(&self, buf: BytesMut, id: u32) -> Result<RemoteBuf> {
        let mut pool = self.shared.rma_pool.lock();
        pool.register_with_id(self.fabric.as_ref(), buf, id)?;
        let remote = pool.index(id)?.remote();
        tracing::debug!(id, addr = remote.addr(), len = remote.len(), "rma buffer registered");
        Ok(remote)
    }

    pub fn unreg_rma_buffer(&self, id: u32) -> Result<()> {
        self.shared.rma_pool.lock().unregister(id)
    }

    /// Remote descriptor of a registered RMA buffer.
    pub fn get_rma_buffer(&self, id: u32) -> Result<RemoteBuf> {
        Ok(self.shared.rma_pool.lock().index(id)?.remote())
    }

    /// Run `f` with the RMA buffer `id` while the pool is locked.
    pub fn with_rma_buffer<R>(&self, id: u32, f: impl FnOnce(&Chunk) -> R) -> Result<R> {
        let pool = self.shared.rma_pool.lock();
        Ok(f(pool.index(id)?))
    }

    pub fn set_connected_callback<F>(&self, f: F)
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().connected = Some(Arc::new(f));
    }

    pub fn set_recv_callback<F>(&self, f: F)
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().recv = Some(Arc::new(f));
    }

    pub fn set_send_callback<F>(&self, f: F)
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().send = Some(Arc::new(f));
    }

    pub fn set_read_callback<F>(&self, f: F)
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().read = Some(Arc::new(f));
    }

    pub fn set_shutdown_callback<F>(&self, f: F)
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.shared.callbacks.write().shutdown = Some(Arc::new(f));
    }

    /// Replace every callback at once.
    pub fn set_callbacks(&self, callbacks: Callbacks) {
        *self.shared.callbacks.write() = callbacks;
    }

    /// Forward lifecycle notifications to `sink` as well.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.registry.user.write() = Some(sink);
    }

    /// A connected connection by handle.
    pub fn connection(&self, handle: EqHandle) -> Result<ConnectionRef> {
        self.registry
            .connections
            .get(&handle)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::not_found("connection", handle))
    }

    pub fn connections(&self) -> Vec<ConnectionRef> {
        self.registry
            .connections
            .iter()
            .map(|c| c.value().clone())
            .collect()
    }

    /// Send-buffer ids published for `handle` when it connected.
    pub fn send_buffers(&self, handle: EqHandle) -> Result<Vec<u32>> {
        self.registry
            .send_buffers
            .get(&handle)
            .map(|ids| ids.value().clone())
            .ok_or_else(|| Error::not_found("connection", handle))
    }

    /// Ask every worker to stop. Each forces its connections down on exit.
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Join the workers.
    pub fn wait(&mut self) {
        for worker in &mut self.workers {
            worker.join();
        }
        if !self.workers.is_empty() {
            tracing::info!(role = ?self.role, addr = %self.config.addr, "service stopped");
        }
        self.workers.clear();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
        self.wait();
    }
}

use super::Service;
use crate::config::ServiceConfig;
use crate::connection::ConnectionRef;
use crate::eq::Command;
use crate::error::{Error, Result};
use crate::transport::{EqHandle, Fabric, Role};
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Server facade. The listener and every accepted connection live on
/// worker 0.
pub struct Server {
    service: Service,
}

impl Server {
    pub fn new(fabric: Arc<dyn Fabric>, config: ServiceConfig) -> Result<Self> {
        Ok(Self {
            service: Service::new(Role::Server, fabric, config)?,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.service.start()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.service.worker(0)?.local_addr())
    }

    pub fn listener(&self) -> Result<EqHandle> {
        self.service
            .worker(0)?
            .listener()
            .ok_or(Error::Closed)
    }

    /// Inbound attempts waiting for [`accept`](Self::accept) or
    /// [`reject`](Self::reject). Always empty with `auto_accept`.
    pub fn pending_requests(&self) -> Vec<EqHandle> {
        self.service
            .registry
            .pending
            .iter()
            .map(|h| *h)
            .collect()
    }

    pub fn accept(&self, handle: EqHandle) -> Result<ConnectionRef> {
        let worker = self.service.worker(0)?;
        let res = worker.request(
            |reply| Command::Accept(handle, reply),
            self.service.config.connect_timeout(),
        );
        self.service.registry.pending.remove(&handle);
        res
    }

    pub fn reject(&self, handle: EqHandle) -> Result<()> {
        let worker = self.service.worker(0)?;
        let res = worker.request(
            |reply| Command::Reject(handle, reply),
            self.service.config.connect_timeout(),
        );
        self.service.registry.pending.remove(&handle);
        res
    }
}

impl Deref for Server {
    type Target = Service;

    fn deref(&self) -> &Service {
        &self.service
    }
}

impl DerefMut for Server {
    fn deref_mut(&mut self) -> &mut Service {
        &mut self.service
    }
}

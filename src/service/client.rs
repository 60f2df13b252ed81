use super::Service;
use crate::config::ServiceConfig;
use crate::connection::ConnectionRef;
use crate::eq::Command;
use crate::error::Result;
use crate::transport::{Fabric, Role};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Client facade. Connections are spread round-robin over the workers.
pub struct Client {
    service: Service,
    next_worker: AtomicUsize,
}

impl Client {
    pub fn new(fabric: Arc<dyn Fabric>, config: ServiceConfig) -> Result<Self> {
        Ok(Self {
            service: Service::new(Role::Client, fabric, config)?,
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn start(&mut self) -> Result<()> {
        self.service.start()
    }

    /// Connect to the configured address and wait until connected.
    pub fn connect(&self) -> Result<ConnectionRef> {
        let conn = self.start_connect()?;
        conn.wait_connected(self.service.config.connect_timeout())?;
        Ok(conn)
    }

    /// Initiate a connection without waiting for it to complete.
    ///
    /// The returned connection is in `ConnectRequested`; use
    /// [`ConnectionRef::wait_connected`] to block on the outcome.
    pub fn start_connect(&self) -> Result<ConnectionRef> {
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker = self.service.worker(index)?;
        let conn = worker.request(Command::Connect, self.service.config.connect_timeout())?;
        tracing::debug!(worker = worker.index(), handle = %conn.handle(), "connect issued");
        Ok(conn)
    }
}

impl Deref for Client {
    type Target = Service;

    fn deref(&self) -> &Service {
        &self.service
    }
}

impl DerefMut for Client {
    fn deref_mut(&mut self) -> &mut Service {
        &mut self.service
    }
}

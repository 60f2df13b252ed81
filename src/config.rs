//! Service configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default slot size of send and receive chunks (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of send and receive chunks bound to each connection.
pub const DEFAULT_BUFFER_NUM: usize = 16;

/// Configuration shared by client and server services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listen address (server) or peer address (client).
    pub addr: SocketAddr,
    /// Number of worker threads, one event queue each.
    pub worker_num: usize,
    /// Send chunks and receive chunks bound to each connection.
    pub buffer_num: usize,
    /// Size of each send and receive chunk.
    pub buffer_size: usize,
    /// Upper bound on chunks per direction held by one worker.
    pub pool_capacity: usize,
    pub backlog: i32,
    /// How long one poll waits for a connection event.
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    /// Accept inbound requests as they arrive instead of leaving them pending.
    pub auto_accept: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 18515)),
            worker_num: 1,
            buffer_num: DEFAULT_BUFFER_NUM,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_capacity: 1024,
            backlog: 64,
            poll_interval_ms: 10,
            connect_timeout_ms: 5000,
            auto_accept: true,
        }
    }
}

impl ServiceConfig {
    #[inline]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    #[inline]
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    #[inline]
    pub fn with_worker_num(mut self, n: usize) -> Self {
        self.worker_num = n;
        self
    }

    #[inline]
    pub fn with_buffer_num(mut self, n: usize) -> Self {
        self.buffer_num = n;
        self
    }

    #[inline]
    pub fn with_buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    #[inline]
    pub fn with_pool_capacity(mut self, n: usize) -> Self {
        self.pool_capacity = n;
        self
    }

    #[inline]
    pub fn with_backlog(mut self, n: i32) -> Self {
        self.backlog = n;
        self
    }

    #[inline]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    #[inline]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[inline]
    pub fn with_auto_accept(mut self, auto: bool) -> Self {
        self.auto_accept = auto;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_num == 0 {
            return Err(Error::Config("worker_num must be at least 1".into()));
        }
        if self.buffer_size == 0 || self.buffer_size > u32::MAX as usize {
            return Err(Error::Config(format!(
                "buffer_size {} out of range",
                self.buffer_size
            )));
        }
        if self.buffer_num > u16::MAX as usize {
            return Err(Error::Config(format!(
                "buffer_num {} exceeds {}",
                self.buffer_num,
                u16::MAX
            )));
        }
        if self.buffer_num > self.pool_capacity {
            return Err(Error::Config(format!(
                "buffer_num {} exceeds pool_capacity {}",
                self.buffer_num, self.pool_capacity
            )));
        }
        Ok(())
    }
}

use crate::connection::ConnectionRef;
use crate::transport::EqHandle;
use std::fmt;
use std::sync::Arc;

/// Arguments handed to a completion or lifecycle callback.
///
/// `data` borrows the received bytes for receive callbacks and is empty
/// otherwise; it is only valid for the duration of the call.
pub struct CallbackContext<'a> {
    pub handle: EqHandle,
    /// Send or receive chunk id, or the local RMA buffer id for reads.
    pub id: u32,
    pub len: usize,
    pub status: i32,
    pub data: &'a [u8],
    pub conn: &'a ConnectionRef,
}

impl CallbackContext<'_> {
    pub fn is_ok(&self) -> bool {
        self.status == 0
    }
}

pub type Callback = Arc<dyn Fn(&CallbackContext<'_>) + Send + Sync>;

/// Callbacks run on the worker thread that owns the connection.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub connected: Option<Callback>,
    pub recv: Option<Callback>,
    pub send: Option<Callback>,
    pub read: Option<Callback>,
    pub shutdown: Option<Callback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.connected = Some(Arc::new(f));
        self
    }

    pub fn on_recv<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.recv = Some(Arc::new(f));
        self
    }

    pub fn on_send<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.send = Some(Arc::new(f));
        self
    }

    pub fn on_read<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.read = Some(Arc::new(f));
        self
    }

    pub fn on_shutdown<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext<'_>) + Send + Sync + 'static,
    {
        self.shutdown = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("connected", &self.connected.is_some())
            .field("recv", &self.recv.is_some())
            .field("send", &self.send.is_some())
            .field("read", &self.read.is_some())
            .field("shutdown", &self.shutdown.is_some())
            .finish()
    }
}

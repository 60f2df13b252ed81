use crate::connection::ConnectionRef;
use crate::eq::EventKind;
use crate::transport::EqHandle;

/// Collaborator notified of connection lifecycle events.
///
/// Every method runs on the worker thread that owns the connection and
/// defaults to doing nothing. A binding layer implements this to mirror the
/// connection map on its side.
pub trait EventSink: Send + Sync {
    /// An inbound connection attempt created a pending connection.
    fn on_accepted(&self, _handle: EqHandle) {}

    /// A connection reached the connected transition.
    fn on_connected(&self, _handle: EqHandle, _conn: &ConnectionRef) {}

    /// One notification per send-buffer id bound to a newly connected handle.
    fn on_send_buffer(&self, _handle: EqHandle, _id: u32) {}

    /// Generic notification; a non-zero status reports a fault.
    fn on_event(&self, _handle: EqHandle, _kind: EventKind, _status: i32) {}

    /// The connection is being torn down.
    fn on_shutdown(&self, _handle: EqHandle) {}
}

/// Sink that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {}

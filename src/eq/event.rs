use crate::transport::CmEventKind;
use crate::transport::protocol::WrOp;
use std::fmt;

/// What a single `poll` observed, and the kind reported to
/// [`EventSink::on_event`](crate::eq::EventSink::on_event).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Nothing arrived before the poll timeout.
    None,
    ConnectRequest,
    Connected,
    Shutdown,
    Rejected,
    Error,
    SendComplete,
    RecvComplete,
    ReadComplete,
    Other(u32),
}

impl From<CmEventKind> for EventKind {
    fn from(kind: CmEventKind) -> Self {
        match kind {
            CmEventKind::ConnectRequest => EventKind::ConnectRequest,
            CmEventKind::Connected => EventKind::Connected,
            CmEventKind::Disconnected => EventKind::Shutdown,
            CmEventKind::Rejected => EventKind::Rejected,
            CmEventKind::Error => EventKind::Error,
            CmEventKind::Other(code) => EventKind::Other(code),
        }
    }
}

impl From<WrOp> for EventKind {
    fn from(op: WrOp) -> Self {
        match op {
            WrOp::Send => EventKind::SendComplete,
            WrOp::Recv => EventKind::RecvComplete,
            WrOp::Read => EventKind::ReadComplete,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::None => f.write_str("none"),
            EventKind::ConnectRequest => f.write_str("connect-request"),
            EventKind::Connected => f.write_str("connected"),
            EventKind::Shutdown => f.write_str("shutdown"),
            EventKind::Rejected => f.write_str("rejected"),
            EventKind::Error => f.write_str("error"),
            EventKind::SendComplete => f.write_str("send-complete"),
            EventKind::RecvComplete => f.write_str("recv-complete"),
            EventKind::ReadComplete => f.write_str("read-complete"),
            EventKind::Other(code) => write!(f, "other({code})"),
        }
    }
}

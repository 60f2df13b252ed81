//! Error type shared by every layer of the crate.

use crate::connection::ConnStatus;
use thiserror::Error;

/// Errors returned by buffer pools, connections, event queues and the service facade.
#[derive(Debug, Error)]
pub enum Error {
    /// An id or handle lookup missed.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: u64 },

    /// An id-less acquisition found no available chunk.
    #[error("no chunk available")]
    Empty,

    /// The connection status forbids the requested operation.
    #[error("{op} not allowed while connection is {status:?}")]
    InvalidState { op: &'static str, status: ConnStatus },

    /// The payload does not fit in one registered slot.
    #[error("payload of {len} bytes exceeds slot size {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// The underlying fabric reported a fault.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Invalid service configuration.
    #[error("invalid config: {0}")]
    Config(String),

    /// A bounded wait elapsed before the awaited condition held.
    #[error("timed out")]
    Timeout,

    /// The worker owning the object is gone.
    #[error("service closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<u64>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub(crate) fn transport(e: impl std::fmt::Display) -> Self {
        Error::TransportFailure(e.to_string())
    }

    /// Negative errno-style code used when a fault inside the poll loop is
    /// reported through an event notification instead of a return value.
    pub fn status_code(&self) -> i32 {
        match self {
            Error::NotFound { .. } => -2,
            Error::Empty => -12,
            Error::InvalidState { .. } | Error::PayloadTooLarge { .. } | Error::Config(_) => -22,
            Error::Timeout => -110,
            Error::Closed => -108,
            Error::Io(e) => e.raw_os_error().map_or(-5, |code| -code),
            Error::TransportFailure(_) => -5,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait to convert any Display error into a transport failure.
pub(crate) trait IntoTransportError<T> {
    fn transport_err(self) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoTransportError<T> for std::result::Result<T, E> {
    fn transport_err(self) -> Result<T> {
        self.map_err(Error::transport)
    }
}

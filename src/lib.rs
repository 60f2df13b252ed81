//! Connection-oriented RDMA transport.
//!
//! The crate turns a fabric's connection-management events and completion
//! queues into a connection object model:
//!
//! - [`memory::BufferPool`] holds registered [`memory::Chunk`]s keyed by id.
//! - [`connection::Connection`] carries a monotonic status
//!   (`Init` → `ConnectRequested`/`AcceptPending` → `Connected` →
//!   `ShutdownRequested` → `Down`) that other threads can wait on.
//! - [`eq::EqService`] owns one event channel and drives the connections
//!   created through it.
//! - [`Server`] and [`Client`] run one worker thread per event queue and
//!   dispatch completions to user callbacks.
//!
//! Fabrics plug in through the traits in [`transport`]. The in-process
//! [`drivers::loopback::LoopbackFabric`] is always available; the
//! rdma-cm/ibverbs fabric is behind the `rdma` feature.

pub mod config;
pub mod connection;
pub mod drivers;
pub mod eq;
pub mod error;
pub mod memory;
pub mod service;
pub mod transport;

pub use config::ServiceConfig;
pub use connection::{ConnStatus, ConnectionRef};
pub use error::{Error, Result};
pub use memory::{BufferPool, Chunk, RemoteBuf};
pub use service::{CallbackContext, Callbacks, Client, Server, Service};
pub use transport::{EqHandle, Fabric};

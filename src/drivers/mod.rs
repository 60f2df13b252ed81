//! Fabric drivers.

pub mod loopback;

#[cfg(feature = "rdma")]
pub mod rdma;

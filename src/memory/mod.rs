//! Registered memory: chunks, the id-keyed buffer pool and remote descriptors.

mod buffer_pool;
mod chunk;
mod remote_buf;

pub use buffer_pool::BufferPool;
pub use chunk::Chunk;
pub use remote_buf::RemoteBuf;

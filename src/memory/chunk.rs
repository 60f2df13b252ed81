use crate::memory::RemoteBuf;
use crate::transport::{EqHandle, MemoryRegion};
use std::fmt;

/// One registered buffer slot.
///
/// A chunk owns its fabric registration. The connection it serves is recorded
/// by handle only; the owning [`BufferPool`](crate::memory::BufferPool) is the
/// only place a chunk is ever dropped.
pub struct Chunk {
    id: u32,
    region: Option<Box<dyn MemoryRegion>>,
    connection: Option<EqHandle>,
}

impl Chunk {
    pub fn new(id: u32, region: Box<dyn MemoryRegion>) -> Self {
        Self {
            id,
            region: Some(region),
            connection: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }

    pub fn region(&self) -> Option<&dyn MemoryRegion> {
        self.region.as_deref()
    }

    pub fn is_registered(&self) -> bool {
        self.region.is_some()
    }

    pub fn addr(&self) -> u64 {
        self.region.as_ref().map_or(0, |r| r.addr())
    }

    pub fn len(&self) -> usize {
        self.region.as_ref().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lkey(&self) -> u32 {
        self.region.as_ref().map_or(0, |r| r.lkey())
    }

    /// Descriptor for one-sided access; empty once released.
    pub fn remote(&self) -> RemoteBuf {
        self.region
            .as_ref()
            .map_or_else(RemoteBuf::empty, |r| r.remote())
    }

    pub fn connection(&self) -> Option<EqHandle> {
        self.connection
    }

    pub fn bind(&mut self, handle: EqHandle) {
        self.connection = Some(handle);
    }

    pub fn unbind(&mut self) {
        self.connection = None;
    }

    pub fn read(&self, offset: usize, dst: &mut [u8]) -> usize {
        self.region.as_ref().map_or(0, |r| r.read_at(offset, dst))
    }

    pub fn write(&self, offset: usize, src: &[u8]) -> usize {
        self.region.as_ref().map_or(0, |r| r.write_at(offset, src))
    }

    /// Release the registration and clear every field.
    pub fn release(&mut self) {
        // Dropping the region hands the registration back to the fabric.
        self.region = None;
        self.connection = None;
        self.id = 0;
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .field("connection", &self.connection)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::loopback::LoopbackFabric;
    use crate::transport::Fabric;
    use bytes::BytesMut;

    fn chunk(id: u32, len: usize) -> Chunk {
        let fabric = LoopbackFabric::new();
        Chunk::new(id, fabric.register(BytesMut::zeroed(len)).unwrap())
    }

    #[test]
    fn test_chunk_basic() {
        let mut c = chunk(3, 128);
        assert_eq!(c.id(), 3);
        assert_eq!(c.len(), 128);
        assert!(c.is_registered());
        assert!(c.remote().is_valid());

        c.bind(EqHandle(8));
        assert_eq!(c.connection(), Some(EqHandle(8)));
        c.unbind();
        assert_eq!(c.connection(), None);
    }

    #[test]
    fn test_chunk_read_write() {
        let c = chunk(1, 16);
        assert_eq!(c.write(4, b"abcd"), 4);
        let mut out = [0u8; 4];
        assert_eq!(c.read(4, &mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(c.write(14, b"xyz"), 2);
    }

    #[test]
    fn test_chunk_release_clears_fields() {
        let mut c = chunk(5, 64);
        c.bind(EqHandle(2));
        c.release();
        assert_eq!(c.id(), 0);
        assert_eq!(c.addr(), 0);
        assert_eq!(c.len(), 0);
        assert_eq!(c.connection(), None);
        assert!(!c.is_registered());
        assert!(!c.remote().is_valid());
        assert_eq!(c.write(0, b"x"), 0);
    }
}

use super::Hub;
use crate::transport::MemoryRegion;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;

pub(super) type SharedMem = Arc<Mutex<BytesMut>>;

/// Memory registered with the loopback fabric.
///
/// Addresses are synthetic but unique per fabric, so remote descriptors
/// behave like real ones. Dropping the region removes it from the registry.
pub struct LoopbackRegion {
    hub: Arc<Hub>,
    key: u32,
    addr: u64,
    len: usize,
    mem: SharedMem,
}

impl LoopbackRegion {
    pub(super) fn new(hub: Arc<Hub>, buf: BytesMut) -> Self {
        let len = buf.len();
        let key = hub.next_key();
        let addr = hub.reserve_addr(len);
        let mem = Arc::new(Mutex::new(buf));
        hub.regions.insert(key, (addr, mem.clone()));
        Self {
            hub,
            key,
            addr,
            len,
            mem,
        }
    }
}

impl MemoryRegion for LoopbackRegion {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.len
    }

    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let mem = self.mem.lock();
        copy_out(&mem, offset, dst)
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let mut mem = self.mem.lock();
        copy_in(&mut mem, offset, src)
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        self.hub.regions.remove(&self.key);
    }
}

pub(super) fn copy_out(mem: &[u8], offset: usize, dst: &mut [u8]) -> usize {
    let Some(avail) = mem.len().checked_sub(offset) else {
        return 0;
    };
    let n = avail.min(dst.len());
    dst[..n].copy_from_slice(&mem[offset..offset + n]);
    n
}

pub(super) fn copy_in(mem: &mut [u8], offset: usize, src: &[u8]) -> usize {
    let Some(avail) = mem.len().checked_sub(offset) else {
        return 0;
    };
    let n = avail.min(src.len());
    mem[offset..offset + n].copy_from_slice(&src[..n]);
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_bounds() {
        let mut mem = vec![0u8; 8];
        assert_eq!(copy_in(&mut mem, 6, b"abc"), 2);
        assert_eq!(copy_in(&mut mem, 9, b"abc"), 0);
        let mut out = [0u8; 4];
        assert_eq!(copy_out(&mem, 6, &mut out), 2);
        assert_eq!(&out[..2], b"ab");
        assert_eq!(copy_out(&mem, 8, &mut out), 0);
    }
}

use super::context::RdmaContext;
use crate::error::{IntoTransportError, Result};
use crate::transport::MemoryRegion;
use bytes::BytesMut;
use sideway::ibverbs::memory_region::MemoryRegion as VerbsRegion;
use sideway::ibverbs::AccessFlags;
use std::ptr;
use std::sync::Arc;

/// A buffer registered with the device for local and remote access.
///
/// The buffer is owned by the region and never reallocated, so the address
/// handed to the device stays valid until the region is dropped.
pub struct RdmaRegion {
    mr: Arc<VerbsRegion>,
    buf: BytesMut,
    addr: u64,
}

// SAFETY: the buffer is only reached through `read_at`/`write_at`, which
// copy through the raw address; concurrent access to one range is the
// caller's concern, as it is for the device.
unsafe impl Send for RdmaRegion {}
unsafe impl Sync for RdmaRegion {}

impl RdmaRegion {
    pub fn register(context: &RdmaContext, mut buf: BytesMut) -> Result<Self> {
        let len = buf.len();
        let ptr = buf.as_mut_ptr();
        let access = AccessFlags::LocalWrite | AccessFlags::RemoteWrite | AccessFlags::RemoteRead;
        // SAFETY: `buf` is kept alive and unmoved inside the region.
        let mr = unsafe { context.pd.reg_mr(ptr as usize, len, access) }.transport_err()?;
        Ok(Self {
            mr,
            buf,
            addr: ptr as u64,
        })
    }

    fn bounds(&self, offset: usize, want: usize) -> usize {
        self.buf.len().saturating_sub(offset).min(want)
    }
}

impl MemoryRegion for RdmaRegion {
    fn addr(&self) -> u64 {
        self.addr
    }

    fn len(&self) -> usize {
        self.buf.len()
    }

    fn lkey(&self) -> u32 {
        self.mr.lkey()
    }

    fn rkey(&self) -> u32 {
        self.mr.rkey()
    }

    fn read_at(&self, offset: usize, dst: &mut [u8]) -> usize {
        let n = self.bounds(offset, dst.len());
        if n > 0 {
            // SAFETY: `offset + n` is within the registered buffer.
            unsafe {
                ptr::copy_nonoverlapping((self.addr as *const u8).add(offset), dst.as_mut_ptr(), n);
            }
        }
        n
    }

    fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        let n = self.bounds(offset, src.len());
        if n > 0 {
            // SAFETY: `offset + n` is within the registered buffer.
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), (self.addr as *mut u8).add(offset), n);
            }
        }
        n
    }
}

/// Remote buffer descriptor for one-sided RMA operations.
///
/// Holds the remote virtual address, length, and remote key (rkey) of a
/// registered region. A peer learns it from `Service::reg_rma_buffer` on the
/// owning side and passes it to `ConnectionRef::read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteBuf {
    addr: u64,
    length: u64,
    rkey: u32,
}

impl RemoteBuf {
    /// Size of the wire encoding produced by [`RemoteBuf::to_bytes`].
    pub const ENCODED_LEN: usize = 20;

    pub fn new(addr: u64, length: u64, rkey: u32) -> Self {
        Self { addr, length, rkey }
    }

    /// An invalid (empty) descriptor.
    pub fn empty() -> Self {
        Self {
            addr: 0,
            length: 0,
            rkey: 0,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn rkey(&self) -> u32 {
        self.rkey
    }

    pub fn is_valid(&self) -> bool {
        self.addr != 0 && self.length > 0
    }

    /// Create a subrange of this buffer.
    ///
    /// Returns an empty descriptor if the range does not fit.
    pub fn subrange(&self, offset: u64, len: u64) -> RemoteBuf {
        match offset.checked_add(len) {
            Some(end) if end <= self.length => RemoteBuf {
                addr: self.addr + offset,
                length: len,
                rkey: self.rkey,
            },
            _ => RemoteBuf::empty(),
        }
    }

    /// Byte offset of `other` inside this buffer, if `other` lies entirely within it.
    pub fn offset_of(&self, other: &RemoteBuf) -> Option<u64> {
        if other.rkey != self.rkey || other.addr < self.addr {
            return None;
        }
        let offset = other.addr - self.addr;
        let end = offset.checked_add(other.length)?;
        (end <= self.length).then_some(offset)
    }

    /// Little-endian `addr | len | rkey` encoding for advertising a buffer to a peer.
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut bytes = [0u8; Self::ENCODED_LEN];
        bytes[..8].copy_from_slice(&self.addr.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.length.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.rkey.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            addr: u64::from_le_bytes(bytes[..8].try_into().ok()?),
            length: u64::from_le_bytes(bytes[8..16].try_into().ok()?),
            rkey: u32::from_le_bytes(bytes[16..20].try_into().ok()?),
        })
    }
}

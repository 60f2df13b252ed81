//! Connection private-data handshake and work-request id encoding.
//!
//! Each side of a connection advertises its slot size, the number of receive
//! slots it has pre-posted and the ids of its send chunks. The bytes travel as
//! connection private data, so the layout is fixed and little-endian:
//!
//! ```text
//! u32 slot_size | u16 recv_slots | u16 count | count x u32 send id
//! ```

use crate::transport::EqHandle;

/// Fixed part of an encoded [`Handshake`].
pub const HANDSHAKE_HEADER_LEN: usize = 8;

/// Upper bound on the send ids a single handshake can carry.
pub const MAX_HANDSHAKE_IDS: usize = u16::MAX as usize;

// Work-request id layout:
// - top 28 bits: event-queue handle
// - next 4 bits: operation kind
// - low 32 bits: chunk id
const WR_HANDLE_SHIFT: u32 = 36;
const WR_OP_SHIFT: u32 = 32;
const WR_OP_MASK: u64 = 0xF;
const WR_ID_MASK: u64 = 0xFFFF_FFFF;

/// Largest handle value that survives work-request id packing.
pub const MAX_WR_HANDLE: u64 = (1 << (64 - WR_HANDLE_SHIFT)) - 1;

/// Buffer-id agreement exchanged while a connection is being established.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub slot_size: u32,
    pub recv_slots: u16,
    pub send_ids: Vec<u32>,
}

impl Handshake {
    pub fn new(slot_size: u32, recv_slots: u16, send_ids: Vec<u32>) -> Self {
        Self {
            slot_size,
            recv_slots,
            send_ids,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HANDSHAKE_HEADER_LEN + 4 * self.send_ids.len()
    }

    /// Encode into private-data bytes. Ids beyond [`MAX_HANDSHAKE_IDS`] are dropped.
    pub fn encode(&self) -> Vec<u8> {
        let count = self.send_ids.len().min(MAX_HANDSHAKE_IDS);
        let mut out = Vec::with_capacity(HANDSHAKE_HEADER_LEN + 4 * count);
        out.extend_from_slice(&self.slot_size.to_le_bytes());
        out.extend_from_slice(&self.recv_slots.to_le_bytes());
        out.extend_from_slice(&(count as u16).to_le_bytes());
        for id in &self.send_ids[..count] {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }

    /// Decode private-data bytes.
    ///
    /// Returns `None` when the buffer is shorter than the header or than the
    /// id count it announces. Trailing bytes are ignored, since fabrics may pad
    /// private data.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HANDSHAKE_HEADER_LEN {
            return None;
        }
        let slot_size = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let recv_slots = u16::from_le_bytes(bytes[4..6].try_into().ok()?);
        let count = u16::from_le_bytes(bytes[6..8].try_into().ok()?) as usize;
        let body = bytes.get(HANDSHAKE_HEADER_LEN..HANDSHAKE_HEADER_LEN + 4 * count)?;
        let send_ids = body
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            slot_size,
            recv_slots,
            send_ids,
        })
    }
}

/// Operation a work request was posted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WrOp {
    Send = 1,
    Recv = 2,
    Read = 3,
}

impl WrOp {
    fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            1 => Some(WrOp::Send),
            2 => Some(WrOp::Recv),
            3 => Some(WrOp::Read),
            _ => None,
        }
    }
}

/// Decoded form of a 64-bit work-request id.
///
/// Error completions only guarantee a valid `wr_id`, so the owning handle and
/// the operation are carried inside it rather than taken from the completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrId {
    pub handle: EqHandle,
    pub op: WrOp,
    pub chunk: u32,
}

impl WrId {
    pub fn new(handle: EqHandle, op: WrOp, chunk: u32) -> Self {
        Self { handle, op, chunk }
    }

    /// Pack into a `wr_id`. Handle bits above [`MAX_WR_HANDLE`] are truncated.
    #[inline]
    pub fn encode(&self) -> u64 {
        ((self.handle.0 & MAX_WR_HANDLE) << WR_HANDLE_SHIFT)
            | ((self.op as u64 & WR_OP_MASK) << WR_OP_SHIFT)
            | (self.chunk as u64 & WR_ID_MASK)
    }

    #[inline]
    pub fn decode(wr_id: u64) -> Option<Self> {
        let op = WrOp::from_bits((wr_id >> WR_OP_SHIFT) & WR_OP_MASK)?;
        Some(Self {
            handle: EqHandle(wr_id >> WR_HANDLE_SHIFT),
            op,
            chunk: (wr_id & WR_ID_MASK) as u32,
        })
    }
}

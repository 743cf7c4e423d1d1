//! The raw RPC envelope of §6: `u64 type || u64 body_len`, little-endian,
//! followed by a type-specific body. This module only deals in byte framing
//! (used by an embedder's transport); application messages within this
//! crate travel as typed Rust values, not through this codec.

use crate::error::DecodeError;

/// The `u64 type` discriminant of §6.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageType {
    RequestVote = 1,
    RequestVoteResult = 2,
    AppendEntries = 3,
    AppendEntriesResult = 4,
    InstallSnapshot = 5,
    InstallSnapshotResult = 6,
}

impl MessageType {
    fn from_u64(v: u64) -> Option<Self> {
        Some(match v {
            1 => MessageType::RequestVote,
            2 => MessageType::RequestVoteResult,
            3 => MessageType::AppendEntries,
            4 => MessageType::AppendEntriesResult,
            5 => MessageType::InstallSnapshot,
            6 => MessageType::InstallSnapshotResult,
            _ => return None,
        })
    }
}

/// Writes the `u64 type || u64 body_len` preamble ahead of `body`.
pub fn frame(msg_type: MessageType, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + body.len());
    out.extend_from_slice(&(msg_type as u64).to_le_bytes());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// Parses the preamble off `buf`, returning `(type, body)`. Unknown type
/// codes are rejected as malformed (§8 round-trip laws); a `body_len`
/// overrunning the buffer is `Truncated`.
pub fn unframe(buf: &[u8]) -> Result<(MessageType, &[u8]), DecodeError> {
    let type_bytes = buf.get(0..8).ok_or(DecodeError::Truncated)?;
    let len_bytes = buf.get(8..16).ok_or(DecodeError::Truncated)?;
    let msg_type = u64::from_le_bytes(type_bytes.try_into().unwrap());
    let body_len = u64::from_le_bytes(len_bytes.try_into().unwrap()) as usize;
    let msg_type = MessageType::from_u64(msg_type).ok_or(DecodeError::UnknownType)?;
    let body = buf.get(16..16 + body_len).ok_or(DecodeError::Truncated)?;
    Ok((msg_type, body))
}

/// A 16-byte AppendEntries entry header: `u64 term || u8 type || 3 reserved
/// bytes || u32 payload_len` (§6).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryHeader {
    pub term: u64,
    pub entry_type: u8,
    pub payload_len: u32,
}

impl EntryHeader {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.term.to_le_bytes());
        buf[8] = self.entry_type;
        // buf[9..12] left as reserved zero bytes.
        buf[12..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(DecodeError::Truncated);
        }
        let term = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let entry_type = buf[8];
        let payload_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        Ok(Self {
            term,
            entry_type,
            payload_len,
        })
    }
}

/// Rounds `len` up to the next multiple of 8, per §6's "padded to 8 bytes"
/// rule applied to every entry payload and to the whole configuration block.
pub fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

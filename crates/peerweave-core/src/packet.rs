//! Packet framing: whole items, slices and groups.
//!
//! Each decrypted transport record carries exactly one packet. The first
//! byte tells the two forms apart:
//!
//!   0x02  a whole item (see [`crate::wire::ItemHeader`])
//!   0x10  a slice (see [`crate::wire::SliceHeader`])
//!
//! Outbound, [`Packer`] turns encoded items into packets according to the
//! local slicing/grouping mode. Inbound, [`Reassembler`] accepts every form
//! regardless of local configuration.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use zerocopy::AsBytes;

use crate::codec::CodecError;
use crate::item::{split_items, Priority};
use crate::wire::{
    ItemHeader, PacketKind, SliceHeader, WireError, MAX_ITEM_SIZE, MAX_SLICE_ID,
    OPTIMAL_SLICE_SIZE, SLICE_FLAG_END, SLICE_FLAG_START, SLICE_HEADER_SIZE,
};

/// Slices in flight per connection before new packets are refused.
pub const MAX_CONCURRENT_PACKETS: usize = 16;

/// Slices that may make up one packet.
pub const MAX_SLICES: usize = 32;

/// Largest item that is sliced. Bigger items go out whole, since the peer
/// would refuse them past [`MAX_SLICES`].
pub const MAX_SLICED_ITEM: usize = MAX_SLICES * OPTIMAL_SLICE_SIZE;

/// How outbound items are framed on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceMode {
    /// Every item travels as its own packet.
    Whole,
    /// Large items are cut into slices.
    Slicing,
    /// Slicing, and small items are coalesced into grouped slices.
    Grouping,
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// Turns encoded items into outbound packets.
///
/// With grouping, small items wait in a pending group until it would
/// overflow, a realtime item arrives, or the caller flushes. Anything that
/// bypasses the group flushes it first, so packets leave in item order.
#[derive(Debug)]
pub struct Packer {
    mode: SliceMode,
    next_id: u32,
    group: Vec<u8>,
}

impl Packer {
    pub fn new(mode: SliceMode) -> Self {
        Self { mode, next_id: 0, group: Vec::new() }
    }

    pub fn mode(&self) -> SliceMode {
        self.mode
    }

    /// Switch framing mode. Any pending group is returned so it is not lost.
    pub fn set_mode(&mut self, mode: SliceMode) -> Option<Bytes> {
        let pending = self.flush();
        self.mode = mode;
        pending
    }

    /// Frame one encoded item. Returns the packets ready to send now.
    pub fn push(&mut self, item: Bytes, priority: Priority) -> Vec<Bytes> {
        let mut out = Vec::new();
        match self.mode {
            SliceMode::Whole => out.push(item),
            SliceMode::Slicing => {
                if item.len() <= OPTIMAL_SLICE_SIZE {
                    let id = self.take_id();
                    out.push(slice(SLICE_FLAG_START | SLICE_FLAG_END, id, &item));
                } else {
                    self.cut(item, &mut out);
                }
            }
            SliceMode::Grouping => {
                if item.len() > OPTIMAL_SLICE_SIZE {
                    out.extend(self.flush());
                    self.cut(item, &mut out);
                } else {
                    if self.group.len() + item.len() > OPTIMAL_SLICE_SIZE {
                        out.extend(self.flush());
                    }
                    self.group.extend_from_slice(&item);
                    if priority == Priority::Realtime {
                        out.extend(self.flush());
                    }
                }
            }
        }
        out
    }

    /// Emit the pending group, if any.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.group.is_empty() {
            return None;
        }
        let id = self.take_id();
        let packet = slice(SLICE_FLAG_START | SLICE_FLAG_END, id, &self.group);
        self.group.clear();
        Some(packet)
    }

    fn cut(&mut self, item: Bytes, out: &mut Vec<Bytes>) {
        if item.len() > MAX_SLICED_ITEM {
            out.push(item);
            return;
        }
        let id = self.take_id();
        let pieces = item.len().div_ceil(OPTIMAL_SLICE_SIZE);
        for (i, piece) in item.chunks(OPTIMAL_SLICE_SIZE).enumerate() {
            let mut flags = 0;
            if i == 0 {
                flags |= SLICE_FLAG_START;
            }
            if i + 1 == pieces {
                flags |= SLICE_FLAG_END;
            }
            out.push(slice(flags, id, piece));
        }
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = (self.next_id + 1) % MAX_SLICE_ID;
        id
    }
}

fn slice(flags: u8, packet_id: u32, payload: &[u8]) -> Bytes {
    // Payloads never exceed OPTIMAL_SLICE_SIZE, well inside u16.
    let header = SliceHeader::new(flags, packet_id, payload.len() as u16);
    let mut packet = Vec::with_capacity(SLICE_HEADER_SIZE + payload.len());
    packet.extend_from_slice(header.as_bytes());
    packet.extend_from_slice(payload);
    Bytes::from(packet)
}

// ── Inbound ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Partial {
    buf: Vec<u8>,
    slices: usize,
}

/// Reassembles inbound packets into complete item buffers.
///
/// A rejected slice discards its partial packet and nothing else; other
/// packets in flight are unaffected.
#[derive(Debug, Default)]
pub struct Reassembler {
    partial: HashMap<u32, Partial>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets currently awaiting more slices.
    pub fn in_flight(&self) -> usize {
        self.partial.len()
    }

    /// Accept one packet. Returns the complete item buffers it finished.
    pub fn accept(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, SliceError> {
        let first = *packet.first().ok_or(WireError::Empty)?;
        match PacketKind::try_from(first)? {
            PacketKind::Item => {
                let header = ItemHeader::parse(packet)?;
                if header.item_len() != packet.len() {
                    return Err(WireError::Truncated { need: header.item_len(), have: packet.len() }.into());
                }
                Ok(vec![Bytes::copy_from_slice(packet)])
            }
            PacketKind::Slice => self.accept_slice(packet),
        }
    }

    fn accept_slice(&mut self, packet: &[u8]) -> Result<Vec<Bytes>, SliceError> {
        let header = SliceHeader::parse(packet)?;
        let id = header.packet_id.get();
        let payload = &packet[SLICE_HEADER_SIZE..];

        match (header.is_start(), header.is_end()) {
            (true, true) => finish(payload),
            (true, false) => {
                if self.partial.contains_key(&id) {
                    self.partial.remove(&id);
                    return Err(SliceError::DuplicateStart(id));
                }
                if self.partial.len() >= MAX_CONCURRENT_PACKETS {
                    return Err(SliceError::TooManyPackets);
                }
                self.partial.insert(id, Partial { buf: payload.to_vec(), slices: 1 });
                Ok(Vec::new())
            }
            (false, end) => {
                let partial = self.partial.get_mut(&id).ok_or(SliceError::MissingStart(id))?;
                partial.slices += 1;
                partial.buf.extend_from_slice(payload);
                if partial.slices > MAX_SLICES {
                    self.partial.remove(&id);
                    return Err(SliceError::TooManySlices(id));
                }
                if partial.buf.len() > MAX_ITEM_SIZE {
                    self.partial.remove(&id);
                    return Err(SliceError::TooLarge(id));
                }
                if !end {
                    return Ok(Vec::new());
                }
                match self.partial.remove(&id) {
                    Some(done) => finish(&done.buf),
                    None => Err(SliceError::MissingStart(id)),
                }
            }
        }
    }
}

fn finish(buf: &[u8]) -> Result<Vec<Bytes>, SliceError> {
    Ok(split_items(buf)?.into_iter().map(Bytes::copy_from_slice).collect())
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reassembly failures. All are framing errors: the offending packet is
/// dropped and the connection carries on.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SliceError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("slice packet {0} started twice")]
    DuplicateStart(u32),
    #[error("slice for packet {0} arrived without a start")]
    MissingStart(u32),
    #[error("slice packet {0} exceeds the slice limit")]
    TooManySlices(u32),
    #[error("too many slice packets in flight")]
    TooManyPackets,
    #[error("slice packet {0} exceeds the maximum item size")]
    TooLarge(u32),
}

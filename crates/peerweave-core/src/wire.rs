//! Peerweave wire format: fixed headers that precede every item and slice.
//!
//! These types ARE the protocol. Every field and every size is part of the
//! wire format shared with other peers; changing anything here breaks
//! interoperability.
//!
//! All multi-byte integers are big-endian. Headers use zerocopy derives with
//! alignment-1 big-endian field types, so they can be read straight out of a
//! received buffer without copying. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Version byte of a whole (unsliced) item.
pub const ITEM_VERSION: u8 = 0x02;

/// Size of [`ItemHeader`] on the wire.
pub const ITEM_HEADER_SIZE: usize = 8;

/// Largest item accepted in either direction, header included.
pub const MAX_ITEM_SIZE: usize = 262_143;

/// Version byte of a slice packet.
pub const SLICE_VERSION: u8 = 0x10;

/// Size of [`SliceHeader`] on the wire.
pub const SLICE_HEADER_SIZE: usize = 8;

/// Preferred slice payload size. Items are cut into pieces of this size.
pub const OPTIMAL_SLICE_SIZE: usize = 512;

/// Slice packet ids live in a 24-bit space.
pub const MAX_SLICE_ID: u32 = 1 << 24;

/// Slice flag: first slice of a packet.
pub const SLICE_FLAG_START: u8 = 0x01;

/// Slice flag: last slice of a packet.
pub const SLICE_FLAG_END: u8 = 0x02;

// ── Item Header ───────────────────────────────────────────────────────────────

/// Header of every item.
///
/// `length` counts the whole item, header included. The payload that follows
/// is a sequence of tagged fields (see [`crate::codec`]); the payload never
/// repeats the service or sub-type.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ItemHeader {
    /// Always [`ITEM_VERSION`].
    pub version: u8,
    pub service_type: U16<BigEndian>,
    pub sub_type: u8,
    pub length: U32<BigEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(ItemHeader, [u8; ITEM_HEADER_SIZE]);

impl ItemHeader {
    pub fn new(service_type: u16, sub_type: u8, length: u32) -> Self {
        Self {
            version: ITEM_VERSION,
            service_type: U16::new(service_type),
            sub_type,
            length: U32::new(length),
        }
    }

    /// Read and validate the header at the front of `bytes`.
    ///
    /// Only the header is checked against `bytes`; whether the full item is
    /// present is left to the caller, which knows if it expects a prefix.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: ITEM_HEADER_SIZE,
            have: bytes.len(),
        })?;
        if header.version != ITEM_VERSION {
            return Err(WireError::BadVersion(header.version));
        }
        let length = header.length.get() as usize;
        if !(ITEM_HEADER_SIZE..=MAX_ITEM_SIZE).contains(&length) {
            return Err(WireError::BadLength(header.length.get()));
        }
        Ok(header)
    }

    pub fn service_type(&self) -> u16 {
        self.service_type.get()
    }

    /// Total item length, header included.
    pub fn item_len(&self) -> usize {
        self.length.get() as usize
    }
}

// ── Slice Header ──────────────────────────────────────────────────────────────

/// Header of a slice packet.
///
/// A slice carrying both START and END holds one or more complete items
/// back to back (grouping). Any other combination is one piece of a single
/// item that is reassembled by packet id.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SliceHeader {
    /// Always [`SLICE_VERSION`].
    pub version: u8,
    pub flags: u8,
    pub packet_id: U32<BigEndian>,
    /// Payload length, header excluded.
    pub size: U16<BigEndian>,
}

assert_eq_size!(SliceHeader, [u8; SLICE_HEADER_SIZE]);

impl SliceHeader {
    pub fn new(flags: u8, packet_id: u32, size: u16) -> Self {
        Self {
            version: SLICE_VERSION,
            flags,
            packet_id: U32::new(packet_id),
            size: U16::new(size),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let header = Self::read_from_prefix(bytes).ok_or(WireError::Truncated {
            need: SLICE_HEADER_SIZE,
            have: bytes.len(),
        })?;
        if header.version != SLICE_VERSION {
            return Err(WireError::BadVersion(header.version));
        }
        if header.packet_id.get() >= MAX_SLICE_ID {
            return Err(WireError::BadPacketId(header.packet_id.get()));
        }
        let have = bytes.len() - SLICE_HEADER_SIZE;
        let need = header.size.get() as usize;
        if need != have {
            return Err(WireError::Truncated { need, have });
        }
        Ok(header)
    }

    pub fn is_start(&self) -> bool {
        self.flags & SLICE_FLAG_START != 0
    }

    pub fn is_end(&self) -> bool {
        self.flags & SLICE_FLAG_END != 0
    }
}

// ── Packet kind ───────────────────────────────────────────────────────────────

/// What the first byte of a decrypted packet announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Item,
    Slice,
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            ITEM_VERSION => Ok(PacketKind::Item),
            SLICE_VERSION => Ok(PacketKind::Slice),
            _ => Err(WireError::BadVersion(v)),
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Framing errors. They reject one frame; they never justify closing a
/// connection on their own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unknown packet version {0:#04x}")]
    BadVersion(u8),
    #[error("item length {0} out of range")]
    BadLength(u32),
    #[error("slice packet id {0} out of range")]
    BadPacketId(u32),
    #[error("empty packet")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_header_is_big_endian() {
        let header = ItemHeader::new(0xAABB, 0xCC, 8);
        assert_eq!(header.as_bytes(), &[0x02, 0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn item_header_parse_roundtrip() {
        let header = ItemHeader::new(0x1011, 2, 40);
        let parsed = ItemHeader::parse(header.as_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.service_type(), 0x1011);
        assert_eq!(parsed.item_len(), 40);
    }

    #[test]
    fn item_header_rejects_short_buffer() {
        let err = ItemHeader::parse(&[0x02, 0x00, 0x16]).unwrap_err();
        assert_eq!(err, WireError::Truncated { need: 8, have: 3 });
    }

    #[test]
    fn item_header_rejects_length_below_header() {
        let header = ItemHeader::new(0x16, 1, 4);
        assert_eq!(ItemHeader::parse(header.as_bytes()), Err(WireError::BadLength(4)));
    }

    #[test]
    fn item_header_rejects_oversized_item() {
        let header = ItemHeader::new(0x16, 1, MAX_ITEM_SIZE as u32 + 1);
        assert!(ItemHeader::parse(header.as_bytes()).is_err());
    }

    #[test]
    fn slice_header_checks_payload_size() {
        let header = SliceHeader::new(SLICE_FLAG_START, 7, 3);
        let mut packet = header.as_bytes().to_vec();
        packet.extend_from_slice(&[1, 2, 3]);
        let parsed = SliceHeader::parse(&packet).unwrap();
        assert!(parsed.is_start());
        assert!(!parsed.is_end());

        packet.pop();
        assert!(SliceHeader::parse(&packet).is_err(), "short payload must be rejected");
    }

    #[test]
    fn slice_header_rejects_wide_packet_id() {
        let header = SliceHeader::new(SLICE_FLAG_START | SLICE_FLAG_END, MAX_SLICE_ID, 0);
        assert_eq!(
            SliceHeader::parse(header.as_bytes()),
            Err(WireError::BadPacketId(MAX_SLICE_ID))
        );
    }

    #[test]
    fn packet_kind_from_first_byte() {
        assert_eq!(PacketKind::try_from(0x02), Ok(PacketKind::Item));
        assert_eq!(PacketKind::try_from(0x10), Ok(PacketKind::Slice));
        assert!(PacketKind::try_from(0x01).is_err());
    }
}

//! Item model: every message exchanged between peers.
//!
//! An item is identified on the wire by `(service_type, sub_type)`. The set
//! of shapes is closed: [`Item`] has one variant per shape and [`SHAPES`] is
//! the process-wide table mapping identifiers to descriptor tables. Items are
//! plain values, so cloning one yields a fully independent copy.

use bytes::Bytes;
use zerocopy::AsBytes;

use crate::codec::{decode_fields, encode_fields, CodecError, FieldKind, FieldSpec, Value};
use crate::wire::{ItemHeader, ITEM_HEADER_SIZE, MAX_ITEM_SIZE};

/// Service type identifiers.
pub mod service_type {
    pub const CHAT: u16 = 0x0012;
    pub const HEARTBEAT: u16 = 0x0016;
    pub const SERVICE_INFO: u16 = 0x0020;
    pub const BANDWIDTH_CONTROL: u16 = 0x0021;
    pub const RTT: u16 = 0x1011;
    /// Reserved for the slice-capability probe. Never announced.
    pub const SLICE_PROBE: u16 = 0xAABB;
}

/// Deliberately unusual sub-type of the slice probe.
pub const SLICE_PROBE_SUB_TYPE: u8 = 0xCC;

// ── Priority ──────────────────────────────────────────────────────────────────

/// Outbound ordering hint. `Realtime > High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Realtime,
}

// ── Shapes ────────────────────────────────────────────────────────────────────

/// One decodable item shape.
#[derive(Debug)]
pub struct Shape {
    pub service_type: u16,
    pub sub_type: u8,
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

const SERVICE_INFO_FIELDS: &[FieldSpec] = &[
    FieldSpec::new(0x0051, "name", FieldKind::Str),
    FieldSpec::new(0x0030, "service_type", FieldKind::U16),
    FieldSpec::new(0x0031, "version_major", FieldKind::U16),
    FieldSpec::new(0x0032, "version_minor", FieldKind::U16),
    FieldSpec::new(0x0033, "min_version_major", FieldKind::U16),
    FieldSpec::new(0x0034, "min_version_minor", FieldKind::U16),
];

const SERVICE_LIST_FIELDS: &[FieldSpec] =
    &[FieldSpec::new(0x0001, "services", FieldKind::List(SERVICE_INFO_FIELDS))];

const RTT_PING_FIELDS: &[FieldSpec] = &[
    FieldSpec::new(0x0030, "seq", FieldKind::U32),
    FieldSpec::new(0x0040, "ping_ts", FieldKind::U64),
];

const RTT_PONG_FIELDS: &[FieldSpec] = &[
    FieldSpec::new(0x0030, "seq", FieldKind::U32),
    FieldSpec::new(0x0040, "ping_ts", FieldKind::U64),
    FieldSpec::new(0x0041, "pong_ts", FieldKind::U64),
];

const BANDWIDTH_FIELDS: &[FieldSpec] =
    &[FieldSpec::new(0x0035, "bytes_per_sec", FieldKind::U32)];

const CHALLENGE_FIELDS: &[FieldSpec] = &[FieldSpec::new(0x0040, "code", FieldKind::U64)];

/// Every shape this node can decode. Built at compile time, never mutated.
pub static SHAPES: &[Shape] = &[
    Shape { service_type: service_type::HEARTBEAT, sub_type: 0x01, name: "heartbeat", fields: &[] },
    Shape {
        service_type: service_type::SERVICE_INFO,
        sub_type: 0x01,
        name: "service_list",
        fields: SERVICE_LIST_FIELDS,
    },
    Shape { service_type: service_type::RTT, sub_type: 0x01, name: "rtt_ping", fields: RTT_PING_FIELDS },
    Shape { service_type: service_type::RTT, sub_type: 0x02, name: "rtt_pong", fields: RTT_PONG_FIELDS },
    Shape {
        service_type: service_type::BANDWIDTH_CONTROL,
        sub_type: 0x01,
        name: "bandwidth_allowed",
        fields: BANDWIDTH_FIELDS,
    },
    Shape {
        service_type: service_type::CHAT,
        sub_type: 0x09,
        name: "chat_challenge",
        fields: CHALLENGE_FIELDS,
    },
    Shape {
        service_type: service_type::SLICE_PROBE,
        sub_type: SLICE_PROBE_SUB_TYPE,
        name: "slice_probe",
        fields: &[],
    },
];

/// Look up the shape registered for an identifier pair.
pub fn shape_of(service_type: u16, sub_type: u8) -> Option<&'static Shape> {
    SHAPES
        .iter()
        .find(|s| s.service_type == service_type && s.sub_type == sub_type)
}

// ── Item ──────────────────────────────────────────────────────────────────────

/// Announced description of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub service_type: u16,
    pub version_major: u16,
    pub version_minor: u16,
    pub min_version_major: u16,
    pub min_version_minor: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Heartbeat,
    ServiceList { services: Vec<ServiceInfo> },
    RttPing { seq: u32, ping_ts: u64 },
    RttPong { seq: u32, ping_ts: u64, pong_ts: u64 },
    BandwidthAllowed { bytes_per_sec: u32 },
    ChatChallenge { code: u64 },
    SliceProbe,
}

impl Item {
    pub fn service_type(&self) -> u16 {
        self.shape().service_type
    }

    pub fn sub_type(&self) -> u8 {
        self.shape().sub_type
    }

    pub fn name(&self) -> &'static str {
        self.shape().name
    }

    pub fn priority(&self) -> Priority {
        match self {
            Item::Heartbeat | Item::RttPing { .. } | Item::RttPong { .. } | Item::SliceProbe => {
                Priority::Realtime
            }
            Item::BandwidthAllowed { .. } => Priority::High,
            Item::ServiceList { .. } => Priority::Normal,
            Item::ChatChallenge { .. } => Priority::Low,
        }
    }

    fn shape(&self) -> &'static Shape {
        let index = match self {
            Item::Heartbeat => 0,
            Item::ServiceList { .. } => 1,
            Item::RttPing { .. } => 2,
            Item::RttPong { .. } => 3,
            Item::BandwidthAllowed { .. } => 4,
            Item::ChatChallenge { .. } => 5,
            Item::SliceProbe => 6,
        };
        &SHAPES[index]
    }

    fn values(&self) -> Vec<Value> {
        match self {
            Item::Heartbeat | Item::SliceProbe => Vec::new(),
            Item::ServiceList { services } => vec![Value::List(
                services
                    .iter()
                    .map(|s| {
                        vec![
                            Value::Str(s.name.clone()),
                            Value::U16(s.service_type),
                            Value::U16(s.version_major),
                            Value::U16(s.version_minor),
                            Value::U16(s.min_version_major),
                            Value::U16(s.min_version_minor),
                        ]
                    })
                    .collect(),
            )],
            Item::RttPing { seq, ping_ts } => vec![Value::U32(*seq), Value::U64(*ping_ts)],
            Item::RttPong { seq, ping_ts, pong_ts } => {
                vec![Value::U32(*seq), Value::U64(*ping_ts), Value::U64(*pong_ts)]
            }
            Item::BandwidthAllowed { bytes_per_sec } => vec![Value::U32(*bytes_per_sec)],
            Item::ChatChallenge { code } => vec![Value::U64(*code)],
        }
    }

    fn from_values(shape: &'static Shape, values: Vec<Value>) -> Result<Self, CodecError> {
        let mismatch = || CodecError::ShapeMismatch(shape.name);
        let item = match (shape.name, values.as_slice()) {
            ("heartbeat", []) => Item::Heartbeat,
            ("slice_probe", []) => Item::SliceProbe,
            ("service_list", [Value::List(entries)]) => {
                let services = entries
                    .iter()
                    .map(|entry| match entry.as_slice() {
                        [Value::Str(name), Value::U16(service_type), Value::U16(version_major), Value::U16(version_minor), Value::U16(min_version_major), Value::U16(min_version_minor)] => {
                            Ok(ServiceInfo {
                                name: name.clone(),
                                service_type: *service_type,
                                version_major: *version_major,
                                version_minor: *version_minor,
                                min_version_major: *min_version_major,
                                min_version_minor: *min_version_minor,
                            })
                        }
                        _ => Err(mismatch()),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Item::ServiceList { services }
            }
            ("rtt_ping", [Value::U32(seq), Value::U64(ping_ts)]) => {
                Item::RttPing { seq: *seq, ping_ts: *ping_ts }
            }
            ("rtt_pong", [Value::U32(seq), Value::U64(ping_ts), Value::U64(pong_ts)]) => {
                Item::RttPong { seq: *seq, ping_ts: *ping_ts, pong_ts: *pong_ts }
            }
            ("bandwidth_allowed", [Value::U32(bytes_per_sec)]) => {
                Item::BandwidthAllowed { bytes_per_sec: *bytes_per_sec }
            }
            ("chat_challenge", [Value::U64(code)]) => Item::ChatChallenge { code: *code },
            _ => return Err(mismatch()),
        };
        Ok(item)
    }
}

// ── Encode / decode ───────────────────────────────────────────────────────────

/// Encode an item: header followed by its tagged fields.
///
/// The result is immutable and cheap to clone, so one encoding can be queued
/// for several connections.
pub fn encode(item: &Item) -> Result<Bytes, CodecError> {
    let shape = item.shape();
    let mut out = vec![0u8; ITEM_HEADER_SIZE];
    encode_fields(shape.fields, &item.values(), &mut out)?;
    if out.len() > MAX_ITEM_SIZE {
        return Err(CodecError::TooLarge(out.len()));
    }
    let header = ItemHeader::new(shape.service_type, shape.sub_type, out.len() as u32);
    out[..ITEM_HEADER_SIZE].copy_from_slice(header.as_bytes());
    Ok(Bytes::from(out))
}

/// Decode exactly one item occupying all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Item, CodecError> {
    let header = ItemHeader::parse(bytes)?;
    let len = header.item_len();
    if len > bytes.len() {
        return Err(CodecError::Truncated { need: len, have: bytes.len() });
    }
    if len < bytes.len() {
        return Err(CodecError::TrailingBytes(bytes.len() - len));
    }
    let shape = shape_of(header.service_type(), header.sub_type).ok_or(CodecError::UnknownItem {
        service_type: header.service_type(),
        sub_type: header.sub_type,
    })?;
    let values = decode_fields(shape.fields, &bytes[ITEM_HEADER_SIZE..])?;
    Item::from_values(shape, values)
}

/// Split a buffer of back-to-back items into one slice per item.
///
/// Used for grouped slices. Only the headers are inspected here; each piece
/// is decoded separately so one bad item does not poison its neighbours.
pub fn split_items(mut buf: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut items = Vec::new();
    while !buf.is_empty() {
        let header = ItemHeader::parse(buf)?;
        let len = header.item_len();
        if len > buf.len() {
            return Err(CodecError::Truncated { need: len, have: buf.len() });
        }
        let (item, rest) = buf.split_at(len);
        items.push(item);
        buf = rest;
    }
    Ok(items)
}

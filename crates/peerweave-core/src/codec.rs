//! Tagged-field codec.
//!
//! Every item payload is a fixed, ordered sequence of tagged fields:
//!
//! ```text
//!   tag: u16 | length: u32 (header included) | value
//! ```
//!
//! Item shapes declare their fields as a static descriptor table
//! (`&[FieldSpec]`). The generic routines here walk that table, so no item
//! carries its own hand-written encoder. Decoding checks every length against
//! the bytes actually remaining and fails with a framing error instead of
//! reading past the end.

use thiserror::Error;

use crate::wire::WireError;

/// Size of a tagged field header.
pub const FIELD_HEADER_SIZE: usize = 6;

/// Tag wrapping each element of a list field.
pub const ENTRY_TAG: u16 = 0x0001;

// ── Descriptors ───────────────────────────────────────────────────────────────

/// Wire type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    Bool,
    /// UTF-8 text, length taken from the field header.
    Str,
    Bytes,
    /// u32 count followed by `count` entry records, each a nested field set.
    List(&'static [FieldSpec]),
}

/// One entry of a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub tag: u16,
    pub name: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn new(tag: u16, name: &'static str, kind: FieldKind) -> Self {
        Self { tag, name, kind }
    }
}

/// A decoded (or to-be-encoded) field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Vec<Value>>),
}

/// Pack a wider signed quantity into an unsigned 32-bit field.
///
/// Anything at or above 2^32 becomes `0xFFFF_FFFF` and negatives become 0.
/// Values in range are stored as-is and read back unchanged as unsigned.
pub fn pack_u32_saturating(value: i64) -> u32 {
    value.clamp(0, u32::MAX as i64) as u32
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Append `values` to `out` in the order declared by `specs`.
///
/// A value whose variant does not match its descriptor is a programming
/// error in the item shape and is reported as [`CodecError::ShapeMismatch`].
pub fn encode_fields(
    specs: &[FieldSpec],
    values: &[Value],
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    if specs.len() != values.len() {
        return Err(CodecError::ShapeMismatch("field count"));
    }
    for (spec, value) in specs.iter().zip(values) {
        let start = out.len();
        out.extend_from_slice(&spec.tag.to_be_bytes());
        out.extend_from_slice(&[0u8; 4]);

        match (spec.kind, value) {
            (FieldKind::U8, Value::U8(v)) => out.push(*v),
            (FieldKind::U16, Value::U16(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (FieldKind::U32, Value::U32(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (FieldKind::U64, Value::U64(v)) => out.extend_from_slice(&v.to_be_bytes()),
            (FieldKind::Bool, Value::Bool(v)) => out.push(u8::from(*v)),
            (FieldKind::Str, Value::Str(v)) => out.extend_from_slice(v.as_bytes()),
            (FieldKind::Bytes, Value::Bytes(v)) => out.extend_from_slice(v),
            (FieldKind::List(entry_specs), Value::List(entries)) => {
                let count = u32::try_from(entries.len())
                    .map_err(|_| CodecError::ShapeMismatch(spec.name))?;
                out.extend_from_slice(&count.to_be_bytes());
                for entry in entries {
                    let entry_start = out.len();
                    out.extend_from_slice(&ENTRY_TAG.to_be_bytes());
                    out.extend_from_slice(&[0u8; 4]);
                    encode_fields(entry_specs, entry, out)?;
                    patch_length(out, entry_start)?;
                }
            }
            _ => return Err(CodecError::ShapeMismatch(spec.name)),
        }

        patch_length(out, start)?;
    }
    Ok(())
}

fn patch_length(out: &mut [u8], start: usize) -> Result<(), CodecError> {
    let len = u32::try_from(out.len() - start).map_err(|_| CodecError::TooLarge(out.len()))?;
    out[start + 2..start + FIELD_HEADER_SIZE].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Decode a complete field sequence. Bytes left over after the last declared
/// field are a framing error.
pub fn decode_fields(specs: &[FieldSpec], bytes: &[u8]) -> Result<Vec<Value>, CodecError> {
    let mut reader = Reader::new(bytes);
    let values = reader.read_fields(specs)?;
    reader.finish()?;
    Ok(values)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if n > self.remaining() {
            return Err(CodecError::Truncated { need: n, have: self.remaining() });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn finish(&self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    /// Read one field header and return the value bytes it frames.
    fn read_field(&mut self, expected: u16) -> Result<&'a [u8], CodecError> {
        let header = self.take(FIELD_HEADER_SIZE)?;
        let tag = u16::from_be_bytes([header[0], header[1]]);
        if tag != expected {
            return Err(CodecError::UnexpectedTag { expected, found: tag });
        }
        let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if len < FIELD_HEADER_SIZE {
            return Err(CodecError::BadFieldLength { tag, len });
        }
        self.take(len - FIELD_HEADER_SIZE)
    }

    fn read_fields(&mut self, specs: &[FieldSpec]) -> Result<Vec<Value>, CodecError> {
        let mut values = Vec::with_capacity(specs.len());
        for spec in specs {
            let raw = self.read_field(spec.tag)?;
            values.push(decode_value(spec, raw)?);
        }
        Ok(values)
    }
}

fn fixed<const N: usize>(spec: &FieldSpec, raw: &[u8]) -> Result<[u8; N], CodecError> {
    raw.try_into().map_err(|_| CodecError::BadFieldLength {
        tag: spec.tag,
        len: raw.len() + FIELD_HEADER_SIZE,
    })
}

fn decode_value(spec: &FieldSpec, raw: &[u8]) -> Result<Value, CodecError> {
    Ok(match spec.kind {
        FieldKind::U8 => Value::U8(fixed::<1>(spec, raw)?[0]),
        FieldKind::U16 => Value::U16(u16::from_be_bytes(fixed(spec, raw)?)),
        FieldKind::U32 => Value::U32(u32::from_be_bytes(fixed(spec, raw)?)),
        FieldKind::U64 => Value::U64(u64::from_be_bytes(fixed(spec, raw)?)),
        FieldKind::Bool => match fixed::<1>(spec, raw)?[0] {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            _ => return Err(CodecError::InvalidValue { tag: spec.tag }),
        },
        FieldKind::Str => Value::Str(
            String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidValue { tag: spec.tag })?,
        ),
        FieldKind::Bytes => Value::Bytes(raw.to_vec()),
        FieldKind::List(entry_specs) => {
            let mut inner = Reader::new(raw);
            let count = u32::from_be_bytes(fixed(spec, inner.take(4)?)?) as usize;
            // Every entry costs at least one field header; refuse counts the
            // buffer cannot possibly hold before allocating for them.
            let floor = count.saturating_mul(FIELD_HEADER_SIZE);
            if floor > inner.remaining() {
                return Err(CodecError::Truncated { need: floor, have: inner.remaining() });
            }
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let entry = inner.read_field(ENTRY_TAG)?;
                entries.push(decode_fields(entry_specs, entry)?);
            }
            inner.finish()?;
            Value::List(entries)
        }
    })
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("truncated field: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("expected field tag {expected:#06x}, found {found:#06x}")]
    UnexpectedTag { expected: u16, found: u16 },
    #[error("field {tag:#06x} has invalid length {len}")]
    BadFieldLength { tag: u16, len: usize },
    #[error("field {tag:#06x} holds an invalid value")]
    InvalidValue { tag: u16 },
    #[error("{0} trailing bytes after the last field")]
    TrailingBytes(usize),
    #[error("unknown item: service {service_type:#06x} sub-type {sub_type:#04x}")]
    UnknownItem { service_type: u16, sub_type: u8 },
    #[error("value does not match descriptor for {0}")]
    ShapeMismatch(&'static str),
    #[error("encoded size {0} exceeds the maximum item size")]
    TooLarge(usize),
}

impl CodecError {
    /// Unknown items are dropped quietly; everything else is a framing error.
    pub fn is_unknown_item(&self) -> bool {
        matches!(self, CodecError::UnknownItem { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &[FieldSpec] = &[
        FieldSpec::new(0x0051, "name", FieldKind::Str),
        FieldSpec::new(0x0030, "kind", FieldKind::U16),
    ];

    const SHAPE: &[FieldSpec] = &[
        FieldSpec::new(0x0030, "count", FieldKind::U32),
        FieldSpec::new(0x0040, "stamp", FieldKind::U64),
        FieldSpec::new(0x0050, "flag", FieldKind::Bool),
        FieldSpec::new(0x0060, "blob", FieldKind::Bytes),
        FieldSpec::new(0x0070, "entries", FieldKind::List(ENTRY)),
    ];

    fn sample() -> Vec<Value> {
        vec![
            Value::U32(7),
            Value::U64(0x0102_0304_0506_0708),
            Value::Bool(true),
            Value::Bytes(vec![0xde, 0xad]),
            Value::List(vec![
                vec![Value::Str("rtt".into()), Value::U16(0x1011)],
                vec![Value::Str("heartbeat".into()), Value::U16(0x16)],
            ]),
        ]
    }

    #[test]
    fn field_layout_is_tag_length_value() {
        let mut out = Vec::new();
        encode_fields(&SHAPE[..1], &[Value::U32(7)], &mut out).unwrap();
        assert_eq!(out, [0x00, 0x30, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x07]);
    }

    #[test]
    fn decode_recovers_encoded_fields() {
        let mut out = Vec::new();
        encode_fields(SHAPE, &sample(), &mut out).unwrap();
        assert_eq!(decode_fields(SHAPE, &out).unwrap(), sample());
    }

    #[test]
    fn truncated_buffer_is_a_framing_error() {
        let mut out = Vec::new();
        encode_fields(SHAPE, &sample(), &mut out).unwrap();
        for cut in [1, 5, 9, out.len() - 1] {
            let err = decode_fields(SHAPE, &out[..cut]).unwrap_err();
            assert!(
                matches!(err, CodecError::Truncated { .. } | CodecError::BadFieldLength { .. }),
                "cut at {cut} gave {err:?}"
            );
        }
    }

    #[test]
    fn length_pointing_past_the_end_is_rejected() {
        // u32 field claiming 0xFFFF bytes
        let bytes = [0x00, 0x30, 0x00, 0x00, 0xff, 0xff, 0x00, 0x00, 0x00, 0x07];
        let err = decode_fields(&SHAPE[..1], &bytes).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));
    }

    #[test]
    fn length_smaller_than_header_is_rejected() {
        let bytes = [0x00, 0x30, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(
            decode_fields(&SHAPE[..1], &bytes),
            Err(CodecError::BadFieldLength { tag: 0x30, len: 2 })
        );
    }

    #[test]
    fn wrong_width_for_fixed_field_is_rejected() {
        let bytes = [0x00, 0x30, 0x00, 0x00, 0x00, 0x08, 0x00, 0x07];
        assert!(matches!(
            decode_fields(&SHAPE[..1], &bytes),
            Err(CodecError::BadFieldLength { tag: 0x30, .. })
        ));
    }

    #[test]
    fn unexpected_tag_is_rejected() {
        let mut out = Vec::new();
        encode_fields(&SHAPE[1..2], &[Value::U64(1)], &mut out).unwrap();
        let err = decode_fields(&SHAPE[..1], &out).unwrap_err();
        assert_eq!(err, CodecError::UnexpectedTag { expected: 0x30, found: 0x40 });
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut out = Vec::new();
        encode_fields(&SHAPE[..1], &[Value::U32(1)], &mut out).unwrap();
        out.push(0);
        assert_eq!(decode_fields(&SHAPE[..1], &out), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn absurd_list_count_fails_before_allocating() {
        let spec = [FieldSpec::new(0x0070, "entries", FieldKind::List(ENTRY))];
        let bytes = [0x00, 0x70, 0x00, 0x00, 0x00, 0x0a, 0xff, 0xff, 0xff, 0xff];
        assert!(matches!(decode_fields(&spec, &bytes), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn mismatched_value_is_a_shape_error() {
        let mut out = Vec::new();
        let err = encode_fields(&SHAPE[..1], &[Value::U8(1)], &mut out).unwrap_err();
        assert_eq!(err, CodecError::ShapeMismatch("count"));
    }

    #[test]
    fn invalid_bool_byte_is_rejected() {
        let spec = [FieldSpec::new(0x0050, "flag", FieldKind::Bool)];
        let bytes = [0x00, 0x50, 0x00, 0x00, 0x00, 0x07, 0x02];
        assert_eq!(decode_fields(&spec, &bytes), Err(CodecError::InvalidValue { tag: 0x50 }));
    }

    #[test]
    fn saturation_clamps_at_two_to_the_32() {
        assert_eq!(pack_u32_saturating(1 << 32), u32::MAX);
        assert_eq!(pack_u32_saturating(i64::MAX), u32::MAX);
        assert_eq!(pack_u32_saturating((1 << 32) - 1), u32::MAX);
        assert_eq!(pack_u32_saturating(0), 0);
        assert_eq!(pack_u32_saturating(3_000_000_000), 3_000_000_000);
    }

    #[test]
    fn negative_input_saturates_to_zero() {
        assert_eq!(pack_u32_saturating(-1), 0);
        assert_eq!(pack_u32_saturating(i64::MIN), 0);
    }
}

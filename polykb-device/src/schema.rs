//! Struct introspection and value codec
//!
//! The device announces, per structure id, a flat schema of
//! `(field id, type, bit offset, size)` quadruples. Values for that structure
//! are thereafter marshalled against the cached schema: bit-fields, fixed
//! width integers up to 64 bits, floats, and opaque arrays, in the byte order
//! the device declared at connect time.
//!
//! Decoding is tolerant of truncation (it stops at the message boundary) and
//! per-field problems are result-typed, never panics. A bit-field that
//! crosses a byte boundary is rejected outright rather than silently
//! misread.

use std::collections::BTreeMap;

use polykb_transport::Endianness;
use thiserror::Error;
use tracing::warn;

/// Offset of the field area within a struct value/write payload: one byte of
/// struct id precedes the field bytes.
pub const FIELD_BASE: usize = 1;

/// Wire flag marking a field type tag as an array of the flagged element
pub const ARRAY_FLAG: u8 = 0x80;

/// Schema-level errors. A failed field is skipped or the decode rejected;
/// the connection stays up either way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("No layout cached for structure 0x{0:02X}")]
    UnknownStruct(u8),

    #[error("Unknown field type tag 0x{0:02X}")]
    UnknownFieldType(u8),

    #[error("Field 0x{field:02X}: {width}-bit field at bit offset {offset} crosses a byte boundary")]
    BitFieldCrossesByte { field: u8, offset: u8, width: u8 },

    #[error("Layout for structure 0x{0:02X} is malformed")]
    MalformedLayout(u8),
}

/// Tagged field type; drives both decode width and pack/unpack arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Sub-byte bit-field (width carried in the field's `size`)
    Bit,
    U8,
    U16,
    U32,
    U64,
    F32,
    /// Opaque array; `elem_width` bytes per element, element count in `size`
    Array { elem_width: u8 },
}

impl FieldType {
    /// Parse a wire type tag
    pub fn from_tag(tag: u8) -> Result<Self, SchemaError> {
        if tag & ARRAY_FLAG != 0 {
            let elem = Self::from_tag(tag & !ARRAY_FLAG)?;
            let elem_width = match elem {
                FieldType::U8 => 1,
                FieldType::U16 => 2,
                FieldType::U32 => 4,
                FieldType::U64 => 8,
                FieldType::F32 => 4,
                _ => return Err(SchemaError::UnknownFieldType(tag)),
            };
            return Ok(FieldType::Array { elem_width });
        }
        match tag {
            0x00 => Ok(FieldType::Bit),
            0x01 => Ok(FieldType::U8),
            0x02 => Ok(FieldType::U16),
            0x03 => Ok(FieldType::U32),
            0x04 => Ok(FieldType::U64),
            0x05 => Ok(FieldType::F32),
            _ => Err(SchemaError::UnknownFieldType(tag)),
        }
    }

    /// Width in bytes of one scalar read, `None` for bit-fields and arrays
    fn scalar_width(self) -> Option<usize> {
        match self {
            FieldType::U8 => Some(1),
            FieldType::U16 => Some(2),
            FieldType::U32 => Some(4),
            FieldType::U64 => Some(8),
            FieldType::F32 => Some(4),
            _ => None,
        }
    }
}

/// One field descriptor from a layout announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub id: u8,
    pub ty: FieldType,
    /// Bit offset within the field area
    pub bit_offset: u8,
    /// Bit width for bit-fields, element count for arrays, unused for scalars
    pub size: u8,
}

/// Device-provided schema for one structure id.
///
/// Immutable once received; cached for the lifetime of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub struct_id: u8,
    pub struct_size: u8,
    pub flags: u8,
    pub fields: Vec<FieldDef>,
}

impl StructLayout {
    /// Parse a layout announcement payload:
    /// `[layout_rev][struct_id][struct_size][struct_flags]` followed by
    /// zero-terminated `[field_id][type][bit_offset][size]` quadruples.
    pub fn parse(payload: &[u8]) -> Result<Self, SchemaError> {
        if payload.len() < 4 {
            return Err(SchemaError::MalformedLayout(
                payload.first().copied().unwrap_or(0),
            ));
        }
        let struct_id = payload[1];
        let struct_size = payload[2];
        let flags = payload[3];

        let mut fields = Vec::new();
        let mut rest = &payload[4..];
        loop {
            match rest.first() {
                None | Some(0) => break,
                Some(&id) => {
                    if rest.len() < 4 {
                        return Err(SchemaError::MalformedLayout(struct_id));
                    }
                    let ty = match FieldType::from_tag(rest[1]) {
                        Ok(ty) => ty,
                        Err(e) => {
                            // Unknown type: skip the field, keep the layout
                            warn!("structure 0x{struct_id:02X} field 0x{id:02X}: {e}");
                            rest = &rest[4..];
                            continue;
                        }
                    };
                    fields.push(FieldDef {
                        id,
                        ty,
                        bit_offset: rest[2],
                        size: rest[3],
                    });
                    rest = &rest[4..];
                }
            }
        }
        Ok(Self {
            struct_id,
            struct_size,
            flags,
            fields,
        })
    }
}

/// A decoded field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// Snapshot of one structure: field id → decoded value
pub type StructValues = BTreeMap<u8, Value>;

fn read_uint(bytes: &[u8], endian: Endianness) -> u64 {
    let mut v = 0u64;
    match endian {
        Endianness::Little => {
            for &b in bytes.iter().rev() {
                v = (v << 8) | b as u64;
            }
        }
        Endianness::Big => {
            for &b in bytes {
                v = (v << 8) | b as u64;
            }
        }
    }
    v
}

fn write_uint(value: u64, out: &mut [u8], endian: Endianness) {
    let width = out.len();
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = match endian {
            Endianness::Little => 8 * i,
            Endianness::Big => 8 * (width - 1 - i),
        };
        *slot = (value >> shift) as u8;
    }
}

fn bit_mask(width: u8) -> u8 {
    (((1u16) << width) - 1) as u8
}

/// Decode a struct value payload (`[struct_id]<field bytes>`) against a
/// cached layout.
///
/// Decoding stops early if a field would read past the message bounds
/// (tolerant truncation, not an error). A bit-field crossing a byte boundary
/// rejects the whole decode.
pub fn decode_struct(
    layout: &StructLayout,
    payload: &[u8],
    endian: Endianness,
) -> Result<StructValues, SchemaError> {
    let mut out = StructValues::new();
    for field in &layout.fields {
        match field.ty {
            FieldType::Bit => {
                let shift = field.bit_offset % 8;
                if shift + field.size > 8 {
                    return Err(SchemaError::BitFieldCrossesByte {
                        field: field.id,
                        offset: field.bit_offset,
                        width: field.size,
                    });
                }
                let idx = FIELD_BASE + (field.bit_offset / 8) as usize;
                let Some(&byte) = payload.get(idx) else {
                    break;
                };
                out.insert(
                    field.id,
                    Value::Uint(((byte >> shift) & bit_mask(field.size)) as u64),
                );
            }
            FieldType::Array { elem_width } => {
                let idx = FIELD_BASE + (field.bit_offset / 8) as usize;
                let len = field.size as usize * elem_width as usize;
                let Some(bytes) = payload.get(idx..idx + len) else {
                    break;
                };
                out.insert(field.id, Value::Bytes(bytes.to_vec()));
            }
            scalar => {
                let Some(width) = scalar.scalar_width() else {
                    continue;
                };
                let idx = FIELD_BASE + (field.bit_offset / 8) as usize;
                let Some(bytes) = payload.get(idx..idx + width) else {
                    break;
                };
                let raw = read_uint(bytes, endian);
                let value = match scalar {
                    FieldType::F32 => Value::Float(f32::from_bits(raw as u32) as f64),
                    _ => Value::Uint(raw),
                };
                out.insert(field.id, value);
            }
        }
    }
    Ok(out)
}

/// Pack field values into an existing field-area buffer.
///
/// Bits not covered by a written field are left untouched. Returns the
/// number of bytes used (highest byte actually written), which may be zero
/// when `values` contains none of the layout's fields.
pub fn encode_into(
    layout: &StructLayout,
    values: &StructValues,
    endian: Endianness,
    buf: &mut [u8],
) -> Result<usize, SchemaError> {
    let mut used = 0usize;
    for field in &layout.fields {
        let Some(value) = values.get(&field.id) else {
            continue;
        };
        let idx = (field.bit_offset / 8) as usize;
        match field.ty {
            FieldType::Bit => {
                let shift = field.bit_offset % 8;
                if shift + field.size > 8 {
                    return Err(SchemaError::BitFieldCrossesByte {
                        field: field.id,
                        offset: field.bit_offset,
                        width: field.size,
                    });
                }
                let Some(slot) = buf.get_mut(idx) else {
                    warn!("field 0x{:02X} does not fit the output buffer", field.id);
                    continue;
                };
                let raw = match value {
                    Value::Uint(v) => *v as u8,
                    _ => 0,
                };
                let mask = bit_mask(field.size) << shift;
                *slot = (*slot & !mask) | ((raw << shift) & mask);
                used = used.max(idx + 1);
            }
            FieldType::Array { elem_width } => {
                let len = field.size as usize * elem_width as usize;
                let Some(slots) = buf.get_mut(idx..idx + len) else {
                    warn!("field 0x{:02X} does not fit the output buffer", field.id);
                    continue;
                };
                if let Value::Bytes(bytes) = value {
                    let n = bytes.len().min(len);
                    slots[..n].copy_from_slice(&bytes[..n]);
                    used = used.max(idx + len);
                }
            }
            scalar => {
                let Some(width) = scalar.scalar_width() else {
                    continue;
                };
                let Some(slots) = buf.get_mut(idx..idx + width) else {
                    warn!("field 0x{:02X} does not fit the output buffer", field.id);
                    continue;
                };
                let raw = match (scalar, value) {
                    (FieldType::F32, Value::Float(f)) => (*f as f32).to_bits() as u64,
                    (FieldType::F32, Value::Uint(v)) => (*v as f32).to_bits() as u64,
                    (_, Value::Uint(v)) => *v,
                    (_, Value::Float(f)) => *f as u64,
                    (_, Value::Bytes(_)) => 0,
                };
                write_uint(raw, slots, endian);
                used = used.max(idx + width);
            }
        }
    }
    Ok(used)
}

/// Encode a field-id → value mapping into a fresh field-area buffer sized to
/// `max_len`, truncated to the highest byte actually written.
pub fn encode_struct(
    layout: &StructLayout,
    values: &StructValues,
    endian: Endianness,
    max_len: usize,
) -> Result<Vec<u8>, SchemaError> {
    let mut buf = vec![0u8; max_len];
    let used = encode_into(layout, values, endian, &mut buf)?;
    buf.truncate(used);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_layout() -> StructLayout {
        StructLayout {
            struct_id: 0x02,
            struct_size: 15,
            flags: 0,
            fields: vec![
                FieldDef {
                    id: 1,
                    ty: FieldType::U8,
                    bit_offset: 0,
                    size: 0,
                },
                FieldDef {
                    id: 2,
                    ty: FieldType::U16,
                    bit_offset: 8,
                    size: 0,
                },
                FieldDef {
                    id: 3,
                    ty: FieldType::U32,
                    bit_offset: 24,
                    size: 0,
                },
                FieldDef {
                    id: 4,
                    ty: FieldType::U64,
                    bit_offset: 56,
                    size: 0,
                },
            ],
        }
    }

    fn values_of(pairs: &[(u8, u64)]) -> StructValues {
        pairs
            .iter()
            .map(|&(id, v)| (id, Value::Uint(v)))
            .collect()
    }

    #[test]
    fn scalar_roundtrip_both_endians() {
        let layout = scalar_layout();
        let values = values_of(&[
            (1, 0xAB),
            (2, 0xBEEF),
            (3, 0xDEADBEEF),
            (4, 0x0123_4567_89AB_CDEF),
        ]);
        for endian in [Endianness::Little, Endianness::Big] {
            let bytes = encode_struct(&layout, &values, endian, 64).unwrap();
            let mut payload = vec![layout.struct_id];
            payload.extend_from_slice(&bytes);
            let decoded = decode_struct(&layout, &payload, endian).unwrap();
            assert_eq!(decoded, values, "roundtrip failed for {endian:?}");
        }
    }

    #[test]
    fn float_roundtrip() {
        let layout = StructLayout {
            struct_id: 0x05,
            struct_size: 4,
            flags: 0,
            fields: vec![FieldDef {
                id: 7,
                ty: FieldType::F32,
                bit_offset: 0,
                size: 0,
            }],
        };
        let mut values = StructValues::new();
        values.insert(7, Value::Float(1.5));
        let bytes = encode_struct(&layout, &values, Endianness::Little, 8).unwrap();
        let mut payload = vec![layout.struct_id];
        payload.extend_from_slice(&bytes);
        let decoded = decode_struct(&layout, &payload, Endianness::Little).unwrap();
        assert_eq!(decoded.get(&7), Some(&Value::Float(1.5)));
    }

    #[test]
    fn bit_field_set_preserves_neighbors() {
        let layout = StructLayout {
            struct_id: 0x01,
            struct_size: 1,
            flags: 0,
            fields: vec![FieldDef {
                id: 9,
                ty: FieldType::Bit,
                bit_offset: 3,
                size: 1,
            }],
        };
        let mut buf = [0b1010_0101u8];
        let mut values = StructValues::new();
        values.insert(9, Value::Uint(1));
        encode_into(&layout, &values, Endianness::Little, &mut buf).unwrap();
        assert_eq!(buf[0], 0b1010_1101, "only bit 3 may change");

        let payload = [layout.struct_id, buf[0]];
        let decoded = decode_struct(&layout, &payload, Endianness::Little).unwrap();
        assert_eq!(decoded.get(&9), Some(&Value::Uint(1)));
    }

    #[test]
    fn bit_field_crossing_byte_boundary_is_rejected() {
        let layout = StructLayout {
            struct_id: 0x01,
            struct_size: 2,
            flags: 0,
            fields: vec![FieldDef {
                id: 3,
                ty: FieldType::Bit,
                bit_offset: 6,
                size: 4,
            }],
        };
        let err = decode_struct(&layout, &[0x01, 0xFF, 0xFF], Endianness::Little).unwrap_err();
        assert_eq!(
            err,
            SchemaError::BitFieldCrossesByte {
                field: 3,
                offset: 6,
                width: 4
            }
        );
    }

    #[test]
    fn truncated_value_stops_early_without_error() {
        let layout = scalar_layout();
        // Only the first two fields fit in three field bytes
        let payload = [0x02, 0xAA, 0x34, 0x12];
        let decoded = decode_struct(&layout, &payload, Endianness::Little).unwrap();
        assert_eq!(decoded.get(&1), Some(&Value::Uint(0xAA)));
        assert_eq!(decoded.get(&2), Some(&Value::Uint(0x1234)));
        assert!(!decoded.contains_key(&3));
        assert!(!decoded.contains_key(&4));
    }

    #[test]
    fn array_field_is_opaque_bytes() {
        let layout = StructLayout {
            struct_id: 0x03,
            struct_size: 6,
            flags: 0,
            fields: vec![FieldDef {
                id: 1,
                ty: FieldType::Array { elem_width: 2 },
                bit_offset: 0,
                size: 3,
            }],
        };
        let payload = [0x03, 1, 2, 3, 4, 5, 6];
        let decoded = decode_struct(&layout, &payload, Endianness::Big).unwrap();
        assert_eq!(decoded.get(&1), Some(&Value::Bytes(vec![1, 2, 3, 4, 5, 6])));
    }

    #[test]
    fn layout_parse_zero_terminated_quadruples() {
        let payload = [
            0x01, // layout revision
            0x10, // struct id
            0x08, // struct size
            0x00, // flags
            0x01, 0x01, 0x00, 0x00, // field 1: u8 at bit 0
            0x02, 0x00, 0x08, 0x02, // field 2: 2-bit field at bit 8
            0x03, 0x81, 0x10, 0x04, // field 3: array of 4 u8 at bit 16
            0x00, // terminator
        ];
        let layout = StructLayout::parse(&payload).unwrap();
        assert_eq!(layout.struct_id, 0x10);
        assert_eq!(layout.fields.len(), 3);
        assert_eq!(layout.fields[1].ty, FieldType::Bit);
        assert_eq!(layout.fields[2].ty, FieldType::Array { elem_width: 1 });
        assert_eq!(layout.fields[2].size, 4);
    }

    #[test]
    fn layout_parse_skips_unknown_type_tags() {
        let payload = [
            0x01, 0x11, 0x04, 0x00, //
            0x01, 0x7F, 0x00, 0x00, // unknown tag, skipped
            0x02, 0x01, 0x08, 0x00, // u8 at bit 8
            0x00,
        ];
        let layout = StructLayout::parse(&payload).unwrap();
        assert_eq!(layout.fields.len(), 1);
        assert_eq!(layout.fields[0].id, 2);
    }
}

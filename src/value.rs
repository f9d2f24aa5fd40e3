//! The tagged cell (C1): every stack slot, heap slot, and code-segment
//! immediate operand of cell size is one `Cell`.
//!
//! A cell is 32 bits. If those bits, read as IEEE-754 binary32, are not a
//! NaN, the cell *is* a [`Tag::Number`]-less number: its float value. If they
//! are a NaN, the upper bits (sign, exponent, quiet bit) are fixed to keep
//! the pattern a NaN, and the low 22 bits carry a 6-bit tag plus a 16-bit
//! payload. See `spec.md` §3.1.
//!
//! Only integer moves touch the raw `u32` representation; arithmetic on a
//! decoded [`Decoded::Number`] uses ordinary `f32` ops and is re-encoded
//! through [`Cell::from_number`], which canonicalizes any NaN result to the
//! single reserved canonical-NaN bit pattern so it can never collide with a
//! tagged cell.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{VmError, VmResult};

const EXP_MASK: u32 = 0x7F80_0000;
const QUIET_BIT: u32 = 0x0040_0000;
const TAG_SHIFT: u32 = 16;
const TAG_MASK: u32 = 0x3F;
const PAYLOAD_MASK: u32 = 0xFFFF;

/// Bit pattern of `f32::NAN`. Reserved by convention as the one NaN pattern
/// that always decodes as `NUMBER`, never as a tagged value (tag field 0 is
/// never assigned to a real [`Tag`] variant).
const CANONICAL_NAN_BITS: u32 = EXP_MASK | QUIET_BIT;

/// Tag kinds for non-number cells. Discriminants start at 1 so that tag
/// field 0 (the canonical-NaN pattern) never aliases a real tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive,
)]
#[repr(u8)]
pub enum Tag {
    Integer = 1,
    Code = 2,
    Builtin = 3,
    String = 4,
    List = 5,
    Link = 6,
    RefStack = 7,
    RefRstack = 8,
    RefGlobal = 9,
    Sentinel = 10,
}

impl Tag {
    fn name(self) -> &'static str {
        match self {
            Tag::Integer => "INTEGER",
            Tag::Code => "CODE",
            Tag::Builtin => "BUILTIN",
            Tag::String => "STRING",
            Tag::List => "LIST",
            Tag::Link => "LINK",
            Tag::RefStack => "REF_STACK",
            Tag::RefRstack => "REF_RSTACK",
            Tag::RefGlobal => "REF_GLOBAL",
            Tag::Sentinel => "SENTINEL",
        }
    }

    /// Whether this tag's payload is read/written as a signed 16-bit value.
    fn is_signed(self) -> bool {
        matches!(self, Tag::Integer | Tag::Sentinel)
    }

    fn max_payload(self) -> i32 {
        match self {
            Tag::Builtin => 127,
            Tag::Integer | Tag::Sentinel => i16::MAX as i32,
            _ => u16::MAX as i32,
        }
    }

    fn min_payload(self) -> i32 {
        if self.is_signed() {
            i16::MIN as i32
        } else {
            0
        }
    }
}

/// The result of decoding a [`Cell`]: either a plain float, or a tagged
/// non-number value with its 16-bit payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Number(f32),
    Tagged { tag: Tag, payload: u16 },
}

/// One 32-bit NaN-boxed value. The unit of every stack slot and every
/// addressable memory cell.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Cell(u32);

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.decode() {
            Ok(Decoded::Number(n)) => write!(f, "Cell(NUMBER {n})"),
            Ok(Decoded::Tagged { tag, payload }) => {
                write!(f, "Cell({:?} {})", tag, payload)
            }
            Err(_) => write!(f, "Cell(raw 0x{:08x})", self.0),
        }
    }
}

impl Cell {
    /// Raw bits, for memory primitives that move cells without inspecting
    /// them (§4.1: "the implementation may store cells as 4-byte words").
    pub fn to_bits(self) -> u32 {
        self.0
    }

    pub fn from_bits(bits: u32) -> Cell {
        Cell(bits)
    }

    /// Encode a `NUMBER`. Any NaN input is canonicalized to the one
    /// reserved NaN pattern, so arithmetic that produces e.g. `0.0 / 0.0`
    /// never accidentally aliases a tagged cell.
    pub fn from_number(value: f32) -> Cell {
        if value.is_nan() {
            Cell(CANONICAL_NAN_BITS)
        } else {
            Cell(value.to_bits())
        }
    }

    /// Encode a tagged non-number cell. `payload` is validated against the
    /// tag's documented width (§3.1's per-tag payload column).
    pub fn encode_tag(tag: Tag, payload: i32) -> VmResult<Cell> {
        if payload < tag.min_payload() || payload > tag.max_payload() {
            return Err(VmError::OutOfRange {
                tag: tag.name(),
                value: payload as i64,
                max: tag.max_payload() as i64,
            });
        }
        let raw_payload = (payload as i16 as u16) as u32;
        let tag_byte: u8 = tag.into();
        Ok(Cell(
            EXP_MASK
                | QUIET_BIT
                | ((tag_byte as u32) << TAG_SHIFT)
                | (raw_payload & PAYLOAD_MASK),
        ))
    }

    /// Decode this cell. Unrecognized tag fields are `InvalidTag`, which can
    /// only occur for a cell built from foreign/corrupt bits (a snapshot
    /// loaded from disk, say) since every in-process encoder goes through
    /// [`Cell::encode_tag`].
    pub fn decode(self) -> VmResult<Decoded> {
        let f = f32::from_bits(self.0);
        if !f.is_nan() || self.0 == CANONICAL_NAN_BITS {
            return Ok(Decoded::Number(f));
        }
        let tag_byte = ((self.0 >> TAG_SHIFT) & TAG_MASK) as u8;
        let payload = (self.0 & PAYLOAD_MASK) as u16;
        let tag = Tag::try_from_primitive(tag_byte)
            .map_err(|_| VmError::InvalidTag(tag_byte))?;
        Ok(Decoded::Tagged { tag, payload })
    }

    pub fn is_tag(self, tag: Tag) -> bool {
        matches!(self.decode(), Ok(Decoded::Tagged { tag: t, .. }) if t == tag)
    }

    pub fn is_number(self) -> bool {
        matches!(self.decode(), Ok(Decoded::Number(_)))
    }

    /// Payload as a signed 16-bit value (meaningful for `Integer`/`Sentinel`).
    pub fn payload_i16(payload: u16) -> i16 {
        payload as i16
    }

    pub fn nil() -> Cell {
        Cell::encode_tag(Tag::Sentinel, -1).expect("NIL payload is in range")
    }

    pub fn default_value() -> Cell {
        Cell::encode_tag(Tag::Sentinel, -2)
            .expect("DEFAULT payload is in range")
    }

    pub fn is_nil(self) -> bool {
        matches!(
            self.decode(),
            Ok(Decoded::Tagged { tag: Tag::Sentinel, payload }) if Cell::payload_i16(payload) == -1
        )
    }

    pub fn is_default(self) -> bool {
        matches!(
            self.decode(),
            Ok(Decoded::Tagged { tag: Tag::Sentinel, payload }) if Cell::payload_i16(payload) == -2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trips_bit_exact() {
        for f in [0.0f32, -0.0, 1.5, -1.5, f32::INFINITY, f32::NEG_INFINITY] {
            let cell = Cell::from_number(f);
            match cell.decode().unwrap() {
                Decoded::Number(got) => assert_eq!(got.to_bits(), f.to_bits()),
                other => panic!("expected Number, got {other:?}"),
            }
        }
    }

    #[test]
    fn nan_canonicalizes_and_round_trips() {
        let cell = Cell::from_number(f32::NAN);
        match cell.decode().unwrap() {
            Decoded::Number(got) => assert!(got.is_nan()),
            other => panic!("expected Number, got {other:?}"),
        }
        // A differently-bit-patterned NaN still canonicalizes, never aliasing a tag.
        let odd_nan = f32::from_bits(0x7fc0_1234);
        assert!(odd_nan.is_nan());
        let cell2 = Cell::from_number(odd_nan);
        assert!(matches!(cell2.decode().unwrap(), Decoded::Number(n) if n.is_nan()));
    }

    #[test]
    fn tag_round_trips() {
        for (tag, payload) in [
            (Tag::Integer, -5),
            (Tag::Code, 1000),
            (Tag::Builtin, 127),
            (Tag::String, 65535),
            (Tag::List, 0),
            (Tag::Link, 1),
            (Tag::RefStack, 42),
            (Tag::RefRstack, 42),
            (Tag::RefGlobal, 42),
            (Tag::Sentinel, -1),
        ] {
            let cell = Cell::encode_tag(tag, payload).unwrap();
            match cell.decode().unwrap() {
                Decoded::Tagged { tag: t, payload: p } => {
                    assert_eq!(t, tag);
                    let expected = if tag.is_signed() {
                        (payload as i16 as u16)
                    } else {
                        payload as u16
                    };
                    assert_eq!(p, expected);
                }
                other => panic!("expected Tagged, got {other:?}"),
            }
        }
    }

    #[test]
    fn builtin_payload_127_encodes_128_rejects() {
        assert!(Cell::encode_tag(Tag::Builtin, 127).is_ok());
        assert!(matches!(
            Cell::encode_tag(Tag::Builtin, 128),
            Err(VmError::OutOfRange { tag: "BUILTIN", .. })
        ));
    }

    #[test]
    fn nil_and_default_are_distinct_sentinels() {
        let nil = Cell::nil();
        let default = Cell::default_value();
        assert!(nil.is_nil());
        assert!(!nil.is_default());
        assert!(default.is_default());
        assert!(!default.is_nil());
        assert_ne!(nil.to_bits(), default.to_bits());
    }

    #[test]
    fn invalid_tag_bits_reject() {
        // tag field 11 (0x0b) is not assigned to any Tag variant.
        let bits = EXP_MASK | QUIET_BIT | (11 << TAG_SHIFT);
        let cell = Cell::from_bits(bits);
        assert!(matches!(cell.decode(), Err(VmError::InvalidTag(11))));
    }
}

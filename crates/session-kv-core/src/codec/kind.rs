//! Wire-level kind tags.

use super::CodecError;

/// Primitive kind carried in the low byte of a value's flags.
///
/// The numbering is part of the stored format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KindTag {
    /// Legacy marker: null when the payload is empty, a string otherwise.
    Empty = 0,
    /// Opaque object graph produced by an [`ObjectCodec`](super::ObjectCodec).
    Object = 1,
    /// Explicit null marker.
    DbNull = 2,
    Boolean = 3,
    /// One UTF-16 code unit.
    Char = 4,
    Int16 = 7,
    UInt16 = 8,
    Int32 = 9,
    UInt32 = 10,
    Int64 = 11,
    UInt64 = 12,
    Single = 13,
    Double = 14,
    /// Tick count with the time's kind packed into the top two bits.
    DateTime = 16,
    String = 18,
}

impl KindTag {
    /// Payload width in bytes for fixed-width kinds.
    #[must_use]
    pub const fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Boolean => Some(1),
            Self::Char | Self::Int16 | Self::UInt16 => Some(2),
            Self::Int32 | Self::UInt32 | Self::Single => Some(4),
            Self::Int64 | Self::UInt64 | Self::Double | Self::DateTime => Some(8),
            Self::Empty | Self::Object | Self::DbNull | Self::String => None,
        }
    }
}

impl TryFrom<u8> for KindTag {
    type Error = CodecError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::Empty,
            1 => Self::Object,
            2 => Self::DbNull,
            3 => Self::Boolean,
            4 => Self::Char,
            7 => Self::Int16,
            8 => Self::UInt16,
            9 => Self::Int32,
            10 => Self::UInt32,
            11 => Self::Int64,
            12 => Self::UInt64,
            13 => Self::Single,
            14 => Self::Double,
            16 => Self::DateTime,
            18 => Self::String,
            other => return Err(CodecError::UnknownKindTag(other)),
        })
    }
}

impl From<KindTag> for u8 {
    fn from(tag: KindTag) -> Self {
        tag as Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_tags_roundtrip_through_u8() {
        for raw in 0u8..=u8::MAX {
            if let Ok(tag) = KindTag::try_from(raw) {
                assert_eq!(u8::from(tag), raw);
            }
        }
    }

    #[test]
    fn test_unassigned_codes_are_rejected() {
        for raw in [5u8, 6, 15, 17, 19, 0xFF] {
            assert!(matches!(
                KindTag::try_from(raw),
                Err(CodecError::UnknownKindTag(r)) if r == raw
            ));
        }
    }

    #[test]
    fn test_fixed_widths() {
        assert_eq!(KindTag::Boolean.fixed_width(), Some(1));
        assert_eq!(KindTag::Char.fixed_width(), Some(2));
        assert_eq!(KindTag::Int32.fixed_width(), Some(4));
        assert_eq!(KindTag::DateTime.fixed_width(), Some(8));
        assert_eq!(KindTag::String.fixed_width(), None);
    }
}

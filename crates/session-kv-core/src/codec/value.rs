//! Decoded value model.

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::CodecError;

/// Ticks (100 ns units) between 0001-01-01 and the Unix epoch.
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

/// Ticks per second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Largest tick count the 62-bit stored form can hold.
pub const MAX_TICKS: i64 = 0x3FFF_FFFF_FFFF_FFFF;

const TICKS_MASK: u64 = MAX_TICKS as u64;
const KIND_SHIFT: u32 = 62;

/// Kind of a stored date-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DateTimeKind {
    #[default]
    Unspecified,
    Utc,
    Local,
}

/// A tick count plus the kind of time it represents.
///
/// Ticks always lie in `0..=MAX_TICKS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp {
    ticks: i64,
    kind: DateTimeKind,
}

impl Timestamp {
    /// Build from 100 ns ticks since 0001-01-01T00:00:00.
    ///
    /// # Errors
    /// Returns error if `ticks` is negative or above [`MAX_TICKS`].
    pub const fn new(ticks: i64, kind: DateTimeKind) -> Result<Self, CodecError> {
        if ticks < 0 || ticks > MAX_TICKS {
            return Err(CodecError::TicksOutOfRange(ticks));
        }
        Ok(Self { ticks, kind })
    }

    /// Build a UTC timestamp from a chrono instant, clamped to the storable range.
    #[must_use]
    pub fn from_utc(at: DateTime<Utc>) -> Self {
        Self {
            ticks: utc_to_ticks(at).clamp(0, MAX_TICKS),
            kind: DateTimeKind::Utc,
        }
    }

    #[must_use]
    pub const fn ticks(self) -> i64 {
        self.ticks
    }

    #[must_use]
    pub const fn kind(self) -> DateTimeKind {
        self.kind
    }

    /// Current UTC time.
    #[must_use]
    pub fn now_utc() -> Self {
        Self::from_utc(Utc::now())
    }

    /// Interpret the ticks as a UTC instant, ignoring the kind.
    ///
    /// Returns `None` when the tick count is outside chrono's range.
    #[must_use]
    pub fn to_utc(self) -> Option<DateTime<Utc>> {
        ticks_to_utc(self.ticks)
    }

    /// Pack ticks and kind into the signed 64-bit stored form.
    #[must_use]
    pub const fn to_binary(self) -> i64 {
        let kind: u64 = match self.kind {
            DateTimeKind::Unspecified => 0,
            DateTimeKind::Utc => 1,
            DateTimeKind::Local => 2,
        };
        ((self.ticks as u64 & TICKS_MASK) | (kind << KIND_SHIFT)) as i64
    }

    /// Unpack the stored form.
    #[must_use]
    pub const fn from_binary(raw: i64) -> Self {
        let raw = raw as u64;
        let kind = match raw >> KIND_SHIFT {
            0 => DateTimeKind::Unspecified,
            1 => DateTimeKind::Utc,
            // 3 is the ambiguous-local marker, which is still local time.
            _ => DateTimeKind::Local,
        };
        Self {
            ticks: (raw & TICKS_MASK) as i64,
            kind,
        }
    }
}

/// Convert a UTC instant to ticks since 0001-01-01.
#[must_use]
pub fn utc_to_ticks(at: DateTime<Utc>) -> i64 {
    UNIX_EPOCH_TICKS
        .saturating_add(at.timestamp().saturating_mul(TICKS_PER_SECOND))
        .saturating_add(i64::from(at.timestamp_subsec_nanos() / 100))
}

/// Convert ticks since 0001-01-01 to a UTC instant.
#[must_use]
pub fn ticks_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = u32::try_from(since_epoch.rem_euclid(TICKS_PER_SECOND) * 100).ok()?;
    DateTime::from_timestamp(secs, nanos)
}

/// A value that can be stored through the tagged codec.
///
/// The set of kinds is closed: adding one means touching every `match`
/// in the encoder and decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Caller-supplied bytes stored untouched under the raw sentinel.
    Raw(Bytes),
    String(String),
    Boolean(bool),
    /// One UTF-16 code unit.
    Char(u16),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    DateTime(Timestamp),
    Double(f64),
    Single(f32),
    /// Bytes produced by an object codec.
    Object(Bytes),
}

impl Value {
    /// Short name for diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Raw(_) => "raw",
            Self::String(_) => "string",
            Self::Boolean(_) => "boolean",
            Self::Char(_) => "char",
            Self::Int16(_) => "int16",
            Self::Int32(_) => "int32",
            Self::Int64(_) => "int64",
            Self::UInt16(_) => "uint16",
            Self::UInt32(_) => "uint32",
            Self::UInt64(_) => "uint64",
            Self::DateTime(_) => "datetime",
            Self::Double(_) => "double",
            Self::Single(_) => "single",
            Self::Object(_) => "object",
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident, $name:literal;)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = CodecError;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(CodecError::Mismatch {
                            expected: $name,
                            found: other.kind_name(),
                        }),
                    }
                }
            }
        )*
    };
}

value_conversions! {
    String => String, "string";
    bool => Boolean, "boolean";
    i16 => Int16, "int16";
    i32 => Int32, "int32";
    i64 => Int64, "int64";
    u16 => UInt16, "uint16";
    u32 => UInt32, "uint32";
    u64 => UInt64, "uint64";
    Timestamp => DateTime, "datetime";
    f64 => Double, "double";
    f32 => Single, "single";
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Raw(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Raw(Bytes::from(v))
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(Timestamp::from_utc(v))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl TryFrom<Value> for Bytes {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Raw(v) | Value::Object(v) => Ok(v),
            other => Err(CodecError::Mismatch {
                expected: "raw",
                found: other.kind_name(),
            }),
        }
    }
}

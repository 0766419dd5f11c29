//! Tagged value codec.
//!
//! Every stored value is a `(flags, payload)` pair written as two
//! little-endian flag bytes followed by the payload, with no length prefix.
//!
//! - `flags == 0xFA52`: raw buffer, payload returned untouched
//! - otherwise the low byte is a [`KindTag`] and bit `0x0100` marks a
//!   tagged primitive

mod kind;
mod object;
mod value;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub use kind::KindTag;
pub use object::{JsonObjectCodec, ObjectCodec};
pub use value::{
    DateTimeKind, MAX_TICKS, TICKS_PER_SECOND, Timestamp, UNIX_EPOCH_TICKS, Value, ticks_to_utc,
    utc_to_ticks,
};

/// Sentinel flags for caller-supplied raw buffers.
pub const RAW_DATA_FLAG: u16 = 0xFA52;

/// Bit set on every primitive-tagged value.
pub const TYPED_FLAG: u16 = 0x0100;

/// Size of the flags header on the wire.
pub const FLAGS_LEN: usize = 2;

/// Codec error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("Unknown kind tag: {0}")]
    UnknownKindTag(u8),
    #[error("Truncated {context}: expected {expected} bytes, got {actual}")]
    Truncated {
        context: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("Expected {expected} value, found {found}")]
    Mismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Tick count {0} is outside the storable range")]
    TicksOutOfRange(i64),
    #[error("Object codec '{codec_id}' failed: {detail}")]
    Object { codec_id: String, detail: String },
}

/// On-wire representation of one stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedValue {
    pub flags: u16,
    pub payload: Bytes,
}

impl TaggedValue {
    /// Create a tagged value.
    #[must_use]
    pub const fn new(flags: u16, payload: Bytes) -> Self {
        Self { flags, payload }
    }

    /// Whether this value is a raw pass-through buffer.
    #[must_use]
    pub const fn is_raw(&self) -> bool {
        self.flags == RAW_DATA_FLAG
    }

    /// Serialize as flags followed by payload.
    #[must_use]
    pub fn to_wire(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(FLAGS_LEN + self.payload.len());
        out.put_u16_le(self.flags);
        out.put_slice(&self.payload);
        out.freeze()
    }

    /// Split a stored byte string into flags and payload.
    ///
    /// The payload shares `stored`'s buffer.
    ///
    /// # Errors
    /// Returns error if fewer than two bytes are stored.
    pub fn from_wire(stored: Bytes) -> Result<Self, CodecError> {
        if stored.len() < FLAGS_LEN {
            return Err(CodecError::Truncated {
                context: "flags",
                expected: FLAGS_LEN,
                actual: stored.len(),
            });
        }
        let flags = (&stored[..FLAGS_LEN]).get_u16_le();
        Ok(Self {
            flags,
            payload: stored.slice(FLAGS_LEN..),
        })
    }
}

/// Encode a value.
///
/// Deterministic; raw buffers are passed through without copying.
#[must_use]
pub fn encode(value: &Value) -> TaggedValue {
    let (kind, payload) = match value {
        Value::Raw(bytes) => return TaggedValue::new(RAW_DATA_FLAG, bytes.clone()),
        Value::Null => (KindTag::DbNull, Bytes::new()),
        Value::Object(bytes) => (KindTag::Object, bytes.clone()),
        Value::String(s) => (KindTag::String, Bytes::copy_from_slice(s.as_bytes())),
        Value::Boolean(b) => (
            KindTag::Boolean,
            Bytes::from_static(if *b { &[1] } else { &[0] }),
        ),
        Value::Char(c) => (KindTag::Char, fixed(|buf| buf.put_u16_le(*c))),
        Value::Int16(v) => (KindTag::Int16, fixed(|buf| buf.put_i16_le(*v))),
        Value::Int32(v) => (KindTag::Int32, fixed(|buf| buf.put_i32_le(*v))),
        Value::Int64(v) => (KindTag::Int64, fixed(|buf| buf.put_i64_le(*v))),
        Value::UInt16(v) => (KindTag::UInt16, fixed(|buf| buf.put_u16_le(*v))),
        Value::UInt32(v) => (KindTag::UInt32, fixed(|buf| buf.put_u32_le(*v))),
        Value::UInt64(v) => (KindTag::UInt64, fixed(|buf| buf.put_u64_le(*v))),
        Value::DateTime(ts) => (KindTag::DateTime, fixed(|buf| buf.put_i64_le(ts.to_binary()))),
        Value::Double(v) => (KindTag::Double, fixed(|buf| buf.put_f64_le(*v))),
        Value::Single(v) => (KindTag::Single, fixed(|buf| buf.put_f32_le(*v))),
    };

    TaggedValue::new(TYPED_FLAG | u16::from(u8::from(kind)), payload)
}

fn fixed(write: impl FnOnce(&mut BytesMut)) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    write(&mut buf);
    buf.freeze()
}

/// Decode a tagged value.
///
/// # Errors
/// Returns error on an unknown kind tag or a payload shorter than the
/// kind's fixed width.
pub fn decode(item: &TaggedValue) -> Result<Value, CodecError> {
    if item.is_raw() {
        return Ok(Value::Raw(item.payload.clone()));
    }

    let kind = KindTag::try_from((item.flags & 0x00FF) as u8)?;
    let data = &item.payload;

    if let Some(width) = kind.fixed_width() {
        if data.len() < width {
            return Err(CodecError::Truncated {
                context: "payload",
                expected: width,
                actual: data.len(),
            });
        }
    }
    let mut buf = &data[..];

    Ok(match kind {
        // Values written by a bare increment carry no flags and are
        // strings; an empty one is the historical null.
        KindTag::Empty if data.is_empty() => Value::Null,
        KindTag::Empty | KindTag::String => Value::String(String::from_utf8_lossy(data).into_owned()),
        KindTag::DbNull => Value::Null,
        KindTag::Object => Value::Object(data.clone()),
        KindTag::Boolean => Value::Boolean(buf.get_u8() != 0),
        KindTag::Char => Value::Char(buf.get_u16_le()),
        KindTag::Int16 => Value::Int16(buf.get_i16_le()),
        KindTag::Int32 => Value::Int32(buf.get_i32_le()),
        KindTag::Int64 => Value::Int64(buf.get_i64_le()),
        KindTag::UInt16 => Value::UInt16(buf.get_u16_le()),
        KindTag::UInt32 => Value::UInt32(buf.get_u32_le()),
        KindTag::UInt64 => Value::UInt64(buf.get_u64_le()),
        KindTag::DateTime => Value::DateTime(Timestamp::from_binary(buf.get_i64_le())),
        KindTag::Double => Value::Double(buf.get_f64_le()),
        KindTag::Single => Value::Single(buf.get_f32_le()),
    })
}

/// Encode a value straight to its stored byte string.
#[must_use]
pub fn encode_to_wire(value: &Value) -> Bytes {
    encode(value).to_wire()
}

/// Decode a stored byte string.
///
/// # Errors
/// See [`TaggedValue::from_wire`] and [`decode`].
pub fn decode_wire(stored: Bytes) -> Result<Value, CodecError> {
    decode(&TaggedValue::from_wire(stored)?)
}

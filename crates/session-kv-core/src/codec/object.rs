//! Pluggable codec for values outside the primitive kinds.

use serde_json::Value as JsonValue;

use super::CodecError;

/// Serializer for arbitrary object graphs stored under the `Object` tag.
///
/// The tagged codec never looks inside the bytes this produces; it only
/// stores and returns them.
pub trait ObjectCodec: Send + Sync {
    /// Identifier used in error messages.
    fn codec_id(&self) -> &str;

    /// Serialize an object graph.
    ///
    /// # Errors
    /// Returns error if the value cannot be represented.
    fn serialize(&self, value: &JsonValue) -> Result<Vec<u8>, CodecError>;

    /// Deserialize bytes previously produced by [`serialize`](Self::serialize).
    ///
    /// # Errors
    /// Returns error if the bytes are not a valid encoding.
    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue, CodecError>;
}

/// Object codec backed by `serde_json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonObjectCodec;

impl ObjectCodec for JsonObjectCodec {
    fn codec_id(&self) -> &str {
        "json"
    }

    fn serialize(&self, value: &JsonValue) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::Object {
            codec_id: self.codec_id().to_string(),
            detail: e.to_string(),
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<JsonValue, CodecError> {
        serde_json::from_slice(bytes).map_err(|e| CodecError::Object {
            codec_id: self.codec_id().to_string(),
            detail: e.to_string(),
        })
    }
}

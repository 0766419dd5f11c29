//! Namespaced, typed access to a shared key-value store.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;

use crate::{
    blocking::block_on,
    codec::{self, CodecError, JsonObjectCodec, ObjectCodec, Value},
    traits::{KeyValueClient, StoreError},
};

/// Prefix `raw_key` with `bucket` unless it already carries the prefix.
///
/// Idempotent: `key_for(b, &key_for(b, k)) == key_for(b, k)`.
#[must_use]
pub fn key_for(bucket: &str, raw_key: &str) -> String {
    if raw_key
        .strip_prefix(bucket)
        .is_some_and(|rest| rest.starts_with(':'))
    {
        raw_key.to_string()
    } else {
        format!("{bucket}:{raw_key}")
    }
}

/// A named partition of a key-value store.
///
/// Every key is passed through [`key_for`], and every value is stored in
/// the tagged wire format.
#[derive(Clone)]
pub struct Bucket {
    name: Arc<str>,
    client: Arc<dyn KeyValueClient>,
    objects: Arc<dyn ObjectCodec>,
}

impl fmt::Debug for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bucket")
            .field("name", &self.name)
            .field("object_codec", &self.objects.codec_id())
            .finish_non_exhaustive()
    }
}

impl Bucket {
    /// Create a bucket using the JSON object codec.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>, client: Arc<dyn KeyValueClient>) -> Self {
        Self {
            name: name.into(),
            client,
            objects: Arc::new(JsonObjectCodec),
        }
    }

    /// Replace the codec used for the `Object` kind.
    #[must_use]
    pub fn with_object_codec(mut self, codec: Arc<dyn ObjectCodec>) -> Self {
        self.objects = codec;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespaced key for `raw_key`.
    #[must_use]
    pub fn key(&self, raw_key: &str) -> String {
        key_for(&self.name, raw_key)
    }

    /// Store a value, optionally expiring after `expire_seconds`.
    ///
    /// A zero expiry means no expiry.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Value> + Send,
        expire_seconds: Option<u64>,
    ) -> Result<(), StoreError> {
        let key = self.key(key);
        let stored = codec::encode_to_wire(&value.into());
        let ttl = expire_seconds
            .filter(|s| *s > 0)
            .map(std::time::Duration::from_secs);
        tracing::trace!(%key, len = stored.len(), ?ttl, "bucket set");
        self.client.set(&key, stored, ttl).await
    }

    /// Store a serializable object under the `Object` kind.
    ///
    /// # Errors
    /// Returns error if serialization or the store call fails.
    pub async fn set_object<T>(
        &self,
        key: &str,
        value: &T,
        expire_seconds: Option<u64>,
    ) -> Result<(), StoreError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let json = serde_json::to_value(value).map_err(|e| CodecError::Object {
            codec_id: self.objects.codec_id().to_string(),
            detail: e.to_string(),
        })?;
        let bytes = self.objects.serialize(&json)?;
        self.set(key, Value::Object(Bytes::from(bytes)), expire_seconds)
            .await
    }

    /// Remove a key.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn del(&self, key: &str) -> Result<(), StoreError> {
        let key = self.key(key);
        self.client.delete(&[key.as_str()]).await.map(|_| ())
    }

    /// Remove several keys in one call.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn del_many(&self, keys: &[&str]) -> Result<(), StoreError> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.client.delete(&refs).await.map(|_| ())
    }

    /// Reset a key's time to live.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn expire(&self, key: &str, expire_seconds: u64) -> Result<(), StoreError> {
        let key = self.key(key);
        self.client.expire(&key, expire_seconds).await.map(|_| ())
    }

    /// Fetch and decode a value. Missing keys are `None`.
    ///
    /// # Errors
    /// Returns error if the store call or decoding fails.
    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = self.key(key);
        match self.client.get(&key).await? {
            Some(stored) => Ok(Some(codec::decode_wire(stored)?)),
            None => Ok(None),
        }
    }

    /// Fetch a value and convert it. Missing keys and stored nulls are `None`.
    ///
    /// # Errors
    /// Returns error if the stored kind does not match `T`.
    pub async fn get_as<T>(&self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: TryFrom<Value, Error = CodecError>,
    {
        match self.get(key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(T::try_from(value)?)),
        }
    }

    /// Fetch a string value.
    ///
    /// # Errors
    /// Returns error if the stored value is not a string.
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.get_as::<String>(key).await
    }

    /// Fetch a raw buffer without copying it.
    ///
    /// # Errors
    /// Returns error if the stored value is not a raw buffer or object bytes.
    pub async fn get_raw(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.get_as::<Bytes>(key).await
    }

    /// Fetch and deserialize an object stored with [`set_object`](Self::set_object).
    ///
    /// # Errors
    /// Returns error if the value is not an object or does not deserialize as `T`.
    pub async fn get_object<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let value = match self.get(key).await? {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Object(bytes)) => bytes,
            Some(other) => {
                return Err(CodecError::Mismatch {
                    expected: "object",
                    found: other.kind_name(),
                }
                .into());
            }
        };
        let json = self.objects.deserialize(&value)?;
        serde_json::from_value(json)
            .map(Some)
            .map_err(|e| {
                CodecError::Object {
                    codec_id: self.objects.codec_id().to_string(),
                    detail: e.to_string(),
                }
                .into()
            })
    }

    /// Blocking [`set`](Self::set).
    ///
    /// # Errors
    /// See [`set`](Self::set).
    pub fn set_blocking(
        &self,
        key: &str,
        value: impl Into<Value> + Send,
        expire_seconds: Option<u64>,
    ) -> Result<(), StoreError> {
        block_on(self.set(key, value, expire_seconds))
    }

    /// Blocking [`get`](Self::get).
    ///
    /// # Errors
    /// See [`get`](Self::get).
    pub fn get_blocking(&self, key: &str) -> Result<Option<Value>, StoreError> {
        block_on(self.get(key))
    }

    /// Blocking [`get_string`](Self::get_string).
    ///
    /// # Errors
    /// See [`get_string`](Self::get_string).
    pub fn get_string_blocking(&self, key: &str) -> Result<Option<String>, StoreError> {
        block_on(self.get_string(key))
    }

    /// Blocking [`get_raw`](Self::get_raw).
    ///
    /// # Errors
    /// See [`get_raw`](Self::get_raw).
    pub fn get_raw_blocking(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        block_on(self.get_raw(key))
    }

    /// Fetch a value in the background and hand the result to `callback`.
    ///
    /// Must be called from within a Tokio runtime. Callbacks for separate
    /// calls run in completion order, not issue order.
    pub fn get_with<F>(&self, key: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Option<Value>, StoreError>) + Send + 'static,
    {
        let bucket = self.clone();
        let key = key.to_string();
        tokio::spawn(async move { callback(bucket.get(&key).await) })
    }

    /// Fetch a raw buffer in the background and hand the result to `callback`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get_raw_with<F>(&self, key: &str, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Option<Bytes>, StoreError>) + Send + 'static,
    {
        let bucket = self.clone();
        let key = key.to_string();
        tokio::spawn(async move { callback(bucket.get_raw(&key).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_prefixes() {
        assert_eq!(key_for("cache", "user:1"), "cache:user:1");
    }

    #[test]
    fn test_key_for_is_idempotent() {
        let once = key_for("cache", "k");
        assert_eq!(key_for("cache", &once), once);
    }

    #[test]
    fn test_key_for_requires_separator() {
        // Shares the bucket name as a prefix but not the separator.
        assert_eq!(key_for("cache", "cached"), "cache:cached");
        assert_eq!(key_for("cache", "cache"), "cache:cache");
    }
}

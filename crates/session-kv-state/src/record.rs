//! Session records stored as one hash per session.

use std::{collections::HashMap, sync::Arc};

use bytes::{Buf, Bytes};
use session_kv_core::{KeyValueClient, StoreError, Transaction, TransactionOutcome};

use crate::{error::SessionError, lock::LOCK_TABLE_SUFFIX};

/// Hash field holding the session payload.
pub const DATA_FIELD: &str = "data";
/// Hash field holding the one-byte initialize flag.
pub const INITIALIZE_FIELD: &str = "initialize";
/// Hash field holding the sliding timeout as a 4-byte LE integer.
pub const TIMEOUT_FIELD: &str = "timeoutMinutes";

/// A stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub data: Bytes,
    /// `true` for a record created empty that the host has not initialized yet.
    pub initialize: bool,
    pub timeout_minutes: u32,
}

impl SessionRecord {
    /// Hash fields for this record.
    #[must_use]
    pub fn to_fields(&self) -> HashMap<String, Bytes> {
        let timeout = i32::try_from(self.timeout_minutes).unwrap_or(i32::MAX);
        HashMap::from([
            (DATA_FIELD.to_string(), self.data.clone()),
            (
                INITIALIZE_FIELD.to_string(),
                Bytes::copy_from_slice(&[u8::from(self.initialize)]),
            ),
            (
                TIMEOUT_FIELD.to_string(),
                Bytes::copy_from_slice(&timeout.to_le_bytes()),
            ),
        ])
    }

    /// Rebuild a record from its hash. An empty hash is a missing record.
    ///
    /// Missing or unusable fields take defaults: empty data, not fresh,
    /// and `default_timeout` minutes.
    #[must_use]
    pub fn from_fields(fields: &HashMap<String, Bytes>, default_timeout: u32) -> Option<Self> {
        if fields.is_empty() {
            return None;
        }
        let data = fields.get(DATA_FIELD).cloned().unwrap_or_default();
        let initialize = fields
            .get(INITIALIZE_FIELD)
            .and_then(|b| b.first())
            .is_some_and(|b| *b == 1);
        let timeout_minutes = fields
            .get(TIMEOUT_FIELD)
            .and_then(|raw| parse_timeout(raw))
            .unwrap_or(default_timeout);
        Some(Self {
            data,
            initialize,
            timeout_minutes,
        })
    }
}

fn parse_timeout(raw: &[u8]) -> Option<u32> {
    let mut buf = raw;
    if buf.remaining() < 4 {
        return None;
    }
    u32::try_from(buf.get_i32_le()).ok().filter(|m| *m > 0)
}

/// Reads and writes session records for one store name.
#[derive(Clone)]
pub struct SessionRecordStore {
    client: Arc<dyn KeyValueClient>,
    name: Arc<str>,
    default_timeout: u32,
}

impl SessionRecordStore {
    #[must_use]
    pub fn new(
        client: Arc<dyn KeyValueClient>,
        name: impl Into<Arc<str>>,
        default_timeout: u32,
    ) -> Self {
        Self {
            client,
            name: name.into(),
            default_timeout,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn default_timeout(&self) -> u32 {
        self.default_timeout
    }

    pub(crate) fn client(&self) -> &dyn KeyValueClient {
        self.client.as_ref()
    }

    /// Store key for a session id: `{name}:{session_id}`.
    ///
    /// Ids are used verbatim, so `abc` and `{name}:abc` are different
    /// sessions, matching their separate lock table fields.
    ///
    /// # Errors
    /// Returns error for the id whose key would be the lock table.
    pub fn key(&self, session_id: &str) -> Result<String, SessionError> {
        if session_id == LOCK_TABLE_SUFFIX {
            return Err(SessionError::InvalidSessionId(session_id.to_string()));
        }
        Ok(format!("{}:{session_id}", self.name))
    }

    /// Parse a hash read from the store.
    #[must_use]
    pub fn parse(&self, fields: &HashMap<String, Bytes>) -> Option<SessionRecord> {
        SessionRecord::from_fields(fields, self.default_timeout)
    }

    /// TTL in seconds for a timeout in minutes; zero means the default.
    #[must_use]
    pub fn expiry_seconds(&self, timeout_minutes: u32) -> u64 {
        let minutes = if timeout_minutes == 0 {
            self.default_timeout
        } else {
            timeout_minutes
        };
        u64::from(minutes) * 60
    }

    /// Read a record, renewing its TTL on a hit.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn read(&self, session_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let key = self.key(session_id)?;
        let fields = self.client.hash_get_all(&key).await?;
        let Some(record) = self.parse(&fields) else {
            tracing::trace!(%key, "session miss");
            return Ok(None);
        };
        self.client
            .expire(&key, self.expiry_seconds(record.timeout_minutes))
            .await?;
        Ok(Some(record))
    }

    /// Write a record and set its TTL in one transaction.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn write(&self, session_id: &str, record: &SessionRecord) -> Result<(), SessionError> {
        let tx = self.write_into(Transaction::new(), session_id, record)?;
        match self.client.execute(tx).await? {
            TransactionOutcome::Committed(_) => Ok(()),
            TransactionOutcome::Aborted => Err(StoreError::Internal(
                "unconditional session write was aborted".into(),
            )
            .into()),
        }
    }

    /// Append the commands that write `record` to `tx`.
    ///
    /// # Errors
    /// Returns error if `session_id` is not usable as a key.
    pub fn write_into(
        &self,
        tx: Transaction,
        session_id: &str,
        record: &SessionRecord,
    ) -> Result<Transaction, SessionError> {
        let key = self.key(session_id)?;
        let seconds = self.expiry_seconds(record.timeout_minutes);
        Ok(tx
            .hash_set(key.clone(), record.to_fields(), false)
            .expire(key, seconds))
    }

    /// Remove a record. Returns whether it existed.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn delete(&self, session_id: &str) -> Result<bool, SessionError> {
        let key = self.key(session_id)?;
        Ok(self.client.delete(&[key.as_str()]).await? > 0)
    }

    /// Reset a record's TTL to `timeout_minutes`. Returns whether it exists.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn renew(&self, session_id: &str, timeout_minutes: u32) -> Result<bool, SessionError> {
        let key = self.key(session_id)?;
        Ok(self
            .client
            .expire(&key, self.expiry_seconds(timeout_minutes))
            .await?)
    }

    /// Reset a record's TTL using the timeout stored with it.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn renew_stored(&self, session_id: &str) -> Result<bool, SessionError> {
        let key = self.key(session_id)?;
        let Some(raw) = self.client.hash_get(&key, TIMEOUT_FIELD).await? else {
            return Ok(false);
        };
        let minutes = parse_timeout(&raw).unwrap_or(self.default_timeout);
        self.renew(session_id, minutes).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryBackend;

    fn store() -> SessionRecordStore {
        SessionRecordStore::new(Arc::new(MemoryBackend::new().connect()), "Shop", 20)
    }

    fn record(data: &'static [u8], timeout_minutes: u32) -> SessionRecord {
        SessionRecord {
            data: Bytes::from_static(data),
            initialize: false,
            timeout_minutes,
        }
    }

    #[test]
    fn test_fields_layout() {
        let fields = SessionRecord {
            data: Bytes::from_static(b"cart"),
            initialize: true,
            timeout_minutes: 5,
        }
        .to_fields();
        assert_eq!(fields[DATA_FIELD], Bytes::from_static(b"cart"));
        assert_eq!(fields[INITIALIZE_FIELD], Bytes::from_static(&[1]));
        assert_eq!(fields[TIMEOUT_FIELD], Bytes::from_static(&[5, 0, 0, 0]));
    }

    #[test]
    fn test_from_fields_defaults() {
        assert_eq!(SessionRecord::from_fields(&HashMap::new(), 20), None);

        let partial = HashMap::from([(DATA_FIELD.to_string(), Bytes::from_static(b"x"))]);
        let rec = SessionRecord::from_fields(&partial, 20).unwrap();
        assert_eq!(rec.data, Bytes::from_static(b"x"));
        assert!(!rec.initialize);
        assert_eq!(rec.timeout_minutes, 20);

        let negative = HashMap::from([(
            TIMEOUT_FIELD.to_string(),
            Bytes::copy_from_slice(&(-3_i32).to_le_bytes()),
        )]);
        assert_eq!(SessionRecord::from_fields(&negative, 7).unwrap().timeout_minutes, 7);
    }

    #[test]
    fn test_key_is_plain_concatenation() {
        let s = store();
        assert_eq!(s.key("abc").unwrap(), "Shop:abc");
        assert_eq!(s.key("Shop:abc").unwrap(), "Shop:Shop:abc");
    }

    #[tokio::test]
    async fn test_lock_table_id_rejected() {
        let s = store();
        assert!(matches!(
            s.key(LOCK_TABLE_SUFFIX),
            Err(SessionError::InvalidSessionId(id)) if id == "LockedSessions"
        ));
        assert!(matches!(
            s.write(LOCK_TABLE_SUFFIX, &record(b"p", 5)).await,
            Err(SessionError::InvalidSessionId(_))
        ));
        assert!(matches!(
            s.read(LOCK_TABLE_SUFFIX).await,
            Err(SessionError::InvalidSessionId(_))
        ));
    }

    #[tokio::test]
    async fn test_prefixed_id_is_separate_record() {
        let s = store();
        s.write("abc", &record(b"plain", 5)).await.unwrap();
        s.write("Shop:abc", &record(b"prefixed", 5)).await.unwrap();
        assert_eq!(s.read("abc").await.unwrap().unwrap().data, Bytes::from_static(b"plain"));
        assert_eq!(
            s.read("Shop:abc").await.unwrap().unwrap().data,
            Bytes::from_static(b"prefixed")
        );
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let s = store();
        s.write("abc", &record(b"payload", 5)).await.unwrap();
        assert_eq!(s.read("abc").await.unwrap(), Some(record(b"payload", 5)));
        assert_eq!(s.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_slides_expiration() {
        let s = store();
        s.write("abc", &record(b"payload", 5)).await.unwrap();
        s.client().expire("Shop:abc", 10).await.unwrap();

        s.read("abc").await.unwrap().unwrap();

        let ttl = s.client().ttl("Shop:abc").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(299), "ttl was {ttl:?}");
        assert!(ttl <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_renew_stored_uses_record_timeout() {
        let s = store();
        s.write("abc", &record(b"p", 2)).await.unwrap();
        s.client().expire("Shop:abc", 10).await.unwrap();

        assert!(s.renew_stored("abc").await.unwrap());
        let ttl = s.client().ttl("Shop:abc").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(119));
        assert!(!s.renew_stored("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let s = store();
        s.write("abc", &record(b"p", 5)).await.unwrap();
        assert!(s.delete("abc").await.unwrap());
        assert!(!s.delete("abc").await.unwrap());
        assert_eq!(s.read("abc").await.unwrap(), None);
    }
}

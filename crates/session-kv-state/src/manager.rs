//! Session state store for request hosts.

use std::sync::Arc;

use bytes::Bytes;
use session_kv_core::{KeyValueClient, StoreConfig};

use crate::{
    error::SessionError,
    lock::{Acquisition, LockCoordinator, LockId, WriteOutcome},
    pool::ConnectionPool,
    record::{SessionRecord, SessionRecordStore},
};

/// What the host must do with a session it just read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    None,
    /// The record was created empty and still needs initializing.
    InitializeItem,
}

/// A session as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    pub payload: Bytes,
    pub timeout_minutes: u32,
    pub action: SessionAction,
}

impl From<SessionRecord> for SessionData {
    fn from(record: SessionRecord) -> Self {
        Self {
            payload: record.data,
            timeout_minutes: record.timeout_minutes,
            action: if record.initialize {
                SessionAction::InitializeItem
            } else {
                SessionAction::None
            },
        }
    }
}

/// Result of [`SessionStateStore::read_exclusive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusiveRead {
    /// The caller holds the lock. `data` is `None` for an unknown session.
    Acquired {
        lock_id: LockId,
        data: Option<SessionData>,
    },
    /// Another caller holds the lock.
    Locked {
        lock_id: LockId,
        age: std::time::Duration,
    },
}

/// Session state store for one store name.
#[derive(Clone)]
pub struct SessionStateStore {
    records: SessionRecordStore,
    locks: LockCoordinator,
}

impl SessionStateStore {
    /// Create a store over `client`.
    #[must_use]
    pub fn new(client: Arc<dyn KeyValueClient>, config: &StoreConfig) -> Self {
        let records = SessionRecordStore::new(
            client,
            config.name.as_str(),
            config.default_timeout_minutes,
        );
        let locks = LockCoordinator::new(records.clone(), config.lock_lease());
        Self { records, locks }
    }

    /// Create a store over a pool's shared connection.
    #[must_use]
    pub fn from_pool(pool: &ConnectionPool) -> Self {
        Self::new(pool.client(), pool.config())
    }

    #[must_use]
    pub const fn records(&self) -> &SessionRecordStore {
        &self.records
    }

    #[must_use]
    pub const fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Create an empty record the host still has to initialize.
    ///
    /// # Errors
    /// Returns error if the store call fails.
    pub async fn create_uninitialized(
        &self,
        session_id: &str,
        timeout_minutes: u32,
    ) -> Result<(), SessionError> {
        let record = SessionRecord {
            data: Bytes::new(),
            initialize: true,
            timeout_minutes,
        };
        self.records.write(session_id, &record).await?;
        tracing::debug!(session_id, timeout_minutes, "created uninitialized session");
        Ok(())
    }

    /// Read without locking. Renews the session's TTL on a hit.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn read(&self, session_id: &str) -> Result<Option<SessionData>, SessionError> {
        Ok(self.records.read(session_id).await?.map(SessionData::from))
    }

    /// Lock a session and read it.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn read_exclusive(&self, session_id: &str) -> Result<ExclusiveRead, SessionError> {
        match self.locks.try_acquire(session_id).await? {
            Acquisition::Acquired { lock_id, snapshot } => {
                if let Some(record) = &snapshot {
                    self.records
                        .renew(session_id, record.timeout_minutes)
                        .await?;
                }
                Ok(ExclusiveRead::Acquired {
                    lock_id,
                    data: snapshot.map(SessionData::from),
                })
            }
            Acquisition::Locked { lock_id, age } => Ok(ExclusiveRead::Locked { lock_id, age }),
        }
    }

    /// Store the session and release the caller's lock.
    ///
    /// `lock_id` is `None` when the caller never locked the session.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn write_and_release(
        &self,
        session_id: &str,
        lock_id: Option<LockId>,
        payload: Bytes,
        timeout_minutes: u32,
    ) -> Result<WriteOutcome, SessionError> {
        let record = SessionRecord {
            data: payload,
            initialize: false,
            timeout_minutes,
        };
        self.locks
            .write_and_release(session_id, lock_id, &record)
            .await
    }

    /// Release the caller's lock without writing.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn release(&self, session_id: &str, lock_id: LockId) -> Result<bool, SessionError> {
        self.locks.release_if_held(session_id, lock_id).await
    }

    /// Delete a session the caller holds the lock for.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn remove(&self, session_id: &str, lock_id: LockId) -> Result<bool, SessionError> {
        self.locks.remove(session_id, lock_id).await
    }

    /// Restart a session's sliding expiration from its stored timeout.
    ///
    /// # Errors
    /// Returns error if a store call fails.
    pub async fn reset_timeout(&self, session_id: &str) -> Result<bool, SessionError> {
        self.records.renew_stored(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::storage::MemoryBackend;

    fn store() -> SessionStateStore {
        let client = Arc::new(MemoryBackend::new().connect());
        SessionStateStore::new(client, &StoreConfig::default().with_name("Web"))
    }

    #[tokio::test]
    async fn test_uninitialized_session_needs_init() {
        let s = store();
        s.create_uninitialized("abc", 5).await.unwrap();

        let data = s.read("abc").await.unwrap().unwrap();
        assert_eq!(data.action, SessionAction::InitializeItem);
        assert!(data.payload.is_empty());
        assert_eq!(data.timeout_minutes, 5);
    }

    #[tokio::test]
    async fn test_read_unknown_is_none() {
        assert_eq!(store().read("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_exclusive_round_trip() {
        let s = store();
        let ExclusiveRead::Acquired { lock_id, data } = s.read_exclusive("abc").await.unwrap()
        else {
            panic!("expected to acquire");
        };
        assert_eq!(data, None);

        let outcome = s
            .write_and_release("abc", Some(lock_id), Bytes::from_static(b"cart=3"), 20)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::WrittenAndReleased);

        let ExclusiveRead::Acquired { data, .. } = s.read_exclusive("abc").await.unwrap() else {
            panic!("lock should have been released");
        };
        let data = data.unwrap();
        assert_eq!(data.payload, Bytes::from_static(b"cart=3"));
        assert_eq!(data.action, SessionAction::None);
    }

    #[tokio::test]
    async fn test_exclusive_read_renews_ttl() {
        let s = store();
        s.write_and_release("abc", None, Bytes::from_static(b"x"), 5)
            .await
            .unwrap();
        let key = s.records().key("abc").unwrap();
        s.records().client().expire(&key, 10).await.unwrap();

        s.read_exclusive("abc").await.unwrap();

        let ttl = s.records().client().ttl(&key).await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(299));
    }

    #[tokio::test]
    async fn test_release_then_remove() {
        let s = store();
        s.write_and_release("abc", None, Bytes::from_static(b"x"), 5)
            .await
            .unwrap();

        let ExclusiveRead::Acquired { lock_id, .. } = s.read_exclusive("abc").await.unwrap() else {
            panic!("expected to acquire");
        };
        assert!(s.release("abc", lock_id).await.unwrap());
        assert!(!s.remove("abc", lock_id).await.unwrap());

        let ExclusiveRead::Acquired { lock_id, .. } = s.read_exclusive("abc").await.unwrap() else {
            panic!("expected to acquire");
        };
        assert!(s.remove("abc", lock_id).await.unwrap());
        assert_eq!(s.read("abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reset_timeout() {
        let s = store();
        assert!(!s.reset_timeout("abc").await.unwrap());
        s.create_uninitialized("abc", 1).await.unwrap();
        assert!(s.reset_timeout("abc").await.unwrap());
    }
}
